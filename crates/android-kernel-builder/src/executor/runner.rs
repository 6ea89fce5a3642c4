use std::collections::{BTreeMap, VecDeque};
use std::fs;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::{Arc, Mutex, mpsc};

use reqwest::Url;

use crate::error::{Error, Result};

/// Captured result of a process run to completion.
#[derive(Debug, Clone, Default)]
pub struct CmdOutput {
    pub success: bool,
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

/// Seam between the pipeline and the operating system's process table.
///
/// `run` streams merged stdout/stderr lines to `on_line` and fails on a non-zero exit;
/// `output` captures everything and leaves exit-status handling to the caller.
pub trait CommandRunner: Send + Sync {
    fn run(&self, cmd: Command, on_line: &mut dyn FnMut(&str)) -> Result<()>;
    fn output(&self, cmd: Command) -> Result<CmdOutput>;
}

/// Seam between the pipeline and the network: fetch `url` into `dest`, returning
/// the number of bytes written.
pub trait Downloader: Send + Sync {
    fn download(&self, url: &Url, dest: &Path) -> Result<u64>;
}

#[derive(Debug, Default)]
pub struct HttpDownloader;

impl Downloader for HttpDownloader {
    fn download(&self, url: &Url, dest: &Path) -> Result<u64> {
        crate::modules::util::download_file(url, dest)
    }
}

#[derive(Debug, Default)]
pub struct ProcessRunner;

impl CommandRunner for ProcessRunner {
    fn run(&self, mut cmd: Command, on_line: &mut dyn FnMut(&str)) -> Result<()> {
        let program = cmd.get_program().to_string_lossy().into_owned();
        let mut child = cmd
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::command(format!("failed to spawn {program}: {e}")))?;

        let (tx, rx) = mpsc::channel::<String>();
        let mut readers = Vec::new();
        if let Some(out) = child.stdout.take() {
            let tx = tx.clone();
            readers.push(std::thread::spawn(move || read_output_stream(out, tx)));
        }
        if let Some(err) = child.stderr.take() {
            let tx = tx.clone();
            readers.push(std::thread::spawn(move || read_output_stream(err, tx)));
        }
        drop(tx);

        for line in rx {
            on_line(&line);
        }
        for r in readers {
            let _ = r.join();
        }

        let status = child
            .wait()
            .map_err(|e| Error::command(format!("wait for {program} failed: {e}")))?;
        if !status.success() {
            return Err(Error::command(format!("{program} failed: {status}")));
        }
        Ok(())
    }

    fn output(&self, mut cmd: Command) -> Result<CmdOutput> {
        let program = cmd.get_program().to_string_lossy().into_owned();
        let out = cmd
            .stdin(Stdio::null())
            .output()
            .map_err(|e| Error::command(format!("failed to spawn {program}: {e}")))?;
        Ok(CmdOutput {
            success: out.status.success(),
            code: out.status.code(),
            stdout: String::from_utf8_lossy(&out.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&out.stderr).into_owned(),
        })
    }
}

fn read_output_stream<R: Read>(reader: R, tx: mpsc::Sender<String>) {
    const MAX_PENDING_BYTES: usize = 16 * 1024;
    let mut r = BufReader::new(reader);
    let mut buf = [0u8; 8192];
    let mut pending = Vec::with_capacity(1024);

    loop {
        let n = match r.read(&mut buf) {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        for b in &buf[..n] {
            if *b == b'\n' || *b == b'\r' {
                if !pending.is_empty() {
                    let _ = tx.send(String::from_utf8_lossy(&pending).into_owned());
                    pending.clear();
                }
            } else {
                pending.push(*b);
                if pending.len() >= MAX_PENDING_BYTES {
                    let _ = tx.send(String::from_utf8_lossy(&pending).into_owned());
                    pending.clear();
                }
            }
        }
    }

    if !pending.is_empty() {
        let _ = tx.send(String::from_utf8_lossy(&pending).into_owned());
    }
}

/// One invocation seen by a [`RecordingRunner`].
#[derive(Debug, Clone)]
pub struct CommandRecord {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub envs: Vec<(String, String)>,
}

impl CommandRecord {
    fn from_command(cmd: &Command) -> Self {
        Self {
            program: cmd.get_program().to_string_lossy().into_owned(),
            args: cmd
                .get_args()
                .map(|a| a.to_string_lossy().into_owned())
                .collect(),
            cwd: cmd.get_current_dir().map(PathBuf::from),
            envs: cmd
                .get_envs()
                .filter_map(|(k, v)| {
                    Some((
                        k.to_string_lossy().into_owned(),
                        v?.to_string_lossy().into_owned(),
                    ))
                })
                .collect(),
        }
    }

    /// Program and arguments joined by spaces, for assertions.
    pub fn line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }

    pub fn env(&self, key: &str) -> Option<&str> {
        self.envs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// Scripted reply for a recorded command: output lines, or a failure message.
pub type Reply = std::result::Result<Vec<String>, String>;

type Handler = dyn Fn(&CommandRecord) -> Reply + Send + Sync;

/// Runner that never spawns anything; records invocations and replies via a handler.
#[derive(Clone)]
pub struct RecordingRunner {
    calls: Arc<Mutex<VecDeque<CommandRecord>>>,
    handler: Arc<Handler>,
}

impl Default for RecordingRunner {
    fn default() -> Self {
        Self::with_handler(|_| Ok(Vec::new()))
    }
}

impl RecordingRunner {
    pub fn with_handler<F>(handler: F) -> Self
    where
        F: Fn(&CommandRecord) -> Reply + Send + Sync + 'static,
    {
        Self {
            calls: Arc::new(Mutex::new(VecDeque::new())),
            handler: Arc::new(handler),
        }
    }

    pub fn calls(&self) -> Vec<CommandRecord> {
        self.calls
            .lock()
            .map(|g| g.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn lines(&self) -> Vec<String> {
        self.calls().iter().map(CommandRecord::line).collect()
    }

    fn record(&self, cmd: &Command) -> CommandRecord {
        let rec = CommandRecord::from_command(cmd);
        if let Ok(mut g) = self.calls.lock() {
            g.push_back(rec.clone());
        }
        rec
    }
}

impl CommandRunner for RecordingRunner {
    fn run(&self, cmd: Command, on_line: &mut dyn FnMut(&str)) -> Result<()> {
        let rec = self.record(&cmd);
        match (self.handler)(&rec) {
            Ok(lines) => {
                for l in &lines {
                    on_line(l);
                }
                Ok(())
            }
            Err(msg) => Err(Error::command(format!("{} failed: {msg}", rec.program))),
        }
    }

    fn output(&self, cmd: Command) -> Result<CmdOutput> {
        let rec = self.record(&cmd);
        Ok(match (self.handler)(&rec) {
            Ok(lines) => CmdOutput {
                success: true,
                code: Some(0),
                stdout: lines.join("\n"),
                stderr: String::new(),
            },
            Err(msg) => CmdOutput {
                success: false,
                code: Some(1),
                stdout: String::new(),
                stderr: msg,
            },
        })
    }
}

/// Downloader that serves pre-staged bodies by URL and records every request.
#[derive(Clone, Default)]
pub struct StagedDownloader {
    bodies: Arc<Mutex<BTreeMap<String, Vec<u8>>>>,
    requested: Arc<Mutex<Vec<String>>>,
}

impl StagedDownloader {
    pub fn stage(self, url: &str, body: impl Into<Vec<u8>>) -> Self {
        if let Ok(mut g) = self.bodies.lock() {
            g.insert(url.to_string(), body.into());
        }
        self
    }

    pub fn requested(&self) -> Vec<String> {
        self.requested.lock().map(|g| g.clone()).unwrap_or_default()
    }
}

impl Downloader for StagedDownloader {
    fn download(&self, url: &Url, dest: &Path) -> Result<u64> {
        if let Ok(mut g) = self.requested.lock() {
            g.push(url.to_string());
        }
        let body = self
            .bodies
            .lock()
            .ok()
            .and_then(|g| g.get(url.as_str()).cloned())
            .ok_or_else(|| Error::http(format!("download of {url} failed with status 404 Not Found")))?;
        if let Some(dir) = dest.parent() {
            fs::create_dir_all(dir)?;
        }
        fs::write(dest, &body)?;
        Ok(body.len() as u64)
    }
}
