use std::collections::{BTreeMap, VecDeque};
use std::process::Command;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use crate::buildlog::{BuildLog, sanitize_line};
use crate::config::ConfigDoc;
use crate::error::{Error, Result};
use crate::planner::Plan;
use crate::settings::RunState;
use crate::workspace::{CleanMode, WorkspaceConfig, WorkspacePaths};

pub mod runner;

pub use runner::{
    CmdOutput, CommandRecord, CommandRunner, Downloader, HttpDownloader, ProcessRunner,
    RecordingRunner, StagedDownloader,
};

pub type TaskExecFn = fn(&ConfigDoc, &mut ExecCtx) -> Result<()>;

/// Facts discovered during a run, for later steps and downstream CI jobs.
pub const RUN_STATE_FILE: &str = "run-state.json";

#[derive(Default)]
struct SharedExecState {
    workspace_paths: Mutex<Option<WorkspacePaths>>,
    // Values discovered by earlier steps (kernel version, toolchain, image) for later ones.
    run_state: Mutex<RunState>,
}

#[derive(Debug, Clone)]
pub enum ExecEvent {
    TaskStarted {
        id: String,
        label: String,
    },
    TaskLog {
        id: String,
        line: String,
    },
    TaskWarning {
        id: String,
        message: String,
    },
    TaskFinished {
        id: String,
        ok: bool,
        error: Option<String>,
        elapsed_ms: u128,
    },
    ExecutorDone {
        ok: bool,
        error: Option<String>,
    },
}

pub trait ExecSink: Send + Sync {
    fn emit(&self, ev: ExecEvent);
}

/// Console sink. Inside GitHub Actions each task becomes a collapsible log group
/// and warnings become workflow annotations.
#[derive(Default)]
pub struct StdoutSink {
    github_actions: bool,
    state: Mutex<StdoutSinkState>,
}

#[derive(Default)]
struct StdoutSinkState {
    started_at: Option<Instant>,
    tasks_started: usize,
    tasks_ok: usize,
    tasks_failed: usize,
    warnings: usize,
    log_lines: usize,
    failed_tasks: Vec<String>,
    tail: BTreeMap<String, VecDeque<String>>,
}

const FAILURE_TAIL_LINES: usize = 40;

impl StdoutSink {
    pub fn new(github_actions: bool) -> Self {
        Self {
            github_actions,
            state: Mutex::new(StdoutSinkState::default()),
        }
    }

    pub fn from_env() -> Self {
        Self::new(std::env::var("GITHUB_ACTIONS").is_ok_and(|v| v == "true"))
    }
}

impl ExecSink for StdoutSink {
    fn emit(&self, ev: ExecEvent) {
        match ev {
            ExecEvent::TaskStarted { id, label } => {
                if let Ok(mut s) = self.state.lock() {
                    s.tasks_started += 1;
                    s.started_at.get_or_insert_with(Instant::now);
                }
                if self.github_actions {
                    println!("::group::{label} ({id})");
                } else {
                    println!("RUN: {id} ({label})");
                }
            }
            ExecEvent::TaskLog { id, line } => {
                if let Ok(mut s) = self.state.lock() {
                    s.log_lines += 1;
                    let q = s.tail.entry(id.clone()).or_default();
                    if q.len() >= FAILURE_TAIL_LINES {
                        q.pop_front();
                    }
                    q.push_back(line.clone());
                }
                println!("[{id}] {line}");
            }
            ExecEvent::TaskWarning { id, message } => {
                if let Ok(mut s) = self.state.lock() {
                    s.warnings += 1;
                }
                if self.github_actions {
                    println!("::warning title={id}::{message}");
                } else {
                    println!("WARN: [{id}] {message}");
                }
            }
            ExecEvent::TaskFinished {
                id,
                ok,
                error,
                elapsed_ms,
            } => {
                let mut tail = VecDeque::new();
                if let Ok(mut s) = self.state.lock() {
                    if ok {
                        s.tasks_ok += 1;
                    } else {
                        s.tasks_failed += 1;
                        s.failed_tasks.push(id.clone());
                    }
                    tail = s.tail.remove(&id).unwrap_or_default();
                }
                if self.github_actions {
                    println!("::endgroup::");
                }
                if ok {
                    println!("DONE: {id} ({elapsed_ms}ms)");
                } else {
                    let err = error.unwrap_or_default();
                    if self.github_actions {
                        println!("::error title={id}::{err}");
                    }
                    println!("FAIL: {id} ({elapsed_ms}ms) {err}");
                    if !tail.is_empty() {
                        println!("last {} lines of {id}:", tail.len());
                        for l in tail {
                            println!("  {l}");
                        }
                    }
                }
            }
            ExecEvent::ExecutorDone { ok, error } => {
                let Ok(mut s) = self.state.lock() else {
                    return;
                };
                let wall = s.started_at.map(|t| t.elapsed()).unwrap_or_default();
                println!("SUMMARY:");
                println!("  status: {}", if ok { "ok" } else { "failed" });
                println!(
                    "  tasks: started={} ok={} failed={} warnings={}",
                    s.tasks_started, s.tasks_ok, s.tasks_failed, s.warnings
                );
                println!("  logs: {}", s.log_lines);
                println!("  elapsed: {}", format_elapsed_hms(wall.as_secs()));
                if !s.failed_tasks.is_empty() {
                    println!("  failed_tasks: {}", s.failed_tasks.join(", "));
                }
                if let Some(e) = error {
                    println!("  error: {e}");
                }
                *s = StdoutSinkState::default();
            }
        }
    }
}

/// Keeps every event in memory. Handy for tests and for embedding the pipeline.
#[derive(Default)]
pub struct MemorySink {
    events: Mutex<Vec<ExecEvent>>,
}

impl MemorySink {
    pub fn events(&self) -> Vec<ExecEvent> {
        self.events.lock().map(|g| g.clone()).unwrap_or_default()
    }

    pub fn warnings(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                ExecEvent::TaskWarning { message, .. } => Some(message),
                _ => None,
            })
            .collect()
    }

    pub fn log_lines(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                ExecEvent::TaskLog { line, .. } => Some(line),
                _ => None,
            })
            .collect()
    }
}

impl ExecSink for MemorySink {
    fn emit(&self, ev: ExecEvent) {
        if let Ok(mut g) = self.events.lock() {
            g.push(ev);
        }
    }
}

#[derive(Clone)]
pub struct ExecCtx {
    pub dry_run: bool,
    pub sink: Arc<dyn ExecSink>,
    pub runner: Arc<dyn CommandRunner>,
    pub downloader: Arc<dyn Downloader>,
    pub current_task_id: Option<String>,
    shared: Arc<SharedExecState>,
}

impl ExecCtx {
    pub fn new(dry_run: bool, sink: Arc<dyn ExecSink>) -> Self {
        Self {
            dry_run,
            sink,
            runner: Arc::new(ProcessRunner),
            downloader: Arc::new(HttpDownloader),
            current_task_id: None,
            shared: Arc::new(SharedExecState::default()),
        }
    }

    pub fn with_runner(mut self, runner: Arc<dyn CommandRunner>) -> Self {
        self.runner = runner;
        self
    }

    pub fn with_downloader(mut self, downloader: Arc<dyn Downloader>) -> Self {
        self.downloader = downloader;
        self
    }

    pub fn set_task(&mut self, id: impl Into<String>) {
        self.current_task_id = Some(id.into());
    }

    fn task_id(&self) -> String {
        self.current_task_id
            .clone()
            .unwrap_or_else(|| "<none>".into())
    }

    pub fn log(&self, msg: &str) {
        self.sink.emit(ExecEvent::TaskLog {
            id: self.task_id(),
            line: msg.to_string(),
        });
    }

    /// Non-fatal problem: reported to the sink and to tracing, never aborts the run.
    pub fn warn(&self, msg: &str) {
        tracing::warn!(task = %self.task_id(), "{msg}");
        self.sink.emit(ExecEvent::TaskWarning {
            id: self.task_id(),
            message: msg.to_string(),
        });
    }

    pub fn set_workspace_paths(&self, paths: WorkspacePaths) {
        if let Ok(mut g) = self.shared.workspace_paths.lock() {
            *g = Some(paths);
        }
    }

    pub fn workspace_paths(&self) -> Option<WorkspacePaths> {
        self.shared
            .workspace_paths
            .lock()
            .ok()
            .and_then(|g| g.clone())
    }

    // Cleaning only ever happens in core.init; later callers just need the paths.
    pub fn workspace_paths_or_init(&self, doc: &ConfigDoc) -> Result<WorkspacePaths> {
        if let Some(p) = self.workspace_paths() {
            return Ok(p);
        }
        let mut ws: WorkspaceConfig = doc.deserialize_path("workspace")?.unwrap_or_default();
        ws.clean = CleanMode::None;
        let paths = crate::workspace::init_dirs(&ws)?;
        self.set_workspace_paths(paths.clone());
        Ok(paths)
    }

    pub fn state(&self) -> RunState {
        self.shared
            .run_state
            .lock()
            .map(|g| g.clone())
            .unwrap_or_default()
    }

    /// Mutate the run state and mirror it to `<out_dir>/run-state.json`.
    pub fn update_state(&self, f: impl FnOnce(&mut RunState)) {
        let snapshot = match self.shared.run_state.lock() {
            Ok(mut g) => {
                f(&mut g);
                g.clone()
            }
            Err(_) => return,
        };
        let Some(ws) = self.workspace_paths() else {
            return;
        };
        let path = ws.out_dir.join(RUN_STATE_FILE);
        let res = serde_json::to_vec_pretty(&snapshot)
            .map_err(Error::from)
            .and_then(|b| std::fs::write(&path, b).map_err(Error::from));
        if let Err(e) = res {
            tracing::warn!(path = %path.display(), error = %e, "failed to write run state");
        }
    }

    /// Run to completion, streaming sanitized output into the task log.
    pub fn run_cmd(&self, cmd: Command) -> Result<()> {
        if self.dry_run {
            self.log(&format!("DRY-RUN: {:?}", cmd));
            return Ok(());
        }
        tracing::debug!(command = ?cmd, "spawning");
        self.runner.run(cmd, &mut |line: &str| {
            let line = sanitize_line(line);
            if !line.is_empty() {
                self.log(&line);
            }
        })
    }

    /// Like [`run_cmd`](Self::run_cmd) but also appends every line to `log`.
    ///
    /// A failing write to the log does not stop the process; the first such error is
    /// returned once the command has finished successfully.
    pub fn run_cmd_logged(&self, cmd: Command, log: &mut BuildLog) -> Result<()> {
        if self.dry_run {
            self.log(&format!("DRY-RUN: {:?}", cmd));
            return Ok(());
        }
        tracing::debug!(command = ?cmd, log = %log.path().display(), "spawning");
        let mut write_err: Option<Error> = None;
        let res = self.runner.run(cmd, &mut |line: &str| {
            let line = sanitize_line(line);
            if line.is_empty() {
                return;
            }
            if let Err(e) = log.write_line(&line)
                && write_err.is_none()
            {
                write_err = Some(e);
            }
            self.log(&line);
        });
        res?;
        match write_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Convert a command failure into `false`, logging why.
    pub fn try_run_cmd(&self, cmd: Command) -> bool {
        match self.run_cmd(cmd) {
            Ok(()) => true,
            Err(e) => {
                self.log(&format!("command failed: {e}"));
                false
            }
        }
    }

    /// Fetch `url` into `dest`; a dry run only logs the request.
    pub fn download(&self, url: &reqwest::Url, dest: &std::path::Path) -> Result<u64> {
        if self.dry_run {
            self.log(&format!("DRY-RUN: download {url} -> {}", dest.display()));
            return Ok(0);
        }
        tracing::debug!(url = %url, dest = %dest.display(), "downloading");
        self.downloader.download(url, dest)
    }

    pub fn cmd_output(&self, cmd: Command) -> Result<CmdOutput> {
        tracing::debug!(command = ?cmd, "capturing output");
        self.runner.output(cmd)
    }
}

#[derive(Default)]
pub struct TaskRegistry {
    exec: BTreeMap<&'static str, TaskExecFn>,
}

impl TaskRegistry {
    pub fn add(&mut self, id: &'static str, f: TaskExecFn) -> Result<()> {
        if self.exec.contains_key(id) {
            return Err(Error::msg(format!("duplicate task executor for '{id}'")));
        }
        self.exec.insert(id, f);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<TaskExecFn> {
        self.exec.get(id).copied()
    }
}

pub trait ModuleExec {
    fn register_tasks(reg: &mut TaskRegistry) -> Result<()>;
}

/// Run every task in plan order, one at a time, stopping at the first failure.
pub fn execute_plan(
    doc: &ConfigDoc,
    plan: &Plan,
    reg: &TaskRegistry,
    ctx: &mut ExecCtx,
) -> Result<()> {
    for task in plan.ordered()? {
        let Some(exec) = reg.get(&task.id) else {
            return Err(Error::msg(format!(
                "no executor registered for task '{}'",
                task.id
            )));
        };
        ctx.sink.emit(ExecEvent::TaskStarted {
            id: task.id.clone(),
            label: task.label.clone(),
        });
        ctx.set_task(task.id.clone());
        tracing::info!(task = %task.id, phase = %task.phase, "task started");

        let start = Instant::now();
        let res = if ctx.dry_run {
            ctx.log(&format!("DRY-RUN: {} ({}/{})", task.id, task.module, task.phase));
            Ok(())
        } else {
            exec(doc, ctx)
        };
        let elapsed_ms = start.elapsed().as_millis();

        match res {
            Ok(()) => ctx.sink.emit(ExecEvent::TaskFinished {
                id: task.id.clone(),
                ok: true,
                error: None,
                elapsed_ms,
            }),
            Err(e) => {
                tracing::error!(task = %task.id, error = %e, "task failed");
                ctx.sink.emit(ExecEvent::TaskFinished {
                    id: task.id.clone(),
                    ok: false,
                    error: Some(e.to_string()),
                    elapsed_ms,
                });
                let msg = format!("task '{}' failed: {e}", task.id);
                ctx.sink.emit(ExecEvent::ExecutorDone {
                    ok: false,
                    error: Some(msg.clone()),
                });
                return Err(Error::new(e.kind(), msg));
            }
        }
    }
    ctx.sink.emit(ExecEvent::ExecutorDone {
        ok: true,
        error: None,
    });
    Ok(())
}

pub fn builtin_registry() -> Result<TaskRegistry> {
    use crate::modules;

    let mut reg = TaskRegistry::default();
    reg.add("core.init", core_init)?;
    reg.add(crate::planner::PATCH_BARRIER_ID, core_barrier_patch)?;
    modules::kernel::KernelModule::register_tasks(&mut reg)?;
    modules::toolchain::ToolchainModule::register_tasks(&mut reg)?;
    modules::patch::PatchModule::register_tasks(&mut reg)?;
    modules::ccache::CcacheModule::register_tasks(&mut reg)?;
    modules::build::BuildModule::register_tasks(&mut reg)?;
    modules::package::PackageModule::register_tasks(&mut reg)?;
    modules::publish::PublishModule::register_tasks(&mut reg)?;
    Ok(reg)
}

fn core_init(doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()> {
    let ws: WorkspaceConfig = doc.deserialize_path("workspace")?.unwrap_or_default();
    ctx.log(&format!("workspace.root_dir = {}", ws.root_dir));
    ctx.log(&format!("workspace.build_dir = {}", ws.build_dir));
    ctx.log(&format!("workspace.out_dir = {}", ws.out_dir));
    ctx.log(&format!("workspace.clean = {}", ws.clean.as_str()));

    let paths = crate::workspace::init_dirs(&ws)?;
    ctx.log(&format!("workspace.root = {}", paths.root.display()));
    ctx.log(&format!("workspace.build_dir(abs) = {}", paths.build_dir.display()));
    ctx.log(&format!("workspace.out_dir(abs) = {}", paths.out_dir.display()));

    // A sentinel left over from a previous run must not fail this one.
    let sentinel = paths.out_dir.join(crate::analyzer::SENTINEL_FILE);
    if sentinel.exists() {
        std::fs::remove_file(&sentinel).map_err(|e| {
            Error::msg(format!("failed to remove stale {}: {e}", sentinel.display()))
        })?;
    }
    ctx.set_workspace_paths(paths);
    Ok(())
}

fn core_barrier_patch(_doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()> {
    ctx.log("all feature patches applied");
    Ok(())
}

fn format_elapsed_hms(total_secs: u64) -> String {
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let seconds = total_secs % 60;
    format!("{hours:02}:{minutes:02}:{seconds:02}")
}
