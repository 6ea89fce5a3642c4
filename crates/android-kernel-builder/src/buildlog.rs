//! Build output hygiene: strip terminal escapes from tool output and tee it to a log file.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;

use crate::error::{Error, Result};

const MAX_LINE_CHARS: usize = 4096;

// CSI, OSC (BEL or ST terminated), DCS/SOS/PM/APC strings, and lone two-byte escapes.
static ESCAPE_RE: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(
        r"\x1b\[[0-?]*[ -/]*[@-~]|\x1b\][^\x07\x1b]*(?:\x07|\x1b\\)|\x1b[PX^_][^\x1b]*\x1b\\|\x1b[@-Z\\-_]",
    )
    .ok()
});

/// Make one line of compiler/make output safe to print and to pattern-match.
pub fn sanitize_line(input: &str) -> String {
    let stripped = match ESCAPE_RE.as_ref() {
        Some(re) => re.replace_all(input, ""),
        None => input.into(),
    };
    let mut out = String::with_capacity(stripped.len().min(MAX_LINE_CHARS));
    let mut count = 0usize;
    for c in stripped.chars() {
        if count >= MAX_LINE_CHARS {
            out.push_str(" ...[truncated]");
            break;
        }
        match c {
            '\t' => out.push(' '),
            '\r' | '\n' => continue,
            c if c.is_control() || is_bidi_control(c) => continue,
            c => out.push(c),
        }
        count += 1;
    }
    out
}

fn is_bidi_control(c: char) -> bool {
    matches!(c, '\u{061C}' | '\u{200E}' | '\u{200F}')
        || ('\u{202A}'..='\u{202E}').contains(&c)
        || ('\u{2066}'..='\u{2069}').contains(&c)
}

/// Line-buffered log file that receives sanitized tool output.
pub struct BuildLog {
    path: PathBuf,
    out: BufWriter<File>,
    lines: usize,
}

impl BuildLog {
    pub fn create(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                Error::msg(format!("failed to create log dir {}: {e}", parent.display()))
            })?;
        }
        let file = File::create(path)
            .map_err(|e| Error::msg(format!("failed to create log {}: {e}", path.display())))?;
        Ok(Self {
            path: path.to_path_buf(),
            out: BufWriter::new(file),
            lines: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn lines(&self) -> usize {
        self.lines
    }

    pub fn write_line(&mut self, line: &str) -> Result<()> {
        writeln!(self.out, "{line}")
            .map_err(|e| Error::msg(format!("failed to write {}: {e}", self.path.display())))?;
        self.lines += 1;
        Ok(())
    }

    pub fn finish(mut self) -> Result<PathBuf> {
        self.out
            .flush()
            .map_err(|e| Error::msg(format!("failed to flush {}: {e}", self.path.display())))?;
        Ok(self.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_gcc_color_codes() {
        let input = "\u{1b}[01m\u{1b}[Kdrivers/foo.c:12:3:\u{1b}[m\u{1b}[K \u{1b}[01;31m\u{1b}[Kerror: \u{1b}[m\u{1b}[Kboom";
        assert_eq!(sanitize_line(input), "drivers/foo.c:12:3: error: boom");
    }

    #[test]
    fn strips_osc_and_dcs_strings() {
        assert_eq!(sanitize_line("a\u{1b}]0;title\u{7}b"), "ab");
        assert_eq!(sanitize_line("a\u{1b}Ppayload\u{1b}\\b"), "ab");
    }

    #[test]
    fn flattens_tabs_and_drops_controls() {
        assert_eq!(sanitize_line("a\tb\r\u{202e}c\u{0}"), "a bc");
    }

    #[test]
    fn log_counts_written_lines() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let mut log = BuildLog::create(&tmp.path().join("logs/build.log")).expect("create");
        log.write_line("one").expect("write");
        log.write_line("two").expect("write");
        assert_eq!(log.lines(), 2);
        let path = log.finish().expect("finish");
        assert_eq!(fs::read_to_string(path).expect("read"), "one\ntwo\n");
    }
}
