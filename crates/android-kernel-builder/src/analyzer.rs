//! Build-log triage: map compiler/make failure lines to human-readable categories.

use std::fmt::Write as _;
use std::fs;
use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;

use crate::buildlog::sanitize_line;
use crate::error::{Error, ErrorKind, Result};

/// Created in the output dir when a build log contains at least one recognized error.
pub const SENTINEL_FILE: &str = "build-failed";

struct Rule {
    re: Regex,
    category: &'static str,
    hint: &'static str,
}

// Order matters: the first rule matching a line wins, so specific rules precede
// the generic ones they would otherwise be swallowed by.
const RULES: &[(&str, &str, &str)] = &[
    (
        r"fatal error: (.+: No such file or directory|'[^']+' file not found)",
        "Missing Header",
        "a header is missing; check the vendor merge and include paths",
    ),
    (
        r"(?i)/usr/bin/env: '?python2?'?: No such file|python2?: (command )?not found",
        "Missing Python",
        "a build script needs python; install it or point PYTHON at python3",
    ),
    (
        r"command not found|: not found$",
        "Missing Host Tool",
        "a host tool is not installed on the runner",
    ),
    (
        r"ld(\.lld)?: error: undefined symbol",
        "Undefined Symbol",
        "lld could not resolve a symbol; a config option is likely missing",
    ),
    (
        r"undefined reference to",
        "Link Error",
        "an object references a symbol that is not built; check config dependencies",
    ),
    (
        r"multiple definition of",
        "Duplicate Symbol",
        "the same symbol is defined twice; often -fno-common with old sources",
    ),
    (
        r"ERROR: modpost:",
        "Module Symbol Error",
        "modpost rejected a module; exported symbols do not match",
    ),
    (
        r"Section mismatch in reference",
        "Section Mismatch",
        "init/exit section misuse; mark the caller __init or drop the annotation",
    ),
    (
        r"error: implicit declaration of function",
        "Implicit Function Declaration",
        "a function is used without a prototype; a header or config is missing",
    ),
    (
        r"error: '[^']+' undeclared",
        "Undeclared Identifier",
        "an identifier is not declared; a patch may not match this kernel version",
    ),
    (
        r"error: unknown type name",
        "Unknown Type",
        "a type is not known; a header is missing or a patch targets another version",
    ),
    (
        r"error: invalid use of undefined type|error: dereferencing pointer to incomplete type",
        "Incomplete Type",
        "a struct is used before its definition is visible",
    ),
    (
        r"incompatible[- ]pointer[- ]types",
        "Incompatible Pointer Types",
        "pointer types disagree; newer compilers treat this as an error",
    ),
    (
        r"error: conflicting types for",
        "Conflicting Types",
        "a declaration disagrees with an earlier one",
    ),
    (
        r"error: redefinition of",
        "Redefinition",
        "something is defined twice; check duplicated patches",
    ),
    (
        r"error: too (few|many) arguments to function",
        "Argument Count Mismatch",
        "a call does not match the function signature of this kernel version",
    ),
    (
        r"division by zero|divide-by-zero",
        "Division by Zero",
        "a constant expression divides by zero; usually a config value is 0",
    ),
    (
        r"error: array subscript .* is (above|below) array bounds",
        "Array Bounds",
        "out-of-bounds access detected at compile time",
    ),
    (
        r"error: static assertion failed|BUILD_BUG_ON failed",
        "Static Assertion",
        "a compile-time assertion failed; a struct layout or config changed",
    ),
    (
        r"error: expected .+ before",
        "Syntax Error",
        "the parser hit an unexpected token; a patch probably applied incorrectly",
    ),
    (
        r"error: unused (variable|function)",
        "Unused Symbol (-Werror)",
        "warnings are errors; fix the code or drop -Werror",
    ),
    (
        r"\[-Werror(=[\w-]+)?\]",
        "Warning Treated as Error",
        "a warning is promoted to an error; fix it or disable CONFIG_CC_WERROR",
    ),
    (
        r"unrecognized command[- ]line option|unknown argument: '|clang: error: unsupported option",
        "Unsupported Compiler Flag",
        "the compiler does not accept a flag; the toolchain is too old or too new",
    ),
    (
        r"internal compiler error",
        "Internal Compiler Error",
        "the compiler crashed; retry or switch toolchain",
    ),
    (
        r"Segmentation fault",
        "Compiler Crash",
        "a tool crashed with SIGSEGV",
    ),
    (
        r"(?i)virtual memory exhausted|cannot allocate memory|Killed signal terminated program",
        "Out of Memory",
        "the runner ran out of memory; lower build.jobs",
    ),
    (
        r"No space left on device",
        "Disk Full",
        "the runner disk is full; clean the workspace or use a shallow clone",
    ),
    (
        r"Can't find default configuration",
        "Missing Defconfig",
        "make could not find the defconfig; check build.defconfig and build.arch",
    ),
    (
        r"Kconfig:\d+: syntax error|Kconfig:\d+: unknown statement",
        "Kconfig Syntax Error",
        "a Kconfig file is malformed; a feature patch probably broke it",
    ),
    (
        r"No rule to make target",
        "Missing Build Target",
        "a source or object listed in a Makefile does not exist",
    ),
    (
        r"(?i)\bdtc\b.*\bERROR\b|Error: .+\.dtsi?:\d+",
        "Device Tree Error",
        "a device tree source failed to compile",
    ),
    (
        r"Makefile:\d+: .*\*\*\*",
        "Makefile Error",
        "make stopped on an explicit error in a Makefile",
    ),
];

static COMPILED: LazyLock<std::result::Result<Vec<Rule>, String>> = LazyLock::new(|| {
    RULES
        .iter()
        .map(|(pattern, category, hint)| {
            Regex::new(pattern)
                .map(|re| Rule {
                    re,
                    category,
                    hint,
                })
                .map_err(|e| format!("rule '{category}': {e}"))
        })
        .collect()
});

fn rules() -> Result<&'static [Rule]> {
    COMPILED
        .as_deref()
        .map_err(|e| Error::msg(format!("invalid analyzer rule {e}")))
}

/// Number of rules in the table.
pub fn rule_count() -> usize {
    RULES.len()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Diagnostic {
    /// 1-based position among all diagnostics.
    pub index: usize,
    /// 1-based line number in the log.
    pub line_no: usize,
    pub category: &'static str,
    pub hint: &'static str,
    pub line: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Analysis {
    pub diagnostics: Vec<Diagnostic>,
    pub lines_scanned: usize,
}

impl Analysis {
    pub fn count(&self) -> usize {
        self.diagnostics.len()
    }

    pub fn has_errors(&self) -> bool {
        !self.diagnostics.is_empty()
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        if self.diagnostics.is_empty() {
            let _ = writeln!(out, "no known error patterns in {} lines", self.lines_scanned);
            return out;
        }
        let _ = writeln!(
            out,
            "{} error(s) found in {} lines:",
            self.count(),
            self.lines_scanned
        );
        for d in &self.diagnostics {
            let _ = writeln!(
                out,
                "{}. [{}] line {}: {}\n   hint: {}",
                d.index, d.category, d.line_no, d.line, d.hint
            );
        }
        out
    }
}

/// Classify one line, or `None` when no rule applies.
pub fn classify_line(line: &str) -> Result<Option<(&'static str, &'static str)>> {
    Ok(rules()?
        .iter()
        .find(|r| r.re.is_match(line))
        .map(|r| (r.category, r.hint)))
}

pub fn analyze_text(text: &str) -> Result<Analysis> {
    let rules = rules()?;
    let mut out = Analysis::default();
    for (i, raw) in text.lines().enumerate() {
        out.lines_scanned += 1;
        let line = sanitize_line(raw);
        let Some(rule) = rules.iter().find(|r| r.re.is_match(&line)) else {
            continue;
        };
        out.diagnostics.push(Diagnostic {
            index: out.diagnostics.len() + 1,
            line_no: i + 1,
            category: rule.category,
            hint: rule.hint,
            line: line.trim().to_string(),
        });
    }
    Ok(out)
}

/// Analyze a log file. A missing log is an error, not an empty analysis.
pub fn analyze_file(path: &Path) -> Result<Analysis> {
    if !path.is_file() {
        return Err(Error::new(
            ErrorKind::Io,
            format!("build log not found: {}", path.display()),
        ));
    }
    let bytes = fs::read(path)
        .map_err(|e| Error::msg(format!("failed to read build log {}: {e}", path.display())))?;
    analyze_text(&String::from_utf8_lossy(&bytes))
}

/// Analyze `log`, write the rendered report next to it, and create the sentinel on errors.
pub fn analyze_and_mark(log: &Path, report: &Path, sentinel: &Path) -> Result<Analysis> {
    let analysis = analyze_file(log)?;
    fs::write(report, analysis.render())
        .map_err(|e| Error::msg(format!("failed to write {}: {e}", report.display())))?;
    if analysis.has_errors() {
        fs::write(sentinel, format!("{}\n", analysis.count()))
            .map_err(|e| Error::msg(format!("failed to write {}: {e}", sentinel.display())))?;
    }
    Ok(analysis)
}

#[cfg(test)]
mod tests {
    use super::*;

    // One line per rule, in table order; each must hit its own rule first.
    const SAMPLES: &[(&str, &str)] = &[
        ("drivers/foo.c:3:10: fatal error: linux/bar.h: No such file or directory", "Missing Header"),
        ("/usr/bin/env: 'python': No such file or directory", "Missing Python"),
        ("scripts/gcc-wrapper.sh: line 4: lz4: command not found", "Missing Host Tool"),
        ("ld.lld: error: undefined symbol: ksu_handle_execve", "Undefined Symbol"),
        ("fs/exec.c:100: undefined reference to `ksu_handle_execveat'", "Link Error"),
        ("drivers/a.o: multiple definition of `yylloc'", "Duplicate Symbol"),
        ("ERROR: modpost: \"foo\" [drivers/bar.ko] undefined!", "Module Symbol Error"),
        ("WARNING: vmlinux.o(.text+0x10): Section mismatch in reference from the function a()", "Section Mismatch"),
        ("fs/open.c:20:2: error: implicit declaration of function 'ksu_handle_faccessat'", "Implicit Function Declaration"),
        ("kernel/sys.c:5:1: error: 'KSU_ENABLED' undeclared here", "Undeclared Identifier"),
        ("include/x.h:7:1: error: unknown type name 'u128'", "Unknown Type"),
        ("fs/a.c:9:5: error: invalid use of undefined type 'struct foo'", "Incomplete Type"),
        ("fs/a.c:9:5: warning: passing argument 1 from incompatible pointer type [-Wincompatible-pointer-types]", "Incompatible Pointer Types"),
        ("fs/a.c:9:5: error: conflicting types for 'bar'", "Conflicting Types"),
        ("fs/a.c:9:5: error: redefinition of 'baz'", "Redefinition"),
        ("fs/a.c:9:5: error: too few arguments to function 'qux'", "Argument Count Mismatch"),
        ("drivers/clk.c:44:12: warning: division by zero", "Division by Zero"),
        ("mm/a.c:3:4: error: array subscript 4 is above array bounds of 'int[4]'", "Array Bounds"),
        ("include/b.h:1:1: error: static assertion failed: \"size\"", "Static Assertion"),
        ("net/c.c:8:9: error: expected ';' before '}' token", "Syntax Error"),
        ("net/c.c:8:9: error: unused variable 'ret'", "Unused Symbol (-Werror)"),
        ("net/c.c:8:9: error: this statement may fall through [-Werror=implicit-fallthrough=]", "Warning Treated as Error"),
        ("gcc: error: unrecognized command-line option '-mno-outline-atomics'", "Unsupported Compiler Flag"),
        ("during RTL pass: expand: internal compiler error: in foo, at bar.c:1", "Internal Compiler Error"),
        ("/bin/sh: line 1: 1234 Segmentation fault      (core dumped) dtc", "Compiler Crash"),
        ("cc1: out of memory allocating 65536 bytes: virtual memory exhausted", "Out of Memory"),
        ("cp: error writing 'Image': No space left on device", "Disk Full"),
        ("*** Can't find default configuration \"arch/arm64/configs/foo_defconfig\"!", "Missing Defconfig"),
        ("drivers/kernelsu/Kconfig:12: syntax error", "Kconfig Syntax Error"),
        ("make[2]: *** No rule to make target 'drivers/ksu/ksu.o', needed by 'drivers/built-in.a'.", "Missing Build Target"),
        ("Error: arch/arm64/boot/dts/vendor/board.dts:12.1-2 syntax error", "Device Tree Error"),
        ("arch/arm64/Makefile:45: *** CROSS_COMPILE_ARM32 not defined.  Stop.", "Makefile Error"),
    ];

    #[test]
    fn every_rule_has_a_sample() {
        assert_eq!(SAMPLES.len(), rule_count());
    }

    #[test]
    fn each_sample_hits_its_own_category() {
        for (line, want) in SAMPLES {
            let got = classify_line(line).expect("rules compile").map(|(c, _)| c);
            assert_eq!(got, Some(*want), "line: {line}");
        }
    }

    #[test]
    fn distinct_matches_are_numbered_in_order() {
        let text = SAMPLES.iter().map(|(l, _)| *l).collect::<Vec<_>>().join("\n");
        let analysis = analyze_text(&text).expect("analyze");
        assert_eq!(analysis.count(), SAMPLES.len());
        for (i, d) in analysis.diagnostics.iter().enumerate() {
            assert_eq!(d.index, i + 1);
            assert_eq!(d.line_no, i + 1);
            assert_eq!(d.category, SAMPLES[i].1);
        }
    }

    #[test]
    fn unmatched_lines_are_ignored() {
        let text = "  CC      init/main.o\n  LD      vmlinux\n  OBJCOPY arch/arm64/boot/Image\n";
        let analysis = analyze_text(text).expect("analyze");
        assert_eq!(analysis.count(), 0);
        assert_eq!(analysis.lines_scanned, 3);
        assert!(analysis.render().contains("no known error patterns"));
    }

    #[test]
    fn first_matching_rule_wins() {
        // Both "Missing Header" and "Missing Host Tool" shapes; header rule comes first.
        let line = "fatal error: asm/foo.h: No such file or directory (command not found)";
        let (category, _) = classify_line(line).expect("compile").expect("match");
        assert_eq!(category, "Missing Header");
    }

    #[test]
    fn color_codes_do_not_hide_errors() {
        let text = "fs/a.c:1:1: \u{1b}[01;31m\u{1b}[Kerror: \u{1b}[m\u{1b}[Kredefinition of 'x'";
        let analysis = analyze_text(text).expect("analyze");
        assert_eq!(analysis.diagnostics[0].category, "Redefinition");
        assert!(!analysis.diagnostics[0].line.contains('\u{1b}'));
    }

    #[test]
    fn missing_log_is_an_error() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let err = analyze_file(&tmp.path().join("nope.log")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Io);
        assert!(err.to_string().contains("not found"));
    }

    #[test]
    fn sentinel_written_only_on_errors() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let log = tmp.path().join("build.log");
        let report = tmp.path().join("analysis.txt");
        let sentinel = tmp.path().join(SENTINEL_FILE);

        fs::write(&log, "  CC init/main.o\n").expect("write clean log");
        let clean = analyze_and_mark(&log, &report, &sentinel).expect("clean");
        assert!(!clean.has_errors());
        assert!(!sentinel.exists());

        fs::write(&log, "  CC init/main.o\nfs/a.c:1:1: error: redefinition of 'x'\n")
            .expect("write failing log");
        let failed = analyze_and_mark(&log, &report, &sentinel).expect("failed");
        assert_eq!(failed.count(), 1);
        assert!(sentinel.is_file());
        let rendered = fs::read_to_string(&report).expect("report");
        assert!(rendered.contains("1. [Redefinition] line 2:"), "{rendered}");
    }
}
