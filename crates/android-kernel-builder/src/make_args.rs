//! Filtering of user-supplied `make` arguments.
//!
//! The builder owns the compiler, linker, shell and output-dir variables. A user
//! argument that would override one of them is dropped, as are the flags that reach
//! the same variables indirectly (`--eval`, `-e`); everything else is passed
//! through verbatim. Values are not shell-escaped here: arguments reach `make` as
//! separate argv entries, and anything that re-joins them into a shell string must
//! quote them itself.

use std::collections::BTreeSet;
use std::sync::LazyLock;

/// Make variables the builder sets itself and users may not override.
pub const DENIED_KEYS: &[&str] = &[
    "CC",
    "CXX",
    "LD",
    "AS",
    "AR",
    "NM",
    "OBJCOPY",
    "OBJDUMP",
    "STRIP",
    "HOSTCC",
    "HOSTCXX",
    "HOSTLD",
    "SHELL",
    "CONFIG_SHELL",
    "CROSS_COMPILE",
    "CROSS_COMPILE_ARM32",
    "CROSS_COMPILE_COMPAT",
    "CLANG_TRIPLE",
    "ARCH",
    "SUBARCH",
    "O",
];

static DENIED: LazyLock<BTreeSet<&'static str>> =
    LazyLock::new(|| DENIED_KEYS.iter().copied().collect());

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilteredArgs {
    pub accepted: Vec<String>,
    pub rejected: Vec<String>,
}

/// Key of a `KEY=value` argument (also `KEY+=value` and `KEY:=value`), or `None`
/// for plain targets and flags.
pub fn arg_key(arg: &str) -> Option<&str> {
    let (key, _) = arg.split_once('=')?;
    let key = key.trim_end_matches(['+', ':', '?']).trim();
    (!key.is_empty()).then_some(key)
}

/// Long options that let make evaluate arbitrary assignments or let the
/// environment win over the builder's variables.
pub const DENIED_LONG_FLAGS: &[&str] = &["eval", "environment-overrides"];

// Short options that take a value; letters after one of these belong to the value.
const SHORT_WITH_VALUE: &[char] = &['C', 'f', 'I', 'j', 'l', 'o', 'W', 'O'];

/// `-e`, `-E <expr>`, `--eval=<expr>`, `--environment-overrides`, including bundled
/// short flags (`-ke`) and unambiguous long-option abbreviations (`--ev=`).
pub fn is_denied_flag(arg: &str) -> bool {
    if let Some(long) = arg.strip_prefix("--") {
        let name = long.split_once('=').map_or(long, |(n, _)| n);
        return name.len() >= 2 && DENIED_LONG_FLAGS.iter().any(|f| f.starts_with(name));
    }
    let Some(short) = arg.strip_prefix('-') else {
        return false;
    };
    for c in short.chars() {
        if c == 'e' || c == 'E' {
            return true;
        }
        if SHORT_WITH_VALUE.contains(&c) {
            return false;
        }
    }
    false
}

pub fn is_denied(arg: &str) -> bool {
    is_denied_flag(arg) || arg_key(arg).is_some_and(|k| DENIED.contains(k))
}

/// Split `args` into accepted and rejected, preserving the input order of each.
pub fn filter_make_args<I, S>(args: I) -> FilteredArgs
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut out = FilteredArgs::default();
    for arg in args {
        let arg = arg.as_ref();
        if is_denied(arg) {
            out.rejected.push(arg.to_string());
        } else {
            out.accepted.push(arg.to_string());
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn denied_keys_are_rejected() {
        let out = filter_make_args(["CC=gcc", "LLVM=1", "O=/tmp/x", "SHELL=/bin/evil", "V=1"]);
        assert_eq!(out.accepted, vec!["LLVM=1", "V=1"]);
        assert_eq!(out.rejected, vec!["CC=gcc", "O=/tmp/x", "SHELL=/bin/evil"]);
    }

    #[test]
    fn every_denied_key_is_rejected_with_any_assignment_form() {
        for key in DENIED_KEYS {
            for form in [format!("{key}=x"), format!("{key}+=x"), format!("{key}:=x")] {
                assert!(is_denied(&form), "{form} should be denied");
            }
        }
    }

    #[test]
    fn keys_are_matched_exactly() {
        let out = filter_make_args(["CCACHE_DIR=/c", "LLVM_IAS=1", "KCFLAGS=-O2", "ARCHIVE=x"]);
        assert!(out.rejected.is_empty());
        assert_eq!(out.accepted.len(), 4);
    }

    #[test]
    fn other_args_pass_through_unchanged_and_in_order() {
        let input = [
            "dtbs",
            "KCFLAGS=-Wno-error; rm -rf /",
            "-k",
            "LOCALVERSION=$(whoami)",
            "Image.gz",
        ];
        let out = filter_make_args(input);
        assert_eq!(out.accepted, input.to_vec());
        assert!(out.rejected.is_empty());
    }

    #[test]
    fn eval_and_environment_override_flags_are_rejected() {
        for arg in [
            "--eval=CC=gcc",
            "--eval",
            "--ev=CROSS_COMPILE=evil-",
            "-E",
            "-ECC=gcc",
            "-e",
            "-ke",
            "--environment-overrides",
            "--env",
        ] {
            assert!(is_denied(arg), "{arg} should be denied");
        }
        let out = filter_make_args(["-k", "-j8", "-C", "--keep-going", "-Werror.c", "V=1"]);
        assert!(out.rejected.is_empty(), "{:?}", out.rejected);
    }

    #[test]
    fn plain_targets_have_no_key() {
        assert_eq!(arg_key("modules"), None);
        assert_eq!(arg_key("=oops"), None);
        assert_eq!(arg_key("LLVM=1"), Some("LLVM"));
        assert_eq!(arg_key("KCFLAGS+=-g"), Some("KCFLAGS"));
    }
}
