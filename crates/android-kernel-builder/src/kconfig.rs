//! Line-oriented edits of kernel defconfig / `.config` files.

use std::fs;
use std::path::{Component, Path, PathBuf};

use toml::Value;

use crate::error::{Error, Result};
use crate::settings::KernelVersion;
use crate::trust::validate_cli_value;

fn matches_key(line: &str, key: &str) -> bool {
    line.strip_prefix(key).is_some_and(|rest| rest.starts_with('='))
        || line == format!("# {key} is not set")
}

fn finish(cfg: &mut String, out: Vec<String>) {
    *cfg = out.join("\n");
    if !cfg.ends_with('\n') {
        cfg.push('\n');
    }
}

/// Set `key=val`, replacing the first existing assignment (or "is not set" line)
/// in place and dropping later duplicates.
pub fn set_kv(cfg: &mut String, key: &str, val: &str) {
    let mut out = Vec::new();
    let mut done = false;
    for line in cfg.lines() {
        if matches_key(line, key) {
            if !done {
                out.push(format!("{key}={val}"));
                done = true;
            }
            continue;
        }
        out.push(line.to_string());
    }
    if !done {
        out.push(format!("{key}={val}"));
    }
    finish(cfg, out);
}

pub fn unset_kv(cfg: &mut String, key: &str) {
    let mut out: Vec<String> = cfg
        .lines()
        .filter(|l| !matches_key(l, key))
        .map(str::to_string)
        .collect();
    out.push(format!("# {key} is not set"));
    finish(cfg, out);
}

/// Unset every symbol starting with `prefix` that is currently assigned.
pub fn unset_prefix(cfg: &mut String, prefix: &str) {
    let keys: Vec<String> = cfg
        .lines()
        .filter_map(|l| l.split_once('=').map(|(k, _)| k))
        .filter(|k| k.starts_with(prefix))
        .map(str::to_string)
        .collect();
    for k in keys {
        unset_kv(cfg, &k);
    }
}

pub fn get_kv<'a>(cfg: &'a str, key: &str) -> Option<&'a str> {
    cfg.lines()
        .find_map(|l| l.strip_prefix(key)?.strip_prefix('='))
}

/// Append `item` to a comma-separated string symbol such as `CONFIG_LSM`.
/// Returns false when the symbol is absent.
pub fn append_list_item(cfg: &mut String, key: &str, item: &str) -> bool {
    let Some(raw) = get_kv(cfg, key) else {
        return false;
    };
    let inner = raw.trim().trim_matches('"');
    if inner.split(',').any(|s| s.trim() == item) {
        return true;
    }
    let updated = if inner.is_empty() {
        format!("\"{item}\"")
    } else {
        format!("\"{inner},{item}\"")
    };
    set_kv(cfg, key, &updated);
    true
}

/// Render a config override the way Kconfig expects it: booleans become `y` or an
/// unset line, tristate letters and numbers stay bare, other strings are quoted.
pub fn apply_value(cfg: &mut String, key: &str, v: &Value) -> Result<()> {
    validate_symbol(key)?;
    match v {
        Value::Boolean(true) => set_kv(cfg, key, "y"),
        Value::Boolean(false) => unset_kv(cfg, key),
        Value::Integer(i) => set_kv(cfg, key, &i.to_string()),
        Value::String(s) => match s.as_str() {
            "y" | "m" => set_kv(cfg, key, s),
            "n" => unset_kv(cfg, key),
            _ if s.starts_with("0x") || s.parse::<i64>().is_ok() => set_kv(cfg, key, s),
            _ => set_kv(cfg, key, &format!("\"{}\"", s.replace('"', "\\\""))),
        },
        other => {
            return Err(Error::config(format!(
                "unsupported value for {key}: {other} (expected bool, integer or string)"
            )));
        }
    }
    Ok(())
}

fn validate_symbol(key: &str) -> Result<()> {
    let ok = key.starts_with("CONFIG_")
        && key.len() > "CONFIG_".len()
        && key
            .chars()
            .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_');
    if !ok {
        return Err(Error::invalid(format!("invalid kconfig symbol '{key}'")));
    }
    Ok(())
}

/// Read, edit and write back a config file; the file is only rewritten when it changed.
pub fn edit_file(path: &Path, f: impl FnOnce(&mut String) -> Result<()>) -> Result<bool> {
    let before = fs::read_to_string(path)
        .map_err(|e| Error::msg(format!("failed to read {}: {e}", path.display())))?;
    let mut cfg = before.clone();
    f(&mut cfg)?;
    if cfg == before {
        return Ok(false);
    }
    fs::write(path, &cfg)
        .map_err(|e| Error::msg(format!("failed to write {}: {e}", path.display())))?;
    Ok(true)
}

fn reject_traversal(what: &str, value: &str) -> Result<()> {
    validate_cli_value(what, value)?;
    let has_parent = value == ".."
        || Path::new(value)
            .components()
            .any(|c| matches!(c, Component::ParentDir))
        || value.contains("..");
    if has_parent {
        return Err(Error::invalid(format!(
            "path traversal in {what} '{value}'"
        )));
    }
    if Path::new(value).is_absolute() {
        return Err(Error::invalid(format!("{what} '{value}' must be relative")));
    }
    Ok(())
}

/// `<kernel>/arch/<arch>/configs/<defconfig>`; both parts are validated and the
/// file must exist inside the kernel tree.
pub fn resolve_defconfig(kernel_dir: &Path, arch: &str, defconfig: &str) -> Result<PathBuf> {
    let arch = arch.trim();
    let defconfig = defconfig.trim();
    if arch.is_empty() {
        return Err(Error::invalid("build.arch is empty"));
    }
    if defconfig.is_empty() {
        return Err(Error::invalid("build.defconfig is empty"));
    }
    reject_traversal("build.arch", arch)?;
    reject_traversal("build.defconfig", defconfig)?;

    let path = kernel_dir
        .join("arch")
        .join(arch)
        .join("configs")
        .join(defconfig);
    if !path.is_file() {
        return Err(Error::invalid(format!(
            "defconfig not found: {}",
            path.display()
        )));
    }
    let root = kernel_dir
        .canonicalize()
        .map_err(|e| Error::msg(format!("failed to resolve {}: {e}", kernel_dir.display())))?;
    let resolved = path
        .canonicalize()
        .map_err(|e| Error::msg(format!("failed to resolve {}: {e}", path.display())))?;
    if !resolved.starts_with(&root) {
        return Err(Error::invalid(format!(
            "defconfig {} resolves outside the kernel tree",
            path.display()
        )));
    }
    Ok(path)
}

fn makefile_field(text: &str, key: &str) -> Option<String> {
    text.lines().find_map(|l| {
        let (k, v) = l.split_once('=')?;
        (k.trim() == key).then(|| v.trim().to_string())
    })
}

/// Parse `VERSION`, `PATCHLEVEL`, `SUBLEVEL` from a top-level kernel Makefile.
/// Returns the version plus `EXTRAVERSION` (possibly empty).
pub fn parse_makefile_version(text: &str) -> Result<(KernelVersion, String)> {
    let num = |key: &str| -> Result<u32> {
        let raw = makefile_field(text, key)
            .ok_or_else(|| Error::msg(format!("kernel Makefile has no {key}")))?;
        if raw.is_empty() {
            return Ok(0);
        }
        raw.parse::<u32>()
            .map_err(|_| Error::msg(format!("kernel Makefile {key} is not a number: '{raw}'")))
    };
    let version = KernelVersion {
        major: num("VERSION")?,
        minor: num("PATCHLEVEL")?,
        sub: num("SUBLEVEL")?,
    };
    let extra = makefile_field(text, "EXTRAVERSION").unwrap_or_default();
    Ok((version, extra))
}

pub fn read_kernel_version(kernel_dir: &Path) -> Result<(KernelVersion, String)> {
    let mk = kernel_dir.join("Makefile");
    let text = fs::read_to_string(&mk)
        .map_err(|e| Error::msg(format!("failed to read {}: {e}", mk.display())))?;
    parse_makefile_version(&text)
}
