use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use serde::de::{DeserializeOwned, Error as _};
use serde::{Deserialize, Deserializer};
use toml::Value;

use crate::error::{Error, Result};

/// Prefix for environment overrides: `AKB_BUILD__ARCH=arm64` sets `build.arch`.
pub const ENV_PREFIX: &str = "AKB_";

/// Tables whose keys are case-sensitive names rather than config fields; env
/// override segments below them keep the case they were written in.
pub const CASE_SENSITIVE_TABLES: &[&str] = &["build.kconfig"];

#[derive(Debug, Clone)]
pub struct ConfigDoc {
    pub path: PathBuf,
    pub value: Value,
}

impl ConfigDoc {
    pub fn parse(path: impl Into<PathBuf>, raw: &str) -> Result<Self> {
        let value: Value = toml::from_str(raw)?;
        Ok(Self {
            path: path.into(),
            value,
        })
    }

    pub fn value_path(&self, path: &str) -> Option<&Value> {
        let path = path.trim();
        if path.is_empty() {
            return Some(&self.value);
        }

        let mut cur = &self.value;
        for seg in path.split('.') {
            cur = cur.as_table()?.get(seg)?;
        }
        Some(cur)
    }

    pub fn deserialize_path<T: DeserializeOwned>(&self, path: &str) -> Result<Option<T>> {
        let Some(v) = self.value_path(path) else {
            return Ok(None);
        };
        let parsed = v
            .clone()
            .try_into()
            .map_err(|e| Error::config(format!("failed to deserialize config at '{}': {e}", path)))?;
        Ok(Some(parsed))
    }

    pub fn table_path(&self, path: &str) -> Option<&toml::value::Table> {
        self.value_path(path)?.as_table()
    }

    pub fn has_table_path(&self, path: &str) -> bool {
        self.table_path(path).is_some()
    }

    /// True when `path` holds `true`, or is a table whose `enabled` is not false.
    pub fn flag(&self, path: &str) -> bool {
        match self.value_path(path) {
            Some(Value::Boolean(b)) => *b,
            Some(Value::Table(t)) => t.get("enabled").and_then(Value::as_bool).unwrap_or(true),
            _ => false,
        }
    }

    pub fn str_path(&self, path: &str) -> Option<&str> {
        self.value_path(path)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }

    pub fn top_level_keys(&self) -> Vec<&str> {
        self.value
            .as_table()
            .map(|t| t.keys().map(String::as_str).collect())
            .unwrap_or_default()
    }

    /// Set a dotted path, creating intermediate tables as needed.
    pub fn set_path(&mut self, path: &str, v: Value) -> Result<()> {
        let segs: Vec<&str> = path.split('.').filter(|s| !s.is_empty()).collect();
        let Some((last, parents)) = segs.split_last() else {
            return Err(Error::config("empty config path"));
        };
        let mut cur = &mut self.value;
        for seg in parents {
            let tbl = cur
                .as_table_mut()
                .ok_or_else(|| Error::config(format!("config path '{path}' crosses a non-table")))?;
            cur = tbl
                .entry(seg.to_string())
                .or_insert_with(|| Value::Table(Default::default()));
        }
        let tbl = cur
            .as_table_mut()
            .ok_or_else(|| Error::config(format!("config path '{path}' crosses a non-table")))?;
        tbl.insert(last.to_string(), v);
        Ok(())
    }
}

fn merge_values(base: &mut Value, child: Value) {
    match (base, child) {
        (Value::Table(base_tbl), Value::Table(child_tbl)) => {
            for (k, v) in child_tbl {
                match base_tbl.get_mut(&k) {
                    Some(existing) => merge_values(existing, v),
                    None => {
                        base_tbl.insert(k, v);
                    }
                }
            }
        }
        (base_slot, child_val) => {
            *base_slot = child_val;
        }
    }
}

fn resolve_ref_path(from_file: &Path, reference: &str) -> PathBuf {
    let p = PathBuf::from(reference);
    if p.is_absolute() {
        p
    } else {
        from_file.parent().unwrap_or_else(|| Path::new(".")).join(p)
    }
}

fn parse_imports(path: &Path, table: &toml::value::Table) -> Result<Vec<String>> {
    let Some(arr) = table.get("imports").and_then(Value::as_array) else {
        return Ok(Vec::new());
    };
    let mut out = Vec::new();
    for v in arr {
        let Some(s) = v.as_str() else {
            return Err(Error::config(format!(
                "invalid imports entry in {} (expected string)",
                path.display()
            )));
        };
        let s = s.trim();
        if !s.is_empty() {
            out.push(s.to_string());
        }
    }
    Ok(out)
}

fn inline_imports(file_path: &Path, value: &mut Value, stack: &mut HashSet<PathBuf>) -> Result<()> {
    let Value::Table(tbl) = value else {
        return Ok(());
    };

    let imports = parse_imports(file_path, tbl)?;
    tbl.remove("imports");
    if !imports.is_empty() {
        let mut acc = Value::Table(Default::default());
        for imp in imports {
            let loaded = load_value_inner(&resolve_ref_path(file_path, &imp), stack)?;
            merge_values(&mut acc, loaded);
        }
        merge_values(&mut acc, Value::Table(std::mem::take(tbl)));
        if let Value::Table(merged) = acc {
            *tbl = merged;
        }
    }

    for (_, v) in tbl.iter_mut() {
        inline_imports(file_path, v, stack)?;
    }
    Ok(())
}

fn load_value_inner(path: &Path, stack: &mut HashSet<PathBuf>) -> Result<Value> {
    let canonical = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
    if !stack.insert(canonical.clone()) {
        return Err(Error::config(format!(
            "config import cycle detected at {}",
            canonical.display()
        )));
    }

    let data = fs::read_to_string(path)
        .map_err(|e| Error::config(format!("failed to read config {}: {e}", path.display())))?;
    let mut value: Value = toml::from_str(&data)
        .map_err(|e| Error::config(format!("TOML parse error in {}: {e}", path.display())))?;

    // A device config usually extends a shared base (toolchain, patches).
    let mut out = Value::Table(Default::default());
    if let Some(ext) = value.get("extends").and_then(Value::as_str) {
        out = load_value_inner(&resolve_ref_path(path, ext), stack)?;
    }
    if let Some(tbl) = value.as_table_mut() {
        tbl.remove("extends");
    }

    inline_imports(path, &mut value, stack)?;
    merge_values(&mut out, value);

    stack.remove(&canonical);
    Ok(out)
}

/// Parse an override with no existing value to go by. Booleans and TOML arrays or
/// inline tables are parsed; everything else, numbers included, stays a string.
pub fn parse_override_value(raw: &str) -> Value {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Value::String(String::new());
    }
    let snippet = format!("v = {trimmed}");
    match toml::from_str::<toml::value::Table>(&snippet).map(|mut t| t.remove("v")) {
        Ok(Some(v @ (Value::Boolean(_) | Value::Array(_) | Value::Table(_)))) => v,
        _ => Value::String(raw.to_string()),
    }
}

/// Shape an override like the value it replaces, so `12` stays a string where the
/// document already holds a string and becomes a number where it holds a number.
pub fn coerce_override(existing: Option<&Value>, raw: &str) -> Value {
    let trimmed = raw.trim();
    match existing {
        Some(Value::String(_)) => Value::String(raw.to_string()),
        Some(Value::Integer(_)) => trimmed
            .parse()
            .map(Value::Integer)
            .unwrap_or_else(|_| Value::String(raw.to_string())),
        Some(Value::Float(_)) => trimmed
            .parse()
            .map(Value::Float)
            .unwrap_or_else(|_| Value::String(raw.to_string())),
        Some(Value::Boolean(_)) => trimmed
            .parse()
            .map(Value::Boolean)
            .unwrap_or_else(|_| Value::String(raw.to_string())),
        _ => parse_override_value(raw),
    }
}

/// Map `AKB_<SECTION>__<KEY>` variables onto dotted config paths, keeping the raw
/// values; [`apply_overrides`] decides their types.
pub fn env_overrides<I>(vars: I) -> Vec<(String, String)>
where
    I: IntoIterator<Item = (String, String)>,
{
    let mut out = Vec::new();
    for (k, v) in vars {
        let Some(rest) = k.strip_prefix(ENV_PREFIX) else {
            continue;
        };
        if !rest.contains("__") {
            continue;
        }
        let mut segs: Vec<String> = Vec::new();
        let mut keep_case = false;
        for seg in rest.split("__").filter(|s| !s.is_empty()) {
            segs.push(if keep_case {
                seg.to_string()
            } else {
                seg.to_ascii_lowercase()
            });
            keep_case = keep_case || CASE_SENSITIVE_TABLES.contains(&segs.join(".").as_str());
        }
        if segs.is_empty() {
            continue;
        }
        out.push((segs.join("."), v));
    }
    out.sort_by(|a, b| a.0.cmp(&b.0));
    out
}

pub fn apply_overrides(doc: &mut ConfigDoc, overrides: Vec<(String, String)>) -> Result<()> {
    for (path, raw) in overrides {
        tracing::debug!(path = %path, "applying environment override");
        let v = coerce_override(doc.value_path(&path), &raw);
        doc.set_path(&path, v)?;
    }
    Ok(())
}

/// Accept an integer or a numeric string for count-like settings.
pub fn int_or_string<'de, D, T>(d: D) -> std::result::Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: TryFrom<i64> + std::str::FromStr,
    <T as std::str::FromStr>::Err: std::fmt::Display,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Int(i64),
        Str(String),
    }
    match Raw::deserialize(d)? {
        Raw::Int(i) => T::try_from(i).map_err(|_| D::Error::custom(format!("{i} is out of range"))),
        Raw::Str(s) => s
            .trim()
            .parse()
            .map_err(|e| D::Error::custom(format!("invalid number '{s}': {e}"))),
    }
}

/// Accept a string or a bare integer for version-like settings (`android_version = 12`).
pub fn string_or_int<'de, D>(d: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Str(String),
        Int(i64),
    }
    Ok(match Raw::deserialize(d)? {
        Raw::Str(s) => s,
        Raw::Int(i) => i.to_string(),
    })
}

pub fn load(path: &Path) -> Result<ConfigDoc> {
    let mut stack = HashSet::<PathBuf>::new();
    let value = load_value_inner(path, &mut stack)?;
    Ok(ConfigDoc {
        path: path.to_path_buf(),
        value,
    })
}

/// Load a build definition and apply CI-provided environment overrides on top.
pub fn load_with_env(path: &Path) -> Result<ConfigDoc> {
    let mut doc = load(path)?;
    apply_overrides(&mut doc, env_overrides(std::env::vars()))?;
    Ok(doc)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extends_and_imports_merge_in_order() {
        let tmp = tempfile::tempdir().expect("tempdir");
        fs::write(
            tmp.path().join("base.toml"),
            "[build]\narch = \"arm\"\ndefconfig = \"base_defconfig\"\n",
        )
        .expect("write base");
        fs::write(
            tmp.path().join("ksu.toml"),
            "[kernelsu]\nenabled = true\nversion = \"v0.9.5\"\n",
        )
        .expect("write ksu");
        fs::write(
            tmp.path().join("device.toml"),
            "extends = \"base.toml\"\n[build]\narch = \"arm64\"\n[patch]\nimports = [\"ksu.toml\"]\n",
        )
        .expect("write device");

        let doc = load(&tmp.path().join("device.toml")).expect("load");
        assert_eq!(doc.str_path("build.arch"), Some("arm64"));
        assert_eq!(doc.str_path("build.defconfig"), Some("base_defconfig"));
        assert_eq!(doc.str_path("patch.kernelsu.version"), Some("v0.9.5"));
        assert!(doc.flag("patch.kernelsu"));
    }

    #[test]
    fn import_cycles_are_rejected() {
        let tmp = tempfile::tempdir().expect("tempdir");
        fs::write(tmp.path().join("a.toml"), "extends = \"b.toml\"\n").expect("write a");
        fs::write(tmp.path().join("b.toml"), "extends = \"a.toml\"\n").expect("write b");
        let err = load(&tmp.path().join("a.toml")).unwrap_err().to_string();
        assert!(err.contains("cycle"), "unexpected err: {err}");
    }

    #[test]
    fn env_overrides_map_to_dotted_paths() {
        let vars = vec![
            ("AKB_BUILD__ARCH".to_string(), "arm64".to_string()),
            ("AKB_PATCH__KERNELSU__ENABLED".to_string(), "true".to_string()),
            ("AKB_KERNEL__DEPTH".to_string(), "0".to_string()),
            ("AKB_PUBLISH__KEEP_RELEASES".to_string(), "3".to_string()),
            ("AKB_IGNORED".to_string(), "x".to_string()),
            ("HOME".to_string(), "/root".to_string()),
        ];
        let mut doc = ConfigDoc::parse("<mem>", "[build]\narch = \"arm\"\n[publish]\nkeep_releases = 1\n")
            .expect("doc");
        apply_overrides(&mut doc, env_overrides(vars)).expect("apply");
        assert_eq!(doc.str_path("build.arch"), Some("arm64"));
        assert!(doc.flag("patch.kernelsu.enabled"));
        // No existing value: kept as text for the typed settings to parse.
        assert_eq!(doc.str_path("kernel.depth"), Some("0"));
        // Existing integer: stays an integer.
        assert_eq!(
            doc.value_path("publish.keep_releases").and_then(Value::as_integer),
            Some(3)
        );
    }

    #[test]
    fn numeric_looking_overrides_stay_strings() {
        let vars = vec![
            ("AKB_TOOLCHAIN__ANDROID_VERSION".to_string(), "12".to_string()),
            ("AKB_KERNEL__BRANCH".to_string(), "13".to_string()),
            ("AKB_BUILD__DEFCONFIG".to_string(), "1".to_string()),
            ("AKB_PATCH__KERNELSU__VERSION".to_string(), "1.0".to_string()),
        ];
        let mut doc = ConfigDoc::parse("<mem>", "[build]\ndefconfig = \"sweet_defconfig\"\n")
            .expect("doc");
        apply_overrides(&mut doc, env_overrides(vars)).expect("apply");
        assert_eq!(doc.str_path("toolchain.android_version"), Some("12"));
        assert_eq!(doc.str_path("kernel.branch"), Some("13"));
        assert_eq!(doc.str_path("build.defconfig"), Some("1"));
        assert_eq!(doc.str_path("patch.kernelsu.version"), Some("1.0"));
    }

    #[test]
    fn kconfig_override_keys_keep_their_case() {
        let vars = vec![
            ("AKB_BUILD__KCONFIG__CONFIG_KSU".to_string(), "y".to_string()),
            ("AKB_BUILD__KVM".to_string(), "true".to_string()),
        ];
        let paths: Vec<String> = env_overrides(vars).into_iter().map(|(p, _)| p).collect();
        assert_eq!(paths, vec!["build.kconfig.CONFIG_KSU", "build.kvm"]);
    }

    #[test]
    fn override_values_without_a_target_type() {
        assert_eq!(parse_override_value("true"), Value::Boolean(true));
        assert_eq!(parse_override_value("12"), Value::String("12".into()));
        assert_eq!(parse_override_value("1.0"), Value::String("1.0".into()));
        assert_eq!(
            parse_override_value("https://github.com/a/b"),
            Value::String("https://github.com/a/b".into())
        );
        assert_eq!(
            parse_override_value("[\"LLVM=1\", \"LLVM_IAS=1\"]"),
            Value::Array(vec![
                Value::String("LLVM=1".into()),
                Value::String("LLVM_IAS=1".into())
            ])
        );
    }

    #[test]
    fn overrides_follow_the_existing_type() {
        let s = Value::String("x".into());
        let i = Value::Integer(1);
        let b = Value::Boolean(false);
        assert_eq!(coerce_override(Some(&s), "12"), Value::String("12".into()));
        assert_eq!(coerce_override(Some(&s), "true"), Value::String("true".into()));
        assert_eq!(coerce_override(Some(&i), " 8 "), Value::Integer(8));
        assert_eq!(coerce_override(Some(&b), "true"), Value::Boolean(true));
        assert_eq!(coerce_override(Some(&i), "many"), Value::String("many".into()));
    }
}
