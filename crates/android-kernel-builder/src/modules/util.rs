use std::fs;
use std::io::Read;
use std::path::{Component, Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use reqwest::Url;

use crate::config::ConfigDoc;
use crate::error::{Error, Result};
use crate::executor::ExecCtx;
use crate::settings::{BuildConfig, KernelConfig};
use crate::trust::validate_cli_value;

pub fn kernel_config(doc: &ConfigDoc) -> Result<KernelConfig> {
    Ok(doc.deserialize_path("kernel")?.unwrap_or_default())
}

pub fn build_config(doc: &ConfigDoc) -> Result<BuildConfig> {
    Ok(doc.deserialize_path("build")?.unwrap_or_default())
}

/// Extra trusted download hosts from `patch.trusted_domains`.
pub fn trusted_domains(doc: &ConfigDoc) -> Result<Vec<String>> {
    Ok(doc
        .deserialize_path::<Vec<String>>("patch.trusted_domains")?
        .unwrap_or_default())
}

pub fn build_name(doc: &ConfigDoc) -> String {
    if let Some(name) = doc.str_path("build.name") {
        return name.to_string();
    }
    doc.path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("kernel")
        .to_string()
}

/// UTC timestamp used in output names.
pub fn utc_stamp() -> String {
    chrono::Utc::now().format("%Y%m%d-%H%M").to_string()
}

#[derive(Debug, Clone)]
pub struct NameVars<'a> {
    pub name: &'a str,
    pub version: &'a str,
    pub date: &'a str,
    pub arch: &'a str,
}

/// Expand an output name template. The result is a single file name component.
pub fn expand_name_template(raw: &str, vars: &NameVars<'_>) -> Result<String> {
    let out = raw
        .replace("{name}", vars.name)
        .replace("{version}", vars.version)
        .replace("{date}", vars.date)
        .replace("{arch}", vars.arch);
    if let Some(start) = out.find('{')
        && out[start..].contains('}')
    {
        return Err(Error::config(format!(
            "unknown placeholder in name template '{raw}'"
        )));
    }
    let out = out.trim().to_string();
    if out.is_empty() || out.contains('/') || out.contains("..") || out.starts_with('-') {
        return Err(Error::invalid(format!(
            "output name '{out}' is not a plain file name"
        )));
    }
    Ok(out)
}

pub fn ensure_relative(p: &str) -> Result<()> {
    let path = p.trim();
    if path.is_empty() {
        return Err(Error::invalid("path is empty"));
    }
    let pb = Path::new(path);
    if pb.is_absolute() || pb.components().any(|c| matches!(c, Component::ParentDir)) {
        return Err(Error::invalid(format!(
            "path '{path}' must be relative and must not contain '..'"
        )));
    }
    Ok(())
}

pub fn kernel_dir(doc: &ConfigDoc, ctx: &ExecCtx) -> Result<PathBuf> {
    let k = kernel_config(doc)?;
    ctx.workspace_paths_or_init(doc)?.resolve_under_build(&k.dir)
}

/// `O=` directory for kbuild.
pub fn kbuild_out_dir(doc: &ConfigDoc, ctx: &ExecCtx) -> Result<PathBuf> {
    Ok(ctx.workspace_paths_or_init(doc)?.build_dir.join("kernel-out"))
}

pub fn ensure_dir(p: &Path) -> Result<()> {
    fs::create_dir_all(p)
        .map_err(|e| Error::msg(format!("failed to create dir {}: {e}", p.display())))
}

pub fn write_text(p: &Path, s: &str) -> Result<()> {
    if let Some(parent) = p.parent() {
        ensure_dir(parent)?;
    }
    fs::write(p, s).map_err(|e| Error::msg(format!("failed to write {}: {e}", p.display())))
}

pub fn write_json_pretty(p: &Path, v: &serde_json::Value) -> Result<()> {
    let s = serde_json::to_string_pretty(v)
        .map_err(|e| Error::msg(format!("json encode error: {e}")))?;
    write_text(p, &s)
}

pub fn copy_file(src: &Path, dst: &Path) -> Result<()> {
    if let Some(parent) = dst.parent() {
        ensure_dir(parent)?;
    }
    fs::copy(src, dst).map_err(|e| {
        Error::msg(format!(
            "failed to copy {} -> {}: {e}",
            src.display(),
            dst.display()
        ))
    })?;
    Ok(())
}

/// Copy `src` over `dst`, overwriting files. Top-level entries named in `skip`
/// (e.g. `.git`) are left out. Returns the number of files copied.
pub fn copy_tree(src: &Path, dst: &Path, skip: &[&str]) -> Result<usize> {
    if !src.is_dir() {
        return Err(Error::msg(format!(
            "source is not a directory: {}",
            src.display()
        )));
    }
    ensure_dir(dst)?;
    let mut copied = 0;
    let walker = walkdir::WalkDir::new(src)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| {
            !(e.depth() == 1 && skip.iter().any(|s| e.file_name() == std::ffi::OsStr::new(s)))
        });
    for entry in walker {
        let entry = entry.map_err(|e| Error::msg(format!("walkdir error: {e}")))?;
        let p = entry.path();
        let rel = p
            .strip_prefix(src)
            .map_err(|e| Error::msg(format!("strip_prefix failed: {e}")))?;
        if rel.as_os_str().is_empty() {
            continue;
        }
        let out = dst.join(rel);
        if entry.file_type().is_dir() {
            ensure_dir(&out)?;
        } else if entry.file_type().is_symlink() {
            copy_symlink(p, &out)?;
            copied += 1;
        } else {
            copy_file(p, &out)?;
            copied += 1;
        }
    }
    Ok(copied)
}

#[cfg(unix)]
fn copy_symlink(src: &Path, dst: &Path) -> Result<()> {
    use std::os::unix::fs as unix_fs;

    if let Some(parent) = dst.parent() {
        ensure_dir(parent)?;
    }
    if fs::symlink_metadata(dst).is_ok() {
        fs::remove_file(dst)
            .map_err(|e| Error::msg(format!("failed to remove {}: {e}", dst.display())))?;
    }
    let target = fs::read_link(src)
        .map_err(|e| Error::msg(format!("failed to read symlink {}: {e}", src.display())))?;
    unix_fs::symlink(&target, dst).map_err(|e| {
        Error::msg(format!(
            "failed to create symlink {} -> {}: {e}",
            dst.display(),
            target.display()
        ))
    })
}

#[cfg(not(unix))]
fn copy_symlink(src: &Path, dst: &Path) -> Result<()> {
    copy_file(src, dst)
}

pub fn sha256_file_hex(path: &Path) -> Result<String> {
    use sha2::{Digest, Sha256};

    let mut file = fs::File::open(path)
        .map_err(|e| Error::msg(format!("failed to open {}: {e}", path.display())))?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 1024 * 256];
    loop {
        let n = file
            .read(&mut buf)
            .map_err(|e| Error::msg(format!("failed to read {}: {e}", path.display())))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

pub fn sha256_hex(parts: &[&str]) -> String {
    use sha2::{Digest, Sha256};

    let mut hasher = Sha256::new();
    for p in parts {
        hasher.update(p.as_bytes());
        hasher.update([0u8]);
    }
    hex::encode(hasher.finalize())
}

pub fn http_client(timeout: Duration) -> Result<reqwest::blocking::Client> {
    reqwest::blocking::Client::builder()
        .timeout(timeout)
        .connect_timeout(Duration::from_secs(30))
        .user_agent(concat!("android-kernel-builder/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| Error::http(format!("failed to build HTTP client: {e}")))
}

/// Stream `url` into `dest` through a temp file so a failed download never leaves
/// a truncated file behind. Returns the number of bytes written.
pub fn download_file(url: &Url, dest: &Path) -> Result<u64> {
    let dir = dest
        .parent()
        .ok_or_else(|| Error::msg(format!("download target has no parent: {}", dest.display())))?;
    ensure_dir(dir)?;

    let client = http_client(Duration::from_secs(60 * 30))?;
    let mut res = client
        .get(url.clone())
        .send()
        .map_err(|e| Error::http(format!("download of {url} failed: {e}")))?;
    if !res.status().is_success() {
        return Err(Error::http(format!(
            "download of {url} failed with status {}",
            res.status()
        )));
    }

    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    let n = res
        .copy_to(tmp.as_file_mut())
        .map_err(|e| Error::http(format!("reading body of {url} failed: {e}")))?;
    tmp.persist(dest).map_err(|e| {
        Error::msg(format!("failed to move download to {}: {e}", dest.display()))
    })?;
    Ok(n)
}

pub fn is_git_repo(dir: &Path) -> bool {
    dir.join(".git").exists()
}

#[derive(Debug, Clone, Default)]
pub struct GitCheckout<'a> {
    pub url: &'a str,
    pub branch: Option<&'a str>,
    /// 0 means a full clone.
    pub depth: u32,
    pub submodules: bool,
}

impl GitCheckout<'_> {
    pub fn validate(&self) -> Result<()> {
        if self.url.trim().is_empty() {
            return Err(Error::invalid("git url is empty"));
        }
        validate_cli_value("git url", self.url)?;
        if let Some(b) = self.branch {
            validate_cli_value("git branch", b)?;
        }
        Ok(())
    }

    pub fn clone_command(&self, dest: &Path) -> Command {
        let mut cmd = Command::new("git");
        cmd.arg("clone");
        if self.depth > 0 {
            cmd.arg("--depth").arg(self.depth.to_string());
        }
        if let Some(b) = self.branch.filter(|b| !b.trim().is_empty()) {
            cmd.arg("--branch").arg(b.trim());
        }
        if self.submodules {
            cmd.arg("--recurse-submodules");
            if self.depth > 0 {
                cmd.arg("--shallow-submodules");
            }
        }
        cmd.arg("--").arg(self.url.trim()).arg(dest);
        cmd.env("GIT_TERMINAL_PROMPT", "0");
        cmd
    }
}

/// Clone `co` into `dest` unless a git checkout already lives there.
/// Returns true when a clone was performed.
pub fn git_clone(ctx: &ExecCtx, co: &GitCheckout<'_>, dest: &Path) -> Result<bool> {
    co.validate()?;
    if dest.exists() {
        if is_git_repo(dest) {
            ctx.log(&format!("reusing existing checkout {}", dest.display()));
            return Ok(false);
        }
        let empty = fs::read_dir(dest)
            .map(|mut d| d.next().is_none())
            .unwrap_or(false);
        if !empty {
            return Err(Error::invalid(format!(
                "{} exists but is not a git repository",
                dest.display()
            )));
        }
    }
    if let Some(parent) = dest.parent() {
        ensure_dir(parent)?;
    }
    ctx.log(&format!(
        "cloning {}{} -> {}",
        co.url,
        co.branch.map(|b| format!(" ({b})")).unwrap_or_default(),
        dest.display()
    ));
    ctx.run_cmd(co.clone_command(dest))?;
    Ok(true)
}
