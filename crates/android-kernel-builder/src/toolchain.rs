//! Toolchain archives: extraction, layout normalization and cross-prefix inference.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::LazyLock;

use regex::Regex;

use crate::error::{Error, Result};
use crate::executor::ExecCtx;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveKind {
    Zip,
    Tar,
    TarGz,
    TarXz,
    TarBz2,
    Gz,
}

impl ArchiveKind {
    pub fn from_name(name: &str) -> Option<Self> {
        let n = name.to_ascii_lowercase();
        let n = n.split(['?', '#']).next().unwrap_or_default();
        if n.ends_with(".zip") {
            Some(Self::Zip)
        } else if n.ends_with(".tar.gz") || n.ends_with(".tgz") {
            Some(Self::TarGz)
        } else if n.ends_with(".tar.xz") || n.ends_with(".txz") {
            Some(Self::TarXz)
        } else if n.ends_with(".tar.bz2") || n.ends_with(".tbz2") {
            Some(Self::TarBz2)
        } else if n.ends_with(".tar") {
            Some(Self::Tar)
        } else if n.ends_with(".gz") {
            Some(Self::Gz)
        } else {
            None
        }
    }
}

/// A toolchain URL is cloned when it names a git repo or comes with a branch;
/// anything else is treated as an archive.
pub fn is_git_source(url: &str, branch: Option<&str>) -> bool {
    branch.is_some_and(|b| !b.trim().is_empty()) || url.trim_end_matches('/').ends_with(".git")
}

fn extract_command(kind: ArchiveKind, archive: &Path, dest: &Path) -> Command {
    match kind {
        ArchiveKind::Zip => {
            let mut c = Command::new("unzip");
            c.arg("-q").arg("-o").arg(archive).arg("-d").arg(dest);
            c
        }
        ArchiveKind::Gz => {
            let mut c = Command::new("gunzip");
            c.arg("-f").arg(archive);
            c
        }
        ArchiveKind::Tar | ArchiveKind::TarGz | ArchiveKind::TarXz | ArchiveKind::TarBz2 => {
            let flag = match kind {
                ArchiveKind::TarGz => "-xzf",
                ArchiveKind::TarXz => "-xJf",
                ArchiveKind::TarBz2 => "-xjf",
                _ => "-xf",
            };
            let mut c = Command::new("tar");
            c.arg(flag).arg(archive).arg("-C").arg(dest);
            c
        }
    }
}

/// Extract `archive` into `dest` with the host's archive tools.
pub fn extract(ctx: &ExecCtx, kind: ArchiveKind, archive: &Path, dest: &Path) -> Result<()> {
    fs::create_dir_all(dest)
        .map_err(|e| Error::msg(format!("failed to create {}: {e}", dest.display())))?;
    if kind == ArchiveKind::Gz {
        // gunzip works in place; stage the file inside dest first.
        let name = archive
            .file_name()
            .ok_or_else(|| Error::msg(format!("bad archive path {}", archive.display())))?;
        let staged = dest.join(name);
        fs::copy(archive, &staged)
            .map_err(|e| Error::msg(format!("failed to stage {}: {e}", archive.display())))?;
        return ctx.run_cmd(extract_command(kind, &staged, dest));
    }
    ctx.run_cmd(extract_command(kind, archive, dest))
}

const HOISTED: &[&str] = &["bin", "lib", "lib64"];

fn sorted_subdirs(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut out: Vec<PathBuf> = fs::read_dir(dir)
        .map_err(|e| Error::msg(format!("failed to read {}: {e}", dir.display())))?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_dir())
        .collect();
    out.sort();
    Ok(out)
}

/// Make sure `root/bin` exists. When the archive wrapped everything in one extra
/// directory, `bin`, `lib` and `lib64` are moved up a level. Returns whether
/// anything moved; a directory that already has `bin/` is left alone.
pub fn normalize(root: &Path) -> Result<bool> {
    if root.join("bin").is_dir() {
        return Ok(false);
    }
    let nested = sorted_subdirs(root)?
        .into_iter()
        .find(|d| d.join("bin").is_dir())
        .ok_or_else(|| {
            Error::msg(format!(
                "no bin/ directory found in {} or one level below",
                root.display()
            ))
        })?;

    for name in HOISTED {
        let from = nested.join(name);
        let to = root.join(name);
        if !from.is_dir() || to.exists() {
            continue;
        }
        fs::rename(&from, &to).map_err(|e| {
            Error::msg(format!(
                "failed to move {} -> {}: {e}",
                from.display(),
                to.display()
            ))
        })?;
    }
    tracing::debug!(root = %root.display(), from = %nested.display(), "normalized toolchain layout");
    Ok(true)
}

/// Cross prefixes recognised by name, most specific first.
pub const KNOWN_PREFIXES: &[&str] = &[
    "aarch64-linux-android-",
    "aarch64-none-linux-gnu-",
    "aarch64-linux-gnu-",
    "aarch64-elf-",
    "arm-linux-androideabi-",
    "arm-linux-gnueabihf-",
    "arm-linux-gnueabi-",
    "arm-none-eabi-",
    "arm-eabi-",
];

static GCC_RE: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"^((?:aarch64|arm64|arm|armv7a?)[A-Za-z0-9_.]*(?:-[A-Za-z0-9_.]+)*-)gcc$").ok()
});

fn bin_names(bin: &Path) -> Vec<String> {
    let mut names: Vec<String> = fs::read_dir(bin)
        .map(|rd| {
            rd.filter_map(|e| e.ok())
                .filter_map(|e| e.file_name().to_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default();
    names.sort();
    names
}

/// Work out the `CROSS_COMPILE` prefix of a GCC toolchain.
///
/// Tried in order: a known prefix matching the toolchain folder name, a `*-gcc`
/// binary matching the prefix pattern, then any `*-ld` / `*-as` / `*-ar` binary.
pub fn infer_prefix(root: &Path) -> Option<String> {
    let bin = root.join("bin");
    let names = bin_names(&bin);
    let has = |n: &str| names.iter().any(|x| x == n);

    let folder = root
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or_default()
        .to_ascii_lowercase();
    for p in KNOWN_PREFIXES {
        let bare = p.trim_end_matches('-');
        if folder.starts_with(bare) && (has(&format!("{p}gcc")) || has(&format!("{p}ld"))) {
            return Some((*p).to_string());
        }
    }

    if let Some(re) = GCC_RE.as_ref()
        && let Some(p) = names
            .iter()
            .find_map(|n| re.captures(n).map(|c| c[1].to_string()))
    {
        return Some(p);
    }

    for suffix in ["-ld", "-as", "-ar"] {
        if let Some(p) = names
            .iter()
            .filter(|n| !n.starts_with("ld.") && !n.starts_with("llvm-"))
            .find_map(|n| n.strip_suffix(suffix))
            .filter(|p| !p.is_empty())
        {
            return Some(format!("{p}-"));
        }
    }
    None
}
