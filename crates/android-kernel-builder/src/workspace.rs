use std::fs;
use std::path::{Component, Path, PathBuf};

use serde::Deserialize;

use crate::error::{Error, Result};

fn default_build_dir() -> String {
    "build".into()
}

fn default_out_dir() -> String {
    "out".into()
}

fn default_root_dir() -> String {
    ".".into()
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum CleanMode {
    #[default]
    None,
    Build,
    Out,
    All,
}

impl CleanMode {
    pub fn as_str(self) -> &'static str {
        match self {
            CleanMode::None => "none",
            CleanMode::Build => "build",
            CleanMode::Out => "out",
            CleanMode::All => "all",
        }
    }
}

/// `[workspace]`: where sources, toolchains and outputs live on the runner.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkspaceConfig {
    pub root_dir: String,
    pub build_dir: String,
    pub out_dir: String,
    pub clean: CleanMode,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            root_dir: default_root_dir(),
            build_dir: default_build_dir(),
            out_dir: default_out_dir(),
            clean: CleanMode::None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkspacePaths {
    pub root: PathBuf,
    pub build_dir: PathBuf,
    pub out_dir: PathBuf,
}

impl WorkspacePaths {
    /// Absolute paths are used as-is, relative ones are rooted at the workspace root.
    pub fn resolve_config_path(&self, raw: &str) -> Result<PathBuf> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(Error::invalid("empty path"));
        }
        let pb = PathBuf::from(raw);
        Ok(if pb.is_absolute() { pb } else { self.root.join(pb) })
    }

    pub fn resolve_under_build(&self, rel: &str) -> Result<PathBuf> {
        resolve_under(&self.root, &self.build_dir, rel)
    }

    pub fn resolve_under_out(&self, rel: &str) -> Result<PathBuf> {
        resolve_under(&self.root, &self.out_dir, rel)
    }

    pub fn toolchains_dir(&self) -> PathBuf {
        self.build_dir.join("toolchains")
    }

    pub fn downloads_dir(&self) -> PathBuf {
        self.build_dir.join("downloads")
    }
}

pub fn load_paths(cfg: &WorkspaceConfig) -> Result<WorkspacePaths> {
    let cwd = std::env::current_dir().map_err(|e| Error::msg(format!("cwd error: {e}")))?;
    let root = resolve_user_path(&cwd, &cfg.root_dir)?;
    let build_dir = resolve_user_dir(&root, &cfg.build_dir)?;
    let out_dir = resolve_user_dir(&root, &cfg.out_dir)?;
    Ok(WorkspacePaths {
        root,
        build_dir,
        out_dir,
    })
}

pub fn init_dirs(cfg: &WorkspaceConfig) -> Result<WorkspacePaths> {
    let paths = load_paths(cfg)?;

    match cfg.clean {
        CleanMode::None => {}
        CleanMode::Build => safe_remove_dir_all(&paths.root, &paths.build_dir)?,
        CleanMode::Out => safe_remove_dir_all(&paths.root, &paths.out_dir)?,
        CleanMode::All => {
            safe_remove_dir_all(&paths.root, &paths.build_dir)?;
            safe_remove_dir_all(&paths.root, &paths.out_dir)?;
        }
    }

    for dir in [&paths.build_dir, &paths.out_dir] {
        fs::create_dir_all(dir)
            .map_err(|e| Error::msg(format!("failed to create {}: {e}", dir.display())))?;
    }
    Ok(paths)
}

fn has_parent_component(p: &Path) -> bool {
    p.components().any(|c| matches!(c, Component::ParentDir))
}

fn resolve_user_dir(root: &Path, p: &str) -> Result<PathBuf> {
    let p = p.trim();
    if p.is_empty() {
        return Err(Error::invalid("empty workspace dir"));
    }
    if has_parent_component(Path::new(p)) {
        return Err(Error::invalid(format!(
            "invalid workspace dir '{}' (contains '..')",
            p
        )));
    }
    let pb = PathBuf::from(p);
    Ok(if pb.is_absolute() { pb } else { root.join(pb) })
}

fn resolve_user_path(base: &Path, p: &str) -> Result<PathBuf> {
    let p = p.trim();
    if p.is_empty() {
        return Err(Error::invalid("empty workspace path"));
    }
    let pb = PathBuf::from(p);
    Ok(if pb.is_absolute() { pb } else { base.join(pb) })
}

fn safe_remove_dir_all(root: &Path, dir: &Path) -> Result<()> {
    if !dir.exists() {
        return Ok(());
    }
    let root_can = root.canonicalize().unwrap_or_else(|_| root.to_path_buf());
    let dir_can = dir.canonicalize().unwrap_or_else(|_| dir.to_path_buf());
    if !dir_can.starts_with(&root_can) || dir_can == root_can {
        return Err(Error::invalid(format!(
            "refusing to remove '{}' (not inside workspace root '{}')",
            dir_can.display(),
            root_can.display()
        )));
    }
    fs::remove_dir_all(&dir_can)
        .map_err(|e| Error::msg(format!("failed to remove dir {}: {e}", dir_can.display())))
}

fn resolve_under(root: &Path, base: &Path, rel: &str) -> Result<PathBuf> {
    let rel = rel.trim();
    if rel.is_empty() {
        return Err(Error::invalid("empty relative path"));
    }
    let rel_pb = Path::new(rel);
    if has_parent_component(rel_pb) {
        return Err(Error::invalid(format!(
            "invalid relative path '{}' (contains '..')",
            rel
        )));
    }
    let out = if rel_pb.is_absolute() {
        rel_pb.to_path_buf()
    } else {
        base.join(rel_pb)
    };
    let root_can = root.canonicalize().unwrap_or_else(|_| root.to_path_buf());
    let out_can = out.canonicalize().unwrap_or_else(|_| out.clone());
    if !out_can.starts_with(&root_can) {
        return Err(Error::invalid(format!(
            "refusing path '{}' (outside workspace root '{}')",
            out.display(),
            root.display()
        )));
    }
    Ok(out)
}
