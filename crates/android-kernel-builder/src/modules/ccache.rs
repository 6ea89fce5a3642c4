use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use serde::Deserialize;

use android_kernel_builder_macros::{Module, Task};

use crate::config::ConfigDoc;
use crate::executor::ExecCtx;
use crate::modules::util;
use crate::workspace::WorkspacePaths;
use crate::{Error, Result};

fn default_true() -> bool {
    true
}

/// `[ccache]`: compiler cache kept between CI runs as a tarball.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CcacheConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// `CCACHE_DIR`, relative to the build dir.
    pub dir: String,
    /// Where archives are kept, relative to the workspace root. Point the CI
    /// cache action at this directory.
    pub store_dir: String,
    pub max_size: Option<String>,
}

impl Default for CcacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dir: "ccache".into(),
            store_dir: ".ccache-store".into(),
            max_size: None,
        }
    }
}

impl CcacheConfig {
    pub fn resolve_dir(&self, ws: &WorkspacePaths) -> Result<PathBuf> {
        ws.resolve_under_build(&self.dir)
    }

    pub fn resolve_store(&self, ws: &WorkspacePaths) -> Result<PathBuf> {
        util::ensure_relative(&self.store_dir)?;
        Ok(ws.root.join(self.store_dir.trim()))
    }
}

/// Archive key: anything that invalidates object files changes the key.
pub fn cache_key(doc: &ConfigDoc) -> String {
    let s = |p: &str| doc.str_path(p).unwrap_or_default().to_string();
    let toolchain = doc
        .value_path("toolchain")
        .map(|v| v.to_string())
        .unwrap_or_default();
    util::sha256_hex(&[
        &s("kernel.url"),
        &s("kernel.branch"),
        &s("build.arch"),
        &s("build.defconfig"),
        &toolchain,
    ])
}

fn archive_path(doc: &ConfigDoc, ctx: &ExecCtx, cfg: &CcacheConfig) -> Result<PathBuf> {
    let ws = ctx.workspace_paths_or_init(doc)?;
    Ok(cfg
        .resolve_store(&ws)?
        .join(format!("{}.tar.gz", cache_key(doc))))
}

fn ccache_command(dir: &Path) -> Command {
    let mut cmd = Command::new("ccache");
    cmd.env("CCACHE_DIR", dir);
    cmd
}

#[Task(
    id = "ccache.restore",
    module = "ccache",
    phase = "cache",
    provides = ["ccache:restored"],
    after = ["core.init", "toolchain:ready?"],
    default_label = "Restore ccache",
    best_effort = true
)]
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RestoreTask {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub label: Option<String>,
}

impl Default for RestoreTask {
    fn default() -> Self {
        Self {
            enabled: true,
            label: None,
        }
    }
}

impl RestoreTask {
    pub fn run(_cfg: &Self, doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()> {
        let cfg: CcacheConfig = doc.deserialize_path("ccache")?.unwrap_or_default();
        let ws = ctx.workspace_paths_or_init(doc)?;
        let dir = cfg.resolve_dir(&ws)?;
        util::ensure_dir(&dir)?;

        let archive = archive_path(doc, ctx, &cfg)?;
        if archive.is_file() {
            ctx.log(&format!("restoring {}", archive.display()));
            let mut tar = Command::new("tar");
            tar.arg("-xzf").arg(&archive).arg("-C").arg(&dir);
            ctx.run_cmd(tar)?;
        } else {
            ctx.log(&format!("no cache archive at {}", archive.display()));
        }

        if let Some(size) = cfg.max_size.as_deref().filter(|s| !s.trim().is_empty()) {
            let mut cmd = ccache_command(&dir);
            cmd.arg("--max-size").arg(size.trim());
            ctx.run_cmd(cmd)?;
        }
        let mut zero = ccache_command(&dir);
        zero.arg("--zero-stats");
        ctx.run_cmd(zero)
    }
}

#[Task(
    id = "ccache.save",
    module = "ccache",
    phase = "cache",
    provides = ["ccache:saved"],
    after = ["kernel:image"],
    default_label = "Save ccache",
    best_effort = true
)]
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SaveTask {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub label: Option<String>,
}

impl Default for SaveTask {
    fn default() -> Self {
        Self {
            enabled: true,
            label: None,
        }
    }
}

impl SaveTask {
    pub fn run(_cfg: &Self, doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()> {
        let cfg: CcacheConfig = doc.deserialize_path("ccache")?.unwrap_or_default();
        let ws = ctx.workspace_paths_or_init(doc)?;
        let dir = cfg.resolve_dir(&ws)?;
        if !dir.is_dir() {
            return Err(Error::msg(format!("ccache dir {} is missing", dir.display())));
        }

        let mut stats = ccache_command(&dir);
        stats.arg("--show-stats");
        ctx.run_cmd(stats)?;

        let archive = archive_path(doc, ctx, &cfg)?;
        let Some(store) = archive.parent() else {
            return Err(Error::msg(format!("bad archive path {}", archive.display())));
        };
        util::ensure_dir(store)?;
        let tmp = archive.with_extension("tmp");
        let mut tar = Command::new("tar");
        tar.arg("-czf").arg(&tmp).arg("-C").arg(&dir).arg(".");
        ctx.run_cmd(tar)?;
        if tmp.exists() {
            fs::rename(&tmp, &archive).map_err(|e| {
                Error::msg(format!("failed to move {} into place: {e}", tmp.display()))
            })?;
        }
        ctx.log(&format!("saved {}", archive.display()));
        Ok(())
    }
}

#[Module(
    id = "ccache",
    config = CcacheConfig,
    tasks = [RestoreTask, SaveTask]
)]
pub struct CcacheModule;
