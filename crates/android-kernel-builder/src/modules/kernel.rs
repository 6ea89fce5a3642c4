use serde::Deserialize;

use android_kernel_builder_macros::{Module, Task};

use crate::config::ConfigDoc;
use crate::executor::ExecCtx;
use crate::kconfig;
use crate::modules::util::{self, GitCheckout};
use crate::settings::KernelConfig;
use crate::{Error, Result};

fn default_true() -> bool {
    true
}

pub fn has_vendor(doc: &ConfigDoc) -> bool {
    doc.str_path("kernel.vendor.url").is_some()
}

#[Task(
    id = "kernel.clone",
    module = "kernel",
    phase = "fetch",
    provides = ["kernel:source"],
    after = ["core.init"],
    default_label = "Clone kernel source",
    required = true
)]
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CloneTask {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub label: Option<String>,
}

impl Default for CloneTask {
    fn default() -> Self {
        Self {
            enabled: true,
            label: None,
        }
    }
}

impl CloneTask {
    pub fn run(_cfg: &Self, doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()> {
        let k = util::kernel_config(doc)?;
        let dest = util::kernel_dir(doc, ctx)?;

        // No url: build an existing tree, e.g. one checked out by the workflow.
        if k.url.trim().is_empty() {
            if dest.join("Makefile").is_file() {
                ctx.log(&format!("kernel.url not set, using {}", dest.display()));
                return Ok(());
            }
            return Err(Error::invalid(format!(
                "kernel.url is not set and {} has no kernel tree",
                dest.display()
            )));
        }

        util::git_clone(
            ctx,
            &GitCheckout {
                url: &k.url,
                branch: k.branch.as_deref(),
                depth: k.depth,
                submodules: k.submodules,
            },
            &dest,
        )?;
        Ok(())
    }
}

#[Task(
    id = "kernel.vendor",
    module = "kernel",
    phase = "fetch",
    provides = ["kernel:vendor"],
    after = ["kernel:source"],
    default_label = "Merge vendor tree",
    when = has_vendor
)]
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct VendorTask {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub label: Option<String>,
}

impl Default for VendorTask {
    fn default() -> Self {
        Self {
            enabled: true,
            label: None,
        }
    }
}

impl VendorTask {
    pub fn run(_cfg: &Self, doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()> {
        let k = util::kernel_config(doc)?;
        let Some(vendor) = k.vendor.as_ref() else {
            return Err(Error::config("[kernel.vendor] is not configured"));
        };
        let ws = ctx.workspace_paths_or_init(doc)?;
        let vendor_dir = ws.resolve_under_build(&vendor.dir)?;
        let kernel_dir = ws.resolve_under_build(&k.dir)?;
        if vendor_dir == kernel_dir {
            return Err(Error::invalid(
                "kernel.vendor.dir must differ from kernel.dir",
            ));
        }

        util::git_clone(
            ctx,
            &GitCheckout {
                url: &vendor.url,
                branch: vendor.branch.as_deref(),
                depth: vendor.depth,
                submodules: false,
            },
            &vendor_dir,
        )?;

        let n = util::copy_tree(&vendor_dir, &kernel_dir, &[".git"])?;
        ctx.log(&format!(
            "merged {n} files from {} into {}",
            vendor_dir.display(),
            kernel_dir.display()
        ));
        Ok(())
    }
}

#[Task(
    id = "kernel.version",
    module = "kernel",
    phase = "inspect",
    provides = ["kernel:version"],
    after = ["kernel:source", "kernel:vendor?"],
    default_label = "Detect kernel version"
)]
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct VersionTask {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub label: Option<String>,
}

impl Default for VersionTask {
    fn default() -> Self {
        Self {
            enabled: true,
            label: None,
        }
    }
}

impl VersionTask {
    pub fn run(_cfg: &Self, doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()> {
        let dir = util::kernel_dir(doc, ctx)?;
        let (version, extra) = kconfig::read_kernel_version(&dir)?;
        ctx.log(&format!(
            "kernel version {version}{extra}{}",
            if version.is_gki() { " (GKI)" } else { "" }
        ));
        tracing::info!(version = %version, gki = version.is_gki(), "detected kernel version");
        ctx.update_state(|s| s.kernel_version = Some(version));
        Ok(())
    }
}

#[Task(
    id = "kernel.defconfig",
    module = "kernel",
    phase = "inspect",
    provides = ["kernel:defconfig"],
    after = ["kernel:source", "kernel:vendor?", "kernel:version?"],
    default_label = "Locate defconfig",
    required = true
)]
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DefconfigTask {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub label: Option<String>,
}

impl Default for DefconfigTask {
    fn default() -> Self {
        Self {
            enabled: true,
            label: None,
        }
    }
}

impl DefconfigTask {
    pub fn run(_cfg: &Self, doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()> {
        let build = util::build_config(doc)?;
        let dir = util::kernel_dir(doc, ctx)?;
        let path = kconfig::resolve_defconfig(&dir, &build.arch, &build.defconfig)?;
        ctx.log(&format!("defconfig: {}", path.display()));
        ctx.update_state(|s| s.defconfig_path = Some(path));
        Ok(())
    }
}

#[Module(
    id = "kernel",
    config = KernelConfig,
    tasks = [CloneTask, VendorTask, VersionTask, DefconfigTask]
)]
pub struct KernelModule;
