use serde::Deserialize;

use android_kernel_builder_macros::Task;

use crate::config::ConfigDoc;
use crate::executor::ExecCtx;
use crate::kconfig;
use crate::modules::patch;
use crate::{Error, Result};

fn default_true() -> bool {
    true
}

/// `[patch.rekernel]`
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReKernelConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub setup_url: Option<String>,
}

impl Default for ReKernelConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            setup_url: None,
        }
    }
}

pub fn enabled(doc: &ConfigDoc) -> bool {
    doc.flag("patch.rekernel")
}

#[Task(
    id = "patch.rekernel",
    module = "patch",
    phase = "patch",
    provides = ["patch:rekernel"],
    after = ["kernel:defconfig"],
    default_label = "Integrate Re-Kernel",
    when = enabled
)]
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReKernelTask {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub label: Option<String>,
}

impl Default for ReKernelTask {
    fn default() -> Self {
        Self {
            enabled: true,
            label: None,
        }
    }
}

impl ReKernelTask {
    pub fn run(_cfg: &Self, doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()> {
        let cfg: ReKernelConfig = doc.deserialize_path("patch.rekernel")?.unwrap_or_default();
        let Some(url) = cfg.setup_url.as_deref().filter(|s| !s.trim().is_empty()) else {
            return Err(Error::config("patch.rekernel.setup_url is required"));
        };
        let t = patch::target(doc, ctx)?;
        let script = patch::fetch_script(doc, ctx, "rekernel", url)?;
        patch::run_script(ctx, &script, &[], &t.kernel_dir)?;
        patch::edit_defconfig(ctx, &t, |c| {
            kconfig::set_kv(c, "CONFIG_REKERNEL", "y");
            Ok(())
        })
    }
}
