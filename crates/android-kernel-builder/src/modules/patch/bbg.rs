use serde::Deserialize;

use android_kernel_builder_macros::Task;

use crate::config::ConfigDoc;
use crate::executor::ExecCtx;
use crate::kconfig;
use crate::modules::patch;
use crate::Result;

fn default_true() -> bool {
    true
}

const DEFAULT_SETUP: &str =
    "https://raw.githubusercontent.com/vc-teahouse/Baseband-guard/main/setup.sh";

/// `[patch.bbg]`: Baseband-guard LSM.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BbgConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub setup_url: String,
}

impl Default for BbgConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            setup_url: DEFAULT_SETUP.into(),
        }
    }
}

pub fn enabled(doc: &ConfigDoc) -> bool {
    doc.flag("patch.bbg")
}

/// Enable the LSM and register it in `CONFIG_LSM` when the defconfig sets one.
pub fn apply_kconfig(defconfig: &mut String) -> bool {
    kconfig::set_kv(defconfig, "CONFIG_BBG", "y");
    kconfig::append_list_item(defconfig, "CONFIG_LSM", "baseband_guard")
}

#[Task(
    id = "patch.bbg",
    module = "patch",
    phase = "patch",
    provides = ["patch:bbg"],
    after = ["kernel:defconfig"],
    default_label = "Integrate Baseband-guard",
    when = enabled
)]
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BbgTask {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub label: Option<String>,
}

impl Default for BbgTask {
    fn default() -> Self {
        Self {
            enabled: true,
            label: None,
        }
    }
}

impl BbgTask {
    pub fn run(_cfg: &Self, doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()> {
        let cfg: BbgConfig = doc.deserialize_path("patch.bbg")?.unwrap_or_default();
        let t = patch::target(doc, ctx)?;
        let script = patch::fetch_script(doc, ctx, "bbg", &cfg.setup_url)?;
        patch::run_script(ctx, &script, &[], &t.kernel_dir)?;
        patch::edit_defconfig(ctx, &t, |c| {
            if !apply_kconfig(c) {
                ctx.log("CONFIG_LSM not set in defconfig; relying on the kernel default");
            }
            Ok(())
        })
    }
}
