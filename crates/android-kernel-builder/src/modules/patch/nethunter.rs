use serde::Deserialize;

use android_kernel_builder_macros::Task;

use crate::config::ConfigDoc;
use crate::executor::ExecCtx;
use crate::modules::patch::{self, HelperRepo};
use crate::Result;

fn default_true() -> bool {
    true
}

/// USB gadget, HID and wireless injection support.
pub const SYMBOLS: &[&str] = &[
    "CONFIG_USB_CONFIGFS",
    "CONFIG_USB_CONFIGFS_F_HID",
    "CONFIG_USB_CONFIGFS_RNDIS",
    "CONFIG_USB_CONFIGFS_ACM",
    "CONFIG_USB_CONFIGFS_MASS_STORAGE",
    "CONFIG_USB_G_ANDROID",
    "CONFIG_CFG80211_WEXT",
    "CONFIG_MAC80211",
    "CONFIG_MAC80211_MESH",
    "CONFIG_BT",
    "CONFIG_BT_HCIBTUSB",
    "CONFIG_USB_NET_DRIVERS",
    "CONFIG_USB_RTL8152",
];

/// `[patch.nethunter]`
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NetHunterConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(flatten)]
    pub helper: HelperRepo,
    /// Also run the helper's source patch script.
    pub patch: bool,
}

impl Default for NetHunterConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            helper: HelperRepo::default(),
            patch: false,
        }
    }
}

pub fn enabled(doc: &ConfigDoc) -> bool {
    doc.flag("patch.nethunter")
}

#[Task(
    id = "patch.nethunter",
    module = "patch",
    phase = "patch",
    provides = ["patch:nethunter"],
    after = ["kernel:defconfig"],
    default_label = "Enable NetHunter support",
    when = enabled
)]
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NetHunterTask {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub label: Option<String>,
}

impl Default for NetHunterTask {
    fn default() -> Self {
        Self {
            enabled: true,
            label: None,
        }
    }
}

impl NetHunterTask {
    pub fn run(_cfg: &Self, doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()> {
        let cfg: NetHunterConfig = doc.deserialize_path("patch.nethunter")?.unwrap_or_default();
        let t = patch::target(doc, ctx)?;
        patch::run_helper(doc, ctx, "nethunter", &cfg.helper, cfg.patch, &t)?;
        patch::edit_defconfig(ctx, &t, |c| {
            patch::set_all(c, SYMBOLS);
            Ok(())
        })
    }
}
