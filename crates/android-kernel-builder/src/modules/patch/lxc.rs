use serde::Deserialize;

use android_kernel_builder_macros::Task;

use crate::config::ConfigDoc;
use crate::executor::ExecCtx;
use crate::modules::patch::{self, HelperRepo};
use crate::Result;

fn default_true() -> bool {
    true
}

/// Namespaces, cgroups and networking needed by LXC and Docker.
pub const SYMBOLS: &[&str] = &[
    "CONFIG_NAMESPACES",
    "CONFIG_UTS_NS",
    "CONFIG_IPC_NS",
    "CONFIG_PID_NS",
    "CONFIG_NET_NS",
    "CONFIG_USER_NS",
    "CONFIG_CGROUPS",
    "CONFIG_CGROUP_DEVICE",
    "CONFIG_CGROUP_FREEZER",
    "CONFIG_CGROUP_PIDS",
    "CONFIG_CPUSETS",
    "CONFIG_MEMCG",
    "CONFIG_POSIX_MQUEUE",
    "CONFIG_VETH",
    "CONFIG_BRIDGE",
    "CONFIG_BRIDGE_NETFILTER",
    "CONFIG_NF_NAT",
    "CONFIG_IP_NF_NAT",
    "CONFIG_NETFILTER_XT_MATCH_ADDRTYPE",
    "CONFIG_NETFILTER_XT_MATCH_CONNTRACK",
    "CONFIG_OVERLAY_FS",
];

/// `[patch.lxc]`
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LxcConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(flatten)]
    pub helper: HelperRepo,
    /// Run the helper's cgroup patch script.
    pub patch: bool,
}

impl Default for LxcConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            helper: HelperRepo::default(),
            patch: false,
        }
    }
}

pub fn enabled(doc: &ConfigDoc) -> bool {
    doc.flag("patch.lxc")
}

#[Task(
    id = "patch.lxc",
    module = "patch",
    phase = "patch",
    provides = ["patch:lxc"],
    after = ["kernel:defconfig"],
    default_label = "Enable LXC/Docker support",
    when = enabled
)]
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LxcTask {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub label: Option<String>,
}

impl Default for LxcTask {
    fn default() -> Self {
        Self {
            enabled: true,
            label: None,
        }
    }
}

impl LxcTask {
    pub fn run(_cfg: &Self, doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()> {
        let cfg: LxcConfig = doc.deserialize_path("patch.lxc")?.unwrap_or_default();
        let t = patch::target(doc, ctx)?;
        patch::run_helper(doc, ctx, "lxc", &cfg.helper, cfg.patch, &t)?;
        patch::edit_defconfig(ctx, &t, |c| {
            patch::set_all(c, SYMBOLS);
            Ok(())
        })
    }
}
