//! Optional feature patches applied to the kernel tree before the build.

use std::path::{Path, PathBuf};
use std::process::Command;

use serde::Deserialize;

use android_kernel_builder_macros::Module;

use crate::config::ConfigDoc;
use crate::executor::ExecCtx;
use crate::kconfig;
use crate::modules::util::{self, GitCheckout};
use crate::trust::{validate_cli_value, validate_git_url, validate_trusted_url};
use crate::{Error, Result};

pub mod bbg;
pub mod kernelsu;
pub mod lxc;
pub mod nethunter;
pub mod rekernel;

fn default_true() -> bool {
    true
}

/// `[patch]`: shared settings; each feature has its own `[patch.<name>]` table.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PatchConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Hosts trusted in addition to the built-in list.
    pub trusted_domains: Vec<String>,
}

impl Default for PatchConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            trusted_domains: Vec::new(),
        }
    }
}

/// A helper repository with a config script and an optional source patch script.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct HelperRepo {
    pub repo: Option<String>,
    pub branch: Option<String>,
    /// Config script, relative to the checkout; receives the defconfig path.
    pub script: Option<String>,
    /// Source patch script, relative to the checkout; run in the kernel tree.
    pub patch_script: Option<String>,
}

/// Kernel tree and defconfig a patch works on; both must already be known.
pub struct Target {
    pub kernel_dir: PathBuf,
    pub defconfig: PathBuf,
}

pub fn target(doc: &ConfigDoc, ctx: &ExecCtx) -> Result<Target> {
    let kernel_dir = util::kernel_dir(doc, ctx)?;
    let defconfig = ctx
        .state()
        .defconfig_path
        .ok_or_else(|| Error::msg("defconfig path is unknown; kernel.defconfig must run first"))?;
    Ok(Target {
        kernel_dir,
        defconfig,
    })
}

/// Download an allow-listed setup script into the downloads dir.
pub fn fetch_script(doc: &ConfigDoc, ctx: &ExecCtx, feature: &str, raw_url: &str) -> Result<PathBuf> {
    let url = validate_trusted_url(raw_url, &util::trusted_domains(doc)?)?;
    let dest = ctx
        .workspace_paths_or_init(doc)?
        .downloads_dir()
        .join(format!("{feature}-setup.sh"));
    ctx.log(&format!("fetching {url}"));
    ctx.download(&url, &dest)?;
    Ok(dest)
}

/// `bash <script> <args...>` with the kernel tree as working directory.
pub fn run_script(ctx: &ExecCtx, script: &Path, args: &[&str], cwd: &Path) -> Result<()> {
    for a in args {
        validate_cli_value("script argument", a)?;
    }
    let mut cmd = Command::new("bash");
    cmd.arg(script).args(args).current_dir(cwd);
    ctx.run_cmd(cmd)
}

fn helper_path(checkout: &Path, rel: &str) -> Result<PathBuf> {
    util::ensure_relative(rel)?;
    let p = checkout.join(rel);
    if !p.is_file() {
        return Err(Error::invalid(format!(
            "helper script {} does not exist",
            p.display()
        )));
    }
    Ok(p)
}

/// Clone `helper` (when configured) and run its config script against the
/// defconfig, then its patch script when `apply_patch` is set.
pub fn run_helper(
    doc: &ConfigDoc,
    ctx: &ExecCtx,
    feature: &str,
    helper: &HelperRepo,
    apply_patch: bool,
    target: &Target,
) -> Result<()> {
    let Some(repo) = helper.repo.as_deref().filter(|r| !r.trim().is_empty()) else {
        if apply_patch {
            return Err(Error::config(format!(
                "patch.{feature}.patch = true needs patch.{feature}.repo"
            )));
        }
        return Ok(());
    };
    validate_git_url(repo, &util::trusted_domains(doc)?)?;
    let checkout = ctx
        .workspace_paths_or_init(doc)?
        .build_dir
        .join("helpers")
        .join(feature);
    util::git_clone(
        ctx,
        &GitCheckout {
            url: repo,
            branch: helper.branch.as_deref(),
            depth: 1,
            submodules: false,
        },
        &checkout,
    )?;

    if let Some(script) = helper.script.as_deref() {
        let script = helper_path(&checkout, script)?;
        let mut cmd = Command::new("bash");
        cmd.arg(&script)
            .arg(&target.defconfig)
            .current_dir(&target.kernel_dir);
        ctx.run_cmd(cmd)?;
    }
    if apply_patch {
        let Some(script) = helper.patch_script.as_deref() else {
            return Err(Error::config(format!(
                "patch.{feature}.patch = true needs patch.{feature}.patch_script"
            )));
        };
        let script = helper_path(&checkout, script)?;
        run_script(ctx, &script, &[], &target.kernel_dir)?;
    }
    Ok(())
}

/// Apply `f` to the defconfig and log whether it changed.
pub fn edit_defconfig(
    ctx: &ExecCtx,
    target: &Target,
    f: impl FnOnce(&mut String) -> Result<()>,
) -> Result<()> {
    let changed = kconfig::edit_file(&target.defconfig, f)?;
    ctx.log(&format!(
        "{} {}",
        if changed { "updated" } else { "unchanged" },
        target.defconfig.display()
    ));
    Ok(())
}

pub fn set_all(cfg: &mut String, symbols: &[&str]) {
    for s in symbols {
        kconfig::set_kv(cfg, s, "y");
    }
}

#[Module(
    id = "patch",
    config = PatchConfig,
    tasks = [
        kernelsu::KernelSuTask,
        nethunter::NetHunterTask,
        lxc::LxcTask,
        bbg::BbgTask,
        rekernel::ReKernelTask
    ]
)]
pub struct PatchModule;
