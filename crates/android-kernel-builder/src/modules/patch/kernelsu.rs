use std::path::{Path, PathBuf};
use std::process::Command;

use serde::Deserialize;

use android_kernel_builder_macros::Task;

use crate::config::ConfigDoc;
use crate::executor::ExecCtx;
use crate::kconfig;
use crate::modules::patch::{self, Target};
use crate::modules::util::{self, GitCheckout};
use crate::settings::KernelVersion;
use crate::trust::{validate_cli_value, validate_git_url};
use crate::{Error, Result};

fn default_true() -> bool {
    true
}

const OFFICIAL_SETUP: &str = "https://raw.githubusercontent.com/tiann/KernelSU/main/kernel/setup.sh";
const NEXT_SETUP: &str =
    "https://raw.githubusercontent.com/KernelSU-Next/KernelSU-Next/next/kernel/setup.sh";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Variant {
    #[default]
    Official,
    Next,
    Custom,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Hook {
    #[default]
    Kprobes,
    Manual,
}

/// `[patch.kernelsu]`
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct KernelSuConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Tag or branch handed to `setup.sh`.
    pub version: Option<String>,
    pub variant: Variant,
    /// Setup script for the custom variant.
    pub setup_url: Option<String>,
    /// Build KernelSU as a loadable module (GKI only).
    pub lkm: bool,
    pub hook: Hook,
    /// Semantic patches for manual hooks, relative to the workspace root.
    pub cocci_dir: Option<String>,
    pub cocci_repo: Option<String>,
    pub cocci_branch: Option<String>,
}

impl Default for KernelSuConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            version: None,
            variant: Variant::Official,
            setup_url: None,
            lkm: false,
            hook: Hook::Kprobes,
            cocci_dir: None,
            cocci_repo: None,
            cocci_branch: None,
        }
    }
}

impl KernelSuConfig {
    pub fn setup_url(&self) -> Result<&str> {
        match self.variant {
            Variant::Official => Ok(OFFICIAL_SETUP),
            Variant::Next => Ok(NEXT_SETUP),
            Variant::Custom => self
                .setup_url
                .as_deref()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .ok_or_else(|| Error::config("patch.kernelsu.variant = \"custom\" needs setup_url")),
        }
    }

    /// Module builds only work on GKI kernels.
    pub fn check_lkm(&self, version: Option<KernelVersion>) -> Result<()> {
        if !self.lkm {
            return Ok(());
        }
        match version {
            Some(v) if v.is_gki() => Ok(()),
            Some(v) => Err(Error::invalid(format!(
                "KernelSU LKM mode needs a GKI kernel (5.10+), this is {v}"
            ))),
            None => Err(Error::invalid(
                "KernelSU LKM mode needs the kernel version; kernel.version did not run",
            )),
        }
    }

    pub fn apply_kconfig(&self, defconfig: &mut String) {
        kconfig::set_kv(defconfig, "CONFIG_KSU", if self.lkm { "m" } else { "y" });
        if self.hook == Hook::Kprobes {
            patch::set_all(
                defconfig,
                &["CONFIG_KPROBES", "CONFIG_HAVE_KPROBES", "CONFIG_KPROBE_EVENTS"],
            );
        }
    }
}

pub fn enabled(doc: &ConfigDoc) -> bool {
    doc.flag("patch.kernelsu")
}

fn cocci_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    for entry in walkdir::WalkDir::new(dir).sort_by_file_name() {
        let entry = entry.map_err(|e| Error::msg(format!("walkdir error: {e}")))?;
        if entry.file_type().is_file()
            && entry.path().extension().is_some_and(|e| e == "cocci")
        {
            out.push(entry.into_path());
        }
    }
    Ok(out)
}

fn cocci_source(doc: &ConfigDoc, ctx: &ExecCtx, cfg: &KernelSuConfig) -> Result<PathBuf> {
    let ws = ctx.workspace_paths_or_init(doc)?;
    if let Some(dir) = cfg.cocci_dir.as_deref().filter(|s| !s.trim().is_empty()) {
        return ws.resolve_config_path(dir);
    }
    let Some(repo) = cfg.cocci_repo.as_deref().filter(|s| !s.trim().is_empty()) else {
        return Err(Error::config(
            "patch.kernelsu.hook = \"manual\" needs cocci_dir or cocci_repo",
        ));
    };
    validate_git_url(repo, &util::trusted_domains(doc)?)?;
    let dest = ws.build_dir.join("helpers").join("kernelsu-cocci");
    util::git_clone(
        ctx,
        &GitCheckout {
            url: repo,
            branch: cfg.cocci_branch.as_deref(),
            depth: 1,
            submodules: false,
        },
        &dest,
    )?;
    Ok(dest)
}

fn apply_manual_hooks(doc: &ConfigDoc, ctx: &ExecCtx, cfg: &KernelSuConfig, t: &Target) -> Result<()> {
    let dir = cocci_source(doc, ctx, cfg)?;
    let files = cocci_files(&dir)?;
    if files.is_empty() {
        return Err(Error::invalid(format!(
            "no .cocci files under {}",
            dir.display()
        )));
    }
    for f in &files {
        ctx.log(&format!("spatch {}", f.display()));
        let mut cmd = Command::new("spatch");
        cmd.arg("--sp-file")
            .arg(f)
            .arg("--dir")
            .arg(&t.kernel_dir)
            .arg("--in-place")
            .arg("--linux-spacing");
        ctx.run_cmd(cmd)?;
    }
    Ok(())
}

#[Task(
    id = "patch.kernelsu",
    module = "patch",
    phase = "patch",
    provides = ["patch:kernelsu"],
    after = ["kernel:defconfig"],
    default_label = "Integrate KernelSU",
    when = enabled
)]
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct KernelSuTask {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub label: Option<String>,
}

impl Default for KernelSuTask {
    fn default() -> Self {
        Self {
            enabled: true,
            label: None,
        }
    }
}

impl KernelSuTask {
    pub fn run(_cfg: &Self, doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()> {
        let cfg: KernelSuConfig = doc.deserialize_path("patch.kernelsu")?.unwrap_or_default();
        cfg.check_lkm(ctx.state().kernel_version)?;
        let setup = cfg.setup_url()?;
        let version = cfg.version.as_deref().map(str::trim).filter(|s| !s.is_empty());
        if let Some(v) = version {
            validate_cli_value("patch.kernelsu.version", v)?;
        }
        let t = patch::target(doc, ctx)?;

        let script = patch::fetch_script(doc, ctx, "kernelsu", setup)?;
        let args: Vec<&str> = version.into_iter().collect();
        patch::run_script(ctx, &script, &args, &t.kernel_dir)?;

        if cfg.hook == Hook::Manual {
            apply_manual_hooks(doc, ctx, &cfg, &t)?;
        }
        patch::edit_defconfig(ctx, &t, |c| {
            cfg.apply_kconfig(c);
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(major: u32, minor: u32) -> KernelVersion {
        KernelVersion {
            major,
            minor,
            sub: 0,
        }
    }

    #[test]
    fn lkm_requires_gki() {
        let cfg = KernelSuConfig {
            lkm: true,
            ..KernelSuConfig::default()
        };
        assert!(cfg.check_lkm(Some(v(5, 10))).is_ok());
        let err = cfg.check_lkm(Some(v(4, 19))).unwrap_err();
        assert!(err.is_invalid());
        assert!(err.to_string().contains("4.19.0"));
        assert!(KernelSuConfig::default().check_lkm(Some(v(4, 14))).is_ok());
    }

    #[test]
    fn kprobes_hook_enables_kprobes() {
        let mut c = "# CONFIG_KPROBES is not set\n".to_string();
        KernelSuConfig::default().apply_kconfig(&mut c);
        assert_eq!(kconfig::get_kv(&c, "CONFIG_KSU"), Some("y"));
        assert_eq!(kconfig::get_kv(&c, "CONFIG_KPROBES"), Some("y"));
        assert_eq!(kconfig::get_kv(&c, "CONFIG_KPROBE_EVENTS"), Some("y"));
    }

    #[test]
    fn manual_lkm_only_sets_module() {
        let cfg = KernelSuConfig {
            lkm: true,
            hook: Hook::Manual,
            ..KernelSuConfig::default()
        };
        let mut c = String::new();
        cfg.apply_kconfig(&mut c);
        assert_eq!(c, "CONFIG_KSU=m\n");
    }

    #[test]
    fn variant_picks_setup_script() {
        let cfg: KernelSuConfig = toml::from_str("variant = \"next\"").expect("parse");
        assert!(cfg.setup_url().expect("url").contains("KernelSU-Next"));
        let custom: KernelSuConfig = toml::from_str("variant = \"custom\"").expect("parse");
        assert!(custom.setup_url().is_err());
    }

    #[test]
    fn cocci_files_are_sorted() {
        let tmp = tempfile::tempdir().expect("tempdir");
        std::fs::write(tmp.path().join("b.cocci"), "").expect("b");
        std::fs::write(tmp.path().join("a.cocci"), "").expect("a");
        std::fs::write(tmp.path().join("README.md"), "").expect("readme");
        let files = cocci_files(tmp.path()).expect("list");
        let names: Vec<_> = files
            .iter()
            .filter_map(|p| p.file_name()?.to_str())
            .collect();
        assert_eq!(names, vec!["a.cocci", "b.cocci"]);
    }
}
