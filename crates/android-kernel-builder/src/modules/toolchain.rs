use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use android_kernel_builder_macros::{Module, Task};

use crate::config::ConfigDoc;
use crate::executor::ExecCtx;
use crate::modules::util::{self, GitCheckout};
use crate::settings::ToolchainPaths;
use crate::toolchain::{self as tc, ArchiveKind};
use crate::trust::{validate_cli_value, validate_trusted_url};
use crate::{Error, Result};

fn default_true() -> bool {
    true
}

const AOSP_CLANG_BASE: &str =
    "https://android.googlesource.com/platform/prebuilts/clang/host/linux-x86/+archive/refs/heads";
const AOSP_GCC_BASE: &str = "https://android.googlesource.com/platform/prebuilts/gcc/linux-x86";
const AOSP_GCC_TAG: &str = "android-12.1.0_r27";

/// `[toolchain]`: which compilers to provision.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ToolchainConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// AOSP prebuilt clang for `android_version` / `clang_version`.
    pub aosp_clang: bool,
    #[serde(deserialize_with = "crate::config::string_or_int")]
    pub android_version: String,
    pub clang_version: String,
    /// AOSP GCC 4.9 for aarch64 and arm.
    pub aosp_gcc: bool,
    pub clang_url: Option<String>,
    pub clang_branch: Option<String>,
    pub gcc64_url: Option<String>,
    pub gcc64_branch: Option<String>,
    pub gcc32_url: Option<String>,
    pub gcc32_branch: Option<String>,
    /// Toolchains already present on the runner.
    pub clang_path: Option<String>,
    pub gcc64_path: Option<String>,
    pub gcc32_path: Option<String>,
}

impl Default for ToolchainConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            aosp_clang: false,
            android_version: "12".into(),
            clang_version: "r416183b".into(),
            aosp_gcc: false,
            clang_url: None,
            clang_branch: None,
            gcc64_url: None,
            gcc64_branch: None,
            gcc32_url: None,
            gcc32_branch: None,
            clang_path: None,
            gcc64_path: None,
            gcc32_path: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolchainSource {
    Archive(String),
    Git { url: String, branch: Option<String> },
    Local(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    Clang,
    Gcc64,
    Gcc32,
}

impl Slot {
    pub fn dir_name(self) -> &'static str {
        match self {
            Slot::Clang => "clang",
            Slot::Gcc64 => "gcc64",
            Slot::Gcc32 => "gcc32",
        }
    }
}

fn pick(
    url: &Option<String>,
    branch: &Option<String>,
    local: &Option<String>,
) -> Option<ToolchainSource> {
    let nonempty = |s: &Option<String>| {
        s.as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    };
    if let Some(p) = nonempty(local) {
        return Some(ToolchainSource::Local(p));
    }
    let url = nonempty(url)?;
    let branch = nonempty(branch);
    Some(if tc::is_git_source(&url, branch.as_deref()) {
        ToolchainSource::Git { url, branch }
    } else {
        ToolchainSource::Archive(url)
    })
}

impl ToolchainConfig {
    /// Resolve the configured selections into one source per slot. Explicit urls
    /// and paths win over the AOSP shortcuts.
    pub fn sources(&self) -> Result<Vec<(Slot, ToolchainSource)>> {
        let mut out = Vec::new();

        let clang = pick(&self.clang_url, &self.clang_branch, &self.clang_path).or_else(|| {
            self.aosp_clang.then(|| {
                ToolchainSource::Archive(format!(
                    "{AOSP_CLANG_BASE}/android{}-release/clang-{}.tar.gz",
                    self.android_version.trim(),
                    self.clang_version.trim()
                ))
            })
        });
        if self.aosp_clang {
            validate_cli_value("toolchain.android_version", &self.android_version)?;
            validate_cli_value("toolchain.clang_version", &self.clang_version)?;
            for (what, v) in [
                ("toolchain.android_version", &self.android_version),
                ("toolchain.clang_version", &self.clang_version),
            ] {
                if v.contains('/') || v.contains("..") {
                    return Err(Error::invalid(format!("{what} '{v}' is not a plain version")));
                }
            }
        }
        if let Some(s) = clang {
            out.push((Slot::Clang, s));
        }

        let gcc64 = pick(&self.gcc64_url, &self.gcc64_branch, &self.gcc64_path).or_else(|| {
            self.aosp_gcc.then(|| {
                ToolchainSource::Archive(format!(
                    "{AOSP_GCC_BASE}/aarch64/aarch64-linux-android-4.9/+archive/refs/tags/{AOSP_GCC_TAG}.tar.gz"
                ))
            })
        });
        if let Some(s) = gcc64 {
            out.push((Slot::Gcc64, s));
        }

        let gcc32 = pick(&self.gcc32_url, &self.gcc32_branch, &self.gcc32_path).or_else(|| {
            self.aosp_gcc.then(|| {
                ToolchainSource::Archive(format!(
                    "{AOSP_GCC_BASE}/arm/arm-linux-androideabi-4.9/+archive/refs/tags/{AOSP_GCC_TAG}.tar.gz"
                ))
            })
        });
        if let Some(s) = gcc32 {
            out.push((Slot::Gcc32, s));
        }
        Ok(out)
    }
}

fn archive_file_name(url: &reqwest::Url) -> String {
    url.path_segments()
        .and_then(|mut s| s.next_back())
        .filter(|s| !s.is_empty())
        .unwrap_or("toolchain.tar.gz")
        .to_string()
}

/// Fetch one toolchain into `dest` (or point at a local one) and return its root.
fn provision_one(
    doc: &ConfigDoc,
    ctx: &ExecCtx,
    slot: Slot,
    source: &ToolchainSource,
    dest: &Path,
) -> Result<PathBuf> {
    let extra = util::trusted_domains(doc)?;
    match source {
        ToolchainSource::Local(raw) => {
            let ws = ctx.workspace_paths_or_init(doc)?;
            let root = ws.resolve_config_path(raw)?;
            if !root.is_dir() {
                return Err(Error::invalid(format!(
                    "{} toolchain path {} does not exist",
                    slot.dir_name(),
                    root.display()
                )));
            }
            ctx.log(&format!("{}: using {}", slot.dir_name(), root.display()));
            return Ok(root);
        }
        _ if dest.join("bin").is_dir() => {
            ctx.log(&format!("{}: reusing {}", slot.dir_name(), dest.display()));
            return Ok(dest.to_path_buf());
        }
        ToolchainSource::Git { url, branch } => {
            validate_trusted_url(url, &extra)?;
            util::git_clone(
                ctx,
                &GitCheckout {
                    url,
                    branch: branch.as_deref(),
                    depth: 1,
                    submodules: false,
                },
                dest,
            )?;
        }
        ToolchainSource::Archive(raw) => {
            let url = validate_trusted_url(raw, &extra)?;
            let name = archive_file_name(&url);
            let kind = ArchiveKind::from_name(&name).ok_or_else(|| {
                Error::invalid(format!("cannot tell the archive format of '{name}'"))
            })?;
            let ws = ctx.workspace_paths_or_init(doc)?;
            let archive = ws
                .downloads_dir()
                .join(format!("{}-{name}", slot.dir_name()));
            if archive.is_file() {
                ctx.log(&format!("using cached {}", archive.display()));
            } else {
                ctx.log(&format!("downloading {url}"));
                let n = ctx.download(&url, &archive)?;
                ctx.log(&format!("downloaded {n} bytes"));
            }
            if dest.exists() {
                fs::remove_dir_all(dest).map_err(|e| {
                    Error::msg(format!("failed to clear {}: {e}", dest.display()))
                })?;
            }
            tc::extract(ctx, kind, &archive, dest)?;
        }
    }
    if tc::normalize(dest)? {
        ctx.log(&format!("{}: moved bin/ to {}", slot.dir_name(), dest.display()));
    }
    Ok(dest.to_path_buf())
}

fn paths_for(slots: &[(Slot, PathBuf)]) -> Result<ToolchainPaths> {
    let mut out = ToolchainPaths::default();
    for (slot, root) in slots {
        let bin = root.join("bin");
        match slot {
            Slot::Clang => {
                if !bin.join("clang").exists() {
                    return Err(Error::msg(format!("no clang binary in {}", bin.display())));
                }
                out.clang_bin = Some(bin);
            }
            Slot::Gcc64 | Slot::Gcc32 => {
                let prefix = tc::infer_prefix(root).ok_or_else(|| {
                    Error::msg(format!(
                        "could not infer the cross prefix of {}",
                        root.display()
                    ))
                })?;
                if *slot == Slot::Gcc64 {
                    out.gcc64_bin = Some(bin);
                    out.gcc64_prefix = Some(prefix);
                } else {
                    out.gcc32_bin = Some(bin);
                    out.gcc32_prefix = Some(prefix);
                }
            }
        }
    }
    Ok(out)
}

#[Task(
    id = "toolchain.provision",
    module = "toolchain",
    phase = "fetch",
    provides = ["toolchain:ready"],
    after = ["core.init"],
    default_label = "Provision toolchains"
)]
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProvisionTask {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub label: Option<String>,
}

impl Default for ProvisionTask {
    fn default() -> Self {
        Self {
            enabled: true,
            label: None,
        }
    }
}

impl ProvisionTask {
    pub fn run(_cfg: &Self, doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()> {
        let tcfg: ToolchainConfig = doc.deserialize_path("toolchain")?.unwrap_or_default();
        let sources = tcfg.sources()?;
        if sources.is_empty() {
            ctx.warn("no toolchain selected; the build will use the host compilers");
        }

        let root = ctx.workspace_paths_or_init(doc)?.toolchains_dir();
        let mut roots = Vec::new();
        for (slot, source) in &sources {
            let dest = root.join(slot.dir_name());
            roots.push((*slot, provision_one(doc, ctx, *slot, source, &dest)?));
        }

        let paths = paths_for(&roots)?;
        for (name, prefix) in [("gcc64", &paths.gcc64_prefix), ("gcc32", &paths.gcc32_prefix)] {
            if let Some(p) = prefix {
                ctx.log(&format!("{name} prefix: {p}"));
            }
        }
        ctx.update_state(|s| s.toolchain = Some(paths));
        Ok(())
    }
}

#[Module(
    id = "toolchain",
    config = ToolchainConfig,
    tasks = [ProvisionTask]
)]
pub struct ToolchainModule;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aosp_clang_url_is_built_from_versions() {
        let cfg: ToolchainConfig = toml::from_str(
            "aosp_clang = true\nandroid_version = \"13\"\nclang_version = \"r450784d\"\n",
        )
        .expect("parse");
        let sources = cfg.sources().expect("sources");
        assert_eq!(
            sources,
            vec![(
                Slot::Clang,
                ToolchainSource::Archive(
                    "https://android.googlesource.com/platform/prebuilts/clang/host/linux-x86/+archive/refs/heads/android13-release/clang-r450784d.tar.gz".into()
                )
            )]
        );
    }

    #[test]
    fn android_version_from_env_or_bare_integer() {
        let mut doc = ConfigDoc::parse(
            "<mem>",
            "[toolchain]\naosp_clang = true\nclang_version = \"r416183b\"\n",
        )
        .expect("doc");
        crate::config::apply_overrides(
            &mut doc,
            crate::config::env_overrides([(
                "AKB_TOOLCHAIN__ANDROID_VERSION".to_string(),
                "12".to_string(),
            )]),
        )
        .expect("apply");
        let cfg: ToolchainConfig = doc
            .deserialize_path("toolchain")
            .expect("deserialize")
            .expect("present");
        assert_eq!(cfg.android_version, "12");
        assert!(matches!(
            &cfg.sources().expect("sources")[0],
            (Slot::Clang, ToolchainSource::Archive(u)) if u.contains("android12-release/clang-r416183b")
        ));

        let bare: ToolchainConfig =
            toml::from_str("aosp_clang = true\nandroid_version = 12\n").expect("parse");
        assert_eq!(bare.android_version, "12");
    }

    #[test]
    fn explicit_urls_override_aosp() {
        let cfg: ToolchainConfig = toml::from_str(
            "aosp_gcc = true\ngcc64_url = \"https://github.com/mvaisakh/gcc-arm64\"\ngcc64_branch = \"gcc-master\"\n",
        )
        .expect("parse");
        let sources = cfg.sources().expect("sources");
        assert_eq!(sources.len(), 2);
        assert!(matches!(&sources[0], (Slot::Gcc64, ToolchainSource::Git { branch: Some(b), .. }) if b == "gcc-master"));
        assert!(
            matches!(&sources[1], (Slot::Gcc32, ToolchainSource::Archive(u)) if u.ends_with("android-12.1.0_r27.tar.gz"))
        );
    }

    #[test]
    fn hostile_clang_version_is_rejected() {
        let cfg = ToolchainConfig {
            aosp_clang: true,
            clang_version: "../../evil".into(),
            ..ToolchainConfig::default()
        };
        assert!(cfg.sources().unwrap_err().is_invalid());
    }

    #[test]
    fn archive_names_come_from_the_url_path() {
        let url = reqwest::Url::parse(
            "https://github.com/ZyCromerZ/Clang/releases/download/19.0.0/Clang-19.tar.gz",
        )
        .expect("url");
        assert_eq!(archive_file_name(&url), "Clang-19.tar.gz");
    }
}
