//! Typed, immutable views of the build definition.
//!
//! Everything here is deserialized once from the [`ConfigDoc`](crate::config::ConfigDoc)
//! and passed by reference; nothing reads process-global state after startup.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

fn default_true() -> bool {
    true
}

fn default_depth() -> u32 {
    1
}

/// `[kernel]`: where the kernel source comes from.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub url: String,
    pub branch: Option<String>,
    /// Checkout dir, relative to the workspace build dir.
    pub dir: String,
    /// Clone depth; 0 means a full clone.
    #[serde(default = "default_depth", deserialize_with = "crate::config::int_or_string")]
    pub depth: u32,
    pub submodules: bool,
    pub vendor: Option<VendorConfig>,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            url: String::new(),
            branch: None,
            dir: "kernel".into(),
            depth: default_depth(),
            submodules: false,
            vendor: None,
        }
    }
}

/// `[kernel.vendor]`: an optional vendor tree merged over the kernel source.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct VendorConfig {
    pub url: String,
    pub branch: Option<String>,
    pub dir: String,
    #[serde(default = "default_depth", deserialize_with = "crate::config::int_or_string")]
    pub depth: u32,
}

impl Default for VendorConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            branch: None,
            dir: "vendor".into(),
            depth: default_depth(),
        }
    }
}

/// `[build]`: what to compile and how.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BuildConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// `{name}` in output names; defaults to the build definition's file stem.
    pub name: Option<String>,
    pub arch: String,
    pub defconfig: String,
    pub extra_make_args: Vec<String>,
    /// 0 = CPU count.
    #[serde(deserialize_with = "crate::config::int_or_string")]
    pub jobs: usize,
    pub llvm: bool,
    pub llvm_ias: bool,
    pub disable_lto: bool,
    pub disable_fst: bool,
    pub kvm: bool,
    pub build_user: Option<String>,
    pub build_host: Option<String>,
    /// Symbol overrides written into the defconfig, e.g. `CONFIG_LOCALVERSION = "-ci"`.
    pub kconfig: BTreeMap<String, toml::Value>,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            name: None,
            arch: "arm64".into(),
            defconfig: String::new(),
            extra_make_args: Vec::new(),
            jobs: 0,
            llvm: false,
            llvm_ias: false,
            disable_lto: false,
            disable_fst: false,
            kvm: false,
            build_user: None,
            build_host: None,
            kconfig: BTreeMap::new(),
        }
    }
}

impl BuildConfig {
    pub fn effective_jobs(&self) -> usize {
        if self.jobs == 0 {
            num_cpus::get().max(1)
        } else {
            self.jobs
        }
    }

    pub fn wants_kconfig_tweaks(&self) -> bool {
        self.disable_lto || self.disable_fst || self.kvm || !self.kconfig.is_empty()
    }
}

/// Where the compilers ended up after provisioning.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolchainPaths {
    pub clang_bin: Option<PathBuf>,
    pub gcc64_bin: Option<PathBuf>,
    pub gcc64_prefix: Option<String>,
    pub gcc32_bin: Option<PathBuf>,
    pub gcc32_prefix: Option<String>,
}

impl ToolchainPaths {
    pub fn bin_dirs(&self) -> Vec<&PathBuf> {
        [&self.clang_bin, &self.gcc64_bin, &self.gcc32_bin]
            .into_iter()
            .flatten()
            .collect()
    }

    pub fn has_clang(&self) -> bool {
        self.clang_bin.is_some()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PackageMode {
    #[default]
    Anykernel3,
    Bootimg,
}

/// `[package]`: how the kernel image is turned into something flashable.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ArtifactConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub mode: PackageMode,
    /// Output directory, relative to the workspace out dir.
    pub out_dir: String,
    /// Name template; `{name}`, `{version}`, `{date}`, `{arch}` are expanded.
    pub name: String,
    pub anykernel3_url: String,
    pub anykernel3_branch: Option<String>,
    pub kernel_string: Option<String>,
    pub bootimg_url: Option<String>,
    pub mkbootimg_url: String,
}

impl Default for ArtifactConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            mode: PackageMode::Anykernel3,
            out_dir: "dist".into(),
            name: "{name}-{version}-{date}".into(),
            anykernel3_url: "https://github.com/osm0sis/AnyKernel3".into(),
            anykernel3_branch: None,
            kernel_string: None,
            bootimg_url: None,
            mkbootimg_url: "https://android.googlesource.com/platform/system/tools/mkbootimg"
                .into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct KernelVersion {
    pub major: u32,
    pub minor: u32,
    pub sub: u32,
}

impl KernelVersion {
    /// GKI kernels start at 5.10.
    pub fn is_gki(&self) -> bool {
        self.major > 5 || (self.major == 5 && self.minor >= 10)
    }
}

impl fmt::Display for KernelVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.sub)
    }
}

/// Facts produced while the pipeline runs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunState {
    pub kernel_version: Option<KernelVersion>,
    pub defconfig_path: Option<PathBuf>,
    pub toolchain: Option<ToolchainPaths>,
    pub image: Option<PathBuf>,
    pub image_sha256: Option<String>,
    pub outputs: Vec<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gki_starts_at_5_10() {
        let v = |major, minor| KernelVersion {
            major,
            minor,
            sub: 0,
        };
        assert!(!v(4, 19).is_gki());
        assert!(!v(5, 4).is_gki());
        assert!(v(5, 10).is_gki());
        assert!(v(6, 1).is_gki());
    }

    #[test]
    fn build_defaults() {
        let cfg: BuildConfig = toml::from_str("defconfig = \"x_defconfig\"").expect("parse");
        assert_eq!(cfg.arch, "arm64");
        assert!(cfg.enabled);
        assert!(!cfg.wants_kconfig_tweaks());
        assert!(cfg.effective_jobs() >= 1);
    }

    #[test]
    fn package_mode_parses_lowercase() {
        let cfg: ArtifactConfig = toml::from_str("mode = \"bootimg\"").expect("parse");
        assert_eq!(cfg.mode, PackageMode::Bootimg);
        assert_eq!(cfg.out_dir, "dist");
    }
}
