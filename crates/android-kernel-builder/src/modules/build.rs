use std::collections::BTreeMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Command;

use serde::Deserialize;

use android_kernel_builder_macros::{Module, Task};

use crate::analyzer::{self, SENTINEL_FILE};
use crate::buildlog::BuildLog;
use crate::config::ConfigDoc;
use crate::executor::ExecCtx;
use crate::kconfig;
use crate::make_args::filter_make_args;
use crate::modules::ccache::CcacheConfig;
use crate::modules::util;
use crate::settings::{BuildConfig, ToolchainPaths};
use crate::{Error, Result};

fn default_true() -> bool {
    true
}

pub const BUILD_LOG: &str = "build.log";
pub const ANALYSIS_FILE: &str = "analysis.txt";

/// Candidate image names under `arch/<arch>/boot`, best first.
pub const IMAGE_PRIORITY: &[&str] = &[
    "Image.gz-dtb",
    "Image.gz",
    "Image.lz4",
    "Image",
    "zImage-dtb",
    "zImage",
];

/// Samsung security features that refuse to boot modified kernels.
const FST_SYMBOLS: &[&str] = &[
    "CONFIG_SECURITY_DEFEX",
    "CONFIG_PROCA",
    "CONFIG_FIVE",
    "CONFIG_UH",
    "CONFIG_RKP",
    "CONFIG_KDP",
    "CONFIG_SECURITY_DSMS",
];

pub fn wants_tweaks(doc: &ConfigDoc) -> bool {
    util::build_config(doc)
        .map(|b| b.wants_kconfig_tweaks())
        .unwrap_or(false)
}

/// Apply `[build]` kconfig switches and overrides to a defconfig.
pub fn apply_tweaks(build: &BuildConfig, cfg: &mut String) -> Result<()> {
    if build.disable_lto {
        kconfig::unset_prefix(cfg, "CONFIG_LTO_CLANG");
        kconfig::unset_kv(cfg, "CONFIG_THINLTO");
        kconfig::set_kv(cfg, "CONFIG_LTO_NONE", "y");
    }
    if build.kvm {
        kconfig::set_kv(cfg, "CONFIG_VIRTUALIZATION", "y");
        kconfig::set_kv(cfg, "CONFIG_KVM", "y");
    }
    if build.disable_fst {
        for s in FST_SYMBOLS {
            kconfig::unset_kv(cfg, s);
        }
    }
    for (k, v) in &build.kconfig {
        kconfig::apply_value(cfg, k, v)?;
    }
    Ok(())
}

#[Task(
    id = "build.kconfig",
    module = "build",
    phase = "patch",
    provides = ["patch:kconfig"],
    after = [
        "kernel:defconfig",
        "patch:kernelsu?",
        "patch:nethunter?",
        "patch:lxc?",
        "patch:bbg?",
        "patch:rekernel?"
    ],
    default_label = "Apply kconfig tweaks",
    when = wants_tweaks
)]
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct KconfigTask {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub label: Option<String>,
}

impl Default for KconfigTask {
    fn default() -> Self {
        Self {
            enabled: true,
            label: None,
        }
    }
}

impl KconfigTask {
    pub fn run(_cfg: &Self, doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()> {
        let build = util::build_config(doc)?;
        let path = ctx
            .state()
            .defconfig_path
            .ok_or_else(|| Error::msg("defconfig path is unknown; kernel.defconfig must run first"))?;
        let changed = kconfig::edit_file(&path, |c| apply_tweaks(&build, c))?;
        ctx.log(&format!(
            "{} {}",
            if changed { "updated" } else { "unchanged" },
            path.display()
        ));
        Ok(())
    }
}

/// `CLANG_TRIPLE` for clang builds that still use GNU binutils.
fn clang_triple(arch: &str) -> Option<&'static str> {
    match arch {
        "arm64" => Some("aarch64-linux-gnu-"),
        "arm" => Some("arm-linux-gnueabi-"),
        _ => None,
    }
}

/// Make variables the builder owns. User arguments never override these.
pub fn make_vars(
    build: &BuildConfig,
    tc: &ToolchainPaths,
    ccache: bool,
    out: &Path,
) -> Vec<String> {
    let mut vars = vec![format!("O={}", out.display()), format!("ARCH={}", build.arch)];
    let cache = if ccache { "ccache " } else { "" };

    if tc.has_clang() {
        vars.push(format!("CC={cache}clang"));
        if let Some(t) = clang_triple(&build.arch) {
            vars.push(format!("CLANG_TRIPLE={t}"));
        }
    } else if ccache && let Some(p) = &tc.gcc64_prefix {
        vars.push(format!("CC=ccache {p}gcc"));
    }

    match (&tc.gcc64_prefix, tc.has_clang() && build.llvm) {
        (Some(p), _) => vars.push(format!("CROSS_COMPILE={p}")),
        (None, true) => {
            if let Some(t) = clang_triple(&build.arch) {
                vars.push(format!("CROSS_COMPILE={t}"));
            }
        }
        (None, false) => {}
    }
    if let Some(p) = &tc.gcc32_prefix {
        vars.push(format!("CROSS_COMPILE_ARM32={p}"));
        vars.push(format!("CROSS_COMPILE_COMPAT={p}"));
    }
    if build.llvm {
        vars.push("LLVM=1".into());
    }
    if build.llvm_ias {
        vars.push("LLVM_IAS=1".into());
    }
    vars
}

/// Environment for make: toolchain bins first on PATH plus kbuild identity.
pub fn make_env(
    build: &BuildConfig,
    tc: &ToolchainPaths,
    ccache_dir: Option<&Path>,
) -> Result<BTreeMap<String, OsString>> {
    let mut env = BTreeMap::new();
    let mut path: Vec<PathBuf> = tc.bin_dirs().into_iter().cloned().collect();
    if let Some(existing) = std::env::var_os("PATH") {
        path.extend(std::env::split_paths(&existing));
    }
    let joined = std::env::join_paths(path)
        .map_err(|e| Error::invalid(format!("toolchain path cannot be placed on PATH: {e}")))?;
    env.insert("PATH".into(), joined);
    env.insert("ARCH".into(), build.arch.clone().into());
    env.insert("SUBARCH".into(), build.arch.clone().into());
    if let Some(u) = build.build_user.as_deref() {
        env.insert("KBUILD_BUILD_USER".into(), u.into());
    }
    if let Some(h) = build.build_host.as_deref() {
        env.insert("KBUILD_BUILD_HOST".into(), h.into());
    }
    if let Some(d) = ccache_dir {
        env.insert("CCACHE_DIR".into(), d.as_os_str().to_os_string());
    }
    Ok(env)
}

pub fn find_image(boot_dir: &Path) -> Option<PathBuf> {
    IMAGE_PRIORITY
        .iter()
        .map(|n| boot_dir.join(n))
        .find(|p| p.is_file())
}

fn make_command(kernel_dir: &Path, env: &BTreeMap<String, OsString>) -> Command {
    let mut cmd = Command::new("make");
    cmd.arg("-C").arg(kernel_dir);
    cmd.envs(env);
    cmd
}

#[Task(
    id = "build.kernel",
    module = "build",
    phase = "build",
    provides = ["kernel:image"],
    after = [
        "kernel:defconfig",
        "toolchain:ready?",
        "patch:done?",
        "ccache:restored?"
    ],
    default_label = "Build kernel",
    required = true
)]
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct KernelTask {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub label: Option<String>,
}

impl Default for KernelTask {
    fn default() -> Self {
        Self {
            enabled: true,
            label: None,
        }
    }
}

impl KernelTask {
    pub fn run(_cfg: &Self, doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()> {
        let build = util::build_config(doc)?;
        let ccache: CcacheConfig = doc.deserialize_path("ccache")?.unwrap_or_default();
        let ws = ctx.workspace_paths_or_init(doc)?;
        let kernel_dir = util::kernel_dir(doc, ctx)?;
        let out = util::kbuild_out_dir(doc, ctx)?;
        util::ensure_dir(&out)?;

        let tc = ctx.state().toolchain.unwrap_or_default();
        let ccache_on = doc.flag("ccache") && ccache.enabled;
        let ccache_dir = if ccache_on {
            Some(ccache.resolve_dir(&ws)?)
        } else {
            None
        };
        let env = make_env(&build, &tc, ccache_dir.as_deref())?;
        let vars = make_vars(&build, &tc, ccache_on, &out);

        let filtered = filter_make_args(&build.extra_make_args);
        for r in &filtered.rejected {
            ctx.warn(&format!("ignoring build.extra_make_args entry '{r}' (builder-owned variable)"));
        }

        let log_path = ws.out_dir.join(BUILD_LOG);
        let mut log = BuildLog::create(&log_path)?;
        let jobs = build.effective_jobs();
        ctx.log(&format!(
            "make {} {} -j{jobs} (log: {})",
            build.defconfig,
            vars.join(" "),
            log_path.display()
        ));

        let mut defconfig = make_command(&kernel_dir, &env);
        defconfig.args(&vars).arg(&build.defconfig);
        let mut image = make_command(&kernel_dir, &env);
        image
            .arg(format!("-j{jobs}"))
            .args(&vars)
            .args(&filtered.accepted);

        let res = ctx
            .run_cmd_logged(defconfig, &mut log)
            .and_then(|_| ctx.run_cmd_logged(image, &mut log));
        let lines = log.lines();
        log.finish()?;

        if let Err(e) = res {
            let analysis = analyzer::analyze_and_mark(
                &log_path,
                &ws.out_dir.join(ANALYSIS_FILE),
                &ws.out_dir.join(SENTINEL_FILE),
            );
            return Err(match analysis {
                Ok(a) => {
                    for d in a.diagnostics.iter().take(20) {
                        ctx.log(&format!("{}. [{}] {}", d.index, d.category, d.line));
                    }
                    if !a.has_errors() {
                        // Still flag the failure for later workflow steps.
                        util::write_text(&ws.out_dir.join(SENTINEL_FILE), "0\n")?;
                    }
                    Error::command(format!(
                        "kernel build failed ({e}); {} known error(s), see {}",
                        a.count(),
                        ws.out_dir.join(ANALYSIS_FILE).display()
                    ))
                }
                Err(ae) => {
                    ctx.warn(&format!("build log analysis failed: {ae}"));
                    Error::command(format!("kernel build failed: {e}"))
                }
            });
        }
        ctx.log(&format!("{lines} log lines written to {}", log_path.display()));

        let boot = out.join("arch").join(&build.arch).join("boot");
        let image = find_image(&boot).ok_or_else(|| {
            Error::msg(format!(
                "build succeeded but no kernel image found in {} (looked for {})",
                boot.display(),
                IMAGE_PRIORITY.join(", ")
            ))
        })?;
        let sha = util::sha256_file_hex(&image)?;
        ctx.log(&format!("image: {} sha256={sha}", image.display()));
        ctx.update_state(|s| {
            s.image = Some(image);
            s.image_sha256 = Some(sha);
        });
        Ok(())
    }
}

#[Module(
    id = "build",
    config = BuildConfig,
    tasks = [KconfigTask, KernelTask]
)]
pub struct BuildModule;

#[cfg(test)]
mod tests {
    use super::*;

    fn clang_gcc() -> ToolchainPaths {
        ToolchainPaths {
            clang_bin: Some("/tc/clang/bin".into()),
            gcc64_bin: Some("/tc/gcc64/bin".into()),
            gcc64_prefix: Some("aarch64-linux-android-".into()),
            gcc32_bin: Some("/tc/gcc32/bin".into()),
            gcc32_prefix: Some("arm-linux-androideabi-".into()),
        }
    }

    #[test]
    fn kconfig_overrides_from_env_reach_the_defconfig() {
        let mut doc = ConfigDoc::parse(
            "<mem>",
            "[build]\ndefconfig = \"sweet_defconfig\"\njobs = 2\n",
        )
        .expect("doc");
        let vars = [
            ("AKB_BUILD__KCONFIG__CONFIG_KSU", "y"),
            ("AKB_BUILD__KCONFIG__CONFIG_NR_CPUS", "8"),
            ("AKB_BUILD__KCONFIG__CONFIG_LOCALVERSION", "-sweet"),
            ("AKB_BUILD__KCONFIG__CONFIG_MODULES", "false"),
            ("AKB_BUILD__JOBS", "6"),
        ]
        .map(|(k, v)| (k.to_string(), v.to_string()));
        crate::config::apply_overrides(&mut doc, crate::config::env_overrides(vars))
            .expect("apply");
        let build = util::build_config(&doc).expect("build config");
        assert_eq!(build.jobs, 6);
        assert!(build.wants_kconfig_tweaks());

        let mut cfg = "CONFIG_MODULES=y\n".to_string();
        apply_tweaks(&build, &mut cfg).expect("tweaks");
        assert_eq!(kconfig::get_kv(&cfg, "CONFIG_KSU"), Some("y"));
        assert_eq!(kconfig::get_kv(&cfg, "CONFIG_NR_CPUS"), Some("8"));
        assert_eq!(kconfig::get_kv(&cfg, "CONFIG_LOCALVERSION"), Some("\"-sweet\""));
        assert_eq!(kconfig::get_kv(&cfg, "CONFIG_MODULES"), None);
    }

    #[test]
    fn clang_with_gcc_binutils() {
        let build = BuildConfig::default();
        let vars = make_vars(&build, &clang_gcc(), false, Path::new("/w/out"));
        assert_eq!(
            vars,
            vec![
                "O=/w/out",
                "ARCH=arm64",
                "CC=clang",
                "CLANG_TRIPLE=aarch64-linux-gnu-",
                "CROSS_COMPILE=aarch64-linux-android-",
                "CROSS_COMPILE_ARM32=arm-linux-androideabi-",
                "CROSS_COMPILE_COMPAT=arm-linux-androideabi-",
            ]
        );
    }

    #[test]
    fn llvm_only_build_with_ccache() {
        let build = BuildConfig {
            llvm: true,
            llvm_ias: true,
            ..BuildConfig::default()
        };
        let tc = ToolchainPaths {
            clang_bin: Some("/tc/clang/bin".into()),
            ..ToolchainPaths::default()
        };
        let vars = make_vars(&build, &tc, true, Path::new("/w/out"));
        assert!(vars.contains(&"CC=ccache clang".to_string()));
        assert!(vars.contains(&"CROSS_COMPILE=aarch64-linux-gnu-".to_string()));
        assert!(vars.contains(&"LLVM=1".to_string()));
        assert!(vars.contains(&"LLVM_IAS=1".to_string()));
    }

    #[test]
    fn toolchain_bins_lead_path() {
        let build = BuildConfig {
            build_user: Some("ci".into()),
            ..BuildConfig::default()
        };
        let env = make_env(&build, &clang_gcc(), Some(Path::new("/w/ccache"))).expect("env");
        let path = env["PATH"].to_string_lossy().into_owned();
        assert!(path.starts_with("/tc/clang/bin:/tc/gcc64/bin:/tc/gcc32/bin"), "{path}");
        assert_eq!(env["KBUILD_BUILD_USER"], OsString::from("ci"));
        assert_eq!(env["CCACHE_DIR"], OsString::from("/w/ccache"));
        assert!(!env.contains_key("KBUILD_BUILD_HOST"));
    }

    #[test]
    fn tweaks_edit_defconfig() {
        let mut build: BuildConfig = toml::from_str(
            "disable_lto = true\nkvm = true\ndisable_fst = true\n[kconfig]\nCONFIG_LOCALVERSION = \"-ci\"\n",
        )
        .expect("parse");
        build.defconfig = "x_defconfig".into();
        let mut cfg =
            "CONFIG_LTO_CLANG=y\nCONFIG_LTO_CLANG_FULL=y\nCONFIG_THINLTO=y\nCONFIG_FIVE=y\n".to_string();
        apply_tweaks(&build, &mut cfg).expect("tweaks");
        assert_eq!(kconfig::get_kv(&cfg, "CONFIG_LTO_NONE"), Some("y"));
        assert_eq!(kconfig::get_kv(&cfg, "CONFIG_LTO_CLANG"), None);
        assert_eq!(kconfig::get_kv(&cfg, "CONFIG_LTO_CLANG_FULL"), None);
        assert_eq!(kconfig::get_kv(&cfg, "CONFIG_THINLTO"), None);
        assert_eq!(kconfig::get_kv(&cfg, "CONFIG_KVM"), Some("y"));
        assert_eq!(kconfig::get_kv(&cfg, "CONFIG_FIVE"), None);
        assert!(cfg.contains("# CONFIG_FIVE is not set"));
        assert_eq!(kconfig::get_kv(&cfg, "CONFIG_LOCALVERSION"), Some("\"-ci\""));
    }

    #[test]
    fn image_priority_prefers_dtb_variants() {
        let tmp = tempfile::tempdir().expect("tempdir");
        std::fs::write(tmp.path().join("Image"), b"img").expect("image");
        assert_eq!(find_image(tmp.path()), Some(tmp.path().join("Image")));
        std::fs::write(tmp.path().join("Image.gz-dtb"), b"img").expect("dtb");
        assert_eq!(find_image(tmp.path()), Some(tmp.path().join("Image.gz-dtb")));
        assert_eq!(find_image(&tmp.path().join("missing")), None);
    }
}
