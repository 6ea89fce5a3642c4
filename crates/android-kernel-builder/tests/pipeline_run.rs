//! Whole-pipeline runs against a scratch workspace. Every external command goes
//! through a `RecordingRunner`, so nothing is cloned, compiled or zipped for real.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use android_kernel_builder::config::ConfigDoc;
use android_kernel_builder::error::ErrorKind;
use android_kernel_builder::executor::{
    CommandRecord, ExecCtx, MemorySink, RecordingRunner, StagedDownloader, builtin_registry,
    execute_plan,
};
use android_kernel_builder::executor::runner::Reply;

const MAKEFILE: &str = "VERSION = 4\nPATCHLEVEL = 14\nSUBLEVEL = 356\nEXTRAVERSION =\nNAME = Petit Gorille\n";

struct Scratch {
    _tmp: tempfile::TempDir,
    root: PathBuf,
}

impl Scratch {
    fn new() -> Self {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().canonicalize().unwrap();
        let kernel = root.join("build/kernel");
        fs::create_dir_all(kernel.join("arch/arm64/configs")).unwrap();
        fs::write(kernel.join("Makefile"), MAKEFILE).unwrap();
        fs::write(
            kernel.join("arch/arm64/configs/sweet_defconfig"),
            "CONFIG_LOCALVERSION=\"-perf\"\n# CONFIG_KVM is not set\n",
        )
        .unwrap();
        let clang = root.join("prebuilts/clang");
        fs::create_dir_all(clang.join("bin")).unwrap();
        fs::write(clang.join("bin/clang"), "").unwrap();
        Self { _tmp: tmp, root }
    }

    fn raw(&self, extra: &str) -> String {
        format!(
            r#"
[workspace]
root_dir = "{root}"

[kernel]

[toolchain]
clang_path = "prebuilts/clang"

[build]
name = "sweet"
defconfig = "sweet_defconfig"
jobs = 4
kvm = true
extra_make_args = ["CC=gcc", "KCFLAGS=-O2 -pipe", "CROSS_COMPILE=evil-"]
{extra}
"#,
            root = self.root.display()
        )
    }

    fn doc(&self, extra: &str) -> ConfigDoc {
        ConfigDoc::parse(self.root.join("sweet.toml"), &self.raw(extra)).unwrap()
    }

    fn run(&self, doc: &ConfigDoc, runner: &RecordingRunner) -> (android_kernel_builder::Result<()>, Arc<MemorySink>) {
        self.run_with(doc, runner, &StagedDownloader::default())
    }

    fn run_with(
        &self,
        doc: &ConfigDoc,
        runner: &RecordingRunner,
        downloads: &StagedDownloader,
    ) -> (android_kernel_builder::Result<()>, Arc<MemorySink>) {
        let plan = android_kernel_builder::modules::build_plan(doc).unwrap();
        let reg = builtin_registry().unwrap();
        let sink = Arc::new(MemorySink::default());
        let mut ctx = ExecCtx::new(false, sink.clone())
            .with_runner(Arc::new(runner.clone()))
            .with_downloader(Arc::new(downloads.clone()));
        (execute_plan(doc, &plan, &reg, &mut ctx), sink)
    }

    fn defconfig(&self) -> PathBuf {
        self.root.join("build/kernel/arch/arm64/configs/sweet_defconfig")
    }
}

fn arg_value<'a>(rec: &'a CommandRecord, key: &str) -> Option<&'a str> {
    rec.args.iter().find_map(|a| a.strip_prefix(key))
}

/// Pretend to be git, make and zip well enough for the pipeline to move on.
fn fake_tools(rec: &CommandRecord) -> Reply {
    match rec.program.as_str() {
        "make" if rec.args.iter().any(|a| a.starts_with("-j")) => {
            let out = arg_value(rec, "O=").ok_or("no O=")?;
            let boot = Path::new(out).join("arch/arm64/boot");
            fs::create_dir_all(&boot).map_err(|e| e.to_string())?;
            fs::write(boot.join("Image.gz-dtb"), b"kernel").map_err(|e| e.to_string())?;
            Ok(vec!["  LD      vmlinux".into(), "  OBJCOPY arch/arm64/boot/Image".into()])
        }
        "make" => Ok(vec!["#".into(), "# configuration written to .config".into()]),
        "git" => {
            let dest = Path::new(rec.args.last().ok_or("no dest")?);
            fs::create_dir_all(dest.join(".git")).map_err(|e| e.to_string())?;
            fs::create_dir_all(dest.join(".github")).map_err(|e| e.to_string())?;
            fs::write(dest.join("README.md"), "ak3").map_err(|e| e.to_string())?;
            fs::write(
                dest.join("anykernel.sh"),
                "kernel.string=ExampleKernel\ndo.devicecheck=1\ndevice.name1=maguro\nIS_SLOT_DEVICE=0;\n",
            )
            .map_err(|e| e.to_string())?;
            Ok(vec![])
        }
        "zip" => {
            fs::write(&rec.args[1], b"PK").map_err(|e| e.to_string())?;
            Ok(vec![])
        }
        "ccache" => Err("ccache: command not found".into()),
        _ => Ok(vec![]),
    }
}

#[test]
fn successful_build_is_packaged_and_staged() {
    let s = Scratch::new();
    let doc = s.doc("\n[ccache]\nmax_size = \"2G\"\n\n[package]\n\n[publish]\n");
    let runner = RecordingRunner::with_handler(fake_tools);
    let (res, sink) = s.run(&doc, &runner);
    res.unwrap();

    // Kconfig tweak landed in the defconfig.
    let defconfig =
        fs::read_to_string(s.root.join("build/kernel/arch/arm64/configs/sweet_defconfig")).unwrap();
    assert!(defconfig.contains("CONFIG_KVM=y"), "{defconfig}");
    assert!(defconfig.contains("CONFIG_VIRTUALIZATION=y"));

    // Builder-owned variables cannot be overridden from the config.
    let calls = runner.calls();
    let build = calls
        .iter()
        .find(|c| c.program == "make" && c.args.iter().any(|a| a == "-j4"))
        .expect("make -j4");
    assert!(build.args.iter().any(|a| a == "KCFLAGS=-O2 -pipe"));
    assert!(build.args.iter().any(|a| a == "CC=ccache clang"));
    assert!(!build.args.iter().any(|a| a == "CC=gcc" || a == "CROSS_COMPILE=evil-"));
    assert!(build
        .env("PATH")
        .unwrap()
        .starts_with(&s.root.join("prebuilts/clang/bin").display().to_string()));
    assert!(build.env("CCACHE_DIR").is_some());

    let warnings = sink.warnings();
    assert!(warnings.iter().any(|w| w.contains("CC=gcc")), "{warnings:?}");
    assert!(warnings.iter().any(|w| w.contains("CROSS_COMPILE=evil-")));
    // ccache is missing on this "runner", which must not fail the build.
    assert!(warnings.iter().any(|w| w.contains("ccache.restore failed")));
    assert!(warnings.iter().any(|w| w.contains("ccache.save failed")));

    // AnyKernel3 checkout was cleaned and retargeted.
    let ak3 = s.root.join("build/anykernel3");
    assert!(!ak3.join(".git").exists());
    assert!(!ak3.join("README.md").exists());
    assert!(ak3.join("Image.gz-dtb").is_file());
    let script = fs::read_to_string(ak3.join("anykernel.sh")).unwrap();
    assert!(script.contains("do.devicecheck=0"));
    assert!(script.contains("kernel.string=sweet-4.14.356-"));

    // Artifact staging.
    let artifacts = s.root.join("out/artifacts");
    let manifest: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(artifacts.join("manifest.json")).unwrap()).unwrap();
    let entry = &manifest[0];
    let name = entry["name"].as_str().unwrap();
    assert!(name.starts_with("sweet-4.14.356-") && name.ends_with(".zip"), "{name}");
    assert_eq!(entry["size"], 2);
    assert!(artifacts.join(name).is_file());

    // Run state mirrors what later workflow steps need.
    let state: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(s.root.join("out/run-state.json")).unwrap()).unwrap();
    assert_eq!(state["kernel_version"]["major"], 4);
    assert_eq!(state["kernel_version"]["minor"], 14);
    assert!(state["image_sha256"].as_str().unwrap().len() == 64);
    assert!(!s.root.join("out/build-failed").exists());

    let log = fs::read_to_string(s.root.join("out/build.log")).unwrap();
    assert!(log.contains("LD      vmlinux"));
}

#[test]
fn failed_build_is_analyzed_and_flagged() {
    let s = Scratch::new();
    let doc = s.doc("");
    let runner = RecordingRunner::with_handler(|rec| match rec.program.as_str() {
        "make" if rec.args.iter().any(|a| a.starts_with("-j")) => Err("exit status: 2".into()),
        "make" => Ok(vec![
            "drivers/input/touchscreen/xiaomi/xiaomi_touch.c:12:10: fatal error: 'linux/hwid.h' file not found".into(),
            "ld.lld: error: undefined symbol: ksu_handle_execveat".into(),
            "  CC      kernel/fork.o".into(),
        ]),
        _ => Ok(vec![]),
    });
    let (res, _sink) = s.run(&doc, &runner);
    let err = res.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Command);
    assert!(err.to_string().contains("build.kernel"), "{err}");

    assert_eq!(
        fs::read_to_string(s.root.join("out/build-failed")).unwrap(),
        "2\n"
    );
    let report = fs::read_to_string(s.root.join("out/analysis.txt")).unwrap();
    assert!(report.contains("1. [Missing Header]"), "{report}");
    assert!(report.contains("2. [Undefined Symbol]"), "{report}");
}

#[test]
fn defconfig_traversal_stops_the_run_before_any_build() {
    let s = Scratch::new();
    let raw = s.raw("").replace(
        "defconfig = \"sweet_defconfig\"",
        "defconfig = \"../../../../etc/passwd\"",
    );
    let doc = ConfigDoc::parse(s.root.join("sweet.toml"), &raw).unwrap();
    let runner = RecordingRunner::with_handler(fake_tools);
    let (res, _sink) = s.run(&doc, &runner);
    let err = res.unwrap_err();
    assert!(err.is_invalid(), "{err}");
    assert!(!runner.calls().iter().any(|c| c.program == "make"));
}

#[test]
fn dry_run_spawns_nothing() {
    let s = Scratch::new();
    let doc = s.doc("\n[package]\n");
    let plan = android_kernel_builder::modules::build_plan(&doc).unwrap();
    let reg = builtin_registry().unwrap();
    let runner = RecordingRunner::with_handler(fake_tools);
    let sink = Arc::new(MemorySink::default());
    let mut ctx = ExecCtx::new(true, sink.clone()).with_runner(Arc::new(runner.clone()));
    execute_plan(&doc, &plan, &reg, &mut ctx).unwrap();
    assert!(runner.calls().is_empty());
    assert!(sink.log_lines().iter().any(|l| l.contains("DRY-RUN: build.kernel")));
}

#[test]
fn failed_build_without_known_errors_still_leaves_the_sentinel() {
    let s = Scratch::new();
    let doc = s.doc("");
    let runner = RecordingRunner::with_handler(|rec| match rec.program.as_str() {
        "make" if rec.args.iter().any(|a| a.starts_with("-j")) => Err("killed by signal 9".into()),
        "make" => Ok(vec!["  CC      kernel/fork.o".into()]),
        _ => Ok(vec![]),
    });
    let (res, _sink) = s.run(&doc, &runner);
    assert_eq!(res.unwrap_err().kind(), ErrorKind::Command);
    assert_eq!(
        fs::read_to_string(s.root.join("out/build-failed")).unwrap(),
        "0\n"
    );
    assert!(s.root.join("out/analysis.txt").is_file());
}

const KSU_SETUP: &str = "https://raw.githubusercontent.com/tiann/KernelSU/main/kernel/setup.sh";
const BBG_SETUP: &str = "https://raw.githubusercontent.com/vc-teahouse/Baseband-guard/main/setup.sh";

#[test]
fn kernelsu_and_bbg_are_fetched_run_and_configured() {
    let s = Scratch::new();
    fs::write(
        s.defconfig(),
        "CONFIG_LOCALVERSION=\"-perf\"\nCONFIG_LSM=\"lockdown,yama,selinux\"\n# CONFIG_KPROBES is not set\n",
    )
    .unwrap();
    let doc = s.doc("\n[patch.kernelsu]\nversion = \"v0.9.5\"\n\n[patch.bbg]\n");
    let downloads = StagedDownloader::default()
        .stage(KSU_SETUP, "#!/bin/sh\necho ksu\n")
        .stage(BBG_SETUP, "#!/bin/sh\necho bbg\n");
    let runner = RecordingRunner::with_handler(fake_tools);
    let (res, _sink) = s.run_with(&doc, &runner, &downloads);
    res.unwrap();

    assert_eq!(downloads.requested(), vec![BBG_SETUP, KSU_SETUP]);

    let kernel = s.root.join("build/kernel");
    let scripts = s.root.join("build/downloads");
    let bash: Vec<CommandRecord> = runner
        .calls()
        .into_iter()
        .filter(|c| c.program == "bash")
        .collect();
    assert_eq!(bash.len(), 2, "{:?}", runner.lines());
    assert_eq!(
        bash[0].args,
        vec![scripts.join("bbg-setup.sh").display().to_string()]
    );
    assert_eq!(
        bash[1].args,
        vec![
            scripts.join("kernelsu-setup.sh").display().to_string(),
            "v0.9.5".to_string()
        ]
    );
    assert!(bash.iter().all(|c| c.cwd.as_deref() == Some(kernel.as_path())));
    assert_eq!(
        fs::read_to_string(scripts.join("kernelsu-setup.sh")).unwrap(),
        "#!/bin/sh\necho ksu\n"
    );

    // Both patches ran before the build, and their symbols survived the kvm tweak.
    let lines = runner.lines();
    let last_bash = lines.iter().rposition(|l| l.starts_with("bash ")).unwrap();
    let first_make = lines.iter().position(|l| l.starts_with("make ")).unwrap();
    assert!(last_bash < first_make, "{lines:?}");

    let defconfig = fs::read_to_string(s.defconfig()).unwrap();
    for line in [
        "CONFIG_KSU=y",
        "CONFIG_KPROBES=y",
        "CONFIG_HAVE_KPROBES=y",
        "CONFIG_KPROBE_EVENTS=y",
        "CONFIG_BBG=y",
        "CONFIG_LSM=\"lockdown,yama,selinux,baseband_guard\"",
        "CONFIG_KVM=y",
    ] {
        assert!(defconfig.lines().any(|l| l == line), "missing {line}:\n{defconfig}");
    }
    assert!(!defconfig.contains("# CONFIG_KPROBES is not set"));
}

#[test]
fn unreachable_setup_script_fails_the_patch_stage() {
    let s = Scratch::new();
    let doc = s.doc("\n[patch.bbg]\n");
    let runner = RecordingRunner::with_handler(fake_tools);
    let (res, _sink) = s.run_with(&doc, &runner, &StagedDownloader::default());
    let err = res.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Http, "{err}");
    assert!(!runner.calls().iter().any(|c| c.program == "bash" || c.program == "make"));
}

#[test]
fn kernelsu_module_build_on_a_legacy_kernel_is_refused() {
    let s = Scratch::new();
    let doc = s.doc("\n[patch.kernelsu]\nlkm = true\n");
    let downloads = StagedDownloader::default().stage(KSU_SETUP, "#!/bin/sh\n");
    let runner = RecordingRunner::with_handler(fake_tools);
    let (res, _sink) = s.run_with(&doc, &runner, &downloads);
    let err = res.unwrap_err();
    assert!(err.is_invalid(), "{err}");
    assert!(downloads.requested().is_empty());
    assert!(!runner.calls().iter().any(|c| c.program == "bash"));
}
