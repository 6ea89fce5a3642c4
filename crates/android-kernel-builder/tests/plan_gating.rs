use std::path::PathBuf;

use android_kernel_builder::config::ConfigDoc;
use android_kernel_builder::error::ErrorKind;
use android_kernel_builder::planner::Plan;

fn plan_for(raw: &str) -> android_kernel_builder::Result<Plan> {
    let doc = ConfigDoc {
        path: PathBuf::from("/w/sweet.toml"),
        value: toml::from_str(raw).unwrap(),
    };
    android_kernel_builder::modules::build_plan(&doc)
}

fn order(plan: &Plan) -> Vec<String> {
    plan.ordered()
        .unwrap()
        .into_iter()
        .map(|t| t.id.clone())
        .collect()
}

fn pos(ids: &[String], id: &str) -> usize {
    ids.iter()
        .position(|t| t == id)
        .unwrap_or_else(|| panic!("{id} not planned: {ids:?}"))
}

const MINIMAL: &str = r#"
[kernel]
url = "https://github.com/example/android_kernel_xiaomi_sm6150"
branch = "lineage-21"

[build]
defconfig = "sweet_defconfig"
"#;

#[test]
fn minimal_definition_plans_the_core_pipeline() {
    let ids = order(&plan_for(MINIMAL).unwrap());
    for id in [
        "core.init",
        "kernel.clone",
        "kernel.version",
        "kernel.defconfig",
        "build.kernel",
    ] {
        pos(&ids, id);
    }
    for absent in ["kernel.vendor", "build.kconfig", "toolchain.provision", "package.anykernel3"] {
        assert!(!ids.iter().any(|t| t == absent), "{absent} should not be planned");
    }
    assert!(pos(&ids, "kernel.clone") < pos(&ids, "kernel.version"));
    assert!(pos(&ids, "kernel.defconfig") < pos(&ids, "build.kernel"));
}

#[test]
fn unknown_table_is_rejected() {
    let err = plan_for(&format!("{MINIMAL}\n[frontend]\nenabled = true\n")).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Config);
    assert!(err.to_string().contains("frontend"), "unexpected err: {err}");
}

#[test]
fn kernel_and_build_tables_are_required() {
    let err = plan_for("[kernel]\nurl = \"https://github.com/a/b\"\n").unwrap_err();
    assert!(err.to_string().contains("[build]"), "unexpected err: {err}");
}

#[test]
fn required_steps_cannot_be_disabled() {
    let err = plan_for(&format!("{MINIMAL}\n[build.steps.kernel]\nenabled = false\n")).unwrap_err();
    assert!(err.is_invalid(), "unexpected err: {err}");
}

#[test]
fn optional_steps_can_be_disabled() {
    let ids = order(&plan_for(&format!("{MINIMAL}\n[kernel.steps.version]\nenabled = false\n")).unwrap());
    assert!(!ids.iter().any(|t| t == "kernel.version"));
    pos(&ids, "kernel.defconfig");
}

#[test]
fn full_pipeline_orders_patches_before_the_build() {
    let raw = format!(
        r#"{MINIMAL}
[kernel.vendor]
url = "https://github.com/example/vendor_xiaomi_sweet"

[toolchain]
aosp_clang = true

[patch.kernelsu]
variant = "next"
version = "v1.0.5"

[patch.bbg]
enabled = true

[patch.lxc]
enabled = false

[ccache]
max_size = "2G"

[package]
mode = "anykernel3"

[publish]
mode = "release"
keep_releases = 3
"#
    );
    let plan = plan_for(&raw).unwrap();
    let ids = order(&plan);

    assert!(!ids.iter().any(|t| t == "patch.lxc"));
    assert!(pos(&ids, "kernel.clone") < pos(&ids, "kernel.vendor"));
    assert!(pos(&ids, "kernel.vendor") < pos(&ids, "kernel.version"));
    assert!(pos(&ids, "patch.kernelsu") < pos(&ids, "core.barrier.patch"));
    assert!(pos(&ids, "patch.bbg") < pos(&ids, "core.barrier.patch"));
    assert!(pos(&ids, "core.barrier.patch") < pos(&ids, "build.kernel"));
    assert!(pos(&ids, "toolchain.provision") < pos(&ids, "build.kernel"));
    assert!(pos(&ids, "ccache.restore") < pos(&ids, "build.kernel"));
    assert!(pos(&ids, "build.kernel") < pos(&ids, "ccache.save"));
    assert!(pos(&ids, "build.kernel") < pos(&ids, "package.anykernel3"));
    assert!(pos(&ids, "package.anykernel3") < pos(&ids, "publish.release"));
    assert!(pos(&ids, "publish.release") < pos(&ids, "publish.cleanup"));

    for id in ["ccache.restore", "ccache.save", "publish.cleanup"] {
        assert!(plan.get(id).unwrap().best_effort, "{id} should be best effort");
    }
    assert!(!plan.get("build.kernel").unwrap().best_effort);
}

#[test]
fn kconfig_tweaks_run_after_every_patch() {
    let raw = format!("{MINIMAL}kvm = true\n\n[patch.rekernel]\nsetup_url = \"https://github.com/x/y/raw/main/setup.sh\"\n");
    let ids = order(&plan_for(&raw).unwrap());
    assert!(pos(&ids, "patch.rekernel") < pos(&ids, "build.kconfig"));
    assert!(pos(&ids, "build.kconfig") < pos(&ids, "build.kernel"));
}

#[test]
fn package_mode_selects_one_task() {
    let ids = order(&plan_for(&format!("{MINIMAL}\n[package]\nmode = \"bootimg\"\n")).unwrap());
    pos(&ids, "package.bootimg");
    assert!(!ids.iter().any(|t| t == "package.anykernel3"));
}

#[test]
fn dot_output_names_every_task() {
    let plan = plan_for(MINIMAL).unwrap();
    let dot = plan.to_dot().unwrap();
    assert!(dot.contains("build.kernel"));
    assert!(dot.contains("kernel.defconfig"));
}
