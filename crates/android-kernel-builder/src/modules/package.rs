//! Turns the built image into something a device can flash.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use serde::Deserialize;

use android_kernel_builder_macros::{Module, Task};

use crate::config::ConfigDoc;
use crate::executor::ExecCtx;
use crate::modules::util::{self, GitCheckout, NameVars};
use crate::settings::{ArtifactConfig, PackageMode};
use crate::trust::{validate_git_url, validate_trusted_url};
use crate::{Error, Result};

fn default_true() -> bool {
    true
}

/// Files from the AnyKernel3 repository that must not end up in the zip.
const AK3_STRIP: &[&str] = &[".git", ".github", "README.md"];

pub fn package_config(doc: &ConfigDoc) -> Result<ArtifactConfig> {
    Ok(doc.deserialize_path("package")?.unwrap_or_default())
}

fn mode_is(doc: &ConfigDoc, mode: PackageMode) -> bool {
    doc.flag("package") && package_config(doc).map(|c| c.mode == mode).unwrap_or(false)
}

pub fn wants_anykernel3(doc: &ConfigDoc) -> bool {
    mode_is(doc, PackageMode::Anykernel3)
}

pub fn wants_bootimg(doc: &ConfigDoc) -> bool {
    mode_is(doc, PackageMode::Bootimg)
}

/// Expand `package.name` with what the run has learned so far.
pub fn output_name(doc: &ConfigDoc, ctx: &ExecCtx, cfg: &ArtifactConfig) -> Result<String> {
    let build = util::build_config(doc)?;
    let version = ctx
        .state()
        .kernel_version
        .map(|v| v.to_string())
        .unwrap_or_else(|| "unknown".into());
    let name = util::build_name(doc);
    let date = util::utc_stamp();
    util::expand_name_template(
        &cfg.name,
        &NameVars {
            name: &name,
            version: &version,
            date: &date,
            arch: &build.arch,
        },
    )
}

/// Point `anykernel.sh` at any device and name the kernel.
pub fn rewrite_anykernel_sh(script: &str, kernel_string: &str) -> String {
    let mut out = String::with_capacity(script.len());
    for line in script.lines() {
        let body = line.trim_start();
        let indent = &line[..line.len() - body.len()];
        let rewritten = if body.starts_with("kernel.string=") {
            Some(format!("kernel.string={kernel_string}"))
        } else if body.starts_with("do.devicecheck=") {
            Some("do.devicecheck=0".to_string())
        } else if body.starts_with("device.name")
            && let Some((key, _)) = body.split_once('=')
        {
            Some(format!("{key}="))
        } else if let Some((key, _)) = body.split_once('=')
            && key.eq_ignore_ascii_case("is_slot_device")
        {
            Some(format!("{key}=auto;"))
        } else {
            None
        };
        match rewritten {
            Some(r) => {
                out.push_str(indent);
                out.push_str(&r);
            }
            None => out.push_str(line),
        }
        out.push('\n');
    }
    out
}

fn image_from_state(ctx: &ExecCtx) -> Result<PathBuf> {
    ctx.state()
        .image
        .ok_or_else(|| Error::msg("no kernel image recorded; build.kernel must run first"))
}

fn fresh_dir(p: &Path) -> Result<()> {
    if p.exists() {
        fs::remove_dir_all(p)
            .map_err(|e| Error::msg(format!("failed to remove {}: {e}", p.display())))?;
    }
    Ok(())
}

#[Task(
    id = "package.anykernel3",
    module = "package",
    phase = "package",
    provides = ["package:output"],
    after = ["kernel:image"],
    default_label = "Package AnyKernel3 zip",
    when = wants_anykernel3
)]
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AnyKernel3Task {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub label: Option<String>,
}

impl Default for AnyKernel3Task {
    fn default() -> Self {
        Self {
            enabled: true,
            label: None,
        }
    }
}

impl AnyKernel3Task {
    pub fn run(_cfg: &Self, doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()> {
        let cfg = package_config(doc)?;
        let image = image_from_state(ctx)?;
        let ws = ctx.workspace_paths_or_init(doc)?;
        validate_git_url(&cfg.anykernel3_url, &util::trusted_domains(doc)?)?;

        let ak3 = ws.build_dir.join("anykernel3");
        fresh_dir(&ak3)?;
        util::git_clone(
            ctx,
            &GitCheckout {
                url: &cfg.anykernel3_url,
                branch: cfg.anykernel3_branch.as_deref(),
                depth: 1,
                submodules: false,
            },
            &ak3,
        )?;
        for name in AK3_STRIP {
            let p = ak3.join(name);
            if p.is_dir() {
                fs::remove_dir_all(&p)?;
            } else if p.exists() {
                fs::remove_file(&p)?;
            }
        }

        let name = output_name(doc, ctx, &cfg)?;
        let script = ak3.join("anykernel.sh");
        if script.is_file() {
            let kernel_string = cfg.kernel_string.clone().unwrap_or_else(|| name.clone());
            let raw = fs::read_to_string(&script)?;
            util::write_text(&script, &rewrite_anykernel_sh(&raw, &kernel_string))?;
        } else {
            ctx.warn(&format!("{} not found; zip will use its defaults", script.display()));
        }

        let file_name = image
            .file_name()
            .ok_or_else(|| Error::msg(format!("bad image path {}", image.display())))?;
        util::copy_file(&image, &ak3.join(file_name))?;

        let out_dir = ws.resolve_under_out(&cfg.out_dir)?;
        util::ensure_dir(&out_dir)?;
        let zip = out_dir.join(format!("{name}.zip"));
        if zip.exists() {
            fs::remove_file(&zip)?;
        }
        let mut cmd = Command::new("zip");
        cmd.arg("-r9").arg(&zip).arg(".").current_dir(&ak3);
        ctx.run_cmd(cmd)?;

        ctx.log(&format!("packaged {}", zip.display()));
        ctx.update_state(|s| s.outputs.push(zip));
        Ok(())
    }
}

/// Split the shell-quoted argument line printed by `unpack_bootimg.py --format mkbootimg`.
pub fn split_mkbootimg_args(line: &str) -> Result<Vec<String>> {
    let mut args = Vec::new();
    let mut cur = String::new();
    let mut in_word = false;
    let mut chars = line.chars();
    while let Some(c) = chars.next() {
        match c {
            '\'' => {
                in_word = true;
                loop {
                    match chars.next() {
                        Some('\'') => break,
                        Some(ch) => cur.push(ch),
                        None => return Err(Error::msg("unterminated ' in mkbootimg arguments")),
                    }
                }
            }
            '"' => {
                in_word = true;
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => {
                            if let Some(ch) = chars.next() {
                                cur.push(ch);
                            }
                        }
                        Some(ch) => cur.push(ch),
                        None => return Err(Error::msg("unterminated \" in mkbootimg arguments")),
                    }
                }
            }
            '\\' => {
                in_word = true;
                if let Some(ch) = chars.next() {
                    cur.push(ch);
                }
            }
            c if c.is_whitespace() => {
                if in_word {
                    args.push(std::mem::take(&mut cur));
                    in_word = false;
                }
            }
            c => {
                in_word = true;
                cur.push(c);
            }
        }
    }
    if in_word {
        args.push(cur);
    }
    Ok(args)
}

/// Swap the stock kernel for `image` and send the result to `output`.
pub fn repack_args(stock: Vec<String>, image: &Path, output: &Path) -> Vec<String> {
    let mut out = Vec::with_capacity(stock.len() + 4);
    let mut it = stock.into_iter();
    while let Some(a) = it.next() {
        if a == "--kernel" || a == "--output" || a == "-o" {
            it.next();
            continue;
        }
        out.push(a);
    }
    out.push("--kernel".into());
    out.push(image.display().to_string());
    out.push("--output".into());
    out.push(output.display().to_string());
    out
}

#[Task(
    id = "package.bootimg",
    module = "package",
    phase = "package",
    provides = ["package:output"],
    after = ["kernel:image"],
    default_label = "Repack boot.img",
    when = wants_bootimg
)]
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BootImgTask {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub label: Option<String>,
}

impl Default for BootImgTask {
    fn default() -> Self {
        Self {
            enabled: true,
            label: None,
        }
    }
}

impl BootImgTask {
    pub fn run(_cfg: &Self, doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()> {
        let cfg = package_config(doc)?;
        let Some(raw_url) = cfg.bootimg_url.as_deref().filter(|s| !s.trim().is_empty()) else {
            return Err(Error::config("package.mode = \"bootimg\" needs package.bootimg_url"));
        };
        let trusted = util::trusted_domains(doc)?;
        let url = validate_trusted_url(raw_url, &trusted)?;
        validate_git_url(&cfg.mkbootimg_url, &trusted)?;
        let image = image_from_state(ctx)?;
        let ws = ctx.workspace_paths_or_init(doc)?;

        let work = ws.build_dir.join("bootimg");
        fresh_dir(&work)?;
        let stock = work.join("stock-boot.img");
        ctx.log(&format!("fetching {url}"));
        let n = ctx.download(&url, &stock)?;
        ctx.log(&format!("stock boot image: {n} bytes"));

        let tool = ws.build_dir.join("mkbootimg");
        util::git_clone(
            ctx,
            &GitCheckout {
                url: &cfg.mkbootimg_url,
                branch: None,
                depth: 1,
                submodules: false,
            },
            &tool,
        )?;

        let unpacked = work.join("unpacked");
        let mut unpack = Command::new("python3");
        unpack
            .arg(tool.join("unpack_bootimg.py"))
            .arg("--boot_img")
            .arg(&stock)
            .arg("--out")
            .arg(&unpacked)
            .arg("--format")
            .arg("mkbootimg");
        let out = ctx.cmd_output(unpack)?;
        if !out.success {
            return Err(Error::command(format!(
                "unpack_bootimg.py failed: {}",
                out.stderr.trim()
            )));
        }
        let stock_args = split_mkbootimg_args(out.stdout.trim())?;
        if stock_args.is_empty() {
            return Err(Error::command("unpack_bootimg.py printed no arguments"));
        }

        let out_dir = ws.resolve_under_out(&cfg.out_dir)?;
        util::ensure_dir(&out_dir)?;
        let name = output_name(doc, ctx, &cfg)?;
        let target = out_dir.join(format!("{name}.img"));
        let mut repack = Command::new("python3");
        repack
            .arg(tool.join("mkbootimg.py"))
            .args(repack_args(stock_args, &image, &target));
        ctx.run_cmd(repack)?;

        ctx.log(&format!("packaged {}", target.display()));
        ctx.update_state(|s| s.outputs.push(target));
        Ok(())
    }
}

#[Module(
    id = "package",
    config = ArtifactConfig,
    tasks = [AnyKernel3Task, BootImgTask]
)]
pub struct PackageModule;
