use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use android_kernel_builder_macros::{Module, Task};

use crate::config::ConfigDoc;
use crate::executor::ExecCtx;
use crate::github::{self, GitHubClient, NewRelease};
use crate::modules::util::{self, NameVars};
use crate::{Error, Result};

fn default_true() -> bool {
    true
}

pub const MANIFEST_FILE: &str = "manifest.json";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PublishMode {
    #[default]
    Artifact,
    Release,
}

/// `[publish]`
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PublishConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub mode: PublishMode,
    /// Relative to the workspace out dir.
    pub artifact_dir: String,
    /// `owner/name`; falls back to `$GITHUB_REPOSITORY`.
    pub repo: Option<String>,
    pub token_env: String,
    pub api_url: String,
    /// Tag template, expanded like `package.name`.
    pub tag: String,
    /// Only releases whose tag starts with this are considered by cleanup.
    /// Defaults to `<name>-`.
    pub tag_prefix: Option<String>,
    pub release_name: Option<String>,
    pub body: String,
    pub prerelease: bool,
    pub target_commitish: Option<String>,
    /// 0 disables cleanup.
    #[serde(deserialize_with = "crate::config::int_or_string")]
    pub keep_releases: usize,
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            mode: PublishMode::Artifact,
            artifact_dir: "artifacts".into(),
            repo: None,
            token_env: "GITHUB_TOKEN".into(),
            api_url: github::DEFAULT_API_URL.into(),
            tag: "{name}-{version}-{date}".into(),
            tag_prefix: None,
            release_name: None,
            body: String::new(),
            prerelease: false,
            target_commitish: None,
            keep_releases: 0,
        }
    }
}

impl PublishConfig {
    fn tag_prefix(&self, doc: &ConfigDoc) -> String {
        self.tag_prefix
            .clone()
            .unwrap_or_else(|| format!("{}-", util::build_name(doc)))
    }
}

pub fn publish_config(doc: &ConfigDoc) -> Result<PublishConfig> {
    Ok(doc.deserialize_path("publish")?.unwrap_or_default())
}

fn mode_is(doc: &ConfigDoc, mode: PublishMode) -> bool {
    doc.flag("publish") && publish_config(doc).map(|c| c.mode == mode).unwrap_or(false)
}

pub fn wants_artifact(doc: &ConfigDoc) -> bool {
    mode_is(doc, PublishMode::Artifact)
}

pub fn wants_release(doc: &ConfigDoc) -> bool {
    mode_is(doc, PublishMode::Release)
}

pub fn wants_cleanup(doc: &ConfigDoc) -> bool {
    wants_release(doc) && publish_config(doc).map(|c| c.keep_releases > 0).unwrap_or(false)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ManifestEntry {
    pub name: String,
    pub size: u64,
    pub sha256: String,
}

/// Packaged outputs, or the bare image when nothing was packaged. Every file must exist.
fn collect_outputs(ctx: &ExecCtx) -> Result<Vec<PathBuf>> {
    let state = ctx.state();
    let files = if state.outputs.is_empty() {
        state.image.into_iter().collect()
    } else {
        state.outputs
    };
    if files.is_empty() {
        return Err(Error::msg("nothing to publish; no outputs were recorded"));
    }
    for f in &files {
        if !f.is_file() {
            return Err(Error::msg(format!("output {} does not exist", f.display())));
        }
    }
    Ok(files)
}

pub fn manifest_entry(path: &Path) -> Result<ManifestEntry> {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| Error::invalid(format!("bad output path {}", path.display())))?
        .to_string();
    let size = std::fs::metadata(path)?.len();
    Ok(ManifestEntry {
        name,
        size,
        sha256: util::sha256_file_hex(path)?,
    })
}

/// Step outputs for later workflow steps (`actions/upload-artifact` inputs).
pub fn github_output_lines(dir: &Path, name: &str) -> String {
    format!("artifact-dir={}\nartifact-name={name}\n", dir.display())
}

fn append_github_output(text: &str) -> Result<bool> {
    let Some(path) = std::env::var_os("GITHUB_OUTPUT") else {
        return Ok(false);
    };
    let mut f = OpenOptions::new().create(true).append(true).open(&path)?;
    f.write_all(text.as_bytes())?;
    Ok(true)
}

#[Task(
    id = "publish.artifact",
    module = "publish",
    phase = "publish",
    provides = ["publish:done"],
    after = ["kernel:image", "package:output?"],
    default_label = "Stage CI artifact",
    when = wants_artifact
)]
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ArtifactTask {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub label: Option<String>,
}

impl Default for ArtifactTask {
    fn default() -> Self {
        Self {
            enabled: true,
            label: None,
        }
    }
}

impl ArtifactTask {
    pub fn run(_cfg: &Self, doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()> {
        let cfg = publish_config(doc)?;
        let ws = ctx.workspace_paths_or_init(doc)?;
        let dir = ws.resolve_under_out(&cfg.artifact_dir)?;
        util::ensure_dir(&dir)?;

        let mut manifest = Vec::new();
        for f in collect_outputs(ctx)? {
            let entry = manifest_entry(&f)?;
            util::copy_file(&f, &dir.join(&entry.name))?;
            ctx.log(&format!("{} ({} bytes) sha256={}", entry.name, entry.size, entry.sha256));
            manifest.push(entry);
        }
        util::write_json_pretty(&dir.join(MANIFEST_FILE), &serde_json::to_value(&manifest)?)?;

        let name = manifest
            .first()
            .and_then(|e| Path::new(&e.name).file_stem())
            .and_then(|s| s.to_str())
            .map(str::to_string)
            .unwrap_or_else(|| util::build_name(doc));
        if append_github_output(&github_output_lines(&dir, &name))? {
            ctx.log("artifact-dir and artifact-name written to $GITHUB_OUTPUT");
        }
        Ok(())
    }
}

fn client(cfg: &PublishConfig) -> Result<GitHubClient> {
    let repo = match cfg.repo.as_deref().filter(|r| !r.trim().is_empty()) {
        Some(r) => r.trim().to_string(),
        None => std::env::var("GITHUB_REPOSITORY").map_err(|_| {
            Error::config("publish.repo is unset and $GITHUB_REPOSITORY is not available")
        })?,
    };
    let token = std::env::var(&cfg.token_env)
        .map_err(|_| Error::config(format!("release token ${} is not set", cfg.token_env)))?;
    GitHubClient::new(&cfg.api_url, &repo, &token)
}

#[Task(
    id = "publish.release",
    module = "publish",
    phase = "publish",
    provides = ["publish:done", "publish:release"],
    after = ["kernel:image", "package:output?"],
    default_label = "Publish GitHub release",
    when = wants_release
)]
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReleaseTask {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub label: Option<String>,
}

impl Default for ReleaseTask {
    fn default() -> Self {
        Self {
            enabled: true,
            label: None,
        }
    }
}

impl ReleaseTask {
    pub fn run(_cfg: &Self, doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()> {
        let cfg = publish_config(doc)?;
        let files = collect_outputs(ctx)?;
        let build = util::build_config(doc)?;
        let version = ctx
            .state()
            .kernel_version
            .map(|v| v.to_string())
            .unwrap_or_else(|| "unknown".into());
        let name = util::build_name(doc);
        let date = util::utc_stamp();
        let tag = util::expand_name_template(
            &cfg.tag,
            &NameVars {
                name: &name,
                version: &version,
                date: &date,
                arch: &build.arch,
            },
        )?;
        let title = cfg.release_name.clone().unwrap_or_else(|| tag.clone());

        let gh = client(&cfg)?;
        let release = gh.create_release(&NewRelease {
            tag_name: &tag,
            name: &title,
            body: &cfg.body,
            prerelease: cfg.prerelease,
            target_commitish: cfg.target_commitish.as_deref(),
        })?;
        ctx.log(&format!("created release {} ({})", release.tag_name, release.html_url));
        for f in &files {
            ctx.log(&format!("uploading {}", f.display()));
            gh.upload_asset(&release, f)?;
        }
        Ok(())
    }
}

#[Task(
    id = "publish.cleanup",
    module = "publish",
    phase = "publish",
    provides = ["publish:cleanup"],
    after = ["publish:release"],
    default_label = "Prune old releases",
    when = wants_cleanup,
    best_effort = true
)]
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CleanupTask {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub label: Option<String>,
}

impl Default for CleanupTask {
    fn default() -> Self {
        Self {
            enabled: true,
            label: None,
        }
    }
}

impl CleanupTask {
    pub fn run(_cfg: &Self, doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()> {
        let cfg = publish_config(doc)?;
        let prefix = cfg.tag_prefix(doc);
        let gh = client(&cfg)?;
        let releases = gh.list_releases()?;
        let prune = github::releases_to_prune(&releases, &prefix, cfg.keep_releases);
        ctx.log(&format!(
            "{} release(s) match '{prefix}', keeping {}, deleting {}",
            releases.iter().filter(|r| r.tag_name.starts_with(&prefix)).count(),
            cfg.keep_releases,
            prune.len()
        ));
        let mut failed = 0;
        for r in prune {
            let res = gh.delete_release(r).and_then(|_| gh.delete_tag(&r.tag_name));
            match res {
                Ok(()) => ctx.log(&format!("deleted {}", r.tag_name)),
                Err(e) => {
                    failed += 1;
                    ctx.warn(&format!("could not delete {}: {e}", r.tag_name));
                }
            }
        }
        if failed > 0 {
            return Err(Error::http(format!("{failed} release(s) could not be deleted")));
        }
        Ok(())
    }
}

#[Module(
    id = "publish",
    config = PublishConfig,
    tasks = [ArtifactTask, ReleaseTask, CleanupTask]
)]
pub struct PublishModule;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_and_gating() {
        let doc = ConfigDoc::parse("/w/sweet.toml", "[publish]\nmode = \"release\"\nkeep_releases = 3\n")
            .expect("doc");
        assert!(wants_release(&doc));
        assert!(wants_cleanup(&doc));
        assert!(!wants_artifact(&doc));
        let cfg = publish_config(&doc).expect("cfg");
        assert_eq!(cfg.token_env, "GITHUB_TOKEN");
        assert_eq!(cfg.tag_prefix(&doc), "sweet-");

        let plain = ConfigDoc::parse("/w/sweet.toml", "[publish]\n").expect("doc");
        assert!(wants_artifact(&plain));
        assert!(!wants_cleanup(&plain));
    }

    #[test]
    fn manifest_entry_hashes_file() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let p = tmp.path().join("sweet.zip");
        std::fs::write(&p, b"abc").expect("write");
        let e = manifest_entry(&p).expect("entry");
        assert_eq!(e.name, "sweet.zip");
        assert_eq!(e.size, 3);
        assert_eq!(
            e.sha256,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn github_output_format() {
        assert_eq!(
            github_output_lines(Path::new("/w/out/artifacts"), "sweet-4.14"),
            "artifact-dir=/w/out/artifacts\nartifact-name=sweet-4.14\n"
        );
    }
}
