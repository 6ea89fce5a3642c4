//! Minimal GitHub releases client over the REST API.

use std::fs;
use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

pub const DEFAULT_API_URL: &str = "https://api.github.com";
const API_VERSION: &str = "2022-11-28";

#[derive(Debug, Clone, Deserialize)]
pub struct Release {
    pub id: u64,
    pub tag_name: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub draft: bool,
    #[serde(default)]
    pub prerelease: bool,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub upload_url: String,
    #[serde(default)]
    pub html_url: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct NewRelease<'a> {
    pub tag_name: &'a str,
    pub name: &'a str,
    pub body: &'a str,
    pub prerelease: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_commitish: Option<&'a str>,
}

/// `owner/name`, nothing else.
pub fn validate_repo(repo: &str) -> Result<()> {
    let ok = repo.split_once('/').is_some_and(|(o, n)| {
        let part = |s: &str| {
            !s.is_empty()
                && !s.starts_with('-')
                && !s.starts_with('.')
                && s.chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        };
        part(o) && part(n)
    });
    if ok {
        Ok(())
    } else {
        Err(Error::invalid(format!(
            "'{repo}' is not a GitHub repository of the form owner/name"
        )))
    }
}

/// `https://uploads.github.com/.../assets{?name,label}` without the URI template part.
pub fn upload_base(upload_url: &str) -> &str {
    match upload_url.find('{') {
        Some(i) => &upload_url[..i],
        None => upload_url,
    }
}

/// Releases beyond the newest `keep` whose tag starts with `prefix`. Drafts are left alone.
pub fn releases_to_prune<'a>(releases: &'a [Release], prefix: &str, keep: usize) -> Vec<&'a Release> {
    let mut matching: Vec<&Release> = releases
        .iter()
        .filter(|r| !r.draft && r.tag_name.starts_with(prefix))
        .collect();
    matching.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
    matching.into_iter().skip(keep).collect()
}

pub struct GitHubClient {
    api: String,
    repo: String,
    token: String,
    http: Client,
}

impl GitHubClient {
    pub fn new(api: &str, repo: &str, token: &str) -> Result<Self> {
        validate_repo(repo)?;
        if token.trim().is_empty() {
            return Err(Error::config("GitHub token is empty"));
        }
        let http = Client::builder()
            .timeout(Duration::from_secs(60 * 10))
            .user_agent(concat!("android-kernel-builder/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::http(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            api: api.trim_end_matches('/').to_string(),
            repo: repo.to_string(),
            token: token.trim().to_string(),
            http,
        })
    }

    fn authed(&self, req: RequestBuilder) -> RequestBuilder {
        req.bearer_auth(&self.token)
            .header(ACCEPT, "application/vnd.github+json")
            .header("X-GitHub-Api-Version", API_VERSION)
    }

    fn repo_url(&self, tail: &str) -> String {
        format!("{}/repos/{}/{}", self.api, self.repo, tail)
    }

    fn check(what: &str, res: Response) -> Result<Response> {
        if res.status().is_success() {
            return Ok(res);
        }
        let status = res.status();
        let body = res.text().unwrap_or_default();
        Err(Error::http(format!(
            "{what} failed with status {status}: {}",
            body.trim()
        )))
    }

    pub fn create_release(&self, new: &NewRelease<'_>) -> Result<Release> {
        let res = self
            .authed(self.http.post(self.repo_url("releases")))
            .json(new)
            .send()
            .map_err(|e| Error::http(format!("create release failed: {e}")))?;
        Ok(Self::check("create release", res)?.json()?)
    }

    pub fn upload_asset(&self, release: &Release, path: &Path) -> Result<()> {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| Error::invalid(format!("bad asset path {}", path.display())))?;
        let body = fs::read(path)
            .map_err(|e| Error::msg(format!("failed to read {}: {e}", path.display())))?;
        let mut url = reqwest::Url::parse(upload_base(&release.upload_url))
            .map_err(|e| Error::http(format!("bad upload url '{}': {e}", release.upload_url)))?;
        url.query_pairs_mut().append_pair("name", name);
        let res = self
            .authed(self.http.post(url))
            .header(CONTENT_TYPE, "application/octet-stream")
            .body(body)
            .send()
            .map_err(|e| Error::http(format!("upload of {name} failed: {e}")))?;
        Self::check(&format!("upload of {name}"), res)?;
        Ok(())
    }

    pub fn list_releases(&self) -> Result<Vec<Release>> {
        let mut all = Vec::new();
        for page in 1u32.. {
            let mut url = reqwest::Url::parse(&self.repo_url("releases"))
                .map_err(|e| Error::http(format!("bad API url: {e}")))?;
            url.query_pairs_mut()
                .append_pair("per_page", "100")
                .append_pair("page", &page.to_string());
            let res = self
                .authed(self.http.get(url))
                .send()
                .map_err(|e| Error::http(format!("list releases failed: {e}")))?;
            let batch: Vec<Release> = Self::check("list releases", res)?.json()?;
            let done = batch.len() < 100;
            all.extend(batch);
            if done {
                break;
            }
        }
        Ok(all)
    }

    pub fn delete_release(&self, release: &Release) -> Result<()> {
        let res = self
            .authed(self.http.delete(self.repo_url(&format!("releases/{}", release.id))))
            .send()
            .map_err(|e| Error::http(format!("delete release failed: {e}")))?;
        Self::check(&format!("delete release {}", release.tag_name), res)?;
        Ok(())
    }

    pub fn delete_tag(&self, tag: &str) -> Result<()> {
        let res = self
            .authed(self.http.delete(self.repo_url(&format!("git/refs/tags/{tag}"))))
            .send()
            .map_err(|e| Error::http(format!("delete tag failed: {e}")))?;
        Self::check(&format!("delete tag {tag}"), res)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rel(id: u64, tag: &str, day: u32) -> Release {
        Release {
            id,
            tag_name: tag.into(),
            name: None,
            draft: false,
            prerelease: false,
            created_at: format!("2026-01-{day:02}T00:00:00Z").parse().expect("date"),
            upload_url: String::new(),
            html_url: String::new(),
        }
    }

    #[test]
    fn prune_keeps_newest_matching() {
        let mut draft = rel(9, "sweet-9", 9);
        draft.draft = true;
        let rs = vec![
            rel(1, "sweet-1", 1),
            rel(3, "sweet-3", 3),
            rel(2, "other-2", 2),
            rel(4, "sweet-4", 4),
            draft,
        ];
        let prune: Vec<&str> = releases_to_prune(&rs, "sweet-", 2)
            .into_iter()
            .map(|r| r.tag_name.as_str())
            .collect();
        assert_eq!(prune, vec!["sweet-1"]);
        assert!(releases_to_prune(&rs, "sweet-", 5).is_empty());
    }

    #[test]
    fn upload_template_is_stripped() {
        assert_eq!(
            upload_base("https://uploads.github.com/repos/a/b/releases/1/assets{?name,label}"),
            "https://uploads.github.com/repos/a/b/releases/1/assets"
        );
    }

    #[test]
    fn repo_shape() {
        assert!(validate_repo("octo/kernel_ci").is_ok());
        assert!(validate_repo("octo").is_err());
        assert!(validate_repo("octo/../x").is_err());
        assert!(validate_repo("-x/y").is_err());
    }
}
