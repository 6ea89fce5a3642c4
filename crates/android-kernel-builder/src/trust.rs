//! Input validation for values that end up on a command line or in a download.

use reqwest::Url;

use crate::error::{Error, Result};

/// Hosts that scripts, archives and boot images may be fetched from.
pub const TRUSTED_DOMAINS: &[&str] = &[
    "github.com",
    "raw.githubusercontent.com",
    "objects.githubusercontent.com",
    "codeload.github.com",
    "gitlab.com",
    "codeberg.org",
    "gitee.com",
    "bitbucket.org",
    "android.googlesource.com",
    "kernel.org",
    "dl.google.com",
];

/// Reject values that git, make or a script would parse as an option.
pub fn validate_cli_value(what: &str, value: &str) -> Result<()> {
    if value.trim_start().starts_with('-') {
        return Err(Error::invalid(format!(
            "{what} '{value}' must not start with '-'"
        )));
    }
    Ok(())
}

fn host_matches(host: &str, domain: &str) -> bool {
    let domain = domain.trim().trim_end_matches('.').to_ascii_lowercase();
    if domain.is_empty() {
        return false;
    }
    host == domain
        || host
            .strip_suffix(domain.as_str())
            .is_some_and(|rest| rest.ends_with('.'))
}

/// Parse `raw` and require `https` plus a host equal to, or under, a trusted domain.
pub fn validate_trusted_url(raw: &str, extra_domains: &[String]) -> Result<Url> {
    validate_cli_value("url", raw)?;
    let url = Url::parse(raw.trim())
        .map_err(|e| Error::invalid(format!("invalid url '{raw}': {e}")))?;
    if url.scheme() != "https" {
        return Err(Error::invalid(format!(
            "url '{raw}' must use https (got {})",
            url.scheme()
        )));
    }
    let Some(host) = url.host_str().map(str::to_ascii_lowercase) else {
        return Err(Error::invalid(format!("url '{raw}' has no host")));
    };
    let trusted = TRUSTED_DOMAINS
        .iter()
        .copied()
        .chain(extra_domains.iter().map(String::as_str))
        .any(|d| host_matches(&host, d));
    if !trusted {
        return Err(Error::invalid(format!(
            "url host '{host}' is not in the trusted domain list"
        )));
    }
    Ok(url)
}

/// Git remotes follow the download rules; scp-style `git@host:path` remotes are refused.
pub fn validate_git_url(raw: &str, extra_domains: &[String]) -> Result<Url> {
    if raw.trim().starts_with("git@") {
        return Err(Error::invalid(format!(
            "ssh remote '{raw}' is not allowed; use an https url"
        )));
    }
    validate_trusted_url(raw, extra_domains)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trusted_https_urls_pass() {
        for url in [
            "https://github.com/tiann/KernelSU",
            "https://raw.githubusercontent.com/tiann/KernelSU/main/kernel/setup.sh",
            "https://android.googlesource.com/platform/prebuilts/clang/host/linux-x86/+archive/refs/heads/android12-release/clang-r416183b.tar.gz",
            "https://cdn.kernel.org/pub/linux/kernel/v6.x/linux-6.1.tar.xz",
        ] {
            assert!(validate_trusted_url(url, &[]).is_ok(), "{url}");
        }
    }

    #[test]
    fn plain_http_is_rejected() {
        let err = validate_trusted_url("http://github.com/a/b", &[]).unwrap_err();
        assert!(err.is_invalid());
        assert!(err.to_string().contains("https"));
    }

    #[test]
    fn lookalike_hosts_are_rejected() {
        for url in [
            "https://evilgithub.com/a/b",
            "https://github.com.evil.io/a/b",
            "https://example.org/setup.sh",
        ] {
            let err = validate_trusted_url(url, &[]).unwrap_err();
            assert!(err.is_invalid(), "{url}");
        }
    }

    #[test]
    fn extra_domains_extend_the_list() {
        let extra = vec!["git.example.org".to_string()];
        assert!(validate_trusted_url("https://git.example.org/k.git", &extra).is_ok());
        assert!(validate_trusted_url("https://mirror.git.example.org/k.git", &extra).is_ok());
        assert!(validate_trusted_url("https://example.org/k.git", &extra).is_err());
    }

    #[test]
    fn hyphen_prefixed_values_are_rejected() {
        let err = validate_cli_value("branch", "--upload-pack=touch /tmp/x").unwrap_err();
        assert!(err.is_invalid());
        assert!(validate_cli_value("branch", "android12-5.10").is_ok());
        assert!(validate_git_url("-uhttps://github.com/a/b", &[]).is_err());
    }

    #[test]
    fn scp_style_remotes_are_rejected() {
        assert!(validate_git_url("git@github.com:tiann/KernelSU.git", &[]).is_err());
    }
}
