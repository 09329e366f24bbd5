//! Version discovery sources.
//!
//! A [`VersionSource`] answers one question: what is the latest version,
//! and where can its artifact be downloaded? Three flavours are
//! supported: the GitHub releases API, a JSON manifest endpoint, and the
//! HEAD commit of a git repository. Version identifiers are opaque
//! strings compared only for equality, so a rolled-back release is
//! still "different" and gets installed.

use crate::config::{DiscoveryKind, DownloadFallback, UpdateConfig};
use crate::error::{Error, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

/// User agent sent with discovery and download requests.
pub const USER_AGENT: &str = concat!("saorsa-warden/", env!("CARGO_PKG_VERSION"));

const GITHUB_API: &str = "https://api.github.com";

/// A release asset advertised by a discovery source.
#[derive(Debug, Clone)]
pub struct ReleaseAsset {
    /// Asset file name.
    pub name: String,
    /// Download URL.
    pub url: String,
    /// SHA-256 checksum declared by the source, if any.
    pub checksum: Option<String>,
}

/// Outcome of a single discovery probe.
#[derive(Debug, Clone)]
pub struct VersionProbe {
    /// Opaque version identifier (release tag, manifest version, or
    /// commit id).
    pub version: String,
    /// Assets advertised for this version; may be empty.
    pub assets: Vec<ReleaseAsset>,
}

/// One place to try downloading the artifact from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadSource {
    /// Name used in logs.
    pub name: String,
    /// Download URL. `None` means the slot could not be resolved and the
    /// fetcher skips it without counting a failure.
    pub url: Option<String>,
    /// Declared SHA-256 checksum, verified after download when present.
    pub checksum: Option<String>,
}

/// A queryable release source.
#[async_trait]
pub trait VersionSource: Send + Sync {
    /// Human-readable description used in logs.
    fn describe(&self) -> String;

    /// Query the source for the latest version.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Discovery`] on transport failure, a non-success
    /// status, or an undecodable response.
    async fn probe(&self) -> Result<VersionProbe>;
}

/// Rank the places an artifact can be fetched from.
///
/// Slot 0 is the probe asset whose name matches the expected artifact
/// name (unresolved, and therefore skipped, when no asset matches);
/// configured fallbacks follow in order. Pure ordering policy, no I/O.
#[must_use]
pub fn resolve_candidates(
    probe: &VersionProbe,
    artifact: &str,
    fallbacks: &[DownloadFallback],
) -> Vec<DownloadSource> {
    let matched = probe.assets.iter().find(|a| a.name == artifact);
    let mut sources = Vec::with_capacity(fallbacks.len() + 1);
    sources.push(DownloadSource {
        name: "release asset".to_string(),
        url: matched.map(|a| a.url.clone()),
        checksum: matched.and_then(|a| a.checksum.clone()),
    });
    for fallback in fallbacks {
        sources.push(DownloadSource {
            name: fallback.name.clone(),
            url: Some(fallback.url.clone()),
            checksum: None,
        });
    }
    sources
}

/// Build the configured discovery source.
///
/// Returns `None` when the selected source is missing its required
/// setting (callers decide whether that is an error).
#[must_use]
pub fn build_source(
    config: &UpdateConfig,
    client: &reqwest::Client,
    artifact: &str,
) -> Option<Box<dyn VersionSource>> {
    match config.source {
        DiscoveryKind::Github => config.github_repo.as_ref().map(|repo| {
            Box::new(GithubSource::new(client.clone(), repo.clone())) as Box<dyn VersionSource>
        }),
        DiscoveryKind::Manifest => config.manifest_url.as_ref().map(|url| {
            Box::new(ManifestSource::new(
                client.clone(),
                url.clone(),
                artifact.to_string(),
            )) as Box<dyn VersionSource>
        }),
        DiscoveryKind::Git => config.git_url.as_ref().map(|url| {
            Box::new(GitSource::new(
                url.clone(),
                Duration::from_secs(config.request_timeout_secs),
            )) as Box<dyn VersionSource>
        }),
    }
}

/// GitHub releases API source.
///
/// Probes `GET /repos/{owner}/{repo}/releases/latest` and reports the
/// release tag plus its downloadable assets.
pub struct GithubSource {
    client: reqwest::Client,
    repo: String,
    api_base: String,
}

#[derive(Debug, Deserialize)]
struct GithubRelease {
    tag_name: String,
    #[serde(default)]
    assets: Vec<GithubReleaseAsset>,
}

#[derive(Debug, Deserialize)]
struct GithubReleaseAsset {
    name: String,
    browser_download_url: String,
}

impl GithubSource {
    /// Create a source for `repo` ("owner/name").
    #[must_use]
    pub fn new(client: reqwest::Client, repo: String) -> Self {
        Self::with_api_base(client, repo, GITHUB_API.to_string())
    }

    /// Create a source against a non-default API base URL.
    #[must_use]
    pub fn with_api_base(client: reqwest::Client, repo: String, api_base: String) -> Self {
        Self {
            client,
            repo,
            api_base,
        }
    }
}

#[async_trait]
impl VersionSource for GithubSource {
    fn describe(&self) -> String {
        format!("GitHub releases for {}", self.repo)
    }

    async fn probe(&self) -> Result<VersionProbe> {
        let url = format!("{}/repos/{}/releases/latest", self.api_base, self.repo);
        let response = self
            .client
            .get(&url)
            .header("Accept", "application/vnd.github.v3+json")
            .send()
            .await
            .map_err(|e| Error::Discovery(format!("GitHub API request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::Discovery(format!("GitHub API returned {status}")));
        }

        let release: GithubRelease = response
            .json()
            .await
            .map_err(|e| Error::Discovery(format!("invalid GitHub release response: {e}")))?;

        if release.tag_name.is_empty() {
            return Err(Error::Discovery("GitHub release has no tag name".to_string()));
        }

        Ok(VersionProbe {
            version: release.tag_name,
            assets: release
                .assets
                .into_iter()
                .map(|a| ReleaseAsset {
                    name: a.name,
                    url: a.browser_download_url,
                    checksum: None,
                })
                .collect(),
        })
    }
}

/// JSON manifest endpoint source.
///
/// The endpoint returns `{"version": ..., "download_url": ...,
/// "checksum": ...}`. The manifest is authoritative about what its URL
/// delivers, so the advertised asset is named after the expected
/// artifact and always ranks first.
pub struct ManifestSource {
    client: reqwest::Client,
    url: String,
    artifact: String,
}

#[derive(Debug, Deserialize)]
struct Manifest {
    version: String,
    #[serde(default)]
    download_url: Option<String>,
    #[serde(default)]
    checksum: Option<String>,
}

impl ManifestSource {
    /// Create a source polling `url`.
    #[must_use]
    pub fn new(client: reqwest::Client, url: String, artifact: String) -> Self {
        Self {
            client,
            url,
            artifact,
        }
    }
}

#[async_trait]
impl VersionSource for ManifestSource {
    fn describe(&self) -> String {
        format!("manifest at {}", self.url)
    }

    async fn probe(&self) -> Result<VersionProbe> {
        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(|e| Error::Discovery(format!("manifest request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::Discovery(format!("manifest endpoint returned {status}")));
        }

        let manifest: Manifest = response
            .json()
            .await
            .map_err(|e| Error::Discovery(format!("invalid manifest response: {e}")))?;

        if manifest.version.is_empty() {
            return Err(Error::Discovery("manifest has no version".to_string()));
        }

        let assets = manifest
            .download_url
            .map(|url| ReleaseAsset {
                name: self.artifact.clone(),
                url,
                checksum: manifest.checksum,
            })
            .into_iter()
            .collect();

        Ok(VersionProbe {
            version: manifest.version,
            assets,
        })
    }
}

/// Git HEAD commit source.
///
/// Runs `git ls-remote <url> HEAD` and reports the commit id as the
/// version. Advertises no assets, so downloads rely entirely on the
/// configured fallbacks.
pub struct GitSource {
    url: String,
    timeout: Duration,
}

impl GitSource {
    /// Create a source probing `url`.
    #[must_use]
    pub fn new(url: String, timeout: Duration) -> Self {
        Self { url, timeout }
    }
}

#[async_trait]
impl VersionSource for GitSource {
    fn describe(&self) -> String {
        format!("git HEAD of {}", self.url)
    }

    async fn probe(&self) -> Result<VersionProbe> {
        let output = tokio::time::timeout(
            self.timeout,
            tokio::process::Command::new("git")
                .args(["ls-remote", &self.url, "HEAD"])
                .output(),
        )
        .await
        .map_err(|_| {
            Error::Discovery(format!(
                "git ls-remote timed out after {}s",
                self.timeout.as_secs()
            ))
        })?
        .map_err(|e| Error::Discovery(format!("failed to run git: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::Discovery(format!(
                "git ls-remote failed: {}",
                stderr.trim()
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let commit = parse_ls_remote(&stdout)
            .ok_or_else(|| Error::Discovery("git ls-remote returned no HEAD commit".to_string()))?;

        Ok(VersionProbe {
            version: commit,
            assets: Vec::new(),
        })
    }
}

/// Extract the HEAD commit id from `git ls-remote` output.
fn parse_ls_remote(output: &str) -> Option<String> {
    output
        .split_whitespace()
        .next()
        .filter(|commit| !commit.is_empty())
        .map(ToString::to_string)
}
