//! Configuration for saorsa-warden.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Release source used for version discovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiscoveryKind {
    /// GitHub releases API (latest release tag and its assets).
    #[default]
    Github,
    /// JSON manifest endpoint describing the latest version.
    Manifest,
    /// Git repository HEAD commit id.
    Git,
}

/// Warden configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WardenConfig {
    /// Managed executable. A bare file name is resolved next to the warden
    /// binary at startup; an absolute path is used as-is.
    #[serde(default = "default_target")]
    pub target: PathBuf,

    /// Restart loop configuration.
    #[serde(default)]
    pub supervisor: SupervisorConfig,

    /// Update pipeline configuration.
    #[serde(default)]
    pub update: UpdateConfig,

    /// Log level.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// Restart loop configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
    /// Seconds to wait between a process exit and the next launch.
    #[serde(default = "default_cooldown")]
    pub cooldown_secs: u64,

    /// Maximum seconds a restart will wait for an in-flight update before
    /// clearing it and relaunching anyway.
    #[serde(default = "default_pending_wait")]
    pub pending_wait_secs: u64,

    /// Consecutive launch failures tolerated before the warden gives up.
    #[serde(default = "default_max_launch_retries")]
    pub max_launch_retries: u32,
}

/// Update pipeline configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateConfig {
    /// Enable periodic update checks.
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Release source to poll.
    #[serde(default)]
    pub source: DiscoveryKind,

    /// GitHub repository ("owner/name"), required for the github source.
    #[serde(default)]
    pub github_repo: Option<String>,

    /// Manifest endpoint URL, required for the manifest source.
    #[serde(default)]
    pub manifest_url: Option<String>,

    /// Git repository URL, required for the git source.
    #[serde(default)]
    pub git_url: Option<String>,

    /// Release asset name expected for this platform. Defaults to the
    /// managed executable's file name.
    #[serde(default)]
    pub artifact: Option<String>,

    /// Extra download locations tried, in order, after the release asset.
    #[serde(default)]
    pub fallbacks: Vec<DownloadFallback>,

    /// Seconds between update checks.
    #[serde(default = "default_check_interval")]
    pub check_interval_secs: u64,

    /// Seconds allowed for a discovery request.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Seconds allowed for a full artifact download.
    #[serde(default = "default_download_timeout")]
    pub download_timeout_secs: u64,

    /// Seconds the replaced executable is kept as a backup after a swap.
    #[serde(default = "default_backup_grace")]
    pub backup_grace_secs: u64,
}

/// A named fallback download location.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadFallback {
    /// Human-readable name used in logs.
    pub name: String,

    /// Download URL.
    pub url: String,
}

impl Default for WardenConfig {
    fn default() -> Self {
        Self {
            target: default_target(),
            supervisor: SupervisorConfig::default(),
            update: UpdateConfig::default(),
            log_level: default_log_level(),
        }
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            cooldown_secs: default_cooldown(),
            pending_wait_secs: default_pending_wait(),
            max_launch_retries: default_max_launch_retries(),
        }
    }
}

impl Default for UpdateConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            source: DiscoveryKind::default(),
            github_repo: None,
            manifest_url: None,
            git_url: None,
            artifact: None,
            fallbacks: Vec::new(),
            check_interval_secs: default_check_interval(),
            request_timeout_secs: default_request_timeout(),
            download_timeout_secs: default_download_timeout(),
            backup_grace_secs: default_backup_grace(),
        }
    }
}

fn default_target() -> PathBuf {
    PathBuf::from("saorsa-node")
}

fn default_log_level() -> String {
    "info".to_string()
}

const fn default_cooldown() -> u64 {
    3
}

const fn default_pending_wait() -> u64 {
    60
}

const fn default_max_launch_retries() -> u32 {
    3
}

const fn default_enabled() -> bool {
    true
}

const fn default_check_interval() -> u64 {
    300 // 5 minutes
}

const fn default_request_timeout() -> u64 {
    30
}

const fn default_download_timeout() -> u64 {
    300
}

const fn default_backup_grace() -> u64 {
    5
}

/// Default location of the warden configuration file.
#[must_use]
pub fn default_config_path() -> PathBuf {
    directories::ProjectDirs::from("", "", "saorsa")
        .map(|dirs| dirs.config_dir().join("warden.toml"))
        .unwrap_or_else(|| PathBuf::from("warden.toml"))
}

impl WardenConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| crate::Error::Config(e.to_string()))
    }

    /// Save configuration to a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn to_file(&self, path: &std::path::Path) -> crate::Result<()> {
        let content = toml::to_string_pretty(self).map_err(|e| crate::Error::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Check cross-field consistency.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if periodic updates are enabled but the
    /// selected discovery source is missing its required setting.
    pub fn validate(&self) -> crate::Result<()> {
        if !self.update.enabled {
            return Ok(());
        }
        let missing = match self.update.source {
            DiscoveryKind::Github => self.update.github_repo.is_none().then_some("update.github_repo"),
            DiscoveryKind::Manifest => self.update.manifest_url.is_none().then_some("update.manifest_url"),
            DiscoveryKind::Git => self.update.git_url.is_none().then_some("update.git_url"),
        };
        match missing {
            Some(field) => Err(crate::Error::Config(format!(
                "update source '{:?}' requires {field}",
                self.update.source
            ))),
            None => Ok(()),
        }
    }
}
