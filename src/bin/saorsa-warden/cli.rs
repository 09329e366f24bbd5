//! Command-line interface definition.

use clap::{Parser, ValueEnum};
use saorsa_warden::config::{default_config_path, DiscoveryKind, WardenConfig};
use std::path::PathBuf;

/// Self-updating process supervisor for Saorsa services.
#[derive(Parser, Debug)]
#[command(name = "saorsa-warden")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Managed executable to supervise.
    #[arg(long, short, env = "SAORSA_WARDEN_TARGET")]
    pub target: Option<PathBuf>,

    /// Where new versions are discovered.
    #[arg(long, value_enum, env = "SAORSA_WARDEN_SOURCE")]
    pub source: Option<CliDiscoverySource>,

    /// GitHub repository (owner/name) to poll for releases.
    #[arg(long, env = "SAORSA_WARDEN_GITHUB_REPO")]
    pub github_repo: Option<String>,

    /// URL of a version manifest to poll.
    #[arg(long, env = "SAORSA_WARDEN_MANIFEST_URL")]
    pub manifest_url: Option<String>,

    /// Git repository whose HEAD commit names the latest version.
    #[arg(long, env = "SAORSA_WARDEN_GIT_URL")]
    pub git_url: Option<String>,

    /// Release asset to download (defaults to the target's file name).
    #[arg(long, env = "SAORSA_WARDEN_ARTIFACT")]
    pub artifact: Option<String>,

    /// Seconds between version checks.
    #[arg(long, env = "SAORSA_WARDEN_CHECK_INTERVAL")]
    pub check_interval: Option<u64>,

    /// Seconds to wait before restarting an exited process.
    #[arg(long, env = "SAORSA_WARDEN_COOLDOWN")]
    pub cooldown: Option<u64>,

    /// Disable automatic updates (supervise only).
    #[arg(long)]
    pub no_auto_update: bool,

    /// Log level.
    #[arg(long, default_value = "info", env = "RUST_LOG")]
    pub log_level: String,

    /// Path to configuration file.
    #[arg(long, short)]
    pub config: Option<PathBuf>,
}

/// Discovery source CLI enum.
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum CliDiscoverySource {
    /// GitHub releases API.
    Github,
    /// JSON version manifest over HTTP.
    Manifest,
    /// Git remote HEAD.
    Git,
}

impl Cli {
    /// Convert CLI arguments into a WardenConfig.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file is specified but cannot be loaded.
    pub fn into_config(self) -> color_eyre::Result<WardenConfig> {
        // Start with the config file (explicit, or the default location
        // when one exists there) and let CLI arguments override it
        let mut config = if let Some(ref path) = self.config {
            WardenConfig::from_file(path)?
        } else {
            let default = default_config_path();
            if default.exists() {
                WardenConfig::from_file(&default)?
            } else {
                WardenConfig::default()
            }
        };

        if let Some(target) = self.target {
            config.target = target;
        }
        if let Some(source) = self.source {
            config.update.source = source.into();
        }
        if let Some(repo) = self.github_repo {
            config.update.github_repo = Some(repo);
        }
        if let Some(url) = self.manifest_url {
            config.update.manifest_url = Some(url);
        }
        if let Some(url) = self.git_url {
            config.update.git_url = Some(url);
        }
        if let Some(artifact) = self.artifact {
            config.update.artifact = Some(artifact);
        }
        if let Some(secs) = self.check_interval {
            config.update.check_interval_secs = secs;
        }
        if let Some(secs) = self.cooldown {
            config.supervisor.cooldown_secs = secs;
        }
        if self.no_auto_update {
            config.update.enabled = false;
        }

        config.log_level = self.log_level;

        Ok(config)
    }
}

impl From<CliDiscoverySource> for DiscoveryKind {
    fn from(s: CliDiscoverySource) -> Self {
        match s {
            CliDiscoverySource::Github => DiscoveryKind::Github,
            CliDiscoverySource::Manifest => DiscoveryKind::Manifest,
            CliDiscoverySource::Git => DiscoveryKind::Git,
        }
    }
}
