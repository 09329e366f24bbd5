//! Test harness that orchestrates a release server and a managed build.
//!
//! The `TestHarness` provides a unified interface for E2E tests, managing
//! a mock release server, a scratch directory holding the managed
//! executable, and a warden running against both. Each published build is
//! a small shell script that records its own version in a shared runs
//! file, so tests can observe exactly which builds were launched and in
//! what order.

use saorsa_warden::config::{DiscoveryKind, DownloadFallback, WardenConfig};
use saorsa_warden::event::WardenEventsChannel;
use saorsa_warden::{WardenBuilder, WardenEvent, WardenHandle};
use sha2::{Digest, Sha256};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::info;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Error type for test harness operations.
#[derive(Debug, thiserror::Error)]
pub enum HarnessError {
    /// Warden error
    #[error("Warden error: {0}")]
    Warden(#[from] saorsa_warden::Error),

    /// Filesystem error
    #[error("Filesystem error: {0}")]
    Io(#[from] std::io::Error),

    /// Warden task error
    #[error("Warden task error: {0}")]
    Task(String),

    /// Condition not reached in time
    #[error("Timed out waiting for {0}")]
    Timeout(String),

    /// Warden not started
    #[error("Warden not started")]
    NotStarted,
}

/// Result type for harness operations.
pub type Result<T> = std::result::Result<T, HarnessError>;

/// Test harness that manages the complete test environment.
///
/// The harness coordinates:
/// - A mock release server publishing a manifest and build artifacts
/// - A scratch directory holding the managed executable and its runs file
/// - A warden supervising the executable in a background task
pub struct TestHarness {
    dir: tempfile::TempDir,
    server: MockServer,
    target: PathBuf,
    runs_file: PathBuf,
    handle: Option<WardenHandle>,
    events: Option<WardenEventsChannel>,
    warden_task: Option<JoinHandle<saorsa_warden::Result<()>>>,
}

impl TestHarness {
    /// Create the scratch directory and start the release server.
    ///
    /// No build is installed and no warden is running yet.
    ///
    /// # Errors
    ///
    /// Returns an error if the scratch directory cannot be created.
    pub async fn setup() -> Result<Self> {
        let dir = tempfile::tempdir()?;
        let server = MockServer::start().await;
        let target = dir.path().join("service");
        let runs_file = dir.path().join("runs.log");

        info!("Test harness up at {}", dir.path().display());

        Ok(Self {
            dir,
            server,
            target,
            runs_file,
            handle: None,
            events: None,
            warden_task: None,
        })
    }

    /// Path of the managed executable.
    #[must_use]
    pub fn target(&self) -> &Path {
        &self.target
    }

    /// Configuration pointing the warden at this harness.
    ///
    /// Uses the manifest source with aggressive timers so tests finish
    /// quickly.
    #[must_use]
    pub fn config(&self) -> WardenConfig {
        let mut config = WardenConfig::default();
        config.target = self.target.clone();
        config.log_level = "debug".to_string();
        config.supervisor.cooldown_secs = 0;
        config.supervisor.pending_wait_secs = 5;
        config.update.source = DiscoveryKind::Manifest;
        config.update.manifest_url = Some(format!("{}/latest.json", self.server.uri()));
        config.update.check_interval_secs = 1;
        config.update.request_timeout_secs = 5;
        config.update.download_timeout_secs = 10;
        config.update.backup_grace_secs = 60;
        config
    }

    /// Configuration with automatic updates disabled.
    #[must_use]
    pub fn config_supervise_only(&self) -> WardenConfig {
        let mut config = self.config();
        config.update.enabled = false;
        config
    }

    /// Configuration that also lists a mirror download location.
    ///
    /// The mirror serves whatever [`Self::publish_with_broken_primary`]
    /// last published.
    #[must_use]
    pub fn config_with_mirror(&self) -> WardenConfig {
        let mut config = self.config();
        config.update.fallbacks = vec![DownloadFallback {
            name: "mirror".to_string(),
            url: format!("{}/mirror/current", self.server.uri()),
        }];
        config
    }

    /// Shell script standing in for a build of the managed service.
    ///
    /// On launch it appends `version` to the runs file, then sleeps for
    /// `lifetime_secs` before exiting.
    #[must_use]
    pub fn build_script(&self, version: &str, lifetime_secs: u64) -> String {
        format!(
            "#!/bin/sh\necho {version} >> '{}'\nexec sleep {lifetime_secs}\n",
            self.runs_file.display()
        )
    }

    /// Install a build directly at the target path, as if already deployed.
    ///
    /// # Errors
    ///
    /// Returns an error if the script cannot be written.
    pub fn install_build(&self, version: &str, lifetime_secs: u64) -> Result<()> {
        let script = self.build_script(version, lifetime_secs);
        std::fs::write(&self.target, script)?;
        std::fs::set_permissions(&self.target, std::fs::Permissions::from_mode(0o755))?;
        Ok(())
    }

    /// Install a build that records its launch and immediately exits nonzero.
    ///
    /// # Errors
    ///
    /// Returns an error if the script cannot be written.
    pub fn install_crashing_build(&self, version: &str) -> Result<()> {
        let script = format!(
            "#!/bin/sh\necho {version} >> '{}'\nexit 3\n",
            self.runs_file.display()
        );
        std::fs::write(&self.target, script)?;
        std::fs::set_permissions(&self.target, std::fs::Permissions::from_mode(0o755))?;
        Ok(())
    }

    /// Publish a build on the release server.
    ///
    /// Replaces whatever was published before: the manifest announces
    /// `version` and the artifact endpoint serves the matching script,
    /// with its checksum in the manifest.
    pub async fn publish(&self, version: &str, lifetime_secs: u64) {
        let artifact = self.build_script(version, lifetime_secs).into_bytes();
        let checksum = hex::encode(Sha256::digest(&artifact));
        let artifact_path = format!("/builds/{version}");

        self.server.reset().await;
        Mock::given(method("GET"))
            .and(path("/latest.json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "version": version,
                "download_url": format!("{}{artifact_path}", self.server.uri()),
                "checksum": checksum,
            })))
            .mount(&self.server)
            .await;
        Mock::given(method("GET"))
            .and(path(artifact_path.as_str()))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(artifact))
            .mount(&self.server)
            .await;

        info!("Published build {version}");
    }

    /// Publish a version whose artifact download always fails.
    pub async fn publish_broken(&self, version: &str) {
        self.server.reset().await;
        Mock::given(method("GET"))
            .and(path("/latest.json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "version": version,
                "download_url": format!("{}/builds/{version}", self.server.uri()),
            })))
            .mount(&self.server)
            .await;
        Mock::given(method("GET"))
            .and(path(format!("/builds/{version}").as_str()))
            .respond_with(ResponseTemplate::new(404))
            .mount(&self.server)
            .await;

        info!("Published broken build {version}");
    }

    /// Publish a build whose announced download endpoint keeps failing.
    ///
    /// The manifest is intact, but its download URL returns 500 on every
    /// request. The same artifact is served from the mirror location that
    /// [`Self::config_with_mirror`] points at.
    pub async fn publish_with_broken_primary(&self, version: &str, lifetime_secs: u64) {
        let artifact = self.build_script(version, lifetime_secs).into_bytes();
        let checksum = hex::encode(Sha256::digest(&artifact));
        let artifact_path = format!("/builds/{version}");

        self.server.reset().await;
        Mock::given(method("GET"))
            .and(path("/latest.json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "version": version,
                "download_url": format!("{}{artifact_path}", self.server.uri()),
                "checksum": checksum,
            })))
            .mount(&self.server)
            .await;
        Mock::given(method("GET"))
            .and(path(artifact_path.as_str()))
            .respond_with(ResponseTemplate::new(500))
            .mount(&self.server)
            .await;
        Mock::given(method("GET"))
            .and(path("/mirror/current"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(artifact))
            .mount(&self.server)
            .await;

        info!("Published build {version} behind a failing primary endpoint");
    }

    /// Publish a build whose served bytes do not match the declared checksum.
    pub async fn publish_tampered(&self, version: &str) {
        let genuine = self.build_script(version, 600).into_bytes();
        let checksum = hex::encode(Sha256::digest(&genuine));
        let mut served = genuine;
        served.extend_from_slice(b"# corrupted in transit\n");

        self.server.reset().await;
        Mock::given(method("GET"))
            .and(path("/latest.json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "version": version,
                "download_url": format!("{}/builds/{version}", self.server.uri()),
                "checksum": checksum,
            })))
            .mount(&self.server)
            .await;
        Mock::given(method("GET"))
            .and(path(format!("/builds/{version}").as_str()))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(served))
            .mount(&self.server)
            .await;

        info!("Published tampered build {version}");
    }

    /// Build a warden from `config` and run it in a background task.
    ///
    /// # Errors
    ///
    /// Returns an error if the warden cannot be built.
    pub async fn start(&mut self, config: WardenConfig) -> Result<()> {
        let mut warden = WardenBuilder::new(config).build().await?;
        self.events = warden.events();
        self.handle = Some(warden.handle());
        self.warden_task = Some(tokio::spawn(async move { warden.run().await }));
        Ok(())
    }

    /// Versions launched so far, in launch order.
    #[must_use]
    pub fn runs(&self) -> Vec<String> {
        std::fs::read_to_string(&self.runs_file)
            .unwrap_or_default()
            .lines()
            .map(str::to_string)
            .collect()
    }

    /// Wait until a build with `version` has been launched.
    ///
    /// # Errors
    ///
    /// Returns [`HarnessError::Timeout`] if the build does not run in time.
    pub async fn wait_for_run(&self, version: &str, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if self.runs().iter().any(|v| v == version) {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        Err(HarnessError::Timeout(format!("run of build {version}")))
    }

    /// Wait for an event matching `matches`, discarding everything else.
    ///
    /// # Errors
    ///
    /// Returns [`HarnessError::Timeout`] if no matching event arrives in
    /// time, and [`HarnessError::NotStarted`] if the warden is not running.
    pub async fn wait_for_event<F>(
        &mut self,
        what: &str,
        matches: F,
        timeout: Duration,
    ) -> Result<WardenEvent>
    where
        F: Fn(&WardenEvent) -> bool,
    {
        let events = self.events.as_mut().ok_or(HarnessError::NotStarted)?;
        let deadline = Instant::now() + timeout;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(HarnessError::Timeout(what.to_string()));
            }
            match tokio::time::timeout(remaining, events.recv()).await {
                Ok(Ok(event)) if matches(&event) => return Ok(event),
                Ok(Ok(_)) | Ok(Err(broadcast::error::RecvError::Lagged(_))) => {}
                Ok(Err(broadcast::error::RecvError::Closed)) | Err(_) => {
                    return Err(HarnessError::Timeout(what.to_string()));
                }
            }
        }
    }

    /// Teardown the test harness.
    ///
    /// Shuts the warden down and waits for it to finish.
    ///
    /// # Errors
    ///
    /// Returns an error if the warden ended with an error.
    pub async fn teardown(mut self) -> Result<()> {
        info!("Tearing down test harness");

        if let Some(handle) = self.handle.take() {
            handle.shutdown();
        }
        if let Some(task) = self.warden_task.take() {
            task.await.map_err(|e| HarnessError::Task(e.to_string()))??;
        }

        // Keep the scratch directory alive until the warden is gone
        drop(self.dir);

        info!("Test harness teardown complete");
        Ok(())
    }
}
