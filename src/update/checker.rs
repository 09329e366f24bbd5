//! Periodic version checking and the update pipeline.
//!
//! The checker polls a [`VersionSource`] on a timer. The first
//! successful probe only records a baseline identifier; afterwards any
//! identifier that differs from the baseline (equality, not ordering,
//! so rollbacks count too) triggers one update cycle: resolve download
//! candidates, fetch and verify an artifact, swap it in. The baseline
//! advances only when the cycle succeeds, so a failed version is
//! retried on a later check.

use crate::config::UpdateConfig;
use crate::error::Result;
use crate::event::{WardenEvent, WardenEventsSender};
use crate::update::fetch::Fetcher;
use crate::update::source::{resolve_candidates, DownloadSource, VersionProbe, VersionSource};
use crate::update::state::UpdateState;
use crate::update::swap::{staged_path, SwapOutcome, SwapStrategy};
use chrono::{DateTime, Utc};
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Last version identifier accepted from the discovery source.
#[derive(Debug, Clone)]
pub struct VersionRecord {
    /// Opaque identifier; compared only for equality.
    pub version: String,
    /// When the identifier was observed.
    pub observed_at: DateTime<Utc>,
}

/// Outcome of a single check cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckOutcome {
    /// First successful probe; identifier recorded, no update triggered.
    Baseline,
    /// Identifier matches the baseline.
    Unchanged,
    /// New identifier but no usable download location; not an update.
    NoArtifact,
    /// Artifact downloaded and swapped in.
    Updated,
    /// Artifact staged; an external helper swaps after process exit.
    Deferred,
    /// Pipeline failed; baseline kept so this version is retried.
    Failed,
    /// Discovery failed this cycle; retried on the next tick.
    Unavailable,
    /// A previous cycle still holds the pipeline.
    Busy,
}

/// Periodic actor that discovers new versions and installs them.
pub struct VersionChecker {
    source: Box<dyn VersionSource>,
    fetcher: Fetcher,
    strategy: Box<dyn SwapStrategy>,
    state: UpdateState,
    events: WardenEventsSender,
    target: PathBuf,
    artifact: String,
    config: UpdateConfig,
    baseline: Option<VersionRecord>,
}

impl VersionChecker {
    /// Create a checker for the executable at `target`.
    #[must_use]
    pub fn new(
        source: Box<dyn VersionSource>,
        fetcher: Fetcher,
        strategy: Box<dyn SwapStrategy>,
        state: UpdateState,
        events: WardenEventsSender,
        target: PathBuf,
        config: UpdateConfig,
    ) -> Self {
        let artifact = config.artifact.clone().unwrap_or_else(|| {
            target
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default()
        });
        Self {
            source,
            fetcher,
            strategy,
            state,
            events,
            target,
            artifact,
            config,
            baseline: None,
        }
    }

    /// Last accepted version identifier, if any probe has succeeded.
    #[must_use]
    pub fn baseline(&self) -> Option<&VersionRecord> {
        self.baseline.as_ref()
    }

    /// Run one check cycle.
    ///
    /// Transient failures (discovery, download, checksum, swap) are
    /// contained here and reported through the returned outcome.
    ///
    /// # Errors
    ///
    /// Returns an error only for conditions fatal to the whole warden,
    /// currently a failed swap rollback.
    pub async fn check_once(&mut self) -> Result<CheckOutcome> {
        let probe = match self.source.probe().await {
            Ok(probe) => probe,
            Err(e) => {
                warn!("Version check against {} failed: {e}", self.source.describe());
                return Ok(CheckOutcome::Unavailable);
            }
        };

        match &self.baseline {
            None => {
                info!("Version baseline recorded: {}", probe.version);
                self.advance_baseline(&probe.version);
                Ok(CheckOutcome::Baseline)
            }
            Some(record) if record.version == probe.version => {
                debug!("No update: still at {}", record.version);
                Ok(CheckOutcome::Unchanged)
            }
            Some(record) => {
                info!(
                    "Version change detected: {} -> {}",
                    record.version, probe.version
                );
                self.run_pipeline(&probe).await
            }
        }
    }

    /// Run the periodic check loop until shutdown.
    ///
    /// The first check fires immediately, later checks every configured
    /// interval. Shutdown is honored between cycles; an in-flight cycle
    /// finishes rather than being interrupted mid-swap.
    ///
    /// # Errors
    ///
    /// Returns the fatal error when a cycle escalates one (see
    /// [`Self::check_once`]); the caller is expected to shut the warden
    /// down in response.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let period = Duration::from_secs(self.config.check_interval_secs);
        info!(
            "Version checker polling {} every {}s",
            self.source.describe(),
            period.as_secs()
        );

        // First tick fires immediately; a slow cycle delays the next tick
        // instead of bursting to catch up
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                result = shutdown.changed() => {
                    if result.is_err() || *shutdown.borrow() {
                        debug!("Version checker stopping");
                        return Ok(());
                    }
                    continue;
                }
            }

            self.check_once().await?;
        }
    }

    async fn run_pipeline(&mut self, probe: &VersionProbe) -> Result<CheckOutcome> {
        let sources = resolve_candidates(probe, &self.artifact, &self.config.fallbacks);
        if sources.iter().all(|s| s.url.is_none()) {
            info!(
                "Version {} advertises no artifact named '{}'; treating as no update",
                probe.version, self.artifact
            );
            return Ok(CheckOutcome::NoArtifact);
        }

        // Claiming the pipeline also tells the supervisor to hold restarts
        if !self.state.begin_staging() {
            warn!(
                "Update pipeline busy (phase {:?}); skipping this cycle",
                self.state.phase()
            );
            return Ok(CheckOutcome::Busy);
        }
        let _ = self.events.send(WardenEvent::UpdateAvailable {
            version: probe.version.clone(),
        });

        match self.stage_and_swap(probe, &sources).await {
            Ok(SwapOutcome::Completed) => {
                self.state.mark_swapped();
                self.advance_baseline(&probe.version);
                let _ = self.events.send(WardenEvent::UpdateComplete {
                    version: probe.version.clone(),
                });
                info!(
                    "Update to {} complete; the next restart runs the new build",
                    probe.version
                );
                Ok(CheckOutcome::Updated)
            }
            Ok(SwapOutcome::Deferred { helper }) => {
                self.state.defer_to_helper();
                self.advance_baseline(&probe.version);
                let _ = self.events.send(WardenEvent::UpdateDeferred {
                    version: probe.version.clone(),
                });
                info!(
                    "Update to {} deferred to {}; swap happens once the process exits",
                    probe.version,
                    helper.display()
                );
                Ok(CheckOutcome::Deferred)
            }
            Err(e) => {
                let _ = self.events.send(WardenEvent::UpdateFailed {
                    version: probe.version.clone(),
                    reason: e.to_string(),
                });
                if e.is_fatal() {
                    // Leave the staged artifact in place: after a failed
                    // rollback it may be the only intact binary, and the
                    // startup recovery pass knows how to promote it.
                    self.state.abort_staging();
                    return Err(e);
                }
                let _ = std::fs::remove_file(staged_path(&self.target));
                self.state.abort_staging();
                warn!(
                    "Update to {} failed: {e}; will retry on a later check",
                    probe.version
                );
                Ok(CheckOutcome::Failed)
            }
        }
    }

    async fn stage_and_swap(
        &self,
        probe: &VersionProbe,
        sources: &[DownloadSource],
    ) -> Result<SwapOutcome> {
        let destination = staged_path(&self.target);
        let artifact = self.fetcher.fetch(sources, &destination).await?;
        let _ = self.events.send(WardenEvent::UpdateStaged {
            version: probe.version.clone(),
            bytes: artifact.bytes,
        });
        self.strategy.swap(&self.target)
    }

    fn advance_baseline(&mut self, version: &str) {
        self.baseline = Some(VersionRecord {
            version: version.to_string(),
            observed_at: Utc::now(),
        });
    }
}
