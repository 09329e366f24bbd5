//! Warden assembly: wires the supervisor and the update pipeline together.

use crate::config::{UpdateConfig, WardenConfig};
use crate::error::{Error, Result};
use crate::event::{create_event_channel, WardenEvent, WardenEventsChannel, WardenEventsSender};
use crate::supervisor::{Supervisor, SupervisorState};
use crate::update::{
    build_source, detect, recover, resolve_candidates, set_executable, staged_path, Fetcher,
    UpdateState, VersionChecker, VersionSource, USER_AGENT,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Builder for constructing a warden.
pub struct WardenBuilder {
    config: WardenConfig,
}

impl WardenBuilder {
    /// Create a new warden builder with the given configuration.
    #[must_use]
    pub fn new(config: WardenConfig) -> Self {
        Self { config }
    }

    /// Build the warden.
    ///
    /// Validates the configuration, repairs any half-finished swap left
    /// by a previous run, and, when the managed executable is missing,
    /// bootstraps it from the configured release source.
    ///
    /// # Errors
    ///
    /// Returns an error on invalid configuration, a failed repair, or a
    /// missing executable that cannot be obtained.
    pub async fn build(self) -> Result<RunningWarden> {
        info!("Building saorsa-warden with config: {:?}", self.config);
        self.config.validate()?;

        let target = resolve_target(&self.config.target)?;
        let update = self.config.update.clone();

        // Repair any half-finished swap before anything else looks at the disk
        if let Some(action) = recover(&target)? {
            info!("Startup recovery applied: {action:?}");
        }

        let discovery_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(update.request_timeout_secs))
            .user_agent(USER_AGENT)
            .build()?;
        let download_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(update.download_timeout_secs))
            .user_agent(USER_AGENT)
            .build()?;

        let artifact = update.artifact.clone().unwrap_or_else(|| {
            target
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default()
        });
        let source = build_source(&update, &discovery_client, &artifact);
        let fetcher = Fetcher::new(download_client);

        if !target.exists() {
            let Some(source) = source.as_deref() else {
                return Err(Error::Launch(format!(
                    "{} does not exist and no release source is configured to obtain it",
                    target.display()
                )));
            };
            bootstrap(&target, source, &fetcher, &update, &artifact).await?;
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let shutdown_tx = Arc::new(shutdown_tx);
        let (events_tx, events_rx) = create_event_channel();
        let update_state = UpdateState::new();

        let supervisor = Supervisor::new(
            target.clone(),
            self.config.supervisor.clone(),
            update_state.clone(),
            events_tx.clone(),
        );

        let checker = if update.enabled {
            source.map(|source| {
                let strategy = detect(Duration::from_secs(update.backup_grace_secs));
                info!("Swap strategy: {}", strategy.name());
                VersionChecker::new(
                    source,
                    fetcher,
                    strategy,
                    update_state.clone(),
                    events_tx.clone(),
                    target.clone(),
                    update.clone(),
                )
            })
        } else {
            debug!("Periodic update checks disabled");
            None
        };

        Ok(RunningWarden {
            config: self.config,
            target,
            shutdown_tx,
            shutdown_rx,
            events_tx,
            events_rx: Some(events_rx),
            supervisor,
            checker,
        })
    }
}

/// A running warden.
pub struct RunningWarden {
    config: WardenConfig,
    target: PathBuf,
    shutdown_tx: Arc<watch::Sender<bool>>,
    shutdown_rx: watch::Receiver<bool>,
    events_tx: WardenEventsSender,
    events_rx: Option<WardenEventsChannel>,
    supervisor: Supervisor,
    checker: Option<VersionChecker>,
}

impl std::fmt::Debug for RunningWarden {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunningWarden")
            .field("config", &self.config)
            .field("target", &self.target)
            .finish_non_exhaustive()
    }
}

/// Cloneable handle for requesting shutdown from another task.
#[derive(Clone)]
pub struct WardenHandle {
    shutdown_tx: Arc<watch::Sender<bool>>,
}

impl WardenHandle {
    /// Request the warden to shut down.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

impl RunningWarden {
    /// Path of the managed executable.
    #[must_use]
    pub fn target(&self) -> &Path {
        &self.target
    }

    /// The configuration the warden was built with.
    #[must_use]
    pub fn config(&self) -> &WardenConfig {
        &self.config
    }

    /// Get a receiver for warden events.
    ///
    /// Note: Can only be called once. Subsequent calls return None.
    pub fn events(&mut self) -> Option<WardenEventsChannel> {
        self.events_rx.take()
    }

    /// Subscribe to warden events.
    #[must_use]
    pub fn subscribe_events(&self) -> WardenEventsChannel {
        self.events_tx.subscribe()
    }

    /// Subscribe to supervisor lifecycle changes.
    #[must_use]
    pub fn supervisor_state(&self) -> watch::Receiver<SupervisorState> {
        self.supervisor.watch_state()
    }

    /// Handle that can request shutdown after `run` has taken over.
    #[must_use]
    pub fn handle(&self) -> WardenHandle {
        WardenHandle {
            shutdown_tx: Arc::clone(&self.shutdown_tx),
        }
    }

    /// Run the warden until shutdown is requested.
    ///
    /// Drives the restart loop and the periodic version checker
    /// concurrently. Ctrl-C (and SIGTERM on Unix) initiates shutdown. A
    /// fatal update error (failed swap rollback) stops the managed
    /// process and is propagated.
    ///
    /// # Errors
    ///
    /// Returns an error if the supervisor or the update pipeline hits a
    /// fatal condition.
    pub async fn run(&mut self) -> Result<()> {
        info!("Starting saorsa-warden for {}", self.target.display());
        let _ = self.events_tx.send(WardenEvent::Started);

        enum Finished {
            Supervisor(Result<()>),
            Checker(std::result::Result<Result<()>, tokio::task::JoinError>),
            Signal,
        }

        let mut checker_task = self
            .checker
            .take()
            .map(|checker| tokio::spawn(checker.run(self.shutdown_rx.clone())));

        let supervisor_fut = self.supervisor.run(self.shutdown_rx.clone());
        tokio::pin!(supervisor_fut);

        loop {
            let finished = tokio::select! {
                result = &mut supervisor_fut => Finished::Supervisor(result),
                joined = async {
                    match checker_task.as_mut() {
                        Some(task) => task.await,
                        None => std::future::pending().await,
                    }
                } => Finished::Checker(joined),
                () = shutdown_signal() => Finished::Signal,
            };

            match finished {
                Finished::Supervisor(result) => {
                    // The restart loop is done; wind the checker down too
                    let _ = self.shutdown_tx.send(true);
                    if let Some(task) = checker_task.take() {
                        match task.await {
                            Ok(Ok(())) => {}
                            Ok(Err(e)) => {
                                warn!("Version checker ended with an error during shutdown: {e}");
                            }
                            Err(e) => warn!("Version checker task failed: {e}"),
                        }
                    }
                    if result.is_ok() {
                        info!("Warden shutdown complete");
                    }
                    return result;
                }
                Finished::Checker(joined) => {
                    checker_task = None;
                    match joined {
                        Ok(Ok(())) => debug!("Version checker stopped"),
                        Ok(Err(e)) => {
                            error!("Update pipeline failed fatally: {e}");
                            let _ = self.events_tx.send(WardenEvent::Error {
                                message: e.to_string(),
                            });
                            let _ = self.shutdown_tx.send(true);
                            if let Err(sup_err) = (&mut supervisor_fut).await {
                                warn!("Supervisor error during fatal shutdown: {sup_err}");
                            }
                            return Err(e);
                        }
                        Err(e) => warn!("Version checker task failed: {e}"),
                    }
                }
                Finished::Signal => {
                    info!("Shutdown signal received");
                    let _ = self.shutdown_tx.send(true);
                }
            }
        }
    }

    /// Request the warden to shut down.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

/// Resolve once Ctrl-C (or SIGTERM on Unix) arrives.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                warn!("Cannot install SIGTERM handler: {e}");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

/// Resolve the managed executable's path.
///
/// A bare file name lands next to the warden binary itself; anything
/// with a directory component is taken as given.
fn resolve_target(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() || path.components().count() > 1 {
        return Ok(path.to_path_buf());
    }
    let exe = std::env::current_exe()
        .map_err(|e| Error::Config(format!("cannot locate the warden executable: {e}")))?;
    let dir = exe
        .parent()
        .ok_or_else(|| Error::Config("warden executable has no parent directory".to_string()))?;
    Ok(dir.join(path))
}

/// Obtain the managed executable for the first time.
///
/// Cold-start path: probe the release source, download the artifact
/// into the staged slot, and promote it to the live path.
async fn bootstrap(
    target: &Path,
    source: &dyn VersionSource,
    fetcher: &Fetcher,
    update: &UpdateConfig,
    artifact: &str,
) -> Result<()> {
    info!(
        "Managed executable {} missing; bootstrapping from {}",
        target.display(),
        source.describe()
    );

    let probe = source.probe().await?;
    let sources = resolve_candidates(&probe, artifact, &update.fallbacks);
    if sources.iter().all(|s| s.url.is_none()) {
        return Err(Error::Launch(format!(
            "cannot bootstrap: version {} advertises no artifact named '{artifact}' and no fallbacks are configured",
            probe.version
        )));
    }

    let staged = staged_path(target);
    fetcher.fetch(&sources, &staged).await?;
    std::fs::rename(&staged, target)?;
    set_executable(target)?;

    info!(
        "Bootstrapped {} at version {}",
        target.display(),
        probe.version
    );
    Ok(())
}
