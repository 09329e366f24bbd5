//! Managed process supervision.
//!
//! The supervisor owns the managed process: it launches the executable,
//! waits for it to exit, and relaunches it after a cool-down. Before
//! every relaunch it consults the shared [`UpdateState`]: a restart
//! never races an in-flight download or swap, but the wait is bounded,
//! so a wedged update can delay a restart, not prevent it.

use crate::config::SupervisorConfig;
use crate::error::{Error, Result};
use crate::event::{WardenEvent, WardenEventsSender};
use crate::update::{helper_swap_finished, UpdatePhase, UpdateState};
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Interval between on-disk marker probes while a helper swap is pending.
const HELPER_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Lifecycle of the supervised process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SupervisorState {
    /// No process launched yet.
    #[default]
    Stopped,
    /// Launch in progress.
    Starting,
    /// Managed process is running.
    Running,
    /// Managed process exited; restart not yet begun.
    Exited,
    /// Between exit and the next launch.
    Restarting,
    /// External cancellation observed; no further restarts.
    ShuttingDown,
}

/// A running managed process.
#[derive(Debug)]
pub struct ManagedProcess {
    child: Child,
    pid: u32,
    started_at: DateTime<Utc>,
}

impl ManagedProcess {
    /// Operating system process id.
    #[must_use]
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// When the process was launched.
    #[must_use]
    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }
}

/// Launches, watches, and restarts the managed executable.
pub struct Supervisor {
    target: PathBuf,
    config: SupervisorConfig,
    update_state: UpdateState,
    events: WardenEventsSender,
    state_tx: watch::Sender<SupervisorState>,
    process: Option<ManagedProcess>,
    last_exit: Option<ExitStatus>,
    ever_ran: bool,
}

impl Supervisor {
    /// Create a supervisor for the executable at `target`.
    #[must_use]
    pub fn new(
        target: PathBuf,
        config: SupervisorConfig,
        update_state: UpdateState,
        events: WardenEventsSender,
    ) -> Self {
        let (state_tx, _) = watch::channel(SupervisorState::Stopped);
        Self {
            target,
            config,
            update_state,
            events,
            state_tx,
            process: None,
            last_exit: None,
            ever_ran: false,
        }
    }

    /// Path of the supervised executable.
    #[must_use]
    pub fn target(&self) -> &Path {
        &self.target
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn current_state(&self) -> SupervisorState {
        *self.state_tx.borrow()
    }

    /// Subscribe to lifecycle state changes.
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<SupervisorState> {
        self.state_tx.subscribe()
    }

    /// Exit status of the most recent process instance.
    #[must_use]
    pub fn last_exit(&self) -> Option<ExitStatus> {
        self.last_exit
    }

    /// Launch the managed executable; no-op if it is already running.
    ///
    /// The process inherits the warden's standard streams and
    /// environment and runs with the executable's directory as its
    /// working directory.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Launch`] when the executable is missing or
    /// cannot be spawned.
    pub fn start(&mut self) -> Result<()> {
        if self.process.is_some() {
            return Ok(());
        }
        self.set_state(SupervisorState::Starting);

        if !self.target.exists() {
            return Err(Error::Launch(format!(
                "{} does not exist",
                self.target.display()
            )));
        }

        let mut command = Command::new(&self.target);
        if let Some(dir) = self.target.parent() {
            command.current_dir(dir);
        }
        // If the warden itself dies, do not leave an orphan behind
        command.kill_on_drop(true);

        let child = command.spawn().map_err(|e| {
            Error::Launch(format!("cannot spawn {}: {e}", self.target.display()))
        })?;
        let pid = child.id().unwrap_or(0);
        info!("Managed process started (pid {pid})");
        let _ = self.events.send(WardenEvent::ProcessStarted { pid });

        self.process = Some(ManagedProcess {
            child,
            pid,
            started_at: Utc::now(),
        });
        self.ever_ran = true;
        self.set_state(SupervisorState::Running);
        Ok(())
    }

    /// Terminate the managed process if one is running; idempotent.
    pub async fn stop(&mut self) {
        if let Some(mut process) = self.process.take() {
            info!("Stopping managed process (pid {})", process.pid);
            if let Err(e) = process.child.start_kill() {
                warn!("Could not signal managed process: {e}");
            }
            match process.child.wait().await {
                Ok(status) => {
                    self.last_exit = Some(status);
                    debug!("Managed process stopped");
                }
                Err(e) => warn!("Error waiting for managed process to stop: {e}"),
            }
        }
    }

    /// Run the restart loop until shutdown.
    ///
    /// Exits are logged (normal vs. abnormal), the update gate and the
    /// cool-down are applied, and the executable is relaunched. The
    /// shutdown signal wins at every suspension point; once observed,
    /// the managed process is stopped exactly once and the loop returns.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Launch`] when the executable cannot be started
    /// cold, or when relaunching keeps failing past the retry budget.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        if !self.launch_with_retries(&mut shutdown).await? {
            self.enter_shutdown();
            return Ok(());
        }

        loop {
            let exited = tokio::select! {
                status = Self::wait_child(&mut self.process) => Some(status),
                () = shutdown_requested(&mut shutdown) => None,
            };
            let Some(status) = exited else {
                self.enter_shutdown();
                self.stop().await;
                return Ok(());
            };
            self.handle_exit(status);

            let proceed = tokio::select! {
                () = self.pause_before_restart() => true,
                () = shutdown_requested(&mut shutdown) => false,
            };
            if !proceed {
                self.enter_shutdown();
                return Ok(());
            }

            self.set_state(SupervisorState::Restarting);
            info!("Restarting managed process");
            if !self.launch_with_retries(&mut shutdown).await? {
                self.enter_shutdown();
                return Ok(());
            }
        }
    }

    /// Update gate followed by the anti-crash-loop cool-down.
    async fn pause_before_restart(&self) {
        self.gate_on_update().await;
        tokio::time::sleep(Duration::from_secs(self.config.cooldown_secs)).await;
    }

    /// Hold the restart while an update is in flight.
    ///
    /// While the pipeline is `Staging` this parks on the phase channel.
    /// While it is `SwapPending` the swap belongs to a detached helper
    /// that acts on our process's exit, so the on-disk markers (staged
    /// artifact consumed, backup present) are probed instead. Both
    /// waits share one deadline; past it the phase is cleared and the
    /// restart proceeds, trading strict ordering for availability.
    async fn gate_on_update(&self) {
        let max_wait = Duration::from_secs(self.config.pending_wait_secs);
        let deadline = tokio::time::Instant::now() + max_wait;
        let mut rx = self.update_state.subscribe();

        loop {
            let phase = *rx.borrow_and_update();
            match phase {
                UpdatePhase::Idle | UpdatePhase::SwapDone => break,
                UpdatePhase::Staging => {
                    debug!("Restart held: update staging in progress");
                    match tokio::time::timeout_at(deadline, rx.changed()).await {
                        Ok(Ok(())) => {}
                        Ok(Err(_)) => break,
                        Err(_) => {
                            warn!(
                                "Update still staging after {}s; clearing it and restarting anyway",
                                max_wait.as_secs()
                            );
                            self.update_state.force_clear();
                            break;
                        }
                    }
                }
                UpdatePhase::SwapPending => {
                    if helper_swap_finished(&self.target) {
                        info!("Helper swap confirmed on disk");
                        self.update_state.helper_finished();
                        continue;
                    }
                    debug!("Restart held: waiting for helper swap markers");
                    match tokio::time::timeout_at(deadline, tokio::time::sleep(HELPER_POLL_INTERVAL))
                        .await
                    {
                        Ok(()) => {}
                        Err(_) => {
                            warn!(
                                "Helper swap not confirmed after {}s; clearing it and restarting anyway",
                                max_wait.as_secs()
                            );
                            self.update_state.force_clear();
                            break;
                        }
                    }
                }
            }
        }

        if self.update_state.acknowledge_done() {
            info!("Restarting into the updated executable");
        }
    }

    /// Launch, retrying on failure after a cool-down.
    ///
    /// Returns `Ok(false)` when shutdown interrupted the retry wait. A
    /// failure with no prior successful run is fatal immediately: there
    /// is nothing to keep alive.
    async fn launch_with_retries(&mut self, shutdown: &mut watch::Receiver<bool>) -> Result<bool> {
        let mut attempts: u32 = 0;
        loop {
            match self.start() {
                Ok(()) => return Ok(true),
                Err(e) => {
                    if !self.ever_ran {
                        error!("Cannot launch managed executable: {e}");
                        return Err(e);
                    }
                    attempts += 1;
                    if attempts >= self.config.max_launch_retries {
                        error!("Giving up after {attempts} failed launch attempts");
                        return Err(e);
                    }
                    warn!(
                        "Launch failed ({e}); attempt {attempts}/{} retries after cool-down",
                        self.config.max_launch_retries
                    );
                    let cooldown = tokio::time::sleep(Duration::from_secs(self.config.cooldown_secs));
                    tokio::select! {
                        () = cooldown => {}
                        () = shutdown_requested(shutdown) => return Ok(false),
                    }
                }
            }
        }
    }

    async fn wait_child(process: &mut Option<ManagedProcess>) -> Option<ExitStatus> {
        match process.as_mut() {
            Some(p) => match p.child.wait().await {
                Ok(status) => Some(status),
                Err(e) => {
                    warn!("Could not observe process exit: {e}");
                    None
                }
            },
            None => std::future::pending().await,
        }
    }

    fn handle_exit(&mut self, status: Option<ExitStatus>) {
        let uptime = self
            .process
            .as_ref()
            .map(|p| Utc::now().signed_duration_since(p.started_at).num_seconds());
        self.process = None;
        if let Some(status) = status {
            self.last_exit = Some(status);
        }
        self.set_state(SupervisorState::Exited);

        let uptime = uptime.unwrap_or(0);
        match status {
            Some(s) if s.success() => info!("Managed process exited normally after {uptime}s"),
            Some(s) => match s.code() {
                Some(code) => warn!("Managed process exited with code {code} after {uptime}s"),
                None => warn!("Managed process terminated by a signal after {uptime}s"),
            },
            None => warn!("Managed process exit status unavailable"),
        }
        let _ = self.events.send(WardenEvent::ProcessExited {
            code: status.and_then(|s| s.code()),
        });
    }

    fn enter_shutdown(&self) {
        self.set_state(SupervisorState::ShuttingDown);
        let _ = self.events.send(WardenEvent::ShuttingDown);
    }

    fn set_state(&self, state: SupervisorState) {
        self.state_tx.send_replace(state);
    }
}

/// Resolve once the shutdown flag is raised (or its sender is gone).
async fn shutdown_requested(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}
