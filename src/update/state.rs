//! Shared update pipeline state.
//!
//! The version checker and the process supervisor coordinate through a
//! single [`UpdatePhase`] value carried on a watch channel. The checker
//! drives `Idle -> Staging -> SwapDone` (or `SwapPending` when the swap
//! is handed to an external helper); the supervisor observes the phase
//! when the managed process exits and acknowledges `SwapDone` back to
//! `Idle` before relaunching.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Phase of the update pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UpdatePhase {
    /// No update in flight.
    #[default]
    Idle,

    /// An artifact is being downloaded and verified.
    Staging,

    /// Swap handed to an external helper that waits for process exit.
    SwapPending,

    /// Executable replaced; the next launch picks up the new binary.
    SwapDone,
}

impl UpdatePhase {
    /// Whether a restart must hold off while this phase is active.
    #[must_use]
    pub fn is_pending(self) -> bool {
        matches!(self, Self::Staging | Self::SwapPending)
    }
}

/// Cloneable handle to the update phase.
///
/// Transitions are guarded: each helper applies its edge only from the
/// expected prior phase and reports whether it took effect. Observers
/// never busy-wait; [`UpdateState::wait_while_pending`] parks on the
/// watch channel until the phase leaves `Staging`/`SwapPending` or the
/// deadline passes.
#[derive(Debug, Clone)]
pub struct UpdateState {
    tx: Arc<watch::Sender<UpdatePhase>>,
}

impl UpdateState {
    /// Create a new state handle in the `Idle` phase.
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(UpdatePhase::Idle);
        Self { tx: Arc::new(tx) }
    }

    /// Current phase.
    #[must_use]
    pub fn phase(&self) -> UpdatePhase {
        *self.tx.borrow()
    }

    /// Subscribe to phase changes.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<UpdatePhase> {
        self.tx.subscribe()
    }

    /// Claim the pipeline for a new update cycle.
    ///
    /// Succeeds only from `Idle`, which guarantees at most one staged
    /// update exists at a time.
    pub fn begin_staging(&self) -> bool {
        self.transition(UpdatePhase::Idle, UpdatePhase::Staging)
    }

    /// Record that the executable was swapped in place (direct path).
    pub fn mark_swapped(&self) -> bool {
        self.transition(UpdatePhase::Staging, UpdatePhase::SwapDone)
    }

    /// Record that the swap was handed to an external helper.
    pub fn defer_to_helper(&self) -> bool {
        self.transition(UpdatePhase::Staging, UpdatePhase::SwapPending)
    }

    /// Record that the external helper finished its swap.
    pub fn helper_finished(&self) -> bool {
        self.transition(UpdatePhase::SwapPending, UpdatePhase::SwapDone)
    }

    /// Abandon an in-flight cycle after a pipeline failure.
    pub fn abort_staging(&self) -> bool {
        self.transition(UpdatePhase::Staging, UpdatePhase::Idle)
    }

    /// Consume a completed swap before relaunching.
    ///
    /// Returns `true` when a swap was actually consumed, letting the
    /// caller log that the restart picks up a new binary.
    pub fn acknowledge_done(&self) -> bool {
        self.transition(UpdatePhase::SwapDone, UpdatePhase::Idle)
    }

    /// Reset to `Idle` from any phase.
    ///
    /// Restart liveness escape hatch: used when a pending update has
    /// overstayed its bound and the supervisor relaunches anyway.
    pub fn force_clear(&self) {
        self.tx.send_if_modified(|phase| {
            if *phase == UpdatePhase::Idle {
                false
            } else {
                *phase = UpdatePhase::Idle;
                true
            }
        });
    }

    /// Wait until the phase is no longer pending, up to `max_wait`.
    ///
    /// Returns `true` if the phase left `Staging`/`SwapPending` in time,
    /// `false` if the deadline passed first.
    pub async fn wait_while_pending(&self, max_wait: Duration) -> bool {
        let mut rx = self.tx.subscribe();
        let deadline = tokio::time::Instant::now() + max_wait;
        loop {
            if !rx.borrow_and_update().is_pending() {
                return true;
            }
            match tokio::time::timeout_at(deadline, rx.changed()).await {
                Ok(Ok(())) => {}
                // Deadline passed (or sender gone): report whatever holds now
                Ok(Err(_)) | Err(_) => return !self.phase().is_pending(),
            }
        }
    }

    fn transition(&self, from: UpdatePhase, to: UpdatePhase) -> bool {
        self.tx.send_if_modified(|phase| {
            if *phase == from {
                *phase = to;
                true
            } else {
                false
            }
        })
    }
}

impl Default for UpdateState {
    fn default() -> Self {
        Self::new()
    }
}
