//! Warden event system.

use tokio::sync::broadcast;

/// Events emitted by the warden.
#[derive(Debug, Clone)]
pub enum WardenEvent {
    /// Warden has started successfully.
    Started,

    /// Warden is shutting down.
    ShuttingDown,

    /// Managed process launched.
    ProcessStarted {
        /// Operating system process id.
        pid: u32,
    },

    /// Managed process exited.
    ProcessExited {
        /// Exit code, if the process terminated normally.
        code: Option<i32>,
    },

    /// A newer version was discovered and an update cycle began.
    UpdateAvailable {
        /// New version identifier.
        version: String,
    },

    /// Artifact downloaded and verified, ready to swap.
    UpdateStaged {
        /// Version identifier being installed.
        version: String,
        /// Downloaded artifact size in bytes.
        bytes: u64,
    },

    /// Executable swapped in place.
    UpdateComplete {
        /// New version identifier.
        version: String,
    },

    /// Swap handed off to an external helper, finishes once the process exits.
    UpdateDeferred {
        /// Version identifier being installed.
        version: String,
    },

    /// An update cycle failed and will be retried on a later check.
    UpdateFailed {
        /// Version identifier that failed to install.
        version: String,
        /// Failure description.
        reason: String,
    },

    /// Error occurred.
    Error {
        /// Error message.
        message: String,
    },
}

/// Channel for receiving warden events.
pub type WardenEventsChannel = broadcast::Receiver<WardenEvent>;

/// Sender for warden events.
pub type WardenEventsSender = broadcast::Sender<WardenEvent>;

/// Create a new event channel pair.
#[must_use]
pub fn create_event_channel() -> (WardenEventsSender, WardenEventsChannel) {
    broadcast::channel(256)
}
