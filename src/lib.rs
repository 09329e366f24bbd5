//! Self-updating process supervisor for Saorsa services.
//!
//! saorsa-warden keeps a managed executable running, restarting it with a
//! cool-down whenever it exits. A periodic checker polls a configured
//! release source (GitHub releases, a version manifest, or a git HEAD)
//! and, when the published version differs from the one last seen, stages
//! a checksum-verified download and swaps it into place. Restarts and
//! swaps are coordinated so the supervisor never relaunches a binary that
//! is mid-replacement.
//!
//! # Example
//!
//! ```no_run
//! use saorsa_warden::{WardenBuilder, WardenConfig};
//!
//! # async fn run() -> saorsa_warden::Result<()> {
//! let config = WardenConfig::default();
//! let mut warden = WardenBuilder::new(config).build().await?;
//! warden.run().await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod event;
pub mod supervisor;
pub mod update;
pub mod warden;

pub use config::WardenConfig;
pub use error::{Error, Result};
pub use event::WardenEvent;
pub use supervisor::{Supervisor, SupervisorState};
pub use warden::{RunningWarden, WardenBuilder, WardenHandle};
