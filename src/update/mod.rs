//! Self-update pipeline.
//!
//! This module handles:
//! - Polling a release source for new versions
//! - Downloading and checksum-verifying artifacts into a staged slot
//! - Atomically swapping the live executable, with rollback support
//! - Sharing pipeline state with the restart loop so the two never race

mod checker;
mod fetch;
mod source;
mod state;
mod swap;

pub use checker::{CheckOutcome, VersionChecker, VersionRecord};
pub use fetch::{Fetcher, StagedArtifact};
pub use source::{
    build_source, resolve_candidates, DownloadSource, GithubSource, GitSource, ManifestSource,
    ReleaseAsset, VersionProbe, VersionSource, USER_AGENT,
};
pub use state::{UpdatePhase, UpdateState};
pub use swap::{
    backup_path, detect, helper_swap_finished, recover, staged_path, DirectSwap, HelperSwap,
    RecoveryAction, SwapOutcome, SwapStrategy,
};
pub(crate) use swap::set_executable;
