//! Executable replacement.
//!
//! Swapping the live executable is the only part of the pipeline that
//! differs by platform. Where the OS allows renaming a file that a
//! running process has open, [`DirectSwap`] renames `live -> backup`
//! then `staged -> live` and schedules the backup for removal after a
//! grace period. Where it does not (Windows), [`HelperSwap`] writes a
//! detached batch script that waits for the managed process to vanish,
//! performs the same rename sequence, and deletes itself.
//!
//! On-disk layout around a live executable `service`:
//! `service.new` (staged artifact), `service.old` (backup), and on
//! helper platforms an ephemeral `service.swap.bat`. Suffixes are
//! appended, so `service.exe` stages as `service.exe.new` and the
//! helper's process-name wait still matches the live image name.

use crate::error::{Error, Result};
use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Outcome of a swap attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SwapOutcome {
    /// Live executable replaced in place.
    Completed,

    /// Swap handed to a detached helper that waits for process exit.
    Deferred {
        /// Path of the helper script; it removes itself after the swap.
        helper: PathBuf,
    },
}

/// Action taken by the startup recovery pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryAction {
    /// Live executable restored from the backup slot.
    RestoredBackup,

    /// Staged artifact promoted to live (no backup existed).
    PromotedStaged,
}

/// Platform capability for replacing the live executable.
///
/// Exactly two implementations exist and [`detect`] selects one at
/// startup; no other code branches on the platform.
pub trait SwapStrategy: Send + Sync {
    /// Strategy name used in logs.
    fn name(&self) -> &'static str;

    /// Replace `live` with the staged artifact sitting next to it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Swap`] when the staged artifact is missing or a
    /// rename fails, and [`Error::RollbackFailed`] when a failed swap
    /// could not be undone.
    fn swap(&self, live: &Path) -> Result<SwapOutcome>;
}

/// Select the swap strategy for the current platform.
#[must_use]
pub fn detect(backup_grace: Duration) -> Box<dyn SwapStrategy> {
    if cfg!(windows) {
        Box::new(HelperSwap::new())
    } else {
        Box::new(DirectSwap::new(backup_grace))
    }
}

/// Staged artifact path next to `live`.
#[must_use]
pub fn staged_path(live: &Path) -> PathBuf {
    append_suffix(live, ".new")
}

/// Backup slot path next to `live`.
#[must_use]
pub fn backup_path(live: &Path) -> PathBuf {
    append_suffix(live, ".old")
}

fn helper_path(live: &Path) -> PathBuf {
    append_suffix(live, ".swap.bat")
}

fn append_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().map(OsStr::to_os_string).unwrap_or_default();
    name.push(suffix);
    path.with_file_name(name)
}

/// Whether the on-disk layout shows a deferred swap has completed:
/// staged artifact consumed and a backup left behind.
#[must_use]
pub fn helper_swap_finished(live: &Path) -> bool {
    !staged_path(live).exists() && backup_path(live).exists()
}

/// Repair the on-disk layout after an interrupted swap.
///
/// Runs once at startup, before anything is launched. A missing live
/// executable is restored from the backup slot, or, failing that,
/// filled by promoting a staged artifact. A stale staged artifact next
/// to a healthy live executable is left alone; the next update cycle
/// overwrites it.
///
/// # Errors
///
/// Returns [`Error::Swap`] if a repair rename fails.
pub fn recover(live: &Path) -> Result<Option<RecoveryAction>> {
    let staged = staged_path(live);
    let helper = helper_path(live);

    if live.exists() {
        // A helper that already swapped but failed to self-delete is stale
        if helper.exists() && !staged.exists() {
            let _ = fs::remove_file(&helper);
        }
        return Ok(None);
    }

    // The live executable is gone: a swap was interrupted. Any helper
    // belonging to that swap is dead weight now.
    if helper.exists() {
        let _ = fs::remove_file(&helper);
    }

    let backup = backup_path(live);
    if backup.exists() {
        fs::rename(&backup, live)
            .map_err(|e| Error::Swap(format!("cannot restore backup after interrupted swap: {e}")))?;
        warn!(
            "Restored {} from backup after an interrupted swap",
            live.display()
        );
        return Ok(Some(RecoveryAction::RestoredBackup));
    }

    if staged.exists() {
        fs::rename(&staged, live)
            .map_err(|e| Error::Swap(format!("cannot promote staged artifact: {e}")))?;
        set_executable(live)?;
        info!("Promoted staged artifact to {}", live.display());
        return Ok(Some(RecoveryAction::PromotedStaged));
    }

    Ok(None)
}

/// Set executable permission bits (no-op on Windows).
pub(crate) fn set_executable(path: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o755)).map_err(|e| {
            Error::Swap(format!(
                "cannot set executable permission on {}: {e}",
                path.display()
            ))
        })?;
    }
    let _ = path;
    Ok(())
}

/// Rename-in-place strategy for platforms that allow replacing a
/// running executable's file.
pub struct DirectSwap {
    backup_grace: Duration,
}

impl DirectSwap {
    /// Create a strategy retaining backups for `backup_grace`.
    #[must_use]
    pub fn new(backup_grace: Duration) -> Self {
        Self { backup_grace }
    }
}

impl SwapStrategy for DirectSwap {
    fn name(&self) -> &'static str {
        "direct rename"
    }

    fn swap(&self, live: &Path) -> Result<SwapOutcome> {
        let staged = staged_path(live);
        let backup = backup_path(live);

        if !staged.exists() {
            return Err(Error::Swap(format!(
                "no staged artifact at {}",
                staged.display()
            )));
        }

        fs::rename(live, &backup)
            .map_err(|e| Error::Swap(format!("cannot move live executable aside: {e}")))?;

        if let Err(swap_err) = fs::rename(&staged, live) {
            // Put the previous executable back before reporting
            return match fs::rename(&backup, live) {
                Ok(()) => Err(Error::Swap(format!(
                    "cannot activate staged executable: {swap_err}"
                ))),
                Err(rollback_err) => Err(Error::RollbackFailed(format!(
                    "activation failed ({swap_err}) and restoring the backup also failed ({rollback_err})"
                ))),
            };
        }

        set_executable(live)?;
        schedule_backup_removal(backup, self.backup_grace);
        info!("Swapped {} into place", live.display());
        Ok(SwapOutcome::Completed)
    }
}

/// Remove the backup slot once the grace period has passed.
fn schedule_backup_removal(backup: PathBuf, grace: Duration) {
    tokio::spawn(async move {
        tokio::time::sleep(grace).await;
        match tokio::fs::remove_file(&backup).await {
            Ok(()) => debug!("Removed backup {}", backup.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Could not remove backup {}: {e}", backup.display()),
        }
    });
}

/// Detached-helper strategy for platforms that forbid replacing a
/// running executable (Windows).
pub struct HelperSwap;

impl HelperSwap {
    /// Create the helper-script strategy.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Default for HelperSwap {
    fn default() -> Self {
        Self::new()
    }
}

impl SwapStrategy for HelperSwap {
    fn name(&self) -> &'static str {
        "detached helper"
    }

    fn swap(&self, live: &Path) -> Result<SwapOutcome> {
        let staged = staged_path(live);
        if !staged.exists() {
            return Err(Error::Swap(format!(
                "no staged artifact at {}",
                staged.display()
            )));
        }

        let helper = helper_path(live);
        let script = helper_script(live)?;
        fs::write(&helper, script)
            .map_err(|e| Error::Swap(format!("cannot write swap helper: {e}")))?;

        spawn_detached(&helper)?;
        info!("Swap helper launched: {}", helper.display());
        Ok(SwapOutcome::Deferred { helper })
    }
}

/// Batch script that waits for the live image to disappear from the
/// process table, performs the rename sequence, and removes itself.
fn helper_script(live: &Path) -> Result<String> {
    let image = live
        .file_name()
        .and_then(OsStr::to_str)
        .ok_or_else(|| Error::Swap(format!("invalid executable name: {}", live.display())))?;

    Ok(format!(
        "@echo off\r\n\
         :wait\r\n\
         timeout /t 1 /nobreak >nul\r\n\
         tasklist /FI \"IMAGENAME eq {image}\" 2>NUL | find /I \"{image}\" >nul\r\n\
         if not errorlevel 1 goto wait\r\n\
         move /Y \"{live}\" \"{backup}\" >nul\r\n\
         move /Y \"{staged}\" \"{live}\" >nul\r\n\
         del \"%~f0\"\r\n",
        image = image,
        live = live.display(),
        backup = backup_path(live).display(),
        staged = staged_path(live).display(),
    ))
}

fn spawn_detached(helper: &Path) -> Result<()> {
    #[cfg(windows)]
    {
        std::process::Command::new("cmd")
            .args(["/C", "start", "", "/min"])
            .arg(helper)
            .spawn()
            .map_err(|e| Error::Swap(format!("cannot launch swap helper: {e}")))?;
        Ok(())
    }
    #[cfg(not(windows))]
    {
        let _ = helper;
        Err(Error::Swap(
            "helper-based swap requires a platform with cmd.exe".to_string(),
        ))
    }
}
