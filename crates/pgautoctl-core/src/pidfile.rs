//! PID-file discipline.
//!
//! Exactly one keeper may drive a given PGDATA. The guard writes our PID at
//! service start and re-checks the file at the top of every reconcile tick;
//! if the file disappears or names another process, the keeper surrenders
//! with the QUIT exit code rather than risk a state-file war.

use std::path::{Path, PathBuf};

use nix::sys::signal::kill;
use nix::unistd::Pid;
use tracing::{info, warn};

use crate::error::{KeeperError, Result};

/// Owner of the keeper PID file.
#[derive(Debug)]
pub struct PidGuard {
    path: PathBuf,
    start_pid: i32,
}

impl PidGuard {
    /// Claim the PID file for the current process.
    ///
    /// A file naming a live process is a fatal conflict. A stale file left
    /// by a dead process is removed and the claim proceeds.
    ///
    /// # Errors
    ///
    /// Returns `PidConflict` when another keeper is already running, or an
    /// I/O error when the file cannot be written.
    pub fn create(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();

        if let Some(pid) = read_live_pid(&path) {
            return Err(KeeperError::PidConflict(format!(
                "an instance of this keeper is already running with PID {pid}, \
                 as seen in pid file {path:?}"
            )));
        }

        let start_pid = std::process::id() as i32;
        std::fs::write(&path, format!("{start_pid}\n"))?;
        info!(pid = start_pid, pidfile = ?path, "created pid file");

        Ok(Self { path, start_pid })
    }

    /// PID recorded at service start.
    #[must_use]
    pub const fn start_pid(&self) -> i32 {
        self.start_pid
    }

    /// Re-check ownership of the PID file.
    ///
    /// # Errors
    ///
    /// Returns `PidConflict` when the file is gone or holds a different
    /// PID; the caller must exit with the QUIT code without touching state.
    pub fn check(&self) -> Result<()> {
        match read_pid(&self.path) {
            Some(pid) if pid == self.start_pid => Ok(()),
            Some(pid) => Err(KeeperError::PidConflict(format!(
                "pid file {:?} now contains PID {pid} instead of expected PID {}",
                self.path, self.start_pid
            ))),
            None => Err(KeeperError::PidConflict(format!(
                "pid file {:?} disappeared",
                self.path
            ))),
        }
    }

    /// Remove the PID file on clean exit.
    pub fn remove(&self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(pidfile = ?self.path, "failed to remove pid file: {e}");
            }
        }
    }
}

/// Parse the PID stored in a pid file, if any.
#[must_use]
pub fn read_pid(path: &Path) -> Option<i32> {
    let contents = std::fs::read_to_string(path).ok()?;
    contents.trim().parse::<i32>().ok()
}

/// PID of a live keeper recorded in the given file.
///
/// A file naming a dead process is stale: it is removed and `None` is
/// returned, matching what an operator would do by hand.
#[must_use]
pub fn read_live_pid(path: &Path) -> Option<i32> {
    let pid = read_pid(path)?;

    if kill(Pid::from_raw(pid), None).is_ok() {
        return Some(pid);
    }

    warn!(pidfile = ?path, pid, "removing stale pid file");
    if let Err(e) = std::fs::remove_file(path) {
        warn!(pidfile = ?path, "failed to remove stale pid file: {e}");
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_and_check() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pg_autoctl.pid");

        let guard = PidGuard::create(&path).unwrap();
        assert_eq!(guard.start_pid(), std::process::id() as i32);
        guard.check().unwrap();
    }

    #[test]
    fn test_second_claim_conflicts() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pg_autoctl.pid");

        let _guard = PidGuard::create(&path).unwrap();
        // We are alive, so the second claim must see a live owner.
        assert!(matches!(
            PidGuard::create(&path),
            Err(KeeperError::PidConflict(_))
        ));
    }

    #[test]
    fn test_stolen_pid_file_detected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pg_autoctl.pid");

        let guard = PidGuard::create(&path).unwrap();
        std::fs::write(&path, "1\n").unwrap();

        assert!(matches!(guard.check(), Err(KeeperError::PidConflict(_))));
    }

    #[test]
    fn test_missing_pid_file_detected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pg_autoctl.pid");

        let guard = PidGuard::create(&path).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert!(matches!(guard.check(), Err(KeeperError::PidConflict(_))));
    }

    #[test]
    fn test_stale_pid_file_is_cleaned_up() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pg_autoctl.pid");

        // PID 0 is never a valid peer; kill(0, ...) targets the process
        // group, so use an id far beyond pid_max instead.
        std::fs::write(&path, "999999999\n").unwrap();

        assert!(read_live_pid(&path).is_none());
        assert!(!path.exists());

        let guard = PidGuard::create(&path).unwrap();
        guard.check().unwrap();
    }
}
