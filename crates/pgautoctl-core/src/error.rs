//! Error kinds and exit codes.
//!
//! Every failure in the keeper maps to one of a small set of kinds, and
//! every kind maps to a stable process exit code. The logger is an observer
//! of errors, never the channel that carries them.

use std::path::PathBuf;

/// Errors produced by the keeper control core.
#[derive(Debug, thiserror::Error)]
pub enum KeeperError {
    /// The configuration file is missing, unparsable, or inconsistent.
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    /// The on-disk state record could not be read back.
    #[error("corrupt state file {path:?}: {reason}")]
    StateCorrupt {
        /// Path of the offending state file.
        path: PathBuf,
        /// What the reader rejected.
        reason: String,
    },

    /// The PID file is gone or names another process. Fatal: the keeper
    /// surrenders immediately without touching state.
    #[error("pid file conflict: {0}")]
    PidConflict(String),

    /// A PostgreSQL operation failed. Retried on the next tick.
    #[error("postgres controller failure: {0}")]
    PgControllerFailure(String),

    /// The monitor could not be reached. Retried on the next tick; triggers
    /// the partition check when the node is a primary.
    #[error("monitor unreachable: {0}")]
    MonitorUnreachable(String),

    /// An FSM action program failed part-way. `current_role` is unchanged.
    #[error("transition {from} -> {to} failed: {reason}")]
    TransitionFailure {
        /// Role the keeper was in when the program started.
        from: String,
        /// Role the program was driving toward.
        to: String,
        /// The failing step.
        reason: String,
    },

    /// A bug or an unrecoverable runtime condition. Fatal.
    #[error("internal error: {0}")]
    Internal(String),

    /// Underlying I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl KeeperError {
    /// Short name of the error kind, used in the HTTP error JSON.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::ConfigInvalid(_) => "ConfigInvalid",
            Self::StateCorrupt { .. } => "StateCorrupt",
            Self::PidConflict(_) => "PidConflict",
            Self::PgControllerFailure(_) => "PgControllerFailure",
            Self::MonitorUnreachable(_) => "MonitorUnreachable",
            Self::TransitionFailure { .. } => "TransitionFailure",
            Self::Internal(_) => "InternalError",
            Self::Io(_) => "InternalError",
        }
    }

    /// Whether this kind terminates the process rather than the tick.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::PidConflict(_) | Self::Internal(_) | Self::Io(_)
        )
    }

    /// The exit code the process uses when this error is fatal.
    #[must_use]
    pub const fn exit_code(&self) -> ExitCode {
        match self {
            Self::ConfigInvalid(_) => ExitCode::BadConfig,
            Self::StateCorrupt { .. } => ExitCode::BadState,
            Self::PidConflict(_) => ExitCode::Quit,
            Self::PgControllerFailure(_) => ExitCode::PgCtl,
            Self::MonitorUnreachable(_) => ExitCode::Monitor,
            Self::TransitionFailure { .. } => ExitCode::BadState,
            Self::Internal(_) | Self::Io(_) => ExitCode::Internal,
        }
    }
}

/// Convenience alias used throughout the core crates.
pub type Result<T> = std::result::Result<T, KeeperError>;

/// Stable process exit codes.
///
/// Scripts and the test harness rely on these values; do not renumber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ExitCode {
    /// Success.
    Ok = 0,
    /// Unexpected internal failure.
    Internal = 1,
    /// Clean surrender: graceful stop, or the PID guard tripped.
    Quit = 2,
    /// Command-line arguments were rejected.
    BadArgs = 3,
    /// Configuration file was rejected.
    BadConfig = 4,
    /// State file was rejected or an FSM transition is stuck.
    BadState = 5,
    /// A SQL-level PostgreSQL failure.
    PgSql = 6,
    /// A pg_ctl-level PostgreSQL failure.
    PgCtl = 7,
    /// The monitor refused or could not be reached.
    Monitor = 8,
}

impl ExitCode {
    /// Numeric value handed to `std::process::exit`.
    #[must_use]
    pub const fn value(self) -> i32 {
        self as i32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes_are_stable() {
        assert_eq!(ExitCode::Ok.value(), 0);
        assert_eq!(ExitCode::Internal.value(), 1);
        assert_eq!(ExitCode::Quit.value(), 2);
        assert_eq!(ExitCode::BadArgs.value(), 3);
        assert_eq!(ExitCode::BadConfig.value(), 4);
        assert_eq!(ExitCode::BadState.value(), 5);
        assert_eq!(ExitCode::PgSql.value(), 6);
        assert_eq!(ExitCode::PgCtl.value(), 7);
        assert_eq!(ExitCode::Monitor.value(), 8);
    }

    #[test]
    fn test_fatal_kinds() {
        assert!(KeeperError::PidConflict("stolen".into()).is_fatal());
        assert!(KeeperError::Internal("bug".into()).is_fatal());
        assert!(!KeeperError::MonitorUnreachable("down".into()).is_fatal());
        assert!(!KeeperError::PgControllerFailure("pg_ctl".into()).is_fatal());
    }

    #[test]
    fn test_pid_conflict_exits_with_quit() {
        let err = KeeperError::PidConflict("pid file disappeared".into());
        assert_eq!(err.exit_code(), ExitCode::Quit);
    }

    #[test]
    fn test_kind_names() {
        let err = KeeperError::StateCorrupt {
            path: PathBuf::from("/tmp/pg_autoctl.state"),
            reason: "short read".into(),
        };
        assert_eq!(err.kind(), "StateCorrupt");
    }
}
