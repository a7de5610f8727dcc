//! `pg_autoctl run|stop|reload`.
//!
//! `run` hosts the service in the foreground. `stop` and `reload` talk to
//! a running service through its PID file and plain Unix signals.

use std::path::PathBuf;

use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use pgautoctl_core::error::{ExitCode, KeeperError, Result};
use pgautoctl_core::pidfile;
use tracing::info;

use super::{load_config, report};

/// Run the keeper service until it is asked to stop.
pub async fn run(pgdata: Option<PathBuf>) -> ExitCode {
    let config = match load_config(pgdata) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("{e}");
            return e.exit_code();
        }
    };

    pgautoctl_daemon::service::run(config).await
}

/// Signal the running service to stop.
pub fn stop(pgdata: Option<PathBuf>, fast: bool) -> ExitCode {
    let signal = if fast { Signal::SIGINT } else { Signal::SIGTERM };
    report(signal_service(pgdata, signal))
}

/// Signal the running service to reload its configuration.
pub fn reload(pgdata: Option<PathBuf>) -> ExitCode {
    report(signal_service(pgdata, Signal::SIGHUP))
}

fn signal_service(pgdata: Option<PathBuf>, signal: Signal) -> Result<()> {
    let config = load_config(pgdata)?;
    let pid_path = config.pathnames().pid;

    let pid = pidfile::read_live_pid(&pid_path).ok_or_else(|| {
        KeeperError::ConfigInvalid(format!(
            "no keeper service is running (pid file {pid_path:?})"
        ))
    })?;

    kill(Pid::from_raw(pid), signal)
        .map_err(|e| KeeperError::Internal(format!("failed to signal pid {pid}: {e}")))?;

    info!(pid, ?signal, "signalled the keeper service");
    Ok(())
}
