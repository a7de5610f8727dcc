//! Subcommand implementations.
//!
//! Every command resolves its inputs, calls into the core or daemon crate,
//! prints, and maps errors onto the stable exit codes. No policy lives
//! here.

pub mod config;
pub mod create;
pub mod do_cmd;
pub mod drop;
pub mod enable;
pub mod service;
pub mod show;

use std::path::PathBuf;
use std::sync::Arc;

use pgautoctl_core::config::KeeperConfig;
use pgautoctl_core::error::{ExitCode, KeeperError, Result};
use pgautoctl_core::monitor::MonitorClient;
use pgautoctl_core::pg::PgController;
use pgautoctl_daemon::monitor_client::SqlMonitorClient;
use pgautoctl_daemon::pgctl::PgCtlController;
use tracing::error;

/// The data directory, from `--pgdata` or `$PGDATA`.
pub fn resolve_pgdata(pgdata: Option<PathBuf>) -> Result<PathBuf> {
    pgdata
        .or_else(|| std::env::var_os("PGDATA").map(PathBuf::from))
        .ok_or_else(|| {
            KeeperError::ConfigInvalid(
                "no data directory: pass --pgdata or set PGDATA".into(),
            )
        })
}

/// Load the configuration living under the given data directory.
pub fn load_config(pgdata: Option<PathBuf>) -> Result<KeeperConfig> {
    let pgdata = resolve_pgdata(pgdata)?;
    let paths = pgautoctl_core::config::Pathnames::from_pgdata(&pgdata);
    KeeperConfig::load(&paths.config)
}

/// Monitor client for a loaded configuration.
pub fn monitor_for(config: &KeeperConfig) -> Arc<dyn MonitorClient> {
    Arc::new(SqlMonitorClient::new(&config.pg_autoctl.monitor))
}

/// PostgreSQL controller for a loaded configuration.
pub fn pg_for(config: &KeeperConfig) -> Arc<dyn PgController> {
    Arc::new(PgCtlController::new(
        config.postgresql.pgdata.clone(),
        config.postgresql.pgport,
        config.postgresql.auth_method.clone(),
    ))
}

/// Log an error and turn it into the process exit code.
pub fn report(result: Result<()>) -> ExitCode {
    match result {
        Ok(()) => ExitCode::Ok,
        Err(e) => {
            error!("{e}");
            e.exit_code()
        }
    }
}
