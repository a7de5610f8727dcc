//! `pg_autoctl enable|disable {secondary|maintenance}`.

use std::path::PathBuf;

use clap::Subcommand;
use pgautoctl_core::error::{ExitCode, Result};
use pgautoctl_core::state::StateStore;
use tracing::info;

use super::{load_config, monitor_for, report};

/// Features `enable` can turn on.
#[derive(Subcommand, Debug)]
pub enum EnableCommands {
    /// Allow this node's formation to run with a secondary
    Secondary,

    /// Put this node into maintenance
    Maintenance,
}

/// Features `disable` can turn off.
#[derive(Subcommand, Debug)]
pub enum DisableCommands {
    /// Forbid this node's formation from running with a secondary
    Secondary,

    /// Bring this node back from maintenance
    Maintenance,
}

/// Route an `enable` subcommand.
pub async fn dispatch_enable(command: EnableCommands, pgdata: Option<PathBuf>) -> ExitCode {
    match command {
        EnableCommands::Secondary => report(secondary(pgdata, true).await),
        EnableCommands::Maintenance => report(maintenance(pgdata, true).await),
    }
}

/// Route a `disable` subcommand.
pub async fn dispatch_disable(command: DisableCommands, pgdata: Option<PathBuf>) -> ExitCode {
    match command {
        DisableCommands::Secondary => report(secondary(pgdata, false).await),
        DisableCommands::Maintenance => report(maintenance(pgdata, false).await),
    }
}

async fn secondary(pgdata: Option<PathBuf>, enable: bool) -> Result<()> {
    let config = load_config(pgdata)?;
    let monitor = monitor_for(&config);
    let formation = &config.pg_autoctl.formation;

    if enable {
        monitor.enable_secondary(formation).await?;
        info!(%formation, "secondary enabled");
    } else {
        monitor.disable_secondary(formation).await?;
        info!(%formation, "secondary disabled");
    }
    Ok(())
}

/// The monitor owns maintenance: it answers the next `node_active` with a
/// MAINTENANCE assignment and the keeper converges from there.
async fn maintenance(pgdata: Option<PathBuf>, enable: bool) -> Result<()> {
    let config = load_config(pgdata)?;
    let state = StateStore::new(config.pathnames().state).read()?;
    let monitor = monitor_for(&config);

    if enable {
        monitor
            .start_maintenance(state.current_node_id, state.current_group)
            .await?;
        info!("maintenance requested; the keeper will converge on its next tick");
    } else {
        monitor
            .stop_maintenance(state.current_node_id, state.current_group)
            .await?;
        info!("maintenance lifted; the keeper will converge on its next tick");
    }
    Ok(())
}
