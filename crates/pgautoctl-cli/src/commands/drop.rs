//! `pg_autoctl drop {node|formation}`.

use std::path::PathBuf;

use clap::Subcommand;
use pgautoctl_core::error::{ExitCode, Result};
use pgautoctl_core::monitor::MonitorClient;
use pgautoctl_core::state::StateStore;
use pgautoctl_daemon::monitor_client::SqlMonitorClient;
use tracing::{info, warn};

use super::{load_config, monitor_for, report};

/// What `drop` can drop.
#[derive(Subcommand, Debug)]
pub enum DropCommands {
    /// Remove this node from its formation and delete the keeper files
    Node,

    /// Drop a formation on the monitor
    Formation {
        /// Name of the formation to drop
        #[arg(long)]
        formation: String,

        /// Monitor connection URI
        #[arg(long)]
        monitor: String,
    },
}

/// Route a `drop` subcommand.
pub async fn dispatch(command: DropCommands, pgdata: Option<PathBuf>) -> ExitCode {
    match command {
        DropCommands::Node => report(drop_node(pgdata).await),
        DropCommands::Formation { formation, monitor } => {
            report(drop_formation(&formation, &monitor).await)
        }
    }
}

/// Deregister the node, then delete state, init marker and pid file. The
/// data directory is left alone.
async fn drop_node(pgdata: Option<PathBuf>) -> Result<()> {
    let config = load_config(pgdata)?;
    let paths = config.pathnames();
    let store = StateStore::new(&paths.state);

    if store.exists() {
        let state = store.read()?;
        let monitor = monitor_for(&config);
        match monitor.remove(state.current_node_id, state.current_group).await {
            Ok(()) => info!(
                node_id = state.current_node_id,
                "node removed from the monitor"
            ),
            Err(e) => warn!("could not deregister from the monitor: {e}"),
        }
        store.remove()?;
    }

    for path in [&paths.init, &paths.pid] {
        if path.exists() {
            std::fs::remove_file(path)?;
        }
    }

    info!("node dropped; the data directory was kept");
    Ok(())
}

async fn drop_formation(formation: &str, monitor_uri: &str) -> Result<()> {
    let monitor = SqlMonitorClient::new(monitor_uri);
    monitor.drop_formation(formation).await?;
    info!(formation, "formation dropped");
    Ok(())
}
