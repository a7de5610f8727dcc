//! `pg_autoctl do` - low-level keeper primitives.
//!
//! Each subcommand maps one-to-one onto a PostgreSQL controller operation,
//! plus `do fsm` to inspect and drive the state machine directly when
//! operating without a monitor.

use std::path::PathBuf;

use clap::Subcommand;
use pgautoctl_core::error::{ExitCode, Result};
use pgautoctl_core::fsm::REPLICATION_USERNAME;
use pgautoctl_core::node_state::NodeState;
use pgautoctl_core::pg::ReplicationSource;
use pgautoctl_core::state::StateStore;
use tracing::info;

use super::{load_config, pg_for, report};

/// Low-level primitives.
#[derive(Subcommand, Debug)]
pub enum DoCommands {
    /// Inspect or drive the state machine
    #[command(subcommand)]
    Fsm(FsmCommands),

    /// Initialize the data directory
    Initdb,

    /// Start PostgreSQL
    Start,

    /// Stop PostgreSQL
    Stop,

    /// Restart PostgreSQL
    Restart,

    /// Reload the PostgreSQL configuration
    ReloadConf,

    /// Promote a standby
    Promote,

    /// Pause WAL replay ahead of a promotion
    StopReplication,

    /// Rewind the data directory against a primary
    Rewind {
        /// Host of the primary to rewind against
        #[arg(long)]
        host: String,
        /// Port of the primary
        #[arg(long, default_value_t = 5432)]
        port: u16,
    },

    /// Clone a primary and configure the standby
    InitStandby {
        /// Host of the primary to clone
        #[arg(long)]
        host: String,
        /// Port of the primary
        #[arg(long, default_value_t = 5432)]
        port: u16,
    },

    /// Append the managed default settings
    AddDefaultSettings,

    /// Create the replication slot
    CreateReplicationSlot,

    /// Drop the replication slot
    DropReplicationSlot,

    /// Require synchronous commit from the standby
    EnableSyncRep,

    /// Stop requiring synchronous commit
    DisableSyncRep,

    /// Create the monitor health-check user
    CreateMonitorUser {
        /// Host the monitor connects from
        #[arg(long)]
        host: String,
    },

    /// Create the replication user
    CreateReplicationUser,

    /// Open pg_hba.conf for a standby host
    AddStandbyToHba {
        /// Host of the standby
        #[arg(long)]
        host: String,
    },
}

/// `do fsm` subcommands.
#[derive(Subcommand, Debug)]
pub enum FsmCommands {
    /// Print the current and assigned roles
    State,

    /// Overwrite the assigned role; the next tick drives the transition
    Assign {
        /// Role to assign (e.g. `single`, `wait_primary`, `primary`)
        state: String,
    },
}

/// Route a `do` subcommand.
pub async fn dispatch(command: DoCommands, pgdata: Option<PathBuf>) -> ExitCode {
    report(run(command, pgdata).await)
}

async fn run(command: DoCommands, pgdata: Option<PathBuf>) -> Result<()> {
    let config = load_config(pgdata)?;
    let pg = pg_for(&config);

    let source = |host: String, port: u16| ReplicationSource {
        host,
        port,
        user: REPLICATION_USERNAME.to_string(),
        password: config.replication.password.clone(),
        slot: config.replication.slot.clone(),
    };

    match command {
        DoCommands::Fsm(fsm) => return fsm_command(fsm, &config),
        DoCommands::Initdb => pg.init_db().await?,
        DoCommands::Start => pg.start().await?,
        DoCommands::Stop => pg.stop().await?,
        DoCommands::Restart => pg.restart().await?,
        DoCommands::ReloadConf => pg.reload_conf().await?,
        DoCommands::Promote => pg.promote().await?,
        DoCommands::StopReplication => pg.stop_replication().await?,
        DoCommands::Rewind { host, port } => pg.rewind_to(&source(host, port)).await?,
        DoCommands::InitStandby { host, port } => {
            pg.init_standby(&source(host, port)).await?;
        }
        DoCommands::AddDefaultSettings => pg.add_default_settings().await?,
        DoCommands::CreateReplicationSlot => {
            pg.create_replication_slot(&config.replication.slot).await?;
        }
        DoCommands::DropReplicationSlot => {
            pg.drop_replication_slot(&config.replication.slot).await?;
        }
        DoCommands::EnableSyncRep => pg.enable_sync_rep().await?,
        DoCommands::DisableSyncRep => pg.disable_sync_rep().await?,
        DoCommands::CreateMonitorUser { host } => {
            pg.create_monitor_user(&host, &config.postgresql.auth_method)
                .await?;
        }
        DoCommands::CreateReplicationUser => {
            pg.create_replication_user(
                REPLICATION_USERNAME,
                config.replication.password.as_deref(),
            )
            .await?;
        }
        DoCommands::AddStandbyToHba { host } => pg.add_standby_to_hba(&host).await?,
    }

    Ok(())
}

fn fsm_command(command: FsmCommands, config: &pgautoctl_core::KeeperConfig) -> Result<()> {
    let store = StateStore::new(config.pathnames().state);

    match command {
        FsmCommands::State => {
            let state = store.read()?;
            println!("current:  {}", state.current_role);
            println!("assigned: {}", state.assigned_role);
        }
        FsmCommands::Assign { state: name } => {
            let assigned = NodeState::parse(&name)?;
            let mut state = store.read()?;
            state.assigned_role = assigned;
            store.write(&state)?;
            info!(assigned = %assigned, "assigned role written");
        }
    }
    Ok(())
}
