//! `pg_autoctl create {monitor|postgres|formation}`.

use std::path::PathBuf;

use clap::{Args, Subcommand};
use pgautoctl_core::config::{
    ControlSection, FileRole, HttpdSection, KeeperConfig, PostgresSection,
    ReplicationSection, TimeoutSection,
};
use pgautoctl_core::error::{ExitCode, KeeperError, Result};
use pgautoctl_core::monitor::MonitorClient;
use tracing::{info, warn};

use super::{monitor_for, report, resolve_pgdata};

/// What `create` can create.
#[derive(Subcommand, Debug)]
pub enum CreateCommands {
    /// Prepare a local PostgreSQL instance to host the monitor extension
    Monitor {
        /// Port of the local monitor PostgreSQL instance
        #[arg(long, default_value_t = 5432)]
        pgport: u16,
    },

    /// Create a keeper node for a local PostgreSQL instance
    Postgres(CreatePostgres),

    /// Create a formation on the monitor
    Formation {
        /// Name of the formation to create
        #[arg(long)]
        formation: String,

        /// Monitor connection URI
        #[arg(long)]
        monitor: String,
    },
}

/// Arguments of `create postgres`.
#[derive(Args, Debug)]
pub struct CreatePostgres {
    /// Monitor connection URI
    #[arg(long)]
    monitor: String,

    /// Formation to register into
    #[arg(long, default_value = "default")]
    formation: String,

    /// Name this node registers under
    #[arg(long)]
    nodename: String,

    /// Port of the local PostgreSQL instance
    #[arg(long, default_value_t = 5432)]
    pgport: u16,

    /// Authentication method for generated hba entries
    #[arg(long, default_value = "trust")]
    auth: String,

    /// Run the keeper service once the node is created
    #[arg(long)]
    run: bool,
}

/// Route a `create` subcommand.
pub async fn dispatch(command: CreateCommands, pgdata: Option<PathBuf>) -> ExitCode {
    match command {
        CreateCommands::Monitor { pgport } => report(create_monitor(pgport).await),
        CreateCommands::Formation { formation, monitor } => {
            report(create_formation(&formation, &monitor).await)
        }
        CreateCommands::Postgres(args) => create_postgres(args, pgdata).await,
    }
}

async fn create_monitor(pgport: u16) -> Result<()> {
    pgautoctl_daemon::monitor_client::bootstrap_monitor_extension(pgport).await?;
    info!("monitor extension installed on the local instance");
    Ok(())
}

async fn create_formation(formation: &str, monitor_uri: &str) -> Result<()> {
    let monitor = pgautoctl_daemon::monitor_client::SqlMonitorClient::new(monitor_uri);
    monitor.create_formation(formation).await?;
    info!(formation, "formation created");
    Ok(())
}

async fn create_postgres(args: CreatePostgres, pgdata: Option<PathBuf>) -> ExitCode {
    let result: Result<KeeperConfig> = async {
        let pgdata = resolve_pgdata(pgdata)?;
        std::fs::create_dir_all(&pgdata).map_err(KeeperError::Io)?;

        let config = KeeperConfig {
            pg_autoctl: ControlSection {
                role: FileRole::Keeper,
                formation: args.formation.clone(),
                nodename: args.nodename.clone(),
                monitor: args.monitor.clone(),
            },
            postgresql: PostgresSection {
                pgdata: pgdata.clone(),
                pgport: args.pgport,
                auth_method: args.auth.clone(),
            },
            replication: ReplicationSection::default(),
            timeout: TimeoutSection::default(),
            httpd: HttpdSection::default(),
        };

        let paths = config.pathnames();
        config.save(&paths.config)?;
        std::fs::write(&paths.init, "").map_err(KeeperError::Io)?;
        info!(config = ?paths.config, "wrote keeper configuration");

        let monitor = monitor_for(&config);
        match pgautoctl_daemon::service::complete_init(&config, monitor.as_ref()).await {
            Ok(()) => info!("node created"),
            Err(e) => {
                // `run` completes a pending create, so this is not fatal.
                warn!(
                    "could not finish the registration now ({e}); \
                     `pg_autoctl run` will complete it"
                );
            }
        }

        Ok(config)
    }
    .await;

    match result {
        Ok(config) if args.run => pgautoctl_daemon::service::run(config).await,
        Ok(_) => ExitCode::Ok,
        Err(e) => {
            tracing::error!("{e}");
            e.exit_code()
        }
    }
}
