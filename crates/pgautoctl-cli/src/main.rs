//! pg_autoctl - control tools and service for the keeper
//!
//! The command tree mirrors the life of a node: `create` it, `run` the
//! service, `show` what the cluster thinks, `stop`/`reload` the running
//! service, `drop` the node. `do` exposes the low-level PostgreSQL
//! primitives one at a time for operators and tests.

use std::path::PathBuf;
use std::process::exit;

use clap::{ArgAction, Parser, Subcommand};
use pgautoctl_core::error::ExitCode;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

mod commands;

use commands::{config, create, do_cmd, drop, enable, service, show};

/// pg_autoctl - PostgreSQL automated failover control
#[derive(Parser, Debug)]
#[command(name = "pg_autoctl")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Increase verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,

    /// Only print errors
    #[arg(short, long, global = true)]
    quiet: bool,

    /// PostgreSQL data directory (defaults to $PGDATA)
    #[arg(long, global = true)]
    pgdata: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create a node or a formation
    #[command(subcommand)]
    Create(create::CreateCommands),

    /// Drop a node or a formation
    #[command(subcommand)]
    Drop(drop::DropCommands),

    /// Show cluster information
    #[command(subcommand)]
    Show(show::ShowCommands),

    /// Get and set configuration values
    #[command(subcommand)]
    Config(config::ConfigCommands),

    /// Enable a formation or node feature
    #[command(subcommand)]
    Enable(enable::EnableCommands),

    /// Disable a formation or node feature
    #[command(subcommand)]
    Disable(enable::DisableCommands),

    /// Run low-level keeper primitives
    #[command(subcommand)]
    Do(do_cmd::DoCommands),

    /// Run the keeper service
    Run,

    /// Stop the running keeper service
    Stop {
        /// Send a fast stop instead of a graceful one
        #[arg(long)]
        fast: bool,
    },

    /// Ask the running keeper service to reload its configuration
    Reload,

    /// Print the pg_autoctl version
    Version,
}

fn init_logging(verbose: u8, quiet: bool) {
    let level = if quiet {
        "error"
    } else {
        match verbose {
            0 | 1 => "info",
            2 => "debug",
            _ => "trace",
        }
    };

    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();
}

fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            // clap already formatted the message; keep our exit code stable.
            let _ = e.print();
            if e.use_stderr() {
                exit(ExitCode::BadArgs.value());
            }
            exit(ExitCode::Ok.value());
        }
    };

    init_logging(cli.verbose, cli.quiet);

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("failed to create the async runtime: {e}");
            exit(ExitCode::Internal.value());
        }
    };

    let pgdata = cli.pgdata.clone();
    let code = runtime.block_on(async move {
        match cli.command {
            Commands::Create(command) => create::dispatch(command, pgdata).await,
            Commands::Drop(command) => drop::dispatch(command, pgdata).await,
            Commands::Show(command) => show::dispatch(command, pgdata).await,
            Commands::Config(command) => config::dispatch(command, pgdata).await,
            Commands::Enable(command) => enable::dispatch_enable(command, pgdata).await,
            Commands::Disable(command) => enable::dispatch_disable(command, pgdata).await,
            Commands::Do(command) => do_cmd::dispatch(command, pgdata).await,
            Commands::Run => service::run(pgdata).await,
            Commands::Stop { fast } => service::stop(pgdata, fast),
            Commands::Reload => service::reload(pgdata),
            Commands::Version => {
                println!("pg_autoctl version {}", pgautoctl_core::KEEPER_VERSION);
                ExitCode::Ok
            }
        }
    });

    exit(code.value());
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_command_tree_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_verbosity_stacks() {
        let cli = Cli::try_parse_from(["pg_autoctl", "-vv", "version"]).unwrap();
        assert_eq!(cli.verbose, 2);
        assert!(!cli.quiet);
    }

    #[test]
    fn test_run_takes_global_pgdata() {
        let cli =
            Cli::try_parse_from(["pg_autoctl", "run", "--pgdata", "/srv/pgdata"]).unwrap();
        assert_eq!(cli.pgdata, Some(PathBuf::from("/srv/pgdata")));
        assert!(matches!(cli.command, Commands::Run));
    }

    #[test]
    fn test_do_fsm_assign_parses_state_name() {
        let cli = Cli::try_parse_from([
            "pg_autoctl", "do", "fsm", "assign", "wait_primary",
        ])
        .unwrap();
        match cli.command {
            Commands::Do(do_cmd::DoCommands::Fsm(do_cmd::FsmCommands::Assign { state })) => {
                assert_eq!(state, "wait_primary");
            }
            other => panic!("unexpected parse: {other:?}"),
        }
    }

    #[test]
    fn test_stop_fast_flag() {
        let cli = Cli::try_parse_from(["pg_autoctl", "stop", "--fast"]).unwrap();
        assert!(matches!(cli.command, Commands::Stop { fast: true }));
    }

    #[test]
    fn test_unknown_subcommand_is_an_error() {
        assert!(Cli::try_parse_from(["pg_autoctl", "frobnicate"]).is_err());
    }
}
