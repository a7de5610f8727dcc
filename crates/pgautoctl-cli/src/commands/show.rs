//! `pg_autoctl show {uri|events|state}`.

use std::path::PathBuf;

use chrono::{DateTime, TimeZone, Utc};
use clap::Subcommand;
use pgautoctl_core::error::{ExitCode, Result};
use pgautoctl_core::state::StateStore;

use super::{load_config, monitor_for, report};

/// What `show` can show.
#[derive(Subcommand, Debug)]
pub enum ShowCommands {
    /// Connection URIs for the monitor and the formation
    Uri,

    /// Recent monitor events for this node's formation
    Events {
        /// How many events to fetch
        #[arg(long, default_value_t = 10)]
        count: usize,
    },

    /// The local keeper state record
    State,
}

/// Route a `show` subcommand.
pub async fn dispatch(command: ShowCommands, pgdata: Option<PathBuf>) -> ExitCode {
    match command {
        ShowCommands::Uri => report(show_uri(pgdata).await),
        ShowCommands::Events { count } => report(show_events(pgdata, count).await),
        ShowCommands::State => report(show_state(pgdata)),
    }
}

async fn show_uri(pgdata: Option<PathBuf>) -> Result<()> {
    let config = load_config(pgdata)?;
    let monitor = monitor_for(&config);

    println!("monitor   {}", config.pg_autoctl.monitor);
    let formation_uri = monitor.formation_uri(&config.pg_autoctl.formation).await?;
    println!("formation {formation_uri}");
    Ok(())
}

async fn show_events(pgdata: Option<PathBuf>, count: usize) -> Result<()> {
    let config = load_config(pgdata)?;
    let monitor = monitor_for(&config);

    for event in monitor
        .last_events(&config.pg_autoctl.formation, count)
        .await?
    {
        println!(
            "{} | {:3}/{:<2} | {}",
            event.event_time.format("%Y-%m-%d %H:%M:%S"),
            event.node_id,
            event.group_id,
            event.description
        );
    }
    Ok(())
}

fn show_state(pgdata: Option<PathBuf>) -> Result<()> {
    let config = load_config(pgdata)?;
    let state = StateStore::new(config.pathnames().state).read()?;

    println!("Current Role:             {}", state.current_role);
    println!("Assigned Role:            {}", state.assigned_role);
    println!(
        "Node Id:                  {}/{}",
        state.current_node_id, state.current_group
    );
    println!(
        "PostgreSQL:               {} (version {})",
        if state.pg_is_running {
            "running"
        } else {
            "not running"
        },
        state.pg_version
    );
    println!("System Identifier:        {}", state.system_identifier);
    println!("WAL lag (bytes):          {}", state.xlog_lag_bytes);
    println!("Sync state:               {}", state.sync_state);
    println!(
        "Last Monitor Contact:     {}",
        format_contact(state.last_monitor_contact)
    );
    println!(
        "Last Secondary Contact:   {}",
        format_contact(state.last_secondary_contact)
    );
    Ok(())
}

fn format_contact(epoch_secs: u64) -> String {
    if epoch_secs == 0 {
        return "never".to_string();
    }

    i64::try_from(epoch_secs)
        .ok()
        .and_then(|secs| match Utc.timestamp_opt(secs, 0) {
            chrono::LocalResult::Single(time) => Some(time),
            _ => None,
        })
        .map_or_else(
            || format!("{epoch_secs}"),
            |time: DateTime<Utc>| time.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
        )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_contact_never() {
        assert_eq!(format_contact(0), "never");
    }

    #[test]
    fn test_format_contact_renders_utc() {
        let rendered = format_contact(1_722_000_000);
        assert!(rendered.ends_with("UTC"), "{rendered}");
        assert!(rendered.starts_with("2024-"), "{rendered}");
    }
}
