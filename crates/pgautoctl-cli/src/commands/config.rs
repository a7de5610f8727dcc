//! `pg_autoctl config {get|set}`.

use std::path::PathBuf;

use clap::Subcommand;
use pgautoctl_core::error::{ExitCode, KeeperError, Result};

use super::{load_config, report, resolve_pgdata};

/// Configuration access.
#[derive(Subcommand, Debug)]
pub enum ConfigCommands {
    /// Print one value, or the whole file without a key
    Get {
        /// `section.field` to read
        key: Option<String>,
    },

    /// Write one value back to the configuration file
    Set {
        /// `section.field` to write
        key: String,
        /// New value
        value: String,
    },
}

/// Route a `config` subcommand.
pub async fn dispatch(command: ConfigCommands, pgdata: Option<PathBuf>) -> ExitCode {
    match command {
        ConfigCommands::Get { key } => report(get(pgdata, key.as_deref())),
        ConfigCommands::Set { key, value } => report(set(pgdata, &key, &value)),
    }
}

fn get(pgdata: Option<PathBuf>, key: Option<&str>) -> Result<()> {
    let config = load_config(pgdata.clone())?;

    match key {
        Some(key) => {
            let value = config.get_value(key).ok_or_else(|| {
                KeeperError::ConfigInvalid(format!("unknown configuration key \"{key}\""))
            })?;
            println!("{value}");
        }
        None => {
            let pgdata = resolve_pgdata(pgdata)?;
            let path = pgautoctl_core::config::Pathnames::from_pgdata(&pgdata).config;
            print!("{}", std::fs::read_to_string(path)?);
        }
    }
    Ok(())
}

/// Writes the file; a running keeper picks up reloadable fields on
/// `pg_autoctl reload`, and keeps its current values for the rest.
fn set(pgdata: Option<PathBuf>, key: &str, value: &str) -> Result<()> {
    let pgdata = resolve_pgdata(pgdata)?;
    let path = pgautoctl_core::config::Pathnames::from_pgdata(&pgdata).config;

    let mut config = load_config(Some(pgdata))?;
    config.set_value(key, value)?;
    config.save(&path)?;

    println!("{value}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pgautoctl_core::config::KeeperConfig;

    fn write_sample(dir: &tempfile::TempDir) -> PathBuf {
        let pgdata = dir.path().to_path_buf();
        std::fs::write(
            pgdata.join("pg_autoctl.cfg"),
            format!(
                r#"
[pg_autoctl]
formation = "default"
nodename = "node-a"
monitor = "postgres://autoctl_node@monitor/pg_auto_failover"

[postgresql]
pgdata = "{}"
"#,
                pgdata.display()
            ),
        )
        .unwrap();
        pgdata
    }

    #[test]
    fn test_set_then_get_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let pgdata = write_sample(&dir);

        set(
            Some(pgdata.clone()),
            "timeout.network_partition_timeout",
            "42",
        )
        .unwrap();

        let config =
            KeeperConfig::load(&pgdata.join("pg_autoctl.cfg")).unwrap();
        assert_eq!(config.timeout.network_partition_timeout, 42);
    }

    #[test]
    fn test_set_unknown_key_fails() {
        let dir = tempfile::tempdir().unwrap();
        let pgdata = write_sample(&dir);

        assert!(set(Some(pgdata), "nope.nope", "1").is_err());
    }
}
