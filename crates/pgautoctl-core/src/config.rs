//! Keeper configuration.
//!
//! The configuration lives in `{pgdata}/pg_autoctl.cfg`, an INI-style file
//! with `[pg_autoctl]`, `[postgresql]`, `[replication]`, `[timeout]` and
//! `[httpd]` sections. Timeouts and the HTTP listen address/port are
//! reloadable at runtime; formation, nodename, pgport and the monitor URI
//! are fixed for the life of the node.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{KeeperError, Result};

/// Which kind of node a configuration file describes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileRole {
    /// A keeper driving a local PostgreSQL instance.
    #[default]
    Keeper,
    /// A monitor node; the keeper service refuses to run on these.
    Monitor,
}

/// `[pg_autoctl]` section: node identity and monitor coordinates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlSection {
    /// Role of the configuration file, `keeper` unless stated otherwise.
    #[serde(default)]
    pub role: FileRole,
    /// Formation this node belongs to.
    pub formation: String,
    /// Name under which this node registers with the monitor.
    pub nodename: String,
    /// Connection URI of the monitor.
    pub monitor: String,
}

/// `[postgresql]` section: local instance coordinates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostgresSection {
    /// Data directory of the managed instance.
    pub pgdata: PathBuf,
    /// Port the managed instance listens on.
    #[serde(default = "default_pgport")]
    pub pgport: u16,
    /// Authentication method written into new `pg_hba.conf` entries.
    #[serde(default = "default_auth_method")]
    pub auth_method: String,
}

/// `[replication]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationSection {
    /// Name of the physical replication slot reserved for the standby.
    #[serde(default = "default_slot_name")]
    pub slot: String,
    /// Password for the replication user, when the auth method needs one.
    #[serde(default)]
    pub password: Option<String>,
}

impl Default for ReplicationSection {
    fn default() -> Self {
        Self {
            slot: default_slot_name(),
            password: None,
        }
    }
}

/// `[timeout]` section. All values are in seconds. Reloadable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutSection {
    /// How long bilateral silence (monitor and standby) must last before a
    /// primary demotes itself.
    #[serde(default = "default_network_partition_timeout")]
    pub network_partition_timeout: u64,
    /// WAL lag under which a catching-up standby reports as caught up.
    #[serde(default = "default_catchup_threshold_bytes")]
    pub catchup_threshold_bytes: u64,
}

impl Default for TimeoutSection {
    fn default() -> Self {
        Self {
            network_partition_timeout: default_network_partition_timeout(),
            catchup_threshold_bytes: default_catchup_threshold_bytes(),
        }
    }
}

/// `[httpd]` section. Reloadable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpdSection {
    /// Address the status server binds.
    #[serde(default = "default_listen_address")]
    pub listen_address: String,
    /// Port the status server binds.
    #[serde(default = "default_httpd_port")]
    pub port: u16,
}

impl Default for HttpdSection {
    fn default() -> Self {
        Self {
            listen_address: default_listen_address(),
            port: default_httpd_port(),
        }
    }
}

fn default_pgport() -> u16 {
    5432
}

fn default_auth_method() -> String {
    "trust".to_string()
}

fn default_slot_name() -> String {
    "pgautofailover_standby".to_string()
}

const fn default_network_partition_timeout() -> u64 {
    20
}

const fn default_catchup_threshold_bytes() -> u64 {
    16 * 1024 * 1024
}

fn default_listen_address() -> String {
    "127.0.0.1".to_string()
}

const fn default_httpd_port() -> u16 {
    8001
}

/// Sibling files the keeper maintains next to its configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pathnames {
    /// `pg_autoctl.cfg`.
    pub config: PathBuf,
    /// `pg_autoctl.state`.
    pub state: PathBuf,
    /// `pg_autoctl.init`, present while a `create` is incomplete.
    pub init: PathBuf,
    /// `pg_autoctl.pid`.
    pub pid: PathBuf,
}

impl Pathnames {
    /// Derive every keeper file path from the data directory.
    #[must_use]
    pub fn from_pgdata(pgdata: &Path) -> Self {
        Self {
            config: pgdata.join("pg_autoctl.cfg"),
            state: pgdata.join("pg_autoctl.state"),
            init: pgdata.join("pg_autoctl.init"),
            pid: pgdata.join("pg_autoctl.pid"),
        }
    }
}

/// The whole keeper configuration file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeeperConfig {
    /// Node identity and monitor coordinates.
    pub pg_autoctl: ControlSection,
    /// Local PostgreSQL coordinates.
    pub postgresql: PostgresSection,
    /// Replication settings.
    #[serde(default)]
    pub replication: ReplicationSection,
    /// Timeouts, reloadable.
    #[serde(default)]
    pub timeout: TimeoutSection,
    /// Status server settings, reloadable.
    #[serde(default)]
    pub httpd: HttpdSection,
}

impl KeeperConfig {
    /// Parse a configuration file.
    ///
    /// # Errors
    ///
    /// Returns `ConfigInvalid` when the file is missing, unparsable, or
    /// fails validation.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            KeeperError::ConfigInvalid(format!("cannot read {path:?}: {e}"))
        })?;

        let config: Self = toml::from_str(&raw)
            .map_err(|e| KeeperError::ConfigInvalid(format!("cannot parse {path:?}: {e}")))?;

        config.validate()?;
        Ok(config)
    }

    /// Serialize and write the configuration file.
    ///
    /// # Errors
    ///
    /// Returns `ConfigInvalid` when serialization fails, or an I/O error
    /// when the file cannot be written.
    pub fn save(&self, path: &Path) -> Result<()> {
        let raw = toml::to_string_pretty(self)
            .map_err(|e| KeeperError::ConfigInvalid(e.to_string()))?;
        std::fs::write(path, raw)?;
        Ok(())
    }

    /// Sibling file paths derived from the configured PGDATA.
    #[must_use]
    pub fn pathnames(&self) -> Pathnames {
        Pathnames::from_pgdata(&self.postgresql.pgdata)
    }

    /// Merge a freshly parsed configuration into the running one.
    ///
    /// Only the reloadable sections are taken over; attempts to change a
    /// fixed field are logged and ignored. Returns whether anything changed.
    pub fn accept_new(&mut self, new: Self) -> bool {
        for (field, old, changed) in [
            (
                "pg_autoctl.formation",
                self.pg_autoctl.formation.clone(),
                self.pg_autoctl.formation != new.pg_autoctl.formation,
            ),
            (
                "pg_autoctl.nodename",
                self.pg_autoctl.nodename.clone(),
                self.pg_autoctl.nodename != new.pg_autoctl.nodename,
            ),
            (
                "pg_autoctl.monitor",
                self.pg_autoctl.monitor.clone(),
                self.pg_autoctl.monitor != new.pg_autoctl.monitor,
            ),
            (
                "postgresql.pgport",
                self.postgresql.pgport.to_string(),
                self.postgresql.pgport != new.postgresql.pgport,
            ),
        ] {
            if changed {
                warn!(field, kept = %old, "field is not reloadable, keeping current value");
            }
        }

        let mut updated = false;

        if self.timeout != new.timeout {
            self.timeout = new.timeout;
            updated = true;
        }
        if self.httpd != new.httpd {
            self.httpd = new.httpd;
            updated = true;
        }

        updated
    }

    /// Look up a `section.field` value, rendered as a string.
    #[must_use]
    pub fn get_value(&self, key: &str) -> Option<String> {
        match key {
            "pg_autoctl.formation" => Some(self.pg_autoctl.formation.clone()),
            "pg_autoctl.nodename" => Some(self.pg_autoctl.nodename.clone()),
            "pg_autoctl.monitor" => Some(self.pg_autoctl.monitor.clone()),
            "postgresql.pgdata" => Some(self.postgresql.pgdata.display().to_string()),
            "postgresql.pgport" => Some(self.postgresql.pgport.to_string()),
            "postgresql.auth_method" => Some(self.postgresql.auth_method.clone()),
            "replication.slot" => Some(self.replication.slot.clone()),
            "timeout.network_partition_timeout" => {
                Some(self.timeout.network_partition_timeout.to_string())
            }
            "timeout.catchup_threshold_bytes" => {
                Some(self.timeout.catchup_threshold_bytes.to_string())
            }
            "httpd.listen_address" => Some(self.httpd.listen_address.clone()),
            "httpd.port" => Some(self.httpd.port.to_string()),
            _ => None,
        }
    }

    /// Assign a `section.field` value parsed from a string.
    ///
    /// # Errors
    ///
    /// Returns `ConfigInvalid` for unknown keys or unparsable values.
    pub fn set_value(&mut self, key: &str, value: &str) -> Result<()> {
        let bad_value =
            |e: &dyn std::fmt::Display| KeeperError::ConfigInvalid(format!("{key}: {e}"));

        match key {
            "pg_autoctl.formation" => self.pg_autoctl.formation = value.to_string(),
            "pg_autoctl.nodename" => self.pg_autoctl.nodename = value.to_string(),
            "pg_autoctl.monitor" => self.pg_autoctl.monitor = value.to_string(),
            "postgresql.auth_method" => self.postgresql.auth_method = value.to_string(),
            "postgresql.pgport" => {
                self.postgresql.pgport = value.parse().map_err(|e| bad_value(&e))?;
            }
            "replication.slot" => self.replication.slot = value.to_string(),
            "replication.password" => self.replication.password = Some(value.to_string()),
            "timeout.network_partition_timeout" => {
                self.timeout.network_partition_timeout =
                    value.parse().map_err(|e| bad_value(&e))?;
            }
            "timeout.catchup_threshold_bytes" => {
                self.timeout.catchup_threshold_bytes =
                    value.parse().map_err(|e| bad_value(&e))?;
            }
            "httpd.listen_address" => self.httpd.listen_address = value.to_string(),
            "httpd.port" => {
                self.httpd.port = value.parse().map_err(|e| bad_value(&e))?;
            }
            _ => {
                return Err(KeeperError::ConfigInvalid(format!(
                    "unknown configuration key \"{key}\""
                )))
            }
        }

        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.pg_autoctl.formation.is_empty() {
            return Err(KeeperError::ConfigInvalid(
                "pg_autoctl.formation must not be empty".into(),
            ));
        }
        if self.pg_autoctl.nodename.is_empty() {
            return Err(KeeperError::ConfigInvalid(
                "pg_autoctl.nodename must not be empty".into(),
            ));
        }
        if self.pg_autoctl.role == FileRole::Keeper && self.pg_autoctl.monitor.is_empty() {
            return Err(KeeperError::ConfigInvalid(
                "pg_autoctl.monitor must not be empty for a keeper node".into(),
            ));
        }
        if self.postgresql.pgdata.as_os_str().is_empty() {
            return Err(KeeperError::ConfigInvalid(
                "postgresql.pgdata must not be empty".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::{
        ControlSection, FileRole, HttpdSection, KeeperConfig, PostgresSection,
        ReplicationSection, TimeoutSection,
    };
    use std::path::PathBuf;

    pub(crate) fn sample_config() -> KeeperConfig {
        KeeperConfig {
            pg_autoctl: ControlSection {
                role: FileRole::Keeper,
                formation: "default".into(),
                nodename: "node-a".into(),
                monitor: "postgres://autoctl_node@monitor:5432/pg_auto_failover".into(),
            },
            postgresql: PostgresSection {
                pgdata: PathBuf::from("/var/lib/postgres/data"),
                pgport: 5432,
                auth_method: "trust".into(),
            },
            replication: ReplicationSection::default(),
            timeout: TimeoutSection::default(),
            httpd: HttpdSection::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> KeeperConfig {
        KeeperConfig {
            pg_autoctl: ControlSection {
                role: FileRole::Keeper,
                formation: "default".into(),
                nodename: "node-a".into(),
                monitor: "postgres://autoctl_node@monitor:5432/pg_auto_failover".into(),
            },
            postgresql: PostgresSection {
                pgdata: PathBuf::from("/var/lib/postgres/data"),
                pgport: 5432,
                auth_method: "trust".into(),
            },
            replication: ReplicationSection::default(),
            timeout: TimeoutSection::default(),
            httpd: HttpdSection::default(),
        }
    }

    #[test]
    fn test_save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pg_autoctl.cfg");

        let config = sample();
        config.save(&path).unwrap();
        assert_eq!(KeeperConfig::load(&path).unwrap(), config);
    }

    #[test]
    fn test_minimal_file_gets_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pg_autoctl.cfg");
        std::fs::write(
            &path,
            r#"
[pg_autoctl]
formation = "default"
nodename = "node-a"
monitor = "postgres://autoctl_node@monitor/pg_auto_failover"

[postgresql]
pgdata = "/tmp/pgdata"
"#,
        )
        .unwrap();

        let config = KeeperConfig::load(&path).unwrap();
        assert_eq!(config.postgresql.pgport, 5432);
        assert_eq!(config.replication.slot, "pgautofailover_standby");
        assert_eq!(config.timeout.network_partition_timeout, 20);
        assert_eq!(config.httpd.port, 8001);
        assert_eq!(config.pg_autoctl.role, FileRole::Keeper);
    }

    #[test]
    fn test_parse_error_is_config_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pg_autoctl.cfg");
        std::fs::write(&path, "this is not a config file").unwrap();

        assert!(matches!(
            KeeperConfig::load(&path),
            Err(KeeperError::ConfigInvalid(_))
        ));
    }

    #[test]
    fn test_accept_new_takes_reloadable_fields_only() {
        let mut current = sample();
        let mut new = sample();

        new.timeout.network_partition_timeout = 30;
        new.httpd.port = 9001;
        new.pg_autoctl.formation = "other".into();
        new.postgresql.pgport = 5433;

        assert!(current.accept_new(new));
        assert_eq!(current.timeout.network_partition_timeout, 30);
        assert_eq!(current.httpd.port, 9001);
        assert_eq!(current.pg_autoctl.formation, "default");
        assert_eq!(current.postgresql.pgport, 5432);
    }

    #[test]
    fn test_accept_new_reports_no_change() {
        let mut current = sample();
        let new = sample();
        assert!(!current.accept_new(new));
    }

    #[test]
    fn test_pathnames_derive_from_pgdata() {
        let names = sample().pathnames();
        assert_eq!(
            names.state,
            PathBuf::from("/var/lib/postgres/data/pg_autoctl.state")
        );
        assert_eq!(
            names.pid,
            PathBuf::from("/var/lib/postgres/data/pg_autoctl.pid")
        );
        assert_eq!(
            names.init,
            PathBuf::from("/var/lib/postgres/data/pg_autoctl.init")
        );
    }

    #[test]
    fn test_get_set_values() {
        let mut config = sample();

        config
            .set_value("timeout.network_partition_timeout", "45")
            .unwrap();
        assert_eq!(
            config.get_value("timeout.network_partition_timeout").unwrap(),
            "45"
        );

        assert!(config.set_value("httpd.port", "not-a-port").is_err());
        assert!(config.set_value("no.such.key", "x").is_err());
        assert!(config.get_value("no.such.key").is_none());
    }

    #[test]
    fn test_validation_rejects_empty_identity() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pg_autoctl.cfg");
        std::fs::write(
            &path,
            r#"
[pg_autoctl]
formation = ""
nodename = "node-a"
monitor = "postgres://monitor/pg_auto_failover"

[postgresql]
pgdata = "/tmp/pgdata"
"#,
        )
        .unwrap();

        assert!(KeeperConfig::load(&path).is_err());
    }
}
