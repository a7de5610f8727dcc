//! PostgreSQL controller backed by `pg_ctl` and local SQL.
//!
//! Lifecycle goes through the `pg_ctl` family of tools, probes and settings
//! go through a short-lived SQL connection to the local instance. The
//! controller is a thin adapter: it executes exactly what it is asked and
//! reports failures; every decision about *when* to do what belongs to the
//! FSM.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use pgautoctl_core::error::{KeeperError, Result};
use pgautoctl_core::fsm::{MONITOR_USERNAME, REPLICATION_USERNAME};
use pgautoctl_core::pg::{PgController, ReplicationSource};
use pgautoctl_core::state::PgProbe;
use tokio::process::Command;
use tokio_postgres::{Client, NoTls};
use tracing::{debug, info, warn};

/// Marker bracketing the settings block this controller owns in
/// `postgresql.conf`.
const SETTINGS_MARKER: &str = "# settings managed by pg_autoctl";

/// How long a local SQL connection may take to establish.
const LOCAL_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// The production controller for one data directory.
#[derive(Debug, Clone)]
pub struct PgCtlController {
    pgdata: PathBuf,
    pgport: u16,
    auth_method: String,
    superuser: String,
}

impl PgCtlController {
    /// A controller for a data directory and port.
    #[must_use]
    pub fn new(pgdata: PathBuf, pgport: u16, auth_method: String) -> Self {
        let superuser = std::env::var("PGUSER")
            .or_else(|_| std::env::var("USER"))
            .unwrap_or_else(|_| "postgres".to_string());

        Self {
            pgdata,
            pgport,
            auth_method,
            superuser,
        }
    }

    async fn pg_ctl(&self, args: &[&str]) -> Result<String> {
        let pgdata = self.pgdata.to_string_lossy();
        let mut full: Vec<&str> = vec!["--pgdata", &pgdata];
        full.extend_from_slice(args);
        run_tool("pg_ctl", &full).await
    }

    async fn sql(&self) -> Result<Client> {
        let conninfo = format!(
            "host=127.0.0.1 port={} user={} dbname=postgres connect_timeout=5",
            self.pgport, self.superuser
        );

        let connect = tokio_postgres::connect(&conninfo, NoTls);
        let (client, connection) = tokio::time::timeout(LOCAL_CONNECT_TIMEOUT, connect)
            .await
            .map_err(|_| {
                KeeperError::PgControllerFailure("local SQL connection timed out".into())
            })?
            .map_err(|e| KeeperError::PgControllerFailure(e.to_string()))?;

        tokio::spawn(async move {
            if let Err(e) = connection.await {
                debug!("local SQL connection closed: {e}");
            }
        });

        Ok(client)
    }

    async fn query_one_i64(&self, client: &Client, sql: &str) -> Result<i64> {
        let row = client
            .query_one(sql, &[])
            .await
            .map_err(|e| KeeperError::PgControllerFailure(e.to_string()))?;
        Ok(row.get(0))
    }

    fn hba_path(&self) -> PathBuf {
        self.pgdata.join("pg_hba.conf")
    }

    fn append_hba_entries(&self, entries: &[String]) -> Result<()> {
        let path = self.hba_path();
        let current = std::fs::read_to_string(&path)?;

        let missing: Vec<&String> = entries
            .iter()
            .filter(|entry| !current.lines().any(|line| line.trim() == entry.trim()))
            .collect();

        if missing.is_empty() {
            return Ok(());
        }

        let mut contents = current;
        if !contents.ends_with('\n') {
            contents.push('\n');
        }
        for entry in missing {
            contents.push_str(entry);
            contents.push('\n');
        }
        std::fs::write(&path, contents)?;
        Ok(())
    }

    async fn postmaster_answers(&self) -> Result<bool> {
        let status = Command::new("pg_ctl")
            .args(["--pgdata", &self.pgdata.to_string_lossy(), "status"])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map_err(|e| KeeperError::PgControllerFailure(format!("pg_ctl status: {e}")))?;
        Ok(status.success())
    }
}

#[async_trait]
impl PgController for PgCtlController {
    async fn probe(&self) -> Result<PgProbe> {
        if !self.postmaster_answers().await? {
            return Ok(PgProbe::default());
        }

        let client = self.sql().await?;

        let version_row = client
            .query_one("SHOW server_version_num", &[])
            .await
            .map_err(|e| KeeperError::PgControllerFailure(e.to_string()))?;
        let version: String = version_row.get(0);
        let pg_version = version.parse::<u32>().unwrap_or(0);

        let control = client
            .query_one(
                "SELECT pg_control_version::bigint, system_identifier::text \
                 FROM pg_control_system()",
                &[],
            )
            .await
            .map_err(|e| KeeperError::PgControllerFailure(e.to_string()))?;
        let pg_control_version: i64 = control.get(0);
        let system_identifier: String = control.get(1);

        let wal_lag_bytes = self
            .query_one_i64(
                &client,
                "SELECT CASE WHEN pg_is_in_recovery() \
                 THEN COALESCE(pg_wal_lsn_diff(pg_last_wal_receive_lsn(), \
                                               pg_last_wal_replay_lsn()), -1)::bigint \
                 ELSE 0::bigint END",
            )
            .await?;

        let sync_state: String = client
            .query_opt(
                "SELECT sync_state FROM pg_stat_replication \
                 ORDER BY application_name LIMIT 1",
                &[],
            )
            .await
            .map_err(|e| KeeperError::PgControllerFailure(e.to_string()))?
            .map_or_else(String::new, |row| row.get(0));

        Ok(PgProbe {
            pg_version,
            pg_control_version: u32::try_from(pg_control_version).unwrap_or(0),
            system_identifier: system_identifier.parse().unwrap_or(0),
            is_running: true,
            wal_lag_bytes,
            sync_state,
        })
    }

    async fn has_replica(&self, username: &str) -> Result<bool> {
        let client = self.sql().await?;
        let row = client
            .query_one(
                "SELECT count(*) FROM pg_stat_replication WHERE usename = $1",
                &[&username],
            )
            .await
            .map_err(|e| KeeperError::PgControllerFailure(e.to_string()))?;
        let count: i64 = row.get(0);
        Ok(count > 0)
    }

    async fn init_db(&self) -> Result<()> {
        if self.pgdata.join("PG_VERSION").exists() {
            debug!(pgdata = ?self.pgdata, "data directory already initialized");
            return Ok(());
        }

        info!(pgdata = ?self.pgdata, "initializing data directory");
        self.pg_ctl(&[
            "initdb",
            "--options",
            &format!("--auth={}", self.auth_method),
        ])
        .await?;
        Ok(())
    }

    async fn start(&self) -> Result<()> {
        self.pg_ctl(&[
            "start",
            "--wait",
            "--options",
            &format!("-p {}", self.pgport),
        ])
        .await?;
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        if !self.postmaster_answers().await? {
            debug!("postgres was already stopped");
            return Ok(());
        }
        self.pg_ctl(&["stop", "--mode", "fast", "--wait"]).await?;
        Ok(())
    }

    async fn restart(&self) -> Result<()> {
        self.pg_ctl(&["restart", "--mode", "fast", "--wait"]).await?;
        Ok(())
    }

    async fn reload_conf(&self) -> Result<()> {
        self.pg_ctl(&["reload"]).await?;
        Ok(())
    }

    async fn promote(&self) -> Result<()> {
        self.pg_ctl(&["promote", "--wait"]).await?;
        Ok(())
    }

    async fn rewind_to(&self, source: &ReplicationSource) -> Result<()> {
        let mut source_server = format!(
            "host={} port={} user={} dbname=postgres",
            source.host, source.port, source.user
        );
        if let Some(password) = &source.password {
            source_server.push_str(&format!(" password={password}"));
        }

        run_tool(
            "pg_rewind",
            &[
                "--target-pgdata",
                &self.pgdata.to_string_lossy(),
                "--source-server",
                &source_server,
            ],
        )
        .await?;

        write_standby_configuration(&self.pgdata, source)?;
        Ok(())
    }

    async fn init_standby(&self, source: &ReplicationSource) -> Result<()> {
        if self.pgdata.exists() {
            clear_directory(&self.pgdata)?;
        }

        let pgdata = self.pgdata.to_string_lossy().into_owned();
        let port = source.port.to_string();
        let mut args = vec![
            "--pgdata",
            pgdata.as_str(),
            "--host",
            &source.host,
            "--port",
            &port,
            "--username",
            &source.user,
            "--wal-method=stream",
            "--slot",
            &source.slot,
            "--write-recovery-conf",
        ];

        let mut command = Command::new("pg_basebackup");
        if let Some(password) = &source.password {
            // pg_basebackup reads the password from the environment.
            command.env("PGPASSWORD", password);
        } else {
            args.push("--no-password");
        }
        command.args(&args);

        run_command(command, "pg_basebackup").await?;
        Ok(())
    }

    async fn stop_replication(&self) -> Result<()> {
        let client = self.sql().await?;
        client
            .execute("SELECT pg_wal_replay_pause()", &[])
            .await
            .map_err(|e| KeeperError::PgControllerFailure(e.to_string()))?;
        Ok(())
    }

    async fn add_default_settings(&self) -> Result<()> {
        let path = self.pgdata.join("postgresql.conf");
        let current = std::fs::read_to_string(&path)?;

        if current.contains(SETTINGS_MARKER) {
            return Ok(());
        }

        let block = format!(
            "\n{SETTINGS_MARKER}\n\
             listen_addresses = '*'\n\
             port = {}\n\
             wal_level = replica\n\
             max_wal_senders = 4\n\
             max_replication_slots = 4\n\
             hot_standby = on\n",
            self.pgport
        );
        let mut contents = current;
        contents.push_str(&block);
        std::fs::write(&path, contents)?;

        info!("added default settings to postgresql.conf");
        Ok(())
    }

    async fn create_replication_slot(&self, name: &str) -> Result<()> {
        let client = self.sql().await?;
        let row = client
            .query_one(
                "SELECT count(*) FROM pg_replication_slots WHERE slot_name = $1",
                &[&name],
            )
            .await
            .map_err(|e| KeeperError::PgControllerFailure(e.to_string()))?;
        let count: i64 = row.get(0);
        if count > 0 {
            return Ok(());
        }

        client
            .execute("SELECT pg_create_physical_replication_slot($1)", &[&name])
            .await
            .map_err(|e| KeeperError::PgControllerFailure(e.to_string()))?;
        info!(slot = name, "created replication slot");
        Ok(())
    }

    async fn drop_replication_slot(&self, name: &str) -> Result<()> {
        let client = self.sql().await?;
        let dropped = client
            .execute(
                "SELECT pg_drop_replication_slot(slot_name) \
                 FROM pg_replication_slots WHERE slot_name = $1",
                &[&name],
            )
            .await
            .map_err(|e| KeeperError::PgControllerFailure(e.to_string()))?;
        if dropped > 0 {
            info!(slot = name, "dropped replication slot");
        }
        Ok(())
    }

    async fn enable_sync_rep(&self) -> Result<()> {
        let client = self.sql().await?;
        client
            .batch_execute(
                "ALTER SYSTEM SET synchronous_standby_names TO '*'; \
                 SELECT pg_reload_conf();",
            )
            .await
            .map_err(|e| KeeperError::PgControllerFailure(e.to_string()))?;
        info!("enabled synchronous replication");
        Ok(())
    }

    async fn disable_sync_rep(&self) -> Result<()> {
        let client = self.sql().await?;
        client
            .batch_execute(
                "ALTER SYSTEM RESET synchronous_standby_names; \
                 SELECT pg_reload_conf();",
            )
            .await
            .map_err(|e| KeeperError::PgControllerFailure(e.to_string()))?;
        info!("disabled synchronous replication");
        Ok(())
    }

    async fn create_monitor_user(&self, host: &str, auth_method: &str) -> Result<()> {
        let client = self.sql().await?;
        client
            .batch_execute(&format!(
                "DO $$ BEGIN \
                   IF NOT EXISTS (SELECT FROM pg_roles \
                                  WHERE rolname = '{MONITOR_USERNAME}') THEN \
                     CREATE ROLE \"{MONITOR_USERNAME}\" LOGIN; \
                   END IF; \
                 END $$;"
            ))
            .await
            .map_err(|e| KeeperError::PgControllerFailure(e.to_string()))?;

        self.append_hba_entries(&[format!(
            "host postgres {MONITOR_USERNAME} {host} {auth_method}"
        )])?;
        self.reload_conf().await
    }

    async fn create_replication_user(
        &self,
        name: &str,
        password: Option<&str>,
    ) -> Result<()> {
        let client = self.sql().await?;

        let create = password.map_or_else(
            || format!("CREATE ROLE \"{name}\" LOGIN REPLICATION"),
            |password| {
                format!("CREATE ROLE \"{name}\" LOGIN REPLICATION PASSWORD '{password}'")
            },
        );

        client
            .batch_execute(&format!(
                "DO $$ BEGIN \
                   IF NOT EXISTS (SELECT FROM pg_roles WHERE rolname = '{name}') THEN \
                     {create}; \
                   END IF; \
                 END $$;"
            ))
            .await
            .map_err(|e| KeeperError::PgControllerFailure(e.to_string()))?;
        Ok(())
    }

    async fn add_standby_to_hba(&self, host: &str) -> Result<()> {
        self.append_hba_entries(&[
            format!(
                "host replication {REPLICATION_USERNAME} {host} {}",
                self.auth_method
            ),
            format!("host all {REPLICATION_USERNAME} {host} {}", self.auth_method),
        ])?;
        self.reload_conf().await?;
        info!(standby = host, "added standby to pg_hba.conf");
        Ok(())
    }
}

/// Leave the instance configured to stream from the given source.
fn write_standby_configuration(pgdata: &Path, source: &ReplicationSource) -> Result<()> {
    let mut conninfo = format!(
        "host={} port={} user={} application_name=pgautofailover",
        source.host, source.port, source.user
    );
    if let Some(password) = &source.password {
        conninfo.push_str(&format!(" password={password}"));
    }

    let auto_conf = pgdata.join("postgresql.auto.conf");
    let mut contents = std::fs::read_to_string(&auto_conf).unwrap_or_default();
    if !contents.ends_with('\n') && !contents.is_empty() {
        contents.push('\n');
    }
    contents.push_str(&format!(
        "primary_conninfo = '{conninfo}'\nprimary_slot_name = '{}'\n",
        source.slot
    ));
    std::fs::write(&auto_conf, contents)?;

    std::fs::write(pgdata.join("standby.signal"), "")?;
    Ok(())
}

fn clear_directory(dir: &Path) -> Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            std::fs::remove_dir_all(&path)?;
        } else {
            std::fs::remove_file(&path)?;
        }
    }
    Ok(())
}

async fn run_tool(program: &str, args: &[&str]) -> Result<String> {
    let mut command = Command::new(program);
    command.args(args);
    run_command(command, program).await
}

async fn run_command(mut command: Command, program: &str) -> Result<String> {
    debug!(?command, "running");

    let output = command
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|e| KeeperError::PgControllerFailure(format!("{program}: {e}")))?;

    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();

    if output.status.success() {
        Ok(stdout)
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr);
        warn!(program, code = output.status.code(), "command failed");
        Err(KeeperError::PgControllerFailure(format!(
            "{program} failed ({}): {}",
            output.status,
            stderr.trim()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn controller(dir: &TempDir) -> PgCtlController {
        PgCtlController::new(dir.path().to_path_buf(), 5432, "trust".into())
    }

    #[tokio::test]
    async fn test_add_default_settings_is_idempotent() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("postgresql.conf"), "# base\n").unwrap();
        let pg = controller(&dir);

        pg.add_default_settings().await.unwrap();
        let once = std::fs::read_to_string(dir.path().join("postgresql.conf")).unwrap();

        pg.add_default_settings().await.unwrap();
        let twice = std::fs::read_to_string(dir.path().join("postgresql.conf")).unwrap();

        assert_eq!(once, twice);
        assert!(once.contains("wal_level = replica"));
        assert!(once.contains(SETTINGS_MARKER));
    }

    #[tokio::test]
    async fn test_hba_entries_are_deduplicated() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("pg_hba.conf"), "local all all trust\n").unwrap();
        let pg = controller(&dir);

        let entry = "host replication pgautofailover_replicator standby trust".to_string();
        pg.append_hba_entries(std::slice::from_ref(&entry)).unwrap();
        pg.append_hba_entries(std::slice::from_ref(&entry)).unwrap();

        let hba = std::fs::read_to_string(dir.path().join("pg_hba.conf")).unwrap();
        assert_eq!(hba.matches("pgautofailover_replicator").count(), 1);
    }

    #[test]
    fn test_standby_configuration_files() {
        let dir = TempDir::new().unwrap();
        let source = ReplicationSource {
            host: "primary".into(),
            port: 5432,
            user: "pgautofailover_replicator".into(),
            password: Some("secret".into()),
            slot: "pgautofailover_standby".into(),
        };

        write_standby_configuration(dir.path(), &source).unwrap();

        assert!(dir.path().join("standby.signal").exists());
        let auto = std::fs::read_to_string(dir.path().join("postgresql.auto.conf")).unwrap();
        assert!(auto.contains("primary_conninfo"));
        assert!(auto.contains("host=primary"));
        assert!(auto.contains("primary_slot_name = 'pgautofailover_standby'"));
    }
}
