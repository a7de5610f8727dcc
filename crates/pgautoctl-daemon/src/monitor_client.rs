//! Monitor client backed by SQL against the `pgautofailover` extension.
//!
//! One short-lived connection per exchange: the keeper only talks to the
//! monitor once per tick, and a fresh connection makes the failure model
//! trivial. Whatever goes wrong — connect, timeout, SQL — the caller sees
//! a single `MonitorUnreachable` kind; retry policy lives in the loop.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pgautoctl_core::error::{KeeperError, Result};
use pgautoctl_core::monitor::{
    MonitorAssignment, MonitorClient, MonitorEvent, NodeActiveReport, NodeAddress,
};
use pgautoctl_core::node_state::NodeState;
use tokio_postgres::{Client, NoTls, Row};
use tracing::debug;

/// Upper bound on one monitor exchange (connect plus statement), kept well
/// under the tick interval so a hung monitor cannot stall the loop across
/// more than one tick.
const MONITOR_CALL_TIMEOUT: Duration = Duration::from_secs(4);

/// The production monitor client.
#[derive(Debug, Clone)]
pub struct SqlMonitorClient {
    uri: String,
}

impl SqlMonitorClient {
    /// A client for the given monitor connection URI.
    #[must_use]
    pub fn new(uri: impl Into<String>) -> Self {
        Self { uri: uri.into() }
    }

    async fn connect(&self) -> Result<Client> {
        let connect = tokio_postgres::connect(&self.uri, NoTls);
        let (client, connection) = tokio::time::timeout(MONITOR_CALL_TIMEOUT, connect)
            .await
            .map_err(|_| unreachable_err("connection timed out"))?
            .map_err(|e| unreachable_err(&e.to_string()))?;

        tokio::spawn(async move {
            if let Err(e) = connection.await {
                debug!("monitor connection closed: {e}");
            }
        });

        Ok(client)
    }

    async fn query_one(
        &self,
        sql: &str,
        params: &[&(dyn tokio_postgres::types::ToSql + Sync)],
    ) -> Result<Row> {
        let client = self.connect().await?;
        tokio::time::timeout(MONITOR_CALL_TIMEOUT, client.query_one(sql, params))
            .await
            .map_err(|_| unreachable_err("statement timed out"))?
            .map_err(|e| unreachable_err(&e.to_string()))
    }

    async fn execute(
        &self,
        sql: &str,
        params: &[&(dyn tokio_postgres::types::ToSql + Sync)],
    ) -> Result<()> {
        let client = self.connect().await?;
        tokio::time::timeout(MONITOR_CALL_TIMEOUT, client.execute(sql, params))
            .await
            .map_err(|_| unreachable_err("statement timed out"))?
            .map_err(|e| unreachable_err(&e.to_string()))?;
        Ok(())
    }

    fn assignment_from(row: &Row) -> Result<MonitorAssignment> {
        let node_id: i32 = row.get(0);
        let group_id: i32 = row.get(1);
        let state: String = row.get(2);

        Ok(MonitorAssignment {
            node_id,
            group_id,
            assigned_state: NodeState::parse(&state)
                .map_err(|e| unreachable_err(&e.to_string()))?,
        })
    }
}

fn unreachable_err(reason: &str) -> KeeperError {
    KeeperError::MonitorUnreachable(reason.to_string())
}

/// Install the `pgautofailover` extension on a local instance, turning it
/// into a monitor. Running the monitor service itself is the extension's
/// business, not the keeper's.
pub async fn bootstrap_monitor_extension(pgport: u16) -> Result<()> {
    let superuser = std::env::var("PGUSER")
        .or_else(|_| std::env::var("USER"))
        .unwrap_or_else(|_| "postgres".to_string());
    let conninfo = format!(
        "host=127.0.0.1 port={pgport} user={superuser} dbname=postgres connect_timeout=5"
    );

    let (client, connection) = tokio_postgres::connect(&conninfo, NoTls)
        .await
        .map_err(|e| unreachable_err(&e.to_string()))?;
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            debug!("local SQL connection closed: {e}");
        }
    });

    client
        .batch_execute("CREATE EXTENSION IF NOT EXISTS pgautofailover CASCADE")
        .await
        .map_err(|e| unreachable_err(&e.to_string()))
}

#[async_trait]
impl MonitorClient for SqlMonitorClient {
    async fn node_active(&self, report: &NodeActiveReport) -> Result<MonitorAssignment> {
        let row = self
            .query_one(
                "SELECT assigned_node_id, assigned_group_id, assigned_node_state \
                 FROM pgautofailover.node_active($1, $2, $3, $4, $5, $6, $7, $8, $9)",
                &[
                    &report.formation,
                    &report.nodename,
                    &i32::from(report.pgport),
                    &report.node_id,
                    &report.group_id,
                    &report.current_role.as_str(),
                    &report.pg_is_running,
                    &report.wal_lag_bytes,
                    &report.sync_state,
                ],
            )
            .await?;

        Self::assignment_from(&row)
    }

    async fn register(
        &self,
        formation: &str,
        nodename: &str,
        pgport: u16,
        initial_state: NodeState,
    ) -> Result<MonitorAssignment> {
        let row = self
            .query_one(
                "SELECT assigned_node_id, assigned_group_id, assigned_node_state \
                 FROM pgautofailover.register_node($1, $2, $3, $4)",
                &[
                    &formation,
                    &nodename,
                    &i32::from(pgport),
                    &initial_state.as_str(),
                ],
            )
            .await?;

        Self::assignment_from(&row)
    }

    async fn remove(&self, node_id: i32, group_id: i32) -> Result<()> {
        self.execute(
            "SELECT pgautofailover.remove_node($1, $2)",
            &[&node_id, &group_id],
        )
        .await
    }

    async fn extension_version(&self) -> Result<String> {
        let row = self
            .query_one(
                "SELECT installed_version FROM pg_available_extensions \
                 WHERE name = 'pgautofailover'",
                &[],
            )
            .await?;
        let version: Option<String> = row.get(0);
        version.ok_or_else(|| unreachable_err("pgautofailover extension is not installed"))
    }

    async fn create_formation(&self, formation: &str) -> Result<()> {
        self.execute(
            "SELECT pgautofailover.create_formation($1)",
            &[&formation],
        )
        .await
    }

    async fn drop_formation(&self, formation: &str) -> Result<()> {
        self.execute("SELECT pgautofailover.drop_formation($1)", &[&formation])
            .await
    }

    async fn formation_uri(&self, formation: &str) -> Result<String> {
        let row = self
            .query_one(
                "SELECT pgautofailover.formation_uri($1)",
                &[&formation],
            )
            .await?;
        Ok(row.get(0))
    }

    async fn last_events(&self, formation: &str, count: usize) -> Result<Vec<MonitorEvent>> {
        let client = self.connect().await?;
        let count = i64::try_from(count).unwrap_or(i64::MAX);

        let rows = tokio::time::timeout(
            MONITOR_CALL_TIMEOUT,
            client.query(
                "SELECT event_time, node_id, group_id, description \
                 FROM pgautofailover.last_events($1, $2)",
                &[&formation, &count],
            ),
        )
        .await
        .map_err(|_| unreachable_err("statement timed out"))?
        .map_err(|e| unreachable_err(&e.to_string()))?;

        Ok(rows
            .iter()
            .map(|row| {
                let event_time: DateTime<Utc> = row.get(0);
                MonitorEvent {
                    event_time,
                    node_id: row.get(1),
                    group_id: row.get(2),
                    description: row.get(3),
                }
            })
            .collect())
    }

    async fn enable_secondary(&self, formation: &str) -> Result<()> {
        self.execute(
            "SELECT pgautofailover.enable_secondary($1)",
            &[&formation],
        )
        .await
    }

    async fn disable_secondary(&self, formation: &str) -> Result<()> {
        self.execute(
            "SELECT pgautofailover.disable_secondary($1)",
            &[&formation],
        )
        .await
    }

    async fn start_maintenance(&self, node_id: i32, group_id: i32) -> Result<()> {
        self.execute(
            "SELECT pgautofailover.start_maintenance($1, $2)",
            &[&node_id, &group_id],
        )
        .await
    }

    async fn stop_maintenance(&self, node_id: i32, group_id: i32) -> Result<()> {
        self.execute(
            "SELECT pgautofailover.stop_maintenance($1, $2)",
            &[&node_id, &group_id],
        )
        .await
    }

    async fn primary_node(&self, formation: &str, group_id: i32) -> Result<NodeAddress> {
        let row = self
            .query_one(
                "SELECT primary_name, primary_port \
                 FROM pgautofailover.get_primary($1, $2)",
                &[&formation, &group_id],
            )
            .await?;

        let host: String = row.get(0);
        let port: i32 = row.get(1);
        Ok(NodeAddress {
            host,
            port: u16::try_from(port).map_err(|_| unreachable_err("invalid primary port"))?,
        })
    }

    async fn other_node(&self, node_id: i32, group_id: i32) -> Result<NodeAddress> {
        let row = self
            .query_one(
                "SELECT node_name, node_port \
                 FROM pgautofailover.get_other_node($1, $2)",
                &[&node_id, &group_id],
            )
            .await?;

        let host: String = row.get(0);
        let port: i32 = row.get(1);
        Ok(NodeAddress {
            host,
            port: u16::try_from(port).map_err(|_| unreachable_err("invalid node port"))?,
        })
    }
}
