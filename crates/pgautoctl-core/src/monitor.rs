//! Monitor client contract.
//!
//! The monitor is the single authority for assigned roles. The keeper talks
//! to it through this interface; every failure, whatever the cause, is
//! reported as [`MonitorUnreachable`](crate::error::KeeperError::MonitorUnreachable)
//! and the retry policy belongs to the reconcile loop.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::node_state::NodeState;

/// What the keeper reports on every `node_active` exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeActiveReport {
    /// Formation the node belongs to.
    pub formation: String,
    /// Node name, as registered.
    pub nodename: String,
    /// Port the local PostgreSQL listens on.
    pub pgport: u16,
    /// Node id assigned at registration.
    pub node_id: i32,
    /// Group id assigned at registration.
    pub group_id: i32,
    /// Role the node is currently in.
    pub current_role: NodeState,
    /// Whether the local PostgreSQL is running.
    pub pg_is_running: bool,
    /// Replication lag in bytes, `-1` when unknown.
    pub wal_lag_bytes: i64,
    /// `pg_stat_replication.sync_state`, empty when absent.
    pub sync_state: String,
}

/// The monitor's answer: where this node stands, and where it should go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonitorAssignment {
    /// Node id, authoritative.
    pub node_id: i32,
    /// Group id, authoritative.
    pub group_id: i32,
    /// Role the monitor wants this node in.
    pub assigned_state: NodeState,
}

/// Host and port of a peer node, as known by the monitor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeAddress {
    /// Hostname of the peer.
    pub host: String,
    /// PostgreSQL port of the peer.
    pub port: u16,
}

/// One line of the monitor's event log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorEvent {
    /// When the monitor recorded the event.
    pub event_time: DateTime<Utc>,
    /// Node the event concerns.
    pub node_id: i32,
    /// Group the event concerns.
    pub group_id: i32,
    /// Free-form description.
    pub description: String,
}

/// Request/response interface to the monitor.
#[async_trait]
pub trait MonitorClient: Send + Sync {
    /// Report our state, receive the assigned state.
    async fn node_active(&self, report: &NodeActiveReport) -> Result<MonitorAssignment>;

    /// Register a new node and receive its identity and first assignment.
    async fn register(
        &self,
        formation: &str,
        nodename: &str,
        pgport: u16,
        initial_state: NodeState,
    ) -> Result<MonitorAssignment>;

    /// Remove a node from its formation.
    async fn remove(&self, node_id: i32, group_id: i32) -> Result<()>;

    /// Version of the monitor-side extension.
    async fn extension_version(&self) -> Result<String>;

    /// Create a formation.
    async fn create_formation(&self, formation: &str) -> Result<()>;

    /// Drop a formation.
    async fn drop_formation(&self, formation: &str) -> Result<()>;

    /// Connection URI clients use to reach the formation's primary.
    async fn formation_uri(&self, formation: &str) -> Result<String>;

    /// Most recent monitor events for a formation, newest last.
    async fn last_events(&self, formation: &str, count: usize) -> Result<Vec<MonitorEvent>>;

    /// Allow the formation to run with a secondary.
    async fn enable_secondary(&self, formation: &str) -> Result<()>;

    /// Forbid the formation from running with a secondary.
    async fn disable_secondary(&self, formation: &str) -> Result<()>;

    /// Put a node into maintenance on its next `node_active` exchange.
    async fn start_maintenance(&self, node_id: i32, group_id: i32) -> Result<()>;

    /// Bring a node back from maintenance.
    async fn stop_maintenance(&self, node_id: i32, group_id: i32) -> Result<()>;

    /// Address of the current primary of a group.
    async fn primary_node(&self, formation: &str, group_id: i32) -> Result<NodeAddress>;

    /// Address of the other node of a two-node group.
    async fn other_node(&self, node_id: i32, group_id: i32) -> Result<NodeAddress>;
}
