//! Persisted keeper state.
//!
//! The keeper tracks one record per node: the locally observed PostgreSQL
//! facts, the FSM roles, and the contact timestamps the partition detector
//! feeds on. The record is owned and mutated by the reconcile loop only;
//! everything else reads snapshots through [`StateStore`].

mod store;

pub use store::StateStore;

use serde::Serialize;

use crate::error::{KeeperError, Result};
use crate::node_state::NodeState;

/// Longest value the `sync_state` field stores on disk
/// (`potential` and `quorum` both fit with room to spare).
pub const SYNC_STATE_LEN: usize = 16;

/// Facts the keeper observes about its local PostgreSQL instance.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PgProbe {
    /// Server version number, e.g. `160004`.
    pub pg_version: u32,
    /// `pg_control` version, fixed for the life of a data directory.
    pub pg_control_version: u32,
    /// Cluster system identifier, fixed for the life of a data directory.
    pub system_identifier: u64,
    /// Whether the postmaster answers.
    pub is_running: bool,
    /// Replication lag in bytes, `-1` when unknown.
    pub wal_lag_bytes: i64,
    /// `pg_stat_replication.sync_state` as reported, empty when absent.
    pub sync_state: String,
}

/// The durable keeper record, one per node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KeeperState {
    /// PostgreSQL server version last observed.
    pub pg_version: u32,
    /// `pg_control` version; once non-zero it never changes.
    pub pg_control_version: u32,
    /// Cluster system identifier; once non-zero it never changes.
    pub system_identifier: u64,
    /// Node id assigned by the monitor at registration.
    pub current_node_id: i32,
    /// Group id assigned by the monitor at registration.
    pub current_group: i32,
    /// Role the node is currently in.
    pub current_role: NodeState,
    /// Role the monitor wants the node in.
    pub assigned_role: NodeState,
    /// Epoch seconds of the last successful monitor exchange, 0 if never.
    pub last_monitor_contact: u64,
    /// Epoch seconds of the last observed standby connection, 0 if never.
    pub last_secondary_contact: u64,
    /// Replication lag in bytes at last probe, `-1` when unknown.
    pub xlog_lag_bytes: i64,
    /// Whether PostgreSQL was running at last probe.
    pub pg_is_running: bool,
    /// `sync_state` string at last probe.
    pub sync_state: String,
}

impl KeeperState {
    /// Fresh record for a node that has not registered yet.
    #[must_use]
    pub fn new() -> Self {
        Self {
            pg_version: 0,
            pg_control_version: 0,
            system_identifier: 0,
            current_node_id: -1,
            current_group: -1,
            current_role: NodeState::Init,
            assigned_role: NodeState::Init,
            last_monitor_contact: 0,
            last_secondary_contact: 0,
            xlog_lag_bytes: -1,
            pg_is_running: false,
            sync_state: String::new(),
        }
    }

    /// Fold a fresh PostgreSQL probe into the record.
    ///
    /// # Errors
    ///
    /// Returns `StateCorrupt`-grade errors when the probe contradicts the
    /// data directory identity: `pg_control_version` and
    /// `system_identifier`, once recorded, must never change.
    pub fn observe_pg(&mut self, probe: &PgProbe) -> Result<()> {
        if self.pg_control_version != 0
            && probe.pg_control_version != 0
            && probe.pg_control_version != self.pg_control_version
        {
            return Err(KeeperError::Internal(format!(
                "pg_control version changed from {} to {}",
                self.pg_control_version, probe.pg_control_version
            )));
        }

        if self.system_identifier != 0
            && probe.system_identifier != 0
            && probe.system_identifier != self.system_identifier
        {
            return Err(KeeperError::Internal(format!(
                "system identifier changed from {} to {}",
                self.system_identifier, probe.system_identifier
            )));
        }

        if probe.pg_version != 0 {
            self.pg_version = probe.pg_version;
        }
        if probe.pg_control_version != 0 {
            self.pg_control_version = probe.pg_control_version;
        }
        if probe.system_identifier != 0 {
            self.system_identifier = probe.system_identifier;
        }

        self.pg_is_running = probe.is_running;
        self.xlog_lag_bytes = probe.wal_lag_bytes;
        self.sync_state.clear();
        self.sync_state.push_str(&probe.sync_state);
        if self.sync_state.len() > SYNC_STATE_LEN {
            let mut cut = SYNC_STATE_LEN;
            while !self.sync_state.is_char_boundary(cut) {
                cut -= 1;
            }
            self.sync_state.truncate(cut);
        }

        Ok(())
    }

    /// Record a successful monitor exchange. Timestamps never move backward.
    pub fn touch_monitor_contact(&mut self, now: u64) {
        self.last_monitor_contact = self.last_monitor_contact.max(now);
    }

    /// Record an observed standby connection. Timestamps never move backward.
    pub fn touch_secondary_contact(&mut self, now: u64) {
        self.last_secondary_contact = self.last_secondary_contact.max(now);
    }
}

impl Default for KeeperState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn probe() -> PgProbe {
        PgProbe {
            pg_version: 160_004,
            pg_control_version: 1300,
            system_identifier: 7_215_223_639_716_209_244,
            is_running: true,
            wal_lag_bytes: 0,
            sync_state: "sync".into(),
        }
    }

    #[test]
    fn test_observe_pg_records_identity_once() {
        let mut state = KeeperState::new();
        state.observe_pg(&probe()).unwrap();

        assert_eq!(state.pg_control_version, 1300);
        assert_eq!(state.system_identifier, 7_215_223_639_716_209_244);
        assert!(state.pg_is_running);
        assert_eq!(state.sync_state, "sync");
    }

    #[test]
    fn test_identity_change_is_rejected() {
        let mut state = KeeperState::new();
        state.observe_pg(&probe()).unwrap();

        let mut other = probe();
        other.system_identifier += 1;
        assert!(state.observe_pg(&other).is_err());

        let mut other = probe();
        other.pg_control_version = 1500;
        assert!(state.observe_pg(&other).is_err());
    }

    #[test]
    fn test_stopped_probe_keeps_identity() {
        let mut state = KeeperState::new();
        state.observe_pg(&probe()).unwrap();

        // A probe of a stopped server reports zeros; identity must survive.
        state.observe_pg(&PgProbe::default()).unwrap();
        assert_eq!(state.pg_control_version, 1300);
        assert_eq!(state.system_identifier, 7_215_223_639_716_209_244);
        assert!(!state.pg_is_running);
    }

    #[test]
    fn test_contact_timestamps_are_monotonic() {
        let mut state = KeeperState::new();

        state.touch_monitor_contact(100);
        state.touch_monitor_contact(90);
        assert_eq!(state.last_monitor_contact, 100);

        state.touch_secondary_contact(50);
        state.touch_secondary_contact(200);
        assert_eq!(state.last_secondary_contact, 200);
    }
}
