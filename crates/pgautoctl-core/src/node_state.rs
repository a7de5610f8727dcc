//! Node roles recognized by the keeper state machine.

use serde::{Deserialize, Serialize};

use crate::error::KeeperError;

/// Symbolic role of a node, as tracked locally and assigned by the monitor.
///
/// The wire code is what the persisted state record stores; readers reject
/// unknown codes rather than guessing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    /// Freshly created node, nothing decided yet.
    Init,
    /// Only node of its group, accepting writes, no standby.
    Single,
    /// Primary-to-be, waiting for a standby to catch up.
    WaitPrimary,
    /// Primary with synchronous replication to a healthy standby.
    Primary,
    /// Standby-to-be, waiting for the primary to prepare replication.
    WaitStandby,
    /// Standby replaying WAL, not yet caught up.
    Catchingup,
    /// Caught-up streaming standby.
    Secondary,
    /// Node parked by the operator; PostgreSQL is stopped.
    Maintenance,
    /// Primary draining client connections ahead of a demotion.
    Draining,
    /// Former primary, stopped, waiting to rejoin as a standby.
    Demoted,
    /// Former primary that demoted itself after a network partition.
    DemoteTimeout,
    /// Standby that stopped replaying WAL ahead of a promotion.
    StopReplication,
    /// Standby preparing for promotion (final catch-up).
    PrepPromotion,
    /// Standby promoted, not yet reconfigured as a full primary.
    StandbyPromoted,
}

impl NodeState {
    /// Every known state, in wire-code order.
    pub const ALL: [Self; 14] = [
        Self::Init,
        Self::Single,
        Self::WaitPrimary,
        Self::Primary,
        Self::WaitStandby,
        Self::Catchingup,
        Self::Secondary,
        Self::Maintenance,
        Self::Draining,
        Self::Demoted,
        Self::DemoteTimeout,
        Self::StopReplication,
        Self::PrepPromotion,
        Self::StandbyPromoted,
    ];

    /// Numeric code used in the persisted state record.
    #[must_use]
    pub const fn code(self) -> i32 {
        match self {
            Self::Init => 0,
            Self::Single => 1,
            Self::WaitPrimary => 2,
            Self::Primary => 3,
            Self::WaitStandby => 4,
            Self::Catchingup => 5,
            Self::Secondary => 6,
            Self::Maintenance => 7,
            Self::Draining => 8,
            Self::Demoted => 9,
            Self::DemoteTimeout => 10,
            Self::StopReplication => 11,
            Self::PrepPromotion => 12,
            Self::StandbyPromoted => 13,
        }
    }

    /// Decode a wire code.
    ///
    /// # Errors
    ///
    /// Returns `KeeperError::StateCorrupt` material (as a plain message) for
    /// codes this build does not know about.
    pub fn from_code(code: i32) -> Result<Self, KeeperError> {
        Self::ALL
            .into_iter()
            .find(|state| state.code() == code)
            .ok_or_else(|| KeeperError::Internal(format!("unknown node state code {code}")))
    }

    /// Parse the monitor's textual representation of a state.
    ///
    /// # Errors
    ///
    /// Unknown strings are rejected; the keeper never guesses a role.
    pub fn parse(name: &str) -> Result<Self, KeeperError> {
        Self::ALL
            .into_iter()
            .find(|state| state.as_str() == name)
            .ok_or_else(|| KeeperError::Internal(format!("unknown node state \"{name}\"")))
    }

    /// Monitor-facing name of the state.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Single => "single",
            Self::WaitPrimary => "wait_primary",
            Self::Primary => "primary",
            Self::WaitStandby => "wait_standby",
            Self::Catchingup => "catchingup",
            Self::Secondary => "secondary",
            Self::Maintenance => "maintenance",
            Self::Draining => "draining",
            Self::Demoted => "demoted",
            Self::DemoteTimeout => "demote_timeout",
            Self::StopReplication => "stop_replication",
            Self::PrepPromotion => "prep_promotion",
            Self::StandbyPromoted => "standby_promoted",
        }
    }

    /// Whether a node in this role expects its PostgreSQL instance to run.
    ///
    /// `ensure_current_state` starts or stops PostgreSQL to honor this.
    #[must_use]
    pub const fn expects_postgres_running(self) -> bool {
        match self {
            Self::Single
            | Self::WaitPrimary
            | Self::Primary
            | Self::Catchingup
            | Self::Secondary
            | Self::Draining
            | Self::StopReplication
            | Self::PrepPromotion
            | Self::StandbyPromoted => true,
            Self::Init
            | Self::WaitStandby
            | Self::Maintenance
            | Self::Demoted
            | Self::DemoteTimeout => false,
        }
    }

    /// Whether this role serves writes.
    #[must_use]
    pub const fn is_primary_role(self) -> bool {
        matches!(self, Self::Single | Self::WaitPrimary | Self::Primary)
    }
}

impl std::fmt::Display for NodeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_round_trip() {
        for state in NodeState::ALL {
            assert_eq!(NodeState::from_code(state.code()).unwrap(), state);
        }
    }

    #[test]
    fn test_name_round_trip() {
        for state in NodeState::ALL {
            assert_eq!(NodeState::parse(state.as_str()).unwrap(), state);
        }
    }

    #[test]
    fn test_unknown_code_rejected() {
        assert!(NodeState::from_code(99).is_err());
        assert!(NodeState::from_code(-1).is_err());
    }

    #[test]
    fn test_unknown_name_rejected() {
        assert!(NodeState::parse("split_brain").is_err());
        assert!(NodeState::parse("").is_err());
    }

    #[test]
    fn test_postgres_expectations() {
        assert!(NodeState::Primary.expects_postgres_running());
        assert!(NodeState::Secondary.expects_postgres_running());
        assert!(!NodeState::Demoted.expects_postgres_running());
        assert!(!NodeState::DemoteTimeout.expects_postgres_running());
        assert!(!NodeState::Maintenance.expects_postgres_running());
    }
}
