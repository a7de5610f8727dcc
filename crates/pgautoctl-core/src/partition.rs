//! Network partition detection for a primary that lost the monitor.
//!
//! The monitor together with a surviving standby may promote after the
//! partition timeout has passed. A former primary that can reach neither of
//! them must therefore withdraw before that same timeout elapses on the
//! other side, which guarantees at most one primary.

use tracing::{info, warn};

use crate::node_state::NodeState;
use crate::state::KeeperState;

/// Outcome of a partition check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionCheck {
    /// Recent enough contact with the monitor or a standby; stay primary.
    Healthy,
    /// Bilateral silence beyond the timeout; the caller must assign
    /// `DEMOTE_TIMEOUT`.
    Partitioned,
}

/// Decide whether a primary that lost the monitor sits in a true partition.
///
/// `has_replica` is the live `pg_stat_replication` probe taken by the
/// caller this tick. A connected standby refreshes
/// `last_secondary_contact` and is proof of a healthy network.
#[must_use]
pub fn check_network_partition(
    state: &mut KeeperState,
    now: u64,
    timeout_secs: u64,
    has_replica: bool,
) -> PartitionCheck {
    if state.current_role != NodeState::Primary {
        // Fail-over only threatens a primary; every other role just waits
        // for the monitor to come back.
        return PartitionCheck::Healthy;
    }

    if has_replica {
        state.touch_secondary_contact(now);
        warn!(
            "lost the monitor, but a standby is still connected: \
             not in a network partition, continuing"
        );
        return PartitionCheck::Healthy;
    }

    let monitor_lag = now.saturating_sub(state.last_monitor_contact);
    let secondary_lag = now.saturating_sub(state.last_secondary_contact);

    let partitioned = state.last_monitor_contact > 0
        && state.last_secondary_contact > 0
        && monitor_lag > timeout_secs
        && secondary_lag > timeout_secs;

    if partitioned {
        info!(
            monitor_lag_secs = monitor_lag,
            secondary_lag_secs = secondary_lag,
            timeout_secs,
            "failed to contact the monitor or a standby past the partition \
             timeout, shutting PostgreSQL down to prevent a split brain"
        );
        PartitionCheck::Partitioned
    } else {
        PartitionCheck::Healthy
    }
}
