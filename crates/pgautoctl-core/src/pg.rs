//! PostgreSQL controller contract.
//!
//! The keeper never runs `pg_ctl` or SQL itself; it drives this capability
//! set. All policy lives in the FSM, the adapter only executes. The daemon
//! crate ships the real implementation, tests use recording mocks.

use async_trait::async_trait;

use crate::error::Result;
use crate::state::PgProbe;

/// Where a standby streams from, and how it authenticates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicationSource {
    /// Host of the upstream primary.
    pub host: String,
    /// Port of the upstream primary.
    pub port: u16,
    /// Replication user name.
    pub user: String,
    /// Password for the replication user, when required.
    pub password: Option<String>,
    /// Replication slot reserved for this standby on the primary.
    pub slot: String,
}

/// Operations the keeper may ask of its local PostgreSQL instance.
///
/// Every method is a thin, policy-free command; failures surface as
/// [`PgControllerFailure`](crate::error::KeeperError::PgControllerFailure)
/// and the reconcile loop retries on its next tick.
#[async_trait]
pub trait PgController: Send + Sync {
    /// Observe the instance: liveness, identity, WAL lag, sync state.
    ///
    /// A stopped instance reports `is_running = false` and zeroed identity
    /// fields rather than an error.
    async fn probe(&self) -> Result<PgProbe>;

    /// Whether a standby is connected and streaming as the given user.
    async fn has_replica(&self, username: &str) -> Result<bool>;

    /// Initialize an empty data directory for a brand-new primary. No-op
    /// when the data directory is already initialized.
    async fn init_db(&self) -> Result<()>;

    /// Start the instance.
    async fn start(&self) -> Result<()>;

    /// Stop the instance. Stopping a stopped instance is not an error.
    async fn stop(&self) -> Result<()>;

    /// Stop then start the instance.
    async fn restart(&self) -> Result<()>;

    /// Signal the instance to re-read its configuration files.
    async fn reload_conf(&self) -> Result<()>;

    /// Promote a standby to accept writes.
    async fn promote(&self) -> Result<()>;

    /// Rewind the local data directory against a new primary, leaving the
    /// instance configured as a standby of that primary (not started).
    async fn rewind_to(&self, source: &ReplicationSource) -> Result<()>;

    /// Clone the upstream primary into the local data directory and
    /// configure the instance as its streaming standby (not started).
    async fn init_standby(&self, source: &ReplicationSource) -> Result<()>;

    /// Stop WAL replay and disconnect from the upstream, ahead of a
    /// promotion.
    async fn stop_replication(&self) -> Result<()>;

    /// Append the settings every managed instance needs.
    async fn add_default_settings(&self) -> Result<()>;

    /// Create a physical replication slot.
    async fn create_replication_slot(&self, name: &str) -> Result<()>;

    /// Drop a physical replication slot. Dropping a missing slot is not an
    /// error.
    async fn drop_replication_slot(&self, name: &str) -> Result<()>;

    /// Require synchronous commit from the standby.
    async fn enable_sync_rep(&self) -> Result<()>;

    /// Stop requiring synchronous commit.
    async fn disable_sync_rep(&self) -> Result<()>;

    /// Create the user the monitor connects back as, and open hba for it.
    async fn create_monitor_user(&self, host: &str, auth_method: &str) -> Result<()>;

    /// Create the replication user a standby streams as.
    async fn create_replication_user(&self, name: &str, password: Option<&str>)
        -> Result<()>;

    /// Open `pg_hba.conf` for a standby host and reload.
    async fn add_standby_to_hba(&self, host: &str) -> Result<()>;
}
