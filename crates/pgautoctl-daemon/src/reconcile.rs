//! The keeper's periodic reconcile loop.
//!
//! Every tick loads the durable state, probes the local PostgreSQL, reports
//! to the monitor, enforces the current role, drives the transition toward
//! the assigned role, and persists the state again. The state file is
//! written every tick even when nothing changed, so the partition timers
//! keep advancing.
//!
//! Fast-stop is honored at fixed barriers between those steps; a graceful
//! stop lets the tick finish first.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use pgautoctl_core::config::KeeperConfig;
use pgautoctl_core::error::{ExitCode, KeeperError};
use pgautoctl_core::fsm::{FsmExecutor, REPLICATION_USERNAME};
use pgautoctl_core::monitor::{MonitorClient, NodeActiveReport};
use pgautoctl_core::node_state::NodeState;
use pgautoctl_core::partition::{PartitionCheck, check_network_partition};
use pgautoctl_core::pg::PgController;
use pgautoctl_core::pidfile::PidGuard;
use pgautoctl_core::state::StateStore;
use tracing::{error, info, warn};

use crate::signals::SignalFlags;

/// Environment variable overriding the seconds slept between ticks.
pub const KEEPER_SLEEP_TIME_ENV: &str = "PG_AUTOCTL_KEEPER_SLEEP_TIME";

/// Default seconds slept between ticks.
pub const DEFAULT_KEEPER_SLEEP_SECS: u64 = 5;

/// Sleep between ticks, honoring the environment override.
#[must_use]
pub fn keeper_sleep_time() -> Duration {
    let secs = std::env::var(KEEPER_SLEEP_TIME_ENV)
        .ok()
        .and_then(|raw| raw.parse::<u64>().ok())
        .unwrap_or(DEFAULT_KEEPER_SLEEP_SECS);
    Duration::from_secs(secs)
}

/// What a single tick decided.
#[derive(Debug)]
pub enum TickOutcome {
    /// A transition completed; retry immediately without sleeping.
    Progressed,
    /// Nothing to do, or a retryable failure; sleep before the next tick.
    Idle,
    /// A fast-stop barrier was hit; exit without writing state.
    FastStop,
    /// A fatal condition; exit with the error's code.
    Fatal(KeeperError),
}

/// The reconcile loop, one per keeper process.
pub struct ReconcileLoop {
    config: KeeperConfig,
    config_path: PathBuf,
    store: StateStore,
    pid_guard: Arc<PidGuard>,
    pg: Arc<dyn PgController>,
    monitor: Arc<dyn MonitorClient>,
    flags: Arc<SignalFlags>,
    sleep_time: Duration,
}

impl ReconcileLoop {
    /// Assemble a loop from its collaborators.
    #[must_use]
    pub fn new(
        config: KeeperConfig,
        store: StateStore,
        pid_guard: Arc<PidGuard>,
        pg: Arc<dyn PgController>,
        monitor: Arc<dyn MonitorClient>,
        flags: Arc<SignalFlags>,
        sleep_time: Duration,
    ) -> Self {
        let config_path = config.pathnames().config;
        Self {
            config,
            config_path,
            store,
            pid_guard,
            pg,
            monitor,
            flags,
            sleep_time,
        }
    }

    /// The configuration currently in effect.
    #[must_use]
    pub const fn config(&self) -> &KeeperConfig {
        &self.config
    }

    /// Run ticks until asked to stop. Returns the process exit code.
    pub async fn run(&mut self) -> ExitCode {
        info!("pg_autoctl service is starting");

        let mut do_sleep = false;

        loop {
            if self.flags.reload_requested() {
                self.reload_configuration();
            }

            if self.flags.stop_requested() && !self.flags.fast_stop_requested() {
                break;
            }

            if do_sleep {
                tokio::time::sleep(self.sleep_time).await;
            }
            do_sleep = true;

            if self.flags.fast_stop_requested() {
                return ExitCode::Quit;
            }

            match self.tick(epoch_now()).await {
                TickOutcome::Progressed => do_sleep = false,
                TickOutcome::Idle => {}
                TickOutcome::FastStop => return ExitCode::Quit,
                TickOutcome::Fatal(e) => {
                    error!("fatal: {e}");
                    return e.exit_code();
                }
            }

            if self.flags.stop_requested() {
                break;
            }
        }

        info!("pg_autoctl service is stopping");
        ExitCode::Quit
    }

    /// One reconcile tick at the given wall-clock time (epoch seconds).
    pub async fn tick(&mut self, now: u64) -> TickOutcome {
        // The PID file must still be ours before we touch any state.
        if let Err(e) = self.pid_guard.check() {
            return TickOutcome::Fatal(e);
        }

        let mut state = match self.store.read() {
            Ok(state) => state,
            Err(e) => {
                error!("failed to read keeper state file, retrying: {e}");
                return self.barrier(TickOutcome::Idle);
            }
        };

        if self.flags.fast_stop_requested() {
            return TickOutcome::FastStop;
        }

        // Refresh the local PostgreSQL facts.
        match self.pg.probe().await {
            Ok(probe) => {
                if let Err(e) = state.observe_pg(&probe) {
                    return TickOutcome::Fatal(e);
                }
            }
            Err(e) => {
                warn!("failed to probe the local PostgreSQL instance: {e}");
                return self.barrier(TickOutcome::Idle);
            }
        }

        if self.flags.fast_stop_requested() {
            return TickOutcome::FastStop;
        }

        info!(
            formation = %self.config.pg_autoctl.formation,
            node_id = state.current_node_id,
            group = state.current_group,
            current_role = %state.current_role,
            pg_is_running = state.pg_is_running,
            sync_state = %state.sync_state,
            wal_lag = state.xlog_lag_bytes,
            "calling node_active"
        );

        let report = NodeActiveReport {
            formation: self.config.pg_autoctl.formation.clone(),
            nodename: self.config.pg_autoctl.nodename.clone(),
            pgport: self.config.postgresql.pgport,
            node_id: state.current_node_id,
            group_id: state.current_group,
            current_role: state.current_role,
            pg_is_running: state.pg_is_running,
            wal_lag_bytes: state.xlog_lag_bytes,
            sync_state: state.sync_state.clone(),
        };

        let monitor_reached = match self.monitor.node_active(&report).await {
            Ok(assignment) => {
                state.touch_monitor_contact(now);
                state.current_node_id = assignment.node_id;
                state.current_group = assignment.group_id;
                state.assigned_role = assignment.assigned_state;
                true
            }
            Err(e) => {
                error!("failed to get the goal state from the monitor: {e}");

                if state.current_role == NodeState::Primary {
                    warn!("checking for network partitions");

                    let has_replica = match self.pg.has_replica(REPLICATION_USERNAME).await {
                        Ok(connected) => connected,
                        Err(e) => {
                            warn!("failed to check for a connected standby: {e}");
                            false
                        }
                    };

                    let timeout = self.config.timeout.network_partition_timeout;
                    if check_network_partition(&mut state, now, timeout, has_replica)
                        == PartitionCheck::Partitioned
                    {
                        state.assigned_role = NodeState::DemoteTimeout;
                    }
                }
                false
            }
        };

        if self.flags.fast_stop_requested() {
            return TickOutcome::FastStop;
        }

        // Only enforce the current state off a fresh assignment; at boot
        // time the monitor may have demoted us while we were away, and
        // restarting PostgreSQL then would serve stale writes.
        if monitor_reached {
            if let Err(e) = {
                let fsm = FsmExecutor::new(&self.config, self.pg.as_ref(), self.monitor.as_ref());
                fsm.ensure_current_state(&mut state).await
            } {
                warn!(
                    role = %state.current_role,
                    "failed to ensure the current state: {e}"
                );
            }
        }

        if self.flags.fast_stop_requested() {
            return TickOutcome::FastStop;
        }

        let mut need_state_change = false;
        let mut transition_failed = false;

        if state.assigned_role != state.current_role {
            need_state_change = true;

            let result = {
                let fsm = FsmExecutor::new(&self.config, self.pg.as_ref(), self.monitor.as_ref());
                fsm.transition(&mut state).await
            };
            if let Err(e) = result {
                error!(
                    assigned = %state.assigned_role,
                    "failed to transition, retrying: {e}"
                );
                transition_failed = true;
            }
        }

        if self.flags.fast_stop_requested() {
            return TickOutcome::FastStop;
        }

        // Written even after a failed transition, so the partition timers
        // advance across ticks.
        if let Err(e) = self.store.write(&state) {
            error!("failed to write the keeper state file: {e}");
            transition_failed = true;
        }

        if need_state_change && !transition_failed {
            TickOutcome::Progressed
        } else {
            TickOutcome::Idle
        }
    }

    fn barrier(&self, fallthrough: TickOutcome) -> TickOutcome {
        if self.flags.fast_stop_requested() {
            TickOutcome::FastStop
        } else {
            fallthrough
        }
    }

    /// Re-read the configuration file, accepting reloadable fields only.
    pub fn reload_configuration(&mut self) {
        match KeeperConfig::load(&self.config_path) {
            Ok(new) => {
                if self.config.accept_new(new) {
                    info!(path = ?self.config_path, "reloaded configuration");
                } else {
                    info!(path = ?self.config_path, "configuration unchanged after reload");
                }
            }
            Err(e) => {
                warn!(
                    path = ?self.config_path,
                    "failed to reload configuration, keeping the current one: {e}"
                );
            }
        }

        self.flags.clear_reload();
    }
}

/// Wall clock in epoch seconds.
#[must_use]
pub fn epoch_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
