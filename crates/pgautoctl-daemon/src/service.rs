//! Service supervision.
//!
//! `pg_autoctl run` boils down to two supervised children sharing one
//! address space: the reconcile loop (sole writer of the state file) and
//! the status HTTP server (a reader). The supervisor owns the PID file, the
//! monitor extension check, the completion of an interrupted `create`, and
//! the restart policy; children never restart themselves.

use std::sync::Arc;
use std::time::Instant;

use pgautoctl_core::config::KeeperConfig;
use pgautoctl_core::error::{ExitCode, KeeperError};
use pgautoctl_core::monitor::MonitorClient;
use pgautoctl_core::node_state::NodeState;
use pgautoctl_core::pg::PgController;
use pgautoctl_core::pidfile::PidGuard;
use pgautoctl_core::state::{KeeperState, StateStore};
use pgautoctl_core::EXTENSION_VERSION;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::httpd;
use crate::monitor_client::SqlMonitorClient;
use crate::pgctl::PgCtlController;
use crate::reconcile::{ReconcileLoop, keeper_sleep_time};
use crate::restart::{RestartPolicy, RestartTracker};
use crate::signals::SignalFlags;

/// Run the keeper service with the production adapters.
pub async fn run(config: KeeperConfig) -> ExitCode {
    let pg: Arc<dyn PgController> = Arc::new(PgCtlController::new(
        config.postgresql.pgdata.clone(),
        config.postgresql.pgport,
        config.postgresql.auth_method.clone(),
    ));
    let monitor: Arc<dyn MonitorClient> =
        Arc::new(SqlMonitorClient::new(&config.pg_autoctl.monitor));

    let flags = SignalFlags::new();
    flags.install();

    run_with_adapters(config, pg, monitor, flags).await
}

/// Run the keeper service against the given adapters.
///
/// Split out from [`run`] so scenario tests can drive the whole service
/// with in-memory adapters.
pub async fn run_with_adapters(
    config: KeeperConfig,
    pg: Arc<dyn PgController>,
    monitor: Arc<dyn MonitorClient>,
    flags: Arc<SignalFlags>,
) -> ExitCode {
    let paths = config.pathnames();

    let pid_guard = match PidGuard::create(&paths.pid) {
        Ok(guard) => Arc::new(guard),
        Err(e) => {
            error!("{e}");
            return e.exit_code();
        }
    };

    if let Err(code) = startup_checks(&config, monitor.as_ref()).await {
        pid_guard.remove();
        return code;
    }

    let code = supervise(&config, pid_guard.clone(), pg, monitor, flags).await;

    pid_guard.remove();
    info!("pg_autoctl service stopped");
    code
}

/// Pre-flight: monitor extension version, and an interrupted `create`.
async fn startup_checks(
    config: &KeeperConfig,
    monitor: &dyn MonitorClient,
) -> Result<(), ExitCode> {
    match monitor.extension_version().await {
        Ok(version) if version == EXTENSION_VERSION => {
            info!(%version, "monitor extension version checked");
        }
        Ok(version) => {
            error!(
                found = %version,
                expected = EXTENSION_VERSION,
                "monitor runs an incompatible extension version"
            );
            return Err(ExitCode::Monitor);
        }
        Err(e) => {
            error!("failed to check the monitor extension version: {e}");
            return Err(ExitCode::Monitor);
        }
    }

    let paths = config.pathnames();
    if paths.init.exists() {
        warn!("a previous `pg_autoctl create` did not complete, completing now");
        if let Err(e) = complete_init(config, monitor).await {
            error!("failed to complete initialization: {e}");
            return Err(ExitCode::Monitor);
        }
    }

    Ok(())
}

/// Finish an interrupted `create`: register with the monitor, persist the
/// assigned identity, drop the init marker.
pub async fn complete_init(
    config: &KeeperConfig,
    monitor: &dyn MonitorClient,
) -> pgautoctl_core::Result<()> {
    let paths = config.pathnames();
    let store = StateStore::new(&paths.state);

    let mut state = if store.exists() {
        store.read()?
    } else {
        KeeperState::new()
    };

    let assignment = monitor
        .register(
            &config.pg_autoctl.formation,
            &config.pg_autoctl.nodename,
            config.postgresql.pgport,
            NodeState::Init,
        )
        .await?;

    state.current_node_id = assignment.node_id;
    state.current_group = assignment.group_id;
    state.assigned_role = assignment.assigned_state;
    store.write(&state)?;

    std::fs::remove_file(&paths.init).map_err(KeeperError::Io)?;
    info!(
        node_id = assignment.node_id,
        group = assignment.group_id,
        assigned = %assignment.assigned_state,
        "node registered with the monitor"
    );
    Ok(())
}

fn spawn_reconcile(
    config: &KeeperConfig,
    pid_guard: &Arc<PidGuard>,
    pg: &Arc<dyn PgController>,
    monitor: &Arc<dyn MonitorClient>,
    flags: &Arc<SignalFlags>,
) -> JoinHandle<ExitCode> {
    let mut keeper_loop = ReconcileLoop::new(
        config.clone(),
        StateStore::new(config.pathnames().state),
        Arc::clone(pid_guard),
        Arc::clone(pg),
        Arc::clone(monitor),
        Arc::clone(flags),
        keeper_sleep_time(),
    );

    tokio::spawn(async move { keeper_loop.run().await })
}

fn spawn_httpd(config: &KeeperConfig) -> JoinHandle<()> {
    let listen_address = config.httpd.listen_address.clone();
    let port = config.httpd.port;
    let pgdata = config.postgresql.pgdata.clone();

    tokio::spawn(async move {
        if let Err(e) = httpd::serve(&listen_address, port, pgdata).await {
            error!("HTTP server failed: {e}");
        }
    })
}

/// Supervise both children until the service is done.
async fn supervise(
    config: &KeeperConfig,
    pid_guard: Arc<PidGuard>,
    pg: Arc<dyn PgController>,
    monitor: Arc<dyn MonitorClient>,
    flags: Arc<SignalFlags>,
) -> ExitCode {
    let mut reconcile_tracker = RestartTracker::new(RestartPolicy::default());
    let mut httpd_tracker = RestartTracker::new(RestartPolicy::default());

    let mut reconcile_task = spawn_reconcile(config, &pid_guard, &pg, &monitor, &flags);
    let mut httpd_task = spawn_httpd(config);

    loop {
        tokio::select! {
            finished = &mut reconcile_task => {
                let code = match finished {
                    Ok(code) => code,
                    Err(e) => {
                        error!("reconcile loop panicked: {e}");
                        ExitCode::Internal
                    }
                };

                // A clean surrender is final: stop the sibling and exit the
                // whole group with the child's code.
                if code == ExitCode::Quit || flags.stop_requested() {
                    httpd_task.abort();
                    return code;
                }

                match reconcile_tracker.next_restart(Instant::now()) {
                    Some(delay) => {
                        warn!(
                            code = code.value(),
                            restarts = reconcile_tracker.restart_count(),
                            "reconcile loop exited, restarting in {delay:?}"
                        );
                        tokio::time::sleep(delay).await;
                        reconcile_task =
                            spawn_reconcile(config, &pid_guard, &pg, &monitor, &flags);
                    }
                    None => {
                        error!(
                            code = code.value(),
                            "reconcile loop keeps failing, stopping the service"
                        );
                        httpd_task.abort();
                        return code;
                    }
                }
            }

            finished = &mut httpd_task => {
                if flags.stop_requested() {
                    // The group is going down anyway; the reconcile child
                    // finishes its tick and decides the exit code.
                    return match (&mut reconcile_task).await {
                        Ok(code) => code,
                        Err(_) => ExitCode::Internal,
                    };
                }

                if let Err(e) = finished {
                    error!("HTTP server panicked: {e}");
                } else {
                    error!("HTTP server exited unexpectedly");
                }

                match httpd_tracker.next_restart(Instant::now()) {
                    Some(delay) => {
                        warn!(
                            restarts = httpd_tracker.restart_count(),
                            "restarting the HTTP server in {delay:?}"
                        );
                        tokio::time::sleep(delay).await;
                        httpd_task = spawn_httpd(config);
                    }
                    None => {
                        error!("HTTP server keeps failing, stopping the service");
                        flags.request_fast_stop();
                        let code = match (&mut reconcile_task).await {
                            Ok(code) => code,
                            Err(_) => ExitCode::Internal,
                        };
                        // Both children are down because of the HTTP
                        // server; report the supervision failure, not the
                        // clean child exit.
                        return if code == ExitCode::Quit {
                            ExitCode::Internal
                        } else {
                            code
                        };
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pgautoctl_core::config::{
        ControlSection, FileRole, HttpdSection, PostgresSection, ReplicationSection,
        TimeoutSection,
    };
    use pgautoctl_core::fakes::FakeMonitor;
    use tempfile::TempDir;

    fn config_in(dir: &TempDir) -> KeeperConfig {
        KeeperConfig {
            pg_autoctl: ControlSection {
                role: FileRole::Keeper,
                formation: "default".into(),
                nodename: "node-a".into(),
                monitor: "postgres://autoctl_node@monitor/pg_auto_failover".into(),
            },
            postgresql: PostgresSection {
                pgdata: dir.path().to_path_buf(),
                pgport: 5432,
                auth_method: "trust".into(),
            },
            replication: ReplicationSection::default(),
            timeout: TimeoutSection::default(),
            httpd: HttpdSection::default(),
        }
    }

    #[tokio::test]
    async fn test_complete_init_registers_and_drops_marker() {
        let dir = TempDir::new().unwrap();
        let config = config_in(&dir);
        let paths = config.pathnames();
        std::fs::write(&paths.init, "").unwrap();

        let monitor = FakeMonitor::default();
        monitor.push_assignment(7, 0, NodeState::Single);

        complete_init(&config, &monitor).await.unwrap();

        assert!(!paths.init.exists());
        let state = StateStore::new(&paths.state).read().unwrap();
        assert_eq!(state.current_node_id, 7);
        assert_eq!(state.assigned_role, NodeState::Single);
        assert_eq!(state.current_role, NodeState::Init);
        assert_eq!(monitor.calls(), vec!["register default node-a"]);
    }

    #[tokio::test]
    async fn test_complete_init_keeps_marker_on_monitor_failure() {
        let dir = TempDir::new().unwrap();
        let config = config_in(&dir);
        let paths = config.pathnames();
        std::fs::write(&paths.init, "").unwrap();

        let monitor = FakeMonitor::default();
        // The fallback answer is "unreachable".

        assert!(complete_init(&config, &monitor).await.is_err());
        assert!(paths.init.exists());
    }
}
