//! End-to-end keeper scenarios, driven tick by tick against in-memory
//! adapters: cold boot, standby join, failover, partition demotion, reload,
//! and a stolen PID file.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use pgautoctl_core::config::{
    ControlSection, FileRole, HttpdSection, KeeperConfig, PostgresSection,
    ReplicationSection, TimeoutSection,
};
use pgautoctl_core::error::{ExitCode, KeeperError};
use pgautoctl_core::fakes::{FakeMonitor, FakePg, ScriptedAnswer};
use pgautoctl_core::node_state::NodeState;
use pgautoctl_core::pidfile::PidGuard;
use pgautoctl_core::state::{KeeperState, StateStore};
use pgautoctl_daemon::reconcile::{ReconcileLoop, TickOutcome};
use pgautoctl_daemon::signals::SignalFlags;
use tempfile::TempDir;

struct Harness {
    _dir: TempDir,
    config: KeeperConfig,
    store: StateStore,
    pg: Arc<FakePg>,
    monitor: Arc<FakeMonitor>,
    flags: Arc<SignalFlags>,
    keeper: ReconcileLoop,
}

fn make_config(pgdata: &Path) -> KeeperConfig {
    KeeperConfig {
        pg_autoctl: ControlSection {
            role: FileRole::Keeper,
            formation: "default".into(),
            nodename: "node-a".into(),
            monitor: "postgres://autoctl_node@monitor:5432/pg_auto_failover".into(),
        },
        postgresql: PostgresSection {
            pgdata: pgdata.to_path_buf(),
            pgport: 5432,
            auth_method: "trust".into(),
        },
        replication: ReplicationSection::default(),
        timeout: TimeoutSection {
            network_partition_timeout: 10,
            ..TimeoutSection::default()
        },
        httpd: HttpdSection::default(),
    }
}

fn harness(initial: KeeperState) -> Harness {
    let dir = TempDir::new().unwrap();
    let config = make_config(dir.path());
    let paths = config.pathnames();

    config.save(&paths.config).unwrap();

    let store = StateStore::new(&paths.state);
    store.write(&initial).unwrap();

    let pid_guard = Arc::new(PidGuard::create(&paths.pid).unwrap());
    let pg = Arc::new(FakePg::default());
    let monitor = Arc::new(FakeMonitor::default());
    let flags = SignalFlags::new();

    let pg_adapter: Arc<dyn pgautoctl_core::pg::PgController> = Arc::clone(&pg) as _;
    let monitor_adapter: Arc<dyn pgautoctl_core::monitor::MonitorClient> =
        Arc::clone(&monitor) as _;

    let keeper = ReconcileLoop::new(
        config.clone(),
        store.clone(),
        pid_guard,
        pg_adapter,
        monitor_adapter,
        Arc::clone(&flags),
        Duration::from_secs(5),
    );

    Harness {
        _dir: dir,
        config,
        store,
        pg,
        monitor,
        flags,
        keeper,
    }
}

fn registered_state(role: NodeState) -> KeeperState {
    let mut state = KeeperState::new();
    state.current_node_id = 1;
    state.current_group = 0;
    state.current_role = role;
    state.assigned_role = role;
    state
}

/// S1: cold boot as the only node of the formation.
#[tokio::test]
async fn test_cold_boot_as_single() {
    let mut h = harness(registered_state(NodeState::Init));
    h.monitor.push_assignment(1, 0, NodeState::Single);

    let outcome = h.keeper.tick(1_000).await;
    assert!(matches!(outcome, TickOutcome::Progressed));

    let state = h.store.read().unwrap();
    assert_eq!(state.current_role, NodeState::Single);
    assert_eq!(state.last_monitor_contact, 1_000);
    assert!(h.pg.is_running());
    assert!(h.pg.calls().iter().any(|c| c == "add_default_settings"));
}

/// S2: a standby registers; the monitor walks us PRIMARY ->
/// WAIT_PRIMARY -> PRIMARY (through the single/wait_primary join dance).
#[tokio::test]
async fn test_standby_join_prepares_replication() {
    let mut h = harness(registered_state(NodeState::Single));
    h.pg.set_running(true);
    h.monitor.set_other_node("standby-host", 5432);
    h.monitor.push_assignment(1, 0, NodeState::WaitPrimary);
    h.monitor.push_assignment(1, 0, NodeState::Primary);

    assert!(matches!(h.keeper.tick(1_000).await, TickOutcome::Progressed));
    assert_eq!(h.store.read().unwrap().current_role, NodeState::WaitPrimary);

    assert!(matches!(h.keeper.tick(1_005).await, TickOutcome::Progressed));

    let state = h.store.read().unwrap();
    assert_eq!(state.current_role, NodeState::Primary);

    let calls = h.pg.calls();
    assert!(calls.contains(&"create_replication_slot pgautofailover_standby".to_string()));
    assert!(calls.contains(&"add_standby_to_hba standby-host".to_string()));
    assert!(calls.contains(&"enable_sync_rep".to_string()));
}

/// S3: failover; a caught-up secondary is walked to primary.
#[tokio::test]
async fn test_failover_promotes_secondary() {
    let mut h = harness(registered_state(NodeState::Secondary));
    h.pg.set_running(true);
    h.pg.set_wal_lag(0);
    h.monitor.set_other_node("old-primary", 5432);
    h.monitor.push_assignment(1, 0, NodeState::PrepPromotion);
    h.monitor.push_assignment(1, 0, NodeState::StandbyPromoted);
    h.monitor.push_assignment(1, 0, NodeState::Primary);

    for now in [1_000, 1_005, 1_010] {
        let outcome = h.keeper.tick(now).await;
        assert!(matches!(outcome, TickOutcome::Progressed));
    }

    let state = h.store.read().unwrap();
    assert_eq!(state.current_role, NodeState::Primary);

    let calls = h.pg.calls();
    assert!(calls.contains(&"stop_replication".to_string()));
    assert!(calls.contains(&"promote".to_string()));
    assert!(calls.contains(&"enable_sync_rep".to_string()));
    assert!(h.pg.is_running());
}

/// S4: a primary in a true partition demotes itself after tau seconds.
#[tokio::test]
async fn test_partition_demotes_primary() {
    let mut initial = registered_state(NodeState::Primary);
    initial.last_monitor_contact = 1_000;
    initial.last_secondary_contact = 1_000;
    initial.pg_is_running = true;

    let mut h = harness(initial);
    h.pg.set_running(true);
    h.pg.set_has_replica(false);
    h.monitor.set_fallback(ScriptedAnswer::Unreachable);

    // Within the grace window nothing happens.
    assert!(matches!(h.keeper.tick(1_005).await, TickOutcome::Idle));
    assert_eq!(h.store.read().unwrap().current_role, NodeState::Primary);

    // tau = 10s: past it, the keeper stops PostgreSQL on its own.
    assert!(matches!(h.keeper.tick(1_011).await, TickOutcome::Progressed));

    let state = h.store.read().unwrap();
    assert_eq!(state.current_role, NodeState::DemoteTimeout);
    assert!(!state.pg_is_running);
    assert!(!h.pg.is_running());
    assert!(h.pg.calls().contains(&"stop".to_string()));
}

/// A connected standby vetoes the partition demotion.
#[tokio::test]
async fn test_connected_standby_prevents_demotion() {
    let mut initial = registered_state(NodeState::Primary);
    initial.last_monitor_contact = 1_000;
    initial.last_secondary_contact = 1_000;
    initial.pg_is_running = true;

    let mut h = harness(initial);
    h.pg.set_running(true);
    h.pg.set_has_replica(true);
    h.monitor.set_fallback(ScriptedAnswer::Unreachable);

    assert!(matches!(h.keeper.tick(2_000).await, TickOutcome::Idle));

    let state = h.store.read().unwrap();
    assert_eq!(state.current_role, NodeState::Primary);
    // The standby contact was refreshed, so the timers restarted.
    assert_eq!(state.last_secondary_contact, 2_000);
}

/// S5: SIGHUP picks up reloadable fields and ignores the rest.
#[tokio::test]
async fn test_reload_accepts_timeouts_not_formation() {
    let mut h = harness(registered_state(NodeState::Single));
    h.pg.set_running(true);

    let mut edited = h.config.clone();
    edited.timeout.network_partition_timeout = 30;
    edited.pg_autoctl.formation = "hijacked".into();
    edited.save(&h.config.pathnames().config).unwrap();

    h.flags.request_reload();
    assert!(h.flags.reload_requested());
    h.keeper.reload_configuration();

    assert!(!h.flags.reload_requested());
    assert_eq!(h.keeper.config().timeout.network_partition_timeout, 30);
    assert_eq!(h.keeper.config().pg_autoctl.formation, "default");
}

/// An unparsable new file keeps the configuration as-is.
#[tokio::test]
async fn test_reload_survives_broken_config_file() {
    let mut h = harness(registered_state(NodeState::Single));

    std::fs::write(&h.config.pathnames().config, "[[[ nope").unwrap();

    h.flags.request_reload();
    h.keeper.reload_configuration();

    assert!(!h.flags.reload_requested());
    assert_eq!(h.keeper.config().timeout.network_partition_timeout, 10);
}

/// S6: a stolen PID file is fatal before any state is touched.
#[tokio::test]
async fn test_stolen_pid_file_quits() {
    let mut h = harness(registered_state(NodeState::Single));
    let before = h.store.read().unwrap();

    std::fs::write(h.config.pathnames().pid, "1\n").unwrap();
    h.monitor.push_assignment(1, 0, NodeState::Single);

    match h.keeper.tick(1_000).await {
        TickOutcome::Fatal(e) => {
            assert!(matches!(e, KeeperError::PidConflict(_)));
            assert_eq!(e.exit_code(), ExitCode::Quit);
        }
        other => panic!("expected a fatal pid conflict, got {other:?}"),
    }

    // No state write happened.
    assert_eq!(h.store.read().unwrap(), before);
    assert!(h.monitor.reports().is_empty());
}

/// The state file is written even when the monitor is unreachable, so the
/// partition timers advance across ticks.
#[tokio::test]
async fn test_state_written_every_tick() {
    let mut initial = registered_state(NodeState::Secondary);
    initial.last_monitor_contact = 500;

    let mut h = harness(initial);
    h.pg.set_running(true);
    h.pg.set_wal_lag(128);
    h.monitor.set_fallback(ScriptedAnswer::Unreachable);

    assert!(matches!(h.keeper.tick(1_000).await, TickOutcome::Idle));

    let state = h.store.read().unwrap();
    assert_eq!(state.xlog_lag_bytes, 128);
    // No contact: the timestamp must not move.
    assert_eq!(state.last_monitor_contact, 500);
}

/// A failed transition leaves the role unchanged and retries next tick.
#[tokio::test]
async fn test_failed_transition_retries() {
    let mut h = harness(registered_state(NodeState::Single));
    h.pg.set_running(true);
    h.pg.fail_on("create_replication_slot");
    h.monitor.set_other_node("standby-host", 5432);
    h.monitor.push_assignment(1, 0, NodeState::WaitPrimary);
    h.monitor.push_assignment(1, 0, NodeState::WaitPrimary);

    assert!(matches!(h.keeper.tick(1_000).await, TickOutcome::Idle));
    assert_eq!(h.store.read().unwrap().current_role, NodeState::Single);

    h.pg.heal();
    assert!(matches!(h.keeper.tick(1_005).await, TickOutcome::Progressed));
    assert_eq!(h.store.read().unwrap().current_role, NodeState::WaitPrimary);
}

/// A fast stop between barriers exits without writing state.
#[tokio::test]
async fn test_fast_stop_skips_state_write() {
    let mut initial = registered_state(NodeState::Single);
    initial.xlog_lag_bytes = -1;

    let mut h = harness(initial.clone());
    h.pg.set_running(true);
    h.pg.set_wal_lag(42);
    h.monitor.push_assignment(1, 0, NodeState::Single);

    h.flags.request_fast_stop();

    assert!(matches!(h.keeper.tick(1_000).await, TickOutcome::FastStop));
    assert_eq!(h.store.read().unwrap(), initial);
}

/// Monotonic contact timestamps survive an entire monitor flap sequence.
#[tokio::test]
async fn test_monitor_contact_is_monotonic() {
    let mut h = harness(registered_state(NodeState::Single));
    h.pg.set_running(true);

    h.monitor.push_assignment(1, 0, NodeState::Single);
    h.monitor.push_answer(ScriptedAnswer::Unreachable);
    h.monitor.push_assignment(1, 0, NodeState::Single);

    h.keeper.tick(1_000).await;
    let first = h.store.read().unwrap().last_monitor_contact;

    h.keeper.tick(1_010).await;
    let second = h.store.read().unwrap().last_monitor_contact;

    h.keeper.tick(1_020).await;
    let third = h.store.read().unwrap().last_monitor_contact;

    assert_eq!(first, 1_000);
    assert_eq!(second, 1_000);
    assert_eq!(third, 1_020);
    assert!(first <= second && second <= third);
}
