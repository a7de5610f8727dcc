//! Recording test doubles for the adapter contracts.
//!
//! Used by this crate's FSM tests and by the daemon's scenario tests. The
//! fakes record every call in order, can be told to fail a single method,
//! and play back scripted monitor answers.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

use async_trait::async_trait;

use crate::error::{KeeperError, Result};
use crate::monitor::{
    MonitorAssignment, MonitorClient, MonitorEvent, NodeActiveReport, NodeAddress,
};
use crate::pg::{PgController, ReplicationSource};
use crate::state::PgProbe;

/// In-memory PostgreSQL controller.
#[derive(Debug)]
pub struct FakePg {
    calls: Mutex<Vec<String>>,
    running: AtomicBool,
    has_replica: AtomicBool,
    wal_lag_bytes: AtomicI64,
    identity: Mutex<PgProbe>,
    fail_on: Mutex<Option<String>>,
}

impl Default for FakePg {
    fn default() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            running: AtomicBool::new(false),
            has_replica: AtomicBool::new(false),
            wal_lag_bytes: AtomicI64::new(0),
            identity: Mutex::new(PgProbe {
                pg_version: 160_004,
                pg_control_version: 1300,
                system_identifier: 7_000_000_000_000_000_001,
                is_running: false,
                wal_lag_bytes: 0,
                sync_state: String::new(),
            }),
            fail_on: Mutex::new(None),
        }
    }
}

impl FakePg {
    /// Every call so far, in order.
    #[must_use]
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    /// Make the named method fail with a controller error.
    pub fn fail_on(&self, method: &str) {
        *self.fail_on.lock().unwrap() = Some(method.to_string());
    }

    /// Stop injecting failures.
    pub fn heal(&self) {
        *self.fail_on.lock().unwrap() = None;
    }

    /// Force the running flag, as if the postmaster were (not) up.
    pub fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::SeqCst);
    }

    /// Whether the fake currently reports a running postmaster.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Pretend a standby is (or is not) streaming from us.
    pub fn set_has_replica(&self, connected: bool) {
        self.has_replica.store(connected, Ordering::SeqCst);
    }

    /// Set the reported replication lag.
    pub fn set_wal_lag(&self, bytes: i64) {
        self.wal_lag_bytes.store(bytes, Ordering::SeqCst);
    }

    fn record(&self, call: impl Into<String>) -> Result<()> {
        let call = call.into();
        let method = call.split(' ').next().unwrap_or(&call).to_string();
        self.calls.lock().unwrap().push(call);

        if self.fail_on.lock().unwrap().as_deref() == Some(method.as_str()) {
            return Err(KeeperError::PgControllerFailure(format!(
                "injected failure in {method}"
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl PgController for FakePg {
    async fn probe(&self) -> Result<PgProbe> {
        self.record("probe")?;
        let mut probe = self.identity.lock().unwrap().clone();
        probe.is_running = self.running.load(Ordering::SeqCst);
        probe.wal_lag_bytes = self.wal_lag_bytes.load(Ordering::SeqCst);
        if !probe.is_running {
            probe.pg_version = 0;
            probe.pg_control_version = 0;
            probe.system_identifier = 0;
        }
        Ok(probe)
    }

    async fn has_replica(&self, username: &str) -> Result<bool> {
        self.record(format!("has_replica {username}"))?;
        Ok(self.has_replica.load(Ordering::SeqCst))
    }

    async fn init_db(&self) -> Result<()> {
        self.record("init_db")
    }

    async fn start(&self) -> Result<()> {
        self.record("start")?;
        self.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.record("stop")?;
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn restart(&self) -> Result<()> {
        self.record("restart")?;
        self.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn reload_conf(&self) -> Result<()> {
        self.record("reload_conf")
    }

    async fn promote(&self) -> Result<()> {
        self.record("promote")
    }

    async fn rewind_to(&self, source: &ReplicationSource) -> Result<()> {
        self.record(format!("rewind_to {}:{}", source.host, source.port))
    }

    async fn init_standby(&self, source: &ReplicationSource) -> Result<()> {
        self.record(format!("init_standby {}:{}", source.host, source.port))
    }

    async fn stop_replication(&self) -> Result<()> {
        self.record("stop_replication")
    }

    async fn add_default_settings(&self) -> Result<()> {
        self.record("add_default_settings")
    }

    async fn create_replication_slot(&self, name: &str) -> Result<()> {
        self.record(format!("create_replication_slot {name}"))
    }

    async fn drop_replication_slot(&self, name: &str) -> Result<()> {
        self.record(format!("drop_replication_slot {name}"))
    }

    async fn enable_sync_rep(&self) -> Result<()> {
        self.record("enable_sync_rep")
    }

    async fn disable_sync_rep(&self) -> Result<()> {
        self.record("disable_sync_rep")
    }

    async fn create_monitor_user(&self, host: &str, auth_method: &str) -> Result<()> {
        self.record(format!("create_monitor_user {host} {auth_method}"))
    }

    async fn create_replication_user(
        &self,
        name: &str,
        _password: Option<&str>,
    ) -> Result<()> {
        self.record(format!("create_replication_user {name}"))
    }

    async fn add_standby_to_hba(&self, host: &str) -> Result<()> {
        self.record(format!("add_standby_to_hba {host}"))
    }
}

/// A scripted `node_active` answer.
#[derive(Debug, Clone)]
pub enum ScriptedAnswer {
    /// The monitor assigns a state.
    Assign(MonitorAssignment),
    /// The monitor cannot be reached.
    Unreachable,
}

/// In-memory monitor.
#[derive(Debug)]
pub struct FakeMonitor {
    reports: Mutex<Vec<NodeActiveReport>>,
    script: Mutex<VecDeque<ScriptedAnswer>>,
    fallback: Mutex<ScriptedAnswer>,
    other_node: Mutex<NodeAddress>,
    primary: Mutex<NodeAddress>,
    calls: Mutex<Vec<String>>,
}

impl Default for FakeMonitor {
    fn default() -> Self {
        let localhost = NodeAddress {
            host: "primary-host".into(),
            port: 5432,
        };
        Self {
            reports: Mutex::new(Vec::new()),
            script: Mutex::new(VecDeque::new()),
            fallback: Mutex::new(ScriptedAnswer::Unreachable),
            other_node: Mutex::new(localhost.clone()),
            primary: Mutex::new(localhost),
            calls: Mutex::new(Vec::new()),
        }
    }
}

impl FakeMonitor {
    /// Queue the next `node_active` answer.
    pub fn push_answer(&self, answer: ScriptedAnswer) {
        self.script.lock().unwrap().push_back(answer);
    }

    /// Queue an assignment for the given node identity.
    pub fn push_assignment(&self, node_id: i32, group_id: i32, state: crate::NodeState) {
        self.push_answer(ScriptedAnswer::Assign(MonitorAssignment {
            node_id,
            group_id,
            assigned_state: state,
        }));
    }

    /// The answer used once the script runs dry.
    pub fn set_fallback(&self, answer: ScriptedAnswer) {
        *self.fallback.lock().unwrap() = answer;
    }

    /// Configure what `other_node` returns.
    pub fn set_other_node(&self, host: &str, port: u16) {
        *self.other_node.lock().unwrap() = NodeAddress {
            host: host.into(),
            port,
        };
    }

    /// Configure what `primary_node` returns.
    pub fn set_primary_node(&self, host: &str, port: u16) {
        *self.primary.lock().unwrap() = NodeAddress {
            host: host.into(),
            port,
        };
    }

    /// Every `node_active` report received, in order.
    #[must_use]
    pub fn reports(&self) -> Vec<NodeActiveReport> {
        self.reports.lock().unwrap().clone()
    }

    /// Every non-`node_active` call received, in order.
    #[must_use]
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn next_answer(&self) -> ScriptedAnswer {
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.fallback.lock().unwrap().clone())
    }

    fn unreachable() -> KeeperError {
        KeeperError::MonitorUnreachable("scripted: monitor is unreachable".into())
    }
}

#[async_trait]
impl MonitorClient for FakeMonitor {
    async fn node_active(&self, report: &NodeActiveReport) -> Result<MonitorAssignment> {
        self.reports.lock().unwrap().push(report.clone());
        match self.next_answer() {
            ScriptedAnswer::Assign(assignment) => Ok(assignment),
            ScriptedAnswer::Unreachable => Err(Self::unreachable()),
        }
    }

    async fn register(
        &self,
        formation: &str,
        nodename: &str,
        _pgport: u16,
        _initial_state: crate::NodeState,
    ) -> Result<MonitorAssignment> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("register {formation} {nodename}"));
        match self.next_answer() {
            ScriptedAnswer::Assign(assignment) => Ok(assignment),
            ScriptedAnswer::Unreachable => Err(Self::unreachable()),
        }
    }

    async fn remove(&self, node_id: i32, group_id: i32) -> Result<()> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("remove {node_id} {group_id}"));
        Ok(())
    }

    async fn extension_version(&self) -> Result<String> {
        self.calls.lock().unwrap().push("extension_version".into());
        Ok("1.0".to_string())
    }

    async fn create_formation(&self, formation: &str) -> Result<()> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("create_formation {formation}"));
        Ok(())
    }

    async fn drop_formation(&self, formation: &str) -> Result<()> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("drop_formation {formation}"));
        Ok(())
    }

    async fn formation_uri(&self, formation: &str) -> Result<String> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("formation_uri {formation}"));
        Ok(format!("postgres://{formation}.example.net:5432/app"))
    }

    async fn last_events(&self, formation: &str, count: usize) -> Result<Vec<MonitorEvent>> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("last_events {formation} {count}"));
        Ok(Vec::new())
    }

    async fn enable_secondary(&self, formation: &str) -> Result<()> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("enable_secondary {formation}"));
        Ok(())
    }

    async fn disable_secondary(&self, formation: &str) -> Result<()> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("disable_secondary {formation}"));
        Ok(())
    }

    async fn start_maintenance(&self, node_id: i32, group_id: i32) -> Result<()> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("start_maintenance {node_id} {group_id}"));
        Ok(())
    }

    async fn stop_maintenance(&self, node_id: i32, group_id: i32) -> Result<()> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("stop_maintenance {node_id} {group_id}"));
        Ok(())
    }

    async fn primary_node(&self, _formation: &str, _group_id: i32) -> Result<NodeAddress> {
        Ok(self.primary.lock().unwrap().clone())
    }

    async fn other_node(&self, _node_id: i32, _group_id: i32) -> Result<NodeAddress> {
        Ok(self.other_node.lock().unwrap().clone())
    }
}
