//! Deterministic in-process agent
//!
//! Simulates the replication state of a set of nodes so reparent flows can
//! be driven without a database. Masters advance their position on
//! [`FakeNodeAgent::write`]; replicas with replication running catch up to
//! their source whenever state is observed, after an optional per-node lag
//! measured in observations.
//!
//! Faults are injected per tablet, either for every call or for a single
//! method: unreachable, hang (never answers, so the caller's timeout fires),
//! a remote error, or a one-shot [`Gate`] that parks the call until released.

use crate::client::{AgentError, AgentMethod, AgentResult, NodeAgentClient, TabletStatus};
use async_trait::async_trait;
use parking_lot::Mutex;
use shardctl_core::{ReplicationPosition, Tablet, TabletAlias};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::debug;

const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Injected behavior for a call
#[derive(Debug, Clone)]
pub enum Fault {
    Unreachable,
    Hang,
    Error(String),
}

/// Parks a call until the test releases it
pub struct Gate {
    arrived: Semaphore,
    release: Semaphore,
}

impl Gate {
    fn new() -> Self {
        Self {
            arrived: Semaphore::new(0),
            release: Semaphore::new(0),
        }
    }

    /// Wait until a call is parked at this gate
    pub async fn arrived(&self) {
        if let Ok(permit) = self.arrived.acquire().await {
            permit.forget();
        }
    }

    /// Let the parked call continue
    pub fn release(&self) {
        self.release.add_permits(1);
    }

    async fn pass(&self) {
        self.arrived.add_permits(1);
        if let Ok(permit) = self.release.acquire().await {
            permit.forget();
        }
    }
}

#[derive(Debug, Clone)]
struct FakeNode {
    addr: String,
    is_master: bool,
    read_only: bool,
    position: ReplicationPosition,
    source: Option<String>,
    replicating: bool,
    lag: u32,
    lag_remaining: u32,
    scrapped: bool,
    /// Powered off: unreachable and serves no replication stream
    down: bool,
}

#[derive(Default)]
struct FakeState {
    nodes: HashMap<TabletAlias, FakeNode>,
    faults: HashMap<(TabletAlias, Option<AgentMethod>), Fault>,
    gates: HashMap<(TabletAlias, AgentMethod), Arc<Gate>>,
    calls: Vec<(TabletAlias, AgentMethod)>,
}

impl FakeState {
    fn node(&mut self, alias: &TabletAlias) -> AgentResult<&mut FakeNode> {
        self.nodes
            .get_mut(alias)
            .ok_or_else(|| AgentError::Unreachable(format!("no agent running for {alias}")))
    }

    /// Let running replicas catch up to their source
    fn sync(&mut self) {
        let positions = self.positions_by_addr();
        let mut held = HashSet::new();
        for (alias, node) in self.nodes.iter_mut() {
            if node.lag_remaining > 0 && !node.down && node.replicating && node.behind(&positions) {
                node.lag_remaining -= 1;
                held.insert(alias.clone());
            }
        }

        // chains settle within one pass per hop
        for _ in 0..self.nodes.len() {
            let positions = self.positions_by_addr();
            let mut changed = false;
            for (alias, node) in self.nodes.iter_mut() {
                if node.down || !node.replicating || held.contains(alias) || !node.behind(&positions) {
                    continue;
                }
                if let Some(target) = node.source.as_ref().and_then(|s| positions.get(s)) {
                    node.position = *target;
                    node.lag_remaining = node.lag;
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }
    }

    fn positions_by_addr(&self) -> HashMap<String, ReplicationPosition> {
        self.nodes
            .values()
            .filter(|node| !node.down)
            .map(|node| (node.addr.clone(), node.position))
            .collect()
    }
}

impl FakeNode {
    fn behind(&self, positions: &HashMap<String, ReplicationPosition>) -> bool {
        self.source
            .as_ref()
            .and_then(|s| positions.get(s))
            .is_some_and(|target| self.position < *target)
    }
}

/// Simulated node agents for a whole cluster
#[derive(Default)]
pub struct FakeNodeAgent {
    state: Mutex<FakeState>,
}

impl FakeNodeAgent {
    pub fn new() -> Self {
        Self::default()
    }

    fn db_addr(tablet: &Tablet) -> String {
        tablet
            .mysql_addr()
            .unwrap_or_else(|| format!("{}:{}", tablet.hostname, tablet.alias.uid))
    }

    /// Register a writable master at `position`
    pub fn add_master(&self, tablet: &Tablet, position: ReplicationPosition) {
        self.state.lock().nodes.insert(
            tablet.alias.clone(),
            FakeNode {
                addr: Self::db_addr(tablet),
                is_master: true,
                read_only: false,
                position,
                source: None,
                replicating: false,
                lag: 0,
                lag_remaining: 0,
                scrapped: false,
                down: false,
            },
        );
    }

    /// Register a replica replicating from `master`, caught up to it
    pub fn add_replica(&self, tablet: &Tablet, master: &Tablet) {
        let mut state = self.state.lock();
        let source = Self::db_addr(master);
        let position = state
            .nodes
            .get(&master.alias)
            .map(|node| node.position)
            .unwrap_or_default();
        state.nodes.insert(
            tablet.alias.clone(),
            FakeNode {
                addr: Self::db_addr(tablet),
                is_master: false,
                read_only: true,
                position,
                source: Some(source),
                replicating: true,
                lag: 0,
                lag_remaining: 0,
                scrapped: false,
                down: false,
            },
        );
    }

    /// Apply a write of `bytes` on a master and return its new position
    pub fn write(&self, alias: &TabletAlias, bytes: u64) -> AgentResult<ReplicationPosition> {
        let mut state = self.state.lock();
        let node = state.node(alias)?;
        if !node.is_master || node.read_only {
            return Err(AgentError::Remote(format!("{alias} is read-only")));
        }
        node.position.offset += bytes;
        Ok(node.position)
    }

    /// Current position without triggering catch-up
    pub fn position(&self, alias: &TabletAlias) -> Option<ReplicationPosition> {
        self.state.lock().nodes.get(alias).map(|node| node.position)
    }

    pub fn set_position(&self, alias: &TabletAlias, position: ReplicationPosition) {
        if let Some(node) = self.state.lock().nodes.get_mut(alias) {
            node.position = position;
        }
    }

    /// Observations a replica sits out before catching up
    pub fn set_lag(&self, alias: &TabletAlias, observations: u32) {
        if let Some(node) = self.state.lock().nodes.get_mut(alias) {
            node.lag = observations;
            node.lag_remaining = observations;
        }
    }

    /// Whether the node currently accepts writes
    pub fn is_writable(&self, alias: &TabletAlias) -> bool {
        self.state
            .lock()
            .nodes
            .get(alias)
            .is_some_and(|node| node.is_master && !node.read_only)
    }

    /// Database address a node replicates from
    pub fn source_of(&self, alias: &TabletAlias) -> Option<String> {
        self.state
            .lock()
            .nodes
            .get(alias)
            .and_then(|node| node.source.clone())
    }

    pub fn is_scrapped(&self, alias: &TabletAlias) -> bool {
        self.state
            .lock()
            .nodes
            .get(alias)
            .is_some_and(|node| node.scrapped)
    }

    /// Take the node down: every call fails as unreachable and replicas
    /// of it stop receiving changes
    pub fn power_off(&self, alias: &TabletAlias) {
        let mut state = self.state.lock();
        if let Some(node) = state.nodes.get_mut(alias) {
            node.down = true;
        }
        state
            .faults
            .insert((alias.clone(), None), Fault::Unreachable);
    }

    /// Bring the node back and remove every fault on it
    pub fn power_on(&self, alias: &TabletAlias) {
        let mut state = self.state.lock();
        if let Some(node) = state.nodes.get_mut(alias) {
            node.down = false;
        }
        state.faults.retain(|(a, _), _| a != alias);
    }

    /// Inject a fault for one method, or all methods with `None`
    pub fn inject(&self, alias: &TabletAlias, method: Option<AgentMethod>, fault: Fault) {
        self.state
            .lock()
            .faults
            .insert((alias.clone(), method), fault);
    }

    /// Park the next `method` call on `alias` until the gate is released
    pub fn gate(&self, alias: &TabletAlias, method: AgentMethod) -> Arc<Gate> {
        let gate = Arc::new(Gate::new());
        self.state
            .lock()
            .gates
            .insert((alias.clone(), method), gate.clone());
        gate
    }

    /// Methods called on `alias`, in order
    pub fn calls(&self, alias: &TabletAlias) -> Vec<AgentMethod> {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|(a, _)| a == alias)
            .map(|(_, method)| *method)
            .collect()
    }

    /// Record the call and apply any injected fault or gate
    async fn enter(&self, tablet: &Tablet, method: AgentMethod) -> AgentResult<()> {
        let (fault, gate) = {
            let mut state = self.state.lock();
            state.calls.push((tablet.alias.clone(), method));
            let fault = state
                .faults
                .get(&(tablet.alias.clone(), Some(method)))
                .or_else(|| state.faults.get(&(tablet.alias.clone(), None)))
                .cloned();
            let gate = state.gates.remove(&(tablet.alias.clone(), method));
            (fault, gate)
        };

        if let Some(gate) = gate {
            debug!(tablet = %tablet.alias, %method, "Call parked at gate");
            gate.pass().await;
        }

        match fault {
            None => Ok(()),
            Some(Fault::Unreachable) => Err(AgentError::Unreachable("connection refused".into())),
            Some(Fault::Error(message)) => Err(AgentError::Remote(message)),
            Some(Fault::Hang) => {
                std::future::pending::<()>().await;
                Ok(())
            }
        }
    }

    fn with_node<T>(
        &self,
        alias: &TabletAlias,
        f: impl FnOnce(&mut FakeNode) -> AgentResult<T>,
    ) -> AgentResult<T> {
        let mut state = self.state.lock();
        state.sync();
        f(state.node(alias)?)
    }
}

#[async_trait]
impl NodeAgentClient for FakeNodeAgent {
    async fn get_replication_position(&self, tablet: &Tablet) -> AgentResult<ReplicationPosition> {
        self.enter(tablet, AgentMethod::GetReplicationPosition).await?;
        self.with_node(&tablet.alias, |node| Ok(node.position))
    }

    async fn demote_master(
        &self,
        tablet: &Tablet,
        timeout: Duration,
    ) -> AgentResult<ReplicationPosition> {
        tokio::time::timeout(timeout, self.enter(tablet, AgentMethod::DemoteMaster))
            .await
            .map_err(|_| AgentError::Timeout(timeout))??;
        self.with_node(&tablet.alias, |node| {
            if !node.is_master {
                return Err(AgentError::Remote("not a master".into()));
            }
            node.is_master = false;
            node.read_only = true;
            Ok(node.position)
        })
    }

    async fn promote_slave(&self, tablet: &Tablet) -> AgentResult<ReplicationPosition> {
        self.enter(tablet, AgentMethod::PromoteSlave).await?;
        self.with_node(&tablet.alias, |node| {
            node.replicating = false;
            node.source = None;
            node.is_master = true;
            node.read_only = false;
            Ok(node.position)
        })
    }

    async fn set_master(
        &self,
        tablet: &Tablet,
        master_addr: &str,
        _position: ReplicationPosition,
        start_replication: bool,
    ) -> AgentResult<()> {
        self.enter(tablet, AgentMethod::SetMaster).await?;
        self.with_node(&tablet.alias, |node| {
            node.is_master = false;
            node.read_only = true;
            node.source = Some(master_addr.to_string());
            node.replicating = start_replication;
            node.lag_remaining = node.lag;
            Ok(())
        })
    }

    async fn get_status(&self, tablet: &Tablet) -> AgentResult<TabletStatus> {
        self.enter(tablet, AgentMethod::GetStatus).await?;
        self.with_node(&tablet.alias, |node| {
            Ok(TabletStatus {
                is_master: node.is_master,
                read_only: node.read_only,
                replication_source: node.source.clone(),
                replication_running: node.replicating,
                position: node.position,
            })
        })
    }

    async fn tablet_externally_reparented(&self, tablet: &Tablet) -> AgentResult<()> {
        self.enter(tablet, AgentMethod::TabletExternallyReparented)
            .await?;
        self.with_node(&tablet.alias, |node| {
            if node.is_master {
                Ok(())
            } else {
                Err(AgentError::Remote("not a master".into()))
            }
        })
    }

    async fn wait_for_position(
        &self,
        tablet: &Tablet,
        position: ReplicationPosition,
        timeout: Duration,
    ) -> AgentResult<ReplicationPosition> {
        let wait = async {
            self.enter(tablet, AgentMethod::WaitForPosition).await?;
            loop {
                let current = self.with_node(&tablet.alias, |node| Ok(node.position))?;
                if current >= position {
                    return Ok::<_, AgentError>(current);
                }
                tokio::time::sleep(WAIT_POLL_INTERVAL).await;
            }
        };
        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| AgentError::Timeout(timeout))?
    }

    async fn start_replication(&self, tablet: &Tablet) -> AgentResult<()> {
        self.enter(tablet, AgentMethod::StartReplication).await?;
        self.with_node(&tablet.alias, |node| {
            if node.source.is_none() {
                return Err(AgentError::Remote("no replication source configured".into()));
            }
            node.replicating = true;
            Ok(())
        })
    }

    async fn stop_replication(&self, tablet: &Tablet) -> AgentResult<()> {
        self.enter(tablet, AgentMethod::StopReplication).await?;
        self.with_node(&tablet.alias, |node| {
            node.replicating = false;
            Ok(())
        })
    }

    async fn scrap(&self, tablet: &Tablet) -> AgentResult<()> {
        self.enter(tablet, AgentMethod::Scrap).await?;
        self.with_node(&tablet.alias, |node| {
            node.scrapped = true;
            node.replicating = false;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tablet(uid: u32) -> Tablet {
        Tablet::new(TabletAlias::new("test_nj", uid), "localhost").with_port("mysql", 3000 + uid as u16)
    }

    #[tokio::test]
    async fn test_replica_catches_up_when_observed() {
        let agent = FakeNodeAgent::new();
        let (m, r) = (tablet(1), tablet(2));
        agent.add_master(&m, ReplicationPosition::new(1, 0));
        agent.add_replica(&r, &m);
        let pos = agent.write(&m.alias, 100).unwrap();
        assert_eq!(agent.position(&r.alias).unwrap().offset, 0);
        assert_eq!(agent.get_replication_position(&r).await.unwrap(), pos);
    }

    #[tokio::test]
    async fn test_lagging_replica_needs_several_observations() {
        let agent = FakeNodeAgent::new();
        let (m, r) = (tablet(1), tablet(2));
        agent.add_master(&m, ReplicationPosition::new(1, 0));
        agent.add_replica(&r, &m);
        agent.set_lag(&r.alias, 2);
        let pos = agent.write(&m.alias, 10).unwrap();
        assert!(agent.get_replication_position(&r).await.unwrap() < pos);
        assert!(agent.get_replication_position(&r).await.unwrap() < pos);
        assert_eq!(agent.get_replication_position(&r).await.unwrap(), pos);
    }

    #[tokio::test]
    async fn test_demote_makes_master_read_only() {
        let agent = FakeNodeAgent::new();
        let m = tablet(1);
        agent.add_master(&m, ReplicationPosition::new(1, 0));
        agent.demote_master(&m, Duration::from_secs(1)).await.unwrap();
        assert!(!agent.is_writable(&m.alias));
        assert!(agent.write(&m.alias, 1).is_err());
    }

    #[tokio::test]
    async fn test_hang_times_out_demote() {
        let agent = FakeNodeAgent::new();
        let m = tablet(1);
        agent.add_master(&m, ReplicationPosition::new(1, 0));
        agent.inject(&m.alias, Some(AgentMethod::DemoteMaster), Fault::Hang);
        let err = agent
            .demote_master(&m, Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Timeout(_)));
        assert!(agent.is_writable(&m.alias));
    }

    #[tokio::test]
    async fn test_power_off_and_on() {
        let agent = FakeNodeAgent::new();
        let m = tablet(1);
        agent.add_master(&m, ReplicationPosition::new(1, 0));
        agent.power_off(&m.alias);
        assert!(matches!(
            agent.get_status(&m).await,
            Err(AgentError::Unreachable(_))
        ));
        agent.power_on(&m.alias);
        assert!(agent.get_status(&m).await.unwrap().is_master);
        assert_eq!(
            agent.calls(&m.alias),
            vec![AgentMethod::GetStatus, AgentMethod::GetStatus]
        );
    }

    #[tokio::test]
    async fn test_gate_parks_call() {
        let agent = Arc::new(FakeNodeAgent::new());
        let m = tablet(1);
        agent.add_master(&m, ReplicationPosition::new(1, 0));
        let gate = agent.gate(&m.alias, AgentMethod::GetStatus);

        let task = {
            let agent = agent.clone();
            let m = m.clone();
            tokio::spawn(async move { agent.get_status(&m).await })
        };
        gate.arrived().await;
        assert!(!task.is_finished());
        gate.release();
        assert!(task.await.unwrap().unwrap().is_master);
    }

    #[tokio::test]
    async fn test_wait_for_position_times_out_without_replication() {
        let agent = FakeNodeAgent::new();
        let (m, r) = (tablet(1), tablet(2));
        agent.add_master(&m, ReplicationPosition::new(1, 0));
        agent.add_replica(&r, &m);
        agent.stop_replication(&r).await.unwrap();
        let target = agent.write(&m.alias, 5).unwrap();
        let err = agent
            .wait_for_position(&r, target, Duration::from_millis(30))
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Timeout(_)));

        agent.start_replication(&r).await.unwrap();
        assert_eq!(
            agent
                .wait_for_position(&r, target, Duration::from_secs(1))
                .await
                .unwrap(),
            target
        );
    }
}
