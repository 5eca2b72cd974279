//! Reparent coordinator
//!
//! Moves mastership of a shard between tablets. Every protocol has the same
//! shape: claim the shard lock, make the agent calls, then a single
//! compare-and-set of the shard record, then tablet roles, the replication
//! graph and the serving graph. Nothing is written to the topology before
//! the commit, and the lock is released on every exit path.

use crate::config::ReparentConfig;
use crate::fanout::{call, fan_out, FanoutResult, TabletFailure};
use crate::replication_graph::{rebuild_shard_replication, shard_tablets, GraphReport, LinkHint};
use crate::state::ShardState;
use shardctl_agent::{AgentError, AgentMethod, NodeAgentClient};
use shardctl_core::{
    ReplicationPosition, Result, Shard, ShardctlError, Tablet, TabletAlias, TabletRole, Version,
    Versioned,
};
use shardctl_topo::{update_tablet_fields, TopologyClient};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::time::timeout;
use tracing::{debug, info, instrument, warn};

/// Result of a mastership change that was committed
#[derive(Debug)]
pub struct ReparentOutcome {
    pub keyspace: String,
    pub shard: String,
    pub old_master: Option<TabletAlias>,
    pub new_master: TabletAlias,
    /// Position the new master was promoted at
    pub position: ReplicationPosition,
    /// Tablets now replicating from the new master
    pub rewired: Vec<TabletAlias>,
    /// Tablets that could not be rewired; repair with reparent-tablet
    pub failures: Vec<TabletFailure>,
    pub graph: GraphReport,
}

impl ReparentOutcome {
    /// Whether every replica follows the new master
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Coordinates reparent protocols against the topology and node agents
pub struct ReparentCoordinator {
    topo: Arc<dyn TopologyClient>,
    agent: Arc<dyn NodeAgentClient>,
    config: ReparentConfig,
}

impl ReparentCoordinator {
    pub fn new(
        topo: Arc<dyn TopologyClient>,
        agent: Arc<dyn NodeAgentClient>,
        config: ReparentConfig,
    ) -> Self {
        Self {
            topo,
            agent,
            config,
        }
    }

    pub fn topo(&self) -> &dyn TopologyClient {
        self.topo.as_ref()
    }

    pub fn agent(&self) -> &dyn NodeAgentClient {
        self.agent.as_ref()
    }

    pub fn config(&self) -> &ReparentConfig {
        &self.config
    }

    // ===== Protocols =====

    /// Cooperative reparent: demote the current master, let `new_master`
    /// catch up with it, promote, rewire the rest.
    #[instrument(skip_all, fields(keyspace = %keyspace, shard = %shard, new_master = %new_master))]
    pub async fn planned_reparent(
        &self,
        keyspace: &str,
        shard: &str,
        new_master: &TabletAlias,
    ) -> Result<ReparentOutcome> {
        let lock = self
            .lock(keyspace, shard, format!("planned reparent to {new_master}"))
            .await?;
        let result = self.run_planned(keyspace, shard, new_master).await;
        self.unlock(keyspace, shard, lock).await;
        result
    }

    async fn run_planned(
        &self,
        keyspace: &str,
        shard: &str,
        new_master: &TabletAlias,
    ) -> Result<ReparentOutcome> {
        let read = self.topo.get_shard(keyspace, shard).await?;
        let state = ShardState::of(&read.value).begin(new_master)?;
        let old_master = state.master().cloned().ok_or_else(|| {
            ShardctlError::InvalidArgument(format!(
                "shard {keyspace}/{shard} has no master to demote, use emergency reparent"
            ))
        })?;

        let new_tablet = self.candidate(keyspace, shard, new_master).await?;
        let new_addr = replication_addr(&new_tablet)?;
        let old_tablet = self.topo.get_tablet(&old_master).await?.into_inner();
        info!(%state, old_master = %old_master, "Starting planned reparent");

        let demoted = self.demote(&old_tablet).await?;
        info!(old_master = %old_master, position = %demoted, "Demoted master");

        self.catch_up(&new_tablet, demoted).await?;
        self.ensure_unchanged(keyspace, shard, &read).await?;
        let position = self.promote(&new_tablet).await?;

        let others = self
            .shard_members_except(keyspace, &read.value, &[&old_master, new_master])
            .await?;
        let rewire = self.rewire(others, &new_addr, position).await;

        let committed = self.commit(keyspace, read, new_master).await?;
        info!(state = %state.commit()?, "Committed new master");

        self.set_role(new_master, TabletRole::Master).await?;
        self.set_role(&old_master, TabletRole::Spare).await?;

        let mut hints = rewire_hints(new_master, &rewire);
        hints.insert(old_master.clone(), LinkHint::Detached);
        let graph = self.rebuild_graphs(keyspace, &committed, &hints).await?;

        Ok(outcome(keyspace, shard, Some(old_master), new_master, position, rewire, graph))
    }

    /// Reparent away from a master that is gone. The old master is never
    /// contacted; it is scrapped in the topology instead.
    #[instrument(skip_all, fields(keyspace = %keyspace, shard = %shard, new_master = %new_master))]
    pub async fn emergency_reparent(
        &self,
        keyspace: &str,
        shard: &str,
        new_master: &TabletAlias,
    ) -> Result<ReparentOutcome> {
        let lock = self
            .lock(keyspace, shard, format!("emergency reparent to {new_master}"))
            .await?;
        let result = self.run_emergency(keyspace, shard, new_master).await;
        self.unlock(keyspace, shard, lock).await;
        result
    }

    async fn run_emergency(
        &self,
        keyspace: &str,
        shard: &str,
        new_master: &TabletAlias,
    ) -> Result<ReparentOutcome> {
        let read = self.topo.get_shard(keyspace, shard).await?;
        let state = ShardState::of(&read.value).begin(new_master)?;
        let old_master = state.master().cloned();

        let new_tablet = self.candidate(keyspace, shard, new_master).await?;
        let new_addr = replication_addr(&new_tablet)?;
        warn!(%state, "Starting emergency reparent");

        let excluded: Vec<&TabletAlias> = old_master.iter().collect();
        let survivors = self
            .shard_members_except(keyspace, &read.value, &excluded)
            .await?;
        let agent = self.agent.as_ref();
        let gathered = fan_out(
            survivors.clone(),
            AgentMethod::GetReplicationPosition,
            self.config.rpc_timeout,
            |tablet| async move { agent.get_replication_position(&tablet).await },
        )
        .await;

        let Some(candidate_position) = gathered.get(new_master).copied() else {
            return Err(gathered
                .failures
                .into_iter()
                .find(|f| &f.tablet == new_master)
                .map(|f| f.error)
                .unwrap_or_else(|| {
                    ShardctlError::Internal(format!("no position gathered for {new_master}"))
                }));
        };
        let best = gathered
            .successes
            .iter()
            .map(|(_, position)| *position)
            .max()
            .unwrap_or(candidate_position);
        debug!(candidate = %candidate_position, best = %best, "Gathered survivor positions");

        if candidate_position < best {
            self.catch_up(&new_tablet, best).await?;
        }
        self.ensure_unchanged(keyspace, shard, &read).await?;
        let position = self.promote(&new_tablet).await?;

        let others: Vec<Tablet> = survivors
            .into_iter()
            .filter(|t| &t.alias != new_master)
            .collect();
        let rewire = self.rewire(others, &new_addr, position).await;

        let committed = self.commit(keyspace, read, new_master).await?;
        info!(state = %state.commit()?, "Committed new master");
        self.set_role(new_master, TabletRole::Master).await?;
        if let Some(old) = &old_master {
            self.scrap_in_topology(old).await?;
        }

        let hints = rewire_hints(new_master, &rewire);
        let graph = self.rebuild_graphs(keyspace, &committed, &hints).await?;

        Ok(outcome(keyspace, shard, old_master, new_master, position, rewire, graph))
    }

    /// Record a promotion that happened outside this system. The replication
    /// graph is rebuilt from live tablet state since stored links are stale.
    #[instrument(skip_all, fields(keyspace = %keyspace, shard = %shard, new_master = %new_master))]
    pub async fn externally_reparented(
        &self,
        keyspace: &str,
        shard: &str,
        new_master: &TabletAlias,
    ) -> Result<ReparentOutcome> {
        let lock = self
            .lock(keyspace, shard, format!("external reparent to {new_master}"))
            .await?;
        let result = self.run_external(keyspace, shard, new_master).await;
        self.unlock(keyspace, shard, lock).await;
        result
    }

    async fn run_external(
        &self,
        keyspace: &str,
        shard: &str,
        new_master: &TabletAlias,
    ) -> Result<ReparentOutcome> {
        let read = self.topo.get_shard(keyspace, shard).await?;
        let state = ShardState::of(&read.value).begin(new_master)?;
        let old_master = state.master().cloned();

        let new_tablet = self.shard_tablet(keyspace, shard, new_master).await?;
        let new_addr = replication_addr(&new_tablet)?;
        let not_serving = |cause: String| ShardctlError::NewMasterNotServing {
            tablet: new_master.clone(),
            cause,
        };

        let status = call(
            AgentMethod::GetStatus,
            new_master,
            self.config.rpc_timeout,
            self.agent.get_status(&new_tablet),
        )
        .await
        .map_err(|e| not_serving(e.to_string()))?;
        if !status.is_master || status.read_only {
            return Err(not_serving("tablet is not a writable master".to_string()));
        }
        call(
            AgentMethod::TabletExternallyReparented,
            new_master,
            self.config.rpc_timeout,
            self.agent.tablet_externally_reparented(&new_tablet),
        )
        .await
        .map_err(|e| not_serving(e.to_string()))?;
        info!(%state, position = %status.position, "New master confirmed");

        let others = self
            .shard_members_except(keyspace, &read.value, &[new_master])
            .await?;
        let rewire = self.rewire(others, &new_addr, status.position).await;

        let committed = self.commit(keyspace, read, new_master).await?;
        info!(state = %state.commit()?, "Committed new master");
        self.set_role(new_master, TabletRole::Master).await?;
        if let Some(old) = &old_master {
            self.settle_old_master(old, &rewire).await?;
        }

        let graph = self
            .rebuild_graphs(keyspace, &committed, &HashMap::new())
            .await?;

        Ok(outcome(keyspace, shard, old_master, new_master, status.position, rewire, graph))
    }

    /// Bootstrap mastership of a shard. An existing different master is only
    /// replaced with `force`.
    #[instrument(skip_all, fields(keyspace = %keyspace, shard = %shard, new_master = %new_master, force = force))]
    pub async fn init_shard_master(
        &self,
        keyspace: &str,
        shard: &str,
        new_master: &TabletAlias,
        force: bool,
    ) -> Result<ReparentOutcome> {
        let lock = self
            .lock(keyspace, shard, format!("init shard master {new_master}"))
            .await?;
        let result = self.run_init(keyspace, shard, new_master, force).await;
        self.unlock(keyspace, shard, lock).await;
        result
    }

    async fn run_init(
        &self,
        keyspace: &str,
        shard: &str,
        new_master: &TabletAlias,
        force: bool,
    ) -> Result<ReparentOutcome> {
        let read = self.topo.get_shard(keyspace, shard).await?;
        let state = ShardState::of(&read.value).begin(new_master)?;
        let old_master = state.master().cloned();
        if let (Some(old), false) = (&old_master, force) {
            return Err(ShardctlError::InvalidArgument(format!(
                "shard {keyspace}/{shard} already has master {old}, use force to replace it"
            )));
        }

        let new_tablet = self.shard_tablet(keyspace, shard, new_master).await?;
        if !new_tablet.role.in_replication_graph() {
            return Err(ShardctlError::InvalidArgument(format!(
                "tablet {new_master} has role {}, cannot become master",
                new_tablet.role
            )));
        }
        let new_addr = replication_addr(&new_tablet)?;

        let position = self.promote(&new_tablet).await?;
        let others = self
            .shard_members_except(keyspace, &read.value, &[new_master])
            .await?;
        let rewire = self.rewire(others, &new_addr, position).await;

        let committed = self.commit(keyspace, read, new_master).await?;
        info!(state = %state.commit()?, "Initialized shard master");
        self.set_role(new_master, TabletRole::Master).await?;
        if let Some(old) = &old_master {
            self.settle_old_master(old, &rewire).await?;
        }

        let hints = rewire_hints(new_master, &rewire);
        let graph = self.rebuild_graphs(keyspace, &committed, &hints).await?;

        Ok(outcome(keyspace, shard, old_master, new_master, position, rewire, graph))
    }

    /// Point one tablet at the current shard master without starting
    /// replication. Used to reattach a tablet that missed a reparent; start
    /// replication separately once its position has been checked.
    #[instrument(skip_all, fields(tablet = %alias))]
    pub async fn reparent_tablet(&self, alias: &TabletAlias) -> Result<ReplicationPosition> {
        let tablet = self.topo.get_tablet(alias).await?.into_inner();
        let (Some(keyspace), Some(shard)) = (tablet.keyspace.clone(), tablet.shard.clone()) else {
            return Err(ShardctlError::InvalidArgument(format!(
                "tablet {alias} is not assigned to a shard"
            )));
        };
        if !tablet.role.is_slave_type() {
            return Err(ShardctlError::InvalidArgument(format!(
                "tablet {alias} has role {}, only replicas and spares can be reparented",
                tablet.role
            )));
        }

        let lock = self
            .lock(&keyspace, &shard, format!("reparent tablet {alias}"))
            .await?;
        let result = self.reattach(&tablet, &keyspace, &shard).await;
        self.unlock(&keyspace, &shard, lock).await;
        result
    }

    async fn reattach(
        &self,
        tablet: &Tablet,
        keyspace: &str,
        shard: &str,
    ) -> Result<ReplicationPosition> {
        let alias = &tablet.alias;
        let record = self.topo.get_shard(keyspace, shard).await?.into_inner();
        let master = record.master_alias.clone().ok_or_else(|| {
            ShardctlError::InvalidArgument(format!("shard {keyspace}/{shard} has no master"))
        })?;
        if &master == alias {
            return Err(ShardctlError::NoOpReparent(master));
        }
        let master_tablet = self.topo.get_tablet(&master).await?.into_inner();
        let master_addr = replication_addr(&master_tablet)?;

        let position = call(
            AgentMethod::GetReplicationPosition,
            &master,
            self.config.rpc_timeout,
            self.agent.get_replication_position(&master_tablet),
        )
        .await?;
        call(
            AgentMethod::SetMaster,
            alias,
            self.config.rpc_timeout,
            self.agent.set_master(tablet, &master_addr, position, false),
        )
        .await?;
        info!(keyspace = %keyspace, shard = %shard, master = %master, %position, "Tablet reparented");

        let hints = HashMap::from([
            (master.clone(), LinkHint::Root),
            (alias.clone(), LinkHint::Parent(master)),
        ]);
        rebuild_shard_replication(
            self.topo.as_ref(),
            self.agent.as_ref(),
            keyspace,
            shard,
            &hints,
            self.config.rpc_timeout,
        )
        .await?;
        Ok(position)
    }

    // ===== Steps =====

    async fn lock(&self, keyspace: &str, shard: &str, holder: String) -> Result<Version> {
        let lock = self.topo.lock_shard(keyspace, shard, &holder).await?;
        debug!(holder = %holder, "Shard locked");
        Ok(lock)
    }

    /// A lock that cannot be released must be removed by hand
    async fn unlock(&self, keyspace: &str, shard: &str, lock: Version) {
        if let Err(e) = self.topo.unlock_shard(keyspace, shard, lock).await {
            warn!(keyspace, shard, error = %e, "Failed to release shard lock");
        }
    }

    async fn shard_tablet(&self, keyspace: &str, shard: &str, alias: &TabletAlias) -> Result<Tablet> {
        let tablet = self.topo.get_tablet(alias).await?.into_inner();
        if !tablet.is_in_shard(keyspace, shard) {
            return Err(ShardctlError::InvalidArgument(format!(
                "tablet {alias} is not in shard {keyspace}/{shard}"
            )));
        }
        Ok(tablet)
    }

    /// A replica or spare of the shard
    async fn candidate(&self, keyspace: &str, shard: &str, alias: &TabletAlias) -> Result<Tablet> {
        let tablet = self.shard_tablet(keyspace, shard, alias).await?;
        if !tablet.role.is_slave_type() {
            return Err(ShardctlError::InvalidArgument(format!(
                "tablet {alias} has role {}, the new master must be a replica or spare",
                tablet.role
            )));
        }
        Ok(tablet)
    }

    async fn shard_members_except(
        &self,
        keyspace: &str,
        record: &Shard,
        excluded: &[&TabletAlias],
    ) -> Result<Vec<Tablet>> {
        Ok(shard_tablets(self.topo.as_ref(), keyspace, record)
            .await?
            .into_iter()
            .filter(|t| !excluded.contains(&&t.alias))
            .collect())
    }

    async fn demote(&self, tablet: &Tablet) -> Result<ReplicationPosition> {
        let limit = self.config.wait_time;
        let cause = match timeout(limit, self.agent.demote_master(tablet, limit)).await {
            Ok(Ok(position)) => return Ok(position),
            Ok(Err(e)) => e.to_string(),
            Err(_) => AgentError::Timeout(limit).to_string(),
        };
        warn!(tablet = %tablet.alias, cause = %cause, "Demote failed, shard left unchanged");
        Err(ShardctlError::DemoteMasterFailed {
            tablet: tablet.alias.clone(),
            cause,
        })
    }

    /// Wait for `tablet` to reach `target` within the catch-up timeout
    async fn catch_up(&self, tablet: &Tablet, target: ReplicationPosition) -> Result<ReplicationPosition> {
        let limit = self.config.catchup_timeout;
        match timeout(limit, self.agent.wait_for_position(tablet, target, limit)).await {
            Ok(Ok(reached)) => Ok(reached),
            Ok(Err(AgentError::Timeout(_))) | Err(_) => {
                let position = call(
                    AgentMethod::GetReplicationPosition,
                    &tablet.alias,
                    self.config.rpc_timeout,
                    self.agent.get_replication_position(tablet),
                )
                .await?;
                Err(ShardctlError::NewMasterBehind {
                    tablet: tablet.alias.clone(),
                    position,
                    best: target,
                })
            }
            Ok(Err(e)) => Err(e.into_rpc(AgentMethod::WaitForPosition, &tablet.alias)),
        }
    }

    async fn promote(&self, tablet: &Tablet) -> Result<ReplicationPosition> {
        let position = call(
            AgentMethod::PromoteSlave,
            &tablet.alias,
            self.config.rpc_timeout,
            self.agent.promote_slave(tablet),
        )
        .await?;
        info!(new_master = %tablet.alias, %position, "Promoted new master");
        Ok(position)
    }

    async fn rewire(
        &self,
        tablets: Vec<Tablet>,
        master_addr: &str,
        position: ReplicationPosition,
    ) -> FanoutResult<()> {
        let agent = self.agent.as_ref();
        let result = fan_out(tablets, AgentMethod::SetMaster, self.config.rpc_timeout, |tablet| async move {
            agent.set_master(&tablet, master_addr, position, true).await
        })
        .await;
        info!(
            rewired = result.success_count(),
            failed = result.failure_count(),
            latency_ms = result.total_latency_ms,
            "Rewired replicas"
        );
        result
    }

    /// Fail if mastership moved since `read` was taken
    async fn ensure_unchanged(&self, keyspace: &str, shard: &str, read: &Versioned<Shard>) -> Result<()> {
        let current = self.topo.get_shard(keyspace, shard).await?;
        if current.value.master_alias != read.value.master_alias {
            warn!(expected = %read.version, actual = %current.version, "Mastership changed during reparent");
            return Err(ShardctlError::ConcurrentModification {
                path: format!("{keyspace}/{shard}"),
                expected: read.version,
                actual: current.version,
            });
        }
        Ok(())
    }

    /// Compare-and-set the new master into the shard record. Writes that
    /// left mastership alone are merged; a changed master is a lost race.
    async fn commit(
        &self,
        keyspace: &str,
        read: Versioned<Shard>,
        new_master: &TabletAlias,
    ) -> Result<Shard> {
        let previous = read.value.master_alias.clone();
        let Versioned {
            value: mut record,
            mut version,
        } = read;
        let mut attempt = 0;
        loop {
            record.master_alias = Some(new_master.clone());
            record.cells.insert(new_master.cell.clone());
            let err = match self
                .topo
                .update_shard(keyspace, &record.name, version, &record)
                .await
            {
                Ok(_) => return Ok(record),
                Err(e) if e.is_retryable() && attempt < self.config.topo_retries => e,
                Err(e) => return Err(e),
            };

            let current = self.topo.get_shard(keyspace, &record.name).await?;
            if current.value.master_alias != previous {
                warn!(
                    master = ?current.value.master_alias,
                    "Mastership changed before commit"
                );
                return Err(err);
            }
            attempt += 1;
            debug!(attempt, "Shard record changed underneath, retrying commit");
            record = current.value;
            version = current.version;
        }
    }

    async fn set_role(&self, alias: &TabletAlias, role: TabletRole) -> Result<Tablet> {
        update_tablet_fields(self.topo.as_ref(), alias, self.config.topo_retries, |tablet| {
            tablet.role = role;
            Ok(())
        })
        .await
    }

    /// A replaced master follows the new one if it could be rewired
    async fn settle_old_master(&self, old: &TabletAlias, rewire: &FanoutResult<()>) -> Result<()> {
        let role = if rewire.get(old).is_some() {
            TabletRole::Replica
        } else {
            TabletRole::Spare
        };
        let result = update_tablet_fields(self.topo.as_ref(), old, self.config.topo_retries, |tablet| {
            if tablet.role != TabletRole::Scrap {
                tablet.role = role;
            }
            Ok(())
        })
        .await;
        match result {
            Ok(_) => Ok(()),
            Err(e) if e.is_not_found() => {
                warn!(old_master = %old, "Old master record is gone");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Topology-only scrap of a dead master
    async fn scrap_in_topology(&self, alias: &TabletAlias) -> Result<()> {
        let result = update_tablet_fields(self.topo.as_ref(), alias, self.config.topo_retries, |tablet| {
            tablet.role = TabletRole::Scrap;
            Ok(())
        })
        .await;
        match result {
            Ok(_) => {
                info!(old_master = %alias, "Scrapped old master");
                Ok(())
            }
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn rebuild_graphs(
        &self,
        keyspace: &str,
        committed: &Shard,
        hints: &HashMap<TabletAlias, LinkHint>,
    ) -> Result<GraphReport> {
        let graph = rebuild_shard_replication(
            self.topo.as_ref(),
            self.agent.as_ref(),
            keyspace,
            &committed.name,
            hints,
            self.config.rpc_timeout,
        )
        .await?;
        for cell in &committed.cells {
            self.topo.rebuild_serving_graph(keyspace, cell).await?;
        }
        Ok(graph)
    }
}

fn replication_addr(tablet: &Tablet) -> Result<String> {
    tablet.mysql_addr().ok_or_else(|| {
        ShardctlError::InvalidArgument(format!("tablet {} has no mysql port", tablet.alias))
    })
}

fn rewire_hints(new_master: &TabletAlias, rewire: &FanoutResult<()>) -> HashMap<TabletAlias, LinkHint> {
    let mut hints: HashMap<TabletAlias, LinkHint> = rewire
        .successes
        .iter()
        .map(|(tablet, _)| (tablet.alias.clone(), LinkHint::Parent(new_master.clone())))
        .collect();
    hints.insert(new_master.clone(), LinkHint::Root);
    hints
}

fn outcome(
    keyspace: &str,
    shard: &str,
    old_master: Option<TabletAlias>,
    new_master: &TabletAlias,
    position: ReplicationPosition,
    rewire: FanoutResult<()>,
    graph: GraphReport,
) -> ReparentOutcome {
    ReparentOutcome {
        keyspace: keyspace.to_string(),
        shard: shard.to_string(),
        old_master,
        new_master: new_master.clone(),
        position,
        rewired: rewire.successes.into_iter().map(|(t, _)| t.alias).collect(),
        failures: rewire.failures,
        graph,
    }
}
