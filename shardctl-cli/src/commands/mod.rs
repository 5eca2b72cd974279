//! CLI Commands

pub mod graph;
pub mod inspect;
pub mod keyspace;
pub mod reparent;
pub mod tablet;

use anyhow::{Context, Result};
use serde::Serialize;
use shardctl_agent::NodeAgentClient;
use shardctl_reparent::{ClusterAdmin, ReparentConfig, ReparentCoordinator};
use shardctl_topo::TopologyClient;
use std::sync::Arc;

/// Everything a command needs: the open topology and the agent-backed operations
pub struct Session {
    pub topo: Arc<dyn TopologyClient>,
    pub admin: ClusterAdmin,
    pub coordinator: ReparentCoordinator,
    pub default_cell: String,
}

impl Session {
    pub fn new(
        topo: Arc<dyn TopologyClient>,
        agent: Arc<dyn NodeAgentClient>,
        config: ReparentConfig,
        default_cell: String,
    ) -> Self {
        Self {
            admin: ClusterAdmin::new(topo.clone(), agent.clone(), config.clone()),
            coordinator: ReparentCoordinator::new(topo.clone(), agent, config),
            topo,
            default_cell,
        }
    }

    pub fn cell_or_default(&self, cell: Option<String>) -> String {
        cell.unwrap_or_else(|| self.default_cell.clone())
    }
}

/// Print a record as pretty JSON
pub fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value).context("Failed to serialize record")?;
    println!("{}", json);
    Ok(())
}

#[cfg(test)]
pub(crate) mod testing {
    use super::Session;
    use shardctl_agent::FakeNodeAgent;
    use shardctl_core::{ReplicationPosition, Tablet, TabletAlias, TabletRole};
    use shardctl_reparent::ReparentConfig;
    use shardctl_topo::MemoryTopo;
    use std::sync::Arc;
    use std::time::Duration;

    pub const KEYSPACE: &str = "test_keyspace";
    pub const CELL: &str = "test_nj";

    pub fn alias(uid: u32) -> TabletAlias {
        TabletAlias::new(CELL, uid)
    }

    pub fn tablet(uid: u32) -> Tablet {
        Tablet::new(alias(uid), format!("host{uid}"))
            .with_port("vt", 15000)
            .with_port("mysql", 3306)
            .assigned(KEYSPACE, "0", TabletRole::Replica)
    }

    pub fn session() -> (Session, Arc<FakeNodeAgent>) {
        let topo = Arc::new(MemoryTopo::in_memory());
        let agent = Arc::new(FakeNodeAgent::new());
        let config = ReparentConfig::default()
            .with_wait_time(Duration::from_millis(500))
            .with_rpc_timeout(Duration::from_millis(500))
            .with_catchup_timeout(Duration::from_millis(500));
        let session = Session::new(topo, agent.clone(), config, CELL.to_string());
        (session, agent)
    }

    /// Shard "0" with tablet 1 as master and the given uids as replicas
    pub async fn shard(replicas: &[u32]) -> (Session, Arc<FakeNodeAgent>) {
        let (session, agent) = session();
        session
            .admin
            .create_keyspace(KEYSPACE, &Default::default())
            .await
            .unwrap();
        let master = session.admin.init_tablet(tablet(1)).await.unwrap();
        agent.add_master(&master, ReplicationPosition::new(1, 100));
        for &uid in replicas {
            let replica = session.admin.init_tablet(tablet(uid)).await.unwrap();
            agent.add_replica(&replica, &master);
        }
        session
            .coordinator
            .init_shard_master(KEYSPACE, "0", &alias(1), false)
            .await
            .unwrap();
        (session, agent)
    }
}
