//! Shared cluster fixture: an in-memory topology plus fake node agents

#![allow(dead_code)]

use shardctl_agent::{FakeNodeAgent, NodeAgentClient};
use shardctl_core::{
    Keyspace, ReplicationPosition, Tablet, TabletAlias, TabletRole,
};
use shardctl_reparent::{ClusterAdmin, ReparentConfig, ReparentCoordinator};
use shardctl_topo::{MemoryTopo, TopologyClient};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

pub const KEYSPACE: &str = "test_keyspace";
pub const SHARD: &str = "0";
pub const CELL: &str = "test_nj";

pub fn alias(uid: u32) -> TabletAlias {
    TabletAlias::new(CELL, uid)
}

pub fn tablet(uid: u32, role: TabletRole) -> Tablet {
    Tablet::new(alias(uid), format!("host{uid}"))
        .with_port("vt", 15000)
        .with_port("mysql", 3306)
        .assigned(KEYSPACE, SHARD, role)
}

pub fn test_config() -> ReparentConfig {
    ReparentConfig::default()
        .with_wait_time(Duration::from_millis(500))
        .with_rpc_timeout(Duration::from_millis(500))
        .with_catchup_timeout(Duration::from_millis(500))
}

pub struct Cluster {
    pub topo: Arc<MemoryTopo>,
    pub agent: Arc<FakeNodeAgent>,
    pub coordinator: Arc<ReparentCoordinator>,
    pub admin: ClusterAdmin,
    pub tablets: BTreeMap<u32, Tablet>,
}

impl Cluster {
    /// One shard with `master` initialized as master and `replicas` following it
    pub async fn new(master: u32, replicas: &[u32]) -> Self {
        Self::with_config(master, replicas, test_config()).await
    }

    pub async fn with_config(master: u32, replicas: &[u32], config: ReparentConfig) -> Self {
        let topo = Arc::new(MemoryTopo::in_memory());
        let agent = Arc::new(FakeNodeAgent::new());
        let coordinator = Arc::new(ReparentCoordinator::new(
            topo.clone(),
            agent.clone(),
            config.clone(),
        ));
        let admin = ClusterAdmin::new(topo.clone(), agent.clone(), config);

        admin
            .create_keyspace(KEYSPACE, &Keyspace::default())
            .await
            .unwrap();
        let master_tablet = admin
            .init_tablet(tablet(master, TabletRole::Replica))
            .await
            .unwrap();
        agent.add_master(&master_tablet, ReplicationPosition::new(1, 1000));

        let mut tablets = BTreeMap::new();
        for &uid in replicas {
            let replica = admin
                .init_tablet(tablet(uid, TabletRole::Replica))
                .await
                .unwrap();
            agent.add_replica(&replica, &master_tablet);
            tablets.insert(uid, replica);
        }
        tablets.insert(master, master_tablet);

        coordinator
            .init_shard_master(KEYSPACE, SHARD, &alias(master), false)
            .await
            .unwrap();

        Self {
            topo,
            agent,
            coordinator,
            admin,
            tablets,
        }
    }

    pub fn tablet(&self, uid: u32) -> &Tablet {
        &self.tablets[&uid]
    }

    pub fn mysql_addr(&self, uid: u32) -> String {
        self.tablet(uid).mysql_addr().unwrap()
    }

    pub async fn shard_master(&self) -> Option<TabletAlias> {
        self.topo
            .get_shard(KEYSPACE, SHARD)
            .await
            .unwrap()
            .into_inner()
            .master_alias
    }

    pub async fn role(&self, uid: u32) -> TabletRole {
        self.topo.get_tablet(&alias(uid)).await.unwrap().into_inner().role
    }

    /// Position as seen through the agent, which lets replicas catch up
    pub async fn position(&self, uid: u32) -> ReplicationPosition {
        self.agent
            .get_replication_position(self.tablet(uid))
            .await
            .unwrap()
    }

    /// Exactly one master tablet, and every replica replicates from it
    pub async fn assert_single_master(&self, master: u32) {
        let tablets = self.topo.list_tablets(CELL).await.unwrap();
        let masters: Vec<&TabletAlias> = tablets
            .iter()
            .filter(|t| t.role == TabletRole::Master)
            .map(|t| &t.alias)
            .collect();
        assert_eq!(masters, vec![&alias(master)]);
        assert_eq!(self.shard_master().await, Some(alias(master)));

        let master_addr = self.mysql_addr(master);
        for replica in tablets.iter().filter(|t| t.role == TabletRole::Replica) {
            assert_eq!(
                self.agent.source_of(&replica.alias).as_deref(),
                Some(master_addr.as_str()),
                "{} does not replicate from the master",
                replica.alias
            );
        }
    }
}
