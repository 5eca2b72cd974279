//! Cluster administration
//!
//! Tablet lifecycle and graph maintenance commands that do not move
//! mastership. Mastership only changes through the coordinator.

use crate::config::ReparentConfig;
use crate::fanout::call;
use crate::replication_graph::{
    rebuild_replication_graph, shard_replication_positions, validate_shard, GraphReport,
    TabletPosition, ValidationReport,
};
use shardctl_agent::{AgentMethod, NodeAgentClient};
use shardctl_core::{
    EndPoint, KeyRange, Keyspace, ReplicationLink, Result, Shard, ShardctlError, Tablet,
    TabletAlias, TabletRole,
};
use shardctl_topo::{
    read_keyspace, update_shard_fields, update_shard_replication_fields, update_tablet_fields,
    TopologyClient,
};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Administrative operations on keyspaces, shards and tablets
pub struct ClusterAdmin {
    topo: Arc<dyn TopologyClient>,
    agent: Arc<dyn NodeAgentClient>,
    config: ReparentConfig,
}

impl ClusterAdmin {
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

    // ===== Keyspaces and Shards =====

    pub async fn create_keyspace(&self, name: &str, keyspace: &Keyspace) -> Result<()> {
        for (role, target) in &keyspace.served_from {
            if *role == TabletRole::Unknown {
                return Err(ShardctlError::InvalidArgument(format!(
                    "served_from role must be set for keyspace {name}"
                )));
            }
            if target == name {
                return Err(ShardctlError::InvalidArgument(format!(
                    "keyspace {name} cannot be served from itself"
                )));
            }
        }
        self.topo.create_keyspace(name, keyspace).await?;
        info!(keyspace = name, "Created keyspace");
        Ok(())
    }

    /// Create a shard whose key range is parsed from its name
    pub async fn create_shard(&self, keyspace: &str, shard: &str) -> Result<Shard> {
        let record = Shard::new(shard, KeyRange::from_shard_name(shard)?);
        self.topo.create_shard(keyspace, &record).await?;
        info!(keyspace, shard, key_range = %record.key_range, "Created shard");
        Ok(record)
    }

    // ===== Tablets =====

    /// Register a tablet. An assigned tablet gets its shard created if
    /// missing and its cell added to the shard.
    #[instrument(skip_all, fields(tablet = %tablet.alias, role = %tablet.role))]
    pub async fn init_tablet(&self, mut tablet: Tablet) -> Result<Tablet> {
        match tablet.role {
            TabletRole::Master => {
                return Err(ShardctlError::InvalidArgument(format!(
                    "tablet {} cannot be created as master, use init-shard-master",
                    tablet.alias
                )))
            }
            TabletRole::Unknown | TabletRole::Scrap => {
                return Err(ShardctlError::InvalidArgument(format!(
                    "tablet {} cannot be created with role {}",
                    tablet.alias, tablet.role
                )))
            }
            _ => {}
        }

        let (keyspace, shard) = match (tablet.keyspace.clone(), tablet.shard.clone()) {
            (Some(keyspace), Some(shard)) => (keyspace, shard),
            (None, None) if tablet.role == TabletRole::Idle => {
                self.topo.create_tablet(&tablet).await?;
                info!("Registered idle tablet");
                return Ok(tablet);
            }
            _ => {
                return Err(ShardctlError::InvalidArgument(format!(
                    "tablet {} with role {} needs both a keyspace and a shard",
                    tablet.alias, tablet.role
                )))
            }
        };

        let record = match self.topo.get_shard(&keyspace, &shard).await {
            Ok(record) => record.into_inner(),
            Err(e) if e.is_not_found() => self.create_shard(&keyspace, &shard).await?,
            Err(e) => return Err(e),
        };
        if tablet.key_range.is_none() {
            tablet.key_range = Some(record.key_range.clone());
        }
        self.topo.create_tablet(&tablet).await?;

        let cell = tablet.alias.cell.clone();
        update_shard_fields(
            self.topo.as_ref(),
            &keyspace,
            &shard,
            self.config.topo_retries,
            |record| {
                record.cells.insert(cell.clone());
                Ok(())
            },
        )
        .await?;

        // without a master the graph is written by init-shard-master
        if let (true, Some(master)) = (
            tablet.role.in_replication_graph(),
            record.master_alias.clone(),
        ) {
            let link = ReplicationLink {
                tablet_alias: tablet.alias.clone(),
                parent: Some(master),
            };
            self.set_link(&tablet.alias, &keyspace, &shard, Some(link))
                .await?;
        }
        info!(keyspace = %keyspace, shard = %shard, "Registered tablet");
        Ok(tablet)
    }

    /// Change the role of a tablet in the topology. Master is never entered
    /// or left here; scrap and idle transitions need `force`.
    #[instrument(skip_all, fields(tablet = %alias, role = %role, force = force))]
    pub async fn change_tablet_role(
        &self,
        alias: &TabletAlias,
        role: TabletRole,
        force: bool,
    ) -> Result<Tablet> {
        let mut before = None;
        let tablet = update_tablet_fields(self.topo.as_ref(), alias, self.config.topo_retries, |tablet| {
            check_role_change(tablet, role, force)?;
            before = Some(tablet.clone());
            if role == TabletRole::Idle {
                tablet.clear_assignment();
            }
            tablet.role = role;
            Ok(())
        })
        .await?;
        let Some(before) = before else {
            return Ok(tablet);
        };
        info!(from = %before.role, "Changed tablet role");

        if let (Some(keyspace), Some(shard)) = (&before.keyspace, &before.shard) {
            if !role.in_replication_graph() {
                self.set_link(alias, keyspace, shard, None).await?;
            } else if !before.role.in_replication_graph() {
                let master = self.topo.get_shard(keyspace, shard).await?.into_inner().master_alias;
                if let Some(master) = master {
                    let link = ReplicationLink {
                        tablet_alias: alias.clone(),
                        parent: Some(master),
                    };
                    self.set_link(alias, keyspace, shard, Some(link)).await?;
                }
            }
            self.topo.rebuild_serving_graph(keyspace, &alias.cell).await?;
        }
        Ok(tablet)
    }

    /// Decommission a tablet. Without `force` the agent is told first and
    /// must acknowledge.
    #[instrument(skip_all, fields(tablet = %alias, force = force))]
    pub async fn scrap_tablet(&self, alias: &TabletAlias, force: bool) -> Result<()> {
        let tablet = self.topo.get_tablet(alias).await?.into_inner();
        if tablet.role == TabletRole::Scrap {
            debug!("Tablet already scrapped");
            return Ok(());
        }
        if !force {
            call(
                AgentMethod::Scrap,
                alias,
                self.config.rpc_timeout,
                self.agent.scrap(&tablet),
            )
            .await?;
        }

        update_tablet_fields(self.topo.as_ref(), alias, self.config.topo_retries, |tablet| {
            tablet.role = TabletRole::Scrap;
            Ok(())
        })
        .await?;
        if tablet.role == TabletRole::Master {
            warn!("Scrapped a master, the shard needs an emergency reparent");
        }

        if let (Some(keyspace), Some(shard)) = (&tablet.keyspace, &tablet.shard) {
            self.set_link(alias, keyspace, shard, None).await?;
            self.topo.rebuild_serving_graph(keyspace, &alias.cell).await?;
        }
        info!("Scrapped tablet");
        Ok(())
    }

    /// Remove an idle or scrapped tablet record
    pub async fn delete_tablet(&self, alias: &TabletAlias) -> Result<()> {
        let tablet = self.topo.get_tablet(alias).await?.into_inner();
        if !matches!(tablet.role, TabletRole::Idle | TabletRole::Scrap) {
            return Err(ShardctlError::InvalidArgument(format!(
                "tablet {alias} has role {}, scrap it before deleting",
                tablet.role
            )));
        }
        self.topo.delete_tablet(alias).await?;
        info!(tablet = %alias, "Deleted tablet");
        Ok(())
    }

    pub async fn start_replication(&self, alias: &TabletAlias) -> Result<()> {
        let tablet = self.topo.get_tablet(alias).await?.into_inner();
        call(
            AgentMethod::StartReplication,
            alias,
            self.config.rpc_timeout,
            self.agent.start_replication(&tablet),
        )
        .await?;
        info!(tablet = %alias, "Started replication");
        Ok(())
    }

    pub async fn stop_replication(&self, alias: &TabletAlias) -> Result<()> {
        let tablet = self.topo.get_tablet(alias).await?.into_inner();
        call(
            AgentMethod::StopReplication,
            alias,
            self.config.rpc_timeout,
            self.agent.stop_replication(&tablet),
        )
        .await?;
        info!(tablet = %alias, "Stopped replication");
        Ok(())
    }

    // ===== Graphs =====

    /// Recompute the cells of a shard from the tablets registered in every
    /// known cell, then rebuild the serving graph of the keyspace there.
    #[instrument(skip(self))]
    pub async fn rebuild_shard_graph(&self, keyspace: &str, shard: &str) -> Result<Shard> {
        let cells = self.shard_cells(keyspace, shard).await?;
        let previous = self.topo.get_shard(keyspace, shard).await?.into_inner().cells;
        let record = update_shard_fields(
            self.topo.as_ref(),
            keyspace,
            shard,
            self.config.topo_retries,
            |record| {
                record.cells = cells.clone();
                Ok(())
            },
        )
        .await?;
        for cell in previous.union(&record.cells) {
            self.topo.rebuild_serving_graph(keyspace, cell).await?;
        }
        info!(cells = ?record.cells, "Rebuilt shard graph");
        Ok(record)
    }

    /// Rebuild every shard of a keyspace, returning the cells rebuilt
    #[instrument(skip(self))]
    pub async fn rebuild_keyspace_graph(&self, keyspace: &str) -> Result<Vec<String>> {
        self.topo.get_keyspace(keyspace).await?;
        let mut cells = BTreeSet::new();
        for shard in self.topo.get_shard_names(keyspace).await? {
            let record = self.rebuild_shard_graph(keyspace, &shard).await?;
            cells.extend(record.cells);
        }
        // a keyspace without tablets still gets its serving record everywhere
        for cell in self.topo.get_known_cells().await? {
            if cells.insert(cell.clone()) {
                self.topo.rebuild_serving_graph(keyspace, &cell).await?;
            }
        }
        Ok(cells.into_iter().collect())
    }

    pub async fn rebuild_replication_graph(
        &self,
        cells: &[String],
        keyspaces: &[String],
    ) -> Result<GraphReport> {
        rebuild_replication_graph(self.topo.as_ref(), cells, keyspaces, self.config.topo_retries)
            .await
    }

    pub async fn validate_shard(
        &self,
        keyspace: &str,
        shard: &str,
        ping_tablets: bool,
    ) -> Result<ValidationReport> {
        let agent = ping_tablets.then_some(self.agent.as_ref());
        validate_shard(self.topo.as_ref(), agent, keyspace, shard, self.config.rpc_timeout).await
    }

    pub async fn shard_replication_positions(
        &self,
        keyspace: &str,
        shard: &str,
    ) -> Result<Vec<TabletPosition>> {
        shard_replication_positions(
            self.topo.as_ref(),
            self.agent.as_ref(),
            keyspace,
            shard,
            self.config.rpc_timeout,
        )
        .await
    }

    // ===== Serving Lookups =====

    pub async fn get_end_points(
        &self,
        cell: &str,
        keyspace: &str,
        shard: &str,
        role: TabletRole,
    ) -> Result<Vec<EndPoint>> {
        let srv_shard = self.topo.get_srv_shard(cell, keyspace, shard).await?;
        let endpoints = srv_shard.endpoints_for(role);
        if endpoints.is_empty() {
            return Err(ShardctlError::NotFound(format!(
                "no {role} end points for {keyspace}/{shard} in {cell}"
            )));
        }
        Ok(endpoints.to_vec())
    }

    pub async fn resolve_shard(
        &self,
        cell: &str,
        keyspace: &str,
        keyspace_id: u64,
        role: TabletRole,
    ) -> Result<String> {
        let model = read_keyspace(self.topo.as_ref(), cell, keyspace).await?;
        Ok(model.resolve_shard(keyspace_id, role)?.to_string())
    }

    // ===== Helpers =====

    async fn shard_cells(&self, keyspace: &str, shard: &str) -> Result<BTreeSet<String>> {
        let mut cells = BTreeSet::new();
        for cell in self.topo.get_known_cells().await? {
            let present = self
                .topo
                .list_tablets(&cell)
                .await?
                .iter()
                .any(|t| t.is_in_shard(keyspace, shard) && t.role.in_replication_graph());
            if present {
                cells.insert(cell);
            }
        }
        Ok(cells)
    }

    /// Replace the link of one tablet in its cell's replication graph
    async fn set_link(
        &self,
        alias: &TabletAlias,
        keyspace: &str,
        shard: &str,
        link: Option<ReplicationLink>,
    ) -> Result<()> {
        update_shard_replication_fields(
            self.topo.as_ref(),
            &alias.cell,
            keyspace,
            shard,
            self.config.topo_retries,
            |graph| {
                graph.links.retain(|l| &l.tablet_alias != alias);
                graph.links.extend(link.clone());
                graph.links.sort();
                Ok(())
            },
        )
        .await?;
        Ok(())
    }
}

fn check_role_change(tablet: &Tablet, to: TabletRole, force: bool) -> Result<()> {
    let from = tablet.role;
    let invalid = |reason: &str| {
        Err(ShardctlError::InvalidRoleChange {
            tablet: tablet.alias.clone(),
            from,
            to,
            reason: reason.to_string(),
        })
    };

    if from == to {
        return Ok(());
    }
    match (from, to) {
        (TabletRole::Master, _) | (_, TabletRole::Master) => {
            invalid("mastership only changes by reparenting")
        }
        (_, TabletRole::Unknown) => invalid("unknown is not a target role"),
        (_, TabletRole::Scrap) => invalid("use scrap-tablet"),
        (TabletRole::Scrap, TabletRole::Idle) if force => Ok(()),
        (TabletRole::Scrap, _) => invalid("a scrapped tablet can only go back to idle with force"),
        (_, TabletRole::Idle) if force => Ok(()),
        (_, TabletRole::Idle) => invalid("returning to idle drops the assignment, use force"),
        (_, _) if tablet.keyspace.is_none() || tablet.shard.is_none() => {
            invalid("tablet is not assigned to a shard")
        }
        _ => Ok(()),
    }
}
