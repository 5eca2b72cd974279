//! Replication graph maintenance
//!
//! The per-cell link sets of a shard are always replaced wholesale. A live
//! rebuild asks every tablet who it replicates from (unless the caller
//! already knows from an operation it just performed); a topology rebuild
//! derives links from tablet records alone.

use crate::fanout::fan_out;
use shardctl_agent::{AgentMethod, NodeAgentClient, TabletStatus};
use shardctl_core::{
    ReplicationLink, ReplicationPosition, Result, Shard, ShardReplication, Tablet, TabletAlias,
    TabletRole,
};
use shardctl_topo::{update_shard_fields, TopologyClient};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tracing::{debug, info, warn};

/// What a caller already knows about a tablet's replication parent
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkHint {
    /// The shard master
    Root,
    Parent(TabletAlias),
    /// Not replicating from anyone
    Detached,
}

/// Summary of a graph rebuild
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GraphReport {
    pub cells: Vec<String>,
    pub links: usize,
    /// Unreachable tablets whose previous link was kept
    pub stale: Vec<TabletAlias>,
    /// Tablets not replicating from any tablet of the shard
    pub detached: Vec<TabletAlias>,
}

impl GraphReport {
    fn merge(&mut self, other: GraphReport) {
        self.cells.extend(other.cells);
        self.links += other.links;
        self.stale.extend(other.stale);
        self.detached.extend(other.detached);
    }
}

/// Tablets of the shard that take part in replication, across its cells
pub async fn shard_tablets(
    topo: &dyn TopologyClient,
    keyspace: &str,
    shard: &Shard,
) -> Result<Vec<Tablet>> {
    let mut tablets = Vec::new();
    for cell in &shard.cells {
        tablets.extend(
            topo.list_tablets(cell)
                .await?
                .into_iter()
                .filter(|t| t.is_in_shard(keyspace, &shard.name) && t.role.in_replication_graph()),
        );
    }
    Ok(tablets)
}

fn parent_from_status(
    status: &TabletStatus,
    by_addr: &HashMap<String, TabletAlias>,
) -> Option<LinkHint> {
    if status.is_master {
        return Some(LinkHint::Root);
    }
    status
        .replication_source
        .as_ref()
        .and_then(|source| by_addr.get(source))
        .map(|parent| LinkHint::Parent(parent.clone()))
}

/// Rebuild the replication graph of one shard from live tablet state
pub async fn rebuild_shard_replication(
    topo: &dyn TopologyClient,
    agent: &dyn NodeAgentClient,
    keyspace: &str,
    shard_name: &str,
    hints: &HashMap<TabletAlias, LinkHint>,
    rpc_timeout: Duration,
) -> Result<GraphReport> {
    let shard = topo.get_shard(keyspace, shard_name).await?.into_inner();
    let members = shard_tablets(topo, keyspace, &shard).await?;

    let by_addr: HashMap<String, TabletAlias> = members
        .iter()
        .filter_map(|t| t.mysql_addr().map(|addr| (addr, t.alias.clone())))
        .collect();

    let to_query: Vec<Tablet> = members
        .iter()
        .filter(|t| !hints.contains_key(&t.alias))
        .cloned()
        .collect();
    let statuses = fan_out(to_query, AgentMethod::GetStatus, rpc_timeout, |tablet| async move {
        agent.get_status(&tablet).await
    })
    .await;

    let mut previous = HashMap::new();
    for cell in &shard.cells {
        previous.insert(
            cell.clone(),
            topo.get_shard_replication(cell, keyspace, shard_name).await?,
        );
    }

    let mut report = GraphReport {
        cells: shard.cells.iter().cloned().collect(),
        ..Default::default()
    };
    let mut links: BTreeMap<&str, Vec<ReplicationLink>> =
        shard.cells.iter().map(|c| (c.as_str(), Vec::new())).collect();

    for tablet in &members {
        let alias = &tablet.alias;
        let hint = match hints.get(alias) {
            Some(hint) => Some(hint.clone()),
            None => match statuses.get(alias) {
                Some(status) => parent_from_status(status, &by_addr),
                None => {
                    // unreachable: keep whatever we knew, except a root that
                    // is no longer the master
                    let kept = previous
                        .get(&alias.cell)
                        .and_then(|graph| graph.link_for(alias))
                        .and_then(|link| match &link.parent {
                            Some(parent) => Some(LinkHint::Parent(parent.clone())),
                            None if shard.master_alias.as_ref() == Some(alias) => {
                                Some(LinkHint::Root)
                            }
                            None => None,
                        });
                    report.stale.push(alias.clone());
                    kept
                }
            },
        };

        let parent = match hint {
            Some(LinkHint::Root) => None,
            Some(LinkHint::Parent(parent)) => Some(parent),
            Some(LinkHint::Detached) | None => {
                report.detached.push(alias.clone());
                continue;
            }
        };
        links.entry(alias.cell.as_str()).or_default().push(ReplicationLink {
            tablet_alias: alias.clone(),
            parent,
        });
    }

    for (cell, mut cell_links) in links {
        cell_links.sort();
        report.links += cell_links.len();
        topo.update_shard_replication(
            cell,
            keyspace,
            shard_name,
            &ShardReplication { links: cell_links },
        )
        .await?;
    }

    if !report.stale.is_empty() {
        warn!(keyspace, shard = shard_name, stale = ?report.stale, "Kept previous links for unreachable tablets");
    }
    info!(
        keyspace,
        shard = shard_name,
        links = report.links,
        detached = report.detached.len(),
        "Rebuilt replication graph"
    );
    Ok(report)
}

/// Rebuild replication graphs of `keyspaces` in `cells` from tablet records
/// alone, also recording each cell in the shards it hosts tablets for.
pub async fn rebuild_replication_graph(
    topo: &dyn TopologyClient,
    cells: &[String],
    keyspaces: &[String],
    retries: u32,
) -> Result<GraphReport> {
    let mut tablets_by_cell = HashMap::new();
    for cell in cells {
        tablets_by_cell.insert(cell.as_str(), topo.list_tablets(cell).await?);
    }

    let mut report = GraphReport::default();
    for keyspace in keyspaces {
        for shard_name in topo.get_shard_names(keyspace).await? {
            let mut shard_report = GraphReport::default();
            let mut present = Vec::new();
            let master = topo
                .get_shard(keyspace, &shard_name)
                .await?
                .into_inner()
                .master_alias;

            for cell in cells {
                let members: Vec<&Tablet> = tablets_by_cell[cell.as_str()]
                    .iter()
                    .filter(|t| t.is_in_shard(keyspace, &shard_name) && t.role.in_replication_graph())
                    .collect();
                if members.is_empty() {
                    continue;
                }
                present.push(cell.clone());

                let mut links = Vec::new();
                for tablet in members {
                    let parent = if master.as_ref() == Some(&tablet.alias) {
                        None
                    } else if tablet.role == TabletRole::Master || master.is_none() {
                        shard_report.detached.push(tablet.alias.clone());
                        continue;
                    } else {
                        master.clone()
                    };
                    links.push(ReplicationLink {
                        tablet_alias: tablet.alias.clone(),
                        parent,
                    });
                }
                links.sort();
                shard_report.links += links.len();
                topo.update_shard_replication(cell, keyspace, &shard_name, &ShardReplication { links })
                    .await?;
            }

            if !present.is_empty() {
                update_shard_fields(topo, keyspace, &shard_name, retries, |shard| {
                    shard.cells.extend(present.iter().cloned());
                    Ok(())
                })
                .await?;
            }
            debug!(keyspace, shard = %shard_name, cells = ?present, "Rebuilt shard replication from topology");
            shard_report.cells = present;
            report.merge(shard_report);
        }
    }
    info!(links = report.links, "Rebuilt replication graph from topology");
    Ok(report)
}

/// Consistency report for one shard
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationReport {
    pub problems: Vec<String>,
}

impl ValidationReport {
    pub fn is_ok(&self) -> bool {
        self.problems.is_empty()
    }
}

/// Check the exactly-one-master invariant and that every replica has
/// exactly one link to the master. With an agent, live replication
/// sources are compared too.
pub async fn validate_shard(
    topo: &dyn TopologyClient,
    agent: Option<&dyn NodeAgentClient>,
    keyspace: &str,
    shard_name: &str,
    rpc_timeout: Duration,
) -> Result<ValidationReport> {
    let shard = topo.get_shard(keyspace, shard_name).await?.into_inner();
    let members = shard_tablets(topo, keyspace, &shard).await?;
    let mut problems = Vec::new();

    let masters: Vec<&TabletAlias> = members
        .iter()
        .filter(|t| t.role == TabletRole::Master)
        .map(|t| &t.alias)
        .collect();
    let master = shard.master_alias.as_ref();
    match master {
        None => problems.push("shard has no master".to_string()),
        Some(m) if !masters.contains(&m) => {
            problems.push(format!("shard master {m} is not a master tablet of the shard"))
        }
        Some(_) => {}
    }
    if masters.len() > 1 {
        let list: Vec<String> = masters.iter().map(|a| a.to_string()).collect();
        problems.push(format!("more than one master tablet: {}", list.join(", ")));
    }

    let mut seen: HashMap<TabletAlias, usize> = HashMap::new();
    for cell in &shard.cells {
        let graph = topo.get_shard_replication(cell, keyspace, shard_name).await?;
        for link in &graph.links {
            *seen.entry(link.tablet_alias.clone()).or_default() += 1;
            if !members.iter().any(|t| t.alias == link.tablet_alias) {
                problems.push(format!(
                    "replication graph in {cell} has a link for {} which is not in the shard",
                    link.tablet_alias
                ));
                continue;
            }
            match (&link.parent, master) {
                (None, Some(m)) if &link.tablet_alias != m => problems.push(format!(
                    "{} is a replication root but {m} is the master",
                    link.tablet_alias
                )),
                (Some(parent), Some(m)) if parent != m => problems.push(format!(
                    "{} replicates from {parent}, not the master {m}",
                    link.tablet_alias
                )),
                _ => {}
            }
        }
    }
    for tablet in &members {
        match seen.get(&tablet.alias).copied().unwrap_or(0) {
            // spares may sit detached, e.g. a demoted master
            0 if tablet.role == TabletRole::Spare => {}
            0 => problems.push(format!("{} is missing from the replication graph", tablet.alias)),
            1 => {}
            n => problems.push(format!("{} has {n} replication links", tablet.alias)),
        }
    }

    if let (Some(agent), Some(master_alias)) = (agent, master) {
        let master_addr = members
            .iter()
            .find(|t| &t.alias == master_alias)
            .and_then(Tablet::mysql_addr);
        let statuses = fan_out(members.clone(), AgentMethod::GetStatus, rpc_timeout, |tablet| async move {
            agent.get_status(&tablet).await
        })
        .await;
        for failure in &statuses.failures {
            problems.push(failure.error.to_string());
        }
        for (tablet, status) in &statuses.successes {
            if &tablet.alias == master_alias {
                if !status.is_master || status.read_only {
                    problems.push(format!("master {} is not serving writes", tablet.alias));
                }
            } else if tablet.role == TabletRole::Replica && status.replication_source != master_addr {
                problems.push(format!(
                    "{} replicates from {} instead of the master",
                    tablet.alias,
                    status.replication_source.as_deref().unwrap_or("nothing")
                ));
            }
        }
    }

    for problem in &problems {
        warn!(keyspace, shard = shard_name, problem = %problem, "Shard validation problem");
    }
    Ok(ValidationReport { problems })
}

/// Replication position of one tablet
#[derive(Debug, Clone)]
pub struct TabletPosition {
    pub tablet: Tablet,
    pub position: Option<ReplicationPosition>,
    pub error: Option<String>,
}

/// Current positions of every tablet in the shard: the master first, then
/// the most advanced replicas, then tablets that did not answer
pub async fn shard_replication_positions(
    topo: &dyn TopologyClient,
    agent: &dyn NodeAgentClient,
    keyspace: &str,
    shard_name: &str,
    rpc_timeout: Duration,
) -> Result<Vec<TabletPosition>> {
    let shard = topo.get_shard(keyspace, shard_name).await?.into_inner();
    let members = shard_tablets(topo, keyspace, &shard).await?;
    let result = fan_out(
        members,
        AgentMethod::GetReplicationPosition,
        rpc_timeout,
        |tablet| async move { agent.get_replication_position(&tablet).await },
    )
    .await;

    let mut positions: Vec<TabletPosition> = result
        .successes
        .into_iter()
        .map(|(tablet, position)| TabletPosition {
            tablet,
            position: Some(position),
            error: None,
        })
        .collect();
    let is_master = |p: &TabletPosition| shard.master_alias.as_ref() == Some(&p.tablet.alias);
    positions.sort_by(|a, b| {
        is_master(b)
            .cmp(&is_master(a))
            .then_with(|| b.position.cmp(&a.position))
            .then_with(|| a.tablet.alias.cmp(&b.tablet.alias))
    });

    for failure in result.failures {
        let tablet = topo.get_tablet(&failure.tablet).await?.into_inner();
        positions.push(TabletPosition {
            tablet,
            position: None,
            error: Some(failure.error.to_string()),
        });
    }
    Ok(positions)
}
