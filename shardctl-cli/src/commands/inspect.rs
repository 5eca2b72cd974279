//! Read-only Commands
//!
//! Records are printed as JSON; `list-tablets` prints one line per tablet.

use super::{print_json, Session};
use anyhow::Result;
use shardctl_core::{Tablet, TabletRole};
use shardctl_topo::TopologyClient;

const NULL: &str = "<null>";

pub async fn get_keyspace(session: &Session, keyspace: &str) -> Result<()> {
    print_json(&session.topo.get_keyspace(keyspace).await?)
}

pub async fn get_shard(session: &Session, keyspace: &str, shard: &str) -> Result<()> {
    print_json(&session.topo.get_shard(keyspace, shard).await?.into_inner())
}

pub async fn get_srv_shard(session: &Session, cell: &str, keyspace: &str, shard: &str) -> Result<()> {
    print_json(&session.topo.get_srv_shard(cell, keyspace, shard).await?)
}

pub async fn get_srv_keyspace(session: &Session, cell: &str, keyspace: &str) -> Result<()> {
    print_json(&session.topo.get_srv_keyspace(cell, keyspace).await?)
}

pub async fn get_shard_replication(
    session: &Session,
    cell: &str,
    keyspace: &str,
    shard: &str,
) -> Result<()> {
    print_json(
        &session
            .topo
            .get_shard_replication(cell, keyspace, shard)
            .await?,
    )
}

pub async fn get_end_points(
    session: &Session,
    cell: &str,
    keyspace: &str,
    shard: &str,
    role: TabletRole,
) -> Result<()> {
    print_json(&session.admin.get_end_points(cell, keyspace, shard, role).await?)
}

pub async fn list_tablets(session: &Session, cell: &str) -> Result<()> {
    for tablet in session.topo.list_tablets(cell).await? {
        println!("{}", tablet_line(&tablet));
    }
    Ok(())
}

/// `alias keyspace shard role addr`, with `<null>` for what is unset
pub fn tablet_line(tablet: &Tablet) -> String {
    format!(
        "{} {} {} {} {}",
        tablet.alias,
        tablet.keyspace.as_deref().unwrap_or(NULL),
        tablet.shard.as_deref().unwrap_or(NULL),
        tablet.role,
        tablet.addr().as_deref().unwrap_or(NULL)
    )
}

pub async fn resolve_shard(
    session: &Session,
    cell: &str,
    keyspace: &str,
    keyspace_id: u64,
    role: TabletRole,
) -> Result<()> {
    let shard = session
        .admin
        .resolve_shard(cell, keyspace, keyspace_id, role)
        .await?;
    println!("{}", shard);
    Ok(())
}
