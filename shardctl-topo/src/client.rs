//! Topology client trait
//!
//! The typed view of the topology store used by everything above it.
//! Records are validated here, so a missing or malformed field surfaces as
//! one `Operational` error carrying the record path.

use async_trait::async_trait;
use shardctl_core::{
    derive_srv_keyspace, derive_srv_shard, Keyspace, Result, Shard, ShardReplication,
    ShardctlError, SrvKeyspace, SrvShard, Tablet, TabletAlias, Version, Versioned,
};
use tracing::{debug, info};

#[async_trait]
pub trait TopologyClient: Send + Sync {
    // ===== Keyspaces =====

    async fn create_keyspace(&self, name: &str, keyspace: &Keyspace) -> Result<()>;

    async fn get_keyspace(&self, name: &str) -> Result<Keyspace>;

    async fn get_keyspace_names(&self) -> Result<Vec<String>>;

    // ===== Shards =====

    async fn create_shard(&self, keyspace: &str, shard: &Shard) -> Result<()>;

    async fn get_shard(&self, keyspace: &str, shard: &str) -> Result<Versioned<Shard>>;

    /// Compare-and-set write of a shard record. A writer that read an older
    /// version gets `ConcurrentModification` and must re-read.
    async fn update_shard(
        &self,
        keyspace: &str,
        shard: &str,
        expected: Version,
        record: &Shard,
    ) -> Result<Version>;

    async fn get_shard_names(&self, keyspace: &str) -> Result<Vec<String>>;

    /// Claim a shard for one mastership change. While the claim is held a
    /// second `lock_shard` fails with `ConcurrentModification`. The shard
    /// record itself is not touched.
    async fn lock_shard(&self, keyspace: &str, shard: &str, holder: &str) -> Result<Version>;

    /// Release a claim returned by `lock_shard`
    async fn unlock_shard(&self, keyspace: &str, shard: &str, lock: Version) -> Result<()>;

    // ===== Tablets =====

    async fn create_tablet(&self, tablet: &Tablet) -> Result<()>;

    async fn get_tablet(&self, alias: &TabletAlias) -> Result<Versioned<Tablet>>;

    async fn update_tablet(&self, tablet: &Tablet, expected: Version) -> Result<Version>;

    async fn delete_tablet(&self, alias: &TabletAlias) -> Result<()>;

    /// Every tablet registered in `cell`, ordered by uid
    async fn list_tablets(&self, cell: &str) -> Result<Vec<Tablet>>;

    async fn get_known_cells(&self) -> Result<Vec<String>>;

    // ===== Replication graph =====

    /// Links of a shard in one cell; a shard never rebuilt there has none
    async fn get_shard_replication(
        &self,
        cell: &str,
        keyspace: &str,
        shard: &str,
    ) -> Result<ShardReplication>;

    /// Links of a shard in one cell with their version, `None` if never written
    async fn get_versioned_shard_replication(
        &self,
        cell: &str,
        keyspace: &str,
        shard: &str,
    ) -> Result<Option<Versioned<ShardReplication>>>;

    /// Compare-and-set of the link set. `expected` of `None` creates the
    /// record and loses to a concurrent creator.
    async fn update_versioned_shard_replication(
        &self,
        cell: &str,
        keyspace: &str,
        shard: &str,
        expected: Option<Version>,
        replication: &ShardReplication,
    ) -> Result<Version>;

    /// Replace the link set wholesale
    async fn update_shard_replication(
        &self,
        cell: &str,
        keyspace: &str,
        shard: &str,
        replication: &ShardReplication,
    ) -> Result<()>;

    // ===== Serving graph =====

    async fn get_srv_shard(&self, cell: &str, keyspace: &str, shard: &str) -> Result<SrvShard>;

    async fn update_srv_shard(
        &self,
        cell: &str,
        keyspace: &str,
        shard: &str,
        srv_shard: &SrvShard,
    ) -> Result<()>;

    async fn get_srv_keyspace(&self, cell: &str, keyspace: &str) -> Result<SrvKeyspace>;

    async fn update_srv_keyspace(
        &self,
        cell: &str,
        keyspace: &str,
        srv_keyspace: &SrvKeyspace,
    ) -> Result<()>;

    /// Recompute the serving graph of `keyspace` in `cell` from the committed
    /// shard and tablet records. Shard entries are written before the
    /// keyspace entry that references them.
    async fn rebuild_serving_graph(&self, keyspace: &str, cell: &str) -> Result<()> {
        let keyspace_record = self.get_keyspace(keyspace).await?;
        let tablets = self.list_tablets(cell).await?;

        let mut shards = Vec::new();
        for name in self.get_shard_names(keyspace).await? {
            shards.push(self.get_shard(keyspace, &name).await?.into_inner());
        }

        for shard in shards.iter().filter(|shard| shard.cells.contains(cell)) {
            let srv_shard = derive_srv_shard(keyspace, shard, &tablets, cell);
            self.update_srv_shard(cell, keyspace, &shard.name, &srv_shard)
                .await?;
            debug!(keyspace, shard = %shard.name, cell, "Rebuilt serving shard");
        }

        let srv_keyspace = derive_srv_keyspace(&keyspace_record, &shards);
        self.update_srv_keyspace(cell, keyspace, &srv_keyspace)
            .await?;
        info!(keyspace, cell, shards = shards.len(), "Rebuilt serving graph");
        Ok(())
    }
}

/// Read-modify-write of a tablet record, retrying lost races up to `retries` times
pub async fn update_tablet_fields<F>(
    topo: &dyn TopologyClient,
    alias: &TabletAlias,
    retries: u32,
    mut update: F,
) -> Result<Tablet>
where
    F: FnMut(&mut Tablet) -> Result<()> + Send,
{
    let mut attempt = 0;
    loop {
        let Versioned { mut value, version } = topo.get_tablet(alias).await?;
        update(&mut value)?;
        match topo.update_tablet(&value, version).await {
            Ok(_) => return Ok(value),
            Err(e) if e.is_retryable() && attempt < retries => {
                attempt += 1;
                debug!(tablet = %alias, attempt, "Tablet record changed underneath, retrying");
            }
            Err(e) => return Err(e),
        }
    }
}

/// Read-modify-write of a shard record, retrying lost races up to `retries` times
pub async fn update_shard_fields<F>(
    topo: &dyn TopologyClient,
    keyspace: &str,
    shard: &str,
    retries: u32,
    mut update: F,
) -> Result<Shard>
where
    F: FnMut(&mut Shard) -> Result<()> + Send,
{
    let mut attempt = 0;
    loop {
        let Versioned { mut value, version } = topo.get_shard(keyspace, shard).await?;
        update(&mut value)?;
        match topo.update_shard(keyspace, shard, version, &value).await {
            Ok(_) => return Ok(value),
            Err(e) if e.is_retryable() && attempt < retries => {
                attempt += 1;
                debug!(keyspace, shard, attempt, "Shard record changed underneath, retrying");
            }
            Err(e) => return Err(e),
        }
    }
}

/// Read-modify-write of one cell's replication graph of a shard, retrying
/// lost races up to `retries` times
pub async fn update_shard_replication_fields<F>(
    topo: &dyn TopologyClient,
    cell: &str,
    keyspace: &str,
    shard: &str,
    retries: u32,
    mut update: F,
) -> Result<ShardReplication>
where
    F: FnMut(&mut ShardReplication) -> Result<()> + Send,
{
    let mut attempt = 0;
    loop {
        let (mut value, version) = match topo
            .get_versioned_shard_replication(cell, keyspace, shard)
            .await?
        {
            Some(Versioned { value, version }) => (value, Some(version)),
            None => (ShardReplication::default(), None),
        };
        update(&mut value)?;
        match topo
            .update_versioned_shard_replication(cell, keyspace, shard, version, &value)
            .await
        {
            Ok(_) => return Ok(value),
            Err(e) if e.is_retryable() && attempt < retries => {
                attempt += 1;
                debug!(cell, keyspace, shard, attempt, "Replication graph changed underneath, retrying");
            }
            Err(e) => return Err(e),
        }
    }
}

/// Load the keyspace model of `name` as served in `cell`
pub async fn read_keyspace(
    topo: &dyn TopologyClient,
    cell: &str,
    name: &str,
) -> Result<shardctl_core::KeyspaceModel> {
    let record = match topo.get_srv_keyspace(cell, name).await {
        Ok(record) => Some(record),
        Err(e) if e.is_not_found() => None,
        Err(e @ ShardctlError::Operational { .. }) => return Err(e),
        Err(e) => return Err(ShardctlError::operational(format!("keyspace {name}"), e)),
    };
    shardctl_core::KeyspaceModel::load(name, record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::TopoBackend;
    use crate::server::TopoServer;
    use shardctl_core::ReplicationLink;

    fn link(uid: u32) -> ReplicationLink {
        ReplicationLink {
            tablet_alias: TabletAlias::new("test_nj", uid),
            parent: None,
        }
    }

    #[tokio::test]
    async fn test_replication_update_keeps_concurrent_link() {
        let topo = TopoServer::in_memory();
        let mut attempts = 0;

        let graph = update_shard_replication_fields(&topo, "test_nj", "ks", "0", 3, |graph| {
            attempts += 1;
            if attempts == 1 {
                // another registration lands between this read and write
                let other = ShardReplication {
                    links: vec![link(2)],
                };
                topo.backend()
                    .update(
                        "cells/test_nj/replication/ks/0",
                        serde_json::to_vec(&other).unwrap(),
                        None,
                    )
                    .unwrap();
            }
            graph.links.push(link(1));
            graph.links.sort();
            Ok(())
        })
        .await
        .unwrap();

        assert_eq!(attempts, 2);
        assert_eq!(graph.links, vec![link(1), link(2)]);
        let stored = topo
            .get_shard_replication("test_nj", "ks", "0")
            .await
            .unwrap();
        assert_eq!(stored.links, graph.links);
    }
}
