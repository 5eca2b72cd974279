//! Typed topology server over a versioned backend
//!
//! Layout:
//!
//! ```text
//! keyspaces/{keyspace}
//! keyspaces/{keyspace}/shards/{shard}
//! cells/{cell}/tablets/{uid:010}
//! cells/{cell}/replication/{keyspace}/{shard}
//! cells/{cell}/serving/{keyspace}
//! cells/{cell}/serving/{keyspace}/shards/{shard}
//! locks/{keyspace}/{shard}
//! ```

use crate::backend::{BackendError, TopoBackend};
use crate::client::TopologyClient;
use crate::memory::MemoryBackend;
use crate::sled_backend::SledBackend;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use shardctl_core::{
    Keyspace, Result, Shard, ShardReplication, ShardctlError, SrvKeyspace, SrvShard, Tablet,
    TabletAlias, Version, Versioned,
};
use std::path::Path;
use tracing::{debug, info, warn};

fn keyspace_path(keyspace: &str) -> String {
    format!("keyspaces/{keyspace}")
}

fn shards_dir(keyspace: &str) -> String {
    format!("keyspaces/{keyspace}/shards")
}

fn shard_path(keyspace: &str, shard: &str) -> String {
    format!("keyspaces/{keyspace}/shards/{shard}")
}

fn lock_path(keyspace: &str, shard: &str) -> String {
    format!("locks/{keyspace}/{shard}")
}

fn tablets_dir(cell: &str) -> String {
    format!("cells/{cell}/tablets")
}

fn tablet_path(alias: &TabletAlias) -> String {
    format!("cells/{}/tablets/{:010}", alias.cell, alias.uid)
}

fn replication_path(cell: &str, keyspace: &str, shard: &str) -> String {
    format!("cells/{cell}/replication/{keyspace}/{shard}")
}

fn srv_keyspace_path(cell: &str, keyspace: &str) -> String {
    format!("cells/{cell}/serving/{keyspace}")
}

fn srv_shard_path(cell: &str, keyspace: &str, shard: &str) -> String {
    format!("cells/{cell}/serving/{keyspace}/shards/{shard}")
}

fn require(kind: &str, value: &str) -> Result<()> {
    if value.is_empty() || value.contains('/') {
        return Err(ShardctlError::InvalidArgument(format!(
            "invalid {kind} name: {value:?}"
        )));
    }
    Ok(())
}

/// Topology client backed by a [`TopoBackend`]
pub struct TopoServer<B: TopoBackend> {
    backend: B,
}

impl TopoServer<MemoryBackend> {
    /// Process-local topology (for testing)
    pub fn in_memory() -> Self {
        Self::new(MemoryBackend::new())
    }
}

impl TopoServer<SledBackend> {
    /// Open the durable topology at `path`
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Ok(Self::new(SledBackend::open(path)?))
    }
}

impl<B: TopoBackend> TopoServer<B> {
    pub fn new(backend: B) -> Self {
        Self { backend }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Flush pending writes (call before shutdown)
    pub fn flush(&self) -> Result<()> {
        self.backend.flush()?;
        Ok(())
    }

    fn read<T: DeserializeOwned>(&self, path: &str) -> Result<Versioned<T>> {
        let (data, version) = self
            .backend
            .get(path)?
            .ok_or_else(|| ShardctlError::NotFound(path.to_string()))?;
        let value = serde_json::from_slice(&data)
            .map_err(|e| ShardctlError::operational(path.to_string(), e))?;
        Ok(Versioned::new(value, version))
    }

    fn encode<T: Serialize>(path: &str, value: &T) -> Result<Vec<u8>> {
        serde_json::to_vec(value).map_err(|e| ShardctlError::operational(path.to_string(), e))
    }

    fn create<T: Serialize>(&self, path: &str, value: &T) -> Result<Version> {
        let data = Self::encode(path, value)?;
        let version = self.backend.create(path, data)?;
        debug!(path, "Created topology record");
        Ok(version)
    }

    /// Create at `path`, reporting an existing node as a lost race
    fn claim<T: Serialize>(&self, path: &str, value: &T) -> Result<Version> {
        let data = Self::encode(path, value)?;
        match self.backend.create(path, data) {
            Ok(version) => Ok(version),
            Err(BackendError::NodeExists(_)) => {
                let actual = self
                    .backend
                    .get(path)?
                    .map(|(_, version)| version)
                    .unwrap_or(Version(0));
                Err(ShardctlError::ConcurrentModification {
                    path: path.to_string(),
                    expected: Version(0),
                    actual,
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    fn write<T: Serialize>(&self, path: &str, value: &T, expected: Option<Version>) -> Result<Version> {
        let data = Self::encode(path, value)?;
        Ok(self.backend.update(path, data, expected)?)
    }

    fn exists(&self, path: &str) -> Result<bool> {
        Ok(self.backend.get(path)?.is_some())
    }
}

#[async_trait]
impl<B: TopoBackend> TopologyClient for TopoServer<B> {
    async fn create_keyspace(&self, name: &str, keyspace: &Keyspace) -> Result<()> {
        require("keyspace", name)?;
        self.create(&keyspace_path(name), keyspace)?;
        info!(keyspace = name, "Created keyspace");
        Ok(())
    }

    async fn get_keyspace(&self, name: &str) -> Result<Keyspace> {
        Ok(self.read(&keyspace_path(name))?.into_inner())
    }

    async fn get_keyspace_names(&self) -> Result<Vec<String>> {
        Ok(self.backend.list("keyspaces")?)
    }

    async fn create_shard(&self, keyspace: &str, shard: &Shard) -> Result<()> {
        require("shard", &shard.name)?;
        if !self.exists(&keyspace_path(keyspace))? {
            return Err(ShardctlError::NotFound(keyspace_path(keyspace)));
        }
        self.create(&shard_path(keyspace, &shard.name), shard)?;
        info!(keyspace, shard = %shard.name, "Created shard");
        Ok(())
    }

    async fn get_shard(&self, keyspace: &str, shard: &str) -> Result<Versioned<Shard>> {
        self.read(&shard_path(keyspace, shard))
    }

    async fn update_shard(
        &self,
        keyspace: &str,
        shard: &str,
        expected: Version,
        record: &Shard,
    ) -> Result<Version> {
        if record.name != shard {
            return Err(ShardctlError::InvalidArgument(format!(
                "shard record {} written to {keyspace}/{shard}",
                record.name
            )));
        }
        self.write(&shard_path(keyspace, shard), record, Some(expected))
    }

    async fn get_shard_names(&self, keyspace: &str) -> Result<Vec<String>> {
        if !self.exists(&keyspace_path(keyspace))? {
            return Err(ShardctlError::NotFound(keyspace_path(keyspace)));
        }
        Ok(self.backend.list(&shards_dir(keyspace))?)
    }

    async fn lock_shard(&self, keyspace: &str, shard: &str, holder: &str) -> Result<Version> {
        require("keyspace", keyspace)?;
        require("shard", shard)?;
        let path = lock_path(keyspace, shard);
        match self.claim(&path, &holder) {
            Ok(version) => {
                debug!(keyspace, shard, holder, "Locked shard");
                Ok(version)
            }
            Err(e) => {
                if let Ok(current) = self.read::<String>(&path) {
                    warn!(keyspace, shard, holder = %current.value, "Shard is locked");
                }
                Err(e)
            }
        }
    }

    async fn unlock_shard(&self, keyspace: &str, shard: &str, lock: Version) -> Result<()> {
        self.backend.delete(&lock_path(keyspace, shard), Some(lock))?;
        debug!(keyspace, shard, "Unlocked shard");
        Ok(())
    }

    async fn create_tablet(&self, tablet: &Tablet) -> Result<()> {
        require("cell", &tablet.alias.cell)?;
        self.create(&tablet_path(&tablet.alias), tablet)?;
        info!(tablet = %tablet.alias, role = %tablet.role, "Created tablet");
        Ok(())
    }

    async fn get_tablet(&self, alias: &TabletAlias) -> Result<Versioned<Tablet>> {
        self.read(&tablet_path(alias))
    }

    async fn update_tablet(&self, tablet: &Tablet, expected: Version) -> Result<Version> {
        self.write(&tablet_path(&tablet.alias), tablet, Some(expected))
    }

    async fn delete_tablet(&self, alias: &TabletAlias) -> Result<()> {
        self.backend.delete(&tablet_path(alias), None)?;
        info!(tablet = %alias, "Deleted tablet");
        Ok(())
    }

    async fn list_tablets(&self, cell: &str) -> Result<Vec<Tablet>> {
        let dir = tablets_dir(cell);
        let mut tablets = Vec::new();
        for name in self.backend.list(&dir)? {
            let path = format!("{dir}/{name}");
            match self.read::<Tablet>(&path) {
                Ok(tablet) => tablets.push(tablet.into_inner()),
                // deleted between list and read
                Err(e) if e.is_not_found() => continue,
                Err(e) => return Err(e),
            }
        }
        tablets.sort_by_key(|tablet| tablet.alias.uid);
        Ok(tablets)
    }

    async fn get_known_cells(&self) -> Result<Vec<String>> {
        Ok(self.backend.list("cells")?)
    }

    async fn get_shard_replication(
        &self,
        cell: &str,
        keyspace: &str,
        shard: &str,
    ) -> Result<ShardReplication> {
        match self.read(&replication_path(cell, keyspace, shard)) {
            Ok(record) => Ok(record.into_inner()),
            Err(e) if e.is_not_found() => Ok(ShardReplication::default()),
            Err(e) => Err(e),
        }
    }

    async fn get_versioned_shard_replication(
        &self,
        cell: &str,
        keyspace: &str,
        shard: &str,
    ) -> Result<Option<Versioned<ShardReplication>>> {
        match self.read(&replication_path(cell, keyspace, shard)) {
            Ok(record) => Ok(Some(record)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn update_versioned_shard_replication(
        &self,
        cell: &str,
        keyspace: &str,
        shard: &str,
        expected: Option<Version>,
        replication: &ShardReplication,
    ) -> Result<Version> {
        let path = replication_path(cell, keyspace, shard);
        match expected {
            Some(version) => self.write(&path, replication, Some(version)),
            None => self.claim(&path, replication),
        }
    }

    async fn update_shard_replication(
        &self,
        cell: &str,
        keyspace: &str,
        shard: &str,
        replication: &ShardReplication,
    ) -> Result<()> {
        self.write(&replication_path(cell, keyspace, shard), replication, None)?;
        Ok(())
    }

    async fn get_srv_shard(&self, cell: &str, keyspace: &str, shard: &str) -> Result<SrvShard> {
        Ok(self.read(&srv_shard_path(cell, keyspace, shard))?.into_inner())
    }

    async fn update_srv_shard(
        &self,
        cell: &str,
        keyspace: &str,
        shard: &str,
        srv_shard: &SrvShard,
    ) -> Result<()> {
        self.write(&srv_shard_path(cell, keyspace, shard), srv_shard, None)?;
        Ok(())
    }

    async fn get_srv_keyspace(&self, cell: &str, keyspace: &str) -> Result<SrvKeyspace> {
        Ok(self.read(&srv_keyspace_path(cell, keyspace))?.into_inner())
    }

    async fn update_srv_keyspace(
        &self,
        cell: &str,
        keyspace: &str,
        srv_keyspace: &SrvKeyspace,
    ) -> Result<()> {
        self.write(&srv_keyspace_path(cell, keyspace), srv_keyspace, None)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shardctl_core::{KeyRange, TabletRole};

    #[tokio::test]
    async fn test_shard_compare_and_set() {
        let topo = TopoServer::in_memory();
        topo.create_keyspace("ks", &Keyspace::default()).await.unwrap();
        topo.create_shard("ks", &Shard::new("0", KeyRange::full()))
            .await
            .unwrap();

        let read = topo.get_shard("ks", "0").await.unwrap();
        let mut updated = read.value.clone();
        updated.master_alias = Some(TabletAlias::new("test_nj", 1));
        topo.update_shard("ks", "0", read.version, &updated)
            .await
            .unwrap();

        let err = topo
            .update_shard("ks", "0", read.version, &read.value)
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        let current = topo.get_shard("ks", "0").await.unwrap().into_inner();
        assert_eq!(current.master_alias, Some(TabletAlias::new("test_nj", 1)));
    }

    #[tokio::test]
    async fn test_shard_requires_keyspace() {
        let topo = TopoServer::in_memory();
        let err = topo
            .create_shard("missing", &Shard::new("0", KeyRange::full()))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_malformed_record_is_operational() {
        let topo = TopoServer::in_memory();
        topo.backend()
            .create("keyspaces/ks/shards/0", br#"{"cells":[]}"#.to_vec())
            .unwrap();
        let err = topo.get_shard("ks", "0").await.unwrap_err();
        match err {
            ShardctlError::Operational { context, .. } => {
                assert_eq!(context, "keyspaces/ks/shards/0")
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_list_tablets_sorted_and_cells_known() {
        let topo = TopoServer::in_memory();
        for uid in [62344, 41983] {
            topo.create_tablet(
                &Tablet::new(TabletAlias::new("test_nj", uid), "localhost")
                    .assigned("ks", "0", TabletRole::Replica),
            )
            .await
            .unwrap();
        }
        topo.create_tablet(&Tablet::new(TabletAlias::new("test_ny", 31981), "localhost"))
            .await
            .unwrap();

        let uids: Vec<u32> = topo
            .list_tablets("test_nj")
            .await
            .unwrap()
            .iter()
            .map(|t| t.alias.uid)
            .collect();
        assert_eq!(uids, vec![41983, 62344]);
        assert_eq!(topo.get_known_cells().await.unwrap(), vec!["test_nj", "test_ny"]);

        topo.delete_tablet(&TabletAlias::new("test_nj", 41983))
            .await
            .unwrap();
        assert_eq!(topo.list_tablets("test_nj").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_missing_replication_graph_is_empty() {
        let topo = TopoServer::in_memory();
        let graph = topo
            .get_shard_replication("test_nj", "ks", "0")
            .await
            .unwrap();
        assert!(graph.links.is_empty());
    }

    #[tokio::test]
    async fn test_shard_lock_is_exclusive_until_released() {
        let topo = TopoServer::in_memory();
        let lock = topo.lock_shard("ks", "0", "first").await.unwrap();

        let err = topo.lock_shard("ks", "0", "second").await.unwrap_err();
        assert!(err.is_retryable(), "unexpected error: {err}");
        // other shards are independent
        let other = topo.lock_shard("ks", "80-", "third").await.unwrap();

        topo.unlock_shard("ks", "0", lock).await.unwrap();
        let relocked = topo.lock_shard("ks", "0", "second").await.unwrap();
        assert!(relocked > lock);
        // a released claim cannot release its successor
        assert!(topo.unlock_shard("ks", "0", lock).await.is_err());
        topo.unlock_shard("ks", "0", relocked).await.unwrap();
        topo.unlock_shard("ks", "80-", other).await.unwrap();
    }

    #[tokio::test]
    async fn test_shard_lock_stays_out_of_shard_listing() {
        let topo = TopoServer::in_memory();
        topo.create_keyspace("ks", &Keyspace::default()).await.unwrap();
        topo.create_shard("ks", &Shard::new("0", KeyRange::full()))
            .await
            .unwrap();
        topo.lock_shard("ks", "0", "holder").await.unwrap();

        assert_eq!(topo.get_shard_names("ks").await.unwrap(), vec!["0"]);
        assert_eq!(topo.get_keyspace_names().await.unwrap(), vec!["ks"]);
    }

    #[tokio::test]
    async fn test_versioned_replication_graph_update() {
        let topo = TopoServer::in_memory();
        assert!(topo
            .get_versioned_shard_replication("test_nj", "ks", "0")
            .await
            .unwrap()
            .is_none());

        let graph = ShardReplication::default();
        let v1 = topo
            .update_versioned_shard_replication("test_nj", "ks", "0", None, &graph)
            .await
            .unwrap();
        // a second creator lost the race
        let err = topo
            .update_versioned_shard_replication("test_nj", "ks", "0", None, &graph)
            .await
            .unwrap_err();
        assert!(err.is_retryable());

        topo.update_versioned_shard_replication("test_nj", "ks", "0", Some(v1), &graph)
            .await
            .unwrap();
        let err = topo
            .update_versioned_shard_replication("test_nj", "ks", "0", Some(v1), &graph)
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_rejects_slash_in_names() {
        let topo = TopoServer::in_memory();
        assert!(matches!(
            topo.create_keyspace("a/b", &Keyspace::default()).await,
            Err(ShardctlError::InvalidArgument(_))
        ));
    }
}
