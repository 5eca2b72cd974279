//! Topology records
//!
//! These structs are the typed form of everything the topology store holds:
//! keyspaces, shards, per-cell replication graphs and the derived serving
//! graph. Required fields are enforced by serde at the store boundary.

use crate::keyrange::KeyRange;
use crate::tablet::{TabletAlias, TabletRole};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Store-assigned record version used for compare-and-set updates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Version(pub u64);

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A record together with the version it was read at
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Versioned<T> {
    pub value: T,
    pub version: Version,
}

impl<T> Versioned<T> {
    pub fn new(value: T, version: Version) -> Self {
        Self { value, version }
    }

    pub fn into_inner(self) -> T {
        self.value
    }
}

/// Type of the column rows are sharded by
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShardingColumnType {
    #[default]
    Unset,
    Uint64,
    Bytes,
}

impl std::str::FromStr for ShardingColumnType {
    type Err = crate::ShardctlError;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "" | "unset" => Ok(Self::Unset),
            "uint64" => Ok(Self::Uint64),
            "bytes" => Ok(Self::Bytes),
            other => Err(crate::ShardctlError::InvalidArgument(format!(
                "unknown sharding column type: {other}"
            ))),
        }
    }
}

/// Keyspace record
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Keyspace {
    #[serde(default)]
    pub sharding_column_name: String,
    #[serde(default)]
    pub sharding_column_type: ShardingColumnType,
    /// Roles redirected to another keyspace during a migration
    #[serde(default)]
    pub served_from: BTreeMap<TabletRole, String>,
}

/// Shard record. Replicas are derived from tablet records, never stored here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Shard {
    pub name: String,
    #[serde(default)]
    pub master_alias: Option<TabletAlias>,
    #[serde(default)]
    pub key_range: KeyRange,
    /// Cells in which this shard has at least one tablet
    #[serde(default)]
    pub cells: BTreeSet<String>,
}

impl Shard {
    pub fn new(name: impl Into<String>, key_range: KeyRange) -> Self {
        Self {
            name: name.into(),
            master_alias: None,
            key_range,
            cells: BTreeSet::new(),
        }
    }

    /// Cell that owns the master, if any
    pub fn master_cell(&self) -> Option<&str> {
        self.master_alias.as_ref().map(|alias| alias.cell.as_str())
    }
}

/// "tablet replicates from parent"; the master is a root link with no parent
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ReplicationLink {
    pub tablet_alias: TabletAlias,
    #[serde(default)]
    pub parent: Option<TabletAlias>,
}

/// Per-cell replication graph of one shard
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ShardReplication {
    #[serde(default)]
    pub links: Vec<ReplicationLink>,
}

impl ShardReplication {
    pub fn link_for(&self, alias: &TabletAlias) -> Option<&ReplicationLink> {
        self.links.iter().find(|link| &link.tablet_alias == alias)
    }
}

/// One serving address
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndPoint {
    pub uid: u32,
    pub host: String,
    #[serde(default)]
    pub named_port_map: BTreeMap<String, u16>,
}

/// Per-cell serving record of a shard, derived from topology
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SrvShard {
    pub name: String,
    #[serde(default)]
    pub key_range: KeyRange,
    #[serde(default)]
    pub master_cell: Option<String>,
    #[serde(default)]
    pub endpoints: BTreeMap<TabletRole, Vec<EndPoint>>,
}

impl SrvShard {
    pub fn endpoints_for(&self, role: TabletRole) -> &[EndPoint] {
        self.endpoints.get(&role).map(Vec::as_slice).unwrap_or(&[])
    }
}

/// Reference to one shard inside a partitioning
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardReference {
    pub name: String,
    #[serde(default)]
    pub key_range: KeyRange,
}

/// Ordered shard references serving one role
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct KeyspacePartition {
    #[serde(default)]
    pub shard_references: Vec<ShardReference>,
}

/// Per-cell serving record of a keyspace
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SrvKeyspace {
    #[serde(default)]
    pub partitions: BTreeMap<TabletRole, KeyspacePartition>,
    #[serde(default)]
    pub sharding_column_name: String,
    #[serde(default)]
    pub sharding_column_type: ShardingColumnType,
    #[serde(default)]
    pub served_from: BTreeMap<TabletRole, String>,
}

impl SrvKeyspace {
    /// A record with nothing in it is treated like a missing one
    pub fn is_empty(&self) -> bool {
        self.partitions.is_empty()
            && self.sharding_column_name.is_empty()
            && self.served_from.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_srv_keyspace_role_keys_serialize_lowercase() {
        let mut srv = SrvKeyspace::default();
        srv.partitions.insert(
            TabletRole::Master,
            KeyspacePartition {
                shard_references: vec![ShardReference {
                    name: "0".into(),
                    key_range: KeyRange::full(),
                }],
            },
        );
        let json = serde_json::to_value(&srv).unwrap();
        assert!(json["partitions"]["master"].is_object());
        let back: SrvKeyspace = serde_json::from_value(json).unwrap();
        assert_eq!(back, srv);
    }

    #[test]
    fn test_shard_requires_name() {
        let missing: Result<Shard, _> = serde_json::from_str(r#"{"cells":["test_nj"]}"#);
        assert!(missing.is_err());
        let ok: Shard = serde_json::from_str(r#"{"name":"0"}"#).unwrap();
        assert!(ok.master_alias.is_none());
        assert!(ok.key_range.is_full());
    }
}
