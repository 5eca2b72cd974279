//! Tablet records
//!
//! A tablet is a managed reference to one replicated database node: its
//! alias, network location, shard assignment and role.

use crate::error::{Result, ShardctlError};
use crate::keyrange::KeyRange;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Named port of the node agent
pub const AGENT_PORT_NAME: &str = "vt";

/// Named port of the database engine
pub const MYSQL_PORT_NAME: &str = "mysql";

/// Globally unique tablet identity: the cell it lives in plus a numeric uid
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TabletAlias {
    pub cell: String,
    pub uid: u32,
}

impl TabletAlias {
    pub fn new(cell: impl Into<String>, uid: u32) -> Self {
        Self {
            cell: cell.into(),
            uid,
        }
    }
}

impl fmt::Display for TabletAlias {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{:010}", self.cell, self.uid)
    }
}

impl FromStr for TabletAlias {
    type Err = ShardctlError;

    fn from_str(s: &str) -> Result<Self> {
        let (cell, uid) = s
            .rsplit_once('-')
            .ok_or_else(|| ShardctlError::InvalidArgument(format!("invalid tablet alias: {s}")))?;
        if cell.is_empty() {
            return Err(ShardctlError::InvalidArgument(format!(
                "tablet alias has no cell: {s}"
            )));
        }
        let uid = uid
            .parse::<u32>()
            .map_err(|e| ShardctlError::InvalidArgument(format!("invalid tablet uid in {s}: {e}")))?;
        Ok(Self::new(cell, uid))
    }
}

/// Role a tablet plays for its shard
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum TabletRole {
    #[default]
    Unknown,
    /// Registered but not assigned to any shard
    Idle,
    Master,
    Replica,
    /// Replicating but not serving traffic
    Spare,
    /// Permanently decommissioned
    Scrap,
}

impl TabletRole {
    pub const ALL: [TabletRole; 6] = [
        TabletRole::Unknown,
        TabletRole::Idle,
        TabletRole::Master,
        TabletRole::Replica,
        TabletRole::Spare,
        TabletRole::Scrap,
    ];

    /// Roles that replicate from the shard master
    pub fn is_slave_type(self) -> bool {
        matches!(self, TabletRole::Replica | TabletRole::Spare)
    }

    /// Roles published as endpoints in the serving graph
    pub fn is_serving(self) -> bool {
        matches!(self, TabletRole::Master | TabletRole::Replica)
    }

    /// Roles that take part in the replication graph of their shard
    pub fn in_replication_graph(self) -> bool {
        matches!(
            self,
            TabletRole::Master | TabletRole::Replica | TabletRole::Spare
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TabletRole::Unknown => "unknown",
            TabletRole::Idle => "idle",
            TabletRole::Master => "master",
            TabletRole::Replica => "replica",
            TabletRole::Spare => "spare",
            TabletRole::Scrap => "scrap",
        }
    }
}

impl fmt::Display for TabletRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TabletRole {
    type Err = ShardctlError;

    fn from_str(s: &str) -> Result<Self> {
        TabletRole::ALL
            .into_iter()
            .find(|role| role.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| ShardctlError::InvalidArgument(format!("unknown tablet role: {s}")))
    }
}

/// Database-level replication position (binlog file index + offset)
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
pub struct ReplicationPosition {
    pub file: u32,
    pub offset: u64,
}

impl ReplicationPosition {
    pub fn new(file: u32, offset: u64) -> Self {
        Self { file, offset }
    }
}

impl fmt::Display for ReplicationPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:06}:{}", self.file, self.offset)
    }
}

impl FromStr for ReplicationPosition {
    type Err = ShardctlError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || ShardctlError::InvalidArgument(format!("invalid replication position: {s}"));
        let (file, offset) = s.split_once(':').ok_or_else(invalid)?;
        Ok(Self {
            file: file.parse().map_err(|_| invalid())?,
            offset: offset.parse().map_err(|_| invalid())?,
        })
    }
}

/// Tablet record as stored in the topology
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tablet {
    pub alias: TabletAlias,
    pub hostname: String,
    #[serde(default)]
    pub port_map: BTreeMap<String, u16>,
    #[serde(default)]
    pub keyspace: Option<String>,
    #[serde(default)]
    pub shard: Option<String>,
    #[serde(default)]
    pub role: TabletRole,
    #[serde(default)]
    pub key_range: Option<KeyRange>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

impl Tablet {
    /// Create an idle, unassigned tablet
    pub fn new(alias: TabletAlias, hostname: impl Into<String>) -> Self {
        Self {
            alias,
            hostname: hostname.into(),
            port_map: BTreeMap::new(),
            keyspace: None,
            shard: None,
            role: TabletRole::Idle,
            key_range: None,
            tags: BTreeMap::new(),
        }
    }

    pub fn with_port(mut self, name: impl Into<String>, port: u16) -> Self {
        self.port_map.insert(name.into(), port);
        self
    }

    pub fn assigned(
        mut self,
        keyspace: impl Into<String>,
        shard: impl Into<String>,
        role: TabletRole,
    ) -> Self {
        self.keyspace = Some(keyspace.into());
        self.shard = Some(shard.into());
        self.role = role;
        self
    }

    /// Address of the node agent
    pub fn addr(&self) -> Option<String> {
        self.port_map
            .get(AGENT_PORT_NAME)
            .map(|port| format!("{}:{}", self.hostname, port))
    }

    /// Address replicas connect to when this tablet is master
    pub fn mysql_addr(&self) -> Option<String> {
        self.port_map
            .get(MYSQL_PORT_NAME)
            .map(|port| format!("{}:{}", self.hostname, port))
    }

    pub fn is_in_shard(&self, keyspace: &str, shard: &str) -> bool {
        self.keyspace.as_deref() == Some(keyspace) && self.shard.as_deref() == Some(shard)
    }

    /// Drop the shard assignment (used when a tablet goes back to idle)
    pub fn clear_assignment(&mut self) {
        self.keyspace = None;
        self.shard = None;
        self.key_range = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alias_display_and_parse() {
        let alias = TabletAlias::new("test_nj", 62344);
        assert_eq!(alias.to_string(), "test_nj-0000062344");
        assert_eq!("test_nj-0000062344".parse::<TabletAlias>().unwrap(), alias);
        // cells may contain dashes themselves
        let dashed: TabletAlias = "us-east-7".parse().unwrap();
        assert_eq!(dashed.cell, "us-east");
        assert_eq!(dashed.uid, 7);
        assert!("nodash".parse::<TabletAlias>().is_err());
        assert!("-12".parse::<TabletAlias>().is_err());
    }

    #[test]
    fn test_role_parse_and_classes() {
        assert_eq!("MASTER".parse::<TabletRole>().unwrap(), TabletRole::Master);
        assert!("primary".parse::<TabletRole>().is_err());
        assert!(TabletRole::Spare.is_slave_type());
        assert!(!TabletRole::Spare.is_serving());
        assert!(TabletRole::Spare.in_replication_graph());
        assert!(!TabletRole::Idle.in_replication_graph());
    }

    #[test]
    fn test_position_ordering() {
        let a = ReplicationPosition::new(3, 900);
        let b = ReplicationPosition::new(4, 10);
        assert!(a < b);
        assert_eq!("000004:10".parse::<ReplicationPosition>().unwrap(), b);
    }

    #[test]
    fn test_tablet_addresses() {
        let tablet = Tablet::new(TabletAlias::new("test_nj", 1), "db1.example")
            .with_port("vt", 15001)
            .with_port("mysql", 3306);
        assert_eq!(tablet.addr().as_deref(), Some("db1.example:15001"));
        assert_eq!(tablet.mysql_addr().as_deref(), Some("db1.example:3306"));
        assert_eq!(tablet.role, TabletRole::Idle);
    }
}
