//! shardctl Core Library
//!
//! Core abstractions for managing a sharded, replicated database cluster.
//! This crate provides:
//! - Typed topology records (tablets, keyspaces, shards, replication and serving graphs)
//! - Key ranges over packed keyspace ids
//! - The keyspace partitioning model used to route a keyspace id to its shard
//! - Serving graph derivation
//! - Common error handling

pub mod error;
pub mod keyrange;
pub mod keyspace;
pub mod records;
pub mod serving;
pub mod tablet;

pub use error::{BoxError, Result, ShardctlError};
pub use keyrange::{pack_keyspace_id, KeyRange};
pub use keyspace::KeyspaceModel;
pub use records::{
    EndPoint, Keyspace, KeyspacePartition, ReplicationLink, Shard, ShardReference,
    ShardReplication, ShardingColumnType, SrvKeyspace, SrvShard, Version, Versioned,
};
pub use serving::{derive_srv_keyspace, derive_srv_shard};
pub use tablet::{ReplicationPosition, Tablet, TabletAlias, TabletRole};

/// Default cell used when none is configured
pub const DEFAULT_CELL: &str = "test_nj";
