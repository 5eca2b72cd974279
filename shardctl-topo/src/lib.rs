//! shardctl Topology
//!
//! Durable store of keyspace, shard, tablet, replication graph and serving
//! graph records. The store is opened explicitly and passed around as a
//! [`TopologyClient`]; there is no process-wide topology state.
//!
//! # Usage
//!
//! ```ignore
//! use shardctl_topo::{TopoServer, TopologyClient};
//!
//! let topo = TopoServer::open("/var/lib/shardctl/topo")?;
//! let shard = topo.get_shard("test_keyspace", "0").await?;
//! topo.rebuild_serving_graph("test_keyspace", "test_nj").await?;
//! topo.flush()?;
//! ```

pub mod backend;
pub mod client;
pub mod memory;
pub mod server;
pub mod sled_backend;

pub use backend::{BackendError, TopoBackend};
pub use client::{
    read_keyspace, update_shard_fields, update_shard_replication_fields, update_tablet_fields,
    TopologyClient,
};
pub use memory::MemoryBackend;
pub use server::TopoServer;
pub use sled_backend::SledBackend;

/// Topology over the in-memory backend
pub type MemoryTopo = TopoServer<MemoryBackend>;

/// Topology over the sled backend
pub type SledTopo = TopoServer<SledBackend>;
