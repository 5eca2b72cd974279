//! shardctl Reparent
//!
//! Changes which tablet is master of a shard and keeps the derived graphs
//! consistent afterwards:
//! - Planned, emergency and externally-initiated reparents
//! - Single-tablet repair and shard bootstrap
//! - Replication graph rebuild and validation
//! - Tablet lifecycle administration

pub mod admin;
pub mod config;
pub mod coordinator;
pub mod fanout;
pub mod replication_graph;
pub mod state;

pub use admin::ClusterAdmin;
pub use config::{ConfigError, ReparentConfig};
pub use coordinator::{ReparentCoordinator, ReparentOutcome};
pub use fanout::{fan_out, FanoutResult, TabletFailure};
pub use replication_graph::{
    rebuild_replication_graph, rebuild_shard_replication, shard_replication_positions,
    validate_shard, GraphReport, LinkHint, TabletPosition, ValidationReport,
};
pub use state::ShardState;
