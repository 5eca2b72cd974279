//! Node agent client trait
//!
//! One agent runs next to every database node and executes local
//! replication commands on behalf of the coordinator.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use shardctl_core::{ReplicationPosition, ShardctlError, Tablet, TabletAlias};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Agent call errors
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("tablet has no agent address")]
    NoAddress,

    #[error("unreachable: {0}")]
    Unreachable(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("remote error: {0}")]
    Remote(String),

    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

impl AgentError {
    /// Attach the method and tablet this failure happened on
    pub fn into_rpc(self, method: AgentMethod, tablet: &TabletAlias) -> ShardctlError {
        ShardctlError::Rpc {
            method: method.as_str(),
            tablet: tablet.clone(),
            cause: self.to_string(),
        }
    }
}

pub type AgentResult<T> = std::result::Result<T, AgentError>;

/// Agent RPC methods
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AgentMethod {
    GetReplicationPosition,
    DemoteMaster,
    PromoteSlave,
    SetMaster,
    GetStatus,
    TabletExternallyReparented,
    WaitForPosition,
    StartReplication,
    StopReplication,
    Scrap,
}

impl AgentMethod {
    pub fn name(self) -> &'static str {
        match self {
            AgentMethod::GetReplicationPosition => "GetReplicationPosition",
            AgentMethod::DemoteMaster => "DemoteMaster",
            AgentMethod::PromoteSlave => "PromoteSlave",
            AgentMethod::SetMaster => "SetMaster",
            AgentMethod::GetStatus => "GetStatus",
            AgentMethod::TabletExternallyReparented => "TabletExternallyReparented",
            AgentMethod::WaitForPosition => "WaitForPosition",
            AgentMethod::StartReplication => "StartReplication",
            AgentMethod::StopReplication => "StopReplication",
            AgentMethod::Scrap => "Scrap",
        }
    }

    /// Qualified name used in error messages
    pub fn as_str(self) -> &'static str {
        match self {
            AgentMethod::GetReplicationPosition => "TabletManager.GetReplicationPosition",
            AgentMethod::DemoteMaster => "TabletManager.DemoteMaster",
            AgentMethod::PromoteSlave => "TabletManager.PromoteSlave",
            AgentMethod::SetMaster => "TabletManager.SetMaster",
            AgentMethod::GetStatus => "TabletManager.GetStatus",
            AgentMethod::TabletExternallyReparented => "TabletManager.TabletExternallyReparented",
            AgentMethod::WaitForPosition => "TabletManager.WaitForPosition",
            AgentMethod::StartReplication => "TabletManager.StartReplication",
            AgentMethod::StopReplication => "TabletManager.StopReplication",
            AgentMethod::Scrap => "TabletManager.Scrap",
        }
    }
}

impl fmt::Display for AgentMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Live replication state reported by a node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TabletStatus {
    pub is_master: bool,
    pub read_only: bool,
    /// Database address this node replicates from
    #[serde(default)]
    pub replication_source: Option<String>,
    #[serde(default)]
    pub replication_running: bool,
    pub position: ReplicationPosition,
}

#[async_trait]
pub trait NodeAgentClient: Send + Sync {
    async fn get_replication_position(&self, tablet: &Tablet) -> AgentResult<ReplicationPosition>;

    /// Stop accepting writes and report the final position
    async fn demote_master(
        &self,
        tablet: &Tablet,
        timeout: Duration,
    ) -> AgentResult<ReplicationPosition>;

    /// Stop replicating and become writable
    async fn promote_slave(&self, tablet: &Tablet) -> AgentResult<ReplicationPosition>;

    /// Point replication at `master_addr`, optionally starting it
    async fn set_master(
        &self,
        tablet: &Tablet,
        master_addr: &str,
        position: ReplicationPosition,
        start_replication: bool,
    ) -> AgentResult<()>;

    async fn get_status(&self, tablet: &Tablet) -> AgentResult<TabletStatus>;

    async fn tablet_externally_reparented(&self, tablet: &Tablet) -> AgentResult<()>;

    /// Block until the node has applied `position`
    async fn wait_for_position(
        &self,
        tablet: &Tablet,
        position: ReplicationPosition,
        timeout: Duration,
    ) -> AgentResult<ReplicationPosition>;

    async fn start_replication(&self, tablet: &Tablet) -> AgentResult<()>;

    async fn stop_replication(&self, tablet: &Tablet) -> AgentResult<()>;

    async fn scrap(&self, tablet: &Tablet) -> AgentResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_into_rpc_message() {
        let err = AgentError::Unreachable("connection refused".into())
            .into_rpc(AgentMethod::SetMaster, &TabletAlias::new("test_nj", 41983));
        assert_eq!(
            err.to_string(),
            "TabletManager.SetMaster on test_nj-0000041983 error: unreachable: connection refused"
        );
    }
}
