//! Concurrent agent calls
//!
//! One independent call per tablet, each under its own timeout. Failures
//! are collected next to the successes rather than short-circuiting.

use futures::future::join_all;
use shardctl_agent::{AgentError, AgentMethod, AgentResult};
use shardctl_core::{Result, ShardctlError, Tablet, TabletAlias};
use std::future::Future;
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tracing::{debug, warn};

/// A call that failed on one tablet
#[derive(Debug)]
pub struct TabletFailure {
    pub tablet: TabletAlias,
    pub error: ShardctlError,
}

/// Aggregated fan-out result
#[derive(Debug)]
pub struct FanoutResult<T> {
    pub successes: Vec<(Tablet, T)>,
    pub failures: Vec<TabletFailure>,
    pub total_latency_ms: u64,
}

impl<T> FanoutResult<T> {
    pub fn success_count(&self) -> usize {
        self.successes.len()
    }

    pub fn failure_count(&self) -> usize {
        self.failures.len()
    }

    /// Result for one tablet, if it answered
    pub fn get(&self, alias: &TabletAlias) -> Option<&T> {
        self.successes
            .iter()
            .find(|(tablet, _)| &tablet.alias == alias)
            .map(|(_, value)| value)
    }
}

/// Run one agent call under `limit`, naming the method and tablet on failure
pub async fn call<T, Fut>(method: AgentMethod, tablet: &TabletAlias, limit: Duration, fut: Fut) -> Result<T>
where
    Fut: Future<Output = AgentResult<T>>,
{
    match timeout(limit, fut).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(e.into_rpc(method, tablet)),
        Err(_) => Err(AgentError::Timeout(limit).into_rpc(method, tablet)),
    }
}

/// Issue `op` against every tablet concurrently
pub async fn fan_out<F, Fut, T>(
    tablets: Vec<Tablet>,
    method: AgentMethod,
    per_call: Duration,
    op: F,
) -> FanoutResult<T>
where
    F: Fn(Tablet) -> Fut,
    Fut: Future<Output = AgentResult<T>>,
{
    let start = Instant::now();
    debug!(tablets = tablets.len(), %method, "Starting fan-out");

    let futures: Vec<_> = tablets
        .into_iter()
        .map(|tablet| {
            let fut = op(tablet.clone());
            async move {
                let result = call(method, &tablet.alias, per_call, fut).await;
                (tablet, result)
            }
        })
        .collect();

    let mut successes = Vec::new();
    let mut failures = Vec::new();
    for (tablet, result) in join_all(futures).await {
        match result {
            Ok(value) => successes.push((tablet, value)),
            Err(error) => {
                warn!(tablet = %tablet.alias, %method, error = %error, "Tablet call failed");
                failures.push(TabletFailure {
                    tablet: tablet.alias,
                    error,
                });
            }
        }
    }

    FanoutResult {
        successes,
        failures,
        total_latency_ms: start.elapsed().as_millis() as u64,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shardctl_agent::{Fault, FakeNodeAgent, NodeAgentClient};
    use shardctl_core::ReplicationPosition;
    use std::sync::Arc;

    fn tablet(uid: u32) -> Tablet {
        Tablet::new(TabletAlias::new("test_nj", uid), "localhost").with_port("mysql", 3306)
    }

    #[tokio::test]
    async fn test_failures_do_not_block_others() {
        let agent = Arc::new(FakeNodeAgent::new());
        let tablets: Vec<Tablet> = (1..=3).map(tablet).collect();
        for t in &tablets {
            agent.add_master(t, ReplicationPosition::new(1, u64::from(t.alias.uid)));
        }
        agent.inject(&tablets[1].alias, None, Fault::Hang);
        agent.inject(&tablets[2].alias, None, Fault::Error("boom".into()));

        let result = fan_out(
            tablets.clone(),
            AgentMethod::GetReplicationPosition,
            Duration::from_millis(50),
            |t| {
                let agent = agent.clone();
                async move { agent.get_replication_position(&t).await }
            },
        )
        .await;

        assert_eq!(result.success_count(), 1);
        assert_eq!(result.failure_count(), 2);
        assert_eq!(
            result.get(&tablets[0].alias),
            Some(&ReplicationPosition::new(1, 1))
        );
        let messages: Vec<String> = result.failures.iter().map(|f| f.error.to_string()).collect();
        assert!(messages.iter().any(|m| m.contains("timed out")));
        assert!(messages.iter().any(|m| m.contains("boom")));
    }

    #[tokio::test]
    async fn test_call_names_method_and_tablet() {
        let agent = FakeNodeAgent::new();
        let t = tablet(41983);
        agent.add_master(&t, ReplicationPosition::default());
        agent.inject(&t.alias, None, Fault::Unreachable);
        let err = call(
            AgentMethod::SetMaster,
            &t.alias,
            Duration::from_secs(1),
            agent.set_master(&t, "localhost:3306", ReplicationPosition::default(), true),
        )
        .await
        .unwrap_err();
        assert!(err
            .to_string()
            .starts_with("TabletManager.SetMaster on test_nj-0000041983 error"));
    }
}
