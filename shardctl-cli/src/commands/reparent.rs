//! Reparent Commands
//!
//! Planned, emergency and external reparents, shard bootstrap and
//! single-tablet repair.

use super::Session;
use crate::symbols;
use anyhow::{bail, Result};
use console::style;
use shardctl_core::TabletAlias;
use shardctl_reparent::ReparentOutcome;

/// Which reparent protocol to run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReparentKind {
    Planned,
    Emergency,
    External,
    InitMaster { force: bool },
}

/// Reparent configuration
pub struct ReparentArgs {
    pub keyspace: String,
    pub shard: String,
    pub new_master: TabletAlias,
    pub kind: ReparentKind,
}

/// Run a reparent and report its outcome. Fails after the commit when any
/// replica could not be rewired.
pub async fn run(session: &Session, args: ReparentArgs) -> Result<()> {
    let coordinator = &session.coordinator;
    let (keyspace, shard, alias) = (&args.keyspace, &args.shard, &args.new_master);

    let outcome = match args.kind {
        ReparentKind::Planned => coordinator.planned_reparent(keyspace, shard, alias).await?,
        ReparentKind::Emergency => coordinator.emergency_reparent(keyspace, shard, alias).await?,
        ReparentKind::External => coordinator.externally_reparented(keyspace, shard, alias).await?,
        ReparentKind::InitMaster { force } => {
            coordinator
                .init_shard_master(keyspace, shard, alias, force)
                .await?
        }
    };

    report(&outcome)
}

fn report(outcome: &ReparentOutcome) -> Result<()> {
    let old = outcome
        .old_master
        .as_ref()
        .map(ToString::to_string)
        .unwrap_or_else(|| "<null>".to_string());
    println!(
        "{} {}/{}: {} {} {} at {}",
        style(symbols::CHECK).green(),
        outcome.keyspace,
        outcome.shard,
        old,
        symbols::ARROW,
        style(&outcome.new_master).bold(),
        outcome.position
    );

    for alias in &outcome.rewired {
        println!("  {} {}", style("rewired").dim(), alias);
    }
    for alias in &outcome.graph.stale {
        println!(
            "  {} {} did not answer, replication graph entry kept",
            style(symbols::WARN).yellow(),
            alias
        );
    }
    for failure in &outcome.failures {
        println!(
            "  {} {}: {}",
            style(symbols::CROSS).red(),
            failure.tablet,
            failure.error
        );
    }

    if !outcome.is_complete() {
        bail!(
            "Mastership moved to {} but {} tablet(s) failed to follow; repair them with reparent-tablet",
            outcome.new_master,
            outcome.failures.len()
        );
    }
    Ok(())
}

/// Point one tablet at the current shard master
pub async fn reparent_tablet(session: &Session, alias: &TabletAlias) -> Result<()> {
    let position = session.coordinator.reparent_tablet(alias).await?;
    println!(
        "{} {} now replicates from the shard master (master position {})",
        style(symbols::CHECK).green(),
        alias,
        position
    );
    println!("Run start-replication to resume replication");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::testing::{alias, shard, KEYSPACE};
    use shardctl_agent::{AgentMethod, Fault};
    use shardctl_topo::TopologyClient;

    fn args(uid: u32, kind: ReparentKind) -> ReparentArgs {
        ReparentArgs {
            keyspace: KEYSPACE.to_string(),
            shard: "0".to_string(),
            new_master: alias(uid),
            kind,
        }
    }

    #[tokio::test]
    async fn test_planned_reparent_succeeds() {
        let (session, _agent) = shard(&[2, 3]).await;

        run(&session, args(2, ReparentKind::Planned)).await.unwrap();

        let shard = session.topo.get_shard(KEYSPACE, "0").await.unwrap().into_inner();
        assert_eq!(shard.master_alias, Some(alias(2)));
    }

    #[tokio::test]
    async fn test_replica_failure_fails_after_commit() {
        let (session, agent) = shard(&[2, 3]).await;
        agent.inject(&alias(3), Some(AgentMethod::SetMaster), Fault::Error("disk full".into()));

        let err = run(&session, args(2, ReparentKind::Planned)).await.unwrap_err();
        assert!(err.to_string().contains("1 tablet(s) failed"));

        let shard = session.topo.get_shard(KEYSPACE, "0").await.unwrap().into_inner();
        assert_eq!(shard.master_alias, Some(alias(2)));
    }

    #[tokio::test]
    async fn test_init_master_requires_force() {
        let (session, _agent) = shard(&[2]).await;

        let err = run(&session, args(2, ReparentKind::InitMaster { force: false }))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("force"));
    }
}
