//! Graph Commands
//!
//! Rebuilds of the serving and replication graphs, shard validation and
//! replication positions.

use super::Session;
use crate::symbols;
use anyhow::{bail, Result};
use console::style;
use shardctl_reparent::GraphReport;

pub async fn rebuild_shard_graph(session: &Session, keyspace: &str, shard: &str) -> Result<()> {
    let record = session.admin.rebuild_shard_graph(keyspace, shard).await?;
    let cells: Vec<&str> = record.cells.iter().map(String::as_str).collect();
    println!(
        "{} Rebuilt serving graph of {}/{} in cells: {}",
        style(symbols::CHECK).green(),
        keyspace,
        shard,
        cells.join(",")
    );
    Ok(())
}

pub async fn rebuild_keyspace_graph(session: &Session, keyspace: &str) -> Result<()> {
    let cells = session.admin.rebuild_keyspace_graph(keyspace).await?;
    println!(
        "{} Rebuilt serving graph of {} in cells: {}",
        style(symbols::CHECK).green(),
        keyspace,
        cells.join(",")
    );
    Ok(())
}

pub async fn rebuild_replication_graph(
    session: &Session,
    cells: &[String],
    keyspaces: &[String],
) -> Result<()> {
    if cells.is_empty() || keyspaces.is_empty() {
        bail!("rebuild-replication-graph needs at least one cell and one keyspace");
    }
    let report = session
        .admin
        .rebuild_replication_graph(cells, keyspaces)
        .await?;
    print_graph_report(&report);
    Ok(())
}

pub fn print_graph_report(report: &GraphReport) {
    println!(
        "{} Wrote {} replication links in cells: {}",
        style(symbols::CHECK).green(),
        report.links,
        report.cells.join(",")
    );
    for alias in &report.detached {
        println!(
            "  {} {} is not replicating from the shard",
            style(symbols::WARN).yellow(),
            alias
        );
    }
}

/// Report shard problems; any problem makes the command fail
pub async fn validate_shard(
    session: &Session,
    keyspace: &str,
    shard: &str,
    ping_tablets: bool,
) -> Result<()> {
    let report = session
        .admin
        .validate_shard(keyspace, shard, ping_tablets)
        .await?;

    if report.is_ok() {
        println!("{} {}/{} is consistent", style(symbols::CHECK).green(), keyspace, shard);
        return Ok(());
    }
    for problem in &report.problems {
        println!("{} {}", style(symbols::CROSS).red(), problem);
    }
    bail!(
        "{}/{} has {} problem(s)",
        keyspace,
        shard,
        report.problems.len()
    );
}

pub async fn shard_replication_positions(
    session: &Session,
    keyspace: &str,
    shard: &str,
) -> Result<()> {
    let positions = session
        .admin
        .shard_replication_positions(keyspace, shard)
        .await?;

    for entry in positions {
        let position = match (&entry.position, &entry.error) {
            (Some(position), _) => position.to_string(),
            (None, Some(error)) => format!("{} {}", style("error:").red(), error),
            (None, None) => "<null>".to_string(),
        };
        println!("{} {} {}", entry.tablet.alias, entry.tablet.role, position);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::testing::{alias, shard, KEYSPACE};
    use shardctl_core::{ReplicationLink, ShardReplication};
    use shardctl_topo::TopologyClient;

    #[tokio::test]
    async fn test_validate_healthy_shard() {
        let (session, _agent) = shard(&[2, 3]).await;
        validate_shard(&session, KEYSPACE, "0", true).await.unwrap();
    }

    #[tokio::test]
    async fn test_validate_fails_on_missing_link() {
        let (session, _agent) = shard(&[2, 3]).await;
        let replication = ShardReplication {
            links: vec![
                ReplicationLink {
                    tablet_alias: alias(1),
                    parent: None,
                },
                ReplicationLink {
                    tablet_alias: alias(2),
                    parent: Some(alias(1)),
                },
            ],
        };
        session
            .topo
            .update_shard_replication("test_nj", KEYSPACE, "0", &replication)
            .await
            .unwrap();

        let err = validate_shard(&session, KEYSPACE, "0", false).await.unwrap_err();
        assert!(err.to_string().contains("1 problem(s)"));

        rebuild_replication_graph(&session, &["test_nj".into()], &[KEYSPACE.into()])
            .await
            .unwrap();
        validate_shard(&session, KEYSPACE, "0", false).await.unwrap();
    }

    #[tokio::test]
    async fn test_rebuild_replication_graph_needs_targets() {
        let (session, _agent) = shard(&[2]).await;
        assert!(rebuild_replication_graph(&session, &[], &[KEYSPACE.into()])
            .await
            .is_err());
    }
}
