//! Per-shard mastership state
//!
//! Not persisted: the committed state is implied by the shard record's
//! master field, and `Reparenting` only exists for the duration of one
//! coordinator operation.

use shardctl_core::{Result, Shard, ShardctlError, TabletAlias};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShardState {
    Stable(TabletAlias),
    Reparenting {
        old: Option<TabletAlias>,
        new: TabletAlias,
    },
    Orphaned,
}

impl ShardState {
    /// State implied by a committed shard record
    pub fn of(shard: &Shard) -> Self {
        match &shard.master_alias {
            Some(master) => ShardState::Stable(master.clone()),
            None => ShardState::Orphaned,
        }
    }

    pub fn master(&self) -> Option<&TabletAlias> {
        match self {
            ShardState::Stable(master) => Some(master),
            ShardState::Reparenting { old, .. } => old.as_ref(),
            ShardState::Orphaned => None,
        }
    }

    /// Start moving mastership to `new`
    pub fn begin(&self, new: &TabletAlias) -> Result<ShardState> {
        match self {
            ShardState::Stable(master) if master == new => {
                Err(ShardctlError::NoOpReparent(new.clone()))
            }
            ShardState::Reparenting { new: target, .. } => Err(ShardctlError::Internal(format!(
                "shard is already reparenting to {target}"
            ))),
            _ => Ok(ShardState::Reparenting {
                old: self.master().cloned(),
                new: new.clone(),
            }),
        }
    }

    /// The state after the shard record was committed
    pub fn commit(self) -> Result<ShardState> {
        match self {
            ShardState::Reparenting { new, .. } => Ok(ShardState::Stable(new)),
            other => Err(ShardctlError::Internal(format!(
                "cannot commit shard in state {other}"
            ))),
        }
    }
}

impl fmt::Display for ShardState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShardState::Stable(master) => write!(f, "stable({master})"),
            ShardState::Reparenting { old: Some(old), new } => {
                write!(f, "reparenting({old} -> {new})")
            }
            ShardState::Reparenting { old: None, new } => write!(f, "reparenting(none -> {new})"),
            ShardState::Orphaned => f.write_str("orphaned"),
        }
    }
}
