//! Errors surfaced by the node to its callers.
//!
//! Everything else (lost RPCs, log conflicts between leader and follower) is
//! retried inside the consensus core and never reaches this type.

use thiserror::Error;

use crate::NodeId;
use crate::wal::WalError;

#[derive(Debug, Error)]
pub enum RaftError {
    /// This node cannot serve the request; retry against `leader_id` when
    /// it is known.
    #[error("not leader (leader: {leader_id:?})")]
    NotLeader { leader_id: Option<NodeId> },

    /// The deadline elapsed before the command was applied. It may or may
    /// not have committed.
    #[error("timed out waiting for the command to commit")]
    Timeout,

    /// The WAL failed. The node stops acting as leader and will not campaign.
    #[error("storage failure: {0}")]
    Storage(#[from] WalError),

    /// The node has been stopped.
    #[error("node stopped")]
    Stopped,
}

impl RaftError {
    pub fn not_leader(leader_id: Option<NodeId>) -> Self {
        RaftError::NotLeader { leader_id }
    }

    pub fn leader_hint(&self) -> Option<NodeId> {
        match self {
            RaftError::NotLeader { leader_id } => *leader_id,
            _ => None,
        }
    }
}
