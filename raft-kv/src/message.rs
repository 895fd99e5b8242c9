//! Peer-to-peer RPC payloads.
//!
//! These are the only messages nodes exchange. Any wire protocol can carry
//! them; the crate ships JSON over HTTP and an in-process network.

use serde::{Deserialize, Serialize};

use crate::NodeId;
use crate::log::LogEntry;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestVoteRequest {
    pub term: u64,
    pub candidate_id: NodeId,
    pub last_log_index: u64,
    pub last_log_term: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestVoteResponse {
    pub term: u64,
    pub vote_granted: bool,
}

/// Replicates `entries` after `(prev_log_index, prev_log_term)`. With no
/// entries it serves as a heartbeat that still carries `leader_commit`.
///
/// `compaction_floor` is the highest committed index the leader knows every
/// member holds. No node compacts its log past it, so any member can later
/// bring any other up to date from its log alone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntriesRequest {
    pub term: u64,
    pub leader_id: NodeId,
    pub prev_log_index: u64,
    pub prev_log_term: u64,
    pub entries: Vec<LogEntry>,
    pub leader_commit: u64,
    #[serde(default)]
    pub compaction_floor: u64,
}

/// Reply to an append.
///
/// On rejection the follower fills in a hint so the leader can skip a whole
/// conflicting term instead of probing one index at a time:
/// - log too short: `conflict_term = None`, `conflict_index = last_index + 1`
/// - term mismatch at `prev_log_index`: `conflict_term` is the follower's
///   term there and `conflict_index` the first index holding that term
///
/// On success `match_index` is the last index known to match the leader.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    pub term: u64,
    pub success: bool,
    pub match_index: u64,
    pub conflict_index: u64,
    pub conflict_term: Option<u64>,
}
