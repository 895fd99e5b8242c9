//! Replicated key-value store on a Raft-style consensus core.
//!
//! A cluster of nodes agrees on an ordered log of commands and applies it, in
//! order, to a deterministic state machine. Each node persists its term, vote
//! and log entries to a write-ahead log before acknowledging them, so a
//! restarted node rejoins with exactly what it promised.
//!
//! # Architecture
//!
//! - **Consensus core** ([`node`]): election, replication and commit rules
//!   behind one mutex, driven by tokio tasks: an election timer, one
//!   replication worker per peer while leading, and an apply loop.
//! - **Durability** ([`wal`], [`log`]): checksummed records fsynced
//!   before use, with local snapshot compaction.
//! - **Boundaries** ([`store`], [`transport`]): the node only needs a
//!   [`store::StateMachine`] and a [`transport::PeerSender`]; it exposes a
//!   [`transport::RpcHandler`] for inbound RPCs.
//! - **Surfaces** ([`server`], `raft-kv-node` binary): HTTP client API and
//!   peer endpoints.
//!
//! # Modules
//!
//! - [`command`]: Commands replicated through the log
//! - [`config`]: Node configuration and validation
//! - [`error`]: Errors returned to callers of the node
//! - [`message`]: RequestVote / AppendEntries payloads
//! - [`server`]: axum router for clients and peers

pub mod command;
pub mod config;
pub mod error;
pub mod log;
pub mod message;
pub mod node;
pub mod server;
pub mod store;
pub mod transport;
pub mod wal;

/// Cluster-unique node identifier.
pub type NodeId = u64;

pub use command::{Command, CommandOutput};
pub use config::NodeConfig;
pub use error::RaftError;
pub use node::{Node, NodeStatus, Role};
pub use store::{KvStore, StateMachine};
