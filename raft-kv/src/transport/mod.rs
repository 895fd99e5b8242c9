//! The node's view of the network.
//!
//! Two narrow traits keep the node and the wire apart:
//!
//! - [`RpcHandler`] is what a transport calls when a peer's RPC arrives.
//!   The node implements it.
//! - [`PeerSender`] is what the node calls to reach a peer. Transports
//!   implement it.
//!
//! Wiring happens once at startup, so neither side holds a pointer to the
//! other's concrete type.

use futures::future::BoxFuture;
use thiserror::Error;

use crate::NodeId;
use crate::message::{
    AppendEntriesRequest, AppendEntriesResponse, RequestVoteRequest, RequestVoteResponse,
};

pub mod http;
pub mod local;

pub use http::HttpPeerSender;
pub use local::{LocalNetwork, NetworkStats};

/// Failures delivering an RPC. The node treats all of them as transient and
/// retries on its next heartbeat or election round.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("peer {0} is unreachable")]
    Unreachable(NodeId),
    #[error("message to peer {0} was lost")]
    Dropped(NodeId),
    #[error("rpc timed out")]
    Timeout,
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("peer answered with status {0}")]
    Remote(u16),
}

/// Inbound side: handles RPCs addressed to this node.
pub trait RpcHandler: Send + Sync {
    fn handle_request_vote(&self, request: RequestVoteRequest) -> RequestVoteResponse;

    fn handle_append_entries(&self, request: AppendEntriesRequest) -> AppendEntriesResponse;
}

/// Outbound side: delivers RPCs to a peer and returns its reply.
pub trait PeerSender: Send + Sync + 'static {
    fn request_vote(
        &self,
        peer: NodeId,
        request: RequestVoteRequest,
    ) -> BoxFuture<'static, Result<RequestVoteResponse, TransportError>>;

    fn append_entries(
        &self,
        peer: NodeId,
        request: AppendEntriesRequest,
    ) -> BoxFuture<'static, Result<AppendEntriesResponse, TransportError>>;
}
