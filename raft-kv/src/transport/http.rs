//! JSON-over-HTTP transport between peers.
//!
//! The server half lives in [`crate::server`], which mounts the two RPC
//! routes next to the client API.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result};
use futures::future::{self, BoxFuture};
use serde::Serialize;
use serde::de::DeserializeOwned;

use super::{PeerSender, TransportError};
use crate::NodeId;
use crate::message::{
    AppendEntriesRequest, AppendEntriesResponse, RequestVoteRequest, RequestVoteResponse,
};

pub const REQUEST_VOTE_PATH: &str = "/raft/request-vote";
pub const APPEND_ENTRIES_PATH: &str = "/raft/append-entries";

/// Sends RPCs to peers at fixed `host:port` addresses.
#[derive(Clone)]
pub struct HttpPeerSender {
    client: reqwest::Client,
    addrs: HashMap<NodeId, String>,
}

impl HttpPeerSender {
    /// `addrs` maps each peer ID to its `host:port`. Every request is
    /// abandoned after `timeout`.
    pub fn new(addrs: HashMap<NodeId, String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build http client")?;
        Ok(Self { client, addrs })
    }

    fn post<Req, Resp>(
        &self,
        peer: NodeId,
        path: &'static str,
        request: Req,
    ) -> BoxFuture<'static, Result<Resp, TransportError>>
    where
        Req: Serialize + Send + 'static,
        Resp: DeserializeOwned + Send + 'static,
    {
        let Some(addr) = self.addrs.get(&peer) else {
            return Box::pin(future::ready(Err(TransportError::Unreachable(peer))));
        };
        let url = format!("http://{addr}{path}");
        let client = self.client.clone();
        Box::pin(async move {
            let response = client
                .post(&url)
                .json(&request)
                .send()
                .await
                .map_err(classify)?;
            let status = response.status();
            if !status.is_success() {
                return Err(TransportError::Remote(status.as_u16()));
            }
            response.json::<Resp>().await.map_err(classify)
        })
    }
}

fn classify(err: reqwest::Error) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout
    } else {
        TransportError::Http(err)
    }
}

impl PeerSender for HttpPeerSender {
    fn request_vote(
        &self,
        peer: NodeId,
        request: RequestVoteRequest,
    ) -> BoxFuture<'static, Result<RequestVoteResponse, TransportError>> {
        self.post(peer, REQUEST_VOTE_PATH, request)
    }

    fn append_entries(
        &self,
        peer: NodeId,
        request: AppendEntriesRequest,
    ) -> BoxFuture<'static, Result<AppendEntriesResponse, TransportError>> {
        self.post(peer, APPEND_ENTRIES_PATH, request)
    }
}
