//! In-process network for running whole clusters inside one process.
//!
//! Nodes register their [`RpcHandler`] under their ID; each node gets a
//! [`LocalSender`] that routes calls straight to the target handler. Links
//! can be cut to simulate crashes and partitions: a call over a cut link
//! fails with [`TransportError::Unreachable`], and a reply is dropped if the
//! link is cut while the call is in flight.
//!
//! The network can also be made unreliable: each call waits a random delay,
//! and with the configured drop rate either the request or the reply is lost
//! ([`TransportError::Dropped`]). A seeded network makes the same choices on
//! every run.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use futures::future::BoxFuture;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::{PeerSender, RpcHandler, TransportError};
use crate::NodeId;
use crate::message::{
    AppendEntriesRequest, AppendEntriesResponse, RequestVoteRequest, RequestVoteResponse,
};

pub struct LocalNetwork {
    state: Mutex<NetworkState>,
}

/// Delivery counters since the network was created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NetworkStats {
    pub delivered: u64,
    pub dropped: u64,
}

struct NetworkState {
    handlers: HashMap<NodeId, Weak<dyn RpcHandler>>,
    isolated: HashSet<NodeId>,
    // Stored with the smaller ID first.
    cut_links: HashSet<(NodeId, NodeId)>,
    drop_rate: f64,
    delay: (Duration, Duration),
    rng: StdRng,
    stats: NetworkStats,
}

/// What happens to one call, decided when it is routed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Fate {
    Deliver,
    LoseRequest,
    LoseReply,
}

impl NetworkState {
    fn new(rng: StdRng) -> Self {
        Self {
            handlers: HashMap::new(),
            isolated: HashSet::new(),
            cut_links: HashSet::new(),
            drop_rate: 0.0,
            delay: (Duration::ZERO, Duration::ZERO),
            rng,
            stats: NetworkStats::default(),
        }
    }

    fn connected(&self, from: NodeId, to: NodeId) -> bool {
        !self.isolated.contains(&from)
            && !self.isolated.contains(&to)
            && !self.cut_links.contains(&link(from, to))
    }

    fn draw_delay(&mut self) -> Duration {
        let (min, max) = self.delay;
        if max <= min {
            return min;
        }
        let micros = self
            .rng
            .gen_range(min.as_micros() as u64..=max.as_micros() as u64);
        Duration::from_micros(micros)
    }

    fn draw_fate(&mut self) -> Fate {
        if self.drop_rate <= 0.0 || !self.rng.gen_bool(self.drop_rate) {
            Fate::Deliver
        } else if self.rng.gen_bool(0.5) {
            Fate::LoseRequest
        } else {
            Fate::LoseReply
        }
    }
}

impl Default for LocalNetwork {
    fn default() -> Self {
        Self {
            state: Mutex::new(NetworkState::new(StdRng::from_entropy())),
        }
    }
}

fn link(a: NodeId, b: NodeId) -> (NodeId, NodeId) {
    if a <= b { (a, b) } else { (b, a) }
}

impl LocalNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// A network whose drops and delays are drawn from a seeded generator.
    pub fn with_seed(seed: u64) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(NetworkState::new(StdRng::seed_from_u64(seed))),
        })
    }

    /// Loses each call with probability `rate`, clamped to `[0, 1]`. A lost
    /// call loses either its request or its reply, with equal odds.
    pub fn set_drop_rate(&self, rate: f64) {
        let rate = if rate.is_nan() { 0.0 } else { rate.clamp(0.0, 1.0) };
        self.state.lock().unwrap().drop_rate = rate;
    }

    /// Delays every call by a uniform draw from `[min, max]`.
    pub fn set_delay(&self, min: Duration, max: Duration) {
        self.state.lock().unwrap().delay = (min, max.max(min));
    }

    pub fn stats(&self) -> NetworkStats {
        self.state.lock().unwrap().stats
    }

    /// Outbound endpoint for node `from`.
    pub fn sender(self: &Arc<Self>, from: NodeId) -> Arc<dyn PeerSender> {
        Arc::new(LocalSender {
            from,
            network: Arc::clone(self),
        })
    }

    /// Makes `handler` reachable as `id`, replacing any previous registration
    /// (a restarted node registers again under the same ID).
    pub fn register(&self, id: NodeId, handler: &Arc<dyn RpcHandler>) {
        let mut state = self.state.lock().unwrap();
        state.handlers.insert(id, Arc::downgrade(handler));
    }

    pub fn unregister(&self, id: NodeId) {
        self.state.lock().unwrap().handlers.remove(&id);
    }

    /// Cuts every link to and from `id`.
    pub fn isolate(&self, id: NodeId) {
        self.state.lock().unwrap().isolated.insert(id);
    }

    /// Restores the links cut by `isolate`.
    pub fn reconnect(&self, id: NodeId) {
        self.state.lock().unwrap().isolated.remove(&id);
    }

    /// Cuts the link between `a` and `b` in both directions.
    pub fn partition(&self, a: NodeId, b: NodeId) {
        self.state.lock().unwrap().cut_links.insert(link(a, b));
    }

    /// Restores every link and makes delivery reliable again.
    pub fn heal(&self) {
        let mut state = self.state.lock().unwrap();
        state.isolated.clear();
        state.cut_links.clear();
        state.drop_rate = 0.0;
        state.delay = (Duration::ZERO, Duration::ZERO);
    }

    fn route(
        &self,
        from: NodeId,
        to: NodeId,
    ) -> Result<(Arc<dyn RpcHandler>, Duration, Fate), TransportError> {
        let mut state = self.state.lock().unwrap();
        if !state.connected(from, to) {
            return Err(TransportError::Unreachable(to));
        }
        let handler = state
            .handlers
            .get(&to)
            .and_then(Weak::upgrade)
            .ok_or(TransportError::Unreachable(to))?;
        let delay = state.draw_delay();
        let fate = state.draw_fate();
        Ok((handler, delay, fate))
    }

    fn record(&self, delivered: bool) {
        let mut state = self.state.lock().unwrap();
        if delivered {
            state.stats.delivered += 1;
        } else {
            state.stats.dropped += 1;
        }
    }

    fn ensure_connected(&self, from: NodeId, to: NodeId) -> Result<(), TransportError> {
        if self.state.lock().unwrap().connected(from, to) {
            Ok(())
        } else {
            Err(TransportError::Unreachable(to))
        }
    }
}

pub struct LocalSender {
    from: NodeId,
    network: Arc<LocalNetwork>,
}

impl LocalSender {
    fn call<Req, Resp, F>(
        &self,
        to: NodeId,
        request: Req,
        handle: F,
    ) -> BoxFuture<'static, Result<Resp, TransportError>>
    where
        Req: Send + 'static,
        Resp: Send + 'static,
        F: FnOnce(&dyn RpcHandler, Req) -> Resp + Send + 'static,
    {
        let from = self.from;
        let network = Arc::clone(&self.network);
        Box::pin(async move {
            let (handler, delay, fate) = network.route(from, to)?;
            // Never run the peer's handler inline with the caller's poll.
            if delay.is_zero() {
                tokio::task::yield_now().await;
            } else {
                tokio::time::sleep(delay).await;
            }
            if fate == Fate::LoseRequest {
                network.record(false);
                return Err(TransportError::Dropped(to));
            }
            let response = handle(handler.as_ref(), request);
            network.ensure_connected(from, to)?;
            if fate == Fate::LoseReply {
                network.record(false);
                return Err(TransportError::Dropped(to));
            }
            network.record(true);
            Ok(response)
        })
    }
}

impl PeerSender for LocalSender {
    fn request_vote(
        &self,
        peer: NodeId,
        request: RequestVoteRequest,
    ) -> BoxFuture<'static, Result<RequestVoteResponse, TransportError>> {
        self.call(peer, request, |handler, req| handler.handle_request_vote(req))
    }

    fn append_entries(
        &self,
        peer: NodeId,
        request: AppendEntriesRequest,
    ) -> BoxFuture<'static, Result<AppendEntriesResponse, TransportError>> {
        self.call(peer, request, |handler, req| {
            handler.handle_append_entries(req)
        })
    }
}
