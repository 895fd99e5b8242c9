//! The running node: timers, replication workers and the apply loop wrapped
//! around the synchronous core in [`state`].
//!
//! Every task locks the core briefly to decide what to do, releases the lock,
//! does its network I/O, and locks again to fold the result back in. No lock
//! is held across an `.await`.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{Context, Result};
use futures::StreamExt;
use futures::stream::FuturesUnordered;
use serde::Serialize;
use tokio::sync::Notify;
use tokio::task::JoinSet;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::NodeId;
use crate::command::{Command, CommandOutput};
use crate::config::NodeConfig;
use crate::error::RaftError;
use crate::log::LogEntry;
use crate::message::{
    AppendEntriesRequest, AppendEntriesResponse, RequestVoteRequest, RequestVoteResponse,
};
use crate::store::StateMachine;
use crate::transport::{PeerSender, RpcHandler};
use crate::wal::Wal;

mod state;

pub use state::Role;

use state::{RaftState, SentAppend};

/// Point-in-time view of a node, as served on `/status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeStatus {
    pub id: NodeId,
    pub role: Role,
    pub term: u64,
    pub is_leader: bool,
    pub leader_id: Option<NodeId>,
    pub commit_index: u64,
    pub last_applied: u64,
    pub last_log_index: u64,
    /// Last index covered by the local snapshot, 0 if none.
    pub snapshot_index: u64,
    pub cluster_size: usize,
}

/// Handle to a running node. Cheap to clone; all clones drive the same node.
#[derive(Clone)]
pub struct Node {
    shared: Arc<Shared>,
}

struct Shared {
    config: NodeConfig,
    state: Mutex<RaftState>,
    state_machine: Mutex<Box<dyn StateMachine>>,
    sender: Arc<dyn PeerSender>,
    apply_notify: Notify,
    replicate_notify: HashMap<NodeId, Notify>,
    tasks: Mutex<JoinSet<()>>,
}

impl Node {
    /// Recovers durable state from `config.wal_path` and starts the node's
    /// background tasks. Must be called inside a tokio runtime.
    ///
    /// The node starts as a follower. Peers reach it through
    /// [`Node::rpc_handler`], which the caller registers with its transport.
    pub fn start(
        config: NodeConfig,
        mut state_machine: Box<dyn StateMachine>,
        sender: Arc<dyn PeerSender>,
    ) -> Result<Self> {
        config.validate()?;
        let mut wal = Wal::open(&config.wal_path)
            .with_context(|| format!("failed to open wal at {}", config.wal_path.display()))?;
        let recovered = wal.recover().context("failed to recover wal")?;
        if let Some(snapshot) = &recovered.snapshot {
            state_machine
                .restore(&snapshot.data)
                .context("failed to restore state machine from snapshot")?;
        }
        info!(
            node = config.id,
            term = recovered.hard_state.term,
            voted_for = ?recovered.hard_state.voted_for,
            snapshot_index = recovered.snapshot.as_ref().map_or(0, |s| s.last_included_index),
            entries = recovered.entries.len(),
            "recovered from wal"
        );

        let state = RaftState::new(&config, wal, recovered);
        let replicate_notify = config
            .peers
            .iter()
            .map(|&peer| (peer, Notify::new()))
            .collect();
        let shared = Arc::new(Shared {
            config,
            state: Mutex::new(state),
            state_machine: Mutex::new(state_machine),
            sender,
            apply_notify: Notify::new(),
            replicate_notify,
            tasks: Mutex::new(JoinSet::new()),
        });

        shared.spawn(run_election_timer(Arc::clone(&shared)));
        shared.spawn(run_apply_loop(Arc::clone(&shared)));
        Ok(Self { shared })
    }

    /// Inbound endpoint for this node's peers.
    pub fn rpc_handler(&self) -> Arc<dyn RpcHandler> {
        self.shared.clone()
    }

    pub fn id(&self) -> NodeId {
        self.shared.config.id
    }

    /// Replicates `command` and waits until it is applied, for at most the
    /// configured proposal timeout.
    ///
    /// There is no deduplication: after [`RaftError::Timeout`] or a
    /// [`RaftError::NotLeader`] raised while waiting, the command may or may
    /// not have been applied, and a retry may apply it twice.
    pub async fn submit(&self, command: Command) -> Result<CommandOutput, RaftError> {
        self.submit_with_timeout(command, self.shared.config.proposal_timeout)
            .await
    }

    /// Like [`Node::submit`] with an explicit deadline. Dropping the returned
    /// future detaches the caller; the entry still replicates.
    pub async fn submit_with_timeout(
        &self,
        command: Command,
        timeout: Duration,
    ) -> Result<CommandOutput, RaftError> {
        let (index, waiter) = self.shared.lock_state().propose(command)?;
        debug!(node = self.id(), index, "proposed entry");
        self.shared.apply_notify.notify_one();
        self.shared.kick_replication();

        match time::timeout(timeout, waiter).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(RaftError::Stopped),
            Err(_) => {
                debug!(node = self.id(), index, "proposal timed out");
                Err(RaftError::Timeout)
            }
        }
    }

    /// Linearizable read: commits a no-op to confirm leadership, then reads
    /// the state machine, which by then reflects every earlier write.
    pub async fn read(&self, key: &str) -> Result<Option<String>, RaftError> {
        self.submit(Command::NoOp).await?;
        Ok(self.shared.lock_state_machine().get(key))
    }

    /// `(current_term, is_leader)`.
    pub fn get_state(&self) -> (u64, bool) {
        let state = self.shared.lock_state();
        (state.current_term(), state.is_leader())
    }

    pub fn is_leader(&self) -> bool {
        self.shared.lock_state().is_leader()
    }

    pub fn leader_id(&self) -> Option<NodeId> {
        self.shared.lock_state().leader_id()
    }

    pub fn commit_index(&self) -> u64 {
        self.shared.lock_state().commit_index()
    }

    pub fn cluster_size(&self) -> usize {
        self.shared.config.cluster_size()
    }

    pub fn status(&self) -> NodeStatus {
        let state = self.shared.lock_state();
        NodeStatus {
            id: state.id(),
            role: state.role(),
            term: state.current_term(),
            is_leader: state.is_leader(),
            leader_id: state.leader_id(),
            commit_index: state.commit_index(),
            last_applied: state.last_applied(),
            last_log_index: state.log().last_index(),
            snapshot_index: state.log().snapshot_index(),
            cluster_size: self.shared.config.cluster_size(),
        }
    }

    /// Copies of the entries held in memory, from just past the snapshot to
    /// the last index. The tail may not be committed yet.
    pub fn log_entries(&self) -> Vec<LogEntry> {
        self.shared.lock_state().log().entries_from(0, usize::MAX)
    }

    /// Runs `f` against the state machine while the apply loop is held off.
    pub fn with_state_machine<R>(&self, f: impl FnOnce(&dyn StateMachine) -> R) -> R {
        let state_machine = self.shared.lock_state_machine();
        f(&**state_machine)
    }

    /// Stops every background task, fails pending proposals with
    /// [`RaftError::Stopped`] and closes the WAL. Idempotent.
    pub async fn stop(&self) -> Result<(), RaftError> {
        let closed = self.shared.lock_state().stop();
        let mut tasks = std::mem::take(&mut *self.shared.lock_tasks());
        tasks.shutdown().await;
        info!(node = self.id(), "node stopped");
        closed.map_err(RaftError::from)
    }
}

impl Shared {
    fn lock_state(&self) -> MutexGuard<'_, RaftState> {
        self.state.lock().unwrap()
    }

    fn lock_state_machine(&self) -> MutexGuard<'_, Box<dyn StateMachine>> {
        self.state_machine.lock().unwrap()
    }

    fn lock_tasks(&self) -> MutexGuard<'_, JoinSet<()>> {
        self.tasks.lock().unwrap()
    }

    fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.lock_tasks().spawn(task);
    }

    fn kick_replication(&self) {
        for notify in self.replicate_notify.values() {
            notify.notify_one();
        }
    }

    /// Starts one replication worker per peer for `term`. They exit on
    /// their own once this node leaves that term or role.
    fn on_elected(self: &Arc<Self>, term: u64) {
        for &peer in &self.config.peers {
            self.spawn(run_replication(Arc::clone(self), peer, term));
        }
        // A single-node cluster committed its no-op already.
        self.apply_notify.notify_one();
    }

    /// Applies everything committed, in order. Once the log outgrows the
    /// snapshot threshold, application pauses at the compaction target so
    /// the state machine's image is taken at exactly that index.
    fn apply_committed(&self) {
        loop {
            let (mut entries, target) = {
                let state = self.lock_state();
                (
                    state.committed_unapplied(),
                    state.compaction_target(self.config.snapshot_threshold),
                )
            };
            if let Some(target) = target {
                entries.retain(|entry| entry.index <= target);
                if entries.is_empty() {
                    if self.compact_at(target) {
                        continue;
                    }
                    break;
                }
            }
            if entries.is_empty() {
                break;
            }
            let outputs: Vec<CommandOutput> = {
                let mut state_machine = self.lock_state_machine();
                entries
                    .iter()
                    .map(|entry| state_machine.apply(&entry.command))
                    .collect()
            };
            let mut state = self.lock_state();
            if state.is_stopped() {
                return;
            }
            for (entry, output) in entries.iter().zip(outputs) {
                state.mark_applied(entry, output);
            }
        }
    }

    /// Snapshots the state machine, which the apply loop left at `index`, and
    /// compacts the log up to it. Returns whether the log now starts there.
    fn compact_at(&self, index: u64) -> bool {
        let snapshot = self.lock_state_machine().snapshot();
        let data = match snapshot {
            Ok(data) => data,
            Err(err) => {
                warn!(node = self.config.id, index, error = ?err, "state machine snapshot failed");
                return false;
            }
        };
        let mut state = self.lock_state();
        if let Err(err) = state.compact(index, data) {
            error!(node = self.config.id, index, error = %err, "log compaction failed");
            return false;
        }
        state.log().snapshot_index() == index
    }
}

/// What the apply loop acts on: new commits and a higher compaction floor.
fn apply_mark(state: &RaftState) -> (u64, u64) {
    (state.commit_index(), state.compaction_floor())
}

impl RpcHandler for Shared {
    fn handle_request_vote(&self, request: RequestVoteRequest) -> RequestVoteResponse {
        self.lock_state()
            .handle_request_vote(&request, Instant::now())
    }

    fn handle_append_entries(&self, request: AppendEntriesRequest) -> AppendEntriesResponse {
        let (response, advanced) = {
            let mut state = self.lock_state();
            let before = apply_mark(&state);
            let response = state.handle_append_entries(request, Instant::now());
            (response, apply_mark(&state) != before)
        };
        if advanced {
            self.apply_notify.notify_one();
        }
        response
    }
}

async fn run_election_timer(shared: Arc<Shared>) {
    loop {
        let deadline = {
            let state = shared.lock_state();
            if state.is_stopped() {
                return;
            }
            state.election_deadline()
        };
        time::sleep_until(deadline).await;

        let now = Instant::now();
        let request = {
            let mut state = shared.lock_state();
            if now < state.election_deadline() {
                // Reset by a heartbeat or vote while we slept.
                continue;
            }
            if state.is_leader() {
                state.reset_election_deadline(now);
                continue;
            }
            match state.start_election(now) {
                Some(request) => (request, state.is_leader()),
                None => {
                    state.reset_election_deadline(now);
                    continue;
                }
            }
        };

        match request {
            (request, true) => shared.on_elected(request.term),
            (request, false) => shared.spawn(run_campaign(Arc::clone(&shared), request)),
        }
    }
}

/// Sends one round of vote requests and counts replies until the election
/// is won, lost, or superseded.
async fn run_campaign(shared: Arc<Shared>, request: RequestVoteRequest) {
    let rpc_timeout = shared.config.rpc_timeout;
    let mut replies: FuturesUnordered<_> = shared
        .config
        .peers
        .iter()
        .map(|&peer| {
            let call = shared.sender.request_vote(peer, request.clone());
            async move { (peer, time::timeout(rpc_timeout, call).await) }
        })
        .collect();

    while let Some((peer, result)) = replies.next().await {
        let response = match result {
            Ok(Ok(response)) => response,
            Ok(Err(err)) => {
                debug!(node = shared.config.id, peer, error = %err, "vote request failed");
                continue;
            }
            Err(_) => {
                debug!(node = shared.config.id, peer, "vote request timed out");
                continue;
            }
        };

        let mut state = shared.lock_state();
        if state.handle_vote_response(peer, request.term, &response) {
            drop(state);
            shared.on_elected(request.term);
            return;
        }
        if state.role() != Role::Candidate || state.current_term() != request.term {
            return;
        }
    }
}

/// Keeps `peer` in sync while this node leads `term`: a heartbeat every
/// interval, and an immediate send whenever new entries are proposed.
async fn run_replication(shared: Arc<Shared>, peer: NodeId, term: u64) {
    let Some(notify) = shared.replicate_notify.get(&peer) else {
        return;
    };
    let rpc_timeout = shared.config.rpc_timeout;
    let mut heartbeat = time::interval(shared.config.heartbeat_interval);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = heartbeat.tick() => {}
            _ = notify.notified() => {}
        }

        loop {
            let request = {
                let mut state = shared.lock_state();
                if !state.is_leader() || state.current_term() != term {
                    debug!(node = shared.config.id, peer, term, "replication worker exiting");
                    return;
                }
                match state.build_append_entries(peer) {
                    Some(request) => request,
                    None => return,
                }
            };
            let sent = SentAppend::of(&request);

            let call = shared.sender.append_entries(peer, request);
            let response = match time::timeout(rpc_timeout, call).await {
                Ok(Ok(response)) => response,
                Ok(Err(err)) => {
                    debug!(node = shared.config.id, peer, error = %err, "append entries failed");
                    break;
                }
                Err(_) => {
                    debug!(node = shared.config.id, peer, "append entries timed out");
                    break;
                }
            };

            let (more, advanced) = {
                let mut state = shared.lock_state();
                let before = apply_mark(&state);
                let more = state.handle_append_response(peer, sent, &response);
                (more, apply_mark(&state) != before)
            };
            if advanced {
                shared.apply_notify.notify_one();
            }
            if !more {
                break;
            }
        }
    }
}

async fn run_apply_loop(shared: Arc<Shared>) {
    loop {
        shared.apply_notify.notified().await;
        if shared.lock_state().is_stopped() {
            return;
        }
        shared.apply_committed();
    }
}
