//! Synchronous consensus core.
//!
//! `RaftState` holds everything the node protects with its single lock:
//! term, vote, role, the log and its WAL, commit/apply indices, per-peer
//! replication progress, and the callers waiting on proposed entries. All
//! methods run to completion without awaiting, so the async layer can call
//! them while holding the lock and do its network I/O outside it.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::slice;
use std::time::Duration;

use rand::Rng;
use serde::Serialize;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::NodeId;
use crate::command::{Command, CommandOutput};
use crate::config::NodeConfig;
use crate::error::RaftError;
use crate::log::{LogEntry, RaftLog};
use crate::message::{
    AppendEntriesRequest, AppendEntriesResponse, RequestVoteRequest, RequestVoteResponse,
};
use crate::wal::{HardState, RecoveredState, Snapshot, Wal, WalError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Follower,
    Candidate,
    Leader,
}

/// Leader's view of one follower.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    /// Next entry to send
    pub next_index: u64,
    /// Highest entry known to be replicated
    pub match_index: u64,
    /// Set once we have warned that the follower needs compacted entries
    lagging: bool,
}

pub(crate) type Waiter = oneshot::Receiver<Result<CommandOutput, RaftError>>;

struct Pending {
    term: u64,
    tx: oneshot::Sender<Result<CommandOutput, RaftError>>,
}

/// What the leader sent, kept to interpret the reply.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SentAppend {
    pub term: u64,
    pub prev_log_index: u64,
    pub entries: u64,
}

impl SentAppend {
    pub fn of(request: &AppendEntriesRequest) -> Self {
        Self {
            term: request.term,
            prev_log_index: request.prev_log_index,
            entries: request.entries.len() as u64,
        }
    }
}

pub(crate) struct RaftState {
    id: NodeId,
    peers: Vec<NodeId>,
    election_timeout: (Duration, Duration),
    max_entries_per_append: usize,

    role: Role,
    current_term: u64,
    voted_for: Option<NodeId>,
    leader_id: Option<NodeId>,
    log: RaftLog,
    commit_index: u64,
    last_applied: u64,
    compaction_floor: u64,

    progress: HashMap<NodeId, Progress>,
    votes: HashSet<NodeId>,
    election_deadline: Instant,

    wal: Wal,
    pending: BTreeMap<u64, Pending>,
    storage_failed: bool,
    stopped: bool,
}

impl RaftState {
    /// Builds the state from what the WAL recovered. The caller restores the
    /// state machine from `recovered.snapshot`, which is why commit and apply
    /// start at the snapshot boundary.
    pub fn new(config: &NodeConfig, wal: Wal, recovered: RecoveredState) -> Self {
        let (snapshot_index, snapshot_term) = recovered
            .snapshot
            .as_ref()
            .map_or((0, 0), |s| (s.last_included_index, s.last_included_term));
        let mut state = Self {
            id: config.id,
            peers: config.peers.clone(),
            election_timeout: (config.election_timeout_min, config.election_timeout_max),
            max_entries_per_append: config.max_entries_per_append,
            role: Role::Follower,
            current_term: recovered.hard_state.term,
            voted_for: recovered.hard_state.voted_for,
            leader_id: None,
            log: RaftLog::restore(snapshot_index, snapshot_term, recovered.entries),
            commit_index: snapshot_index,
            last_applied: snapshot_index,
            compaction_floor: snapshot_index,
            progress: HashMap::new(),
            votes: HashSet::new(),
            election_deadline: Instant::now(),
            wal,
            pending: BTreeMap::new(),
            storage_failed: false,
            stopped: false,
        };
        state.reset_election_deadline(Instant::now());
        state
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    #[cfg(test)]
    pub fn peers(&self) -> &[NodeId] {
        &self.peers
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn is_leader(&self) -> bool {
        self.role == Role::Leader
    }

    pub fn current_term(&self) -> u64 {
        self.current_term
    }

    #[cfg(test)]
    pub fn voted_for(&self) -> Option<NodeId> {
        self.voted_for
    }

    pub fn leader_id(&self) -> Option<NodeId> {
        self.leader_id
    }

    pub fn log(&self) -> &RaftLog {
        &self.log
    }

    pub fn commit_index(&self) -> u64 {
        self.commit_index
    }

    pub fn last_applied(&self) -> u64 {
        self.last_applied
    }

    /// Highest committed index every member is known to hold.
    pub fn compaction_floor(&self) -> u64 {
        self.compaction_floor
    }

    pub fn election_deadline(&self) -> Instant {
        self.election_deadline
    }

    #[cfg(test)]
    pub fn storage_failed(&self) -> bool {
        self.storage_failed
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    #[cfg(test)]
    pub fn progress(&self, peer: NodeId) -> Option<Progress> {
        self.progress.get(&peer).copied()
    }

    /// Votes (or acknowledgements) needed out of the whole cluster.
    pub fn quorum(&self) -> usize {
        (self.peers.len() + 1) / 2 + 1
    }

    pub fn reset_election_deadline(&mut self, now: Instant) {
        let (min, max) = self.election_timeout;
        let min_ms = min.as_millis() as u64;
        let max_ms = max.as_millis() as u64;
        let timeout = Duration::from_millis(rand::thread_rng().gen_range(min_ms..=max_ms));
        self.election_deadline = now + timeout;
    }

    fn hard_state(&self) -> HardState {
        HardState {
            term: self.current_term,
            voted_for: self.voted_for,
        }
    }

    fn persist_hard_state(&mut self) -> Result<(), WalError> {
        let hard_state = self.hard_state();
        match self.wal.save_hard_state(hard_state) {
            Ok(()) => Ok(()),
            Err(err) => {
                self.fail_storage(&err);
                Err(err)
            }
        }
    }

    /// Fences the node after a WAL failure: it stops leading, and from now
    /// on never campaigns, votes, or acknowledges entries.
    fn fail_storage(&mut self, err: &WalError) {
        if !self.storage_failed {
            error!(
                node = self.id,
                term = self.current_term,
                error = %err,
                "wal write failed, fencing node"
            );
        }
        self.storage_failed = true;
        self.become_follower();
    }

    fn become_follower(&mut self) {
        let was_leader = self.role == Role::Leader;
        if self.role != Role::Follower {
            info!(
                node = self.id,
                term = self.current_term,
                from = ?self.role,
                "stepping down to follower"
            );
        }
        self.role = Role::Follower;
        self.votes.clear();
        self.progress.clear();
        if was_leader {
            let leader_id = self.leader_id.filter(|id| *id != self.id);
            self.leader_id = leader_id;
            self.fail_pending(|| RaftError::not_leader(leader_id));
        }
    }

    /// Adopts a newer term seen in any RPC or reply, then reverts to follower.
    pub fn observe_term(&mut self, term: u64) {
        if term <= self.current_term {
            return;
        }
        debug!(node = self.id, old = self.current_term, new = term, "observed newer term");
        self.current_term = term;
        self.voted_for = None;
        self.leader_id = None;
        self.become_follower();
        // A failed write fences the node inside persist_hard_state.
        let _ = self.persist_hard_state();
    }

    fn fail_pending(&mut self, err: impl Fn() -> RaftError) {
        for (_, pending) in std::mem::take(&mut self.pending) {
            let _ = pending.tx.send(Err(err()));
        }
    }

    // --- Election -------------------------------------------------------

    /// Election timer fired: become a candidate for the next term.
    ///
    /// Returns the vote request to broadcast, or `None` when this node must
    /// not campaign. A single-node cluster wins on the spot; check
    /// `is_leader` afterwards.
    pub fn start_election(&mut self, now: Instant) -> Option<RequestVoteRequest> {
        if self.role == Role::Leader || self.storage_failed || self.stopped {
            return None;
        }
        self.current_term += 1;
        self.voted_for = Some(self.id);
        self.role = Role::Candidate;
        self.leader_id = None;
        self.votes = HashSet::from([self.id]);
        self.reset_election_deadline(now);
        if self.persist_hard_state().is_err() {
            return None;
        }
        info!(node = self.id, term = self.current_term, "election timeout, starting election");

        let request = RequestVoteRequest {
            term: self.current_term,
            candidate_id: self.id,
            last_log_index: self.log.last_index(),
            last_log_term: self.log.last_term(),
        };
        if self.votes.len() >= self.quorum() {
            self.become_leader();
        }
        Some(request)
    }

    pub fn handle_request_vote(
        &mut self,
        request: &RequestVoteRequest,
        now: Instant,
    ) -> RequestVoteResponse {
        if self.stopped || self.storage_failed {
            return self.vote_reply(false);
        }
        if request.term < self.current_term {
            debug!(
                node = self.id,
                candidate = request.candidate_id,
                term = request.term,
                "rejecting vote for stale term"
            );
            return self.vote_reply(false);
        }
        self.observe_term(request.term);
        if self.storage_failed {
            return self.vote_reply(false);
        }

        let free = self
            .voted_for
            .map_or(true, |voted| voted == request.candidate_id);
        let up_to_date = self
            .log
            .is_up_to_date(request.last_log_index, request.last_log_term);
        if !(free && up_to_date) {
            debug!(
                node = self.id,
                candidate = request.candidate_id,
                term = request.term,
                voted_for = ?self.voted_for,
                up_to_date,
                "vote denied"
            );
            return self.vote_reply(false);
        }

        self.voted_for = Some(request.candidate_id);
        if self.persist_hard_state().is_err() {
            return self.vote_reply(false);
        }
        self.reset_election_deadline(now);
        debug!(
            node = self.id,
            candidate = request.candidate_id,
            term = request.term,
            "vote granted"
        );
        self.vote_reply(true)
    }

    fn vote_reply(&self, vote_granted: bool) -> RequestVoteResponse {
        RequestVoteResponse {
            term: self.current_term,
            vote_granted,
        }
    }

    /// Counts a vote. Returns `true` if this reply made us leader.
    pub fn handle_vote_response(
        &mut self,
        from: NodeId,
        request_term: u64,
        response: &RequestVoteResponse,
    ) -> bool {
        if response.term > self.current_term {
            self.observe_term(response.term);
            return false;
        }
        if self.role != Role::Candidate
            || self.current_term != request_term
            || !response.vote_granted
        {
            return false;
        }
        self.votes.insert(from);
        if self.votes.len() >= self.quorum() {
            self.become_leader();
            return self.is_leader();
        }
        false
    }

    fn become_leader(&mut self) {
        self.role = Role::Leader;
        self.leader_id = Some(self.id);
        self.votes.clear();
        let next_index = self.log.last_index() + 1;
        self.progress = self
            .peers
            .iter()
            .map(|&peer| {
                let progress = Progress {
                    next_index,
                    match_index: 0,
                    lagging: false,
                };
                (peer, progress)
            })
            .collect();
        info!(node = self.id, term = self.current_term, "won election, now leader");

        // Committing an entry of our own term is what lets earlier-term
        // entries commit.
        if let Err(err) = self.append_as_leader(Command::NoOp) {
            warn!(node = self.id, error = %err, "failed to append leader no-op");
        }
    }

    // --- Proposals ------------------------------------------------------

    /// Appends `command` to the leader's log and WAL and registers a waiter
    /// that resolves once the entry is applied.
    pub fn propose(&mut self, command: Command) -> Result<(u64, Waiter), RaftError> {
        let index = self.append_as_leader(command)?;
        let (tx, rx) = oneshot::channel();
        self.pending.insert(
            index,
            Pending {
                term: self.current_term,
                tx,
            },
        );
        Ok((index, rx))
    }

    fn append_as_leader(&mut self, command: Command) -> Result<u64, RaftError> {
        if self.stopped {
            return Err(RaftError::Stopped);
        }
        if self.role != Role::Leader {
            return Err(RaftError::not_leader(self.leader_id));
        }
        let entry = LogEntry {
            index: self.log.last_index() + 1,
            term: self.current_term,
            command,
        };
        if let Err(err) = self.wal.append(slice::from_ref(&entry)) {
            self.fail_storage(&err);
            return Err(RaftError::Storage(err));
        }
        let index = entry.index;
        self.log.append(entry);
        // Only matters without peers: our own copy is then a majority.
        self.advance_commit_index();
        self.raise_compaction_floor();
        Ok(index)
    }

    // --- Replication: follower side --------------------------------------

    pub fn handle_append_entries(
        &mut self,
        request: AppendEntriesRequest,
        now: Instant,
    ) -> AppendEntriesResponse {
        if self.stopped || request.term < self.current_term {
            return self.append_reply(false, 0, 0, None);
        }
        self.observe_term(request.term);
        if self.role != Role::Follower {
            self.become_follower();
        }
        self.leader_id = Some(request.leader_id);
        self.reset_election_deadline(now);

        if self.storage_failed {
            return self.append_reply(false, 0, request.prev_log_index + 1, None);
        }

        let prev = request.prev_log_index;
        if prev < self.log.snapshot_index() {
            // Our compacted prefix is committed, so it matches; resume after it.
            return self.append_reply(false, 0, self.log.snapshot_index() + 1, None);
        }
        if prev > self.log.last_index() {
            return self.append_reply(false, 0, self.log.last_index() + 1, None);
        }
        let local_term = self.log.term_at(prev);
        if local_term != Some(request.prev_log_term) {
            let conflict_index = self.log.first_index_of_term_run(prev);
            debug!(
                node = self.id,
                prev,
                local_term = ?local_term,
                leader_term = request.prev_log_term,
                conflict_index,
                "append rejected: log mismatch"
            );
            return self.append_reply(false, 0, conflict_index, local_term);
        }

        let match_index = prev + request.entries.len() as u64;
        let mut fresh = Vec::new();
        for entry in request.entries {
            if !fresh.is_empty() {
                fresh.push(entry);
                continue;
            }
            match self.log.term_at(entry.index) {
                Some(term) if term == entry.term => {}
                Some(_) => {
                    if entry.index <= self.commit_index {
                        error!(
                            node = self.id,
                            index = entry.index,
                            commit = self.commit_index,
                            "leader tried to overwrite a committed entry"
                        );
                        return self.append_reply(false, 0, self.commit_index + 1, None);
                    }
                    debug!(node = self.id, from = entry.index, "truncating conflicting suffix");
                    if let Err(err) = self.wal.truncate(entry.index) {
                        self.fail_storage(&err);
                        return self.append_reply(false, 0, prev + 1, None);
                    }
                    self.log.truncate_from(entry.index);
                    fresh.push(entry);
                }
                None => fresh.push(entry),
            }
        }

        if !fresh.is_empty() {
            if let Err(err) = self.wal.append(&fresh) {
                self.fail_storage(&err);
                return self.append_reply(false, 0, prev + 1, None);
            }
            for entry in fresh {
                self.log.append(entry);
            }
        }

        if request.leader_commit > self.commit_index {
            let commit = request.leader_commit.min(match_index);
            if commit > self.commit_index {
                self.commit_index = commit;
            }
        }
        let floor = request.compaction_floor.min(self.commit_index);
        if floor > self.compaction_floor {
            self.compaction_floor = floor;
        }
        self.append_reply(true, match_index, 0, None)
    }

    fn append_reply(
        &self,
        success: bool,
        match_index: u64,
        conflict_index: u64,
        conflict_term: Option<u64>,
    ) -> AppendEntriesResponse {
        AppendEntriesResponse {
            term: self.current_term,
            success,
            match_index,
            conflict_index,
            conflict_term,
        }
    }

    // --- Replication: leader side ----------------------------------------

    /// Next AppendEntries for `peer`, or `None` if we no longer lead.
    pub fn build_append_entries(&mut self, peer: NodeId) -> Option<AppendEntriesRequest> {
        if self.role != Role::Leader || self.stopped {
            return None;
        }
        let snapshot_index = self.log.snapshot_index();
        let last_index = self.log.last_index();
        let progress = self.progress.get_mut(&peer)?;

        let mut next = progress.next_index.clamp(1, last_index + 1);
        let mut max_entries = self.max_entries_per_append;
        if next <= snapshot_index {
            if !progress.lagging {
                warn!(
                    node = self.id,
                    peer,
                    next_index = next,
                    snapshot_index,
                    "follower needs compacted entries; sending heartbeats only"
                );
                progress.lagging = true;
            }
            next = snapshot_index + 1;
            max_entries = 0;
        }

        let prev_log_index = next - 1;
        Some(AppendEntriesRequest {
            term: self.current_term,
            leader_id: self.id,
            prev_log_index,
            prev_log_term: self.log.term_at(prev_log_index).unwrap_or(0),
            entries: self.log.entries_from(next, max_entries),
            leader_commit: self.commit_index,
            compaction_floor: self.compaction_floor,
        })
    }

    /// Applies a follower's reply. Returns `true` when another request
    /// should go out right away (backoff moved, or entries remain).
    pub fn handle_append_response(
        &mut self,
        peer: NodeId,
        sent: SentAppend,
        response: &AppendEntriesResponse,
    ) -> bool {
        if response.term > self.current_term {
            self.observe_term(response.term);
            return false;
        }
        if self.role != Role::Leader || self.current_term != sent.term {
            return false;
        }
        let last_index = self.log.last_index();
        let Some(progress) = self.progress.get_mut(&peer) else {
            return false;
        };

        if response.success {
            let matched = sent.prev_log_index + sent.entries;
            if matched > progress.match_index {
                progress.match_index = matched;
            }
            progress.next_index = progress.next_index.max(matched + 1);
            if progress.next_index > self.log.snapshot_index() {
                progress.lagging = false;
            }
            let more = progress.next_index <= last_index;
            self.advance_commit_index();
            self.raise_compaction_floor();
            return more;
        }

        let hinted = match response.conflict_term {
            Some(term) => match self.log.last_index_of_term(term) {
                Some(index) => index + 1,
                None => response.conflict_index,
            },
            None => response.conflict_index,
        };
        let next = hinted.clamp(progress.match_index + 1, last_index + 1);
        let moved = next != progress.next_index;
        debug!(
            node = self.id,
            peer,
            from = progress.next_index,
            to = next,
            "backing off next_index"
        );
        progress.next_index = next;
        moved
    }

    /// Moves `commit_index` to the highest index of the current term stored
    /// on a majority. Returns `true` if it moved.
    pub fn advance_commit_index(&mut self) -> bool {
        if self.role != Role::Leader {
            return false;
        }
        let quorum = self.quorum();
        let mut n = self.log.last_index();
        while n > self.commit_index {
            match self.log.term_at(n) {
                Some(term) if term == self.current_term => {
                    let replicated = 1 + self
                        .progress
                        .values()
                        .filter(|p| p.match_index >= n)
                        .count();
                    if replicated >= quorum {
                        debug!(
                            node = self.id,
                            from = self.commit_index,
                            to = n,
                            "commit index advanced"
                        );
                        self.commit_index = n;
                        return true;
                    }
                }
                // Terms only grow along the log; nothing below is ours.
                _ => break,
            }
            n -= 1;
        }
        false
    }

    /// Leader only: lifts the floor to the lowest match index across peers,
    /// capped at the commit index. The floor never moves back, even across
    /// leader changes: entries below it are committed, and committed entries
    /// stay on every member that acknowledged them.
    fn raise_compaction_floor(&mut self) {
        if self.role != Role::Leader {
            return;
        }
        let held_everywhere = self
            .progress
            .values()
            .map(|p| p.match_index)
            .min()
            .unwrap_or(self.commit_index);
        let floor = held_everywhere.min(self.commit_index);
        if floor > self.compaction_floor {
            debug!(
                node = self.id,
                from = self.compaction_floor,
                to = floor,
                "compaction floor raised"
            );
            self.compaction_floor = floor;
        }
    }

    // --- Apply -----------------------------------------------------------

    /// Committed entries not yet applied, in index order.
    pub fn committed_unapplied(&self) -> Vec<LogEntry> {
        self.log
            .entries_between(self.last_applied + 1, self.commit_index)
    }

    /// Records that `entry` was applied and wakes its waiter, if any.
    pub fn mark_applied(&mut self, entry: &LogEntry, output: CommandOutput) {
        debug_assert_eq!(entry.index, self.last_applied + 1);
        self.last_applied = entry.index;
        if let Some(pending) = self.pending.remove(&entry.index) {
            let result = if pending.term == entry.term {
                Ok(output)
            } else {
                // The proposed entry was overwritten by another leader.
                Err(RaftError::not_leader(self.leader_id))
            };
            let _ = pending.tx.send(result);
        }
    }

    // --- Compaction ------------------------------------------------------

    /// Index to snapshot at once the log holds more than `threshold` entries.
    ///
    /// The target never passes the compaction floor, so no member is left
    /// needing entries that only a snapshot could supply. It is never below
    /// `last_applied` either: the state machine cannot produce an older
    /// image, so the apply loop pauses at the target and snapshots there.
    /// Each compaction must free at least half the threshold.
    pub fn compaction_target(&self, threshold: u64) -> Option<u64> {
        if self.stopped || self.storage_failed || threshold == 0 {
            return None;
        }
        if self.log.len() as u64 <= threshold {
            return None;
        }
        let target = self.compaction_floor.min(self.commit_index);
        let freed = target.saturating_sub(self.log.snapshot_index());
        (freed > threshold / 2 && target >= self.last_applied).then_some(target)
    }

    /// Replaces the log prefix up to `index` (already applied) with `data`.
    pub fn compact(&mut self, index: u64, data: Vec<u8>) -> Result<(), WalError> {
        let Some(term) = self.log.term_at(index) else {
            return Ok(());
        };
        if index <= self.log.snapshot_index() || index > self.last_applied {
            return Ok(());
        }
        let snapshot = Snapshot {
            last_included_index: index,
            last_included_term: term,
            data,
        };
        let retained = self.log.entries_from(index + 1, usize::MAX);
        let hard_state = self.hard_state();
        if let Err(err) = self.wal.save_snapshot(&snapshot, hard_state, &retained) {
            self.fail_storage(&err);
            return Err(err);
        }
        self.log.compact_to(index, term);
        info!(node = self.id, index, term, retained = retained.len(), "log compacted");
        Ok(())
    }

    // --- Shutdown --------------------------------------------------------

    pub fn stop(&mut self) -> Result<(), WalError> {
        if self.stopped {
            return Ok(());
        }
        self.stopped = true;
        self.role = Role::Follower;
        self.progress.clear();
        self.votes.clear();
        self.fail_pending(|| RaftError::Stopped);
        self.wal.close()
    }
}
