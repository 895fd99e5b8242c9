//! Cross-node safety checks, run against the logs and state machines of a
//! live cluster.

use std::collections::BTreeMap;

use anyhow::{Result, bail, ensure};

use raft_kv::log::LogEntry;
use raft_kv::{KvStore, Node, NodeId, StateMachine};

/// Entries a node holds in memory, split at its commit index.
#[derive(Debug, Clone)]
pub struct NodeLog {
    pub id: NodeId,
    pub commit_index: u64,
    pub entries: Vec<LogEntry>,
}

impl NodeLog {
    /// Reads the commit index first, so every entry at or below it stays
    /// committed even if the log moves on while the entries are copied.
    pub fn of(id: NodeId, node: &Node) -> Self {
        let commit_index = node.commit_index();
        Self {
            id,
            commit_index,
            entries: node.log_entries(),
        }
    }

    pub fn committed(&self) -> impl Iterator<Item = &LogEntry> {
        self.entries
            .iter()
            .filter(move |entry| entry.index <= self.commit_index)
    }

    fn entry(&self, index: u64) -> Option<&LogEntry> {
        let first = self.entries.first()?.index;
        let offset = index.checked_sub(first)?;
        self.entries.get(offset as usize)
    }
}

/// Committed entries agree across nodes: the same index always carries the
/// same term and command.
pub fn check_committed_agree(logs: &[NodeLog]) -> Result<()> {
    let mut seen: BTreeMap<u64, (NodeId, &LogEntry)> = BTreeMap::new();
    for log in logs {
        for entry in log.committed() {
            match seen.get(&entry.index) {
                Some((other, first)) if *first != entry => bail!(
                    "index {} differs: node {other} committed {first:?}, node {} {entry:?}",
                    entry.index,
                    log.id
                ),
                Some(_) => {}
                None => {
                    seen.insert(entry.index, (log.id, entry));
                }
            }
        }
    }
    Ok(())
}

/// If two logs hold an entry with the same index and term, they agree on
/// every entry before it that both still hold.
pub fn check_log_matching(logs: &[NodeLog]) -> Result<()> {
    for (i, a) in logs.iter().enumerate() {
        for b in &logs[i + 1..] {
            let Some(matched) = a
                .entries
                .iter()
                .rev()
                .find(|entry| b.entry(entry.index).is_some_and(|o| o.term == entry.term))
            else {
                continue;
            };
            for entry in a.entries.iter().take_while(|e| e.index <= matched.index) {
                if let Some(other) = b.entry(entry.index) {
                    ensure!(
                        other == entry,
                        "nodes {} and {} match at {} but differ at {}: {entry:?} vs {other:?}",
                        a.id,
                        b.id,
                        matched.index,
                        entry.index
                    );
                }
            }
        }
    }
    Ok(())
}

/// Indices are contiguous and terms never decrease along each log.
pub fn check_term_order(logs: &[NodeLog]) -> Result<()> {
    for log in logs {
        for pair in log.entries.windows(2) {
            ensure!(
                pair[1].index == pair[0].index + 1,
                "node {} has a gap between {} and {}",
                log.id,
                pair[0].index,
                pair[1].index
            );
            ensure!(
                pair[1].term >= pair[0].term,
                "node {} has term {} at {} after term {} at {}",
                log.id,
                pair[1].term,
                pair[1].index,
                pair[0].term,
                pair[0].index
            );
        }
    }
    Ok(())
}

/// Every entry committed anywhere is in the leader's log, unchanged, unless
/// the leader has already folded it into its snapshot.
pub fn check_leader_completeness(leader: &NodeLog, logs: &[NodeLog]) -> Result<()> {
    let first = leader.entries.first().map_or(u64::MAX, |e| e.index);
    for log in logs {
        for entry in log.committed().filter(|e| e.index >= first) {
            match leader.entry(entry.index) {
                Some(held) if held == entry => {}
                Some(held) => bail!(
                    "leader {} holds {held:?} where node {} committed {entry:?}",
                    leader.id,
                    log.id
                ),
                None => bail!(
                    "leader {} is missing index {} committed on node {}",
                    leader.id,
                    entry.index,
                    log.id
                ),
            }
        }
    }
    Ok(())
}

/// Contents of a node's state machine, read through its snapshot image.
pub fn store_contents(node: &Node) -> Result<BTreeMap<String, String>> {
    let image = node.with_state_machine(|sm| sm.snapshot())?;
    let mut store = KvStore::new();
    store.restore(&image)?;
    Ok(store.entries())
}

/// Every node's state machine holds the same pairs. Callers wait until all
/// of them have applied the same index first.
pub fn check_state_machines_agree(nodes: &[(NodeId, &Node)]) -> Result<()> {
    let mut stores = Vec::with_capacity(nodes.len());
    for &(id, node) in nodes {
        stores.push((id, store_contents(node)?));
    }
    let Some(((first, expected), rest)) = stores.split_first() else {
        return Ok(());
    };
    for (id, contents) in rest {
        ensure!(
            expected == contents,
            "state machines of nodes {first} and {id} differ: {expected:?} vs {contents:?}"
        );
    }
    Ok(())
}

/// Tracks each node's commit index across observations; it must never fall
/// while the node keeps running.
#[derive(Debug, Default)]
pub struct CommitWatch {
    last: BTreeMap<NodeId, u64>,
}

impl CommitWatch {
    pub fn observe(&mut self, id: NodeId, node: &Node) -> Result<()> {
        let commit = node.commit_index();
        let last = self.last.entry(id).or_default();
        ensure!(
            commit >= *last,
            "node {id} commit index fell from {} to {commit}",
            *last
        );
        *last = commit;
        Ok(())
    }

    /// A restarted node rebuilds its commit index from scratch.
    pub fn forget(&mut self, id: NodeId) {
        self.last.remove(&id);
    }
}
