//! The replicated state machine.
//!
//! Committed log entries are applied here, strictly in index order, by the
//! node's apply loop. Any two nodes that apply the same command sequence
//! must end up with identical contents and identical outputs.

use std::collections::BTreeMap;

use anyhow::{Context, Result};

use crate::command::{Command, CommandOutput};

/// Deterministic state machine driven by the committed log.
///
/// `snapshot` and `restore` back log compaction: the node serializes the
/// machine at `last_applied`, discards the covered log prefix, and rebuilds
/// the machine from that blob on restart before replaying the rest of the WAL.
pub trait StateMachine: Send + 'static {
    fn apply(&mut self, command: &Command) -> CommandOutput;

    fn get(&self, key: &str) -> Option<String>;

    fn snapshot(&self) -> Result<Vec<u8>>;

    fn restore(&mut self, data: &[u8]) -> Result<()>;
}

/// String-keyed map used by every node of the cluster.
///
/// BTreeMap keeps iteration (and therefore snapshot bytes) stable across
/// nodes.
#[derive(Debug, Default, Clone)]
pub struct KvStore {
    data: BTreeMap<String, String>,
}

impl KvStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Copy of all pairs, for status output and tests.
    pub fn entries(&self) -> BTreeMap<String, String> {
        self.data.clone()
    }
}

impl StateMachine for KvStore {
    fn apply(&mut self, command: &Command) -> CommandOutput {
        let previous = match command {
            Command::Set { key, value } => self.data.insert(key.clone(), value.clone()),
            Command::Delete { key } => self.data.remove(key),
            Command::NoOp => None,
        };
        CommandOutput { previous }
    }

    fn get(&self, key: &str) -> Option<String> {
        self.data.get(key).cloned()
    }

    fn snapshot(&self) -> Result<Vec<u8>> {
        bincode::serialize(&self.data).context("encode kv snapshot")
    }

    fn restore(&mut self, data: &[u8]) -> Result<()> {
        self.data = bincode::deserialize(data).context("decode kv snapshot")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_and_delete_report_previous_value() {
        let mut store = KvStore::new();
        assert_eq!(store.apply(&Command::set("a", "1")).previous, None);
        assert_eq!(
            store.apply(&Command::set("a", "2")).previous.as_deref(),
            Some("1")
        );
        assert_eq!(store.get("a").as_deref(), Some("2"));

        assert_eq!(
            store.apply(&Command::delete("a")).previous.as_deref(),
            Some("2")
        );
        assert_eq!(store.get("a"), None);
        assert_eq!(store.apply(&Command::delete("a")).previous, None);
    }

    #[test]
    fn noop_leaves_state_untouched() {
        let mut store = KvStore::new();
        store.apply(&Command::set("a", "1"));
        assert_eq!(store.apply(&Command::NoOp), CommandOutput::default());
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn same_commands_give_same_state() {
        let commands = vec![
            Command::set("x", "1"),
            Command::set("y", "2"),
            Command::delete("x"),
            Command::NoOp,
            Command::set("z", "3"),
        ];
        let mut left = KvStore::new();
        let mut right = KvStore::new();
        let out_left: Vec<_> = commands.iter().map(|c| left.apply(c)).collect();
        let out_right: Vec<_> = commands.iter().map(|c| right.apply(c)).collect();
        assert_eq!(out_left, out_right);
        assert_eq!(left.entries(), right.entries());
    }

    #[test]
    fn restore_replaces_contents() -> Result<()> {
        let mut source = KvStore::new();
        source.apply(&Command::set("a", "1"));
        source.apply(&Command::set("b", "2"));
        let blob = source.snapshot()?;

        let mut target = KvStore::new();
        target.apply(&Command::set("stale", "x"));
        target.restore(&blob)?;
        assert_eq!(target.entries(), source.entries());
        assert_eq!(target.get("stale"), None);
        Ok(())
    }
}
