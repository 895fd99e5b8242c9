//! In-memory view of the replicated log.
//!
//! Indices are 1-based and contiguous. After compaction the log no longer
//! holds entries up to `snapshot_index`; it only remembers the term of the
//! last compacted entry so consistency checks at that boundary still work.
//! Index 0 with term 0 is the implicit empty prefix.

use serde::{Deserialize, Serialize};

use crate::command::Command;

/// A single indexed, termed, command-carrying record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub index: u64,
    pub term: u64,
    pub command: Command,
}

#[derive(Debug, Default)]
pub struct RaftLog {
    // INVARIANT: entries[i].index == snapshot_index + 1 + i
    entries: Vec<LogEntry>,
    snapshot_index: u64,
    snapshot_term: u64,
}

impl RaftLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuilds a log from recovered state. `entries` must start right after
    /// `snapshot_index` and be contiguous.
    pub fn restore(snapshot_index: u64, snapshot_term: u64, entries: Vec<LogEntry>) -> Self {
        debug_assert!(
            entries
                .iter()
                .enumerate()
                .all(|(i, e)| e.index == snapshot_index + 1 + i as u64)
        );
        Self {
            entries,
            snapshot_index,
            snapshot_term,
        }
    }

    pub fn snapshot_index(&self) -> u64 {
        self.snapshot_index
    }

    pub fn snapshot_term(&self) -> u64 {
        self.snapshot_term
    }

    pub fn first_index(&self) -> u64 {
        self.snapshot_index + 1
    }

    pub fn last_index(&self) -> u64 {
        self.snapshot_index + self.entries.len() as u64
    }

    pub fn last_term(&self) -> u64 {
        self.entries
            .last()
            .map_or(self.snapshot_term, |entry| entry.term)
    }

    /// Number of entries held in memory (compacted entries excluded).
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Term of the entry at `index`, or `None` when the entry is past the end
    /// or already compacted. The compaction boundary itself is known.
    pub fn term_at(&self, index: u64) -> Option<u64> {
        if index == self.snapshot_index {
            return Some(self.snapshot_term);
        }
        self.entry(index).map(|entry| entry.term)
    }

    pub fn entry(&self, index: u64) -> Option<&LogEntry> {
        if index <= self.snapshot_index {
            return None;
        }
        self.entries.get((index - self.first_index()) as usize)
    }

    /// Clones up to `max` entries starting at `from`.
    pub fn entries_from(&self, from: u64, max: usize) -> Vec<LogEntry> {
        let start = from.max(self.first_index());
        if start > self.last_index() {
            return Vec::new();
        }
        let offset = (start - self.first_index()) as usize;
        self.entries[offset..]
            .iter()
            .take(max)
            .cloned()
            .collect()
    }

    /// Clones the inclusive range `[from, to]`, clamped to what is held.
    pub fn entries_between(&self, from: u64, to: u64) -> Vec<LogEntry> {
        if to < from {
            return Vec::new();
        }
        self.entries_from(from, (to - from + 1) as usize)
    }

    pub fn append(&mut self, entry: LogEntry) {
        debug_assert_eq!(entry.index, self.last_index() + 1);
        self.entries.push(entry);
    }

    /// Drops every entry at `index` and after.
    pub fn truncate_from(&mut self, index: u64) {
        debug_assert!(index > self.snapshot_index);
        if index > self.last_index() {
            return;
        }
        let keep = (index - self.first_index()) as usize;
        self.entries.truncate(keep);
    }

    /// Discards entries up to and including `index`, remembering `term` as
    /// the term of the compaction boundary.
    pub fn compact_to(&mut self, index: u64, term: u64) {
        if index <= self.snapshot_index {
            return;
        }
        let drop = ((index - self.snapshot_index) as usize).min(self.entries.len());
        self.entries.drain(..drop);
        self.snapshot_index = index;
        self.snapshot_term = term;
    }

    /// First held index whose term equals the term at `index`, scanning
    /// backwards. Used to build the conflict hint of a rejected append.
    pub fn first_index_of_term_run(&self, index: u64) -> u64 {
        let Some(term) = self.term_at(index) else {
            return index;
        };
        let mut first = index;
        while first > self.first_index() && self.term_at(first - 1) == Some(term) {
            first -= 1;
        }
        first
    }

    /// Last held index with the given term.
    pub fn last_index_of_term(&self, term: u64) -> Option<u64> {
        self.entries
            .iter()
            .rev()
            .find(|entry| entry.term == term)
            .map(|entry| entry.index)
    }

    /// Election restriction: is a log ending at `(last_index, last_term)` at
    /// least as up-to-date as this one?
    pub fn is_up_to_date(&self, last_index: u64, last_term: u64) -> bool {
        let our_term = self.last_term();
        last_term > our_term || (last_term == our_term && last_index >= self.last_index())
    }
}
