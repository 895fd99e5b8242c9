//! Client-observed history of concurrent writes and reads, and a checker
//! that every read returned a value some linearization allows.
//!
//! Every write stores a value unique across the run, so a read's result
//! names exactly one write.

use std::sync::Mutex;

use anyhow::{Result, bail};
use tokio::time::Instant;

#[derive(Debug, Clone)]
pub enum Outcome {
    /// The write was applied before the call returned.
    Written,
    /// The call failed; the write may or may not take effect later.
    Unknown,
    /// A successful read and the value it returned.
    Read(Option<String>),
}

#[derive(Debug, Clone)]
pub struct Operation {
    pub client: usize,
    pub key: String,
    /// Value written; unused for reads.
    pub value: String,
    pub start: Instant,
    pub end: Instant,
    pub outcome: Outcome,
}

impl Operation {
    fn is_write(&self) -> bool {
        matches!(self.outcome, Outcome::Written | Outcome::Unknown)
    }
}

#[derive(Debug, Default)]
pub struct History {
    ops: Mutex<Vec<Operation>>,
}

impl History {
    pub fn record(&self, op: Operation) {
        self.ops.lock().unwrap().push(op);
    }

    pub fn operations(&self) -> Vec<Operation> {
        self.ops.lock().unwrap().clone()
    }

    /// Counts of `(acknowledged writes, successful reads)`.
    pub fn completed(&self) -> (usize, usize) {
        let ops = self.ops.lock().unwrap();
        let writes = ops
            .iter()
            .filter(|op| matches!(op.outcome, Outcome::Written))
            .count();
        let reads = ops
            .iter()
            .filter(|op| matches!(op.outcome, Outcome::Read(_)))
            .count();
        (writes, reads)
    }

    /// Checks every successful read against the writes to its key.
    pub fn check_reads(&self) -> Result<()> {
        check_reads(&self.operations())
    }
}

/// A read of value `v` is allowed when `v`'s write started before the read
/// ended, and no acknowledged write that began after `v`'s write finished
/// had itself finished before the read began. A read of nothing is allowed
/// only while no write to the key has been acknowledged.
pub fn check_reads(ops: &[Operation]) -> Result<()> {
    for read in ops {
        let Outcome::Read(result) = &read.outcome else {
            continue;
        };
        let key = read.key.as_str();

        let Some(value) = result else {
            if let Some(done) = writes_to(ops, key)
                .find(|w| matches!(w.outcome, Outcome::Written) && w.end < read.start)
            {
                bail!(
                    "client {} read nothing for {} after {:?} was acknowledged",
                    read.client,
                    read.key,
                    done.value
                );
            }
            continue;
        };

        let Some(source) = writes_to(ops, key).find(|w| w.value == *value) else {
            bail!(
                "client {} read {value:?} for {}, which nobody wrote",
                read.client,
                read.key
            );
        };
        if source.start >= read.end {
            bail!(
                "client {} read {value:?} for {} before it was written",
                read.client,
                read.key
            );
        }
        // An unacknowledged source has no known end, so nothing provably
        // overwrote it.
        if !matches!(source.outcome, Outcome::Written) {
            continue;
        }
        if let Some(newer) = writes_to(ops, key).find(|w| {
            matches!(w.outcome, Outcome::Written)
                && w.start > source.end
                && w.end < read.start
        }) {
            bail!(
                "client {} read stale {value:?} for {}: {:?} was acknowledged first",
                read.client,
                read.key,
                newer.value
            );
        }
    }
    Ok(())
}

fn writes_to<'a>(ops: &'a [Operation], key: &'a str) -> impl Iterator<Item = &'a Operation> {
    ops.iter().filter(move |op| op.is_write() && op.key == key)
}
