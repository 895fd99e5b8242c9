use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Result, ensure};

use crate::NodeId;

/// Static configuration of one cluster member.
///
/// Membership is fixed: `peers` lists every other voting member and never
/// changes while the node runs.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// This node's unique ID (must not appear in `peers`)
    pub id: NodeId,
    /// IDs of all other cluster members
    pub peers: Vec<NodeId>,
    /// Lower bound of the randomized election timeout
    pub election_timeout_min: Duration,
    /// Upper bound of the randomized election timeout
    pub election_timeout_max: Duration,
    /// Leader heartbeat period; must be well below `election_timeout_min`
    pub heartbeat_interval: Duration,
    /// Deadline for a single outbound RPC before it counts as failed
    pub rpc_timeout: Duration,
    /// Default deadline used by `Node::submit` and `Node::read`
    pub proposal_timeout: Duration,
    /// Directory holding the WAL and snapshot files
    pub wal_path: PathBuf,
    /// Compact the log once it holds more than this many entries (0 disables)
    pub snapshot_threshold: u64,
    /// Upper bound on entries carried by one AppendEntries request
    pub max_entries_per_append: usize,
}

impl NodeConfig {
    /// Creates a configuration with the default timing profile.
    ///
    /// - Election timeout: 150ms to 300ms
    /// - Heartbeat: every 50ms
    /// - Per-RPC deadline: 100ms
    pub fn new(id: NodeId, peers: Vec<NodeId>, wal_path: impl Into<PathBuf>) -> Self {
        Self {
            id,
            peers,
            election_timeout_min: Duration::from_millis(150),
            election_timeout_max: Duration::from_millis(300),
            heartbeat_interval: Duration::from_millis(50),
            rpc_timeout: Duration::from_millis(100),
            proposal_timeout: Duration::from_secs(5),
            wal_path: wal_path.into(),
            snapshot_threshold: 1024,
            max_entries_per_append: 64,
        }
    }

    /// Number of voting members, this node included.
    pub fn cluster_size(&self) -> usize {
        self.peers.len() + 1
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(
            !self.peers.contains(&self.id),
            "node {} must not list itself as a peer",
            self.id
        );
        let unique: HashSet<_> = self.peers.iter().collect();
        ensure!(
            unique.len() == self.peers.len(),
            "peer list contains duplicates: {:?}",
            self.peers
        );
        for (name, value) in [
            ("election_timeout_min", self.election_timeout_min),
            ("heartbeat_interval", self.heartbeat_interval),
            ("rpc_timeout", self.rpc_timeout),
            ("proposal_timeout", self.proposal_timeout),
        ] {
            ensure!(!value.is_zero(), "{name} must be non-zero");
        }
        ensure!(
            self.election_timeout_min <= self.election_timeout_max,
            "election timeout range is empty ({:?} > {:?})",
            self.election_timeout_min,
            self.election_timeout_max
        );
        ensure!(
            self.heartbeat_interval < self.election_timeout_min,
            "heartbeat interval {:?} must be shorter than the minimum election timeout {:?}",
            self.heartbeat_interval,
            self.election_timeout_min
        );
        ensure!(
            self.max_entries_per_append > 0,
            "max_entries_per_append must be positive"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> NodeConfig {
        NodeConfig::new(1, vec![2, 3], "/tmp/unused")
    }

    #[test]
    fn defaults_are_valid() -> Result<()> {
        base().validate()?;
        assert_eq!(base().cluster_size(), 3);
        Ok(())
    }

    #[test]
    fn rejects_self_in_peers() {
        let mut cfg = base();
        cfg.peers.push(1);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_duplicate_peers() {
        let mut cfg = base();
        cfg.peers = vec![2, 2];
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_inverted_election_range() {
        let mut cfg = base();
        cfg.election_timeout_max = Duration::from_millis(100);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_heartbeat_slower_than_election() {
        let mut cfg = base();
        cfg.heartbeat_interval = Duration::from_millis(200);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_zero_timeouts() {
        let mut cfg = base();
        cfg.rpc_timeout = Duration::ZERO;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("rpc_timeout"));

        let mut cfg = base();
        cfg.proposal_timeout = Duration::ZERO;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("proposal_timeout"));

        let mut cfg = base();
        cfg.heartbeat_interval = Duration::ZERO;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn single_node_cluster_is_allowed() -> Result<()> {
        let cfg = NodeConfig::new(7, vec![], "/tmp/unused");
        cfg.validate()?;
        assert_eq!(cfg.cluster_size(), 1);
        Ok(())
    }
}
