//! Shared harness: whole clusters in one process over `LocalNetwork`.

#![allow(dead_code)]

pub mod history;
pub mod invariants;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use tempfile::TempDir;
use tokio::time::{Instant, sleep};

use raft_kv::transport::{LocalNetwork, RpcHandler};
use raft_kv::{Command, CommandOutput, KvStore, Node, NodeConfig, NodeId, RaftError};

const POLL: Duration = Duration::from_millis(10);

/// Test harness for a cluster of nodes wired through an in-process network.
pub struct TestCluster {
    pub network: Arc<LocalNetwork>,
    ids: Vec<NodeId>,
    nodes: BTreeMap<NodeId, Node>,
    // The network only holds weak references to handlers.
    handlers: BTreeMap<NodeId, Arc<dyn RpcHandler>>,
    dirs: BTreeMap<NodeId, TempDir>,
    snapshot_threshold: u64,
}

impl TestCluster {
    /// Starts nodes `1..=n` with the default timing profile.
    pub fn spawn(n: u64) -> Result<Self> {
        Self::spawn_with_threshold(n, 1024)
    }

    pub fn spawn_with_threshold(n: u64, snapshot_threshold: u64) -> Result<Self> {
        let mut cluster = Self {
            network: LocalNetwork::new(),
            ids: (1..=n).collect(),
            nodes: BTreeMap::new(),
            handlers: BTreeMap::new(),
            dirs: BTreeMap::new(),
            snapshot_threshold,
        };
        for id in 1..=n {
            cluster.dirs.insert(id, TempDir::new()?);
            cluster.start_node(id)?;
        }
        Ok(cluster)
    }

    /// Starts (or restarts) `id` on its existing data directory.
    pub fn start_node(&mut self, id: NodeId) -> Result<()> {
        let dir = self.dirs.get(&id).context("unknown node")?;
        let peers = self.ids.iter().copied().filter(|p| *p != id).collect();
        let mut config = NodeConfig::new(id, peers, dir.path());
        config.snapshot_threshold = self.snapshot_threshold;
        config.proposal_timeout = Duration::from_secs(3);

        let node = Node::start(config, Box::new(KvStore::new()), self.network.sender(id))?;
        let handler = node.rpc_handler();
        self.network.register(id, &handler);
        self.handlers.insert(id, handler);
        self.nodes.insert(id, node);
        Ok(())
    }

    /// Stops `id` and takes it off the network. Its data directory survives.
    pub async fn stop_node(&mut self, id: NodeId) -> Result<()> {
        self.network.unregister(id);
        self.handlers.remove(&id);
        if let Some(node) = self.nodes.remove(&id) {
            node.stop().await?;
        }
        Ok(())
    }

    pub fn node(&self, id: NodeId) -> &Node {
        self.nodes.get(&id).expect("node is not running")
    }

    pub fn running(&self) -> Vec<NodeId> {
        self.nodes.keys().copied().collect()
    }

    pub fn followers_of(&self, leader: NodeId) -> Vec<NodeId> {
        self.running().into_iter().filter(|id| *id != leader).collect()
    }

    /// A running node that currently believes it leads, if any.
    pub fn leader(&self) -> Option<NodeId> {
        self.running()
            .into_iter()
            .find(|id| self.node(*id).is_leader())
    }

    /// Waits until exactly one of `among` reports itself leader.
    pub async fn wait_for_leader_among(
        &self,
        among: &[NodeId],
        timeout: Duration,
    ) -> Result<NodeId> {
        let deadline = Instant::now() + timeout;
        loop {
            let leaders: Vec<NodeId> = among
                .iter()
                .copied()
                .filter(|id| self.nodes.get(id).is_some_and(Node::is_leader))
                .collect();
            if leaders.len() == 1 {
                return Ok(leaders[0]);
            }
            if Instant::now() > deadline {
                bail!("timeout waiting for a single leader among {among:?} (saw {leaders:?})");
            }
            sleep(POLL).await;
        }
    }

    /// Waits until exactly one running node is leader.
    pub async fn wait_for_single_leader(&self, timeout: Duration) -> Result<NodeId> {
        self.wait_for_leader_among(&self.running(), timeout).await
    }

    /// Waits until every running node names `leader` as its leader.
    pub async fn wait_for_leader_consensus(
        &self,
        leader: NodeId,
        timeout: Duration,
    ) -> Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.nodes.values().all(|node| node.leader_id() == Some(leader)) {
                return Ok(());
            }
            if Instant::now() > deadline {
                bail!("timeout waiting for all nodes to follow {leader}");
            }
            sleep(POLL).await;
        }
    }

    /// Waits until `id` has applied at least `index`.
    pub async fn wait_for_applied(
        &self,
        id: NodeId,
        index: u64,
        timeout: Duration,
    ) -> Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            let applied = self.node(id).status().last_applied;
            if applied >= index {
                return Ok(());
            }
            if Instant::now() > deadline {
                bail!("timeout waiting for node {id} to apply {index} (at {applied})");
            }
            sleep(POLL).await;
        }
    }

    /// Waits until every running node has applied at least `index`.
    pub async fn wait_for_all_applied(&self, index: u64, timeout: Duration) -> Result<()> {
        for id in self.running() {
            self.wait_for_applied(id, index, timeout).await?;
        }
        Ok(())
    }

    /// Waits until `id` has compacted its log into a snapshot.
    pub async fn wait_for_compaction(&self, id: NodeId, timeout: Duration) -> Result<u64> {
        let deadline = Instant::now() + timeout;
        loop {
            let snapshot_index = self.node(id).status().snapshot_index;
            if snapshot_index > 0 {
                return Ok(snapshot_index);
            }
            if Instant::now() > deadline {
                bail!("timeout waiting for node {id} to compact its log");
            }
            sleep(POLL).await;
        }
    }

    /// Submits `command` to whichever node leads, retrying on `NotLeader`
    /// and `Timeout` until `timeout` passes. A retried command may apply
    /// twice, so callers only retry idempotent writes.
    pub async fn submit_with_retry(
        &self,
        command: Command,
        timeout: Duration,
    ) -> Result<CommandOutput> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(leader) = self.leader() {
                let attempt = self
                    .node(leader)
                    .submit_with_timeout(command.clone(), Duration::from_secs(1))
                    .await;
                match attempt {
                    Ok(output) => return Ok(output),
                    Err(RaftError::NotLeader { .. } | RaftError::Timeout) => {}
                    Err(err) => return Err(err.into()),
                }
            }
            if Instant::now() > deadline {
                bail!("timeout submitting {command:?}");
            }
            sleep(POLL).await;
        }
    }

    pub async fn shutdown(mut self) -> Result<()> {
        for id in self.running() {
            self.stop_node(id).await?;
        }
        Ok(())
    }
}
