//! In-process cluster for end-to-end tests.
//!
//! Nodes talk through [`LocalClient`]s that call the target's RPC service
//! directly. Any node can be isolated, after which every RPC to or from it
//! fails like a dropped connection.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;

use crate::config::NodeOptions;
use crate::election::Peer;
use crate::journal::MemoryJournal;
use crate::kv::KvStore;
use crate::server::RaftNode;
use crate::state::Role;
use crate::storage::MemoryLog;
use crate::transport::{RaftClient, RaftRpc, TransportError};
use crate::types::{
    AppendEntries, AppendEntriesResponse, NodeId, RequestVote, RequestVoteResponse,
};

type Slot = Arc<OnceLock<Arc<dyn RaftRpc>>>;

/// Routes RPCs straight to another node's service.
pub struct LocalClient {
    target: Slot,
    source_up: Arc<AtomicBool>,
    target_up: Arc<AtomicBool>,
}

impl LocalClient {
    fn service(&self) -> Result<&Arc<dyn RaftRpc>, TransportError> {
        if !self.source_up.load(Ordering::SeqCst) || !self.target_up.load(Ordering::SeqCst) {
            return Err(TransportError::Unavailable);
        }
        self.target.get().ok_or(TransportError::Unavailable)
    }
}

#[async_trait]
impl RaftClient for LocalClient {
    async fn append_entries(
        &self,
        request: AppendEntries,
    ) -> Result<AppendEntriesResponse, TransportError> {
        self.service()?
            .append_entries(request)
            .await
            .map_err(|e| TransportError::Remote(e.to_string()))
    }

    async fn request_vote(
        &self,
        request: RequestVote,
    ) -> Result<RequestVoteResponse, TransportError> {
        self.service()?
            .request_vote(request)
            .await
            .map_err(|e| TransportError::Remote(e.to_string()))
    }
}

/// Key-value nodes wired together in one process.
pub struct LocalCluster {
    nodes: Vec<RaftNode<KvStore, MemoryLog>>,
    up: Vec<Arc<AtomicBool>>,
}

impl LocalCluster {
    pub fn new(size: usize, options: NodeOptions) -> Self {
        let ids: Vec<NodeId> = (1..=size as u64).map(NodeId::from).collect();
        let slots: Vec<Slot> = ids.iter().map(|_| Arc::new(OnceLock::new())).collect();
        let up: Vec<Arc<AtomicBool>> = ids.iter().map(|_| Arc::new(AtomicBool::new(true))).collect();

        let nodes: Vec<RaftNode<KvStore, MemoryLog>> = ids
            .iter()
            .enumerate()
            .map(|(me, &id)| {
                let peers: Vec<Peer> = ids
                    .iter()
                    .enumerate()
                    .filter(|&(other, _)| other != me)
                    .map(|(other, &peer)| {
                        let client = LocalClient {
                            target: Arc::clone(&slots[other]),
                            source_up: Arc::clone(&up[me]),
                            target_up: Arc::clone(&up[other]),
                        };
                        (peer, Arc::new(client) as Arc<dyn RaftClient>)
                    })
                    .collect();
                RaftNode::start(
                    id,
                    Arc::new(MemoryLog::new()),
                    KvStore::new(),
                    Arc::new(MemoryJournal::new()),
                    peers,
                    options.clone(),
                )
            })
            .collect();

        for (slot, node) in slots.iter().zip(&nodes) {
            let _ = slot.set(node.service());
        }
        Self { nodes, up }
    }

    /// `leader` creates the cluster; every other node joins it.
    pub async fn bootstrap(&self, leader: usize) -> crate::Result<()> {
        for (i, node) in self.nodes.iter().enumerate() {
            if i == leader {
                node.create_cluster().await?;
            } else {
                node.join_cluster().await?;
            }
        }
        Ok(())
    }

    pub fn node(&self, index: usize) -> &RaftNode<KvStore, MemoryLog> {
        &self.nodes[index]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn isolate(&self, index: usize) {
        self.up[index].store(false, Ordering::SeqCst);
    }

    pub fn heal(&self, index: usize) {
        self.up[index].store(true, Ordering::SeqCst);
    }

    /// Index of a connected leader other than `except`, waiting up to `timeout`.
    pub async fn wait_for_leader(&self, except: Option<usize>, timeout: Duration) -> Option<usize> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let leader = (0..self.nodes.len()).find(|&i| {
                Some(i) != except
                    && self.up[i].load(Ordering::SeqCst)
                    && self.nodes[i].status().role == Role::Leader
            });
            if leader.is_some() || tokio::time::Instant::now() >= deadline {
                return leader;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    pub async fn shutdown(self) {
        for node in self.nodes {
            node.shutdown().await;
        }
    }
}
