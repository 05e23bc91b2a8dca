use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use rand::Rng;

use crate::error::{Error, Result};
use crate::types::NodeId;

/// Election and heartbeat timing.
#[derive(Debug, Clone)]
pub struct TimerConfig {
    /// Base election timeout; each wait is drawn from `[T, 2T)`.
    pub election_timeout: Duration,
    pub heartbeat_interval: Duration,
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            election_timeout: Duration::from_millis(300),
            heartbeat_interval: Duration::from_millis(100),
        }
    }
}

impl TimerConfig {
    pub fn random_election_timeout(&self) -> Duration {
        let base = self.election_timeout.as_millis() as u64;
        if base == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::rng().random_range(base..base * 2))
    }
}

/// When the finalize stage may commit an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CommitPolicy {
    /// Wait for a majority of the cluster, the leader included.
    #[default]
    Quorum,
    /// Commit as soon as replication has been dispatched.
    Immediate,
}

#[derive(Debug, Clone)]
pub struct ReplicationConfig {
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub commit_policy: CommitPolicy,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_secs(2),
            commit_policy: CommitPolicy::Quorum,
        }
    }
}

impl ReplicationConfig {
    /// Delay before retry number `attempt` (0-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.initial_backoff
            .checked_mul(1u32.checked_shl(attempt).unwrap_or(u32::MAX))
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Capacity of each channel between pipeline stages.
    pub capacity: usize,
    /// Most entries flushed to the journal in one write.
    pub max_batch: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            capacity: 256,
            max_batch: 64,
        }
    }
}

/// Tunables of a single node.
#[derive(Debug, Clone, Default)]
pub struct NodeOptions {
    pub timers: TimerConfig,
    pub replication: ReplicationConfig,
    pub pipeline: PipelineConfig,
}

/// Settings of the networked server.
#[derive(Debug, Clone)]
pub struct Config {
    pub id: u64,
    pub addr: String,
    /// Peers as id to address.
    pub peers: HashMap<String, String>,
    pub data_dir: PathBuf,
    pub client_addr: Option<String>,
    /// Start a new cluster with this node as its first leader.
    pub bootstrap: bool,
    /// Compress superseded term segments in the background.
    pub compaction: bool,
    pub options: NodeOptions,
}

impl Config {
    pub fn node_id(&self) -> NodeId {
        NodeId::from(self.id)
    }

    pub fn listen_addr(&self) -> Result<SocketAddr> {
        parse_addr(&self.addr)
    }

    pub fn client_addr(&self) -> Result<Option<SocketAddr>> {
        self.client_addr.as_deref().map(parse_addr).transpose()
    }

    pub fn peer_addrs(&self) -> Result<HashMap<NodeId, SocketAddr>> {
        self.peers
            .iter()
            .map(|(id, addr)| {
                let id: u64 = id
                    .parse()
                    .map_err(|_| Error::Config(format!("invalid peer id: {id}")))?;
                Ok((NodeId::from(id), parse_addr(addr)?))
            })
            .collect()
    }

    pub fn validate(&self) -> Result<()> {
        self.listen_addr()?;
        self.client_addr()?;
        let peers = self.peer_addrs()?;
        if peers.contains_key(&self.node_id()) {
            return Err(Error::Config(format!(
                "node {} lists itself as a peer",
                self.id
            )));
        }
        if self.options.pipeline.capacity == 0 || self.options.pipeline.max_batch == 0 {
            return Err(Error::Config("pipeline capacity and batch must be positive".into()));
        }
        if self.options.timers.heartbeat_interval >= self.options.timers.election_timeout {
            return Err(Error::Config(
                "heartbeat interval must be shorter than the election timeout".into(),
            ));
        }
        Ok(())
    }
}

fn parse_addr(raw: &str) -> Result<SocketAddr> {
    raw.parse()
        .map_err(|e| Error::Config(format!("invalid addr '{raw}': {e}")))
}

/// Split `ID=ADDR` command line pairs.
pub fn parse_peer_args(raw: &[String]) -> Result<HashMap<String, String>> {
    raw.iter()
        .map(|pair| {
            let (id, addr) = pair
                .split_once('=')
                .ok_or_else(|| Error::Config(format!("--peer must be ID=ADDR, got: {pair}")))?;
            Ok((id.to_string(), addr.to_string()))
        })
        .collect()
}
