use std::sync::Arc;

use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::client_api::{self, ApiResponse, Pending};
use crate::command::NodeCommand;
use crate::config::{Config, NodeOptions};
use crate::election::{self, Peer};
use crate::error::{Error, Result};
use crate::journal::{FileJournal, Journal};
use crate::kv::KvStore;
use crate::machine::StateMachine;
use crate::node::{NodeState, NodeStatus};
use crate::pipeline::CommandPipeline;
use crate::register::CommandRegister;
use crate::replication::PeerReplicator;
use crate::runtime::{self, NodeHandle};
use crate::service::RpcService;
use crate::state::Role;
use crate::storage::{self, MemoryLog, ReplicatedLog, SegmentedLog};
use crate::timer::ElectionTimer;
use crate::transport::{self, RaftClient, RaftRpc, TcpClient};
use crate::types::NodeId;

/// One Raft participant with all of its tasks running.
pub struct RaftNode<S: StateMachine, L> {
    id: NodeId,
    node: NodeHandle,
    log: Arc<L>,
    machine: Arc<Mutex<S>>,
    register: Arc<CommandRegister<S::Command>>,
    pipeline: CommandPipeline<S>,
    service: Arc<RpcService<L>>,
    tasks: Vec<JoinHandle<()>>,
}

impl<S: StateMachine, L: ReplicatedLog> RaftNode<S, L> {
    /// Start the node actor, peer replicators, pipeline, RPC service and
    /// election timer. The node stays Initial until it creates or joins a
    /// cluster.
    pub fn start(
        id: NodeId,
        log: Arc<L>,
        machine: S,
        journal: Arc<dyn Journal>,
        peers: Vec<Peer>,
        options: NodeOptions,
    ) -> Self {
        let (node, actor) = runtime::spawn(NodeState::new(id, Arc::clone(&log)));
        let mut tasks = vec![actor];

        let register = Arc::new(CommandRegister::new());
        tasks.push(tokio::spawn(
            Arc::clone(&register).follow_terms(node.subscribe_terms()),
        ));

        let mut replicators = Vec::with_capacity(peers.len());
        for (peer, client) in &peers {
            let (handle, task) = PeerReplicator::new(
                *peer,
                node.clone(),
                Arc::clone(&log),
                Arc::clone(client),
                options.replication.clone(),
                options.timers.heartbeat_interval,
            )
            .spawn();
            replicators.push(handle);
            tasks.push(task);
        }

        let machine = Arc::new(Mutex::new(machine));
        let pipeline = CommandPipeline::spawn(
            node.clone(),
            Arc::clone(&log),
            Arc::clone(&journal),
            replicators,
            Arc::clone(&machine),
            &options,
        );

        let timer = ElectionTimer::new(options.timers.clone());
        let (service, follower) = RpcService::spawn(
            node.clone(),
            Arc::clone(&log),
            journal,
            Arc::clone(&register),
            Arc::clone(&machine),
            Arc::clone(&timer),
        );
        tasks.push(follower);
        tasks.push(spawn_elections(&timer, node.clone(), Arc::clone(&log), peers));

        Self {
            id,
            node,
            log,
            machine,
            register,
            pipeline,
            service,
            tasks,
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn status(&self) -> NodeStatus {
        self.node.status()
    }

    pub fn handle(&self) -> &NodeHandle {
        &self.node
    }

    pub fn log(&self) -> &Arc<L> {
        &self.log
    }

    pub fn machine(&self) -> &Arc<Mutex<S>> {
        &self.machine
    }

    pub fn pending_commands(&self) -> usize {
        self.register.len()
    }

    /// The inbound RPC surface, for a transport to serve.
    pub fn service(&self) -> Arc<dyn RaftRpc> {
        Arc::clone(&self.service) as Arc<dyn RaftRpc>
    }

    pub async fn create_cluster(&self) -> Result<()> {
        self.node.execute(NodeCommand::CreateCluster).await
    }

    pub async fn join_cluster(&self) -> Result<()> {
        self.node.execute(NodeCommand::JoinCluster).await
    }

    pub async fn execute_command(&self, command: S::Command) -> Result<S::Output> {
        self.pipeline.execute_command(command).await
    }

    /// Move to Final and stop every task.
    pub async fn shutdown(self) {
        if let Err(e) = self.node.execute(NodeCommand::Shutdown).await {
            debug!(node = %self.id, error = %e, "shutdown command not delivered");
        }
        for task in &self.tasks {
            task.abort();
        }
        self.pipeline.close().await;
        info!(node = %self.id, "node stopped");
    }
}

fn spawn_elections<L: ReplicatedLog>(
    timer: &Arc<ElectionTimer>,
    node: NodeHandle,
    log: Arc<L>,
    peers: Vec<Peer>,
) -> JoinHandle<()> {
    let peers: Arc<[Peer]> = peers.into();
    Arc::clone(timer).spawn(move || {
        let (node, log, peers) = (node.clone(), Arc::clone(&log), Arc::clone(&peers));
        async move {
            match node.status().role {
                Role::Final => false,
                Role::Follower | Role::Candidate => {
                    if let Err(e) = election::campaign(&node, log.as_ref(), &peers).await {
                        warn!(node = %node.status().id, error = %e, "election failed");
                    }
                    true
                }
                Role::Initial | Role::Leader => true,
            }
        }
    })
}

/// A networked key-value node: RPCs over TCP, journal on disk, optional HTTP API.
pub struct Server;

impl Server {
    /// Run until ctrl-c.
    pub async fn run(config: Config) -> Result<()> {
        config.validate()?;
        if config.compaction {
            let log = Arc::new(SegmentedLog::new());
            let compaction = Arc::clone(&log);
            run_with(config, log, move |node| {
                tokio::spawn(storage::follow_terms(compaction, node.subscribe_terms()))
            })
            .await
        } else {
            run_with(config, Arc::new(MemoryLog::new()), |_| tokio::spawn(async {})).await
        }
    }
}

async fn run_with<L, F>(config: Config, log: Arc<L>, attach: F) -> Result<()>
where
    L: ReplicatedLog,
    F: FnOnce(&NodeHandle) -> JoinHandle<()>,
{
    let id = config.node_id();
    let addr = config.listen_addr()?;
    let peers: Vec<Peer> = config
        .peer_addrs()?
        .into_iter()
        .map(|(peer, addr)| (peer, Arc::new(TcpClient::new(peer, addr)) as Arc<dyn RaftClient>))
        .collect();
    let journal = Arc::new(FileJournal::open(&config.data_dir)?);
    info!(node = %id, journal = %journal.path().display(), peers = peers.len(), "starting");

    let raft = RaftNode::start(id, log, KvStore::new(), journal, peers, config.options.clone());
    let attached = attach(raft.handle());

    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| Error::Transport(e.into()))?;
    info!(node = %id, %addr, "raft rpc listening");
    let rpc = tokio::spawn(transport::serve(listener, raft.service()));

    let (client_tx, mut client_rx) = mpsc::channel::<Pending>(256);
    if let Some(client_addr) = config.client_addr()? {
        tokio::spawn(client_api::serve(client_addr, client_tx));
    } else {
        drop(client_tx);
    }

    if config.bootstrap {
        raft.create_cluster().await?;
    } else {
        raft.join_cluster().await?;
    }

    let raft = Arc::new(raft);
    let clients = {
        let raft = Arc::clone(&raft);
        tokio::spawn(async move {
            while let Some((command, reply)) = client_rx.recv().await {
                let raft = Arc::clone(&raft);
                tokio::spawn(async move {
                    let response = match raft.execute_command(command).await {
                        Ok(result) => ApiResponse::Result(result),
                        Err(Error::NotLeader { leader }) => ApiResponse::NotLeader(leader),
                        Err(e) => ApiResponse::Failed(e.to_string()),
                    };
                    let _ = reply.send(response);
                });
            }
        })
    };

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                error!(error = %e, "signal handler failed");
            }
            info!(node = %id, "shutting down");
        }
        served = rpc => {
            match served {
                Ok(Err(e)) => error!(error = %e, "rpc listener failed"),
                Ok(Ok(())) => {}
                Err(e) => error!(error = %e, "rpc task failed"),
            }
        }
    }

    clients.abort();
    attached.abort();
    match Arc::try_unwrap(raft) {
        Ok(raft) => raft.shutdown().await,
        Err(raft) => {
            raft.handle().execute(NodeCommand::Shutdown).await?;
        }
    }
    Ok(())
}
