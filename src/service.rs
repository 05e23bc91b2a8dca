//! Inbound AppendEntries and RequestVote handling.
//!
//! Inbound RPCs are handled one at a time. Accepted entries are handed to a
//! single follower task that persists them, caches their commands in the
//! [`CommandRegister`] and applies whatever the leader has committed, always
//! in index order.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::codec::CommandRecord;
use crate::command::NodeCommand;
use crate::error::{Error, Result};
use crate::journal::{BlockMetadata, Journal};
use crate::machine::StateMachine;
use crate::register::CommandRegister;
use crate::runtime::NodeHandle;
use crate::state::Role;
use crate::storage::ReplicatedLog;
use crate::timer::ElectionTimer;
use crate::transport::RaftRpc;
use crate::types::{
    AppendEntries, AppendEntriesResponse, LogIndex, RequestVote, RequestVoteResponse, Term,
};

const FOLLOWER_QUEUE: usize = 256;

enum FollowerWork {
    /// Persist `records`, then apply through `commit_through`.
    Batch {
        leader_term: Term,
        records: Vec<(CommandRecord, Vec<u8>)>,
        commit_through: LogIndex,
        persisted: oneshot::Sender<Result<()>>,
    },
    /// Apply cached commands through `through`.
    CatchUp {
        leader_term: Term,
        through: LogIndex,
        done: oneshot::Sender<Result<()>>,
    },
}

pub struct RpcService<L> {
    node: NodeHandle,
    log: Arc<L>,
    timer: Arc<ElectionTimer>,
    inbound: tokio::sync::Mutex<()>,
    work: mpsc::Sender<FollowerWork>,
}

impl<L: ReplicatedLog> RpcService<L> {
    /// Build the service and start its follower task.
    pub fn spawn<S: StateMachine>(
        node: NodeHandle,
        log: Arc<L>,
        journal: Arc<dyn Journal>,
        register: Arc<CommandRegister<S::Command>>,
        machine: Arc<Mutex<S>>,
        timer: Arc<ElectionTimer>,
    ) -> (Arc<Self>, JoinHandle<()>) {
        let (work, inbox) = mpsc::channel(FOLLOWER_QUEUE);
        let follower = Follower {
            node: node.clone(),
            log: Arc::clone(&log),
            journal,
            register,
            machine,
        };
        let task = tokio::spawn(follower.run(inbox));
        let service = Arc::new(Self {
            node,
            log,
            timer,
            inbound: tokio::sync::Mutex::new(()),
            work,
        });
        (service, task)
    }

    async fn submit<T>(&self, work: FollowerWork, outcome: oneshot::Receiver<Result<T>>) -> Result<T> {
        self.work.send(work).await.map_err(|_| Error::Stopped)?;
        outcome.await.map_err(|_| Error::Stopped)?
    }

    async fn handle_append(&self, request: AppendEntries) -> Result<AppendEntriesResponse> {
        let status = self.node.status();
        let rejected = |term| AppendEntriesResponse {
            term,
            success: false,
        };

        if request.term < status.current_term || status.role == Role::Final {
            return Ok(rejected(status.current_term));
        }
        self.timer.reset();

        if request.term > status.current_term {
            self.node
                .execute(NodeCommand::SetNewTerm { term: request.term })
                .await?;
        }
        match self.node.status().role {
            Role::Candidate => self.node.execute(NodeCommand::CancelElection).await?,
            Role::Initial => self.node.execute(NodeCommand::JoinCluster).await?,
            _ => {}
        }
        let status = self.node.status();
        if status.role != Role::Follower {
            return Err(Error::MultipleLeadersForTerm(request.term));
        }

        if self.log.term_at(request.prev_log_index) != Some(request.prev_log_term) {
            debug!(
                prev = %request.prev_log_index,
                prev_term = %request.prev_log_term,
                "log mismatch"
            );
            return Ok(rejected(status.current_term));
        }

        if status.leader_id != Some(request.leader_id) {
            self.node
                .execute(NodeCommand::SetLeaderInformation {
                    leader: request.leader_id,
                })
                .await?;
        }

        let records = request
            .entries
            .into_iter()
            .map(|bytes| CommandRecord::decode(&bytes).map(|record| (record, bytes)))
            .collect::<Result<Vec<_>>>()?;
        let last_sent = LogIndex::from(request.prev_log_index.get() + records.len() as u64);
        let commit_through = request.leader_commit.min(last_sent);

        if let Some((first, _)) = records.first() {
            let conflicting = self
                .log
                .term_at(first.index)
                .is_some_and(|stored| stored != first.term);
            if conflicting && request.prev_log_index < status.commit_index {
                warn!(
                    index = %request.prev_log_index,
                    commit = %status.commit_index,
                    "conflict behind the commit index, truncating"
                );
                self.node
                    .execute(NodeCommand::TruncateLog {
                        from: request.prev_log_index,
                    })
                    .await?;
            }

            let (persisted, outcome) = oneshot::channel();
            self.submit(
                FollowerWork::Batch {
                    leader_term: request.term,
                    records,
                    commit_through,
                    persisted,
                },
                outcome,
            )
            .await?;
        } else if status.last_applied < commit_through {
            let (done, outcome) = oneshot::channel();
            self.submit(
                FollowerWork::CatchUp {
                    leader_term: request.term,
                    through: commit_through,
                    done,
                },
                outcome,
            )
            .await?;
        }

        Ok(AppendEntriesResponse {
            term: self.node.status().current_term,
            success: true,
        })
    }

    async fn handle_vote(&self, request: RequestVote) -> Result<RequestVoteResponse> {
        let status = self.node.status();
        if request.term <= status.current_term || status.role == Role::Final {
            return Ok(RequestVoteResponse {
                term: status.current_term,
                vote_granted: false,
            });
        }

        self.node
            .execute(NodeCommand::SetNewTerm { term: request.term })
            .await?;

        let ours = (self.log.last_term(), self.log.last_index());
        let theirs = (request.last_log_term, request.last_log_index);
        let granted = theirs >= ours;
        if granted {
            self.node
                .execute(NodeCommand::GrantVote {
                    candidate: request.candidate_id,
                })
                .await?;
            self.timer.reset();
        }
        info!(
            candidate = %request.candidate_id,
            term = %request.term,
            granted,
            "vote requested"
        );

        Ok(RequestVoteResponse {
            term: request.term,
            vote_granted: granted,
        })
    }
}

#[async_trait]
impl<L: ReplicatedLog> RaftRpc for RpcService<L> {
    async fn append_entries(&self, request: AppendEntries) -> Result<AppendEntriesResponse> {
        let _serial = self.inbound.lock().await;
        self.handle_append(request).await
    }

    async fn request_vote(&self, request: RequestVote) -> Result<RequestVoteResponse> {
        let _serial = self.inbound.lock().await;
        self.handle_vote(request).await
    }
}

/// Follower-side persist and apply, run on a single task.
struct Follower<S: StateMachine, L> {
    node: NodeHandle,
    log: Arc<L>,
    journal: Arc<dyn Journal>,
    register: Arc<CommandRegister<S::Command>>,
    machine: Arc<Mutex<S>>,
}

impl<S: StateMachine, L: ReplicatedLog> Follower<S, L> {
    async fn run(self, mut inbox: mpsc::Receiver<FollowerWork>) {
        while let Some(work) = inbox.recv().await {
            match work {
                FollowerWork::Batch {
                    leader_term,
                    records,
                    commit_through,
                    persisted,
                } => {
                    let stored = self.persist(leader_term, records).await;
                    let failed = stored.is_err();
                    let _ = persisted.send(stored);
                    if failed {
                        continue;
                    }
                    if let Err(e) = self.catch_up(leader_term, commit_through).await {
                        error!(error = %e, through = %commit_through, "follower apply failed");
                    }
                }
                FollowerWork::CatchUp {
                    leader_term,
                    through,
                    done,
                } => {
                    let result = self.catch_up(leader_term, through).await;
                    if let Err(e) = &result {
                        error!(error = %e, through = %through, "follower catch-up failed");
                    }
                    let _ = done.send(result);
                }
            }
        }
        debug!("follower task stopped");
    }

    async fn persist(&self, leader_term: Term, records: Vec<(CommandRecord, Vec<u8>)>) -> Result<()> {
        let blocks: Vec<(Vec<u8>, BlockMetadata)> = records
            .iter()
            .map(|(_, bytes)| (bytes.clone(), BlockMetadata::log_entry()))
            .collect();
        let journal = Arc::clone(&self.journal);
        tokio::task::spawn_blocking(move || journal.write_blocks(&blocks))
            .await
            .map_err(|e| Error::Execution(format!("journal task failed: {e}")))??;

        for (record, bytes) in records {
            let command = record.command::<S::Command>()?;
            self.log.set_entry(record.index, record.term, Some(bytes))?;
            self.register.insert(leader_term, record.index, command);
        }
        Ok(())
    }

    /// Commit, execute and apply every entry after LastApplied through `through`.
    async fn catch_up(&self, leader_term: Term, through: LogIndex) -> Result<()> {
        let status = self.node.status();
        for index in status.last_applied.next().through(through) {
            let Some(term) = self.log.term_at(index) else {
                return Err(Error::invariant(format!("committed entry {index} is missing")));
            };
            let command = match self.register.take(leader_term, index) {
                Some(command) => command,
                None => self.stored_command(index)?,
            };

            self.node
                .execute(NodeCommand::CommitEntry {
                    index,
                    term,
                    payload: None,
                })
                .await?;
            if let Err(e) = self.machine.lock().apply(command) {
                warn!(index = %index, error = %e, "command failed on follower");
            }
            self.node.execute(NodeCommand::ApplyEntry { index }).await?;
            debug!(index = %index, "entry applied");
        }
        Ok(())
    }

    /// Decode a command from the payload kept in the log. Used when the
    /// register entry was dropped by a term change.
    fn stored_command(&self, index: LogIndex) -> Result<S::Command> {
        let Some(payload) = self.log.entry_at(index) else {
            return Err(Error::invariant(format!(
                "no pending command registered for {index}"
            )));
        };
        CommandRecord::decode(&payload)?.command()
    }
}
