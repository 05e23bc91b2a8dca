//! Leader command pipeline.
//!
//! A client command moves through four stages, each a task joined to the next
//! by a bounded channel: encode (assign index and term), persist (journal and
//! log), replicate (queue to every peer) and finalize (commit, execute, apply,
//! reply). Every stage handles events in submission order, so indices are
//! assigned, persisted and applied in one global order.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error};

use crate::codec;
use crate::command::NodeCommand;
use crate::config::{CommitPolicy, NodeOptions};
use crate::error::{Error, Result};
use crate::journal::{BlockMetadata, Journal};
use crate::machine::StateMachine;
use crate::replication::ReplicatorHandle;
use crate::runtime::NodeHandle;
use crate::state::quorum;
use crate::storage::ReplicatedLog;
use crate::types::{LogEntry, LogIndex, Term};

type Reply<S> = oneshot::Sender<Result<<S as StateMachine>::Output>>;

struct Submission<S: StateMachine> {
    command: S::Command,
    reply: Reply<S>,
}

/// Last index handed out by the encode stage.
///
/// Shared with the persist stage, which rewinds it when a write fails. Every
/// rewind starts a new epoch; events encoded in an older epoch were numbered
/// past the rewound end of the log and are refused.
#[derive(Default)]
struct IndexCursor {
    assigned: Option<(Term, LogIndex)>,
    epoch: u64,
}

impl IndexCursor {
    fn assign(&mut self, term: Term, last_index: LogIndex) -> (LogIndex, u64) {
        let last = match self.assigned {
            Some((assigned_term, index)) if assigned_term == term => index.max(last_index),
            _ => last_index,
        };
        let index = last.next();
        self.assigned = Some((term, index));
        (index, self.epoch)
    }

    fn rewind(&mut self) {
        self.assigned = None;
        self.epoch += 1;
    }
}

/// One command in flight between stages.
struct PipelineEvent<S: StateMachine> {
    command: S::Command,
    /// Set by the encode stage.
    entry: Option<LogEntry>,
    /// Cursor epoch the entry was numbered in.
    epoch: u64,
    acks: Vec<oneshot::Receiver<bool>>,
    reply: Reply<S>,
}

impl<S: StateMachine> PipelineEvent<S> {
    fn fail(self, error: Error) {
        // The client may have stopped waiting.
        let _ = self.reply.send(Err(error));
    }
}

/// Handle to the running pipeline of a leader.
pub struct CommandPipeline<S: StateMachine> {
    node: NodeHandle,
    submissions: mpsc::Sender<Submission<S>>,
    stages: Vec<JoinHandle<()>>,
}

impl<S: StateMachine> CommandPipeline<S> {
    pub fn spawn<L: ReplicatedLog>(
        node: NodeHandle,
        log: Arc<L>,
        journal: Arc<dyn Journal>,
        replicators: Vec<ReplicatorHandle>,
        machine: Arc<Mutex<S>>,
        options: &NodeOptions,
    ) -> Self {
        let capacity = options.pipeline.capacity;
        let (submissions, submitted) = mpsc::channel(capacity);
        let (encoded_tx, encoded) = mpsc::channel(capacity);
        let (persisted_tx, persisted) = mpsc::channel(capacity);
        let (replicated_tx, replicated) = mpsc::channel(capacity);

        let required_acks = match options.replication.commit_policy {
            CommitPolicy::Quorum => quorum(replicators.len() + 1) - 1,
            CommitPolicy::Immediate => 0,
        };

        let cursor = Arc::new(Mutex::new(IndexCursor::default()));
        let stages = vec![
            tokio::spawn(encode(
                node.clone(),
                Arc::clone(&log),
                Arc::clone(&cursor),
                submitted,
                encoded_tx,
            )),
            tokio::spawn(persist(
                Arc::clone(&log),
                cursor,
                journal,
                options.pipeline.max_batch,
                encoded,
                persisted_tx,
            )),
            tokio::spawn(replicate(replicators, persisted, replicated_tx)),
            tokio::spawn(finalize(node.clone(), log, machine, required_acks, replicated)),
        ];

        Self {
            node,
            submissions,
            stages,
        }
    }

    /// Run `command` through the log and the state machine.
    ///
    /// Fails with [`Error::NotLeader`] without submitting anything when this
    /// node is not the leader. Execution failures come back as
    /// [`Error::Execution`]; the entry stays committed either way.
    pub async fn execute_command(&self, command: S::Command) -> Result<S::Output> {
        let status = self.node.status();
        if !status.role.is_leader() {
            return Err(Error::NotLeader {
                leader: status.leader_id,
            });
        }

        let (reply, outcome) = oneshot::channel();
        self.submissions
            .send(Submission { command, reply })
            .await
            .map_err(|_| Error::Stopped)?;
        outcome.await.map_err(|_| Error::Stopped)?
    }

    /// Stop accepting commands and wait for in-flight ones to drain.
    pub async fn close(self) {
        drop(self.submissions);
        for stage in self.stages {
            let _ = stage.await;
        }
    }
}

async fn encode<S: StateMachine, L: ReplicatedLog>(
    node: NodeHandle,
    log: Arc<L>,
    cursor: Arc<Mutex<IndexCursor>>,
    mut submitted: mpsc::Receiver<Submission<S>>,
    next: mpsc::Sender<PipelineEvent<S>>,
) {
    while let Some(Submission { command, reply }) = submitted.recv().await {
        let event = PipelineEvent {
            command,
            entry: None,
            epoch: 0,
            acks: Vec::new(),
            reply,
        };
        let status = node.status();
        if !status.role.is_leader() {
            event.fail(Error::NotLeader {
                leader: status.leader_id,
            });
            continue;
        }

        let term = status.current_term;
        let encoded = {
            let mut cursor = cursor.lock();
            let (index, epoch) = cursor.assign(term, log.last_index());
            match codec::encode_entry(index, term, &event.command) {
                Ok(entry) => Ok((entry, epoch)),
                Err(e) => {
                    // Hand the index back; nothing was sent for it.
                    cursor.assigned = Some((term, index.prev()));
                    Err(e)
                }
            }
        };

        match encoded {
            Ok((entry, epoch)) => {
                debug!(index = %entry.index, term = %term, "command encoded");
                let event = PipelineEvent {
                    entry: Some(entry),
                    epoch,
                    ..event
                };
                if next.send(event).await.is_err() {
                    break;
                }
            }
            Err(e) => event.fail(e),
        }
    }
}

async fn persist<S: StateMachine, L: ReplicatedLog>(
    log: Arc<L>,
    cursor: Arc<Mutex<IndexCursor>>,
    journal: Arc<dyn Journal>,
    max_batch: usize,
    mut encoded: mpsc::Receiver<PipelineEvent<S>>,
    next: mpsc::Sender<PipelineEvent<S>>,
) {
    while let Some(first) = encoded.recv().await {
        let mut batch = vec![first];
        while batch.len() < max_batch {
            match encoded.try_recv() {
                Ok(event) => batch.push(event),
                Err(_) => break,
            }
        }

        let epoch = cursor.lock().epoch;
        let mut ready = Vec::with_capacity(batch.len());
        for event in batch {
            if event.entry.is_none() {
                event.fail(Error::invariant("persist stage received an event without an entry"));
            } else if event.epoch != epoch {
                event.fail(Error::Execution(
                    "an earlier write failed, command was not written".into(),
                ));
            } else {
                ready.push(event);
            }
        }
        if ready.is_empty() {
            continue;
        }

        let blocks: Vec<(Vec<u8>, BlockMetadata)> = ready
            .iter()
            .filter_map(|event| event.entry.as_ref())
            .map(|entry| (entry.payload.clone(), BlockMetadata::log_entry()))
            .collect();
        let journal = Arc::clone(&journal);
        let written = tokio::task::spawn_blocking(move || journal.write_blocks(&blocks)).await;
        let failure = match written {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e.to_string()),
            Err(e) => Some(e.to_string()),
        };
        if let Some(failure) = failure {
            error!(error = %failure, count = ready.len(), "journal write failed");
            cursor.lock().rewind();
            for event in ready {
                event.fail(Error::Execution(format!("journal write failed: {failure}")));
            }
            continue;
        }

        let mut rewound = false;
        for event in ready {
            if rewound {
                event.fail(Error::Execution(
                    "an earlier write failed, command was not written".into(),
                ));
                continue;
            }
            let stored = match &event.entry {
                Some(entry) => log.set_entry(entry.index, entry.term, Some(entry.payload.clone())),
                None => Err(Error::invariant("entry vanished between persist steps")),
            };
            match stored {
                Ok(()) => {
                    if next.send(event).await.is_err() {
                        return;
                    }
                }
                Err(e) => {
                    error!(error = %e, "log write failed");
                    cursor.lock().rewind();
                    rewound = true;
                    event.fail(e);
                }
            }
        }
    }
}

async fn replicate<S: StateMachine>(
    replicators: Vec<ReplicatorHandle>,
    mut persisted: mpsc::Receiver<PipelineEvent<S>>,
    next: mpsc::Sender<PipelineEvent<S>>,
) {
    while let Some(mut event) = persisted.recv().await {
        if let Some(entry) = &event.entry {
            for replicator in &replicators {
                match replicator.replicate(entry.index, entry.term) {
                    Some(ack) => event.acks.push(ack),
                    None => debug!(peer = %replicator.peer(), "replicator stopped"),
                }
            }
        }
        if next.send(event).await.is_err() {
            break;
        }
    }
}

/// Wait until `required` peers acknowledge. `false` once that is impossible.
async fn await_quorum(acks: Vec<oneshot::Receiver<bool>>, required: usize) -> bool {
    if required == 0 {
        return true;
    }
    let mut pending = JoinSet::new();
    for ack in acks {
        pending.spawn(async move { ack.await.unwrap_or(false) });
    }
    let mut granted = 0;
    while let Some(acked) = pending.join_next().await {
        if matches!(acked, Ok(true)) {
            granted += 1;
            if granted >= required {
                return true;
            }
        }
    }
    false
}

/// Apply committed entries from earlier terms that precede `index`.
async fn apply_backlog<S: StateMachine, L: ReplicatedLog>(
    node: &NodeHandle,
    log: &L,
    machine: &Mutex<S>,
    index: LogIndex,
) -> Result<()> {
    let applied = node.status().last_applied;
    if applied.next() >= index {
        return Ok(());
    }
    for pending in applied.next().through(index.prev()) {
        let Some(payload) = log.entry_at(pending) else {
            return Err(Error::invariant(format!("committed entry {pending} has no payload")));
        };
        let command = codec::CommandRecord::decode(&payload)?.command::<S::Command>()?;
        if let Err(e) = machine.lock().apply(command) {
            debug!(index = %pending, error = %e, "earlier command failed");
        }
        node.execute(NodeCommand::ApplyEntry { index: pending }).await?;
    }
    Ok(())
}

async fn finalize<S: StateMachine, L: ReplicatedLog>(
    node: NodeHandle,
    log: Arc<L>,
    machine: Arc<Mutex<S>>,
    required_acks: usize,
    mut replicated: mpsc::Receiver<PipelineEvent<S>>,
) {
    while let Some(mut event) = replicated.recv().await {
        let Some(entry) = event.entry.take() else {
            event.fail(Error::invariant("finalize stage received an event without an entry"));
            continue;
        };
        let acks = std::mem::take(&mut event.acks);
        if !await_quorum(acks, required_acks).await {
            error!(index = %entry.index, "quorum not reached");
            event.fail(Error::QuorumLost { index: entry.index });
            continue;
        }

        let committed = node
            .execute(NodeCommand::CommitEntry {
                index: entry.index,
                term: entry.term,
                payload: None,
            })
            .await;
        if let Err(e) = committed {
            error!(index = %entry.index, error = %e, "commit failed");
            event.fail(e);
            continue;
        }
        if let Err(e) = apply_backlog(&node, log.as_ref(), machine.as_ref(), entry.index).await {
            error!(index = %entry.index, error = %e, "earlier entries could not be applied");
            event.fail(e);
            continue;
        }

        let PipelineEvent { command, reply, .. } = event;
        let output = machine.lock().apply(command).map_err(Error::Execution);

        if let Err(e) = node.execute(NodeCommand::ApplyEntry { index: entry.index }).await {
            error!(index = %entry.index, error = %e, "apply failed");
            let _ = reply.send(Err(e));
            continue;
        }
        debug!(index = %entry.index, "command applied");
        let _ = reply.send(output);
    }
}
