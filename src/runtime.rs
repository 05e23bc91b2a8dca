//! Mailbox around [`NodeState`].
//!
//! The node state machine runs on a single task that consumes commands in
//! arrival order. Everything else talks to it through a [`NodeHandle`]: commands
//! go in over an mpsc channel, and a watch channel publishes the status after
//! each command so readers never touch the state directly.

use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::command::NodeCommand;
use crate::error::{Error, Result};
use crate::node::{NodeState, NodeStatus};
use crate::storage::ReplicatedLog;
use crate::types::Term;

const MAILBOX_CAPACITY: usize = 1024;

type Envelope = (NodeCommand, oneshot::Sender<Result<()>>);

/// Cloneable handle to a running node actor.
#[derive(Clone)]
pub struct NodeHandle {
    commands: mpsc::Sender<Envelope>,
    status: watch::Receiver<NodeStatus>,
    terms: broadcast::Sender<Term>,
}

impl NodeHandle {
    /// Run `command` on the node and wait for its outcome.
    pub async fn execute(&self, command: NodeCommand) -> Result<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send((command, reply_tx))
            .await
            .map_err(|_| Error::Stopped)?;
        reply_rx.await.map_err(|_| Error::Stopped)?
    }

    /// Latest published status.
    pub fn status(&self) -> NodeStatus {
        self.status.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<NodeStatus> {
        self.status.clone()
    }

    pub fn subscribe_terms(&self) -> broadcast::Receiver<Term> {
        self.terms.subscribe()
    }
}

/// Start the actor task owning `state`.
pub fn spawn<L: ReplicatedLog>(state: NodeState<L>) -> (NodeHandle, JoinHandle<()>) {
    let (commands, inbox) = mpsc::channel(MAILBOX_CAPACITY);
    let (status_tx, status) = watch::channel(state.status().clone());
    let terms = state.term_sender();

    let task = tokio::spawn(run(state, inbox, status_tx));
    (
        NodeHandle {
            commands,
            status,
            terms,
        },
        task,
    )
}

async fn run<L: ReplicatedLog>(
    mut state: NodeState<L>,
    mut inbox: mpsc::Receiver<Envelope>,
    status: watch::Sender<NodeStatus>,
) {
    while let Some((command, reply)) = inbox.recv().await {
        let result = state.handle(command);
        status.send_if_modified(|published| {
            if published == state.status() {
                false
            } else {
                *published = state.status().clone();
                true
            }
        });
        // The caller may have given up waiting.
        let _ = reply.send(result);
    }
    debug!(node = %state.status().id, "node mailbox closed");
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::state::Role;
    use crate::storage::MemoryLog;
    use crate::types::{LogIndex, NodeId};

    #[tokio::test]
    async fn commands_update_published_status() {
        let state = NodeState::new(NodeId::from(1), Arc::new(MemoryLog::new()));
        let (node, _task) = spawn(state);

        node.execute(NodeCommand::CreateCluster).await.expect("create");

        let status = node.status();
        assert_eq!(status.role, Role::Leader);
        assert_eq!(status.commit_index, LogIndex::ZERO);
    }

    #[tokio::test]
    async fn handler_errors_reach_the_caller() {
        let state = NodeState::new(NodeId::from(1), Arc::new(MemoryLog::new()));
        let (node, _task) = spawn(state);
        node.execute(NodeCommand::JoinCluster).await.expect("join");
        node.execute(NodeCommand::SetNewTerm { term: Term::from(4) })
            .await
            .expect("term");

        let err = node
            .execute(NodeCommand::SetNewTerm { term: Term::from(2) })
            .await
            .expect_err("regression");
        assert!(matches!(err, Error::InvariantViolation(_)));
        assert_eq!(node.status().current_term, Term::from(4));
    }

    #[tokio::test]
    async fn term_changes_are_broadcast() {
        let state = NodeState::new(NodeId::from(1), Arc::new(MemoryLog::new()));
        let (node, _task) = spawn(state);
        let mut terms = node.subscribe_terms();

        node.execute(NodeCommand::JoinCluster).await.expect("join");
        node.execute(NodeCommand::TimeoutLeaderHeartbeat)
            .await
            .expect("timeout");

        assert_eq!(terms.recv().await.expect("term"), Term::from(1));
    }
}
