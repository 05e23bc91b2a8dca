//! Per-peer replication actors.
//!
//! Each peer gets one [`PeerReplicator`] task consuming a FIFO queue of
//! replication requests, so entries reach a given peer strictly in order. The
//! queue is unbounded so an unreachable peer never holds up the leader; the
//! actor drains whatever has piled up and covers it with one AppendEntries per
//! term. The actor owns its NextIndex cursor and only reads node state; the one
//! command it ever issues is `SetNewTerm` when a peer reports a newer term.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::command::NodeCommand;
use crate::config::ReplicationConfig;
use crate::node::NodeStatus;
use crate::runtime::NodeHandle;
use crate::state::Role;
use crate::storage::ReplicatedLog;
use crate::transport::RaftClient;
use crate::types::{AppendEntries, LogIndex, NodeId, Term};

/// Most entries carried by a single heartbeat.
const MAX_HEARTBEAT_ENTRIES: u64 = 64;

/// Ask a peer to hold every entry through `index`.
#[derive(Debug)]
pub struct ReplicationRequest {
    pub index: LogIndex,
    /// Leader term the entry was created in.
    pub term: Term,
    /// `true` once the peer has acknowledged the entry.
    pub ack: oneshot::Sender<bool>,
}

/// Sending side of one peer's queue.
#[derive(Clone)]
pub struct ReplicatorHandle {
    peer: NodeId,
    requests: mpsc::UnboundedSender<ReplicationRequest>,
}

impl ReplicatorHandle {
    pub fn peer(&self) -> NodeId {
        self.peer
    }

    /// Queue a request without waiting. Returns the acknowledgement receiver,
    /// or `None` when the actor has stopped.
    pub fn replicate(&self, index: LogIndex, term: Term) -> Option<oneshot::Receiver<bool>> {
        let (ack, acked) = oneshot::channel();
        self.requests
            .send(ReplicationRequest { index, term, ack })
            .ok()?;
        Some(acked)
    }
}

enum Outcome {
    Replicated,
    /// The peer cannot take the entry from this leader.
    Rejected,
    /// This node no longer leads the request's term.
    Stale,
}

pub struct PeerReplicator<L> {
    peer: NodeId,
    node: NodeHandle,
    log: Arc<L>,
    client: Arc<dyn RaftClient>,
    config: ReplicationConfig,
    heartbeat: Duration,
    next_index: LogIndex,
    /// Leader term `next_index` was initialized for.
    leader_term: Option<Term>,
}

impl<L: ReplicatedLog> PeerReplicator<L> {
    pub fn new(
        peer: NodeId,
        node: NodeHandle,
        log: Arc<L>,
        client: Arc<dyn RaftClient>,
        config: ReplicationConfig,
        heartbeat: Duration,
    ) -> Self {
        let status = node.status();
        Self {
            peer,
            node,
            log,
            client,
            config,
            heartbeat,
            next_index: status.commit_index.next(),
            leader_term: status.role.is_leader().then_some(status.current_term),
        }
    }

    pub fn next_index(&self) -> LogIndex {
        self.next_index
    }

    pub fn spawn(self) -> (ReplicatorHandle, JoinHandle<()>) {
        let (requests, inbox) = mpsc::unbounded_channel();
        let handle = ReplicatorHandle {
            peer: self.peer,
            requests,
        };
        (handle, tokio::spawn(self.run(inbox)))
    }

    async fn run(mut self, mut inbox: mpsc::UnboundedReceiver<ReplicationRequest>) {
        loop {
            match tokio::time::timeout(self.heartbeat, inbox.recv()).await {
                Ok(Some(first)) => {
                    let mut batch = vec![first];
                    while let Ok(request) = inbox.try_recv() {
                        batch.push(request);
                    }
                    self.serve(batch).await;
                }
                Ok(None) => break,
                Err(_) => self.heartbeat().await,
            }
            if self.node.status().role == Role::Final {
                break;
            }
        }
        debug!(peer = %self.peer, "replicator stopped");
    }

    /// Answer queued requests in order. A run of requests from the same term is
    /// covered by one replication through the highest index among them.
    async fn serve(&mut self, batch: Vec<ReplicationRequest>) {
        let mut queued = batch.into_iter().peekable();
        while let Some(first) = queued.next() {
            let term = first.term;
            let mut through = first.index;
            let mut group = vec![first];
            while let Some(request) = queued.next_if(|r| r.term == term) {
                through = through.max(request.index);
                group.push(request);
            }

            let acked = matches!(self.replicate(through, term).await, Outcome::Replicated);
            for request in group {
                // The pipeline may have stopped waiting.
                let _ = request.ack.send(acked);
            }
        }
    }

    /// Re-initialize the cursor when a new leader term is observed.
    fn observe(&mut self, status: &NodeStatus) {
        if self.leader_term != Some(status.current_term) {
            self.leader_term = Some(status.current_term);
            self.next_index = status.commit_index.next();
            debug!(
                peer = %self.peer,
                term = %status.current_term,
                next = %self.next_index,
                "replication cursor reset"
            );
        }
    }

    fn leading(&self, term: Term) -> Option<NodeStatus> {
        let status = self.node.status();
        (status.role.is_leader() && status.current_term == term).then_some(status)
    }

    /// Entries `next_index..=through`, oldest first.
    fn collect_entries(&self, through: LogIndex) -> Option<Vec<Vec<u8>>> {
        self.next_index
            .through(through)
            .map(|index| self.log.entry_at(index))
            .collect()
    }

    fn build_request(&self, status: &NodeStatus, through: LogIndex) -> Option<AppendEntries> {
        let prev_log_index = self.next_index.prev();
        let Some(prev_log_term) = self.log.term_at(prev_log_index) else {
            error!(peer = %self.peer, index = %prev_log_index, "previous entry missing from log");
            return None;
        };
        let Some(entries) = self.collect_entries(through) else {
            error!(peer = %self.peer, through = %through, "entry payload missing from log");
            return None;
        };
        Some(AppendEntries {
            term: status.current_term,
            leader_id: status.id,
            prev_log_index,
            prev_log_term,
            entries,
            leader_commit: status.commit_index.min(through),
        })
    }

    async fn step_down(&self, term: Term) {
        warn!(peer = %self.peer, term = %term, "peer reports a newer term, election expected");
        if let Err(e) = self.node.execute(NodeCommand::SetNewTerm { term }).await {
            debug!(peer = %self.peer, error = %e, "step down skipped");
        }
    }

    async fn replicate(&mut self, index: LogIndex, term: Term) -> Outcome {
        let mut attempt = 0;
        loop {
            let Some(status) = self.leading(term) else {
                return Outcome::Stale;
            };
            self.observe(&status);
            if self.next_index > index {
                // A heartbeat already carried it.
                return Outcome::Replicated;
            }
            let Some(request) = self.build_request(&status, index) else {
                return Outcome::Rejected;
            };
            debug!(
                peer = %self.peer,
                prev = %request.prev_log_index,
                count = request.entries.len(),
                "append entries"
            );

            match self.client.append_entries(request).await {
                Ok(response) if response.success => {
                    self.next_index = index.next();
                    return Outcome::Replicated;
                }
                Ok(response) => {
                    if response.term > term {
                        self.step_down(response.term).await;
                        return Outcome::Stale;
                    }
                    if self.next_index == LogIndex::FIRST {
                        warn!(peer = %self.peer, index = %index, "log mismatch at first entry");
                        return Outcome::Rejected;
                    }
                    self.next_index = self.next_index.prev();
                    attempt = 0;
                }
                Err(e) => {
                    let delay = self.config.backoff(attempt);
                    error!(peer = %self.peer, index = %index, error = %e, ?delay, "append entries failed");
                    tokio::time::sleep(delay).await;
                    attempt = attempt.saturating_add(1);
                }
            }
        }
    }

    /// One empty or catch-up AppendEntries while leading.
    async fn heartbeat(&mut self) {
        let status = self.node.status();
        if !status.role.is_leader() {
            return;
        }
        self.observe(&status);

        let last = self.log.last_index();
        let through = last.min(LogIndex::from(
            self.next_index.get() + MAX_HEARTBEAT_ENTRIES - 1,
        ));
        let Some(request) = self.build_request(&status, through) else {
            return;
        };

        match self.client.append_entries(request).await {
            Ok(response) if response.success => {
                self.next_index = self.next_index.max(through.next());
            }
            Ok(response) if response.term > status.current_term => {
                self.step_down(response.term).await;
            }
            Ok(_) => {
                if self.next_index > LogIndex::FIRST {
                    self.next_index = self.next_index.prev();
                }
            }
            Err(e) => debug!(peer = %self.peer, error = %e, "heartbeat failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use async_trait::async_trait;
    use parking_lot::Mutex;

    use super::*;
    use crate::node::NodeState;
    use crate::runtime;
    use crate::storage::MemoryLog;
    use crate::transport::TransportError;
    use crate::types::{AppendEntriesResponse, RequestVote, RequestVoteResponse};

    /// Answers AppendEntries from a script, recording every request.
    #[derive(Default)]
    struct ScriptedClient {
        replies: Mutex<VecDeque<Result<AppendEntriesResponse, TransportError>>>,
        seen: Mutex<Vec<AppendEntries>>,
    }

    impl ScriptedClient {
        fn new(replies: Vec<Result<AppendEntriesResponse, TransportError>>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.into()),
                seen: Mutex::default(),
            })
        }

        fn seen(&self) -> Vec<AppendEntries> {
            self.seen.lock().clone()
        }
    }

    #[async_trait]
    impl RaftClient for ScriptedClient {
        async fn append_entries(
            &self,
            request: AppendEntries,
        ) -> Result<AppendEntriesResponse, TransportError> {
            let term = request.term;
            self.seen.lock().push(request);
            self.replies.lock().pop_front().unwrap_or(Ok(AppendEntriesResponse {
                term,
                success: true,
            }))
        }

        async fn request_vote(
            &self,
            _request: RequestVote,
        ) -> Result<RequestVoteResponse, TransportError> {
            Err(TransportError::Unavailable)
        }
    }

    fn reply(term: u64, success: bool) -> Result<AppendEntriesResponse, TransportError> {
        Ok(AppendEntriesResponse {
            term: Term::from(term),
            success,
        })
    }

    /// Leader of term 1 with entries 1..=`entries` and `committed` of them committed.
    async fn leader(entries: u64, committed: u64) -> (NodeHandle, Arc<MemoryLog>) {
        let log = Arc::new(MemoryLog::new());
        let (node, _task) = runtime::spawn(NodeState::new(NodeId::from(1), Arc::clone(&log)));
        node.execute(NodeCommand::JoinCluster).await.expect("join");
        node.execute(NodeCommand::TimeoutLeaderHeartbeat)
            .await
            .expect("timeout");
        node.execute(NodeCommand::WinCandidateElection)
            .await
            .expect("win");
        for index in 1..=entries {
            log.set_entry(LogIndex::from(index), Term::from(1), Some(vec![index as u8]))
                .expect("set");
        }
        for index in 1..=committed {
            node.execute(NodeCommand::CommitEntry {
                index: LogIndex::from(index),
                term: Term::from(1),
                payload: None,
            })
            .await
            .expect("commit");
        }
        (node, log)
    }

    fn replicator(
        node: &NodeHandle,
        log: &Arc<MemoryLog>,
        client: Arc<ScriptedClient>,
    ) -> PeerReplicator<MemoryLog> {
        PeerReplicator::new(
            NodeId::from(2),
            node.clone(),
            Arc::clone(log),
            client,
            ReplicationConfig {
                initial_backoff: Duration::from_millis(1),
                max_backoff: Duration::from_millis(4),
                ..ReplicationConfig::default()
            },
            Duration::from_secs(60),
        )
    }

    #[tokio::test]
    async fn next_index_starts_after_commit_index() {
        let (node, log) = leader(5, 4).await;
        let replicator = replicator(&node, &log, ScriptedClient::new(vec![]));
        assert_eq!(replicator.next_index(), LogIndex::from(5));
    }

    #[tokio::test]
    async fn mismatch_backtracks_and_resends_in_order() {
        let (node, log) = leader(5, 4).await;
        let client = ScriptedClient::new(vec![reply(1, false), reply(1, true)]);
        let mut replicator = replicator(&node, &log, Arc::clone(&client));

        let outcome = replicator.replicate(LogIndex::from(5), Term::from(1)).await;

        assert!(matches!(outcome, Outcome::Replicated));
        assert_eq!(replicator.next_index(), LogIndex::from(6));

        let seen = client.seen();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].prev_log_index, LogIndex::from(4));
        assert_eq!(seen[0].entries, vec![vec![5]]);
        assert_eq!(seen[1].prev_log_index, LogIndex::from(3));
        assert_eq!(seen[1].prev_log_term, Term::from(1));
        assert_eq!(seen[1].entries, vec![vec![4], vec![5]]);
        assert_eq!(seen[1].leader_commit, LogIndex::from(4));
    }

    #[tokio::test]
    async fn backtracking_stops_at_first_index() {
        let (node, log) = leader(1, 0).await;
        let client = ScriptedClient::new(vec![reply(1, false)]);
        let mut replicator = replicator(&node, &log, Arc::clone(&client));

        let outcome = replicator.replicate(LogIndex::from(1), Term::from(1)).await;

        assert!(matches!(outcome, Outcome::Rejected));
        assert_eq!(replicator.next_index(), LogIndex::FIRST);
        assert_eq!(client.seen().len(), 1);
    }

    #[tokio::test]
    async fn higher_term_reply_steps_down() {
        let (node, log) = leader(1, 0).await;
        let client = ScriptedClient::new(vec![reply(7, false)]);
        let mut replicator = replicator(&node, &log, client);

        let outcome = replicator.replicate(LogIndex::from(1), Term::from(1)).await;

        assert!(matches!(outcome, Outcome::Stale));
        let status = node.status();
        assert_eq!(status.current_term, Term::from(7));
        assert_eq!(status.role, Role::Follower);
    }

    #[tokio::test]
    async fn transport_errors_are_retried() {
        let (node, log) = leader(2, 1).await;
        let client = ScriptedClient::new(vec![
            Err(TransportError::Timeout),
            Err(TransportError::Unavailable),
            reply(1, true),
        ]);
        let mut replicator = replicator(&node, &log, Arc::clone(&client));

        let outcome = replicator.replicate(LogIndex::from(2), Term::from(1)).await;

        assert!(matches!(outcome, Outcome::Replicated));
        assert_eq!(client.seen().len(), 3);
    }

    #[tokio::test]
    async fn queued_requests_are_covered_by_one_append() {
        let (node, log) = leader(3, 0).await;
        let client = ScriptedClient::new(vec![]);
        let (handle, _task) = replicator(&node, &log, Arc::clone(&client)).spawn();

        // Nothing yields before the actor first runs, so all three are queued.
        let acks: Vec<_> = (1..=3)
            .map(|index| {
                handle
                    .replicate(LogIndex::from(index), Term::from(1))
                    .expect("queued")
            })
            .collect();
        for ack in acks {
            assert!(ack.await.expect("ack"));
        }

        let seen = client.seen();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].entries, vec![vec![1], vec![2], vec![3]]);
    }

    #[tokio::test]
    async fn unreachable_peer_never_blocks_the_sender() {
        let (node, log) = leader(1, 0).await;
        let failures = (0..10_000).map(|_| Err(TransportError::Unavailable)).collect();
        let client = ScriptedClient::new(failures);
        let (handle, _task) = replicator(&node, &log, Arc::clone(&client)).spawn();

        let mut acks = Vec::new();
        for _ in 0..1_000 {
            acks.push(
                handle
                    .replicate(LogIndex::from(1), Term::from(1))
                    .expect("queued"),
            );
            tokio::task::yield_now().await;
        }

        node.execute(NodeCommand::SetNewTerm { term: Term::from(2) })
            .await
            .expect("step down");
        for ack in acks {
            assert!(!ack.await.expect("ack"));
        }
    }

    #[tokio::test]
    async fn stale_term_requests_are_not_sent() {
        let (node, log) = leader(1, 0).await;
        let client = ScriptedClient::new(vec![]);
        let mut replicator = replicator(&node, &log, Arc::clone(&client));

        let outcome = replicator.replicate(LogIndex::from(1), Term::from(0)).await;

        assert!(matches!(outcome, Outcome::Stale));
        assert!(client.seen().is_empty());
    }

    #[tokio::test]
    async fn heartbeat_carries_pending_entries() {
        let (node, log) = leader(2, 1).await;
        let client = ScriptedClient::new(vec![]);
        let mut replicator = replicator(&node, &log, Arc::clone(&client));

        replicator.heartbeat().await;

        let seen = client.seen();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].prev_log_index, LogIndex::from(1));
        assert_eq!(seen[0].entries, vec![vec![2]]);
        assert_eq!(replicator.next_index(), LogIndex::from(3));
    }
}
