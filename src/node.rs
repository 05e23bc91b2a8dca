use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::command::NodeCommand;
use crate::error::{Error, Result};
use crate::state::{Gate, Role};
use crate::storage::ReplicatedLog;
use crate::types::{LogIndex, NodeId, Term};

/// Capacity of the TermChanged notification channel.
const TERM_CHANNEL_CAPACITY: usize = 64;

/// Identity, term, vote, leader and commit/apply bookkeeping of one node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeStatus {
    pub id: NodeId,
    pub role: Role,
    pub current_term: Term,
    pub voted_for: Option<NodeId>,
    /// Only set while Follower.
    pub leader_id: Option<NodeId>,
    pub commit_index: LogIndex,
    pub last_applied: LogIndex,
}

/// The node state machine: sole owner of term, commit and apply counters.
///
/// Commands pass the role gate ([`Role::gate`]) and then run their handler.
/// Term, commit index and last applied never move backward, except through
/// `TruncateLog`.
pub struct NodeState<L> {
    status: NodeStatus,
    log: Arc<L>,
    term_changed: broadcast::Sender<Term>,
}

impl<L: ReplicatedLog> NodeState<L> {
    pub fn new(id: NodeId, log: Arc<L>) -> Self {
        let (term_changed, _) = broadcast::channel(TERM_CHANNEL_CAPACITY);
        Self {
            status: NodeStatus {
                id,
                role: Role::Initial,
                current_term: Term::ZERO,
                voted_for: None,
                leader_id: None,
                commit_index: LogIndex::ZERO,
                last_applied: LogIndex::ZERO,
            },
            log,
            term_changed,
        }
    }

    pub fn status(&self) -> &NodeStatus {
        &self.status
    }

    pub fn role(&self) -> Role {
        self.status.role
    }

    pub fn log(&self) -> &Arc<L> {
        &self.log
    }

    /// Receive a notification every time the current term changes.
    pub fn subscribe_terms(&self) -> broadcast::Receiver<Term> {
        self.term_changed.subscribe()
    }

    pub(crate) fn term_sender(&self) -> broadcast::Sender<Term> {
        self.term_changed.clone()
    }

    pub fn handle(&mut self, command: NodeCommand) -> Result<()> {
        let role = self.status.role;
        if role == Role::Final {
            debug!(node = %self.status.id, ?command, "ignored after shutdown");
            return Ok(());
        }

        match command {
            NodeCommand::CreateCluster => {
                // A new cluster's first leader leads term 1.
                if role == Role::Initial && self.status.current_term == Term::ZERO {
                    self.change_term(Term::from(1));
                }
                self.fire(&command);
                Ok(())
            }
            NodeCommand::JoinCluster
            | NodeCommand::WinCandidateElection
            | NodeCommand::CancelElection
            | NodeCommand::Shutdown => {
                self.fire(&command);
                Ok(())
            }
            NodeCommand::TimeoutLeaderHeartbeat => {
                if !matches!(role, Role::Follower | Role::Candidate) {
                    return Ok(());
                }
                let term = self.status.current_term.increment();
                self.change_term(term);
                self.fire(&command);
                Ok(())
            }
            NodeCommand::SetNewTerm { term } => self.set_new_term(term),
            NodeCommand::CommitEntry {
                index,
                term,
                payload,
            } => self.commit_entry(index, term, payload),
            NodeCommand::ApplyEntry { index } => self.apply_entry(index),
            NodeCommand::SetLeaderInformation { leader } => {
                if role == Role::Follower {
                    self.status.leader_id = Some(leader);
                } else {
                    debug!(node = %self.status.id, %role, leader = %leader, "leader info ignored");
                }
                Ok(())
            }
            NodeCommand::TruncateLog { from } => self.truncate_log(from),
            NodeCommand::GrantVote { candidate } => {
                self.status.voted_for = Some(candidate);
                Ok(())
            }
        }
    }

    fn fire(&mut self, command: &NodeCommand) {
        let Gate::Transition(next) = self.status.role.gate(command.kind()) else {
            return;
        };
        let previous = self.status.role;
        if previous == next {
            return;
        }
        self.status.role = next;
        if next != Role::Follower {
            self.status.leader_id = None;
        }
        info!(
            node = %self.status.id,
            term = %self.status.current_term,
            from = %previous,
            to = %next,
            "role changed"
        );
    }

    fn change_term(&mut self, term: Term) {
        self.status.current_term = term;
        self.status.voted_for = None;
        // Nobody listening is fine.
        let _ = self.term_changed.send(term);
    }

    fn set_new_term(&mut self, term: Term) -> Result<()> {
        let current = self.status.current_term;
        if term < current {
            return Err(Error::invariant(format!(
                "term regression from {current} to {term}"
            )));
        }
        if term > current {
            self.change_term(term);
        }
        self.fire(&NodeCommand::SetNewTerm { term });
        Ok(())
    }

    fn commit_entry(&mut self, index: LogIndex, term: Term, payload: Option<Vec<u8>>) -> Result<()> {
        let current = self.status.current_term;
        if term > current {
            return Err(Error::invariant(format!(
                "commit of {index} for {term} is ahead of current {current}"
            )));
        }

        match (payload, self.log.term_at(index)) {
            (Some(payload), _) => self.log.set_entry(index, term, Some(payload))?,
            (None, None) => self.log.set_entry(index, term, None)?,
            (None, Some(stored)) if stored != term => {
                return Err(Error::invariant(format!(
                    "commit of {index} for {term} conflicts with stored {stored}"
                )));
            }
            (None, Some(_)) => {}
        }
        self.status.commit_index = self.status.commit_index.max(index);
        Ok(())
    }

    fn apply_entry(&mut self, index: LogIndex) -> Result<()> {
        if index > self.status.commit_index {
            return Err(Error::invariant(format!(
                "apply of {index} beyond commit index {}",
                self.status.commit_index
            )));
        }
        self.status.last_applied = self.status.last_applied.max(index);
        Ok(())
    }

    fn truncate_log(&mut self, from: LogIndex) -> Result<()> {
        if self.status.role != Role::Follower {
            return Err(Error::invariant(format!(
                "log truncation requires follower role, node is {}",
                self.status.role
            )));
        }
        if from > self.status.commit_index {
            return Err(Error::invariant(format!(
                "truncation point {from} is beyond commit index {}",
                self.status.commit_index
            )));
        }

        self.log.truncate_from(from.next())?;
        self.status.commit_index = from;
        self.status.last_applied = from;
        info!(node = %self.status.id, index = %from, "log truncated");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryLog;

    fn node() -> NodeState<MemoryLog> {
        NodeState::new(NodeId::from(1), Arc::new(MemoryLog::new()))
    }

    fn follower() -> NodeState<MemoryLog> {
        let mut node = node();
        node.handle(NodeCommand::JoinCluster).expect("join");
        node
    }

    fn commit(node: &mut NodeState<MemoryLog>, index: u64, term: u64) -> Result<()> {
        node.handle(NodeCommand::CommitEntry {
            index: LogIndex::from(index),
            term: Term::from(term),
            payload: Some(vec![index as u8]),
        })
    }

    #[test]
    fn create_cluster_makes_leader() {
        let mut node = node();
        assert_eq!(node.role(), Role::Initial);

        node.handle(NodeCommand::CreateCluster).expect("create");

        assert_eq!(node.role(), Role::Leader);
        assert_eq!(node.status().current_term, Term::from(1));
        assert_eq!(node.status().commit_index, LogIndex::ZERO);
        assert_eq!(node.status().last_applied, LogIndex::ZERO);
    }

    #[test]
    fn set_new_term_is_monotonic() {
        let mut node = follower();
        for term in [1u64, 3, 3, 7] {
            node.handle(NodeCommand::SetNewTerm { term: Term::from(term) })
                .expect("advance");
            assert_eq!(node.status().current_term, Term::from(term));
        }

        let err = node
            .handle(NodeCommand::SetNewTerm { term: Term::from(6) })
            .expect_err("regression");
        assert!(matches!(err, Error::InvariantViolation(_)));
        assert_eq!(node.status().current_term, Term::from(7));
    }

    #[test]
    fn set_new_term_notifies_and_steps_down() {
        let mut node = node();
        let mut terms = node.subscribe_terms();
        node.handle(NodeCommand::CreateCluster).expect("create");

        node.handle(NodeCommand::SetNewTerm { term: Term::from(2) })
            .expect("term");

        assert_eq!(node.role(), Role::Follower);
        assert_eq!(terms.try_recv().expect("bootstrap"), Term::from(1));
        assert_eq!(terms.try_recv().expect("notified"), Term::from(2));
    }

    #[test]
    fn commit_index_never_decreases() {
        let mut node = follower();
        node.handle(NodeCommand::SetNewTerm { term: Term::from(1) })
            .expect("term");

        for index in [1u64, 2, 3] {
            commit(&mut node, index, 1).expect("commit");
        }
        commit(&mut node, 2, 1).expect("late commit accepted");

        assert_eq!(node.status().commit_index, LogIndex::from(3));
    }

    #[test]
    fn commit_for_future_term_fails() {
        let mut node = follower();
        let err = commit(&mut node, 1, 1).expect_err("future term");
        assert!(matches!(err, Error::InvariantViolation(_)));
        assert_eq!(node.status().commit_index, LogIndex::ZERO);
    }

    #[test]
    fn commit_stores_entry_in_log() {
        let mut node = follower();
        node.handle(NodeCommand::SetNewTerm { term: Term::from(2) })
            .expect("term");
        commit(&mut node, 1, 2).expect("commit");

        assert_eq!(node.log().term_at(LogIndex::from(1)), Some(Term::from(2)));
        assert_eq!(node.log().entry_at(LogIndex::from(1)), Some(vec![1]));
    }

    #[test]
    fn commit_without_payload_keeps_a_newer_entry() {
        let mut node = follower();
        node.handle(NodeCommand::SetNewTerm { term: Term::from(2) })
            .expect("term");
        for index in [1u64, 2] {
            node.log()
                .set_entry(LogIndex::from(index), Term::from(2), Some(vec![index as u8]))
                .expect("store");
        }

        let err = node
            .handle(NodeCommand::CommitEntry {
                index: LogIndex::from(1),
                term: Term::from(1),
                payload: None,
            })
            .expect_err("stale commit");

        assert!(matches!(err, Error::InvariantViolation(_)));
        assert_eq!(node.status().commit_index, LogIndex::ZERO);
        assert_eq!(node.log().term_at(LogIndex::from(1)), Some(Term::from(2)));
        assert_eq!(node.log().last_index(), LogIndex::from(2));
    }

    #[test]
    fn last_applied_never_decreases() {
        let mut node = follower();
        node.handle(NodeCommand::SetNewTerm { term: Term::from(1) })
            .expect("term");
        for index in 1..=3 {
            commit(&mut node, index, 1).expect("commit");
        }

        node.handle(NodeCommand::ApplyEntry { index: LogIndex::from(3) })
            .expect("apply");
        node.handle(NodeCommand::ApplyEntry { index: LogIndex::from(1) })
            .expect("apply");

        assert_eq!(node.status().last_applied, LogIndex::from(3));
    }

    #[test]
    fn apply_beyond_commit_fails() {
        let mut node = follower();
        let err = node
            .handle(NodeCommand::ApplyEntry { index: LogIndex::from(1) })
            .expect_err("beyond commit");
        assert!(matches!(err, Error::InvariantViolation(_)));
    }

    #[test]
    fn heartbeat_timeout_starts_election() {
        let mut node = follower();
        let mut terms = node.subscribe_terms();
        node.handle(NodeCommand::SetLeaderInformation { leader: NodeId::from(2) })
            .expect("leader");

        node.handle(NodeCommand::TimeoutLeaderHeartbeat).expect("timeout");

        assert_eq!(node.role(), Role::Candidate);
        assert_eq!(node.status().current_term, Term::from(1));
        assert_eq!(node.status().leader_id, None);
        assert_eq!(terms.try_recv().expect("notified"), Term::from(1));
    }

    #[test]
    fn leader_ignores_heartbeat_timeout() {
        let mut node = node();
        node.handle(NodeCommand::CreateCluster).expect("create");
        node.handle(NodeCommand::TimeoutLeaderHeartbeat).expect("ignored");

        assert_eq!(node.role(), Role::Leader);
        assert_eq!(node.status().current_term, Term::from(1));
    }

    #[test]
    fn candidate_wins_or_cancels() {
        let mut node = follower();
        node.handle(NodeCommand::TimeoutLeaderHeartbeat).expect("timeout");
        node.handle(NodeCommand::WinCandidateElection).expect("win");
        assert_eq!(node.role(), Role::Leader);

        let mut other = follower();
        other.handle(NodeCommand::TimeoutLeaderHeartbeat).expect("timeout");
        other.handle(NodeCommand::CancelElection).expect("cancel");
        assert_eq!(other.role(), Role::Follower);
    }

    #[test]
    fn truncate_requires_follower() {
        let mut node = node();
        node.handle(NodeCommand::CreateCluster).expect("create");

        let err = node
            .handle(NodeCommand::TruncateLog { from: LogIndex::ZERO })
            .expect_err("leader");
        assert!(matches!(err, Error::InvariantViolation(_)));

        let mut candidate = follower();
        candidate
            .handle(NodeCommand::TimeoutLeaderHeartbeat)
            .expect("timeout");
        assert!(candidate
            .handle(NodeCommand::TruncateLog { from: LogIndex::ZERO })
            .is_err());
    }

    #[test]
    fn truncate_rewinds_to_point() {
        let mut node = follower();
        node.handle(NodeCommand::SetNewTerm { term: Term::from(1) })
            .expect("term");
        for index in 1..=4 {
            commit(&mut node, index, 1).expect("commit");
        }
        node.handle(NodeCommand::ApplyEntry { index: LogIndex::from(4) })
            .expect("apply");

        node.handle(NodeCommand::TruncateLog { from: LogIndex::from(2) })
            .expect("truncate");

        assert_eq!(node.status().commit_index, LogIndex::from(2));
        assert_eq!(node.status().last_applied, LogIndex::from(2));
        assert_eq!(node.log().last_index(), LogIndex::from(2));
    }

    #[test]
    fn truncate_beyond_commit_fails() {
        let mut node = follower();
        let err = node
            .handle(NodeCommand::TruncateLog { from: LogIndex::from(3) })
            .expect_err("beyond commit");
        assert!(matches!(err, Error::InvariantViolation(_)));
    }

    #[test]
    fn final_ignores_everything() {
        let mut node = follower();
        node.handle(NodeCommand::Shutdown).expect("shutdown");
        node.handle(NodeCommand::SetNewTerm { term: Term::from(9) })
            .expect("ignored");

        assert_eq!(node.role(), Role::Final);
        assert_eq!(node.status().current_term, Term::ZERO);
    }
}
