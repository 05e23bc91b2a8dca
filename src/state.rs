use std::fmt;

use crate::command::CommandKind;
use crate::types::NodeId;

/// Raft role of this node. Exactly one at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Not yet part of any cluster.
    Initial,
    /// §5.1: followers are passive. They issue no requests, only respond to RPCs
    /// from leaders and candidates.
    Follower,
    /// §5.2: a candidate requests votes from peers to win an election.
    Candidate,
    Leader,
    /// Shut down. Every further command is ignored.
    Final,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Role::Initial => "initial",
            Role::Follower => "follower",
            Role::Candidate => "candidate",
            Role::Leader => "leader",
            Role::Final => "final",
        };
        f.write_str(name)
    }
}

/// Outcome of firing a command at the role gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gate {
    /// Move to the given role.
    Transition(Role),
    /// Stay in the current role. The command's handler still runs where it is
    /// independent of the gate.
    Stay,
}

impl Role {
    /// The legal-transition table. Anything not listed is Raft's "ignore":
    /// no transition and no error.
    pub fn gate(self, kind: CommandKind) -> Gate {
        use CommandKind as K;

        match (self, kind) {
            (Role::Final, _) => Gate::Stay,
            (_, K::Shutdown) => Gate::Transition(Role::Final),

            (Role::Initial, K::CreateCluster) => Gate::Transition(Role::Leader),
            (Role::Initial, K::JoinCluster) => Gate::Transition(Role::Follower),

            (Role::Follower, K::TimeoutLeaderHeartbeat) => Gate::Transition(Role::Candidate),

            (Role::Candidate, K::WinCandidateElection) => Gate::Transition(Role::Leader),
            (Role::Candidate, K::SetNewTerm) => Gate::Transition(Role::Follower),
            (Role::Candidate, K::CancelElection) => Gate::Transition(Role::Follower),

            // A leader that learns of a newer term steps down.
            (Role::Leader, K::SetNewTerm) => Gate::Transition(Role::Follower),

            _ => Gate::Stay,
        }
    }

    pub fn is_leader(self) -> bool {
        matches!(self, Role::Leader)
    }
}

/// §5.2: votes collected by a candidate in the current election. The candidate
/// votes for itself and wins with a majority of the full cluster.
pub struct Ballot {
    votes_received: Vec<NodeId>,
}

impl Ballot {
    pub fn new(self_id: NodeId) -> Self {
        Self {
            votes_received: vec![self_id],
        }
    }

    pub fn record_vote(&mut self, from: NodeId) {
        if !self.votes_received.contains(&from) {
            self.votes_received.push(from);
        }
    }

    // ⌊N/2⌋ + 1 out of N servers.
    pub fn has_majority(&self, cluster_size: usize) -> bool {
        self.votes_received.len() >= quorum(cluster_size)
    }
}

/// Number of nodes forming a majority of a cluster of `cluster_size`.
pub fn quorum(cluster_size: usize) -> usize {
    cluster_size / 2 + 1
}
