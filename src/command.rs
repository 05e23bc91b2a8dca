use crate::types::{LogIndex, NodeId, Term};

/// Commands accepted by the node state machine.
///
/// Every mutation of term, vote, leader, commit and apply state goes through
/// one of these, delivered over the node's mailbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeCommand {
    /// Bootstrap a new cluster with this node as its first leader.
    CreateCluster,
    /// Join an existing cluster as a follower.
    JoinCluster,
    /// The leader has gone quiet: start (or restart) an election.
    TimeoutLeaderHeartbeat,
    WinCandidateElection,
    CancelElection,
    SetNewTerm { term: Term },
    /// Mark `index` committed and store its term (and payload, when given).
    CommitEntry {
        index: LogIndex,
        term: Term,
        payload: Option<Vec<u8>>,
    },
    ApplyEntry { index: LogIndex },
    SetLeaderInformation { leader: NodeId },
    /// Keep entries through `from`, discard the rest.
    TruncateLog { from: LogIndex },
    GrantVote { candidate: NodeId },
    Shutdown,
}

/// Payload-free tag of a [`NodeCommand`], used to index the transition table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    CreateCluster,
    JoinCluster,
    TimeoutLeaderHeartbeat,
    WinCandidateElection,
    CancelElection,
    SetNewTerm,
    CommitEntry,
    ApplyEntry,
    SetLeaderInformation,
    TruncateLog,
    GrantVote,
    Shutdown,
}

impl NodeCommand {
    pub fn kind(&self) -> CommandKind {
        match self {
            NodeCommand::CreateCluster => CommandKind::CreateCluster,
            NodeCommand::JoinCluster => CommandKind::JoinCluster,
            NodeCommand::TimeoutLeaderHeartbeat => CommandKind::TimeoutLeaderHeartbeat,
            NodeCommand::WinCandidateElection => CommandKind::WinCandidateElection,
            NodeCommand::CancelElection => CommandKind::CancelElection,
            NodeCommand::SetNewTerm { .. } => CommandKind::SetNewTerm,
            NodeCommand::CommitEntry { .. } => CommandKind::CommitEntry,
            NodeCommand::ApplyEntry { .. } => CommandKind::ApplyEntry,
            NodeCommand::SetLeaderInformation { .. } => CommandKind::SetLeaderInformation,
            NodeCommand::TruncateLog { .. } => CommandKind::TruncateLog,
            NodeCommand::GrantVote { .. } => CommandKind::GrantVote,
            NodeCommand::Shutdown => CommandKind::Shutdown,
        }
    }
}
