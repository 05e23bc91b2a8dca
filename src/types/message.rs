use serde::{Deserialize, Serialize};

use super::primitives::{LogIndex, NodeId, Term};

/// RequestVote RPC arguments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestVote {
    pub term: Term,
    pub candidate_id: NodeId,
    pub last_log_index: LogIndex,
    pub last_log_term: Term,
}

/// RequestVote RPC response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestVoteResponse {
    pub term: Term,
    pub vote_granted: bool,
}

/// AppendEntries RPC arguments.
///
/// Each element of `entries` is one length-prefixed command record, oldest first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntries {
    pub term: Term,
    pub leader_id: NodeId,
    pub prev_log_index: LogIndex,
    pub prev_log_term: Term,
    pub entries: Vec<Vec<u8>>,
    pub leader_commit: LogIndex,
}

/// AppendEntries RPC response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    pub term: Term,
    pub success: bool,
}

/// Requests carried by the transport.
#[derive(Debug, Serialize, Deserialize)]
pub enum Message {
    RequestVote(RequestVote),
    AppendEntries(AppendEntries),
}

/// Replies carried by the transport. `Fault` reports a service-side error,
/// such as two leaders claiming the same term.
#[derive(Debug, Serialize, Deserialize)]
pub enum Reply {
    RequestVote(RequestVoteResponse),
    AppendEntries(AppendEntriesResponse),
    Fault(String),
}
