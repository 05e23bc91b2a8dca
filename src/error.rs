use crate::journal::JournalError;
use crate::transport::TransportError;
use crate::types::{LogIndex, NodeId, Term};

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors surfaced by the consensus core.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A Raft safety rule would be broken: a term regression, a commit against
    /// a future term, a truncation outside the Follower role. Never retried.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    /// Two nodes believe they lead the same term.
    #[error("multiple leaders for term {0}")]
    MultipleLeadersForTerm(Term),

    #[error("not the leader (leader: {leader:?})")]
    NotLeader { leader: Option<NodeId> },

    /// The client command failed while executing against the state machine.
    /// The log entry stays committed and applied.
    #[error("command execution failed: {0}")]
    Execution(String),

    #[error("entry {index} could not reach a quorum")]
    QuorumLost { index: LogIndex },

    #[error("transport: {0}")]
    Transport(#[from] TransportError),

    #[error("journal: {0}")]
    Journal(#[from] JournalError),

    #[error("codec: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("compression: {0}")]
    Compression(#[from] lz4_flex::block::DecompressError),

    #[error("config: {0}")]
    Config(String),

    /// The node actor or a pipeline stage has shut down.
    #[error("node stopped")]
    Stopped,
}

impl Error {
    pub(crate) fn invariant(message: impl Into<String>) -> Self {
        Error::InvariantViolation(message.into())
    }
}
