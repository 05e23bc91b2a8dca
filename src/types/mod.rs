mod log;
mod message;
mod primitives;

pub use log::LogEntry;
pub use message::{
    AppendEntries, AppendEntriesResponse, Message, Reply, RequestVote, RequestVoteResponse,
};
pub use primitives::{LogIndex, NodeId, Term};
