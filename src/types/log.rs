use serde::{Deserialize, Serialize};

use super::primitives::{LogIndex, Term};

/// A single entry in the replicated log.
///
/// The payload is the framed command record produced by [`crate::codec`];
/// entries are immutable once written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub index: LogIndex,
    pub term: Term,
    pub payload: Vec<u8>,
}
