use std::fmt;

use serde::{Deserialize, Serialize};

/// Unique identifier for a node in the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(u64);

impl NodeId {
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "N{}", self.0)
    }
}

impl From<u64> for NodeId {
    fn from(value: u64) -> Self {
        NodeId(value)
    }
}

/// Monotonically increasing term number.
///
/// Terms act as logical clocks in Raft and are used to detect stale information.
/// Term 0 represents the initial state before any election.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Term(u64);

impl Term {
    pub const ZERO: Self = Self(0);

    pub const fn get(self) -> u64 {
        self.0
    }

    pub const fn increment(self) -> Self {
        Self(self.0.saturating_add(1))
    }
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "T{}", self.0)
    }
}

impl From<u64> for Term {
    fn from(value: u64) -> Self {
        Term(value)
    }
}

/// 1-based log index.
///
/// LogIndex 0 represents "no entries" or "before the first entry".
/// Valid log entries start at index 1.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct LogIndex(u64);

impl LogIndex {
    pub const ZERO: Self = Self(0);
    pub const FIRST: Self = Self(1);

    pub const fn get(self) -> u64 {
        self.0
    }

    /// Create from array length (0-based length becomes 1-based index).
    pub fn from_length(len: usize) -> LogIndex {
        LogIndex(len as u64)
    }

    pub const fn next(self) -> LogIndex {
        LogIndex(self.0.saturating_add(1))
    }

    /// The preceding index, saturating at zero.
    pub const fn prev(self) -> LogIndex {
        LogIndex(self.0.saturating_sub(1))
    }

    pub const fn is_valid_entry(self) -> bool {
        self.0 > 0
    }

    /// Convert to array index (0-based). Returns None for index 0.
    pub const fn to_array_index(self) -> Option<usize> {
        if self.0 == 0 {
            None
        } else {
            Some((self.0 - 1) as usize)
        }
    }

    /// Inclusive range of indices from `self` through `last`.
    pub fn through(self, last: LogIndex) -> impl Iterator<Item = LogIndex> {
        (self.0..=last.0).map(LogIndex)
    }
}

impl fmt::Display for LogIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "I{}", self.0)
    }
}

impl From<u64> for LogIndex {
    fn from(value: u64) -> Self {
        LogIndex(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn term_increment() {
        let term = Term::ZERO;
        assert_eq!(term.increment().get(), 1);
    }

    #[test]
    fn log_index_array_conversion() {
        assert!(LogIndex::ZERO.to_array_index().is_none());
        assert_eq!(LogIndex::FIRST.to_array_index(), Some(0));
        assert_eq!(LogIndex::from(5).to_array_index(), Some(4));
    }

    #[test]
    fn log_index_prev_saturates() {
        assert_eq!(LogIndex::from(5).prev(), LogIndex::from(4));
        assert_eq!(LogIndex::ZERO.prev(), LogIndex::ZERO);
    }

    #[test]
    fn through_is_inclusive() {
        let range: Vec<_> = LogIndex::from(3).through(LogIndex::from(5)).collect();
        assert_eq!(range, vec![LogIndex::from(3), LogIndex::from(4), LogIndex::from(5)]);
        assert_eq!(LogIndex::from(4).through(LogIndex::from(3)).count(), 0);
    }

    #[test]
    fn primitives_serialize_as_plain_numbers() {
        let json = serde_json::to_string(&(NodeId::from(2), Term::from(7), LogIndex::from(9)))
            .expect("serialize");
        assert_eq!(json, "[2,7,9]");
    }

    #[test]
    fn display_prefixes() {
        assert_eq!(NodeId::from(3).to_string(), "N3");
        assert_eq!(Term::from(4).to_string(), "T4");
        assert_eq!(LogIndex::from(5).to_string(), "I5");
    }
}
