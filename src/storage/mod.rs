//! The replicated log.
//!
//! [`ReplicatedLog`] is the per-index view used by the node, the pipeline, the
//! peer replicators and the RPC service. Two implementations exist:
//! [`MemoryLog`], a flat vector, and [`SegmentedLog`], which partitions entries
//! by term and compresses superseded terms in the background.

mod compactor;
mod segment;
mod segmented;

pub use compactor::{follow_terms, CompactionJob, TermCompactor};
pub use segment::{SegmentEntry, TermLog};
pub use segmented::SegmentedLog;

use parking_lot::RwLock;

use crate::error::{Error, Result};
use crate::types::{LogIndex, Term};

/// Per-index term/entry storage with truncation.
///
/// Entries are contiguous from index 1. Implementations use interior locking so
/// one log can be shared by the node actor (writer) and the replicators (readers).
pub trait ReplicatedLog: Send + Sync + 'static {
    fn has_entry(&self, index: LogIndex) -> bool;

    /// Term stored at `index`. Index 0 is the virtual entry before the log and
    /// always has term 0.
    fn term_at(&self, index: LogIndex) -> Option<Term>;

    /// Payload stored at `index`, if the entry exists and carries one.
    fn entry_at(&self, index: LogIndex) -> Option<Vec<u8>>;

    /// Store `term` (and `payload`, when given) at `index`. Overwriting an entry
    /// with a different term discards everything after it. Fails for index 0 and
    /// for an index that would leave a hole.
    fn set_entry(&self, index: LogIndex, term: Term, payload: Option<Vec<u8>>) -> Result<()>;

    /// Remove every entry at `index` and beyond.
    fn truncate_from(&self, index: LogIndex) -> Result<()>;

    fn last_index(&self) -> LogIndex;

    fn last_term(&self) -> Term {
        self.term_at(self.last_index()).unwrap_or_default()
    }
}

#[derive(Clone)]
struct Slot {
    term: Term,
    payload: Option<Vec<u8>>,
}

/// In-memory log backed by a vector.
#[derive(Default)]
pub struct MemoryLog {
    slots: RwLock<Vec<Slot>>,
}

impl MemoryLog {
    pub fn new() -> Self {
        Self::default()
    }
}

pub(crate) fn check_writable(index: LogIndex, len: usize) -> Result<usize> {
    let Some(position) = index.to_array_index() else {
        return Err(Error::invariant("log entries start at index 1"));
    };
    if position > len {
        return Err(Error::invariant(format!(
            "writing {index} would leave a hole after {}",
            LogIndex::from_length(len)
        )));
    }
    Ok(position)
}

impl ReplicatedLog for MemoryLog {
    fn has_entry(&self, index: LogIndex) -> bool {
        index
            .to_array_index()
            .is_some_and(|position| position < self.slots.read().len())
    }

    fn term_at(&self, index: LogIndex) -> Option<Term> {
        match index.to_array_index() {
            None => Some(Term::ZERO),
            Some(position) => self.slots.read().get(position).map(|slot| slot.term),
        }
    }

    fn entry_at(&self, index: LogIndex) -> Option<Vec<u8>> {
        let position = index.to_array_index()?;
        self.slots.read().get(position)?.payload.clone()
    }

    fn set_entry(&self, index: LogIndex, term: Term, payload: Option<Vec<u8>>) -> Result<()> {
        let mut slots = self.slots.write();
        let position = check_writable(index, slots.len())?;

        match slots.get_mut(position) {
            Some(slot) if slot.term == term => {
                if payload.is_some() {
                    slot.payload = payload;
                }
            }
            Some(_) => {
                slots.truncate(position);
                slots.push(Slot { term, payload });
            }
            None => slots.push(Slot { term, payload }),
        }
        Ok(())
    }

    fn truncate_from(&self, index: LogIndex) -> Result<()> {
        let Some(position) = index.to_array_index() else {
            return Err(Error::invariant("cannot truncate from index 0"));
        };
        self.slots.write().truncate(position);
        Ok(())
    }

    fn last_index(&self) -> LogIndex {
        LogIndex::from_length(self.slots.read().len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filled(count: u64) -> MemoryLog {
        let log = MemoryLog::new();
        for i in 1..=count {
            log.set_entry(LogIndex::from(i), Term::from(1), Some(vec![i as u8]))
                .expect("set");
        }
        log
    }

    #[test]
    fn set_then_read_round_trips() {
        let log = MemoryLog::new();
        log.set_entry(LogIndex::from(1), Term::from(3), Some(b"a".to_vec()))
            .expect("set");

        assert!(log.has_entry(LogIndex::from(1)));
        assert_eq!(log.term_at(LogIndex::from(1)), Some(Term::from(3)));
        assert_eq!(log.entry_at(LogIndex::from(1)), Some(b"a".to_vec()));
        assert_eq!(log.last_index(), LogIndex::from(1));
        assert_eq!(log.last_term(), Term::from(3));
    }

    #[test]
    fn index_zero_is_rejected_but_has_term_zero() {
        let log = MemoryLog::new();
        assert!(log.set_entry(LogIndex::ZERO, Term::from(1), None).is_err());
        assert_eq!(log.term_at(LogIndex::ZERO), Some(Term::ZERO));
        assert!(!log.has_entry(LogIndex::ZERO));
    }

    #[test]
    fn holes_are_rejected() {
        let log = filled(2);
        let err = log
            .set_entry(LogIndex::from(4), Term::from(1), None)
            .expect_err("hole");
        assert!(matches!(err, Error::InvariantViolation(_)));
    }

    #[test]
    fn truncate_removes_suffix_only() {
        let log = filled(5);
        log.truncate_from(LogIndex::from(3)).expect("truncate");

        for i in 3..=6 {
            assert!(!log.has_entry(LogIndex::from(i)));
        }
        assert_eq!(log.entry_at(LogIndex::from(1)), Some(vec![1]));
        assert_eq!(log.entry_at(LogIndex::from(2)), Some(vec![2]));
        assert_eq!(log.last_index(), LogIndex::from(2));
    }

    #[test]
    fn overwrite_with_other_term_drops_later_entries() {
        let log = filled(3);
        log.set_entry(LogIndex::from(2), Term::from(2), Some(b"new".to_vec()))
            .expect("set");

        assert_eq!(log.last_index(), LogIndex::from(2));
        assert_eq!(log.term_at(LogIndex::from(2)), Some(Term::from(2)));
        assert_eq!(log.entry_at(LogIndex::from(2)), Some(b"new".to_vec()));
    }

    #[test]
    fn same_term_without_payload_keeps_payload() {
        let log = filled(1);
        log.set_entry(LogIndex::from(1), Term::from(1), None).expect("set");
        assert_eq!(log.entry_at(LogIndex::from(1)), Some(vec![1]));
    }
}
