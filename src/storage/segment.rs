use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::types::{LogIndex, Term};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentEntry {
    pub index: LogIndex,
    pub payload: Option<Vec<u8>>,
}

/// Entries appended during one term, ordered by index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TermLog {
    term: Term,
    entries: Vec<SegmentEntry>,
}

impl TermLog {
    pub fn new(term: Term) -> Self {
        Self {
            term,
            entries: Vec::new(),
        }
    }

    pub fn term(&self) -> Term {
        self.term
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[SegmentEntry] {
        &self.entries
    }

    pub fn get(&self, index: LogIndex) -> Option<&SegmentEntry> {
        self.position(index).ok().map(|pos| &self.entries[pos])
    }

    /// Insert or replace the entry at `index`. A `None` payload leaves an
    /// existing payload in place.
    pub fn put(&mut self, index: LogIndex, payload: Option<Vec<u8>>) {
        match self.position(index) {
            Ok(pos) => {
                if payload.is_some() {
                    self.entries[pos].payload = payload;
                }
            }
            Err(pos) => self.entries.insert(pos, SegmentEntry { index, payload }),
        }
    }

    /// Drop every entry at `index` and beyond.
    pub fn truncate_from(&mut self, index: LogIndex) {
        let pos = match self.position(index) {
            Ok(pos) | Err(pos) => pos,
        };
        self.entries.truncate(pos);
    }

    /// Serialize and LZ4-compress the segment.
    pub fn compress(&self) -> Result<Vec<u8>> {
        let raw = serde_json::to_vec(self)?;
        Ok(lz4_flex::compress_prepend_size(&raw))
    }

    pub fn decompress(bytes: &[u8]) -> Result<TermLog> {
        let raw = lz4_flex::decompress_size_prepended(bytes)?;
        Ok(serde_json::from_slice(&raw)?)
    }

    fn position(&self, index: LogIndex) -> std::result::Result<usize, usize> {
        self.entries.binary_search_by_key(&index, |entry| entry.index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_keeps_index_order() {
        let mut log = TermLog::new(Term::from(2));
        log.put(LogIndex::from(5), Some(vec![5]));
        log.put(LogIndex::from(3), Some(vec![3]));
        log.put(LogIndex::from(4), None);

        let indices: Vec<_> = log.entries().iter().map(|e| e.index.get()).collect();
        assert_eq!(indices, vec![3, 4, 5]);
    }

    #[test]
    fn compressed_segment_decodes_to_same_entries() {
        let mut log = TermLog::new(Term::from(7));
        for i in 1..=50u64 {
            log.put(LogIndex::from(i), Some(vec![7; 64]));
        }

        let bytes = log.compress().expect("compress");
        assert!(bytes.len() < serde_json::to_vec(&log).expect("json").len());
        assert_eq!(TermLog::decompress(&bytes).expect("decompress"), log);
    }

    #[test]
    fn corrupt_bytes_fail_to_decode() {
        assert!(TermLog::decompress(&[1, 2, 3]).is_err());
    }

    #[test]
    fn truncate_from_drops_suffix() {
        let mut log = TermLog::new(Term::from(1));
        for i in 1..=4u64 {
            log.put(LogIndex::from(i), None);
        }
        log.truncate_from(LogIndex::from(3));
        assert_eq!(log.len(), 2);
        assert!(log.get(LogIndex::from(3)).is_none());
    }
}
