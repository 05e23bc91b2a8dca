use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, error};

use super::compactor::{CompactionJob, TermCompactor};
use super::segment::TermLog;
use super::{check_writable, ReplicatedLog};
use crate::error::{Error, Result};
use crate::types::{LogIndex, Term};

pub(crate) enum Segment {
    /// The current term's segment, or one reopened by a truncation.
    Live(TermLog),
    /// Superseded and waiting for its compaction job. Still served from memory.
    Compacting {
        log: TermLog,
        job: Arc<CompactionJob>,
    },
    Compacted(Arc<Vec<u8>>),
}

#[derive(Default)]
pub(crate) struct Segments {
    current: Option<Term>,
    /// Term of every entry; position `i` holds index `i + 1`.
    terms: Vec<Term>,
    segments: BTreeMap<Term, Segment>,
}

impl Segments {
    /// Swap a compacting segment for its compressed bytes, provided `job` is
    /// still the one responsible for it.
    pub(crate) fn install(&mut self, job: &CompactionJob, bytes: Vec<u8>) -> bool {
        let owned = matches!(
            self.segments.get(&job.term()),
            Some(Segment::Compacting { job: current, .. }) if std::ptr::eq(Arc::as_ptr(current), job)
        );
        if !owned || job.is_cancelled() {
            return false;
        }
        self.segments
            .insert(job.term(), Segment::Compacted(Arc::new(bytes)));
        true
    }
}

/// A log partitioned by the term in which entries were appended.
///
/// The current term's segment is mutable. When a newer term starts, the
/// previous segment is compressed on a background thread and becomes
/// immutable once compaction completes.
pub struct SegmentedLog {
    inner: Arc<RwLock<Segments>>,
    compactor: TermCompactor,
}

impl Default for SegmentedLog {
    fn default() -> Self {
        Self::new()
    }
}

impl SegmentedLog {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(Segments::default())),
            compactor: TermCompactor::new(),
        }
    }

    pub fn current_term(&self) -> Option<Term> {
        self.inner.read().current
    }

    /// Make `term` the current segment. The first call creates it; later calls
    /// schedule the previous current segment for compaction.
    pub fn start_new_term(&self, term: Term) -> Result<()> {
        if term == Term::ZERO {
            return Err(Error::invariant("term segments start at term 1"));
        }
        let mut segments = self.inner.write();
        self.open_term(&mut segments, term)
    }

    /// Append `payload` at the next index under `term`.
    ///
    /// `term` may not exceed the current term, and an older term is only
    /// writable while its segment has not finished compacting.
    pub fn add_entry(&self, payload: Vec<u8>, term: Term) -> Result<LogIndex> {
        let mut segments = self.inner.write();
        let Some(current) = segments.current else {
            return Err(Error::invariant("no term segment has been started"));
        };
        if term > current {
            return Err(Error::invariant(format!(
                "entry for {term} is ahead of the current {current}"
            )));
        }
        let index = LogIndex::from_length(segments.terms.len()).next();
        self.write_entry(&mut segments, index, term, Some(payload), false)?;
        Ok(index)
    }

    /// A snapshot of the entries stored for `term`, decompressing on demand.
    pub fn get_term_log(&self, term: Term) -> Result<Option<TermLog>> {
        let bytes = {
            let segments = self.inner.read();
            match segments.segments.get(&term) {
                None => return Ok(None),
                Some(Segment::Live(log)) | Some(Segment::Compacting { log, .. }) => {
                    return Ok(Some(log.clone()))
                }
                Some(Segment::Compacted(bytes)) => Arc::clone(bytes),
            }
        };
        Ok(Some(TermLog::decompress(&bytes)?))
    }

    /// Discard every segment newer than `to_term` and make `to_term` current
    /// again, cancelling its compaction if one is in flight.
    pub fn truncate(&self, to_term: Term) -> Result<()> {
        let mut segments = self.inner.write();
        truncate_to_term(&mut segments, to_term)
    }

    pub fn is_compacted(&self, term: Term) -> bool {
        matches!(
            self.inner.read().segments.get(&term),
            Some(Segment::Compacted(_))
        )
    }

    /// Wait for background compactions to finish.
    pub fn settle(&self) {
        self.compactor.settle();
    }

    fn open_term(&self, segments: &mut Segments, term: Term) -> Result<()> {
        match segments.current {
            None => {
                segments
                    .segments
                    .entry(term)
                    .or_insert_with(|| Segment::Live(TermLog::new(term)));
            }
            Some(current) if term == current => return Ok(()),
            Some(current) if term < current => {
                return Err(Error::invariant(format!(
                    "cannot start {term} after {current}"
                )))
            }
            Some(current) => {
                if let Some(Segment::Live(log)) = segments.segments.remove(&current) {
                    self.schedule(segments, log);
                }
                segments
                    .segments
                    .insert(term, Segment::Live(TermLog::new(term)));
            }
        }
        debug!(term = %term, "opened term segment");
        segments.current = Some(term);
        Ok(())
    }

    fn schedule(&self, segments: &mut Segments, log: TermLog) {
        let job = CompactionJob::new(log.term());
        self.compactor
            .schedule(Arc::clone(&self.inner), Arc::clone(&job), log.clone());
        segments
            .segments
            .insert(log.term(), Segment::Compacting { log, job });
    }

    /// `reopen` lets a write land in an already compacted older segment,
    /// which is decompressed and compacted again afterwards.
    fn write_entry(
        &self,
        segments: &mut Segments,
        index: LogIndex,
        term: Term,
        payload: Option<Vec<u8>>,
        reopen: bool,
    ) -> Result<()> {
        let position = check_writable(index, segments.terms.len())?;
        if let Some(&existing) = segments.terms.get(position) {
            if existing != term {
                truncate_from_locked(segments, index)?;
            }
        }
        if position == segments.terms.len() {
            if let Some(&last) = segments.terms.last() {
                if term < last {
                    return Err(Error::invariant(format!(
                        "entry {index} for {term} follows an entry for {last}"
                    )));
                }
            }
        }

        match segments.current {
            Some(current) if term <= current => {}
            _ => self.open_term(segments, term)?,
        }

        let current = segments.current.unwrap_or(term);
        match segments.segments.remove(&term) {
            Some(Segment::Live(mut log)) => {
                log.put(index, payload);
                segments.segments.insert(term, Segment::Live(log));
            }
            Some(Segment::Compacting { mut log, job }) => {
                job.cancel();
                log.put(index, payload);
                self.schedule(segments, log);
            }
            Some(Segment::Compacted(bytes)) if reopen => {
                let mut log = TermLog::decompress(&bytes)?;
                log.put(index, payload);
                self.schedule(segments, log);
            }
            Some(compacted @ Segment::Compacted(_)) => {
                segments.segments.insert(term, compacted);
                return Err(Error::invariant(format!(
                    "segment for {term} is already compacted"
                )));
            }
            None if term < current && !reopen => {
                return Err(Error::invariant(format!("no open segment for {term}")));
            }
            None => {
                let mut log = TermLog::new(term);
                log.put(index, payload);
                if term < current {
                    self.schedule(segments, log);
                } else {
                    segments.segments.insert(term, Segment::Live(log));
                }
            }
        }

        if position == segments.terms.len() {
            segments.terms.push(term);
        }
        Ok(())
    }
}

fn truncate_to_term(segments: &mut Segments, to_term: Term) -> Result<()> {
    if to_term == Term::ZERO {
        return Err(Error::invariant("cannot truncate to term 0"));
    }

    // Resolve the surviving segment first so a decode failure changes nothing.
    let reopened = match segments.segments.get(&to_term) {
        Some(Segment::Compacted(bytes)) => Some(TermLog::decompress(bytes)?),
        _ => None,
    };

    let newer: Vec<Term> = segments
        .segments
        .range((Bound::Excluded(to_term), Bound::Unbounded))
        .map(|(term, _)| *term)
        .collect();
    for term in newer {
        if let Some(Segment::Compacting { job, .. }) = segments.segments.remove(&term) {
            job.cancel();
        }
    }

    let keep = segments
        .terms
        .iter()
        .position(|term| *term > to_term)
        .unwrap_or(segments.terms.len());
    segments.terms.truncate(keep);

    let live = match segments.segments.remove(&to_term) {
        Some(Segment::Live(log)) => log,
        Some(Segment::Compacting { log, job }) => {
            let in_flight = job.cancel();
            debug!(term = %to_term, in_flight, "cancelled compaction");
            log
        }
        Some(Segment::Compacted(_)) => reopened.unwrap_or_else(|| TermLog::new(to_term)),
        None => TermLog::new(to_term),
    };
    segments.segments.insert(to_term, Segment::Live(live));
    segments.current = Some(to_term);
    Ok(())
}

fn truncate_from_locked(segments: &mut Segments, index: LogIndex) -> Result<()> {
    let Some(position) = index.to_array_index() else {
        return Err(Error::invariant("cannot truncate from index 0"));
    };
    let Some(&term) = segments.terms.get(position) else {
        return Ok(());
    };

    truncate_to_term(segments, term)?;
    segments.terms.truncate(position);
    if let Some(Segment::Live(log)) = segments.segments.get_mut(&term) {
        log.truncate_from(index);
    }
    Ok(())
}

impl ReplicatedLog for SegmentedLog {
    fn has_entry(&self, index: LogIndex) -> bool {
        index
            .to_array_index()
            .is_some_and(|position| position < self.inner.read().terms.len())
    }

    fn term_at(&self, index: LogIndex) -> Option<Term> {
        match index.to_array_index() {
            None => Some(Term::ZERO),
            Some(position) => self.inner.read().terms.get(position).copied(),
        }
    }

    fn entry_at(&self, index: LogIndex) -> Option<Vec<u8>> {
        let term = self.term_at(index).filter(|_| index.is_valid_entry())?;
        match self.get_term_log(term) {
            Ok(log) => log?.get(index)?.payload.clone(),
            Err(err) => {
                error!(index = %index, term = %term, error = %err, "unreadable term segment");
                None
            }
        }
    }

    fn set_entry(&self, index: LogIndex, term: Term, payload: Option<Vec<u8>>) -> Result<()> {
        let mut segments = self.inner.write();
        self.write_entry(&mut segments, index, term, payload, true)
    }

    fn truncate_from(&self, index: LogIndex) -> Result<()> {
        let mut segments = self.inner.write();
        truncate_from_locked(&mut segments, index)
    }

    fn last_index(&self) -> LogIndex {
        LogIndex::from_length(self.inner.read().terms.len())
    }
}
