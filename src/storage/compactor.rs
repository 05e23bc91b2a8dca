use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, error, warn};

use super::segment::TermLog;
use super::segmented::{SegmentedLog, Segments};
use crate::types::Term;

/// One scheduled compression of a superseded term segment.
///
/// The worker holds the job lock from its first cancellation check until the
/// compressed bytes are installed. Truncation and rewrites cancel through the
/// same lock when it is free, so a job that has not started sees the flag on
/// its first check. When a compression is in flight the canceller does not
/// wait; the flag is re-checked before install and the bytes are dropped.
pub struct CompactionJob {
    term: Term,
    cancelled: AtomicBool,
    lock: Mutex<()>,
}

impl CompactionJob {
    pub fn new(term: Term) -> Arc<Self> {
        Arc::new(Self {
            term,
            cancelled: AtomicBool::new(false),
            lock: Mutex::new(()),
        })
    }

    pub fn term(&self) -> Term {
        self.term
    }

    /// Cancel the job. Returns whether a compression was in flight.
    pub fn cancel(&self) -> bool {
        let idle = self.lock.try_lock();
        self.cancelled.store(true, Ordering::Release);
        idle.is_none()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Compress `log` and install the result. Returns whether it was installed.
    pub(crate) fn run(&self, segments: &RwLock<Segments>, log: TermLog) -> bool {
        let _guard = self.lock.lock();
        if self.is_cancelled() {
            debug!(term = %self.term, "compaction cancelled before start");
            return false;
        }

        let bytes = match log.compress() {
            Ok(bytes) => bytes,
            Err(err) => {
                error!(term = %self.term, error = %err, "compaction failed");
                return false;
            }
        };

        if self.is_cancelled() {
            debug!(term = %self.term, "compaction cancelled after compress");
            return false;
        }

        let size = bytes.len();
        let installed = segments.write().install(self, bytes);
        if installed {
            debug!(term = %self.term, entries = log.len(), bytes = size, "term segment compacted");
        }
        installed
    }
}

/// Runs compactions of superseded term segments on background threads.
#[derive(Default)]
pub struct TermCompactor {
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl TermCompactor {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn schedule(
        &self,
        segments: Arc<RwLock<Segments>>,
        job: Arc<CompactionJob>,
        log: TermLog,
    ) {
        let term = job.term();
        let worker = Arc::clone(&job);
        let spawned = thread::Builder::new()
            .name(format!("compact-{term}"))
            .spawn(move || {
                worker.run(&segments, log);
            });

        match spawned {
            Ok(handle) => {
                let mut workers = self.workers.lock();
                workers.retain(|handle| !handle.is_finished());
                workers.push(handle);
            }
            // The segment stays uncompressed; reads fall back to the live copy.
            Err(err) => warn!(term = %term, error = %err, "could not spawn compaction thread"),
        }
    }

    /// Block until every scheduled compaction has finished.
    pub fn settle(&self) {
        let workers: Vec<_> = self.workers.lock().drain(..).collect();
        for handle in workers {
            if handle.join().is_err() {
                error!("compaction thread panicked");
            }
        }
    }
}

/// Open a new term segment whenever the node announces a term change.
pub async fn follow_terms(log: Arc<SegmentedLog>, mut terms: broadcast::Receiver<Term>) {
    loop {
        match terms.recv().await {
            Ok(term) => {
                if log.current_term().is_some_and(|current| current >= term) {
                    continue;
                }
                if let Err(err) = log.start_new_term(term) {
                    warn!(term = %term, error = %err, "could not open term segment");
                }
            }
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "term notifications lagged");
            }
            Err(RecvError::Closed) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::LogIndex;

    #[test]
    fn cancelled_job_never_installs() {
        let segments = Arc::new(RwLock::new(Segments::default()));
        let job = CompactionJob::new(Term::from(1));
        assert!(!job.cancel(), "nothing was compressing");

        let mut log = TermLog::new(Term::from(1));
        log.put(LogIndex::from(1), Some(vec![1]));

        assert!(!job.run(&segments, log));
    }

    #[test]
    fn cancel_during_compression_does_not_wait() {
        let segments = Arc::new(RwLock::new(Segments::default()));
        let job = CompactionJob::new(Term::from(1));

        // Held by the worker for the whole compress step.
        let compressing = job.lock.lock();
        assert!(job.cancel());
        drop(compressing);

        let mut log = TermLog::new(Term::from(1));
        log.put(LogIndex::from(1), Some(vec![1]));
        assert!(!job.run(&segments, log));
    }

    #[tokio::test]
    async fn follow_terms_opens_segments() {
        let log = Arc::new(SegmentedLog::new());
        let (tx, rx) = broadcast::channel(8);
        let task = tokio::spawn(follow_terms(Arc::clone(&log), rx));

        tx.send(Term::from(1)).expect("send");
        tx.send(Term::from(2)).expect("send");
        drop(tx);
        task.await.expect("join");

        assert_eq!(log.current_term(), Some(Term::from(2)));
        log.settle();
        assert!(log.is_compacted(Term::from(1)));
    }
}
