use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, warn};

use crate::types::{LogIndex, Term};

/// Commands received by a follower that are not yet known to be committed.
///
/// Keyed by the leader term of the request that carried them and their log
/// index. Entries leave either when applied or when the term moves on.
pub struct CommandRegister<C> {
    pending: Mutex<BTreeMap<(Term, LogIndex), C>>,
}

impl<C> Default for CommandRegister<C> {
    fn default() -> Self {
        Self {
            pending: Mutex::new(BTreeMap::new()),
        }
    }
}

impl<C: Send + 'static> CommandRegister<C> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, term: Term, index: LogIndex, command: C) {
        self.pending.lock().insert((term, index), command);
    }

    pub fn take(&self, term: Term, index: LogIndex) -> Option<C> {
        self.pending.lock().remove(&(term, index))
    }

    pub fn contains(&self, term: Term, index: LogIndex) -> bool {
        self.pending.lock().contains_key(&(term, index))
    }

    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }

    /// Drop every command cached under a term older than `term`.
    pub fn invalidate_before(&self, term: Term) {
        let mut pending = self.pending.lock();
        let before = pending.len();
        pending.retain(|(cached, _), _| *cached >= term);
        let dropped = before - pending.len();
        if dropped > 0 {
            debug!(term = %term, dropped, "invalidated pending commands");
        }
    }

    /// Invalidate on every TermChanged notification until the channel closes.
    pub async fn follow_terms(self: Arc<Self>, mut terms: broadcast::Receiver<Term>) {
        loop {
            match terms.recv().await {
                Ok(term) => self.invalidate_before(term),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "term notifications lagged, clearing register");
                    self.pending.lock().clear();
                }
                Err(RecvError::Closed) => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn take_removes_entry() {
        let register = CommandRegister::new();
        register.insert(Term::from(1), LogIndex::from(1), "a");

        assert_eq!(register.take(Term::from(1), LogIndex::from(1)), Some("a"));
        assert_eq!(register.take(Term::from(1), LogIndex::from(1)), None);
        assert!(register.is_empty());
    }

    #[test]
    fn invalidation_keeps_current_term() {
        let register = CommandRegister::new();
        register.insert(Term::from(1), LogIndex::from(1), "old");
        register.insert(Term::from(2), LogIndex::from(2), "new");

        register.invalidate_before(Term::from(2));

        assert!(!register.contains(Term::from(1), LogIndex::from(1)));
        assert!(register.contains(Term::from(2), LogIndex::from(2)));
        assert_eq!(register.len(), 1);
    }

    #[tokio::test]
    async fn follows_term_notifications() {
        let register = Arc::new(CommandRegister::new());
        register.insert(Term::from(1), LogIndex::from(1), 1u32);

        let (tx, rx) = broadcast::channel(4);
        let task = tokio::spawn(Arc::clone(&register).follow_terms(rx));
        tx.send(Term::from(3)).expect("send");
        drop(tx);
        task.await.expect("join");

        assert!(register.is_empty());
    }
}
