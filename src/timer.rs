use std::future::Future;
use std::sync::Arc;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::trace;

use crate::config::TimerConfig;

/// Randomized election timeout.
///
/// Every wait draws a fresh timeout from `[T, 2T)`. A [`reset`](Self::reset)
/// restarts the wait; when a wait runs out the callback fires.
pub struct ElectionTimer {
    config: TimerConfig,
    reset: Notify,
}

impl ElectionTimer {
    pub fn new(config: TimerConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            reset: Notify::new(),
        })
    }

    /// Heard from a leader or granted a vote.
    pub fn reset(&self) {
        self.reset.notify_one();
    }

    /// Run the timer. `on_timeout` returns `false` to stop it.
    pub fn spawn<F, Fut>(self: Arc<Self>, mut on_timeout: F) -> JoinHandle<()>
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        tokio::spawn(async move {
            loop {
                let timeout = self.config.random_election_timeout();
                tokio::select! {
                    _ = self.reset.notified() => {
                        trace!("election timer reset");
                    }
                    _ = tokio::time::sleep(timeout) => {
                        if !on_timeout().await {
                            break;
                        }
                    }
                }
            }
        })
    }
}
