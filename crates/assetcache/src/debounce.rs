//! Coalescing of bursty triggers into a single delayed execution.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::config::DebounceConfig;
use crate::task::LifecycleTask;

#[derive(Debug)]
struct Pending {
    generation: u64,
    task: LifecycleTask,
}

#[derive(Debug, Default)]
struct Shared {
    /// The scheduled execution, if any.
    pending: Mutex<Option<Pending>>,
    /// Held while a handler runs, so that handlers never overlap.
    firing: tokio::sync::Mutex<()>,
    generation: AtomicU64,
}

/// Delays executions and collapses the ones requested in quick succession.
///
/// The first [`run`](Self::run) schedules its handler after the initial delay. Every further
/// `run` while an execution is still pending cancels it and schedules the new handler after the
/// overlap delay instead, so only the last handler of a burst is executed. A handler that was
/// cancelled never starts.
///
/// Handlers run one at a time: a handler that becomes due while a previous one is still
/// running waits for it to complete.
#[derive(Debug)]
pub struct Debouncer {
    initial_delay: Duration,
    overlap_delay: Duration,
    shared: Arc<Shared>,
}

impl Debouncer {
    pub fn new(initial_delay: Duration, overlap_delay: Duration) -> Self {
        Self {
            initial_delay,
            overlap_delay,
            shared: Default::default(),
        }
    }

    pub fn from_config(config: &DebounceConfig) -> Self {
        Self::new(config.initial_delay, config.overlap_delay)
    }

    /// Schedules `handler`, superseding any pending execution.
    pub fn run<F, Fut>(&self, handler: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut pending = self.shared.pending.lock().unwrap();

        let delay = match pending.take() {
            Some(previous) => {
                previous.task.cancel();
                metric!(counter("debounce.superseded") += 1);
                self.overlap_delay
            }
            None => self.initial_delay,
        };

        let generation = self.shared.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let shared = Arc::clone(&self.shared);
        let task = LifecycleTask::spawn(move |token| async move {
            tokio::time::sleep(delay).await;
            let _firing = shared.firing.lock().await;

            {
                let mut pending = shared.pending.lock().unwrap();
                // superseded while waiting for the lock, the marker belongs to the newer run
                if token.is_cancelled() {
                    return;
                }
                match pending.take() {
                    Some(ours) if ours.generation == generation => {
                        ours.task.detach();
                    }
                    other => {
                        *pending = other;
                        return;
                    }
                }
            }

            metric!(counter("debounce.fired") += 1);
            handler().await;
        });

        *pending = Some(Pending { generation, task });
    }

    /// Drops the pending execution, if any.
    ///
    /// A handler that already started keeps running.
    pub fn cancel(&self) {
        let pending = self.shared.pending.lock().unwrap().take();
        if let Some(pending) = pending {
            pending.task.cancel();
        }
    }

    /// Whether an execution is scheduled and has not started yet.
    pub fn is_pending(&self) -> bool {
        self.shared.pending.lock().unwrap().is_some()
    }
}

impl Drop for Debouncer {
    fn drop(&mut self) {
        self.cancel();
    }
}
