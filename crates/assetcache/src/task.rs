//! Background work that is cancelled together with its owning handle.

use std::future::Future;

use futures::{Stream, StreamExt};
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;

/// A spawned task bound to the lifetime of this handle.
///
/// The task is cancelled when [`cancel`](Self::cancel) is called or when the handle is dropped.
/// Cancellation takes effect at the next suspension point of the task: the running future is
/// dropped there and never resumed.
///
/// Use [`detach`](Self::detach) to let the task outlive its handle.
#[derive(Debug)]
pub struct LifecycleTask {
    token: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl LifecycleTask {
    /// Spawns a one-shot task.
    ///
    /// The closure receives the task's cancellation token, which it may use to observe
    /// cancellation more eagerly, e.g. to hand it down to nested work.
    pub fn spawn<F, Fut>(job: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self::with_token(CancellationToken::new(), job)
    }

    /// Spawns a one-shot task that is also cancelled when `parent` is cancelled.
    pub fn spawn_in<F, Fut>(parent: &CancellationToken, job: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self::with_token(parent.child_token(), job)
    }

    /// Spawns a task that invokes `handler` for every item of `stream`.
    ///
    /// The task ends when the stream ends or the task is cancelled. Cancellation is checked
    /// before every handler invocation, so no item is handled after [`cancel`](Self::cancel)
    /// returned.
    pub fn consume<S, H, Fut>(stream: S, handler: H) -> Self
    where
        S: Stream + Send + 'static,
        S::Item: Send + 'static,
        H: FnMut(S::Item) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self::consume_with_token(CancellationToken::new(), stream, handler)
    }

    /// Like [`consume`](Self::consume), but also cancelled when `parent` is cancelled.
    pub fn consume_in<S, H, Fut>(parent: &CancellationToken, stream: S, handler: H) -> Self
    where
        S: Stream + Send + 'static,
        S::Item: Send + 'static,
        H: FnMut(S::Item) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self::consume_with_token(parent.child_token(), stream, handler)
    }

    fn consume_with_token<S, H, Fut>(token: CancellationToken, stream: S, mut handler: H) -> Self
    where
        S: Stream + Send + 'static,
        S::Item: Send + 'static,
        H: FnMut(S::Item) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self::with_token(token, move |token| async move {
            let mut stream = std::pin::pin!(stream);
            while let Some(item) = stream.next().await {
                if token.is_cancelled() {
                    break;
                }
                handler(item).await;
            }
        })
    }

    fn with_token<F, Fut>(token: CancellationToken, job: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let future = job(token.clone());
        let cancelled = token.clone();
        let handle = tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = cancelled.cancelled() => {
                    tracing::trace!("Lifecycle task cancelled");
                }
                _ = future => {}
            }
        });

        Self {
            token,
            handle: Some(handle),
        }
    }

    /// Requests cancellation of the task.
    ///
    /// Cancelling an already cancelled or finished task does nothing.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Whether the task has run to completion, or stopped after being cancelled.
    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().is_none_or(JoinHandle::is_finished)
    }

    /// Returns the token that governs this task.
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.token
    }

    /// Waits for the task to stop, without cancelling it.
    ///
    /// Returns an error if the task panicked.
    pub async fn join(mut self) -> Result<(), JoinError> {
        match self.handle.take() {
            Some(handle) => handle.await,
            None => Ok(()),
        }
    }

    /// Releases the task so that it keeps running after this handle is gone.
    ///
    /// The task can still be cancelled through its [`cancellation_token`](Self::cancellation_token)
    /// if a clone of it was taken before.
    pub fn detach(mut self) -> Option<JoinHandle<()>> {
        self.handle.take()
    }
}

impl Drop for LifecycleTask {
    fn drop(&mut self) {
        if self.handle.is_some() {
            self.token.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use crate::broadcast::BroadcastChannel;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_runs_to_completion() {
        let done = Arc::new(AtomicUsize::new(0));
        let task = LifecycleTask::spawn({
            let done = done.clone();
            move |_| async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                done.fetch_add(1, Ordering::SeqCst);
            }
        });

        task.join().await.unwrap();
        assert_eq!(done.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_is_idempotent() {
        let done = Arc::new(AtomicUsize::new(0));
        let task = LifecycleTask::spawn({
            let done = done.clone();
            move |_| async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                done.fetch_add(1, Ordering::SeqCst);
            }
        });

        task.cancel();
        task.cancel();
        assert!(task.is_cancelled());
        task.join().await.unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(done.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_after_completion() {
        let done = Arc::new(AtomicUsize::new(0));
        let task = LifecycleTask::spawn({
            let done = done.clone();
            move |_| async move {
                done.fetch_add(1, Ordering::SeqCst);
            }
        });

        while !task.is_finished() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        assert_eq!(done.load(Ordering::SeqCst), 1);

        task.cancel();
        task.cancel();
        assert!(task.is_finished());
        task.join().await.unwrap();
        assert_eq!(done.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_cancels() {
        let done = Arc::new(AtomicUsize::new(0));
        let task = LifecycleTask::spawn({
            let done = done.clone();
            move |_| async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                done.fetch_add(1, Ordering::SeqCst);
            }
        });
        let token = task.cancellation_token().clone();
        drop(task);

        assert!(token.is_cancelled());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(done.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_detach_keeps_running() {
        let done = Arc::new(AtomicUsize::new(0));
        let task = LifecycleTask::spawn({
            let done = done.clone();
            move |_| async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                done.fetch_add(1, Ordering::SeqCst);
            }
        });

        let handle = task.detach().unwrap();
        handle.await.unwrap();
        assert_eq!(done.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_parent_cancels_child() {
        let parent = CancellationToken::new();
        let task = LifecycleTask::spawn_in(&parent, |token| async move {
            token.cancelled().await;
        });

        parent.cancel();
        assert!(task.is_cancelled());
        task.join().await.unwrap();
    }

    #[tokio::test]
    async fn test_consume_drains_broadcast() {
        let channel = BroadcastChannel::new();
        let seen = Arc::new(AtomicUsize::new(0));

        let task = LifecycleTask::consume(channel.sequence(), {
            let seen = seen.clone();
            move |value: usize| {
                let seen = seen.clone();
                async move {
                    seen.fetch_add(value, Ordering::SeqCst);
                }
            }
        });

        channel.send(5);
        tokio::task::yield_now().await;
        channel.send(7);
        drop(channel);

        task.join().await.unwrap();
        // the first value may have been overwritten before the consumer got to it
        let total = seen.load(Ordering::SeqCst);
        assert!(total == 7 || total == 12, "unexpected total {total}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_consume_stops_on_cancel() {
        let channel = BroadcastChannel::new();
        let seen = Arc::new(AtomicUsize::new(0));

        let task = LifecycleTask::consume(channel.sequence(), {
            let seen = seen.clone();
            move |_: u32| {
                let seen = seen.clone();
                async move {
                    seen.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        });

        channel.send(1);
        tokio::time::sleep(Duration::from_millis(10)).await;
        task.cancel();
        channel.send(2);
        assert!(task.is_cancelled());
        task.join().await.unwrap();

        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }
}
