//! A single-slot channel that delivers the latest value to any number of consumers.

use futures::stream::{self, BoxStream};
use tokio::sync::watch;

#[derive(Debug)]
struct Slot<T> {
    /// Incremented on every accepted send.
    seq: u64,
    value: Option<T>,
    finished: bool,
}

/// A latest-value broadcast channel.
///
/// The channel buffers exactly one value. Sending never blocks and overwrites a value that no
/// consumer has picked up yet, so a slow consumer only ever sees the most recent value. Once
/// the channel is [finished](Self::finish), consumers drain the buffered value and then observe
/// the end of their [`sequence`](Self::sequence).
///
/// Dropping the channel finishes it.
#[derive(Debug)]
pub struct BroadcastChannel<T> {
    sender: watch::Sender<Slot<T>>,
}

impl<T> Default for BroadcastChannel<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T> BroadcastChannel<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        let (sender, _) = watch::channel(Slot {
            seq: 0,
            value: None,
            finished: false,
        });
        Self { sender }
    }

    /// Publishes `value`, replacing the buffered one.
    ///
    /// Sending to a finished channel does nothing.
    pub fn send(&self, value: T) {
        self.sender.send_if_modified(|slot| {
            if slot.finished {
                return false;
            }
            slot.seq += 1;
            slot.value = Some(value);
            true
        });
    }

    /// Returns the most recently sent value.
    pub fn latest(&self) -> Option<T> {
        self.sender.borrow().value.clone()
    }

    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Creates a new stream of the values sent over this channel.
    ///
    /// The stream starts with the currently buffered value, if any, followed by every later
    /// value that was not overwritten before the consumer got to it. It ends once the channel
    /// is finished and the last value was yielded.
    pub fn sequence(&self) -> BoxStream<'static, T> {
        let receiver = self.sender.subscribe();

        Box::pin(stream::unfold(
            (receiver, 0u64),
            |(mut receiver, mut seen)| async move {
                loop {
                    let step = {
                        let slot = receiver.borrow_and_update();
                        match &slot.value {
                            Some(value) if slot.seq > seen => {
                                seen = slot.seq;
                                Step::Yield(value.clone())
                            }
                            _ if slot.finished => Step::End,
                            _ => Step::Wait,
                        }
                    };

                    match step {
                        Step::Yield(value) => return Some((value, (receiver, seen))),
                        Step::End => return None,
                        Step::Wait => {
                            // the sender is gone, which implies a finished channel
                            if receiver.changed().await.is_err() {
                                return None;
                            }
                        }
                    }
                }
            },
        ))
    }
}

impl<T> BroadcastChannel<T> {
    /// Signals that no more values will be sent.
    ///
    /// Calling this more than once has no further effect.
    pub fn finish(&self) {
        self.sender.send_if_modified(|slot| {
            let changed = !slot.finished;
            slot.finished = true;
            changed
        });
    }

    pub fn is_finished(&self) -> bool {
        self.sender.borrow().finished
    }
}

impl<T> Drop for BroadcastChannel<T> {
    fn drop(&mut self) {
        self.finish();
    }
}

enum Step<T> {
    Yield(T),
    End,
    Wait,
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures::StreamExt;

    use super::*;

    #[tokio::test]
    async fn test_most_recent_wins() {
        let channel = BroadcastChannel::new();
        let sequence = channel.sequence();

        channel.send(1);
        channel.send(2);
        channel.send(3);

        let consumer = tokio::spawn(sequence.collect::<Vec<_>>());
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!consumer.is_finished());

        channel.finish();
        assert_eq!(consumer.await.unwrap(), vec![3]);
    }

    #[tokio::test]
    async fn test_preserves_order() {
        let channel = BroadcastChannel::new();
        let mut sequence = channel.sequence();

        for i in 0..5 {
            channel.send(i);
            assert_eq!(sequence.next().await, Some(i));
        }
        drop(channel);
        assert_eq!(sequence.next().await, None);
    }

    #[tokio::test]
    async fn test_late_consumer_sees_buffered_value() {
        let channel = BroadcastChannel::new();
        channel.send("a");
        channel.finish();

        let values: Vec<_> = channel.sequence().collect().await;
        assert_eq!(values, vec!["a"]);
    }

    #[tokio::test]
    async fn test_send_after_finish_is_ignored() {
        let channel = BroadcastChannel::new();
        channel.send(1);
        channel.finish();
        channel.finish();
        channel.send(2);

        assert!(channel.is_finished());
        assert_eq!(channel.latest(), Some(1));
    }

    #[tokio::test]
    async fn test_independent_consumers() {
        let channel = BroadcastChannel::new();
        let first = channel.sequence();
        let second = channel.sequence();
        assert_eq!(channel.receiver_count(), 2);

        channel.send(10);
        drop(channel);

        assert_eq!(first.collect::<Vec<_>>().await, vec![10]);
        assert_eq!(second.collect::<Vec<_>>().await, vec![10]);
    }

    #[tokio::test]
    async fn test_empty_finished_channel() {
        let channel = BroadcastChannel::<u8>::new();
        channel.finish();
        assert_eq!(channel.sequence().next().await, None);
    }
}
