//! Sequenced pub/sub: a resume-capable multicast primitive.
//!
//! A [`SubPub`] is one topic. Every payload is published under a monotonic
//! sequence ID; every subscriber carries a cursor (its last-seen sequence)
//! and receives exactly the payloads published with a strictly greater
//! sequence, in publish order, at most once.
//!
//! Each subscriber owns a bounded buffer of [`SUBSCRIBER_BUFFER`] slots.
//! Publishing never blocks: a subscriber whose buffer is full is evicted —
//! its sender is dropped, so the subscriber drains what was buffered and
//! then observes the channel close. Eviction of one subscriber never slows
//! the publisher or any other subscriber.
//!
//! Subscribers added after a publish do not see that publish; late joiners
//! resume from stored state (the message store) and use their cursor to
//! skip what they already have.

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Buffered payloads per subscriber before eviction.
pub const SUBSCRIBER_BUFFER: usize = 10;

struct Subscriber<T> {
    last_seen: i64,
    tx: mpsc::Sender<T>,
}

/// A single-topic sequenced broadcast bus.
pub struct SubPub<T> {
    subscribers: Mutex<Vec<Subscriber<T>>>,
}

impl<T: Clone> SubPub<T> {
    /// Create an empty bus.
    #[must_use]
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
        }
    }

    /// Deliver `payload` to every subscriber whose cursor is strictly less
    /// than `sequence_id`, advancing its cursor. Non-blocking; a subscriber
    /// with a full buffer is evicted.
    pub fn publish(&self, sequence_id: i64, payload: T) {
        let mut subs = self.subscribers.lock();
        subs.retain_mut(|sub| {
            if sequence_id <= sub.last_seen {
                return true;
            }
            match sub.tx.try_send(payload.clone()) {
                Ok(()) => {
                    sub.last_seen = sequence_id;
                    true
                }
                Err(TrySendError::Full(_)) => {
                    debug!(sequence_id, "evicting slow subscriber");
                    false
                }
                Err(TrySendError::Closed(_)) => false,
            }
        });
    }

    /// Attach a subscriber whose cursor starts at `last_seen`.
    ///
    /// The returned [`Subscription`] yields payloads with sequence IDs
    /// strictly greater than `last_seen`, published after this call.
    pub fn subscribe(&self, last_seen: i64, cancel: CancellationToken) -> Subscription<T> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        self.subscribers.lock().push(Subscriber { last_seen, tx });
        Subscription { rx, cancel }
    }

    /// Number of attached subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    /// Evict every subscriber. Each drains its buffered payloads and then
    /// observes the channel close.
    pub fn close(&self) {
        self.subscribers.lock().clear();
    }
}

impl<T: Clone> Default for SubPub<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// The consuming end of one subscription. Pull from a single task.
pub struct Subscription<T> {
    rx: mpsc::Receiver<T>,
    cancel: CancellationToken,
}

impl<T> Subscription<T> {
    /// Wait for the next payload.
    ///
    /// Returns `None` when the subscription's cancellation token fires or
    /// the subscriber has been evicted (buffer drained and channel closed).
    pub async fn next(&mut self) -> Option<T> {
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => None,
            payload = self.rx.recv() => payload,
        }
    }

    /// Non-blocking pull, for draining in tests.
    pub fn try_next(&mut self) -> Option<T> {
        self.rx.try_recv().ok()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn basic_publish_subscribe() {
        let sp = SubPub::<String>::new();
        let mut sub = sp.subscribe(0, CancellationToken::new());

        sp.publish(1, "hello".to_owned());

        assert_eq!(sub.next().await.as_deref(), Some("hello"));
    }

    #[tokio::test]
    async fn multiple_subscribers_all_receive() {
        let sp = SubPub::<String>::new();
        let mut subs: Vec<_> = (0..3)
            .map(|_| sp.subscribe(0, CancellationToken::new()))
            .collect();

        sp.publish(1, "broadcast".to_owned());

        for sub in &mut subs {
            assert_eq!(sub.next().await.as_deref(), Some("broadcast"));
        }
    }

    #[tokio::test]
    async fn subscriber_skips_already_seen() {
        let sp = SubPub::<i64>::new();
        let mut sub = sp.subscribe(5, CancellationToken::new());

        // At or below the cursor: not delivered.
        sp.publish(5, 100);
        sp.publish(4, 200);
        // Above the cursor: delivered.
        sp.publish(6, 300);

        assert_eq!(sub.next().await, Some(300));
        assert!(sub.try_next().is_none());
    }

    #[tokio::test]
    async fn cancellation_ends_subscription() {
        let sp = SubPub::<String>::new();
        let cancel = CancellationToken::new();
        let mut sub = sp.subscribe(0, cancel.clone());

        cancel.cancel();

        assert!(sub.next().await.is_none());
    }

    #[tokio::test]
    async fn cancellation_wins_over_buffered_payloads() {
        let sp = SubPub::<String>::new();
        let cancel = CancellationToken::new();
        let mut sub = sp.subscribe(0, cancel.clone());

        cancel.cancel();
        sp.publish(1, "test".to_owned());

        assert!(sub.next().await.is_none());
    }

    #[tokio::test]
    async fn slow_subscriber_evicted_after_buffer_fills() {
        let sp = SubPub::<String>::new();
        let mut sub = sp.subscribe(0, CancellationToken::new());

        // Fill the 10-slot buffer, then one more to trigger eviction.
        for i in 1..=11 {
            sp.publish(i, format!("message{i}"));
        }

        let mut received = 0;
        while sub.next().await.is_some() {
            received += 1;
            assert!(received <= 11, "received more payloads than expected");
        }
        assert_eq!(received, 10);
        assert_eq!(sp.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn eviction_does_not_affect_other_subscribers() {
        let sp = SubPub::<i64>::new();
        let mut slow = sp.subscribe(0, CancellationToken::new());
        let fast = sp.subscribe(0, CancellationToken::new());

        let sp = Arc::new(sp);
        let mut fast = fast;
        let drain = tokio::spawn(async move {
            let mut got = Vec::new();
            while let Some(v) = fast.next().await {
                got.push(v);
                if got.len() == 20 {
                    break;
                }
            }
            got
        });

        for i in 1..=20 {
            sp.publish(i, i);
            // Give the fast consumer a chance to drain.
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        let got = drain.await.unwrap();
        assert_eq!(got.len(), 20, "fast subscriber must see every payload");

        // The slow subscriber was evicted after its buffer filled.
        let mut received = 0;
        while slow.next().await.is_some() {
            received += 1;
        }
        assert_eq!(received, 10);
    }

    #[tokio::test]
    async fn sequential_delivery_in_order() {
        let sp = SubPub::<i64>::new();
        let mut sub = sp.subscribe(0, CancellationToken::new());

        for i in 1..=5 {
            sp.publish(i, i * 10);
        }

        for i in 1..=5 {
            assert_eq!(sub.next().await, Some(i * 10));
        }
    }

    #[tokio::test]
    async fn late_subscriber_misses_earlier_publishes() {
        let sp = SubPub::<String>::new();

        sp.publish(1, "early1".to_owned());
        sp.publish(2, "early2".to_owned());

        let mut sub = sp.subscribe(2, CancellationToken::new());
        sp.publish(3, "late".to_owned());

        assert_eq!(sub.next().await.as_deref(), Some("late"));
        assert!(sub.try_next().is_none());
    }

    #[tokio::test]
    async fn subscribers_at_different_cursors() {
        let sp = SubPub::<String>::new();
        let mut sub1 = sp.subscribe(0, CancellationToken::new());
        let mut sub2 = sp.subscribe(1, CancellationToken::new());

        sp.publish(2, "msg2".to_owned());
        assert_eq!(sub1.next().await.as_deref(), Some("msg2"));
        assert_eq!(sub2.next().await.as_deref(), Some("msg2"));

        sp.publish(3, "msg3".to_owned());
        assert_eq!(sub1.next().await.as_deref(), Some("msg3"));
        assert_eq!(sub2.next().await.as_deref(), Some("msg3"));
    }

    #[tokio::test]
    async fn timeout_cancellation() {
        let sp = SubPub::<String>::new();
        let cancel = CancellationToken::new();
        let mut sub = sp.subscribe(0, cancel.clone());

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            cancel.cancel();
        });

        assert!(sub.next().await.is_none());
    }

    #[tokio::test]
    async fn close_evicts_everyone() {
        let sp = SubPub::<i64>::new();
        let mut sub1 = sp.subscribe(0, CancellationToken::new());
        let mut sub2 = sp.subscribe(0, CancellationToken::new());
        sp.publish(1, 7);

        sp.close();
        assert_eq!(sp.subscriber_count(), 0);

        // Buffered payloads drain, then the channel closes.
        assert_eq!(sub1.next().await, Some(7));
        assert!(sub1.next().await.is_none());
        assert_eq!(sub2.next().await, Some(7));
        assert!(sub2.next().await.is_none());
    }

    #[tokio::test]
    async fn dropped_subscription_removed_on_next_publish() {
        let sp = SubPub::<i64>::new();
        let sub = sp.subscribe(0, CancellationToken::new());
        assert_eq!(sp.subscriber_count(), 1);

        drop(sub);
        sp.publish(1, 1);
        assert_eq!(sp.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn publish_from_many_tasks() {
        let sp = Arc::new(SubPub::<i64>::new());
        let mut sub = sp.subscribe(0, CancellationToken::new());

        let publishers: Vec<_> = (1..=5)
            .map(|i| {
                let sp = sp.clone();
                tokio::spawn(async move { sp.publish(i, i) })
            })
            .collect();
        for p in publishers {
            p.await.unwrap();
        }

        let mut got = Vec::new();
        while let Some(v) = sub.try_next() {
            got.push(v);
        }
        // Cursor-gated delivery: each received payload exceeds the previous.
        for pair in got.windows(2) {
            assert!(pair[0] < pair[1], "delivery must be in increasing order");
        }
        assert!(!got.is_empty());
    }
}
