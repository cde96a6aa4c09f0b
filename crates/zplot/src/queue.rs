//! Bounded hand-off between the ingestion and rendering contexts.
//!
//! This is the single backpressure point of the pipeline: producers never
//! wait (a full queue drops the new event), the consumer suspends until an
//! event arrives or the queue is closed.

use crossbeam::queue::ArrayQueue;
use photon_wire::PhotonEvent;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Notify;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Accepted,
    /// The queue was full; the event was discarded and the contents are unchanged.
    Dropped,
}

/// Fixed-capacity FIFO of photon events.
///
/// Lock-free on the push side; `pop` parks on a [`Notify`] instead of
/// spinning. Intended for a single consumer.
pub struct TransportQueue {
    buffer: ArrayQueue<PhotonEvent>,
    ready: Notify,
    closed: AtomicBool,
}

impl TransportQueue {
    /// Panics if `capacity` is zero.
    pub fn new(capacity: usize) -> Self {
        Self {
            buffer: ArrayQueue::new(capacity),
            ready: Notify::new(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn try_push(&self, event: PhotonEvent) -> PushOutcome {
        match self.buffer.push(event) {
            Ok(()) => {
                self.ready.notify_one();
                PushOutcome::Accepted
            }
            Err(_) => PushOutcome::Dropped,
        }
    }

    pub fn try_pop(&self) -> Option<PhotonEvent> {
        self.buffer.pop()
    }

    /// Waits for the next event.
    ///
    /// Returns `None` once the queue has been closed and drained. Events
    /// pushed before `close` are still delivered.
    pub async fn pop(&self) -> Option<PhotonEvent> {
        loop {
            if let Some(event) = self.buffer.pop() {
                return Some(event);
            }
            if self.closed.load(Ordering::Acquire) {
                return self.buffer.pop();
            }
            // notify_one stores a permit when nobody is waiting, so a push
            // landing between the checks above and this await is not lost.
            self.ready.notified().await;
        }
    }

    /// Wakes the consumer and makes `pop` return `None` once empty.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.ready.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.buffer.capacity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn ev(n: u16) -> PhotonEvent {
        PhotonEvent::new(n, n + 1, n as u8)
    }

    #[test]
    fn preserves_fifo_order() {
        let q = TransportQueue::new(8);
        for n in 1..=3 {
            assert_eq!(q.try_push(ev(n)), PushOutcome::Accepted);
        }
        assert_eq!(q.try_pop(), Some(ev(1)));
        assert_eq!(q.try_pop(), Some(ev(2)));
        assert_eq!(q.try_pop(), Some(ev(3)));
        assert_eq!(q.try_pop(), None);
    }

    #[test]
    fn full_queue_drops_new_event_and_keeps_contents() {
        let q = TransportQueue::new(2);
        q.try_push(ev(1));
        q.try_push(ev(2));

        assert_eq!(q.try_push(ev(3)), PushOutcome::Dropped);
        assert_eq!(q.len(), 2);
        assert_eq!(q.try_pop(), Some(ev(1)));
        assert_eq!(q.try_pop(), Some(ev(2)));
    }

    #[tokio::test]
    async fn pop_waits_for_a_push() {
        let q = Arc::new(TransportQueue::new(4));
        let consumer = {
            let q = q.clone();
            tokio::spawn(async move { q.pop().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!consumer.is_finished());

        q.try_push(ev(7));
        let got = tokio::time::timeout(Duration::from_secs(1), consumer)
            .await
            .expect("consumer was not woken")
            .unwrap();
        assert_eq!(got, Some(ev(7)));
    }

    #[tokio::test]
    async fn close_drains_then_ends() {
        let q = Arc::new(TransportQueue::new(4));
        q.try_push(ev(1));
        q.close();

        assert_eq!(q.pop().await, Some(ev(1)));
        assert_eq!(q.pop().await, None);
        assert!(q.is_closed());
    }

    #[tokio::test]
    async fn close_wakes_a_parked_consumer() {
        let q = Arc::new(TransportQueue::new(4));
        let consumer = {
            let q = q.clone();
            tokio::spawn(async move { q.pop().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        q.close();
        let got = tokio::time::timeout(Duration::from_secs(1), consumer)
            .await
            .expect("close did not wake consumer")
            .unwrap();
        assert_eq!(got, None);
    }
}
