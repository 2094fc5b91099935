//! Per-tunnel table of in-flight requests awaiting frames from the peer.
//!
//! Entries are inserted before the request is sent and removed after the
//! terminal frame or on caller cancellation. Delivery never blocks the
//! tunnel's receive loop for longer than the caller-chosen bound.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::message::TunnelMessage;

/// Outcome of delivering a frame into a pending entry's channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Delivered,
    /// No entry exists for the id (already finished or cancelled).
    NoWaiter,
    /// The waiter's buffer stayed full for the whole delivery bound.
    Dropped,
}

struct PendingEntry {
    tx: mpsc::Sender<TunnelMessage>,
    created_at: Instant,
}

/// Concurrent map from request id to its waiter.
#[derive(Default)]
pub struct PendingRequests {
    entries: DashMap<String, PendingEntry>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a waiter for `id` with a response buffer of `capacity`
    /// frames. Callers size the buffer to the chunk count they expect.
    pub fn insert(&self, id: &str, capacity: usize) -> mpsc::Receiver<TunnelMessage> {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        self.entries.insert(
            id.to_string(),
            PendingEntry {
                tx,
                created_at: Instant::now(),
            },
        );
        rx
    }

    /// Removes the waiter for `id`, if any.
    pub fn remove(&self, id: &str) {
        self.entries.remove(id);
    }

    /// Number of in-flight requests.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Age of the oldest in-flight request, if any.
    pub fn oldest_age(&self) -> Option<Duration> {
        self.entries
            .iter()
            .map(|entry| entry.created_at.elapsed())
            .max()
    }

    /// Non-blocking delivery used for complete `response` envelopes. A full
    /// buffer drops the frame with a warning; callers must size channels to
    /// the expected chunk count.
    pub fn deliver(&self, message: TunnelMessage) -> Delivery {
        let Some(entry) = self.entries.get(&message.id) else {
            return Delivery::NoWaiter;
        };
        match entry.tx.try_send(message) {
            Ok(()) => Delivery::Delivered,
            Err(mpsc::error::TrySendError::Full(message)) => {
                warn!(
                    request_id = %message.id,
                    kind = message.kind(),
                    "response waiter buffer full, dropping frame"
                );
                Delivery::Dropped
            }
            Err(mpsc::error::TrySendError::Closed(message)) => {
                debug!(request_id = %message.id, "response waiter gone");
                Delivery::NoWaiter
            }
        }
    }

    /// Bounded-wait delivery used for streaming frame types. Gives a slow
    /// consumer up to `wait` to drain, then drops the frame.
    pub async fn deliver_within(&self, message: TunnelMessage, wait: Duration) -> Delivery {
        let tx = match self.entries.get(&message.id) {
            Some(entry) => entry.tx.clone(),
            None => return Delivery::NoWaiter,
        };
        match tx.send_timeout(message, wait).await {
            Ok(()) => Delivery::Delivered,
            Err(mpsc::error::SendTimeoutError::Timeout(message)) => {
                warn!(
                    request_id = %message.id,
                    kind = message.kind(),
                    wait_ms = wait.as_millis() as u64,
                    "stream frame delivery timed out, dropping"
                );
                Delivery::Dropped
            }
            Err(mpsc::error::SendTimeoutError::Closed(message)) => {
                debug!(request_id = %message.id, "stream waiter gone");
                Delivery::NoWaiter
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::TunnelPayload;

    fn frame(id: &str) -> TunnelMessage {
        TunnelMessage::reply(
            id,
            TunnelPayload::StreamData {
                body: b"chunk".to_vec(),
            },
        )
    }

    #[tokio::test]
    async fn delivers_to_registered_waiter() {
        let pending = PendingRequests::new();
        let mut rx = pending.insert("r1", 4);
        assert_eq!(pending.deliver(frame("r1")), Delivery::Delivered);
        let got = rx.recv().await.unwrap();
        assert_eq!(got.id, "r1");
    }

    #[tokio::test]
    async fn delivery_without_waiter_is_no_waiter() {
        let pending = PendingRequests::new();
        assert_eq!(pending.deliver(frame("ghost")), Delivery::NoWaiter);
    }

    #[tokio::test]
    async fn full_buffer_drops_instead_of_blocking() {
        let pending = PendingRequests::new();
        let _rx = pending.insert("r1", 1);
        assert_eq!(pending.deliver(frame("r1")), Delivery::Delivered);
        assert_eq!(pending.deliver(frame("r1")), Delivery::Dropped);
    }

    #[tokio::test]
    async fn bounded_wait_times_out_on_stuck_consumer() {
        let pending = PendingRequests::new();
        let _rx = pending.insert("r1", 1);
        assert_eq!(
            pending
                .deliver_within(frame("r1"), Duration::from_millis(10))
                .await,
            Delivery::Delivered
        );
        assert_eq!(
            pending
                .deliver_within(frame("r1"), Duration::from_millis(10))
                .await,
            Delivery::Dropped
        );
    }

    #[tokio::test]
    async fn remove_cancels_the_waiter() {
        let pending = PendingRequests::new();
        let _rx = pending.insert("r1", 1);
        pending.remove("r1");
        assert!(pending.is_empty());
        assert_eq!(pending.deliver(frame("r1")), Delivery::NoWaiter);
    }
}
