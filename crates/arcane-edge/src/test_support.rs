//! Doubles shared by the crate's unit tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use arcane_core::{TunnelChannel, TunnelError, TunnelMessage, TunnelResult};

/// Channel double that records sends and counts close transitions.
pub(crate) struct MockChannel {
    pub sent: parking_lot::Mutex<Vec<TunnelMessage>>,
    closed: AtomicBool,
    pub close_transitions: AtomicUsize,
}

impl MockChannel {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            sent: parking_lot::Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            close_transitions: AtomicUsize::new(0),
        })
    }

    pub fn last_sent(&self) -> Option<TunnelMessage> {
        self.sent.lock().last().cloned()
    }

    pub fn sent_kinds(&self) -> Vec<&'static str> {
        self.sent.lock().iter().map(|m| m.kind()).collect()
    }
}

#[async_trait]
impl TunnelChannel for MockChannel {
    async fn send(&self, message: &TunnelMessage) -> TunnelResult<()> {
        if self.is_closed() {
            return Err(TunnelError::Closed);
        }
        self.sent.lock().push(message.clone());
        Ok(())
    }

    async fn receive(&self) -> TunnelResult<TunnelMessage> {
        loop {
            if self.is_closed() {
                return Err(TunnelError::Closed);
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.close_transitions.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}
