//! Fan-out hub: one upstream source multicast to a set of subscribers with
//! bounded memory, ordered delivery, and slow-client eviction.
//!
//! A hub is a single task owning the client set; register, unregister, and
//! broadcast arrive over channels so the set is never touched from
//! outside. When the last client leaves, the `on_empty` hook fires,
//! typically cancelling the owner context that keeps the source producer
//! alive.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use arcane_core::{StreamError, StreamResult};

/// One message on its way to subscribers.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
    /// Keepalive probe; writers map it to a protocol ping.
    Ping,
}

/// Capacities for a hub's channels.
#[derive(Debug, Clone, Copy)]
pub struct HubConfig {
    /// Broadcast queue into the hub; producers drop on overflow.
    pub broadcast_capacity: usize,
    /// Per-client send queue; a client that lets it fill is evicted.
    pub client_queue: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            broadcast_capacity: 256,
            client_queue: 64,
        }
    }
}

/// A subscriber's receiving end. Dropping it (or letting the queue fill)
/// detaches the client from the hub.
pub struct ClientHandle {
    pub id: u64,
    pub frames: mpsc::Receiver<Frame>,
}

struct Registration {
    id: u64,
    sender: mpsc::Sender<Frame>,
}

/// Handle to a running hub.
pub struct Hub {
    config: HubConfig,
    next_id: AtomicU64,
    clients: Arc<AtomicUsize>,
    register_tx: mpsc::Sender<Registration>,
    unregister_tx: mpsc::UnboundedSender<u64>,
    broadcast_tx: mpsc::Sender<Frame>,
}

impl Hub {
    /// Spawns the hub's run loop. `on_empty` fires (at most once per
    /// emptiness transition) whenever the last client leaves. The join
    /// handle resolves once every handle to the hub is gone.
    pub fn spawn(
        config: HubConfig,
        on_empty: impl Fn() + Send + 'static,
    ) -> (Arc<Hub>, JoinHandle<()>) {
        let (register_tx, register_rx) = mpsc::channel(16);
        let (unregister_tx, unregister_rx) = mpsc::unbounded_channel();
        let (broadcast_tx, broadcast_rx) = mpsc::channel(config.broadcast_capacity.max(1));
        let clients = Arc::new(AtomicUsize::new(0));
        let hub = Arc::new(Hub {
            config,
            next_id: AtomicU64::new(1),
            clients: Arc::clone(&clients),
            register_tx,
            unregister_tx,
            broadcast_tx,
        });
        // The run loop must not hold the hub handle: dropping the last
        // handle is what ends the loop.
        let task = tokio::spawn(run_loop(
            register_rx,
            unregister_rx,
            broadcast_rx,
            Box::new(on_empty),
            clients,
        ));
        (hub, task)
    }

    /// Adds a subscriber and returns its handle.
    pub async fn register(&self) -> StreamResult<ClientHandle> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (sender, frames) = mpsc::channel(self.config.client_queue.max(1));
        self.register_tx
            .send(Registration { id, sender })
            .await
            .map_err(|_| StreamError::SourceClosed("hub stopped".into()))?;
        Ok(ClientHandle { id, frames })
    }

    /// Detaches a subscriber. Safe to call after eviction.
    pub fn unregister(&self, id: u64) {
        let _ = self.unregister_tx.send(id);
    }

    /// Queues a frame for every subscriber. Never blocks: when the
    /// broadcast queue is full the frame is dropped and
    /// [`StreamError::Backpressure`] returned.
    pub fn broadcast(&self, frame: Frame) -> StreamResult<()> {
        self.broadcast_tx.try_send(frame).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => StreamError::Backpressure,
            mpsc::error::TrySendError::Closed(_) => {
                StreamError::SourceClosed("hub stopped".into())
            }
        })
    }

    /// Number of currently registered subscribers.
    pub fn client_count(&self) -> usize {
        self.clients.load(Ordering::SeqCst)
    }
}

async fn run_loop(
    mut register_rx: mpsc::Receiver<Registration>,
    mut unregister_rx: mpsc::UnboundedReceiver<u64>,
    mut broadcast_rx: mpsc::Receiver<Frame>,
    on_empty: Box<dyn Fn() + Send>,
    count: Arc<AtomicUsize>,
) {
    let mut clients: Vec<(u64, mpsc::Sender<Frame>)> = Vec::new();
    loop {
        tokio::select! {
            registration = register_rx.recv() => {
                let Some(Registration { id, sender }) = registration else { break };
                clients.push((id, sender));
                count.store(clients.len(), Ordering::SeqCst);
                trace!(client_id = id, clients = clients.len(), "hub client registered");
            }
            unregistered = unregister_rx.recv() => {
                let Some(id) = unregistered else { break };
                let before = clients.len();
                clients.retain(|(client_id, _)| *client_id != id);
                if clients.len() != before {
                    count.store(clients.len(), Ordering::SeqCst);
                    trace!(client_id = id, clients = clients.len(), "hub client unregistered");
                    if clients.is_empty() {
                        on_empty();
                    }
                }
            }
            frame = broadcast_rx.recv() => {
                let Some(frame) = frame else { break };
                let mut evicted = false;
                clients.retain(|(id, sender)| match sender.try_send(frame.clone()) {
                    Ok(()) => true,
                    Err(_) => {
                        // Closing the send channel (by dropping the sender
                        // here) is the eviction; the writer drains what it
                        // already has and exits.
                        debug!(client_id = *id, "slow client evicted");
                        evicted = true;
                        false
                    }
                });
                if evicted {
                    count.store(clients.len(), Ordering::SeqCst);
                    if clients.is_empty() {
                        on_empty();
                    }
                }
            }
        }
    }
}
