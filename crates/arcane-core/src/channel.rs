//! The contract both wire transports implement.
//!
//! A [`TunnelChannel`] is one duplex connection carrying [`TunnelMessage`]
//! envelopes. Sends are serialized by the implementation (single-writer
//! discipline); receives have a single reader. `close` is idempotent and
//! unblocks a pending `receive`.

use async_trait::async_trait;

use crate::error::{TunnelError, TunnelResult};
use crate::message::TunnelMessage;

#[async_trait]
pub trait TunnelChannel: Send + Sync {
    /// Sends one envelope. Fails with [`TunnelError::Closed`] once the
    /// channel has been closed.
    async fn send(&self, message: &TunnelMessage) -> TunnelResult<()>;

    /// Receives the next envelope. Blocks until a frame arrives, the peer
    /// goes away, or `close` is called.
    async fn receive(&self) -> TunnelResult<TunnelMessage>;

    /// Closes the channel. Safe to call more than once.
    async fn close(&self);

    /// Whether the channel has been closed (locally or by the peer).
    fn is_closed(&self) -> bool;

    /// Whether `error` is ordinary teardown noise rather than a fault.
    /// Callers use this to log at debug instead of warn.
    fn is_expected_receive_error(&self, error: &TunnelError) -> bool {
        matches!(error, TunnelError::Closed)
    }
}

/// Teardown phrases that show up in transport error strings when a peer
/// disconnects without a clean close.
const EXPECTED_TEARDOWN_MARKERS: [&str; 7] = [
    "use of closed network connection",
    "connection reset by peer",
    "broken pipe",
    "connection closed",
    "eof",
    "context canceled",
    "operation was canceled",
];

/// Whether an error message reads as expected connection teardown.
pub fn is_expected_teardown_message(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    EXPECTED_TEARDOWN_MARKERS
        .iter()
        .any(|marker| lower.contains(marker))
}
