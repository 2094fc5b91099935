//! Bidirectional-streaming RPC tunnel transport.
//!
//! Envelopes travel as length-prefixed bincode frames over one TCP stream,
//! the duplex equivalent of a single streaming `Connect` call. The first
//! frame from the agent must be a registration; see [`handshake`].

mod channel;
mod handshake;

pub use channel::{FramedChannel, MAX_FRAME_BYTES};
pub use handshake::{HANDSHAKE_TIMEOUT, accept_agent, register_agent};

use tokio::net::TcpStream;

use arcane_core::{TunnelError, TunnelResult};

/// Dials the manager's RPC listener at `addr` (`host:port`).
pub async fn connect_rpc(addr: &str) -> TunnelResult<FramedChannel<TcpStream>> {
    let stream = TcpStream::connect(addr)
        .await
        .map_err(|e| TunnelError::ConnectionFailed {
            url: addr.to_string(),
            reason: e.to_string(),
        })?;
    stream
        .set_nodelay(true)
        .map_err(|e| TunnelError::ConnectionFailed {
            url: addr.to_string(),
            reason: e.to_string(),
        })?;
    Ok(FramedChannel::new(stream))
}
