//! # Arcane Transport
//!
//! Wire transports for the Arcane tunnel plane. Two transports carry the
//! same [`arcane_core::TunnelMessage`] envelope behind the same
//! [`arcane_core::TunnelChannel`] contract:
//!
//! - `ws-transport`: one JSON text frame per envelope over a WebSocket,
//!   registration via the HTTP auth headers at upgrade time.
//! - `rpc-transport`: length-prefixed bincode frames over a duplex TCP
//!   stream, registration as the mandatory first frame.
//!
//! ## Features
//!
//! - `ws-transport`: server (axum) and client (tungstenite) channels
//! - `rpc-transport`: framed channel, dialer, and registration handshake
//! - `full`: both transports

#[cfg(feature = "rpc-transport")]
pub mod framed;

#[cfg(feature = "ws-transport")]
pub mod websocket;

#[cfg(feature = "rpc-transport")]
pub use framed::{FramedChannel, accept_agent, connect_rpc, register_agent};

#[cfg(feature = "ws-transport")]
pub use websocket::{ClientWsChannel, ServerWsChannel, connect_agent_ws};
