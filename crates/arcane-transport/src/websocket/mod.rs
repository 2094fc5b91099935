//! Framed-JSON-over-WebSocket tunnel transport.
//!
//! One envelope per text frame. The server side wraps a socket accepted by
//! axum at `tunnel/connect`; the client side wraps a tungstenite dial from
//! the agent. Both enforce the single-writer discipline and classify
//! ordinary teardown (close codes normal / going-away / no-status, reset
//! and EOF strings) as [`arcane_core::TunnelError::Closed`].

use std::time::Duration;

mod client;
mod server;

pub use client::{ClientWsChannel, connect_agent_ws};
pub use server::ServerWsChannel;

/// Per-send write deadline applied by both WebSocket channels.
pub const DEFAULT_WRITE_DEADLINE: Duration = Duration::from_secs(10);
