//! Outbound event publishing over the agent's active tunnel.
//!
//! The active-tunnel pointer is one of the two process-wide mutable values
//! in the edge plane (the other is the default registry). It is set by the
//! agent client on connect and cleared on disconnect; tests swap it the
//! same way.

use std::sync::{Arc, LazyLock};

use parking_lot::RwLock;
use tracing::debug;

use arcane_core::{EventPayload, TunnelChannel, TunnelError, TunnelMessage, TunnelPayload, TunnelResult};

static ACTIVE_TUNNEL: LazyLock<RwLock<Option<Arc<dyn TunnelChannel>>>> =
    LazyLock::new(|| RwLock::new(None));

/// Installs `channel` as the active agent tunnel.
pub fn set_active_tunnel(channel: Arc<dyn TunnelChannel>) {
    *ACTIVE_TUNNEL.write() = Some(channel);
}

/// Clears the active agent tunnel.
pub fn clear_active_tunnel() {
    *ACTIVE_TUNNEL.write() = None;
}

/// Whether an agent tunnel is currently connected and open.
pub fn has_active_tunnel() -> bool {
    ACTIVE_TUNNEL
        .read()
        .as_ref()
        .is_some_and(|channel| !channel.is_closed())
}

/// Publishes `event` over the active tunnel.
///
/// Returns [`TunnelError::NoActiveTunnel`] when no tunnel is connected;
/// callers decide whether to fall back to a direct HTTP publish.
pub async fn publish_event(event: EventPayload) -> TunnelResult<()> {
    let channel = ACTIVE_TUNNEL.read().clone();
    let Some(channel) = channel.filter(|channel| !channel.is_closed()) else {
        debug!("event publish with no active tunnel");
        return Err(TunnelError::NoActiveTunnel);
    };
    channel
        .send(&TunnelMessage::new(TunnelPayload::Event(event)))
        .await
}
