//! Manager side of the tunnel plane: accepting agents, dispatching their
//! frames to pending requests, and sweeping stale connections.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use arcane_core::{
    Delivery, EventPayload, TokenResolver, TunnelChannel, TunnelMessage, TunnelPayload,
    TunnelResult,
};
use arcane_transport::{FramedChannel, accept_agent};

use crate::registry::TunnelRegistry;
use crate::tunnel::AgentTunnel;

/// Interval between registry sweeps.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(300);

/// Heartbeat age beyond which a tunnel is considered stale.
pub const STALE_THRESHOLD: Duration = Duration::from_secs(120);

/// Timeout applied to each external event callback invocation.
pub const EVENT_CALLBACK_TIMEOUT: Duration = Duration::from_secs(15);

/// External hooks fired by the manager as tunnels come and go.
///
/// Implementations live outside the edge plane (persistence, notification
/// fan-out); failures are logged and never tear down the tunnel.
#[async_trait::async_trait]
pub trait TunnelCallbacks: Send + Sync {
    /// A tunnel for `environment_id` connected or disconnected.
    async fn on_status_change(&self, environment_id: &str, connected: bool);

    /// An agent published an application event.
    async fn on_event(&self, environment_id: &str, event: EventPayload) -> Result<(), String>;
}

/// Callbacks that do nothing. Useful for tests and minimal deployments.
pub struct NoopCallbacks;

#[async_trait::async_trait]
impl TunnelCallbacks for NoopCallbacks {
    async fn on_status_change(&self, _environment_id: &str, _connected: bool) {}

    async fn on_event(&self, _environment_id: &str, _event: EventPayload) -> Result<(), String> {
        Ok(())
    }
}

/// Registers `channel` as the tunnel for `environment_id` and runs its
/// receive loop until the connection ends. This is the common tail of both
/// transports' accept paths.
pub async fn serve_tunnel(
    environment_id: String,
    channel: Arc<dyn TunnelChannel>,
    registry: Arc<TunnelRegistry>,
    callbacks: Arc<dyn TunnelCallbacks>,
) {
    let tunnel = Arc::new(AgentTunnel::new(environment_id.clone(), channel));
    registry.register(Arc::clone(&tunnel)).await;
    callbacks.on_status_change(&environment_id, true).await;

    run_receive_loop(&tunnel, &callbacks).await;

    registry.remove_if_current(&tunnel).await;
    callbacks.on_status_change(&environment_id, false).await;
}

async fn run_receive_loop(tunnel: &Arc<AgentTunnel>, callbacks: &Arc<dyn TunnelCallbacks>) {
    let environment_id = tunnel.environment_id().to_string();
    loop {
        let message = match tunnel.channel().receive().await {
            Ok(message) => message,
            Err(err) => {
                if tunnel.channel().is_expected_receive_error(&err) {
                    debug!(environment_id = %environment_id, "tunnel receive loop ended");
                } else {
                    warn!(environment_id = %environment_id, error = %err, "tunnel receive failed");
                }
                return;
            }
        };
        dispatch(tunnel, callbacks, message).await;
    }
}

/// Routes one inbound envelope. Frame dispatch must never block the loop
/// for longer than the bounded stream-delivery wait.
async fn dispatch(
    tunnel: &Arc<AgentTunnel>,
    callbacks: &Arc<dyn TunnelCallbacks>,
    message: TunnelMessage,
) {
    match &message.payload {
        TunnelPayload::Heartbeat => {
            tunnel.touch_heartbeat();
            let ack = TunnelMessage::heartbeat_ack(message.id.clone());
            if let Err(err) = tunnel.send(&ack).await {
                debug!(error = %err, "heartbeat ack not sent");
            }
        }
        TunnelPayload::Response { .. } => {
            if tunnel.deliver_response(message) == Delivery::NoWaiter {
                debug!("response frame without waiter");
            }
        }
        TunnelPayload::StreamData { .. }
        | TunnelPayload::StreamEnd
        | TunnelPayload::WsData { .. }
        | TunnelPayload::WsClose => {
            tunnel.deliver_stream_frame(message).await;
        }
        TunnelPayload::Event(event) => {
            let event = event.clone();
            let environment_id = tunnel.environment_id().to_string();
            let outcome = tokio::time::timeout(
                EVENT_CALLBACK_TIMEOUT,
                callbacks.on_event(&environment_id, event),
            )
            .await;
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    warn!(environment_id = %environment_id, error = %err, "event callback failed")
                }
                Err(_) => {
                    warn!(environment_id = %environment_id, "event callback timed out")
                }
            }
        }
        TunnelPayload::HeartbeatAck => {}
        other => {
            debug!(kind = other.kind(), "ignoring unexpected envelope");
        }
    }
}

/// Spawns the periodic registry sweep. Runs until `cancel` fires.
pub fn spawn_registry_sweep(
    registry: Arc<TunnelRegistry>,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let reaped = registry.cleanup_stale(STALE_THRESHOLD).await;
                    if reaped > 0 {
                        info!(reaped, "stale tunnel sweep");
                    }
                }
            }
        }
    })
}

/// Accepts agent RPC connections on `listener` until `cancel` fires.
///
/// Each connection runs supervised: registration resolves the token (or
/// rejects as unauthenticated), the serve duration is logged on exit, and
/// a panic in the connection task is recovered and logged instead of
/// taking the process down.
pub async fn run_rpc_listener(
    listener: TcpListener,
    resolver: Arc<dyn TokenResolver>,
    registry: Arc<TunnelRegistry>,
    callbacks: Arc<dyn TunnelCallbacks>,
    cancel: CancellationToken,
) -> TunnelResult<()> {
    if let Ok(addr) = listener.local_addr() {
        info!(addr = %addr, "tunnel rpc listener started");
    }
    loop {
        let (stream, peer) = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(pair) => pair,
                Err(err) => {
                    warn!(error = %err, "rpc accept failed");
                    continue;
                }
            },
        };

        let resolver = Arc::clone(&resolver);
        let registry = Arc::clone(&registry);
        let callbacks = Arc::clone(&callbacks);
        tokio::spawn(async move {
            let started = Instant::now();
            let connection = tokio::spawn(async move {
                if let Err(err) = stream.set_nodelay(true) {
                    debug!(error = %err, "nodelay not set");
                }
                let channel: Arc<dyn TunnelChannel> = Arc::new(FramedChannel::new(stream));
                match accept_agent(channel.as_ref(), resolver.as_ref()).await {
                    Ok(environment_id) => {
                        serve_tunnel(environment_id, channel, registry, callbacks).await;
                        Ok(())
                    }
                    Err(err) => Err(err),
                }
            });
            match connection.await {
                Ok(Ok(())) => {
                    debug!(peer = %peer, duration_ms = started.elapsed().as_millis() as u64,
                        "rpc tunnel connection ended");
                }
                Ok(Err(err)) => {
                    debug!(peer = %peer, error = %err, "rpc tunnel rejected");
                }
                Err(join) if join.is_panic() => {
                    error!(peer = %peer, error = %join, "rpc tunnel handler panicked");
                }
                Err(_) => {}
            }
        });
    }
    Ok(())
}
