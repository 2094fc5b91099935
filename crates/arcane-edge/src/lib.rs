//! # Arcane Edge
//!
//! The manager/agent edge of the tunnel plane: the process-wide tunnel
//! registry, the agent client that dials out and serves forwarded
//! requests, the manager server that correlates responses, the streaming
//! response recorder, the edge-aware proxy, and outbound event publishing.

pub mod agent;
pub mod events;
pub mod manager;
pub mod proxy;
pub mod recorder;
pub mod registry;
pub mod tunnel;

#[cfg(test)]
pub(crate) mod test_support;

pub use agent::{AgentConfig, AgentTunnelClient, LocalHandler, TransportMode};
pub use events::{clear_active_tunnel, has_active_tunnel, publish_event, set_active_tunnel};
pub use manager::{NoopCallbacks, TunnelCallbacks, run_rpc_listener, serve_tunnel, spawn_registry_sweep};
pub use proxy::{EdgeProxy, SessionValidator};
pub use recorder::{ResponseMode, ResponseRecorder};
pub use registry::{TunnelRegistry, default_registry, set_default_registry};
pub use tunnel::{AgentTunnel, TunnelHttpRequest, TunnelHttpResponse};
