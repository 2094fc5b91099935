//! Configuration schema for an Arcane node, extracted with figment from
//! programmatic defaults and `ARCANE_`-prefixed environment variables
//! (`ARCANE_NODE__LISTEN_ADDR`, `ARCANE_TUNNEL__TOKEN`, ...).

use std::time::Duration;

use figment::Figment;
use figment::providers::{Env, Serialized};
use serde::{Deserialize, Serialize};

use arcane_edge::TransportMode;

use crate::error::{ConfigError, ConfigResult};

/// Root configuration for a node.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ArcaneConfig {
    pub node: NodeConfig,
    pub tunnel: TunnelConfig,
    pub streams: StreamsConfig,
    pub logging: LoggingConfig,
}

/// Identity and listeners of this node.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// HTTP/WebSocket listen address.
    pub listen_addr: String,
    /// This node's own environment id.
    pub environment_id: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:3552".to_string(),
            environment_id: "local".to_string(),
        }
    }
}

/// Which wire the agent dials.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Rpc,
    Websocket,
    Auto,
}

impl From<TransportKind> for TransportMode {
    fn from(kind: TransportKind) -> Self {
        match kind {
            TransportKind::Rpc => TransportMode::Rpc,
            TransportKind::Websocket => TransportMode::Websocket,
            TransportKind::Auto => TransportMode::Auto,
        }
    }
}

/// Agent/manager tunnel settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TunnelConfig {
    /// Agent mode: maintain an outbound tunnel to the manager.
    pub enabled: bool,
    /// Manager WebSocket endpoint for the agent dial.
    pub manager_ws_url: String,
    /// Manager RPC listener for the agent dial, `host:port`.
    pub manager_rpc_addr: String,
    pub transport: TransportKind,
    /// Agent token presented at registration.
    pub token: String,
    /// Manager mode: RPC listen address for inbound agent tunnels.
    /// Empty disables the listener (the WebSocket endpoint stays up).
    pub rpc_listen_addr: String,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            manager_ws_url: String::new(),
            manager_rpc_addr: String::new(),
            transport: TransportKind::Auto,
            token: String::new(),
            rpc_listen_addr: String::new(),
        }
    }
}

/// Fan-out hub and log pipeline settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamsConfig {
    pub broadcast_capacity: usize,
    pub client_queue: usize,
    pub max_batch: usize,
    pub debounce_ms: u64,
    /// Concurrent `system/stats` sockets allowed per client IP.
    pub max_stats_connections_per_ip: usize,
}

impl Default for StreamsConfig {
    fn default() -> Self {
        Self {
            broadcast_capacity: 256,
            client_queue: 64,
            max_batch: 50,
            debounce_ms: 400,
            max_stats_connections_per_ip: 5,
        }
    }
}

impl StreamsConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive, e.g. `info` or `arcane_edge=debug`.
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl ArcaneConfig {
    /// Loads configuration from defaults overlaid with `ARCANE_` env
    /// variables and validates the result.
    pub fn load() -> ConfigResult<Self> {
        let config: ArcaneConfig = Figment::from(Serialized::defaults(ArcaneConfig::default()))
            .merge(Env::prefixed("ARCANE_").split("__"))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects configurations that cannot run.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.node.listen_addr.trim().is_empty() {
            return Err(ConfigError::Invalid("node.listen_addr is empty".into()));
        }
        if self.node.environment_id.trim().is_empty() {
            return Err(ConfigError::Invalid("node.environment_id is empty".into()));
        }
        if self.streams.broadcast_capacity == 0
            || self.streams.client_queue == 0
            || self.streams.max_batch == 0
        {
            return Err(ConfigError::Invalid(
                "streams capacities must be greater than zero".into(),
            ));
        }
        if self.tunnel.enabled {
            if self.tunnel.token.trim().is_empty() {
                return Err(ConfigError::Invalid(
                    "tunnel.token is required in agent mode".into(),
                ));
            }
            let has_ws = !self.tunnel.manager_ws_url.trim().is_empty();
            let has_rpc = !self.tunnel.manager_rpc_addr.trim().is_empty();
            let reachable = match self.tunnel.transport {
                TransportKind::Rpc => has_rpc,
                TransportKind::Websocket => has_ws,
                TransportKind::Auto => has_ws || has_rpc,
            };
            if !reachable {
                return Err(ConfigError::Invalid(
                    "tunnel is enabled but no manager endpoint is configured".into(),
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let config = ArcaneConfig::default();
        config.validate().unwrap();
        assert_eq!(config.node.environment_id, "local");
        assert_eq!(config.streams.max_batch, 50);
        assert_eq!(config.streams.debounce(), Duration::from_millis(400));
        assert_eq!(config.tunnel.transport, TransportKind::Auto);
    }

    #[test]
    fn agent_mode_requires_token_and_endpoint() {
        let mut config = ArcaneConfig::default();
        config.tunnel.enabled = true;
        assert!(config.validate().is_err());

        config.tunnel.token = "secret".into();
        assert!(config.validate().is_err());

        config.tunnel.manager_rpc_addr = "manager:9443".into();
        config.validate().unwrap();

        // An RPC-only endpoint is not enough for websocket-only transport.
        config.tunnel.transport = TransportKind::Websocket;
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_capacities_are_rejected() {
        let mut config = ArcaneConfig::default();
        config.streams.client_queue = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn transport_kind_maps_to_edge_mode() {
        assert_eq!(TransportMode::from(TransportKind::Rpc), TransportMode::Rpc);
        assert_eq!(
            TransportMode::from(TransportKind::Auto),
            TransportMode::Auto
        );
    }
}
