//! Process-wide map of environment id to the active agent tunnel.
//!
//! One tunnel per environment: a new registration wins, closing the tunnel
//! it displaces. The registry lock guards only the map mutation; tunnels
//! are always closed after the lock is released.

use std::collections::HashMap;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info};

use crate::tunnel::AgentTunnel;

/// Registry of live agent tunnels keyed by environment id.
#[derive(Default)]
pub struct TunnelRegistry {
    tunnels: Mutex<HashMap<String, Arc<AgentTunnel>>>,
}

impl TunnelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The live tunnel for `environment_id`, skipping closed entries.
    pub fn get(&self, environment_id: &str) -> Option<Arc<AgentTunnel>> {
        self.tunnels
            .lock()
            .get(environment_id)
            .filter(|tunnel| !tunnel.is_closed())
            .cloned()
    }

    /// Registers `tunnel` for its environment. Any prior tunnel for the
    /// same environment is closed first; the new connection wins.
    pub async fn register(&self, tunnel: Arc<AgentTunnel>) {
        let environment_id = tunnel.environment_id().to_string();
        let displaced = self.tunnels.lock().remove(&environment_id);
        if let Some(old) = displaced {
            info!(environment_id = %environment_id, "replacing existing tunnel");
            old.close().await;
        }
        self.tunnels.lock().insert(environment_id.clone(), tunnel);
        info!(environment_id = %environment_id, "tunnel registered");
    }

    /// Removes and closes the tunnel for `environment_id`, if any.
    pub async fn unregister(&self, environment_id: &str) {
        let removed = self.tunnels.lock().remove(environment_id);
        if let Some(tunnel) = removed {
            tunnel.close().await;
            info!(environment_id = %environment_id, "tunnel unregistered");
        }
    }

    /// Removes `tunnel` only while it is still the registered entry for
    /// its environment. Used by serve loops on exit so a replacement
    /// registered in the meantime is left alone.
    pub async fn remove_if_current(&self, tunnel: &Arc<AgentTunnel>) {
        let environment_id = tunnel.environment_id();
        let removed = {
            let mut tunnels = self.tunnels.lock();
            match tunnels.get(environment_id) {
                Some(current) if Arc::ptr_eq(current, tunnel) => tunnels.remove(environment_id),
                _ => None,
            }
        };
        if let Some(tunnel) = removed {
            tunnel.close().await;
            debug!(environment_id = %environment_id, "tunnel removed on serve exit");
        }
    }

    /// Closes tunnels whose last heartbeat is older than `max_age`.
    /// Returns how many were reaped.
    pub async fn cleanup_stale(&self, max_age: Duration) -> usize {
        let stale: Vec<Arc<AgentTunnel>> = {
            let mut tunnels = self.tunnels.lock();
            let ids: Vec<String> = tunnels
                .iter()
                .filter(|(_, tunnel)| tunnel.heartbeat_age() > max_age || tunnel.is_closed())
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter()
                .filter_map(|id| tunnels.remove(&id))
                .collect()
        };
        let count = stale.len();
        for tunnel in stale {
            info!(
                environment_id = %tunnel.environment_id(),
                heartbeat_age_secs = tunnel.heartbeat_age().as_secs(),
                "closing stale tunnel"
            );
            tunnel.close().await;
        }
        count
    }

    /// Closes every tunnel. Used on shutdown.
    pub async fn close_all(&self) {
        let drained: Vec<Arc<AgentTunnel>> = self.tunnels.lock().drain().map(|(_, t)| t).collect();
        for tunnel in drained {
            tunnel.close().await;
        }
    }

    pub fn len(&self) -> usize {
        self.tunnels.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tunnels.lock().is_empty()
    }

    /// Environment ids with a registered tunnel.
    pub fn environment_ids(&self) -> Vec<String> {
        self.tunnels.lock().keys().cloned().collect()
    }
}

static DEFAULT_REGISTRY: LazyLock<RwLock<Arc<TunnelRegistry>>> =
    LazyLock::new(|| RwLock::new(Arc::new(TunnelRegistry::new())));

/// The process-wide registry.
pub fn default_registry() -> Arc<TunnelRegistry> {
    DEFAULT_REGISTRY.read().clone()
}

/// Swaps the process-wide registry. Intended for tests.
pub fn set_default_registry(registry: Arc<TunnelRegistry>) {
    *DEFAULT_REGISTRY.write() = registry;
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::*;
    use crate::test_support::MockChannel;

    fn tunnel(env: &str) -> (Arc<AgentTunnel>, Arc<MockChannel>) {
        let channel = MockChannel::new();
        (Arc::new(AgentTunnel::new(env, channel.clone())), channel)
    }

    #[tokio::test]
    async fn register_then_get_round_trips() {
        let registry = TunnelRegistry::new();
        let (t, _) = tunnel("env-1");
        registry.register(Arc::clone(&t)).await;
        assert!(Arc::ptr_eq(&registry.get("env-1").unwrap(), &t));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn new_registration_closes_the_old_tunnel_exactly_once() {
        let registry = TunnelRegistry::new();
        let (old, old_channel) = tunnel("env-1");
        let (new, _) = tunnel("env-1");
        registry.register(Arc::clone(&old)).await;
        registry.register(Arc::clone(&new)).await;

        assert_eq!(old_channel.close_transitions.load(Ordering::SeqCst), 1);
        assert!(old.is_closed());
        assert!(Arc::ptr_eq(&registry.get("env-1").unwrap(), &new));

        // Even an explicit unregister later cannot close the old one twice.
        old.close().await;
        assert_eq!(old_channel.close_transitions.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn get_skips_closed_tunnels() {
        let registry = TunnelRegistry::new();
        let (t, _) = tunnel("env-1");
        registry.register(Arc::clone(&t)).await;
        t.close().await;
        assert!(registry.get("env-1").is_none());
    }

    #[tokio::test]
    async fn stale_sweep_reaps_by_heartbeat_age() {
        let registry = TunnelRegistry::new();
        let (fresh, _) = tunnel("fresh");
        let (stale, _) = tunnel("stale");
        registry.register(Arc::clone(&fresh)).await;
        registry.register(Arc::clone(&stale)).await;

        tokio::time::sleep(Duration::from_millis(30)).await;
        fresh.touch_heartbeat();

        let reaped = registry.cleanup_stale(Duration::from_millis(20)).await;
        assert_eq!(reaped, 1);
        assert!(registry.get("fresh").is_some());
        assert!(registry.get("stale").is_none());
        assert!(stale.is_closed());
    }

    #[tokio::test]
    async fn remove_if_current_leaves_replacements_alone() {
        let registry = TunnelRegistry::new();
        let (old, _) = tunnel("env-1");
        let (new, new_channel) = tunnel("env-1");
        registry.register(Arc::clone(&old)).await;
        registry.register(Arc::clone(&new)).await;

        // The displaced tunnel's serve loop exits and tries to clean up.
        registry.remove_if_current(&old).await;
        assert!(Arc::ptr_eq(&registry.get("env-1").unwrap(), &new));
        assert_eq!(new_channel.close_transitions.load(Ordering::SeqCst), 0);
    }
}
