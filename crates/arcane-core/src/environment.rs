//! Environment model and the lookup seam the proxy dispatches through.

use async_trait::async_trait;

/// Alias accepted wherever the node's own environment id is expected.
pub const LOCAL_ENVIRONMENT_ALIAS: &str = "local";

/// A container host managed through an Arcane node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Environment {
    /// Stable environment id.
    pub id: String,
    /// Base URL of the remote node's HTTP API.
    pub api_url: String,
    /// Access token accepted by the remote node's auth layer.
    pub access_token: String,
    /// Disabled environments reject proxied traffic.
    pub enabled: bool,
}

/// Resolves environment ids to connection details.
///
/// Persistence is an external collaborator; the edge plane only sees this
/// trait.
#[async_trait]
pub trait EnvironmentLookup: Send + Sync {
    async fn lookup(&self, environment_id: &str) -> Option<Environment>;
}

/// Maps an agent token to the environment id it registers, or `None` when
/// the token is unknown.
#[async_trait]
pub trait TokenResolver: Send + Sync {
    async fn resolve(&self, token: &str) -> Option<String>;
}
