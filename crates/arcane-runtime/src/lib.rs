//! # Arcane Runtime
//!
//! Ties the edge plane together into a runnable node: typed
//! configuration, logging setup, the axum route surface under
//! `/api/environments/{env_id}/`, and the orchestration that binds
//! listeners, runs the tunnel plane, and shuts everything down.
//!
//! The runtime is a library: the embedding application supplies the
//! external collaborators (persistence, auth policy, container runtime)
//! through [`NodeServices`] and drives [`ArcaneRuntime::run`].

pub mod config;
pub mod error;
pub mod logging;
pub mod runtime;
pub mod server;

pub use config::{ArcaneConfig, LoggingConfig, NodeConfig, StreamsConfig, TransportKind, TunnelConfig};
pub use error::{ConfigError, ConfigResult, RuntimeError, RuntimeResult};
pub use logging::{filter_from, try_init as try_init_logging};
pub use runtime::{ArcaneRuntime, RouterHandler};
pub use server::{AppState, NodeServices, StreamHubs, build_router, split_environment_path};
