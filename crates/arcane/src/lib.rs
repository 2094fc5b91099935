//! # Arcane
//!
//! Facade over the Arcane edge plane crates. Most applications only need
//! this crate:
//!
//! ```rust,ignore
//! use arcane::runtime::{ArcaneConfig, ArcaneRuntime, NodeServices};
//!
//! let config = ArcaneConfig::load()?;
//! let runtime = ArcaneRuntime::new(config, services);
//! runtime.run().await?;
//! ```

pub use arcane_core as core;
pub use arcane_edge as edge;
pub use arcane_runtime as runtime;
pub use arcane_streams as streams;
pub use arcane_transport as transport;

// The types most embedders touch, at the top level.
pub use arcane_core::{
    Environment, EnvironmentLookup, EventPayload, TokenResolver, TunnelChannel, TunnelError,
    TunnelMessage, TunnelPayload,
};
pub use arcane_edge::{EdgeProxy, SessionValidator, TunnelRegistry, publish_event};
pub use arcane_runtime::{ArcaneConfig, ArcaneRuntime, NodeServices};
pub use arcane_streams::{Hub, HubConfig, LogMessage};
