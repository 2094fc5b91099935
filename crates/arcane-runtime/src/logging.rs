//! Logging setup driven by the node's `logging` config section.

use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use crate::config::LoggingConfig;

/// Crates whose output is pinned to the configured level even when the
/// global default differs.
const NODE_CRATES: [&str; 5] = [
    "arcane_core",
    "arcane_transport",
    "arcane_edge",
    "arcane_streams",
    "arcane_runtime",
];

/// Builds the node's filter. An explicit `RUST_LOG` wins outright;
/// otherwise the configured level becomes the global default and every
/// arcane crate gets a matching per-crate directive.
pub fn filter_from(config: &LoggingConfig) -> EnvFilter {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => node_filter(&config.level),
    }
}

fn node_filter(level: &str) -> EnvFilter {
    let level = match level.trim() {
        "" => "info",
        other => other,
    };
    let mut filter = EnvFilter::new(level);
    for name in NODE_CRATES {
        if let Ok(directive) = format!("{name}={level}").parse() {
            filter = filter.add_directive(directive);
        }
    }
    filter
}

/// Installs the subscriber for this node.
///
/// # Panics
///
/// Panics if a subscriber has already been set; embedders that install
/// their own should use [`try_init`].
pub fn init(config: &LoggingConfig) {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter_from(config))
        .init();
}

/// Like [`init`], but leaves an already-installed subscriber in place.
/// Returns whether this call installed one.
pub fn try_init(config: &LoggingConfig) -> bool {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter_from(config))
        .try_init()
        .is_ok()
}
