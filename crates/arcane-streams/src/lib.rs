//! # Arcane Streams
//!
//! The per-stream fan-out plane: a hub multicasting one source to many
//! WebSocket subscribers with bounded memory and slow-client eviction,
//! the log normalize/batch pipeline feeding it, container and system
//! stats producers, the interactive exec bridge, and the live-connection
//! tracker.

pub mod batch;
pub mod client;
pub mod exec;
pub mod hub;
pub mod logs;
pub mod source;
pub mod stats;
pub mod system_stats;
pub mod tracker;

pub use batch::{LogFormat, LogStreamOptions, spawn_log_pipeline};
pub use client::serve_subscriber;
pub use exec::serve_exec;
pub use hub::{ClientHandle, Frame, Hub, HubConfig};
pub use logs::{LogMessage, LogNormalizer};
pub use source::{ExecSession, ExecStarter, LogQuery, LogSource, LogTarget, RuntimePing, StatsSource};
pub use stats::spawn_stats_pump;
pub use system_stats::{SystemStats, SystemStatsCollector, spawn_system_stats};
pub use tracker::{ConnectionInfo, ConnectionTracker, StreamCounts, StreamKind, global_tracker};
