//! resync-daemon library: native filesystem repository, watch service and
//! WebSocket transport.
//!
//! The binary in `main.rs` only parses configuration and wires these
//! together; integration tests drive them directly.

pub mod config;
pub mod connection;
pub mod connector;
pub mod fs_repository;
pub mod server;
pub mod service;
pub mod snapshot;
pub mod watcher;

// Re-export key types for convenience
pub use config::{ConfigError, DaemonConfig, ProjectConfig};
pub use connection::Connection;
pub use connector::Connector;
pub use fs_repository::FsRepository;
pub use server::SyncServer;
pub use service::SyncService;
pub use watcher::{WatchError, WatchService};
