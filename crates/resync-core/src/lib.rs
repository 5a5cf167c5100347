//! resync-core: platform-independent pieces of the resync daemon.
//!
//! This crate provides:
//! - The `Resource` value object and its content hash
//! - The repository event bus with per-listener kind filtering
//! - The `RepositoryProvider` boundary and an in-memory implementation
//! - The synchronization protocol: messages, handlers and forwarders

pub mod events;
pub mod memory;
pub mod project;
pub mod protocol;
pub mod repository;
pub mod resource;

pub use events::{
    KindSet, ListenerId, RepositoryEvent, RepositoryEventBus, RepositoryEventKind,
    RepositoryListener, Subscription,
};
pub use memory::MemoryRepository;
pub use project::{ProjectRegistry, ResolvedPath};
pub use repository::{RepositoryError, RepositoryProvider};
pub use resource::{content_hash, Resource, ResourceError, ResourceType, EMPTY_HASH};
