//! Peer-to-peer synchronization protocol.
//!
//! - `messages`: typed wire messages and their JSON encoding
//! - `join`: connection-level channel join frame
//! - `bus`: inbound dispatch and the transport seams (`ReplySink`, `Outbox`)
//! - `handlers`: reactions to inbound messages
//! - `listeners`: repository-event forwarders producing outbound messages
//! - `state`: pending requests, remote project announcements, counters

pub mod bus;
pub mod handlers;
pub mod join;
pub mod listeners;
pub mod messages;
pub mod state;

pub use bus::{HandlerError, Inbound, MessageBus, MessageHandler, Outbox, ReplySink, SendError};
pub use handlers::{install, SyncContext};
pub use join::{Credentials, JoinMessage, MAX_MESSAGE_SIZE, PROTOCOL_VERSION};
pub use listeners::{
    install_forwarders, ResourceChangedForwarder, ResourceCreatedForwarder,
    ResourceDeletedForwarder,
};
pub use messages::{Message, MessageType, ProtocolError};
pub use state::{PendingRequests, RemoteProjects, SyncStats, SyncStatsSnapshot};
