//! Inbound message dispatch and the transport-facing seams.
//!
//! The transport hands every decoded message to [`MessageBus::dispatch`]
//! together with the connection it came from. Handlers reply through that
//! connection's [`ReplySink`]; locally originated messages go out through an
//! [`Outbox`].

use super::messages::{Message, MessageType};
use async_trait::async_trait;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, RwLock};
use thiserror::Error;
use tracing::{debug, error};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SendError {
    #[error("Connection to {0} is closed")]
    Closed(String),
}

/// Where replies to an inbound message are sent: the connection it arrived on.
pub trait ReplySink: Send + Sync {
    /// Address of the remote peer.
    fn peer(&self) -> &str;

    /// Queue a message for the peer. Never blocks.
    fn send(&self, message: &Message) -> Result<(), SendError>;
}

/// Fan-out for locally originated messages.
pub trait Outbox: Send + Sync {
    /// Queue `message` on every open connection. Returns how many accepted it.
    fn broadcast(&self, message: &Message) -> usize;
}

/// A message received from a peer.
pub struct Inbound {
    pub source: Arc<dyn ReplySink>,
    pub message: Message,
}

impl Inbound {
    pub fn new(source: Arc<dyn ReplySink>, message: Message) -> Self {
        Self { source, message }
    }

    /// Reply on the originating connection.
    pub fn reply(&self, message: Message) -> Result<(), SendError> {
        self.source.send(&message)
    }
}

/// Error returned by a handler. Logged by the bus, never propagated.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Reacts to inbound messages of one type.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    fn message_type(&self) -> MessageType;

    async fn handle(&self, inbound: &Inbound) -> Result<(), HandlerError>;
}

/// Routes inbound messages to the handlers registered for their type.
#[derive(Default)]
pub struct MessageBus {
    handlers: RwLock<Vec<Arc<dyn MessageHandler>>>,
}

impl MessageBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, handler: Arc<dyn MessageHandler>) {
        self.handlers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(handler);
    }

    pub fn handler_count(&self) -> usize {
        self.handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    /// Run every handler registered for the message's type, in registration order.
    ///
    /// Handler errors and panics are logged and do not stop the other handlers.
    /// Returns how many handlers were invoked.
    pub async fn dispatch(&self, inbound: &Inbound) -> usize {
        let message_type = inbound.message.message_type();
        let targets: Vec<Arc<dyn MessageHandler>> = self
            .handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|h| h.message_type() == message_type)
            .cloned()
            .collect();

        if targets.is_empty() {
            debug!(
                "No handler for {} from {}",
                message_type,
                inbound.source.peer()
            );
        }

        for handler in &targets {
            match AssertUnwindSafe(handler.handle(inbound)).catch_unwind().await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    error!(
                        "Handler for {} from {} failed: {}",
                        message_type,
                        inbound.source.peer(),
                        e
                    );
                }
                Err(_) => {
                    error!(
                        "Handler for {} from {} panicked",
                        message_type,
                        inbound.source.peer()
                    );
                }
            }
        }

        targets.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::messages::ProjectConnected;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct NullSink;

    impl ReplySink for NullSink {
        fn peer(&self) -> &str {
            "test-peer"
        }

        fn send(&self, _message: &Message) -> Result<(), SendError> {
            Ok(())
        }
    }

    enum Behavior {
        Count,
        Fail,
        Panic,
    }

    struct TestHandler {
        message_type: MessageType,
        behavior: Behavior,
        calls: AtomicUsize,
    }

    impl TestHandler {
        fn new(message_type: MessageType, behavior: Behavior) -> Arc<Self> {
            Arc::new(Self {
                message_type,
                behavior,
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl MessageHandler for TestHandler {
        fn message_type(&self) -> MessageType {
            self.message_type
        }

        async fn handle(&self, _inbound: &Inbound) -> Result<(), HandlerError> {
            self.calls.fetch_add(1, Ordering::Relaxed);
            match self.behavior {
                Behavior::Count => Ok(()),
                Behavior::Fail => Err("handler failed".into()),
                Behavior::Panic => panic!("handler panic"),
            }
        }
    }

    fn project_connected() -> Inbound {
        Inbound::new(
            Arc::new(NullSink),
            Message::ProjectConnected(ProjectConnected {
                project: "P".into(),
            }),
        )
    }

    #[tokio::test]
    async fn test_dispatch_routes_by_type() {
        let bus = MessageBus::new();
        let connected = TestHandler::new(MessageType::ProjectConnected, Behavior::Count);
        let stored = TestHandler::new(MessageType::ResourceStored, Behavior::Count);
        bus.register(connected.clone());
        bus.register(stored.clone());

        let invoked = bus.dispatch(&project_connected()).await;

        assert_eq!(invoked, 1);
        assert_eq!(connected.calls.load(Ordering::Relaxed), 1);
        assert_eq!(stored.calls.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn test_failing_handlers_are_isolated() {
        let bus = MessageBus::new();
        let failing = TestHandler::new(MessageType::ProjectConnected, Behavior::Fail);
        let panicking = TestHandler::new(MessageType::ProjectConnected, Behavior::Panic);
        let healthy = TestHandler::new(MessageType::ProjectConnected, Behavior::Count);
        bus.register(failing.clone());
        bus.register(panicking.clone());
        bus.register(healthy.clone());

        let invoked = bus.dispatch(&project_connected()).await;

        assert_eq!(invoked, 3);
        assert_eq!(failing.calls.load(Ordering::Relaxed), 1);
        assert_eq!(healthy.calls.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_unhandled_message() {
        let bus = MessageBus::new();
        assert_eq!(bus.dispatch(&project_connected()).await, 0);
        assert_eq!(bus.handler_count(), 0);
    }
}
