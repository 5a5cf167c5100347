//! Repository events and the bus that routes them.
//!
//! Every listener declares up front which event kinds it wants via a
//! [`KindSet`]. `publish` only invokes listeners whose set contains the
//! event's kind, synchronously and in registration order.
//!
//! Thread-safe for the multi-threaded Tokio runtime: the watch thread
//! publishes while other threads add and remove listeners.

use crate::resource::Resource;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock, Weak};
use tracing::{error, trace};

/// What happened to a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RepositoryEventKind {
    Created,
    Modified,
    Deleted,
}

impl RepositoryEventKind {
    fn bit(self) -> u8 {
        match self {
            Self::Created => 0b001,
            Self::Modified => 0b010,
            Self::Deleted => 0b100,
        }
    }
}

impl fmt::Display for RepositoryEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => write!(f, "CREATED"),
            Self::Modified => write!(f, "MODIFIED"),
            Self::Deleted => write!(f, "DELETED"),
        }
    }
}

/// Fixed set of event kinds a listener accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct KindSet(u8);

impl KindSet {
    pub const NONE: KindSet = KindSet(0);
    pub const ALL: KindSet = KindSet(0b111);

    pub fn only(kind: RepositoryEventKind) -> Self {
        Self(kind.bit())
    }

    pub fn of(kinds: &[RepositoryEventKind]) -> Self {
        kinds.iter().fold(Self::NONE, |set, kind| set.with(*kind))
    }

    pub fn with(self, kind: RepositoryEventKind) -> Self {
        Self(self.0 | kind.bit())
    }

    pub fn contains(&self, kind: RepositoryEventKind) -> bool {
        self.0 & kind.bit() != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }
}

/// A local change to a resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepositoryEvent {
    kind: RepositoryEventKind,
    resource: Resource,
}

impl RepositoryEvent {
    pub fn new(kind: RepositoryEventKind, resource: Resource) -> Self {
        Self { kind, resource }
    }

    pub fn kind(&self) -> RepositoryEventKind {
        self.kind
    }

    pub fn resource(&self) -> &Resource {
        &self.resource
    }
}

/// Error returned by a listener. Logged by the bus, never propagated.
pub type ListenerError = Box<dyn std::error::Error + Send + Sync>;

/// Receives repository events of the kinds it declares.
pub trait RepositoryListener: Send + Sync {
    /// Kinds this listener accepts. Read once, at registration.
    fn interested_kinds(&self) -> KindSet;

    fn on_event(&self, event: &RepositoryEvent) -> Result<(), ListenerError>;

    /// Name used in logs.
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }
}

/// Identifies a registered listener for removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(usize);

struct Registration {
    id: ListenerId,
    kinds: KindSet,
    listener: Arc<dyn RepositoryListener>,
}

struct FnListener<F> {
    kinds: KindSet,
    callback: F,
}

impl<F> RepositoryListener for FnListener<F>
where
    F: Fn(&RepositoryEvent) + Send + Sync,
{
    fn interested_kinds(&self) -> KindSet {
        self.kinds
    }

    fn on_event(&self, event: &RepositoryEvent) -> Result<(), ListenerError> {
        (self.callback)(event);
        Ok(())
    }

    fn name(&self) -> &str {
        "subscription"
    }
}

/// Subscription handle that unsubscribes automatically when dropped.
///
/// Hold this value to keep receiving events, drop it to unsubscribe.
pub struct Subscription {
    bus: Weak<RepositoryEventBus>,
    id: ListenerId,
}

impl Subscription {
    pub fn id(&self) -> ListenerId {
        self.id
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.remove_listener(self.id);
        }
    }
}

/// Publish/subscribe bus for repository events.
///
/// Wrap in `Arc` to share between the watch service and listeners.
pub struct RepositoryEventBus {
    listeners: RwLock<Vec<Registration>>,
    next_id: AtomicUsize,
}

impl Default for RepositoryEventBus {
    fn default() -> Self {
        Self {
            listeners: RwLock::new(Vec::new()),
            next_id: AtomicUsize::new(0),
        }
    }
}

impl RepositoryEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener. Its kind set is captured now and never re-read.
    pub fn add_listener(&self, listener: Arc<dyn RepositoryListener>) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let kinds = listener.interested_kinds();
        self.listeners
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(Registration {
                id,
                kinds,
                listener,
            });
        id
    }

    /// Remove a listener. Returns false if it was not registered.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write().unwrap_or_else(|e| e.into_inner());
        let before = listeners.len();
        listeners.retain(|r| r.id != id);
        listeners.len() != before
    }

    /// Subscribe a closure to the given kinds. Returns `Subscription` that unsubscribes on drop.
    ///
    /// Requires `self` to be wrapped in `Arc`.
    pub fn subscribe(
        self: &Arc<Self>,
        kinds: KindSet,
        callback: impl Fn(&RepositoryEvent) + Send + Sync + 'static,
    ) -> Subscription {
        let id = self.add_listener(Arc::new(FnListener { kinds, callback }));
        Subscription {
            bus: Arc::downgrade(self),
            id,
        }
    }

    pub fn listener_count(&self) -> usize {
        self.listeners
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    /// Deliver an event to every listener interested in its kind.
    ///
    /// A failing or panicking listener is logged and skipped; the rest still run.
    pub fn publish(&self, event: &RepositoryEvent) {
        // Snapshot so listeners may add/remove listeners without deadlocking.
        let targets: Vec<Arc<dyn RepositoryListener>> = self
            .listeners
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|r| r.kinds.contains(event.kind()))
            .map(|r| Arc::clone(&r.listener))
            .collect();

        trace!(
            "Publishing {} {} to {} listener(s)",
            event.kind(),
            event.resource(),
            targets.len()
        );

        for listener in targets {
            match catch_unwind(AssertUnwindSafe(|| listener.on_event(event))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    error!(
                        "Listener {} failed on {} {}: {}",
                        listener.name(),
                        event.kind(),
                        event.resource(),
                        e
                    );
                }
                Err(_) => {
                    error!(
                        "Listener {} panicked on {} {}",
                        listener.name(),
                        event.kind(),
                        event.resource()
                    );
                }
            }
        }
    }
}
