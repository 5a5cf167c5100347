//! Connection set shared by outgoing and accepted connections.
//!
//! Provides:
//! - Idempotent `connect` (get-or-create under the map lock)
//! - Broadcast to every open connection (snapshot, then enqueue)
//! - Hooks when a connection opens or its task ends

use crate::connection::{run_session, Connection, Role};
use resync_core::protocol::{Credentials, Message, MessageBus, Outbox, ReplySink};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};
use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tokio_tungstenite::{connect_async, WebSocketStream};
use tracing::{debug, info, warn};

type OpenedHook = Arc<dyn Fn(&Arc<Connection>) + Send + Sync>;
type ClosedHook = Arc<dyn Fn(&str) + Send + Sync>;

/// Owns every live connection and the bus their inbound messages go to.
pub struct Connector {
    bus: Arc<MessageBus>,
    connections: Mutex<HashMap<String, Arc<Connection>>>,
    opened_hooks: RwLock<Vec<OpenedHook>>,
    closed_hooks: RwLock<Vec<ClosedHook>>,
    /// Connection tasks run here, whichever thread opens them.
    runtime: Handle,
    this: Weak<Connector>,
}

impl Connector {
    /// Connector whose connections run on the current tokio runtime.
    ///
    /// Panics when called outside a runtime; use `with_runtime` there.
    pub fn new(bus: Arc<MessageBus>) -> Arc<Self> {
        Self::with_runtime(bus, Handle::current())
    }

    pub fn with_runtime(bus: Arc<MessageBus>, runtime: Handle) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            bus,
            runtime,
            connections: Mutex::new(HashMap::new()),
            opened_hooks: RwLock::new(Vec::new()),
            closed_hooks: RwLock::new(Vec::new()),
            this: this.clone(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<Connection>>> {
        self.connections.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Run `hook` for every new connection, before its WebSocket is open.
    ///
    /// Messages the hook sends are queued and go out right after the join.
    pub fn on_opened(&self, hook: impl Fn(&Arc<Connection>) + Send + Sync + 'static) {
        self.opened_hooks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(Arc::new(hook));
    }

    fn opened(&self, connection: &Arc<Connection>) {
        let hooks: Vec<OpenedHook> = self
            .opened_hooks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        for hook in hooks {
            hook(connection);
        }
    }

    /// Run `hook` with the peer address whenever a connection ends.
    pub fn on_closed(&self, hook: impl Fn(&str) + Send + Sync + 'static) {
        self.closed_hooks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(Arc::new(hook));
    }

    /// Connection to `address`, opening it if there is none yet.
    ///
    /// Returns immediately; the WebSocket is opened and the channel joined in
    /// the background. Messages sent in the meantime are queued. Callable
    /// from any thread.
    pub fn connect(&self, address: &str, credentials: &Credentials) -> Arc<Connection> {
        let mut connections = self.lock();
        if let Some(existing) = connections.get(address) {
            return Arc::clone(existing);
        }

        let (connection, outbound) = Connection::new(address.to_string());
        connections.insert(address.to_string(), Arc::clone(&connection));
        drop(connections);

        info!("Connecting to {}", address);
        self.opened(&connection);
        let task_connection = Arc::clone(&connection);
        let credentials = credentials.clone();
        let bus = Arc::clone(&self.bus);
        let connector = self.this.clone();
        self.runtime.spawn(async move {
            let address = task_connection.address().to_string();
            let result: anyhow::Result<()> = async {
                let (ws, _) = tokio::select! {
                    opened = connect_async(address.as_str()) => opened?,
                    _ = task_connection.closing_requested() => return Ok(()),
                };
                run_session(
                    Arc::clone(&task_connection),
                    ws,
                    outbound,
                    Role::Client,
                    &credentials,
                    &bus,
                )
                .await
            }
            .await;
            finish(&connector, &task_connection, result);
        });

        connection
    }

    /// Register an accepted WebSocket under the peer's socket address and start its session.
    pub fn attach(
        &self,
        address: String,
        ws: WebSocketStream<TcpStream>,
        credentials: &Credentials,
    ) -> Arc<Connection> {
        let (connection, outbound) = Connection::new(address.clone());
        if let Some(previous) = self.lock().insert(address, Arc::clone(&connection)) {
            previous.close();
        }
        self.opened(&connection);

        let task_connection = Arc::clone(&connection);
        let credentials = credentials.clone();
        let bus = Arc::clone(&self.bus);
        let connector = self.this.clone();
        self.runtime.spawn(async move {
            let result = run_session(
                Arc::clone(&task_connection),
                ws,
                outbound,
                Role::Server,
                &credentials,
                &bus,
            )
            .await;
            finish(&connector, &task_connection, result);
        });

        connection
    }

    /// Close and forget the connection to `address`. Returns false if there was none.
    pub fn disconnect(&self, address: &str) -> bool {
        match self.lock().remove(address) {
            Some(connection) => {
                connection.close();
                info!("Disconnected from {}", address);
                true
            }
            None => false,
        }
    }

    /// Close every connection.
    pub fn close_all(&self) {
        let drained: Vec<Arc<Connection>> = self.lock().drain().map(|(_, c)| c).collect();
        for connection in drained {
            connection.close();
        }
    }

    pub fn get(&self, address: &str) -> Option<Arc<Connection>> {
        self.lock().get(address).cloned()
    }

    pub fn is_connected(&self, address: &str) -> bool {
        self.lock().contains_key(address)
    }

    pub fn connection_count(&self) -> usize {
        self.lock().len()
    }

    /// Addresses of all connections, sorted.
    pub fn addresses(&self) -> Vec<String> {
        let mut addresses: Vec<String> = self.lock().keys().cloned().collect();
        addresses.sort();
        addresses
    }

    /// Remove `connection` from the map if it is still the one registered for its address.
    fn forget(&self, connection: &Arc<Connection>) {
        let mut connections = self.lock();
        let current = connections
            .get(connection.address())
            .is_some_and(|c| Arc::ptr_eq(c, connection));
        if current {
            connections.remove(connection.address());
        }
    }
}

fn finish(connector: &Weak<Connector>, connection: &Arc<Connection>, result: anyhow::Result<()>) {
    let address = connection.address();
    match result {
        Ok(()) => info!("Connection to {} closed", address),
        Err(e) => warn!("Connection to {} failed: {}", address, e),
    }
    let Some(connector) = connector.upgrade() else {
        return;
    };
    connector.forget(connection);
    let hooks: Vec<ClosedHook> = connector
        .closed_hooks
        .read()
        .unwrap_or_else(|e| e.into_inner())
        .clone();
    for hook in hooks {
        hook(address);
    }
}

impl Outbox for Connector {
    fn broadcast(&self, message: &Message) -> usize {
        // Snapshot so sends never run under the map lock.
        let targets: Vec<Arc<Connection>> = self.lock().values().cloned().collect();
        let mut sent = 0;
        for connection in targets {
            match connection.send(message) {
                Ok(()) => sent += 1,
                Err(e) => warn!("Failed to broadcast {}: {}", message.message_type(), e),
            }
        }
        debug!("Broadcast {} to {} connection(s)", message.message_type(), sent);
        sent
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use resync_core::protocol::messages::ProjectConnected;
    use tokio::net::TcpListener;

    /// A TCP listener that never answers, so connections stay pending.
    async fn silent_peer() -> (TcpListener, String) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        (listener, url)
    }

    fn message() -> Message {
        Message::ProjectConnected(ProjectConnected {
            project: "P".into(),
        })
    }

    #[tokio::test]
    async fn test_connect_is_get_or_create() {
        let (_listener, url) = silent_peer().await;
        let connector = Connector::new(Arc::new(MessageBus::new()));
        let credentials = Credentials::new("test");

        let first = connector.connect(&url, &credentials);
        let second = connector.connect(&url, &credentials);

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(connector.connection_count(), 1);
        assert!(connector.is_connected(&url));
    }

    #[tokio::test]
    async fn test_broadcast_reaches_every_connection() {
        let (_a, url_a) = silent_peer().await;
        let (_b, url_b) = silent_peer().await;
        let connector = Connector::new(Arc::new(MessageBus::new()));
        let credentials = Credentials::new("test");
        connector.connect(&url_a, &credentials);
        connector.connect(&url_b, &credentials);

        assert_eq!(connector.broadcast(&message()), 2);
        let mut expected = vec![url_a.clone(), url_b.clone()];
        expected.sort();
        assert_eq!(connector.addresses(), expected);

        assert!(connector.disconnect(&url_a));
        assert!(!connector.disconnect(&url_a));
        assert_eq!(connector.broadcast(&message()), 1);
    }

    #[tokio::test]
    async fn test_failed_connection_is_forgotten() {
        // Bind then drop to get a port nobody listens on.
        let url = {
            let (listener, url) = silent_peer().await;
            drop(listener);
            url
        };
        let connector = Connector::new(Arc::new(MessageBus::new()));
        let (closed_tx, mut closed_rx) = tokio::sync::mpsc::unbounded_channel();
        connector.on_closed(move |address| {
            let _ = closed_tx.send(address.to_string());
        });

        connector.connect(&url, &Credentials::new("test"));

        let closed = tokio::time::timeout(std::time::Duration::from_secs(5), closed_rx.recv())
            .await
            .unwrap();
        assert_eq!(closed.as_deref(), Some(url.as_str()));
        assert_eq!(connector.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_opened_hook_runs_once_per_connection() {
        let (_listener, url) = silent_peer().await;
        let connector = Connector::new(Arc::new(MessageBus::new()));
        let opened = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = Arc::clone(&opened);
        connector.on_opened(move |connection| {
            counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            connection.send(&message()).unwrap();
        });

        let credentials = Credentials::new("test");
        connector.connect(&url, &credentials);
        connector.connect(&url, &credentials);

        assert_eq!(opened.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_empty_broadcast() {
        let connector = Connector::new(Arc::new(MessageBus::new()));
        assert_eq!(connector.broadcast(&message()), 0);
    }

    #[test]
    fn test_connect_from_outside_the_runtime() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let url = runtime.block_on(async {
            let (listener, url) = silent_peer().await;
            drop(listener);
            url
        });
        let connector =
            Connector::with_runtime(Arc::new(MessageBus::new()), runtime.handle().clone());
        let (closed_tx, closed_rx) = std::sync::mpsc::channel();
        connector.on_closed(move |address| {
            let _ = closed_tx.send(address.to_string());
        });

        let caller = Arc::clone(&connector);
        let target = url.clone();
        std::thread::spawn(move || {
            caller.connect(&target, &Credentials::new("test"));
        })
        .join()
        .unwrap();

        // The connection task ran on the captured runtime and failed there.
        let closed = closed_rx
            .recv_timeout(std::time::Duration::from_secs(5))
            .unwrap();
        assert_eq!(closed, url);
        assert_eq!(connector.connection_count(), 0);
    }
}
