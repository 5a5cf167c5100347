//! Wiring of repository, protocol and transport into one running node.

use crate::connection::Connection;
use crate::connector::Connector;
use crate::fs_repository::FsRepository;
use crate::server::SyncServer;
use resync_core::events::ListenerId;
use resync_core::protocol::messages::{ProjectConnected, ProjectDisconnected};
use resync_core::protocol::{
    install, install_forwarders, Credentials, Message, MessageBus, Outbox, PendingRequests,
    RemoteProjects, ReplySink, SyncContext, SyncStatsSnapshot,
};
use resync_core::repository::{RepositoryProvider, Result};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// A synchronizing node: local projects on disk plus a set of peers.
///
/// Local changes are broadcast to every peer and messages from peers are
/// applied to the local repository. Dropping the service closes all
/// connections and stops accepting new ones.
pub struct SyncService {
    repository: Arc<FsRepository>,
    context: Arc<SyncContext>,
    connector: Arc<Connector>,
    credentials: Credentials,
    forwarders: Vec<ListenerId>,
    servers: Mutex<Vec<JoinHandle<()>>>,
}

impl SyncService {
    pub fn new(repository: Arc<FsRepository>, credentials: Credentials, request_ttl: Duration) -> Self {
        let provider: Arc<dyn RepositoryProvider> = repository.clone();
        let context = Arc::new(SyncContext::with_pending(
            provider,
            PendingRequests::with_ttl(request_ttl.as_millis() as i64),
        ));

        let bus = Arc::new(MessageBus::new());
        install(&bus, Arc::clone(&context));
        let connector = Connector::new(bus);

        // Announce our projects on every new connection.
        let announcer: Weak<FsRepository> = Arc::downgrade(&repository);
        connector.on_opened(move |connection| {
            if let Some(repository) = announcer.upgrade() {
                announce_projects(&repository, connection);
            }
        });
        let bookkeeping: Weak<SyncContext> = Arc::downgrade(&context);
        connector.on_closed(move |address| {
            if let Some(context) = bookkeeping.upgrade() {
                context.remote_projects().forget_peer(address);
            }
        });

        let outbox: Arc<dyn Outbox> = connector.clone();
        let forwarders = install_forwarders(repository.events(), outbox);

        Self {
            repository,
            context,
            connector,
            credentials,
            forwarders,
            servers: Mutex::new(Vec::new()),
        }
    }

    pub fn repository(&self) -> &Arc<FsRepository> {
        &self.repository
    }

    pub fn connector(&self) -> &Arc<Connector> {
        &self.connector
    }

    pub fn remote_projects(&self) -> &RemoteProjects {
        self.context.remote_projects()
    }

    pub fn stats(&self) -> SyncStatsSnapshot {
        self.context.stats().snapshot()
    }

    /// Start synchronizing a project and tell connected peers about it.
    pub async fn add_project(&self, id: &str, root: &Path) -> Result<bool> {
        let added = self.repository.add_project(id, root).await?;
        if added {
            info!("Project {} added at {}", id, root.display());
            self.connector
                .broadcast(&Message::ProjectConnected(ProjectConnected {
                    project: id.to_string(),
                }));
        }
        Ok(added)
    }

    /// Stop synchronizing a project and tell connected peers.
    pub async fn remove_project(&self, id: &str) -> Result<bool> {
        let removed = self.repository.remove_project(id).await?;
        if removed {
            info!("Project {} removed", id);
            self.connector
                .broadcast(&Message::ProjectDisconnected(ProjectDisconnected {
                    project: id.to_string(),
                }));
        }
        Ok(removed)
    }

    /// Open (or reuse) the connection to a peer URL.
    pub fn connect(&self, address: &str) -> Arc<Connection> {
        self.connector.connect(address, &self.credentials)
    }

    pub fn disconnect(&self, address: &str) -> bool {
        self.connector.disconnect(address)
    }

    /// Accept peer connections on `listen_addr`. Returns the bound address.
    pub async fn listen(&self, listen_addr: &str) -> anyhow::Result<SocketAddr> {
        let listener = SyncServer::bind(listen_addr).await?;
        let local_addr = listener.local_addr()?;
        let server = Arc::new(SyncServer::new(
            Arc::clone(&self.connector),
            self.credentials.clone(),
        ));
        let handle = tokio::spawn(server.serve(listener));
        self.servers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(handle);
        Ok(local_addr)
    }
}

fn announce_projects(repository: &FsRepository, connection: &Arc<Connection>) {
    for project in repository.project_ids() {
        let message = Message::ProjectConnected(ProjectConnected { project });
        if let Err(e) = connection.send(&message) {
            warn!("Failed to announce projects to {}: {}", connection.address(), e);
            return;
        }
    }
    debug!("Queued project announcements for {}", connection.address());
}

impl Drop for SyncService {
    fn drop(&mut self) {
        // The forwarders hold the connector, which holds the handlers, which
        // hold the repository: removing them breaks the cycle.
        for id in self.forwarders.drain(..) {
            self.repository.events().remove_listener(id);
        }
        self.connector.close_all();
        for handle in self
            .servers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
        {
            handle.abort();
        }
    }
}
