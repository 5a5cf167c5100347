//! WebSocket server accepting peer connections.
//!
//! Accepted connections join the same `Connector` as outgoing ones, keyed
//! by the peer's socket address, so broadcasts reach both kinds.

use crate::connection::Connection;
use crate::connector::Connector;
use anyhow::Result;
use resync_core::protocol::Credentials;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::accept_async;
use tracing::{debug, error, info};

/// Accepts incoming peers into a `Connector`.
pub struct SyncServer {
    connector: Arc<Connector>,
    credentials: Credentials,
}

impl SyncServer {
    pub fn new(connector: Arc<Connector>, credentials: Credentials) -> Self {
        Self {
            connector,
            credentials,
        }
    }

    /// Bind to an address and return the TCP listener.
    pub async fn bind(listen_addr: &str) -> Result<TcpListener> {
        let listener = TcpListener::bind(listen_addr).await?;
        info!("WebSocket server listening on {}", listener.local_addr()?);
        Ok(listener)
    }

    /// Upgrade an incoming TCP connection and register it.
    ///
    /// The session waits for the peer's join frame and answers with ours.
    /// Returns `None` if the WebSocket upgrade fails.
    pub async fn accept(&self, stream: TcpStream, addr: SocketAddr) -> Option<Arc<Connection>> {
        let ws_stream = match accept_async(stream).await {
            Ok(ws) => ws,
            Err(e) => {
                // Health checks (like `nc -z`) connect and immediately close without
                // completing the WebSocket handshake. Log these as debug, not error.
                let err_str = e.to_string();
                if err_str.contains("Handshake not finished")
                    || err_str.contains("Connection reset")
                    || err_str.contains("unexpected EOF")
                {
                    debug!("Connection closed before handshake from {}", addr);
                } else {
                    error!("WebSocket upgrade failed for {}: {}", addr, e);
                }
                return None;
            }
        };

        info!("New connection from {}", addr);
        Some(
            self.connector
                .attach(addr.to_string(), ws_stream, &self.credentials),
        )
    }

    /// Accept connections until the listener fails or the task is aborted.
    ///
    /// Each upgrade runs in its own task so a slow peer cannot stall the loop.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    let server = Arc::clone(&self);
                    tokio::spawn(async move {
                        server.accept(stream, addr).await;
                    });
                }
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                }
            }
        }
    }
}
