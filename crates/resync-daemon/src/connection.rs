//! Individual peer connection.
//!
//! A `Connection` is the handle the rest of the daemon sees: an address and
//! an unbounded outbound queue, usable before the WebSocket is even open.
//! One task per connection drives the socket (see `run_session`): it
//! exchanges join frames, then pumps the queue and dispatches inbound
//! messages on the `MessageBus` inline.

use anyhow::{anyhow, bail, Result};
use futures::stream::SplitStream;
use futures::{SinkExt, StreamExt};
use resync_core::protocol::{
    Credentials, Inbound, JoinMessage, Message, MessageBus, ReplySink, SendError,
    MAX_MESSAGE_SIZE,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, Notify};
use tokio_tungstenite::{
    tungstenite::{Error as WsError, Message as WsMessage},
    WebSocketStream,
};
use tracing::{debug, error, info, warn};

/// A connection to one peer.
pub struct Connection {
    /// Peer address: the URL we dialed, or the remote socket address for accepted connections
    address: String,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    /// Set once the peer's join frame has been received
    joined: AtomicBool,
    closing: Notify,
}

impl Connection {
    /// Create a connection and the receiving end of its outbound queue.
    pub(crate) fn new(address: String) -> (Arc<Self>, mpsc::UnboundedReceiver<Vec<u8>>) {
        let (outbound, rx) = mpsc::unbounded_channel();
        let connection = Arc::new(Self {
            address,
            outbound,
            joined: AtomicBool::new(false),
            closing: Notify::new(),
        });
        (connection, rx)
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Whether the channel join completed in both directions.
    pub fn is_joined(&self) -> bool {
        self.joined.load(Ordering::Acquire)
    }

    /// Whether the connection task has finished.
    pub fn is_closed(&self) -> bool {
        self.outbound.is_closed()
    }

    /// Ask the connection task to close the socket and stop.
    pub fn close(&self) {
        // Stores a permit if the task is not waiting right now.
        self.closing.notify_one();
    }

    /// Resolves once `close` has been called.
    pub(crate) async fn closing_requested(&self) {
        self.closing.notified().await
    }
}

impl ReplySink for Connection {
    fn peer(&self) -> &str {
        &self.address
    }

    fn send(&self, message: &Message) -> Result<(), SendError> {
        self.outbound
            .send(message.to_json())
            .map_err(|_| SendError::Closed(self.address.clone()))
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("address", &self.address)
            .field("joined", &self.is_joined())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Which side of the WebSocket we are.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Role {
    /// We dialed: send our join first.
    Client,
    /// We accepted: wait for theirs, then answer.
    Server,
}

/// What a WebSocket frame means for the session.
enum Frame {
    Data(Vec<u8>),
    Skip,
    Close,
}

fn classify_frame(address: &str, msg: WsMessage) -> Frame {
    let data = match msg {
        WsMessage::Binary(data) => data.to_vec(),
        WsMessage::Text(text) => text.as_bytes().to_vec(),
        WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Frame(_) => return Frame::Skip,
        WsMessage::Close(_) => {
            debug!("Received close frame from {}", address);
            return Frame::Close;
        }
    };

    if data.len() > MAX_MESSAGE_SIZE {
        warn!(
            "Message from {} exceeds max size ({} > {}), dropping",
            address,
            data.len(),
            MAX_MESSAGE_SIZE
        );
        return Frame::Skip;
    }
    Frame::Data(data)
}

/// Wait for the peer's join frame. Anything else first is a protocol violation.
async fn expect_join<S>(address: &str, read: &mut SplitStream<WebSocketStream<S>>) -> Result<JoinMessage>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        let msg = match read.next().await {
            Some(msg) => msg?,
            None => bail!("{} closed before joining", address),
        };
        match classify_frame(address, msg) {
            Frame::Skip => continue,
            Frame::Close => bail!("{} closed before joining", address),
            Frame::Data(data) => {
                return JoinMessage::from_json(&data)
                    .ok_or_else(|| anyhow!("{} sent a message before joining", address));
            }
        }
    }
}

/// Drive one connection until it closes.
///
/// Exchanges join frames according to `role`, then forwards queued frames to
/// the socket and dispatches decoded inbound messages on `bus`, one at a time.
pub(crate) async fn run_session<S>(
    connection: Arc<Connection>,
    ws: WebSocketStream<S>,
    mut outbound: mpsc::UnboundedReceiver<Vec<u8>>,
    role: Role,
    credentials: &Credentials,
    bus: &MessageBus,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let address = connection.address().to_string();
    let (mut write, mut read) = ws.split();
    let join = JoinMessage::new(credentials).to_json();

    if role == Role::Client {
        write.send(WsMessage::Binary(join.clone().into())).await?;
    }
    let peer_join = tokio::select! {
        join = expect_join(&address, &mut read) => join?,
        _ = connection.closing_requested() => {
            let _ = write.send(WsMessage::Close(None)).await;
            return Ok(());
        }
    };
    if role == Role::Server {
        write.send(WsMessage::Binary(join.into())).await?;
    }

    if peer_join.should_warn_version() {
        warn!(
            "Protocol version mismatch with {}: ours={}, theirs={}",
            address,
            resync_core::protocol::PROTOCOL_VERSION,
            peer_join.version
        );
    }
    connection.joined.store(true, Ordering::Release);
    info!("{} joined channel {}", address, peer_join.channel);

    let source: Arc<dyn ReplySink> = connection.clone();
    loop {
        tokio::select! {
            queued = outbound.recv() => {
                // The connection itself holds a sender, so the queue never ends first.
                let Some(data) = queued else { break };
                write.send(WsMessage::Binary(data.into())).await?;
            }
            incoming = read.next() => {
                let msg = match incoming {
                    Some(Ok(msg)) => msg,
                    Some(Err(WsError::ConnectionClosed | WsError::AlreadyClosed)) | None => {
                        debug!("Connection {} stream ended", address);
                        break;
                    }
                    Some(Err(e)) => return Err(e.into()),
                };
                let data = match classify_frame(&address, msg) {
                    Frame::Data(data) => data,
                    Frame::Skip => continue,
                    Frame::Close => break,
                };
                if JoinMessage::from_json(&data).is_some() {
                    debug!("Ignoring repeated join from {}", address);
                    continue;
                }
                match Message::from_json(&data) {
                    Ok(message) => {
                        debug!("{} from {}", message.message_type(), address);
                        bus.dispatch(&Inbound::new(Arc::clone(&source), message)).await;
                    }
                    Err(e) => error!("Dropping undecodable frame from {}: {}", address, e),
                }
            }
            _ = connection.closing_requested() => {
                debug!("Closing connection to {}", address);
                let _ = write.send(WsMessage::Close(None)).await;
                break;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use resync_core::protocol::messages::ProjectConnected;

    fn project_connected() -> Message {
        Message::ProjectConnected(ProjectConnected {
            project: "P".into(),
        })
    }

    #[test]
    fn test_send_queues_json() {
        let (connection, mut rx) = Connection::new("ws://peer".to_string());
        connection.send(&project_connected()).unwrap();

        let frame = rx.try_recv().unwrap();
        assert_eq!(Message::from_json(&frame).unwrap(), project_connected());
        assert!(!connection.is_joined());
    }

    #[test]
    fn test_send_after_task_ends_fails() {
        let (connection, rx) = Connection::new("ws://peer".to_string());
        drop(rx);

        assert!(connection.is_closed());
        assert_eq!(
            connection.send(&project_connected()),
            Err(SendError::Closed("ws://peer".to_string()))
        );
    }

    #[test]
    fn test_classify_frames() {
        assert!(matches!(
            classify_frame("p", WsMessage::Text("{}".into())),
            Frame::Data(ref d) if d == b"{}"
        ));
        assert!(matches!(
            classify_frame("p", WsMessage::Binary(vec![1, 2].into())),
            Frame::Data(_)
        ));
        assert!(matches!(
            classify_frame("p", WsMessage::Ping(vec![].into())),
            Frame::Skip
        ));
        assert!(matches!(classify_frame("p", WsMessage::Close(None)), Frame::Close));
    }
}
