//! WebSocket client for the collaboration server.
//!
//! Provides:
//! - Connection setup, waiting for the `connected` handshake
//! - Document room join/leave
//! - Change and chat message sending
//! - A stream of [`ClientEvent`]s relayed by the server
//!
//! There is no offline queue: the server keeps no history, so anything
//! sent while disconnected could never be replayed to peers anyway.

use std::time::Duration;

use futures_util::{SinkExt, Stream, StreamExt};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::{self, Message};

use crate::protocol::{ClientMessage, ProtocolError, ServerMessage};
use crate::room::ConnectionId;

/// How long to wait for the server's `connected` frame.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Events emitted by the client.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// A change made by another member of a joined document room
    DocumentUpdated(Value),
    /// A chat message addressed to our channel
    MessageReceived(Value),
    /// Connection lost
    Disconnected,
}

/// A connected collaboration client.
pub struct CollabClient {
    /// Id assigned by the server; also our chat channel
    connection_id: ConnectionId,

    /// Channel to the WebSocket writer task
    outgoing_tx: mpsc::Sender<String>,

    /// Event receiver for the application
    event_rx: Option<mpsc::Receiver<ClientEvent>>,

    server_url: String,
}

impl CollabClient {
    /// Connect to the server and complete the handshake.
    ///
    /// Spawns background tasks for reading/writing WebSocket messages.
    pub async fn connect(server_url: impl Into<String>) -> Result<Self, ProtocolError> {
        let server_url = server_url.into();
        let (ws_stream, _) = tokio_tungstenite::connect_async(server_url.as_str())
            .await
            .map_err(|e| ProtocolError::ConnectionFailed(e.to_string()))?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let connection_id = tokio::time::timeout(HANDSHAKE_TIMEOUT, read_handshake(&mut ws_reader))
            .await
            .map_err(|_| ProtocolError::Timeout)??;

        log::debug!("Connected to {server_url} as {connection_id}");

        // Writer task: forward outgoing channel to WebSocket, close when
        // the client is dropped.
        let (out_tx, mut out_rx) = mpsc::channel::<String>(256);
        tokio::spawn(async move {
            while let Some(text) = out_rx.recv().await {
                if ws_writer.send(Message::text(text)).await.is_err() {
                    return;
                }
            }
            let _ = ws_writer.send(Message::Close(None)).await;
        });

        // Reader task: turn relayed frames into events.
        let (event_tx, event_rx) = mpsc::channel(256);
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Text(text)) => {
                        let event = match ServerMessage::decode(text.as_str()) {
                            Ok(ServerMessage::UpdateDocument(payload)) => {
                                ClientEvent::DocumentUpdated(payload)
                            }
                            Ok(ServerMessage::ReceiveMessage(message)) => {
                                ClientEvent::MessageReceived(message)
                            }
                            Ok(ServerMessage::Connected { .. }) => continue,
                            Err(e) => {
                                log::warn!("Ignoring malformed server frame: {e}");
                                continue;
                            }
                        };
                        if event_tx.send(event).await.is_err() {
                            return;
                        }
                    }
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }
            let _ = event_tx.send(ClientEvent::Disconnected).await;
        });

        Ok(Self {
            connection_id,
            outgoing_tx: out_tx,
            event_rx: Some(event_rx),
            server_url,
        })
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<ClientEvent>> {
        self.event_rx.take()
    }

    /// Join the room of `(document_type, document_id)`.
    pub async fn join_document(
        &self,
        document_type: impl Into<Value>,
        document_id: impl Into<Value>,
    ) -> Result<(), ProtocolError> {
        self.send(&ClientMessage::join_document(document_type, document_id))
            .await
    }

    /// Leave the room of `(document_type, document_id)`.
    pub async fn leave_document(
        &self,
        document_type: impl Into<Value>,
        document_id: impl Into<Value>,
    ) -> Result<(), ProtocolError> {
        self.send(&ClientMessage::leave_document(document_type, document_id))
            .await
    }

    /// Send a change payload (`documentType`, `documentId`, ...) to the room.
    pub async fn send_change(&self, payload: Value) -> Result<(), ProtocolError> {
        self.send(&ClientMessage::DocumentChange(payload)).await
    }

    /// Send a chat message (`receiverId`, ...).
    pub async fn send_message(&self, message: Value) -> Result<(), ProtocolError> {
        self.send(&ClientMessage::SendMessage(message)).await
    }

    async fn send(&self, message: &ClientMessage) -> Result<(), ProtocolError> {
        let encoded = message.encode()?;
        self.outgoing_tx
            .send(encoded)
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)
    }

    /// Close the connection.
    ///
    /// Pending outgoing frames are flushed before the close frame.
    pub fn close(self) {
        drop(self.outgoing_tx);
    }

    /// Server-assigned connection id, also the channel that receives our chat.
    pub fn connection_id(&self) -> &ConnectionId {
        &self.connection_id
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }
}

/// Wait for the `connected` frame and return the assigned id.
async fn read_handshake<S>(reader: &mut S) -> Result<ConnectionId, ProtocolError>
where
    S: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
{
    while let Some(msg) = reader.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                return match ServerMessage::decode(text.as_str())? {
                    ServerMessage::Connected { connection_id } => Ok(connection_id),
                    other => Err(ProtocolError::Handshake(format!("{other:?}"))),
                };
            }
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => {}
        }
    }
    Err(ProtocolError::ConnectionClosed)
}
