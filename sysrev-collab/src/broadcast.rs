//! Room-based relay of document changes and chat messages.
//!
//! The [`Broadcaster`] owns the process-wide [`RoomRegistry`]. Only the
//! operations below touch it:
//!
//! | Operation | Effect |
//! |-----------|--------|
//! | [`connect`](Broadcaster::connect) | register, join own channel |
//! | [`join`](Broadcaster::join) / [`leave`](Broadcaster::leave) | document room membership |
//! | [`broadcast_change`](Broadcaster::broadcast_change) | `updateDocument` to room minus sender |
//! | [`send_message`](Broadcaster::send_message) | `receiveMessage` to the `receiverId` channel |
//! | [`disconnect`](Broadcaster::disconnect) | revoke every membership |
//! | [`shutdown`](Broadcaster::shutdown) | clear the registry |
//!
//! The registry lock is held across membership changes and the delivery
//! loop, so every member of a room sees that room's broadcasts in the order
//! they were processed. Delivery never awaits; see [`Transport`].

use std::sync::atomic::{AtomicU64, Ordering};

use serde_json::Value;
use tokio::sync::Mutex;

use crate::protocol::{change_target, message_target, ClientMessage, ServerMessage};
use crate::room::{ConnectionId, RoomName, RoomRegistry};
use crate::transport::{Frame, Transport};

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    pub changes_relayed: u64,
    pub messages_relayed: u64,
    pub deliveries: u64,
    pub deliveries_dropped: u64,
    pub active_connections: usize,
    pub active_rooms: usize,
}

/// Counters updated on the delivery path, read via [`Broadcaster::stats`].
#[derive(Default)]
struct AtomicBroadcastStats {
    changes_relayed: AtomicU64,
    messages_relayed: AtomicU64,
    deliveries: AtomicU64,
    deliveries_dropped: AtomicU64,
}

/// Relays events between connections that share a room.
pub struct Broadcaster<T> {
    registry: Mutex<RoomRegistry>,
    transport: T,
    stats: AtomicBroadcastStats,
}

impl<T: Transport> Broadcaster<T> {
    pub fn new(transport: T) -> Self {
        Self {
            registry: Mutex::new(RoomRegistry::new()),
            transport,
            stats: AtomicBroadcastStats::default(),
        }
    }

    /// The delivery transport.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Register a new connection and subscribe it to its own channel.
    ///
    /// Returns `false` if the id is already connected.
    pub async fn connect(&self, connection: &ConnectionId) -> bool {
        let mut registry = self.registry.lock().await;
        if !registry.register(connection) {
            return false;
        }
        registry.join(connection, RoomName::channel(connection));
        log::debug!("Connection {connection} registered");
        true
    }

    /// Add a connection to the room of `(document_type, document_id)`.
    ///
    /// Joining a room twice is a no-op. Returns `true` if the membership is new.
    pub async fn join(
        &self,
        connection: &ConnectionId,
        document_type: &Value,
        document_id: &Value,
    ) -> bool {
        self.join_room(connection, RoomName::document(document_type, document_id))
            .await
    }

    /// Add a connection to a room by name.
    pub async fn join_room(&self, connection: &ConnectionId, room: RoomName) -> bool {
        let joined = self.registry.lock().await.join(connection, room.clone());
        if joined {
            log::debug!("Connection {connection} joined {room}");
        }
        joined
    }

    /// Remove a connection from the room of `(document_type, document_id)`.
    pub async fn leave(
        &self,
        connection: &ConnectionId,
        document_type: &Value,
        document_id: &Value,
    ) -> bool {
        let room = RoomName::document(document_type, document_id);
        let left = self.registry.lock().await.leave(connection, &room);
        if left {
            log::debug!("Connection {connection} left {room}");
        }
        left
    }

    /// Relay a change to every member of its document room except `sender`.
    ///
    /// The payload is forwarded as-is. Payloads without `documentType` and
    /// `documentId` address no room and are dropped. Returns the number of
    /// connections the change was handed to.
    pub async fn broadcast_change(&self, sender: &ConnectionId, payload: Value) -> usize {
        let Some(room) = change_target(&payload) else {
            log::debug!("Dropping change from {sender}: no documentType/documentId");
            return 0;
        };
        let Some(frame) = encode_frame(&ServerMessage::UpdateDocument(payload)) else {
            return 0;
        };

        let registry = self.registry.lock().await;
        let delivered = self.deliver_to_room(&registry, &room, &frame, Some(sender));
        self.stats.changes_relayed.fetch_add(1, Ordering::Relaxed);
        log::trace!("Change from {sender} to {room} reached {delivered} connections");
        delivered
    }

    /// Deliver a chat message to every member of its `receiverId` channel.
    ///
    /// The sender is included if it is a member of that channel. Returns the
    /// number of connections the message was handed to.
    pub async fn send_message(&self, message: Value) -> usize {
        let Some(channel) = message_target(&message) else {
            log::debug!("Dropping chat message without receiverId");
            return 0;
        };
        let Some(frame) = encode_frame(&ServerMessage::ReceiveMessage(message)) else {
            return 0;
        };

        let registry = self.registry.lock().await;
        let delivered = self.deliver_to_room(&registry, &channel, &frame, None);
        self.stats.messages_relayed.fetch_add(1, Ordering::Relaxed);
        if delivered == 0 {
            log::debug!("Chat message to {channel} had no recipients");
        }
        delivered
    }

    /// Remove a connection from every room it belongs to.
    ///
    /// Remaining members are not notified. Returns the number of rooms left.
    pub async fn disconnect(&self, connection: &ConnectionId) -> usize {
        let left = self.registry.lock().await.remove_connection(connection);
        if !left.is_empty() {
            log::debug!("Connection {connection} disconnected from {} rooms", left.len());
        }
        left.len()
    }

    /// Apply one client event on behalf of `origin`.
    ///
    /// Returns the number of deliveries it caused.
    pub async fn dispatch(&self, origin: &ConnectionId, message: ClientMessage) -> usize {
        match message {
            ClientMessage::JoinDocument(document_type, document_id) => {
                self.join(origin, &document_type, &document_id).await;
                0
            }
            ClientMessage::LeaveDocument(document_type, document_id) => {
                self.leave(origin, &document_type, &document_id).await;
                0
            }
            ClientMessage::DocumentChange(payload) => self.broadcast_change(origin, payload).await,
            ClientMessage::SendMessage(message) => self.send_message(message).await,
        }
    }

    /// Drop every connection and room.
    ///
    /// Returns the number of connections that were still registered.
    pub async fn shutdown(&self) -> usize {
        let mut registry = self.registry.lock().await;
        let connections = registry.connection_count();
        registry.clear();
        log::info!("Broadcaster cleared ({connections} connections dropped)");
        connections
    }

    fn deliver_to_room(
        &self,
        registry: &RoomRegistry,
        room: &RoomName,
        frame: &Frame,
        except: Option<&ConnectionId>,
    ) -> usize {
        let mut delivered = 0;
        for member in registry.members(room) {
            if Some(member) == except {
                continue;
            }
            match self.transport.deliver(member, frame) {
                Ok(()) => delivered += 1,
                Err(e) => {
                    self.stats.deliveries_dropped.fetch_add(1, Ordering::Relaxed);
                    log::warn!("Dropped frame for {member} in {room}: {e}");
                }
            }
        }
        self.stats
            .deliveries
            .fetch_add(delivered as u64, Ordering::Relaxed);
        delivered
    }

    pub async fn is_member(&self, connection: &ConnectionId, room: &RoomName) -> bool {
        self.registry.lock().await.is_member(connection, room)
    }

    pub async fn is_connected(&self, connection: &ConnectionId) -> bool {
        self.registry.lock().await.is_registered(connection)
    }

    pub async fn member_count(&self, room: &RoomName) -> usize {
        self.registry.lock().await.member_count(room)
    }

    pub async fn room_count(&self) -> usize {
        self.registry.lock().await.room_count()
    }

    pub async fn connection_count(&self) -> usize {
        self.registry.lock().await.connection_count()
    }

    pub async fn stats(&self) -> BroadcastStats {
        let registry = self.registry.lock().await;
        BroadcastStats {
            changes_relayed: self.stats.changes_relayed.load(Ordering::Relaxed),
            messages_relayed: self.stats.messages_relayed.load(Ordering::Relaxed),
            deliveries: self.stats.deliveries.load(Ordering::Relaxed),
            deliveries_dropped: self.stats.deliveries_dropped.load(Ordering::Relaxed),
            active_connections: registry.connection_count(),
            active_rooms: registry.room_count(),
        }
    }
}

fn encode_frame(message: &ServerMessage) -> Option<Frame> {
    match message.encode() {
        Ok(text) => Some(Frame::from(text)),
        Err(e) => {
            log::warn!("Failed to encode outbound frame: {e}");
            None
        }
    }
}
