//! Delivery capability used by the broadcaster.
//!
//! The broadcaster decides *who* receives a frame. A [`Transport`] only
//! knows how to hand an already-encoded frame to one connection. Delivery
//! never blocks: a full or closed route fails immediately and the caller
//! moves on.
//!
//! - [`OutboxTransport`]: bounded mpsc outbox per connection, drained by the
//!   connection's WebSocket writer.
//! - [`MemoryTransport`]: records frames in memory, for tests and embedding.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::protocol::ServerMessage;
use crate::room::ConnectionId;

/// An encoded server frame, shared between all recipients of a broadcast.
pub type Frame = Arc<str>;

/// Why a frame could not be handed to a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DeliveryError {
    #[error("no route to connection")]
    Unknown,
    #[error("outbox full")]
    Full,
    #[error("connection closed")]
    Closed,
}

/// Per-connection delivery capability.
pub trait Transport: Send + Sync {
    /// Hand `frame` to `connection` without waiting.
    fn deliver(&self, connection: &ConnectionId, frame: &Frame) -> Result<(), DeliveryError>;
}

/// Bounded outbox per connection.
///
/// `capacity` frames may be queued for a connection before further
/// deliveries to it are rejected with [`DeliveryError::Full`].
pub struct OutboxTransport {
    outboxes: RwLock<HashMap<ConnectionId, mpsc::Sender<Frame>>>,
    capacity: usize,
}

impl OutboxTransport {
    pub fn new(capacity: usize) -> Self {
        Self {
            outboxes: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    /// Open an outbox for `connection`, replacing any previous one.
    ///
    /// Returns the receiving end for the connection's writer.
    pub fn attach(&self, connection: ConnectionId) -> mpsc::Receiver<Frame> {
        let (tx, rx) = mpsc::channel(self.capacity);
        self.outboxes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(connection, tx);
        rx
    }

    /// Close the outbox of `connection`.
    pub fn detach(&self, connection: &ConnectionId) -> bool {
        self.outboxes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(connection)
            .is_some()
    }

    /// Close every outbox. Returns how many were open.
    pub fn detach_all(&self) -> usize {
        let mut outboxes = self.outboxes.write().unwrap_or_else(PoisonError::into_inner);
        let open = outboxes.len();
        outboxes.clear();
        open
    }

    /// Number of attached connections.
    pub fn len(&self) -> usize {
        self.outboxes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Transport for OutboxTransport {
    fn deliver(&self, connection: &ConnectionId, frame: &Frame) -> Result<(), DeliveryError> {
        let outboxes = self.outboxes.read().unwrap_or_else(PoisonError::into_inner);
        let tx = outboxes.get(connection).ok_or(DeliveryError::Unknown)?;
        tx.try_send(frame.clone()).map_err(|e| match e {
            TrySendError::Full(_) => DeliveryError::Full,
            TrySendError::Closed(_) => DeliveryError::Closed,
        })
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    inboxes: HashMap<ConnectionId, Vec<Frame>>,
    closed: HashSet<ConnectionId>,
}

/// Transport that keeps every delivered frame in memory.
///
/// Any connection id is deliverable until it is [`close`](Self::close)d.
#[derive(Debug, Default)]
pub struct MemoryTransport {
    state: Mutex<MemoryState>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make further deliveries to `connection` fail as if its socket died.
    pub fn close(&self, connection: &ConnectionId) {
        self.lock().closed.insert(connection.clone());
    }

    /// Frames delivered to `connection` so far.
    pub fn frames(&self, connection: &ConnectionId) -> Vec<Frame> {
        self.lock()
            .inboxes
            .get(connection)
            .cloned()
            .unwrap_or_default()
    }

    /// Remove and decode the frames delivered to `connection`.
    pub fn take_messages(&self, connection: &ConnectionId) -> Vec<ServerMessage> {
        self.lock()
            .inboxes
            .remove(connection)
            .unwrap_or_default()
            .iter()
            .filter_map(|frame| ServerMessage::decode(frame).ok())
            .collect()
    }

    /// Total frames delivered to all connections.
    pub fn total_frames(&self) -> usize {
        self.lock().inboxes.values().map(Vec::len).sum()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Transport for MemoryTransport {
    fn deliver(&self, connection: &ConnectionId, frame: &Frame) -> Result<(), DeliveryError> {
        let mut state = self.lock();
        if state.closed.contains(connection) {
            return Err(DeliveryError::Closed);
        }
        state
            .inboxes
            .entry(connection.clone())
            .or_default()
            .push(frame.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(text: &str) -> Frame {
        Arc::from(text)
    }

    #[tokio::test]
    async fn test_outbox_delivery_fifo() {
        let transport = OutboxTransport::new(8);
        let id = ConnectionId::new("A");
        let mut rx = transport.attach(id.clone());

        transport.deliver(&id, &frame("one")).unwrap();
        transport.deliver(&id, &frame("two")).unwrap();

        assert_eq!(&*rx.recv().await.unwrap(), "one");
        assert_eq!(&*rx.recv().await.unwrap(), "two");
    }

    #[test]
    fn test_outbox_unknown_connection() {
        let transport = OutboxTransport::new(8);
        let err = transport.deliver(&ConnectionId::new("ghost"), &frame("x"));
        assert_eq!(err, Err(DeliveryError::Unknown));
    }

    #[test]
    fn test_outbox_full() {
        let transport = OutboxTransport::new(2);
        let id = ConnectionId::new("A");
        let _rx = transport.attach(id.clone());

        assert!(transport.deliver(&id, &frame("1")).is_ok());
        assert!(transport.deliver(&id, &frame("2")).is_ok());
        assert_eq!(transport.deliver(&id, &frame("3")), Err(DeliveryError::Full));
    }

    #[test]
    fn test_outbox_closed_receiver() {
        let transport = OutboxTransport::new(2);
        let id = ConnectionId::new("A");
        drop(transport.attach(id.clone()));

        assert_eq!(transport.deliver(&id, &frame("1")), Err(DeliveryError::Closed));
    }

    #[test]
    fn test_outbox_detach() {
        let transport = OutboxTransport::new(4);
        let id = ConnectionId::new("A");
        let _rx = transport.attach(id.clone());
        assert_eq!(transport.len(), 1);

        assert!(transport.detach(&id));
        assert!(!transport.detach(&id));
        assert!(transport.is_empty());
        assert_eq!(transport.deliver(&id, &frame("x")), Err(DeliveryError::Unknown));
    }

    #[tokio::test]
    async fn test_outbox_detach_all_closes_receivers() {
        let transport = OutboxTransport::new(4);
        let mut a = transport.attach(ConnectionId::new("A"));
        let mut b = transport.attach(ConnectionId::new("B"));

        assert_eq!(transport.detach_all(), 2);
        assert!(transport.is_empty());
        assert!(a.recv().await.is_none());
        assert!(b.recv().await.is_none());
    }

    #[test]
    fn test_outbox_zero_capacity_clamped() {
        assert_eq!(OutboxTransport::new(0).capacity(), 1);
    }

    #[test]
    fn test_memory_transport_records_frames() {
        let transport = MemoryTransport::new();
        let id = ConnectionId::new("B");
        let encoded = ServerMessage::ReceiveMessage(serde_json::json!({"text": "hi"}))
            .encode()
            .unwrap();

        transport.deliver(&id, &Frame::from(encoded)).unwrap();
        assert_eq!(transport.frames(&id).len(), 1);
        assert_eq!(transport.total_frames(), 1);

        let messages = transport.take_messages(&id);
        assert_eq!(
            messages,
            vec![ServerMessage::ReceiveMessage(serde_json::json!({"text": "hi"}))]
        );
        assert!(transport.frames(&id).is_empty());
    }

    #[test]
    fn test_memory_transport_closed() {
        let transport = MemoryTransport::new();
        let id = ConnectionId::new("B");
        transport.close(&id);
        assert_eq!(transport.deliver(&id, &frame("x")), Err(DeliveryError::Closed));
        assert_eq!(transport.total_frames(), 0);
    }
}
