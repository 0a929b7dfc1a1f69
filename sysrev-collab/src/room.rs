//! Connection identities, room names and the room membership registry.
//!
//! A room is named `{documentType}-{documentId}`. Every connection is also
//! the automatic member of a channel named by its own connection id, which
//! is where direct chat messages are delivered.
//!
//! The registry tracks membership in both directions so that a disconnect
//! can revoke every membership without scanning all rooms. Rooms only exist
//! while they have at least one member.

use std::borrow::Cow;
use std::collections::{HashMap, HashSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Identifier of one client connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(String);

impl ConnectionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Fresh server-assigned identifier.
    pub fn random() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ConnectionId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for ConnectionId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Name of a room or channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomName(String);

impl RoomName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Room for a document: `{documentType}-{documentId}`.
    ///
    /// Strings are used verbatim, anything else by its JSON text, so
    /// `("protocol", 42)` and `("protocol", "42")` name the same room.
    pub fn document(document_type: &Value, document_id: &Value) -> Self {
        Self(format!(
            "{}-{}",
            segment(document_type),
            segment(document_id)
        ))
    }

    /// Channel a connection is automatically subscribed to.
    pub fn channel(connection: &ConnectionId) -> Self {
        Self(connection.0.clone())
    }

    /// Channel named by a chat `receiverId`.
    pub fn receiver(receiver_id: &Value) -> Self {
        Self(segment(receiver_id).into_owned())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn segment(value: &Value) -> Cow<'_, str> {
    match value {
        Value::String(s) => Cow::Borrowed(s.as_str()),
        other => Cow::Owned(other.to_string()),
    }
}

/// Bidirectional membership map: rooms → members and connection → rooms.
///
/// A connection must be registered before it can join rooms. Removing the
/// connection revokes all of its memberships in one step.
#[derive(Debug, Default)]
pub struct RoomRegistry {
    rooms: HashMap<RoomName, HashSet<ConnectionId>>,
    memberships: HashMap<ConnectionId, HashSet<RoomName>>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection with no memberships.
    ///
    /// Returns `false` if it was already registered.
    pub fn register(&mut self, connection: &ConnectionId) -> bool {
        if self.memberships.contains_key(connection) {
            return false;
        }
        self.memberships.insert(connection.clone(), HashSet::new());
        true
    }

    /// Add a registered connection to a room.
    ///
    /// Returns `true` only if the membership is new. Unregistered
    /// connections are ignored.
    pub fn join(&mut self, connection: &ConnectionId, room: RoomName) -> bool {
        let Some(joined) = self.memberships.get_mut(connection) else {
            return false;
        };
        if !joined.insert(room.clone()) {
            return false;
        }
        self.rooms
            .entry(room)
            .or_default()
            .insert(connection.clone());
        true
    }

    /// Remove a connection from one room, dropping the room if it empties.
    pub fn leave(&mut self, connection: &ConnectionId, room: &RoomName) -> bool {
        let removed = self
            .memberships
            .get_mut(connection)
            .is_some_and(|joined| joined.remove(room));
        if removed {
            self.detach_member(connection, room);
        }
        removed
    }

    /// Unregister a connection and revoke every membership it held.
    ///
    /// Returns the rooms it was removed from.
    pub fn remove_connection(&mut self, connection: &ConnectionId) -> Vec<RoomName> {
        let Some(joined) = self.memberships.remove(connection) else {
            return Vec::new();
        };
        let mut left: Vec<RoomName> = joined.into_iter().collect();
        for room in &left {
            self.detach_member(connection, room);
        }
        left.sort();
        left
    }

    fn detach_member(&mut self, connection: &ConnectionId, room: &RoomName) {
        if let Some(members) = self.rooms.get_mut(room) {
            members.remove(connection);
            if members.is_empty() {
                self.rooms.remove(room);
            }
        }
    }

    /// Current members of a room (empty if the room does not exist).
    pub fn members<'a>(&'a self, room: &RoomName) -> impl Iterator<Item = &'a ConnectionId> + 'a {
        self.rooms.get(room).into_iter().flatten()
    }

    /// Rooms a connection currently belongs to.
    pub fn rooms_of<'a>(
        &'a self,
        connection: &ConnectionId,
    ) -> impl Iterator<Item = &'a RoomName> + 'a {
        self.memberships.get(connection).into_iter().flatten()
    }

    pub fn is_member(&self, connection: &ConnectionId, room: &RoomName) -> bool {
        self.rooms
            .get(room)
            .is_some_and(|members| members.contains(connection))
    }

    pub fn is_registered(&self, connection: &ConnectionId) -> bool {
        self.memberships.contains_key(connection)
    }

    pub fn member_count(&self, room: &RoomName) -> usize {
        self.rooms.get(room).map_or(0, HashSet::len)
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    pub fn connection_count(&self) -> usize {
        self.memberships.len()
    }

    /// Drop every room and connection.
    pub fn clear(&mut self) {
        self.rooms.clear();
        self.memberships.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn conn(id: &str) -> ConnectionId {
        ConnectionId::new(id)
    }

    #[test]
    fn test_document_room_name() {
        let room = RoomName::document(&json!("protocol"), &json!("42"));
        assert_eq!(room.as_str(), "protocol-42");
    }

    #[test]
    fn test_numeric_document_id_matches_string_id() {
        let numeric = RoomName::document(&json!("protocol"), &json!(42));
        let text = RoomName::document(&json!("protocol"), &json!("42"));
        assert_eq!(numeric, text);
    }

    #[test]
    fn test_non_scalar_segments_use_json_text() {
        let room = RoomName::document(&Value::Null, &json!([1, 2]));
        assert_eq!(room.as_str(), "null-[1,2]");
    }

    #[test]
    fn test_receiver_channel_matches_connection_channel() {
        let id = conn("B");
        assert_eq!(RoomName::receiver(&json!("B")), RoomName::channel(&id));
    }

    #[test]
    fn test_random_connection_ids_are_unique() {
        assert_ne!(ConnectionId::random(), ConnectionId::random());
    }

    #[test]
    fn test_join_requires_registration() {
        let mut registry = RoomRegistry::new();
        let room = RoomName::new("protocol-1");

        assert!(!registry.join(&conn("A"), room.clone()));
        assert_eq!(registry.room_count(), 0);

        assert!(registry.register(&conn("A")));
        assert!(registry.join(&conn("A"), room.clone()));
        assert!(registry.is_member(&conn("A"), &room));
    }

    #[test]
    fn test_register_twice() {
        let mut registry = RoomRegistry::new();
        assert!(registry.register(&conn("A")));
        assert!(!registry.register(&conn("A")));
        assert_eq!(registry.connection_count(), 1);
    }

    #[test]
    fn test_join_is_idempotent() {
        let mut registry = RoomRegistry::new();
        let room = RoomName::new("protocol-42");
        registry.register(&conn("A"));

        assert!(registry.join(&conn("A"), room.clone()));
        assert!(!registry.join(&conn("A"), room.clone()));
        assert_eq!(registry.member_count(&room), 1);
        assert_eq!(registry.members(&room).count(), 1);
    }

    #[test]
    fn test_leave_drops_empty_room() {
        let mut registry = RoomRegistry::new();
        let room = RoomName::new("protocol-42");
        registry.register(&conn("A"));
        registry.register(&conn("B"));
        registry.join(&conn("A"), room.clone());
        registry.join(&conn("B"), room.clone());

        assert!(registry.leave(&conn("A"), &room));
        assert_eq!(registry.member_count(&room), 1);
        assert_eq!(registry.room_count(), 1);

        assert!(registry.leave(&conn("B"), &room));
        assert_eq!(registry.room_count(), 0);

        // Not a member any more.
        assert!(!registry.leave(&conn("B"), &room));
    }

    #[test]
    fn test_remove_connection_revokes_all_memberships() {
        let mut registry = RoomRegistry::new();
        let protocol = RoomName::new("protocol-1");
        let review = RoomName::new("review-7");
        registry.register(&conn("A"));
        registry.register(&conn("B"));
        registry.join(&conn("A"), protocol.clone());
        registry.join(&conn("A"), review.clone());
        registry.join(&conn("B"), review.clone());

        let left = registry.remove_connection(&conn("A"));
        assert_eq!(left, vec![protocol.clone(), review.clone()]);

        assert!(!registry.is_registered(&conn("A")));
        assert!(!registry.is_member(&conn("A"), &review));
        assert_eq!(registry.rooms_of(&conn("A")).count(), 0);
        // protocol-1 had only A and is gone; review-7 still has B.
        assert_eq!(registry.room_count(), 1);
        assert_eq!(registry.members(&review).collect::<Vec<_>>(), vec![&conn("B")]);
    }

    #[test]
    fn test_remove_unknown_connection() {
        let mut registry = RoomRegistry::new();
        assert!(registry.remove_connection(&conn("ghost")).is_empty());
    }

    #[test]
    fn test_members_of_missing_room() {
        let registry = RoomRegistry::new();
        assert_eq!(registry.members(&RoomName::new("nothing-0")).count(), 0);
    }

    #[test]
    fn test_clear() {
        let mut registry = RoomRegistry::new();
        registry.register(&conn("A"));
        registry.join(&conn("A"), RoomName::new("protocol-1"));
        registry.clear();

        assert_eq!(registry.room_count(), 0);
        assert_eq!(registry.connection_count(), 0);
    }
}
