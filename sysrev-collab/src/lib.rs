//! # sysrev-collab - real-time collaboration relay for sysrev
//!
//! Relays document changes and chat messages between the browsers of
//! reviewers working on the same protocol, screening task or report.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐     WebSocket      ┌──────────────┐
//! │ CollabClient │ ◄────────────────► │ CollabServer │
//! │ (per user)   │     JSON events    │ (central)    │
//! └──────────────┘                    └──────┬───────┘
//!                                            │ dispatch
//!                                     ┌──────┴───────┐
//!                                     │ Broadcaster  │
//!                                     │ RoomRegistry │
//!                                     └──────┬───────┘
//!                                            │ deliver
//!                                     ┌──────┴───────┐
//!                                     │  Transport   │
//!                                     │  (outboxes)  │
//!                                     └──────────────┘
//! ```
//!
//! Rooms are named `{documentType}-{documentId}`. Every connection is also
//! subscribed to a channel named by its connection id, used for chat. The
//! server validates nothing and stores nothing: a payload sent to an empty
//! room is gone.
//!
//! ## Modules
//!
//! - [`protocol`]: JSON event envelopes (`joinDocument`, `updateDocument`, ...)
//! - [`room`]: connection ids, room names, membership registry
//! - [`transport`]: per-connection delivery capability
//! - [`broadcast`]: the relay operations
//! - [`server`]: WebSocket server
//! - [`client`]: WebSocket client

pub mod broadcast;
pub mod client;
pub mod protocol;
pub mod room;
pub mod server;
pub mod transport;

// Re-exports for convenience
pub use broadcast::{BroadcastStats, Broadcaster};
pub use client::{ClientEvent, CollabClient};
pub use protocol::{ClientMessage, ProtocolError, ServerMessage};
pub use room::{ConnectionId, RoomName, RoomRegistry};
pub use server::{CollabServer, ConfigError, ServerConfig, ServerError, ServerStats};
pub use transport::{DeliveryError, Frame, MemoryTransport, OutboxTransport, Transport};
