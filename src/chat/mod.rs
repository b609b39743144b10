//! Live rooms: who is connected where, and how a stored message reaches them.

pub mod broadcast;
pub mod connection;
pub mod event;
pub mod hub;
pub mod registry;
pub mod session;

use std::fmt;

use uuid::Uuid;

pub use broadcast::{BroadcastReport, Broadcaster};
pub use connection::{ConnectionHandle, DeliveryFailure, DeliveryFailureReason, Outbox};
pub use event::{OutboundMessage, ServerEvent};
pub use hub::{ChatHub, Published};
pub use registry::ConnectionRegistry;
pub use session::{ChatSession, CloseReason, SessionState, SessionSummary};

pub type RoomId = Uuid;
pub type UserId = i64;

/// Process-unique id of one live connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}
