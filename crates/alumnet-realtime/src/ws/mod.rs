//! WebSocket transport for the backend's realtime channel protocol.
//!
//! One socket carries every subscription: each named subscription joins its
//! own `realtime:<name>` topic, and a heartbeat on the `phoenix` topic keeps
//! the socket alive and detects dead peers.

mod driver;
mod heartbeat;
mod transport;

pub use heartbeat::{HeartbeatConfig, HeartbeatHandle};
pub use transport::{WsConnection, WsSubscription, WsTransport};
