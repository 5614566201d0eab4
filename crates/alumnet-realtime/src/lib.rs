//! # alumnet-realtime
//!
//! Connection lifecycle manager for the alumnet change-notification channel.
//!
//! A [`RealtimeManager`] owns exactly one control connection to the backend,
//! tracks its [`ConnectionState`], reconnects with bounded exponential backoff,
//! and falls back to a degraded (non-realtime) mode when the retry budget runs
//! out so that features never hang waiting for it. Features gate on
//! [`ReadinessGate`] and open named, reference-counted subscriptions through
//! the [`ChannelRegistry`].
//!
//! The wire is abstracted behind [`Transport`]; [`ws::WsTransport`] speaks the
//! backend's WebSocket channel protocol and [`testing::MockTransport`] is a
//! scriptable in-memory stand-in.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod events;
pub mod gate;
pub mod manager;
pub mod registry;
pub mod scheduler;
pub mod state;
mod status;
pub mod testing;
pub mod transport;
#[cfg(feature = "ws")]
pub mod ws;

pub use alumnet_proto::{ChangeKind, ChangeRecord, EventFilter, FilterSpec, RowFilter};
pub use config::{ClientConfig, ExhaustionPolicy, RealtimeConfig, WsConfig};
pub use error::{RealtimeError, TransportError};
pub use events::{LifecycleEvent, StateChanged, SubscriptionEvent};
pub use gate::{ReadinessGate, Readiness, ReadyPolicy};
pub use manager::{RealtimeManager, StateListener};
pub use registry::{ChannelRegistry, EventCallback, EventSink, SubscriptionHandle, SubscriptionId};
pub use scheduler::{Backoff, ReconnectionScheduler};
pub use state::{ConnectionState, ConnectionStatus};
pub use transport::{ControlLink, Transport, TransportSignal};
