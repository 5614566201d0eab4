//! The transport seam.
//!
//! A transport opens the single control connection, reports its lifecycle as
//! [`TransportSignal`]s, and multiplexes named subscriptions on top of it.
//! Everything above this trait is transport-agnostic.

use std::future::Future;

use alumnet_proto::FilterSpec;
use tokio::sync::mpsc;

use crate::error::TransportError;
use crate::registry::EventSink;

/// Asynchronous lifecycle signal from an open control connection. A
/// connection is live from the moment `open_control` returns it, so only its
/// loss is signalled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportSignal {
    /// The connection went away.
    Disconnected {
        /// Reason for disconnection.
        reason: String,
    },
    /// The connection failed; treated like a disconnect.
    Error(String),
}

/// An open control connection and its signal stream.
#[derive(Debug)]
pub struct ControlLink<C> {
    /// Transport-specific connection handle.
    pub connection: C,
    /// Lifecycle signals for this connection. A closed stream counts as a
    /// disconnect.
    pub signals: mpsc::Receiver<TransportSignal>,
}

/// Downward boundary of the realtime manager.
pub trait Transport: Send + Sync + 'static {
    /// Handle to an open control connection.
    type Connection: Clone + Send + Sync + 'static;
    /// Handle to an open named subscription.
    type Subscription: Send + Sync + 'static;

    /// Open the control connection.
    fn open_control(
        &self,
    ) -> impl Future<Output = Result<ControlLink<Self::Connection>, TransportError>> + Send;

    /// Open a named subscription on `connection`. Changes are delivered to
    /// `sink` until the subscription is closed.
    fn open_subscription(
        &self,
        connection: &Self::Connection,
        name: &str,
        filter: &FilterSpec,
        sink: EventSink,
    ) -> impl Future<Output = Result<Self::Subscription, TransportError>> + Send;

    /// Release a named subscription.
    fn close_subscription(&self, subscription: Self::Subscription) -> impl Future<Output = ()> + Send;

    /// Release the control connection.
    fn close_control(&self, connection: Self::Connection) -> impl Future<Output = ()> + Send;
}
