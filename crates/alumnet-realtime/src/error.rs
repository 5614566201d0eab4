//! Error types for alumnet-realtime.
//!
//! Only caller-specific failures are surfaced as errors. Connectivity problems
//! are absorbed by the status channel and show up as [`ConnectionState`]
//! transitions instead.
//!
//! [`ConnectionState`]: crate::state::ConnectionState

use std::time::Duration;

use alumnet_proto::ProtoError;
use thiserror::Error;

use crate::state::ConnectionStatus;

/// Failures reported by a [`Transport`](crate::transport::Transport).
#[derive(Debug, Error)]
pub enum TransportError {
    /// The control connection could not be established.
    #[error("connection failed: {0}")]
    Connect(String),

    /// The endpoint configuration is unusable.
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),

    /// The backend refused a subscription (bad filter, permission denied).
    #[error("subscription to {topic} rejected: {reason}")]
    Rejected {
        /// Topic that was refused.
        topic: String,
        /// Reason given by the backend.
        reason: String,
    },

    /// The backend did not answer in time.
    #[error("timed out waiting for {0}")]
    Timeout(String),

    /// The connection closed underneath the request.
    #[error("connection closed")]
    Closed,

    /// Malformed frame.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtoError),
}

impl TransportError {
    /// Whether the failure is about connectivity rather than the request.
    /// Transient failures are retried on the next connection instead of
    /// being reported to the caller.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Connect(_) | Self::Timeout(_) | Self::Closed)
    }
}

/// Errors surfaced to callers of the realtime manager.
#[derive(Debug, Error)]
pub enum RealtimeError {
    /// Readiness was not reached in time and the caller did not accept the
    /// fallback mode.
    #[error("realtime channel not ready after {}ms", .0.as_millis())]
    NotReady(Duration),

    /// Opening a named subscription failed.
    #[error("failed to subscribe to '{name}': {source}")]
    Subscribe {
        /// Subscription name.
        name: String,
        /// Underlying transport failure.
        #[source]
        source: TransportError,
    },

    /// A subscription name is already registered with a different filter.
    #[error("subscription '{0}' is already registered with a different filter")]
    FilterMismatch(String),

    /// The filter failed validation.
    #[error("invalid filter: {0}")]
    InvalidFilter(#[from] ProtoError),

    /// Illegal connection status change.
    #[error("invalid state transition: {from} -> {to}")]
    InvalidTransition {
        /// Current status.
        from: ConnectionStatus,
        /// Requested status.
        to: ConnectionStatus,
    },

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// The manager's supervisor is no longer running.
    #[error("realtime manager stopped")]
    Stopped,

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}
