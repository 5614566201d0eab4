//! Connection state types.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::RealtimeError;

/// Status of the control connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    /// Not connected.
    Disconnected,
    /// Opening the control connection.
    Connecting,
    /// Control connection is live.
    Connected,
    /// Retry budget exhausted; features run without realtime delivery.
    Degraded,
}

impl ConnectionStatus {
    /// `Connected` and `Degraded` are the only ready states.
    #[must_use]
    pub const fn is_ready(self) -> bool {
        matches!(self, Self::Connected | Self::Degraded)
    }

    /// Whether moving from `self` to `next` is a legal transition.
    ///
    /// Any status may fall back to `Disconnected`: that covers transport loss
    /// and an explicit stop.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Disconnected, Self::Connecting)
                | (Self::Connecting, Self::Connected)
                | (Self::Disconnected, Self::Degraded)
                | (Self::Degraded, Self::Connecting)
                | (Self::Connecting | Self::Connected | Self::Degraded, Self::Disconnected)
        )
    }

    /// Lowercase name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Degraded => "degraded",
        }
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of connectivity. Only the status channel mutates it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionState {
    /// Current status.
    pub status: ConnectionStatus,
    /// Reconnection attempts since the last successful connection.
    pub attempt_count: u32,
    /// Most recent connectivity failure.
    pub last_error: Option<String>,
    /// When `status` last changed.
    pub last_transition_at: DateTime<Utc>,
    /// When the current connection was established.
    pub connected_since: Option<DateTime<Utc>>,
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionState {
    /// Fresh, disconnected state.
    #[must_use]
    pub fn new() -> Self {
        Self {
            status: ConnectionStatus::Disconnected,
            attempt_count: 0,
            last_error: None,
            last_transition_at: Utc::now(),
            connected_since: None,
        }
    }

    /// See [`ConnectionStatus::is_ready`].
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.status.is_ready()
    }

    /// Move to `next`.
    ///
    /// Returns the previous status when the status actually changed and
    /// `None` when `next` equals the current status.
    pub(crate) fn transition(
        &mut self,
        next: ConnectionStatus,
    ) -> Result<Option<ConnectionStatus>, RealtimeError> {
        let previous = self.status;
        if previous == next {
            return Ok(None);
        }
        if !previous.can_transition_to(next) {
            return Err(RealtimeError::InvalidTransition {
                from: previous,
                to: next,
            });
        }

        let now = Utc::now();
        self.status = next;
        self.last_transition_at = now;
        if next == ConnectionStatus::Connected {
            self.attempt_count = 0;
            self.last_error = None;
            self.connected_since = Some(now);
        } else {
            self.connected_since = None;
        }
        Ok(Some(previous))
    }

    /// Count one more reconnection attempt and return its number.
    pub(crate) fn begin_attempt(&mut self) -> u32 {
        debug_assert!(matches!(
            self.status,
            ConnectionStatus::Disconnected | ConnectionStatus::Connecting
        ));
        self.attempt_count = self.attempt_count.saturating_add(1);
        self.attempt_count
    }

    pub(crate) fn reset_attempts(&mut self) {
        self.attempt_count = 0;
    }

    pub(crate) fn record_error(&mut self, error: impl Into<String>) {
        self.last_error = Some(error.into());
    }
}
