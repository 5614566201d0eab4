//! Realtime event types.

use std::time::Duration;

use alumnet_proto::ChangeRecord;
use chrono::{DateTime, Utc};

use crate::state::{ConnectionState, ConnectionStatus};

/// Published on every status transition, in transition order.
///
/// Carries the state as of that transition, so a listener never has to read
/// a newer snapshot to learn what happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateChanged {
    /// Status before the transition.
    pub previous: ConnectionStatus,
    /// Status after the transition.
    pub status: ConnectionStatus,
    /// Attempt count at the time of the transition.
    pub attempt_count: u32,
    /// Last recorded failure.
    pub last_error: Option<String>,
    /// When the transition happened.
    pub at: DateTime<Utc>,
}

impl StateChanged {
    pub(crate) fn new(previous: ConnectionStatus, state: &ConnectionState) -> Self {
        Self {
            previous,
            status: state.status,
            attempt_count: state.attempt_count,
            last_error: state.last_error.clone(),
            at: state.last_transition_at,
        }
    }

    /// Whether the new status is ready.
    #[must_use]
    pub const fn is_ready(&self) -> bool {
        self.status.is_ready()
    }
}

/// Coarser lifecycle notifications, mostly for logs and status displays.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// Control connection established.
    Connected,
    /// Control connection lost or failed to open.
    Disconnected {
        /// Reason for disconnection.
        reason: String,
    },
    /// A reconnection attempt was scheduled.
    Reconnecting {
        /// Attempt number.
        attempt: u32,
        /// Delay before the attempt.
        delay: Duration,
    },
    /// No further automatic attempts will be made.
    RetriesExhausted {
        /// Attempts made.
        attempts: u32,
        /// Last error seen.
        last_error: Option<String>,
    },
    /// Explicitly stopped.
    Stopped,
}

/// A change delivered to the listeners of a named subscription.
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionEvent {
    /// Subscription name.
    pub name: String,
    /// The change.
    pub record: ChangeRecord,
}
