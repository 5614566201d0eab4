//! Readiness gating.
//!
//! Features ask the gate whether realtime delivery can be assumed instead of
//! reading connection internals. Waiting suspends on the state watch channel
//! and wakes on the same transition the status channel publishes.

use std::time::Duration;

use tokio::sync::watch;

use crate::config::RealtimeConfig;
use crate::error::RealtimeError;
use crate::state::{ConnectionState, ConnectionStatus};

/// How long to wait for readiness, and whether a timeout is acceptable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadyPolicy {
    /// Maximum wait.
    pub timeout: Duration,
    /// Proceed in fallback mode when the wait times out.
    pub allow_fallback: bool,
}

impl ReadyPolicy {
    /// Policy from the lifecycle config defaults.
    #[must_use]
    pub const fn from_config(config: &RealtimeConfig) -> Self {
        Self {
            timeout: config.ready_wait_timeout(),
            allow_fallback: config.allow_fallback,
        }
    }

    /// Wait up to `timeout`, failing on timeout.
    #[must_use]
    pub const fn strict(timeout: Duration) -> Self {
        Self {
            timeout,
            allow_fallback: false,
        }
    }

    /// Wait up to `timeout`, then proceed anyway.
    #[must_use]
    pub const fn with_fallback(timeout: Duration) -> Self {
        Self {
            timeout,
            allow_fallback: true,
        }
    }
}

/// Outcome of a policy-aware wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// The connection is `Connected` or `Degraded`.
    Ready,
    /// The wait timed out and the caller accepted fallback mode.
    Fallback,
}

/// Read-only view of the connection state.
#[derive(Debug, Clone)]
pub struct ReadinessGate {
    state: watch::Receiver<ConnectionState>,
}

impl ReadinessGate {
    pub(crate) const fn new(state: watch::Receiver<ConnectionState>) -> Self {
        Self { state }
    }

    /// True iff the status is `Connected` or `Degraded`.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.state.borrow().is_ready()
    }

    /// Current status.
    #[must_use]
    pub fn status(&self) -> ConnectionStatus {
        self.state.borrow().status
    }

    /// Copy of the full state.
    #[must_use]
    pub fn snapshot(&self) -> ConnectionState {
        self.state.borrow().clone()
    }

    /// Wait until ready or until `timeout` elapses.
    ///
    /// Returns `true` as soon as the gate is ready and `false` on timeout.
    /// Never returns `false` before `timeout` has elapsed unless the manager
    /// itself has gone away.
    pub async fn await_ready(&self, timeout: Duration) -> bool {
        if self.is_ready() {
            return true;
        }

        let mut state = self.state.clone();
        match tokio::time::timeout(timeout, state.wait_for(ConnectionState::is_ready))
            .await
            .map(|waited| waited.is_ok())
        {
            Ok(reached) => reached,
            Err(_elapsed) => false,
        }
    }

    /// Wait according to `policy`.
    ///
    /// # Errors
    ///
    /// Returns [`RealtimeError::NotReady`] when the wait times out and the
    /// policy does not allow fallback.
    pub async fn wait_ready(&self, policy: ReadyPolicy) -> Result<Readiness, RealtimeError> {
        if self.await_ready(policy.timeout).await {
            Ok(Readiness::Ready)
        } else if policy.allow_fallback {
            tracing::warn!(
                timeout_ms = policy.timeout.as_millis() as u64,
                status = %self.status(),
                "realtime not ready, proceeding in fallback mode"
            );
            Ok(Readiness::Fallback)
        } else {
            Err(RealtimeError::NotReady(policy.timeout))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::Instant;

    fn gate_with(status: ConnectionStatus) -> (watch::Sender<ConnectionState>, ReadinessGate) {
        let state = ConnectionState {
            status,
            ..ConnectionState::new()
        };
        let (tx, rx) = watch::channel(state);
        (tx, ReadinessGate::new(rx))
    }

    fn set_status(tx: &watch::Sender<ConnectionState>, status: ConnectionStatus) {
        tx.send_modify(|state| state.status = status);
    }

    #[test]
    fn test_is_ready_matches_status() {
        for status in [
            ConnectionStatus::Disconnected,
            ConnectionStatus::Connecting,
            ConnectionStatus::Connected,
            ConnectionStatus::Degraded,
        ] {
            let (_tx, gate) = gate_with(status);
            assert_eq!(gate.is_ready(), status.is_ready());
            assert_eq!(gate.status(), status);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_await_ready_returns_immediately_when_ready() {
        let (_tx, gate) = gate_with(ConnectionStatus::Degraded);
        let started = Instant::now();
        assert!(gate.await_ready(Duration::from_secs(5)).await);
        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_await_ready_times_out_exactly() {
        let (_tx, gate) = gate_with(ConnectionStatus::Connecting);
        let started = Instant::now();
        assert!(!gate.await_ready(Duration::from_millis(500)).await);
        assert_eq!(started.elapsed(), Duration::from_millis(500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_await_ready_wakes_on_transition() {
        let (tx, gate) = gate_with(ConnectionStatus::Connecting);

        let waiter = tokio::spawn({
            let gate = gate.clone();
            async move { gate.await_ready(Duration::from_secs(10)).await }
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        set_status(&tx, ConnectionStatus::Connected);

        assert!(waiter.await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_await_ready_is_woken_by_transition() {
        let (tx, gate) = gate_with(ConnectionStatus::Connecting);
        let mut waiter = tokio_test::task::spawn(gate.await_ready(Duration::from_secs(10)));

        tokio_test::assert_pending!(waiter.poll());
        assert!(!waiter.is_woken());

        set_status(&tx, ConnectionStatus::Degraded);
        assert!(waiter.is_woken());
        assert!(tokio_test::assert_ready!(waiter.poll()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_await_ready_ignores_non_ready_transitions() {
        let (tx, gate) = gate_with(ConnectionStatus::Disconnected);

        let waiter = tokio::spawn({
            let gate = gate.clone();
            async move { gate.await_ready(Duration::from_secs(1)).await }
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        set_status(&tx, ConnectionStatus::Connecting);

        assert!(!waiter.await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_ready_policies() {
        let (_tx, gate) = gate_with(ConnectionStatus::Connecting);

        let fallback = gate
            .wait_ready(ReadyPolicy::with_fallback(Duration::from_millis(100)))
            .await
            .unwrap();
        assert_eq!(fallback, Readiness::Fallback);

        let err = gate
            .wait_ready(ReadyPolicy::strict(Duration::from_millis(100)))
            .await
            .unwrap_err();
        assert!(matches!(err, RealtimeError::NotReady(d) if d == Duration::from_millis(100)));
    }

    #[tokio::test]
    async fn test_wait_ready_when_connected() {
        let (_tx, gate) = gate_with(ConnectionStatus::Connected);
        let readiness = gate
            .wait_ready(ReadyPolicy::strict(Duration::from_millis(10)))
            .await
            .unwrap();
        assert_eq!(readiness, Readiness::Ready);
    }

    #[test]
    fn test_policy_from_config() {
        let policy = ReadyPolicy::from_config(&RealtimeConfig::default());
        assert_eq!(policy.timeout, Duration::from_secs(15));
        assert!(policy.allow_fallback);
    }
}
