//! Reconnection scheduling with bounded exponential backoff.

use std::time::Duration;

use tokio::time::{Instant, sleep_until};

use crate::config::{ExhaustionPolicy, RealtimeConfig};
use crate::state::ConnectionState;

/// Exponential backoff: `min(base * 2^(n-1), cap)` for attempt `n`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    /// Delay before the first attempt.
    pub base: Duration,
    /// Upper bound for any delay.
    pub cap: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(60),
        }
    }
}

impl Backoff {
    /// Backoff from the lifecycle config.
    #[must_use]
    pub const fn from_config(config: &RealtimeConfig) -> Self {
        Self {
            base: config.base_backoff(),
            cap: config.backoff_cap(),
        }
    }

    /// Delay before attempt `attempt` (1-indexed; 0 is treated as 1).
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base_ms = u64::try_from(self.base.as_millis()).unwrap_or(u64::MAX);
        let cap_ms = u64::try_from(self.cap.as_millis()).unwrap_or(u64::MAX);
        let factor = 1u64
            .checked_shl(attempt.saturating_sub(1))
            .unwrap_or(u64::MAX);
        Duration::from_millis(base_ms.saturating_mul(factor).min(cap_ms))
    }

    /// Delays for attempts `1..=max_attempts`.
    #[must_use]
    pub fn schedule(&self, max_attempts: u32) -> Vec<Duration> {
        (1..=max_attempts)
            .map(|attempt| self.delay_for_attempt(attempt))
            .collect()
    }
}

/// A reconnection attempt waiting for its timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingAttempt {
    /// Attempt number.
    pub attempt: u32,
    /// Delay it was scheduled with.
    pub delay: Duration,
    /// When it fires.
    pub deadline: Instant,
}

/// Result of reacting to a disconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleOutcome {
    /// A new attempt is pending.
    Scheduled(PendingAttempt),
    /// An attempt was already pending; nothing new was scheduled.
    AlreadyPending,
    /// The attempt budget is spent.
    Exhausted(ExhaustionPolicy),
}

/// Owns the single reconnection timer.
///
/// The pending attempt is an `Option` that must be empty before a new one is
/// scheduled, so there is never more than one outstanding timer.
#[derive(Debug)]
pub struct ReconnectionScheduler {
    backoff: Backoff,
    max_attempts: u32,
    policy: ExhaustionPolicy,
    pending: Option<PendingAttempt>,
}

impl ReconnectionScheduler {
    /// Scheduler for the given config.
    #[must_use]
    pub fn new(config: &RealtimeConfig) -> Self {
        Self {
            backoff: Backoff::from_config(config),
            max_attempts: config.max_attempts,
            policy: config.on_exhaustion,
            pending: None,
        }
    }

    /// Backoff in use.
    #[must_use]
    pub const fn backoff(&self) -> Backoff {
        self.backoff
    }

    /// Attempt budget.
    #[must_use]
    pub const fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// The outstanding attempt, if any.
    #[must_use]
    pub const fn pending(&self) -> Option<&PendingAttempt> {
        self.pending.as_ref()
    }

    /// React to the connection entering `Disconnected`.
    ///
    /// Counts the attempt in `state` when one is scheduled.
    pub fn on_disconnected(&mut self, state: &mut ConnectionState) -> ScheduleOutcome {
        if self.pending.is_some() {
            return ScheduleOutcome::AlreadyPending;
        }
        if state.attempt_count >= self.max_attempts {
            return ScheduleOutcome::Exhausted(self.policy);
        }

        let attempt = state.begin_attempt();
        let delay = self.backoff.delay_for_attempt(attempt);
        let pending = PendingAttempt {
            attempt,
            delay,
            deadline: Instant::now() + delay,
        };
        self.pending = Some(pending);
        ScheduleOutcome::Scheduled(pending)
    }

    /// Drop the outstanding attempt.
    pub fn cancel(&mut self) -> Option<PendingAttempt> {
        self.pending.take()
    }

    /// Take the outstanding attempt if its deadline has passed.
    pub fn take_due(&mut self) -> Option<PendingAttempt> {
        match self.pending {
            Some(pending) if pending.deadline <= Instant::now() => self.pending.take(),
            _ => None,
        }
    }

    /// Resolve when the outstanding attempt is due; never resolves when
    /// nothing is pending.
    pub async fn wait(&self) {
        match self.pending {
            Some(pending) => sleep_until(pending.deadline).await,
            None => std::future::pending().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn secs(list: &[u64]) -> Vec<Duration> {
        list.iter().map(|s| Duration::from_secs(*s)).collect()
    }

    #[test]
    fn test_default_backoff_sequence() {
        let backoff = Backoff::default();
        assert_eq!(backoff.schedule(8), secs(&[1, 2, 4, 8, 16, 32, 60, 60]));
    }

    #[test]
    fn test_delay_with_zero_attempt() {
        assert_eq!(Backoff::default().delay_for_attempt(0), Duration::from_secs(1));
    }

    #[test]
    fn test_delay_does_not_overflow() {
        let backoff = Backoff::default();
        assert_eq!(backoff.delay_for_attempt(64), Duration::from_secs(60));
        assert_eq!(backoff.delay_for_attempt(u32::MAX), Duration::from_secs(60));
    }

    #[test]
    fn test_backoff_from_config() {
        let config = RealtimeConfig {
            base_backoff_ms: 100,
            backoff_cap_ms: 1_000,
            ..Default::default()
        };
        let backoff = Backoff::from_config(&config);
        assert_eq!(backoff.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(backoff.delay_for_attempt(3), Duration::from_millis(400));
        assert_eq!(backoff.delay_for_attempt(5), Duration::from_millis(1_000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_schedules_until_exhausted() {
        let mut scheduler = ReconnectionScheduler::new(&RealtimeConfig::default());
        let mut state = ConnectionState::new();
        let mut delays = Vec::new();

        loop {
            match scheduler.on_disconnected(&mut state) {
                ScheduleOutcome::Scheduled(pending) => {
                    delays.push(pending.delay);
                    scheduler.cancel();
                }
                ScheduleOutcome::Exhausted(policy) => {
                    assert_eq!(policy, ExhaustionPolicy::Degrade);
                    break;
                }
                ScheduleOutcome::AlreadyPending => panic!("nothing should be pending"),
            }
        }

        assert_eq!(delays, secs(&[1, 2, 4, 8, 16, 32, 60, 60]));
        assert_eq!(state.attempt_count, 8);
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_pending_timer() {
        let mut scheduler = ReconnectionScheduler::new(&RealtimeConfig::default());
        let mut state = ConnectionState::new();

        assert!(matches!(
            scheduler.on_disconnected(&mut state),
            ScheduleOutcome::Scheduled(PendingAttempt { attempt: 1, .. })
        ));
        assert_eq!(
            scheduler.on_disconnected(&mut state),
            ScheduleOutcome::AlreadyPending
        );
        assert_eq!(state.attempt_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_take_due_respects_deadline() {
        let mut scheduler = ReconnectionScheduler::new(&RealtimeConfig::default());
        let mut state = ConnectionState::new();
        scheduler.on_disconnected(&mut state);

        assert!(scheduler.take_due().is_none());

        tokio::time::advance(Duration::from_millis(999)).await;
        assert!(scheduler.take_due().is_none());

        tokio::time::advance(Duration::from_millis(1)).await;
        let due = scheduler.take_due().unwrap();
        assert_eq!(due.attempt, 1);
        assert!(scheduler.pending().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_resolves_at_deadline() {
        let mut scheduler = ReconnectionScheduler::new(&RealtimeConfig::default());
        let mut state = ConnectionState::new();
        scheduler.on_disconnected(&mut state);

        let started = Instant::now();
        scheduler.wait().await;
        assert_eq!(started.elapsed(), Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_without_pending_never_resolves() {
        let scheduler = ReconnectionScheduler::new(&RealtimeConfig::default());
        let waited = tokio::time::timeout(Duration::from_secs(3600), scheduler.wait()).await;
        assert!(waited.is_err());
    }

    #[test]
    fn test_stay_disconnected_policy() {
        let config = RealtimeConfig {
            max_attempts: 1,
            on_exhaustion: ExhaustionPolicy::StayDisconnected,
            ..Default::default()
        };
        let mut scheduler = ReconnectionScheduler::new(&config);
        let mut state = ConnectionState::new();
        state.attempt_count = 1;

        assert_eq!(
            scheduler.on_disconnected(&mut state),
            ScheduleOutcome::Exhausted(ExhaustionPolicy::StayDisconnected)
        );
    }

    proptest! {
        #[test]
        fn prop_delay_is_capped_and_monotonic(
            base_ms in 1u64..5_000,
            cap_factor in 1u64..100,
            attempt in 1u32..200,
        ) {
            let backoff = Backoff {
                base: Duration::from_millis(base_ms),
                cap: Duration::from_millis(base_ms * cap_factor),
            };
            let delay = backoff.delay_for_attempt(attempt);
            prop_assert!(delay <= backoff.cap);
            prop_assert!(delay >= backoff.base);
            prop_assert!(backoff.delay_for_attempt(attempt + 1) >= delay);
        }
    }
}
