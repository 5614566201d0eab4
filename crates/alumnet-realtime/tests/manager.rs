//! Connection lifecycle integration tests.
//!
//! Drives a `RealtimeManager` over the in-memory `MockTransport` with paused
//! time, so backoff delays are observed exactly.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use alumnet_realtime::testing::{ControlOutcome, MockTransport};
use alumnet_realtime::{
    ChangeKind, ChangeRecord, ConnectionStatus, ExhaustionPolicy, FilterSpec, LifecycleEvent,
    ReadyPolicy, RealtimeConfig, RealtimeError, RealtimeManager, RowFilter, StateChanged,
    StateListener, SubscriptionEvent,
};
use serde_json::json;
use tokio::sync::broadcast;
use tokio::time::Instant;

// ============================================================================
// Helpers
// ============================================================================

fn manager(transport: &MockTransport) -> RealtimeManager<MockTransport> {
    RealtimeManager::new(transport.clone(), RealtimeConfig::default()).unwrap()
}

fn manager_with(
    transport: &MockTransport,
    config: RealtimeConfig,
) -> RealtimeManager<MockTransport> {
    RealtimeManager::new(transport.clone(), config).unwrap()
}

async fn wait_for(listener: &mut StateListener, status: ConnectionStatus) -> StateChanged {
    loop {
        let event = listener.recv().await.unwrap();
        if event.status == status {
            return event;
        }
    }
}

async fn next_lifecycle(events: &mut broadcast::Receiver<LifecycleEvent>) -> LifecycleEvent {
    events.recv().await.unwrap()
}

/// Let the supervisor drain its queue. Paused time only advances once every
/// task is idle.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}

fn counter() -> (Arc<AtomicUsize>, impl Fn(&SubscriptionEvent) + Send + Sync + 'static) {
    let count = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&count);
    (count, move |_event: &SubscriptionEvent| {
        seen.fetch_add(1, Ordering::SeqCst);
    })
}

fn assert_near(actual: Duration, expected: Duration) {
    assert!(
        actual >= expected && actual < expected + Duration::from_millis(5),
        "expected ~{expected:?}, got {actual:?}"
    );
}

fn insert(table: &str) -> ChangeRecord {
    ChangeRecord::new(ChangeKind::Insert, "public", table, json!({"id": 1}))
}

// ============================================================================
// Scenarios
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_connects_and_becomes_ready() {
    let transport = MockTransport::new();
    transport.set_connect_delay(Duration::from_millis(30));
    let manager = manager(&transport);
    let mut listener = manager.on_state_changed();

    let started = Instant::now();
    manager.start().unwrap();
    wait_for(&mut listener, ConnectionStatus::Connecting).await;
    assert!(!manager.is_ready());

    assert!(manager.await_ready(Duration::from_millis(50)).await);
    assert!(started.elapsed() >= Duration::from_millis(30));
    assert!(started.elapsed() < Duration::from_millis(50));
    assert!(manager.is_ready());
    assert_eq!(manager.state().attempt_count, 0);
    assert!(manager.state().connected_since.is_some());
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_delays_after_disconnect() {
    let transport = MockTransport::new();
    transport.script([ControlOutcome::Connect]);
    transport.set_default(ControlOutcome::Fail("connection refused".to_string()));
    let manager = manager(&transport);
    let mut listener = manager.on_state_changed();

    manager.start().unwrap();
    wait_for(&mut listener, ConnectionStatus::Connected).await;

    assert!(transport.drop_connection("network lost"));
    wait_for(&mut listener, ConnectionStatus::Disconnected).await;
    let disconnected_at = Instant::now();

    wait_for(&mut listener, ConnectionStatus::Connecting).await;
    assert_near(disconnected_at.elapsed(), Duration::from_secs(1));

    wait_for(&mut listener, ConnectionStatus::Disconnected).await;
    let event = wait_for(&mut listener, ConnectionStatus::Connecting).await;
    assert_near(disconnected_at.elapsed(), Duration::from_secs(3));
    assert_eq!(event.attempt_count, 2);
    assert_eq!(transport.control_opens(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_degrades_after_eight_failed_attempts() {
    let transport = MockTransport::failing("connection refused");
    let manager = manager(&transport);
    let mut listener = manager.on_state_changed();

    manager.start().unwrap();
    let event = wait_for(&mut listener, ConnectionStatus::Degraded).await;

    assert_eq!(event.attempt_count, 8);
    assert_eq!(event.last_error.as_deref(), Some("connection failed: connection refused"));
    assert!(manager.is_ready());
    assert_eq!(transport.control_opens(), 9);

    tokio::time::sleep(Duration::from_secs(600)).await;
    assert_eq!(transport.control_opens(), 9);
    assert_eq!(manager.status(), ConnectionStatus::Degraded);
}

#[tokio::test(start_paused = true)]
async fn test_shared_subscription_lifecycle() {
    let transport = MockTransport::new();
    let manager = manager(&transport);
    manager.start().unwrap();
    assert!(manager.await_ready(Duration::from_secs(1)).await);

    let filter = FilterSpec::table("notifications").with_row_filter(RowFilter::eq("user_id", 42).unwrap());
    let (first_count, first_cb) = counter();
    let (second_count, second_cb) = counter();

    let first = manager
        .subscribe("notifications", filter.clone(), first_cb)
        .await
        .unwrap();
    let second = manager
        .subscribe("notifications", filter, second_cb)
        .await
        .unwrap();

    let registry = manager.registry();
    assert_eq!(registry.len().await, 1);
    assert_eq!(registry.subscriber_count("notifications").await, 2);
    assert_eq!(transport.subscription_opens("notifications"), 1);

    assert_eq!(transport.emit("notifications", insert("notifications")), 2);
    assert_eq!(first_count.load(Ordering::SeqCst), 1);
    assert_eq!(second_count.load(Ordering::SeqCst), 1);

    assert!(manager.unsubscribe(&first).await);
    assert_eq!(registry.subscriber_count("notifications").await, 1);
    assert!(registry.is_open("notifications").await);
    assert_eq!(transport.subscription_closes("notifications"), 0);

    assert!(manager.unsubscribe(&second).await);
    assert!(registry.is_empty().await);
    assert_eq!(transport.subscription_closes("notifications"), 1);
    assert_eq!(transport.active_subscriptions("notifications"), 0);
}

#[tokio::test(start_paused = true)]
async fn test_stop_while_degraded() {
    let transport = MockTransport::failing("connection refused");
    let config = RealtimeConfig {
        max_attempts: 2,
        ..Default::default()
    };
    let manager = manager_with(&transport, config);
    let mut listener = manager.on_state_changed();

    manager.start().unwrap();
    wait_for(&mut listener, ConnectionStatus::Degraded).await;

    let (_count, callback) = counter();
    let _jobs = manager
        .subscribe("jobs-table", FilterSpec::table("jobs"), callback)
        .await
        .unwrap();
    assert_eq!(manager.registry().len().await, 1);
    assert!(!manager.registry().is_open("jobs-table").await);

    let mut lifecycle = manager.lifecycle_events();
    manager.stop().await.unwrap();

    assert_eq!(manager.status(), ConnectionStatus::Disconnected);
    assert!(!manager.is_ready());
    assert!(manager.registry().is_empty().await);
    assert_eq!(next_lifecycle(&mut lifecycle).await, LifecycleEvent::Stopped);

    let opens = transport.control_opens();
    tokio::time::sleep(Duration::from_secs(600)).await;
    assert_eq!(transport.control_opens(), opens);
}

// ============================================================================
// Properties
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_single_control_connection() {
    let transport = MockTransport::new();
    transport.set_connect_delay(Duration::from_millis(20));
    let manager = manager(&transport);

    for _ in 0..5 {
        manager.start().unwrap();
    }
    assert!(manager.await_ready(Duration::from_secs(1)).await);
    for _ in 0..3 {
        manager.start().unwrap();
    }
    settle().await;

    assert_eq!(transport.control_opens(), 1);
    assert_eq!(transport.active_controls(), 1);
    assert_eq!(transport.max_active_controls(), 1);

    let mut listener = manager.on_state_changed();
    transport.drop_connection("network lost");
    wait_for(&mut listener, ConnectionStatus::Disconnected).await;
    manager.start().unwrap();
    wait_for(&mut listener, ConnectionStatus::Connected).await;

    assert_eq!(transport.control_opens(), 2);
    assert_eq!(transport.max_active_controls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_backoff_sequence_then_degraded() {
    let transport = MockTransport::failing("connection refused");
    let manager = manager(&transport);
    let mut lifecycle = manager.lifecycle_events();

    manager.start().unwrap();

    let mut delays = Vec::new();
    let exhausted = loop {
        match next_lifecycle(&mut lifecycle).await {
            LifecycleEvent::Reconnecting { attempt, delay } => {
                assert_eq!(attempt as usize, delays.len() + 1);
                delays.push(delay.as_secs());
            }
            LifecycleEvent::RetriesExhausted { attempts, .. } => break attempts,
            LifecycleEvent::Disconnected { .. } => {}
            other => panic!("unexpected lifecycle event: {other:?}"),
        }
    };

    assert_eq!(delays, vec![1, 2, 4, 8, 16, 32, 60, 60]);
    assert_eq!(exhausted, 8);
    assert_eq!(manager.status(), ConnectionStatus::Degraded);
}

#[tokio::test(start_paused = true)]
async fn test_success_resets_attempts_and_cancels_timer() {
    let transport = MockTransport::new();
    transport.fail_next(3, "connection refused");
    let manager = manager(&transport);
    let mut listener = manager.on_state_changed();

    manager.start().unwrap();
    let connecting = loop {
        let event = wait_for(&mut listener, ConnectionStatus::Connecting).await;
        if event.attempt_count == 3 {
            break event;
        }
    };
    assert_eq!(connecting.last_error.as_deref(), Some("connection failed: connection refused"));

    let connected = wait_for(&mut listener, ConnectionStatus::Connected).await;
    assert_eq!(connected.attempt_count, 0);
    assert_eq!(connected.last_error, None);
    assert_eq!(manager.state().attempt_count, 0);

    tokio::time::sleep(Duration::from_secs(300)).await;
    assert_eq!(transport.control_opens(), 4);
    assert_eq!(manager.status(), ConnectionStatus::Connected);
}

#[tokio::test(start_paused = true)]
async fn test_readiness_matches_status() {
    let transport = MockTransport::new();
    transport.script([ControlOutcome::Connect]);
    transport.set_default(ControlOutcome::Fail("connection refused".to_string()));
    let config = RealtimeConfig {
        max_attempts: 2,
        ..Default::default()
    };
    let manager = manager_with(&transport, config);
    let mut listener = manager.on_state_changed();
    assert!(!manager.is_ready());

    manager.start().unwrap();
    wait_for(&mut listener, ConnectionStatus::Connected).await;
    transport.drop_connection("network lost");

    let mut seen = Vec::new();
    loop {
        let event = listener.recv().await.unwrap();
        assert_eq!(
            event.is_ready(),
            matches!(event.status, ConnectionStatus::Connected | ConnectionStatus::Degraded)
        );
        seen.push(event.status);
        if event.status == ConnectionStatus::Degraded {
            break;
        }
    }

    assert!(seen.contains(&ConnectionStatus::Disconnected));
    assert!(seen.contains(&ConnectionStatus::Connecting));
    let state = manager.state();
    assert_eq!(manager.is_ready(), state.status.is_ready());
    assert!(manager.is_ready());
}

#[tokio::test(start_paused = true)]
async fn test_resubscribes_after_reconnect() {
    let transport = MockTransport::new();
    let manager = manager(&transport);
    let mut listener = manager.on_state_changed();
    manager.start().unwrap();
    wait_for(&mut listener, ConnectionStatus::Connected).await;

    let (jobs_count, jobs_cb) = counter();
    let (_notes_count, notes_cb) = counter();
    let _jobs = manager
        .subscribe("jobs-table", FilterSpec::table("jobs"), jobs_cb)
        .await
        .unwrap();
    let _notes = manager
        .subscribe("notifications", FilterSpec::table("notifications"), notes_cb)
        .await
        .unwrap();
    let first_generation = transport.current_generation();
    assert_eq!(transport.subscription_opens_on(first_generation), 2);

    transport.drop_connection("network lost");
    wait_for(&mut listener, ConnectionStatus::Disconnected).await;
    assert_eq!(transport.active_subscriptions("jobs-table"), 0);

    wait_for(&mut listener, ConnectionStatus::Connected).await;
    settle().await;
    let second_generation = transport.current_generation();
    assert_ne!(first_generation, second_generation);
    assert_eq!(transport.subscription_opens_on(second_generation), 2);
    assert_eq!(transport.active_subscriptions("jobs-table"), 1);
    assert_eq!(transport.active_subscriptions("notifications"), 1);

    assert_eq!(transport.emit("jobs-table", insert("jobs")), 1);
    assert_eq!(jobs_count.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_await_ready_timeout_is_honest() {
    let transport = MockTransport::new();
    transport.set_default(ControlOutcome::Hang);
    let manager = manager(&transport);
    let mut listener = manager.on_state_changed();

    manager.start().unwrap();
    wait_for(&mut listener, ConnectionStatus::Connecting).await;

    let started = Instant::now();
    assert!(!manager.await_ready(Duration::from_millis(500)).await);
    assert_near(started.elapsed(), Duration::from_millis(500));
    assert_eq!(manager.status(), ConnectionStatus::Connecting);
}

// ============================================================================
// Lifecycle edges
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_stay_disconnected_policy() {
    let transport = MockTransport::failing("connection refused");
    let config = RealtimeConfig {
        max_attempts: 2,
        on_exhaustion: ExhaustionPolicy::StayDisconnected,
        ..Default::default()
    };
    let manager = manager_with(&transport, config);
    let mut lifecycle = manager.lifecycle_events();

    manager.start().unwrap();
    let attempts = loop {
        if let LifecycleEvent::RetriesExhausted { attempts, last_error } =
            next_lifecycle(&mut lifecycle).await
        {
            assert!(last_error.is_some());
            break attempts;
        }
    };

    assert_eq!(attempts, 2);
    assert_eq!(manager.status(), ConnectionStatus::Disconnected);
    assert!(!manager.is_ready());
    assert!(!manager.await_ready(Duration::from_secs(5)).await);

    transport.set_default(ControlOutcome::Connect);
    manager.start().unwrap();
    assert!(manager.await_ready(Duration::from_secs(1)).await);
    assert_eq!(manager.status(), ConnectionStatus::Connected);
}

#[tokio::test(start_paused = true)]
async fn test_start_from_degraded_retries() {
    let transport = MockTransport::failing("connection refused");
    let config = RealtimeConfig {
        max_attempts: 1,
        ..Default::default()
    };
    let manager = manager_with(&transport, config);
    let mut listener = manager.on_state_changed();

    manager.start().unwrap();
    let degraded = wait_for(&mut listener, ConnectionStatus::Degraded).await;
    assert_eq!(degraded.attempt_count, 1);

    transport.set_default(ControlOutcome::Connect);
    manager.start().unwrap();
    let connecting = listener.recv().await.unwrap();
    assert_eq!(connecting.previous, ConnectionStatus::Degraded);
    assert_eq!(connecting.status, ConnectionStatus::Connecting);
    assert_eq!(connecting.attempt_count, 0);

    wait_for(&mut listener, ConnectionStatus::Connected).await;
    assert_eq!(manager.state().attempt_count, 0);
}

#[tokio::test(start_paused = true)]
async fn test_stop_cancels_inflight_open() {
    let transport = MockTransport::new();
    transport.set_default(ControlOutcome::Hang);
    let manager = manager(&transport);
    let mut listener = manager.on_state_changed();

    manager.start().unwrap();
    wait_for(&mut listener, ConnectionStatus::Connecting).await;
    manager.stop().await.unwrap();

    assert_eq!(manager.status(), ConnectionStatus::Disconnected);
    assert_eq!(transport.active_controls(), 0);

    transport.set_default(ControlOutcome::Connect);
    manager.start().unwrap();
    assert!(manager.await_ready(Duration::from_secs(1)).await);
    assert_eq!(transport.control_opens(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_stop_cancels_pending_timer() {
    let transport = MockTransport::failing("connection refused");
    let manager = manager(&transport);
    let mut lifecycle = manager.lifecycle_events();

    manager.start().unwrap();
    loop {
        if let LifecycleEvent::Reconnecting { .. } = next_lifecycle(&mut lifecycle).await {
            break;
        }
    }
    manager.stop().await.unwrap();

    tokio::time::sleep(Duration::from_secs(600)).await;
    assert_eq!(transport.control_opens(), 1);
    assert_eq!(manager.state().attempt_count, 0);
}

#[tokio::test(start_paused = true)]
async fn test_transitions_are_ordered() {
    let transport = MockTransport::new();
    transport.fail_next(1, "connection refused");
    let manager = manager(&transport);
    let mut listener = manager.on_state_changed();

    manager.start().unwrap();
    let mut statuses = Vec::new();
    while statuses.last() != Some(&ConnectionStatus::Connected) {
        let event = listener.recv().await.unwrap();
        if let Some(last) = statuses.last() {
            assert_eq!(event.previous, *last);
        }
        statuses.push(event.status);
    }

    assert_eq!(
        statuses,
        vec![
            ConnectionStatus::Connecting,
            ConnectionStatus::Disconnected,
            ConnectionStatus::Connecting,
            ConnectionStatus::Connected,
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_strict_subscribe_fails_when_not_ready() {
    let transport = MockTransport::new();
    transport.set_default(ControlOutcome::Hang);
    let manager = manager(&transport);
    manager.start().unwrap();

    let (_count, callback) = counter();
    let err = manager
        .subscribe_with(
            "jobs-table",
            FilterSpec::table("jobs"),
            callback,
            ReadyPolicy::strict(Duration::from_millis(200)),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, RealtimeError::NotReady(timeout) if timeout == Duration::from_millis(200)));
    assert!(manager.registry().is_empty().await);
}

#[tokio::test(start_paused = true)]
async fn test_fallback_subscription_opens_once_connected() {
    let transport = MockTransport::new();
    transport.fail_next(1, "connection refused");
    let manager = manager(&transport);
    let mut listener = manager.on_state_changed();
    manager.start().unwrap();
    wait_for(&mut listener, ConnectionStatus::Disconnected).await;

    let (count, callback) = counter();
    let handle = manager
        .subscribe_with(
            "messages",
            FilterSpec::table("messages"),
            callback,
            ReadyPolicy::with_fallback(Duration::from_millis(100)),
        )
        .await
        .unwrap();
    assert!(handle.is_active());
    assert!(!manager.registry().is_open("messages").await);

    wait_for(&mut listener, ConnectionStatus::Connected).await;
    settle().await;
    assert!(manager.registry().is_open("messages").await);
    assert_eq!(transport.emit("messages", insert("messages")), 1);
    assert_eq!(count.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_rejected_subscription_does_not_affect_connection() {
    let transport = MockTransport::new();
    transport.reject_subscription("admin-audit");
    let manager = manager(&transport);
    manager.start().unwrap();
    assert!(manager.await_ready(Duration::from_secs(1)).await);

    let (_count, callback) = counter();
    let err = manager
        .subscribe("admin-audit", FilterSpec::table("audit_log"), callback)
        .await
        .unwrap_err();

    assert!(matches!(err, RealtimeError::Subscribe { .. }));
    assert_eq!(manager.status(), ConnectionStatus::Connected);
    assert!(manager.registry().is_empty().await);
}

#[tokio::test(start_paused = true)]
async fn test_slow_join_does_not_stall_connection_state() {
    let transport = MockTransport::new();
    let manager = Arc::new(manager(&transport));
    let mut listener = manager.on_state_changed();
    manager.start().unwrap();
    wait_for(&mut listener, ConnectionStatus::Connected).await;
    transport.set_subscription_delay(Duration::from_secs(10));

    let subscribing = {
        let manager = Arc::clone(&manager);
        tokio::spawn(async move {
            let (_count, callback) = counter();
            manager
                .subscribe("jobs-table", FilterSpec::table("jobs"), callback)
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert!(transport.drop_connection("network lost"));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(manager.status(), ConnectionStatus::Disconnected);
    assert!(!manager.is_ready());

    let started = Instant::now();
    manager.stop().await.unwrap();
    assert!(started.elapsed() < Duration::from_millis(5));
    assert!(manager.registry().is_empty().await);

    let err = subscribing.await.unwrap().unwrap_err();
    assert!(matches!(err, RealtimeError::Stopped));
    assert_eq!(transport.active_subscriptions("jobs-table"), 0);
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_reopens_despite_slow_join() {
    let transport = MockTransport::new();
    let manager = manager(&transport);
    let mut listener = manager.on_state_changed();
    manager.start().unwrap();
    wait_for(&mut listener, ConnectionStatus::Connected).await;

    let (count, callback) = counter();
    let _jobs = manager
        .subscribe("jobs-table", FilterSpec::table("jobs"), callback)
        .await
        .unwrap();
    transport.set_subscription_delay(Duration::from_secs(5));

    transport.drop_connection("network lost");
    wait_for(&mut listener, ConnectionStatus::Disconnected).await;
    wait_for(&mut listener, ConnectionStatus::Connected).await;
    settle().await;
    assert!(manager.is_ready());
    assert!(!manager.registry().is_open("jobs-table").await);

    // The connection keeps reacting to transport loss mid-join.
    assert!(transport.drop_connection("network lost again"));
    wait_for(&mut listener, ConnectionStatus::Disconnected).await;

    transport.set_subscription_delay(Duration::ZERO);
    wait_for(&mut listener, ConnectionStatus::Connected).await;
    tokio::time::sleep(Duration::from_secs(6)).await;
    assert!(manager.registry().is_open("jobs-table").await);
    assert_eq!(transport.active_subscriptions("jobs-table"), 1);
    assert_eq!(transport.emit("jobs-table", insert("jobs")), 1);
    assert_eq!(count.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_dropping_manager_closes_connection() {
    let transport = MockTransport::new();
    let manager = manager(&transport);
    manager.start().unwrap();
    assert!(manager.await_ready(Duration::from_secs(1)).await);
    assert_eq!(transport.active_controls(), 1);

    drop(manager);
    settle().await;
    assert_eq!(transport.active_controls(), 0);
}
