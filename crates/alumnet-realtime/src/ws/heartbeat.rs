//! Heartbeat/keepalive on the control topic.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use alumnet_proto::ChannelMessage;
use tokio::sync::mpsc;
use tracing::{trace, warn};

use super::driver::{Outbound, RefCounter};
use crate::config::WsConfig;
use crate::transport::TransportSignal;

/// Configuration for heartbeat behavior.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeartbeatConfig {
    /// Interval between heartbeats.
    pub interval: Duration,
    /// Number of unanswered heartbeats before the connection is considered dead.
    pub max_missed_acks: u32,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            max_missed_acks: 2,
        }
    }
}

impl From<&WsConfig> for HeartbeatConfig {
    fn from(config: &WsConfig) -> Self {
        Self {
            interval: Duration::from_millis(config.heartbeat_interval_ms),
            max_missed_acks: config.max_missed_heartbeats,
        }
    }
}

/// Handle for controlling the heartbeat task.
#[derive(Debug, Clone)]
pub struct HeartbeatHandle {
    running: Arc<AtomicBool>,
    missed_acks: Arc<AtomicU32>,
}

impl HeartbeatHandle {
    pub(crate) fn new() -> Self {
        Self {
            running: Arc::new(AtomicBool::new(false)),
            missed_acks: Arc::new(AtomicU32::new(0)),
        }
    }

    /// Check if the heartbeat task is running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Get the number of consecutive unanswered heartbeats.
    #[must_use]
    pub fn missed_acks(&self) -> u32 {
        self.missed_acks.load(Ordering::SeqCst)
    }

    /// Reset the missed ack counter (call when a control-topic reply arrives).
    pub fn ack_received(&self) {
        self.missed_acks.store(0, Ordering::SeqCst);
    }

    #[cfg(test)]
    pub(crate) fn set_missed_acks(&self, missed: u32) {
        self.missed_acks.store(missed, Ordering::SeqCst);
    }

    /// Stop the heartbeat task.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

/// Start a periodic heartbeat task.
///
/// Each tick sends a heartbeat frame through `outbound`. When
/// `max_missed_acks` heartbeats go unanswered the task reports the connection
/// as lost on `signals` and exits.
pub(crate) fn start_heartbeat_task(
    outbound: mpsc::Sender<Outbound>,
    refs: RefCounter,
    signals: mpsc::Sender<TransportSignal>,
    config: HeartbeatConfig,
) -> HeartbeatHandle {
    let handle = HeartbeatHandle::new();
    handle.running.store(true, Ordering::SeqCst);

    let running = Arc::clone(&handle.running);
    let missed_acks = Arc::clone(&handle.missed_acks);

    tokio::spawn(async move {
        let mut interval_timer = tokio::time::interval(config.interval);

        while running.load(Ordering::SeqCst) {
            interval_timer.tick().await;

            if !running.load(Ordering::SeqCst) {
                break;
            }

            if missed_acks.load(Ordering::SeqCst) >= config.max_missed_acks {
                warn!(
                    missed = config.max_missed_acks,
                    "heartbeat unanswered, connection considered dead"
                );
                running.store(false, Ordering::SeqCst);
                let _ = signals
                    .send(TransportSignal::Disconnected {
                        reason: "heartbeat timeout".to_string(),
                    })
                    .await;
                break;
            }

            let frame = ChannelMessage::heartbeat(refs.next());
            if outbound.send(Outbound::Frame(frame)).await.is_err() {
                running.store(false, Ordering::SeqCst);
                break;
            }
            let missed = missed_acks.fetch_add(1, Ordering::SeqCst) + 1;
            trace!(missed, "heartbeat sent");
        }
    });

    handle
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_config(max_missed_acks: u32) -> HeartbeatConfig {
        HeartbeatConfig {
            interval: Duration::from_millis(10),
            max_missed_acks,
        }
    }

    #[test]
    fn test_heartbeat_config_from_ws_config() {
        let mut ws = WsConfig::new("ws://localhost:4000/realtime/v1/websocket");
        ws.heartbeat_interval_ms = 5_000;
        ws.max_missed_heartbeats = 4;

        let config = HeartbeatConfig::from(&ws);
        assert_eq!(config.interval, Duration::from_secs(5));
        assert_eq!(config.max_missed_acks, 4);
    }

    #[test]
    fn test_heartbeat_handle_ack_received() {
        let handle = HeartbeatHandle::new();
        handle.missed_acks.store(5, Ordering::SeqCst);

        handle.ack_received();

        assert_eq!(handle.missed_acks(), 0);
    }

    #[test]
    fn test_heartbeat_handle_stop() {
        let handle = HeartbeatHandle::new();
        handle.running.store(true, Ordering::SeqCst);
        assert!(handle.is_running());

        handle.stop();

        assert!(!handle.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_task_sends_heartbeats() {
        let (tx, mut rx) = mpsc::channel(32);
        let (signal_tx, _signal_rx) = mpsc::channel(4);

        let handle = start_heartbeat_task(tx, RefCounter::default(), signal_tx, fast_config(100));

        let frame = rx.recv().await.unwrap();
        match frame {
            Outbound::Frame(msg) => {
                assert_eq!(msg.topic, "phoenix");
                assert_eq!(msg.event, "heartbeat");
                assert!(msg.reference.is_some());
            }
            Outbound::Close => panic!("expected heartbeat frame"),
        }

        handle.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_reports_dead_connection() {
        let (tx, mut rx) = mpsc::channel(32);
        let (signal_tx, mut signal_rx) = mpsc::channel(4);

        let handle = start_heartbeat_task(tx, RefCounter::default(), signal_tx, fast_config(2));

        assert!(rx.recv().await.is_some());
        assert!(rx.recv().await.is_some());
        assert_eq!(
            signal_rx.recv().await,
            Some(TransportSignal::Disconnected {
                reason: "heartbeat timeout".to_string()
            })
        );
        assert!(!handle.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_acks_keep_connection_alive() {
        let (tx, mut rx) = mpsc::channel(32);
        let (signal_tx, mut signal_rx) = mpsc::channel(4);

        let handle = start_heartbeat_task(tx, RefCounter::default(), signal_tx, fast_config(2));

        for _ in 0..5 {
            assert!(rx.recv().await.is_some());
            handle.ack_received();
        }
        assert!(handle.is_running());
        assert!(signal_rx.try_recv().is_err());
        handle.stop();
    }

    #[tokio::test]
    async fn test_heartbeat_task_stops_on_channel_close() {
        let (tx, rx) = mpsc::channel(32);
        let (signal_tx, _signal_rx) = mpsc::channel(4);
        drop(rx);

        let handle = start_heartbeat_task(tx, RefCounter::default(), signal_tx, fast_config(100));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!handle.is_running());
    }
}
