//! The supervisor task that owns the connection state.
//!
//! [`StatusChannel`] is the only writer of [`ConnectionState`]. It reacts to
//! commands from the manager, completion of an in-flight open, transport
//! signals and the reconnection timer, one at a time, so state transitions
//! are totally ordered.

use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use crate::config::{ExhaustionPolicy, RealtimeConfig};
use crate::error::TransportError;
use crate::events::{LifecycleEvent, StateChanged};
use crate::registry::ChannelRegistry;
use crate::scheduler::{ReconnectionScheduler, ScheduleOutcome};
use crate::state::{ConnectionState, ConnectionStatus};
use crate::transport::{ControlLink, Transport, TransportSignal};

/// Requests from the manager.
#[derive(Debug)]
pub(crate) enum Command {
    Start,
    Stop(oneshot::Sender<()>),
}

type OpenFuture<C> = BoxFuture<'static, Result<ControlLink<C>, TransportError>>;

pub(crate) struct StatusChannel<T: Transport> {
    transport: Arc<T>,
    registry: Arc<ChannelRegistry<T>>,
    scheduler: ReconnectionScheduler,
    state: watch::Sender<ConnectionState>,
    changes: broadcast::Sender<StateChanged>,
    lifecycle: broadcast::Sender<LifecycleEvent>,
    link: Option<ControlLink<T::Connection>>,
    opening: Option<OpenFuture<T::Connection>>,
}

impl<T: Transport> StatusChannel<T> {
    pub(crate) fn new(
        transport: Arc<T>,
        registry: Arc<ChannelRegistry<T>>,
        config: &RealtimeConfig,
        state: watch::Sender<ConnectionState>,
        changes: broadcast::Sender<StateChanged>,
        lifecycle: broadcast::Sender<LifecycleEvent>,
    ) -> Self {
        Self {
            transport,
            registry,
            scheduler: ReconnectionScheduler::new(config),
            state,
            changes,
            lifecycle,
            link: None,
            opening: None,
        }
    }

    /// Process events until the manager goes away.
    pub(crate) async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Start) => self.start(),
                    Some(Command::Stop(ack)) => {
                        self.stop().await;
                        let _ = ack.send(());
                    }
                    None => {
                        self.stop().await;
                        break;
                    }
                },
                opened = poll_opening(&mut self.opening) => self.on_opened(opened).await,
                signal = next_signal(&mut self.link) => self.on_signal(signal).await,
                () = self.scheduler.wait() => self.on_timer(),
            }
        }
        debug!("status channel exited");
    }

    fn status(&self) -> ConnectionStatus {
        self.state.borrow().status
    }

    fn start(&mut self) {
        if self.link.is_some() || self.opening.is_some() || self.scheduler.pending().is_some() {
            debug!(status = %self.status(), "start ignored, connection already active");
            return;
        }
        self.state.send_modify(ConnectionState::reset_attempts);
        self.begin_open();
    }

    fn begin_open(&mut self) {
        self.transition(ConnectionStatus::Connecting, |_| {});
        let transport = Arc::clone(&self.transport);
        self.opening = Some(Box::pin(async move { transport.open_control().await }));
    }

    async fn on_opened(&mut self, opened: Result<ControlLink<T::Connection>, TransportError>) {
        self.opening = None;
        match opened {
            Ok(link) => {
                let connection = link.connection.clone();
                self.link = Some(link);
                self.on_connected(connection).await;
            }
            Err(e) => {
                warn!(error = %e, "failed to open realtime connection");
                self.on_connection_lost(e.to_string()).await;
            }
        }
    }

    async fn on_connected(&mut self, connection: T::Connection) {
        self.scheduler.cancel();
        // Entries re-open on their own task.
        drop(self.registry.attach(connection).await);
        if self.transition(ConnectionStatus::Connected, |_| {}) {
            info!("realtime connected");
            self.emit(LifecycleEvent::Connected);
        }
    }

    async fn on_signal(&mut self, signal: TransportSignal) {
        match signal {
            TransportSignal::Disconnected { reason } => {
                warn!(reason = %reason, "realtime connection lost");
                self.on_connection_lost(reason).await;
            }
            TransportSignal::Error(error) => {
                warn!(error = %error, "realtime connection error");
                self.on_connection_lost(error).await;
            }
        }
    }

    fn on_timer(&mut self) {
        if let Some(due) = self.scheduler.take_due() {
            debug!(attempt = due.attempt, "reconnection attempt due");
            self.begin_open();
        }
    }

    async fn on_connection_lost(&mut self, reason: String) {
        if let Some(link) = self.link.take() {
            self.transport.close_control(link.connection).await;
        }
        self.registry.detach().await;

        let error = reason.clone();
        self.transition(ConnectionStatus::Disconnected, move |state| {
            state.record_error(error);
        });
        self.emit(LifecycleEvent::Disconnected { reason });
        self.schedule_reconnect();
    }

    fn schedule_reconnect(&mut self) {
        let scheduler = &mut self.scheduler;
        let mut outcome = ScheduleOutcome::AlreadyPending;
        self.state.send_if_modified(|state| {
            outcome = scheduler.on_disconnected(state);
            matches!(outcome, ScheduleOutcome::Scheduled(_))
        });

        match outcome {
            ScheduleOutcome::Scheduled(pending) => {
                info!(
                    attempt = pending.attempt,
                    delay_ms = pending.delay.as_millis() as u64,
                    "reconnecting"
                );
                self.emit(LifecycleEvent::Reconnecting {
                    attempt: pending.attempt,
                    delay: pending.delay,
                });
            }
            ScheduleOutcome::AlreadyPending => {
                debug!("reconnection already pending");
            }
            ScheduleOutcome::Exhausted(policy) => {
                let snapshot = self.state.borrow().clone();
                warn!(
                    attempts = snapshot.attempt_count,
                    policy = ?policy,
                    "reconnection attempts exhausted"
                );
                if policy == ExhaustionPolicy::Degrade {
                    self.transition(ConnectionStatus::Degraded, |_| {});
                    warn!("realtime unavailable, continuing in offline mode");
                }
                self.emit(LifecycleEvent::RetriesExhausted {
                    attempts: snapshot.attempt_count,
                    last_error: snapshot.last_error,
                });
            }
        }
    }

    async fn stop(&mut self) {
        let cancelled_open = self.opening.take().is_some();
        let cancelled_timer = self.scheduler.cancel().is_some();
        if let Some(link) = self.link.take() {
            self.transport.close_control(link.connection).await;
        }
        let removed = self.registry.teardown().await;

        self.state.send_modify(ConnectionState::reset_attempts);
        self.transition(ConnectionStatus::Disconnected, |_| {});
        info!(
            cancelled_open,
            cancelled_timer,
            subscriptions = removed,
            "realtime stopped"
        );
        self.emit(LifecycleEvent::Stopped);
    }

    /// Apply `edit` and move to `next`, publishing a [`StateChanged`] when
    /// the status actually changed. Returns whether it did.
    fn transition(
        &self,
        next: ConnectionStatus,
        edit: impl FnOnce(&mut ConnectionState),
    ) -> bool {
        let mut changed = None;
        self.state.send_if_modified(|state| {
            edit(state);
            match state.transition(next) {
                Ok(Some(previous)) => {
                    changed = Some(StateChanged::new(previous, state));
                    true
                }
                Ok(None) => false,
                Err(e) => {
                    warn!(error = %e, "rejected state transition");
                    false
                }
            }
        });

        match changed {
            Some(event) => {
                debug!(
                    from = %event.previous,
                    to = %event.status,
                    attempt = event.attempt_count,
                    "connection state changed"
                );
                let _ = self.changes.send(event);
                true
            }
            None => false,
        }
    }

    fn emit(&self, event: LifecycleEvent) {
        let _ = self.lifecycle.send(event);
    }
}

async fn poll_opening<C>(
    opening: &mut Option<OpenFuture<C>>,
) -> Result<ControlLink<C>, TransportError> {
    match opening {
        Some(future) => future.as_mut().await,
        None => std::future::pending().await,
    }
}

async fn next_signal<C>(link: &mut Option<ControlLink<C>>) -> TransportSignal {
    match link {
        Some(link) => link
            .signals
            .recv()
            .await
            .unwrap_or_else(|| TransportSignal::Disconnected {
                reason: "signal stream closed".to_string(),
            }),
        None => std::future::pending().await,
    }
}
