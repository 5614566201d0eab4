//! The realtime manager: one control connection per running application.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use alumnet_proto::FilterSpec;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::{info, warn};

use crate::config::RealtimeConfig;
use crate::error::RealtimeError;
use crate::events::{LifecycleEvent, StateChanged, SubscriptionEvent};
use crate::gate::{ReadinessGate, Readiness, ReadyPolicy};
use crate::registry::{ChannelRegistry, SubscriptionHandle};
use crate::state::{ConnectionState, ConnectionStatus};
use crate::status::{Command, StatusChannel};
use crate::transport::Transport;

/// Buffered state events per listener before it starts lagging.
const STATE_EVENT_CAPACITY: usize = 64;

/// Buffered lifecycle events per receiver.
const LIFECYCLE_EVENT_CAPACITY: usize = 64;

/// Owns the connection lifecycle and the subscription registry.
///
/// Construct one per running application and share it (for example behind an
/// `Arc`). The supervisor task spawned by [`new`](Self::new) is the only
/// writer of the connection state; it stops when the manager is dropped.
pub struct RealtimeManager<T: Transport> {
    config: RealtimeConfig,
    gate: ReadinessGate,
    registry: Arc<ChannelRegistry<T>>,
    commands: mpsc::UnboundedSender<Command>,
    changes: broadcast::Sender<StateChanged>,
    lifecycle: broadcast::Sender<LifecycleEvent>,
}

impl<T: Transport> RealtimeManager<T> {
    /// Create a manager over `transport` and spawn its supervisor task.
    ///
    /// The manager starts `Disconnected`; call [`start`](Self::start) to
    /// connect. Must be called from within a Tokio runtime.
    pub fn new(transport: T, config: RealtimeConfig) -> Result<Self, RealtimeError> {
        config.validate()?;

        let transport = Arc::new(transport);
        let (state_tx, state_rx) = watch::channel(ConnectionState::new());
        let gate = ReadinessGate::new(state_rx);
        let registry = Arc::new(ChannelRegistry::new(Arc::clone(&transport), gate.clone()));
        let (changes, _) = broadcast::channel(STATE_EVENT_CAPACITY);
        let (lifecycle, _) = broadcast::channel(LIFECYCLE_EVENT_CAPACITY);
        let (commands, command_rx) = mpsc::unbounded_channel();

        let channel = StatusChannel::new(
            transport,
            Arc::clone(&registry),
            &config,
            state_tx,
            changes.clone(),
            lifecycle.clone(),
        );
        tokio::spawn(channel.run(command_rx));

        info!(
            max_attempts = config.max_attempts,
            base_backoff_ms = config.base_backoff_ms,
            on_exhaustion = ?config.on_exhaustion,
            "realtime manager created"
        );

        Ok(Self {
            config,
            gate,
            registry,
            commands,
            changes,
            lifecycle,
        })
    }

    /// Begin connecting. Does nothing if a connection is live, being opened,
    /// or a reconnection is already scheduled. From `Degraded` it resets the
    /// attempt count and tries again.
    pub fn start(&self) -> Result<(), RealtimeError> {
        self.commands
            .send(Command::Start)
            .map_err(|_| RealtimeError::Stopped)
    }

    /// Cancel pending work, close the connection and every subscription, and
    /// move to `Disconnected`. Resolves once the supervisor has done so.
    pub async fn stop(&self) -> Result<(), RealtimeError> {
        let (ack, done) = oneshot::channel();
        self.commands
            .send(Command::Stop(ack))
            .map_err(|_| RealtimeError::Stopped)?;
        done.await.map_err(|_| RealtimeError::Stopped)
    }

    /// Whether realtime delivery can be assumed (`Connected` or `Degraded`).
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.gate.is_ready()
    }

    /// Wait until ready or until `timeout` elapses. Returns `false` on
    /// timeout.
    pub async fn await_ready(&self, timeout: Duration) -> bool {
        self.gate.await_ready(timeout).await
    }

    /// Wait according to `policy`.
    pub async fn wait_ready(&self, policy: ReadyPolicy) -> Result<Readiness, RealtimeError> {
        self.gate.wait_ready(policy).await
    }

    /// Policy built from the configured ready timeout and fallback flag.
    #[must_use]
    pub const fn default_policy(&self) -> ReadyPolicy {
        ReadyPolicy::from_config(&self.config)
    }

    /// Subscribe with the default readiness policy.
    ///
    /// See [`ChannelRegistry::subscribe`].
    pub async fn subscribe<F>(
        &self,
        name: &str,
        filter: FilterSpec,
        on_event: F,
    ) -> Result<SubscriptionHandle<T>, RealtimeError>
    where
        F: Fn(&SubscriptionEvent) + Send + Sync + 'static,
    {
        self.subscribe_with(name, filter, on_event, self.default_policy())
            .await
    }

    /// Subscribe with an explicit readiness policy.
    pub async fn subscribe_with<F>(
        &self,
        name: &str,
        filter: FilterSpec,
        on_event: F,
        policy: ReadyPolicy,
    ) -> Result<SubscriptionHandle<T>, RealtimeError>
    where
        F: Fn(&SubscriptionEvent) + Send + Sync + 'static,
    {
        self.registry
            .subscribe(name, filter, Arc::new(on_event), policy)
            .await
    }

    /// Detach `handle`. Same as [`SubscriptionHandle::unsubscribe`].
    pub async fn unsubscribe(&self, handle: &SubscriptionHandle<T>) -> bool {
        handle.unsubscribe().await
    }

    /// Listen for state transitions from now on.
    #[must_use]
    pub fn on_state_changed(&self) -> StateListener {
        StateListener {
            events: self.changes.subscribe(),
        }
    }

    /// Stop listening. Equivalent to dropping the listener.
    pub fn off_state_changed(&self, listener: StateListener) {
        drop(listener);
    }

    /// Receive lifecycle events from now on.
    #[must_use]
    pub fn lifecycle_events(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.lifecycle.subscribe()
    }

    /// Copy of the current state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.gate.snapshot()
    }

    /// Current status.
    #[must_use]
    pub fn status(&self) -> ConnectionStatus {
        self.gate.status()
    }

    /// The readiness gate, for components that only need to wait.
    #[must_use]
    pub fn gate(&self) -> ReadinessGate {
        self.gate.clone()
    }

    /// The subscription registry.
    #[must_use]
    pub fn registry(&self) -> &Arc<ChannelRegistry<T>> {
        &self.registry
    }

    /// Lifecycle configuration.
    #[must_use]
    pub const fn config(&self) -> &RealtimeConfig {
        &self.config
    }
}

impl<T: Transport> fmt::Debug for RealtimeManager<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RealtimeManager")
            .field("config", &self.config)
            .field("status", &self.gate.status())
            .finish_non_exhaustive()
    }
}

/// Receives [`StateChanged`] events in transition order.
#[derive(Debug)]
pub struct StateListener {
    events: broadcast::Receiver<StateChanged>,
}

impl StateListener {
    /// Next transition, or `None` once the manager is gone.
    ///
    /// A listener that falls behind skips the oldest events and logs a
    /// warning.
    pub async fn recv(&mut self) -> Option<StateChanged> {
        loop {
            match self.events.recv().await {
                Ok(event) => return Some(event),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "state listener lagged");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Next transition if one is already buffered.
    pub fn try_recv(&mut self) -> Option<StateChanged> {
        loop {
            match self.events.try_recv() {
                Ok(event) => return Some(event),
                Err(TryRecvError::Lagged(skipped)) => {
                    warn!(skipped, "state listener lagged");
                }
                Err(TryRecvError::Empty | TryRecvError::Closed) => return None,
            }
        }
    }
}
