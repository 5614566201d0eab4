//! In-memory transport for tests and local development.
//!
//! [`MockTransport`] is cheap to clone; every clone observes and drives the
//! same fake backend. Control-connection outcomes are scripted, and the
//! counters record how the manager used the transport.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use alumnet_proto::{ChangeRecord, ChannelMessage, FilterSpec};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::TransportError;
use crate::registry::EventSink;
use crate::transport::{ControlLink, Transport, TransportSignal};

/// What the next `open_control` call does.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlOutcome {
    /// Succeed.
    Connect,
    /// Fail with the given reason.
    Fail(String),
    /// Never complete.
    Hang,
}

/// Handle to a mock control connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MockConnection {
    generation: u64,
}

impl MockConnection {
    /// Which control connection this is (1 for the first one opened).
    #[must_use]
    pub const fn generation(&self) -> u64 {
        self.generation
    }
}

/// Handle to a mock named subscription.
#[derive(Debug)]
pub struct MockSubscription {
    id: u64,
    name: String,
    generation: u64,
}

impl MockSubscription {
    /// Subscription name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Generation of the connection it was opened on.
    #[must_use]
    pub const fn generation(&self) -> u64 {
        self.generation
    }
}

struct OpenSubscription {
    name: String,
    generation: u64,
    sink: EventSink,
}

#[derive(Default)]
struct Inner {
    script: Mutex<VecDeque<ControlOutcome>>,
    fallback: Mutex<Option<ControlOutcome>>,
    connect_delay: Mutex<Duration>,
    subscription_delay: Mutex<Duration>,
    control_opens: AtomicUsize,
    active_controls: AtomicUsize,
    max_active_controls: AtomicUsize,
    generation: AtomicU64,
    signals: Mutex<Option<(u64, mpsc::Sender<TransportSignal>)>>,
    rejected: Mutex<HashSet<String>>,
    next_subscription: AtomicU64,
    subscriptions: Mutex<HashMap<u64, OpenSubscription>>,
    opens: Mutex<Vec<(String, u64)>>,
    closes: Mutex<HashMap<String, usize>>,
}

/// Scriptable in-memory [`Transport`].
#[derive(Clone, Default)]
pub struct MockTransport {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for MockTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockTransport")
            .field("generation", &self.current_generation())
            .field("active_controls", &self.active_controls())
            .finish_non_exhaustive()
    }
}

impl MockTransport {
    /// A transport whose control connections always succeed.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A transport whose control connections always fail with `reason`.
    #[must_use]
    pub fn failing(reason: &str) -> Self {
        let transport = Self::new();
        transport.set_default(ControlOutcome::Fail(reason.to_string()));
        transport
    }

    /// Outcome used once the script is empty.
    pub fn set_default(&self, outcome: ControlOutcome) {
        *self.inner.fallback.lock() = Some(outcome);
    }

    /// Queue outcomes for the next `open_control` calls.
    pub fn script(&self, outcomes: impl IntoIterator<Item = ControlOutcome>) {
        self.inner.script.lock().extend(outcomes);
    }

    /// Queue `count` failures.
    pub fn fail_next(&self, count: usize, reason: &str) {
        self.script((0..count).map(|_| ControlOutcome::Fail(reason.to_string())));
    }

    /// Delay every `open_control` call by `delay`.
    pub fn set_connect_delay(&self, delay: Duration) {
        *self.inner.connect_delay.lock() = delay;
    }

    /// Delay every `open_subscription` call by `delay`, like a slow join.
    pub fn set_subscription_delay(&self, delay: Duration) {
        *self.inner.subscription_delay.lock() = delay;
    }

    /// Make the backend refuse subscriptions called `name`.
    pub fn reject_subscription(&self, name: &str) {
        self.inner.rejected.lock().insert(name.to_string());
    }

    /// Stop refusing subscriptions called `name`.
    pub fn accept_subscription(&self, name: &str) {
        self.inner.rejected.lock().remove(name);
    }

    /// Open a control connection directly, outside any manager.
    pub fn connect_now(&self) -> MockConnection {
        self.establish().connection
    }

    /// Simulate the backend dropping the current control connection.
    ///
    /// Returns `false` when no control connection is being watched.
    pub fn drop_connection(&self, reason: &str) -> bool {
        let signals = self.inner.signals.lock().take();
        match signals {
            Some((generation, tx)) => {
                debug!(generation, reason, "mock connection dropped");
                tx.try_send(TransportSignal::Disconnected {
                    reason: reason.to_string(),
                })
                .is_ok()
            }
            None => false,
        }
    }

    /// Simulate the backend closing every open subscription called `name`.
    ///
    /// Returns how many were closed.
    pub fn close_topic(&self, name: &str) -> usize {
        let mut subscriptions = self.inner.subscriptions.lock();
        let closed: Vec<u64> = subscriptions
            .iter()
            .filter(|(_, open)| open.name == name)
            .map(|(id, _)| *id)
            .collect();
        for id in &closed {
            if let Some(open) = subscriptions.remove(id) {
                open.sink.mark_closed();
            }
        }
        debug!(name, closed = closed.len(), "mock topic closed");
        closed.len()
    }

    /// Deliver `record` to every open subscription called `name`.
    ///
    /// Returns how many listeners were called.
    pub fn emit(&self, name: &str, record: ChangeRecord) -> usize {
        let sinks: Vec<EventSink> = self
            .inner
            .subscriptions
            .lock()
            .values()
            .filter(|open| open.name == name)
            .map(|open| open.sink.clone())
            .collect();
        sinks
            .iter()
            .map(|sink| sink.deliver(record.clone()))
            .sum()
    }

    /// Total `open_control` calls.
    #[must_use]
    pub fn control_opens(&self) -> usize {
        self.inner.control_opens.load(Ordering::SeqCst)
    }

    /// Control connections opened and not yet closed.
    #[must_use]
    pub fn active_controls(&self) -> usize {
        self.inner.active_controls.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneously open control connections.
    #[must_use]
    pub fn max_active_controls(&self) -> usize {
        self.inner.max_active_controls.load(Ordering::SeqCst)
    }

    /// Generation of the most recent control connection (0 before any).
    #[must_use]
    pub fn current_generation(&self) -> u64 {
        self.inner.generation.load(Ordering::SeqCst)
    }

    /// Successful opens of subscriptions called `name`.
    #[must_use]
    pub fn subscription_opens(&self, name: &str) -> usize {
        self.inner
            .opens
            .lock()
            .iter()
            .filter(|(opened, _)| opened == name)
            .count()
    }

    /// Successful subscription opens on connection `generation`.
    #[must_use]
    pub fn subscription_opens_on(&self, generation: u64) -> usize {
        self.inner
            .opens
            .lock()
            .iter()
            .filter(|(_, opened_on)| *opened_on == generation)
            .count()
    }

    /// Currently open subscriptions called `name`.
    #[must_use]
    pub fn active_subscriptions(&self, name: &str) -> usize {
        self.inner
            .subscriptions
            .lock()
            .values()
            .filter(|open| open.name == name)
            .count()
    }

    /// Closes of subscriptions called `name`.
    #[must_use]
    pub fn subscription_closes(&self, name: &str) -> usize {
        self.inner.closes.lock().get(name).copied().unwrap_or(0)
    }

    fn next_outcome(&self) -> ControlOutcome {
        if let Some(outcome) = self.inner.script.lock().pop_front() {
            return outcome;
        }
        self.inner
            .fallback
            .lock()
            .clone()
            .unwrap_or(ControlOutcome::Connect)
    }

    fn establish(&self) -> ControlLink<MockConnection> {
        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let active = self.inner.active_controls.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner
            .max_active_controls
            .fetch_max(active, Ordering::SeqCst);

        let (tx, rx) = mpsc::channel(8);
        *self.inner.signals.lock() = Some((generation, tx));
        ControlLink {
            connection: MockConnection { generation },
            signals: rx,
        }
    }
}

impl Transport for MockTransport {
    type Connection = MockConnection;
    type Subscription = MockSubscription;

    async fn open_control(&self) -> Result<ControlLink<MockConnection>, TransportError> {
        self.inner.control_opens.fetch_add(1, Ordering::SeqCst);
        let outcome = self.next_outcome();
        let delay = *self.inner.connect_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        match outcome {
            ControlOutcome::Connect => Ok(self.establish()),
            ControlOutcome::Fail(reason) => Err(TransportError::Connect(reason)),
            ControlOutcome::Hang => std::future::pending().await,
        }
    }

    async fn open_subscription(
        &self,
        connection: &MockConnection,
        name: &str,
        filter: &FilterSpec,
        sink: EventSink,
    ) -> Result<MockSubscription, TransportError> {
        let delay = *self.inner.subscription_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if connection.generation != self.current_generation() {
            return Err(TransportError::Closed);
        }
        if self.inner.rejected.lock().contains(name) {
            return Err(TransportError::Rejected {
                topic: ChannelMessage::topic_for(name),
                reason: format!("not allowed to read {}", filter.table),
            });
        }

        let id = self.inner.next_subscription.fetch_add(1, Ordering::SeqCst);
        self.inner.subscriptions.lock().insert(
            id,
            OpenSubscription {
                name: name.to_string(),
                generation: connection.generation,
                sink,
            },
        );
        self.inner
            .opens
            .lock()
            .push((name.to_string(), connection.generation));
        Ok(MockSubscription {
            id,
            name: name.to_string(),
            generation: connection.generation,
        })
    }

    async fn close_subscription(&self, subscription: MockSubscription) {
        if self.inner.subscriptions.lock().remove(&subscription.id).is_some() {
            *self
                .inner
                .closes
                .lock()
                .entry(subscription.name)
                .or_default() += 1;
        }
    }

    async fn close_control(&self, connection: MockConnection) {
        let _ = self
            .inner
            .active_controls
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        let mut signals = self.inner.signals.lock();
        if signals
            .as_ref()
            .is_some_and(|(generation, _)| *generation == connection.generation)
        {
            *signals = None;
        }
    }
}
