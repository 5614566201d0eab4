//! Named subscription registry.
//!
//! Feature code subscribes by name; the registry keeps at most one wire
//! subscription per name and fans incoming changes out to every listener
//! attached to it. Entries survive disconnects and are re-opened on the next
//! connection without consumer involvement.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use alumnet_proto::{ChangeRecord, EventFilter, FilterSpec};
use parking_lot::RwLock;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::error::{RealtimeError, TransportError};
use crate::events::SubscriptionEvent;
use crate::gate::{ReadinessGate, Readiness, ReadyPolicy};
use crate::transport::Transport;

/// Listener invoked for every change on a subscription.
pub type EventCallback = Arc<dyn Fn(&SubscriptionEvent) + Send + Sync>;

/// Identifies one consumer's attachment to a named subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(Uuid);

impl SubscriptionId {
    /// Create a new random id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Get the underlying UUID.
    #[must_use]
    pub const fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for SubscriptionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Default)]
struct ListenerSet {
    listeners: RwLock<Vec<(SubscriptionId, EventCallback)>>,
}

impl ListenerSet {
    fn add(&self, id: SubscriptionId, callback: EventCallback) {
        self.listeners.write().push((id, callback));
    }

    fn remove(&self, id: SubscriptionId) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|(listener, _)| *listener != id);
        listeners.len() != before
    }

    fn len(&self) -> usize {
        self.listeners.read().len()
    }

    fn is_empty(&self) -> bool {
        self.listeners.read().is_empty()
    }

    fn snapshot(&self) -> Vec<EventCallback> {
        self.listeners
            .read()
            .iter()
            .map(|(_, callback)| Arc::clone(callback))
            .collect()
    }
}

/// Where a transport delivers changes for one named subscription.
#[derive(Clone)]
pub struct EventSink {
    name: Arc<str>,
    event: EventFilter,
    listeners: Arc<ListenerSet>,
    closed: Arc<AtomicBool>,
}

impl EventSink {
    fn new(name: &str, event: EventFilter, listeners: Arc<ListenerSet>) -> Self {
        Self {
            name: Arc::from(name),
            event,
            listeners,
            closed: Arc::default(),
        }
    }

    #[cfg(test)]
    pub(crate) fn detached(name: &str) -> Self {
        Self::new(name, EventFilter::All, Arc::default())
    }

    /// Subscription name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of listeners currently attached.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.listeners.len()
    }

    /// Record that the backend closed or errored this subscription. The
    /// registry stops reporting it as open and re-opens it on the next
    /// connection.
    pub fn mark_closed(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            debug!(name = %self.name, "subscription closed by transport");
        }
    }

    /// Whether [`mark_closed`](Self::mark_closed) was called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Hand `record` to every listener. Changes of a kind the subscription
    /// did not ask for are dropped. Returns how many listeners were called.
    pub fn deliver(&self, record: ChangeRecord) -> usize {
        if !self.event.accepts(record.kind) {
            trace!(name = %self.name, kind = %record.kind, "dropping change outside event filter");
            return 0;
        }

        let callbacks = self.listeners.snapshot();
        if callbacks.is_empty() {
            return 0;
        }

        let event = SubscriptionEvent {
            name: self.name.to_string(),
            record,
        };
        for callback in &callbacks {
            callback(&event);
        }
        callbacks.len()
    }
}

impl fmt::Debug for EventSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventSink")
            .field("name", &self.name)
            .field("event", &self.event)
            .field("subscribers", &self.listeners.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// An open wire subscription and the sink it delivers into.
struct Wire<S> {
    subscription: S,
    sink: EventSink,
}

struct Registration<S> {
    filter: FilterSpec,
    listeners: Arc<ListenerSet>,
    wire: Option<Wire<S>>,
    /// Set while the first subscriber opens the wire subscription.
    opening: Option<watch::Receiver<bool>>,
}

impl<S> Registration<S> {
    fn is_open(&self) -> bool {
        self.wire.as_ref().is_some_and(|wire| !wire.sink.is_closed())
    }

    /// Whether a first open is still running. A dropped sender means the
    /// subscriber that started it went away.
    fn opening_in_flight(&self) -> bool {
        self.opening
            .as_ref()
            .is_some_and(|settled| settled.has_changed().is_ok())
    }
}

struct Entries<C, S> {
    connection: Option<C>,
    /// Bumped whenever `connection` changes.
    epoch: u64,
    registrations: HashMap<String, Registration<S>>,
}

/// Next move for a subscriber, decided under the lock.
enum Step<C> {
    Attached,
    AwaitReady,
    AwaitOpen(watch::Receiver<bool>),
    Open {
        connection: C,
        epoch: u64,
        listeners: Arc<ListenerSet>,
        settled: watch::Sender<bool>,
    },
}

/// Where a first open ended up once the lock was re-taken.
enum Settled<C> {
    Stored,
    Pending,
    Retry { connection: C, epoch: u64 },
    Removed,
    Failed(TransportError),
}

/// Entries to re-open on a fresh connection.
struct Reopen {
    name: String,
    filter: FilterSpec,
    listeners: Arc<ListenerSet>,
}

/// Multiplexes named subscriptions over the control connection.
///
/// The entry lock is never held across a transport call.
pub struct ChannelRegistry<T: Transport> {
    transport: Arc<T>,
    gate: ReadinessGate,
    entries: Mutex<Entries<T::Connection, T::Subscription>>,
}

impl<T: Transport> ChannelRegistry<T> {
    pub(crate) fn new(transport: Arc<T>, gate: ReadinessGate) -> Self {
        Self {
            transport,
            gate,
            entries: Mutex::new(Entries {
                connection: None,
                epoch: 0,
                registrations: HashMap::new(),
            }),
        }
    }

    /// Attach `on_event` to the subscription called `name`.
    ///
    /// The first subscriber for a name waits for readiness according to
    /// `policy` and opens the wire subscription; later subscribers share it.
    /// When no connection is live (fallback or degraded mode), or the open
    /// fails for connectivity reasons, the entry is kept pending and opened
    /// on the next connection.
    ///
    /// # Errors
    ///
    /// Returns an error if the filter is invalid, the name is registered with
    /// a different filter, readiness times out under a strict policy, the
    /// backend refuses the subscription, or the registry is torn down while
    /// the subscription is being opened.
    pub async fn subscribe(
        self: &Arc<Self>,
        name: &str,
        filter: FilterSpec,
        on_event: EventCallback,
        policy: ReadyPolicy,
    ) -> Result<SubscriptionHandle<T>, RealtimeError> {
        filter.validate()?;
        let id = SubscriptionId::new();
        let mut ready = false;

        loop {
            match self.reserve(name, &filter, id, &on_event, ready).await? {
                Step::Attached => return Ok(self.handle(name, id)),
                Step::AwaitReady => {
                    if self.gate.wait_ready(policy).await? == Readiness::Fallback {
                        debug!(name, "subscribing in fallback mode");
                    }
                    ready = true;
                }
                Step::AwaitOpen(mut settled) => {
                    // A closed channel also means the open is over.
                    let _ = settled.wait_for(|done| *done).await;
                }
                Step::Open {
                    connection,
                    epoch,
                    listeners,
                    settled,
                } => {
                    // Dropping this mid-open releases the listener.
                    let handle = self.handle(name, id);
                    let opened = self
                        .open_first(name, &filter, &listeners, connection, epoch)
                        .await;
                    let _ = settled.send(true);
                    return match opened {
                        Ok(()) => Ok(handle),
                        Err(e) => {
                            handle.disarm();
                            Err(e)
                        }
                    };
                }
            }
        }
    }

    async fn reserve(
        &self,
        name: &str,
        filter: &FilterSpec,
        id: SubscriptionId,
        on_event: &EventCallback,
        ready: bool,
    ) -> Result<Step<T::Connection>, RealtimeError> {
        let mut entries = self.entries.lock().await;
        let epoch = entries.epoch;
        let connection = entries.connection.clone();

        if let Some(registration) = entries.registrations.get_mut(name) {
            if registration.filter != *filter {
                return Err(RealtimeError::FilterMismatch(name.to_string()));
            }
            if registration.opening_in_flight() {
                if let Some(settled) = &registration.opening {
                    return Ok(Step::AwaitOpen(settled.clone()));
                }
            }

            registration.listeners.add(id, Arc::clone(on_event));
            debug!(name, subscribers = registration.listeners.len(), "listener attached");
            if registration.opening.take().is_none() {
                return Ok(Step::Attached);
            }
            // The subscriber that reserved this entry gave up mid-open.
            return Ok(match connection {
                Some(connection) => {
                    let (settled, opening) = watch::channel(false);
                    registration.opening = Some(opening);
                    Step::Open {
                        connection,
                        epoch,
                        listeners: Arc::clone(&registration.listeners),
                        settled,
                    }
                }
                None => Step::Attached,
            });
        }

        if !ready {
            return Ok(Step::AwaitReady);
        }

        let listeners = Arc::new(ListenerSet::default());
        listeners.add(id, Arc::clone(on_event));
        let mut registration = Registration {
            filter: filter.clone(),
            listeners: Arc::clone(&listeners),
            wire: None,
            opening: None,
        };

        let step = match connection {
            Some(connection) => {
                let (settled, opening) = watch::channel(false);
                registration.opening = Some(opening);
                Step::Open {
                    connection,
                    epoch,
                    listeners,
                    settled,
                }
            }
            None => {
                info!(name, filter = %filter, "no live connection, registration pending");
                Step::Attached
            }
        };
        entries.registrations.insert(name.to_string(), registration);
        Ok(step)
    }

    /// Open a freshly reserved entry without holding the lock. The open is
    /// retried when a new connection was attached meanwhile.
    async fn open_first(
        &self,
        name: &str,
        filter: &FilterSpec,
        listeners: &Arc<ListenerSet>,
        mut connection: T::Connection,
        mut epoch: u64,
    ) -> Result<(), RealtimeError> {
        loop {
            let sink = EventSink::new(name, filter.event, Arc::clone(listeners));
            let result = self
                .transport
                .open_subscription(&connection, name, filter, sink.clone())
                .await;

            let (settled, stale) = {
                let mut entries = self.entries.lock().await;
                let current = entries.epoch == epoch;
                let next_epoch = entries.epoch;
                let next = entries.connection.clone();

                match entries.registrations.get_mut(name) {
                    Some(registration) if Arc::ptr_eq(&registration.listeners, listeners) => {
                        match result {
                            Ok(subscription) if current => {
                                registration.wire = Some(Wire { subscription, sink });
                                registration.opening = None;
                                (Settled::Stored, None)
                            }
                            Err(source) if !source.is_transient() => {
                                entries.registrations.remove(name);
                                (Settled::Failed(source), None)
                            }
                            result => {
                                let stale = match result {
                                    Ok(subscription) => Some(subscription),
                                    Err(e) => {
                                        warn!(name, error = %e, "subscription open failed, registration pending");
                                        None
                                    }
                                };
                                match next {
                                    Some(next) if !current => (
                                        Settled::Retry {
                                            connection: next,
                                            epoch: next_epoch,
                                        },
                                        stale,
                                    ),
                                    _ => {
                                        registration.opening = None;
                                        (Settled::Pending, stale)
                                    }
                                }
                            }
                        }
                    }
                    _ => (Settled::Removed, result.ok()),
                }
            };

            if let Some(stale) = stale {
                self.transport.close_subscription(stale).await;
            }

            match settled {
                Settled::Stored => {
                    info!(name, filter = %filter, "subscription opened");
                    return Ok(());
                }
                Settled::Pending => {
                    info!(name, filter = %filter, "subscription registered, pending");
                    return Ok(());
                }
                Settled::Retry {
                    connection: next,
                    epoch: next_epoch,
                } => {
                    debug!(name, "connection changed while subscribing, retrying");
                    connection = next;
                    epoch = next_epoch;
                }
                Settled::Removed => {
                    debug!(name, "registry torn down while subscribing");
                    return Err(RealtimeError::Stopped);
                }
                Settled::Failed(source) => {
                    return Err(RealtimeError::Subscribe {
                        name: name.to_string(),
                        source,
                    });
                }
            }
        }
    }

    fn handle(self: &Arc<Self>, name: &str, id: SubscriptionId) -> SubscriptionHandle<T> {
        SubscriptionHandle {
            id,
            name: name.to_string(),
            registry: Arc::downgrade(self),
            active: AtomicBool::new(true),
        }
    }

    /// Detach listener `id` from `name`; the last detach closes the wire
    /// subscription and removes the entry.
    async fn release(&self, name: &str, id: SubscriptionId) -> bool {
        let closed = {
            let mut entries = self.entries.lock().await;
            let Some(registration) = entries.registrations.get(name) else {
                return false;
            };
            if !registration.listeners.remove(id) {
                return false;
            }
            if !registration.listeners.is_empty() {
                debug!(name, "listener detached");
                return true;
            }
            entries
                .registrations
                .remove(name)
                .and_then(|registration| registration.wire)
        };

        if let Some(wire) = closed {
            self.transport.close_subscription(wire.subscription).await;
        }
        info!(name, "subscription closed");
        true
    }

    /// Bind to a fresh connection. The entries are re-opened on it by a
    /// background task; the returned handle resolves to how many were.
    pub(crate) async fn attach(self: &Arc<Self>, connection: T::Connection) -> JoinHandle<usize> {
        let (epoch, stale, work) = {
            let mut entries = self.entries.lock().await;
            entries.epoch += 1;
            entries.connection = Some(connection.clone());
            let epoch = entries.epoch;

            let mut stale = Vec::new();
            let mut work = Vec::new();
            for (name, registration) in &mut entries.registrations {
                // A subscriber still opening this entry retries on the new
                // connection itself.
                if registration.opening_in_flight() {
                    continue;
                }
                registration.opening = None;
                if let Some(wire) = registration.wire.take() {
                    stale.push(wire.subscription);
                }
                work.push(Reopen {
                    name: name.clone(),
                    filter: registration.filter.clone(),
                    listeners: Arc::clone(&registration.listeners),
                });
            }
            (epoch, stale, work)
        };

        let registry = Arc::clone(self);
        tokio::spawn(async move { registry.reopen(connection, epoch, stale, work).await })
    }

    async fn reopen(
        &self,
        connection: T::Connection,
        epoch: u64,
        stale: Vec<T::Subscription>,
        work: Vec<Reopen>,
    ) -> usize {
        for subscription in stale {
            self.transport.close_subscription(subscription).await;
        }

        let total = work.len();
        let mut reopened = 0;
        for Reopen {
            name,
            filter,
            listeners,
        } in work
        {
            if self.entries.lock().await.epoch != epoch {
                debug!(reopened, total, "connection changed, abandoning re-open");
                return reopened;
            }

            let sink = EventSink::new(&name, filter.event, Arc::clone(&listeners));
            let subscription = match self
                .transport
                .open_subscription(&connection, &name, &filter, sink.clone())
                .await
            {
                Ok(subscription) => subscription,
                Err(e) => {
                    warn!(name = %name, error = %e, "failed to re-open subscription, leaving it pending");
                    continue;
                }
            };

            let stale = {
                let mut entries = self.entries.lock().await;
                let current = entries.epoch == epoch;
                match entries.registrations.get_mut(&name) {
                    Some(registration)
                        if current
                            && registration.wire.is_none()
                            && Arc::ptr_eq(&registration.listeners, &listeners) =>
                    {
                        registration.wire = Some(Wire { subscription, sink });
                        reopened += 1;
                        None
                    }
                    _ => Some(subscription),
                }
            };
            if let Some(stale) = stale {
                self.transport.close_subscription(stale).await;
            }
        }

        if total > 0 {
            info!(reopened, total, "subscriptions re-opened");
        }
        reopened
    }

    /// Forget the current connection. Entries stay registered, pending.
    pub(crate) async fn detach(&self) {
        let stale: Vec<Wire<T::Subscription>> = {
            let mut entries = self.entries.lock().await;
            entries.epoch += 1;
            entries.connection = None;
            entries
                .registrations
                .values_mut()
                .filter_map(|registration| registration.wire.take())
                .collect()
        };
        for wire in stale {
            self.transport.close_subscription(wire.subscription).await;
        }
    }

    /// Close every wire subscription and drop every entry.
    pub(crate) async fn teardown(&self) -> usize {
        let drained: Vec<(String, Registration<T::Subscription>)> = {
            let mut entries = self.entries.lock().await;
            entries.epoch += 1;
            entries.connection = None;
            entries.registrations.drain().collect()
        };

        let removed = drained.len();
        for (name, registration) in drained {
            if let Some(wire) = registration.wire {
                self.transport.close_subscription(wire.subscription).await;
            }
            debug!(name = %name, "subscription torn down");
        }
        removed
    }

    /// Number of listeners on `name` (0 when not registered).
    pub async fn subscriber_count(&self, name: &str) -> usize {
        self.entries
            .lock()
            .await
            .registrations
            .get(name)
            .map_or(0, |registration| registration.listeners.len())
    }

    /// Whether `name` currently has an open wire subscription that the
    /// backend has not closed.
    pub async fn is_open(&self, name: &str) -> bool {
        self.entries
            .lock()
            .await
            .registrations
            .get(name)
            .is_some_and(Registration::is_open)
    }

    /// Registered names, sorted.
    pub async fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .entries
            .lock()
            .await
            .registrations
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// Number of registered names.
    pub async fn len(&self) -> usize {
        self.entries.lock().await.registrations.len()
    }

    /// Whether nothing is registered.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl<T: Transport> fmt::Debug for ChannelRegistry<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelRegistry")
            .field("status", &self.gate.status())
            .finish_non_exhaustive()
    }
}

/// A consumer's attachment to a named subscription.
///
/// Call [`unsubscribe`](Self::unsubscribe) when the consumer no longer needs
/// it. Dropping an active handle detaches the listener in the background.
#[must_use = "dropping a subscription handle detaches its listener"]
pub struct SubscriptionHandle<T: Transport> {
    id: SubscriptionId,
    name: String,
    registry: Weak<ChannelRegistry<T>>,
    active: AtomicBool,
}

impl<T: Transport> SubscriptionHandle<T> {
    /// Attachment id.
    #[must_use]
    pub const fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Subscription name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether `unsubscribe` has not been called yet.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Detach this consumer. Idempotent: only the first call has an effect.
    ///
    /// Returns `true` if a listener was detached.
    pub async fn unsubscribe(&self) -> bool {
        if !self.active.swap(false, Ordering::SeqCst) {
            return false;
        }
        match self.registry.upgrade() {
            Some(registry) => registry.release(&self.name, self.id).await,
            None => false,
        }
    }

    fn disarm(&self) {
        self.active.store(false, Ordering::SeqCst);
    }
}

impl<T: Transport> Drop for SubscriptionHandle<T> {
    fn drop(&mut self) {
        if !self.active.swap(false, Ordering::SeqCst) {
            return;
        }
        let Some(registry) = self.registry.upgrade() else {
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(name = %self.name, "subscription handle dropped outside a runtime, listener stays attached");
            return;
        };

        let name = std::mem::take(&mut self.name);
        let id = self.id;
        runtime.spawn(async move {
            registry.release(&name, id).await;
        });
    }
}

impl<T: Transport> fmt::Debug for SubscriptionHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("active", &self.is_active())
            .finish()
    }
}
