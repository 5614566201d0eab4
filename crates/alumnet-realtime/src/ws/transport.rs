//! [`Transport`] over a single WebSocket.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use alumnet_proto::{ChannelMessage, FilterSpec};
use futures::StreamExt;
use tokio::sync::mpsc;
use tracing::{debug, info};
use url::Url;

use super::driver::{self, Outbound, RefCounter, Session};
use super::heartbeat::{HeartbeatConfig, start_heartbeat_task};
use crate::config::WsConfig;
use crate::error::{RealtimeError, TransportError};
use crate::registry::EventSink;
use crate::transport::{ControlLink, Transport, TransportSignal};

/// Protocol version requested from the server.
const PROTOCOL_VERSION: &str = "1.0.0";

const OUTBOUND_CAPACITY: usize = 64;
const SIGNAL_CAPACITY: usize = 8;

/// Speaks the realtime channel protocol over `ws://` or `wss://`.
#[derive(Debug, Clone)]
pub struct WsTransport {
    config: WsConfig,
}

impl WsTransport {
    /// Transport for `config`.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn new(config: WsConfig) -> Result<Self, RealtimeError> {
        config.validate()?;
        Ok(Self { config })
    }

    /// Transport settings.
    #[must_use]
    pub const fn config(&self) -> &WsConfig {
        &self.config
    }

    /// The URL actually dialed: the configured endpoint plus the API key and
    /// protocol version query parameters.
    pub fn endpoint(&self) -> Result<Url, TransportError> {
        let mut url = Url::parse(&self.config.url)
            .map_err(|e| TransportError::InvalidEndpoint(format!("{}: {e}", self.config.url)))?;
        {
            let mut query = url.query_pairs_mut();
            if let Some(key) = &self.config.api_key {
                query.append_pair("apikey", key);
            }
            query.append_pair("vsn", PROTOCOL_VERSION);
        }
        Ok(url)
    }

    fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.config.join_timeout_ms)
    }
}

/// An open socket. Clones share it.
#[derive(Clone)]
pub struct WsConnection {
    session: Arc<Session>,
}

impl WsConnection {
    /// Whether the socket has gone away.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.session.is_closed()
    }
}

impl fmt::Debug for WsConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WsConnection")
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

/// A joined topic.
#[derive(Debug)]
pub struct WsSubscription {
    connection: WsConnection,
    topic: String,
}

impl WsSubscription {
    /// Joined topic.
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }
}

impl Transport for WsTransport {
    type Connection = WsConnection;
    type Subscription = WsSubscription;

    async fn open_control(&self) -> Result<ControlLink<WsConnection>, TransportError> {
        let endpoint = self.endpoint()?;
        let (stream, _response) = tokio_tungstenite::connect_async(endpoint.as_str())
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        info!(host = endpoint.host_str().unwrap_or_default(), "websocket connected");

        let (write, read) = stream.split();
        let (outbound_tx, outbound_rx) = mpsc::channel::<Outbound>(OUTBOUND_CAPACITY);
        let (signal_tx, signal_rx) = mpsc::channel::<TransportSignal>(SIGNAL_CAPACITY);
        let refs = RefCounter::default();

        let heartbeat = start_heartbeat_task(
            outbound_tx.clone(),
            refs.clone(),
            signal_tx.clone(),
            HeartbeatConfig::from(&self.config),
        );
        let session = Arc::new(Session::new(outbound_tx, refs, heartbeat));

        let writer_signals = signal_tx.clone();
        session.track(tokio::spawn(async move {
            driver::writer_loop(write, outbound_rx, writer_signals).await;
        }));
        let reader_session = Arc::clone(&session);
        session.track(tokio::spawn(async move {
            driver::reader_loop(read, reader_session, signal_tx).await;
        }));

        Ok(ControlLink {
            connection: WsConnection { session },
            signals: signal_rx,
        })
    }

    async fn open_subscription(
        &self,
        connection: &WsConnection,
        name: &str,
        filter: &FilterSpec,
        sink: EventSink,
    ) -> Result<WsSubscription, TransportError> {
        let session = &connection.session;
        let topic = ChannelMessage::topic_for(name);
        let reference = session.next_ref();
        let reply = session.expect_reply(&reference);
        session.route(&topic, sink);

        let join = ChannelMessage::join(
            topic.clone(),
            filter,
            self.config.access_token.as_deref(),
            reference.clone(),
        );
        if let Err(e) = session.send(join).await {
            session.forget_reply(&reference);
            session.unroute(&topic);
            return Err(e);
        }

        match tokio::time::timeout(self.join_timeout(), reply).await {
            Ok(Ok(reply)) if reply.ok => {
                debug!(topic = %topic, "joined");
                Ok(WsSubscription {
                    connection: connection.clone(),
                    topic,
                })
            }
            Ok(Ok(reply)) => {
                session.unroute(&topic);
                Err(TransportError::Rejected {
                    topic,
                    reason: reply.reason(),
                })
            }
            Ok(Err(_)) => {
                session.unroute(&topic);
                Err(TransportError::Closed)
            }
            Err(_) => {
                session.forget_reply(&reference);
                session.unroute(&topic);
                Err(TransportError::Timeout(format!("join reply on {topic}")))
            }
        }
    }

    async fn close_subscription(&self, subscription: WsSubscription) {
        let session = &subscription.connection.session;
        session.unroute(&subscription.topic);
        if session.is_closed() {
            return;
        }
        let leave = ChannelMessage::leave(subscription.topic.clone(), session.next_ref());
        if let Err(e) = session.send(leave).await {
            debug!(topic = %subscription.topic, error = %e, "leave not sent");
        }
    }

    async fn close_control(&self, connection: WsConnection) {
        connection.session.shutdown();
        debug!("websocket closed");
    }
}
