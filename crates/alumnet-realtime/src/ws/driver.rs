//! Socket reader/writer tasks and the per-connection session they share.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use alumnet_proto::messages::CONTROL_TOPIC;
use alumnet_proto::{ChannelMessage, ServerEvent};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, trace, warn};

use super::heartbeat::HeartbeatHandle;
use crate::error::TransportError;
use crate::registry::EventSink;
use crate::transport::TransportSignal;

pub(crate) type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Work for the writer task.
#[derive(Debug)]
pub(crate) enum Outbound {
    Frame(ChannelMessage),
    Close,
}

/// Monotonic message refs, shared by joins, leaves and heartbeats.
#[derive(Debug, Clone)]
pub(crate) struct RefCounter(Arc<AtomicU64>);

impl Default for RefCounter {
    fn default() -> Self {
        Self(Arc::new(AtomicU64::new(1)))
    }
}

impl RefCounter {
    pub(crate) fn next(&self) -> String {
        self.0.fetch_add(1, Ordering::SeqCst).to_string()
    }
}

/// Server answer to a request we sent.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Reply {
    pub(crate) ok: bool,
    pub(crate) response: Value,
}

impl Reply {
    pub(crate) fn reason(&self) -> String {
        self.response
            .get("reason")
            .and_then(Value::as_str)
            .map_or_else(|| self.response.to_string(), str::to_string)
    }
}

/// State of one open socket.
pub(crate) struct Session {
    outbound: mpsc::Sender<Outbound>,
    refs: RefCounter,
    heartbeat: HeartbeatHandle,
    routes: Mutex<HashMap<String, EventSink>>,
    pending: Mutex<HashMap<String, oneshot::Sender<Reply>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl Session {
    pub(crate) fn new(
        outbound: mpsc::Sender<Outbound>,
        refs: RefCounter,
        heartbeat: HeartbeatHandle,
    ) -> Self {
        Self {
            outbound,
            refs,
            heartbeat,
            routes: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            tasks: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub(crate) fn next_ref(&self) -> String {
        self.refs.next()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn track(&self, task: JoinHandle<()>) {
        self.tasks.lock().push(task);
    }

    pub(crate) fn route(&self, topic: &str, sink: EventSink) {
        self.routes.lock().insert(topic.to_string(), sink);
    }

    pub(crate) fn unroute(&self, topic: &str) {
        self.routes.lock().remove(topic);
    }

    pub(crate) fn expect_reply(&self, reference: &str) -> oneshot::Receiver<Reply> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(reference.to_string(), tx);
        rx
    }

    pub(crate) fn forget_reply(&self, reference: &str) {
        self.pending.lock().remove(reference);
    }

    pub(crate) async fn send(&self, frame: ChannelMessage) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        self.outbound
            .send(Outbound::Frame(frame))
            .await
            .map_err(|_| TransportError::Closed)
    }

    /// Route an inbound frame.
    pub(crate) fn dispatch(&self, event: ServerEvent) {
        match event {
            ServerEvent::Reply {
                topic,
                reference,
                ok,
                response,
            } => {
                if topic == CONTROL_TOPIC {
                    self.heartbeat.ack_received();
                }
                if let Some(waiter) = self.pending.lock().remove(&reference) {
                    let _ = waiter.send(Reply { ok, response });
                }
            }
            ServerEvent::Change { topic, record } => {
                let sink = self.routes.lock().get(&topic).cloned();
                match sink {
                    Some(sink) => {
                        sink.deliver(record);
                    }
                    None => trace!(topic = %topic, "change for unknown topic"),
                }
            }
            ServerEvent::ChannelClosed { topic } => {
                // Our own leaves unroute first, so a routed close is the server's.
                if let Some(sink) = self.routes.lock().remove(&topic) {
                    warn!(topic = %topic, "server closed topic");
                    sink.mark_closed();
                }
            }
            ServerEvent::ChannelError { topic, payload } => {
                warn!(topic = %topic, payload = %payload, "server reported topic error");
                if let Some(sink) = self.routes.lock().remove(&topic) {
                    sink.mark_closed();
                }
            }
            ServerEvent::System { topic, payload } => {
                debug!(topic = %topic, payload = %payload, "system notice");
            }
            ServerEvent::Other(message) => {
                trace!(topic = %message.topic, event = %message.event, "unhandled frame");
            }
        }
    }

    /// Mark the session dead and fail every outstanding request.
    pub(crate) fn fail_pending(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.heartbeat.stop();
        self.pending.lock().clear();
    }

    /// Close the socket and stop the background tasks.
    pub(crate) fn shutdown(&self) {
        self.fail_pending();
        self.routes.lock().clear();
        let _ = self.outbound.try_send(Outbound::Close);
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

/// Read frames until the socket ends, then report why.
pub(crate) async fn reader_loop(
    mut read: SplitStream<WsStream>,
    session: Arc<Session>,
    signals: mpsc::Sender<TransportSignal>,
) {
    let reason = loop {
        match read.next().await {
            Some(Ok(Message::Text(text))) => {
                match ChannelMessage::from_json(&text).and_then(ServerEvent::classify) {
                    Ok(event) => session.dispatch(event),
                    Err(e) => warn!(error = %e, "failed to parse realtime frame"),
                }
            }
            Some(Ok(Message::Close(_))) => break "server closed connection".to_string(),
            Some(Ok(_)) => {}
            Some(Err(e)) => break format!("websocket error: {e}"),
            None => break "connection closed".to_string(),
        }
    };

    session.fail_pending();
    debug!(reason = %reason, "reader stopped");
    let _ = signals.send(TransportSignal::Disconnected { reason }).await;
}

/// Write queued frames until closed.
pub(crate) async fn writer_loop(
    mut write: SplitSink<WsStream, Message>,
    mut outbound: mpsc::Receiver<Outbound>,
    signals: mpsc::Sender<TransportSignal>,
) {
    while let Some(item) = outbound.recv().await {
        match item {
            Outbound::Frame(frame) => {
                let json = match frame.to_json() {
                    Ok(json) => json,
                    Err(e) => {
                        warn!(error = %e, "dropping unencodable frame");
                        continue;
                    }
                };
                if let Err(e) = write.send(Message::Text(json)).await {
                    let _ = signals
                        .send(TransportSignal::Error(format!("write failed: {e}")))
                        .await;
                    return;
                }
            }
            Outbound::Close => {
                let _ = write.send(Message::Close(None)).await;
                let _ = write.close().await;
                return;
            }
        }
    }
}
