//! Channel frames exchanged with the backend.
//!
//! Every frame is one JSON object with a topic, an event name, a payload and
//! optional `ref`/`join_ref` correlation ids. Topics for named subscriptions
//! are prefixed with `realtime:`; the connection-level heartbeat travels on the
//! reserved `phoenix` topic.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::change::ChangeRecord;
use crate::error::ProtoError;
use crate::filter::FilterSpec;

/// Topic reserved for connection-level traffic.
pub const CONTROL_TOPIC: &str = "phoenix";

/// Prefix applied to subscription names to form topics.
pub const TOPIC_PREFIX: &str = "realtime:";

/// Event names used on the wire.
pub mod events {
    /// Join a topic.
    pub const JOIN: &str = "phx_join";
    /// Leave a topic.
    pub const LEAVE: &str = "phx_leave";
    /// Reply to a request carrying a `ref`.
    pub const REPLY: &str = "phx_reply";
    /// Server closed a topic.
    pub const CLOSE: &str = "phx_close";
    /// Server reported a topic error.
    pub const ERROR: &str = "phx_error";
    /// Keepalive.
    pub const HEARTBEAT: &str = "heartbeat";
    /// Row change.
    pub const POSTGRES_CHANGES: &str = "postgres_changes";
    /// Server status notice.
    pub const SYSTEM: &str = "system";
    /// Refresh the access token on a joined topic.
    pub const ACCESS_TOKEN: &str = "access_token";
}

/// A single frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelMessage {
    /// Topic the frame belongs to.
    pub topic: String,
    /// Event name.
    pub event: String,
    /// Event payload.
    #[serde(default)]
    pub payload: Value,
    /// Request correlation id.
    #[serde(rename = "ref", default)]
    pub reference: Option<String>,
    /// Correlation id of the join this frame belongs to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub join_ref: Option<String>,
}

impl ChannelMessage {
    /// Topic for a subscription name.
    #[must_use]
    pub fn topic_for(name: &str) -> String {
        format!("{TOPIC_PREFIX}{name}")
    }

    /// Keepalive on the control topic.
    #[must_use]
    pub fn heartbeat(reference: impl Into<String>) -> Self {
        Self {
            topic: CONTROL_TOPIC.to_string(),
            event: events::HEARTBEAT.to_string(),
            payload: json!({}),
            reference: Some(reference.into()),
            join_ref: None,
        }
    }

    /// Join `topic` asking for the changes described by `filter`.
    #[must_use]
    pub fn join(
        topic: impl Into<String>,
        filter: &FilterSpec,
        access_token: Option<&str>,
        reference: impl Into<String>,
    ) -> Self {
        let reference = reference.into();
        let mut payload = json!({
            "config": {
                "broadcast": { "self": false, "ack": false },
                "presence": { "key": "" },
                "postgres_changes": [filter.to_join_config()],
            }
        });
        if let (Some(token), Some(map)) = (access_token, payload.as_object_mut()) {
            map.insert("access_token".to_string(), Value::String(token.to_string()));
        }
        Self {
            topic: topic.into(),
            event: events::JOIN.to_string(),
            payload,
            reference: Some(reference.clone()),
            join_ref: Some(reference),
        }
    }

    /// Leave `topic`.
    #[must_use]
    pub fn leave(topic: impl Into<String>, reference: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            event: events::LEAVE.to_string(),
            payload: json!({}),
            reference: Some(reference.into()),
            join_ref: None,
        }
    }

    /// Push a refreshed access token to a joined topic.
    #[must_use]
    pub fn access_token(topic: impl Into<String>, token: &str, reference: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            event: events::ACCESS_TOKEN.to_string(),
            payload: json!({ "access_token": token }),
            reference: Some(reference.into()),
            join_ref: None,
        }
    }

    /// Serialize to JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_json(&self) -> Result<String, ProtoError> {
        serde_json::to_string(self).map_err(|e| ProtoError::Encoding(e.to_string()))
    }

    /// Deserialize from JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if the text is not a valid frame.
    pub fn from_json(json: &str) -> Result<Self, ProtoError> {
        serde_json::from_str(json).map_err(|e| ProtoError::Decoding(e.to_string()))
    }
}

/// Inbound frame, classified.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    /// Reply to a request we sent.
    Reply {
        /// Topic of the request.
        topic: String,
        /// Correlation id.
        reference: String,
        /// Whether the server accepted the request.
        ok: bool,
        /// Server response body.
        response: Value,
    },
    /// A row change for a joined topic.
    Change {
        /// Topic the change arrived on.
        topic: String,
        /// The change.
        record: ChangeRecord,
    },
    /// The server closed a topic.
    ChannelClosed {
        /// Closed topic.
        topic: String,
    },
    /// The server reported an error on a topic.
    ChannelError {
        /// Failing topic.
        topic: String,
        /// Error payload.
        payload: Value,
    },
    /// Status notice.
    System {
        /// Topic the notice refers to.
        topic: String,
        /// Notice payload.
        payload: Value,
    },
    /// Anything else (presence, broadcast, ...).
    Other(ChannelMessage),
}

impl ServerEvent {
    /// Classify a frame.
    ///
    /// # Errors
    ///
    /// Returns an error if a reply lacks its `ref` or a change payload does
    /// not decode.
    pub fn classify(message: ChannelMessage) -> Result<Self, ProtoError> {
        match message.event.as_str() {
            events::REPLY => {
                let reference = message.reference.ok_or(ProtoError::MissingField("ref"))?;
                let ok = message.payload.get("status").and_then(Value::as_str) == Some("ok");
                let response = message
                    .payload
                    .get("response")
                    .cloned()
                    .unwrap_or(Value::Null);
                Ok(Self::Reply {
                    topic: message.topic,
                    reference,
                    ok,
                    response,
                })
            }
            events::POSTGRES_CHANGES => {
                let data = message
                    .payload
                    .get("data")
                    .cloned()
                    .ok_or(ProtoError::MissingField("data"))?;
                let record = serde_json::from_value(data)
                    .map_err(|e| ProtoError::Decoding(format!("change payload: {e}")))?;
                Ok(Self::Change {
                    topic: message.topic,
                    record,
                })
            }
            events::CLOSE => Ok(Self::ChannelClosed {
                topic: message.topic,
            }),
            events::ERROR => Ok(Self::ChannelError {
                topic: message.topic,
                payload: message.payload,
            }),
            events::SYSTEM => Ok(Self::System {
                topic: message.topic,
                payload: message.payload,
            }),
            _ => Ok(Self::Other(message)),
        }
    }
}
