//! Event definitions for the Vantiq client.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Header naming the subscription a delivery belongs to.
pub const REQUEST_ID_HEADER: &str = "X-Request-Id";

/// A message pushed by the server over the subscriber socket.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionEvent {
    #[serde(default)]
    pub headers: Map<String, Value>,
    #[serde(default)]
    pub status: u16,
    #[serde(default, rename = "contentType", skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(default)]
    pub body: Value,
}

impl SubscriptionEvent {
    /// The subscription path this delivery was addressed to.
    pub fn request_id(&self) -> Option<&str> {
        self.headers.get(REQUEST_ID_HEADER).and_then(Value::as_str)
    }

    /// The published payload.
    pub fn value(&self) -> Option<&Value> {
        self.body.get("value")
    }

    /// Server-issued identifier of a persistent subscription.
    pub fn subscription_name(&self) -> Option<&str> {
        self.body
            .get("subscriptionName")
            .or_else(|| self.body.get("subscriptionId"))
            .and_then(Value::as_str)
    }

    pub fn sequence_id(&self) -> Option<&Value> {
        self.body.get("sequenceId")
    }

    pub fn partition_id(&self) -> Option<&Value> {
        self.body.get("partitionId")
    }
}

/// Connection lifecycle notifications emitted by the subscriber.
#[derive(Clone, Debug)]
pub enum SubscriberEvent {
    /// The socket was opened and the access token validated.
    Connected,
    /// The client closed the socket (`unsubscribe_all`).
    Closed,
    /// The server closed the socket.
    Disconnected,
    /// The socket failed after it became active.
    Error { time: u64, msg: String },
}

impl SubscriberEvent {
    pub(crate) fn error(msg: impl Into<String>) -> Self {
        SubscriberEvent::Error {
            time: chrono::Utc::now().timestamp_millis() as u64,
            msg: msg.into(),
        }
    }
}

impl fmt::Display for SubscriberEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubscriberEvent::Connected => write!(f, "Connected"),
            SubscriberEvent::Closed => write!(f, "Closed"),
            SubscriberEvent::Disconnected => write!(f, "Disconnected"),
            SubscriberEvent::Error { time, msg } => write!(f, "Error at {}: {}", time, msg),
        }
    }
}
