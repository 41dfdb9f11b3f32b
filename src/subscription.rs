//! Subscribe requests and acknowledgement parameters.

use serde::Serialize;
use serde_json::{Map, Value};
use std::{fmt, str::FromStr};

use crate::error::{Error, Result};

/// Data change that a type subscription listens for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TypeOperation {
    Insert,
    Update,
    Delete,
}

impl TypeOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            TypeOperation::Insert => "insert",
            TypeOperation::Update => "update",
            TypeOperation::Delete => "delete",
        }
    }
}

impl fmt::Display for TypeOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TypeOperation {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "insert" => Ok(TypeOperation::Insert),
            "update" => Ok(TypeOperation::Update),
            "delete" => Ok(TypeOperation::Delete),
            other => Err(Error::Validation(format!(
                "Operation must be one of 'insert', 'update', 'delete', got '{}'",
                other
            ))),
        }
    }
}

/// One event source to subscribe to.
#[derive(Clone, Debug, PartialEq)]
pub enum SubscribeTarget {
    /// A topic such as `/orders/new`. Set `persistent: true` in `parameters`
    /// for reliable delivery, and `subscriptionName` to reattach.
    Topic { name: String, parameters: Map<String, Value> },
    Source { name: String, parameters: Map<String, Value> },
    Service { name: String, event: String, parameters: Map<String, Value> },
    Type { name: String, operation: TypeOperation },
}

impl SubscribeTarget {
    pub fn topic(name: impl Into<String>) -> Self {
        SubscribeTarget::Topic {
            name: name.into(),
            parameters: Map::new(),
        }
    }

    /// A reliable topic subscription; `subscription_name` reattaches to an
    /// existing server-side subscription.
    pub fn reliable_topic(name: impl Into<String>, subscription_name: Option<&str>) -> Self {
        let mut parameters = Map::new();
        parameters.insert("persistent".into(), Value::Bool(true));
        if let Some(sub) = subscription_name {
            parameters.insert("subscriptionName".into(), Value::String(sub.to_string()));
        }
        SubscribeTarget::Topic {
            name: name.into(),
            parameters,
        }
    }

    pub fn source(name: impl Into<String>) -> Self {
        SubscribeTarget::Source {
            name: name.into(),
            parameters: Map::new(),
        }
    }

    pub fn service(name: impl Into<String>, event: impl Into<String>) -> Self {
        SubscribeTarget::Service {
            name: name.into(),
            event: event.into(),
            parameters: Map::new(),
        }
    }

    pub fn type_event(name: impl Into<String>, operation: TypeOperation) -> Self {
        SubscribeTarget::Type {
            name: name.into(),
            operation,
        }
    }

    /// Parses loosely typed subscribe arguments.
    ///
    /// Fails with [`Error::Validation`] for unknown resource kinds, for a
    /// `types` subscription without an `insert|update|delete` operation, and
    /// for a `services` subscription without an event name. Parameters given
    /// for `types` are ignored.
    pub fn parse(
        resource: &str,
        name: &str,
        operation: Option<&str>,
        parameters: Map<String, Value>,
    ) -> Result<Self> {
        match resource {
            "topics" => Ok(SubscribeTarget::Topic {
                name: name.to_string(),
                parameters,
            }),
            "sources" => Ok(SubscribeTarget::Source {
                name: name.to_string(),
                parameters,
            }),
            "services" => {
                let event = operation.ok_or_else(|| {
                    Error::Validation("Service subscriptions require an event name".into())
                })?;
                Ok(SubscribeTarget::Service {
                    name: name.to_string(),
                    event: event.to_string(),
                    parameters,
                })
            }
            "types" => {
                let operation = operation.ok_or_else(|| {
                    Error::Validation(
                        "Type subscriptions require one of 'insert', 'update', 'delete'".into(),
                    )
                })?;
                Ok(SubscribeTarget::Type {
                    name: name.to_string(),
                    operation: operation.parse()?,
                })
            }
            other => Err(Error::Validation(format!(
                "Only 'topics', 'sources', 'services' and 'types' support subscribe, got '{}'",
                other
            ))),
        }
    }

    /// The event path the server uses as request id for deliveries.
    pub fn path(&self) -> String {
        match self {
            SubscribeTarget::Topic { name, .. } => {
                if name.starts_with('/') {
                    format!("/topics{}", name)
                } else {
                    format!("/topics/{}", name)
                }
            }
            SubscribeTarget::Source { name, .. } => format!("/sources/{}", name),
            SubscribeTarget::Service { name, event, .. } => format!("/services/{}/{}", name, event),
            SubscribeTarget::Type { name, operation } => format!("/types/{}/{}", name, operation),
        }
    }

    pub fn parameters(&self) -> Map<String, Value> {
        match self {
            SubscribeTarget::Topic { parameters, .. }
            | SubscribeTarget::Source { parameters, .. }
            | SubscribeTarget::Service { parameters, .. } => parameters.clone(),
            SubscribeTarget::Type { .. } => Map::new(),
        }
    }
}

/// Confirms receipt of a reliably delivered event.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Acknowledgement {
    pub subscription_name: String,
    pub request_id: String,
    pub sequence_id: Value,
    pub partition_id: Value,
}

impl Acknowledgement {
    /// Builds an acknowledgement from a delivered event body.
    pub fn for_event(subscription_name: &str, request_id: &str, body: &Value) -> Self {
        Self {
            subscription_name: subscription_name.to_string(),
            request_id: request_id.to_string(),
            sequence_id: body.get("sequenceId").cloned().unwrap_or(Value::Null),
            partition_id: body.get("partitionId").cloned().unwrap_or(Value::Null),
        }
    }
}
