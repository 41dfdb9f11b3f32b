//! # Vantiq Client
//!
//! The public facade over [`Session`]. It maps resource names to REST paths
//! and exposes:
//! - Authentication (username/password or an externally issued token)
//! - Queries: `select`, `select_one`, `count`
//! - Writes: `insert`, `update`, `upsert`, `delete`, `delete_one`
//! - `publish` to topics, sources and services
//! - `execute` procedures, `evaluate` analytics models, `query` sources
//! - Event subscriptions over the session's socket, with acknowledgement of
//!   reliable deliveries
//! - Document `upload` and streaming `download`

use bytes::Bytes;
use futures::TryStreamExt;
use reqwest::header::{self, HeaderMap};
use serde_json::{Map, Value};
use std::path::Path;
use tokio::sync::broadcast;
use tracing::debug;

use crate::{
    config::Config,
    error::{Error, Result},
    event::{SubscriberEvent, SubscriptionEvent},
    multipart::Multipart,
    session::Session,
    subscription::{Acknowledgement, SubscribeTarget},
    transport::{ByteStream, ResponseBody},
    utils::{first_record, json_param, resource_path},
};

/// Resource kinds that accept `publish`.
pub const PUBLISHABLE_RESOURCES: &[&str] = &["sources", "topics", "services"];

/// Default upload destination.
pub const DOCUMENTS_PATH: &str = "/resources/documents";

/// A streamed download.
pub struct Download {
    pub status_code: u16,
    pub content_type: Option<String>,
    pub headers: HeaderMap,
    pub body: ByteStream,
}

impl Download {
    /// Drains the stream into memory.
    pub async fn bytes(mut self) -> Result<Bytes> {
        let mut buf = Vec::new();
        while let Some(chunk) = self.body.try_next().await? {
            buf.extend_from_slice(&chunk);
        }
        Ok(Bytes::from(buf))
    }
}

impl std::fmt::Debug for Download {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Download")
            .field("status_code", &self.status_code)
            .field("content_type", &self.content_type)
            .finish()
    }
}

/// The main Vantiq client struct.
#[derive(Debug)]
pub struct Vantiq {
    session: Session,
}

impl Vantiq {
    /// Creates a client for `server` with the default API version.
    pub fn new<U: Into<String>>(server: U) -> Result<Self> {
        Self::with_config(Config::new(server))
    }

    pub fn with_config(config: Config) -> Result<Self> {
        Ok(Self {
            session: Session::new(&config)?,
        })
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn is_authenticated(&self) -> bool {
        self.session.is_authenticated()
    }

    pub fn access_token(&self) -> Option<&str> {
        self.session.access_token()
    }

    pub fn set_access_token(&mut self, token: Option<String>) {
        self.session.set_access_token(token);
    }

    /// Authenticates with username/password. Returns `true` on success.
    pub async fn authenticate(&mut self, username: &str, password: &str) -> Result<bool> {
        self.session.authenticate(username, password).await?;
        Ok(true)
    }

    /// Queries `resource`. Empty `props` selects every property.
    pub async fn select(
        &self,
        resource: &str,
        props: &[&str],
        filter: Option<&Value>,
        sort: Option<&Value>,
    ) -> Result<Vec<Value>> {
        let mut query = Vec::new();
        if !props.is_empty() {
            query.push(("props", json_param(&Value::from(props.to_vec()))?));
        }
        if let Some(filter) = filter {
            query.push(("where", json_param(filter)?));
        }
        if let Some(sort) = sort {
            query.push(("sort", json_param(sort)?));
        }
        let resp = self.session.get(&resource_path(resource), &query).await?;
        Ok(match resp.body.into_json() {
            Value::Array(records) => records,
            Value::Null => Vec::new(),
            other => vec![other],
        })
    }

    /// Fetches one record by id.
    pub async fn select_one(&self, resource: &str, id: &str) -> Result<Value> {
        let path = format!("{}/{}", resource_path(resource), id);
        Ok(self.session.get(&path, &[]).await?.body.into_json())
    }

    /// Counts matching records, fetching only `_id` to keep the payload small.
    pub async fn count(&self, resource: &str, filter: Option<&Value>) -> Result<u64> {
        let mut query = vec![("count", "true".to_string())];
        if let Some(filter) = filter {
            query.push(("where", json_param(filter)?));
        }
        query.push(("props", json_param(&Value::from(vec!["_id"]))?));
        let resp = self.session.get(&resource_path(resource), &query).await?;
        resp.count
            .ok_or_else(|| Error::Protocol("Response is missing the x-total-count header".into()))
    }

    pub async fn insert(&self, resource: &str, object: &Value) -> Result<Option<Value>> {
        let resp = self
            .session
            .post(&resource_path(resource), &[], object.clone())
            .await?;
        Ok(first_record(resp.body.into_json()))
    }

    pub async fn update(&self, resource: &str, id: &str, object: &Value) -> Result<Option<Value>> {
        let path = format!("{}/{}", resource_path(resource), id);
        let resp = self.session.put(&path, &[], object.clone()).await?;
        Ok(first_record(resp.body.into_json()))
    }

    /// Inserts or updates by natural key. `_id` is removed before sending so
    /// it is never treated as an identity change.
    pub async fn upsert(&self, resource: &str, mut object: Value) -> Result<Option<Value>> {
        if let Some(map) = object.as_object_mut() {
            map.remove("_id");
        }
        let resp = self
            .session
            .post(&resource_path(resource), &[("upsert", "true".to_string())], object)
            .await?;
        Ok(first_record(resp.body.into_json()))
    }

    /// Deletes every record matching `filter`. True when the server answers 204.
    pub async fn delete(&self, resource: &str, filter: &Value) -> Result<bool> {
        let query = [("count", "true".to_string()), ("where", json_param(filter)?)];
        let resp = self.session.delete(&resource_path(resource), &query).await?;
        Ok(resp.status_code == 204)
    }

    pub async fn delete_one(&self, resource: &str, id: &str) -> Result<bool> {
        let path = format!("{}/{}", resource_path(resource), id);
        let resp = self.session.delete(&path, &[]).await?;
        Ok(resp.status_code == 204)
    }

    /// Publishes `payload` to a topic, source or service.
    pub async fn publish(&self, resource: &str, id: &str, payload: &Value) -> Result<bool> {
        if !PUBLISHABLE_RESOURCES.contains(&resource) {
            return Err(Error::Validation(
                "Only \"sources\", \"services\" and \"topics\" support publish".into(),
            ));
        }
        let path = format!("/resources/{}/{}", resource, id);
        match self.session.post(&path, &[], payload.clone()).await {
            Ok(resp) => Ok(resp.status_code == 200),
            Err(Error::Http { status_code: 404, .. })
                if resource == "topics" && !id.starts_with('/') =>
            {
                Err(Error::IllegalTopicName)
            }
            Err(e) => Err(e),
        }
    }

    pub async fn execute(&self, procedure: &str, params: &Value) -> Result<Value> {
        let path = format!("/resources/procedures/{}", procedure);
        Ok(self.session.post(&path, &[], params.clone()).await?.body.into_json())
    }

    pub async fn evaluate(&self, model: &str, params: &Value) -> Result<Value> {
        let path = format!("/resources/analyticsmodels/{}", model);
        Ok(self.session.post(&path, &[], params.clone()).await?.body.into_json())
    }

    pub async fn query(&self, source: &str, params: &Value) -> Result<Value> {
        let path = format!("/resources/sources/{}/query", source);
        Ok(self.session.post(&path, &[], params.clone()).await?.body.into_json())
    }

    /// Subscribes `callback` to the events of `target`.
    pub async fn subscribe(
        &mut self,
        target: SubscribeTarget,
        callback: impl Fn(SubscriptionEvent) + Send + Sync + 'static,
    ) -> Result<()> {
        let path = target.path();
        debug!(%path, "subscribing");
        self.session
            .subscribe(&path, target.parameters(), callback)
            .await
    }

    /// Subscribes from loosely typed arguments; see [`SubscribeTarget::parse`].
    pub async fn subscribe_resource(
        &mut self,
        resource: &str,
        name: &str,
        operation: Option<&str>,
        parameters: Map<String, Value>,
        callback: impl Fn(SubscriptionEvent) + Send + Sync + 'static,
    ) -> Result<()> {
        let target = SubscribeTarget::parse(resource, name, operation, parameters)?;
        self.subscribe(target, callback).await
    }

    /// Acknowledges a reliable delivery using the `sequenceId` and
    /// `partitionId` found in its body.
    pub async fn acknowledge(
        &self,
        subscription_name: &str,
        request_id: &str,
        body: &Value,
    ) -> Result<()> {
        let ack = Acknowledgement::for_event(subscription_name, request_id, body);
        self.session
            .acknowledge(
                &ack.request_id,
                &ack.subscription_name,
                ack.sequence_id,
                ack.partition_id,
            )
            .await
    }

    pub async fn unsubscribe_all(&mut self) {
        self.session.unsubscribe_all().await;
    }

    pub fn events(&self) -> broadcast::Receiver<SubscriberEvent> {
        self.session.events()
    }

    /// Registers a listener for subscriber lifecycle events.
    pub fn on(&self, callback: impl Fn(SubscriberEvent) + Send + Sync + 'static) {
        self.session.on(callback);
    }

    /// Uploads a local file as a document.
    ///
    /// A cheap count query runs first so an expired session fails before the
    /// file is streamed.
    pub async fn upload(
        &self,
        file_name: impl AsRef<Path>,
        content_type: &str,
        document_path: &str,
        resource_path: Option<&str>,
    ) -> Result<Value> {
        self.count("types", None).await?;
        let part = Multipart::new(file_name.as_ref(), content_type, document_path);
        let path = resource_path.unwrap_or(DOCUMENTS_PATH);
        let resp = self.session.upload(path, part).await?;
        Ok(first_record(resp.body.into_json()).unwrap_or(Value::Null))
    }

    /// Streams the content at `path` (e.g. a document's `content` URL path).
    pub async fn download(&self, path: &str) -> Result<Download> {
        let resp = self.session.download(path).await?;
        let content_type = resp
            .headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = match resp.body {
            ResponseBody::Stream(stream) => stream,
            other => {
                return Err(Error::Protocol(format!(
                    "Expected a streamed response, got {:?}",
                    other
                )))
            }
        };
        Ok(Download {
            status_code: resp.status_code,
            content_type,
            headers: resp.headers,
            body,
        })
    }
}
