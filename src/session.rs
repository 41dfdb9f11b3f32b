//! Authentication state, verb-level requests and the subscriber lifecycle.

use reqwest::Method;
use serde_json::{Map, Value};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::{
    config::Config,
    error::{Error, Result},
    event::{SubscriberEvent, SubscriptionEvent},
    multipart::Multipart,
    subscriber::{EventHandler, Subscriber},
    subscription::Acknowledgement,
    transport::{Credentials, Exchange, Response, ResponseBody, Transport},
    utils::{api_path, websocket_url},
};

/// Endpoint exchanging Basic credentials for an access token.
pub const AUTHENTICATE_PATH: &str = "/authenticate";

/// A session with one server. `is_authenticated()` is true exactly when an
/// access token is held.
#[derive(Debug)]
pub struct Session {
    api_version: u32,
    transport: Transport,
    access_token: Option<String>,
    subscriber: Option<Subscriber>,
    event_sender: broadcast::Sender<SubscriberEvent>,
}

impl Session {
    pub fn new(config: &Config) -> Result<Self> {
        let (tx, _) = broadcast::channel(config.event_capacity);
        Ok(Self {
            api_version: config.api_version,
            transport: Transport::new(config)?,
            access_token: None,
            subscriber: None,
            event_sender: tx,
        })
    }

    pub fn server(&self) -> &url::Url {
        self.transport.server()
    }

    pub fn api_version(&self) -> u32 {
        self.api_version
    }

    pub fn is_authenticated(&self) -> bool {
        self.access_token.is_some()
    }

    pub fn access_token(&self) -> Option<&str> {
        self.access_token.as_deref()
    }

    /// Installs an externally issued token; `None` logs the session out.
    pub fn set_access_token(&mut self, token: Option<String>) {
        self.access_token = token;
    }

    /// Exchanges username/password for an access token.
    ///
    /// Any stored token is dropped first, so on failure the session is left
    /// unauthenticated.
    pub async fn authenticate(&mut self, username: &str, password: &str) -> Result<Response> {
        self.access_token = None;
        let exchange = Exchange::new(Method::GET, AUTHENTICATE_PATH).credentials(Credentials {
            username: username.to_string(),
            password: password.to_string(),
        });
        let mut resp = match self.transport.request(exchange).await {
            Ok(resp) => resp,
            Err(Error::Http { status_code, body }) => {
                warn!(status = status_code, "authentication rejected");
                return Err(Error::AuthenticationFailed { status_code, body });
            }
            Err(e) => return Err(e),
        };

        let token = match &resp.body {
            ResponseBody::Json(body) => body
                .get("accessToken")
                .and_then(Value::as_str)
                .map(str::to_string),
            _ => None,
        };
        match token {
            Some(token) => {
                info!(server = %self.server(), "authenticated");
                self.access_token = Some(token);
                Ok(resp)
            }
            None => {
                let body = std::mem::replace(&mut resp.body, ResponseBody::Empty).into_json();
                Err(Error::AuthenticationFailed {
                    status_code: resp.status_code,
                    body,
                })
            }
        }
    }

    fn authorized(&self, method: Method, path: &str) -> Result<Exchange> {
        let token = self.access_token.clone().ok_or(Error::NotAuthenticated)?;
        Ok(Exchange::new(method, api_path(self.api_version, path)).token(Some(token)))
    }

    pub async fn get(&self, path: &str, query: &[(&str, String)]) -> Result<Response> {
        let exchange = self.authorized(Method::GET, path)?.query(query.iter().cloned());
        self.transport.request(exchange).await
    }

    pub async fn post(&self, path: &str, query: &[(&str, String)], body: Value) -> Result<Response> {
        let exchange = self
            .authorized(Method::POST, path)?
            .query(query.iter().cloned())
            .json(body);
        self.transport.request(exchange).await
    }

    pub async fn put(&self, path: &str, query: &[(&str, String)], body: Value) -> Result<Response> {
        let exchange = self
            .authorized(Method::PUT, path)?
            .query(query.iter().cloned())
            .json(body);
        self.transport.request(exchange).await
    }

    pub async fn delete(&self, path: &str, query: &[(&str, String)]) -> Result<Response> {
        let exchange = self.authorized(Method::DELETE, path)?.query(query.iter().cloned());
        self.transport.request(exchange).await
    }

    /// Streams `part` as a multipart POST to `path` under the API root.
    pub async fn upload(&self, path: &str, part: Multipart) -> Result<Response> {
        let exchange = self.authorized(Method::POST, path)?.multipart(part);
        self.transport.request(exchange).await
    }

    /// GETs `path` (server-relative, no API prefix) without buffering the
    /// response body.
    pub async fn download(&self, path: &str) -> Result<Response> {
        let token = self.access_token.clone().ok_or(Error::NotAuthenticated)?;
        let exchange = Exchange::new(Method::GET, path).token(Some(token)).streaming();
        self.transport.request(exchange).await
    }

    /// Registers `callback` for `path`, opening the subscriber socket first if
    /// there is none or the previous one has ended.
    pub async fn subscribe(
        &mut self,
        path: &str,
        parameters: Map<String, Value>,
        callback: impl Fn(SubscriptionEvent) + Send + Sync + 'static,
    ) -> Result<()> {
        let token = self.access_token.clone().ok_or(Error::NotAuthenticated)?;

        let ended = self
            .subscriber
            .as_ref()
            .map(|s| !s.is_active())
            .unwrap_or(false);
        if ended {
            if let Some(old) = self.subscriber.take() {
                debug!(state = ?old.state(), "discarding ended subscriber");
                old.close().await;
            }
        }
        if self.subscriber.is_none() {
            let url = websocket_url(self.server(), self.api_version)?;
            let subscriber = Subscriber::connect(&url, &token, self.event_sender.clone()).await?;
            self.subscriber = Some(subscriber);
        }

        let handler: EventHandler = Arc::new(callback);
        match &self.subscriber {
            Some(subscriber) => subscriber.subscribe(&token, path, parameters, handler).await,
            None => Err(Error::NotConnected),
        }
    }

    pub async fn acknowledge(
        &self,
        request_id: &str,
        subscription_name: &str,
        sequence_id: Value,
        partition_id: Value,
    ) -> Result<()> {
        let token = self.access_token.as_deref().ok_or(Error::NotAuthenticated)?;
        let subscriber = self.subscriber.as_ref().ok_or(Error::NotConnected)?;
        let ack = Acknowledgement {
            subscription_name: subscription_name.to_string(),
            request_id: request_id.to_string(),
            sequence_id,
            partition_id,
        };
        subscriber.acknowledge(token, &ack).await
    }

    /// Closes the subscriber socket. Persistent subscriptions stay registered
    /// on the server and can be reattached by subscription name.
    pub async fn unsubscribe_all(&mut self) {
        if let Some(subscriber) = self.subscriber.take() {
            subscriber.close().await;
        }
    }

    pub fn subscriber(&self) -> Option<&Subscriber> {
        self.subscriber.as_ref()
    }

    /// Receiver for subscriber lifecycle events.
    pub fn events(&self) -> broadcast::Receiver<SubscriberEvent> {
        self.event_sender.subscribe()
    }

    /// Registers a listener for subscriber lifecycle events.
    pub fn on(&self, callback: impl Fn(SubscriberEvent) + Send + Sync + 'static) {
        let mut rx = self.event_sender.subscribe();
        tokio::spawn(async move {
            while let Ok(event) = rx.recv().await {
                callback(event);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> Session {
        Session::new(&Config::new("https://mock.vantiq.com")).unwrap()
    }

    #[test]
    fn test_token_drives_authenticated_flag() {
        let mut s = session();
        assert!(!s.is_authenticated());
        s.set_access_token(Some("234592dadf23412".into()));
        assert!(s.is_authenticated());
        assert_eq!(s.access_token(), Some("234592dadf23412"));
        s.set_access_token(None);
        assert!(!s.is_authenticated());
    }

    #[tokio::test]
    async fn test_verbs_refuse_without_token() {
        let s = session();
        assert!(matches!(s.get("/resources/types", &[]).await, Err(Error::NotAuthenticated)));
        assert!(matches!(
            s.post("/resources/types", &[], Value::Null).await,
            Err(Error::NotAuthenticated)
        ));
        assert!(matches!(
            s.put("/resources/types", &[], Value::Null).await,
            Err(Error::NotAuthenticated)
        ));
        assert!(matches!(s.delete("/resources/types", &[]).await, Err(Error::NotAuthenticated)));
        assert!(matches!(s.download("/docs/a.txt").await, Err(Error::NotAuthenticated)));
    }

    #[tokio::test]
    async fn test_subscribe_refuses_without_token() {
        let mut s = session();
        let result = s.subscribe("/topics/a", Map::new(), |_| {}).await;
        assert!(matches!(result, Err(Error::NotAuthenticated)));
        assert!(s.subscriber().is_none());
    }

    #[tokio::test]
    async fn test_acknowledge_without_subscriber() {
        let mut s = session();
        s.set_access_token(Some("tok".into()));
        let result = s
            .acknowledge("/topics/a", "sub-1", Value::from(1), Value::from(0))
            .await;
        assert!(matches!(result, Err(Error::NotConnected)));
    }

    #[tokio::test]
    async fn test_unsubscribe_all_without_subscriber() {
        let mut s = session();
        s.unsubscribe_all().await;
        assert!(s.subscriber().is_none());
    }
}
