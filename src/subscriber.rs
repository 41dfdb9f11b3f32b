//! # Subscriber
//!
//! One WebSocket connection per session, multiplexing every event
//! subscription. The connection moves through
//! `Disconnected → Connecting → AwaitingAuth → Active → Closed`:
//!
//! 1. The socket is opened and a `validate` control message carrying the
//!    access token is sent.
//! 2. The first inbound message is the validation answer. Anything other than
//!    status 200 fails the connect attempt.
//! 3. Once active, a background task owns the socket. Inbound deliveries are
//!    dispatched in arrival order to the callback registered under their
//!    `X-Request-Id`; outbound subscribe/acknowledge messages arrive from the
//!    handle over an mpsc channel.
//!
//! Nothing reconnects automatically. Closing the socket does not remove
//! persistent subscriptions on the server.

use futures::{SinkExt, StreamExt};
use serde::Serialize;
use serde_json::{Map, Value};
use std::{collections::HashMap, fmt, sync::Arc};
use tokio::{
    net::TcpStream,
    sync::{broadcast, mpsc, watch, Mutex},
    task::JoinHandle,
};
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message, MaybeTlsStream};
use tracing::{debug, error, info, warn};
use url::Url;

use crate::{
    error::{Error, Result},
    event::{SubscriberEvent, SubscriptionEvent},
    subscription::Acknowledgement,
};

type WebSocketStream = tokio_tungstenite::WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Callback invoked for every delivery on a subscription path.
pub type EventHandler = Arc<dyn Fn(SubscriptionEvent) + Send + Sync>;

/// Connection state of the subscriber socket.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubscriberState {
    Disconnected,
    Connecting,
    /// Socket open, `validate` sent, waiting for the answer.
    AwaitingAuth,
    Active,
    Closed,
}

/// Operation of a control message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Op {
    Validate,
    Subscribe,
    Acknowledge,
}

/// JSON envelope sent to the server over the socket.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlMessage {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    pub op: Op,
    pub resource_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub object: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Value>,
}

impl ControlMessage {
    pub fn validate(access_token: &str) -> Self {
        Self {
            access_token: None,
            op: Op::Validate,
            resource_name: "system.credentials".into(),
            resource_id: None,
            object: Some(Value::String(access_token.to_string())),
            parameters: None,
        }
    }

    /// `parameters` must already carry `requestId`.
    pub fn subscribe(access_token: &str, path: &str, parameters: Map<String, Value>) -> Self {
        Self {
            access_token: Some(access_token.to_string()),
            op: Op::Subscribe,
            resource_name: "events".into(),
            resource_id: Some(path.to_string()),
            object: None,
            parameters: Some(Value::Object(parameters)),
        }
    }

    pub fn acknowledge(access_token: &str, ack: &Acknowledgement) -> Result<Self> {
        Ok(Self {
            access_token: Some(access_token.to_string()),
            op: Op::Acknowledge,
            resource_name: "events".into(),
            resource_id: Some(ack.request_id.clone()),
            object: None,
            parameters: Some(serde_json::to_value(ack)?),
        })
    }
}

/// True when subscribe parameters name a previously issued persistent
/// subscription, which allows replacing the callback for its path.
pub fn is_reattachment(parameters: &Map<String, Value>) -> bool {
    ["subscriptionName", "subscriptionId"]
        .iter()
        .any(|key| parameters.get(*key).and_then(Value::as_str).is_some())
}

/// Path-keyed callback registry. At most one callback per path.
#[derive(Default)]
pub struct CallbackRegistry {
    callbacks: HashMap<String, EventHandler>,
}

impl CallbackRegistry {
    /// Returns the callback a reattachment replaced, if any.
    pub fn register(
        &mut self,
        path: &str,
        handler: EventHandler,
        parameters: &Map<String, Value>,
    ) -> Result<Option<EventHandler>> {
        if self.callbacks.contains_key(path) && !is_reattachment(parameters) {
            return Err(Error::Validation(format!(
                "Callback already registered for event: {}",
                path
            )));
        }
        Ok(self.callbacks.insert(path.to_string(), handler))
    }

    /// Undoes a `register`: puts back the replaced callback, or drops the
    /// path when there was none.
    pub fn restore(&mut self, path: &str, previous: Option<EventHandler>) {
        match previous {
            Some(handler) => {
                self.callbacks.insert(path.to_string(), handler);
            }
            None => {
                self.callbacks.remove(path);
            }
        }
    }

    pub fn get(&self, request_id: &str) -> Option<EventHandler> {
        self.callbacks.get(request_id).cloned()
    }

    pub fn remove(&mut self, path: &str) -> Option<EventHandler> {
        self.callbacks.remove(path)
    }

    pub fn contains(&self, path: &str) -> bool {
        self.callbacks.contains_key(path)
    }

    pub fn len(&self) -> usize {
        self.callbacks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.callbacks.is_empty()
    }

    pub fn clear(&mut self) {
        self.callbacks.clear();
    }
}

impl fmt::Debug for CallbackRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.callbacks.keys()).finish()
    }
}

/// Messages from the handle to the connection task.
enum Command {
    Send(ControlMessage),
    Close,
}

/// How the connection task ended.
enum Ending {
    Closed,
    Disconnected,
    Failed(String),
}

/// Handle to the subscriber socket.
pub struct Subscriber {
    cmd_tx: mpsc::Sender<Command>,
    state_rx: watch::Receiver<SubscriberState>,
    callbacks: Arc<Mutex<CallbackRegistry>>,
    task: JoinHandle<()>,
}

impl Subscriber {
    /// Opens the socket and validates `access_token`. Returns once the
    /// connection is active.
    pub async fn connect(
        url: &Url,
        access_token: &str,
        events: broadcast::Sender<SubscriberEvent>,
    ) -> Result<Self> {
        let (state_tx, state_rx) = watch::channel(SubscriberState::Disconnected);

        let _ = state_tx.send(SubscriberState::Connecting);
        info!(%url, "opening subscriber socket");
        let (mut ws, _) = connect_async(url.as_str()).await?;

        let validate = serde_json::to_string(&ControlMessage::validate(access_token))?;
        ws.send(Message::Text(validate.into())).await?;
        let _ = state_tx.send(SubscriberState::AwaitingAuth);

        if let Err(e) = await_validation(&mut ws).await {
            warn!(error = %e, "subscriber session validation failed");
            let _ = ws.close(None).await;
            let _ = state_tx.send(SubscriberState::Closed);
            return Err(e);
        }
        let _ = state_tx.send(SubscriberState::Active);
        info!("subscriber session validated");
        let _ = events.send(SubscriberEvent::Connected);

        let (cmd_tx, cmd_rx) = mpsc::channel(100);
        let callbacks = Arc::new(Mutex::new(CallbackRegistry::default()));
        let task = tokio::spawn(connection_task(
            ws,
            cmd_rx,
            callbacks.clone(),
            state_tx,
            events,
        ));

        Ok(Self {
            cmd_tx,
            state_rx,
            callbacks,
            task,
        })
    }

    pub fn state(&self) -> SubscriberState {
        *self.state_rx.borrow()
    }

    pub fn is_active(&self) -> bool {
        self.state() == SubscriberState::Active
    }

    /// Receiver for state changes.
    pub fn state_receiver(&self) -> watch::Receiver<SubscriberState> {
        self.state_rx.clone()
    }

    /// Registers `handler` for `path` and asks the server to deliver its
    /// events. `requestId` is added to `parameters`.
    pub async fn subscribe(
        &self,
        access_token: &str,
        path: &str,
        mut parameters: Map<String, Value>,
        handler: EventHandler,
    ) -> Result<()> {
        if !self.is_active() {
            return Err(Error::NotConnected);
        }
        let previous = self
            .callbacks
            .lock()
            .await
            .register(path, handler, &parameters)?;

        parameters.insert("requestId".into(), Value::String(path.to_string()));
        let msg = ControlMessage::subscribe(access_token, path, parameters);
        if let Err(e) = self.send(msg).await {
            self.callbacks.lock().await.restore(path, previous);
            return Err(e);
        }
        debug!(%path, "subscription requested");
        Ok(())
    }

    /// Confirms receipt of a reliable delivery so the server stops
    /// redelivering it.
    pub async fn acknowledge(&self, access_token: &str, ack: &Acknowledgement) -> Result<()> {
        if !self.is_active() {
            return Err(Error::NotConnected);
        }
        self.send(ControlMessage::acknowledge(access_token, ack)?)
            .await
    }

    /// Paths with a registered callback.
    pub async fn subscriptions(&self) -> Vec<String> {
        let registry = self.callbacks.lock().await;
        registry.callbacks.keys().cloned().collect()
    }

    /// Closes the socket and drops every callback. Deliveries already read
    /// from the socket may still be dispatched.
    pub async fn close(self) {
        let _ = self.cmd_tx.send(Command::Close).await;
        let _ = self.task.await;
    }

    async fn send(&self, msg: ControlMessage) -> Result<()> {
        self.cmd_tx
            .send(Command::Send(msg))
            .await
            .map_err(|_| Error::NotConnected)
    }
}

impl fmt::Debug for Subscriber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscriber")
            .field("state", &self.state())
            .finish()
    }
}

/// Reads the validation answer, the first message after `validate`.
async fn await_validation(ws: &mut WebSocketStream) -> Result<()> {
    loop {
        match ws.next().await {
            Some(Ok(Message::Text(text))) => return check_validation(text.as_str()),
            Some(Ok(Message::Binary(data))) => {
                return check_validation(&String::from_utf8_lossy(&data))
            }
            Some(Ok(Message::Ping(payload))) => ws.send(Message::Pong(payload)).await?,
            Some(Ok(Message::Close(_))) | None => {
                return Err(Error::Protocol(
                    "Socket closed before the session was validated".into(),
                ))
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => return Err(e.into()),
        }
    }
}

fn check_validation(text: &str) -> Result<()> {
    let resp: Value = serde_json::from_str(text)
        .map_err(|e| Error::Protocol(format!("Malformed validation response: {}", e)))?;
    if resp.get("status").and_then(Value::as_u64) == Some(200) {
        Ok(())
    } else {
        Err(Error::Protocol(format!(
            "Error establishing authenticated WebSocket session: {}",
            resp
        )))
    }
}

/// Parses one delivery and hands it to the callback for its request id.
async fn dispatch(callbacks: &Mutex<CallbackRegistry>, text: &str) {
    let event: SubscriptionEvent = match serde_json::from_str(text) {
        Ok(event) => event,
        Err(e) => {
            warn!(error = %e, "failed to parse delivery");
            return;
        }
    };
    let handler = match event.request_id() {
        Some(id) => callbacks.lock().await.get(id),
        None => None,
    };
    match handler {
        Some(handler) => handler(event),
        None => debug!(request_id = ?event.request_id(), "dropping delivery without callback"),
    }
}

async fn connection_task(
    mut ws: WebSocketStream,
    mut cmd_rx: mpsc::Receiver<Command>,
    callbacks: Arc<Mutex<CallbackRegistry>>,
    state_tx: watch::Sender<SubscriberState>,
    events: broadcast::Sender<SubscriberEvent>,
) {
    let ending = loop {
        tokio::select! {
            cmd = cmd_rx.recv() => match cmd {
                Some(Command::Send(msg)) => {
                    let text = match serde_json::to_string(&msg) {
                        Ok(text) => text,
                        Err(e) => {
                            warn!(error = %e, "failed to encode control message");
                            continue;
                        }
                    };
                    debug!(op = ?msg.op, resource_id = ?msg.resource_id, "sending control message");
                    if let Err(e) = ws.send(Message::Text(text.into())).await {
                        break Ending::Failed(e.to_string());
                    }
                }
                Some(Command::Close) | None => {
                    let _ = ws.close(None).await;
                    break Ending::Closed;
                }
            },
            frame = ws.next() => match frame {
                Some(Ok(Message::Text(text))) => dispatch(&callbacks, text.as_str()).await,
                Some(Ok(Message::Binary(data))) => {
                    dispatch(&callbacks, &String::from_utf8_lossy(&data)).await
                }
                Some(Ok(Message::Ping(payload))) => {
                    if let Err(e) = ws.send(Message::Pong(payload)).await {
                        break Ending::Failed(e.to_string());
                    }
                }
                Some(Ok(Message::Close(_))) | None => break Ending::Disconnected,
                Some(Ok(_)) => {}
                Some(Err(e)) => break Ending::Failed(e.to_string()),
            },
        }
    };

    callbacks.lock().await.clear();
    let _ = state_tx.send(SubscriberState::Closed);
    match ending {
        Ending::Closed => {
            info!("subscriber socket closed");
            let _ = events.send(SubscriberEvent::Closed);
        }
        Ending::Disconnected => {
            warn!("subscriber socket closed by server");
            let _ = events.send(SubscriberEvent::Disconnected);
        }
        Ending::Failed(msg) => {
            error!(error = %msg, "subscriber socket failed");
            let _ = events.send(SubscriberEvent::error(msg));
        }
    }
}
