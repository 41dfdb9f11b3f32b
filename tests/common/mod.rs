//! In-process mock of the platform's REST and WebSocket endpoints.
//!
//! REST calls are recorded and answered from programmed routes. The socket
//! endpoint understands `validate`, `subscribe` and `acknowledge`; publishing
//! to `/resources/topics/<name>` fans out to subscribed sockets, and
//! persistent subscriptions get redelivered until acknowledged or until the
//! redelivery limit is reached. `close_sockets` drops every socket from the
//! server side.

#![allow(dead_code)]

use axum::{
    body::{to_bytes, Body},
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Request, State,
    },
    http::{header, HeaderMap, Method},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use futures::{stream::SplitSink, SinkExt, StreamExt};
use serde_json::{json, Map, Value};
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};
use tokio::sync::broadcast::{self, error::RecvError};
use vantiq_sdk_rs::Vantiq;

pub const USERNAME: &str = "joe";
pub const PASSWORD: &str = "no-one-will-guess";
pub const BASIC_AUTH: &str = "Basic am9lOm5vLW9uZS13aWxsLWd1ZXNz";
pub const TOKEN: &str = "234592dadf23412";

pub const REDELIVERY_INTERVAL: Duration = Duration::from_millis(100);
const DEFAULT_REDELIVERY_LIMIT: u32 = 50;

const TOPICS_PREFIX: &str = "/api/v1/resources/topics/";

/// A request as the mock received it.
#[derive(Clone, Debug)]
pub struct Recorded {
    pub method: Method,
    pub path: String,
    pub query: HashMap<String, String>,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl Recorded {
    pub fn json(&self) -> Value {
        serde_json::from_slice(&self.body).unwrap_or(Value::Null)
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// A JSON-encoded query parameter, decoded.
    pub fn query_json(&self, name: &str) -> Value {
        self.query
            .get(name)
            .and_then(|v| serde_json::from_str(v).ok())
            .unwrap_or(Value::Null)
    }
}

/// A programmed response.
#[derive(Clone, Debug)]
pub struct Canned {
    status: u16,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
}

impl Canned {
    pub fn json(status: u16, body: Value) -> Self {
        Self {
            status,
            headers: vec![("content-type".into(), "application/json".into())],
            body: body.to_string().into_bytes(),
        }
    }

    pub fn text(status: u16, body: &str) -> Self {
        Self::bytes(status, "text/plain", body.as_bytes())
    }

    pub fn bytes(status: u16, content_type: &str, body: &[u8]) -> Self {
        Self {
            status,
            headers: vec![("content-type".into(), content_type.into())],
            body: body.to_vec(),
        }
    }

    pub fn empty(status: u16) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

impl IntoResponse for Canned {
    fn into_response(self) -> Response {
        let mut builder = axum::http::Response::builder().status(self.status);
        for (name, value) in &self.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        builder.body(Body::from(self.body)).unwrap()
    }
}

struct MockState {
    routes: Mutex<HashMap<(Method, String), Canned>>,
    requests: Mutex<Vec<Recorded>>,
    control: Mutex<Vec<Value>>,
    persistent: Mutex<HashMap<String, String>>,
    publish_tx: broadcast::Sender<(String, Value)>,
    close_tx: broadcast::Sender<()>,
    next_id: AtomicU64,
    redelivery_limit: u32,
}

impl MockState {
    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst) + 1
    }
}

pub struct MockServer {
    pub url: String,
    state: Arc<MockState>,
}

impl MockServer {
    pub async fn start() -> Self {
        Self::start_with_redelivery_limit(DEFAULT_REDELIVERY_LIMIT).await
    }

    /// `limit` is the total number of deliveries of an unacknowledged message
    /// before it expires.
    pub async fn start_with_redelivery_limit(limit: u32) -> Self {
        let (publish_tx, _) = broadcast::channel(64);
        let (close_tx, _) = broadcast::channel(4);
        let state = Arc::new(MockState {
            routes: Mutex::new(HashMap::new()),
            requests: Mutex::new(Vec::new()),
            control: Mutex::new(Vec::new()),
            persistent: Mutex::new(HashMap::new()),
            publish_tx,
            close_tx,
            next_id: AtomicU64::new(0),
            redelivery_limit: limit,
        });

        let app = Router::new()
            .route("/api/v1/wsock/websocket", get(ws_handler))
            .fallback(handle)
            .with_state(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            url: format!("http://{}", addr),
            state,
        }
    }

    pub fn route(&self, method: Method, path: &str, canned: Canned) {
        self.state
            .routes
            .lock()
            .unwrap()
            .insert((method, path.to_string()), canned);
    }

    pub fn requests(&self) -> Vec<Recorded> {
        self.state.requests.lock().unwrap().clone()
    }

    pub fn last_request(&self) -> Recorded {
        self.requests().pop().expect("no request recorded")
    }

    /// Control messages received over every socket, in arrival order.
    pub fn control_messages(&self) -> Vec<Value> {
        self.state.control.lock().unwrap().clone()
    }

    pub fn control_messages_with_op(&self, op: &str) -> Vec<Value> {
        self.control_messages()
            .into_iter()
            .filter(|m| m["op"] == op)
            .collect()
    }

    /// Closes every open socket from the server side with a close frame.
    pub fn close_sockets(&self) {
        let _ = self.state.close_tx.send(());
    }

    /// Server-side persistent subscriptions: name to event path.
    pub fn persistent_subscriptions(&self) -> HashMap<String, String> {
        self.state.persistent.lock().unwrap().clone()
    }

    pub fn client(&self) -> Vantiq {
        Vantiq::new(self.url.clone()).unwrap()
    }

    pub async fn authenticated_client(&self) -> Vantiq {
        let mut client = self.client();
        assert!(client.authenticate(USERNAME, PASSWORD).await.unwrap());
        client
    }
}

fn unauthorized() -> Response {
    Canned::json(
        401,
        json!([{"code": "io.vantiq.authentication.failed", "message": "Invalid credentials"}]),
    )
    .into_response()
}

async fn handle(State(state): State<Arc<MockState>>, req: Request) -> Response {
    let (parts, body) = req.into_parts();
    let body = to_bytes(body, usize::MAX).await.unwrap_or_default().to_vec();
    let query: HashMap<String, String> = parts
        .uri
        .query()
        .map(|q| url::form_urlencoded::parse(q.as_bytes()).into_owned().collect())
        .unwrap_or_default();
    let path = parts.uri.path().to_string();
    let recorded = Recorded {
        method: parts.method.clone(),
        path: path.clone(),
        query,
        headers: parts.headers.clone(),
        body,
    };
    state.requests.lock().unwrap().push(recorded.clone());

    let auth = parts
        .headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();

    if path == "/authenticate" {
        if auth == BASIC_AUTH {
            return Canned::json(200, json!({"accessToken": TOKEN, "idToken": "id-token"}))
                .into_response();
        }
        return unauthorized();
    }
    if auth != format!("Bearer {}", TOKEN) {
        return unauthorized();
    }

    if parts.method == Method::POST {
        if let Some(topic) = path.strip_prefix(TOPICS_PREFIX) {
            if topic.starts_with('/') {
                let _ = state
                    .publish_tx
                    .send((format!("/topics{}", topic), recorded.json()));
                return Canned::empty(200).into_response();
            }
        }
    }

    let canned = state
        .routes
        .lock()
        .unwrap()
        .get(&(parts.method, path))
        .cloned();
    match canned {
        Some(canned) => canned.into_response(),
        None => Canned::json(
            404,
            json!([{"code": "io.vantiq.resource.not.found", "message": "Resource not found"}]),
        )
        .into_response(),
    }
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<MockState>>) -> Response {
    ws.on_upgrade(move |socket| ws_session(socket, state))
}

struct Pending {
    path: String,
    body: Value,
    deliveries: u32,
}

type Sink = SplitSink<WebSocket, Message>;

async fn send(sink: &mut Sink, value: Value) -> bool {
    sink.send(Message::Text(value.to_string().into())).await.is_ok()
}

fn delivery(path: &str, body: &Value) -> Value {
    json!({"status": 100, "headers": {"X-Request-Id": path}, "body": body})
}

async fn ws_session(socket: WebSocket, state: Arc<MockState>) {
    let (mut sink, mut stream) = socket.split();
    let mut published = state.publish_tx.subscribe();
    let mut close_rx = state.close_tx.subscribe();
    let mut subscriptions: HashMap<String, Map<String, Value>> = HashMap::new();
    let mut pending: Vec<Pending> = Vec::new();
    let mut ticker = tokio::time::interval(REDELIVERY_INTERVAL);
    let mut validated = false;

    loop {
        tokio::select! {
            frame = stream.next() => {
                let msg: Value = match frame {
                    Some(Ok(Message::Text(text))) => match serde_json::from_str(text.as_str()) {
                        Ok(msg) => msg,
                        Err(_) => continue,
                    },
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => continue,
                };
                state.control.lock().unwrap().push(msg.clone());

                match msg["op"].as_str() {
                    Some("validate") => {
                        if msg["object"] == TOKEN {
                            validated = true;
                            send(&mut sink, json!({"status": 200, "headers": {}, "body": {}})).await;
                        } else {
                            send(&mut sink, json!({"status": 401, "body": {"message": "Invalid token"}})).await;
                            break;
                        }
                    }
                    Some("subscribe") if validated => {
                        let path = msg["resourceId"].as_str().unwrap_or_default().to_string();
                        let mut params = msg["parameters"].as_object().cloned().unwrap_or_default();
                        if params.get("persistent") == Some(&Value::Bool(true)) {
                            let name = params
                                .get("subscriptionName")
                                .and_then(Value::as_str)
                                .map(str::to_string)
                                .unwrap_or_else(|| format!("sub-{}", state.next_id()));
                            state.persistent.lock().unwrap().insert(name.clone(), path.clone());
                            params.insert("subscriptionName".into(), Value::String(name.clone()));
                            let confirm = json!({
                                "status": 200,
                                "headers": {"X-Request-Id": path},
                                "body": {"subscriptionName": name}
                            });
                            send(&mut sink, confirm).await;
                        }
                        subscriptions.insert(path, params);
                    }
                    Some("acknowledge") if validated => {
                        let p = &msg["parameters"];
                        pending.retain(|d| {
                            !(p["requestId"].as_str() == Some(d.path.as_str())
                                && d.body["sequenceId"] == p["sequenceId"])
                        });
                    }
                    _ => {}
                }
            }
            event = published.recv() => {
                let (path, payload) = match event {
                    Ok(event) => event,
                    Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => break,
                };
                let Some(params) = subscriptions.get(&path) else { continue };
                match params.get("subscriptionName").and_then(Value::as_str) {
                    Some(name) => {
                        let body = json!({
                            "value": payload,
                            "subscriptionName": name,
                            "sequenceId": state.next_id(),
                            "partitionId": 0
                        });
                        send(&mut sink, delivery(&path, &body)).await;
                        pending.push(Pending { path, body, deliveries: 1 });
                    }
                    None => {
                        send(&mut sink, delivery(&path, &json!({"value": payload}))).await;
                    }
                }
            }
            _ = close_rx.recv() => {
                let _ = sink.send(Message::Close(None)).await;
                break;
            }
            _ = ticker.tick() => {
                for p in pending.iter_mut() {
                    send(&mut sink, delivery(&p.path, &p.body)).await;
                    p.deliveries += 1;
                }
                pending.retain(|p| p.deliveries < state.redelivery_limit);
            }
        }
    }
}
