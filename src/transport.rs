//! # Transport
//!
//! Performs exactly one HTTP exchange against the server and normalizes the
//! outcome. The transport never touches session state: callers hand it either
//! Basic credentials or the current access token for each exchange.

use bytes::Bytes;
use futures::{Stream, StreamExt, TryStreamExt};
use reqwest::{header, Client, Method};
use serde_json::Value;
use std::{fmt, pin::Pin};
use tracing::debug;
use url::Url;

use crate::{
    config::Config,
    error::{Error, Result},
    multipart::Multipart,
};

/// Response header carrying the total match count of a query.
pub const TOTAL_COUNT_HEADER: &str = "x-total-count";

/// A response body delivered chunk by chunk.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

/// Username/password pair used for Basic authentication.
#[derive(Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// The `Authorization` scheme resolved for one exchange.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Authorization {
    Basic { username: String, password: String },
    Bearer(String),
}

impl Authorization {
    /// Credentials win over a token; with neither the call is refused.
    pub fn resolve(credentials: Option<&Credentials>, token: Option<&str>) -> Result<Self> {
        match (credentials, token) {
            (Some(c), _) => Ok(Authorization::Basic {
                username: c.username.clone(),
                password: c.password.clone(),
            }),
            (None, Some(token)) => Ok(Authorization::Bearer(token.to_string())),
            (None, None) => Err(Error::NotAuthenticated),
        }
    }
}

/// Request payload.
#[derive(Debug, Default)]
pub enum RequestBody {
    #[default]
    Empty,
    Json(Value),
    Multipart(Multipart),
}

/// One pending HTTP exchange.
#[derive(Debug)]
pub struct Exchange {
    pub method: Method,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub body: RequestBody,
    pub credentials: Option<Credentials>,
    pub token: Option<String>,
    pub stream_response: bool,
}

impl Exchange {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            body: RequestBody::Empty,
            credentials: None,
            token: None,
            stream_response: false,
        }
    }

    pub fn query<K: Into<String>, V: Into<String>>(mut self, pairs: impl IntoIterator<Item = (K, V)>) -> Self {
        self.query
            .extend(pairs.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    pub fn json(mut self, body: Value) -> Self {
        self.body = RequestBody::Json(body);
        self
    }

    pub fn multipart(mut self, part: Multipart) -> Self {
        self.body = RequestBody::Multipart(part);
        self
    }

    pub fn credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    pub fn token(mut self, token: Option<String>) -> Self {
        self.token = token;
        self
    }

    pub fn streaming(mut self) -> Self {
        self.stream_response = true;
        self
    }
}

/// Parsed response payload.
pub enum ResponseBody {
    Empty,
    Json(Value),
    Text(String),
    Stream(ByteStream),
}

impl ResponseBody {
    /// Converts a buffered body to JSON. Text becomes a JSON string; an empty
    /// or streamed body becomes `null`.
    pub fn into_json(self) -> Value {
        match self {
            ResponseBody::Json(v) => v,
            ResponseBody::Text(s) => Value::String(s),
            ResponseBody::Empty | ResponseBody::Stream(_) => Value::Null,
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, ResponseBody::Empty)
    }
}

impl fmt::Debug for ResponseBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResponseBody::Empty => write!(f, "Empty"),
            ResponseBody::Json(v) => f.debug_tuple("Json").field(v).finish(),
            ResponseBody::Text(s) => f.debug_tuple("Text").field(s).finish(),
            ResponseBody::Stream(_) => write!(f, "Stream(..)"),
        }
    }
}

/// Normalized result of a successful exchange.
#[derive(Debug)]
pub struct Response {
    pub status_code: u16,
    pub count: Option<u64>,
    pub headers: header::HeaderMap,
    pub body: ResponseBody,
}

/// HTTP transport bound to one server.
#[derive(Clone, Debug)]
pub struct Transport {
    client: Client,
    server: Url,
}

impl Transport {
    pub fn new(config: &Config) -> Result<Self> {
        let server = Url::parse(&config.server)?;
        match server.scheme() {
            "http" | "https" => {}
            other => {
                return Err(Error::Protocol(format!(
                    "Request protocol '{}' not supported",
                    other
                )))
            }
        }
        let mut builder = Client::builder();
        if let Some(timeout) = config.timeout {
            builder = builder.timeout(timeout);
        }
        Ok(Self {
            client: builder.build()?,
            server,
        })
    }

    pub fn server(&self) -> &Url {
        &self.server
    }

    /// Builds the absolute URL for a server-relative path.
    pub fn url(&self, path: &str, query: &[(String, String)]) -> Url {
        let mut url = self.server.clone();
        let base = self.server.path().trim_end_matches('/');
        url.set_path(&format!("{}{}", base, path));
        url.set_query(None);
        if !query.is_empty() {
            url.query_pairs_mut().extend_pairs(query);
        }
        url
    }

    /// Issues the exchange. Statuses of 400 and above fail with
    /// [`Error::Http`].
    pub async fn request(&self, exchange: Exchange) -> Result<Response> {
        let auth = Authorization::resolve(exchange.credentials.as_ref(), exchange.token.as_deref())?;
        let url = self.url(&exchange.path, &exchange.query);
        debug!(method = %exchange.method, %url, "issuing request");

        let mut req = self.client.request(exchange.method, url);
        req = match auth {
            Authorization::Basic { username, password } => req.basic_auth(username, Some(password)),
            Authorization::Bearer(token) => req.bearer_auth(token),
        };
        req = match exchange.body {
            RequestBody::Empty => req.header(header::CONTENT_TYPE, "application/json"),
            RequestBody::Json(body) => req
                .header(header::CONTENT_TYPE, "application/json")
                .body(serde_json::to_vec(&body)?),
            RequestBody::Multipart(part) => req
                .header(header::CONTENT_TYPE, part.multipart_content_type())
                .body(part.into_body().await?),
        };

        let resp = req.send().await?;
        let status_code = resp.status().as_u16();
        let headers = resp.headers().clone();
        let count = headers
            .get(TOTAL_COUNT_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok());
        debug!(status = status_code, ?count, "response received");

        if exchange.stream_response && status_code < 400 {
            let stream = resp.bytes_stream().map_err(Error::from).boxed();
            return Ok(Response {
                status_code,
                count,
                headers,
                body: ResponseBody::Stream(stream),
            });
        }

        let is_json = headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|ct| ct.starts_with("application/json"))
            .unwrap_or(false);
        let raw = resp.bytes().await?;
        let failed = status_code >= 400;
        let body = if raw.is_empty() {
            ResponseBody::Empty
        } else if is_json {
            match serde_json::from_slice(&raw) {
                Ok(value) => ResponseBody::Json(value),
                // an error page mislabelled as JSON must not hide the status
                Err(_) if failed => ResponseBody::Text(String::from_utf8_lossy(&raw).into_owned()),
                Err(e) => return Err(e.into()),
            }
        } else {
            ResponseBody::Text(String::from_utf8_lossy(&raw).into_owned())
        };

        if failed {
            return Err(Error::Http {
                status_code,
                body: body.into_json(),
            });
        }
        Ok(Response {
            status_code,
            count,
            headers,
            body,
        })
    }
}
