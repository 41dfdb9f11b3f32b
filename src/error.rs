use serde::{ser::Serializer, Serialize};
use serde_json::Value;
use thiserror::Error;

/// A specialized `Result` type for the Vantiq client crate.
pub type Result<T> = std::result::Result<T, Error>;

/// The error type for the Vantiq client crate.
#[derive(Debug, Error)]
pub enum Error {
    /// No access token is held; raised before any request is made.
    #[error("Not authenticated")]
    NotAuthenticated,

    /// The server rejected the credentials or did not return a token.
    #[error("Authentication failed (status {status_code})")]
    AuthenticationFailed { status_code: u16, body: Value },

    /// The server answered with a status code of 400 or above.
    #[error("HTTP error {status_code}: {body}")]
    Http { status_code: u16, body: Value },

    #[error("Request error: {0}")]
    Request(#[from] reqwest::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(Box<tokio_tungstenite::tungstenite::Error>),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Must be connected to subscribe to events")]
    NotConnected,

    #[error("Illegal topic name.  Topic names must begin with a slash '/'.")]
    IllegalTopicName,

    #[error("URL error: {0}")]
    Url(#[from] url::ParseError),

    #[error("Serde JSON error: {0}")]
    SerdeJson(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// The HTTP status carried by the error, if any.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Error::Http { status_code, .. } | Error::AuthenticationFailed { status_code, .. } => {
                Some(*status_code)
            }
            Error::Request(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }

    /// The response body carried by an HTTP failure.
    pub fn body(&self) -> Option<&Value> {
        match self {
            Error::Http { body, .. } | Error::AuthenticationFailed { body, .. } => Some(body),
            _ => None,
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        Error::WebSocket(Box::new(e))
    }
}

impl Serialize for Error {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}
