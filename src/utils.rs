//! Path and URL helpers shared by the session and the client facade.

use serde_json::Value;
use url::Url;

use crate::error::{Error, Result};

/// Resource names the server defines itself. Anything else is a custom type.
pub const SYSTEM_RESOURCES: &[&str] = &[
    "users",
    "types",
    "namespaces",
    "profiles",
    "scalars",
    "documents",
    "sources",
    "topics",
    "rules",
    "nodes",
    "procedures",
    "services",
    "analyticsmodels",
];

const SYSTEM_PREFIX: &str = "system.";

/// Maps a resource name to its REST path.
///
/// `system.nodes` and `nodes` both address `/resources/nodes`; a name that is
/// not a system resource addresses `/resources/custom/<name>`.
pub fn resource_path(resource: &str) -> String {
    if let Some(name) = resource.strip_prefix(SYSTEM_PREFIX) {
        format!("/resources/{}", name)
    } else if SYSTEM_RESOURCES.contains(&resource) {
        format!("/resources/{}", resource)
    } else {
        format!("/resources/custom/{}", resource)
    }
}

/// Prefixes a resource path with the versioned API root.
pub fn api_path(api_version: u32, path: &str) -> String {
    format!("/api/v{}{}", api_version, path)
}

/// Derives the subscriber socket URL from the HTTP server URL.
pub fn websocket_url(server: &Url, api_version: u32) -> Result<Url> {
    let scheme = match server.scheme() {
        "http" => "ws",
        "https" => "wss",
        other => {
            return Err(Error::Protocol(format!(
                "Request protocol '{}' not supported",
                other
            )))
        }
    };
    let mut url = server.clone();
    url.set_scheme(scheme)
        .map_err(|_| Error::Protocol(format!("Cannot derive socket URL from {}", server)))?;
    let base = server.path().trim_end_matches('/');
    url.set_path(&format!("{}/api/v{}/wsock/websocket", base, api_version));
    url.set_query(None);
    Ok(url)
}

/// JSON-encodes a query parameter value.
pub fn json_param(value: &Value) -> Result<String> {
    Ok(serde_json::to_string(value)?)
}

/// Normalizes a write response: arrays collapse to their first element.
pub fn first_record(body: Value) -> Option<Value> {
    match body {
        Value::Null => None,
        Value::Array(mut records) => {
            if records.is_empty() {
                None
            } else {
                Some(records.swap_remove(0))
            }
        }
        other => Some(other),
    }
}
