//! Configuration options for the Vantiq client.

use std::time::Duration;

/// API version used when none is configured.
pub const DEFAULT_API_VERSION: u32 = 1;

/// Configuration for the Vantiq client.
#[derive(Clone, Debug)]
pub struct Config {
    /// Base URL of the server (e.g. "https://dev.vantiq.com")
    pub server: String,
    /// Version segment of the REST paths (`/api/v<version>`)
    pub api_version: u32,
    /// Optional timeout for HTTP requests.
    pub timeout: Option<Duration>,
    /// Capacity of the subscriber lifecycle broadcast channel.
    pub event_capacity: usize,
}

impl Config {
    pub fn new(server: impl Into<String>) -> Self {
        Self {
            server: server.into(),
            api_version: DEFAULT_API_VERSION,
            timeout: None,
            event_capacity: 100,
        }
    }

    /// Loads configuration from `VANTIQ_SERVER`, `VANTIQ_API_VERSION` and
    /// `VANTIQ_TIMEOUT_SECS`. Returns `None` when no server is set.
    pub fn from_env() -> Option<Self> {
        let server = std::env::var("VANTIQ_SERVER")
            .ok()
            .filter(|s| !s.is_empty())?;
        let mut config = Self::new(server);
        if let Some(version) = std::env::var("VANTIQ_API_VERSION")
            .ok()
            .and_then(|v| v.parse().ok())
        {
            config.api_version = version;
        }
        config.timeout = std::env::var("VANTIQ_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .map(Duration::from_secs);
        Some(config)
    }

    pub fn api_version(mut self, version: u32) -> Self {
        self.api_version = version;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity.max(1);
        self
    }
}
