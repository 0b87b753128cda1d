//! Event bus endpoint configuration.

use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;

/// Where the bus lives and how to talk to it.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EndpointConfig {
    /// `host:port`, `http(s)://host:port`, or a Unix socket path.
    pub address: String,
    /// Static metadata attached to every call (auth tokens, tenant ids).
    pub headers: HashMap<String, String>,
    /// Connect timeout in seconds.
    pub connect_timeout_secs: u64,
    /// HTTP/2 keepalive ping interval in seconds (0 disables).
    pub keep_alive_interval_secs: u64,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            address: "localhost:7443".to_string(),
            headers: HashMap::new(),
            connect_timeout_secs: 10,
            keep_alive_interval_secs: 30,
        }
    }
}

impl EndpointConfig {
    /// Endpoint at `address` with default timeouts and no headers.
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            ..Default::default()
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn keep_alive_interval(&self) -> Option<Duration> {
        (self.keep_alive_interval_secs > 0)
            .then(|| Duration::from_secs(self.keep_alive_interval_secs))
    }
}
