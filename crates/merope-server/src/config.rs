use std::time::Duration;

use serde::{Deserialize, Serialize};

/// `[server]` section: limits and defaults of the client-facing services.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Used when a request carries `timeout_ms = 0`.
    pub request_timeout_ms: u64,
    pub max_key_bytes: usize,
    pub max_value_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig { request_timeout_ms: 3000, max_key_bytes: 4096, max_value_bytes: 1 << 20 }
    }
}

impl ServerConfig {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.request_timeout_ms == 0 {
            return Err("server.request_timeout_ms must be > 0".into());
        }
        if self.max_key_bytes == 0 || self.max_value_bytes == 0 {
            return Err("server.max_key_bytes and server.max_value_bytes must be > 0".into());
        }
        Ok(())
    }
}
