//! Client configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Messaging client configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Base URL of the message service
    pub service_url: String,
    /// Receive over the streaming transport; when false the receiver
    /// only supports explicit drains
    pub use_stream: bool,
    /// Per-request timeout (seconds)
    pub request_timeout_secs: u64,
    /// Reconnect pacing
    pub retry: RetryConfig,
    /// Streaming transport keepalive
    pub keepalive: KeepAliveConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            service_url: "https://messaging.example.org".to_string(),
            use_stream: true,
            request_timeout_secs: 30,
            retry: RetryConfig::default(),
            keepalive: KeepAliveConfig::default(),
        }
    }
}

impl ClientConfig {
    /// Create with a service URL
    pub fn with_service_url(url: impl Into<String>) -> Self {
        Self {
            service_url: url.into(),
            ..Default::default()
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.service_url.is_empty() {
            return Err("service_url must not be empty".to_string());
        }
        if self.request_timeout_secs == 0 {
            return Err("request_timeout_secs must be greater than 0".to_string());
        }
        if self.keepalive.interval_secs == 0 {
            return Err("keepalive interval_secs must be greater than 0".to_string());
        }
        Ok(())
    }
}

/// Retry configuration for the receiver's reconnect loop
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Initial retry delay (milliseconds)
    pub initial_delay_ms: u64,
    /// Maximum retry delay (milliseconds)
    pub max_delay_ms: u64,
    /// Backoff multiplier
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 100,
            max_delay_ms: 30000,
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Calculate delay for retry attempt
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let delay = self.initial_delay_ms as f64 * self.backoff_multiplier.powi(attempt as i32);
        let delay = delay.min(self.max_delay_ms as f64) as u64;
        Duration::from_millis(delay)
    }
}

/// Keepalive settings for the streaming transport
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct KeepAliveConfig {
    /// Request path pinged on each interval
    pub path: String,
    /// Tear the socket down when a keepalive response is missed
    pub disconnect_on_miss: bool,
    /// Ping interval (seconds)
    pub interval_secs: u64,
}

impl Default for KeepAliveConfig {
    fn default() -> Self {
        Self {
            path: "/v1/keepalive".to_string(),
            disconnect_on_miss: true,
            interval_secs: 45,
        }
    }
}

impl KeepAliveConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}
