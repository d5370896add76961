//! Server configuration.

use std::time::Duration;

/// Configuration validation errors.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },
    #[error("{field} must be at least {min_field}")]
    OutOfOrder {
        field: &'static str,
        min_field: &'static str,
    },
    #[error("randomization factor must be within [0, 1), got {0}")]
    Randomization(f64),
    #[error("invalid user entry '{0}': expected token:user_id:display name")]
    UserEntry(String),
    #[error("invalid membership entry '{0}': expected user_id:project_id")]
    MembershipEntry(String),
}

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Events buffered per connection before new ones are dropped for it
    pub outbound_capacity: usize,
    /// WebSocket ping interval
    pub heartbeat_interval: Duration,
    /// Connections silent for longer than this are dropped
    pub idle_timeout: Duration,
    /// How often expired typing entries, claims and connections are swept
    pub sweep_interval: Duration,
    /// Editing claims idle for longer than this are released
    pub claim_ttl: Duration,
    /// Typing entries not refreshed within this are removed
    pub typing_ttl: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            outbound_capacity: 256,
            heartbeat_interval: Duration::from_secs(25),
            idle_timeout: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(1),
            claim_ttl: Duration::from_secs(5 * 60),
            typing_ttl: Duration::from_secs(8),
        }
    }
}

impl ServerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.outbound_capacity == 0 {
            return Err(ConfigError::Zero { field: "outbound_capacity" });
        }
        for (field, value) in [
            ("heartbeat_interval", self.heartbeat_interval),
            ("idle_timeout", self.idle_timeout),
            ("sweep_interval", self.sweep_interval),
            ("claim_ttl", self.claim_ttl),
            ("typing_ttl", self.typing_ttl),
        ] {
            if value.is_zero() {
                return Err(ConfigError::Zero { field });
            }
        }
        // A healthy client must get at least one ping in before it is
        // considered idle.
        if self.idle_timeout < self.heartbeat_interval {
            return Err(ConfigError::OutOfOrder {
                field: "idle_timeout",
                min_field: "heartbeat_interval",
            });
        }
        Ok(())
    }
}
