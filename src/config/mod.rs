//! # Configuration
//!
//! Explicit, validated configuration for the work-intake core. Values come
//! from defaults, an optional `feedbridge` config file, and `FEEDBRIDGE_*`
//! environment overrides, in that order. Validation fails loudly instead of
//! silently falling back.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Root configuration for the work-intake core
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IntakeConfig {
    pub broker: BrokerConfig,
    pub auth: AuthConfig,
    pub tasks: TaskConfig,
}

/// Broker connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// WebSocket endpoint of the central broker
    pub url: String,

    /// Name of the custom application header sent on the handshake
    pub app_header: String,

    /// Value of the custom application header
    pub app_name: String,

    /// Subject claim of the system bearer token
    pub principal: String,

    /// Prefix of the session-scoped work destination
    pub subscribe_prefix: String,

    /// Fixed delay before a scheduled reconnect. Deliberately not exponential.
    pub reconnect_delay_secs: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            url: "wss://broker.feedbridge.io/ws".to_string(),
            app_header: "x-feedbridge-app".to_string(),
            app_name: "feedbridge-api".to_string(),
            principal: "feedbridge-system".to_string(),
            subscribe_prefix: "/queue/work-".to_string(),
            reconnect_delay_secs: 5,
        }
    }
}

/// Bearer-token issuance settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Shared HS256 signing secret; must be provided by file or environment
    pub secret: String,

    /// Token audience (the broker principal)
    pub audience: String,

    /// Token lifetime in minutes
    pub token_ttl_minutes: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            secret: String::new(),
            audience: "broker".to_string(),
            token_ttl_minutes: 10,
        }
    }
}

/// Background creation queue settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskConfig {
    /// Items per deferred partition. Small by design to bound per-request
    /// latency on constrained hardware.
    pub partition_size: usize,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self { partition_size: 1 }
    }
}

impl IntakeConfig {
    /// Load configuration from defaults, optional file, and environment
    pub fn load() -> Result<Self, ConfigurationError> {
        let defaults = config::Config::try_from(&IntakeConfig::default())?;
        let settings = config::Config::builder()
            .add_source(defaults)
            .add_source(config::File::with_name("feedbridge").required(false))
            .add_source(config::Environment::with_prefix("FEEDBRIDGE").separator("__"))
            .build()?;

        let loaded: IntakeConfig = settings.try_deserialize()?;
        loaded.validate()?;
        Ok(loaded)
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.broker.url.is_empty() {
            return Err(ConfigurationError::Invalid {
                field: "broker.url",
                reason: "broker url must not be empty".to_string(),
            });
        }
        if self.auth.secret.is_empty() {
            return Err(ConfigurationError::Invalid {
                field: "auth.secret",
                reason: "signing secret must be provided".to_string(),
            });
        }
        if self.tasks.partition_size == 0 {
            return Err(ConfigurationError::Invalid {
                field: "tasks.partition_size",
                reason: "partition size must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("configuration load error: {0}")]
    Load(#[from] config::ConfigError),

    #[error("invalid configuration: {field}: {reason}")]
    Invalid {
        field: &'static str,
        reason: String,
    },
}
