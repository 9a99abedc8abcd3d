//! Gateway descriptor loading.

use serde::{Deserialize, Serialize};

use crate::ratelimit::ExtraConfig;

/// Top-level gateway descriptor.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Routed endpoints
    #[serde(default)]
    pub endpoints: Vec<EndpointConfig>,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default log filter; `RUST_LOG` takes precedence
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON log lines
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// An endpoint and the backends it fans out to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    /// Endpoint path pattern, used as the route name
    pub endpoint: String,

    /// Extension blocks, keyed by namespace
    #[serde(default)]
    pub extra_config: ExtraConfig,

    #[serde(default)]
    pub backends: Vec<BackendConfig>,
}

/// A backend called by an endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    pub url_pattern: String,

    /// Extension blocks, keyed by namespace
    #[serde(default)]
    pub extra_config: ExtraConfig,
}

impl GatewayConfig {
    /// Load configuration from a YAML (or JSON) file path.
    pub fn from_file<P: AsRef<std::path::Path>>(path: P) -> crate::error::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Parse configuration from a YAML (or JSON) string.
    pub fn from_yaml(yaml: &str) -> crate::error::Result<Self> {
        serde_yaml::from_str(yaml).map_err(|e| crate::error::TurnstileError::Config(e.to_string()))
    }
}
