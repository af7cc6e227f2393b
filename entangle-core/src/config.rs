//! Client configuration.
//!
//! Configuration can be built in code or loaded from YAML or JSON:
//! ```yaml
//! default_strategy: cache-and-network
//! clear_after_ms: 30000
//! poll_after_ms: 5000
//! ```

use std::time::Duration;

use crate::error::Error;
use crate::strategy::FetchStrategy;

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct ClientConfig {
    /// Strategy used when a call does not name one.
    #[serde(default)]
    pub default_strategy: FetchStrategy,
    /// Idle time after which an unobserved query record is destroyed. None keeps records.
    #[serde(default)]
    pub clear_after_ms: Option<u64>,
    /// Poll interval applied to every operation. None disables polling.
    #[serde(default)]
    pub poll_after_ms: Option<u64>,
}

impl ClientConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_default_strategy(mut self, strategy: FetchStrategy) -> Self {
        self.default_strategy = strategy;
        self
    }

    pub fn with_clear_after(mut self, duration: Duration) -> Self {
        self.clear_after_ms = Some(duration.as_millis() as u64);
        self
    }

    pub fn with_poll_after(mut self, duration: Duration) -> Self {
        self.poll_after_ms = Some(duration.as_millis() as u64);
        self
    }

    pub fn clear_after(&self) -> Option<Duration> {
        self.clear_after_ms.map(Duration::from_millis)
    }

    pub fn poll_after(&self) -> Option<Duration> {
        self.poll_after_ms.map(Duration::from_millis)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self, Error> {
        serde_yaml::from_str(yaml).map_err(|e| {
            Error::config_error(format!("Failed to parse YAML configuration: {}", e))
        })
    }

    /// Load configuration from a JSON string.
    pub fn from_json(json: &str) -> Result<Self, Error> {
        serde_json::from_str(json).map_err(|e| {
            Error::config_error(format!("Failed to parse JSON configuration: {}", e))
        })
    }

    pub fn to_yaml(&self) -> Result<String, Error> {
        serde_yaml::to_string(self).map_err(|e| {
            Error::general_error(format!("Failed to serialize configuration to YAML: {}", e))
        })
    }

    pub fn to_json(&self) -> Result<String, Error> {
        serde_json::to_string_pretty(self).map_err(|e| {
            Error::general_error(format!("Failed to serialize configuration to JSON: {}", e))
        })
    }
}

/// Per-call options of [crate::operation::Operation::execute].
#[derive(Debug, Clone, Default)]
pub struct ExecuteOptions {
    /// Overrides the client's default strategy.
    pub strategy: Option<FetchStrategy>,
    /// Ambient context handed to derive fetchers; overrides the environment's context.
    pub context: Option<crate::data::Data>,
}

impl ExecuteOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn strategy(strategy: FetchStrategy) -> Self {
        ExecuteOptions {
            strategy: Some(strategy),
            context: None,
        }
    }

    pub fn with_context(mut self, context: crate::data::Data) -> Self {
        self.context = Some(context);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorType;

    #[test]
    fn test_yaml_config() {
        let config = ClientConfig::from_yaml(
            r#"
default_strategy: cache-and-network
clear_after_ms: 30000
"#,
        )
        .unwrap();
        assert_eq!(config.default_strategy, FetchStrategy::CacheAndNetwork);
        assert_eq!(config.clear_after(), Some(Duration::from_secs(30)));
        assert_eq!(config.poll_after(), None);
        let back = ClientConfig::from_yaml(&config.to_yaml().unwrap()).unwrap();
        assert_eq!(back, config);
    }

    #[test]
    fn test_json_defaults() {
        let config = ClientConfig::from_json("{}").unwrap();
        assert_eq!(config, ClientConfig::default());
        assert_eq!(config.default_strategy, FetchStrategy::CacheOrFallbackNetwork);
        let e = ClientConfig::from_json(r#"{"default_strategy": "standby"}"#).unwrap_err();
        assert_eq!(e.error_type, ErrorType::Config);
    }
}
