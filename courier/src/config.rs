use crate::types::{EndpointId, EndpointTarget};
use serde::Deserialize;
use std::collections::HashSet;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_TRANSMISSION_INTERVAL_SECS: u64 = 300;
pub const DEFAULT_MAX_RETENTION_DAYS: u32 = 10;
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_BACKGROUND_BUDGET_SECS: u64 = 30;

#[derive(Error, Debug, PartialEq)]
pub enum ValidationError {
    #[error("transmission interval cannot be 0")]
    InvalidTransmissionInterval,

    #[error("max retention days cannot be 0")]
    InvalidRetention,

    #[error("request timeout cannot be 0")]
    InvalidRequestTimeout,

    #[error("background budget cannot be 0")]
    InvalidBackgroundBudget,

    #[error("duplicate endpoint: {0}")]
    DuplicateEndpoint(String),

    #[error("unsupported endpoint scheme: {0}")]
    UnsupportedScheme(String),
}

/// Where the location queue and the per-endpoint state are kept.
#[derive(Clone, Deserialize, Debug, Default, PartialEq)]
#[serde(rename_all = "lowercase")]
#[serde(tag = "type")]
pub enum StorageConfig {
    Filesystem { base_dir: String },
    #[default]
    Memory,
}

#[derive(Clone, Deserialize, Debug, PartialEq)]
pub struct TransportConfig {
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig {
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
        }
    }
}

#[derive(Clone, Deserialize, Debug, PartialEq)]
pub struct BackgroundConfig {
    /// Length of the execution slot granted to a flush round.
    #[serde(default = "default_background_budget_secs")]
    pub budget_secs: u64,
}

impl Default for BackgroundConfig {
    fn default() -> Self {
        BackgroundConfig {
            budget_secs: DEFAULT_BACKGROUND_BUDGET_SECS,
        }
    }
}

/// Tracking session configuration. Immutable once the service is built.
#[derive(Clone, Deserialize, Debug, PartialEq)]
pub struct Config {
    /// Collection endpoints, in the order they were configured
    #[serde(default)]
    pub endpoints: Vec<EndpointTarget>,
    #[serde(default = "default_transmission_interval_secs")]
    pub transmission_interval_secs: u64,
    #[serde(default = "default_max_retention_days")]
    pub max_retention_days: u32,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub background: BackgroundConfig,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            endpoints: Vec::new(),
            transmission_interval_secs: DEFAULT_TRANSMISSION_INTERVAL_SECS,
            max_retention_days: DEFAULT_MAX_RETENTION_DAYS,
            storage: StorageConfig::default(),
            transport: TransportConfig::default(),
            background: BackgroundConfig::default(),
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.transmission_interval_secs == 0 {
            return Err(ValidationError::InvalidTransmissionInterval);
        }
        if self.max_retention_days == 0 {
            return Err(ValidationError::InvalidRetention);
        }
        if self.transport.request_timeout_secs == 0 {
            return Err(ValidationError::InvalidRequestTimeout);
        }
        // A zero budget expires every round before any endpoint can answer
        if self.background.budget_secs == 0 {
            return Err(ValidationError::InvalidBackgroundBudget);
        }

        // Endpoints that only differ in casing would share a watermark
        let mut seen: HashSet<EndpointId> = HashSet::new();
        for endpoint in &self.endpoints {
            if !matches!(endpoint.url.scheme(), "http" | "https") {
                return Err(ValidationError::UnsupportedScheme(endpoint.url.to_string()));
            }
            if !seen.insert(endpoint.id()) {
                return Err(ValidationError::DuplicateEndpoint(endpoint.url.to_string()));
            }
        }

        Ok(())
    }

    pub fn transmission_interval(&self) -> Duration {
        Duration::from_secs(self.transmission_interval_secs)
    }

    pub fn max_retention(&self) -> Duration {
        Duration::from_secs(u64::from(self.max_retention_days) * 24 * 60 * 60)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.transport.request_timeout_secs)
    }

    pub fn background_budget(&self) -> Duration {
        Duration::from_secs(self.background.budget_secs)
    }
}

fn default_transmission_interval_secs() -> u64 {
    DEFAULT_TRANSMISSION_INTERVAL_SECS
}

fn default_max_retention_days() -> u32 {
    DEFAULT_MAX_RETENTION_DAYS
}

fn default_request_timeout_secs() -> u64 {
    DEFAULT_REQUEST_TIMEOUT_SECS
}

fn default_background_budget_secs() -> u64 {
    DEFAULT_BACKGROUND_BUDGET_SECS
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_config() {
        let yaml = r#"
            endpoints:
              - url: https://collect.example.com/locations
                headers:
                  Authorization: Bearer abc
              - url: https://backup.example.com/locations
            transmission_interval_secs: 600
            max_retention_days: 5
            storage:
              type: filesystem
              base_dir: /var/lib/waypost
            transport:
              request_timeout_secs: 10
            background:
              budget_secs: 25
        "#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        config.validate().unwrap();

        assert_eq!(config.endpoints.len(), 2);
        assert_eq!(
            config.endpoints[0].headers.get("Authorization").map(String::as_str),
            Some("Bearer abc")
        );
        assert!(config.endpoints[1].headers.is_empty());
        assert_eq!(config.transmission_interval(), Duration::from_secs(600));
        assert_eq!(config.max_retention(), Duration::from_secs(5 * 86_400));
        assert_eq!(
            config.storage,
            StorageConfig::Filesystem {
                base_dir: "/var/lib/waypost".into()
            }
        );
        assert_eq!(config.request_timeout(), Duration::from_secs(10));
        assert_eq!(config.background_budget(), Duration::from_secs(25));
    }

    #[test]
    fn test_defaults() {
        let config: Config = serde_yaml::from_str("endpoints: []").unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.max_retention_days, 10);
        assert_eq!(config.storage, StorageConfig::Memory);
    }

    #[test]
    fn test_validation() {
        let mut config = Config {
            transmission_interval_secs: 0,
            ..Default::default()
        };
        assert_eq!(
            config.validate(),
            Err(ValidationError::InvalidTransmissionInterval)
        );

        config.transmission_interval_secs = 60;
        config.max_retention_days = 0;
        assert_eq!(config.validate(), Err(ValidationError::InvalidRetention));

        config.max_retention_days = 1;
        config.transport.request_timeout_secs = 0;
        assert_eq!(config.validate(), Err(ValidationError::InvalidRequestTimeout));

        config.transport.request_timeout_secs = 5;
        config.background.budget_secs = 0;
        assert_eq!(config.validate(), Err(ValidationError::InvalidBackgroundBudget));

        config.background.budget_secs = 1;
        assert_eq!(config.validate(), Ok(()));

        config.endpoints = serde_yaml::from_str(
            r#"
            - url: https://collect.example.com/Locations
            - url: https://COLLECT.example.com/locations
            "#,
        )
        .unwrap();
        assert!(matches!(
            config.validate(),
            Err(ValidationError::DuplicateEndpoint(_))
        ));

        config.endpoints = serde_yaml::from_str("- url: ftp://collect.example.com/").unwrap();
        assert!(matches!(
            config.validate(),
            Err(ValidationError::UnsupportedScheme(_))
        ));
    }
}
