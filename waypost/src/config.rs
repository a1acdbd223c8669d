use courier::Config as CourierConfig;
use serde::Deserialize;
use std::fs::File;
use std::path::{Path, PathBuf};

#[derive(Deserialize, Debug)]
pub struct MetricsConfig {
    pub statsd_host: String,
    pub statsd_port: u16,
}

#[derive(Deserialize, Debug, Default)]
pub struct LoggingConfig {
    pub sentry_dsn: Option<String>,
    /// Events are also appended here, without ANSI colors.
    pub log_file: Option<PathBuf>,
}

#[derive(Deserialize, Debug, Default)]
pub struct CommonConfig {
    pub metrics: Option<MetricsConfig>,
    pub logging: Option<LoggingConfig>,
}

#[derive(Deserialize, Debug)]
pub struct Config {
    #[serde(flatten)]
    pub common: CommonConfig,
    pub courier: CourierConfig,
}

impl Config {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let file = File::open(path)?;
        let data = serde_yaml::from_reader(file)?;

        Ok(data)
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("could not load config from file: {0}")]
    LoadError(#[from] std::io::Error),
    #[error("could not parse config: {0}")]
    ParseError(#[from] serde_yaml::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier::config::StorageConfig;
    use std::io::Write;
    use std::time::Duration;

    fn write_tmp_file(s: &str) -> tempfile::NamedTempFile {
        let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
        write!(tmp, "{}", s).expect("write yaml");

        tmp
    }

    #[test]
    fn full_config() {
        let yaml = r#"
            metrics:
                statsd_host: 127.0.0.1
                statsd_port: 8125
            logging:
                sentry_dsn: https://key@sentry.example.com/1
                log_file: /var/log/waypost/waypost.log
            courier:
                endpoints:
                    - url: https://collector.example.com/locations
                      headers:
                          x-api-key: secret
                    - url: https://backup.example.com/locations
                transmission_interval_secs: 600
                max_retention_days: 7
                storage:
                    type: filesystem
                    base_dir: /var/lib/waypost/
                transport:
                    request_timeout_secs: 10
                background:
                    budget_secs: 25
            "#;
        let tmp = write_tmp_file(yaml);
        let config = Config::from_file(tmp.path()).expect("load config");

        let metrics = config.common.metrics.expect("metrics config");
        assert_eq!(metrics.statsd_host, "127.0.0.1");
        assert_eq!(metrics.statsd_port, 8125);
        let logging = config.common.logging.expect("logging config");
        assert_eq!(
            logging.sentry_dsn.as_deref(),
            Some("https://key@sentry.example.com/1")
        );
        assert_eq!(
            logging.log_file.as_deref(),
            Some(Path::new("/var/log/waypost/waypost.log"))
        );

        let courier = config.courier;
        courier.validate().expect("valid config");
        assert_eq!(courier.endpoints.len(), 2);
        assert_eq!(
            courier.endpoints[0].headers.get("x-api-key").map(String::as_str),
            Some("secret")
        );
        assert_eq!(courier.transmission_interval(), Duration::from_secs(600));
        assert_eq!(courier.max_retention(), Duration::from_secs(7 * 86_400));
        assert_eq!(courier.request_timeout(), Duration::from_secs(10));
        assert_eq!(courier.background_budget(), Duration::from_secs(25));
        assert_eq!(
            courier.storage,
            StorageConfig::Filesystem {
                base_dir: "/var/lib/waypost/".into()
            }
        );
    }

    #[test]
    fn minimal_config() {
        let tmp = write_tmp_file("courier: {}\n");
        let config = Config::from_file(tmp.path()).expect("load config");
        assert!(config.common.metrics.is_none());
        assert!(config.common.logging.is_none());
        assert!(config.courier.endpoints.is_empty());
        assert_eq!(config.courier.storage, StorageConfig::Memory);
    }

    #[test]
    fn missing_file() {
        let result = Config::from_file(Path::new("/nonexistent/waypost.yaml"));
        assert!(matches!(result, Err(ConfigError::LoadError(_))));
    }

    #[test]
    fn invalid_yaml() {
        let tmp = write_tmp_file("courier:\n  endpoints: 12\n");
        let result = Config::from_file(tmp.path());
        assert!(matches!(result, Err(ConfigError::ParseError(_))));
    }
}
