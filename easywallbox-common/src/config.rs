use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{Error, Result};
use crate::topic::{DEFAULT_BASE_TOPIC, validate_base_topic};

/// MQTT broker connection configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MqttConfig {
    /// Broker host name or IP address.
    pub host: String,

    /// Broker TCP port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Optional username.
    #[serde(default)]
    pub username: Option<String>,

    /// Optional password (only used together with `username`).
    #[serde(default)]
    pub password: Option<String>,

    /// MQTT client identifier.
    #[serde(default = "default_client_id")]
    pub client_id: String,

    /// Base topic all bridge topics live under.
    #[serde(default = "default_base_topic")]
    pub base_topic: String,

    /// Prefix for Home Assistant discovery documents.
    #[serde(default = "default_discovery_prefix")]
    pub discovery_prefix: String,

    /// Keep-alive interval in seconds.
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,
}

fn default_port() -> u16 {
    1883
}

fn default_client_id() -> String {
    "easywallbox-bridge".to_string()
}

fn default_base_topic() -> String {
    DEFAULT_BASE_TOPIC.to_string()
}

fn default_discovery_prefix() -> String {
    "homeassistant".to_string()
}

fn default_keep_alive() -> u64 {
    30
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: default_port(),
            username: None,
            password: None,
            client_id: default_client_id(),
            base_topic: default_base_topic(),
            discovery_prefix: default_discovery_prefix(),
            keep_alive_secs: default_keep_alive(),
        }
    }
}

impl MqttConfig {
    /// Apply `MQTT_*` environment overrides.
    ///
    /// `lookup` resolves a variable name to its value; blank values are ignored.
    pub fn apply_overrides(&mut self, lookup: &dyn Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(host) = non_blank(lookup("MQTT_HOST")) {
            self.host = host;
        }
        if let Some(port) = non_blank(lookup("MQTT_PORT")) {
            self.port = port
                .trim()
                .parse()
                .map_err(|_| Error::validation(format!("MQTT_PORT is not a port: '{}'", port)))?;
        }
        if let Some(username) = non_blank(lookup("MQTT_USERNAME")) {
            self.username = Some(username);
        }
        if let Some(password) = non_blank(lookup("MQTT_PASSWORD")) {
            self.password = Some(password);
        }
        if let Some(topic) = non_blank(lookup("MQTT_TOPIC")) {
            self.base_topic = topic;
        }
        Ok(())
    }

    /// Validate the broker settings.
    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(Error::validation("mqtt.host must not be empty"));
        }
        if self.port == 0 {
            return Err(Error::validation("mqtt.port must be greater than 0"));
        }
        if self.client_id.trim().is_empty() {
            return Err(Error::validation("mqtt.client_id must not be empty"));
        }
        if self.keep_alive_secs < 5 {
            return Err(Error::validation("mqtt.keep_alive_secs must be at least 5"));
        }
        validate_base_topic(&self.base_topic)?;
        validate_base_topic(&self.discovery_prefix)?;
        Ok(())
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable text format (default).
    #[default]
    Text,
    /// Structured JSON format.
    Json,
}

/// Common logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log output format: "text" or "json".
    #[serde(default)]
    pub format: LogFormat,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

/// Trait for bridge configuration types.
///
/// Implementors get JSON5 loading, environment overrides and validation
/// in one call to [`load`](Self::load).
pub trait BridgeConfig: Sized + DeserializeOwned {
    /// Get the MQTT configuration.
    fn mqtt(&self) -> &MqttConfig;

    /// Get the logging configuration.
    fn logging(&self) -> &LoggingConfig;

    /// Apply environment overrides after the file has been parsed.
    fn apply_overrides(&mut self, _lookup: &dyn Fn(&str) -> Option<String>) -> Result<()> {
        Ok(())
    }

    /// Validate the configuration.
    fn validate(&self) -> Result<()> {
        self.mqtt().validate()
    }

    /// Parse a JSON5 document, apply overrides from `lookup`, then validate.
    fn from_json5(content: &str, lookup: &dyn Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config: Self = json5::from_str(content)?;
        config.apply_overrides(lookup)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a file path, with overrides from the process environment.
    fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(Error::ConfigNotFound {
                path: path.display().to_string(),
            });
        }

        let content = std::fs::read_to_string(path)?;
        Self::from_json5(&content, &|key| std::env::var(key).ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[derive(Debug, Deserialize)]
    struct TestConfig {
        mqtt: MqttConfig,
        #[serde(default)]
        logging: LoggingConfig,
    }

    impl BridgeConfig for TestConfig {
        fn mqtt(&self) -> &MqttConfig {
            &self.mqtt
        }

        fn logging(&self) -> &LoggingConfig {
            &self.logging
        }

        fn apply_overrides(&mut self, lookup: &dyn Fn(&str) -> Option<String>) -> Result<()> {
            self.mqtt.apply_overrides(lookup)
        }
    }

    fn no_env(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn test_parse_mqtt_defaults() {
        let config = TestConfig::from_json5(r#"{ mqtt: { host: "broker.local" } }"#, &no_env).unwrap();

        assert_eq!(config.mqtt.host, "broker.local");
        assert_eq!(config.mqtt.port, 1883);
        assert_eq!(config.mqtt.base_topic, "easywallbox");
        assert_eq!(config.mqtt.discovery_prefix, "homeassistant");
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.logging.format, LogFormat::Text);
    }

    #[test]
    fn test_json_logging_format() {
        let json5 = r#"
        {
            mqtt: { host: "broker" },
            logging: {
                level: "debug",
                format: "json",
            },
        }
        "#;

        let config = TestConfig::from_json5(json5, &no_env).unwrap();

        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.logging.format, LogFormat::Json);
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("MQTT_HOST", "10.0.0.2"),
            ("MQTT_PORT", "8883"),
            ("MQTT_USERNAME", "ha"),
            ("MQTT_PASSWORD", "secret"),
            ("MQTT_TOPIC", "garage/wallbox"),
        ]
        .into_iter()
        .collect();
        let lookup = |key: &str| env.get(key).map(|v| v.to_string());

        let config = TestConfig::from_json5(r#"{ mqtt: { host: "broker" } }"#, &lookup).unwrap();

        assert_eq!(config.mqtt.host, "10.0.0.2");
        assert_eq!(config.mqtt.port, 8883);
        assert_eq!(config.mqtt.username.as_deref(), Some("ha"));
        assert_eq!(config.mqtt.password.as_deref(), Some("secret"));
        assert_eq!(config.mqtt.base_topic, "garage/wallbox");
    }

    #[test]
    fn test_blank_env_is_ignored() {
        let lookup = |key: &str| (key == "MQTT_HOST").then(|| "  ".to_string());
        let config = TestConfig::from_json5(r#"{ mqtt: { host: "broker" } }"#, &lookup).unwrap();
        assert_eq!(config.mqtt.host, "broker");
    }

    #[test]
    fn test_invalid_port_override() {
        let lookup = |key: &str| (key == "MQTT_PORT").then(|| "http".to_string());
        let result = TestConfig::from_json5(r#"{ mqtt: { host: "broker" } }"#, &lookup);
        assert!(matches!(result, Err(Error::ConfigValidation(_))));
    }

    #[test]
    fn test_validate_rejects_wildcard_base_topic() {
        let result = TestConfig::from_json5(
            r#"{ mqtt: { host: "broker", base_topic: "easywallbox/#" } }"#,
            &no_env,
        );
        assert!(matches!(result, Err(Error::Topic(_))));
    }

    #[test]
    fn test_validate_rejects_empty_host() {
        let result = TestConfig::from_json5(r#"{ mqtt: { host: "" } }"#, &no_env);
        assert!(matches!(result, Err(Error::ConfigValidation(_))));
    }

    #[test]
    fn test_config_not_found() {
        let result = TestConfig::load("/nonexistent/path.json5");
        assert!(matches!(result, Err(Error::ConfigNotFound { .. })));
    }
}
