//! Configuration for the EasyWallbox bridge.

use std::time::Duration;

use easywallbox_common::{BridgeConfig, Error, LoggingConfig, MqttConfig, Result, TopicBuilder};
use serde::{Deserialize, Serialize};

use crate::coordinator::ReconcileMode;
use crate::link::ReconnectPolicy;
use crate::wireless::WirelessSettings;

/// Complete bridge configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WallboxBridgeConfig {
    /// Wallbox connection settings
    #[serde(default)]
    pub wallbox: WallboxConfig,

    /// MQTT broker settings
    #[serde(default)]
    pub mqtt: MqttConfig,

    /// Bridge behaviour
    #[serde(default)]
    pub bridge: BridgeSettings,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Bluetooth side of the bridge.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WallboxConfig {
    /// Device address, `XX:XX:XX:XX:XX:XX`.
    #[serde(default)]
    pub address: String,

    /// Bluetooth PIN used to log in.
    #[serde(default)]
    pub pin: String,

    /// Adapter to use (substring of its description); first adapter if unset.
    #[serde(default)]
    pub adapter: Option<String>,

    /// How long to scan for the device per attempt.
    #[serde(default = "default_scan_timeout")]
    pub scan_timeout_secs: u64,

    /// How long to wait for the answer to the login command.
    #[serde(default = "default_auth_timeout")]
    pub auth_timeout_secs: u64,

    /// Fail the login when the device does not answer it.
    #[serde(default)]
    pub require_auth_ack: bool,
}

fn default_scan_timeout() -> u64 {
    10
}

fn default_auth_timeout() -> u64 {
    2
}

/// Reconnect, reconcile and queueing behaviour.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeSettings {
    /// Fixed delay between reconnect attempts of either link.
    #[serde(default = "default_backoff")]
    pub reconnect_backoff_secs: u64,

    /// Consecutive failures after which a link stops retrying. Unlimited if unset.
    #[serde(default)]
    pub max_reconnect_attempts: Option<u32>,

    /// How optimistic state echoes are reconciled.
    #[serde(default)]
    pub reconcile: ReconcileMode,

    /// Capacity of the coordinator event queue.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

fn default_backoff() -> u64 {
    5
}

fn default_queue_capacity() -> usize {
    64
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            reconnect_backoff_secs: default_backoff(),
            max_reconnect_attempts: None,
            reconcile: ReconcileMode::default(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

/// Check the `XX:XX:XX:XX:XX:XX` address form.
///
/// # Example
/// ```
/// use easywallbox_bridge::config::is_valid_address;
///
/// assert!(is_valid_address("8C:F6:81:AD:B8:3E"));
/// assert!(!is_valid_address("8C-F6-81-AD-B8-3E"));
/// ```
pub fn is_valid_address(address: &str) -> bool {
    let groups: Vec<&str> = address.split(':').collect();
    groups.len() == 6
        && groups
            .iter()
            .all(|g| g.len() == 2 && g.chars().all(|c| c.is_ascii_hexdigit()))
}

impl WallboxBridgeConfig {
    pub fn topics(&self) -> TopicBuilder {
        TopicBuilder::new(self.mqtt.base_topic.clone())
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            backoff: Duration::from_secs(self.bridge.reconnect_backoff_secs),
            max_attempts: self.bridge.max_reconnect_attempts,
        }
    }

    pub fn wireless_settings(&self) -> WirelessSettings {
        WirelessSettings {
            address: self.wallbox.address.clone(),
            pin: self.wallbox.pin.clone(),
            auth_timeout: Duration::from_secs(self.wallbox.auth_timeout_secs),
            require_auth_ack: self.wallbox.require_auth_ack,
            reconnect: self.reconnect_policy(),
            queue_capacity: self.bridge.queue_capacity,
        }
    }

    pub fn scan_timeout(&self) -> Duration {
        Duration::from_secs(self.wallbox.scan_timeout_secs)
    }
}

impl BridgeConfig for WallboxBridgeConfig {
    fn mqtt(&self) -> &MqttConfig {
        &self.mqtt
    }

    fn logging(&self) -> &LoggingConfig {
        &self.logging
    }

    fn apply_overrides(&mut self, lookup: &dyn Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(address) = lookup("WALLBOX_ADDRESS").filter(|v| !v.trim().is_empty()) {
            self.wallbox.address = address.trim().to_string();
        }
        if let Some(pin) = lookup("WALLBOX_PIN").filter(|v| !v.trim().is_empty()) {
            self.wallbox.pin = pin.trim().to_string();
        }
        self.mqtt.apply_overrides(lookup)
    }

    fn validate(&self) -> Result<()> {
        let wallbox = &self.wallbox;
        if wallbox.address.is_empty() {
            return Err(Error::validation(
                "wallbox.address is required (or set WALLBOX_ADDRESS)",
            ));
        }
        if !is_valid_address(&wallbox.address) {
            return Err(Error::validation(format!(
                "wallbox.address must look like XX:XX:XX:XX:XX:XX, got '{}'",
                wallbox.address
            )));
        }
        if wallbox.pin.is_empty() {
            return Err(Error::validation(
                "wallbox.pin is required (or set WALLBOX_PIN)",
            ));
        }
        if wallbox.pin.contains([',', '\n', '\r']) {
            return Err(Error::validation(
                "wallbox.pin must not contain ',' or line breaks",
            ));
        }
        if wallbox.scan_timeout_secs == 0 {
            return Err(Error::validation(
                "wallbox.scan_timeout_secs must be greater than 0",
            ));
        }
        if wallbox.auth_timeout_secs == 0 {
            return Err(Error::validation(
                "wallbox.auth_timeout_secs must be greater than 0",
            ));
        }

        let bridge = &self.bridge;
        if bridge.reconnect_backoff_secs == 0 {
            return Err(Error::validation(
                "bridge.reconnect_backoff_secs must be greater than 0",
            ));
        }
        if bridge.max_reconnect_attempts == Some(0) {
            return Err(Error::validation(
                "bridge.max_reconnect_attempts must be at least 1 (omit for unlimited)",
            ));
        }
        if bridge.queue_capacity == 0 {
            return Err(Error::validation(
                "bridge.queue_capacity must be greater than 0",
            ));
        }

        self.mqtt.validate()
    }
}
