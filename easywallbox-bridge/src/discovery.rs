//! Home Assistant MQTT discovery documents.

use easywallbox_common::{TopicBuilder, discovery_topic};
use serde::Serialize;
use serde_json::{Map, Value, json};

use crate::bus::Publication;
use crate::mapper::{CommandMapper, DiscoveryDescriptor};

/// Node id used in every discovery topic.
pub const NODE_ID: &str = "easywallbox";

/// Topic suffix of the raw notification pass-through.
pub const MESSAGE_TOPIC: &str = "message";
/// Topic suffix of the availability signal.
pub const AVAILABILITY_TOPIC: &str = "availability";

/// Topic suffix of an entity's state echo.
pub fn state_topic(entity: &str) -> String {
    format!("{}/state", entity)
}

/// Device block shared by every entity.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceInfo {
    pub identifiers: Vec<String>,
    pub name: String,
    pub manufacturer: String,
    pub model: String,
    pub sw_version: String,
}

impl DeviceInfo {
    pub fn new(address: &str) -> Self {
        Self {
            identifiers: vec![address.to_string()],
            name: "EasyWallbox".to_string(),
            manufacturer: "Free2Move".to_string(),
            model: "EasyWallbox".to_string(),
            sw_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Builds the discovery document set for one device.
pub struct DiscoveryBuilder<'a> {
    topics: &'a TopicBuilder,
    prefix: &'a str,
    address: &'a str,
    device: DeviceInfo,
}

impl<'a> DiscoveryBuilder<'a> {
    pub fn new(topics: &'a TopicBuilder, prefix: &'a str, address: &'a str) -> Self {
        Self {
            topics,
            prefix,
            address,
            device: DeviceInfo::new(address),
        }
    }

    /// Stable unique id of an entity, derived from the device address.
    ///
    /// # Example
    /// ```
    /// use easywallbox_bridge::discovery::DiscoveryBuilder;
    /// use easywallbox_common::TopicBuilder;
    ///
    /// let topics = TopicBuilder::default();
    /// let builder = DiscoveryBuilder::new(&topics, "homeassistant", "AA:BB:CC:DD:EE:FF");
    /// assert_eq!(builder.unique_id("user_limit"), "easywallbox_aabbccddeeff_user_limit");
    /// ```
    pub fn unique_id(&self, object_id: &str) -> String {
        let address: String = self
            .address
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .map(|c| c.to_ascii_lowercase())
            .collect();
        format!("{}_{}_{}", NODE_ID, address, object_id)
    }

    /// Every document: one per mapped entity, then the message sensor and
    /// the connectivity sensor.
    pub fn build(&self, mapper: &CommandMapper) -> Vec<Publication> {
        let mut documents: Vec<Publication> = mapper
            .descriptors()
            .map(|descriptor| self.entity(descriptor))
            .collect();
        documents.push(self.message_sensor());
        documents.push(self.connectivity_sensor());
        documents
    }

    fn entity(&self, descriptor: &DiscoveryDescriptor) -> Publication {
        let mut config = self.base(descriptor.object_id, descriptor.name);
        config.insert(
            "command_topic".into(),
            json!(self.topics.build(&format!("set/{}", descriptor.object_id))),
        );

        match descriptor.component {
            "button" => {
                config.insert("payload_press".into(), json!("PRESS"));
            }
            "switch" => {
                config.insert(
                    "state_topic".into(),
                    json!(self.topics.build(&state_topic(descriptor.object_id))),
                );
                config.insert("payload_on".into(), json!("ON"));
                config.insert("payload_off".into(), json!("OFF"));
            }
            _ => {
                config.insert(
                    "state_topic".into(),
                    json!(self.topics.build(&state_topic(descriptor.object_id))),
                );
                if let Some(min) = descriptor.min {
                    config.insert("min".into(), json!(min));
                }
                if let Some(max) = descriptor.max {
                    config.insert("max".into(), json!(max));
                }
                config.insert("step".into(), json!(1));
                config.insert("mode".into(), json!("box"));
            }
        }
        if let Some(unit) = descriptor.unit {
            config.insert("unit_of_measurement".into(), json!(unit));
        }
        if let Some(icon) = descriptor.icon {
            config.insert("icon".into(), json!(icon));
        }
        self.availability(&mut config);

        self.publication(descriptor.component, descriptor.object_id, config)
    }

    fn message_sensor(&self) -> Publication {
        let mut config = self.base("last_message", "Last Message");
        config.insert(
            "state_topic".into(),
            json!(self.topics.build(MESSAGE_TOPIC)),
        );
        config.insert("icon".into(), json!("mdi:message-text"));
        self.availability(&mut config);
        self.publication("sensor", "last_message", config)
    }

    /// Fed by the availability topic itself, so it carries no availability.
    fn connectivity_sensor(&self) -> Publication {
        let mut config = self.base("connectivity", "Connectivity");
        config.insert("device_class".into(), json!("connectivity"));
        config.insert(
            "state_topic".into(),
            json!(self.topics.build(AVAILABILITY_TOPIC)),
        );
        config.insert("payload_on".into(), json!("online"));
        config.insert("payload_off".into(), json!("offline"));
        self.publication("binary_sensor", "connectivity", config)
    }

    fn base(&self, object_id: &str, name: &str) -> Map<String, Value> {
        let mut config = Map::new();
        config.insert("name".into(), json!(name));
        config.insert("unique_id".into(), json!(self.unique_id(object_id)));
        config.insert("device".into(), json!(self.device));
        config
    }

    fn availability(&self, config: &mut Map<String, Value>) {
        config.insert(
            "availability_topic".into(),
            json!(self.topics.build(AVAILABILITY_TOPIC)),
        );
    }

    fn publication(&self, component: &str, object_id: &str, config: Map<String, Value>) -> Publication {
        Publication::retained(
            discovery_topic(self.prefix, component, NODE_ID, object_id),
            Value::Object(config).to_string(),
        )
    }
}
