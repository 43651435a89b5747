//! MQTT session built on rumqttc.

use std::time::Duration;

use async_trait::async_trait;
use easywallbox_common::MqttConfig;
use rumqttc::{
    AsyncClient, ClientError, ConnectReturnCode, Event, EventLoop, LastWill, MqttOptions, Packet,
    QoS, SubscribeFilter,
};

use crate::bus::{BusClient, BusEvent, BusEventSource};
use crate::link::LinkError;

/// Capacity of the client request channel; covers a full discovery burst.
const REQUEST_CAPACITY: usize = 64;

/// Payload of the last will registered on the availability topic.
pub const LAST_WILL_PAYLOAD: &str = "offline";

/// Build the client and event loop for a broker session.
///
/// Registers a retained last will on `will_topic` so an unclean exit still
/// marks the bridge offline.
pub fn session(config: &MqttConfig, will_topic: &str) -> (MqttClient, MqttEvents) {
    let (client, eventloop) = AsyncClient::new(options(config, will_topic), REQUEST_CAPACITY);
    (MqttClient { client }, MqttEvents { eventloop })
}

fn options(config: &MqttConfig, will_topic: &str) -> MqttOptions {
    let mut options = MqttOptions::new(&config.client_id, &config.host, config.port);
    options.set_keep_alive(Duration::from_secs(config.keep_alive_secs));
    options.set_clean_session(true);
    options.set_last_will(LastWill::new(
        will_topic,
        LAST_WILL_PAYLOAD,
        QoS::AtLeastOnce,
        true,
    ));
    if let Some(username) = &config.username {
        options.set_credentials(username, config.password.clone().unwrap_or_default());
    }
    options
}

fn request_error(e: ClientError) -> LinkError {
    LinkError::transport(format!("mqtt request failed: {}", e))
}

/// Request side of the session.
#[derive(Clone)]
pub struct MqttClient {
    client: AsyncClient,
}

impl BusClient for MqttClient {
    fn publish(&self, topic: &str, payload: Vec<u8>, retained: bool) -> Result<(), LinkError> {
        self.client
            .try_publish(topic, QoS::AtLeastOnce, retained, payload)
            .map_err(request_error)
    }

    fn subscribe(&self, filters: &[String]) -> Result<(), LinkError> {
        if filters.is_empty() {
            return Ok(());
        }
        let filters = filters
            .iter()
            .map(|filter| SubscribeFilter::new(filter.clone(), QoS::AtLeastOnce));
        self.client.try_subscribe_many(filters).map_err(request_error)
    }

    fn disconnect(&self) -> Result<(), LinkError> {
        self.client.try_disconnect().map_err(request_error)
    }
}

/// Event side of the session.
pub struct MqttEvents {
    eventloop: EventLoop,
}

#[async_trait]
impl BusEventSource for MqttEvents {
    async fn next_event(&mut self) -> Result<BusEvent, LinkError> {
        match self.eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                if ack.code == ConnectReturnCode::Success {
                    Ok(BusEvent::Connected)
                } else {
                    Err(LinkError::transport(format!(
                        "broker refused connection: {:?}",
                        ack.code
                    )))
                }
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => Ok(BusEvent::Message {
                topic: publish.topic,
                payload: publish.payload.to_vec(),
            }),
            Ok(_) => Ok(BusEvent::Other),
            Err(e) => Err(LinkError::transport(e.to_string())),
        }
    }
}
