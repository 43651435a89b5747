//! Bridge lifecycle: wiring, startup and ordered shutdown.

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::ble::BleTransport;
use crate::bus::{BusClient, BusEventSource, BusHandle, BusLinkManager, BusSettings};
use crate::config::WallboxBridgeConfig;
use crate::coordinator::{CONTROL_TOPIC, Coordinator};
use crate::discovery::{AVAILABILITY_TOPIC, DiscoveryBuilder};
use crate::mapper::CommandMapper;
use crate::mqtt::{self, MqttClient};
use crate::wireless::{WirelessHandle, WirelessLinkManager, WirelessTransport};

/// A running bridge: both link managers plus the coordinator task.
///
/// # Example
///
/// ```ignore
/// use easywallbox_bridge::{Bridge, WallboxBridgeConfig};
/// use easywallbox_common::BridgeConfig;
///
/// let config = WallboxBridgeConfig::load("easywallbox.json5")?;
/// let bridge = Bridge::start(&config);
/// tokio::signal::ctrl_c().await?;
/// bridge.shutdown().await;
/// ```
pub struct Bridge<C: BusClient> {
    wireless: WirelessLinkManager,
    bus: BusLinkManager<C>,
    coordinator: JoinHandle<()>,
    coordinator_shutdown: watch::Sender<bool>,
}

impl Bridge<MqttClient> {
    /// Start against the local Bluetooth adapter and the configured broker.
    pub fn start(config: &WallboxBridgeConfig) -> Self {
        let transport = BleTransport::new(config.wallbox.adapter.clone(), config.scan_timeout());
        let will_topic = config.topics().build(AVAILABILITY_TOPIC);
        let (client, events) = mqtt::session(&config.mqtt, &will_topic);

        info!(
            broker = %format!("{}:{}", config.mqtt.host, config.mqtt.port),
            base_topic = %config.mqtt.base_topic,
            "Using MQTT broker"
        );
        Self::start_with(config, transport, client, events)
    }
}

impl<C: BusClient> Bridge<C> {
    /// Start over the given transports.
    pub fn start_with<T, E>(config: &WallboxBridgeConfig, transport: T, client: C, events: E) -> Self
    where
        T: WirelessTransport,
        E: BusEventSource,
    {
        let topics = config.topics();
        let mapper = CommandMapper::new(topics.clone());

        let discovery =
            DiscoveryBuilder::new(&topics, &config.mqtt.discovery_prefix, &config.wallbox.address)
                .build(&mapper);
        let mut subscriptions = mapper.topic_filters();
        subscriptions.push(CONTROL_TOPIC.to_string());

        let (events_tx, events_rx) = mpsc::channel(config.bridge.queue_capacity);

        let bus = BusLinkManager::start(
            client,
            events,
            BusSettings {
                topics,
                subscriptions,
                discovery,
                reconnect: config.reconnect_policy(),
            },
            events_tx.clone(),
        );
        let wireless =
            WirelessLinkManager::start(transport, config.wireless_settings(), events_tx);

        let coordinator = Coordinator::new(
            mapper,
            wireless.handle(),
            bus.handle(),
            config.bridge.reconcile,
        );
        let (coordinator_shutdown, shutdown_rx) = watch::channel(false);
        let coordinator = tokio::spawn(coordinator.run(events_rx, shutdown_rx));

        info!(
            version = env!("CARGO_PKG_VERSION"),
            address = %config.wallbox.address,
            reconcile = ?config.bridge.reconcile,
            "Bridge started"
        );

        Self {
            wireless,
            bus,
            coordinator,
            coordinator_shutdown,
        }
    }

    pub fn wireless(&self) -> WirelessHandle {
        self.wireless.handle()
    }

    pub fn bus(&self) -> BusHandle<C> {
        self.bus.handle()
    }

    /// Stop everything. The wireless link goes first so the coordinator can
    /// still publish `offline` before the bus session is closed.
    pub async fn shutdown(self) {
        info!("Shutting down bridge");

        self.wireless.close().await;

        let _ = self.coordinator_shutdown.send(true);
        if let Err(e) = self.coordinator.await {
            error!(error = %e, "Coordinator task failed");
        }

        self.bus.close().await;
        info!("Bridge stopped");
    }
}
