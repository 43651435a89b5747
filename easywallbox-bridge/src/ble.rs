//! Bluetooth LE transport built on btleplug.

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use btleplug::api::{
    Central, Characteristic, Manager as _, Peripheral as _, ScanFilter, ValueNotification,
    WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::stream::{Stream, StreamExt};
use tokio::time::{self, Instant};
use tracing::{debug, info, warn};

use crate::link::LinkError;
use crate::protocol::{RX_CHAR_UUID, ST_CHAR_UUID, TX_CHAR_UUID};
use crate::wireless::{Chunk, WirelessChannel, WirelessTransport};

/// Poll interval while scanning for the device.
const SCAN_POLL: Duration = Duration::from_millis(500);

fn ble_error(context: &str, e: btleplug::Error) -> LinkError {
    LinkError::transport(format!("{}: {}", context, e))
}

/// Opens BLE connections to the wallbox through a local adapter.
#[derive(Debug, Clone)]
pub struct BleTransport {
    /// Substring of the adapter description to use; first adapter if unset.
    adapter: Option<String>,
    scan_timeout: Duration,
}

impl BleTransport {
    pub fn new(adapter: Option<String>, scan_timeout: Duration) -> Self {
        Self {
            adapter,
            scan_timeout,
        }
    }

    async fn adapter(&self) -> Result<Adapter, LinkError> {
        let manager = Manager::new()
            .await
            .map_err(|e| ble_error("Bluetooth manager unavailable", e))?;
        let adapters = manager
            .adapters()
            .await
            .map_err(|e| ble_error("Failed to list adapters", e))?;

        let Some(wanted) = &self.adapter else {
            return adapters
                .into_iter()
                .next()
                .ok_or_else(|| LinkError::transport("No Bluetooth adapter found"));
        };

        for adapter in adapters {
            let info = adapter.adapter_info().await.unwrap_or_default();
            if info.contains(wanted.as_str()) {
                debug!(adapter = %info, "Using Bluetooth adapter");
                return Ok(adapter);
            }
        }
        Err(LinkError::transport(format!(
            "Bluetooth adapter '{}' not found",
            wanted
        )))
    }

    /// Scan until a peripheral with the given address shows up.
    async fn find(&self, adapter: &Adapter, address: &str) -> Result<Peripheral, LinkError> {
        adapter
            .start_scan(ScanFilter::default())
            .await
            .map_err(|e| ble_error("Failed to start scan", e))?;

        let deadline = Instant::now() + self.scan_timeout;
        let found = loop {
            if let Some(peripheral) = Self::lookup(adapter, address).await? {
                break Some(peripheral);
            }
            if Instant::now() >= deadline {
                break None;
            }
            time::sleep(SCAN_POLL).await;
        };

        if let Err(e) = adapter.stop_scan().await {
            warn!(error = %e, "Failed to stop scan");
        }

        found.ok_or_else(|| {
            LinkError::transport(format!(
                "Device {} not found within {:?}",
                address, self.scan_timeout
            ))
        })
    }

    async fn lookup(adapter: &Adapter, address: &str) -> Result<Option<Peripheral>, LinkError> {
        let peripherals = adapter
            .peripherals()
            .await
            .map_err(|e| ble_error("Failed to list peripherals", e))?;

        for peripheral in peripherals {
            if let Ok(Some(props)) = peripheral.properties().await {
                if props.address.to_string().eq_ignore_ascii_case(address) {
                    return Ok(Some(peripheral));
                }
            }
        }
        Ok(None)
    }
}

fn characteristic(peripheral: &Peripheral, uuid: uuid::Uuid) -> Result<Characteristic, LinkError> {
    peripheral
        .characteristics()
        .into_iter()
        .find(|c| c.uuid == uuid)
        .ok_or_else(|| LinkError::transport(format!("Characteristic {} not found", uuid)))
}

#[async_trait]
impl WirelessTransport for BleTransport {
    async fn open(&self, address: &str) -> Result<Box<dyn WirelessChannel>, LinkError> {
        let adapter = self.adapter().await?;
        let peripheral = self.find(&adapter, address).await?;

        let connected = peripheral.is_connected().await.unwrap_or(false);
        if !connected {
            peripheral
                .connect()
                .await
                .map_err(|e| ble_error("Failed to connect", e))?;
        }
        peripheral
            .discover_services()
            .await
            .map_err(|e| ble_error("Service discovery failed", e))?;

        let rx = characteristic(&peripheral, RX_CHAR_UUID)?;
        let tx = characteristic(&peripheral, TX_CHAR_UUID)?;
        let st = characteristic(&peripheral, ST_CHAR_UUID)?;

        let notifications = peripheral
            .notifications()
            .await
            .map_err(|e| ble_error("Failed to open notification stream", e))?;
        for c in [&tx, &st] {
            peripheral
                .subscribe(c)
                .await
                .map_err(|e| ble_error("Failed to subscribe", e))?;
        }

        info!(address = %address, "Bluetooth connection established");
        Ok(Box::new(BleChannel {
            peripheral,
            rx,
            notifications,
        }))
    }
}

struct BleChannel {
    peripheral: Peripheral,
    rx: Characteristic,
    notifications: Pin<Box<dyn Stream<Item = ValueNotification> + Send>>,
}

#[async_trait]
impl WirelessChannel for BleChannel {
    async fn write(&mut self, data: &[u8]) -> Result<(), LinkError> {
        self.peripheral
            .write(&self.rx, data, WriteType::WithoutResponse)
            .await
            .map_err(|e| ble_error("Write failed", e))
    }

    async fn recv(&mut self) -> Option<Chunk> {
        loop {
            let notification = self.notifications.next().await?;
            if notification.uuid == TX_CHAR_UUID {
                return Some(Chunk::tx(notification.value));
            }
            if notification.uuid == ST_CHAR_UUID {
                return Some(Chunk::st(notification.value));
            }
        }
    }

    async fn is_connected(&mut self) -> bool {
        self.peripheral.is_connected().await.unwrap_or(false)
    }

    async fn close(&mut self) {
        if let Err(e) = self.peripheral.disconnect().await {
            debug!(error = %e, "Disconnect failed");
        }
    }
}
