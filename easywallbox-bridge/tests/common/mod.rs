//! Mock transports for driving a whole bridge in tests.
//!
//! Every test runs on a paused clock, so backoff and timeouts elapse
//! instantly once all tasks are idle.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use easywallbox_bridge::bus::{BusClient, BusEvent, BusEventSource};
use easywallbox_bridge::wireless::{Chunk, WirelessChannel, WirelessTransport};
use easywallbox_bridge::{Bridge, LinkError, WallboxBridgeConfig};
use easywallbox_common::BridgeConfig;
use tokio::sync::mpsc;

pub const ADDRESS: &str = "8C:F6:81:AD:B8:3E";

/// How the mock device answers the login command.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Auth {
    #[default]
    Accept,
    Reject,
    Silent,
}

#[derive(Default)]
struct DeviceState {
    opens: AtomicU32,
    closes: AtomicU32,
    fail_open: AtomicBool,
    auth: Mutex<Auth>,
    replies: Mutex<HashMap<String, String>>,
    written: Mutex<Vec<String>>,
    feed: Mutex<Option<mpsc::UnboundedSender<Chunk>>>,
    connected: Arc<AtomicBool>,
}

/// A scripted wallbox. Clones share state.
#[derive(Clone, Default)]
pub struct MockDevice {
    state: Arc<DeviceState>,
}

impl MockDevice {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_auth(&self, auth: Auth) {
        *self.state.auth.lock().unwrap() = auth;
    }

    pub fn set_fail_open(&self, fail: bool) {
        self.state.fail_open.store(fail, Ordering::SeqCst);
    }

    /// Answer `command` (without terminator) with `answer`.
    pub fn reply(&self, command: &str, answer: &str) {
        self.state
            .replies
            .lock()
            .unwrap()
            .insert(command.to_string(), answer.to_string());
    }

    pub fn opens(&self) -> u32 {
        self.state.opens.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> u32 {
        self.state.closes.load(Ordering::SeqCst)
    }

    /// Every line written, terminators stripped.
    pub fn written(&self) -> Vec<String> {
        self.state.written.lock().unwrap().clone()
    }

    /// Written lines other than login and logout.
    pub fn commands(&self) -> Vec<String> {
        self.written()
            .into_iter()
            .filter(|line| !line.starts_with("$BLE,"))
            .collect()
    }

    /// Push a notification chunk on the TX characteristic.
    pub fn notify(&self, data: &str) {
        if let Some(feed) = self.state.feed.lock().unwrap().as_ref() {
            let _ = feed.send(Chunk::tx(data.as_bytes().to_vec()));
        }
    }

    /// End the notification stream of the current connection.
    pub fn drop_connection(&self) {
        self.state.feed.lock().unwrap().take();
    }

    /// Make the transport report a lost connection on the next liveness poll.
    pub fn go_silent(&self) {
        self.state.connected.store(false, Ordering::SeqCst);
    }
}

#[async_trait]
impl WirelessTransport for MockDevice {
    async fn open(&self, address: &str) -> Result<Box<dyn WirelessChannel>, LinkError> {
        assert_eq!(address, ADDRESS);
        self.state.opens.fetch_add(1, Ordering::SeqCst);
        if self.state.fail_open.load(Ordering::SeqCst) {
            return Err(LinkError::transport("device not found"));
        }

        let (feed, notifications) = mpsc::unbounded_channel();
        *self.state.feed.lock().unwrap() = Some(feed);
        self.state.connected.store(true, Ordering::SeqCst);

        Ok(Box::new(MockChannel {
            device: self.clone(),
            notifications,
            pending: Vec::new(),
        }))
    }
}

struct MockChannel {
    device: MockDevice,
    notifications: mpsc::UnboundedReceiver<Chunk>,
    /// Answers produced by writes, delivered before the feed.
    pending: Vec<Chunk>,
}

#[async_trait]
impl WirelessChannel for MockChannel {
    async fn write(&mut self, data: &[u8]) -> Result<(), LinkError> {
        let line = String::from_utf8_lossy(data).trim_end().to_string();
        self.device.state.written.lock().unwrap().push(line.clone());

        if line.starts_with("$BLE,AUTH,") {
            match *self.device.state.auth.lock().unwrap() {
                Auth::Accept => self.pending.push(Chunk::tx(b"$BLE,AUTH,OK\n".to_vec())),
                Auth::Reject => self.pending.push(Chunk::tx(b"$BLE,AUTH,FAIL\n".to_vec())),
                Auth::Silent => {}
            }
        } else if let Some(answer) = self.device.state.replies.lock().unwrap().get(&line) {
            self.pending.push(Chunk::tx(answer.as_bytes().to_vec()));
        }
        Ok(())
    }

    async fn recv(&mut self) -> Option<Chunk> {
        if !self.pending.is_empty() {
            return Some(self.pending.remove(0));
        }
        self.notifications.recv().await
    }

    async fn is_connected(&mut self) -> bool {
        self.device.state.connected.load(Ordering::SeqCst)
    }

    async fn close(&mut self) {
        self.device.state.closes.fetch_add(1, Ordering::SeqCst);
    }
}

/// One request seen by the mock broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusRecord {
    Publish {
        topic: String,
        payload: String,
        retained: bool,
    },
    Subscribe(Vec<String>),
    Disconnect,
}

/// Shared record of broker requests.
#[derive(Clone, Default)]
pub struct BusLog(Arc<Mutex<Vec<BusRecord>>>);

impl BusLog {
    pub fn records(&self) -> Vec<BusRecord> {
        self.0.lock().unwrap().clone()
    }

    pub fn clear(&self) {
        self.0.lock().unwrap().clear();
    }

    /// `(topic, payload)` of every publish on `topic`.
    pub fn published_on(&self, topic: &str) -> Vec<String> {
        self.records()
            .into_iter()
            .filter_map(|record| match record {
                BusRecord::Publish { topic: t, payload, .. } if t == topic => Some(payload),
                _ => None,
            })
            .collect()
    }

    pub fn availability(&self) -> Vec<String> {
        self.published_on("easywallbox/availability")
    }

    pub fn last_availability(&self) -> Option<String> {
        self.availability().pop()
    }

    /// Index of the first record matching `pred`.
    pub fn position(&self, pred: impl Fn(&BusRecord) -> bool) -> Option<usize> {
        self.records().iter().position(pred)
    }

    fn push(&self, record: BusRecord) {
        self.0.lock().unwrap().push(record);
    }
}

pub struct MockBusClient {
    log: BusLog,
}

impl BusClient for MockBusClient {
    fn publish(&self, topic: &str, payload: Vec<u8>, retained: bool) -> Result<(), LinkError> {
        self.log.push(BusRecord::Publish {
            topic: topic.to_string(),
            payload: String::from_utf8_lossy(&payload).into_owned(),
            retained,
        });
        Ok(())
    }

    fn subscribe(&self, filters: &[String]) -> Result<(), LinkError> {
        self.log.push(BusRecord::Subscribe(filters.to_vec()));
        Ok(())
    }

    fn disconnect(&self) -> Result<(), LinkError> {
        self.log.push(BusRecord::Disconnect);
        Ok(())
    }
}

pub struct MockBusEvents {
    events: mpsc::UnboundedReceiver<Result<BusEvent, LinkError>>,
}

#[async_trait]
impl BusEventSource for MockBusEvents {
    async fn next_event(&mut self) -> Result<BusEvent, LinkError> {
        match self.events.recv().await {
            Some(event) => event,
            None => std::future::pending().await,
        }
    }
}

/// Drives the mock broker session.
#[derive(Clone)]
pub struct Broker {
    events: mpsc::UnboundedSender<Result<BusEvent, LinkError>>,
}

impl Broker {
    pub fn accept(&self) {
        let _ = self.events.send(Ok(BusEvent::Connected));
    }

    pub fn drop_connection(&self) {
        let _ = self
            .events
            .send(Err(LinkError::transport("connection reset by peer")));
    }

    /// Deliver a message on `easywallbox/<suffix>`.
    pub fn deliver(&self, suffix: &str, payload: &str) {
        let _ = self.events.send(Ok(BusEvent::Message {
            topic: format!("easywallbox/{}", suffix),
            payload: payload.as_bytes().to_vec(),
        }));
    }
}

pub fn mock_bus() -> (MockBusClient, MockBusEvents, BusLog, Broker) {
    let (tx, rx) = mpsc::unbounded_channel();
    let log = BusLog::default();
    (
        MockBusClient { log: log.clone() },
        MockBusEvents { events: rx },
        log,
        Broker { events: tx },
    )
}

/// Test configuration; `bridge` is spliced into the `bridge` section.
pub fn config(bridge: &str) -> WallboxBridgeConfig {
    let content = format!(
        r#"{{
            wallbox: {{ address: "{}", pin: "1234" }},
            mqtt: {{ host: "localhost" }},
            bridge: {{ reconnect_backoff_secs: 1, {} }},
        }}"#,
        ADDRESS, bridge
    );
    WallboxBridgeConfig::from_json5(&content, &|_| None).unwrap()
}

/// A bridge wired to mock transports.
pub struct Harness {
    pub bridge: Bridge<MockBusClient>,
    pub device: MockDevice,
    pub bus: BusLog,
    pub broker: Broker,
}

impl Harness {
    pub fn start(config: &WallboxBridgeConfig, device: MockDevice) -> Self {
        let (client, events, bus, broker) = mock_bus();
        let bridge = Bridge::start_with(config, device.clone(), client, events);
        Self {
            bridge,
            device,
            bus,
            broker,
        }
    }

    /// Both links up and `online` published.
    pub async fn online(config: &WallboxBridgeConfig) -> Self {
        let harness = Self::start(config, MockDevice::new());
        harness.broker.accept();
        let bus = harness.bus.clone();
        eventually("online", || {
            bus.last_availability().as_deref() == Some("online")
        })
        .await;
        harness
    }
}

/// Poll `check` on the paused clock until it holds.
pub async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    for _ in 0..3_000 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {}", what);
}

/// Let every task run until idle.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}
