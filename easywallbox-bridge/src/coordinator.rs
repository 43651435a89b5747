//! Routing between the links and the availability signal.
//!
//! The coordinator runs as one task consuming the event queue both link
//! managers feed, so its state needs no locking. It never awaits a link:
//! sends and publishes fail fast and are logged.

use std::collections::{HashMap, VecDeque};

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::bus::{BusClient, BusHandle};
use crate::discovery::{AVAILABILITY_TOPIC, MESSAGE_TOPIC, state_topic};
use crate::link::{
    Availability, InboundMessage, LinkError, LinkEvent, LinkState, RawNotification, cancelled,
};
use crate::mapper::{CommandMapper, DeviceCommandString, StateUpdate};
use crate::protocol::Answer;
use crate::wireless::WirelessHandle;

/// Inbound topic suffix for bridge control requests.
pub const CONTROL_TOPIC: &str = "control";

/// Control payload forcing a wireless reconnect.
pub const RECONNECT_REQUEST: &str = "reconnect";

/// What the coordinator needs from the wireless link.
pub trait DeviceLink {
    fn state(&self) -> LinkState;
    fn send(&self, command: DeviceCommandString) -> Result<(), LinkError>;
    fn request_reconnect(&self) -> Result<(), LinkError>;
}

/// What the coordinator needs from the bus link.
pub trait BusLink {
    fn state(&self) -> LinkState;
    fn publish(&self, topic_suffix: &str, payload: &[u8], retained: bool) -> Result<(), LinkError>;
}

impl DeviceLink for WirelessHandle {
    fn state(&self) -> LinkState {
        WirelessHandle::state(self)
    }

    fn send(&self, command: DeviceCommandString) -> Result<(), LinkError> {
        WirelessHandle::send(self, command)
    }

    fn request_reconnect(&self) -> Result<(), LinkError> {
        WirelessHandle::request_reconnect(self)
    }
}

impl<C: BusClient> BusLink for BusHandle<C> {
    fn state(&self) -> LinkState {
        BusHandle::state(self)
    }

    fn publish(&self, topic_suffix: &str, payload: &[u8], retained: bool) -> Result<(), LinkError> {
        BusHandle::publish(self, topic_suffix, payload.to_vec(), retained)
    }
}

/// How optimistic state echoes are reconciled with the device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconcileMode {
    /// Publish the new value and never revisit it.
    #[default]
    Optimistic,
    /// Revert the echo when the next device answer rejects the write.
    OnNotification,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct PendingWrite {
    entity: &'static str,
    value: String,
}

/// Availability state and routing between the links.
pub struct Coordinator<D, B> {
    mapper: CommandMapper,
    device: D,
    bus: B,
    mode: ReconcileMode,
    wireless_state: LinkState,
    bus_state: LinkState,
    availability: Availability,
    /// Last value that actually reached the bus.
    published: Option<Availability>,
    confirmed: HashMap<&'static str, String>,
    pending: VecDeque<PendingWrite>,
}

impl<D: DeviceLink, B: BusLink> Coordinator<D, B> {
    pub fn new(mapper: CommandMapper, device: D, bus: B, mode: ReconcileMode) -> Self {
        Self {
            mapper,
            device,
            bus,
            mode,
            wireless_state: LinkState::Disconnected,
            bus_state: LinkState::Disconnected,
            availability: Availability::Offline,
            published: None,
            confirmed: HashMap::new(),
            pending: VecDeque::new(),
        }
    }

    /// Current derived availability.
    pub fn availability(&self) -> Availability {
        self.availability
    }

    /// Consume events until shutdown, then drain what is already queued.
    pub async fn run(
        mut self,
        mut events: mpsc::Receiver<LinkEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!(mode = ?self.mode, "Coordinator started");

        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => self.handle_event(event),
                    None => break,
                },
                _ = cancelled(&mut shutdown) => {
                    while let Ok(event) = events.try_recv() {
                        self.handle_event(event);
                    }
                    break;
                }
            }
        }

        info!(availability = %self.availability, "Coordinator stopped");
    }

    /// Apply one event. Never blocks.
    pub fn handle_event(&mut self, event: LinkEvent) {
        match event {
            LinkEvent::Wireless(state) => {
                self.wireless_state = state;
                if state != LinkState::Ready && !self.pending.is_empty() {
                    debug!(
                        pending = self.pending.len(),
                        "Wireless link lost, forgetting pending writes"
                    );
                    self.pending.clear();
                }
                self.refresh_availability();
            }
            LinkEvent::Bus(state) => {
                self.bus_state = state;
                if state == LinkState::Connected {
                    // Fresh session: the broker may have lost what we sent.
                    self.published = None;
                }
                self.refresh_availability();
            }
            LinkEvent::Notification(raw) => self.on_notification(raw),
            LinkEvent::Inbound(message) => self.on_inbound(message),
        }
    }

    fn refresh_availability(&mut self) {
        let next = Availability::derive(self.wireless_state, self.bus_state);
        if next != self.availability {
            info!(
                availability = %next,
                wireless = %self.wireless_state,
                bus = %self.bus_state,
                "Availability changed"
            );
            self.availability = next;
        }

        if self.published == Some(next) {
            return;
        }
        match self
            .bus
            .publish(AVAILABILITY_TOPIC, next.as_str().as_bytes(), true)
        {
            Ok(()) => self.published = Some(next),
            Err(LinkError::NotReady(_)) => {
                debug!(availability = %next, "Bus not connected, availability not published");
            }
            Err(e) => warn!(error = %e, "Failed to publish availability"),
        }
    }

    fn on_inbound(&mut self, message: InboundMessage) {
        let InboundMessage {
            topic_suffix,
            payload,
        } = message;

        if topic_suffix == CONTROL_TOPIC {
            self.on_control(&payload);
            return;
        }

        let resolution = match self.mapper.resolve_command(&topic_suffix, Some(&payload)) {
            Ok(resolution) => resolution,
            Err(e) => {
                warn!(topic = %topic_suffix, payload = %payload, error = %e, "Dropping command");
                return;
            }
        };

        for command in resolution.commands {
            let text = command.to_string();
            if let Err(e) = self.device.send(command) {
                warn!(
                    topic = %topic_suffix,
                    command = %text,
                    error = %e,
                    "Command not sent"
                );
                return;
            }
            debug!(topic = %topic_suffix, command = %text, "Command sent");
        }

        if let Some(update) = resolution.state {
            self.publish_state(update.entity, &update.value);
            self.track(update);
        }
    }

    fn on_control(&self, payload: &str) {
        if !payload.trim().eq_ignore_ascii_case(RECONNECT_REQUEST) {
            warn!(payload = %payload, "Unknown control request");
            return;
        }
        info!(state = %self.device.state(), "Wireless reconnect requested over the bus");
        if let Err(e) = self.device.request_reconnect() {
            warn!(error = %e, "Reconnect request failed");
        }
    }

    fn track(&mut self, update: StateUpdate) {
        match self.mode {
            ReconcileMode::Optimistic => {
                self.confirmed.insert(update.entity, update.value);
            }
            ReconcileMode::OnNotification => self.pending.push_back(PendingWrite {
                entity: update.entity,
                value: update.value,
            }),
        }
    }

    fn on_notification(&mut self, raw: RawNotification) {
        if self.mode == ReconcileMode::OnNotification {
            self.reconcile(&raw);
        }

        match self.bus.publish(MESSAGE_TOPIC, raw.as_bytes(), false) {
            Ok(()) => {}
            Err(LinkError::NotReady(state)) => {
                warn!(
                    bus = %state,
                    bytes = raw.as_bytes().len(),
                    "Bus not connected, notification dropped"
                );
            }
            Err(e) => warn!(error = %e, "Failed to forward notification"),
        }
    }

    /// Settle the oldest pending write against a device answer.
    fn reconcile(&mut self, raw: &RawNotification) {
        let Some(write) = self.pending.pop_front() else {
            return;
        };

        match Answer::parse(raw.as_bytes()) {
            Some(answer) if answer.is_rejection() => {
                warn!(
                    entity = write.entity,
                    value = %write.value,
                    answer = ?answer,
                    "Device rejected write"
                );
                if let Some(previous) = self.confirmed.get(write.entity).cloned() {
                    self.publish_state(write.entity, &previous);
                }
            }
            _ => {
                debug!(entity = write.entity, value = %write.value, "Write confirmed");
                self.confirmed.insert(write.entity, write.value);
            }
        }
    }

    fn publish_state(&self, entity: &str, value: &str) {
        if let Err(e) = self.bus.publish(&state_topic(entity), value.as_bytes(), true) {
            warn!(entity, error = %e, "Failed to publish state");
        }
    }
}
