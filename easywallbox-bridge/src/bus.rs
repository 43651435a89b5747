//! Bus link manager.
//!
//! The bus client reconnects by itself when its event source is polled again
//! after a failure; this manager drives that loop with a fixed backoff,
//! publishes the discovery set and places subscriptions on every connect,
//! and reports state and inbound messages to the coordinator.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use easywallbox_common::TopicBuilder;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tracing::{debug, error, info, trace, warn};

use crate::link::{
    InboundMessage, LinkError, LinkEvent, LinkState, ReconnectPolicy, StateReporter, cancelled,
};

/// How long queued requests get to reach the broker on close.
const FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

/// One message to publish, with a full topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publication {
    pub topic: String,
    pub payload: Vec<u8>,
    pub retained: bool,
}

impl Publication {
    pub fn retained(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            retained: true,
        }
    }
}

/// Events produced by a bus session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusEvent {
    /// The broker accepted the session.
    Connected,
    /// A message arrived on a subscribed topic.
    Message { topic: String, payload: Vec<u8> },
    /// Protocol traffic the bridge does not act on.
    Other,
}

/// Source of bus session events.
#[async_trait]
pub trait BusEventSource: Send + 'static {
    /// Next event. An error means the session is lost; polling again
    /// starts a new connection attempt.
    async fn next_event(&mut self) -> Result<BusEvent, LinkError>;
}

/// Non-blocking request side of a bus session.
pub trait BusClient: Send + Sync + 'static {
    fn publish(&self, topic: &str, payload: Vec<u8>, retained: bool) -> Result<(), LinkError>;
    fn subscribe(&self, filters: &[String]) -> Result<(), LinkError>;
    fn disconnect(&self) -> Result<(), LinkError>;
}

/// Settings of the bus link.
#[derive(Debug, Clone)]
pub struct BusSettings {
    pub topics: TopicBuilder,
    /// Filters relative to the base topic.
    pub subscriptions: Vec<String>,
    /// Published before subscribing, on every connect.
    pub discovery: Vec<Publication>,
    pub reconnect: ReconnectPolicy,
}

/// Cloneable access to a running bus link.
pub struct BusHandle<C> {
    state: watch::Receiver<LinkState>,
    client: Arc<C>,
    topics: TopicBuilder,
}

impl<C> Clone for BusHandle<C> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
            client: Arc::clone(&self.client),
            topics: self.topics.clone(),
        }
    }
}

impl<C: BusClient> BusHandle<C> {
    pub fn state(&self) -> LinkState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<LinkState> {
        self.state.clone()
    }

    /// Publish under the base topic.
    ///
    /// Fails fast with [`LinkError::NotReady`] unless `Connected`.
    pub fn publish(
        &self,
        topic_suffix: &str,
        payload: impl Into<Vec<u8>>,
        retained: bool,
    ) -> Result<(), LinkError> {
        let state = self.state();
        if state != LinkState::Connected {
            return Err(LinkError::NotReady(state));
        }

        let topic = self.topics.build(topic_suffix);
        let payload = payload.into();
        trace!(topic = %topic, bytes = payload.len(), retained, "Publishing");
        self.client.publish(&topic, payload, retained)
    }
}

/// Owns the bus link task.
pub struct BusLinkManager<C> {
    handle: BusHandle<C>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl<C: BusClient> BusLinkManager<C> {
    /// Spawn the bus task over an already configured client and event source.
    pub fn start<E: BusEventSource>(
        client: C,
        events_source: E,
        settings: BusSettings,
        events: mpsc::Sender<LinkEvent>,
    ) -> Self {
        let (reporter, state) = StateReporter::new("bus", events, LinkEvent::Bus);
        let (shutdown, shutdown_rx) = watch::channel(false);
        let client = Arc::new(client);
        let topics = settings.topics.clone();

        let worker = Worker {
            client: Arc::clone(&client),
            source: events_source,
            settings,
            reporter,
            shutdown: shutdown_rx,
        };
        let task = tokio::spawn(worker.run());

        Self {
            handle: BusHandle {
                state,
                client,
                topics,
            },
            shutdown,
            task,
        }
    }

    pub fn handle(&self) -> BusHandle<C> {
        self.handle.clone()
    }

    pub fn state(&self) -> LinkState {
        self.handle.state()
    }

    pub fn publish(
        &self,
        topic_suffix: &str,
        payload: impl Into<Vec<u8>>,
        retained: bool,
    ) -> Result<(), LinkError> {
        self.handle.publish(topic_suffix, payload, retained)
    }

    /// Disconnect from the broker and wait for the task to finish.
    pub async fn close(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            error!(error = %e, "Bus link task failed");
        }
    }
}

struct Worker<C, E> {
    client: Arc<C>,
    source: E,
    settings: BusSettings,
    reporter: StateReporter,
    shutdown: watch::Receiver<bool>,
}

impl<C: BusClient, E: BusEventSource> Worker<C, E> {
    async fn run(mut self) {
        let mut failures: u32 = 0;
        self.reporter.set(LinkState::Connecting).await;

        loop {
            let event = tokio::select! {
                event = self.source.next_event() => event,
                _ = cancelled(&mut self.shutdown) => break,
            };

            match event {
                Ok(BusEvent::Connected) => {
                    failures = 0;
                    self.on_connected().await;
                }
                Ok(BusEvent::Message { topic, payload }) => self.on_message(topic, payload).await,
                Ok(BusEvent::Other) => {}
                Err(e) => {
                    self.reporter.set(LinkState::Disconnected).await;
                    failures = failures.saturating_add(1);
                    warn!(error = %e, failures, "Bus connection lost");

                    if !self.settings.reconnect.should_retry(failures) {
                        error!(failures, "Giving up on bus connection");
                        cancelled(&mut self.shutdown).await;
                        break;
                    }

                    let resume = tokio::select! {
                        _ = time::sleep(self.settings.reconnect.backoff) => true,
                        _ = cancelled(&mut self.shutdown) => false,
                    };
                    if !resume {
                        break;
                    }
                    self.reporter.set(LinkState::Connecting).await;
                }
            }
        }

        if self.reporter.current() == LinkState::Connected {
            match self.client.disconnect() {
                Ok(()) => self.flush().await,
                Err(e) => debug!(error = %e, "Disconnect request failed"),
            }
        }
        self.reporter.set(LinkState::Disconnected).await;
        info!("Bus link stopped");
    }

    /// Keep polling until the disconnect has gone out.
    async fn flush(&mut self) {
        let deadline = Instant::now() + FLUSH_TIMEOUT;
        while let Ok(Ok(_)) = time::timeout_at(deadline, self.source.next_event()).await {}
    }

    /// Discovery first, then subscriptions, then report `Connected`.
    async fn on_connected(&mut self) {
        info!(
            base = %self.settings.topics.base(),
            documents = self.settings.discovery.len(),
            "Connected to broker"
        );

        for publication in &self.settings.discovery {
            if let Err(e) = self.client.publish(
                &publication.topic,
                publication.payload.clone(),
                publication.retained,
            ) {
                warn!(topic = %publication.topic, error = %e, "Failed to publish discovery");
            }
        }

        let filters: Vec<String> = self
            .settings
            .subscriptions
            .iter()
            .map(|suffix| self.settings.topics.build(suffix))
            .collect();
        match self.client.subscribe(&filters) {
            Ok(()) => debug!(count = filters.len(), "Subscribed to command topics"),
            Err(e) => warn!(error = %e, "Failed to subscribe to command topics"),
        }

        self.reporter.set(LinkState::Connected).await;
    }

    async fn on_message(&mut self, topic: String, payload: Vec<u8>) {
        let Some(suffix) = self.settings.topics.strip(&topic) else {
            debug!(topic = %topic, "Ignoring message outside base topic");
            return;
        };
        let payload = String::from_utf8_lossy(&payload).into_owned();
        debug!(topic = %topic, payload = %payload, "Inbound message");

        self.reporter
            .emit(LinkEvent::Inbound(InboundMessage {
                topic_suffix: suffix.to_string(),
                payload,
            }))
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingClient {
        published: Mutex<Vec<(String, Vec<u8>, bool)>>,
    }

    impl BusClient for RecordingClient {
        fn publish(&self, topic: &str, payload: Vec<u8>, retained: bool) -> Result<(), LinkError> {
            self.published
                .lock()
                .unwrap()
                .push((topic.to_string(), payload, retained));
            Ok(())
        }

        fn subscribe(&self, _filters: &[String]) -> Result<(), LinkError> {
            Ok(())
        }

        fn disconnect(&self) -> Result<(), LinkError> {
            Ok(())
        }
    }

    fn handle(state: LinkState) -> (watch::Sender<LinkState>, BusHandle<RecordingClient>) {
        let (tx, rx) = watch::channel(state);
        (
            tx,
            BusHandle {
                state: rx,
                client: Arc::new(RecordingClient::default()),
                topics: TopicBuilder::new("easywallbox"),
            },
        )
    }

    #[test]
    fn test_publish_requires_connected() {
        let (_tx, bus) = handle(LinkState::Connecting);
        assert_eq!(
            bus.publish("message", "x", false),
            Err(LinkError::NotReady(LinkState::Connecting))
        );
        assert!(bus.client.published.lock().unwrap().is_empty());
    }

    #[test]
    fn test_publish_prefixes_base() {
        let (_tx, bus) = handle(LinkState::Connected);
        bus.publish("availability", "online", true).unwrap();

        let published = bus.client.published.lock().unwrap();
        assert_eq!(
            published.as_slice(),
            &[(
                "easywallbox/availability".to_string(),
                b"online".to_vec(),
                true
            )]
        );
    }

    #[test]
    fn test_publication_retained() {
        let publication = Publication::retained("a/b", "{}");
        assert!(publication.retained);
        assert_eq!(publication.payload, b"{}".to_vec());
    }
}
