//! Types shared by the wireless and bus link managers.

use std::fmt;
use std::time::Duration;

use tokio::sync::{mpsc, watch};

/// Connection lifecycle of a link.
///
/// The bus link only ever uses `Disconnected`, `Connecting` and `Connected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
    Authenticating,
    Ready,
}

impl LinkState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LinkState::Disconnected => "disconnected",
            LinkState::Connecting => "connecting",
            LinkState::Connected => "connected",
            LinkState::Authenticating => "authenticating",
            LinkState::Ready => "ready",
        }
    }
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors raised by the link managers and their transports.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LinkError {
    /// The link is not in the state required for the operation.
    #[error("link not ready (state: {0})")]
    NotReady(LinkState),

    /// The underlying transport failed.
    #[error("transport failure: {0}")]
    TransportFailure(String),

    /// The device rejected the authentication handshake.
    #[error("authentication failed: {0}")]
    AuthFailure(String),

    /// The link manager has been closed.
    #[error("link closed")]
    Closed,
}

impl LinkError {
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::TransportFailure(msg.into())
    }

    pub fn auth(msg: impl Into<String>) -> Self {
        Self::AuthFailure(msg.into())
    }
}

/// Derived health of the whole bridge, published on the availability topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Availability {
    Online,
    Offline,
}

impl Availability {
    /// Online iff the wireless link is `Ready` and the bus link is `Connected`.
    pub fn derive(wireless: LinkState, bus: LinkState) -> Self {
        if wireless == LinkState::Ready && bus == LinkState::Connected {
            Availability::Online
        } else {
            Availability::Offline
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Availability::Online => "online",
            Availability::Offline => "offline",
        }
    }
}

impl fmt::Display for Availability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A complete frame received from the device, passed through uninterpreted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawNotification(Vec<u8>);

impl RawNotification {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }
}

/// A message received on one of the command topics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    /// Topic with the base prefix stripped.
    pub topic_suffix: String,
    pub payload: String,
}

/// Everything the link managers report to the coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    Wireless(LinkState),
    Bus(LinkState),
    Notification(RawNotification),
    Inbound(InboundMessage),
}

/// Fixed-interval reconnect policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Delay between a failure and the next attempt.
    pub backoff: Duration,
    /// Consecutive failed attempts after which the link gives up. `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            backoff: Duration::from_secs(5),
            max_attempts: None,
        }
    }
}

impl ReconnectPolicy {
    /// Whether another attempt is allowed after `failures` consecutive failures.
    pub fn should_retry(&self, failures: u32) -> bool {
        match self.max_attempts {
            Some(max) => failures < max,
            None => true,
        }
    }
}

/// Publishes a link's state to its watchers and to the coordinator queue.
///
/// Only actual transitions are forwarded.
#[derive(Debug)]
pub(crate) struct StateReporter {
    link: &'static str,
    state: watch::Sender<LinkState>,
    events: mpsc::Sender<LinkEvent>,
    wrap: fn(LinkState) -> LinkEvent,
}

impl StateReporter {
    pub(crate) fn new(
        link: &'static str,
        events: mpsc::Sender<LinkEvent>,
        wrap: fn(LinkState) -> LinkEvent,
    ) -> (Self, watch::Receiver<LinkState>) {
        let (state, rx) = watch::channel(LinkState::Disconnected);
        (
            Self {
                link,
                state,
                events,
                wrap,
            },
            rx,
        )
    }

    pub(crate) fn current(&self) -> LinkState {
        *self.state.borrow()
    }

    pub(crate) async fn set(&self, next: LinkState) {
        let changed = self.state.send_if_modified(|state| {
            if *state == next {
                false
            } else {
                *state = next;
                true
            }
        });

        if changed {
            tracing::info!(link = self.link, state = %next, "Link state changed");
            if self.events.send((self.wrap)(next)).await.is_err() {
                tracing::debug!(link = self.link, "Coordinator queue closed");
            }
        }
    }

    pub(crate) async fn emit(&self, event: LinkEvent) {
        if self.events.send(event).await.is_err() {
            tracing::debug!(link = self.link, "Coordinator queue closed, event dropped");
        }
    }
}

/// Resolves once shutdown is requested or its sender is gone.
pub(crate) async fn cancelled(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_availability_requires_both_links() {
        use LinkState::*;

        assert_eq!(Availability::derive(Ready, Connected), Availability::Online);
        for wireless in [Disconnected, Connecting, Connected, Authenticating] {
            assert_eq!(
                Availability::derive(wireless, Connected),
                Availability::Offline
            );
        }
        for bus in [Disconnected, Connecting] {
            assert_eq!(Availability::derive(Ready, bus), Availability::Offline);
        }
    }

    #[test]
    fn test_reconnect_policy() {
        let unlimited = ReconnectPolicy::default();
        assert!(unlimited.should_retry(u32::MAX));

        let capped = ReconnectPolicy {
            max_attempts: Some(3),
            ..ReconnectPolicy::default()
        };
        assert!(capped.should_retry(2));
        assert!(!capped.should_retry(3));
    }

    #[tokio::test]
    async fn test_state_reporter_forwards_transitions_only() {
        let (tx, mut rx) = mpsc::channel(8);
        let (reporter, watcher) = StateReporter::new("test", tx, LinkEvent::Wireless);

        reporter.set(LinkState::Connecting).await;
        reporter.set(LinkState::Connecting).await;
        reporter.set(LinkState::Disconnected).await;

        assert_eq!(
            rx.recv().await,
            Some(LinkEvent::Wireless(LinkState::Connecting))
        );
        assert_eq!(
            rx.recv().await,
            Some(LinkEvent::Wireless(LinkState::Disconnected))
        );
        assert!(rx.try_recv().is_err());
        assert_eq!(*watcher.borrow(), LinkState::Disconnected);
    }
}
