//! Wireless link manager.
//!
//! A single background task owns the transport channel and walks the
//! `Disconnected → Connecting → Connected → Authenticating → Ready` lifecycle,
//! reconnecting after a fixed backoff whenever the link drops.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};

use crate::link::{
    LinkError, LinkEvent, LinkState, RawNotification, ReconnectPolicy, StateReporter, cancelled,
};
use crate::mapper::DeviceCommandString;
use crate::protocol::{self, Answer, TERMINATOR};

/// Longest frame accepted from the device before the buffer is discarded.
pub const MAX_FRAME_LEN: usize = 4096;

/// Interval of the transport liveness check while `Ready`.
pub const LIVENESS_INTERVAL: Duration = Duration::from_secs(1);

/// Characteristic a notification chunk arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Characteristic {
    /// Command answers and asynchronous data.
    Tx,
    /// Status frames.
    St,
}

/// A raw notification chunk as delivered by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub source: Characteristic,
    pub data: Vec<u8>,
}

impl Chunk {
    pub fn tx(data: impl Into<Vec<u8>>) -> Self {
        Self {
            source: Characteristic::Tx,
            data: data.into(),
        }
    }

    pub fn st(data: impl Into<Vec<u8>>) -> Self {
        Self {
            source: Characteristic::St,
            data: data.into(),
        }
    }
}

/// Opens channels to a device.
#[async_trait]
pub trait WirelessTransport: Send + Sync + 'static {
    /// Establish the transport and subscribe to notifications.
    async fn open(&self, address: &str) -> Result<Box<dyn WirelessChannel>, LinkError>;
}

/// An open duplex channel to the device.
#[async_trait]
pub trait WirelessChannel: Send {
    /// Write one command line.
    async fn write(&mut self, data: &[u8]) -> Result<(), LinkError>;

    /// Next notification chunk, or `None` once the notification streams end.
    ///
    /// Must be cancel safe: it is polled inside `select!`.
    async fn recv(&mut self) -> Option<Chunk>;

    /// Whether the transport still reports a connection.
    async fn is_connected(&mut self) -> bool;

    /// Tear down the connection. Errors are logged, not returned.
    async fn close(&mut self);
}

/// Reassembles `\n`-terminated frames from arbitrarily split chunks.
#[derive(Debug)]
pub struct LineAssembler {
    buf: Vec<u8>,
    max_len: usize,
    overflowed: bool,
}

impl LineAssembler {
    pub fn new(max_len: usize) -> Self {
        Self {
            buf: Vec::new(),
            max_len,
            overflowed: false,
        }
    }

    /// Feed a chunk, returning every frame it completes (terminator included).
    ///
    /// # Example
    /// ```
    /// use easywallbox_bridge::wireless::LineAssembler;
    ///
    /// let mut lines = LineAssembler::new(64);
    /// assert!(lines.push(b"$EEP,RE").is_empty());
    /// assert_eq!(lines.push(b"AD,ST\n$DA"), vec![b"$EEP,READ,ST\n".to_vec()]);
    /// ```
    pub fn push(&mut self, data: &[u8]) -> Vec<Vec<u8>> {
        let mut frames = Vec::new();
        for &byte in data {
            if self.overflowed {
                // Skip the rest of the oversized frame.
                if byte == TERMINATOR {
                    self.overflowed = false;
                }
                continue;
            }

            self.buf.push(byte);
            if byte == TERMINATOR {
                frames.push(std::mem::take(&mut self.buf));
            } else if self.buf.len() >= self.max_len {
                warn!(
                    discarded = self.buf.len(),
                    "Notification frame exceeds limit, discarding"
                );
                self.buf.clear();
                self.overflowed = true;
            }
        }
        frames
    }

    /// Bytes of the incomplete frame currently buffered.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}

/// Frames both notification characteristics; only TX frames are returned.
#[derive(Debug)]
struct Framer {
    tx: LineAssembler,
    st: LineAssembler,
}

impl Framer {
    fn new() -> Self {
        Self {
            tx: LineAssembler::new(MAX_FRAME_LEN),
            st: LineAssembler::new(MAX_FRAME_LEN),
        }
    }

    fn push(&mut self, chunk: Chunk) -> Vec<Vec<u8>> {
        match chunk.source {
            Characteristic::Tx => self.tx.push(&chunk.data),
            Characteristic::St => {
                for frame in self.st.push(&chunk.data) {
                    debug!(
                        status = %String::from_utf8_lossy(protocol::trim_line(&frame)),
                        "Status frame"
                    );
                }
                Vec::new()
            }
        }
    }
}

/// Settings of the wireless link.
#[derive(Debug, Clone)]
pub struct WirelessSettings {
    /// Device address (`XX:XX:XX:XX:XX:XX`).
    pub address: String,
    pub pin: String,
    /// How long to wait for an answer to the login command.
    pub auth_timeout: Duration,
    /// Treat a missing login answer as a failure.
    pub require_auth_ack: bool,
    pub reconnect: ReconnectPolicy,
    /// Capacity of the outgoing command queue.
    pub queue_capacity: usize,
}

impl WirelessSettings {
    pub fn new(address: impl Into<String>, pin: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            pin: pin.into(),
            auth_timeout: Duration::from_secs(2),
            require_auth_ack: false,
            reconnect: ReconnectPolicy::default(),
            queue_capacity: 16,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Control {
    Reconnect,
}

/// Cloneable access to a running wireless link.
#[derive(Debug, Clone)]
pub struct WirelessHandle {
    state: watch::Receiver<LinkState>,
    commands: mpsc::Sender<DeviceCommandString>,
    control: mpsc::Sender<Control>,
}

impl WirelessHandle {
    /// Current link state.
    pub fn state(&self) -> LinkState {
        *self.state.borrow()
    }

    /// Watch the link state.
    pub fn subscribe_state(&self) -> watch::Receiver<LinkState> {
        self.state.clone()
    }

    /// Hand a command to the link task.
    ///
    /// Fails fast with [`LinkError::NotReady`] unless the link is `Ready`;
    /// nothing is queued for a later connection.
    pub fn send(&self, command: DeviceCommandString) -> Result<(), LinkError> {
        let state = self.state();
        if state != LinkState::Ready {
            return Err(LinkError::NotReady(state));
        }

        self.commands.try_send(command).map_err(|e| match e {
            TrySendError::Full(_) => LinkError::transport("command queue full"),
            TrySendError::Closed(_) => LinkError::Closed,
        })
    }

    /// Drop the current connection and go through the reconnect path.
    pub fn request_reconnect(&self) -> Result<(), LinkError> {
        match self.control.try_send(Control::Reconnect) {
            // One pending request is enough.
            Ok(()) | Err(TrySendError::Full(_)) => Ok(()),
            Err(TrySendError::Closed(_)) => Err(LinkError::Closed),
        }
    }
}

/// Owns the wireless link task.
pub struct WirelessLinkManager {
    handle: WirelessHandle,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl WirelessLinkManager {
    /// Spawn the link task. Connection happens in the background; progress
    /// is reported as [`LinkEvent::Wireless`] on `events`.
    pub fn start<T: WirelessTransport>(
        transport: T,
        settings: WirelessSettings,
        events: mpsc::Sender<LinkEvent>,
    ) -> Self {
        let (reporter, state) = StateReporter::new("wireless", events, LinkEvent::Wireless);
        let (commands_tx, commands) = mpsc::channel(settings.queue_capacity.max(1));
        let (control_tx, control) = mpsc::channel(1);
        let (shutdown, shutdown_rx) = watch::channel(false);

        let worker = Worker {
            transport,
            settings,
            reporter,
            commands,
            control,
            shutdown: shutdown_rx,
        };
        let task = tokio::spawn(worker.run());

        Self {
            handle: WirelessHandle {
                state,
                commands: commands_tx,
                control: control_tx,
            },
            shutdown,
            task,
        }
    }

    pub fn handle(&self) -> WirelessHandle {
        self.handle.clone()
    }

    pub fn state(&self) -> LinkState {
        self.handle.state()
    }

    pub fn send(&self, command: DeviceCommandString) -> Result<(), LinkError> {
        self.handle.send(command)
    }

    /// Stop the link: log out if `Ready`, close the transport and wait for
    /// the task to finish. No reconnect is attempted afterwards.
    pub async fn close(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            error!(error = %e, "Wireless link task failed");
        }
    }
}

/// How a connection attempt ended.
#[derive(Debug)]
enum SessionEnd {
    Shutdown,
    Reconnect,
    Failed { error: LinkError, was_ready: bool },
}

impl SessionEnd {
    fn failed(error: LinkError) -> Self {
        SessionEnd::Failed {
            error,
            was_ready: false,
        }
    }

    fn lost(error: LinkError) -> Self {
        SessionEnd::Failed {
            error,
            was_ready: true,
        }
    }
}

struct Worker<T> {
    transport: T,
    settings: WirelessSettings,
    reporter: StateReporter,
    commands: mpsc::Receiver<DeviceCommandString>,
    control: mpsc::Receiver<Control>,
    shutdown: watch::Receiver<bool>,
}

impl<T: WirelessTransport> Worker<T> {
    async fn run(mut self) {
        let mut failures: u32 = 0;

        loop {
            let end = self.attempt().await;
            self.discard_pending();

            match end {
                SessionEnd::Shutdown => break,
                SessionEnd::Reconnect => {
                    info!(address = %self.settings.address, "Reconnect requested");
                    failures = 0;
                }
                SessionEnd::Failed { error, was_ready } => {
                    if was_ready {
                        failures = 0;
                    }
                    failures = failures.saturating_add(1);
                    warn!(
                        address = %self.settings.address,
                        error = %error,
                        failures,
                        "Wireless link attempt failed"
                    );

                    if !self.settings.reconnect.should_retry(failures) {
                        error!(
                            address = %self.settings.address,
                            failures,
                            "Giving up on wireless link until a reconnect is requested"
                        );
                        if !self.park().await {
                            break;
                        }
                        failures = 0;
                        continue;
                    }
                }
            }

            if !self.backoff().await {
                break;
            }
        }

        self.reporter.set(LinkState::Disconnected).await;
        info!("Wireless link stopped");
    }

    /// One connect, authenticate and serve cycle. Always ends `Disconnected`.
    async fn attempt(&mut self) -> SessionEnd {
        self.reporter.set(LinkState::Connecting).await;
        info!(address = %self.settings.address, "Connecting to wallbox");

        let opened = tokio::select! {
            result = self.transport.open(&self.settings.address) => result,
            _ = cancelled(&mut self.shutdown) => return SessionEnd::Shutdown,
        };
        let mut channel = match opened {
            Ok(channel) => channel,
            Err(e) => {
                self.reporter.set(LinkState::Disconnected).await;
                return SessionEnd::failed(e);
            }
        };

        self.reporter.set(LinkState::Connected).await;

        let mut framer = Framer::new();
        let end = match self.authenticate(channel.as_mut(), &mut framer).await {
            Ok(()) => self.serve(channel.as_mut(), &mut framer).await,
            Err(end) => end,
        };

        self.reporter.set(LinkState::Disconnected).await;
        channel.close().await;
        if framer.tx.pending() > 0 {
            debug!(bytes = framer.tx.pending(), "Dropping incomplete frame");
        }
        end
    }

    async fn authenticate(
        &mut self,
        channel: &mut dyn WirelessChannel,
        framer: &mut Framer,
    ) -> Result<(), SessionEnd> {
        self.reporter.set(LinkState::Authenticating).await;

        let login = protocol::login(&self.settings.pin);
        channel
            .write(login.as_bytes())
            .await
            .map_err(SessionEnd::failed)?;

        let deadline = Instant::now() + self.settings.auth_timeout;
        loop {
            let chunk = tokio::select! {
                chunk = channel.recv() => chunk,
                _ = time::sleep_until(deadline) => {
                    if self.settings.require_auth_ack {
                        return Err(SessionEnd::failed(LinkError::auth("no answer to login")));
                    }
                    debug!("No answer to login, assuming accepted");
                    return Ok(());
                }
                _ = cancelled(&mut self.shutdown) => return Err(SessionEnd::Shutdown),
            };

            let Some(chunk) = chunk else {
                return Err(SessionEnd::failed(LinkError::transport(
                    "notification stream closed during login",
                )));
            };

            let mut outcome = None;
            for frame in framer.push(chunk) {
                match Answer::parse(&frame) {
                    Some(Answer::AuthOk) if outcome.is_none() => outcome = Some(Ok(())),
                    Some(answer @ (Answer::AuthFail | Answer::ErrAuth)) if outcome.is_none() => {
                        outcome = Some(Err(SessionEnd::failed(LinkError::auth(format!(
                            "device answered {:?}",
                            answer
                        )))));
                    }
                    _ => self.forward(frame).await,
                }
            }
            if let Some(outcome) = outcome {
                return outcome;
            }
        }
    }

    async fn serve(
        &mut self,
        channel: &mut dyn WirelessChannel,
        framer: &mut Framer,
    ) -> SessionEnd {
        // A reconnect requested while this session was coming up is already served.
        while self.control.try_recv().is_ok() {}

        self.reporter.set(LinkState::Ready).await;
        info!(address = %self.settings.address, "Wallbox ready");

        let mut liveness = time::interval(LIVENESS_INTERVAL);
        liveness.set_missed_tick_behavior(MissedTickBehavior::Delay);
        liveness.tick().await;

        loop {
            tokio::select! {
                _ = cancelled(&mut self.shutdown) => {
                    if let Err(e) = channel.write(protocol::LOGOUT.as_bytes()).await {
                        debug!(error = %e, "Logout failed");
                    }
                    return SessionEnd::Shutdown;
                }

                chunk = channel.recv() => match chunk {
                    Some(chunk) => {
                        for frame in framer.push(chunk) {
                            self.forward(frame).await;
                        }
                    }
                    None => {
                        return SessionEnd::lost(LinkError::transport("notification stream ended"));
                    }
                },

                Some(command) = self.commands.recv() => {
                    debug!(command = %command, "Writing command");
                    if let Err(e) = channel.write(command.as_bytes()).await {
                        return SessionEnd::lost(e);
                    }
                }

                Some(Control::Reconnect) = self.control.recv() => {
                    return SessionEnd::Reconnect;
                }

                _ = liveness.tick() => {
                    if !channel.is_connected().await {
                        return SessionEnd::lost(LinkError::transport("device disconnected"));
                    }
                }
            }
        }
    }

    async fn forward(&mut self, frame: Vec<u8>) {
        trace!(
            frame = %String::from_utf8_lossy(protocol::trim_line(&frame)),
            "Notification"
        );
        self.reporter
            .emit(LinkEvent::Notification(RawNotification::new(frame)))
            .await;
    }

    /// Drop commands queued for a connection that no longer exists.
    fn discard_pending(&mut self) {
        while let Ok(command) = self.commands.try_recv() {
            warn!(command = %command, "Link left ready state, command dropped");
        }
    }

    /// Wait out the backoff. Returns `false` on shutdown.
    async fn backoff(&mut self) -> bool {
        debug!(
            backoff_secs = self.settings.reconnect.backoff.as_secs_f64(),
            "Waiting before reconnect"
        );
        tokio::select! {
            _ = time::sleep(self.settings.reconnect.backoff) => true,
            Some(Control::Reconnect) = self.control.recv() => true,
            _ = cancelled(&mut self.shutdown) => false,
        }
    }

    /// Stay disconnected until a reconnect request. Returns `false` on shutdown.
    async fn park(&mut self) -> bool {
        tokio::select! {
            Some(Control::Reconnect) = self.control.recv() => true,
            _ = cancelled(&mut self.shutdown) => false,
        }
    }
}
