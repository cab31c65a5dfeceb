//! Connection lifecycle management
//!
//! A [`ChannelSession`] owns one logical peripheral channel: its transport,
//! decoder, state machine, reconnect backoff and subscribers. It runs as a
//! single tokio task; [`Channel`] is the cloneable handle the application
//! holds.

use crate::config::ChannelConfig;
use crate::core::decoder::FrameDecoder;
use crate::core::reconnect::Backoff;
use crate::core::state_machine::{ConnectionState, DisconnectReason, StateMachine};
use crate::core::subscribers::{HandlerError, SubscriberError, SubscriberRegistry, Subscription};
use crate::core::transport::{
    DeviceDescriptor, EventSink, SessionId, TaggedEvent, Transport, TransportCapabilities,
    TransportError, TransportEvent,
};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

/// Logical channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    /// NMEA GPS receiver
    Gps,
    /// Electromagnetic locator
    Eml,
    /// JSON telemetry
    Telemetry,
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Gps => write!(f, "gps"),
            Self::Eml => write!(f, "eml"),
            Self::Telemetry => write!(f, "telemetry"),
        }
    }
}

impl FromStr for ChannelKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "gps" => Ok(Self::Gps),
            "eml" => Ok(Self::Eml),
            "telemetry" | "json" => Ok(Self::Telemetry),
            other => Err(format!("unknown channel: {other}")),
        }
    }
}

/// Channel events
///
/// Everything that goes wrong below the subscriber boundary ends up here.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    /// State changed
    StateChanged(ConnectionState),
    /// Selected device changed
    DeviceChanged(Option<DeviceDescriptor>),
    /// Transport reported an error
    TransportError(String),
    /// A reconnect will be attempted after `delay`
    ReconnectScheduled {
        /// 1-based number of the upcoming attempt
        attempt: u32,
        delay: Duration,
    },
    /// A frame was dropped instead of becoming a record
    FrameDiscarded { frame: String, reason: String },
    /// Buffered bytes were dropped to stay within the cap
    BufferOverflow { dropped: usize },
    /// A subscriber failed or panicked
    SubscriberFailed { subscription: Uuid, error: String },
}

/// Errors returned by [`Channel`] operations
#[derive(Error, Debug)]
pub enum ChannelError {
    /// No transport is bound on this platform
    #[error("channel has no transport")]
    Unsupported,
    /// Operation needs a connected link
    #[error("channel is not connected")]
    NotConnected,
    /// Transport failure
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// Channel task is gone
    #[error("channel task has stopped")]
    Closed,
}

type Reply<T> = oneshot::Sender<Result<T, ChannelError>>;

enum Command {
    SetTransport(Option<Box<dyn Transport>>, oneshot::Sender<()>),
    SelectDevice(Option<DeviceDescriptor>, Reply<()>),
    SetEnabled(bool, Reply<()>),
    ListDevices(Reply<Vec<DeviceDescriptor>>),
    Send(Bytes, Reply<()>),
    Shutdown(oneshot::Sender<()>),
}

/// What the channel task is doing besides waiting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Activity {
    Idle,
    /// A manual select/enable/disable/rebind is in progress
    Transitioning,
    /// The one pending reconnect
    Reconnecting { deadline: Instant },
}

impl Activity {
    fn deadline(self) -> Option<Instant> {
        match self {
            Self::Reconnecting { deadline } => Some(deadline),
            _ => None,
        }
    }
}

/// Handle to a running channel
pub struct Channel<R> {
    kind: ChannelKind,
    commands: mpsc::Sender<Command>,
    state: watch::Receiver<ConnectionState>,
    device: watch::Receiver<Option<DeviceDescriptor>>,
    events: broadcast::Sender<ChannelEvent>,
    subscribers: SubscriberRegistry<R>,
}

impl<R> Clone for Channel<R> {
    fn clone(&self) -> Self {
        Self {
            kind: self.kind,
            commands: self.commands.clone(),
            state: self.state.clone(),
            device: self.device.clone(),
            events: self.events.clone(),
            subscribers: self.subscribers.clone(),
        }
    }
}

impl<R: 'static> Channel<R> {
    /// Which channel this is
    pub fn kind(&self) -> ChannelKind {
        self.kind
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, ChannelError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .await
            .map_err(|_| ChannelError::Closed)?;
        rx.await.map_err(|_| ChannelError::Closed)
    }

    /// Bind a transport, or `None` when the platform has none.
    ///
    /// Any existing session is torn down first.
    pub async fn set_transport(
        &self,
        transport: Option<Box<dyn Transport>>,
    ) -> Result<(), ChannelError> {
        self.request(|tx| Command::SetTransport(transport, tx)).await
    }

    /// Select the device to connect to, or `None` to disconnect
    pub async fn select_device(
        &self,
        device: Option<DeviceDescriptor>,
    ) -> Result<(), ChannelError> {
        self.request(|tx| Command::SelectDevice(device, tx)).await?
    }

    /// Enable or disable the channel
    pub async fn set_enabled(&self, enabled: bool) -> Result<(), ChannelError> {
        self.request(|tx| Command::SetEnabled(enabled, tx)).await?
    }

    /// Enumerate devices through the bound transport
    pub async fn list_available_devices(&self) -> Result<Vec<DeviceDescriptor>, ChannelError> {
        self.request(Command::ListDevices).await?
    }

    /// Send bytes to the connected device
    pub async fn send(&self, data: &[u8]) -> Result<(), ChannelError> {
        if !self.current_state().is_connected() {
            return Err(ChannelError::NotConnected);
        }
        let data = Bytes::copy_from_slice(data);
        self.request(|tx| Command::Send(data, tx)).await?
    }

    /// Register a record handler
    pub fn subscribe<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&R) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.subscribers.subscribe(handler)
    }

    /// Register a record handler with its own error callback
    pub fn subscribe_with_errors<F, E>(&self, handler: F, on_error: E) -> Subscription
    where
        F: Fn(&R) -> Result<(), HandlerError> + Send + Sync + 'static,
        E: Fn(&SubscriberError) + Send + Sync + 'static,
    {
        self.subscribers.subscribe_with_errors(handler, on_error)
    }

    /// Get current state
    pub fn current_state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Get selected device
    pub fn current_device(&self) -> Option<DeviceDescriptor> {
        self.device.borrow().clone()
    }

    /// Watch state changes
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Subscribe to channel events
    pub fn events(&self) -> broadcast::Receiver<ChannelEvent> {
        self.events.subscribe()
    }

    /// Disconnect and stop the channel task
    pub async fn shutdown(&self) -> Result<(), ChannelError> {
        self.request(Command::Shutdown).await
    }
}

/// Channel task state
pub struct ChannelSession<D: FrameDecoder> {
    kind: ChannelKind,
    decoder: D,
    transport: Option<Box<dyn Transport>>,
    capabilities: Option<TransportCapabilities>,
    machine: StateMachine,
    activity: Activity,
    backoff: Backoff,
    enabled: bool,
    device: Option<DeviceDescriptor>,
    current_session: Option<SessionId>,
    last_session: SessionId,
    sink_tx: mpsc::UnboundedSender<TaggedEvent>,
    state_tx: watch::Sender<ConnectionState>,
    device_tx: watch::Sender<Option<DeviceDescriptor>>,
    events: broadcast::Sender<ChannelEvent>,
    subscribers: SubscriberRegistry<D::Record>,
}

impl<D: FrameDecoder> ChannelSession<D> {
    /// Start a channel task and return its handle
    pub fn spawn(kind: ChannelKind, decoder: D, config: &ChannelConfig) -> Channel<D::Record> {
        let (cmd_tx, cmd_rx) = mpsc::channel(32);
        let (sink_tx, sink_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let (device_tx, device_rx) = watch::channel(None);
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let subscribers = SubscriberRegistry::new();

        let session = Self {
            kind,
            decoder,
            transport: None,
            capabilities: None,
            machine: StateMachine::new(),
            activity: Activity::Idle,
            backoff: Backoff::new(config.reconnect_policy()),
            enabled: config.enabled,
            device: None,
            current_session: None,
            last_session: 0,
            sink_tx,
            state_tx,
            device_tx,
            events: events.clone(),
            subscribers: subscribers.clone(),
        };

        tokio::spawn(session.run(cmd_rx, sink_rx));

        Channel {
            kind,
            commands: cmd_tx,
            state: state_rx,
            device: device_rx,
            events,
            subscribers,
        }
    }

    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut transport_events: mpsc::UnboundedReceiver<TaggedEvent>,
    ) {
        debug!(channel = %self.kind, "Channel task started");

        loop {
            let deadline = self.activity.deadline();

            tokio::select! {
                biased;

                cmd = commands.recv() => {
                    let keep_running = match cmd {
                        Some(cmd) => self.handle_command(cmd).await,
                        None => {
                            self.shutdown().await;
                            false
                        }
                    };
                    if !keep_running {
                        break;
                    }
                }
                Some(tagged) = transport_events.recv() => self.handle_transport_event(tagged),
                () = wait_for(deadline) => self.reconnect().await,
            }
        }

        debug!(channel = %self.kind, "Channel task stopped");
    }

    /// Returns `false` once the task should stop
    async fn handle_command(&mut self, cmd: Command) -> bool {
        match cmd {
            Command::SetTransport(transport, reply) => {
                self.rebind(transport).await;
                let _ = reply.send(());
            }
            Command::SelectDevice(device, reply) => {
                let _ = reply.send(self.select_device(device).await);
            }
            Command::SetEnabled(enabled, reply) => {
                let _ = reply.send(self.set_enabled(enabled).await);
            }
            Command::ListDevices(reply) => {
                let result = match self.transport.as_mut() {
                    Some(transport) => transport.enumerate_devices().await.map_err(Into::into),
                    None => Err(ChannelError::Unsupported),
                };
                let _ = reply.send(result);
            }
            Command::Send(data, reply) => {
                let _ = reply.send(self.send(&data).await);
            }
            Command::Shutdown(done) => {
                self.shutdown().await;
                let _ = done.send(());
                return false;
            }
        }
        true
    }

    async fn rebind(&mut self, transport: Option<Box<dyn Transport>>) {
        self.activity = Activity::Transitioning;
        self.teardown(DisconnectReason::TransportChanged).await;

        self.capabilities = transport.as_ref().map(|t| t.capabilities());
        match &transport {
            Some(t) => info!(
                channel = %self.kind,
                transport = %t.kind(),
                mode = ?t.capabilities().preferred_mode(),
                "Transport bound"
            ),
            None => info!(channel = %self.kind, "No transport; channel unsupported"),
        }
        self.transport = transport;

        let connected = self.enabled && self.device.is_some() && self.connect().await;
        self.settle(connected);
    }

    async fn select_device(&mut self, device: Option<DeviceDescriptor>) -> Result<(), ChannelError> {
        if self.transport.is_none() {
            return Err(ChannelError::Unsupported);
        }
        if device.is_some() && device == self.device && self.machine.state().is_connected() {
            debug!(channel = %self.kind, "Device already connected");
            return Ok(());
        }

        self.activity = Activity::Transitioning;
        self.teardown(DisconnectReason::User).await;

        if device != self.device {
            self.backoff.reset();
            self.device.clone_from(&device);
            self.device_tx.send_replace(device.clone());
            self.emit(ChannelEvent::DeviceChanged(device));
        }

        let connected = self.enabled && self.device.is_some() && self.connect().await;
        self.settle(connected);
        Ok(())
    }

    async fn set_enabled(&mut self, enabled: bool) -> Result<(), ChannelError> {
        if self.transport.is_none() {
            return Err(ChannelError::Unsupported);
        }
        if enabled == self.enabled {
            return Ok(());
        }
        self.enabled = enabled;
        info!(channel = %self.kind, enabled, "Channel enable changed");

        self.activity = Activity::Transitioning;
        if enabled {
            let connected = self.device.is_some() && self.connect().await;
            self.settle(connected);
        } else {
            self.teardown(DisconnectReason::Disabled).await;
            self.activity = Activity::Idle;
        }
        Ok(())
    }

    async fn send(&mut self, data: &[u8]) -> Result<(), ChannelError> {
        let Some(transport) = self.transport.as_mut() else {
            return Err(ChannelError::Unsupported);
        };
        if self.capabilities.is_some_and(|caps| !caps.can_send) {
            return Err(ChannelError::Unsupported);
        }
        if !self.machine.state().is_connected() {
            return Err(ChannelError::NotConnected);
        }

        trace!(channel = %self.kind, data = %hex::encode(data), "Sending");
        if let Err(e) = transport.send(data).await {
            warn!(channel = %self.kind, error = %e, "Send failed");
            self.emit(ChannelEvent::TransportError(e.to_string()));
            return Err(e.into());
        }
        Ok(())
    }

    async fn shutdown(&mut self) {
        self.activity = Activity::Transitioning;
        self.teardown(DisconnectReason::Shutdown).await;
        self.activity = Activity::Idle;
    }

    /// Leave `Transitioning`; a failed connect arms the reconnect timer
    fn settle(&mut self, connected: bool) {
        self.activity = Activity::Idle;
        if !connected && self.enabled && self.device.is_some() && !self.machine.state().is_connected() {
            self.schedule_reconnect();
        }
    }

    /// Connect to the selected device and start receiving
    async fn connect(&mut self) -> bool {
        let Some(device) = self.device.clone() else {
            return false;
        };
        if self.transport.is_none() {
            return false;
        }

        self.last_session += 1;
        let session = self.last_session;
        let sink = EventSink::new(session, self.sink_tx.clone());

        self.set_state(ConnectionState::Connecting, None);
        info!(channel = %self.kind, device = %device, "Connecting");

        let result = match self.transport.as_mut() {
            Some(transport) => open(transport.as_mut(), &device, sink).await,
            None => Err(TransportError::NotConnected),
        };

        match result {
            Ok(()) => {
                self.current_session = Some(session);
                self.backoff.reset();
                self.decoder.reset();
                self.set_state(ConnectionState::Connected, None);
                info!(channel = %self.kind, device = %device, "Connected");
                true
            }
            Err(e) => {
                warn!(channel = %self.kind, device = %device, error = %e, "Connect failed");
                self.emit(ChannelEvent::TransportError(e.to_string()));
                self.set_state(
                    ConnectionState::Disconnected,
                    Some(DisconnectReason::ConnectFailed(e.to_string())),
                );
                false
            }
        }
    }

    /// Drop the current session, best effort
    async fn teardown(&mut self, reason: DisconnectReason) {
        let was_connected = self.current_session.take().is_some();

        if was_connected {
            if let Some(transport) = self.transport.as_mut() {
                transport.end_receiving();
                if let Err(e) = transport.disconnect().await {
                    warn!(channel = %self.kind, error = %e, "Disconnect failed");
                }
            }
            info!(channel = %self.kind, ?reason, "Disconnected");
        }

        self.decoder.reset();
        self.set_state(ConnectionState::Disconnected, Some(reason));
    }

    fn schedule_reconnect(&mut self) {
        if let Activity::Reconnecting { .. } = self.activity {
            debug!(channel = %self.kind, "Reconnect already pending");
            return;
        }

        let delay = self.backoff.next_delay();
        let attempt = self.backoff.attempt() + 1;
        self.activity = Activity::Reconnecting {
            deadline: Instant::now() + delay,
        };

        info!(channel = %self.kind, attempt, delay_ms = delay.as_millis() as u64, "Reconnect scheduled");
        self.emit(ChannelEvent::ReconnectScheduled { attempt, delay });
    }

    async fn reconnect(&mut self) {
        self.activity = Activity::Transitioning;

        let attempt = self.backoff.advance();
        debug!(channel = %self.kind, attempt, "Reconnect timer fired");

        let connected = self.enabled && self.connect().await;
        self.settle(connected);
    }

    fn handle_transport_event(&mut self, tagged: TaggedEvent) {
        if self.current_session != Some(tagged.session) {
            trace!(channel = %self.kind, session = tagged.session, "Dropping event from stale session");
            return;
        }

        match tagged.event {
            TransportEvent::Data(bytes) => self.handle_data(&bytes),
            TransportEvent::Error(e) => {
                warn!(channel = %self.kind, error = %e, "Transport error");
                self.emit(ChannelEvent::TransportError(e.to_string()));
            }
            TransportEvent::Disconnected => self.handle_link_lost(),
        }
    }

    fn handle_data(&mut self, bytes: &[u8]) {
        trace!(
            channel = %self.kind,
            len = bytes.len(),
            data = %hex::encode(&bytes[..bytes.len().min(64)]),
            "Received"
        );

        let decoded = self.decoder.decode(bytes);

        if let Some(dropped) = decoded.overflowed {
            warn!(channel = %self.kind, dropped, "Receive buffer overflow, data truncated");
            self.emit(ChannelEvent::BufferOverflow { dropped });
        }
        for discard in decoded.discarded {
            debug!(channel = %self.kind, frame = %discard.frame, reason = %discard.reason, "Frame discarded");
            self.emit(ChannelEvent::FrameDiscarded {
                frame: discard.frame,
                reason: discard.reason,
            });
        }

        for record in &decoded.records {
            for failure in self.subscribers.dispatch(record) {
                warn!(
                    channel = %self.kind,
                    subscription = %failure.subscription,
                    error = %failure.error,
                    "Subscriber failed"
                );
                self.emit(ChannelEvent::SubscriberFailed {
                    subscription: failure.subscription,
                    error: failure.error.to_string(),
                });
            }
        }
    }

    fn handle_link_lost(&mut self) {
        if self
            .capabilities
            .is_some_and(|caps| caps.reports_transient_disconnects)
        {
            debug!(channel = %self.kind, "Transient disconnect, session kept");
            return;
        }
        if self.activity != Activity::Idle {
            return;
        }

        warn!(channel = %self.kind, "Link lost");
        self.current_session = None;
        if let Some(transport) = self.transport.as_mut() {
            transport.end_receiving();
        }
        self.decoder.reset();
        self.set_state(ConnectionState::Disconnected, Some(DisconnectReason::LinkLost));

        self.backoff.reset();
        if self.enabled && self.device.is_some() {
            self.schedule_reconnect();
        }
    }

    fn set_state(&mut self, to: ConnectionState, reason: Option<DisconnectReason>) {
        match self.machine.transition(to, reason) {
            Ok(true) => {
                debug!(channel = %self.kind, state = %to, "State changed");
                self.state_tx.send_replace(to);
                self.emit(ChannelEvent::StateChanged(to));
            }
            Ok(false) => {}
            Err(e) => warn!(channel = %self.kind, error = %e, "Rejected state change"),
        }
    }

    fn emit(&self, event: ChannelEvent) {
        // No receivers is fine
        let _ = self.events.send(event);
    }
}

/// Connect and start receiving; a half-open link is closed again
async fn open(
    transport: &mut dyn Transport,
    device: &DeviceDescriptor,
    sink: EventSink,
) -> Result<(), TransportError> {
    transport.connect(device).await?;
    if let Err(e) = transport.begin_receiving(sink).await {
        transport.end_receiving();
        if let Err(close) = transport.disconnect().await {
            warn!(device = %device, error = %close, "Closing half-open link failed");
        }
        return Err(e);
    }
    Ok(())
}

async fn wait_for(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
