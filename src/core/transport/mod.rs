//! Transport layer for peripheral links
//!
//! The lifecycle manager only ever talks to a [`Transport`]. Adapters:
//! - Bluetooth Low Energy GATT (btleplug)
//! - Serial ports, including RFCOMM ttys bound to classic Bluetooth devices
//! - Listen mode sockets for peripherals that connect to us
//! - A simulated device and a scripted test double

mod bluetooth;
mod listen;
pub mod scripted;
mod serial;
mod simulated;

pub use bluetooth::{BleServiceConfig, BleTransport, BleTransportConfig};
pub use listen::{ListenConfig, ListenTransport};
pub use scripted::{ScriptedControl, ScriptedTransport};
pub use serial::{list_ports, SerialConfig, SerialFlowControl, SerialParity, SerialTransport};
pub use simulated::{mock_devices, SimulatedProfile, SimulatedTransport};

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use tokio::sync::mpsc;

/// Identifies one connected session of a channel.
///
/// Every successful connect gets a fresh id, so events emitted by a transport
/// for a session that has since been torn down can be recognised and dropped.
pub type SessionId = u64;

/// Radio/link technology behind a transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransportKind {
    /// Bluetooth Low Energy GATT
    Ble,
    /// Serial port (USB serial, classic Bluetooth SPP/RFCOMM tty)
    Serial,
    /// Listen socket, the peripheral connects to us
    Listen,
    /// Simulated peripheral
    Simulated,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ble => write!(f, "BLE"),
            Self::Serial => write!(f, "Serial"),
            Self::Listen => write!(f, "Listen"),
            Self::Simulated => write!(f, "Simulated"),
        }
    }
}

/// One discoverable peripheral
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    /// Opaque id, unique within one enumeration result
    pub id: String,
    /// Display name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Hardware address when the transport knows one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    /// Transport technology that produced this descriptor
    pub kind: TransportKind,
}

impl DeviceDescriptor {
    /// Create a descriptor with only an id
    pub fn new(id: impl Into<String>, kind: TransportKind) -> Self {
        Self {
            id: id.into(),
            name: None,
            address: None,
            kind,
        }
    }

    /// Set display name
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Set hardware address
    #[must_use]
    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = Some(address.into());
        self
    }

    /// Name if known, otherwise the id
    pub fn label(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }
}

impl fmt::Display for DeviceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{} ({})", name, self.id),
            None => write!(f, "{}", self.id),
        }
    }
}

/// Connection modes a transport can operate in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransportMode {
    /// We dial the peripheral
    Client,
    /// We listen and the peripheral dials us
    Listen,
}

/// Static description of what a transport can do, read once when it is bound
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportCapabilities {
    /// Supported connection modes, in order of preference
    pub modes: &'static [TransportMode],
    /// Link closures are part of normal operation and do not end the session
    pub reports_transient_disconnects: bool,
    /// Outbound writes are possible
    pub can_send: bool,
}

impl TransportCapabilities {
    /// Dial-out transport with full disconnect reporting
    pub const CLIENT: Self = Self {
        modes: &[TransportMode::Client],
        reports_transient_disconnects: false,
        can_send: true,
    };

    /// Accept-one-message listen transport
    pub const LISTEN: Self = Self {
        modes: &[TransportMode::Listen],
        reports_transient_disconnects: true,
        can_send: false,
    };

    /// Check if a mode is supported
    pub fn supports(&self, mode: TransportMode) -> bool {
        self.modes.contains(&mode)
    }

    /// Mode the session should run the transport in
    pub fn preferred_mode(&self) -> Option<TransportMode> {
        self.modes.first().copied()
    }
}

/// Transport error types
#[derive(Error, Debug)]
pub enum TransportError {
    /// Connection failed
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Connection timeout
    #[error("Connection timeout after {0} seconds")]
    Timeout(u64),

    /// Device not found
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    /// Permission denied
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Not connected
    #[error("Not connected")]
    NotConnected,

    /// Link dropped
    #[error("Disconnected")]
    Disconnected,

    /// Send error
    #[error("Send error: {0}")]
    SendError(String),

    /// Receive error
    #[error("Receive error: {0}")]
    ReceiveError(String),

    /// Operation not offered by this transport
    #[error("Unsupported operation: {0}")]
    Unsupported(&'static str),
}

/// Something a transport reports back to the session that owns it
#[derive(Debug)]
pub enum TransportEvent {
    /// Bytes arrived
    Data(Bytes),
    /// The link closed
    Disconnected,
    /// A read-side error occurred
    Error(TransportError),
}

/// Session-tagged transport event as queued for the channel task
#[derive(Debug)]
pub struct TaggedEvent {
    /// Session the event belongs to
    pub session: SessionId,
    /// The event
    pub event: TransportEvent,
}

/// Delivers transport callbacks onto the channel's event loop.
///
/// Cloneable so reader tasks can hold their own copy. All methods are
/// non-blocking and silently do nothing once the channel task is gone.
#[derive(Debug, Clone)]
pub struct EventSink {
    session: SessionId,
    tx: mpsc::UnboundedSender<TaggedEvent>,
}

impl EventSink {
    pub(crate) fn new(session: SessionId, tx: mpsc::UnboundedSender<TaggedEvent>) -> Self {
        Self { session, tx }
    }

    /// Create a sink with its receiving end, for driving a transport directly
    pub fn pair(session: SessionId) -> (Self, mpsc::UnboundedReceiver<TaggedEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(session, tx), rx)
    }

    /// Session this sink reports for
    pub fn session(&self) -> SessionId {
        self.session
    }

    /// Report received bytes
    pub fn data(&self, data: impl Into<Bytes>) {
        self.emit(TransportEvent::Data(data.into()));
    }

    /// Report that the link closed
    pub fn disconnected(&self) {
        self.emit(TransportEvent::Disconnected);
    }

    /// Report a read-side error
    pub fn error(&self, error: TransportError) {
        self.emit(TransportEvent::Error(error));
    }

    /// Check whether the receiving channel task is gone
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    fn emit(&self, event: TransportEvent) {
        let _ = self.tx.send(TaggedEvent {
            session: self.session,
            event,
        });
    }
}

/// Capability set every peripheral link offers to the lifecycle manager
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Transport: Send {
    /// Technology behind this transport
    fn kind(&self) -> TransportKind;

    /// Static capabilities, read once at bind time
    fn capabilities(&self) -> TransportCapabilities;

    /// Connect to (or, in listen mode, start accepting from) a device
    async fn connect(&mut self, device: &DeviceDescriptor) -> Result<(), TransportError>;

    /// Send data to the connected device
    async fn send(&mut self, data: &[u8]) -> Result<(), TransportError>;

    /// Start delivering received bytes, disconnects and read errors to `sink`
    async fn begin_receiving(&mut self, sink: EventSink) -> Result<(), TransportError>;

    /// Stop delivering events
    fn end_receiving(&mut self);

    /// Tear the link down
    async fn disconnect(&mut self) -> Result<(), TransportError>;

    /// List devices this transport can reach
    async fn enumerate_devices(&mut self) -> Result<Vec<DeviceDescriptor>, TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capability_presets() {
        assert!(TransportCapabilities::CLIENT.supports(TransportMode::Client));
        assert!(!TransportCapabilities::CLIENT.reports_transient_disconnects);
        assert_eq!(
            TransportCapabilities::LISTEN.preferred_mode(),
            Some(TransportMode::Listen)
        );
        assert!(TransportCapabilities::LISTEN.reports_transient_disconnects);
    }

    #[test]
    fn test_descriptor_label() {
        let device = DeviceDescriptor::new("00:11:22:33:44:55", TransportKind::Serial);
        assert_eq!(device.label(), "00:11:22:33:44:55");

        let device = device.with_name("RD8100");
        assert_eq!(device.label(), "RD8100");
        assert_eq!(device.to_string(), "RD8100 (00:11:22:33:44:55)");
    }

    #[tokio::test]
    async fn test_event_sink_tags_session() {
        let (sink, mut rx) = EventSink::pair(7);
        sink.data(&b"$GP"[..]);
        sink.disconnected();

        let first = rx.recv().await.unwrap();
        assert_eq!(first.session, 7);
        assert!(matches!(first.event, TransportEvent::Data(ref b) if b.as_ref() == b"$GP"));

        let second = rx.recv().await.unwrap();
        assert!(matches!(second.event, TransportEvent::Disconnected));
    }

    #[test]
    fn test_sink_closed_after_receiver_drop() {
        let (sink, rx) = EventSink::pair(1);
        drop(rx);
        assert!(sink.is_closed());
        // Must not panic
        sink.data(Bytes::from_static(b"x"));
    }
}
