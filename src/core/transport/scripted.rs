//! Scripted in-memory transport
//!
//! Deterministic transport driven from a [`ScriptedControl`]: connect
//! outcomes are configured per device, inbound data and link drops are
//! injected by hand, and every call is recorded. Used by the test suite and
//! by demos that need a peripheral without hardware.

use super::{
    DeviceDescriptor, EventSink, Transport, TransportCapabilities, TransportError, TransportKind,
};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::time::Instant;

#[derive(Default)]
struct Script {
    failing: HashSet<String>,
    attempts: HashMap<String, Vec<Instant>>,
    devices: Vec<DeviceDescriptor>,
    connected: Option<DeviceDescriptor>,
    sink: Option<EventSink>,
    sent: Vec<Bytes>,
    disconnects: usize,
    fail_sends: bool,
}

/// Transport half, handed to a channel
pub struct ScriptedTransport {
    kind: TransportKind,
    capabilities: TransportCapabilities,
    script: Arc<Mutex<Script>>,
}

/// Control half, kept by the test
#[derive(Clone)]
pub struct ScriptedControl {
    script: Arc<Mutex<Script>>,
}

impl ScriptedTransport {
    /// Create a client-mode scripted transport and its control handle
    pub fn new(kind: TransportKind) -> (Self, ScriptedControl) {
        let script = Arc::new(Mutex::new(Script::default()));
        (
            Self {
                kind,
                capabilities: TransportCapabilities::CLIENT,
                script: script.clone(),
            },
            ScriptedControl { script },
        )
    }

    /// Override the advertised capabilities
    #[must_use]
    pub fn with_capabilities(mut self, capabilities: TransportCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    fn capabilities(&self) -> TransportCapabilities {
        self.capabilities
    }

    async fn connect(&mut self, device: &DeviceDescriptor) -> Result<(), TransportError> {
        let mut script = self.script.lock();
        script
            .attempts
            .entry(device.id.clone())
            .or_default()
            .push(Instant::now());

        if script.failing.contains(&device.id) {
            return Err(TransportError::ConnectionFailed(format!(
                "{} refused the connection",
                device.id
            )));
        }
        script.connected = Some(device.clone());
        Ok(())
    }

    async fn send(&mut self, data: &[u8]) -> Result<(), TransportError> {
        let mut script = self.script.lock();
        if script.connected.is_none() {
            return Err(TransportError::NotConnected);
        }
        if script.fail_sends {
            return Err(TransportError::SendError("scripted failure".to_string()));
        }
        script.sent.push(Bytes::copy_from_slice(data));
        Ok(())
    }

    async fn begin_receiving(&mut self, sink: EventSink) -> Result<(), TransportError> {
        let mut script = self.script.lock();
        if script.connected.is_none() {
            return Err(TransportError::NotConnected);
        }
        script.sink = Some(sink);
        Ok(())
    }

    fn end_receiving(&mut self) {
        self.script.lock().sink = None;
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        let mut script = self.script.lock();
        script.sink = None;
        if script.connected.take().is_some() {
            script.disconnects += 1;
        }
        Ok(())
    }

    async fn enumerate_devices(&mut self) -> Result<Vec<DeviceDescriptor>, TransportError> {
        Ok(self.script.lock().devices.clone())
    }
}

impl ScriptedControl {
    /// Make connects to `device_id` fail (or succeed again)
    pub fn fail_connects(&self, device_id: &str, fail: bool) {
        let mut script = self.script.lock();
        if fail {
            script.failing.insert(device_id.to_string());
        } else {
            script.failing.remove(device_id);
        }
    }

    /// Make sends fail
    pub fn fail_sends(&self, fail: bool) {
        self.script.lock().fail_sends = fail;
    }

    /// Devices returned by enumeration
    pub fn set_devices(&self, devices: Vec<DeviceDescriptor>) {
        self.script.lock().devices = devices;
    }

    /// Deliver bytes through the current sink. Returns `false` if not receiving.
    pub fn push_data(&self, data: impl Into<Bytes>) -> bool {
        match self.current_sink() {
            Some(sink) => {
                sink.data(data);
                true
            }
            None => false,
        }
    }

    /// Report a read-side error through the current sink
    pub fn push_error(&self, message: &str) -> bool {
        match self.current_sink() {
            Some(sink) => {
                sink.error(TransportError::ReceiveError(message.to_string()));
                true
            }
            None => false,
        }
    }

    /// Simulate the peripheral going away
    pub fn drop_link(&self) -> bool {
        let sink = {
            let mut script = self.script.lock();
            script.connected = None;
            script.sink.take()
        };
        match sink {
            Some(sink) => {
                sink.disconnected();
                true
            }
            None => false,
        }
    }

    /// Sink of the session currently receiving
    pub fn current_sink(&self) -> Option<EventSink> {
        self.script.lock().sink.clone()
    }

    /// Number of connect attempts to `device_id`
    pub fn connect_attempts(&self, device_id: &str) -> usize {
        self.script
            .lock()
            .attempts
            .get(device_id)
            .map_or(0, Vec::len)
    }

    /// When each connect to `device_id` was attempted
    pub fn attempt_times(&self, device_id: &str) -> Vec<Instant> {
        self.script
            .lock()
            .attempts
            .get(device_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Bytes written so far
    pub fn sent(&self) -> Vec<Bytes> {
        self.script.lock().sent.clone()
    }

    pub fn disconnect_count(&self) -> usize {
        self.script.lock().disconnects
    }

    pub fn is_connected(&self) -> bool {
        self.script.lock().connected.is_some()
    }

    /// Currently connected device
    pub fn connected_device(&self) -> Option<DeviceDescriptor> {
        self.script.lock().connected.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::transport::TransportEvent;

    #[tokio::test]
    async fn test_connect_and_receive() {
        let (mut transport, control) = ScriptedTransport::new(TransportKind::Serial);
        let device = DeviceDescriptor::new("port-a", TransportKind::Serial);

        transport.connect(&device).await.unwrap();
        let (sink, mut rx) = EventSink::pair(3);
        transport.begin_receiving(sink).await.unwrap();

        assert!(control.push_data(&b"abc"[..]));
        let tagged = rx.recv().await.unwrap();
        assert_eq!(tagged.session, 3);
        assert!(matches!(tagged.event, TransportEvent::Data(ref b) if b.as_ref() == b"abc"));

        assert!(control.drop_link());
        assert!(matches!(
            rx.recv().await.unwrap().event,
            TransportEvent::Disconnected
        ));
        assert!(!control.push_data(&b"late"[..]));
    }

    #[tokio::test]
    async fn test_failing_connect_is_recorded() {
        let (mut transport, control) = ScriptedTransport::new(TransportKind::Ble);
        let device = DeviceDescriptor::new("gps-1", TransportKind::Ble);
        control.fail_connects("gps-1", true);

        assert!(transport.connect(&device).await.is_err());
        assert_eq!(control.connect_attempts("gps-1"), 1);
        assert!(!control.is_connected());

        control.fail_connects("gps-1", false);
        transport.connect(&device).await.unwrap();
        assert_eq!(control.connected_device(), Some(device));
    }

    #[test]
    fn test_send_records_bytes() {
        let (mut transport, control) = ScriptedTransport::new(TransportKind::Serial);
        tokio_test::block_on(async {
            tokio_test::assert_err!(transport.send(b"x").await);

            tokio_test::assert_ok!(
                transport
                    .connect(&DeviceDescriptor::new("p", TransportKind::Serial))
                    .await
            );
            tokio_test::assert_ok!(transport.send(b"x").await);

            control.fail_sends(true);
            tokio_test::assert_err!(transport.send(b"y").await);
            tokio_test::assert_ok!(transport.disconnect().await);
        });

        assert_eq!(control.sent(), vec![Bytes::from_static(b"x")]);
        assert_eq!(control.disconnect_count(), 1);
    }
}
