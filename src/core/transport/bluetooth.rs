//! Bluetooth Low Energy transport
//!
//! GATT serial bridge over btleplug. Bytes are written to the TX
//! characteristic and arrive as notifications on the RX characteristic
//! (Nordic UART Service by default).

use super::{
    DeviceDescriptor, EventSink, Transport, TransportCapabilities, TransportError, TransportKind,
};
use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use bytes::Bytes;
use futures::stream::StreamExt;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// BLE Service/Characteristic configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BleServiceConfig {
    /// Service UUID
    pub service_uuid: String,
    /// TX Characteristic UUID (for writing)
    pub tx_characteristic: String,
    /// RX Characteristic UUID (for reading/notifications)
    pub rx_characteristic: String,
}

impl Default for BleServiceConfig {
    fn default() -> Self {
        // Nordic UART Service (NUS)
        Self {
            service_uuid: "6e400001-b5a3-f393-e0a9-e50e24dcca9e".to_string(),
            tx_characteristic: "6e400002-b5a3-f393-e0a9-e50e24dcca9e".to_string(),
            rx_characteristic: "6e400003-b5a3-f393-e0a9-e50e24dcca9e".to_string(),
        }
    }
}

impl BleServiceConfig {
    fn uuids(&self) -> Result<(Uuid, Uuid), TransportError> {
        let parse = |label: &str, value: &str| {
            Uuid::parse_str(value).map_err(|e| {
                TransportError::InvalidConfiguration(format!("Invalid {label} UUID: {e}"))
            })
        };
        Ok((
            parse("TX", &self.tx_characteristic)?,
            parse("RX", &self.rx_characteristic)?,
        ))
    }
}

/// BLE transport configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BleTransportConfig {
    /// GATT layout of the serial bridge
    pub service: BleServiceConfig,
    /// How long a scan runs during enumeration or lookup
    pub scan_secs: u64,
    /// Connection timeout in seconds
    pub timeout_secs: u64,
}

impl Default for BleTransportConfig {
    fn default() -> Self {
        Self {
            service: BleServiceConfig::default(),
            scan_secs: 3,
            timeout_secs: 10,
        }
    }
}

struct Link {
    peripheral: Peripheral,
    tx_char: Characteristic,
    rx_char: Characteristic,
    pump: Option<CancellationToken>,
}

/// Bluetooth LE transport
pub struct BleTransport {
    config: BleTransportConfig,
    adapter: Option<Adapter>,
    link: Option<Link>,
}

fn ble_error(context: &'static str) -> impl FnOnce(btleplug::Error) -> TransportError {
    move |e| TransportError::ConnectionFailed(format!("{context}: {e}"))
}

impl BleTransport {
    pub fn new(config: BleTransportConfig) -> Self {
        Self {
            config,
            adapter: None,
            link: None,
        }
    }

    /// First adapter of the platform manager, created on demand
    async fn adapter(&mut self) -> Result<Adapter, TransportError> {
        if let Some(adapter) = &self.adapter {
            return Ok(adapter.clone());
        }

        let manager = Manager::new()
            .await
            .map_err(ble_error("Failed to create Bluetooth manager"))?;
        let adapter = manager
            .adapters()
            .await
            .map_err(ble_error("Failed to get adapters"))?
            .into_iter()
            .next()
            .ok_or_else(|| TransportError::ConnectionFailed("No Bluetooth adapter found".into()))?;

        self.adapter = Some(adapter.clone());
        Ok(adapter)
    }

    async fn scan(&self, adapter: &Adapter) -> Result<(), TransportError> {
        adapter
            .start_scan(ScanFilter::default())
            .await
            .map_err(ble_error("Failed to start scan"))?;
        tokio::time::sleep(Duration::from_secs(self.config.scan_secs)).await;
        adapter
            .stop_scan()
            .await
            .map_err(ble_error("Failed to stop scan"))
    }

    async fn find_peripheral(
        adapter: &Adapter,
        device: &DeviceDescriptor,
    ) -> Result<Option<Peripheral>, TransportError> {
        let peripherals = adapter
            .peripherals()
            .await
            .map_err(ble_error("Failed to get peripherals"))?;

        for peripheral in peripherals {
            if peripheral.id().to_string() == device.id {
                return Ok(Some(peripheral));
            }
            if let Ok(Some(props)) = peripheral.properties().await {
                let address = props.address.to_string();
                if device.address.as_deref() == Some(address.as_str()) || address == device.id {
                    return Ok(Some(peripheral));
                }
            }
        }
        Ok(None)
    }

    async fn characteristics(
        &self,
        peripheral: &Peripheral,
    ) -> Result<(Characteristic, Characteristic), TransportError> {
        let (tx_uuid, rx_uuid) = self.config.service.uuids()?;

        peripheral
            .discover_services()
            .await
            .map_err(ble_error("Failed to discover services"))?;

        let characteristics = peripheral.characteristics();
        let find = |uuid: Uuid, label: &str| {
            characteristics
                .iter()
                .find(|c| c.uuid == uuid)
                .cloned()
                .ok_or_else(|| TransportError::ConnectionFailed(format!("{label} characteristic not found")))
        };
        Ok((find(tx_uuid, "TX")?, find(rx_uuid, "RX")?))
    }
}

#[async_trait]
impl Transport for BleTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Ble
    }

    fn capabilities(&self) -> TransportCapabilities {
        TransportCapabilities::CLIENT
    }

    async fn connect(&mut self, device: &DeviceDescriptor) -> Result<(), TransportError> {
        let adapter = self.adapter().await?;

        let peripheral = match Self::find_peripheral(&adapter, device).await? {
            Some(p) => p,
            None => {
                debug!(device = %device, "Not cached, scanning");
                self.scan(&adapter).await?;
                Self::find_peripheral(&adapter, device)
                    .await?
                    .ok_or_else(|| TransportError::DeviceNotFound(device.id.clone()))?
            }
        };

        let timeout = Duration::from_secs(self.config.timeout_secs);
        tokio::time::timeout(timeout, peripheral.connect())
            .await
            .map_err(|_| TransportError::Timeout(self.config.timeout_secs))?
            .map_err(ble_error("Failed to connect"))?;

        let (tx_char, rx_char) = match self.characteristics(&peripheral).await {
            Ok(chars) => chars,
            Err(e) => {
                let _ = peripheral.disconnect().await;
                return Err(e);
            }
        };

        info!(device = %device, "BLE peripheral connected");
        self.link = Some(Link {
            peripheral,
            tx_char,
            rx_char,
            pump: None,
        });
        Ok(())
    }

    async fn send(&mut self, data: &[u8]) -> Result<(), TransportError> {
        let link = self.link.as_ref().ok_or(TransportError::NotConnected)?;
        link.peripheral
            .write(&link.tx_char, data, WriteType::WithoutResponse)
            .await
            .map_err(|e| TransportError::SendError(format!("Write failed: {e}")))
    }

    async fn begin_receiving(&mut self, sink: EventSink) -> Result<(), TransportError> {
        let adapter = self.adapter().await?;
        let link = self.link.as_mut().ok_or(TransportError::NotConnected)?;

        link.peripheral
            .subscribe(&link.rx_char)
            .await
            .map_err(ble_error("Failed to subscribe"))?;
        let notifications = link
            .peripheral
            .notifications()
            .await
            .map_err(ble_error("Failed to open notification stream"))?;
        let central_events = adapter
            .events()
            .await
            .map_err(ble_error("Failed to open adapter events"))?;

        let cancel = CancellationToken::new();
        tokio::spawn(pump(
            notifications,
            central_events,
            link.peripheral.id(),
            link.rx_char.uuid,
            sink,
            cancel.clone(),
        ));
        link.pump = Some(cancel);
        Ok(())
    }

    fn end_receiving(&mut self) {
        if let Some(cancel) = self.link.as_mut().and_then(|link| link.pump.take()) {
            cancel.cancel();
        }
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        self.end_receiving();
        if let Some(link) = self.link.take() {
            link.peripheral
                .disconnect()
                .await
                .map_err(ble_error("Failed to disconnect"))?;
        }
        Ok(())
    }

    async fn enumerate_devices(&mut self) -> Result<Vec<DeviceDescriptor>, TransportError> {
        let adapter = self.adapter().await?;
        self.scan(&adapter).await?;

        let peripherals = adapter
            .peripherals()
            .await
            .map_err(|e| TransportError::ReceiveError(format!("Failed to get peripherals: {e}")))?;

        let mut devices = Vec::new();
        for peripheral in peripherals {
            let mut device = DeviceDescriptor::new(peripheral.id().to_string(), TransportKind::Ble);
            if let Ok(Some(props)) = peripheral.properties().await {
                device = device.with_address(props.address.to_string());
                if let Some(name) = props.local_name {
                    device = device.with_name(name);
                }
            }
            devices.push(device);
        }
        Ok(devices)
    }
}

type Notifications =
    std::pin::Pin<Box<dyn futures::Stream<Item = btleplug::api::ValueNotification> + Send>>;
type CentralEvents = std::pin::Pin<Box<dyn futures::Stream<Item = CentralEvent> + Send>>;

async fn pump(
    mut notifications: Notifications,
    mut central_events: CentralEvents,
    peripheral: PeripheralId,
    rx_uuid: Uuid,
    sink: EventSink,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            notification = notifications.next() => match notification {
                Some(n) if n.uuid == rx_uuid => sink.data(Bytes::from(n.value)),
                Some(_) => {}
                None => {
                    warn!(session = sink.session(), "Notification stream ended");
                    sink.disconnected();
                    break;
                }
            },
            Some(event) = central_events.next() => {
                if let CentralEvent::DeviceDisconnected(id) = event {
                    if id == peripheral {
                        sink.disconnected();
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_nordic_uart() {
        let config = BleTransportConfig::default();
        assert!(config.service.service_uuid.starts_with("6e400001"));
        let (tx, rx) = config.service.uuids().unwrap();
        assert_ne!(tx, rx);
    }

    #[test]
    fn test_invalid_uuid_rejected() {
        let service = BleServiceConfig {
            rx_characteristic: "not-a-uuid".to_string(),
            ..BleServiceConfig::default()
        };
        assert!(matches!(
            service.uuids(),
            Err(TransportError::InvalidConfiguration(_))
        ));
    }

    #[tokio::test]
    async fn test_send_without_link() {
        let mut transport = BleTransport::new(BleTransportConfig::default());
        assert!(matches!(
            transport.send(b"x").await,
            Err(TransportError::NotConnected)
        ));
        transport.end_receiving();
        transport.disconnect().await.unwrap();
    }
}
