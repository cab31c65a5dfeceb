//! Serial port transport
//!
//! Covers USB GPS pucks and classic Bluetooth devices bound to an RFCOMM tty.
//! The device id is the port path.

use super::{
    DeviceDescriptor, EventSink, Transport, TransportCapabilities, TransportError, TransportKind,
};
use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serialport::SerialPortType;
use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};
use tokio_serial::{DataBits, FlowControl, Parity, SerialPortBuilderExt, SerialStream, StopBits};
use tokio_util::codec::{BytesCodec, FramedRead};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Serial port flow control type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SerialFlowControl {
    /// No flow control
    #[default]
    None,
    /// Hardware flow control (RTS/CTS)
    Hardware,
    /// Software flow control (XON/XOFF)
    Software,
}

/// Serial port parity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SerialParity {
    /// No parity
    #[default]
    None,
    /// Odd parity
    Odd,
    /// Even parity
    Even,
}

/// Line settings applied to every port this transport opens
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerialConfig {
    /// Baud rate
    pub baud_rate: u32,
    /// Data bits (5, 6, 7, 8)
    pub data_bits: u8,
    /// Stop bits (1, 2)
    pub stop_bits: u8,
    /// Parity
    pub parity: SerialParity,
    /// Flow control
    pub flow_control: SerialFlowControl,
}

impl SerialConfig {
    /// 8N1 at the given baud rate
    pub fn new(baud_rate: u32) -> Self {
        Self {
            baud_rate,
            data_bits: 8,
            stop_bits: 1,
            parity: SerialParity::None,
            flow_control: SerialFlowControl::None,
        }
    }

    /// Set parity
    #[must_use]
    pub fn parity(mut self, parity: SerialParity) -> Self {
        self.parity = parity;
        self
    }

    /// Set flow control
    #[must_use]
    pub fn flow_control(mut self, flow: SerialFlowControl) -> Self {
        self.flow_control = flow;
        self
    }

    fn data_bits_setting(&self) -> DataBits {
        match self.data_bits {
            5 => DataBits::Five,
            6 => DataBits::Six,
            7 => DataBits::Seven,
            _ => DataBits::Eight,
        }
    }

    fn stop_bits_setting(&self) -> StopBits {
        match self.stop_bits {
            2 => StopBits::Two,
            _ => StopBits::One,
        }
    }

    fn parity_setting(&self) -> Parity {
        match self.parity {
            SerialParity::Odd => Parity::Odd,
            SerialParity::Even => Parity::Even,
            SerialParity::None => Parity::None,
        }
    }

    fn flow_control_setting(&self) -> FlowControl {
        match self.flow_control {
            SerialFlowControl::Hardware => FlowControl::Hardware,
            SerialFlowControl::Software => FlowControl::Software,
            SerialFlowControl::None => FlowControl::None,
        }
    }
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self::new(9600)
    }
}

enum Port {
    Closed,
    /// Opened, nobody reading yet
    Open(SerialStream),
    /// Reader task owns the read half
    Receiving {
        writer: WriteHalf<SerialStream>,
        cancel: CancellationToken,
    },
}

/// Serial port transport
pub struct SerialTransport {
    config: SerialConfig,
    port: Port,
}

impl SerialTransport {
    pub fn new(config: SerialConfig) -> Self {
        Self {
            config,
            port: Port::Closed,
        }
    }
}

#[async_trait]
impl Transport for SerialTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Serial
    }

    fn capabilities(&self) -> TransportCapabilities {
        TransportCapabilities::CLIENT
    }

    async fn connect(&mut self, device: &DeviceDescriptor) -> Result<(), TransportError> {
        self.end_receiving();

        let stream = tokio_serial::new(&device.id, self.config.baud_rate)
            .data_bits(self.config.data_bits_setting())
            .stop_bits(self.config.stop_bits_setting())
            .parity(self.config.parity_setting())
            .flow_control(self.config.flow_control_setting())
            .open_native_async()
            .map_err(|e| match e.kind() {
                serialport::ErrorKind::NoDevice => TransportError::DeviceNotFound(device.id.clone()),
                serialport::ErrorKind::Io(std::io::ErrorKind::PermissionDenied) => {
                    TransportError::PermissionDenied(device.id.clone())
                }
                serialport::ErrorKind::Io(std::io::ErrorKind::NotFound) => {
                    TransportError::DeviceNotFound(device.id.clone())
                }
                _ => TransportError::ConnectionFailed(e.to_string()),
            })?;

        debug!(port = %device.id, baud = self.config.baud_rate, "Serial port opened");
        self.port = Port::Open(stream);
        Ok(())
    }

    async fn send(&mut self, data: &[u8]) -> Result<(), TransportError> {
        match &mut self.port {
            Port::Open(stream) => {
                stream.write_all(data).await?;
                stream.flush().await?;
            }
            Port::Receiving { writer, .. } => {
                writer.write_all(data).await?;
                writer.flush().await?;
            }
            Port::Closed => return Err(TransportError::NotConnected),
        }
        Ok(())
    }

    async fn begin_receiving(&mut self, sink: EventSink) -> Result<(), TransportError> {
        let stream = match std::mem::replace(&mut self.port, Port::Closed) {
            Port::Open(stream) => stream,
            other => {
                self.port = other;
                return Err(TransportError::NotConnected);
            }
        };

        let (reader, writer) = tokio::io::split(stream);
        let cancel = CancellationToken::new();
        tokio::spawn(read_loop(reader, sink, cancel.clone()));

        self.port = Port::Receiving { writer, cancel };
        Ok(())
    }

    fn end_receiving(&mut self) {
        if let Port::Receiving { cancel, .. } = &self.port {
            cancel.cancel();
        }
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        self.end_receiving();
        if let Port::Receiving { mut writer, .. } = std::mem::replace(&mut self.port, Port::Closed) {
            if let Err(e) = writer.shutdown().await {
                warn!(error = %e, "Serial port shutdown failed");
            }
        }
        Ok(())
    }

    async fn enumerate_devices(&mut self) -> Result<Vec<DeviceDescriptor>, TransportError> {
        list_ports()
    }
}

async fn read_loop(reader: ReadHalf<SerialStream>, sink: EventSink, cancel: CancellationToken) {
    let mut frames = FramedRead::new(reader, BytesCodec::new());

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            frame = frames.next() => match frame {
                Some(Ok(bytes)) => sink.data(bytes.freeze()),
                Some(Err(e)) => {
                    warn!(session = sink.session(), error = %e, "Serial read failed");
                    sink.error(TransportError::IoError(e));
                    sink.disconnected();
                    break;
                }
                None => {
                    sink.disconnected();
                    break;
                }
            },
        }
    }
}

/// Serial ports present on this machine
pub fn list_ports() -> Result<Vec<DeviceDescriptor>, TransportError> {
    let ports = serialport::available_ports()
        .map_err(|e| TransportError::IoError(std::io::Error::other(e)))?;

    Ok(ports
        .into_iter()
        .map(|port| {
            let name = match &port.port_type {
                SerialPortType::UsbPort(usb) => usb
                    .product
                    .clone()
                    .unwrap_or_else(|| format!("USB {:04x}:{:04x}", usb.vid, usb.pid)),
                SerialPortType::BluetoothPort => "Bluetooth serial".to_string(),
                SerialPortType::PciPort => "PCI serial".to_string(),
                SerialPortType::Unknown => port.port_name.clone(),
            };
            DeviceDescriptor::new(port.port_name.clone(), TransportKind::Serial)
                .with_name(name)
                .with_address(port.port_name)
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = SerialConfig::default();
        assert_eq!(config.baud_rate, 9600);
        assert_eq!(config.data_bits_setting(), DataBits::Eight);
        assert_eq!(config.stop_bits_setting(), StopBits::One);
        assert_eq!(config.parity_setting(), Parity::None);
    }

    #[test]
    fn test_config_builder() {
        let config = SerialConfig::new(115_200)
            .parity(SerialParity::Even)
            .flow_control(SerialFlowControl::Hardware);
        assert_eq!(config.parity_setting(), Parity::Even);
        assert_eq!(config.flow_control_setting(), FlowControl::Hardware);
    }

    #[tokio::test]
    async fn test_send_before_connect() {
        let mut transport = SerialTransport::new(SerialConfig::default());
        assert!(matches!(
            transport.send(b"$PMTK").await,
            Err(TransportError::NotConnected)
        ));
        let (sink, _rx) = EventSink::pair(1);
        assert!(transport.begin_receiving(sink).await.is_err());
    }
}
