//! Simulated peripheral
//!
//! Emits a GGA fix wandering around a fixed base position, or an EML reading,
//! once per interval. Useful for running the stack without hardware.

use super::{
    DeviceDescriptor, EventSink, Transport, TransportCapabilities, TransportError, TransportKind,
};
use crate::core::protocol::calculate_checksum;
use async_trait::async_trait;
use chrono::{DateTime, Timelike, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

const BASE_LATITUDE: f64 = 3436.223;
const BASE_LONGITUDE: f64 = 5822.898;
const EML_FREQUENCIES: [u32; 3] = [8_192, 33_000, 200_000];

/// What the simulated device produces
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SimulatedProfile {
    /// NMEA GGA sentences
    #[default]
    Gps,
    /// EML locator readings
    Eml,
}

/// Simulated transport
pub struct SimulatedTransport {
    profile: SimulatedProfile,
    interval: Duration,
    connect_delay: Duration,
    connected: bool,
    generator: Option<CancellationToken>,
}

impl SimulatedTransport {
    pub fn new(profile: SimulatedProfile) -> Self {
        Self {
            profile,
            interval: Duration::from_secs(1),
            connect_delay: Duration::from_millis(500),
            connected: false,
            generator: None,
        }
    }

    /// Set the emit interval
    #[must_use]
    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Set the artificial connect latency
    #[must_use]
    pub fn connect_delay(mut self, delay: Duration) -> Self {
        self.connect_delay = delay;
        self
    }
}

#[async_trait]
impl Transport for SimulatedTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Simulated
    }

    fn capabilities(&self) -> TransportCapabilities {
        TransportCapabilities::CLIENT
    }

    async fn connect(&mut self, device: &DeviceDescriptor) -> Result<(), TransportError> {
        if self.connected {
            return Ok(());
        }
        tokio::time::sleep(self.connect_delay).await;
        debug!(device = %device, "Simulated device connected");
        self.connected = true;
        Ok(())
    }

    async fn send(&mut self, data: &[u8]) -> Result<(), TransportError> {
        if !self.connected {
            return Err(TransportError::NotConnected);
        }
        debug!(len = data.len(), data = %hex::encode(data), "Simulated send");
        Ok(())
    }

    async fn begin_receiving(&mut self, sink: EventSink) -> Result<(), TransportError> {
        if !self.connected {
            return Err(TransportError::NotConnected);
        }
        self.end_receiving();

        let cancel = CancellationToken::new();
        tokio::spawn(generate(self.profile, self.interval, sink, cancel.clone()));
        self.generator = Some(cancel);
        Ok(())
    }

    fn end_receiving(&mut self) {
        if let Some(cancel) = self.generator.take() {
            cancel.cancel();
        }
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        self.end_receiving();
        self.connected = false;
        Ok(())
    }

    async fn enumerate_devices(&mut self) -> Result<Vec<DeviceDescriptor>, TransportError> {
        tokio::time::sleep(self.connect_delay).await;
        Ok(mock_devices())
    }
}

/// Devices the simulator pretends to see
pub fn mock_devices() -> Vec<DeviceDescriptor> {
    [
        ("sim-1", "Simulated GPS Device 1", "00:11:22:33:44:55"),
        ("sim-2", "Simulated GPS Device 2", "00:11:22:33:44:66"),
        ("sim-3", "Simulated Bluetooth Receiver", "00:11:22:33:44:77"),
    ]
    .into_iter()
    .map(|(id, name, address)| {
        DeviceDescriptor::new(id, TransportKind::Simulated)
            .with_name(name)
            .with_address(address)
    })
    .collect()
}

async fn generate(
    profile: SimulatedProfile,
    interval: Duration,
    sink: EventSink,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // First tick completes immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let line = match profile {
                    SimulatedProfile::Gps => gga_sentence(Utc::now()),
                    SimulatedProfile::Eml => eml_line(),
                };
                sink.data(line.into_bytes());
            }
        }
    }
}

/// A valid GGA sentence near the base position, CRLF terminated
pub fn gga_sentence(now: DateTime<Utc>) -> String {
    let mut rng = rand::thread_rng();
    let latitude = BASE_LATITUDE + (rng.gen::<f64>() - 0.5) * 0.01;
    let longitude = BASE_LONGITUDE + (rng.gen::<f64>() - 0.5) * 0.01;
    let fix_quality = if rng.gen_bool(0.9) { 4 } else { 1 };

    let body = format!(
        "GPGGA,{:02}{:02}{:02}.00,{latitude:.3},S,{longitude:09.3},W,{fix_quality},08,0.9,25.0,M,34.0,M,,",
        now.hour(),
        now.minute(),
        now.second(),
    );
    format!("${body}*{:02X}\r\n", calculate_checksum(&body))
}

/// A valid EML reading line
pub fn eml_line() -> String {
    let mut rng = rand::thread_rng();
    let frequency = EML_FREQUENCIES[rng.gen_range(0..EML_FREQUENCIES.len())];
    let depth: u32 = rng.gen_range(50..400);
    let current: u32 = rng.gen_range(0..250);
    let signal: i32 = rng.gen_range(-80..-20);

    format!("F03,0073,ACTIVE,{frequency}Hz,140,---,L,P,cm,{depth},mA,{current},dB,{signal}\r\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::protocol::{parse_eml, parse_gga, verify_checksum, FixQuality};
    use crate::core::transport::TransportEvent;
    use chrono::TimeZone;

    #[test]
    fn test_generated_gga_parses() {
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 9, 7, 3).unwrap();
        for _ in 0..20 {
            let sentence = gga_sentence(now);
            assert!(sentence.ends_with("\r\n"));
            let sentence = sentence.trim_end();
            assert!(verify_checksum(sentence), "{sentence}");

            let fix = parse_gga(sentence).unwrap();
            assert!(fix.is_valid);
            assert_eq!(fix.utc_time, "090703.00");
            assert!(matches!(fix.fix_quality, FixQuality::GpsFix | FixQuality::Rtk));
            let lat = fix.latitude.unwrap();
            assert!((-34.61..-34.59).contains(&lat), "{lat}");
            assert!(fix.longitude.unwrap() < -58.0);
        }
    }

    #[test]
    fn test_generated_eml_parses() {
        let reading = parse_eml(eml_line().trim_end());
        assert!(reading.is_valid);
        assert!(reading.frequency >= 8_192);
        assert_eq!(reading.mode, "ACTIVE");
    }

    #[tokio::test(start_paused = true)]
    async fn test_emits_once_per_interval() {
        let mut transport = SimulatedTransport::new(SimulatedProfile::Eml);
        let device = mock_devices().remove(0);
        transport.connect(&device).await.unwrap();

        let (sink, mut rx) = EventSink::pair(9);
        transport.begin_receiving(sink).await.unwrap();

        let first = rx.recv().await.unwrap();
        assert_eq!(first.session, 9);
        assert!(matches!(first.event, TransportEvent::Data(_)));

        transport.disconnect().await.unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;
        while let Ok(event) = rx.try_recv() {
            assert!(matches!(event.event, TransportEvent::Data(_)));
        }
        assert!(transport.send(b"x").await.is_err());
    }
}
