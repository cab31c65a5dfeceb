//! The application's peripheral channels
//!
//! Builds the GPS, EML and telemetry channels from an [`AppConfig`]. Each
//! call creates fresh, independent channel tasks.

use crate::config::{AppConfig, ChannelConfig};
use crate::core::decoder::{EmlDecoder, GpsDecoder, JsonStreamDecoder};
use crate::core::protocol::{EmlReading, GgaFix, StructuredRecord};
use crate::core::session::{Channel, ChannelError, ChannelKind, ChannelSession};
use tracing::info;

/// GPS channel handle
pub type GpsChannel = Channel<GgaFix>;
/// EML channel handle
pub type EmlChannel = Channel<EmlReading>;
/// Telemetry channel handle
pub type TelemetryChannel = Channel<StructuredRecord>;

/// Spawn a GPS channel
pub fn gps_channel(config: &ChannelConfig) -> GpsChannel {
    ChannelSession::spawn(
        ChannelKind::Gps,
        GpsDecoder::new(config.line_buffer_cap, config.emit_invalid_fixes),
        config,
    )
}

/// Spawn an EML channel
pub fn eml_channel(config: &ChannelConfig) -> EmlChannel {
    ChannelSession::spawn(
        ChannelKind::Eml,
        EmlDecoder::new(config.line_buffer_cap),
        config,
    )
}

/// Spawn a telemetry channel
pub fn telemetry_channel(config: &ChannelConfig) -> TelemetryChannel {
    ChannelSession::spawn(
        ChannelKind::Telemetry,
        JsonStreamDecoder::new(config.json_buffer_cap),
        config,
    )
}

/// All three channels
#[derive(Clone)]
pub struct LinkSet {
    pub gps: GpsChannel,
    pub eml: EmlChannel,
    pub telemetry: TelemetryChannel,
}

impl LinkSet {
    /// Spawn every channel. Must be called inside a tokio runtime.
    pub fn new(config: &AppConfig) -> Self {
        info!("Starting peripheral channels");
        Self {
            gps: gps_channel(&config.gps),
            eml: eml_channel(&config.eml),
            telemetry: telemetry_channel(&config.telemetry),
        }
    }

    /// Disconnect and stop every channel
    pub async fn shutdown(&self) -> Result<(), ChannelError> {
        let (gps, eml, telemetry) = tokio::join!(
            self.gps.shutdown(),
            self.eml.shutdown(),
            self.telemetry.shutdown()
        );
        gps.and(eml).and(telemetry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::state_machine::ConnectionState;

    #[tokio::test]
    async fn test_channels_are_independent() {
        let mut config = AppConfig::default();
        config.eml.enabled = false;

        let links = LinkSet::new(&config);
        let other = LinkSet::new(&config);

        assert_eq!(links.gps.kind(), ChannelKind::Gps);
        assert_eq!(links.eml.kind(), ChannelKind::Eml);
        assert_eq!(links.telemetry.kind(), ChannelKind::Telemetry);

        links.shutdown().await.unwrap();
        assert!(matches!(links.gps.shutdown().await, Err(ChannelError::Closed)));
        assert_eq!(other.gps.current_state(), ConnectionState::Disconnected);
        other.shutdown().await.unwrap();
    }
}
