//! Record output for the CLI
//!
//! Records print either as one human-readable line or as one JSON object per
//! line, so the output can be piped into `jq` and friends.

use crate::core::protocol::{format_coordinate_dms, EmlReading, GgaFix, StructuredRecord};
use crate::core::session::ChannelEvent;
use clap::ValueEnum;
use serde::Serialize;

/// CLI output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text
    #[default]
    Text,
    /// One JSON object per line
    Json,
}

/// A record the CLI knows how to print
pub trait Render: Serialize {
    /// One-line text form
    fn text(&self) -> String;

    /// Format according to `format`
    fn render(&self, format: OutputFormat) -> String {
        match format {
            OutputFormat::Text => self.text(),
            OutputFormat::Json => serde_json::to_string(self)
                .unwrap_or_else(|e| format!("{{\"error\":\"{e}\"}}")),
        }
    }
}

impl Render for GgaFix {
    fn text(&self) -> String {
        let position = match (self.latitude, self.longitude) {
            (Some(lat), Some(lon)) => format!(
                "{}  {}",
                format_coordinate_dms(lat, true),
                format_coordinate_dms(lon, false)
            ),
            _ => "no position".to_string(),
        };
        let altitude = self
            .altitude
            .map(|a| format!("{a:.1} {}", self.altitude_units))
            .unwrap_or_else(|| "-".to_string());

        format!(
            "{} {:<9} {}  sats={} hdop={} alt={}{}",
            self.utc_time,
            self.fix_quality.label(),
            position,
            self.satellites_used,
            self.hdop.map_or_else(|| "-".to_string(), |h| format!("{h:.1}")),
            altitude,
            if self.is_valid { "" } else { "  [invalid]" },
        )
    }
}

impl Render for EmlReading {
    fn text(&self) -> String {
        if !self.is_valid {
            return format!("[invalid] {}", self.raw);
        }
        format!(
            "{} {}  depth={} {}  current={} {}  signal={} {}",
            self.mode,
            self.frequency_display,
            self.depth,
            self.depth_unit,
            self.current,
            self.current_unit,
            self.signal,
            self.signal_unit,
        )
    }
}

impl Render for StructuredRecord {
    fn text(&self) -> String {
        self.iter()
            .map(|(key, value)| format!("{key}={value}"))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// One-line description of a channel event for stderr
pub fn describe_event(event: &ChannelEvent) -> String {
    match event {
        ChannelEvent::StateChanged(state) => format!("state: {state}"),
        ChannelEvent::DeviceChanged(Some(device)) => format!("device: {device}"),
        ChannelEvent::DeviceChanged(None) => "device: none".to_string(),
        ChannelEvent::TransportError(e) => format!("transport error: {e}"),
        ChannelEvent::ReconnectScheduled { attempt, delay } => {
            format!("reconnect #{attempt} in {} ms", delay.as_millis())
        }
        ChannelEvent::FrameDiscarded { frame, reason } => format!("discarded ({reason}): {frame}"),
        ChannelEvent::BufferOverflow { dropped } => format!("buffer overflow, {dropped} bytes dropped"),
        ChannelEvent::SubscriberFailed { subscription, error } => {
            format!("subscriber {subscription} failed: {error}")
        }
    }
}
