//! # Fieldlink Core Library
//!
//! Keeps field peripherals connected and turns their byte streams into
//! records:
//! - GPS receivers (NMEA 0183 GGA)
//! - Electromagnetic cable/pipe locators (CSV readings)
//! - JSON telemetry, recovered from corrupted streams
//!
//! ## Features
//!
//! - One lifecycle manager per channel with automatic reconnection
//! - BLE, serial/RFCOMM, listen-mode and simulated transports
//! - Bounded accumulation buffers and corruption-tolerant parsers
//! - Isolated subscribers: a failing handler never stalls the stream
//!
//! ## Example
//!
//! ```rust,no_run
//! use fieldlink_core::core::transport::mock_devices;
//! use fieldlink_core::{AppConfig, LinkSet, SimulatedProfile, SimulatedTransport};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let links = LinkSet::new(&AppConfig::default());
//!
//!     let _sub = links.gps.subscribe(|fix| {
//!         println!("{:?} {:?}", fix.latitude, fix.longitude);
//!         Ok(())
//!     });
//!
//!     let transport = SimulatedTransport::new(SimulatedProfile::Gps);
//!     links.gps.set_transport(Some(Box::new(transport))).await?;
//!     links.gps.select_device(mock_devices().into_iter().next()).await?;
//!
//!     tokio::signal::ctrl_c().await?;
//!     links.shutdown().await?;
//!     Ok(())
//! }
//! ```

#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

pub mod cli;
pub mod config;
pub mod core;

// Re-exports for convenience
pub use crate::cli::{CliResult, ExitCodes, OutputFormat};
pub use crate::config::{AppConfig, ChannelConfig, ConfigError, LoggingConfig};
pub use crate::core::decoder::{EmlDecoder, FrameDecoder, GpsDecoder, JsonStreamDecoder};
pub use crate::core::links::LinkSet;
pub use crate::core::protocol::{
    parse_eml, parse_gga, parse_json_stream, EmlReading, GgaFix, JsonStreamResult,
    StructuredRecord,
};
pub use crate::core::session::{Channel, ChannelError, ChannelEvent, ChannelKind, ChannelSession};
pub use crate::core::state_machine::{ConnectionState, DisconnectReason};
pub use crate::core::subscribers::{SubscriberError, Subscription};
pub use crate::core::transport::{
    BleTransport, DeviceDescriptor, EventSink, ListenTransport, ScriptedTransport,
    SerialConfig, SerialTransport, SimulatedProfile, SimulatedTransport, Transport,
    TransportCapabilities, TransportError, TransportKind,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
