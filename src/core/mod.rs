//! Core module containing the main functionality of Fieldlink
//!
//! This module provides:
//! - Transport layer for peripheral links (BLE, serial, listen, simulated)
//! - Streaming protocol parsers (NMEA GGA, EML, JSON recovery)
//! - Stream decoders pairing framing with parsing
//! - Connection lifecycle management with state machine and reconnect backoff
//! - Subscriber registry with failure isolation

pub mod decoder;
pub mod links;
pub mod protocol;
pub mod reconnect;
pub mod session;
pub mod state_machine;
pub mod subscribers;
pub mod transport;
