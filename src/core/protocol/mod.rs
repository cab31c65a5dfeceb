//! Protocol implementations
//!
//! Streaming parsers for peripheral output:
//! - Line framing with a bounded remainder
//! - NMEA 0183 GGA fixes
//! - EML locator readings (CSV)
//! - Corruption-tolerant JSON object streams

pub mod eml;
pub mod framing;
pub mod json_stream;
pub mod nmea;

pub use eml::{format_frequency, parse_eml, parse_frequency, EmlReading};
pub use framing::{FramedLines, LineFilter, LineFramer, DEFAULT_LINE_BUFFER_CAP};
pub use json_stream::{
    parse_json_stream, JsonStreamParser, JsonStreamResult, StructuredRecord, DEFAULT_MAX_BUFFER,
};
pub use nmea::{
    calculate_checksum, format_coordinate_dms, parse_gga, parse_gga_on, verify_checksum,
    FixQuality, GgaFix, NmeaError,
};
