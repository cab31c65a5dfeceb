//! Stream decoders
//!
//! A [`FrameDecoder`] owns a channel's accumulation buffer and turns raw
//! chunks into records. One implementation per channel protocol.

use crate::core::protocol::{
    parse_eml, parse_gga, EmlReading, GgaFix, JsonStreamParser, LineFramer, NmeaError,
    StructuredRecord, DEFAULT_LINE_BUFFER_CAP, DEFAULT_MAX_BUFFER,
};
use crate::core::protocol::framing::LineFilter;
use tracing::{debug, trace};

/// A frame that was dropped instead of becoming a record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Discard {
    /// The frame, or a preview of it
    pub frame: String,
    /// Why it was dropped
    pub reason: String,
}

impl Discard {
    fn new(frame: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            frame: frame.into(),
            reason: reason.into(),
        }
    }
}

/// Everything one chunk produced
#[derive(Debug, Clone)]
pub struct Decoded<R> {
    pub records: Vec<R>,
    pub discarded: Vec<Discard>,
    /// Bytes lost to buffer truncation
    pub overflowed: Option<usize>,
}

impl<R> Default for Decoded<R> {
    fn default() -> Self {
        Self {
            records: Vec::new(),
            discarded: Vec::new(),
            overflowed: None,
        }
    }
}

/// Extractor + parser pair for one channel protocol
pub trait FrameDecoder: Send + 'static {
    /// Record type handed to subscribers
    type Record: Send + Sync + 'static;

    /// Feed received bytes
    fn decode(&mut self, data: &[u8]) -> Decoded<Self::Record>;

    /// Drop any buffered partial frame
    fn reset(&mut self);
}

/// NMEA GGA decoder for the GPS channel
#[derive(Debug, Clone)]
pub struct GpsDecoder {
    framer: LineFramer,
    emit_invalid: bool,
}

impl Default for GpsDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_LINE_BUFFER_CAP, false)
    }
}

impl GpsDecoder {
    /// Create a decoder; `emit_invalid` also forwards fixes that failed validation
    pub fn new(line_buffer_cap: usize, emit_invalid: bool) -> Self {
        Self {
            framer: LineFramer::nmea(line_buffer_cap),
            emit_invalid,
        }
    }
}

impl FrameDecoder for GpsDecoder {
    type Record = GgaFix;

    fn decode(&mut self, data: &[u8]) -> Decoded<GgaFix> {
        let framed = self.framer.push(data);
        let mut out = Decoded {
            overflowed: framed.overflowed,
            ..Decoded::default()
        };

        for line in framed.rejected {
            out.discarded.push(Discard::new(line, "not an NMEA sentence"));
        }

        for sentence in framed.lines {
            match parse_gga(&sentence) {
                Ok(fix) if self.emit_invalid || (fix.is_valid && fix.checksum_valid) => {
                    out.records.push(fix);
                }
                Ok(fix) => {
                    let reason = if fix.checksum_valid {
                        "no position fix"
                    } else {
                        "checksum mismatch"
                    };
                    out.discarded.push(Discard::new(fix.raw_sentence, reason));
                }
                Err(NmeaError::UnsupportedSentence(id)) => {
                    trace!(%id, "Skipping non-GGA sentence");
                }
                Err(e) => {
                    debug!(error = %e, %sentence, "Discarding malformed sentence");
                    out.discarded.push(Discard::new(sentence, e.to_string()));
                }
            }
        }

        out
    }

    fn reset(&mut self) {
        self.framer.clear();
    }
}

/// CSV reading decoder for the EML channel
#[derive(Debug, Clone)]
pub struct EmlDecoder {
    framer: LineFramer,
}

impl Default for EmlDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_LINE_BUFFER_CAP)
    }
}

impl EmlDecoder {
    pub fn new(line_buffer_cap: usize) -> Self {
        Self {
            framer: LineFramer::new(LineFilter::Any, line_buffer_cap),
        }
    }
}

impl FrameDecoder for EmlDecoder {
    type Record = EmlReading;

    fn decode(&mut self, data: &[u8]) -> Decoded<EmlReading> {
        let framed = self.framer.push(data);
        Decoded {
            // Short readings still go out, flagged invalid
            records: framed.lines.iter().map(|line| parse_eml(line)).collect(),
            discarded: Vec::new(),
            overflowed: framed.overflowed,
        }
    }

    fn reset(&mut self) {
        self.framer.clear();
    }
}

/// JSON object stream decoder for the telemetry channel
#[derive(Debug, Clone)]
pub struct JsonStreamDecoder {
    parser: JsonStreamParser,
    buffer: Vec<u8>,
}

impl Default for JsonStreamDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_BUFFER)
    }
}

impl JsonStreamDecoder {
    pub fn new(max_buffer: usize) -> Self {
        Self {
            parser: JsonStreamParser::new(max_buffer),
            buffer: Vec::new(),
        }
    }

    /// Bytes carried over to the next chunk
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}

impl FrameDecoder for JsonStreamDecoder {
    type Record = StructuredRecord;

    fn decode(&mut self, data: &[u8]) -> Decoded<StructuredRecord> {
        self.buffer.extend_from_slice(data);
        let result = self.parser.parse(&self.buffer);
        self.buffer = result.remainder;

        let mut out = Decoded {
            records: result.records,
            ..Decoded::default()
        };
        if result.truncated {
            out.overflowed = Some(result.discarded);
        } else if result.discarded > 0 {
            out.discarded.push(Discard::new(
                format!("{} bytes", result.discarded),
                "corrupted prefix",
            ));
        }
        out
    }

    fn reset(&mut self) {
        self.buffer.clear();
    }
}
