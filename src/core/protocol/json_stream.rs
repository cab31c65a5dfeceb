//! Corruption-tolerant JSON object stream parser
//!
//! Telemetry peripherals write back-to-back JSON objects with no delimiter
//! (`{..}{..}{..}`) over a lossy link. Bytes can go missing mid-object, so
//! the parser works in two passes:
//!
//! 1. Split on `}{` boundaries and strictly decode each span.
//! 2. For spans that fail, scan for brace-balanced sub-spans (string and
//!    escape aware) and decode those individually.
//!
//! The last span is left untouched while it is still a valid JSON prefix,
//! since the rest of that object may arrive with the next chunk.
//!
//! Whatever could not be consumed is returned as the remainder, to be
//! prefixed to the next chunk.

use serde_json::{Map, Value};
use tracing::{debug, warn};

/// One recovered top-level JSON object
pub type StructuredRecord = Map<String, Value>;

/// Default accumulation cap
pub const DEFAULT_MAX_BUFFER: usize = 200 * 1024;

/// Result of one parse pass
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JsonStreamResult {
    /// Objects in order of their opening brace
    pub records: Vec<StructuredRecord>,
    /// Unconsumed tail, empty on full success
    pub remainder: Vec<u8>,
    /// Bytes thrown away as garbage prefix or by truncation
    pub discarded: usize,
    /// The buffer exceeded the cap and was cut to its trailing half
    pub truncated: bool,
}

/// Parser with a configurable accumulation cap
#[derive(Debug, Clone, Copy)]
pub struct JsonStreamParser {
    max_buffer: usize,
}

impl Default for JsonStreamParser {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_BUFFER)
    }
}

impl JsonStreamParser {
    /// Create a parser that truncates beyond `max_buffer` bytes
    pub fn new(max_buffer: usize) -> Self {
        Self {
            max_buffer: max_buffer.max(2),
        }
    }

    /// Extract every complete object from `buffer`
    pub fn parse(&self, buffer: &[u8]) -> JsonStreamResult {
        let mut records = Vec::new();
        let mut remaining = buffer;
        let mut discarded = 0;
        let mut truncated = false;

        if remaining.len() > self.max_buffer {
            warn!(
                len = remaining.len(),
                cap = self.max_buffer,
                "JSON buffer over capacity, extracting before truncation"
            );

            let rest = try_complete(remaining, &mut records);
            if !records.is_empty() {
                remaining = rest;
                debug!(len = remaining.len(), objects = records.len(), "Buffer reduced");
            }

            if remaining.len() > self.max_buffer {
                let keep = self.max_buffer / 2;
                warn!(dropped = remaining.len() - keep, "Truncating JSON buffer to trailing half");
                discarded += remaining.len() - keep;
                remaining = &remaining[remaining.len() - keep..];
                truncated = true;
            }
        }

        if remaining.first() != Some(&b'{') {
            let cut = find_boundary(remaining, 0)
                .map(|i| i + 1)
                .or_else(|| remaining.iter().position(|&b| b == b'{'));

            if let Some(cut) = cut {
                warn!(
                    bytes = cut,
                    preview = %String::from_utf8_lossy(&remaining[..cut.min(50)]),
                    "Discarding corrupted prefix"
                );
                discarded += cut;
                remaining = &remaining[cut..];
            }
        }

        let rest = try_complete(remaining, &mut records);

        JsonStreamResult {
            records,
            remainder: rest.to_vec(),
            discarded,
            truncated,
        }
    }
}

/// Parse with the default cap
pub fn parse_json_stream(buffer: &[u8]) -> JsonStreamResult {
    JsonStreamParser::default().parse(buffer)
}

fn find_boundary(buf: &[u8], from: usize) -> Option<usize> {
    buf.get(from..)?
        .windows(2)
        .position(|w| w == b"}{")
        .map(|i| i + from)
}

fn boundaries(buf: &[u8]) -> Vec<usize> {
    let mut found = Vec::new();
    let mut from = 0;
    while let Some(i) = find_boundary(buf, from) {
        found.push(i);
        from = i + 1;
    }
    found
}

fn try_complete<'a>(buf: &'a [u8], records: &mut Vec<StructuredRecord>) -> &'a [u8] {
    if buf.first() != Some(&b'{') {
        let consumed = extract_embedded(buf, records);
        return after_consumed(buf, consumed);
    }

    let mut current = 0;
    for boundary in boundaries(buf) {
        // A failed span is dropped either way
        try_parse_and_add(&buf[current..=boundary], records);
        current = boundary + 1;
    }

    let tail = &buf[current..];
    match serde_json::from_slice::<Value>(tail) {
        Ok(Value::Object(map)) => {
            records.push(map);
            &[]
        }
        // Still a valid prefix, the rest of the object has not arrived yet
        Err(e) if e.is_eof() => tail,
        _ => {
            let consumed = extract_embedded(tail, records);
            after_consumed(tail, consumed)
        }
    }
}

/// What is left of `buf` once its first `consumed` bytes were recovered.
///
/// Bytes between the last recovered `}` and the next `{` can never become
/// part of an object and are dropped.
fn after_consumed(buf: &[u8], consumed: usize) -> &[u8] {
    if consumed == 0 {
        return buf;
    }
    let rest = &buf[consumed..];
    match rest.iter().position(|&b| b == b'{') {
        Some(open) => {
            if open > 0 {
                debug!(bytes = open, "Dropping bytes after recovered object");
            }
            &rest[open..]
        }
        None => {
            if !rest.is_empty() {
                debug!(bytes = rest.len(), "Dropping bytes after recovered object");
            }
            &[]
        }
    }
}

fn try_parse_and_add(span: &[u8], records: &mut Vec<StructuredRecord>) -> bool {
    match serde_json::from_slice::<Value>(span) {
        Ok(Value::Object(map)) => {
            records.push(map);
            true
        }
        Ok(_) => {
            debug!("Parsed value is not a JSON object, discarding");
            false
        }
        Err(e) => {
            if extract_embedded(span, records) > 0 {
                return true;
            }
            debug!(
                error = %e,
                preview = %String::from_utf8_lossy(&span[..span.len().min(50)]),
                "Discarding corrupted JSON span"
            );
            false
        }
    }
}

/// Index of the `}` that balances the `{` at `open`, ignoring braces in strings
fn matching_close(buf: &[u8], open: usize) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escape_next = false;

    for (j, &byte) in buf.iter().enumerate().skip(open) {
        if escape_next {
            escape_next = false;
            continue;
        }
        match byte {
            b'\\' => escape_next = true,
            b'"' => in_string = !in_string,
            b'{' if !in_string => depth += 1,
            b'}' if !in_string => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return Some(j);
                }
            }
            _ => {}
        }
    }
    None
}

/// Scan for brace-balanced objects anywhere in `buf`.
///
/// Returns the offset just past the last recovered object, 0 if none was found.
fn extract_embedded(buf: &[u8], records: &mut Vec<StructuredRecord>) -> usize {
    let mut consumed = 0;
    let mut i = 0;

    while i < buf.len() {
        let Some(open) = buf[i..].iter().position(|&b| b == b'{').map(|p| p + i) else {
            break;
        };

        i = open + 1;
        if let Some(close) = matching_close(buf, open) {
            if let Ok(Value::Object(map)) = serde_json::from_slice::<Value>(&buf[open..=close]) {
                records.push(map);
                consumed = close + 1;
                i = consumed;
            }
        }
    }

    consumed
}
