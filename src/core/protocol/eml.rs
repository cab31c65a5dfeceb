//! Electromagnetic locator (EML) reading parser
//!
//! Cable/pipe locators stream one comma-separated reading per line:
//!
//! ```text
//! F03,0073,ACTIVE,200000Hz,140,---,L,P,cm,0,mA,0,dB,-60,...
//!          mode   freq            dU  d  cU cur sU sig
//! ```
//!
//! Readings with too few fields are not errors; they come back as an
//! all-zero record with `is_valid == false`.

use regex::Regex;
use serde::Serialize;
use std::sync::OnceLock;

const FIELD_MODE: usize = 2;
const FIELD_FREQUENCY: usize = 3;
const FIELD_DEPTH_UNIT: usize = 8;
const FIELD_DEPTH: usize = 9;
const FIELD_CURRENT_UNIT: usize = 10;
const FIELD_CURRENT: usize = 11;
const FIELD_SIGNAL_UNIT: usize = 12;
const FIELD_SIGNAL: usize = 13;

/// Minimum number of comma-separated fields in a reading
pub const MIN_FIELD_COUNT: usize = 14;

/// Placeholder frequency display for invalid readings
pub const NO_FREQUENCY: &str = "-";

/// One decoded locator reading
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EmlReading {
    /// Operating mode, e.g. `ACTIVE`
    pub mode: String,
    /// Locate frequency in Hz
    pub frequency: u64,
    /// Human form of `frequency`, e.g. `200 kHz`
    pub frequency_display: String,
    pub depth: f64,
    pub depth_unit: String,
    pub current: f64,
    pub current_unit: String,
    pub signal: f64,
    pub signal_unit: String,
    pub is_valid: bool,
    /// Line the reading was decoded from
    pub raw: String,
}

impl EmlReading {
    /// All-zero reading for a line that could not be decoded
    pub fn invalid(raw: impl Into<String>) -> Self {
        Self {
            mode: String::new(),
            frequency: 0,
            frequency_display: NO_FREQUENCY.to_string(),
            depth: 0.0,
            depth_unit: String::new(),
            current: 0.0,
            current_unit: String::new(),
            signal: 0.0,
            signal_unit: String::new(),
            is_valid: false,
            raw: raw.into(),
        }
    }
}

/// Parse one reading line
pub fn parse_eml(line: &str) -> EmlReading {
    let fields: Vec<&str> = line.split(',').collect();
    if line.is_empty() || fields.len() < MIN_FIELD_COUNT {
        return EmlReading::invalid(line);
    }

    let frequency = parse_frequency(fields[FIELD_FREQUENCY]);

    EmlReading {
        mode: fields[FIELD_MODE].to_string(),
        frequency,
        frequency_display: format_frequency(frequency),
        depth: numeric(fields[FIELD_DEPTH]),
        depth_unit: fields[FIELD_DEPTH_UNIT].to_string(),
        current: numeric(fields[FIELD_CURRENT]),
        current_unit: fields[FIELD_CURRENT_UNIT].to_string(),
        signal: numeric(fields[FIELD_SIGNAL]),
        signal_unit: fields[FIELD_SIGNAL_UNIT].to_string(),
        is_valid: true,
        raw: line.to_string(),
    }
}

fn frequency_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^(\d+)").ok()).as_ref()
}

/// Leading integer digits of a unit-suffixed token (`"200000Hz"` -> 200000)
pub fn parse_frequency(token: &str) -> u64 {
    frequency_pattern()
        .and_then(|re| re.captures(token))
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse().ok())
        .unwrap_or(0)
}

/// Format a frequency for display
///
/// One decimal is shown only when the value is not a whole number of the unit.
pub fn format_frequency(hz: u64) -> String {
    #[allow(clippy::cast_precision_loss)]
    let scaled = |unit: u64, suffix: &str| {
        let value = hz as f64 / unit as f64;
        if hz % unit == 0 {
            format!("{value:.0} {suffix}")
        } else {
            format!("{value:.1} {suffix}")
        }
    };

    if hz >= 1_000_000 {
        scaled(1_000_000, "MHz")
    } else if hz >= 1_000 {
        scaled(1_000, "kHz")
    } else {
        format!("{hz} Hz")
    }
}

fn numeric(field: &str) -> f64 {
    field.trim().parse::<f64>().ok().filter(|v| v.is_finite()).unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    const READING: &str = "F03,0073,ACTIVE,200000Hz,140,---,L,P,cm,152,mA,34,dB,-60";

    #[test]
    fn test_parse_reading() {
        let reading = parse_eml(READING);

        assert!(reading.is_valid);
        assert_eq!(reading.mode, "ACTIVE");
        assert_eq!(reading.frequency, 200_000);
        assert_eq!(reading.frequency_display, "200 kHz");
        assert_eq!(reading.depth, 152.0);
        assert_eq!(reading.depth_unit, "cm");
        assert_eq!(reading.current, 34.0);
        assert_eq!(reading.current_unit, "mA");
        assert_eq!(reading.signal, -60.0);
        assert_eq!(reading.signal_unit, "dB");
        assert_eq!(reading.raw, READING);
    }

    #[test]
    fn test_trailing_fields_ignored() {
        let line = format!("{READING},X,Y,Z");
        let reading = parse_eml(&line);
        assert!(reading.is_valid);
        assert_eq!(reading.signal, -60.0);
    }

    #[test]
    fn test_short_line_is_invalid() {
        let reading = parse_eml("F03,0073,ACTIVE,200000Hz");

        assert!(!reading.is_valid);
        assert_eq!(reading.frequency, 0);
        assert_eq!(reading.frequency_display, "-");
        assert_eq!(reading.depth, 0.0);
        assert_eq!(reading.mode, "");
    }

    #[test]
    fn test_empty_line_is_invalid() {
        assert!(!parse_eml("").is_valid);
    }

    #[test]
    fn test_unparsable_numerics_default_to_zero() {
        let reading = parse_eml("F03,0073,PASSIVE,---,140,---,L,P,cm,---,mA,,dB,x");

        assert!(reading.is_valid);
        assert_eq!(reading.frequency, 0);
        assert_eq!(reading.frequency_display, "0 Hz");
        assert_eq!(reading.depth, 0.0);
        assert_eq!(reading.current, 0.0);
        assert_eq!(reading.signal, 0.0);
    }

    #[test]
    fn test_parse_frequency() {
        assert_eq!(parse_frequency("200000Hz"), 200_000);
        assert_eq!(parse_frequency("33kHz"), 33);
        assert_eq!(parse_frequency("Hz"), 0);
        assert_eq!(parse_frequency(""), 0);
    }

    #[test]
    fn test_format_frequency() {
        assert_eq!(format_frequency(200_000), "200 kHz");
        assert_eq!(format_frequency(1_500_000), "1.5 MHz");
        assert_eq!(format_frequency(999), "999 Hz");
        assert_eq!(format_frequency(8_000_000), "8 MHz");
        assert_eq!(format_frequency(32_768), "32.8 kHz");
        assert_eq!(format_frequency(1_000), "1 kHz");
    }
}
