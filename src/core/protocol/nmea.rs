//! NMEA 0183 GGA parser
//!
//! Decodes `GGA` (Global Positioning System Fix Data) sentences into
//! [`GgaFix`] records with decimal-degree coordinates and checksum status.
//!
//! ```text
//! $GPGGA,123519,4807.038,N,01131.000,E,1,08,0.9,545.4,M,46.9,M,,*47
//!        utc    lat      N lon       E q sat hdop alt  geoid age station
//! ```

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use thiserror::Error;

const LATITUDE_DEGREE_DIGITS: usize = 2;
const LONGITUDE_DEGREE_DIGITS: usize = 3;
const MINUTES_PER_DEGREE: f64 = 60.0;
const GGA_MIN_FIELDS: usize = 15;
const UTC_TIME_MIN_LEN: usize = 6;

/// GPS fix quality indicator (GGA field 6)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum FixQuality {
    #[default]
    Invalid = 0,
    GpsFix = 1,
    DgpsFix = 2,
    PpsFix = 3,
    Rtk = 4,
    FloatRtk = 5,
    Estimated = 6,
    Manual = 7,
    Simulation = 8,
}

impl From<u8> for FixQuality {
    fn from(v: u8) -> Self {
        match v {
            1 => Self::GpsFix,
            2 => Self::DgpsFix,
            3 => Self::PpsFix,
            4 => Self::Rtk,
            5 => Self::FloatRtk,
            6 => Self::Estimated,
            7 => Self::Manual,
            8 => Self::Simulation,
            _ => Self::Invalid,
        }
    }
}

impl FixQuality {
    /// Short label for status displays
    pub fn label(self) -> &'static str {
        match self {
            Self::Invalid => "Invalid",
            Self::GpsFix => "GPS",
            Self::DgpsFix => "DGPS",
            Self::PpsFix => "PPS",
            Self::Rtk => "RTK FIX",
            Self::FloatRtk => "Float",
            Self::Estimated => "Estimated",
            Self::Manual => "Manual",
            Self::Simulation => "Sim",
        }
    }

    /// Whether this quality denotes an actual position fix
    pub fn has_fix(self) -> bool {
        self != Self::Invalid
    }
}

/// One decoded GGA sentence
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GgaFix {
    /// Talker + formatter, e.g. `GPGGA`, `GNGGA`
    pub message_id: String,
    /// Raw `HHMMSS[.ss]` field
    pub utc_time: String,
    /// UTC time of the fix on the decoding date, whole seconds
    pub timestamp: Option<DateTime<Utc>>,
    /// Decimal degrees, negative south
    pub latitude: Option<f64>,
    /// Decimal degrees, negative west
    pub longitude: Option<f64>,
    pub latitude_direction: Option<char>,
    pub longitude_direction: Option<char>,
    pub fix_quality: FixQuality,
    pub satellites_used: u8,
    pub hdop: Option<f64>,
    /// Altitude above mean sea level
    pub altitude: Option<f64>,
    pub altitude_units: String,
    pub geoid_separation: Option<f64>,
    pub geoid_units: String,
    /// Seconds since the last differential correction
    pub dgps_age: Option<f64>,
    pub dgps_station_id: Option<String>,
    /// Checksum passed, fix quality above zero and both coordinates decoded
    pub is_valid: bool,
    pub checksum_valid: bool,
    /// Trimmed input sentence
    pub raw_sentence: String,
}

/// GGA parse errors
///
/// Every variant means the frame is skipped; none of them end the stream.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NmeaError {
    #[error("sentence does not start with '$'")]
    MissingStartMarker,
    #[error("sentence has no '*' checksum delimiter")]
    MissingChecksum,
    #[error("not a GGA sentence: {0}")]
    UnsupportedSentence(String),
    #[error("GGA sentence has {0} fields, need at least 15")]
    InsufficientFields(usize),
}

/// XOR of all bytes of `data`
pub fn calculate_checksum(data: &str) -> u8 {
    data.bytes().fold(0u8, |acc, b| acc ^ b)
}

/// Check the two hex digits after the first `*` against the XOR of the body.
///
/// Comparison is case-insensitive; a missing or short checksum is invalid.
pub fn verify_checksum(sentence: &str) -> bool {
    let bytes = sentence.as_bytes();
    let Some(star) = sentence.find('*') else {
        return false;
    };
    if bytes.first() != Some(&b'$') {
        return false;
    }

    let provided = &bytes[star + 1..(star + 3).min(bytes.len())];
    let calculated = format!("{:02X}", calculate_checksum(&sentence[1..star]));
    provided.eq_ignore_ascii_case(calculated.as_bytes())
}

/// Parse a GGA sentence, stamping the fix with today's UTC date
pub fn parse_gga(sentence: &str) -> Result<GgaFix, NmeaError> {
    parse_gga_on(sentence, Utc::now().date_naive())
}

/// Parse a GGA sentence, stamping the fix with `date`
pub fn parse_gga_on(sentence: &str, date: NaiveDate) -> Result<GgaFix, NmeaError> {
    let sentence = sentence.trim();

    if !sentence.starts_with('$') {
        return Err(NmeaError::MissingStartMarker);
    }
    let star = sentence.find('*').ok_or(NmeaError::MissingChecksum)?;

    let fields: Vec<&str> = sentence[..star].split(',').collect();
    let message_id = fields[0].trim_start_matches('$');
    if !message_id.ends_with("GGA") {
        return Err(NmeaError::UnsupportedSentence(message_id.to_string()));
    }
    if fields.len() < GGA_MIN_FIELDS {
        return Err(NmeaError::InsufficientFields(fields.len()));
    }

    let checksum_valid = verify_checksum(sentence);

    let latitude_direction = fields[3].chars().next();
    let longitude_direction = fields[5].chars().next();
    let latitude = latitude_direction
        .and_then(|dir| parse_coordinate(fields[2], LATITUDE_DEGREE_DIGITS).map(|v| signed(v, dir, 'S')));
    let longitude = longitude_direction
        .and_then(|dir| parse_coordinate(fields[4], LONGITUDE_DEGREE_DIGITS).map(|v| signed(v, dir, 'W')));

    let fix_quality = fields[6].parse::<u8>().map(FixQuality::from).unwrap_or_default();

    let is_valid =
        checksum_valid && fix_quality.has_fix() && latitude.is_some() && longitude.is_some();

    Ok(GgaFix {
        message_id: message_id.to_string(),
        utc_time: fields[1].to_string(),
        timestamp: parse_utc_time(fields[1], date),
        latitude,
        longitude,
        latitude_direction,
        longitude_direction,
        fix_quality,
        satellites_used: fields[7].parse().unwrap_or(0),
        hdop: optional_f64(fields[8]),
        altitude: optional_f64(fields[9]),
        altitude_units: fields[10].to_string(),
        geoid_separation: optional_f64(fields[11]),
        geoid_units: fields[12].to_string(),
        dgps_age: optional_f64(fields[13]),
        dgps_station_id: Some(fields[14]).filter(|s| !s.is_empty()).map(str::to_string),
        is_valid,
        checksum_valid,
        raw_sentence: sentence.to_string(),
    })
}

/// Parse `DDMM.MMMM` / `DDDMM.MMMM` into unsigned decimal degrees
fn parse_coordinate(value: &str, degree_digits: usize) -> Option<f64> {
    if value.is_empty() {
        return None;
    }
    let degrees: f64 = value.get(..degree_digits)?.parse().ok()?;
    let minutes: f64 = value.get(degree_digits..)?.parse().ok()?;
    Some(degrees + minutes / MINUTES_PER_DEGREE)
}

fn signed(value: f64, direction: char, negative: char) -> f64 {
    if direction == negative {
        -value
    } else {
        value
    }
}

fn optional_f64(field: &str) -> Option<f64> {
    if field.is_empty() {
        None
    } else {
        field.parse().ok()
    }
}

/// `HHMMSS[.ss]` on `date`, fractional seconds dropped
fn parse_utc_time(field: &str, date: NaiveDate) -> Option<DateTime<Utc>> {
    if field.len() < UTC_TIME_MIN_LEN {
        return None;
    }
    let hours: u32 = field.get(0..2)?.parse().ok()?;
    let minutes: u32 = field.get(2..4)?.parse().ok()?;
    let seconds: f64 = field.get(4..)?.parse().ok()?;

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let seconds = seconds.floor() as u32;
    date.and_hms_opt(hours, minutes, seconds).map(|dt| dt.and_utc())
}

/// Render decimal degrees as degrees, minutes and seconds, e.g. `52° 7' 24.4" N`
pub fn format_coordinate_dms(decimal: f64, is_latitude: bool) -> String {
    let absolute = decimal.abs();
    let degrees = absolute.floor();
    let minutes_decimal = (absolute - degrees) * 60.0;
    let minutes = minutes_decimal.floor();
    let seconds = (minutes_decimal - minutes) * 60.0;

    let direction = match (is_latitude, decimal >= 0.0) {
        (true, true) => 'N',
        (true, false) => 'S',
        (false, true) => 'E',
        (false, false) => 'W',
    };

    format!("{degrees}° {minutes}' {seconds:.1}\" {direction}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Timelike;

    const REFERENCE: &str = "$GPGGA,123519,4807.038,N,01131.000,E,1,08,0.9,545.4,M,46.9,M,,*47";

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, 23).unwrap()
    }

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn test_gga_parse() {
        let fix = parse_gga_on(REFERENCE, date()).unwrap();

        assert!(fix.checksum_valid);
        assert!(fix.is_valid);
        assert_eq!(fix.message_id, "GPGGA");
        assert_eq!(fix.fix_quality, FixQuality::GpsFix);
        assert_eq!(fix.satellites_used, 8);
        assert!(approx(fix.latitude.unwrap(), 48.0 + 7.038 / 60.0));
        assert!(approx(fix.longitude.unwrap(), 11.0 + 31.0 / 60.0));
        assert_eq!(fix.hdop, Some(0.9));
        assert_eq!(fix.altitude, Some(545.4));
        assert_eq!(fix.geoid_separation, Some(46.9));
        assert_eq!(fix.dgps_age, None);
        assert_eq!(fix.dgps_station_id, None);

        let ts = fix.timestamp.unwrap();
        assert_eq!(ts.date_naive(), date());
        assert_eq!((ts.hour(), ts.minute(), ts.second()), (12, 35, 19));
    }

    #[test]
    fn test_southern_western_hemisphere() {
        let sentence = "$GNGGA,101530.00,3436.223,S,05822.898,W,4,12,0.7,25.0,M,34.0,M,1.2,0031*60";
        let fix = parse_gga_on(sentence, date()).unwrap();

        assert!(fix.is_valid);
        assert_eq!(fix.fix_quality.label(), "RTK FIX");
        assert!(approx(fix.latitude.unwrap(), -(34.0 + 36.223 / 60.0)));
        assert!(approx(fix.longitude.unwrap(), -(58.0 + 22.898 / 60.0)));
        assert_eq!(fix.dgps_age, Some(1.2));
        assert_eq!(fix.dgps_station_id.as_deref(), Some("0031"));
    }

    #[test]
    fn test_checksum() {
        let checksum =
            calculate_checksum("GPGGA,123519,4807.038,N,01131.000,E,1,08,0.9,545.4,M,46.9,M,,");
        assert_eq!(checksum, 0x47);
        assert!(verify_checksum(REFERENCE));
        assert!(!verify_checksum("$GPGGA,123519*4"));
    }

    #[test]
    fn test_lowercase_checksum_digits_accepted() {
        let sentence = "$GPGGA,123519,,,,,0,00,,,M,,M,,*6b";
        assert!(verify_checksum(sentence));
    }

    #[test]
    fn test_altered_checksum_invalidates_fix() {
        let sentence = REFERENCE.replace("*47", "*48");
        let fix = parse_gga_on(&sentence, date()).unwrap();

        assert!(!fix.checksum_valid);
        assert!(!fix.is_valid);
        assert!(fix.latitude.is_some());
    }

    #[test]
    fn test_fix_quality_zero_is_invalid() {
        let sentence = "$GPGGA,123519,4807.038,N,01131.000,E,0,08,0.9,545.4,M,46.9,M,,*46";
        let fix = parse_gga_on(sentence, date()).unwrap();

        assert!(fix.checksum_valid);
        assert!(fix.latitude.is_some() && fix.longitude.is_some());
        assert!(!fix.is_valid);
    }

    #[test]
    fn test_empty_position() {
        let fix = parse_gga_on("$GPGGA,123519,,,,,0,00,,,M,,M,,*6B", date()).unwrap();

        assert!(fix.checksum_valid);
        assert_eq!(fix.latitude, None);
        assert_eq!(fix.longitude, None);
        assert_eq!(fix.latitude_direction, None);
        assert_eq!(fix.hdop, None);
        assert!(!fix.is_valid);
    }

    #[test]
    fn test_rejections() {
        assert_eq!(
            parse_gga_on("GPGGA,123519*47", date()),
            Err(NmeaError::MissingStartMarker)
        );
        assert_eq!(
            parse_gga_on("$GPGGA,123519,4807.038,N", date()),
            Err(NmeaError::MissingChecksum)
        );
        assert_eq!(
            parse_gga_on(
                "$GPRMC,123519,A,4807.038,N,01131.000,E,022.4,084.4,230394,003.1,W*6A",
                date()
            ),
            Err(NmeaError::UnsupportedSentence("GPRMC".to_string()))
        );
        assert_eq!(
            parse_gga_on("$GPGGA,123519,4807.038,N*00", date()),
            Err(NmeaError::InsufficientFields(4))
        );
    }

    #[test]
    fn test_fix_quality_labels() {
        assert_eq!(FixQuality::from(0).label(), "Invalid");
        assert_eq!(FixQuality::from(2).label(), "DGPS");
        assert_eq!(FixQuality::from(5).label(), "Float");
        assert_eq!(FixQuality::from(8).label(), "Sim");
        assert_eq!(FixQuality::from(42), FixQuality::Invalid);
    }

    #[test]
    fn test_format_dms() {
        assert_eq!(format_coordinate_dms(52.123_433_333, true), "52° 7' 24.4\" N");
        assert_eq!(format_coordinate_dms(-34.603_716_667, true), "34° 36' 13.4\" S");
        assert_eq!(format_coordinate_dms(-0.5, false), "0° 30' 0.0\" W");
    }
}
