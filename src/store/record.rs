//! Persisted form of a reading: one comma-delimited row per record.

use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use serde::Serialize;
use thiserror::Error;

use crate::reading::Reading;

/// Header row written at the top of every log file.
pub const HEADER: &str = "timestamp,sensor_id,value,unit";

const FIELD_COUNT: usize = 4;

/// Formats accepted for timestamps without an offset; treated as UTC.
const NAIVE_TIMESTAMP_FORMATS: &[&str] = &["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"];

/// Row-level parse failures. Replay skips rows that fail with these.
#[derive(Debug, Error, PartialEq)]
pub enum RowError {
    #[error("expected 4 fields, found {0}")]
    FieldCount(usize),

    #[error("unterminated quoted field")]
    UnterminatedQuote,

    #[error("invalid timestamp '{0}'")]
    Timestamp(String),

    #[error("invalid value '{0}'")]
    Value(String),
}

/// One stored reading.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogRecord {
    pub timestamp: DateTime<Utc>,
    pub sensor_id: String,
    pub value: f64,
    pub unit: String,
}

impl LogRecord {
    pub fn new(
        sensor_id: impl Into<String>,
        timestamp: DateTime<Utc>,
        value: f64,
        unit: impl Into<String>,
    ) -> Self {
        Self {
            timestamp,
            sensor_id: sensor_id.into(),
            value,
            unit: unit.into(),
        }
    }

    /// Render as a row without the trailing line break. Line breaks inside
    /// fields become spaces so every record occupies exactly one line.
    pub fn to_row(&self) -> String {
        format!(
            "{},{},{},{}",
            self.timestamp.to_rfc3339_opts(SecondsFormat::AutoSi, true),
            escape_field(&self.sensor_id),
            self.value,
            escape_field(&self.unit),
        )
    }

    /// Parse one data row. A trailing `\r` is tolerated.
    pub fn parse_row(line: &str) -> Result<Self, RowError> {
        let fields = split_fields(line.trim_end_matches(['\r', '\n']))?;
        if fields.len() != FIELD_COUNT {
            return Err(RowError::FieldCount(fields.len()));
        }

        let mut fields = fields.into_iter();
        let (Some(timestamp), Some(sensor_id), Some(value), Some(unit)) =
            (fields.next(), fields.next(), fields.next(), fields.next())
        else {
            return Err(RowError::FieldCount(0));
        };

        let timestamp = parse_timestamp(&timestamp).ok_or(RowError::Timestamp(timestamp))?;
        let value = value
            .trim()
            .parse::<f64>()
            .map_err(|_| RowError::Value(value.clone()))?;

        Ok(Self {
            timestamp,
            sensor_id,
            value,
            unit,
        })
    }
}

impl From<Reading> for LogRecord {
    fn from(reading: Reading) -> Self {
        LogRecord::from(&reading)
    }
}

impl From<&Reading> for LogRecord {
    fn from(reading: &Reading) -> Self {
        LogRecord::new(
            reading.sensor_id(),
            reading.timestamp(),
            reading.value(),
            reading.unit(),
        )
    }
}

/// RFC 3339 first, then offset-less ISO-8601 interpreted as UTC.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(timestamp) = DateTime::parse_from_rfc3339(raw) {
        return Some(timestamp.with_timezone(&Utc));
    }
    NAIVE_TIMESTAMP_FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(raw, format).ok())
        .map(|naive| naive.and_utc())
}

fn escape_field(field: &str) -> String {
    let field = field.replace(['\r', '\n'], " ");
    if field.contains([',', '"']) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field
    }
}

fn split_fields(line: &str) -> Result<Vec<String>, RowError> {
    let mut fields = Vec::with_capacity(FIELD_COUNT);
    let mut field = String::new();
    let mut chars = line.chars().peekable();
    let mut quoted = false;
    let mut at_field_start = true;

    while let Some(c) = chars.next() {
        if quoted {
            if c == '"' {
                if chars.peek() == Some(&'"') {
                    chars.next();
                    field.push('"');
                } else {
                    quoted = false;
                }
            } else {
                field.push(c);
            }
        } else {
            match c {
                ',' => {
                    fields.push(std::mem::take(&mut field));
                    at_field_start = true;
                    continue;
                }
                '"' if at_field_start => quoted = true,
                _ => field.push(c),
            }
        }
        at_field_start = false;
    }

    if quoted {
        return Err(RowError::UnterminatedQuote);
    }
    fields.push(field);
    Ok(fields)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(second: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 10, 12, 0, second).unwrap()
    }

    #[test]
    fn test_row_layout() {
        let record = LogRecord::new("1", ts(5), 21.5, "°C");
        assert_eq!(record.to_row(), "2024-03-10T12:00:05Z,1,21.5,°C");
    }

    #[test]
    fn test_row_round_trip_keeps_sub_second_precision() {
        let timestamp = Utc.timestamp_opt(1_710_072_000, 123_456_789).unwrap();
        let record = LogRecord::new("sensor-7", timestamp, 1013.25, "hPa");

        assert_eq!(LogRecord::parse_row(&record.to_row()).unwrap(), record);
    }

    #[test]
    fn test_fields_with_delimiters_are_quoted() {
        let record = LogRecord::new("room,north", ts(1), -3.0, "say \"hi\"\nnow");
        let row = record.to_row();

        assert_eq!(row.lines().count(), 1);
        let parsed = LogRecord::parse_row(&row).unwrap();
        assert_eq!(parsed.sensor_id, "room,north");
        assert_eq!(parsed.unit, "say \"hi\" now");
    }

    #[test]
    fn test_parse_accepts_naive_iso_and_crlf() {
        let parsed = LogRecord::parse_row("2024-03-10T12:00:07.250000,2,45.1,%\r").unwrap();
        assert_eq!(parsed.timestamp, ts(7) + chrono::Duration::milliseconds(250));
        assert_eq!(parsed.sensor_id, "2");
        assert_eq!(parsed.unit, "%");
    }

    #[test]
    fn test_parse_rejects_malformed_rows() {
        assert_eq!(
            LogRecord::parse_row("2024-03-10T12:00:00Z,1,2"),
            Err(RowError::FieldCount(3))
        );
        assert_eq!(
            LogRecord::parse_row("yesterday,1,2.0,C"),
            Err(RowError::Timestamp("yesterday".to_string()))
        );
        assert_eq!(
            LogRecord::parse_row("2024-03-10T12:00:00Z,1,warm,C"),
            Err(RowError::Value("warm".to_string()))
        );
        assert_eq!(
            LogRecord::parse_row("2024-03-10T12:00:00Z,\"1,2.0,C"),
            Err(RowError::UnterminatedQuote)
        );
        assert!(LogRecord::parse_row(HEADER).is_err());
    }

    #[test]
    fn test_record_from_reading() {
        let reading = Reading::with_timestamp("4", "Light Window", 5300.0, "lx", ts(9));
        let record = LogRecord::from(&reading);

        assert_eq!(record, LogRecord::new("4", ts(9), 5300.0, "lx"));
    }
}
