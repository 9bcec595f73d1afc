//! Sensor readings and their wire representation.
//!
//! A [`Reading`] is what a sensor produces. A [`WireMessage`] is the JSON
//! projection of a reading that travels from the sensor node to the
//! collector: one JSON object per line, answered by `ACK`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Upper bound on a single framed message, newline included.
pub const MAX_MESSAGE_BYTES: usize = 64 * 1024;

/// Frame terminator for requests and responses.
pub const FRAME_DELIMITER: u8 = b'\n';

/// Acknowledgement token sent by the collector after a successful decode.
pub const ACK: &str = "ACK";

/// Errors raised while encoding or decoding wire messages.
#[derive(Debug, Error)]
pub enum ReadingError {
    #[error("message is not valid UTF-8: {0}")]
    Utf8(#[from] std::str::Utf8Error),

    #[error("invalid message JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("reading value {0} cannot be represented in JSON")]
    NonFiniteValue(f64),

    #[error("message of {len} bytes exceeds limit of {limit} bytes")]
    TooLarge { len: usize, limit: usize },

    #[error("message is empty")]
    Empty,
}

/// A single timestamped sensor measurement.
///
/// Fields are private so a reading cannot change after construction.
#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    sensor_id: String,
    name: String,
    value: f64,
    unit: String,
    timestamp: DateTime<Utc>,
}

impl Reading {
    /// Create a reading stamped with the current time.
    pub fn new(
        sensor_id: impl Into<String>,
        name: impl Into<String>,
        value: f64,
        unit: impl Into<String>,
    ) -> Self {
        Self::with_timestamp(sensor_id, name, value, unit, Utc::now())
    }

    /// Create a reading with an explicit timestamp.
    pub fn with_timestamp(
        sensor_id: impl Into<String>,
        name: impl Into<String>,
        value: f64,
        unit: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            sensor_id: sensor_id.into(),
            name: name.into(),
            value,
            unit: unit.into(),
            timestamp,
        }
    }

    pub fn sensor_id(&self) -> &str {
        &self.sensor_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn value(&self) -> f64 {
        self.value
    }

    pub fn unit(&self) -> &str {
        &self.unit
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// Project this reading onto the wire format, tagging it with a fresh
    /// message id for log correlation.
    pub fn to_wire(&self) -> WireMessage {
        WireMessage {
            sensor_id: self.sensor_id.clone(),
            name: self.name.clone(),
            value: self.value,
            unit: self.unit.clone(),
            timestamp: Some(self.timestamp),
            message_id: Some(Uuid::new_v4()),
        }
    }
}

/// JSON message exchanged between the sensor node and the collector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireMessage {
    /// Sensor identifier; integer ids are accepted and normalised to text
    #[serde(deserialize_with = "sensor_id_from_text_or_number")]
    pub sensor_id: String,

    /// Human readable sensor name
    pub name: String,

    /// Measured value
    pub value: f64,

    /// Unit of the measured value
    pub unit: String,

    /// Client-side sampling time, if the producer sent one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,

    /// Client-generated id used to correlate log lines on both ends
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<Uuid>,
}

impl WireMessage {
    /// Serialize to a newline-terminated JSON frame.
    pub fn encode(&self) -> Result<Vec<u8>, ReadingError> {
        if !self.value.is_finite() {
            return Err(ReadingError::NonFiniteValue(self.value));
        }

        let mut frame = serde_json::to_vec(self)?;
        frame.push(FRAME_DELIMITER);

        if frame.len() > MAX_MESSAGE_BYTES {
            return Err(ReadingError::TooLarge {
                len: frame.len(),
                limit: MAX_MESSAGE_BYTES,
            });
        }

        Ok(frame)
    }

    /// Decode one frame. Trailing whitespace, including the delimiter, is
    /// ignored.
    pub fn decode(raw: &[u8]) -> Result<Self, ReadingError> {
        if raw.len() > MAX_MESSAGE_BYTES {
            return Err(ReadingError::TooLarge {
                len: raw.len(),
                limit: MAX_MESSAGE_BYTES,
            });
        }

        let text = std::str::from_utf8(raw)?.trim_end();
        if text.is_empty() {
            return Err(ReadingError::Empty);
        }

        Ok(serde_json::from_str(text)?)
    }

    /// Turn the message back into a reading stamped with `timestamp`.
    pub fn into_reading(self, timestamp: DateTime<Utc>) -> Reading {
        Reading::with_timestamp(self.sensor_id, self.name, self.value, self.unit, timestamp)
    }
}

fn sensor_id_from_text_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawSensorId {
        Text(String),
        Signed(i64),
        Unsigned(u64),
    }

    Ok(match RawSensorId::deserialize(deserializer)? {
        RawSensorId::Text(id) => id,
        RawSensorId::Signed(id) => id.to_string(),
        RawSensorId::Unsigned(id) => id.to_string(),
    })
}
