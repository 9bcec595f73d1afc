//! Simulated environmental sensors.
//!
//! Each [`SensorKind`] has a pure value function of a random source, the
//! configured range and the local hour of day. A [`Sensor`] pairs a kind
//! with its identity and range and turns samples into [`Reading`]s.

use std::collections::VecDeque;

use chrono::{DateTime, Local, Timelike, Utc};
use rand::Rng;
use thiserror::Error;

use crate::reading::Reading;

/// Values kept per sensor for [`Sensor::history`]; older ones are dropped.
pub const HISTORY_CAPACITY: usize = 1_024;

/// Sensor kinds known to the simulator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensorKind {
    Temperature,
    Humidity,
    Pressure,
    Light,
}

impl SensorKind {
    /// Get all sensor kinds.
    pub fn all() -> &'static [SensorKind] {
        &[
            SensorKind::Temperature,
            SensorKind::Humidity,
            SensorKind::Pressure,
            SensorKind::Light,
        ]
    }

    /// Get the sensor kind name as a string.
    pub fn name(&self) -> &'static str {
        match self {
            SensorKind::Temperature => "temperature",
            SensorKind::Humidity => "humidity",
            SensorKind::Pressure => "pressure",
            SensorKind::Light => "light",
        }
    }

    /// Get the unit readings of this kind are reported in.
    pub fn unit(&self) -> &'static str {
        match self {
            SensorKind::Temperature => "°C",
            SensorKind::Humidity => "%",
            SensorKind::Pressure => "hPa",
            SensorKind::Light => "lx",
        }
    }

    /// Default `(min, max)` range for this kind.
    pub fn default_range(&self) -> (f64, f64) {
        match self {
            SensorKind::Temperature => (-20.0, 50.0),
            SensorKind::Humidity => (0.0, 100.0),
            SensorKind::Pressure => (950.0, 1050.0),
            SensorKind::Light => (0.0, 10_000.0),
        }
    }

    /// Produce one value in `[min, max]` for the given hour of day (0-23).
    pub fn sample(&self, rng: &mut impl Rng, min: f64, max: f64, hour: u32) -> f64 {
        let value = match self {
            // Daily sine around the midpoint of the range
            SensorKind::Temperature => {
                let base = (max + min) / 2.0;
                let amplitude = (max - min) / 2.0;
                let phase = (2.0 * std::f64::consts::PI / 24.0) * f64::from(hour);
                base + amplitude * phase.sin() + rng.gen_range(-1.0..=1.0)
            }
            SensorKind::Humidity => rng.gen_range(min..=max) + rng.gen_range(-5.0..=5.0),
            SensorKind::Pressure => (min + max) / 2.0 + standard_normal(rng),
            // Brightness ramps up until noon and back down until 18:00
            SensorKind::Light => {
                let base = if (6..=18).contains(&hour) {
                    let brightness = if hour <= 12 {
                        f64::from(hour - 6) / 6.0
                    } else {
                        f64::from(18 - hour) / 6.0
                    };
                    brightness * max
                } else {
                    min
                };
                base + rng.gen_range(-100.0..=100.0)
            }
        };

        round_to_hundredths(value.clamp(min, max))
    }
}

impl std::fmt::Display for SensorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Errors raised by sensors.
#[derive(Debug, Error, PartialEq)]
pub enum SensorError {
    #[error("sensor {0} is stopped")]
    Stopped(String),
}

/// A simulated sensor with identity, range and on/off state.
#[derive(Debug, Clone)]
pub struct Sensor {
    id: String,
    name: String,
    kind: SensorKind,
    unit: String,
    min: f64,
    max: f64,
    active: bool,
    last_value: Option<f64>,
    history: VecDeque<f64>,
}

impl Sensor {
    /// Create an active sensor with the kind's default unit and range.
    pub fn new(id: impl Into<String>, name: impl Into<String>, kind: SensorKind) -> Self {
        let (min, max) = kind.default_range();
        Self {
            id: id.into(),
            name: name.into(),
            kind,
            unit: kind.unit().to_string(),
            min,
            max,
            active: true,
            last_value: None,
            history: VecDeque::new(),
        }
    }

    /// Override the value range. Bounds given in the wrong order are swapped.
    pub fn with_range(mut self, min: f64, max: f64) -> Self {
        self.min = min.min(max);
        self.max = min.max(max);
        self
    }

    /// Override the reported unit.
    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = unit.into();
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> SensorKind {
        self.kind
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn start(&mut self) {
        self.active = true;
    }

    pub fn stop(&mut self) {
        self.active = false;
    }

    /// Most recent value, including any calibration applied to it.
    pub fn last_value(&self) -> Option<f64> {
        self.last_value
    }

    /// Up to `limit` most recent sampled values, oldest first.
    pub fn history(&self, limit: usize) -> Vec<f64> {
        let skip = self.history.len().saturating_sub(limit);
        self.history.iter().skip(skip).copied().collect()
    }

    /// Scale the last value by `factor`, sampling first if nothing was read
    /// yet. History keeps the raw samples.
    pub fn calibrate(&mut self, rng: &mut impl Rng, factor: f64) -> Result<f64, SensorError> {
        let value = match self.last_value {
            Some(value) => value,
            None => self.read(rng)?.value(),
        };
        let calibrated = value * factor;
        self.last_value = Some(calibrated);
        Ok(calibrated)
    }

    /// Take a reading now.
    pub fn read(&mut self, rng: &mut impl Rng) -> Result<Reading, SensorError> {
        self.read_at(rng, Local::now())
    }

    /// Take a reading as if sampled at `at`.
    pub fn read_at(
        &mut self,
        rng: &mut impl Rng,
        at: DateTime<Local>,
    ) -> Result<Reading, SensorError> {
        if !self.active {
            return Err(SensorError::Stopped(self.name.clone()));
        }

        let value = self.kind.sample(rng, self.min, self.max, at.hour());
        self.last_value = Some(value);
        if self.history.len() == HISTORY_CAPACITY {
            self.history.pop_front();
        }
        self.history.push_back(value);
        Ok(Reading::with_timestamp(
            self.id.clone(),
            self.name.clone(),
            value,
            self.unit.clone(),
            at.with_timezone(&Utc),
        ))
    }
}

/// The four sensors a default sensor node simulates.
pub fn default_sensors() -> Vec<Sensor> {
    vec![
        Sensor::new("1", "Temp Room", SensorKind::Temperature),
        Sensor::new("2", "Humidity Room", SensorKind::Humidity),
        Sensor::new("3", "Pressure Outside", SensorKind::Pressure),
        Sensor::new("4", "Light Window", SensorKind::Light),
    ]
}

/// Box-Muller transform over two uniform samples.
fn standard_normal(rng: &mut impl Rng) -> f64 {
    let u1: f64 = rng.gen_range(f64::EPSILON..1.0);
    let u2: f64 = rng.gen();
    (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos()
}

fn round_to_hundredths(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
