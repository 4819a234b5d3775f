//! Value types exchanged between the step sensor and the counter.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Add, Sub};
use std::time::Duration;

/// A step counter reading: a monotonic timestamp (nanoseconds) and a step count.
///
/// Depending on where it comes from, a sample is either absolute (raw hardware
/// value since boot) or relative (delta from an anchor). Samples combine as
/// two-component vectors; arithmetic wraps on overflow.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StepSample {
    pub timestamp: i64,
    pub steps: i32,
}

impl StepSample {
    pub const ZERO: StepSample = StepSample {
        timestamp: 0,
        steps: 0,
    };

    pub fn new(timestamp: i64, steps: i32) -> Self {
        Self { timestamp, steps }
    }

    /// Activation events reported by the hardware right after registration
    /// carry a zero timestamp or a zero count and hold no information.
    pub fn is_spurious(&self) -> bool {
        self.timestamp == 0 || self.steps == 0
    }

    /// True when neither component lies behind `other`.
    pub fn is_at_or_after(&self, other: &StepSample) -> bool {
        self.timestamp >= other.timestamp && self.steps >= other.steps
    }
}

impl Sub for StepSample {
    type Output = StepSample;

    fn sub(self, rhs: StepSample) -> StepSample {
        StepSample::new(
            self.timestamp.wrapping_sub(rhs.timestamp),
            self.steps.wrapping_sub(rhs.steps),
        )
    }
}

impl Add for StepSample {
    type Output = StepSample;

    fn add(self, rhs: StepSample) -> StepSample {
        StepSample::new(
            self.timestamp.wrapping_add(rhs.timestamp),
            self.steps.wrapping_add(rhs.steps),
        )
    }
}

impl fmt::Display for StepSample {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} steps @ {}ns", self.steps, self.timestamp)
    }
}

/// Requested sampling period for the step counter.
///
/// The named rates follow the usual platform presets; `Custom` carries an
/// explicit period.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SensorDelay {
    Fastest,
    Game,
    Ui,
    #[default]
    Normal,
    Custom(#[serde(with = "micros")] Duration),
}

impl SensorDelay {
    /// Sampling period this delay stands for.
    pub fn period(&self) -> Duration {
        match self {
            SensorDelay::Fastest => Duration::ZERO,
            SensorDelay::Game => Duration::from_micros(20_000),
            SensorDelay::Ui => Duration::from_micros(66_667),
            SensorDelay::Normal => Duration::from_micros(200_000),
            SensorDelay::Custom(period) => *period,
        }
    }
}

impl fmt::Display for SensorDelay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SensorDelay::Fastest => write!(f, "fastest"),
            SensorDelay::Game => write!(f, "game"),
            SensorDelay::Ui => write!(f, "ui"),
            SensorDelay::Normal => write!(f, "normal"),
            SensorDelay::Custom(period) => write!(f, "{}us", period.as_micros()),
        }
    }
}

mod micros {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_micros() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let micros = u64::deserialize(deserializer)?;
        Ok(Duration::from_micros(micros))
    }
}
