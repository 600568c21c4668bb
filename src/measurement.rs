//! Acquisition samples and their display formatting.
//!
//! A [`Sample`] is produced once per completed acquisition iteration and is
//! immutable afterwards. The formatting helpers pick an engineering prefix so
//! picoampere-level readings stay readable next to milliampere ones.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// One reading from the acquisition loop.
///
/// # Fields
/// * `elapsed_s` - Seconds since acquisition start (monotonic clock)
/// * `current_a` - Picoammeter reading in amperes
/// * `voltage_v` - Power supply output in volts, 0.0 when unavailable
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub elapsed_s: f64,
    pub current_a: f64,
    pub voltage_v: f64,
}

impl Sample {
    pub fn new(elapsed_s: f64, current_a: f64, voltage_v: f64) -> Self {
        Self {
            elapsed_s,
            current_a,
            voltage_v,
        }
    }
}

/// Format a current with an engineering unit prefix.
///
/// Three decimals in mA, µA, nA or pA; anything smaller falls back to
/// scientific notation in amperes.
pub fn format_current(current: f64) -> String {
    let magnitude = current.abs();
    if magnitude >= 1e-3 {
        format!("{:.3} mA", current * 1e3)
    } else if magnitude >= 1e-6 {
        format!("{:.3} µA", current * 1e6)
    } else if magnitude >= 1e-9 {
        format!("{:.3} nA", current * 1e9)
    } else if magnitude >= 1e-12 {
        format!("{:.3} pA", current * 1e12)
    } else {
        format!("{:.3e} A", current)
    }
}

/// Format a voltage the way the front panel shows it.
pub fn format_voltage(voltage: f64) -> String {
    format!("{:.1} V", voltage)
}

/// `HH:MM:SS`, whole seconds.
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    format!("{:02}:{:02}:{:02}", secs / 3600, (secs % 3600) / 60, secs % 60)
}

/// Summary of the current readings in a run.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CurrentStatistics {
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    /// Population standard deviation
    pub std_dev: f64,
    pub latest_voltage: f64,
    pub count: usize,
}

impl CurrentStatistics {
    /// Returns `None` for an empty run.
    pub fn from_samples(samples: &[Sample]) -> Option<Self> {
        let last = samples.last()?;
        let count = samples.len();
        let (mut min, mut max, mut sum) = (f64::INFINITY, f64::NEG_INFINITY, 0.0);
        for sample in samples {
            min = min.min(sample.current_a);
            max = max.max(sample.current_a);
            sum += sample.current_a;
        }
        let mean = sum / count as f64;
        let variance = samples
            .iter()
            .map(|s| (s.current_a - mean).powi(2))
            .sum::<f64>()
            / count as f64;

        Some(Self {
            min,
            max,
            mean,
            std_dev: variance.sqrt(),
            latest_voltage: last.voltage_v,
            count,
        })
    }
}
