//! Voltage profile generation
//!
//! A profile is the ordered list of set points one channel is swept through.
//! It is derived once per run from the [`RunConfiguration`] and shared by all
//! channels.
//!
//! Without a fine scan the profile is `min, min + step, ...` up to and
//! including `max`. With a fine scan it is three uniform segments:
//!
//! ```text
//! [min, fine_start) @ step  ++  [fine_start, fine_end) @ fine_step  ++  [fine_end, max] @ step
//! ```
//!
//! Points are computed as `start + i * step` rather than by accumulation, so
//! long fine segments do not drift.

use crate::config::RunConfiguration;
use crate::error::{IvError, Result};

/// Fraction of a step tolerated when deciding whether an end point is reached
const STEP_TOLERANCE: f64 = 1e-9;

/// Largest profile a run accepts
///
/// At the default settling time this is already several hours per channel.
pub const MAX_PROFILE_POINTS: usize = 100_000;

/// Ordered voltage set points for one channel's sweep
#[derive(Debug, Clone, PartialEq, Default)]
pub struct VoltageProfile {
    points: Vec<f64>,
}

impl VoltageProfile {
    /// Generate the profile for a run configuration
    pub fn generate(config: &RunConfiguration) -> Result<Self> {
        config.validate_voltages()?;

        let estimate = if config.fine_scan_enabled {
            segment_points(config.min_voltage, config.fine_start, config.voltage_step)
                + segment_points(config.fine_start, config.fine_end, config.fine_step)
                + segment_points(config.fine_end, config.max_voltage, config.voltage_step)
        } else {
            segment_points(config.min_voltage, config.max_voltage, config.voltage_step)
        };
        if estimate > MAX_PROFILE_POINTS as f64 {
            return Err(IvError::InvalidRange(format!(
                "profile would have about {:.0} points, limit is {}",
                estimate, MAX_PROFILE_POINTS
            )));
        }

        let mut points = Vec::new();
        if config.fine_scan_enabled {
            push_half_open(&mut points, config.min_voltage, config.fine_start, config.voltage_step);
            push_half_open(&mut points, config.fine_start, config.fine_end, config.fine_step);
            push_closed(&mut points, config.fine_end, config.max_voltage, config.voltage_step);
        } else {
            push_closed(&mut points, config.min_voltage, config.max_voltage, config.voltage_step);
        }

        Ok(Self { points })
    }

    /// Build a profile from explicit points
    pub fn from_points(points: Vec<f64>) -> Self {
        Self { points }
    }

    /// Set points in sweep order
    pub fn points(&self) -> &[f64] {
        &self.points
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = f64> + '_ {
        self.points.iter().copied()
    }

    /// Highest set point, if any
    pub fn peak(&self) -> Option<f64> {
        self.points.iter().copied().reduce(f64::max)
    }
}

/// Upper bound on the points a segment from `start` to `end` yields
fn segment_points(start: f64, end: f64, step: f64) -> f64 {
    ((end - start) / step).ceil().max(0.0) + 1.0
}

/// `start, start + step, ...` while strictly below `end`
fn push_half_open(points: &mut Vec<f64>, start: f64, end: f64, step: f64) {
    let mut i = 0u32;
    loop {
        let v = start + f64::from(i) * step;
        if v >= end - step * STEP_TOLERANCE {
            break;
        }
        points.push(v);
        i += 1;
    }
}

/// `start, start + step, ...` up to and including `end`
///
/// The last point may overshoot `end` by rounding noise only; it is clamped.
fn push_closed(points: &mut Vec<f64>, start: f64, end: f64, step: f64) {
    let mut i = 0u32;
    loop {
        let v = start + f64::from(i) * step;
        if v > end + step * STEP_TOLERANCE {
            break;
        }
        points.push(v.min(end));
        i += 1;
    }
}
