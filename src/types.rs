//! Core data types for the IV bench
//!
//! # Main Types
//!
//! - [`Channel`] - One of the 16 SiPM positions on the matrix board
//! - [`Sample`] - Averaged current at one voltage step
//! - [`ChannelOutcome`] - How a channel's sweep ended
//! - [`RunState`] - Lifecycle of the acquisition sequencer
//! - [`RunSummary`] - What a finished (or aborted) run measured

use crate::error::{IvError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Number of SiPM channels on a matrix board
pub const CHANNEL_COUNT: usize = 16;

/// A SiPM channel, identified by its 0-based index (0..16)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct Channel(u8);

impl Channel {
    /// Create a channel from a 0-based index
    pub fn new(index: usize) -> Result<Self> {
        if index < CHANNEL_COUNT {
            Ok(Self(index as u8))
        } else {
            Err(IvError::Config(format!(
                "Channel index {} out of range (0..{})",
                index, CHANNEL_COUNT
            )))
        }
    }

    /// Create a channel from the 1-based number printed on the board
    pub fn from_number(number: usize) -> Result<Self> {
        match number.checked_sub(1) {
            Some(index) => Self::new(index),
            None => Err(IvError::Config("Channel numbers start at 1".to_string())),
        }
    }

    /// 0-based index
    pub fn index(self) -> usize {
        self.0 as usize
    }

    /// 1-based number, as used in logs and output files
    pub fn number(self) -> usize {
        self.0 as usize + 1
    }

    /// All channels in ascending order
    pub fn all() -> impl Iterator<Item = Channel> {
        (0..CHANNEL_COUNT as u8).map(Channel)
    }
}

impl TryFrom<u8> for Channel {
    type Error = IvError;

    fn try_from(value: u8) -> Result<Self> {
        Self::new(value as usize)
    }
}

impl From<Channel> for u8 {
    fn from(channel: Channel) -> u8 {
        channel.0
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SiPM {}", self.number())
    }
}

/// One averaged measurement at a single voltage step
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// Channel being measured
    pub channel: Channel,
    /// Commanded source voltage (V)
    pub voltage: f64,
    /// Arithmetic mean of the current readings (A)
    pub mean_current: f64,
    /// Population standard deviation of the current readings (A)
    pub current_spread: f64,
}

impl Sample {
    /// Build a sample from the raw current readings taken at one step
    pub fn from_readings(channel: Channel, voltage: f64, readings: &[f64]) -> Self {
        let (mean_current, current_spread) = mean_and_spread(readings);
        Self {
            channel,
            voltage,
            mean_current,
            current_spread,
        }
    }
}

/// Mean and population standard deviation; `(0, 0)` for no readings
pub fn mean_and_spread(readings: &[f64]) -> (f64, f64) {
    if readings.is_empty() {
        return (0.0, 0.0);
    }
    let n = readings.len() as f64;
    let mean = readings.iter().sum::<f64>() / n;
    let variance = readings.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / n;
    (mean, variance.sqrt())
}

/// How a channel's sweep ended
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum ChannelOutcome {
    /// Every voltage in the profile was measured
    Completed,
    /// The source tripped compliance and the channel was skipped
    ComplianceStop {
        /// Voltage at which compliance was detected
        voltage: f64,
    },
    /// A stop or emergency stop interrupted the sweep
    Cancelled,
}

impl ChannelOutcome {
    /// Whether the sweep ended before the end of the profile
    pub fn is_early_stop(&self) -> bool {
        !matches!(self, ChannelOutcome::Completed)
    }
}

impl fmt::Display for ChannelOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelOutcome::Completed => write!(f, "completed"),
            ChannelOutcome::ComplianceStop { voltage } => {
                write!(f, "compliance at {:.1} V", voltage)
            }
            ChannelOutcome::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Lifecycle of the acquisition sequencer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RunState {
    /// No run in progress
    #[default]
    Idle,
    /// A run owns the instruments
    Running,
    /// Cancellation requested, worker not yet finished
    Stopping,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunState::Idle => write!(f, "Idle"),
            RunState::Running => write!(f, "Running"),
            RunState::Stopping => write!(f, "Stopping"),
        }
    }
}

/// Why a run ended without reaching the last channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AbortReason {
    /// Cooperative stop requested by the operator
    Stopped,
    /// Emergency stop: hardware was forcibly safed
    EmergencyStop,
    /// An instrument call failed
    InstrumentFault(String),
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AbortReason::Stopped => write!(f, "stopped by operator"),
            AbortReason::EmergencyStop => write!(f, "emergency stop"),
            AbortReason::InstrumentFault(msg) => write!(f, "instrument fault: {}", msg),
        }
    }
}

/// Result of one channel's sweep
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelResult {
    /// Channel that was measured
    pub channel: Channel,
    /// How the sweep ended
    pub outcome: ChannelOutcome,
    /// Number of samples handed to the sink
    pub samples: usize,
}

/// Summary of a run, produced by the worker when it exits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    /// When the worker started driving the hardware
    pub started_at: DateTime<Utc>,
    /// When the worker finished
    pub finished_at: DateTime<Utc>,
    /// Per-channel results in measurement order
    pub channels: Vec<ChannelResult>,
    /// Why the run ended early, if it did
    pub aborted: Option<AbortReason>,
}

impl RunSummary {
    /// Create an empty summary starting now
    pub fn begin() -> Self {
        let now = Utc::now();
        Self {
            started_at: now,
            finished_at: now,
            channels: Vec::new(),
            aborted: None,
        }
    }

    /// Whether every active channel was reached and the run ended naturally
    pub fn is_complete(&self) -> bool {
        self.aborted.is_none()
    }

    /// Total number of samples emitted
    pub fn total_samples(&self) -> usize {
        self.channels.iter().map(|c| c.samples).sum()
    }

    /// Channels in the order they were measured
    pub fn measured_channels(&self) -> Vec<Channel> {
        self.channels.iter().map(|c| c.channel).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_bounds() {
        assert!(Channel::new(0).is_ok());
        assert!(Channel::new(15).is_ok());
        assert!(Channel::new(16).is_err());
        assert!(Channel::from_number(0).is_err());
        assert_eq!(Channel::from_number(16).unwrap().index(), 15);
    }

    #[test]
    fn test_channel_display_is_one_based() {
        let ch = Channel::new(2).unwrap();
        assert_eq!(ch.number(), 3);
        assert_eq!(ch.to_string(), "SiPM 3");
    }

    #[test]
    fn test_channel_serde_rejects_out_of_range() {
        let ok: Channel = serde_json::from_str("5").unwrap();
        assert_eq!(ok.index(), 5);
        assert!(serde_json::from_str::<Channel>("16").is_err());
    }

    #[test]
    fn test_mean_and_spread() {
        let (mean, spread) = mean_and_spread(&[1.0, 2.0, 3.0, 4.0]);
        assert!((mean - 2.5).abs() < 1e-12);
        // population std of 1..4
        assert!((spread - 1.118_033_988_749_895).abs() < 1e-12);

        assert_eq!(mean_and_spread(&[]), (0.0, 0.0));
        assert_eq!(mean_and_spread(&[7.0; 6]), (7.0, 0.0));
    }

    #[test]
    fn test_outcome_early_stop() {
        assert!(!ChannelOutcome::Completed.is_early_stop());
        assert!(ChannelOutcome::Cancelled.is_early_stop());
        assert!(ChannelOutcome::ComplianceStop { voltage: 34.0 }.is_early_stop());
    }
}
