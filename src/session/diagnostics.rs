//! Pass/fail grading of measured IV curves
//!
//! A healthy SiPM draws almost nothing below breakdown and a current within a
//! known window above it. Each check uses the sample closest to its reference
//! voltage.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use crate::acquisition::ResultSink;
use crate::config::DiagnosticThresholds;
use crate::types::{Channel, ChannelOutcome, Sample};

/// Verdict for one channel
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelDiagnosis {
    Ok,
    NotOk(Vec<String>),
    /// No samples were recorded for the channel
    NoData,
}

impl ChannelDiagnosis {
    pub fn is_ok(&self) -> bool {
        matches!(self, ChannelDiagnosis::Ok)
    }
}

impl fmt::Display for ChannelDiagnosis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelDiagnosis::Ok => write!(f, "OK"),
            ChannelDiagnosis::NotOk(reasons) => write!(f, "NOT OK ({})", reasons.join("; ")),
            ChannelDiagnosis::NoData => write!(f, "no data"),
        }
    }
}

/// Sample whose voltage is closest to `target` (first one on ties)
fn closest(curve: &[Sample], target: f64) -> Option<&Sample> {
    curve
        .iter()
        .min_by(|a, b| (a.voltage - target).abs().total_cmp(&(b.voltage - target).abs()))
}

/// Grade one channel's curve
pub fn diagnose(curve: &[Sample], thresholds: &DiagnosticThresholds) -> ChannelDiagnosis {
    let (Some(before), Some(after)) = (
        closest(curve, thresholds.voltage_before_breakdown),
        closest(curve, thresholds.voltage_after_breakdown),
    ) else {
        return ChannelDiagnosis::NoData;
    };

    let mut reasons = Vec::new();

    let leakage_na = before.mean_current * 1e9;
    if leakage_na >= thresholds.max_current_before_breakdown_na {
        reasons.push(format!(
            "{:.1} nA at {:.1} V, expected below {} nA",
            leakage_na, before.voltage, thresholds.max_current_before_breakdown_na
        ));
    }

    let gain_na = after.mean_current * 1e9;
    if gain_na < thresholds.current_after_breakdown_low_na
        || gain_na > thresholds.current_after_breakdown_high_na
    {
        reasons.push(format!(
            "{:.1} nA at {:.1} V, expected {}-{} nA",
            gain_na,
            after.voltage,
            thresholds.current_after_breakdown_low_na,
            thresholds.current_after_breakdown_high_na
        ));
    }

    if reasons.is_empty() {
        ChannelDiagnosis::Ok
    } else {
        ChannelDiagnosis::NotOk(reasons)
    }
}

#[derive(Debug, Default)]
struct Curves {
    samples: BTreeMap<Channel, Vec<Sample>>,
    outcomes: BTreeMap<Channel, ChannelOutcome>,
}

/// [`ResultSink`] keeping every channel's curve in memory
///
/// Clones share the same storage, so one clone can be handed to the
/// sequencer while another is read once the run ends.
#[derive(Debug, Clone, Default)]
pub struct CurveCollector {
    curves: Arc<Mutex<Curves>>,
}

impl CurveCollector {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_curves<R>(&self, f: impl FnOnce(&mut Curves) -> R) -> R {
        let mut curves = self.curves.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut curves)
    }

    /// Samples collected for a channel
    pub fn curve(&self, channel: Channel) -> Vec<Sample> {
        self.with_curves(|c| c.samples.get(&channel).cloned().unwrap_or_default())
    }

    pub fn outcome(&self, channel: Channel) -> Option<ChannelOutcome> {
        self.with_curves(|c| c.outcomes.get(&channel).copied())
    }

    /// Channels that were started, ascending
    pub fn channels(&self) -> Vec<Channel> {
        self.with_curves(|c| c.samples.keys().copied().collect())
    }

    /// Grade every started channel
    pub fn diagnose_all(&self, thresholds: &DiagnosticThresholds) -> Vec<(Channel, ChannelDiagnosis)> {
        self.with_curves(|c| {
            c.samples
                .iter()
                .map(|(channel, curve)| (*channel, diagnose(curve, thresholds)))
                .collect()
        })
    }
}

impl ResultSink for CurveCollector {
    fn on_channel_started(&mut self, channel: Channel) {
        self.with_curves(|c| {
            c.samples.insert(channel, Vec::new());
            c.outcomes.remove(&channel);
        });
    }

    fn on_sample(&mut self, sample: &Sample) {
        self.with_curves(|c| c.samples.entry(sample.channel).or_default().push(*sample));
    }

    fn on_channel_finished(&mut self, channel: Channel, outcome: ChannelOutcome) {
        self.with_curves(|c| {
            c.outcomes.insert(channel, outcome);
        });
    }

    fn on_run_finished(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(voltage: f64, nanoamps: f64) -> Sample {
        Sample {
            channel: Channel::new(0).unwrap(),
            voltage,
            mean_current: nanoamps * 1e-9,
            current_spread: 0.0,
        }
    }

    #[test]
    fn test_healthy_curve_is_ok() {
        let curve = vec![sample(29.0, 1.0), sample(30.0, 2.0), sample(38.0, 3000.0)];
        assert_eq!(
            diagnose(&curve, &DiagnosticThresholds::default()),
            ChannelDiagnosis::Ok
        );
    }

    #[test]
    fn test_high_leakage_is_not_ok() {
        let curve = vec![sample(30.0, 40.0), sample(38.0, 3000.0)];
        let diagnosis = diagnose(&curve, &DiagnosticThresholds::default());
        assert!(matches!(diagnosis, ChannelDiagnosis::NotOk(ref r) if r.len() == 1));
    }

    #[test]
    fn test_gain_outside_window_is_not_ok() {
        let thresholds = DiagnosticThresholds::default();
        let low = vec![sample(30.0, 1.0), sample(38.0, 500.0)];
        let high = vec![sample(30.0, 1.0), sample(38.0, 20_000.0)];
        assert!(!diagnose(&low, &thresholds).is_ok());
        assert!(!diagnose(&high, &thresholds).is_ok());
    }

    #[test]
    fn test_uses_closest_sample() {
        // Sweep stopped early: 35 V is the closest point to 38 V
        let curve = vec![sample(30.1, 1.0), sample(35.0, 2000.0)];
        assert!(diagnose(&curve, &DiagnosticThresholds::default()).is_ok());
    }

    #[test]
    fn test_empty_curve_has_no_data() {
        assert_eq!(
            diagnose(&[], &DiagnosticThresholds::default()),
            ChannelDiagnosis::NoData
        );
    }

    #[test]
    fn test_collector_groups_by_channel() {
        let mut collector = CurveCollector::new();
        let reader = collector.clone();
        let a = Channel::new(4).unwrap();
        let b = Channel::new(1).unwrap();

        collector.on_channel_started(a);
        collector.on_sample(&Sample::from_readings(a, 30.0, &[1e-9]));
        collector.on_channel_finished(a, ChannelOutcome::Completed);
        collector.on_channel_started(b);
        collector.on_channel_finished(b, ChannelOutcome::Cancelled);

        assert_eq!(reader.channels(), vec![b, a]);
        assert_eq!(reader.curve(a).len(), 1);
        assert_eq!(reader.outcome(b), Some(ChannelOutcome::Cancelled));

        let diagnoses = reader.diagnose_all(&DiagnosticThresholds::default());
        assert_eq!(diagnoses[0], (b, ChannelDiagnosis::NoData));
    }
}
