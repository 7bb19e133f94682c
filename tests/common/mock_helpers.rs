//! Simulated bench construction helpers

use matrix_iv::acquisition::{
    event_channel, EventReceiver, EventSink, RunEvent, DEFAULT_EVENT_CAPACITY,
};
use matrix_iv::instrument::sim::CommandLog;
use matrix_iv::instrument::{
    share_matrix, share_source, SharedMatrix, SharedSource, SimulatedMatrix, SimulatedSource,
};
use matrix_iv::Channel;

/// Simulated source and matrix recording into one shared log
pub struct SimBench {
    pub source: SharedSource,
    pub matrix: SharedMatrix,
    pub log: CommandLog,
}

impl SimBench {
    pub fn new() -> Self {
        Self::from_source(SimulatedSource::new())
    }

    /// Use a preconfigured source (fault injection, initial voltage, ...)
    pub fn from_source(source: SimulatedSource) -> Self {
        let log = CommandLog::new();
        Self {
            source: share_source(source.with_log(log.clone())),
            matrix: share_matrix(SimulatedMatrix::new().with_log(log.clone())),
            log,
        }
    }
}

impl Default for SimBench {
    fn default() -> Self {
        Self::new()
    }
}

/// Event channel large enough for any test run
pub fn create_test_events() -> (EventSink, EventReceiver) {
    event_channel(DEFAULT_EVENT_CAPACITY)
}

/// Channels of every `ChannelStarted` event, in order
pub fn started_channels(events: &[RunEvent]) -> Vec<Channel> {
    events
        .iter()
        .filter_map(|e| match e {
            RunEvent::ChannelStarted(ch) => Some(*ch),
            _ => None,
        })
        .collect()
}

pub fn sample_count(events: &[RunEvent]) -> usize {
    events
        .iter()
        .filter(|e| matches!(e, RunEvent::Sample(_)))
        .count()
}
