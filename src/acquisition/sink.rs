//! Result sinks: where a run's events go
//!
//! The sequencer pushes events into a [`ResultSink`] from its worker thread,
//! in order:
//!
//! ```text
//! channel_started(c0) sample* channel_finished(c0) ... run_finished | run_aborted
//! ```
//!
//! Sinks must not fail back into the core. A sink that cannot write a file or
//! update a plot logs the problem and carries on; the measurement in progress
//! is never interrupted because of a consumer.
//!
//! # Implementations
//!
//! - [`EventSink`] / [`EventReceiver`] - channel a UI drains at its own pace;
//!   only samples are dropped when it falls behind
//! - [`FanoutSink`] - forwards every event to several sinks
//! - [`crate::session::RunRecorder`] - tab-separated results log
//! - [`crate::session::CurveCollector`] - per-channel curves for diagnostics

use crate::types::{AbortReason, Channel, ChannelOutcome, Sample};
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Default number of samples the event channel holds before dropping
///
/// A full sweep of 16 channels with a fine scan is well under this.
pub const DEFAULT_EVENT_CAPACITY: usize = 10_000;

/// Consumer of acquisition events
pub trait ResultSink: Send {
    /// A channel's relay was closed and its sweep is about to start
    fn on_channel_started(&mut self, channel: Channel);

    /// One averaged measurement
    fn on_sample(&mut self, sample: &Sample);

    /// A channel's sweep ended
    fn on_channel_finished(&mut self, channel: Channel, outcome: ChannelOutcome);

    /// Every active channel was measured
    fn on_run_finished(&mut self);

    /// The run ended early (stop, emergency stop or instrument fault)
    fn on_run_aborted(&mut self, _reason: &AbortReason) {}
}

/// Event emitted by a run
#[derive(Debug, Clone, PartialEq)]
pub enum RunEvent {
    ChannelStarted(Channel),
    Sample(Sample),
    ChannelFinished {
        channel: Channel,
        outcome: ChannelOutcome,
    },
    RunFinished,
    RunAborted(AbortReason),
}

impl RunEvent {
    /// Whether this event ends the run
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunEvent::RunFinished | RunEvent::RunAborted(_))
    }
}

/// Create an event channel holding at most `sample_capacity` unread samples
///
/// Lifecycle events (channel started/finished, run finished/aborted) are
/// never dropped and keep their place relative to the samples.
pub fn event_channel(sample_capacity: usize) -> (EventSink, EventReceiver) {
    let (tx, rx) = unbounded();
    let backlog = Arc::new(Backlog::default());
    (
        EventSink {
            sender: tx,
            sample_capacity,
            backlog: backlog.clone(),
        },
        EventReceiver {
            receiver: rx,
            backlog,
        },
    )
}

#[derive(Debug, Default)]
struct Backlog {
    queued_samples: AtomicUsize,
    dropped: AtomicU64,
}

/// Worker side of the event channel
///
/// Never blocks: if the consumer falls behind, samples are dropped and
/// counted.
#[derive(Debug, Clone)]
pub struct EventSink {
    sender: Sender<RunEvent>,
    sample_capacity: usize,
    backlog: Arc<Backlog>,
}

impl EventSink {
    fn send_sample(&self, sample: Sample) {
        let queued = self.backlog.queued_samples.fetch_add(1, Ordering::SeqCst);
        if queued >= self.sample_capacity || self.sender.send(RunEvent::Sample(sample)).is_err() {
            self.backlog.queued_samples.fetch_sub(1, Ordering::SeqCst);
            self.backlog.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn send(&self, event: RunEvent) {
        // Only fails once the receiver is gone
        let _ = self.sender.send(event);
    }
}

impl ResultSink for EventSink {
    fn on_channel_started(&mut self, channel: Channel) {
        self.send(RunEvent::ChannelStarted(channel));
    }

    fn on_sample(&mut self, sample: &Sample) {
        self.send_sample(*sample);
    }

    fn on_channel_finished(&mut self, channel: Channel, outcome: ChannelOutcome) {
        self.send(RunEvent::ChannelFinished { channel, outcome });
    }

    fn on_run_finished(&mut self) {
        self.send(RunEvent::RunFinished);
    }

    fn on_run_aborted(&mut self, reason: &AbortReason) {
        self.send(RunEvent::RunAborted(reason.clone()));
    }
}

/// Consumer side of the event channel
#[derive(Debug)]
pub struct EventReceiver {
    receiver: Receiver<RunEvent>,
    backlog: Arc<Backlog>,
}

impl EventReceiver {
    fn taken(&self, event: RunEvent) -> RunEvent {
        if matches!(event, RunEvent::Sample(_)) {
            self.backlog.queued_samples.fetch_sub(1, Ordering::SeqCst);
        }
        event
    }

    /// Try to receive an event without blocking
    pub fn try_recv(&self) -> Option<RunEvent> {
        self.receiver.try_recv().ok().map(|e| self.taken(e))
    }

    /// Wait up to `timeout` for an event
    ///
    /// Returns `None` on timeout or once the worker side is gone and the
    /// channel is empty.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<RunEvent> {
        match self.receiver.recv_timeout(timeout) {
            Ok(event) => Some(self.taken(event)),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    /// Receive all pending events
    pub fn drain(&self) -> Vec<RunEvent> {
        let mut events = Vec::new();
        while let Some(event) = self.try_recv() {
            events.push(event);
        }
        events
    }

    /// Number of samples dropped because the consumer fell behind
    pub fn dropped_events(&self) -> u64 {
        self.backlog.dropped.load(Ordering::Relaxed)
    }
}

/// Forwards every event to each inner sink, in order
#[derive(Default)]
pub struct FanoutSink {
    sinks: Vec<Box<dyn ResultSink>>,
}

impl FanoutSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a sink
    pub fn with(mut self, sink: impl ResultSink + 'static) -> Self {
        self.sinks.push(Box::new(sink));
        self
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl ResultSink for FanoutSink {
    fn on_channel_started(&mut self, channel: Channel) {
        for sink in &mut self.sinks {
            sink.on_channel_started(channel);
        }
    }

    fn on_sample(&mut self, sample: &Sample) {
        for sink in &mut self.sinks {
            sink.on_sample(sample);
        }
    }

    fn on_channel_finished(&mut self, channel: Channel, outcome: ChannelOutcome) {
        for sink in &mut self.sinks {
            sink.on_channel_finished(channel, outcome);
        }
    }

    fn on_run_finished(&mut self) {
        for sink in &mut self.sinks {
            sink.on_run_finished();
        }
    }

    fn on_run_aborted(&mut self, reason: &AbortReason) {
        for sink in &mut self.sinks {
            sink.on_run_aborted(reason);
        }
    }
}
