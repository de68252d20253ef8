//! Progress events and the observer interface.
//!
//! The engine, the latency prober and the bandwidth meter report progress
//! through [`ProgressCallback`], invoked synchronously from the measuring
//! task. Implementations must hand the event off quickly; the
//! [`ChannelProgress`] adapter forwards events to a channel without waiting.

use crate::measurements::SpeedMeasurement;
use crate::speedtest::Direction;
use log::warn;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::Duration;
use tokio::sync::mpsc;

/// Test phases during speed test execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestPhase {
    /// Verifying the forced IP protocol
    Protocol,
    /// Discovering test targets
    Discovery,
    /// Running latency probes
    Latency,
    /// Running the download measurement
    Download,
    /// Running the upload measurement
    Upload,
    /// All phases complete
    Complete,
}

/// Progress events emitted during a run.
#[derive(Debug, Clone, PartialEq)]
pub enum ProgressEvent {
    /// A new phase started
    PhaseChange(TestPhase),
    /// A latency probe finished
    LatencyProbe {
        /// Round-trip time, or `None` when the probe failed
        latency_ms: Option<f64>,
        /// Probes done so far (1-indexed)
        current: usize,
        /// Total number of probes
        total: usize,
    },
    /// A bandwidth sampling tick
    Throughput {
        direction: Direction,
        /// Aggregate throughput over the last interval
        speed: SpeedMeasurement,
        /// Time since the measurement started
        elapsed: Duration,
    },
}

/// Callback interface for progress updates.
pub trait ProgressCallback: Send + Sync {
    /// Called when a progress event occurs.
    fn on_progress(&self, event: ProgressEvent);
}

impl<F> ProgressCallback for F
where
    F: Fn(ProgressEvent) + Send + Sync,
{
    fn on_progress(&self, event: ProgressEvent) {
        self(event)
    }
}

/// Deliver `event`, isolating the caller from a panicking callback.
pub(crate) fn notify(callback: Option<&dyn ProgressCallback>, event: ProgressEvent) {
    let Some(callback) = callback else {
        return;
    };

    if catch_unwind(AssertUnwindSafe(|| callback.on_progress(event))).is_err() {
        warn!("Progress callback panicked, continuing the measurement");
    }
}

/// Forwards events into a bounded channel, dropping them when it is full.
#[derive(Debug, Clone)]
pub struct ChannelProgress {
    sender: mpsc::Sender<ProgressEvent>,
}

impl ChannelProgress {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<ProgressEvent>) {
        let (sender, receiver) = mpsc::channel(capacity);
        (Self { sender }, receiver)
    }
}

impl ProgressCallback for ChannelProgress {
    fn on_progress(&self, event: ProgressEvent) {
        let _ = self.sender.try_send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_closure_callback() {
        let calls = AtomicUsize::new(0);
        let callback = |_event: ProgressEvent| {
            calls.fetch_add(1, Ordering::SeqCst);
        };

        notify(
            Some(&callback as &dyn ProgressCallback),
            ProgressEvent::PhaseChange(TestPhase::Latency),
        );
        notify(None, ProgressEvent::PhaseChange(TestPhase::Latency));

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_panicking_callback_is_contained() {
        let callback = |_event: ProgressEvent| {
            panic!("renderer crashed");
        };
        notify(
            Some(&callback as &dyn ProgressCallback),
            ProgressEvent::PhaseChange(TestPhase::Download),
        );
    }

    #[tokio::test]
    async fn test_channel_progress_drops_when_full() {
        let (progress, mut receiver) = ChannelProgress::new(1);

        progress.on_progress(ProgressEvent::PhaseChange(TestPhase::Download));
        progress.on_progress(ProgressEvent::PhaseChange(TestPhase::Upload));

        assert_eq!(
            receiver.recv().await,
            Some(ProgressEvent::PhaseChange(TestPhase::Download))
        );
        assert!(receiver.try_recv().is_err());
    }
}
