//! Convergence detection for bandwidth measurements.
//!
//! Samples taken during ramp-up are kept for diagnostics but never scored.
//! Afterwards the coefficient of variation of the trailing window decides
//! whether the measurement is stable; enough consecutive stable windows end
//! the measurement early.

use crate::errors::SpeedTestError;
use crate::stats::{coefficient_of_variation, mean};
use log::debug;
use serde::Serialize;
use std::collections::VecDeque;
use std::time::Duration;

/// When a bandwidth measurement is considered converged.
#[derive(Debug, Clone, PartialEq)]
pub struct StabilityCriteria {
    /// Initial period excluded from stability evaluation.
    pub ramp_up_duration_seconds: u64,
    /// Hard ceiling on the whole measurement.
    pub max_duration_seconds: u64,
    /// Sampling cadence.
    pub measurement_interval_ms: u64,
    /// Number of trailing samples scored for variability.
    pub sliding_window_size: usize,
    /// Largest coefficient of variation of a stable window.
    pub stability_threshold_cov: f64,
    /// Consecutive stable windows needed to stop early.
    pub stable_checks_required: usize,
}

impl Default for StabilityCriteria {
    fn default() -> Self {
        Self {
            ramp_up_duration_seconds: 4,
            max_duration_seconds: 25,
            measurement_interval_ms: 750,
            sliding_window_size: 6,
            stability_threshold_cov: 0.15,
            stable_checks_required: 2,
        }
    }
}

impl StabilityCriteria {
    pub fn ramp_up(&self) -> Duration {
        Duration::from_secs(self.ramp_up_duration_seconds)
    }

    pub fn max_duration(&self) -> Duration {
        Duration::from_secs(self.max_duration_seconds)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.measurement_interval_ms)
    }

    pub fn with_max_duration_seconds(mut self, seconds: u64) -> Self {
        self.max_duration_seconds = seconds;
        self
    }

    pub fn validate(&self) -> Result<(), SpeedTestError> {
        if self.ramp_up_duration_seconds >= self.max_duration_seconds {
            return Err(SpeedTestError::config(format!(
                "ramp-up ({}s) must be shorter than the maximum duration ({}s)",
                self.ramp_up_duration_seconds, self.max_duration_seconds
            )));
        }

        if self.stable_checks_required == 0
            || self.stable_checks_required > self.sliding_window_size
        {
            return Err(SpeedTestError::config(format!(
                "stable checks ({}) must be between 1 and the window size ({})",
                self.stable_checks_required, self.sliding_window_size
            )));
        }

        if self.measurement_interval_ms == 0 {
            return Err(SpeedTestError::config("measurement interval must be positive"));
        }

        if !(self.stability_threshold_cov > 0.0) {
            return Err(SpeedTestError::config("stability threshold must be positive"));
        }

        Ok(())
    }
}

/// Where a measurement is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MeterState {
    RampUp,
    Measuring,
    Converged,
    TimedOut,
}

impl MeterState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, MeterState::Converged | MeterState::TimedOut)
    }
}

/// One aggregate throughput reading.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ThroughputSample {
    /// Time since the measurement started.
    pub elapsed: Duration,
    pub bits_per_second: f64,
    /// Taken during ramp-up, so never scored.
    pub ramp_up: bool,
}

/// Scores throughput samples against [`StabilityCriteria`].
///
/// Owned and mutated by the measuring coordinator only.
#[derive(Debug)]
pub struct StabilityDetector {
    criteria: StabilityCriteria,
    window: VecDeque<f64>,
    consecutive_stable: usize,
    samples: Vec<ThroughputSample>,
    state: MeterState,
}

impl StabilityDetector {
    pub fn new(criteria: StabilityCriteria) -> Self {
        let window = VecDeque::with_capacity(criteria.sliding_window_size);
        Self {
            criteria,
            window,
            consecutive_stable: 0,
            samples: Vec::new(),
            state: MeterState::RampUp,
        }
    }

    pub fn state(&self) -> MeterState {
        self.state
    }

    pub fn samples(&self) -> &[ThroughputSample] {
        &self.samples
    }

    pub fn into_samples(self) -> Vec<ThroughputSample> {
        self.samples
    }

    /// Record a sample taken `elapsed` after the start.
    ///
    /// Samples that are not strictly later than the previous one, or that
    /// arrive after a terminal state, are discarded.
    pub fn record(&mut self, elapsed: Duration, bits_per_second: f64) -> MeterState {
        if self.state.is_terminal() {
            return self.state;
        }

        if let Some(last) = self.samples.last() {
            if elapsed <= last.elapsed {
                debug!("Discarding out-of-order sample at {:?}", elapsed);
                return self.state;
            }
        }

        let ramp_up = elapsed < self.criteria.ramp_up();
        self.samples.push(ThroughputSample { elapsed, bits_per_second, ramp_up });

        if ramp_up {
            return self.state;
        }

        self.state = MeterState::Measuring;

        self.window.push_back(bits_per_second);
        while self.window.len() > self.criteria.sliding_window_size {
            self.window.pop_front();
        }

        // A partial window cannot be scored.
        if self.window.len() < self.criteria.sliding_window_size {
            return self.state;
        }

        let cov = self.window_cov();
        match cov {
            Some(cov) if cov <= self.criteria.stability_threshold_cov => {
                self.consecutive_stable += 1;
            }
            _ => self.consecutive_stable = 0,
        }

        debug!(
            "Window CoV {:?}, {} of {} stable checks",
            cov, self.consecutive_stable, self.criteria.stable_checks_required
        );

        if self.consecutive_stable >= self.criteria.stable_checks_required {
            self.state = MeterState::Converged;
        }

        self.state
    }

    /// Mark the measurement as having hit its time ceiling.
    pub fn time_out(&mut self) -> MeterState {
        if !self.state.is_terminal() {
            self.state = MeterState::TimedOut;
        }
        self.state
    }

    pub fn window_cov(&self) -> Option<f64> {
        let window: Vec<f64> = self.window.iter().copied().collect();
        coefficient_of_variation(&window)
    }

    /// The best available throughput estimate: the mean of the current
    /// window, else the mean of every sample, else zero.
    pub fn estimate(&self) -> f64 {
        let window: Vec<f64> = self.window.iter().copied().collect();
        if let Some(window_mean) = mean(&window) {
            return window_mean;
        }

        let all: Vec<f64> = self.samples.iter().map(|s| s.bits_per_second).collect();
        mean(&all).unwrap_or(0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn criteria() -> StabilityCriteria {
        StabilityCriteria {
            ramp_up_duration_seconds: 2,
            max_duration_seconds: 20,
            measurement_interval_ms: 500,
            sliding_window_size: 4,
            stability_threshold_cov: 0.1,
            stable_checks_required: 2,
        }
    }

    fn at(tick: u64) -> Duration {
        Duration::from_millis(500 * tick)
    }

    #[test]
    fn test_default_criteria_are_valid() {
        assert!(StabilityCriteria::default().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_criteria() {
        let mut bad = criteria();
        bad.ramp_up_duration_seconds = 20;
        assert!(bad.validate().is_err());

        let mut bad = criteria();
        bad.stable_checks_required = 0;
        assert!(bad.validate().is_err());

        let mut bad = criteria();
        bad.stable_checks_required = 5;
        assert!(bad.validate().is_err());

        let mut bad = criteria();
        bad.stability_threshold_cov = f64::NAN;
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_ramp_up_samples_are_not_scored() {
        let mut detector = StabilityDetector::new(criteria());

        // Ticks 1..=3 fall inside the 2s ramp-up.
        for tick in 1..=3 {
            assert_eq!(detector.record(at(tick), 100.0), MeterState::RampUp);
        }
        assert_eq!(detector.samples().len(), 3);
        assert!(detector.samples().iter().all(|s| s.ramp_up));
        assert_eq!(detector.window_cov(), None);
    }

    #[test]
    fn test_constant_stream_converges_after_window_and_checks() {
        let mut detector = StabilityDetector::new(criteria());

        for tick in 1..=3 {
            detector.record(at(tick), if tick % 2 == 0 { 10.0 } else { 900.0 });
        }

        // Window of 4 fills at tick 7, the second stable check is tick 8.
        for tick in 4..=7 {
            assert_eq!(detector.record(at(tick), 500.0), MeterState::Measuring);
        }
        assert_eq!(detector.record(at(8), 500.0), MeterState::Converged);
        assert_eq!(detector.state(), MeterState::Converged);
        assert!((detector.estimate() - 500.0).abs() < 1e-9);
    }

    #[test]
    fn test_unstable_window_resets_the_counter() {
        let mut detector = StabilityDetector::new(criteria());

        for tick in 4..=7 {
            detector.record(at(tick), 500.0);
        }
        // One stable check so far; a spike resets it.
        assert_eq!(detector.record(at(8), 5_000.0), MeterState::Measuring);
        for tick in 9..=11 {
            assert_eq!(detector.record(at(tick), 500.0), MeterState::Measuring);
        }
        // The spike leaves the window at tick 12.
        assert_eq!(detector.record(at(12), 500.0), MeterState::Measuring);
        assert_eq!(detector.record(at(13), 500.0), MeterState::Converged);
    }

    #[test]
    fn test_out_of_order_samples_are_discarded() {
        let mut detector = StabilityDetector::new(criteria());

        detector.record(at(5), 500.0);
        detector.record(at(5), 1.0);
        detector.record(at(4), 1.0);

        assert_eq!(detector.samples().len(), 1);
        assert!((detector.estimate() - 500.0).abs() < 1e-9);
    }

    #[test]
    fn test_zero_throughput_is_never_stable() {
        let mut detector = StabilityDetector::new(criteria());

        for tick in 4..=20 {
            assert_eq!(detector.record(at(tick), 0.0), MeterState::Measuring);
        }
    }

    #[test]
    fn test_time_out_keeps_estimate() {
        let mut detector = StabilityDetector::new(criteria());
        detector.record(at(1), 300.0);
        detector.record(at(2), 100.0);
        assert_eq!(detector.state(), MeterState::RampUp);

        assert_eq!(detector.time_out(), MeterState::TimedOut);
        assert_eq!(detector.state(), MeterState::TimedOut);
        // Only ramp-up samples exist, so they are averaged.
        assert!((detector.estimate() - 200.0).abs() < 1e-9);

        // Terminal states are sticky.
        assert_eq!(detector.record(at(3), 1.0), MeterState::TimedOut);
        assert_eq!(detector.samples().len(), 2);
    }

    #[test]
    fn test_estimate_without_samples_is_zero() {
        let detector = StabilityDetector::new(criteria());
        assert_eq!(detector.estimate(), 0.0);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        /// Property: a constant post-ramp stream converges exactly after
        /// `window + checks - 1` scored samples, whatever the ramp-up noise.
        #[test]
        fn constant_stream_converges_on_schedule(
            noise in prop::collection::vec(1.0f64..1e9, 3),
            rate in 1.0f64..1e10,
            window in 1usize..10,
            checks_offset in 0usize..10,
        ) {
            let checks = 1 + checks_offset % window;
            let criteria = StabilityCriteria {
                sliding_window_size: window,
                stable_checks_required: checks,
                ..criteria()
            };
            let mut detector = StabilityDetector::new(criteria);

            for (tick, value) in noise.iter().enumerate() {
                detector.record(at(tick as u64 + 1), *value);
            }

            let needed = window + checks - 1;
            for n in 1..=needed {
                let state = detector.record(at(3 + n as u64), rate);
                if n < needed {
                    prop_assert_eq!(state, MeterState::Measuring);
                } else {
                    prop_assert_eq!(state, MeterState::Converged);
                }
            }

            prop_assert!((detector.estimate() - rate).abs() <= rate * 1e-9);
        }
    }
}
