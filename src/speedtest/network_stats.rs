//! Latency, jitter and packet loss accumulated from round-trip probes.

use crate::stats::{mean, mean_absolute_deviation, percentile_sorted};
use serde::Serialize;

/// Percentiles reported by [`NetworkStats::latency_distribution`].
pub const DISTRIBUTION_PERCENTILES: [f64; 5] = [0.05, 0.25, 0.50, 0.75, 0.95];

/// Outcomes of a latency run.
///
/// Only successful probes contribute a latency; every probe counts toward
/// `packet_count`, so `successful_packets <= packet_count` always holds.
#[derive(Debug, Clone, Default, Serialize)]
pub struct NetworkStats {
    latencies: Vec<f64>,
    packet_count: u64,
    successful_packets: u64,
}

impl NetworkStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_measurement(&mut self, success: bool, latency_ms: f64) {
        self.packet_count += 1;

        if success {
            self.latencies.push(latency_ms);
            self.successful_packets += 1;
        }
    }

    pub fn packet_count(&self) -> u64 {
        self.packet_count
    }

    pub fn successful_packets(&self) -> u64 {
        self.successful_packets
    }

    /// Latencies of the successful probes, in recording order.
    pub fn latencies(&self) -> &[f64] {
        &self.latencies
    }

    /// Percentage of probes that failed; 0.0 when nothing was recorded.
    pub fn packet_loss_rate(&self) -> f64 {
        if self.packet_count == 0 {
            return 0.0;
        }

        let lost = self.packet_count - self.successful_packets;
        100.0 * lost as f64 / self.packet_count as f64
    }

    pub fn mean_latency(&self) -> Option<f64> {
        mean(&self.latencies)
    }

    pub fn min_latency(&self) -> Option<f64> {
        self.latencies.iter().copied().reduce(f64::min)
    }

    pub fn max_latency(&self) -> Option<f64> {
        self.latencies.iter().copied().reduce(f64::max)
    }

    /// Mean absolute deviation of latencies from their mean.
    ///
    /// This is dispersion around the central tendency, not RFC 3550
    /// inter-arrival jitter.
    pub fn jitter(&self) -> f64 {
        if self.latencies.len() < 2 {
            return 0.0;
        }

        mean_absolute_deviation(&self.latencies).unwrap_or(0.0)
    }

    /// The 5th, 25th, 50th, 75th and 95th percentile latencies; empty when
    /// no probe succeeded.
    pub fn latency_distribution(&self) -> Vec<f64> {
        let mut sorted = self.latencies.clone();
        sorted.sort_by(|a, b| a.total_cmp(b));

        DISTRIBUTION_PERCENTILES
            .iter()
            .filter_map(|&p| percentile_sorted(&sorted, p))
            .collect()
    }
}
