//! Throughput value types.

use serde::Serialize;
use std::fmt;
use std::time::Duration;

/// Display scale for a throughput value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum SpeedUnit {
    #[serde(rename = "bps")]
    BitsPerSecond,
    #[serde(rename = "Kbps")]
    Kbps,
    #[serde(rename = "Mbps")]
    Mbps,
    #[serde(rename = "Gbps")]
    Gbps,
}

impl SpeedUnit {
    /// Number of bits per second represented by one of this unit.
    pub const fn bits_per_unit(&self) -> f64 {
        match self {
            SpeedUnit::BitsPerSecond => 1.0,
            SpeedUnit::Kbps => 1_000.0,
            SpeedUnit::Mbps => 1_000_000.0,
            SpeedUnit::Gbps => 1_000_000_000.0,
        }
    }

    pub const fn label(&self) -> &'static str {
        match self {
            SpeedUnit::BitsPerSecond => "bps",
            SpeedUnit::Kbps => "Kbps",
            SpeedUnit::Mbps => "Mbps",
            SpeedUnit::Gbps => "Gbps",
        }
    }

    pub fn from_bits_per_second(&self, bits_per_second: f64) -> f64 {
        bits_per_second / self.bits_per_unit()
    }

    pub fn to_bits_per_second(&self, value: f64) -> f64 {
        value * self.bits_per_unit()
    }
}

impl fmt::Display for SpeedUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// A throughput reading, normalised to a readable unit.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SpeedMeasurement {
    pub value: f64,
    pub unit: SpeedUnit,
}

impl SpeedMeasurement {
    pub const fn new(value: f64, unit: SpeedUnit) -> Self {
        Self { value, unit }
    }

    /// Pick the largest unit in which the value is at least 1.
    pub fn from_bits_per_second(bits_per_second: f64) -> Self {
        let bits_per_second = bits_per_second.max(0.0);

        let unit = [SpeedUnit::Gbps, SpeedUnit::Mbps, SpeedUnit::Kbps]
            .into_iter()
            .find(|unit| bits_per_second >= unit.bits_per_unit())
            .unwrap_or(SpeedUnit::BitsPerSecond);

        Self { value: unit.from_bits_per_second(bits_per_second), unit }
    }

    /// Throughput of `bytes` moved in `elapsed`.
    pub fn from_transfer(bytes: u64, elapsed: Duration) -> Self {
        Self::from_bits_per_second(bits_per_second(bytes, elapsed))
    }

    pub fn bits_per_second(&self) -> f64 {
        self.unit.to_bits_per_second(self.value)
    }

    pub fn mbps(&self) -> f64 {
        SpeedUnit::Mbps.from_bits_per_second(self.bits_per_second())
    }

    /// Re-express this measurement in another unit.
    pub fn to_unit(&self, unit: SpeedUnit) -> Self {
        Self { value: unit.from_bits_per_second(self.bits_per_second()), unit }
    }
}

impl fmt::Display for SpeedMeasurement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.1} {}", self.value, self.unit)
    }
}

/// Bits per second for `bytes` moved in `elapsed`; 0.0 for a zero duration.
pub fn bits_per_second(bytes: u64, elapsed: Duration) -> f64 {
    let seconds = elapsed.as_secs_f64();

    if seconds <= 0.0 {
        return 0.0;
    }

    bytes as f64 * 8.0 / seconds
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unit_selection() {
        assert_eq!(
            SpeedMeasurement::from_bits_per_second(512.0).unit,
            SpeedUnit::BitsPerSecond
        );
        assert_eq!(
            SpeedMeasurement::from_bits_per_second(12_000.0).unit,
            SpeedUnit::Kbps
        );
        assert_eq!(
            SpeedMeasurement::from_bits_per_second(95_400_000.0).unit,
            SpeedUnit::Mbps
        );
        assert_eq!(
            SpeedMeasurement::from_bits_per_second(1_200_000_000.0).unit,
            SpeedUnit::Gbps
        );
    }

    #[test]
    fn test_negative_input_clamps_to_zero() {
        let speed = SpeedMeasurement::from_bits_per_second(-5.0);
        assert_eq!(speed.value, 0.0);
        assert_eq!(speed.unit, SpeedUnit::BitsPerSecond);
    }

    #[test]
    fn test_mbps_conversion() {
        let speed = SpeedMeasurement::new(1.5, SpeedUnit::Gbps);
        assert!((speed.mbps() - 1500.0).abs() < 1e-9);
        assert!((speed.bits_per_second() - 1.5e9).abs() < 1e-3);
        assert_eq!(speed.to_unit(SpeedUnit::Kbps).value, 1_500_000.0);
    }

    #[test]
    fn test_from_transfer() {
        // 12.5 MB in one second is 100 Mbps.
        let speed =
            SpeedMeasurement::from_transfer(12_500_000, Duration::from_secs(1));
        assert_eq!(speed.unit, SpeedUnit::Mbps);
        assert!((speed.value - 100.0).abs() < 1e-9);
    }

    #[test]
    fn test_zero_duration() {
        assert_eq!(bits_per_second(1_000, Duration::ZERO), 0.0);
    }

    #[test]
    fn test_display() {
        let speed = SpeedMeasurement::new(93.456, SpeedUnit::Mbps);
        assert_eq!(speed.to_string(), "93.5 Mbps");
    }
}
