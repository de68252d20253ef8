//! Rendering of run results.
//!
//! Two forms: a flat machine-readable record for `--json`, and a colored
//! human-readable summary. In the JSON record every number carries one
//! decimal digit and a missing value is `null`, never a placeholder.

use crate::errors::{format_error_for_display, SpeedTestError};
use crate::speedtest::bandwidth::SpeedTestResult;
use crate::speedtest::engine::SpeedTestOutput;
use crate::speedtest::network_stats::{NetworkStats, DISTRIBUTION_PERCENTILES};
use colored::Colorize;
use serde::{Serialize, Serializer};
use std::fmt::Write;

/// The flat machine-readable record of a run.
///
/// # Example
/// ```
/// use fast_speed::results::JsonReport;
///
/// let report = JsonReport { download_mbps: Some(93.46), ..JsonReport::default() };
/// assert_eq!(
///     report.to_json(),
///     r#"{"download_mbps":93.5,"ping_ms":null,"upload_mbps":null,"jitter_ms":null,"packet_loss":null,"error":null}"#
/// );
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct JsonReport {
    /// Download throughput in Mbit/s
    #[serde(serialize_with = "one_decimal")]
    pub download_mbps: Option<f64>,
    /// Mean round-trip latency in milliseconds
    #[serde(serialize_with = "one_decimal")]
    pub ping_ms: Option<f64>,
    /// Upload throughput in Mbit/s
    #[serde(serialize_with = "one_decimal")]
    pub upload_mbps: Option<f64>,
    /// Latency jitter in milliseconds
    #[serde(serialize_with = "one_decimal")]
    pub jitter_ms: Option<f64>,
    /// Failed probes, as a percentage
    #[serde(serialize_with = "one_decimal")]
    pub packet_loss: Option<f64>,
    /// The first failure of the run
    pub error: Option<String>,
}

impl JsonReport {
    pub fn from_output(output: &SpeedTestOutput) -> Self {
        let stats = output.latency.as_ref().ok();

        Self {
            download_mbps: output.download.as_ref().ok().map(|r| r.speed.mbps()),
            ping_ms: stats.and_then(NetworkStats::mean_latency),
            upload_mbps: output
                .upload
                .as_ref()
                .and_then(|upload| upload.as_ref().ok())
                .map(|r| r.speed.mbps()),
            jitter_ms: stats
                .filter(|stats| !stats.latencies().is_empty())
                .map(NetworkStats::jitter),
            packet_loss: stats
                .filter(|stats| stats.packet_count() > 0)
                .map(NetworkStats::packet_loss_rate),
            error: output.first_error().map(error_summary),
        }
    }

    /// A record for a run that produced no measurements at all.
    pub fn from_error(error: &SpeedTestError) -> Self {
        Self { error: Some(error_summary(error)), ..Self::default() }
    }

    pub fn to_json(&self) -> String {
        // Plain structs of options cannot fail to serialize.
        serde_json::to_string(self).unwrap_or_else(|_| String::from("{}"))
    }
}

fn error_summary(error: &SpeedTestError) -> String {
    format!("{}: {}", error.kind.description(), error.message)
}

fn one_decimal<S>(value: &Option<f64>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    match value {
        Some(value) if value.is_finite() => {
            serializer.serialize_f64((value * 10.0).round() / 10.0)
        }
        _ => serializer.serialize_none(),
    }
}

/// Colored multi-line summary of a run.
pub fn render_human(output: &SpeedTestOutput) -> String {
    let mut out = String::new();

    if let Some(targets) = &output.targets {
        let servers = targets.server_locations();
        if !servers.is_empty() {
            let _ = writeln!(out, "{} {}", "Server:".bold().white(), servers.join(" | ").bright_blue());
        }
        if let Some(isp) = &targets.client.isp {
            let ip = targets.client.ip.as_deref().unwrap_or("unknown IP");
            let _ = writeln!(
                out,
                "{} {} {}",
                "Client:".bold().white(),
                isp.bright_blue(),
                format!("({})", ip).bright_blue()
            );
        }
    }

    let _ = writeln!(out, "{} {}", "Protocol:".bold().white(), output.protocol);

    match &output.latency {
        Ok(stats) => render_latency(&mut out, stats),
        Err(e) => {
            let _ = writeln!(out, "{} {}", "Latency:".bold().white(), failure(e));
        }
    }

    render_bandwidth(&mut out, "Download:", &output.download);

    if let Some(upload) = &output.upload {
        render_bandwidth(&mut out, "Upload:", upload);
    }

    out
}

fn render_latency(out: &mut String, stats: &NetworkStats) {
    match (stats.mean_latency(), stats.min_latency(), stats.max_latency()) {
        (Some(mean), Some(min), Some(max)) => {
            let _ = writeln!(
                out,
                "{} {} (min {:.1}, max {:.1})",
                "Latency:".bold().white(),
                format!("{:.1} ms", mean).bright_cyan(),
                min,
                max
            );
            let _ = writeln!(out, "{} {:.1} ms", "Jitter:".bold().white(), stats.jitter());
        }
        _ => {
            let _ = writeln!(out, "{} {}", "Latency:".bold().white(), "no successful probes".red());
        }
    }

    let loss = stats.packet_loss_rate();
    let loss_text = format!("{:.1}% of {} probes", loss, stats.packet_count());
    let _ = writeln!(
        out,
        "{} {}",
        "Loss:".bold().white(),
        if loss > 0.0 { loss_text.yellow() } else { loss_text.normal() }
    );

    let distribution = stats.latency_distribution();
    if !distribution.is_empty() {
        let parts: Vec<String> = DISTRIBUTION_PERCENTILES
            .iter()
            .zip(&distribution)
            .map(|(p, value)| format!("p{} {:.1}", (p * 100.0).round() as u32, value))
            .collect();
        let _ = writeln!(out, "{} {} ms", "Distribution:".bold().white(), parts.join(" | "));
    }
}

fn render_bandwidth(
    out: &mut String,
    label: &str,
    result: &Result<SpeedTestResult, SpeedTestError>,
) {
    match result {
        Ok(result) => {
            let status = if result.converged() {
                format!("stable after {:.1}s", result.elapsed.as_secs_f64())
            } else {
                format!("not stable, stopped at {:.0}s", result.elapsed.as_secs_f64())
            };
            let _ = writeln!(
                out,
                "{} {} ({})",
                label.bold().white(),
                format!("{:.1} Mbps", result.speed.mbps()).bright_cyan(),
                status
            );
        }
        Err(e) => {
            let _ = writeln!(out, "{} {}", label.bold().white(), failure(e));
        }
    }
}

fn failure(error: &SpeedTestError) -> String {
    format!("failed ({})", error.kind.description()).red().to_string()
}

/// A fatal error, rendered for a terminal.
pub fn render_error(error: &SpeedTestError) -> String {
    format_error_for_display(error).red().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::measurements::SpeedMeasurement;
    use crate::speedtest::bandwidth::Outcome;
    use crate::speedtest::protocol::ProtocolPreference;
    use std::time::Duration;

    fn stats() -> NetworkStats {
        let mut stats = NetworkStats::new();
        for latency in [10.0, 20.0, 30.0, 40.0] {
            stats.add_measurement(true, latency);
        }
        stats.add_measurement(false, 0.0);
        stats
    }

    fn result(mbps: f64, outcome: Outcome) -> SpeedTestResult {
        SpeedTestResult {
            speed: SpeedMeasurement::from_bits_per_second(mbps * 1_000_000.0),
            elapsed: Duration::from_millis(8_300),
            outcome,
            samples: Vec::new(),
            bytes: 0,
        }
    }

    fn output() -> SpeedTestOutput {
        SpeedTestOutput {
            protocol: ProtocolPreference::Auto,
            targets: None,
            latency: Ok(stats()),
            download: Ok(result(93.46, Outcome::Converged)),
            upload: Some(Err(SpeedTestError::upload_failed("all 8 connections failed"))),
        }
    }

    #[test]
    fn test_json_report_from_output() {
        let report = JsonReport::from_output(&output());

        assert_eq!(report.ping_ms, Some(25.0));
        assert_eq!(report.jitter_ms, Some(10.0));
        assert_eq!(report.packet_loss, Some(20.0));
        assert_eq!(report.upload_mbps, None);
        assert!(report.error.as_deref().unwrap().contains("all 8 connections failed"));

        let json = report.to_json();
        assert!(json.contains("\"download_mbps\":93.5"), "{}", json);
        assert!(json.contains("\"ping_ms\":25.0"), "{}", json);
        assert!(json.contains("\"upload_mbps\":null"), "{}", json);
    }

    #[test]
    fn test_json_report_without_successful_probes_is_null() {
        let mut stats = NetworkStats::new();
        stats.add_measurement(false, 0.0);

        let output = SpeedTestOutput { latency: Ok(stats), upload: None, ..output() };
        let report = JsonReport::from_output(&output);

        assert_eq!(report.ping_ms, None);
        assert_eq!(report.jitter_ms, None);
        assert_eq!(report.packet_loss, Some(100.0));
        assert_eq!(report.error, None);
    }

    #[test]
    fn test_json_report_from_error() {
        let error = SpeedTestError::discovery("no API token found in the app script");
        let json = JsonReport::from_error(&error).to_json();

        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        for field in ["download_mbps", "ping_ms", "upload_mbps", "jitter_ms", "packet_loss"] {
            assert!(value[field].is_null(), "{} should be null", field);
        }
        assert!(value["error"].as_str().unwrap().contains("no API token"));
    }

    #[test]
    fn test_non_finite_values_are_null() {
        let report = JsonReport { ping_ms: Some(f64::NAN), ..JsonReport::default() };
        assert!(report.to_json().contains("\"ping_ms\":null"));
    }

    #[test]
    fn test_render_human() {
        let text = render_human(&output());

        assert!(text.contains("25.0 ms"));
        assert!(text.contains("93.5 Mbps"));
        assert!(text.contains("stable after 8.3s"));
        assert!(text.contains("p50"));
        assert!(text.contains("failed (Upload test failed)"));
    }

    #[test]
    fn test_render_human_timed_out() {
        let output = SpeedTestOutput {
            download: Ok(result(50.0, Outcome::TimedOut)),
            upload: None,
            ..output()
        };
        let text = render_human(&output);
        assert!(text.contains("not stable"));
        assert!(!text.contains("Upload:"));
    }
}
