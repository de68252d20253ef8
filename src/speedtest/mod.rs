use crate::errors::SpeedTestError;
use crate::speedtest::connection::{build_http_client, FamilyResolver};
use serde::Serialize;
use std::fmt;
use std::io::{Read, Write};
use std::time::Duration;

pub mod bandwidth;
pub mod connection;
pub mod engine;
pub mod latency;
pub mod network_stats;
pub mod progress;
pub mod protocol;
pub mod stability;

pub use bandwidth::{BandwidthMeter, MeterConfig, Outcome, SpeedTestResult};
pub use latency::{LatencyConfig, LatencyProber};
pub use network_stats::NetworkStats;
pub use progress::{ChannelProgress, ProgressCallback, ProgressEvent, TestPhase};
pub use protocol::{ProtocolPreference, ProtocolResolver};
pub use stability::StabilityCriteria;

pub trait IoReadAndWrite: Read + Write + Send {}

impl<T: Read + Write + Send> IoReadAndWrite for T {}

/// Direction of a bandwidth measurement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Download,
    Upload,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Download => f.write_str("download"),
            Direction::Upload => f.write_str("upload"),
        }
    }
}

/// Everything a single run shares between its phases.
///
/// Built once per invocation and handed to each component, so two runs in
/// the same process never see each other's protocol choice.
#[derive(Clone)]
pub struct RunContext {
    preference: ProtocolPreference,
    resolver: FamilyResolver,
    http: reqwest::Client,
}

impl RunContext {
    pub fn new(
        preference: ProtocolPreference,
        connect_timeout: Duration,
    ) -> Result<Self, SpeedTestError> {
        let resolver = FamilyResolver::new(preference.family());
        let http = build_http_client(&resolver, connect_timeout)?;

        Ok(Self { preference, resolver, http })
    }

    pub fn preference(&self) -> ProtocolPreference {
        self.preference
    }

    pub fn resolver(&self) -> &FamilyResolver {
        &self.resolver
    }

    /// The client every HTTP request of the run goes through.
    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }
}

impl fmt::Debug for RunContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunContext")
            .field("preference", &self.preference)
            .finish_non_exhaustive()
    }
}
