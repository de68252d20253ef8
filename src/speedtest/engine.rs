use crate::errors::SpeedTestError;
use crate::fast::{Discovery, Targets, DEFAULT_URL_COUNT};
use crate::retry::RetryConfig;
use crate::speedtest::bandwidth::{BandwidthMeter, MeterConfig, SpeedTestResult};
use crate::speedtest::latency::{LatencyConfig, LatencyProber};
use crate::speedtest::network_stats::NetworkStats;
use crate::speedtest::progress::{notify, ProgressCallback, ProgressEvent, TestPhase};
use crate::speedtest::protocol::{ProtocolPreference, ProtocolResolver, DEFAULT_PROBE_DOMAIN};
use crate::speedtest::stability::StabilityCriteria;
use crate::speedtest::RunContext;
use log::{debug, info, warn};
use std::time::Duration;
use url::Url;

/// Default time budget for establishing a connection.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Configuration for the test engine.
///
/// Holds every knob of a run: the protocol to enforce, where targets come
/// from, and the settings of each measuring component.
#[derive(Debug, Clone)]
pub struct RunConfig {
    /// IP protocol every connection must use.
    /// Default: Auto
    pub protocol: ProtocolPreference,

    /// Dual-stack domain used to verify a forced protocol.
    pub probe_domain: String,

    /// Time budget of each TCP connect.
    /// Default: 10s
    pub connect_timeout: Duration,

    /// Fixed targets. When empty, targets are discovered.
    pub urls: Vec<Url>,

    /// Number of targets to ask discovery for.
    /// Default: 5
    pub url_count: usize,

    /// Backoff for discovery requests.
    pub discovery_retry: RetryConfig,

    pub latency: LatencyConfig,

    /// Shared by the download and upload measurements.
    pub criteria: StabilityCriteria,

    pub meter: MeterConfig,

    /// Whether to measure upload after download.
    /// Default: false
    pub run_upload: bool,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            protocol: ProtocolPreference::Auto,
            probe_domain: DEFAULT_PROBE_DOMAIN.to_string(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            urls: Vec::new(),
            url_count: DEFAULT_URL_COUNT,
            discovery_retry: RetryConfig::default(),
            latency: LatencyConfig::default(),
            criteria: StabilityCriteria::default(),
            meter: MeterConfig::default(),
            run_upload: false,
        }
    }
}

/// Complete results from a run.
///
/// Phases fail independently, so a failed upload still leaves the latency
/// and download results intact.
#[derive(Debug)]
pub struct SpeedTestOutput {
    pub protocol: ProtocolPreference,
    /// What discovery found, if it ran.
    pub targets: Option<Targets>,
    pub latency: Result<NetworkStats, SpeedTestError>,
    pub download: Result<SpeedTestResult, SpeedTestError>,
    /// `None` when upload was not requested.
    pub upload: Option<Result<SpeedTestResult, SpeedTestError>>,
}

impl SpeedTestOutput {
    /// The first phase failure, if any.
    pub fn first_error(&self) -> Option<&SpeedTestError> {
        self.latency
            .as_ref()
            .err()
            .or(self.download.as_ref().err())
            .or(self.upload.as_ref().and_then(|upload| upload.as_ref().err()))
    }

    /// Whether every phase that ran succeeded.
    pub fn is_complete(&self) -> bool {
        self.first_error().is_none()
    }
}

/// The test engine that orchestrates all network measurements.
///
/// # Example
/// ```no_run
/// use fast_speed::speedtest::engine::{RunConfig, TestEngine};
///
/// #[tokio::main]
/// async fn main() {
///     let engine = TestEngine::new(RunConfig::default());
///     let output = engine.run().await.unwrap();
///     if let Ok(download) = &output.download {
///         println!("Download: {}", download.speed);
///     }
/// }
/// ```
pub struct TestEngine {
    config: RunConfig,
}

impl TestEngine {
    pub fn new(config: RunConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    pub async fn run(&self) -> Result<SpeedTestOutput, SpeedTestError> {
        self.execute(None).await
    }

    pub async fn run_with_progress(
        &self,
        progress: &dyn ProgressCallback,
    ) -> Result<SpeedTestOutput, SpeedTestError> {
        self.execute(Some(progress)).await
    }

    /// Run the complete sequence.
    ///
    /// Executes in the following order:
    /// 1. Forced protocol verification (fatal on failure)
    /// 2. Target discovery, unless targets were given (fatal on failure)
    /// 3. Latency probes
    /// 4. Download measurement
    /// 5. Upload measurement, if requested
    async fn execute(
        &self,
        progress: Option<&dyn ProgressCallback>,
    ) -> Result<SpeedTestOutput, SpeedTestError> {
        let config = &self.config;
        config.criteria.validate()?;

        info!("Starting speed test sequence ({})", config.protocol);

        // Step 1: a forced protocol must work before anything is measured
        notify(progress, ProgressEvent::PhaseChange(TestPhase::Protocol));
        ProtocolResolver::new(config.probe_domain.clone())
            .check(config.protocol)
            .await?;

        let context = RunContext::new(config.protocol, config.connect_timeout)?;

        // Step 2: targets
        let (urls, targets) = if config.urls.is_empty() {
            notify(progress, ProgressEvent::PhaseChange(TestPhase::Discovery));
            let targets =
                Discovery::new(&context, config.discovery_retry.clone(), config.url_count)
                    .discover()
                    .await?;
            (targets.urls.clone(), Some(targets))
        } else {
            debug!("Using {} fixed targets", config.urls.len());
            (config.urls.clone(), None)
        };

        // Step 3: latency
        notify(progress, ProgressEvent::PhaseChange(TestPhase::Latency));
        let prober = LatencyProber::new(&context, config.latency.clone());
        let latency = match progress {
            Some(progress) => prober.measure_latency_stats_with_progress(&urls, progress).await,
            None => prober.measure_latency_stats(&urls).await,
        };
        match &latency {
            Ok(stats) => info!(
                "Latency: {:?} ms, jitter {:.2} ms, loss {:.1}%",
                stats.mean_latency(),
                stats.jitter(),
                stats.packet_loss_rate()
            ),
            Err(e) => warn!("Latency phase failed: {}", e),
        }

        // Step 4: download
        notify(progress, ProgressEvent::PhaseChange(TestPhase::Download));
        let meter = BandwidthMeter::new(&context, config.meter.clone());
        let download = match progress {
            Some(progress) => {
                meter
                    .measure_download_speed_with_progress(&urls, &config.criteria, progress)
                    .await
            }
            None => meter.measure_download_speed(&urls, &config.criteria).await,
        };
        if let Err(e) = &download {
            warn!("Download phase failed: {}", e);
        }

        // Step 5: upload
        let upload = if config.run_upload {
            notify(progress, ProgressEvent::PhaseChange(TestPhase::Upload));
            let upload = match progress {
                Some(progress) => {
                    meter
                        .measure_upload_speed_with_progress(&urls, &config.criteria, progress)
                        .await
                }
                None => meter.measure_upload_speed(&urls, &config.criteria).await,
            };
            if let Err(e) = &upload {
                warn!("Upload phase failed: {}", e);
            }
            Some(upload)
        } else {
            None
        };

        notify(progress, ProgressEvent::PhaseChange(TestPhase::Complete));
        info!("Speed test sequence complete");

        Ok(SpeedTestOutput { protocol: config.protocol, targets, latency, download, upload })
    }
}
