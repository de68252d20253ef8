//! Adaptive bandwidth measurement.
//!
//! A coordinator samples the aggregate byte count of several concurrent
//! transfers on a fixed cadence and feeds the samples to a
//! [`StabilityDetector`]. The measurement stops as soon as the detector
//! converges, or at the time ceiling, whichever comes first.
//!
//! Transfers are pluggable through [`TransferSource`]; the HTTP sources
//! drain response bodies (download) or stream generated request bodies
//! (upload) and count every byte they move into a private counter.

use crate::errors::{classify_error, protocol_error_kind, ErrorKind, SpeedTestError};
use crate::measurements::{bits_per_second, SpeedMeasurement};
use crate::retry::RetryConfig;
use crate::speedtest::progress::{notify, ProgressCallback, ProgressEvent};
use crate::speedtest::stability::{
    MeterState, StabilityCriteria, StabilityDetector, ThroughputSample,
};
use crate::speedtest::connection::{check_literal_host, AddressFamily};
use crate::speedtest::{Direction, RunContext};
use bytes::Bytes;
use futures::future::BoxFuture;
use futures::StreamExt;
use log::{debug, info, warn};
use rand::Rng;
use reqwest::Body;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::{interval_at, sleep, sleep_until, timeout, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use url::Url;

/// Default number of concurrent transfers.
pub const DEFAULT_CONNECTIONS: usize = 8;

/// Size of each chunk of a generated upload body.
pub const DEFAULT_UPLOAD_CHUNK_BYTES: usize = 64 * 1024;

/// Size of a single upload request body.
pub const DEFAULT_UPLOAD_REQUEST_BYTES: u64 = 25_000_000;

/// How long transfers get to wind down before they are aborted.
pub const SHUTDOWN_GRACE: Duration = Duration::from_millis(500);

/// Configuration for the bandwidth meter.
#[derive(Debug, Clone)]
pub struct MeterConfig {
    /// Concurrent transfers, spread round-robin over the URLs.
    /// Default: 8
    pub connections: usize,

    /// Chunk size of generated upload bodies.
    /// Default: 64 KiB
    pub upload_chunk_bytes: usize,

    /// Body size of each upload request.
    /// Default: 25 MB
    pub upload_request_bytes: u64,

    /// Backoff used when a dropped transfer is replaced. A transfer slot
    /// is given up after `max_retries` consecutive failures.
    pub retry: RetryConfig,
}

impl Default for MeterConfig {
    fn default() -> Self {
        Self {
            connections: DEFAULT_CONNECTIONS,
            upload_chunk_bytes: DEFAULT_UPLOAD_CHUNK_BYTES,
            upload_request_bytes: DEFAULT_UPLOAD_REQUEST_BYTES,
            retry: RetryConfig::default(),
        }
    }
}

/// How a measurement ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// The throughput stabilised before the ceiling.
    Converged,
    /// The ceiling was reached first; the speed is a best estimate.
    TimedOut,
}

/// The result of one bandwidth measurement.
#[derive(Debug, Clone, Serialize)]
pub struct SpeedTestResult {
    pub speed: SpeedMeasurement,
    /// Wall time from the start of the transfers to the decision.
    pub elapsed: Duration,
    pub outcome: Outcome,
    /// Every sample taken, in time order.
    pub samples: Vec<ThroughputSample>,
    /// Bytes moved by all transfers up to the decision.
    pub bytes: u64,
}

impl SpeedTestResult {
    pub fn converged(&self) -> bool {
        self.outcome == Outcome::Converged
    }
}

/// Moves bytes to or from one URL.
///
/// A transfer adds every byte it moves to `counter` as it goes and returns
/// when its stream ends. It may be dropped at any await point.
pub trait TransferSource: Send + Sync {
    fn transfer(
        &self,
        url: Url,
        counter: Arc<AtomicU64>,
    ) -> BoxFuture<'static, Result<(), SpeedTestError>>;
}

/// Drains `GET` response bodies.
#[derive(Debug, Clone)]
pub struct HttpDownload {
    client: reqwest::Client,
}

impl HttpDownload {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl TransferSource for HttpDownload {
    fn transfer(
        &self,
        url: Url,
        counter: Arc<AtomicU64>,
    ) -> BoxFuture<'static, Result<(), SpeedTestError>> {
        let client = self.client.clone();

        Box::pin(async move {
            let response = client
                .get(url.clone())
                .send()
                .await
                .and_then(|response| response.error_for_status())
                .map_err(|e| transfer_error("download from", &url, e))?;

            let mut stream = response.bytes_stream();
            while let Some(chunk) = stream.next().await {
                let chunk = chunk.map_err(|e| transfer_error("download from", &url, e))?;
                counter.fetch_add(chunk.len() as u64, Ordering::Relaxed);
            }

            Ok(())
        })
    }
}

/// Streams generated `POST` bodies.
#[derive(Debug, Clone)]
pub struct HttpUpload {
    client: reqwest::Client,
    chunk: Bytes,
    chunks_per_request: u64,
}

impl HttpUpload {
    pub fn new(client: reqwest::Client, chunk_bytes: usize, request_bytes: u64) -> Self {
        let chunk_bytes = chunk_bytes.max(1);
        let mut payload = vec![0u8; chunk_bytes];
        // Random data keeps compressing middleboxes honest.
        rand::thread_rng().fill(&mut payload[..]);

        Self {
            client,
            chunk: Bytes::from(payload),
            chunks_per_request: request_bytes.div_ceil(chunk_bytes as u64).max(1),
        }
    }
}

impl TransferSource for HttpUpload {
    fn transfer(
        &self,
        url: Url,
        counter: Arc<AtomicU64>,
    ) -> BoxFuture<'static, Result<(), SpeedTestError>> {
        let client = self.client.clone();
        let chunk = self.chunk.clone();
        let chunks = self.chunks_per_request;

        Box::pin(async move {
            // Bytes are counted as the body is polled by the connection.
            let body = futures::stream::iter(0..chunks).map(move |_| {
                counter.fetch_add(chunk.len() as u64, Ordering::Relaxed);
                Ok::<Bytes, std::io::Error>(chunk.clone())
            });

            client
                .post(url.clone())
                .body(Body::wrap_stream(body))
                .send()
                .await
                .and_then(|response| response.error_for_status())
                .map_err(|e| transfer_error("upload to", &url, e))?;

            Ok(())
        })
    }
}

fn transfer_error(action: &str, url: &Url, error: reqwest::Error) -> SpeedTestError {
    let kind = match protocol_error_kind(&error) {
        Some(kind) => kind,
        None if error.is_timeout() => ErrorKind::Timeout,
        None => match classify_error(&error) {
            ErrorKind::Unknown => ErrorKind::Network,
            kind => kind,
        },
    };
    SpeedTestError::new(
        kind,
        format!("{} {} failed", action, url.host_str().unwrap_or("target")),
    )
    .with_source(error)
}

/// Measures aggregate download and upload throughput.
pub struct BandwidthMeter {
    download: Arc<dyn TransferSource>,
    upload: Arc<dyn TransferSource>,
    config: MeterConfig,
    family: Option<AddressFamily>,
}

impl BandwidthMeter {
    /// A meter whose transfers go through the run's HTTP client.
    pub fn new(context: &RunContext, config: MeterConfig) -> Self {
        let client = context.http().clone();
        let upload = HttpUpload::new(
            client.clone(),
            config.upload_chunk_bytes,
            config.upload_request_bytes,
        );

        Self::with_sources(Arc::new(HttpDownload::new(client)), Arc::new(upload), config)
            .with_family(context.preference().family())
    }

    pub fn with_sources(
        download: Arc<dyn TransferSource>,
        upload: Arc<dyn TransferSource>,
        config: MeterConfig,
    ) -> Self {
        Self { download, upload, config, family: None }
    }

    /// Require every IP-literal target to be of `family`.
    pub fn with_family(mut self, family: Option<AddressFamily>) -> Self {
        self.family = family;
        self
    }

    pub async fn measure_download_speed(
        &self,
        urls: &[Url],
        criteria: &StabilityCriteria,
    ) -> Result<SpeedTestResult, SpeedTestError> {
        self.measure(Direction::Download, urls, criteria, None).await
    }

    pub async fn measure_download_speed_with_progress(
        &self,
        urls: &[Url],
        criteria: &StabilityCriteria,
        progress: &dyn ProgressCallback,
    ) -> Result<SpeedTestResult, SpeedTestError> {
        self.measure(Direction::Download, urls, criteria, Some(progress)).await
    }

    pub async fn measure_upload_speed(
        &self,
        urls: &[Url],
        criteria: &StabilityCriteria,
    ) -> Result<SpeedTestResult, SpeedTestError> {
        self.measure(Direction::Upload, urls, criteria, None).await
    }

    pub async fn measure_upload_speed_with_progress(
        &self,
        urls: &[Url],
        criteria: &StabilityCriteria,
        progress: &dyn ProgressCallback,
    ) -> Result<SpeedTestResult, SpeedTestError> {
        self.measure(Direction::Upload, urls, criteria, Some(progress)).await
    }

    async fn measure(
        &self,
        direction: Direction,
        urls: &[Url],
        criteria: &StabilityCriteria,
        progress: Option<&dyn ProgressCallback>,
    ) -> Result<SpeedTestResult, SpeedTestError> {
        if urls.is_empty() {
            return Err(SpeedTestError::no_urls());
        }
        criteria.validate()?;
        for url in urls {
            check_literal_host(url, self.family)?;
        }

        let source = match direction {
            Direction::Download => self.download.clone(),
            Direction::Upload => self.upload.clone(),
        };
        let connections = self.config.connections.max(1);
        let urls: Arc<[Url]> = urls.into();

        info!(
            "Starting {} measurement: {} connections over {} URLs",
            direction,
            connections,
            urls.len()
        );

        let token = CancellationToken::new();
        let mut workers = JoinSet::new();
        let counters: Vec<Arc<AtomicU64>> =
            (0..connections).map(|_| Arc::new(AtomicU64::new(0))).collect();

        for (slot, counter) in counters.iter().enumerate() {
            workers.spawn(run_worker(
                source.clone(),
                urls.clone(),
                slot,
                counter.clone(),
                token.clone(),
                self.config.retry.clone(),
            ));
        }

        let start = Instant::now();
        let deadline = start + criteria.max_duration();
        let mut ticker = interval_at(start + criteria.interval(), criteria.interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut detector = StabilityDetector::new(criteria.clone());
        let mut last_total = 0u64;
        let mut last_tick = start;
        let mut last_error: Option<SpeedTestError> = None;

        let outcome = loop {
            tokio::select! {
                biased;

                _ = sleep_until(deadline) => {
                    detector.time_out();
                    break Outcome::TimedOut;
                }
                _ = ticker.tick() => {
                    let now = Instant::now();
                    let total = snapshot(&counters);
                    let bps = bits_per_second(total.saturating_sub(last_total), now - last_tick);
                    last_total = total;
                    last_tick = now;

                    let elapsed = now - start;
                    let state = detector.record(elapsed, bps);
                    notify(progress, ProgressEvent::Throughput {
                        direction,
                        speed: SpeedMeasurement::from_bits_per_second(bps),
                        elapsed,
                    });

                    if state == MeterState::Converged {
                        break Outcome::Converged;
                    }
                }
                Some(joined) = workers.join_next() => {
                    match joined {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => {
                            warn!("{} connection gave up: {}", direction, e);
                            last_error = Some(e);
                        }
                        Err(e) => warn!("{} connection task failed: {}", direction, e),
                    }

                    if workers.is_empty() {
                        // A forced family that cannot reach the targets is
                        // reported as such, not as a generic failure.
                        if let Some(e) = last_error.take_if(|e| e.kind.is_protocol_error()) {
                            return Err(e);
                        }

                        let mut error = match direction {
                            Direction::Download => SpeedTestError::download_failed(
                                format!("all {} connections failed", connections),
                            ),
                            Direction::Upload => SpeedTestError::upload_failed(
                                format!("all {} connections failed", connections),
                            ),
                        };
                        if let Some(cause) = last_error {
                            error = error.with_source(cause);
                        }
                        return Err(error);
                    }
                }
            }
        };

        let elapsed = Instant::now() - start;
        let bytes = snapshot(&counters);
        shutdown(&token, &mut workers).await;

        let speed = if detector.samples().is_empty() {
            SpeedMeasurement::from_transfer(bytes, elapsed)
        } else {
            SpeedMeasurement::from_bits_per_second(detector.estimate())
        };

        info!(
            "{} finished after {:.1}s ({:?}): {}",
            direction,
            elapsed.as_secs_f64(),
            outcome,
            speed
        );

        Ok(SpeedTestResult {
            speed,
            elapsed,
            outcome,
            samples: detector.into_samples(),
            bytes,
        })
    }
}

fn snapshot(counters: &[Arc<AtomicU64>]) -> u64 {
    counters.iter().map(|counter| counter.load(Ordering::Relaxed)).sum()
}

/// Cancel every transfer and wait a bounded time for them to wind down.
async fn shutdown(
    token: &CancellationToken,
    workers: &mut JoinSet<Result<(), SpeedTestError>>,
) {
    token.cancel();

    let drained = timeout(SHUTDOWN_GRACE, async {
        while workers.join_next().await.is_some() {}
    })
    .await;

    if drained.is_err() {
        warn!("{} transfers did not stop in time, aborting them", workers.len());
        workers.abort_all();
        while workers.join_next().await.is_some() {}
    }
}

/// Keep one transfer slot busy until cancelled.
///
/// A failed or empty transfer is replaced after a backoff, moving on to the
/// next URL. The slot is given up after too many consecutive failures.
async fn run_worker(
    source: Arc<dyn TransferSource>,
    urls: Arc<[Url]>,
    slot: usize,
    counter: Arc<AtomicU64>,
    token: CancellationToken,
    retry: RetryConfig,
) -> Result<(), SpeedTestError> {
    let mut index = slot;
    let mut failures = 0u32;

    loop {
        let url = urls[index % urls.len()].clone();
        let before = counter.load(Ordering::Relaxed);

        let result = tokio::select! {
            _ = token.cancelled() => return Ok(()),
            result = source.transfer(url.clone(), counter.clone()) => result,
        };

        let moved = counter.load(Ordering::Relaxed) - before;
        let error = match result {
            Ok(()) if moved > 0 => {
                failures = 0;
                continue;
            }
            Ok(()) => SpeedTestError::network(format!("{} sent no data", url)),
            Err(e) => e,
        };

        failures += 1;
        if failures > retry.max_retries {
            return Err(error);
        }

        let delay = retry.delay_for_attempt(failures - 1);
        debug!(
            "Connection {} to {} dropped ({}), replacing in {:?}",
            slot, url, error, delay
        );

        tokio::select! {
            _ = token.cancelled() => return Ok(()),
            _ = sleep(delay) => {}
        }
        index += 1;
    }
}
