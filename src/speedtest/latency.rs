//! Application-layer round-trip latency.
//!
//! Each probe opens its own connection, sends one `HEAD` request to absorb
//! the TCP and TLS setup cost, then times a second `HEAD` on the same
//! connection. The second timing is the sample.

use crate::errors::{ErrorKind, SpeedTestError};
use crate::fast::requests::UA;
use crate::speedtest::connection::{tcp_connect, tls_handshake, FamilyResolver};
use crate::speedtest::network_stats::NetworkStats;
use crate::speedtest::progress::{notify, ProgressCallback, ProgressEvent};
use crate::speedtest::{IoReadAndWrite, RunContext};
use http::header::{HeaderMap, HeaderName, HeaderValue, CONNECTION};
use http::StatusCode;
use log::{debug, info, warn};
use std::io::{BufRead, BufReader, Write};
use std::net::{Shutdown, TcpStream};
use std::str::FromStr;
use std::sync::OnceLock;
use std::time::Duration;
use tokio::time::{timeout_at, Instant};
use url::Url;

/// Default number of probes per URL.
pub const DEFAULT_TEST_COUNT: usize = 10;

/// Default time budget of a whole probe.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_millis(2000);

#[derive(Debug, Clone)]
pub struct LatencyConfig {
    /// Number of probes against every URL.
    pub test_count: usize,
    /// Deadline of a whole probe, from resolution through the timed
    /// request. A probe still running at the deadline is a failure.
    pub probe_timeout: Duration,
}

impl Default for LatencyConfig {
    fn default() -> Self {
        Self { test_count: DEFAULT_TEST_COUNT, probe_timeout: DEFAULT_PROBE_TIMEOUT }
    }
}

type Connection = BufReader<Box<dyn IoReadAndWrite>>;

/// Measures round-trip latency, jitter and loss against a set of URLs.
pub struct LatencyProber {
    resolver: FamilyResolver,
    config: LatencyConfig,
}

impl LatencyProber {
    pub fn new(context: &RunContext, config: LatencyConfig) -> Self {
        Self { resolver: context.resolver().clone(), config }
    }

    pub async fn measure_latency_stats(
        &self,
        urls: &[Url],
    ) -> Result<NetworkStats, SpeedTestError> {
        self.measure(urls, None).await
    }

    pub async fn measure_latency_stats_with_progress(
        &self,
        urls: &[Url],
        progress: &dyn ProgressCallback,
    ) -> Result<NetworkStats, SpeedTestError> {
        self.measure(urls, Some(progress)).await
    }

    async fn measure(
        &self,
        urls: &[Url],
        progress: Option<&dyn ProgressCallback>,
    ) -> Result<NetworkStats, SpeedTestError> {
        if urls.is_empty() {
            return Err(SpeedTestError::no_urls());
        }

        let total = urls.len() * self.config.test_count;
        let mut stats = NetworkStats::new();

        info!("Running {} latency probes against {} URLs", total, urls.len());

        for url in urls {
            for _ in 0..self.config.test_count {
                let outcome = self.probe(url).await;

                let latency_ms = match outcome {
                    Ok(latency_ms) => {
                        debug!("Latency to {}: {:.2} ms", url, latency_ms);
                        stats.add_measurement(true, latency_ms);
                        Some(latency_ms)
                    }
                    // A forced family the target cannot satisfy ends the phase.
                    Err(e) if e.kind.is_protocol_error() => return Err(e),
                    Err(e) => {
                        warn!("Latency probe to {} failed: {}", url, e);
                        stats.add_measurement(false, 0.0);
                        None
                    }
                };

                notify(
                    progress,
                    ProgressEvent::LatencyProbe {
                        latency_ms,
                        current: stats.packet_count() as usize,
                        total,
                    },
                );
            }
        }

        Ok(stats)
    }

    /// One warm-up request and one timed request on the same connection,
    /// all of it before the probe deadline.
    async fn probe(&self, url: &Url) -> Result<f64, SpeedTestError> {
        let limit = self.config.probe_timeout;
        let started = Instant::now();
        let socket = OnceLock::new();

        match timeout_at(started + limit, self.run_probe(url, &socket)).await {
            Ok(result) => result,
            Err(_) => {
                // Unblocks a read still waiting on the connection.
                if let Some(socket) = socket.get() {
                    let _ = socket.shutdown(Shutdown::Both);
                }
                Err(SpeedTestError::probe_timeout(
                    started.elapsed().as_secs_f64() * 1000.0,
                    limit.as_millis() as u64,
                ))
            }
        }
    }

    async fn run_probe(
        &self,
        url: &Url,
        socket: &OnceLock<TcpStream>,
    ) -> Result<f64, SpeedTestError> {
        let host = url
            .host_str()
            .ok_or_else(|| SpeedTestError::config(format!("{} has no host", url)))?;
        let port = url
            .port_or_known_default()
            .ok_or_else(|| SpeedTestError::config(format!("{} has no port", url)))?;

        let address = self
            .resolver
            .resolve_host(host)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| SpeedTestError::dns(format!("{} has no addresses", host)))?;

        let (tcp, tcp_duration) =
            tcp_connect(address, port, self.config.probe_timeout).await?;
        if let Ok(handle) = tcp.try_clone() {
            let _ = socket.set(handle);
        }

        let stream: Box<dyn IoReadAndWrite> = if url.scheme() == "https" {
            tls_handshake(tcp, host.to_string()).await?.0
        } else {
            Box::new(tcp)
        };
        debug!("Connected to {} ({}) in {:?}", host, address, tcp_duration);

        let request = build_head_request(url);

        // The warm-up timing carries connection setup cost and is discarded.
        let (connection, _) =
            exchange(BufReader::new(stream), request.clone()).await?;
        let (_, round_trip) = exchange(connection, request).await?;

        Ok(round_trip.as_secs_f64() * 1000.0)
    }
}

/// Send `request` and read the full response head. Returns the connection
/// for reuse and the time from send to the end of the response.
async fn exchange(
    mut connection: Connection,
    request: String,
) -> Result<(Connection, Duration), SpeedTestError> {
    tokio::task::spawn_blocking(move || {
        let now = Instant::now();

        connection.get_mut().write_all(request.as_bytes())?;
        connection.get_mut().flush()?;

        let mut head = String::new();
        loop {
            let read = connection.read_line(&mut head)?;
            if read == 0 {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "connection closed before the response head ended",
                ));
            }
            if head.ends_with("\r\n\r\n") || head == "\r\n" {
                break;
            }
        }

        let elapsed = now.elapsed();
        Ok((connection, head, elapsed))
    })
    .await
    .map_err(|e| SpeedTestError::new(ErrorKind::Unknown, e.to_string()))?
    .map_err(|e| {
        let kind = match e.kind() {
            std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => {
                ErrorKind::ConnectionTimeout
            }
            _ => ErrorKind::Network,
        };
        SpeedTestError::new(kind, "probe request failed").with_source(e)
    })
    .and_then(|(connection, head, elapsed)| {
        let status = parse_status(&head)?;
        let headers = extract_http_headers(&head);
        debug!("Probe answered {} in {:?}", status, elapsed);

        if is_connection_close(&headers) {
            return Err(SpeedTestError::network(
                "server closed the connection, it cannot be reused",
            ));
        }

        Ok((connection, elapsed))
    })
}

fn build_head_request(url: &Url) -> String {
    let host = match url.port() {
        Some(port) => format!("{}:{}", url.host_str().unwrap_or_default(), port),
        None => url.host_str().unwrap_or_default().to_string(),
    };
    let target = match url.query() {
        Some(query) => format!("{}?{}", url.path(), query),
        None => url.path().to_string(),
    };

    format!(
        "HEAD {} HTTP/1.1\r\n\
        Host: {}\r\n\
        User-Agent: {}\r\n\
        Accept: */*\r\n\
        Cache-Control: no-cache\r\n\
        Connection: keep-alive\r\n\
        \r\n",
        target, host, UA
    )
}

fn parse_status(head: &str) -> Result<StatusCode, SpeedTestError> {
    let status_line = head.lines().next().unwrap_or_default();
    let mut parts = status_line.split_whitespace();

    match (parts.next(), parts.next()) {
        (Some(version), Some(code)) if version.starts_with("HTTP/") => {
            StatusCode::from_bytes(code.as_bytes()).map_err(|_| {
                SpeedTestError::network(format!("bad status line: {}", status_line))
            })
        }
        _ => Err(SpeedTestError::network(format!(
            "bad status line: {}",
            status_line
        ))),
    }
}

fn extract_http_headers(head: &str) -> HeaderMap {
    let mut headers = HeaderMap::new();

    for line in head.lines().skip(1) {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };

        if let (Ok(name), Ok(value)) = (
            HeaderName::from_str(name.trim()),
            HeaderValue::from_str(value.trim()),
        ) {
            headers.append(name, value);
        }
    }

    headers
}

fn is_connection_close(headers: &HeaderMap) -> bool {
    headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .any(|value| value.eq_ignore_ascii_case("close"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::speedtest::protocol::ProtocolPreference;
    use std::io::BufRead;
    use std::net::{SocketAddr, TcpListener, TcpStream};
    use std::thread;

    /// A keep-alive HTTP server answering `HEAD` requests. The n-th
    /// response on a connection is delayed by `delays[n]` when present, and
    /// the connection is closed after `responses` answers.
    fn spawn_server(responses: usize, delays: Vec<Duration>, close_header: bool) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let address = listener.local_addr().unwrap();

        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(stream) = stream else { break };
                let delays = delays.clone();
                thread::spawn(move || serve(stream, responses, delays, close_header));
            }
        });

        address
    }

    fn serve(stream: TcpStream, responses: usize, delays: Vec<Duration>, close_header: bool) {
        let mut writer = stream.try_clone().unwrap();
        let mut reader = std::io::BufReader::new(stream);

        for n in 0..responses {
            let mut line = String::new();
            loop {
                line.clear();
                match reader.read_line(&mut line) {
                    Ok(0) | Err(_) => return,
                    Ok(_) if line == "\r\n" => break,
                    Ok(_) => {}
                }
            }

            if let Some(delay) = delays.get(n) {
                thread::sleep(*delay);
            }

            let connection = if close_header { "close" } else { "keep-alive" };
            let response = format!(
                "HTTP/1.1 200 OK\r\nContent-Length: 1024\r\nConnection: {}\r\n\r\n",
                connection
            );
            if writer.write_all(response.as_bytes()).is_err() {
                return;
            }
        }
    }

    /// Answers every request one byte at a time, `pace` apart.
    fn spawn_trickle_server(pace: Duration) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let address = listener.local_addr().unwrap();

        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(stream) = stream else { break };
                thread::spawn(move || trickle(stream, pace));
            }
        });

        address
    }

    fn trickle(stream: TcpStream, pace: Duration) {
        let mut writer = stream.try_clone().unwrap();
        let mut reader = std::io::BufReader::new(stream);
        let response =
            "HTTP/1.1 200 OK\r\nContent-Length: 1024\r\nConnection: keep-alive\r\n\r\n";

        loop {
            let mut line = String::new();
            loop {
                line.clear();
                match reader.read_line(&mut line) {
                    Ok(0) | Err(_) => return,
                    Ok(_) if line == "\r\n" => break,
                    Ok(_) => {}
                }
            }

            for byte in response.bytes() {
                if writer.write_all(&[byte]).is_err() {
                    return;
                }
                thread::sleep(pace);
            }
        }
    }

    fn prober(test_count: usize, probe_timeout: Duration) -> LatencyProber {
        let context = RunContext::new(ProtocolPreference::Auto, Duration::from_secs(2))
            .unwrap();
        LatencyProber::new(&context, LatencyConfig { test_count, probe_timeout })
    }

    fn local_url(address: SocketAddr) -> Url {
        Url::parse(&format!("http://{}/speedtest?token=abc", address)).unwrap()
    }

    #[test]
    fn test_build_head_request() {
        let url = Url::parse("https://example.com:8443/a/b?x=1").unwrap();
        let request = build_head_request(&url);

        assert!(request.starts_with("HEAD /a/b?x=1 HTTP/1.1\r\n"));
        assert!(request.contains("Host: example.com:8443\r\n"));
        assert!(request.contains("Connection: keep-alive\r\n"));
        assert!(request.ends_with("\r\n\r\n"));
    }

    #[test]
    fn test_parse_status() {
        assert_eq!(parse_status("HTTP/1.1 204 No Content\r\n\r\n").unwrap(), StatusCode::NO_CONTENT);
        assert!(parse_status("garbage\r\n\r\n").is_err());
        assert!(parse_status("").is_err());
    }

    #[test]
    fn test_connection_close_detection() {
        let headers = extract_http_headers("HTTP/1.1 200 OK\r\nConnection: Close\r\n\r\n");
        assert!(is_connection_close(&headers));

        let headers = extract_http_headers("HTTP/1.1 200 OK\r\nConnection: keep-alive\r\n\r\n");
        assert!(!is_connection_close(&headers));
    }

    #[tokio::test]
    async fn test_no_urls() {
        let error = prober(1, DEFAULT_PROBE_TIMEOUT)
            .measure_latency_stats(&[])
            .await
            .unwrap_err();
        assert_eq!(error.kind, ErrorKind::NoUrlsProvided);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_keep_alive_server_yields_samples() {
        let address = spawn_server(2, Vec::new(), false);

        let stats = prober(3, DEFAULT_PROBE_TIMEOUT)
            .measure_latency_stats(&[local_url(address)])
            .await
            .unwrap();

        assert_eq!(stats.packet_count(), 3);
        assert_eq!(stats.successful_packets(), 3);
        assert_eq!(stats.packet_loss_rate(), 0.0);
        assert!(stats.min_latency().unwrap() >= 0.0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_closed_connection_counts_as_loss() {
        // The server refuses to reuse the connection after the warm-up.
        let address = spawn_server(1, Vec::new(), true);

        let stats = prober(2, DEFAULT_PROBE_TIMEOUT)
            .measure_latency_stats(&[local_url(address)])
            .await
            .unwrap();

        assert_eq!(stats.packet_count(), 2);
        assert_eq!(stats.successful_packets(), 0);
        assert!((stats.packet_loss_rate() - 100.0).abs() < 1e-9);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_slow_timed_request_is_a_failure() {
        let slow = Duration::from_millis(400);
        let address = spawn_server(2, vec![Duration::ZERO, slow], false);

        let stats = prober(1, Duration::from_millis(150))
            .measure_latency_stats(&[local_url(address)])
            .await
            .unwrap();

        assert_eq!(stats.packet_count(), 1);
        assert_eq!(stats.successful_packets(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_trickling_server_is_cut_off_at_the_deadline() {
        let address = spawn_trickle_server(Duration::from_millis(100));

        let begin = std::time::Instant::now();
        let stats = prober(1, Duration::from_millis(500))
            .measure_latency_stats(&[local_url(address)])
            .await
            .unwrap();
        let took = begin.elapsed();

        assert_eq!(stats.packet_count(), 1);
        assert_eq!(stats.successful_packets(), 0);
        assert!(took < Duration::from_millis(1500), "probe took {:?}", took);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_forced_family_mismatch_ends_the_phase() {
        let address = spawn_server(2, Vec::new(), false);
        let context = RunContext::new(ProtocolPreference::ForceIPv6, Duration::from_secs(2))
            .unwrap();
        let prober = LatencyProber::new(
            &context,
            LatencyConfig { test_count: 3, probe_timeout: DEFAULT_PROBE_TIMEOUT },
        );

        let error = prober
            .measure_latency_stats(&[local_url(address)])
            .await
            .unwrap_err();
        assert_eq!(error.kind, ErrorKind::NoAddressForForcedProtocol);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_unreachable_target_is_recorded_not_raised() {
        // Bind then drop a listener to get a port nothing listens on.
        let address = TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap();

        let stats = prober(2, Duration::from_millis(500))
            .measure_latency_stats(&[local_url(address)])
            .await
            .unwrap();

        assert_eq!(stats.packet_count(), 2);
        assert!((stats.packet_loss_rate() - 100.0).abs() < 1e-9);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_single_probe_against_example_com() {
        // Holds whether or not the network is reachable.
        let url = Url::parse("https://example.com").unwrap();

        let stats = prober(1, DEFAULT_PROBE_TIMEOUT)
            .measure_latency_stats(&[url])
            .await
            .unwrap();

        assert_eq!(stats.packet_count(), 1);
        if stats.successful_packets() == 1 {
            assert_eq!(stats.latencies().len(), 1);
            assert!(stats.latencies()[0] >= 0.0);
        } else {
            assert_eq!(stats.successful_packets(), 0);
            assert!((stats.packet_loss_rate() - 100.0).abs() < 1e-9);
        }
    }
}
