//! Connection establishment shared by every phase of a run.
//!
//! All name resolution goes through [`FamilyResolver`], which enforces a
//! forced address family at address-selection time: a host with no address
//! of that family is an error, never a fallback to the other family.

use crate::errors::{ErrorKind, SpeedTestError};
use crate::fast::requests::UA;
use crate::speedtest::IoReadAndWrite;
use hickory_resolver::config::{LookupIpStrategy, ResolverConfig, ResolverOpts};
use hickory_resolver::system_conf::read_system_conf;
use hickory_resolver::TokioAsyncResolver;
use log::debug;
use reqwest::dns::{Addrs, Name, Resolve, Resolving};
use rustls_connector::RustlsConnector;
use std::io::Write;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, TcpStream};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use url::{Host, Url};

/// An IP address family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressFamily {
    V4,
    V6,
}

impl AddressFamily {
    pub fn matches(&self, address: &IpAddr) -> bool {
        match self {
            AddressFamily::V4 => address.is_ipv4(),
            AddressFamily::V6 => address.is_ipv6(),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            AddressFamily::V4 => "IPv4",
            AddressFamily::V6 => "IPv6",
        }
    }

    /// The wildcard local address of this family.
    pub fn unspecified(&self) -> IpAddr {
        match self {
            AddressFamily::V4 => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            AddressFamily::V6 => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        }
    }
}

/// Keep only the addresses of the forced family, in resolver order.
pub fn select_addresses(
    host: &str,
    addresses: impl IntoIterator<Item = IpAddr>,
    family: Option<AddressFamily>,
) -> Result<Vec<IpAddr>, SpeedTestError> {
    let selected: Vec<IpAddr> = addresses
        .into_iter()
        .filter(|address| family.map_or(true, |family| family.matches(address)))
        .collect();

    if selected.is_empty() {
        return Err(match family {
            Some(family) => SpeedTestError::forced_family(host, family.label()),
            None => SpeedTestError::dns(format!("{} has no addresses", host)),
        });
    }

    Ok(selected)
}

/// Reject a URL whose host is an IP literal of the wrong family.
///
/// The HTTP client connects to literal hosts without consulting the
/// resolver, so they are checked here instead.
pub fn check_literal_host(
    url: &Url,
    family: Option<AddressFamily>,
) -> Result<(), SpeedTestError> {
    let address = match url.host() {
        Some(Host::Ipv4(address)) => IpAddr::V4(address),
        Some(Host::Ipv6(address)) => IpAddr::V6(address),
        _ => return Ok(()),
    };

    select_addresses(url.host_str().unwrap_or_default(), [address], family).map(|_| ())
}

/// DNS resolver that only ever hands out addresses of the forced family.
#[derive(Clone)]
pub struct FamilyResolver {
    resolver: TokioAsyncResolver,
    family: Option<AddressFamily>,
}

impl FamilyResolver {
    /// Build a resolver from the system configuration, falling back to the
    /// library defaults when none is readable.
    pub fn new(family: Option<AddressFamily>) -> Self {
        let (config, mut opts) = read_system_conf().unwrap_or_else(|e| {
            debug!("System DNS configuration unavailable ({}), using defaults", e);
            (ResolverConfig::default(), ResolverOpts::default())
        });

        // Ask for both families so a forced family sees every candidate.
        opts.ip_strategy = LookupIpStrategy::Ipv4AndIpv6;

        Self { resolver: TokioAsyncResolver::tokio(config, opts), family }
    }

    pub fn family(&self) -> Option<AddressFamily> {
        self.family
    }

    /// Every address of `host`, regardless of family.
    pub async fn lookup(&self, host: &str) -> Result<Vec<IpAddr>, SpeedTestError> {
        if let Ok(literal) = host.trim_matches(['[', ']']).parse::<IpAddr>() {
            return Ok(vec![literal]);
        }

        let begin = Instant::now();
        let response = self.resolver.lookup_ip(host).await.map_err(|e| {
            SpeedTestError::dns(format!("failed to resolve {}", host))
                .with_source(e)
        })?;
        debug!("Resolved {} in {:?}", host, begin.elapsed());

        Ok(response.iter().collect())
    }

    /// Addresses of `host` usable under the forced family.
    pub async fn resolve_host(
        &self,
        host: &str,
    ) -> Result<Vec<IpAddr>, SpeedTestError> {
        let addresses = self.lookup(host).await?;
        select_addresses(host, addresses, self.family)
    }
}

impl Resolve for FamilyResolver {
    fn resolve(&self, name: Name) -> Resolving {
        let resolver = self.clone();
        Box::pin(async move {
            let addresses = resolver.resolve_host(name.as_str()).await?;
            // The port is replaced by the client with the URL's port.
            let addrs: Addrs = Box::new(
                addresses.into_iter().map(|address| SocketAddr::new(address, 0)),
            );
            Ok::<_, Box<dyn std::error::Error + Send + Sync>>(addrs)
        })
    }
}

/// Build the HTTP client for a run. Every connection it opens resolves
/// through `resolver`, and under a forced family the local socket is bound
/// to that family so IP-literal hosts cannot slip past the resolver.
pub fn build_http_client(
    resolver: &FamilyResolver,
    connect_timeout: Duration,
) -> Result<reqwest::Client, SpeedTestError> {
    let mut builder = reqwest::Client::builder()
        .user_agent(UA)
        .dns_resolver(Arc::new(resolver.clone()))
        .connect_timeout(connect_timeout);

    if let Some(family) = resolver.family() {
        builder = builder.local_address(family.unspecified());
    }

    builder.build().map_err(|e| {
        SpeedTestError::config("failed to build the HTTP client").with_source(e)
    })
}

/// Establish a TCP connection whose reads and writes are bounded by
/// `timeout`.
///
/// Runs on a blocking thread pool via `spawn_blocking` to avoid
/// starving the tokio async runtime.
pub async fn tcp_connect(
    address: IpAddr,
    port: u16,
    timeout: Duration,
) -> Result<(TcpStream, Duration), SpeedTestError> {
    tokio::task::spawn_blocking(move || {
        let now = Instant::now();
        let mut stream =
            TcpStream::connect_timeout(&SocketAddr::new(address, port), timeout)?;
        stream.set_read_timeout(Some(timeout))?;
        stream.set_write_timeout(Some(timeout))?;
        stream.set_nodelay(true)?;
        stream.flush()?;
        Ok::<_, std::io::Error>((stream, now.elapsed()))
    })
    .await
    .map_err(|e| SpeedTestError::new(ErrorKind::Unknown, e.to_string()))?
    .map_err(|e| {
        SpeedTestError::network(format!("failed to connect to {}:{}", address, port))
            .with_source(e)
    })
}

/// Perform a TLS handshake on an established TCP connection.
///
/// Runs on a blocking thread pool via `spawn_blocking` to avoid
/// starving the tokio async runtime.
pub async fn tls_handshake(
    tcp: TcpStream,
    host: String,
) -> Result<(Box<dyn IoReadAndWrite>, Duration), SpeedTestError> {
    tokio::task::spawn_blocking(move || {
        let connector: RustlsConnector = RustlsConnector::new_with_native_certs()
            .unwrap_or_else(|_| RustlsConnector::new_with_webpki_roots_certs());
        let now = Instant::now();

        let mut stream = connector.connect(&host, tcp).map_err(|e| {
            SpeedTestError::new(ErrorKind::Tls, format!("handshake with {}: {}", host, e))
        })?;
        stream.flush().map_err(|e| {
            SpeedTestError::new(ErrorKind::Tls, format!("handshake with {}", host))
                .with_source(e)
        })?;

        Ok::<_, SpeedTestError>((
            Box::new(stream) as Box<dyn IoReadAndWrite>,
            now.elapsed(),
        ))
    })
    .await
    .map_err(|e| SpeedTestError::new(ErrorKind::Unknown, e.to_string()))?
}
