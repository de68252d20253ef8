//! Forced IP protocol verification.
//!
//! Before a run with a forced protocol starts, [`ProtocolResolver`] proves
//! the family is usable end to end: the probe domain must resolve to an
//! address of the family, and a request constrained to that family must
//! succeed.

use crate::errors::{ErrorKind, SpeedTestError};
use crate::speedtest::connection::{build_http_client, AddressFamily, FamilyResolver};
use log::{debug, info, warn};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// A dual-stack domain used to prove protocol connectivity.
pub const DEFAULT_PROBE_DOMAIN: &str = "www.google.com";

/// Default time budget for the connectivity request.
pub const DEFAULT_PROTOCOL_TIMEOUT: Duration = Duration::from_secs(5);

/// Which IP protocol a run must use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProtocolPreference {
    /// Let the platform pick; nothing is enforced.
    #[default]
    Auto,
    ForceIPv4,
    ForceIPv6,
}

impl ProtocolPreference {
    /// The family every connection must use, if one is forced.
    pub fn family(&self) -> Option<AddressFamily> {
        match self {
            ProtocolPreference::Auto => None,
            ProtocolPreference::ForceIPv4 => Some(AddressFamily::V4),
            ProtocolPreference::ForceIPv6 => Some(AddressFamily::V6),
        }
    }
}

impl fmt::Display for ProtocolPreference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.family() {
            Some(family) => f.write_str(family.label()),
            None => f.write_str("auto"),
        }
    }
}

impl FromStr for ProtocolPreference {
    type Err = SpeedTestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(ProtocolPreference::Auto),
            "4" | "ipv4" | "v4" => Ok(ProtocolPreference::ForceIPv4),
            "6" | "ipv6" | "v6" => Ok(ProtocolPreference::ForceIPv6),
            other => Err(SpeedTestError::config(format!(
                "unknown protocol '{}', expected auto, 4 or 6",
                other
            ))),
        }
    }
}

/// Verifies that a forced protocol works before any measurement starts.
#[derive(Debug, Clone)]
pub struct ProtocolResolver {
    probe_domain: String,
    timeout: Duration,
}

impl Default for ProtocolResolver {
    fn default() -> Self {
        Self::new(DEFAULT_PROBE_DOMAIN)
    }
}

impl ProtocolResolver {
    pub fn new(probe_domain: impl Into<String>) -> Self {
        Self { probe_domain: probe_domain.into(), timeout: DEFAULT_PROTOCOL_TIMEOUT }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Whether `preference` is usable. `Auto` always is; failures of a
    /// forced protocol are logged and reported as `false`.
    pub async fn verify(&self, preference: ProtocolPreference) -> bool {
        match self.check(preference).await {
            Ok(()) => true,
            Err(e) => {
                warn!("{} is not usable: {}", preference, e);
                false
            }
        }
    }

    /// Like [`verify`](Self::verify), but keeps the reason for a failure.
    pub async fn check(
        &self,
        preference: ProtocolPreference,
    ) -> Result<(), SpeedTestError> {
        let Some(family) = preference.family() else {
            return Ok(());
        };

        info!("Verifying {} connectivity via {}", family.label(), self.probe_domain);

        let addresses = FamilyResolver::new(None)
            .lookup(&self.probe_domain)
            .await
            .map_err(|e| {
                SpeedTestError::protocol(
                    ErrorKind::ProtocolResolutionFailed,
                    format!("could not resolve {}", self.probe_domain),
                )
                .with_source(e)
            })?;

        if !addresses.iter().any(|address| family.matches(address)) {
            return Err(SpeedTestError::protocol(
                ErrorKind::NoAddressForProtocol,
                format!("{} has no {} address", self.probe_domain, family.label()),
            ));
        }

        let forced = FamilyResolver::new(Some(family));
        let client = build_http_client(&forced, self.timeout)?;
        let url = format!("https://{}/", self.probe_domain);

        let response = client
            .head(&url)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| {
                SpeedTestError::protocol(
                    ErrorKind::ProtocolConnectivityFailed,
                    format!("request to {} over {} failed", url, family.label()),
                )
                .with_source(e)
            })?;

        if !response.status().is_success() {
            return Err(SpeedTestError::protocol(
                ErrorKind::ProtocolTestFailed,
                format!(
                    "{} over {} answered {}",
                    url,
                    family.label(),
                    response.status()
                ),
            ));
        }

        debug!("{} connectivity verified", family.label());

        Ok(())
    }
}
