//! Test target discovery through fast.com.
//!
//! The service hands out short-lived test URLs in exchange for a token that
//! is embedded in the web app's script: fetch the landing page, follow it to
//! the app script, pull out the token, then ask the API for targets.

pub mod client;
pub mod requests;

use crate::errors::{protocol_error_kind, SpeedTestError};
use crate::fast::client::Client;
use crate::fast::requests::landing::{script_path, LandingPage};
use crate::fast::requests::script::{extract_token, AppScript};
use crate::fast::requests::targets::TargetsRequest;
use crate::retry::{retry_async, RetryConfig, RetryResult};
use crate::speedtest::RunContext;
use log::{debug, info};
use std::error::Error;
use url::Url;

pub use requests::targets::{ClientInfo, Location, Target, TargetsResponse};

/// Default number of targets requested.
pub const DEFAULT_URL_COUNT: usize = 5;

/// What discovery found.
#[derive(Debug, Clone)]
pub struct Targets {
    pub urls: Vec<Url>,
    pub client: ClientInfo,
    /// Location of each target, in the same order as `urls`.
    pub servers: Vec<Location>,
}

impl Targets {
    /// Distinct server locations, formatted as "City, CC".
    pub fn server_locations(&self) -> Vec<String> {
        let mut seen: Vec<String> = Vec::new();
        for location in &self.servers {
            let label = match (&location.city, &location.country) {
                (Some(city), Some(country)) => format!("{}, {}", city, country),
                (Some(city), None) => city.clone(),
                (None, Some(country)) => country.clone(),
                (None, None) => continue,
            };
            if !seen.contains(&label) {
                seen.push(label);
            }
        }
        seen
    }
}

impl From<TargetsResponse> for Targets {
    fn from(response: TargetsResponse) -> Self {
        let (urls, servers) = response
            .targets
            .into_iter()
            .map(|target| (target.url, target.location.unwrap_or_default()))
            .unzip();

        Targets { urls, client: response.client, servers }
    }
}

/// Finds test targets for a run.
pub struct Discovery {
    client: Client,
    retry: RetryConfig,
    url_count: usize,
}

impl Discovery {
    pub fn new(context: &RunContext, retry: RetryConfig, url_count: usize) -> Self {
        Self {
            client: Client::new(context.http().clone()),
            retry,
            url_count: url_count.max(1),
        }
    }

    pub async fn discover(&self) -> Result<Targets, SpeedTestError> {
        info!("Discovering test targets");

        let html = self.fetch("landing page", LandingPage {}).await?;
        let path = script_path(&html).ok_or_else(|| {
            SpeedTestError::discovery("the landing page does not reference the app script")
        })?;
        debug!("App script at {}", path);

        let script = self.fetch("app script", AppScript { path }).await?;
        let token = extract_token(&script).ok_or_else(|| {
            SpeedTestError::discovery("no API token found in the app script")
        })?;

        let request = TargetsRequest { token, url_count: self.url_count };
        let targets: Targets = self.fetch("target list", &request).await?.into();

        if targets.urls.is_empty() {
            return Err(SpeedTestError::discovery("the service returned no targets"));
        }

        info!("Discovered {} targets", targets.urls.len());

        Ok(targets)
    }

    async fn fetch<R: requests::Request>(
        &self,
        what: &str,
        request: R,
    ) -> Result<R::Response, SpeedTestError> {
        let operation = format!("fetch {}", what);
        let result = retry_async(&self.retry, &operation, || {
            self.client.send(&request)
        })
        .await;

        match result {
            RetryResult::Success(response) => Ok(response),
            RetryResult::Failed { last_error, attempts } => {
                Err(discovery_error(what, attempts, last_error))
            }
        }
    }
}

fn discovery_error(
    what: &str,
    attempts: u32,
    error: Box<dyn Error + Send + Sync>,
) -> SpeedTestError {
    let message = format!("could not fetch the {} after {} attempts", what, attempts);

    // A forced family that cannot reach the service is a protocol failure.
    match protocol_error_kind(error.as_ref()) {
        Some(kind) => SpeedTestError::protocol(kind, message).with_source(BoxedError(error)),
        None => SpeedTestError::discovery(message).with_source(BoxedError(error)),
    }
}

/// Carries a boxed error as a typed source.
#[derive(Debug)]
struct BoxedError(Box<dyn Error + Send + Sync>);

impl std::fmt::Display for BoxedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl Error for BoxedError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        Some(self.0.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorKind;

    fn response() -> TargetsResponse {
        serde_json::from_str(
            r#"{"client": {"isp": "Example"},
                "targets": [
                  {"url": "https://a.example/speedtest", "location": {"city": "Austin", "country": "US"}},
                  {"url": "https://b.example/speedtest", "location": {"city": "Austin", "country": "US"}},
                  {"url": "https://c.example/speedtest"}
                ]}"#,
        )
        .unwrap()
    }

    #[test]
    fn test_targets_keep_order() {
        let targets = Targets::from(response());
        assert_eq!(targets.urls.len(), 3);
        assert_eq!(targets.urls[2].host_str(), Some("c.example"));
        assert_eq!(targets.servers.len(), 3);
    }

    #[test]
    fn test_server_locations_are_distinct() {
        let targets = Targets::from(response());
        assert_eq!(targets.server_locations(), vec!["Austin, US".to_string()]);
    }

    #[test]
    fn test_discovery_error_keeps_protocol_kind() {
        let forced: Box<dyn Error + Send + Sync> =
            Box::new(SpeedTestError::forced_family("fast.com", "IPv6"));
        let error = discovery_error("landing page", 4, forced);
        assert_eq!(error.kind, ErrorKind::NoAddressForForcedProtocol);

        let plain: Box<dyn Error + Send + Sync> = "HTTP 503".into();
        let error = discovery_error("landing page", 4, plain);
        assert_eq!(error.kind, ErrorKind::Discovery);
        assert!(error.message.contains("4 attempts"));
    }
}
