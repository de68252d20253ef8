use crate::fast::requests::{Request, API_BASE_URL};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use url::Url;

/// A coarse geographic location.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Location {
    pub city: Option<String>,
    pub country: Option<String>,
}

/// What the service knows about the caller.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientInfo {
    pub ip: Option<String>,
    pub asn: Option<String>,
    pub isp: Option<String>,
    pub location: Option<Location>,
}

/// A test server URL handed out by the service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Target {
    #[serde(default)]
    pub name: Option<String>,
    pub url: Url,
    #[serde(default)]
    pub location: Option<Location>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetsResponse {
    #[serde(default)]
    pub client: ClientInfo,
    pub targets: Vec<Target>,
}

pub(crate) struct TargetsRequest {
    pub token: String,
    pub url_count: usize,
}

impl Request for TargetsRequest {
    type Response = TargetsResponse;

    fn base_url(&self) -> &'static str {
        API_BASE_URL
    }

    fn endpoint(&self) -> Cow<'_, str> {
        "/netflix/speedtest/v2".into()
    }

    fn query(&self) -> Vec<(&'static str, String)> {
        vec![
            ("https", "true".to_string()),
            ("token", self.token.clone()),
            ("urlCount", self.url_count.to_string()),
        ]
    }
}
