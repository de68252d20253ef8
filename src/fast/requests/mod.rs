extern crate serde;

pub mod landing;
pub mod script;
pub mod targets;

use reqwest::{
    header::{HeaderMap, HeaderValue, ACCEPT, USER_AGENT},
    Method,
};
use serde::Deserialize;
use std::borrow::Cow;

/// User agent sent on every request of a run.
pub(crate) const UA: &str = concat!(
    env!("CARGO_PKG_NAME"),
    "/",
    env!("CARGO_PKG_VERSION"),
    " (",
    env!("CARGO_PKG_REPOSITORY"),
    ")"
);

/// Where the landing page and its scripts live.
pub(crate) static FAST_BASE_URL: &str = "https://fast.com";

/// Where test targets are handed out.
pub(crate) static API_BASE_URL: &str = "https://api.fast.com";

pub trait Request {
    type Response: for<'de> Deserialize<'de>;

    const METHOD: Method = Method::GET;

    fn base_url(&self) -> &'static str {
        FAST_BASE_URL
    }

    fn endpoint(&self) -> Cow<'_, str>;

    fn query(&self) -> Vec<(&'static str, String)> {
        Vec::new()
    }

    fn headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();

        headers.insert(USER_AGENT, HeaderValue::from_static(UA));
        headers.insert(ACCEPT, HeaderValue::from_static("*/*"));

        headers
    }
}

impl<R: Request> Request for &R {
    type Response = R::Response;

    const METHOD: Method = R::METHOD;

    fn base_url(&self) -> &'static str {
        (**self).base_url()
    }

    fn endpoint(&self) -> Cow<'_, str> {
        (**self).endpoint()
    }

    fn query(&self) -> Vec<(&'static str, String)> {
        (**self).query()
    }

    fn headers(&self) -> HeaderMap {
        (**self).headers()
    }
}
