use crate::fast::requests::Request;
use std::borrow::Cow;

/// The fast.com landing page, fetched only to find the app script.
pub(crate) struct LandingPage {}

impl Request for LandingPage {
    type Response = String;

    fn endpoint(&self) -> Cow<'_, str> {
        "/".into()
    }
}

/// Path of the app script referenced by the landing page, e.g.
/// `/app-ed402d.js`.
pub(crate) fn script_path(html: &str) -> Option<String> {
    html.split("src=")
        .skip(1)
        .filter_map(|rest| {
            let quote = rest.chars().next().filter(|c| *c == '"' || *c == '\'')?;
            let value = &rest[1..];
            let end = value.find(quote)?;
            Some(&value[..end])
        })
        .find(|src| {
            let file = src.rsplit('/').next().unwrap_or(src);
            file.starts_with("app-") && file.ends_with(".js")
        })
        .map(|src| {
            if src.starts_with('/') || src.starts_with("http") {
                src.to_string()
            } else {
                format!("/{}", src)
            }
        })
}
