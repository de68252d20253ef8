use crate::fast::requests::Request;
use reqwest::Client as ReqwestClient;
use std::error::Error;

#[derive(Debug, Clone)]
pub struct Client {
    client: ReqwestClient,
}

impl Client {
    /// Wrap the run's HTTP client, so discovery obeys the same protocol
    /// constraints as the measurements.
    pub fn new(client: ReqwestClient) -> Self {
        Client { client }
    }

    pub async fn send<R: Request>(
        &self,
        request: R,
    ) -> Result<R::Response, Box<dyn Error + Send + Sync>> {
        let endpoint = request.endpoint();
        let url = if endpoint.starts_with("http") {
            endpoint.into_owned()
        } else {
            format!("{}/{}", request.base_url(), endpoint.trim_start_matches('/'))
        };

        let response = self
            .client
            .request(R::METHOD, &url)
            .headers(request.headers())
            .query(&request.query())
            .send()
            .await?
            .error_for_status()?;

        let text = response.text().await?;

        // The targets API answers JSON; pages and scripts are plain text.
        if let Ok(parsed) = serde_json::from_str::<R::Response>(&text) {
            return Ok(parsed);
        }

        let deserialized = serde_plain::from_str(&text)?;

        Ok(deserialized)
    }
}
