pub mod error;
pub mod types;

pub use error::{GridError, Result};
pub use types::headless_chrome_capabilities;

use std::time::Duration;

use serde::de::DeserializeOwned;
use tracing::debug;

pub use types::NewSessionValue;

use types::{Capabilities, NavigateRequest, NewSessionRequest, StatusValue, WebDriverValue};

/// HTTP client for a remote browser grid speaking the W3C WebDriver
/// protocol (Selenium hub and compatible endpoints).
pub struct WebGridClient {
    client: reqwest::Client,
    base_url: String,
}

impl WebGridClient {
    pub fn new(base_url: &str) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .expect("Failed to build HTTP client");

        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    /// Whether the grid reports itself ready to create new sessions.
    pub async fn status(&self) -> Result<bool> {
        let status: WebDriverValue<StatusValue> =
            self.get(&format!("{}/status", self.base_url)).await?;
        Ok(status.value.ready)
    }

    /// Create a new browser session on the grid. The returned value
    /// carries the session id plus the capabilities the remote end
    /// actually granted (including the serving node, when the grid
    /// reports one).
    pub async fn create_session(&self, capabilities: serde_json::Value) -> Result<NewSessionValue> {
        let body = NewSessionRequest {
            capabilities: Capabilities {
                always_match: capabilities,
            },
        };

        let resp: WebDriverValue<NewSessionValue> = self
            .post(&format!("{}/session", self.base_url), &body)
            .await?;

        debug!(session_id = %resp.value.session_id, "Created grid session");
        Ok(resp.value)
    }

    /// Point a session at a URL. Returns once the navigation settles
    /// according to the remote end's page-load strategy.
    pub async fn navigate(&self, session_id: &str, url: &str) -> Result<()> {
        let endpoint = format!("{}/session/{}/url", self.base_url, session_id);
        let body = NavigateRequest {
            url: url.to_string(),
        };
        let _: WebDriverValue<serde_json::Value> = self.post(&endpoint, &body).await?;
        Ok(())
    }

    /// URL the session is currently on. Cheap; doubles as a liveness probe.
    pub async fn current_url(&self, session_id: &str) -> Result<String> {
        let resp: WebDriverValue<String> = self
            .get(&format!("{}/session/{}/url", self.base_url, session_id))
            .await?;
        Ok(resp.value)
    }

    /// Serialized DOM of the session's current page.
    pub async fn page_source(&self, session_id: &str) -> Result<String> {
        let resp: WebDriverValue<String> = self
            .get(&format!("{}/session/{}/source", self.base_url, session_id))
            .await?;
        Ok(resp.value)
    }

    /// Tear down a session on the grid.
    pub async fn delete_session(&self, session_id: &str) -> Result<()> {
        let endpoint = format!("{}/session/{}", self.base_url, session_id);
        let resp = self.client.delete(&endpoint).send().await?;

        let status = resp.status();
        if !status.is_success() {
            let message = resp.text().await.unwrap_or_default();
            return Err(GridError::Api {
                status: status.as_u16(),
                message,
            });
        }
        Ok(())
    }

    async fn get<T: DeserializeOwned>(&self, endpoint: &str) -> Result<T> {
        let resp = self.client.get(endpoint).send().await?;
        Self::decode(resp).await
    }

    async fn post<B: serde::Serialize, T: DeserializeOwned>(
        &self,
        endpoint: &str,
        body: &B,
    ) -> Result<T> {
        let resp = self
            .client
            .post(endpoint)
            .header("Content-Type", "application/json")
            .json(body)
            .send()
            .await?;
        Self::decode(resp).await
    }

    async fn decode<T: DeserializeOwned>(resp: reqwest::Response) -> Result<T> {
        let status = resp.status();
        if !status.is_success() {
            let message = resp.text().await.unwrap_or_default();
            return Err(GridError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let text = resp.text().await?;
        serde_json::from_str(&text).map_err(|e| GridError::Protocol(e.to_string()))
    }
}
