use serde::{Deserialize, Serialize};

/// Envelope every W3C WebDriver response uses: `{ "value": ... }`.
#[derive(Debug, Deserialize)]
pub struct WebDriverValue<T> {
    pub value: T,
}

#[derive(Debug, Serialize)]
pub struct NewSessionRequest {
    pub capabilities: Capabilities,
}

#[derive(Debug, Serialize)]
pub struct Capabilities {
    #[serde(rename = "alwaysMatch")]
    pub always_match: serde_json::Value,
}

#[derive(Debug, Deserialize)]
pub struct NewSessionValue {
    #[serde(rename = "sessionId")]
    pub session_id: String,
    #[serde(default)]
    pub capabilities: serde_json::Value,
}

#[derive(Debug, Deserialize)]
pub struct StatusValue {
    pub ready: bool,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct NavigateRequest {
    pub url: String,
}

/// Capabilities for a headless Chrome node, matching the flags the
/// scraper has always run the browser with inside containers.
pub fn headless_chrome_capabilities() -> serde_json::Value {
    serde_json::json!({
        "browserName": "chrome",
        "goog:chromeOptions": {
            "args": [
                "--headless",
                "--no-sandbox",
                "--disable-dev-shm-usage",
                "--disable-gpu",
            ]
        }
    })
}
