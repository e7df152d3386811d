//! TMDB metadata enrichment.
//!
//! Additive metadata only — a failed lookup degrades to an unenriched
//! record, it never fails the pipeline. Calls are spaced by a minimum
//! interval to stay inside the API's rate limit.

use std::time::Duration;

use anyhow::{bail, Result};
use serde::Deserialize;
use tokio::sync::Mutex;
use tokio::time::Instant;

const BASE_URL: &str = "https://api.themoviedb.org/3";

/// Minimum spacing between requests (the API allows ~40 calls / 2s;
/// one call per 50ms sits safely under that).
const MIN_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Deserialize)]
pub struct MovieDetails {
    pub runtime: Option<i32>,
    pub poster_path: Option<String>,
    pub vote_average: Option<f64>,
}

pub struct TmdbClient {
    client: reqwest::Client,
    access_token: String,
    last_call: Mutex<Option<Instant>>,
}

impl TmdbClient {
    pub fn new(access_token: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            access_token: access_token.to_string(),
            last_call: Mutex::new(None),
        }
    }

    /// Fetch details for a movie by TMDB id.
    pub async fn movie(&self, tmdb_id: i64) -> Result<MovieDetails> {
        self.throttle().await;

        let url = format!("{BASE_URL}/movie/{tmdb_id}?language=en-US");
        let resp = self
            .client
            .get(&url)
            .bearer_auth(&self.access_token)
            .header("accept", "application/json")
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            bail!("TMDB request for {tmdb_id} failed with {status}: {body}");
        }

        Ok(resp.json().await?)
    }

    async fn throttle(&self) {
        let mut last = self.last_call.lock().await;
        if let Some(previous) = *last {
            let elapsed = previous.elapsed();
            if elapsed < MIN_INTERVAL {
                tokio::time::sleep(MIN_INTERVAL - elapsed).await;
            }
        }
        *last = Some(Instant::now());
    }
}
