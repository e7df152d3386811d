//! PageFetcher backed by a leased grid session.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use boxdwatch_common::ScrapeError;
use webgrid_client::{GridError, WebGridClient};

use crate::traits::PageFetcher;

/// How often the readiness wait re-polls the DOM.
const STABILITY_POLL: Duration = Duration::from_millis(500);

pub struct GridPageFetcher {
    grid: Arc<WebGridClient>,
    session_id: String,
    base_url: String,
    ready_timeout: Duration,
}

impl GridPageFetcher {
    pub fn new(
        grid: Arc<WebGridClient>,
        session_id: &str,
        base_url: &str,
        ready_timeout: Duration,
    ) -> Self {
        Self {
            grid,
            session_id: session_id.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
            ready_timeout,
        }
    }

    /// Navigate and wait for the DOM to stabilize: two consecutive
    /// polls returning the same length count as settled. Bounded by
    /// `ready_timeout`; a page that never settles is `PageTimeout`.
    async fn settled_source(&self, url: &str) -> Result<String, ScrapeError> {
        self.grid
            .navigate(&self.session_id, url)
            .await
            .map_err(grid_err)?;

        let deadline = tokio::time::Instant::now() + self.ready_timeout;
        let mut previous_len: Option<usize> = None;

        loop {
            tokio::time::sleep(STABILITY_POLL).await;
            let source = self
                .grid
                .page_source(&self.session_id)
                .await
                .map_err(grid_err)?;

            if previous_len == Some(source.len()) {
                debug!(url, bytes = source.len(), "Page settled");
                return Ok(source);
            }
            previous_len = Some(source.len());

            if tokio::time::Instant::now() >= deadline {
                return Err(ScrapeError::PageTimeout(url.to_string()));
            }
        }
    }
}

#[async_trait]
impl PageFetcher for GridPageFetcher {
    async fn watchlist_page(&self, target_user: &str, page: u32) -> Result<String, ScrapeError> {
        let url = if page <= 1 {
            format!("{}/{}/watchlist/", self.base_url, target_user)
        } else {
            format!("{}/{}/watchlist/page/{}/", self.base_url, target_user, page)
        };
        self.settled_source(&url).await
    }

    async fn film_page(&self, slug: &str) -> Result<String, ScrapeError> {
        let url = format!("{}/film/{}/", self.base_url, slug);
        self.settled_source(&url).await
    }
}

fn grid_err(e: GridError) -> ScrapeError {
    ScrapeError::GridUnreachable(e.to_string())
}
