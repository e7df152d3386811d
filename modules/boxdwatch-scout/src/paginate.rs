//! Drives extraction across successive watchlist pages.
//!
//! The driver owns the page-walk policy: resume point, the checkpoint
//! write after every good page, the bounded empty-page retry, and the
//! cancellation check between pages. All retry policy beyond the
//! empty-page bound lives in the scheduler, not here.

use tokio::sync::watch;
use tracing::{debug, info, warn};

use boxdwatch_common::ScrapeError;

use crate::extract::extract;
use crate::traits::{CheckpointStore, PageFetcher};

#[derive(Debug, Clone)]
pub struct PaginationConfig {
    /// Hard ceiling on pages walked in one attempt.
    pub max_pages: u32,
    /// How often an empty page is refetched before the end-of-list
    /// sentinel is trusted. Guards against transient empty renders
    /// being mistaken for exhaustion.
    pub empty_page_retries: u32,
}

impl Default for PaginationConfig {
    fn default() -> Self {
        Self {
            max_pages: 128,
            empty_page_retries: 2,
        }
    }
}

pub struct PaginationDriver<'a, F: PageFetcher, C: CheckpointStore> {
    fetcher: &'a F,
    checkpoints: &'a C,
    config: PaginationConfig,
}

impl<'a, F: PageFetcher, C: CheckpointStore> PaginationDriver<'a, F, C> {
    pub fn new(fetcher: &'a F, checkpoints: &'a C, config: PaginationConfig) -> Self {
        Self {
            fetcher,
            checkpoints,
            config,
        }
    }

    /// Walk the watchlist from the resume point, staging each page's
    /// records with the checkpoint store before moving on. Returns the
    /// number of records staged by this attempt.
    ///
    /// The checkpoint is written before a page's records count as
    /// progress, so a crash between pages costs at most one page. A
    /// cancellation surfaces as `Cancelled` (retriable) with the
    /// checkpoint intact.
    pub async fn scrape(
        &self,
        target_user: &str,
        resume_cursor: Option<u32>,
        cancel: &watch::Receiver<bool>,
    ) -> Result<usize, ScrapeError> {
        let start = match resume_cursor {
            Some(page) => page,
            None => self
                .checkpoints
                .load(target_user)
                .await?
                .map(|c| c.next_page)
                .unwrap_or(1),
        };

        if start > 1 {
            info!(target_user, start, "Resuming pagination from checkpoint");
        }

        let mut staged = 0usize;
        let mut page = start.max(1);
        let mut empty_retries_left = self.config.empty_page_retries;

        while page <= self.config.max_pages {
            if *cancel.borrow() {
                info!(target_user, page, "Cancellation requested between pages");
                return Err(ScrapeError::Cancelled);
            }

            let html = self.fetcher.watchlist_page(target_user, page).await?;
            let extracted = extract(&html, target_user, page)?;

            if extracted.records.is_empty() {
                if empty_retries_left > 0 {
                    empty_retries_left -= 1;
                    warn!(target_user, page, "Empty page, retrying before trusting end-of-list");
                    continue;
                }
                debug!(target_user, page, "Empty page confirmed as end of list");
                break;
            }
            empty_retries_left = self.config.empty_page_retries;

            let count = extracted.records.len();
            self.checkpoints
                .save_page(target_user, &extracted.records, page + 1)
                .await?;
            staged += count;
            debug!(target_user, page, records = count, "Page staged");

            if extracted.end_of_list {
                break;
            }
            page += 1;
        }

        info!(target_user, staged, "Pagination complete");
        Ok(staged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{record, watchlist_html, FakeCheckpointStore, FakePageFetcher};

    fn no_cancel() -> watch::Receiver<bool> {
        // borrow() keeps returning the last value after the sender drops.
        let (_tx, rx) = watch::channel(false);
        rx
    }

    fn config(max_pages: u32, empty_page_retries: u32) -> PaginationConfig {
        PaginationConfig {
            max_pages,
            empty_page_retries,
        }
    }

    #[tokio::test]
    async fn walks_all_pages_and_checkpoints_each() {
        let fetcher = FakePageFetcher::new()
            .on_watchlist_page(1, watchlist_html(&[("A", "a"), ("B", "b")], 1, 2))
            .on_watchlist_page(2, watchlist_html(&[("C", "c")], 2, 2));
        let checkpoints = FakeCheckpointStore::new();
        let driver = PaginationDriver::new(&fetcher, &checkpoints, config(10, 2));

        let staged = driver.scrape("user", None, &no_cancel()).await.unwrap();

        assert_eq!(staged, 3);
        let staged_records = checkpoints.staged_records("user").await.unwrap();
        let ids: Vec<&str> = staged_records.iter().map(|r| r.external_id.as_str()).collect();
        assert_eq!(ids, vec!["A", "B", "C"]);

        let checkpoint = checkpoints.load("user").await.unwrap().unwrap();
        assert_eq!(checkpoint.next_page, 3);
    }

    #[tokio::test]
    async fn resumes_from_checkpoint_without_refetching() {
        let fetcher = FakePageFetcher::new()
            .on_watchlist_page(2, watchlist_html(&[("C", "c")], 2, 2));
        let checkpoints = FakeCheckpointStore::new();
        checkpoints
            .save_page("user", &[record("A", "user"), record("B", "user")], 2)
            .await
            .unwrap();
        let driver = PaginationDriver::new(&fetcher, &checkpoints, config(10, 2));

        let staged = driver.scrape("user", None, &no_cancel()).await.unwrap();

        assert_eq!(staged, 1, "only the unfetched page should be staged");
        assert_eq!(fetcher.watchlist_fetches(1), 0, "page 1 must not be refetched");
        assert_eq!(fetcher.watchlist_fetches(2), 1);

        let all = checkpoints.staged_records("user").await.unwrap();
        assert_eq!(all.len(), 3, "earlier staged pages survive the resume");
    }

    #[tokio::test]
    async fn explicit_resume_cursor_wins_over_checkpoint() {
        let fetcher = FakePageFetcher::new()
            .on_watchlist_page(3, watchlist_html(&[("D", "d")], 3, 3));
        let checkpoints = FakeCheckpointStore::new();
        checkpoints.save_page("user", &[record("A", "user")], 2).await.unwrap();
        let driver = PaginationDriver::new(&fetcher, &checkpoints, config(10, 2));

        driver.scrape("user", Some(3), &no_cancel()).await.unwrap();
        assert_eq!(fetcher.watchlist_fetches(2), 0);
        assert_eq!(fetcher.watchlist_fetches(3), 1);
    }

    #[tokio::test]
    async fn empty_page_is_retried_then_trusted_as_end() {
        let empty = watchlist_html(&[], 2, 2);
        let fetcher = FakePageFetcher::new()
            .on_watchlist_page(1, watchlist_html(&[("A", "a")], 1, 5))
            .on_watchlist_page_sequence(2, vec![empty.clone(), empty.clone(), empty]);
        let checkpoints = FakeCheckpointStore::new();
        let driver = PaginationDriver::new(&fetcher, &checkpoints, config(10, 2));

        let staged = driver.scrape("user", None, &no_cancel()).await.unwrap();

        assert_eq!(staged, 1);
        assert_eq!(fetcher.watchlist_fetches(2), 3, "initial fetch plus two retries");
        // Checkpoint still points past page 1 only; the empty page never staged.
        assert_eq!(checkpoints.load("user").await.unwrap().unwrap().next_page, 2);
    }

    #[tokio::test]
    async fn transient_empty_page_recovers_on_retry() {
        let fetcher = FakePageFetcher::new()
            .on_watchlist_page(1, watchlist_html(&[("A", "a")], 1, 2))
            .on_watchlist_page_sequence(
                2,
                vec![
                    watchlist_html(&[], 2, 2),
                    watchlist_html(&[("B", "b")], 2, 2),
                ],
            );
        let checkpoints = FakeCheckpointStore::new();
        let driver = PaginationDriver::new(&fetcher, &checkpoints, config(10, 2));

        let staged = driver.scrape("user", None, &no_cancel()).await.unwrap();
        assert_eq!(staged, 2);
    }

    #[tokio::test]
    async fn markup_mismatch_propagates_and_keeps_checkpoint() {
        let fetcher = FakePageFetcher::new()
            .on_watchlist_page(1, watchlist_html(&[("A", "a")], 1, 3))
            .on_watchlist_page(2, "<html><body>redesigned</body></html>".to_string());
        let checkpoints = FakeCheckpointStore::new();
        let driver = PaginationDriver::new(&fetcher, &checkpoints, config(10, 2));

        let err = driver.scrape("user", None, &no_cancel()).await.unwrap_err();
        assert!(matches!(err, ScrapeError::MarkupMismatch(_)));

        // Page 1 progress survives for the (human-fixed) rerun.
        assert_eq!(checkpoints.load("user").await.unwrap().unwrap().next_page, 2);
        assert_eq!(checkpoints.staged_records("user").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn cancellation_stops_before_the_next_fetch() {
        let fetcher = FakePageFetcher::new()
            .on_watchlist_page(1, watchlist_html(&[("A", "a")], 1, 2));
        let checkpoints = FakeCheckpointStore::new();
        let driver = PaginationDriver::new(&fetcher, &checkpoints, config(10, 2));

        let (tx, rx) = watch::channel(true);
        let err = driver.scrape("user", None, &rx).await.unwrap_err();
        drop(tx);

        assert!(matches!(err, ScrapeError::Cancelled));
        assert!(err.is_retriable());
        assert_eq!(fetcher.watchlist_fetches(1), 0);
    }

    #[tokio::test]
    async fn max_pages_bounds_the_walk() {
        let fetcher = FakePageFetcher::new()
            .on_watchlist_page(1, watchlist_html(&[("A", "a")], 1, 99))
            .on_watchlist_page(2, watchlist_html(&[("B", "b")], 2, 99))
            .on_watchlist_page(3, watchlist_html(&[("C", "c")], 3, 99));
        let checkpoints = FakeCheckpointStore::new();
        let driver = PaginationDriver::new(&fetcher, &checkpoints, config(3, 2));

        let staged = driver.scrape("user", None, &no_cancel()).await.unwrap();
        assert_eq!(staged, 3);
        assert_eq!(fetcher.watchlist_fetches(4), 0);
    }
}
