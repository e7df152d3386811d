//! Worker: claims tasks and runs one scrape end to end.
//!
//! `execute_task` is the whole pipeline for one attempt — paginate,
//! diff against the store, enrich, commit — over trait objects so the
//! tests drive it with fakes. `Worker` wraps it with the production
//! concerns: the claim loop, session leasing, and outcome reporting.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use boxdwatch_common::{Changeset, ScrapeError, ScrapeTask};
use webgrid_client::WebGridClient;

use crate::diff::diff;
use crate::extract::extract_tmdb_id;
use crate::fetch::GridPageFetcher;
use crate::paginate::{PaginationConfig, PaginationDriver};
use crate::pool::SessionPool;
use crate::scheduler::Scheduler;
use crate::tmdb::TmdbClient;
use crate::traits::{CheckpointStore, PageFetcher, RecordStore, TaskStore};

/// Run one scrape attempt for a claimed task.
///
/// A first attempt without an explicit resume cursor starts from
/// scratch, discarding any checkpoint a previous task left behind.
/// Retry attempts keep it and resume. After the changeset commits the
/// checkpoint and staging are drained, so the next task for this user
/// walks the full list again.
pub async fn execute_task<F, C, R>(
    task: &ScrapeTask,
    fetcher: &F,
    checkpoints: &C,
    records: &R,
    pagination: PaginationConfig,
    enricher: Option<&TmdbClient>,
    cancel: &watch::Receiver<bool>,
) -> Result<Changeset, ScrapeError>
where
    F: PageFetcher,
    C: CheckpointStore,
    R: RecordStore,
{
    let user = task.target_user.as_str();

    if task.attempt_count <= 1 && task.resume_cursor.is_none() {
        checkpoints.clear(user).await?;
    }

    let driver = PaginationDriver::new(fetcher, checkpoints, pagination);
    driver.scrape(user, task.resume_cursor, cancel).await?;

    let observed = checkpoints.staged_records(user).await?;
    let existing = records.live_external_ids(user).await?;
    let mut changeset = diff(user, &observed, &existing);

    enrich(&mut changeset, fetcher, enricher).await;

    records.apply(&changeset).await?;
    checkpoints.clear(user).await?;

    info!(
        target_user = user,
        observed = observed.len(),
        added = changeset.added.len(),
        removed = changeset.removed.len(),
        "Changeset committed"
    );
    Ok(changeset)
}

/// Best-effort metadata enrichment of the added records. Any failure
/// here degrades to an unenriched record; the scrape still commits.
async fn enrich<F: PageFetcher>(
    changeset: &mut Changeset,
    fetcher: &F,
    enricher: Option<&TmdbClient>,
) {
    for record in &mut changeset.added {
        if record.tmdb_id.is_none() {
            match fetcher.film_page(&record.slug).await {
                Ok(html) => match extract_tmdb_id(&html) {
                    Ok(id) => record.tmdb_id = Some(id),
                    Err(e) => debug!(slug = %record.slug, error = %e, "No TMDB id on film page"),
                },
                Err(e) => {
                    debug!(slug = %record.slug, error = %e, "Film page fetch failed, skipping enrichment")
                }
            }
        }

        if let (Some(client), Some(tmdb_id)) = (enricher, record.tmdb_id) {
            match client.movie(tmdb_id).await {
                Ok(details) => {
                    record.runtime_minutes = details.runtime;
                    record.poster_path = details.poster_path;
                    record.vote_average = details.vote_average;
                }
                Err(e) => debug!(tmdb_id, error = %e, "TMDB lookup failed, record stays unenriched"),
            }
        }
    }
}

/// Production worker loop over the shared store and session pool.
pub struct Worker<S>
where
    S: TaskStore + RecordStore + CheckpointStore + 'static,
{
    pub worker_id: usize,
    pub grid: Arc<WebGridClient>,
    pub pool: Arc<SessionPool>,
    pub store: Arc<S>,
    pub scheduler: Arc<Scheduler<S>>,
    pub enricher: Option<Arc<TmdbClient>>,
    pub source_base_url: String,
    pub pagination: PaginationConfig,
    pub acquire_timeout: Duration,
    pub page_ready_timeout: Duration,
    pub claim_poll: Duration,
}

impl<S> Worker<S>
where
    S: TaskStore + RecordStore + CheckpointStore + 'static,
{
    /// Claim-and-run until cancelled. Claim errors and empty polls
    /// both back off by the claim interval.
    pub async fn run(&self, mut cancel: watch::Receiver<bool>) {
        info!(worker_id = self.worker_id, "Worker started");
        loop {
            if *cancel.borrow() {
                break;
            }

            match self.store.claim_next().await {
                Ok(Some(task)) => self.process(task, &cancel).await,
                Ok(None) => {
                    if self.idle_wait(&mut cancel).await {
                        break;
                    }
                }
                Err(e) => {
                    warn!(worker_id = self.worker_id, error = %e, "Claim failed");
                    if self.idle_wait(&mut cancel).await {
                        break;
                    }
                }
            }
        }
        info!(worker_id = self.worker_id, "Worker stopped");
    }

    async fn process(&self, task: ScrapeTask, cancel: &watch::Receiver<bool>) {
        info!(
            worker_id = self.worker_id,
            task_id = %task.id,
            target_user = %task.target_user,
            attempt = task.attempt_count,
            "Processing task"
        );

        let leased = match self.pool.acquire(self.acquire_timeout).await {
            Ok(leased) => leased,
            Err(e) => {
                self.report_failure(&task, &e).await;
                return;
            }
        };

        let fetcher = GridPageFetcher::new(
            self.grid.clone(),
            &leased.session.id,
            &self.source_base_url,
            self.page_ready_timeout,
        );

        let outcome = execute_task(
            &task,
            &fetcher,
            self.store.as_ref(),
            self.store.as_ref(),
            self.pagination.clone(),
            self.enricher.as_deref(),
            cancel,
        )
        .await;

        match outcome {
            Ok(_) => {
                self.pool.release(leased, true).await;
                if let Err(e) = self.scheduler.report_success(&task).await {
                    warn!(task_id = %task.id, error = %e, "Failed to record success");
                }
            }
            Err(err) => {
                // A dead grid or a hung page taints the session; every
                // other failure leaves the browser reusable.
                let session_healthy = !matches!(
                    err,
                    ScrapeError::GridUnreachable(_) | ScrapeError::PageTimeout(_)
                );
                self.pool.release(leased, session_healthy).await;
                self.report_failure(&task, &err).await;
            }
        }
    }

    async fn report_failure(&self, task: &ScrapeTask, err: &ScrapeError) {
        if let Err(e) = self.scheduler.report_failure(task, err).await {
            warn!(task_id = %task.id, error = %e, "Failed to record failure");
        }
    }

    /// Sleep one claim interval, waking early on cancellation.
    /// Returns true when the worker should stop.
    async fn idle_wait(&self, cancel: &mut watch::Receiver<bool>) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(self.claim_poll) => false,
            changed = cancel.changed() => changed.is_err() || *cancel.borrow(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{
        film_html, watchlist_html, FakeCheckpointStore, FakePageFetcher, FakeRecordStore,
    };
    use boxdwatch_common::TaskState;

    fn no_cancel() -> watch::Receiver<bool> {
        let (_tx, rx) = watch::channel(false);
        rx
    }

    fn claimed(target_user: &str, attempt: i32, resume_cursor: Option<u32>) -> ScrapeTask {
        let mut task = ScrapeTask::new(target_user, 4, resume_cursor);
        task.state = TaskState::Running;
        task.attempt_count = attempt;
        task
    }

    #[tokio::test]
    async fn fresh_task_discards_stale_checkpoint() {
        let checkpoints = FakeCheckpointStore::new();
        // Leftover from an earlier, abandoned task.
        checkpoints
            .save_page("user", &[crate::testing::record("STALE", "user")], 5)
            .await
            .unwrap();

        let fetcher =
            FakePageFetcher::new().on_watchlist_page(1, watchlist_html(&[("A", "a")], 1, 1));
        let records = FakeRecordStore::new();

        let task = claimed("user", 1, None);
        let changeset = execute_task(
            &task,
            &fetcher,
            &checkpoints,
            &records,
            PaginationConfig::default(),
            None,
            &no_cancel(),
        )
        .await
        .unwrap();

        let ids: Vec<&str> = changeset.added.iter().map(|r| r.external_id.as_str()).collect();
        assert_eq!(ids, vec!["A"], "stale staging must not leak into the diff");
        assert_eq!(fetcher.watchlist_fetches(1), 1, "walk restarts from page 1");
    }

    #[tokio::test]
    async fn retry_attempt_resumes_and_sees_the_full_staged_set() {
        let checkpoints = FakeCheckpointStore::new();
        checkpoints
            .save_page("user", &[crate::testing::record("A", "user")], 2)
            .await
            .unwrap();

        let fetcher =
            FakePageFetcher::new().on_watchlist_page(2, watchlist_html(&[("B", "b")], 2, 2));
        let records = FakeRecordStore::new();

        let task = claimed("user", 2, None);
        let changeset = execute_task(
            &task,
            &fetcher,
            &checkpoints,
            &records,
            PaginationConfig::default(),
            None,
            &no_cancel(),
        )
        .await
        .unwrap();

        let ids: Vec<&str> = changeset.added.iter().map(|r| r.external_id.as_str()).collect();
        assert_eq!(ids, vec!["A", "B"]);
        assert_eq!(fetcher.watchlist_fetches(1), 0);
    }

    #[tokio::test]
    async fn enrichment_failure_never_blocks_the_commit() {
        // Film page registered for one record only; the other degrades.
        let fetcher = FakePageFetcher::new()
            .on_watchlist_page(1, watchlist_html(&[("A", "alpha"), ("B", "beta")], 1, 1))
            .on_film_page("alpha", film_html(603));
        let checkpoints = FakeCheckpointStore::new();
        let records = FakeRecordStore::new();

        let task = claimed("user", 1, None);
        let changeset = execute_task(
            &task,
            &fetcher,
            &checkpoints,
            &records,
            PaginationConfig::default(),
            None,
            &no_cancel(),
        )
        .await
        .unwrap();

        assert_eq!(changeset.added[0].tmdb_id, Some(603));
        assert_eq!(changeset.added[1].tmdb_id, None);
        assert_eq!(records.apply_count(), 1);
    }

    #[tokio::test]
    async fn committed_run_drains_checkpoint_and_staging() {
        let fetcher =
            FakePageFetcher::new().on_watchlist_page(1, watchlist_html(&[("A", "a")], 1, 1));
        let checkpoints = FakeCheckpointStore::new();
        let records = FakeRecordStore::new();

        let task = claimed("user", 1, None);
        execute_task(
            &task,
            &fetcher,
            &checkpoints,
            &records,
            PaginationConfig::default(),
            None,
            &no_cancel(),
        )
        .await
        .unwrap();

        assert!(checkpoints.load("user").await.unwrap().is_none());
        assert!(checkpoints.staged_records("user").await.unwrap().is_empty());
        assert_eq!(records.live_ids("user"), vec!["A"]);
    }

    #[tokio::test]
    async fn failed_apply_keeps_checkpoint_for_the_retry() {
        let fetcher =
            FakePageFetcher::new().on_watchlist_page(1, watchlist_html(&[("A", "a")], 1, 1));
        let checkpoints = FakeCheckpointStore::new();
        let records = FakeRecordStore::new();
        records.fail_next_apply(ScrapeError::PersistenceUnavailable("db down".into()));

        let task = claimed("user", 1, None);
        let err = execute_task(
            &task,
            &fetcher,
            &checkpoints,
            &records,
            PaginationConfig::default(),
            None,
            &no_cancel(),
        )
        .await
        .unwrap_err();

        assert!(err.is_retriable());
        assert!(checkpoints.load("user").await.unwrap().is_some());
        assert!(records.live_ids("user").is_empty());
    }
}
