// Trait abstractions for the pipeline's external dependencies.
//
// PageFetcher — a live browser session positioned on the source site.
// RecordStore / CheckpointStore / TaskStore — persistence seams.
//
// These enable deterministic testing with the fakes in `testing`:
// no grid, no network, no database.

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use boxdwatch_common::{Changeset, Checkpoint, ScrapeError, ScrapeTask, TaskState, WatchlistRecord};
use webgrid_client::GridError;

use crate::pool::BrowserSession;

/// Session-level grid operations the pool needs. Production is the
/// WebDriver client; tests use an in-memory fake.
#[async_trait]
pub trait GridSessions: Send + Sync {
    /// Create a fresh browser session on the grid.
    async fn open_session(&self) -> Result<BrowserSession, GridError>;

    /// Tear a session down on the grid.
    async fn close_session(&self, session_id: &str) -> Result<(), GridError>;

    /// Cheap liveness probe against a session.
    async fn is_alive(&self, session_id: &str) -> bool;
}

/// A source of rendered page snapshots for one target user's watchlist.
///
/// Implementations own the navigation and readiness-wait; callers only
/// ever see a settled DOM string.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    /// Rendered DOM of watchlist page `page` (1-based).
    async fn watchlist_page(&self, target_user: &str, page: u32) -> Result<String, ScrapeError>;

    /// Rendered DOM of a film detail page, used for enrichment lookups.
    async fn film_page(&self, slug: &str) -> Result<String, ScrapeError>;
}

/// Durable watchlist record storage with idempotent changeset application.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// External ids currently visible (non-tombstoned) for a user.
    async fn live_external_ids(&self, target_user: &str) -> Result<HashSet<String>, ScrapeError>;

    /// Apply a changeset atomically: upsert `added`, tombstone
    /// `removed`. Partial application is never observable.
    async fn apply(&self, changeset: &Changeset) -> Result<(), ScrapeError>;
}

/// Pagination progress plus the per-page record staging area.
///
/// `save_page` persists a page's records together with the advanced
/// cursor in one step, so a crash between pages loses at most the
/// page that was in flight. Staged records accumulate across resumed
/// attempts and are drained by `clear` once a changeset commits.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn load(&self, target_user: &str) -> Result<Option<Checkpoint>, ScrapeError>;

    /// Stage one page of records and move the cursor to `next_page`.
    async fn save_page(
        &self,
        target_user: &str,
        records: &[WatchlistRecord],
        next_page: u32,
    ) -> Result<(), ScrapeError>;

    /// All staged records for a user, in first-observed order.
    async fn staged_records(&self, target_user: &str) -> Result<Vec<WatchlistRecord>, ScrapeError>;

    /// Drop checkpoint and staged records. Called after a changeset
    /// commits, or before a from-scratch attempt.
    async fn clear(&self, target_user: &str) -> Result<(), ScrapeError>;
}

/// Task queue operations. Claiming must be atomic: concurrent workers
/// claiming the same queued task see exactly one winner.
#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn enqueue(&self, task: &ScrapeTask) -> Result<(), ScrapeError>;

    /// Claim the next due queued task, skipping users that already
    /// have a running task. Increments `attempt_count` and flips the
    /// state to `Running` in the same atomic step.
    async fn claim_next(&self) -> Result<Option<ScrapeTask>, ScrapeError>;

    /// Record a worker-reported outcome. `scheduled_at` carries the
    /// backoff-delayed eligibility time for `Retrying`.
    async fn record_outcome(
        &self,
        task_id: Uuid,
        state: TaskState,
        last_error: Option<&str>,
        scheduled_at: DateTime<Utc>,
    ) -> Result<(), ScrapeError>;

    /// Promote `Retrying` tasks whose backoff has elapsed back to `Queued`.
    async fn requeue_due_retries(&self) -> Result<u64, ScrapeError>;

    /// Requeue `Running` tasks not touched within `lease` — their
    /// worker died mid-task. The checkpoint makes the rerun resume.
    /// Tasks already at their attempt ceiling fail terminally instead
    /// of being requeued. Returns the requeued count.
    async fn recover_stale_running(&self, lease: chrono::Duration) -> Result<u64, ScrapeError>;

    async fn get(&self, task_id: Uuid) -> Result<Option<ScrapeTask>, ScrapeError>;
}
