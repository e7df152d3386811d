//! Postgres persistence for records, checkpoints, and the task queue.

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::debug;
use uuid::Uuid;

use boxdwatch_common::{Changeset, Checkpoint, ScrapeError, ScrapeTask, TaskState, WatchlistRecord};

use crate::traits::{CheckpointStore, RecordStore, TaskStore};

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self, ScrapeError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await
            .map_err(storage_err)?;
        Ok(Self::new(pool))
    }

    /// Run the embedded SQL migrations.
    pub async fn migrate(&self) -> Result<(), ScrapeError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| ScrapeError::PersistenceUnavailable(e.to_string()))?;
        Ok(())
    }
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    matches!(
        e,
        sqlx::Error::Database(db) if matches!(db.kind(), sqlx::error::ErrorKind::UniqueViolation)
    )
}

/// Constraint-class database errors are a data bug and terminal;
/// everything else is the store being unavailable.
fn storage_err(e: sqlx::Error) -> ScrapeError {
    if let sqlx::Error::Database(db) = &e {
        use sqlx::error::ErrorKind;
        if matches!(
            db.kind(),
            ErrorKind::UniqueViolation
                | ErrorKind::ForeignKeyViolation
                | ErrorKind::NotNullViolation
                | ErrorKind::CheckViolation
        ) {
            return ScrapeError::ConstraintViolation(db.to_string());
        }
    }
    ScrapeError::PersistenceUnavailable(e.to_string())
}

#[derive(sqlx::FromRow)]
struct RecordRow {
    external_id: String,
    target_user: String,
    title: String,
    slug: String,
    url: String,
    tmdb_id: Option<i64>,
    runtime_minutes: Option<i32>,
    poster_path: Option<String>,
    vote_average: Option<f64>,
    observed_at: DateTime<Utc>,
}

impl From<RecordRow> for WatchlistRecord {
    fn from(row: RecordRow) -> Self {
        WatchlistRecord {
            external_id: row.external_id,
            target_user: row.target_user,
            title: row.title,
            slug: row.slug,
            url: row.url,
            tmdb_id: row.tmdb_id,
            runtime_minutes: row.runtime_minutes,
            poster_path: row.poster_path,
            vote_average: row.vote_average,
            observed_at: row.observed_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct TaskRow {
    id: Uuid,
    target_user: String,
    state: String,
    attempt_count: i32,
    max_attempts: i32,
    last_error: Option<String>,
    resume_cursor: Option<i32>,
    scheduled_at: DateTime<Utc>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TaskRow {
    fn into_task(self) -> Result<ScrapeTask, ScrapeError> {
        let state: TaskState = self
            .state
            .parse()
            .map_err(ScrapeError::ConstraintViolation)?;
        Ok(ScrapeTask {
            id: self.id,
            target_user: self.target_user,
            state,
            attempt_count: self.attempt_count,
            max_attempts: self.max_attempts,
            last_error: self.last_error,
            resume_cursor: self.resume_cursor.map(|p| p as u32),
            scheduled_at: self.scheduled_at,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

#[async_trait]
impl RecordStore for PgStore {
    async fn live_external_ids(&self, target_user: &str) -> Result<HashSet<String>, ScrapeError> {
        let ids: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT external_id FROM watchlist_records
            WHERE target_user = $1 AND tombstoned_at IS NULL
            "#,
        )
        .bind(target_user)
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err)?;

        Ok(ids.into_iter().collect())
    }

    async fn apply(&self, changeset: &Changeset) -> Result<(), ScrapeError> {
        let mut tx = self.pool.begin().await.map_err(storage_err)?;

        for record in &changeset.added {
            sqlx::query(
                r#"
                INSERT INTO watchlist_records
                    (target_user, external_id, title, slug, url,
                     tmdb_id, runtime_minutes, poster_path, vote_average,
                     observed_at, tombstoned_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, NULL)
                ON CONFLICT (target_user, external_id) DO UPDATE SET
                    title = EXCLUDED.title,
                    slug = EXCLUDED.slug,
                    url = EXCLUDED.url,
                    tmdb_id = COALESCE(EXCLUDED.tmdb_id, watchlist_records.tmdb_id),
                    runtime_minutes = COALESCE(EXCLUDED.runtime_minutes, watchlist_records.runtime_minutes),
                    poster_path = COALESCE(EXCLUDED.poster_path, watchlist_records.poster_path),
                    vote_average = COALESCE(EXCLUDED.vote_average, watchlist_records.vote_average),
                    observed_at = EXCLUDED.observed_at,
                    tombstoned_at = NULL
                "#,
            )
            .bind(&record.target_user)
            .bind(&record.external_id)
            .bind(&record.title)
            .bind(&record.slug)
            .bind(&record.url)
            .bind(record.tmdb_id)
            .bind(record.runtime_minutes)
            .bind(&record.poster_path)
            .bind(record.vote_average)
            .bind(record.observed_at)
            .execute(&mut *tx)
            .await
            .map_err(storage_err)?;
        }

        if !changeset.removed.is_empty() {
            sqlx::query(
                r#"
                UPDATE watchlist_records
                SET tombstoned_at = now()
                WHERE target_user = $1
                  AND external_id = ANY($2)
                  AND tombstoned_at IS NULL
                "#,
            )
            .bind(&changeset.target_user)
            .bind(&changeset.removed)
            .execute(&mut *tx)
            .await
            .map_err(storage_err)?;
        }

        tx.commit().await.map_err(storage_err)?;
        debug!(
            target_user = %changeset.target_user,
            added = changeset.added.len(),
            removed = changeset.removed.len(),
            "Changeset applied"
        );
        Ok(())
    }
}

#[async_trait]
impl CheckpointStore for PgStore {
    async fn load(&self, target_user: &str) -> Result<Option<Checkpoint>, ScrapeError> {
        let row: Option<(i32, DateTime<Utc>)> = sqlx::query_as(
            r#"
            SELECT next_page, last_success_at FROM checkpoints
            WHERE target_user = $1
            "#,
        )
        .bind(target_user)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_err)?;

        Ok(row.map(|(next_page, last_success_at)| Checkpoint {
            target_user: target_user.to_string(),
            next_page: next_page.max(1) as u32,
            last_success_at,
        }))
    }

    async fn save_page(
        &self,
        target_user: &str,
        records: &[WatchlistRecord],
        next_page: u32,
    ) -> Result<(), ScrapeError> {
        let mut tx = self.pool.begin().await.map_err(storage_err)?;

        for record in records {
            // First sighting wins: a refetched page after a mid-page
            // crash must not duplicate or reorder staged records.
            sqlx::query(
                r#"
                INSERT INTO scrape_staging
                    (target_user, external_id, title, slug, url,
                     tmdb_id, runtime_minutes, poster_path, vote_average, observed_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                ON CONFLICT (target_user, external_id) DO NOTHING
                "#,
            )
            .bind(target_user)
            .bind(&record.external_id)
            .bind(&record.title)
            .bind(&record.slug)
            .bind(&record.url)
            .bind(record.tmdb_id)
            .bind(record.runtime_minutes)
            .bind(&record.poster_path)
            .bind(record.vote_average)
            .bind(record.observed_at)
            .execute(&mut *tx)
            .await
            .map_err(storage_err)?;
        }

        sqlx::query(
            r#"
            INSERT INTO checkpoints (target_user, next_page, last_success_at)
            VALUES ($1, $2, now())
            ON CONFLICT (target_user) DO UPDATE SET
                next_page = EXCLUDED.next_page,
                last_success_at = EXCLUDED.last_success_at
            "#,
        )
        .bind(target_user)
        .bind(next_page as i32)
        .execute(&mut *tx)
        .await
        .map_err(storage_err)?;

        tx.commit().await.map_err(storage_err)
    }

    async fn staged_records(&self, target_user: &str) -> Result<Vec<WatchlistRecord>, ScrapeError> {
        let rows: Vec<RecordRow> = sqlx::query_as(
            r#"
            SELECT external_id, target_user, title, slug, url,
                   tmdb_id, runtime_minutes, poster_path, vote_average, observed_at
            FROM scrape_staging
            WHERE target_user = $1
            ORDER BY id
            "#,
        )
        .bind(target_user)
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err)?;

        Ok(rows.into_iter().map(WatchlistRecord::from).collect())
    }

    async fn clear(&self, target_user: &str) -> Result<(), ScrapeError> {
        let mut tx = self.pool.begin().await.map_err(storage_err)?;

        sqlx::query("DELETE FROM scrape_staging WHERE target_user = $1")
            .bind(target_user)
            .execute(&mut *tx)
            .await
            .map_err(storage_err)?;
        sqlx::query("DELETE FROM checkpoints WHERE target_user = $1")
            .bind(target_user)
            .execute(&mut *tx)
            .await
            .map_err(storage_err)?;

        tx.commit().await.map_err(storage_err)
    }
}

#[async_trait]
impl TaskStore for PgStore {
    async fn enqueue(&self, task: &ScrapeTask) -> Result<(), ScrapeError> {
        sqlx::query(
            r#"
            INSERT INTO scrape_tasks
                (id, target_user, state, attempt_count, max_attempts,
                 last_error, resume_cursor, scheduled_at, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(task.id)
        .bind(&task.target_user)
        .bind(task.state.to_string())
        .bind(task.attempt_count)
        .bind(task.max_attempts)
        .bind(&task.last_error)
        .bind(task.resume_cursor.map(|p| p as i32))
        .bind(task.scheduled_at)
        .bind(task.created_at)
        .bind(task.updated_at)
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;
        Ok(())
    }

    async fn claim_next(&self) -> Result<Option<ScrapeTask>, ScrapeError> {
        // Single atomic statement: at most one worker wins a given
        // task, and a user with a running task is skipped entirely so
        // two workers never race on the same checkpoint. The NOT
        // EXISTS guard alone is snapshot-racy under READ COMMITTED;
        // the partial unique index on running tasks per user is what
        // actually holds the invariant, and losing that race here is
        // just an empty claim.
        let claim: Result<Option<TaskRow>, sqlx::Error> = sqlx::query_as(
            r#"
            UPDATE scrape_tasks
            SET state = 'running',
                attempt_count = attempt_count + 1,
                updated_at = now()
            WHERE id = (
                SELECT t.id FROM scrape_tasks t
                WHERE t.state = 'queued'
                  AND t.scheduled_at <= now()
                  AND NOT EXISTS (
                      SELECT 1 FROM scrape_tasks r
                      WHERE r.target_user = t.target_user
                        AND r.state = 'running'
                  )
                ORDER BY t.scheduled_at
                FOR UPDATE SKIP LOCKED
                LIMIT 1
            )
            RETURNING id, target_user, state, attempt_count, max_attempts,
                      last_error, resume_cursor, scheduled_at, created_at, updated_at
            "#,
        )
        .fetch_optional(&self.pool)
        .await;

        match claim {
            Ok(row) => row.map(TaskRow::into_task).transpose(),
            Err(e) if is_unique_violation(&e) => Ok(None),
            Err(e) => Err(storage_err(e)),
        }
    }

    async fn record_outcome(
        &self,
        task_id: Uuid,
        state: TaskState,
        last_error: Option<&str>,
        scheduled_at: DateTime<Utc>,
    ) -> Result<(), ScrapeError> {
        sqlx::query(
            r#"
            UPDATE scrape_tasks
            SET state = $2, last_error = $3, scheduled_at = $4, updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(task_id)
        .bind(state.to_string())
        .bind(last_error)
        .bind(scheduled_at)
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;
        Ok(())
    }

    async fn requeue_due_retries(&self) -> Result<u64, ScrapeError> {
        let result = sqlx::query(
            r#"
            UPDATE scrape_tasks
            SET state = 'queued', updated_at = now()
            WHERE state = 'retrying' AND scheduled_at <= now()
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;
        Ok(result.rows_affected())
    }

    async fn recover_stale_running(&self, lease: chrono::Duration) -> Result<u64, ScrapeError> {
        let lease_secs = lease.num_seconds() as f64;
        let mut tx = self.pool.begin().await.map_err(storage_err)?;

        // A task with no attempts left would only be reclaimed to die
        // the same way; fail it with a diagnosable error instead.
        sqlx::query(
            r#"
            UPDATE scrape_tasks
            SET state = 'failed', last_error = 'worker lease expired', updated_at = now()
            WHERE state = 'running'
              AND updated_at < now() - make_interval(secs => $1)
              AND attempt_count >= max_attempts
            "#,
        )
        .bind(lease_secs)
        .execute(&mut *tx)
        .await
        .map_err(storage_err)?;

        let result = sqlx::query(
            r#"
            UPDATE scrape_tasks
            SET state = 'queued', updated_at = now()
            WHERE state = 'running'
              AND updated_at < now() - make_interval(secs => $1)
              AND attempt_count < max_attempts
            "#,
        )
        .bind(lease_secs)
        .execute(&mut *tx)
        .await
        .map_err(storage_err)?;

        tx.commit().await.map_err(storage_err)?;
        Ok(result.rows_affected())
    }

    async fn get(&self, task_id: Uuid) -> Result<Option<ScrapeTask>, ScrapeError> {
        let row: Option<TaskRow> = sqlx::query_as(
            r#"
            SELECT id, target_user, state, attempt_count, max_attempts,
                   last_error, resume_cursor, scheduled_at, created_at, updated_at
            FROM scrape_tasks
            WHERE id = $1
            "#,
        )
        .bind(task_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_err)?;

        row.map(TaskRow::into_task).transpose()
    }
}
