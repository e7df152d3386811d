//! Task lifecycle orchestration.
//!
//! The scheduler is the only place retry policy lives. Workers report
//! raw outcomes; classification into `Succeeded`/`Retrying`/`Failed`
//! and the backoff arithmetic happen here, against the task store.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use tokio::sync::watch;
use tracing::{error, info, warn};

use boxdwatch_common::{ScrapeError, ScrapeTask, TaskState};

use crate::traits::TaskStore;

/// Exponential backoff with jitter, capped at a ceiling so a fleet of
/// retrying tasks never synchronizes into a thundering herd against
/// the shared grid.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub cap: Duration,
}

impl BackoffPolicy {
    /// Deterministic part: base * 2^(attempt-1), capped.
    pub fn base_delay(&self, attempt: i32) -> Duration {
        let exp = attempt.saturating_sub(1).clamp(0, 16) as u32;
        self.base
            .saturating_mul(2u32.saturating_pow(exp))
            .min(self.cap)
    }

    /// Backoff for the given attempt with up to 50% uniform jitter,
    /// never exceeding the cap.
    pub fn delay(&self, attempt: i32) -> Duration {
        let base = self.base_delay(attempt);
        let jitter_ms = if base.as_millis() == 0 {
            0
        } else {
            rand::rng().random_range(0..=(base.as_millis() / 2) as u64)
        };
        (base + Duration::from_millis(jitter_ms)).min(self.cap)
    }
}

pub struct Scheduler<T: TaskStore> {
    store: Arc<T>,
    backoff: BackoffPolicy,
}

impl<T: TaskStore> Scheduler<T> {
    pub fn new(store: Arc<T>, backoff: BackoffPolicy) -> Self {
        Self { store, backoff }
    }

    /// Create and queue a scrape task for a target user.
    pub async fn enqueue(
        &self,
        target_user: &str,
        max_attempts: i32,
        resume_cursor: Option<u32>,
    ) -> Result<ScrapeTask, ScrapeError> {
        let task = ScrapeTask::new(target_user, max_attempts, resume_cursor);
        self.store.enqueue(&task).await?;
        info!(task_id = %task.id, target_user, "Task enqueued");
        Ok(task)
    }

    /// Where a failed running task goes next. Non-retriable errors and
    /// exhausted attempts are terminal; everything else backs off.
    ///
    /// Cancellation is exempt from the attempt ceiling: it wastes no
    /// work (the checkpoint makes the rerun resume), so a task
    /// cancelled on its last attempt still comes back as `Retrying`.
    pub fn next_state(task: &ScrapeTask, err: &ScrapeError) -> TaskState {
        if matches!(err, ScrapeError::Cancelled) {
            return TaskState::Retrying;
        }
        if !err.is_retriable() || task.attempt_count >= task.max_attempts {
            TaskState::Failed
        } else {
            TaskState::Retrying
        }
    }

    pub async fn report_success(&self, task: &ScrapeTask) -> Result<(), ScrapeError> {
        self.store
            .record_outcome(task.id, TaskState::Succeeded, None, Utc::now())
            .await?;
        info!(task_id = %task.id, target_user = %task.target_user, "Task succeeded");
        Ok(())
    }

    /// Record a failure, scheduling the retry when one is due. Returns
    /// the state the task landed in.
    pub async fn report_failure(
        &self,
        task: &ScrapeTask,
        err: &ScrapeError,
    ) -> Result<TaskState, ScrapeError> {
        let state = Self::next_state(task, err);
        let rendered = err.to_string();

        let scheduled_at = match state {
            // A cancelled task failed through no fault of its own;
            // it may be reclaimed as soon as a worker is back.
            TaskState::Retrying if matches!(err, ScrapeError::Cancelled) => {
                info!(
                    task_id = %task.id,
                    target_user = %task.target_user,
                    "Task cancelled, eligible for immediate reclaim"
                );
                Utc::now()
            }
            TaskState::Retrying => {
                let delay = self.backoff.delay(task.attempt_count);
                warn!(
                    task_id = %task.id,
                    target_user = %task.target_user,
                    attempt = task.attempt_count,
                    delay_secs = delay.as_secs(),
                    error = %rendered,
                    "Task failed, retry scheduled"
                );
                Utc::now() + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::zero())
            }
            _ => {
                error!(
                    task_id = %task.id,
                    target_user = %task.target_user,
                    attempt = task.attempt_count,
                    error = %rendered,
                    "Task failed terminally"
                );
                Utc::now()
            }
        };

        self.store
            .record_outcome(task.id, state, Some(&rendered), scheduled_at)
            .await?;
        Ok(state)
    }

    /// Background maintenance: promote due retries back to the queue
    /// and requeue running tasks whose worker disappeared.
    pub async fn run_maintenance(
        &self,
        interval: Duration,
        lease: chrono::Duration,
        mut cancel: watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                changed = cancel.changed() => {
                    // A closed channel means the process is tearing down.
                    if changed.is_err() || *cancel.borrow() {
                        info!("Scheduler maintenance stopping");
                        return;
                    }
                }
            }

            match self.store.requeue_due_retries().await {
                Ok(n) if n > 0 => info!(requeued = n, "Promoted due retries"),
                Ok(_) => {}
                Err(e) => warn!(error = %e, "Failed to requeue due retries"),
            }

            match self.store.recover_stale_running(lease).await {
                Ok(n) if n > 0 => warn!(recovered = n, "Requeued stale running tasks"),
                Ok(_) => {}
                Err(e) => warn!(error = %e, "Failed to recover stale running tasks"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeTaskStore;

    fn policy() -> BackoffPolicy {
        BackoffPolicy {
            base: Duration::from_secs(10),
            cap: Duration::from_secs(600),
        }
    }

    fn running_task(attempt: i32, max_attempts: i32) -> ScrapeTask {
        let mut task = ScrapeTask::new("user", max_attempts, None);
        task.state = TaskState::Running;
        task.attempt_count = attempt;
        task
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let p = policy();
        assert_eq!(p.base_delay(1), Duration::from_secs(10));
        assert_eq!(p.base_delay(2), Duration::from_secs(20));
        assert_eq!(p.base_delay(3), Duration::from_secs(40));
        assert_eq!(p.base_delay(12), Duration::from_secs(600));
    }

    #[test]
    fn jittered_delay_stays_within_bounds() {
        let p = policy();
        for attempt in 1..=10 {
            let base = p.base_delay(attempt);
            for _ in 0..20 {
                let d = p.delay(attempt);
                assert!(d >= base.min(p.cap));
                assert!(d <= p.cap.max(base + base / 2));
                assert!(d <= p.cap);
            }
        }
    }

    #[test]
    fn retriable_error_with_attempts_left_retries() {
        let task = running_task(1, 4);
        let state = Scheduler::<FakeTaskStore>::next_state(&task, &ScrapeError::PoolExhausted);
        assert_eq!(state, TaskState::Retrying);
    }

    #[test]
    fn markup_mismatch_is_terminal_regardless_of_attempts() {
        let task = running_task(1, 4);
        let err = ScrapeError::MarkupMismatch("selectors gone".into());
        assert_eq!(
            Scheduler::<FakeTaskStore>::next_state(&task, &err),
            TaskState::Failed
        );
    }

    #[test]
    fn constraint_violation_is_terminal() {
        let task = running_task(1, 4);
        let err = ScrapeError::ConstraintViolation("bad external_id".into());
        assert_eq!(
            Scheduler::<FakeTaskStore>::next_state(&task, &err),
            TaskState::Failed
        );
    }

    #[test]
    fn cancellation_on_the_final_attempt_stays_retryable() {
        let task = running_task(1, 1);
        assert_eq!(
            Scheduler::<FakeTaskStore>::next_state(&task, &ScrapeError::Cancelled),
            TaskState::Retrying
        );
    }

    #[tokio::test]
    async fn cancelled_task_is_rescheduled_without_backoff() {
        let store = Arc::new(FakeTaskStore::new());
        let scheduler = Scheduler::new(store.clone(), policy());

        let task = scheduler.enqueue("user", 1, None).await.unwrap();
        let claimed = store.claim_next().await.unwrap().unwrap();

        let state = scheduler
            .report_failure(&claimed, &ScrapeError::Cancelled)
            .await
            .unwrap();
        assert_eq!(state, TaskState::Retrying);

        let stored = store.get(task.id).await.unwrap().unwrap();
        assert_eq!(stored.state, TaskState::Retrying);
        // No backoff: the task is already due.
        assert!(stored.scheduled_at <= Utc::now());
    }

    #[test]
    fn exhausted_attempts_fail_even_when_retriable() {
        let task = running_task(4, 4);
        let err = ScrapeError::GridUnreachable("down".into());
        assert_eq!(
            Scheduler::<FakeTaskStore>::next_state(&task, &err),
            TaskState::Failed
        );
    }

    #[tokio::test]
    async fn report_failure_schedules_retry_in_the_future() {
        let store = Arc::new(FakeTaskStore::new());
        let scheduler = Scheduler::new(store.clone(), policy());

        let task = scheduler.enqueue("user", 4, None).await.unwrap();
        let claimed = store.claim_next().await.unwrap().unwrap();
        assert_eq!(claimed.id, task.id);

        let before = Utc::now();
        let state = scheduler
            .report_failure(&claimed, &ScrapeError::PoolExhausted)
            .await
            .unwrap();
        assert_eq!(state, TaskState::Retrying);

        let stored = store.get(task.id).await.unwrap().unwrap();
        assert_eq!(stored.state, TaskState::Retrying);
        assert!(stored.scheduled_at > before);
        assert_eq!(
            stored.last_error.as_deref(),
            Some("browser session pool exhausted")
        );
    }

    #[tokio::test]
    async fn terminal_failure_keeps_diagnosable_last_error() {
        let store = Arc::new(FakeTaskStore::new());
        let scheduler = Scheduler::new(store.clone(), policy());

        let task = scheduler.enqueue("user", 4, None).await.unwrap();
        let claimed = store.claim_next().await.unwrap().unwrap();

        let err = ScrapeError::MarkupMismatch("no watchlist container".into());
        scheduler.report_failure(&claimed, &err).await.unwrap();

        let stored = store.get(task.id).await.unwrap().unwrap();
        assert_eq!(stored.state, TaskState::Failed);
        // The operator can tell a markup break from a transient outage.
        assert!(stored.last_error.unwrap().contains("markup mismatch"));
    }

    #[tokio::test]
    async fn lease_recovery_fails_tasks_with_no_attempts_left() {
        let store = Arc::new(FakeTaskStore::new());
        let scheduler = Scheduler::new(store.clone(), policy());

        let exhausted = scheduler.enqueue("doomed", 1, None).await.unwrap();
        let healthy = scheduler.enqueue("fine", 4, None).await.unwrap();
        store.claim_next().await.unwrap().unwrap();
        store.claim_next().await.unwrap().unwrap();

        // Negative lease: every running task counts as stale.
        let requeued = store
            .recover_stale_running(chrono::Duration::seconds(-1))
            .await
            .unwrap();
        assert_eq!(requeued, 1);

        let doomed = store.get(exhausted.id).await.unwrap().unwrap();
        assert_eq!(doomed.state, TaskState::Failed);
        assert_eq!(doomed.last_error.as_deref(), Some("worker lease expired"));

        let fine = store.get(healthy.id).await.unwrap().unwrap();
        assert_eq!(fine.state, TaskState::Queued);
    }

    #[tokio::test]
    async fn retrying_task_requeues_after_backoff_elapses() {
        let store = Arc::new(FakeTaskStore::new());
        let scheduler = Scheduler::new(
            store.clone(),
            BackoffPolicy {
                base: Duration::from_millis(0),
                cap: Duration::from_millis(0),
            },
        );

        let task = scheduler.enqueue("user", 4, None).await.unwrap();
        let claimed = store.claim_next().await.unwrap().unwrap();
        scheduler
            .report_failure(&claimed, &ScrapeError::PoolExhausted)
            .await
            .unwrap();

        let promoted = store.requeue_due_retries().await.unwrap();
        assert_eq!(promoted, 1);
        assert_eq!(store.get(task.id).await.unwrap().unwrap().state, TaskState::Queued);
    }
}
