use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One film on a user's watchlist, as observed on the source site.
///
/// Immutable once persisted except for `observed_at` refreshes. The
/// `tmdb_*` fields are additive metadata filled in by enrichment and
/// may be absent when enrichment is disabled or failed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchlistRecord {
    /// Stable film id assigned by the source site. Unique per target user.
    pub external_id: String,
    pub target_user: String,
    pub title: String,
    /// URL slug of the film page, e.g. `the-seventh-seal`.
    pub slug: String,
    /// Film page path on the source site.
    pub url: String,
    pub tmdb_id: Option<i64>,
    pub runtime_minutes: Option<i32>,
    pub poster_path: Option<String>,
    pub vote_average: Option<f64>,
    pub observed_at: DateTime<Utc>,
}

/// Delta between a freshly scraped record set and persisted state.
/// Produced by the diff engine, consumed exactly once by the store.
#[derive(Debug, Clone)]
pub struct Changeset {
    pub target_user: String,
    /// New records, in the order the scrape observed them.
    pub added: Vec<WatchlistRecord>,
    /// External ids present in storage but absent from the scrape.
    pub removed: Vec<String>,
    pub computed_at: DateTime<Utc>,
}

impl Changeset {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Durable pagination progress for one target user.
///
/// Written after every successfully extracted page, before its records
/// are handed on, so a crash loses at most the in-flight page.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub target_user: String,
    /// First page the next attempt should fetch (1-based).
    pub next_page: u32,
    pub last_success_at: DateTime<Utc>,
}

/// Lifecycle of a scrape task.
///
/// `Queued -> Running -> {Succeeded | Retrying | Failed}`, with
/// `Retrying -> Queued` once the backoff delay elapses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    #[default]
    Queued,
    Running,
    Succeeded,
    Failed,
    Retrying,
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            TaskState::Queued => write!(f, "queued"),
            TaskState::Running => write!(f, "running"),
            TaskState::Succeeded => write!(f, "succeeded"),
            TaskState::Failed => write!(f, "failed"),
            TaskState::Retrying => write!(f, "retrying"),
        }
    }
}

impl FromStr for TaskState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(TaskState::Queued),
            "running" => Ok(TaskState::Running),
            "succeeded" => Ok(TaskState::Succeeded),
            "failed" => Ok(TaskState::Failed),
            "retrying" => Ok(TaskState::Retrying),
            other => Err(format!("unknown task state: {other}")),
        }
    }
}

impl TaskState {
    /// Terminal states are never claimed or transitioned again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Succeeded | TaskState::Failed)
    }
}

/// One unit of scraping work: walk a single user's watchlist.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScrapeTask {
    pub id: Uuid,
    pub target_user: String,
    pub state: TaskState,
    pub attempt_count: i32,
    pub max_attempts: i32,
    /// Rendered error of the last failed attempt, kept for operator
    /// diagnosis. A markup mismatch reads differently from a grid
    /// outage here, which tells the operator whether to fix code or
    /// just wait.
    pub last_error: Option<String>,
    /// Page to resume from, when a trigger asks for an explicit resume.
    pub resume_cursor: Option<u32>,
    /// Earliest time the task may be claimed. Pushed into the future
    /// by retry backoff.
    pub scheduled_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ScrapeTask {
    pub fn new(target_user: &str, max_attempts: i32, resume_cursor: Option<u32>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            target_user: target_user.to_string(),
            state: TaskState::Queued,
            attempt_count: 0,
            max_attempts,
            last_error: None,
            resume_cursor,
            scheduled_at: now,
            created_at: now,
            updated_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_state_round_trips_through_strings() {
        for state in [
            TaskState::Queued,
            TaskState::Running,
            TaskState::Succeeded,
            TaskState::Failed,
            TaskState::Retrying,
        ] {
            assert_eq!(state.to_string().parse::<TaskState>(), Ok(state));
        }
    }

    #[test]
    fn only_succeeded_and_failed_are_terminal() {
        assert!(TaskState::Succeeded.is_terminal());
        assert!(TaskState::Failed.is_terminal());
        assert!(!TaskState::Queued.is_terminal());
        assert!(!TaskState::Running.is_terminal());
        assert!(!TaskState::Retrying.is_terminal());
    }
}
