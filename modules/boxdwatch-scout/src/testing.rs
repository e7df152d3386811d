// Test fakes for the pipeline.
//
// One fake per trait boundary:
// - FakePageFetcher (PageFetcher) — HashMap-based page→snapshot, with
//   per-page response sequences and call counting
// - FakeCheckpointStore (CheckpointStore) — in-memory checkpoint + staging
// - FakeRecordStore (RecordStore) — in-memory rows with tombstones
// - FakeTaskStore (TaskStore) — in-memory queue with atomic claim
//
// Plus fixture builders for watchlist/film page HTML.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use boxdwatch_common::{Changeset, Checkpoint, ScrapeError, ScrapeTask, TaskState, WatchlistRecord};
use webgrid_client::GridError;

use crate::pool::BrowserSession;
use crate::traits::{CheckpointStore, GridSessions, PageFetcher, RecordStore, TaskStore};

// ---------------------------------------------------------------------------
// Fixture builders
// ---------------------------------------------------------------------------

/// A minimal watchlist record for diff/driver tests.
pub fn record(external_id: &str, target_user: &str) -> WatchlistRecord {
    WatchlistRecord {
        external_id: external_id.to_string(),
        target_user: target_user.to_string(),
        title: external_id.to_string(),
        slug: external_id.to_lowercase(),
        url: format!("/film/{}/", external_id.to_lowercase()),
        tmdb_id: None,
        runtime_minutes: None,
        poster_path: None,
        vote_average: None,
        observed_at: Utc::now(),
    }
}

/// Render a watchlist page snapshot with the markup the extractor
/// expects. `films` is (external_id, slug); a pagination block is
/// rendered only when the list spans more than one page.
pub fn watchlist_html(films: &[(&str, &str)], page: u32, last_page: u32) -> String {
    let mut html = String::from("<html><body><ul class=\"poster-list\">\n");
    for (id, slug) in films {
        html.push_str(&format!(
            "<li class=\"poster-container\">\
             <div data-film-id=\"{id}\" data-film-slug=\"{slug}\" data-film-link=\"/film/{slug}/\">\
             <img alt=\"{slug}\" src=\"/p/{slug}.jpg\"></div></li>\n"
        ));
    }
    html.push_str("</ul>\n");

    if last_page > 1 {
        html.push_str("<div class=\"pagination\"><ul>\n");
        for p in 1..=last_page {
            let class = if p == page {
                "paginate-page paginate-current"
            } else {
                "paginate-page"
            };
            html.push_str(&format!("<li class=\"{class}\"><a>{p}</a></li>\n"));
        }
        html.push_str("</ul></div>\n");
    }

    html.push_str("</body></html>");
    html
}

/// Render a film detail page carrying a TMDB id.
pub fn film_html(tmdb_id: i64) -> String {
    format!("<html><body data-tmdb-id=\"{tmdb_id}\"><h1>film</h1></body></html>")
}

// ---------------------------------------------------------------------------
// FakeGrid
// ---------------------------------------------------------------------------

#[derive(Default)]
struct FakeGridState {
    next_id: u32,
    alive: HashSet<String>,
    deleted: Vec<String>,
    fail_creates: bool,
    failed_creates: u32,
}

/// In-memory grid: sessions are sequential ids in an alive set.
pub struct FakeGrid {
    state: Mutex<FakeGridState>,
}

impl FakeGrid {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(FakeGridState::default()),
        }
    }

    /// Make every session creation fail, as if the grid were down.
    pub fn fail_creates(&self, fail: bool) {
        self.state.lock().expect("grid lock poisoned").fail_creates = fail;
    }

    /// Simulate a browser dying while the session idles.
    pub fn kill(&self, session_id: &str) {
        self.state
            .lock()
            .expect("grid lock poisoned")
            .alive
            .remove(session_id);
    }

    pub fn created_count(&self) -> u32 {
        self.state.lock().expect("grid lock poisoned").next_id
    }

    pub fn failed_creates(&self) -> u32 {
        self.state.lock().expect("grid lock poisoned").failed_creates
    }

    /// Session ids torn down on the grid, in teardown order.
    pub fn deleted(&self) -> Vec<String> {
        self.state.lock().expect("grid lock poisoned").deleted.clone()
    }
}

#[async_trait]
impl GridSessions for FakeGrid {
    async fn open_session(&self) -> Result<BrowserSession, GridError> {
        let mut state = self.state.lock().expect("grid lock poisoned");
        if state.fail_creates {
            state.failed_creates += 1;
            return Err(GridError::Network("fake: grid down".to_string()));
        }
        state.next_id += 1;
        let id = format!("session-{}", state.next_id);
        state.alive.insert(id.clone());
        Ok(BrowserSession {
            id,
            node_address: None,
        })
    }

    async fn close_session(&self, session_id: &str) -> Result<(), GridError> {
        let mut state = self.state.lock().expect("grid lock poisoned");
        state.alive.remove(session_id);
        state.deleted.push(session_id.to_string());
        Ok(())
    }

    async fn is_alive(&self, session_id: &str) -> bool {
        self.state
            .lock()
            .expect("grid lock poisoned")
            .alive
            .contains(session_id)
    }
}

// ---------------------------------------------------------------------------
// FakePageFetcher
// ---------------------------------------------------------------------------

/// Snapshot source backed by maps. Unregistered pages come back as
/// `GridUnreachable`, which doubles as the crash lever in tests.
pub struct FakePageFetcher {
    watchlist: Mutex<HashMap<u32, Vec<String>>>,
    films: HashMap<String, String>,
    fetches: Mutex<HashMap<u32, u32>>,
}

impl FakePageFetcher {
    pub fn new() -> Self {
        Self {
            watchlist: Mutex::new(HashMap::new()),
            films: HashMap::new(),
            fetches: Mutex::new(HashMap::new()),
        }
    }

    pub fn on_watchlist_page(self, page: u32, html: String) -> Self {
        self.on_watchlist_page_sequence(page, vec![html])
    }

    /// Responses served in order; the last one repeats.
    pub fn on_watchlist_page_sequence(self, page: u32, mut responses: Vec<String>) -> Self {
        responses.reverse(); // pop() serves from the original front
        self.watchlist
            .lock()
            .expect("fetcher lock poisoned")
            .insert(page, responses);
        self
    }

    pub fn on_film_page(mut self, slug: &str, html: String) -> Self {
        self.films.insert(slug.to_string(), html);
        self
    }

    /// How often a given watchlist page was requested.
    pub fn watchlist_fetches(&self, page: u32) -> u32 {
        *self
            .fetches
            .lock()
            .expect("fetcher lock poisoned")
            .get(&page)
            .unwrap_or(&0)
    }
}

#[async_trait]
impl PageFetcher for FakePageFetcher {
    async fn watchlist_page(&self, _target_user: &str, page: u32) -> Result<String, ScrapeError> {
        *self
            .fetches
            .lock()
            .expect("fetcher lock poisoned")
            .entry(page)
            .or_insert(0) += 1;

        let mut watchlist = self.watchlist.lock().expect("fetcher lock poisoned");
        match watchlist.get_mut(&page) {
            Some(responses) if responses.len() > 1 => Ok(responses.pop().unwrap()),
            Some(responses) if responses.len() == 1 => Ok(responses[0].clone()),
            _ => Err(ScrapeError::GridUnreachable(format!(
                "fake: no snapshot registered for page {page}"
            ))),
        }
    }

    async fn film_page(&self, slug: &str) -> Result<String, ScrapeError> {
        self.films.get(slug).cloned().ok_or_else(|| {
            ScrapeError::GridUnreachable(format!("fake: no snapshot registered for film {slug}"))
        })
    }
}

// ---------------------------------------------------------------------------
// FakeCheckpointStore
// ---------------------------------------------------------------------------

#[derive(Default)]
struct CheckpointEntry {
    checkpoint: Option<Checkpoint>,
    staged: Vec<WatchlistRecord>,
}

pub struct FakeCheckpointStore {
    state: Mutex<HashMap<String, CheckpointEntry>>,
}

impl FakeCheckpointStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl CheckpointStore for FakeCheckpointStore {
    async fn load(&self, target_user: &str) -> Result<Option<Checkpoint>, ScrapeError> {
        Ok(self
            .state
            .lock()
            .expect("checkpoint lock poisoned")
            .get(target_user)
            .and_then(|e| e.checkpoint.clone()))
    }

    async fn save_page(
        &self,
        target_user: &str,
        records: &[WatchlistRecord],
        next_page: u32,
    ) -> Result<(), ScrapeError> {
        let mut state = self.state.lock().expect("checkpoint lock poisoned");
        let entry = state.entry(target_user.to_string()).or_default();

        let staged_ids: HashSet<String> =
            entry.staged.iter().map(|r| r.external_id.clone()).collect();
        for rec in records {
            if !staged_ids.contains(&rec.external_id) {
                entry.staged.push(rec.clone());
            }
        }
        entry.checkpoint = Some(Checkpoint {
            target_user: target_user.to_string(),
            next_page,
            last_success_at: Utc::now(),
        });
        Ok(())
    }

    async fn staged_records(&self, target_user: &str) -> Result<Vec<WatchlistRecord>, ScrapeError> {
        Ok(self
            .state
            .lock()
            .expect("checkpoint lock poisoned")
            .get(target_user)
            .map(|e| e.staged.clone())
            .unwrap_or_default())
    }

    async fn clear(&self, target_user: &str) -> Result<(), ScrapeError> {
        self.state
            .lock()
            .expect("checkpoint lock poisoned")
            .remove(target_user);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// FakeRecordStore
// ---------------------------------------------------------------------------

struct StoredRecord {
    record: WatchlistRecord,
    tombstoned: bool,
}

pub struct FakeRecordStore {
    rows: Mutex<HashMap<String, Vec<StoredRecord>>>,
    apply_count: Mutex<u32>,
    fail_next_apply: Mutex<Option<ScrapeError>>,
}

impl FakeRecordStore {
    pub fn new() -> Self {
        Self {
            rows: Mutex::new(HashMap::new()),
            apply_count: Mutex::new(0),
            fail_next_apply: Mutex::new(None),
        }
    }

    /// Make the next `apply` fail once with the given error.
    pub fn fail_next_apply(&self, err: ScrapeError) {
        *self.fail_next_apply.lock().expect("record lock poisoned") = Some(err);
    }

    pub fn apply_count(&self) -> u32 {
        *self.apply_count.lock().expect("record lock poisoned")
    }

    /// Live (non-tombstoned) external ids in stored order.
    pub fn live_ids(&self, target_user: &str) -> Vec<String> {
        self.rows
            .lock()
            .expect("record lock poisoned")
            .get(target_user)
            .map(|rows| {
                rows.iter()
                    .filter(|r| !r.tombstoned)
                    .map(|r| r.record.external_id.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn tombstoned_ids(&self, target_user: &str) -> Vec<String> {
        self.rows
            .lock()
            .expect("record lock poisoned")
            .get(target_user)
            .map(|rows| {
                rows.iter()
                    .filter(|r| r.tombstoned)
                    .map(|r| r.record.external_id.clone())
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[async_trait]
impl RecordStore for FakeRecordStore {
    async fn live_external_ids(&self, target_user: &str) -> Result<HashSet<String>, ScrapeError> {
        Ok(self.live_ids(target_user).into_iter().collect())
    }

    async fn apply(&self, changeset: &Changeset) -> Result<(), ScrapeError> {
        if let Some(err) = self
            .fail_next_apply
            .lock()
            .expect("record lock poisoned")
            .take()
        {
            return Err(err);
        }

        let mut rows = self.rows.lock().expect("record lock poisoned");
        let user_rows = rows.entry(changeset.target_user.clone()).or_default();

        for added in &changeset.added {
            match user_rows
                .iter_mut()
                .find(|r| r.record.external_id == added.external_id)
            {
                Some(existing) => {
                    existing.record = added.clone();
                    existing.tombstoned = false;
                }
                None => user_rows.push(StoredRecord {
                    record: added.clone(),
                    tombstoned: false,
                }),
            }
        }
        for removed in &changeset.removed {
            if let Some(row) = user_rows
                .iter_mut()
                .find(|r| &r.record.external_id == removed)
            {
                row.tombstoned = true;
            }
        }

        *self.apply_count.lock().expect("record lock poisoned") += 1;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// FakeTaskStore
// ---------------------------------------------------------------------------

/// In-memory task queue. Claiming happens under one lock, which gives
/// the same at-most-one-claimant behavior the Postgres statement does.
pub struct FakeTaskStore {
    tasks: Mutex<HashMap<Uuid, ScrapeTask>>,
}

impl FakeTaskStore {
    pub fn new() -> Self {
        Self {
            tasks: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl TaskStore for FakeTaskStore {
    async fn enqueue(&self, task: &ScrapeTask) -> Result<(), ScrapeError> {
        self.tasks
            .lock()
            .expect("task lock poisoned")
            .insert(task.id, task.clone());
        Ok(())
    }

    async fn claim_next(&self) -> Result<Option<ScrapeTask>, ScrapeError> {
        let mut tasks = self.tasks.lock().expect("task lock poisoned");
        let now = Utc::now();

        let running_users: HashSet<String> = tasks
            .values()
            .filter(|t| t.state == TaskState::Running)
            .map(|t| t.target_user.clone())
            .collect();

        let candidate = tasks
            .values()
            .filter(|t| {
                t.state == TaskState::Queued
                    && t.scheduled_at <= now
                    && !running_users.contains(&t.target_user)
            })
            .min_by_key(|t| t.scheduled_at)
            .map(|t| t.id);

        Ok(candidate.map(|id| {
            let task = tasks.get_mut(&id).expect("candidate vanished");
            task.state = TaskState::Running;
            task.attempt_count += 1;
            task.updated_at = now;
            task.clone()
        }))
    }

    async fn record_outcome(
        &self,
        task_id: Uuid,
        state: TaskState,
        last_error: Option<&str>,
        scheduled_at: DateTime<Utc>,
    ) -> Result<(), ScrapeError> {
        let mut tasks = self.tasks.lock().expect("task lock poisoned");
        if let Some(task) = tasks.get_mut(&task_id) {
            task.state = state;
            task.last_error = last_error.map(String::from);
            task.scheduled_at = scheduled_at;
            task.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn requeue_due_retries(&self) -> Result<u64, ScrapeError> {
        let mut tasks = self.tasks.lock().expect("task lock poisoned");
        let now = Utc::now();
        let mut promoted = 0u64;
        for task in tasks.values_mut() {
            if task.state == TaskState::Retrying && task.scheduled_at <= now {
                task.state = TaskState::Queued;
                task.updated_at = now;
                promoted += 1;
            }
        }
        Ok(promoted)
    }

    async fn recover_stale_running(&self, lease: chrono::Duration) -> Result<u64, ScrapeError> {
        let mut tasks = self.tasks.lock().expect("task lock poisoned");
        let cutoff = Utc::now() - lease;
        let mut recovered = 0u64;
        for task in tasks.values_mut() {
            if task.state == TaskState::Running && task.updated_at < cutoff {
                if task.attempt_count >= task.max_attempts {
                    task.state = TaskState::Failed;
                    task.last_error = Some("worker lease expired".to_string());
                } else {
                    task.state = TaskState::Queued;
                    recovered += 1;
                }
                task.updated_at = Utc::now();
            }
        }
        Ok(recovered)
    }

    async fn get(&self, task_id: Uuid) -> Result<Option<ScrapeTask>, ScrapeError> {
        Ok(self
            .tasks
            .lock()
            .expect("task lock poisoned")
            .get(&task_id)
            .cloned())
    }
}
