//! Bounded pool of remote browser sessions.
//!
//! Capacity is a semaphore; the idle set sits under one mutex so a
//! session is never handed to two callers. Grid topology stays hidden
//! behind the `GridSessions` seam — callers only ever see session ids.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{info, warn};

use boxdwatch_common::ScrapeError;
use webgrid_client::{headless_chrome_capabilities, GridError, WebGridClient};

use crate::traits::GridSessions;

/// Max attempts at creating a grid session before giving up on the grid.
const CREATE_MAX_ATTEMPTS: u32 = 3;
/// Base backoff for session creation. Actual delay is base * 3^attempt + jitter.
const CREATE_RETRY_BASE: Duration = Duration::from_secs(2);

/// A browser session leased from the grid.
#[derive(Debug, Clone)]
pub struct BrowserSession {
    pub id: String,
    /// Node serving this session, when the grid reports one.
    pub node_address: Option<String>,
}

/// A leased session. Holding this is holding one unit of pool
/// capacity; give it back through `SessionPool::release`.
#[derive(Debug)]
pub struct PooledSession {
    pub session: BrowserSession,
    _permit: OwnedSemaphorePermit,
}

pub struct SessionPool {
    grid: Arc<dyn GridSessions>,
    capacity: Arc<Semaphore>,
    idle: Mutex<Vec<BrowserSession>>,
}

impl SessionPool {
    pub fn new(grid: Arc<dyn GridSessions>, max_sessions: usize) -> Self {
        info!(max_sessions, "Session pool initialized");
        Self {
            grid,
            capacity: Arc::new(Semaphore::new(max_sessions)),
            idle: Mutex::new(Vec::new()),
        }
    }

    /// Lease a session, waiting up to `timeout` for capacity.
    ///
    /// `PoolExhausted` when no slot frees up in time; `GridUnreachable`
    /// when the grid cannot produce a session after bounded backoff.
    pub async fn acquire(&self, timeout: Duration) -> Result<PooledSession, ScrapeError> {
        let permit = tokio::time::timeout(timeout, self.capacity.clone().acquire_owned())
            .await
            .map_err(|_| ScrapeError::PoolExhausted)?
            .map_err(|_| ScrapeError::PoolExhausted)?;

        // Reuse an idle session when it still answers; otherwise fall
        // through to creating a fresh one. The permit travels with the
        // session either way, so the concurrency bound holds.
        while let Some(session) = self.pop_idle() {
            if self.grid.is_alive(&session.id).await {
                return Ok(PooledSession {
                    session,
                    _permit: permit,
                });
            }
            warn!(session_id = %session.id, "Idle session failed health check, discarding");
            self.discard(&session).await;
        }

        let session = self.create_session().await?;
        Ok(PooledSession {
            session,
            _permit: permit,
        })
    }

    /// Return a session to the pool. Unhealthy sessions are torn down
    /// on the grid instead of rejoining the idle set; the freed permit
    /// lets the next `acquire` request a replacement.
    pub async fn release(&self, pooled: PooledSession, healthy: bool) {
        let PooledSession { session, _permit } = pooled;
        if healthy {
            self.idle
                .lock()
                .expect("idle set lock poisoned")
                .push(session);
        } else {
            warn!(session_id = %session.id, "Discarding unhealthy session");
            self.discard(&session).await;
        }
        // _permit drops here, freeing one capacity slot.
    }

    /// Tear down every idle session on the grid.
    pub async fn shutdown(&self) {
        let sessions: Vec<BrowserSession> =
            self.idle.lock().expect("idle set lock poisoned").drain(..).collect();
        for session in sessions {
            self.discard(&session).await;
        }
    }

    fn pop_idle(&self) -> Option<BrowserSession> {
        self.idle.lock().expect("idle set lock poisoned").pop()
    }

    async fn discard(&self, session: &BrowserSession) {
        if let Err(e) = self.grid.close_session(&session.id).await {
            warn!(session_id = %session.id, error = %e, "Failed to delete grid session");
        }
    }

    /// Create a session with bounded retries — the grid rejecting
    /// session creation is usually a node still spinning up.
    async fn create_session(&self) -> Result<BrowserSession, ScrapeError> {
        let mut last_error: Option<GridError> = None;

        for attempt in 0..CREATE_MAX_ATTEMPTS {
            if attempt > 0 {
                let backoff = CREATE_RETRY_BASE * 3u32.pow(attempt - 1);
                let jitter = Duration::from_millis(rand::rng().random_range(0..1000));
                warn!(
                    attempt = attempt + 1,
                    backoff_secs = backoff.as_secs(),
                    "Grid session creation failed, retrying after backoff"
                );
                tokio::time::sleep(backoff + jitter).await;
            }

            match self.grid.open_session().await {
                Ok(session) => return Ok(session),
                Err(e) => last_error = Some(e),
            }
        }

        Err(ScrapeError::GridUnreachable(
            last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "unknown grid failure".to_string()),
        ))
    }
}

#[async_trait]
impl GridSessions for WebGridClient {
    async fn open_session(&self) -> Result<BrowserSession, GridError> {
        let created = self.create_session(headless_chrome_capabilities()).await?;
        let node_address = created
            .capabilities
            .get("se:nodeUri")
            .and_then(|v| v.as_str())
            .map(String::from);
        info!(session_id = %created.session_id, ?node_address, "Session created");
        Ok(BrowserSession {
            id: created.session_id,
            node_address,
        })
    }

    async fn close_session(&self, session_id: &str) -> Result<(), GridError> {
        self.delete_session(session_id).await
    }

    async fn is_alive(&self, session_id: &str) -> bool {
        self.current_url(session_id).await.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeGrid;

    fn pool_with(grid: Arc<FakeGrid>, max_sessions: usize) -> SessionPool {
        SessionPool::new(grid, max_sessions)
    }

    #[tokio::test(start_paused = true)]
    async fn capacity_bounds_concurrent_leases() {
        let grid = Arc::new(FakeGrid::new());
        let pool = pool_with(grid.clone(), 1);

        let first = pool.acquire(Duration::from_secs(1)).await.unwrap();

        let err = pool.acquire(Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, ScrapeError::PoolExhausted));
        assert_eq!(grid.created_count(), 1, "no session created past capacity");

        // Dropping the lease frees the slot.
        drop(first);
        pool.acquire(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn healthy_release_is_reused_not_recreated() {
        let grid = Arc::new(FakeGrid::new());
        let pool = pool_with(grid.clone(), 2);

        let leased = pool.acquire(Duration::from_secs(1)).await.unwrap();
        let id = leased.session.id.clone();
        pool.release(leased, true).await;

        let again = pool.acquire(Duration::from_secs(1)).await.unwrap();
        assert_eq!(again.session.id, id);
        assert_eq!(grid.created_count(), 1);
    }

    #[tokio::test]
    async fn unhealthy_release_tears_the_session_down() {
        let grid = Arc::new(FakeGrid::new());
        let pool = pool_with(grid.clone(), 1);

        let leased = pool.acquire(Duration::from_secs(1)).await.unwrap();
        let id = leased.session.id.clone();
        pool.release(leased, false).await;
        assert_eq!(grid.deleted(), vec![id.clone()]);

        let replacement = pool.acquire(Duration::from_secs(1)).await.unwrap();
        assert_ne!(replacement.session.id, id);
    }

    #[tokio::test]
    async fn dead_idle_session_is_discarded_on_acquire() {
        let grid = Arc::new(FakeGrid::new());
        let pool = pool_with(grid.clone(), 1);

        let leased = pool.acquire(Duration::from_secs(1)).await.unwrap();
        let id = leased.session.id.clone();
        pool.release(leased, true).await;

        // The browser died while idling.
        grid.kill(&id);

        let replacement = pool.acquire(Duration::from_secs(1)).await.unwrap();
        assert_ne!(replacement.session.id, id);
        assert!(grid.deleted().contains(&id));
    }

    #[tokio::test(start_paused = true)]
    async fn unreachable_grid_surfaces_after_bounded_retries() {
        let grid = Arc::new(FakeGrid::new());
        grid.fail_creates(true);
        let pool = pool_with(grid.clone(), 1);

        let err = pool.acquire(Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, ScrapeError::GridUnreachable(_)));
        assert_eq!(grid.failed_creates(), CREATE_MAX_ATTEMPTS);
    }
}
