use thiserror::Error;

/// Failure taxonomy for the scraping pipeline.
///
/// Retry policy lives entirely in the scheduler; components construct
/// these and propagate them without retrying beyond their own small
/// bounded loops (empty-page retries, grid session backoff).
#[derive(Debug, Error)]
pub enum ScrapeError {
    /// No session capacity became free within the acquire timeout.
    #[error("browser session pool exhausted")]
    PoolExhausted,

    /// The grid could not create or serve a session.
    #[error("browser grid unreachable: {0}")]
    GridUnreachable(String),

    /// A page never stabilized within the readiness timeout.
    #[error("page readiness timeout: {0}")]
    PageTimeout(String),

    /// Expected structural anchors were absent from the page. The
    /// source site's layout changed; a retry will not help.
    #[error("watchlist markup mismatch: {0}")]
    MarkupMismatch(String),

    /// The store rejected a write on a data invariant. Non-retriable;
    /// something upstream produced malformed data.
    #[error("storage constraint violation: {0}")]
    ConstraintViolation(String),

    /// The store is down or unreachable.
    #[error("persistence unavailable: {0}")]
    PersistenceUnavailable(String),

    /// The task was cancelled between pages. The checkpoint survives,
    /// so a later attempt resumes where this one stopped.
    #[error("scrape cancelled")]
    Cancelled,
}

impl ScrapeError {
    /// Whether the scheduler may retry a task that failed with this error.
    ///
    /// `MarkupMismatch` and `ConstraintViolation` need a human fix
    /// (extractor selectors, data invariant); everything else is
    /// transient infrastructure.
    pub fn is_retriable(&self) -> bool {
        !matches!(
            self,
            ScrapeError::MarkupMismatch(_) | ScrapeError::ConstraintViolation(_)
        )
    }
}
