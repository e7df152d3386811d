use std::env;

use tracing::info;

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    // Persistence
    pub database_url: String,

    // Browser grid
    pub grid_url: String,
    pub max_sessions: usize,
    pub acquire_timeout_secs: u64,

    // Source site
    pub source_base_url: String,
    pub page_ready_timeout_secs: u64,
    pub max_pages: u32,
    pub empty_page_retries: u32,

    // Enrichment (optional — records stay unenriched without a token)
    pub tmdb_access_token: Option<String>,

    // Scheduling
    pub worker_count: usize,
    pub max_attempts: i32,
    pub backoff_base_secs: u64,
    pub backoff_cap_secs: u64,
    pub claim_poll_secs: u64,
    pub running_lease_secs: i64,
}

impl Config {
    /// Load configuration from environment variables.
    /// Panics with a clear message if required vars are missing.
    pub fn from_env() -> Self {
        Self {
            database_url: required_env("DATABASE_URL"),
            grid_url: env::var("GRID_URL")
                .unwrap_or_else(|_| "http://selenium-hub:4444".to_string()),
            max_sessions: parsed_env("MAX_SESSIONS", 4),
            acquire_timeout_secs: parsed_env("ACQUIRE_TIMEOUT_SECS", 30),
            source_base_url: env::var("SOURCE_BASE_URL")
                .unwrap_or_else(|_| "https://letterboxd.com".to_string()),
            page_ready_timeout_secs: parsed_env("PAGE_READY_TIMEOUT_SECS", 15),
            max_pages: parsed_env("MAX_PAGES", 128),
            empty_page_retries: parsed_env("EMPTY_PAGE_RETRIES", 2),
            tmdb_access_token: env::var("TMDB_ACCESS_TOKEN").ok(),
            worker_count: parsed_env("WORKER_COUNT", 2),
            max_attempts: parsed_env("MAX_ATTEMPTS", 4),
            backoff_base_secs: parsed_env("BACKOFF_BASE_SECS", 10),
            backoff_cap_secs: parsed_env("BACKOFF_CAP_SECS", 600),
            claim_poll_secs: parsed_env("CLAIM_POLL_SECS", 5),
            running_lease_secs: parsed_env("RUNNING_LEASE_SECS", 900),
        }
    }

    /// Log the non-secret settings at startup.
    pub fn log_redacted(&self) {
        info!(
            grid_url = %self.grid_url,
            source_base_url = %self.source_base_url,
            max_sessions = self.max_sessions,
            worker_count = self.worker_count,
            max_attempts = self.max_attempts,
            max_pages = self.max_pages,
            enrichment = self.tmdb_access_token.is_some(),
            "Configuration loaded"
        );
    }
}

fn required_env(key: &str) -> String {
    env::var(key).unwrap_or_else(|_| panic!("{key} environment variable is required"))
}

fn parsed_env<T: std::str::FromStr>(key: &str, default: T) -> T {
    match env::var(key) {
        Ok(raw) => raw
            .parse()
            .unwrap_or_else(|_| panic!("{key} must be a number")),
        Err(_) => default,
    }
}
