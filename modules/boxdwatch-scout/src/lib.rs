//! Watchlist scraping pipeline: browser grid sessions, pagination with
//! durable checkpoints, membership diffing, and a Postgres-backed task
//! queue with retry scheduling.

pub mod diff;
pub mod extract;
pub mod fetch;
pub mod paginate;
pub mod pool;
pub mod scheduler;
pub mod store;
pub mod tmdb;
pub mod traits;
pub mod worker;

#[cfg(any(test, feature = "test-support"))]
pub mod testing;
