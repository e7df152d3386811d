use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;

use boxdwatch_common::Config;
use boxdwatch_scout::paginate::PaginationConfig;
use boxdwatch_scout::pool::SessionPool;
use boxdwatch_scout::scheduler::{BackoffPolicy, Scheduler};
use boxdwatch_scout::store::PgStore;
use boxdwatch_scout::tmdb::TmdbClient;
use boxdwatch_scout::worker::Worker;
use webgrid_client::WebGridClient;

/// How often scheduler maintenance runs (retry promotion, stale
/// running recovery).
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(15);

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("boxdwatch=info".parse()?))
        .init();

    info!("Boxdwatch scout starting...");

    let config = Config::from_env();
    config.log_redacted();

    // Connect to Postgres and run migrations
    let store = Arc::new(PgStore::connect(&config.database_url).await?);
    store.migrate().await?;

    let grid = Arc::new(WebGridClient::new(&config.grid_url));
    let pool = Arc::new(SessionPool::new(grid.clone(), config.max_sessions));

    let scheduler = Arc::new(Scheduler::new(
        store.clone(),
        BackoffPolicy {
            base: Duration::from_secs(config.backoff_base_secs),
            cap: Duration::from_secs(config.backoff_cap_secs),
        },
    ));

    let enricher = config
        .tmdb_access_token
        .as_deref()
        .map(|token| Arc::new(TmdbClient::new(token)));

    let (cancel_tx, cancel_rx) = watch::channel(false);

    let maintenance = {
        let scheduler = scheduler.clone();
        let cancel = cancel_rx.clone();
        let lease = chrono::Duration::seconds(config.running_lease_secs);
        tokio::spawn(async move {
            scheduler
                .run_maintenance(MAINTENANCE_INTERVAL, lease, cancel)
                .await;
        })
    };

    let mut workers = Vec::with_capacity(config.worker_count);
    for worker_id in 0..config.worker_count {
        let worker = Worker {
            worker_id,
            grid: grid.clone(),
            pool: pool.clone(),
            store: store.clone(),
            scheduler: scheduler.clone(),
            enricher: enricher.clone(),
            source_base_url: config.source_base_url.clone(),
            pagination: PaginationConfig {
                max_pages: config.max_pages,
                empty_page_retries: config.empty_page_retries,
            },
            acquire_timeout: Duration::from_secs(config.acquire_timeout_secs),
            page_ready_timeout: Duration::from_secs(config.page_ready_timeout_secs),
            claim_poll: Duration::from_secs(config.claim_poll_secs),
        };
        let cancel = cancel_rx.clone();
        workers.push(tokio::spawn(async move { worker.run(cancel).await }));
    }

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, draining workers");
    let _ = cancel_tx.send(true);

    for handle in workers {
        let _ = handle.await;
    }
    let _ = maintenance.await;

    // Tear down idle browser sessions before exiting.
    pool.shutdown().await;
    info!("Boxdwatch scout stopped");
    Ok(())
}
