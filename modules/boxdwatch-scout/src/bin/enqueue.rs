//! Queue a scrape task for a target user.
//!
//! Usage: enqueue <target_user> [--resume <page>] [--max-attempts <n>]

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use boxdwatch_common::{Config, ScrapeTask};
use boxdwatch_scout::store::PgStore;
use boxdwatch_scout::traits::TaskStore;

#[derive(Parser)]
#[command(about = "Queue a watchlist scrape task")]
struct Args {
    /// Username whose watchlist should be scraped.
    target_user: String,

    /// Start the walk at this page instead of page 1 or the checkpoint.
    #[arg(long)]
    resume: Option<u32>,

    /// Override the configured attempt ceiling for this task.
    #[arg(long)]
    max_attempts: Option<i32>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("boxdwatch=info".parse()?))
        .init();

    let args = Args::parse();
    let config = Config::from_env();

    let store = PgStore::connect(&config.database_url).await?;
    store.migrate().await?;

    let task = ScrapeTask::new(
        &args.target_user,
        args.max_attempts.unwrap_or(config.max_attempts),
        args.resume,
    );
    store.enqueue(&task).await?;

    println!("queued task {} for {}", task.id, task.target_user);
    Ok(())
}
