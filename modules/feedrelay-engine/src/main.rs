use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use feedrelay_common::Config;
use feedrelay_engine::{
    consistency::ConsistencyJob,
    cycle::{CycleRunner, DefaultFormatter},
    dedup::DedupDefaults,
    delivery::{
        lock::{DeliveryMutex, LocalMutex, RedisMutex},
        DeliveryClient,
    },
    seed::{InMemoryHistoryStore, SeedFile, SeedSubscriberStore, SeedSubscriptionStore},
    traits::HttpPlatformDirectory,
    worker::WorkerPool,
};

#[derive(Parser)]
#[command(name = "feedrelay", about = "Feed fetch, dedup, and delivery service")]
struct Args {
    /// Run one fetch cycle and one consistency pass, then exit.
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("feedrelay=info".parse()?))
        .init();

    info!("Feed Relay starting...");

    let args = Args::parse();
    let config = Config::from_env();
    config.log_redacted();

    let seed = SeedFile::load(&config.seed_file)?;
    let subscriptions = Arc::new(SeedSubscriptionStore::new(seed.subscriptions.clone()));
    let subscribers = Arc::new(SeedSubscriberStore::new(seed.subscribers));
    let history = Arc::new(InMemoryHistoryStore::new());

    // Delivery coordination: redis when configured, in-process otherwise
    let mutex: Arc<dyn DeliveryMutex> = match &config.redis_url {
        Some(url) => {
            info!("Delivery coordination via redis");
            Arc::new(RedisMutex::connect(url).await?)
        }
        None => {
            info!("No REDIS_URL set, using in-process delivery locks");
            Arc::new(LocalMutex::new())
        }
    };
    let delivery = Arc::new(DeliveryClient::new(
        config.chat_api_base.clone(),
        config.chat_api_token.clone(),
        mutex,
    ));

    let directory = Arc::new(HttpPlatformDirectory::new(
        config.chat_api_base.clone(),
        config.chat_api_token.clone(),
    ));

    let pool = Arc::new(WorkerPool::new(
        config.worker_bin.clone(),
        vec![],
        config.worker_cap,
    ));
    let runner = CycleRunner::new(
        pool.clone(),
        history,
        subscriptions.clone(),
        delivery,
        Arc::new(DefaultFormatter),
        DedupDefaults {
            check_dates: config.check_dates,
            max_age_days: config.cycle_max_age_days,
        },
        config.worker_cap.max(1),
    );
    let consistency = ConsistencyJob::new(
        subscribers,
        subscriptions,
        directory.clone(),
        config.consistency_concurrency,
    );

    // The role cache must exist before the first cached-role check.
    let destinations: std::collections::HashSet<&str> = seed
        .subscriptions
        .iter()
        .map(|s| s.destination_id.as_str())
        .collect();
    for destination in destinations {
        if let Err(e) = directory.refresh_roles(destination).await {
            warn!(destination, error = %e, "Failed to refresh role cache");
        }
    }

    if args.once {
        let stats = runner.run_cycle().await?;
        info!(delivered = stats.delivered, failed = stats.failed_links, "Cycle done");
        let deleted = consistency.run().await?;
        info!(deleted, "Consistency pass done");
        pool.shutdown().await;
        return Ok(());
    }

    let mut cycle_tick = tokio::time::interval(Duration::from_secs(config.cycle_interval_secs));
    let mut consistency_tick =
        tokio::time::interval(Duration::from_secs(config.consistency_interval_secs));
    loop {
        tokio::select! {
            _ = cycle_tick.tick() => {
                if let Err(e) = runner.run_cycle().await {
                    warn!(error = %e, "Cycle failed");
                }
            }
            _ = consistency_tick.tick() => {
                if let Err(e) = consistency.run().await {
                    warn!(error = %e, "Consistency job failed");
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                break;
            }
        }
    }
    pool.shutdown().await;
    Ok(())
}
