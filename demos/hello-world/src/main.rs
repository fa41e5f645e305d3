//! Schedules a handful of `greet` jobs at different priorities, runs a
//! single-process pool against them, and prints the final queue stats once
//! every job has settled.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use wharf_core::{JobQueue, JsonEncoder, Pool, PoolConfig, TypeRegistry};
use wharf_redis::{Config, RedisJobQueue};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Greeting {
    name: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let redis_url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1".to_string());
    let namespace = format!("wharf-demo-hello-{}", uuid::Uuid::new_v4());
    let queue = Arc::new(RedisJobQueue::connect(&redis_url, Config::new(namespace)).await?);

    let registry = Arc::new(TypeRegistry::new());
    let greet = registry.register(
        "greet",
        /* default_retries */ 2,
        JsonEncoder,
        |payload: Greeting| async move {
            tracing::info!(name = %payload.name, "hello!");
            Ok(())
        },
        Arc::clone(&queue),
    )?;

    let now = wharf_core::now_ns();
    greet.schedule(0, now, &Greeting { name: "ferris".into() }).await?;
    greet.schedule(10, now, &Greeting { name: "priority-vip".into() }).await?;
    greet.schedule(-5, now, &Greeting { name: "low-priority".into() }).await?;

    let mut pool = Pool::new(Arc::clone(&queue), registry, PoolConfig::new().with_num_workers(2));
    pool.start()?;

    tokio::time::sleep(Duration::from_secs(2)).await;
    pool.close();
    pool.wait().await?;

    let stats = queue.stats().await?;
    tracing::info!(?stats, "final queue stats");
    Ok(())
}
