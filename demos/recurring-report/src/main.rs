//! Schedules a recurring `report` job and runs a pool until `Ctrl-C`,
//! demonstrating that a finished recurring job requeues itself instead of
//! settling into `Finished`.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use wharf_core::{JobQueue, JsonEncoder, Pool, PoolConfig, TypeRegistry};
use wharf_redis::{Config, RedisJobQueue};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ReportRequest {
    report_name: String,
}

const ONE_SECOND_NS: i64 = 1_000_000_000;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let redis_url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1".to_string());
    let namespace = format!("wharf-demo-report-{}", uuid::Uuid::new_v4());
    let queue = Arc::new(RedisJobQueue::connect(&redis_url, Config::new(namespace)).await?);

    let registry = Arc::new(TypeRegistry::new());
    let report = registry.register(
        "report",
        /* default_retries */ 1,
        JsonEncoder,
        |payload: ReportRequest| async move {
            tracing::info!(report = %payload.report_name, "generating report");
            Ok(())
        },
        Arc::clone(&queue),
    )?;

    let now = wharf_core::now_ns();
    report
        .schedule_recurring(
            0,
            now,
            5 * ONE_SECOND_NS,
            &ReportRequest {
                report_name: "daily-active-users".into(),
            },
        )
        .await?;

    let mut pool = Pool::new(Arc::clone(&queue), registry, PoolConfig::new().with_num_workers(1));
    pool.start()?;

    tracing::info!("press ctrl-c to stop");
    tokio::signal::ctrl_c().await?;

    pool.close();
    pool.wait().await?;
    Ok(())
}
