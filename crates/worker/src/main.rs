mod handlers;

use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use delayflow::payload::PayloadCodec;
use delayflow::{config, connect, JobStore, Worker};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    dotenvy::dotenv().ok();

    let database_url = std::env::var("DATABASE_URL")
        .map_err(|_| anyhow::anyhow!("DATABASE_URL is missing"))?;

    let worker_name = env_string("DELAYFLOW_WORKER_NAME").unwrap_or_else(|| {
        let host = env_string("HOSTNAME").unwrap_or_else(|| "worker".to_string());
        format!("{host} pid:{}", std::process::id())
    });
    let max_attempts: i32 = env_parse("DELAYFLOW_MAX_ATTEMPTS").unwrap_or(25);
    let poll_interval = Duration::from_millis(env_parse("DELAYFLOW_POLL_MS").unwrap_or(5_000));

    let settings = delayflow::Settings::from_env().into_shared();
    let codec: Arc<dyn PayloadCodec> = Arc::new(handlers::build_codec());
    let store = connect(&database_url, settings.clone(), Some(codec.clone())).await?;

    if env_bool("DELAYFLOW_CREATE_TABLE") {
        store.create_table().await?;
    }
    if env_bool("DELAYFLOW_DEMO_SEED") {
        handlers::seed_demo_jobs(store.as_ref()).await?;
    }

    let worker = Worker::new(worker_name);
    info!(worker = %worker.name, "delayflow worker starting");

    let mut last_depth_log = Instant::now();
    loop {
        let max_run_time = config::snapshot(&settings).max_run_time;

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!(worker = %worker.name, "shutting down, releasing held locks");
                store.clear_locks(&worker.name).await?;
                break;
            }
            result = run_once(store.as_ref(), codec.as_ref(), &worker, max_run_time, max_attempts) => {
                match result {
                    Ok(true) => {}
                    Ok(false) => tokio::time::sleep(poll_interval).await,
                    Err(err) => {
                        error!(error = %err, "reservation cycle failed");
                        tokio::time::sleep(poll_interval).await;
                    }
                }
            }
        }

        if last_depth_log.elapsed() >= Duration::from_secs(60) {
            if let Ok(counts) = store.counts().await {
                info!(
                    ready = counts.ready,
                    working = counts.working,
                    failed = counts.failed,
                    "queue depth"
                );
            }
            last_depth_log = Instant::now();
        }
    }

    Ok(())
}

/// One reservation cycle. Returns whether a job was claimed, so the caller
/// knows to poll again immediately instead of sleeping.
async fn run_once(
    store: &dyn JobStore,
    codec: &dyn PayloadCodec,
    worker: &Worker,
    max_run_time: Duration,
    max_attempts: i32,
) -> anyhow::Result<bool> {
    let Some(mut job) = store.reserve(worker, max_run_time).await? else {
        return Ok(false);
    };
    info!(job = job.id, attempts = job.attempts, "reserved job");

    match job.invoke_job(codec).await {
        Ok(()) => {
            store.destroy(&job).await?;
            info!(job = job.id, "completed job");
        }
        Err(err) => {
            warn!(job = job.id, error = %err, "job failed");
            job.record_failure(&err.to_string());
            if job.attempts >= max_attempts {
                job.fail(store.db_time_now());
            } else {
                let delay = i64::from(job.attempts).pow(4) + 5;
                job.run_at = store.db_time_now() + chrono::Duration::seconds(delay);
            }
            store.save(&mut job).await?;
        }
    }

    Ok(true)
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    env_string(key).and_then(|v| v.parse().ok())
}

fn env_bool(key: &str) -> bool {
    env_string(key)
        .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(false)
}
