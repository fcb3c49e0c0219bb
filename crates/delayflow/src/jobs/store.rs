use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::clock::Clock;
use crate::config::{SharedSettings, Settings};
use crate::error::{Error, Result};
use crate::jobs::generic::SqliteStore;
use crate::jobs::model::{Job, NewJob};
use crate::jobs::mysql::MySqlStore;
use crate::jobs::postgres::PgStore;
use crate::jobs::sql::FilterShape;
use crate::payload::{Payload, PayloadCodec};

pub const DEFAULT_READ_AHEAD: i64 = 5;

/// Identity a reservation runs under.
#[derive(Debug, Clone)]
pub struct Worker {
    /// Unique non-empty name across the fleet; written to `locked_by`.
    pub name: String,
    /// How many candidates the generic fallback fetches per attempt;
    /// ignored by the backends with an atomic claim statement.
    pub read_ahead: i64,
}

impl Worker {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            read_ahead: DEFAULT_READ_AHEAD,
        }
    }
}

/// Caller-supplied row fields for [`JobStore::enqueue`]. Everything is
/// optional; see [`resolve_new_job`] for the defaulting rules.
#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    pub priority: Option<i32>,
    pub run_at: Option<DateTime<Utc>>,
    pub queue: Option<String>,
    pub failed_at: Option<DateTime<Utc>>,
    pub locked_at: Option<DateTime<Utc>>,
    pub locked_by: Option<String>,
    pub handler: Option<String>,
    pub singleton: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Counts {
    pub ready: i64,
    pub working: i64,
    pub failed: i64,
}

/// One concrete backend per supported database; everything a worker or
/// producer does to the shared table goes through here.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Bootstraps `<prefix>delayed_jobs` and its indices for the current
    /// prefix. Idempotent.
    async fn create_table(&self) -> Result<()>;

    async fn enqueue(&self, payload: &dyn Payload, options: EnqueueOptions) -> Result<Job>;

    async fn save(&self, job: &mut Job) -> Result<()>;

    /// Deletes the job; for singleton jobs, also deletes the pending
    /// duplicates of its class first (skipped with a warning when the
    /// handler no longer decodes).
    async fn destroy(&self, job: &Job) -> Result<()>;

    /// Atomically claims the next eligible job for `worker`, or returns
    /// `None` when there is no work.
    async fn reserve(&self, worker: &Worker, max_run_time: Duration) -> Result<Option<Job>>;

    /// Releases every lease held by `worker_name`; called on orderly
    /// shutdown so singleton siblings unblock without waiting out the
    /// lease.
    async fn clear_locks(&self, worker_name: &str) -> Result<()>;

    async fn counts(&self) -> Result<Counts>;

    /// Closes the connection pool ahead of a process fork.
    async fn before_fork(&self);

    /// Re-establishes the pool in the child after a fork.
    async fn after_fork(&self) -> Result<()>;

    fn settings(&self) -> &SharedSettings;

    fn clock(&self) -> Clock;

    fn db_time_now(&self) -> DateTime<Utc> {
        self.clock().db_time_now()
    }
}

/// Resolves payload and options into an insertable row. The payload's
/// singleton capability wins over a caller-supplied `singleton`; a
/// caller-supplied `handler` wins over encoding the payload; `run_at`
/// defaults to the current clock.
pub(crate) fn resolve_new_job(
    payload: &dyn Payload,
    mut options: EnqueueOptions,
    now: DateTime<Utc>,
) -> Result<NewJob> {
    let handler = match options.handler.take() {
        Some(handler) => handler,
        None => payload.encode()?,
    };
    let singleton = payload.singleton_queue_name().or(options.singleton);
    Ok(NewJob {
        priority: options.priority.unwrap_or(0),
        handler,
        run_at: options.run_at.unwrap_or(now),
        queue: options.queue,
        singleton,
        failed_at: options.failed_at,
        locked_at: options.locked_at,
        locked_by: options.locked_by,
    })
}

/// The singleton class `destroy` should clean up, or `None` to skip. With
/// a codec configured, a handler that no longer decodes skips the cleanup
/// (logged) rather than aborting the destroy.
pub(crate) fn singleton_cleanup_class(
    job: &Job,
    codec: Option<&dyn PayloadCodec>,
) -> Option<String> {
    let singleton = job.singleton.as_ref()?;
    if let Some(codec) = codec {
        if let Err(err) = codec.decode(&job.handler) {
            tracing::warn!(
                job = job.id,
                error = %err,
                "skipping singleton cleanup, handler no longer decodes"
            );
            return None;
        }
    }
    Some(singleton.clone())
}

pub(crate) fn shape_for(settings: &Settings) -> FilterShape {
    FilterShape {
        min_priority: settings.min_priority.is_some(),
        max_priority: settings.max_priority.is_some(),
        queue_count: settings.queues.len(),
    }
}

/// Opens a store for `url`, choosing the backend by URL scheme:
/// `postgres`, `mysql`, or `sqlite` (the generic read-ahead fallback).
pub async fn connect(
    url: &str,
    settings: SharedSettings,
    codec: Option<Arc<dyn PayloadCodec>>,
) -> Result<Arc<dyn JobStore>> {
    let scheme = url.split(':').next().unwrap_or("").to_ascii_lowercase();
    match scheme.as_str() {
        "postgres" | "postgresql" => Ok(Arc::new(PgStore::connect(url, settings, codec).await?)),
        "mysql" | "mysql2" => Ok(Arc::new(MySqlStore::connect(url, settings, codec).await?)),
        "sqlite" => Ok(Arc::new(SqliteStore::connect(url, settings, codec).await?)),
        _ => Err(Error::UnsupportedScheme(scheme)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DeserializationError;
    use async_trait::async_trait;
    use chrono::TimeZone;

    struct Stub {
        singleton: Option<String>,
    }

    #[async_trait]
    impl Payload for Stub {
        fn kind(&self) -> &'static str {
            "stub"
        }

        async fn perform(&self) -> anyhow::Result<()> {
            Ok(())
        }

        fn encode(&self) -> std::result::Result<String, DeserializationError> {
            Ok("encoded-stub".to_string())
        }

        fn singleton_queue_name(&self) -> Option<String> {
            self.singleton.clone()
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn enqueue_defaults_priority_and_run_at() {
        let row = resolve_new_job(&Stub { singleton: None }, EnqueueOptions::default(), now())
            .unwrap();
        assert_eq!(row.priority, 0);
        assert_eq!(row.run_at, now());
        assert_eq!(row.handler, "encoded-stub");
        assert_eq!(row.singleton, None);
    }

    #[test]
    fn payload_capability_overrides_caller_singleton() {
        let options = EnqueueOptions {
            singleton: Some("from-caller".to_string()),
            ..Default::default()
        };
        let row = resolve_new_job(
            &Stub {
                singleton: Some("from-payload".to_string()),
            },
            options,
            now(),
        )
        .unwrap();
        assert_eq!(row.singleton.as_deref(), Some("from-payload"));

        let options = EnqueueOptions {
            singleton: Some("from-caller".to_string()),
            ..Default::default()
        };
        let row = resolve_new_job(&Stub { singleton: None }, options, now()).unwrap();
        assert_eq!(row.singleton.as_deref(), Some("from-caller"));
    }

    #[test]
    fn caller_handler_wins_over_encoding() {
        let options = EnqueueOptions {
            handler: Some("raw-blob".to_string()),
            ..Default::default()
        };
        let row = resolve_new_job(&Stub { singleton: None }, options, now()).unwrap();
        assert_eq!(row.handler, "raw-blob");
    }
}
