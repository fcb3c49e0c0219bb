use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::PgPool;

use crate::clock::{lock_cutoff, Clock};
use crate::config::{self, SharedSettings, Settings};
use crate::db;
use crate::error::Result;
use crate::jobs::model::Job;
use crate::jobs::retry::{retry_on_deadlock, MAX_ATTEMPTS};
use crate::jobs::sql::{self, bind_eligibility, Dialect};
use crate::jobs::store::{
    resolve_new_job, shape_for, singleton_cleanup_class, Counts, EnqueueOptions, JobStore, Worker,
};
use crate::payload::{Payload, PayloadCodec};

const DIALECT: Dialect = Dialect::Postgres;

/// PostgreSQL store. The claim is a single statement: the `FOR UPDATE` in
/// the id subselect serializes concurrent reservers, and `RETURNING *`
/// hands back the claimed row, so this path needs no deadlock-retry
/// wrapping.
pub struct PgStore {
    url: String,
    pool: RwLock<PgPool>,
    settings: SharedSettings,
    codec: Option<Arc<dyn PayloadCodec>>,
}

impl PgStore {
    pub(crate) async fn connect(
        url: &str,
        settings: SharedSettings,
        codec: Option<Arc<dyn PayloadCodec>>,
    ) -> Result<Self> {
        let pool = db::pg_pool(url).await?;
        Ok(Self {
            url: url.to_string(),
            pool: RwLock::new(pool),
            settings,
            codec,
        })
    }

    fn pool(&self) -> PgPool {
        self.pool
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn snapshot(&self) -> Settings {
        config::snapshot(&self.settings)
    }
}

#[async_trait]
impl JobStore for PgStore {
    async fn create_table(&self) -> Result<()> {
        let settings = self.snapshot();
        let base = settings.table_name();
        let table = DIALECT.quote_table(&base);
        let pool = self.pool();

        sqlx::query(&format!(
            "CREATE TABLE IF NOT EXISTS {table} (\
             id BIGSERIAL PRIMARY KEY, \
             priority INTEGER NOT NULL DEFAULT 0, \
             attempts INTEGER NOT NULL DEFAULT 0, \
             handler TEXT NOT NULL, \
             last_error TEXT, \
             run_at TIMESTAMPTZ NOT NULL, \
             locked_at TIMESTAMPTZ, \
             locked_by VARCHAR(255), \
             failed_at TIMESTAMPTZ, \
             queue VARCHAR(255), \
             singleton VARCHAR(255), \
             created_at TIMESTAMPTZ NOT NULL, \
             updated_at TIMESTAMPTZ NOT NULL)"
        ))
        .execute(&pool)
        .await?;

        for (suffix, columns) in [
            ("priority_run_at", "priority, run_at"),
            ("locked_by", "locked_by"),
            ("singleton", "singleton"),
            ("failed_at", "failed_at"),
        ] {
            sqlx::query(&format!(
                "CREATE INDEX IF NOT EXISTS {base}_{suffix} ON {table} ({columns})"
            ))
            .execute(&pool)
            .await?;
        }

        Ok(())
    }

    async fn enqueue(&self, payload: &dyn Payload, options: EnqueueOptions) -> Result<Job> {
        let settings = self.snapshot();
        let clock = Clock::new(settings.time_mode);
        let now = clock.db_time_now();
        let new_job = resolve_new_job(payload, options, now)?;
        let table = DIALECT.quote_table(&settings.table_name());
        let statement = sql::insert(DIALECT, &table);
        let pool = self.pool();

        let job = retry_on_deadlock(MAX_ATTEMPTS, || {
            sqlx::query_as::<_, Job>(&statement)
                .bind(new_job.priority)
                .bind(new_job.handler.clone())
                .bind(new_job.run_at)
                .bind(new_job.queue.clone())
                .bind(new_job.singleton.clone())
                .bind(new_job.failed_at)
                .bind(new_job.locked_at)
                .bind(new_job.locked_by.clone())
                .bind(now)
                .bind(now)
                .fetch_one(&pool)
        })
        .await?;

        Ok(job)
    }

    async fn save(&self, job: &mut Job) -> Result<()> {
        let settings = self.snapshot();
        let clock = Clock::new(settings.time_mode);
        let table = DIALECT.quote_table(&settings.table_name());
        let statement = sql::update(DIALECT, &table);
        let pool = self.pool();

        job.updated_at = clock.db_time_now();
        retry_on_deadlock(MAX_ATTEMPTS, || {
            sqlx::query(&statement)
                .bind(job.priority)
                .bind(job.attempts)
                .bind(job.handler.clone())
                .bind(job.last_error.clone())
                .bind(job.run_at)
                .bind(job.queue.clone())
                .bind(job.singleton.clone())
                .bind(job.failed_at)
                .bind(job.locked_at)
                .bind(job.locked_by.clone())
                .bind(job.updated_at)
                .bind(job.id)
                .execute(&pool)
        })
        .await?;

        Ok(())
    }

    async fn destroy(&self, job: &Job) -> Result<()> {
        let settings = self.snapshot();
        let table = DIALECT.quote_table(&settings.table_name());
        let siblings = sql::delete_singleton_siblings(DIALECT, &table);
        let delete = sql::delete(DIALECT, &table);
        let pool = self.pool();

        let cleanup = singleton_cleanup_class(job, self.codec.as_deref());
        retry_on_deadlock(MAX_ATTEMPTS, || async {
            if let Some(singleton) = &cleanup {
                sqlx::query(&siblings)
                    .bind(singleton.clone())
                    .bind(job.id)
                    .execute(&pool)
                    .await?;
            }
            sqlx::query(&delete).bind(job.id).execute(&pool).await?;
            Ok::<_, sqlx::Error>(())
        })
        .await?;

        Ok(())
    }

    async fn reserve(&self, worker: &Worker, max_run_time: Duration) -> Result<Option<Job>> {
        let settings = self.snapshot();
        let clock = Clock::new(settings.time_mode);
        let now = clock.db_time_now();
        let cutoff = lock_cutoff(now, max_run_time);
        let table = DIALECT.quote_table(&settings.table_name());
        let statement = sql::claim_postgres(&table, shape_for(&settings));

        let query = sqlx::query_as::<_, Job>(&statement)
            .bind(now)
            .bind(worker.name.clone());
        let query = bind_eligibility!(query, now, cutoff, worker, settings);
        let job = query.fetch_optional(&self.pool()).await?;
        Ok(job)
    }

    async fn clear_locks(&self, worker_name: &str) -> Result<()> {
        let settings = self.snapshot();
        let table = DIALECT.quote_table(&settings.table_name());
        let statement = sql::clear_locks(DIALECT, &table);
        let pool = self.pool();

        retry_on_deadlock(MAX_ATTEMPTS, || {
            sqlx::query(&statement)
                .bind(worker_name.to_string())
                .execute(&pool)
        })
        .await?;

        Ok(())
    }

    async fn counts(&self) -> Result<Counts> {
        let settings = self.snapshot();
        let clock = Clock::new(settings.time_mode);
        let now = clock.db_time_now();
        let cutoff = lock_cutoff(now, settings.max_run_time);
        let table = DIALECT.quote_table(&settings.table_name());
        let pool = self.pool();

        let ready: i64 = sqlx::query_scalar(&sql::count_ready(DIALECT, &table))
            .bind(now)
            .bind(cutoff)
            .fetch_one(&pool)
            .await?;
        let working: i64 = sqlx::query_scalar(&sql::count_working(DIALECT, &table))
            .bind(cutoff)
            .fetch_one(&pool)
            .await?;
        let failed: i64 = sqlx::query_scalar(&sql::count_failed(DIALECT, &table))
            .fetch_one(&pool)
            .await?;

        Ok(Counts {
            ready,
            working,
            failed,
        })
    }

    async fn before_fork(&self) {
        self.pool().close().await;
    }

    async fn after_fork(&self) -> Result<()> {
        let pool = db::pg_pool(&self.url).await?;
        *self
            .pool
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = pool;
        Ok(())
    }

    fn settings(&self) -> &SharedSettings {
        &self.settings
    }

    fn clock(&self) -> Clock {
        Clock::new(self.snapshot().time_mode)
    }
}
