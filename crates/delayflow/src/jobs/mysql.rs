use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDateTime;
use sqlx::mysql::{MySqlPool, MySqlRow};
use sqlx::Row;

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

const DIALECT: Dialect = Dialect::MySql;

/// MySQL store.
///
/// `DATETIME` has whole-second precision and no zone, so every timestamp
/// crossing this boundary is rendered through the clock's configured zone
/// and truncated to seconds; the re-select after the claim matches the
/// lease pair by equality and would miss otherwise. The claim itself is
/// the two-step `UPDATE ... ORDER BY ... LIMIT 1` + re-select, and the
/// mutating step runs under the deadlock-retry wrapper: the singleton
/// subquery is not atomic with the outer update, and MySQL resolves that
/// race by killing one side.
pub struct MySqlStore {
    url: String,
    pool: RwLock<MySqlPool>,
    settings: SharedSettings,
    codec: Option<Arc<dyn PayloadCodec>>,
}

impl MySqlStore {
    pub(crate) async fn connect(
        url: &str,
        settings: SharedSettings,
        codec: Option<Arc<dyn PayloadCodec>>,
    ) -> Result<Self> {
        let pool = db::mysql_pool(url).await?;
        Ok(Self {
            url: url.to_string(),
            pool: RwLock::new(pool),
            settings,
            codec,
        })
    }

    fn pool(&self) -> MySqlPool {
        self.pool
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn snapshot(&self) -> Settings {
        config::snapshot(&self.settings)
    }
}

fn job_from_row(row: &MySqlRow, clock: &Clock) -> std::result::Result<Job, sqlx::Error> {
    let optional = |column: &str| -> std::result::Result<Option<NaiveDateTime>, sqlx::Error> {
        row.try_get::<Option<NaiveDateTime>, _>(column)
    };
    Ok(Job {
        id: row.try_get("id")?,
        priority: row.try_get("priority")?,
        attempts: row.try_get("attempts")?,
        handler: row.try_get("handler")?,
        last_error: row.try_get("last_error")?,
        run_at: clock.from_wall(row.try_get::<NaiveDateTime, _>("run_at")?),
        locked_at: optional("locked_at")?.map(|at| clock.from_wall(at)),
        locked_by: row.try_get("locked_by")?,
        failed_at: optional("failed_at")?.map(|at| clock.from_wall(at)),
        queue: row.try_get("queue")?,
        singleton: row.try_get("singleton")?,
        created_at: clock.from_wall(row.try_get::<NaiveDateTime, _>("created_at")?),
        updated_at: clock.from_wall(row.try_get::<NaiveDateTime, _>("updated_at")?),
    })
}

#[async_trait]
impl JobStore for MySqlStore {
    async fn create_table(&self) -> Result<()> {
        let settings = self.snapshot();
        let base = settings.table_name();
        let table = DIALECT.quote_table(&base);
        let pool = self.pool();

        // Index definitions ride inside CREATE TABLE because MySQL has no
        // CREATE INDEX IF NOT EXISTS.
        sqlx::query(&format!(
            "CREATE TABLE IF NOT EXISTS {table} (\
             id BIGINT NOT NULL PRIMARY KEY AUTO_INCREMENT, \
             priority INT NOT NULL DEFAULT 0, \
             attempts INT NOT NULL DEFAULT 0, \
             handler LONGTEXT NOT NULL, \
             last_error LONGTEXT, \
             run_at DATETIME NOT NULL, \
             locked_at DATETIME, \
             locked_by VARCHAR(255), \
             failed_at DATETIME, \
             queue VARCHAR(255), \
             singleton VARCHAR(255), \
             created_at DATETIME NOT NULL, \
             updated_at DATETIME NOT NULL, \
             INDEX {base}_priority_run_at (priority, run_at), \
             INDEX {base}_locked_by (locked_by), \
             INDEX {base}_singleton (singleton), \
             INDEX {base}_failed_at (failed_at))"
        ))
        .execute(&pool)
        .await?;

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

        let now_wall = clock.to_wall(now);
        let run_at = clock.to_wall(new_job.run_at);
        let failed_at = new_job.failed_at.map(|at| clock.to_wall(at));
        let locked_at = new_job.locked_at.map(|at| clock.to_wall(at));

        let inserted = retry_on_deadlock(MAX_ATTEMPTS, || {
            sqlx::query(&statement)
                .bind(new_job.priority)
                .bind(new_job.handler.clone())
                .bind(run_at)
                .bind(new_job.queue.clone())
                .bind(new_job.singleton.clone())
                .bind(failed_at)
                .bind(locked_at)
                .bind(new_job.locked_by.clone())
                .bind(now_wall)
                .bind(now_wall)
                .execute(&pool)
        })
        .await?;

        let id = inserted.last_insert_id() as i64;
        let row = sqlx::query(&sql::select_by_id(DIALECT, &table))
            .bind(id)
            .fetch_one(&pool)
            .await?;
        Ok(job_from_row(&row, &clock)?)
    }

    async fn save(&self, job: &mut Job) -> Result<()> {
        let settings = self.snapshot();
        let clock = Clock::new(settings.time_mode);
        let table = DIALECT.quote_table(&settings.table_name());
        let statement = sql::update(DIALECT, &table);
        let pool = self.pool();

        job.updated_at = clock.db_time_now();
        let run_at = clock.to_wall(job.run_at);
        let failed_at = job.failed_at.map(|at| clock.to_wall(at));
        let locked_at = job.locked_at.map(|at| clock.to_wall(at));
        let updated_at = clock.to_wall(job.updated_at);

        retry_on_deadlock(MAX_ATTEMPTS, || {
            sqlx::query(&statement)
                .bind(job.priority)
                .bind(job.attempts)
                .bind(job.handler.clone())
                .bind(job.last_error.clone())
                .bind(run_at)
                .bind(job.queue.clone())
                .bind(job.singleton.clone())
                .bind(failed_at)
                .bind(locked_at)
                .bind(job.locked_by.clone())
                .bind(updated_at)
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
        let now_wall = clock.to_wall(now);
        let cutoff_wall = clock.to_wall(lock_cutoff(now, max_run_time));
        let table = DIALECT.quote_table(&settings.table_name());
        let statement = sql::claim_mysql_update(&table, shape_for(&settings));
        let pool = self.pool();

        let claimed = retry_on_deadlock(MAX_ATTEMPTS, || {
            let query = sqlx::query(&statement)
                .bind(now_wall)
                .bind(worker.name.clone());
            bind_eligibility!(query, now_wall, cutoff_wall, worker, settings).execute(&pool)
        })
        .await?;

        if claimed.rows_affected() == 0 {
            return Ok(None);
        }

        let reselect = sql::reselect_claimed(DIALECT, &table);
        let row = sqlx::query(&reselect)
            .bind(now_wall)
            .bind(worker.name.clone())
            .fetch_optional(&pool)
            .await?;
        Ok(row.map(|row| job_from_row(&row, &clock)).transpose()?)
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
        let now_wall = clock.to_wall(now);
        let cutoff_wall = clock.to_wall(lock_cutoff(now, settings.max_run_time));
        let table = DIALECT.quote_table(&settings.table_name());
        let pool = self.pool();

        let ready: i64 = sqlx::query_scalar(&sql::count_ready(DIALECT, &table))
            .bind(now_wall)
            .bind(cutoff_wall)
            .fetch_one(&pool)
            .await?;
        let working: i64 = sqlx::query_scalar(&sql::count_working(DIALECT, &table))
            .bind(cutoff_wall)
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
        let pool = db::mysql_pool(&self.url).await?;
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
