use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{info, Instrument};

use crate::clock::lock_cutoff;
use crate::payload::PayloadCodec;

/// One row of `<prefix>delayed_jobs`.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Job {
    pub id: i64,
    pub priority: i32,
    pub attempts: i32,
    pub handler: String,
    pub last_error: Option<String>,
    pub run_at: DateTime<Utc>,
    pub locked_at: Option<DateTime<Utc>>,
    pub locked_by: Option<String>,
    pub failed_at: Option<DateTime<Utc>>,
    pub queue: Option<String>,
    pub singleton: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A resolved row ready to insert; produced by the enqueue path.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub priority: i32,
    pub handler: String,
    pub run_at: DateTime<Utc>,
    pub queue: Option<String>,
    pub singleton: Option<String>,
    pub failed_at: Option<DateTime<Utc>>,
    pub locked_at: Option<DateTime<Utc>>,
    pub locked_by: Option<String>,
}

impl Job {
    /// True when the lease pair is live at `now` under lease `max_run_time`.
    pub fn locked(&self, now: DateTime<Utc>, max_run_time: Duration) -> bool {
        match (self.locked_at, &self.locked_by) {
            (Some(at), Some(_)) => at >= lock_cutoff(now, max_run_time),
            _ => false,
        }
    }

    pub fn failed(&self) -> bool {
        self.failed_at.is_some()
    }

    /// Clears the lease pair; `locked_at` and `locked_by` are set and
    /// cleared together.
    pub fn unlock(&mut self) {
        self.locked_at = None;
        self.locked_by = None;
    }

    /// Bookkeeping for a transient failure: one more attempt, the error
    /// trace, lease released.
    pub fn record_failure(&mut self, error: &str) {
        self.attempts += 1;
        self.last_error = Some(error.to_string());
        self.unlock();
    }

    /// Marks the job permanently failed and releases the lease.
    pub fn fail(&mut self, now: DateTime<Utc>) {
        self.failed_at = Some(now);
        self.unlock();
    }

    /// Decodes the handler and runs it inside a span tagged with the job,
    /// logging entry and exit around the payload's own output.
    pub async fn invoke_job(&self, codec: &dyn PayloadCodec) -> anyhow::Result<()> {
        let payload = codec.decode(&self.handler)?;
        let span = tracing::info_span!(
            "job",
            id = self.id,
            kind = payload.kind(),
            queue = self.queue.as_deref().unwrap_or("")
        );
        async {
            info!("Entering job");
            let result = payload.perform().await;
            info!("Exiting job");
            result
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn job() -> Job {
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        Job {
            id: 1,
            priority: 0,
            attempts: 0,
            handler: String::new(),
            last_error: None,
            run_at: at,
            locked_at: None,
            locked_by: None,
            failed_at: None,
            queue: None,
            singleton: None,
            created_at: at,
            updated_at: at,
        }
    }

    #[test]
    fn lease_liveness_tracks_the_cutoff() {
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let lease = Duration::from_secs(60);

        let mut job = job();
        assert!(!job.locked(now, lease));

        job.locked_at = Some(now - chrono::Duration::seconds(30));
        job.locked_by = Some("w1".to_string());
        assert!(job.locked(now, lease));

        job.locked_at = Some(now - chrono::Duration::seconds(90));
        assert!(!job.locked(now, lease));
    }

    #[test]
    fn failure_bookkeeping_releases_the_lease() {
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let mut job = job();
        job.locked_at = Some(now);
        job.locked_by = Some("w1".to_string());

        job.record_failure("boom");
        assert_eq!(job.attempts, 1);
        assert_eq!(job.last_error.as_deref(), Some("boom"));
        assert!(job.locked_at.is_none() && job.locked_by.is_none());

        job.fail(now);
        assert!(job.failed());
    }
}
