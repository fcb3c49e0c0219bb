use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::debug;

use crate::error::RetryError;

/// Retry budget for statements that can deadlock under the singleton
/// subquery (the subquery is not atomic with the outer UPDATE, so the
/// database occasionally kills one side of the race).
pub const MAX_ATTEMPTS: u32 = 10;

const DEADLOCK_MESSAGES: [&str; 2] = [
    "Lock wait timeout exceeded",
    "Deadlock found when trying to get lock",
];

fn is_deadlock(err: &sqlx::Error) -> bool {
    let message = err.to_string();
    DEADLOCK_MESSAGES.iter().any(|m| message.contains(m))
}

/// Runs `op`, retrying while it fails with a lock-wait or deadlock
/// message, sleeping a uniform 0–100 ms between attempts. `max_attempts`
/// counts retries, so the operation runs at most `max_attempts + 1` times.
///
/// Every terminal error, matching or not, surfaces as a [`RetryError`]
/// carrying the driver's message.
pub async fn retry_on_deadlock<T, F, Fut>(max_attempts: u32, mut op: F) -> Result<T, RetryError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, sqlx::Error>>,
{
    let mut remaining = max_attempts;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if is_deadlock(&err) && remaining > 0 => {
                remaining -= 1;
                debug!(remaining, "statement hit lock contention, retrying");
                let jitter = rand::thread_rng().gen_range(0.0..0.1);
                tokio::time::sleep(Duration::from_secs_f64(jitter)).await;
            }
            Err(err) => return Err(RetryError::new(err.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn deadlock() -> sqlx::Error {
        sqlx::Error::Protocol("Deadlock found when trying to get lock; try restarting".to_string())
    }

    /// Fails `failures` times with a deadlock message, then succeeds.
    async fn run_with(failures: u32) -> Result<u32, RetryError> {
        let calls = AtomicU32::new(0);
        retry_on_deadlock(MAX_ATTEMPTS, || {
            let call = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if call < failures {
                    Err(deadlock())
                } else {
                    Ok(call)
                }
            }
        })
        .await
    }

    #[tokio::test]
    async fn passes_a_clean_result_through() {
        assert_eq!(run_with(0).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn survives_ten_consecutive_deadlocks() {
        assert_eq!(run_with(10).await.unwrap(), 10);
    }

    #[tokio::test]
    async fn the_eleventh_deadlock_exhausts_the_budget() {
        let err = run_with(11).await.unwrap_err();
        assert!(
            err.message.contains("Deadlock found when trying to get lock"),
            "unexpected message: {}",
            err.message
        );
    }

    #[tokio::test]
    async fn lock_wait_timeouts_are_retried_too() {
        let calls = AtomicU32::new(0);
        let result = retry_on_deadlock(MAX_ATTEMPTS, || {
            let call = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if call == 0 {
                    Err(sqlx::Error::Protocol(
                        "Lock wait timeout exceeded; try restarting transaction".to_string(),
                    ))
                } else {
                    Ok(())
                }
            }
        })
        .await;
        assert!(result.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn unrelated_errors_are_wrapped_without_retrying() {
        let calls = AtomicU32::new(0);
        let err = retry_on_deadlock::<(), _, _>(MAX_ATTEMPTS, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(sqlx::Error::Protocol("syntax error at or near".to_string())) }
        })
        .await
        .unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(err.message.contains("syntax error"));
    }
}
