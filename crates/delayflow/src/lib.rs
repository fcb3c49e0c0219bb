//! Database-backed job reservation for fleets of delayed-job workers.
//!
//! Producers enqueue rows into a shared `<prefix>delayed_jobs` table;
//! workers compete to atomically claim the next eligible row under
//! readiness time, lock expiry, priority order, queue filters, and
//! singleton-class mutual exclusion. Coordination happens entirely through
//! the table (there is no broadcast channel), and execution is
//! at-least-once: a crashed worker's lease simply expires and the row
//! re-enters the pool.
//!
//! The claim strategy is chosen per backend: a single locking UPDATE on
//! PostgreSQL, a two-step update-then-reselect on MySQL, and an optimistic
//! read-ahead walk on SQLite.

pub mod clock;
pub mod config;
pub(crate) mod db;
pub mod error;
pub mod jobs;
pub mod payload;

pub use clock::{Clock, TimeMode};
pub use config::{Settings, SharedSettings};
pub use error::{DeserializationError, Error, Result, RetryError};
pub use jobs::model::Job;
pub use jobs::store::{connect, Counts, EnqueueOptions, JobStore, Worker};
