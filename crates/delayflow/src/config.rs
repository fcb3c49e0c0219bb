use std::str::FromStr;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use crate::clock::TimeMode;

pub const DEFAULT_MAX_RUN_TIME: Duration = Duration::from_secs(4 * 60 * 60);

/// Process-wide reservation settings.
///
/// Read-mostly state: stores take a [`SharedSettings`] handle and re-read
/// it on every operation, so tests (and live reconfiguration) can rebind
/// any field between calls.
#[derive(Clone, Debug)]
pub struct Settings {
    /// Prepended to `delayed_jobs` to form the table name.
    pub table_prefix: String,
    pub time_mode: TimeMode,
    /// Queues this process reserves from; empty means all queues.
    pub queues: Vec<String>,
    pub min_priority: Option<i32>,
    pub max_priority: Option<i32>,
    /// Lease duration after which a still-locked job counts as abandoned.
    pub max_run_time: Duration,
}

pub type SharedSettings = Arc<RwLock<Settings>>;

impl Default for Settings {
    fn default() -> Self {
        Self {
            table_prefix: String::new(),
            time_mode: TimeMode::Utc,
            queues: Vec::new(),
            min_priority: None,
            max_priority: None,
            max_run_time: DEFAULT_MAX_RUN_TIME,
        }
    }
}

impl Settings {
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();

        let mut settings = Settings::default();

        if let Some(prefix) = env_string("DELAYFLOW_TABLE_PREFIX") {
            settings.table_prefix = prefix;
        }
        if let Some(mode) = env_string("DELAYFLOW_TIME_MODE").and_then(|v| TimeMode::parse(&v)) {
            settings.time_mode = mode;
        }
        if let Some(raw) = env_string("DELAYFLOW_QUEUES") {
            settings.queues = split_queues(&raw);
        }
        settings.min_priority = env_parse("DELAYFLOW_MIN_PRIORITY");
        settings.max_priority = env_parse("DELAYFLOW_MAX_PRIORITY");
        if let Some(secs) = env_parse::<u64>("DELAYFLOW_MAX_RUN_TIME_SECONDS") {
            settings.max_run_time = Duration::from_secs(secs);
        }

        settings
    }

    /// `<prefix>delayed_jobs`. Computed on every call so a repointed
    /// prefix takes effect on the next operation.
    pub fn table_name(&self) -> String {
        format!("{}delayed_jobs", self.table_prefix)
    }

    pub fn into_shared(self) -> SharedSettings {
        Arc::new(RwLock::new(self))
    }
}

/// Clones the current settings out of the shared handle.
pub fn snapshot(settings: &SharedSettings) -> Settings {
    settings
        .read()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .clone()
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

fn split_queues(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|q| !q.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_name_uses_live_prefix() {
        let mut settings = Settings::default();
        assert_eq!(settings.table_name(), "delayed_jobs");
        settings.table_prefix = "test_".to_string();
        assert_eq!(settings.table_name(), "test_delayed_jobs");
    }

    #[test]
    fn queue_lists_are_trimmed_and_pruned() {
        assert_eq!(
            split_queues("mailers, billing ,,  "),
            vec!["mailers".to_string(), "billing".to_string()]
        );
        assert!(split_queues("").is_empty());
    }
}
