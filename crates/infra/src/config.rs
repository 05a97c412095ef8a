//! Ledger configuration.
//!
//! Defaults suit tests and local runs; `from_env` overrides them from
//! `BATCHLEDGER_*` variables.

use std::time::Duration;

use tracing::warn;

/// Shortest reconciliation period a runner will schedule.
pub const MIN_RECONCILIATION_INTERVAL: Duration = Duration::from_millis(10);

/// Bounded optimistic-concurrency retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first (>= 1).
    pub max_attempts: u32,
    /// Sleep before attempt `n + 1` is `backoff * n`.
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff: Duration::from_millis(10),
        }
    }
}

impl RetryPolicy {
    pub fn delay_after(&self, attempt: u32) -> Duration {
        self.backoff.saturating_mul(attempt)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerConfig {
    pub retry: RetryPolicy,
    /// How many batch numbers to try before giving up on a collision streak.
    pub batch_number_attempts: u32,
    pub reconciliation_interval: Duration,
    /// Overwrite drifted projections from the ledger when reconciling.
    pub reconciliation_repair: bool,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            batch_number_attempts: 8,
            reconciliation_interval: Duration::from_secs(300),
            reconciliation_repair: false,
        }
    }
}

impl LedgerConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable source; invalid values fall back to the default.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();

        let max_attempts = parse_or(
            &lookup,
            "BATCHLEDGER_MAX_COMMIT_ATTEMPTS",
            defaults.retry.max_attempts,
        )
        .max(1);
        let backoff_ms = parse_or(
            &lookup,
            "BATCHLEDGER_RETRY_BACKOFF_MS",
            defaults.retry.backoff.as_millis() as u64,
        );
        let batch_number_attempts = parse_or(
            &lookup,
            "BATCHLEDGER_BATCH_NUMBER_ATTEMPTS",
            defaults.batch_number_attempts,
        )
        .max(1);
        let interval_secs = parse_or(
            &lookup,
            "BATCHLEDGER_RECONCILE_INTERVAL_SECS",
            defaults.reconciliation_interval.as_secs(),
        )
        .max(1);
        let repair = parse_or(
            &lookup,
            "BATCHLEDGER_RECONCILE_REPAIR",
            defaults.reconciliation_repair,
        );

        Self {
            retry: RetryPolicy {
                max_attempts,
                backoff: Duration::from_millis(backoff_ms),
            },
            batch_number_attempts,
            reconciliation_interval: Duration::from_secs(interval_secs),
            reconciliation_repair: repair,
        }
    }

    pub fn with_retry(mut self, max_attempts: u32, backoff: Duration) -> Self {
        self.retry = RetryPolicy {
            max_attempts: max_attempts.max(1),
            backoff,
        };
        self
    }

    pub fn with_batch_number_attempts(mut self, attempts: u32) -> Self {
        self.batch_number_attempts = attempts.max(1);
        self
    }

    pub fn with_reconciliation(mut self, interval: Duration, repair: bool) -> Self {
        self.reconciliation_interval = interval.max(MIN_RECONCILIATION_INTERVAL);
        self.reconciliation_repair = repair;
        self
    }
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T
where
    T: core::str::FromStr + core::fmt::Debug,
{
    match lookup(key) {
        None => default,
        Some(raw) => match raw.trim().parse::<T>() {
            Ok(v) => v,
            Err(_) => {
                warn!(key, value = %raw, ?default, "invalid configuration value; using default");
                default
            }
        },
    }
}
