//! Runtime configuration loaded from the environment.
//!
//! All knobs have defaults that work for tests; production overrides them via
//! env vars (a `.env` file is honored when present).

use std::env;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    /// Path to the SQLite database file. `:memory:` is allowed.
    pub db_path: String,
    /// Time-to-live for idempotency reservations.
    pub idempotency_ttl: Duration,
    /// Max attempts for transient storage errors (busy, timeout).
    pub retry_attempts: u32,
    /// Base backoff for the first retry; doubles per attempt, with jitter.
    pub retry_backoff_base: Duration,
    /// Interval between tentative-voucher sweep passes.
    pub voucher_sweep_interval: Duration,
    /// Interval between breeder-filing compliance recomputation passes.
    pub compliance_sweep_interval: Duration,
    /// Per-statement busy timeout handed to SQLite.
    pub statement_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: "wvsnp.db".to_string(),
            idempotency_ttl: Duration::from_secs(24 * 60 * 60),
            retry_attempts: 3,
            retry_backoff_base: Duration::from_millis(100),
            voucher_sweep_interval: Duration::from_secs(60),
            compliance_sweep_interval: Duration::from_secs(300),
            statement_timeout: Duration::from_secs(5),
        }
    }
}

impl Config {
    /// Load configuration from the environment, falling back to defaults.
    pub fn from_env() -> Self {
        dotenv::dotenv().ok();
        let d = Self::default();
        Self {
            db_path: env::var("WVSNP_DB_PATH").unwrap_or(d.db_path),
            idempotency_ttl: env_secs("WVSNP_IDEMPOTENCY_TTL_SECS", d.idempotency_ttl),
            retry_attempts: env::var("WVSNP_RETRY_ATTEMPTS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(d.retry_attempts),
            retry_backoff_base: env_millis("WVSNP_RETRY_BACKOFF_MS", d.retry_backoff_base),
            voucher_sweep_interval: env_secs("WVSNP_VOUCHER_SWEEP_SECS", d.voucher_sweep_interval),
            compliance_sweep_interval: env_secs(
                "WVSNP_COMPLIANCE_SWEEP_SECS",
                d.compliance_sweep_interval,
            ),
            statement_timeout: env_millis("WVSNP_STATEMENT_TIMEOUT_MS", d.statement_timeout),
        }
    }
}

fn env_secs(key: &str, default: Duration) -> Duration {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .map(Duration::from_secs)
        .unwrap_or(default)
}

fn env_millis(key: &str, default: Duration) -> Duration {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .map(Duration::from_millis)
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let c = Config::default();
        assert_eq!(c.retry_attempts, 3);
        assert_eq!(c.retry_backoff_base, Duration::from_millis(100));
        assert!(c.idempotency_ttl >= Duration::from_secs(3600));
    }
}
