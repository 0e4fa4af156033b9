//! SQLite retry logic with exponential backoff.
//!
//! SQLite has no row locks: two write transactions on the same file contend
//! on the database lock and the loser sees `SQLITE_BUSY` (or
//! `SQLITE_BUSY_SNAPSHOT` when its read snapshot went stale under WAL). The
//! retry unit is always a whole operation, re-reading and re-planning from
//! scratch. A failed transaction is never resubmitted with its old deltas.

use std::future::Future;
use std::time::Duration;

use sqlx::Error as SqlxError;

/// Configuration for SQLite retry behavior.
#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Maximum number of retry attempts.
    pub max_retries: u32,
    /// Base delay in milliseconds for exponential backoff.
    pub base_delay_ms: u64,
    /// Maximum delay in milliseconds (caps the exponential growth).
    pub max_delay_ms: u64,
    /// Jitter factor (0.0 to 1.0) to add randomness to delays.
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay_ms: 20,
            max_delay_ms: 1000,
            jitter_factor: 0.2,
        }
    }
}

impl RetryConfig {
    pub fn new(max_retries: u32, base_delay_ms: u64, max_delay_ms: u64) -> Self {
        Self {
            max_retries,
            base_delay_ms,
            max_delay_ms,
            jitter_factor: 0.2,
        }
    }

    /// Read overrides from `TB_RETRY_MAX`, `TB_RETRY_BASE_MS` and
    /// `TB_RETRY_MAX_DELAY_MS`, falling back to the defaults.
    pub fn from_env() -> Self {
        fn var<T: std::str::FromStr>(name: &str) -> Option<T> {
            std::env::var(name).ok().and_then(|v| v.parse().ok())
        }

        let default = Self::default();
        Self {
            max_retries: var("TB_RETRY_MAX").unwrap_or(default.max_retries),
            base_delay_ms: var("TB_RETRY_BASE_MS").unwrap_or(default.base_delay_ms),
            max_delay_ms: var("TB_RETRY_MAX_DELAY_MS").unwrap_or(default.max_delay_ms),
            jitter_factor: default.jitter_factor,
        }
    }

    fn calculate_delay(&self, attempt: u32) -> Duration {
        let base_delay = self
            .base_delay_ms
            .saturating_mul(2u64.saturating_pow(attempt));
        let capped_delay = base_delay.min(self.max_delay_ms);

        let jitter = if self.jitter_factor > 0.0 {
            let jitter_range = (capped_delay as f64 * self.jitter_factor) as u64;
            if jitter_range > 0 {
                let now = std::time::SystemTime::now()
                    .duration_since(std::time::UNIX_EPOCH)
                    .unwrap_or_default()
                    .subsec_nanos() as u64;
                now % jitter_range
            } else {
                0
            }
        } else {
            0
        };

        Duration::from_millis(capped_delay + jitter)
    }
}

/// Whether a raw SQLite result code is transient.
///
/// The primary code lives in the low byte; extended codes such as
/// `SQLITE_BUSY_SNAPSHOT` (517) or `SQLITE_IOERR_SHORT_READ` (522) share it.
/// Retryable primaries are BUSY (5), LOCKED (6) and IOERR (10).
pub fn is_retryable_code(code: &str) -> bool {
    code.parse::<u32>()
        .map(|n| matches!(n & 0xFF, 5 | 6 | 10))
        .unwrap_or(false)
}

/// Check if an error is a transient SQLite error that should be retried.
pub fn is_retryable_error(e: &SqlxError) -> bool {
    match e {
        SqlxError::Database(db_err) => db_err
            .code()
            .is_some_and(|code| is_retryable_code(code.as_ref())),
        SqlxError::PoolTimedOut => true,
        _ => false,
    }
}

/// Errors that can tell whether the operation that produced them is worth
/// running again.
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

impl Retryable for SqlxError {
    fn is_retryable(&self) -> bool {
        is_retryable_error(self)
    }
}

/// Execute an operation with exponential backoff retry.
///
/// `f` is called afresh on every attempt, so each attempt must open its own
/// transaction and re-read whatever it plans against.
///
/// ```ignore
/// use db::retry::{RetryConfig, with_retry};
///
/// let list = with_retry(&RetryConfig::default(), "reorder_list", || async {
///     service.reorder_list_once(list_id, to, None).await
/// })
/// .await?;
/// ```
pub async fn with_retry<F, Fut, T, E>(
    config: &RetryConfig,
    operation_name: &str,
    mut f: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Retryable + std::fmt::Debug,
{
    let mut attempt = 0;

    loop {
        match f().await {
            Ok(result) => {
                if attempt > 0 {
                    tracing::debug!(
                        operation = operation_name,
                        attempts = attempt + 1,
                        "Operation succeeded after retry"
                    );
                }
                return Ok(result);
            }
            Err(e) if e.is_retryable() && attempt < config.max_retries => {
                let delay = config.calculate_delay(attempt);

                tracing::warn!(
                    operation = operation_name,
                    attempt = attempt + 1,
                    max_retries = config.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    error = ?e,
                    "Transient SQLite error, retrying whole operation"
                );

                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => {
                if attempt > 0 {
                    tracing::error!(
                        operation = operation_name,
                        attempts = attempt + 1,
                        error = ?e,
                        "Operation failed after all retries"
                    );
                }
                return Err(e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    #[derive(Debug)]
    struct Flaky(bool);

    impl Retryable for Flaky {
        fn is_retryable(&self) -> bool {
            self.0
        }
    }

    fn fast() -> RetryConfig {
        RetryConfig {
            max_retries: 3,
            base_delay_ms: 1,
            max_delay_ms: 2,
            jitter_factor: 0.0,
        }
    }

    #[test]
    fn test_calculate_delay_exponential() {
        let config = RetryConfig {
            max_retries: 5,
            base_delay_ms: 100,
            max_delay_ms: 5000,
            jitter_factor: 0.0,
        };

        assert_eq!(config.calculate_delay(0), Duration::from_millis(100));
        assert_eq!(config.calculate_delay(1), Duration::from_millis(200));
        assert_eq!(config.calculate_delay(3), Duration::from_millis(800));
        assert_eq!(config.calculate_delay(6), Duration::from_millis(5000));
        assert_eq!(config.calculate_delay(80), Duration::from_millis(5000));
    }

    #[test]
    fn test_calculate_delay_with_jitter() {
        let config = RetryConfig {
            max_retries: 5,
            base_delay_ms: 100,
            max_delay_ms: 5000,
            jitter_factor: 0.2,
        };

        let delay = config.calculate_delay(0);
        assert!(delay >= Duration::from_millis(100));
        assert!(delay <= Duration::from_millis(120));
    }

    #[test]
    #[serial_test::serial]
    fn test_retry_config_from_env() {
        // SAFETY: Tests run serially via #[serial] attribute
        unsafe {
            std::env::set_var("TB_RETRY_MAX", "2");
            std::env::set_var("TB_RETRY_BASE_MS", "7");
            std::env::set_var("TB_RETRY_MAX_DELAY_MS", "not-a-number");
        }
        let config = RetryConfig::from_env();
        unsafe {
            std::env::remove_var("TB_RETRY_MAX");
            std::env::remove_var("TB_RETRY_BASE_MS");
            std::env::remove_var("TB_RETRY_MAX_DELAY_MS");
        }

        assert_eq!(config.max_retries, 2);
        assert_eq!(config.base_delay_ms, 7);
        assert_eq!(config.max_delay_ms, RetryConfig::default().max_delay_ms);
    }

    #[test]
    fn test_retryable_codes() {
        assert!(is_retryable_code("5"));
        assert!(is_retryable_code("6"));
        assert!(is_retryable_code("517")); // BUSY_SNAPSHOT
        assert!(is_retryable_code("262")); // LOCKED_SHAREDCACHE
        assert!(is_retryable_code("522")); // IOERR_SHORT_READ
        assert!(!is_retryable_code("2067")); // CONSTRAINT_UNIQUE
        assert!(!is_retryable_code("19"));
        assert!(!is_retryable_code("not-a-code"));
    }

    #[tokio::test]
    async fn test_with_retry_reruns_transient_failures() {
        let counter = AtomicU32::new(0);
        let calls = &counter;

        let result: Result<u32, Flaky> = with_retry(&fast(), "flaky", move || async move {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            if n < 2 { Err(Flaky(true)) } else { Ok(n) }
        })
        .await;

        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_with_retry_gives_up_on_permanent_error() {
        let counter = AtomicU32::new(0);
        let calls = &counter;

        let result: Result<(), Flaky> = with_retry(&fast(), "permanent", move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(Flaky(false))
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_with_retry_stops_after_max_retries() {
        let counter = AtomicU32::new(0);
        let calls = &counter;

        let result: Result<(), Flaky> = with_retry(&fast(), "busy", move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(Flaky(true))
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }
}
