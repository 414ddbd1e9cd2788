//! Retry policy and cancellable sleep for stackrun.
//!
//! The engine invoker retries a failed command only when the captured
//! output matches one of the configured retryable-error patterns, sleeping
//! a fixed interval between attempts. The sleep must honor run
//! cancellation, so this crate also provides [`CancelToken`], a
//! condvar-backed token whose `sleep` returns early when any worker
//! cancels the run.
//!
//! # Example
//!
//! ```
//! use stackrun_retry::RetryPolicy;
//!
//! let policy = RetryPolicy {
//!     retryable_errors: vec!["(?s).*temporary network error.*".to_string()],
//!     ..RetryPolicy::default()
//! };
//! let compiled = policy.compile().expect("valid patterns");
//! assert!(compiled.is_retryable("error: temporary network error on fetch"));
//! assert!(!compiled.is_retryable("error: invalid resource name"));
//! ```

use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Default attempt budget per unit.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Default sleep between attempts.
pub const DEFAULT_SLEEP_INTERVAL: Duration = Duration::from_secs(5);

/// Patterns that cover transient engine failures seen in the wild. Units
/// override or extend this list via `retryable_errors` in their config.
pub const DEFAULT_RETRYABLE_ERRORS: &[&str] = &[
    "(?s).*Failed to load state.*tcp.*timeout.*",
    "(?s).*Failed to load backend.*TLS handshake timeout.*",
    "(?s).*Creating metric alarm failed.*request to update this alarm is in progress.*",
    "(?s).*Error installing provider.*TLS handshake timeout.*",
    "(?s).*Error configuring the backend.*TLS handshake timeout.*",
    "(?s).*Error installing provider.*tcp.*timeout.*",
    "(?s).*Error installing provider.*tcp.*connection reset by peer.*",
    "NoSuchBucket: The specified bucket does not exist",
    "(?s).*Error creating NAT Gateway.*timeout while waiting for state to become.*",
    "(?s).*Client\\.Timeout exceeded while awaiting headers.*",
    "(?s).*Could not download module.*The requested URL returned error: 429.*",
];

/// Retry configuration resolved for one unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum attempts before giving up (first run counts as attempt 1).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Fixed delay between attempts.
    #[serde(default = "default_sleep_interval")]
    #[serde(with = "humantime_serde")]
    pub sleep_interval: Duration,
    /// Regex patterns matched against the combined stdout/stderr of a
    /// failed attempt; any match marks the failure retryable.
    #[serde(default = "default_retryable_errors")]
    pub retryable_errors: Vec<String>,
}

fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}

fn default_sleep_interval() -> Duration {
    DEFAULT_SLEEP_INTERVAL
}

fn default_retryable_errors() -> Vec<String> {
    DEFAULT_RETRYABLE_ERRORS
        .iter()
        .map(|s| s.to_string())
        .collect()
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            sleep_interval: default_sleep_interval(),
            retryable_errors: default_retryable_errors(),
        }
    }
}

impl RetryPolicy {
    /// Compile the patterns once per unit.
    pub fn compile(&self) -> Result<CompiledRetryPolicy, InvalidPattern> {
        let matchers = self
            .retryable_errors
            .iter()
            .map(|pattern| {
                Regex::new(pattern).map_err(|source| InvalidPattern {
                    pattern: pattern.clone(),
                    source,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(CompiledRetryPolicy {
            max_attempts: self.max_attempts.max(1),
            sleep_interval: self.sleep_interval,
            matchers,
        })
    }
}

/// A retryable-errors pattern that failed to compile.
#[derive(Debug, thiserror::Error)]
#[error("invalid retryable_errors pattern '{pattern}': {source}")]
pub struct InvalidPattern {
    pub pattern: String,
    #[source]
    pub source: regex::Error,
}

/// A [`RetryPolicy`] with its patterns compiled.
#[derive(Debug)]
pub struct CompiledRetryPolicy {
    pub max_attempts: u32,
    pub sleep_interval: Duration,
    matchers: Vec<Regex>,
}

impl CompiledRetryPolicy {
    /// Whether a failed attempt's combined output marks it transient.
    pub fn is_retryable(&self, output: &str) -> bool {
        self.matchers.iter().any(|m| m.is_match(output))
    }
}

/// Cancellation signal shared by every worker of a run.
///
/// The first `cancel` wins; later calls keep the original cause. Sleeps
/// taken through the token return early as soon as any thread cancels.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

#[derive(Debug, Default)]
struct CancelInner {
    cause: Mutex<Option<String>>,
    condvar: Condvar,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancel the run, recording `cause` if no earlier cause exists.
    pub fn cancel(&self, cause: &str) {
        let mut guard = self.inner.cause.lock().expect("cancel lock poisoned");
        if guard.is_none() {
            *guard = Some(cause.to_string());
        }
        drop(guard);
        self.inner.condvar.notify_all();
    }

    /// Whether any thread has cancelled the run.
    pub fn is_cancelled(&self) -> bool {
        self.inner
            .cause
            .lock()
            .expect("cancel lock poisoned")
            .is_some()
    }

    /// The recorded cancellation cause, if any.
    pub fn cause(&self) -> Option<String> {
        self.inner
            .cause
            .lock()
            .expect("cancel lock poisoned")
            .clone()
    }

    /// Sleep for `duration`, returning early with the cause on
    /// cancellation. `Ok(())` means the full duration elapsed.
    pub fn sleep(&self, duration: Duration) -> Result<(), String> {
        let deadline = std::time::Instant::now() + duration;
        let mut guard = self.inner.cause.lock().expect("cancel lock poisoned");
        loop {
            if let Some(cause) = guard.as_ref() {
                return Err(cause.clone());
            }
            let now = std::time::Instant::now();
            if now >= deadline {
                return Ok(());
            }
            let (next, _timeout) = self
                .inner
                .condvar
                .wait_timeout(guard, deadline - now)
                .expect("cancel lock poisoned");
            guard = next;
        }
    }
}
