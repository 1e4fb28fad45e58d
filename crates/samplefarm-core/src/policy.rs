//! Per-batch execution policies: in-line retry, the slow failed-task sweep,
//! and the startup recovery scanner.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// A policy value failed validation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid {field}: {reason}")]
pub struct PolicyError {
    /// Offending field, dotted path.
    pub field: &'static str,
    /// Human-readable reason.
    pub reason: String,
}

impl PolicyError {
    fn new(field: &'static str, reason: impl Into<String>) -> Self {
        Self {
            field,
            reason: reason.into(),
        }
    }
}

/// Outcome of consulting a [`RetryPolicy`] after a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Re-arm the work after the given delay.
    RetryAfter(Duration),
    /// No attempts left (or retry disabled).
    Exhausted,
}

/// Fast, per-submission retry policy with exponential backoff.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Whether failures are retried at all.
    pub enabled: bool,
    /// Maximum retry attempts; `0` means unlimited.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub initial_backoff_secs: u64,
    /// Upper bound for any single delay.
    pub max_backoff_secs: u64,
    /// Growth factor between consecutive delays.
    pub backoff_multiplier: f64,
    /// Add uniform random jitter in `[0, delay]`.
    pub jitter: bool,
    /// Case-insensitive substrings that mark a backend rejection as transient.
    pub retryable_error_patterns: Vec<String>,
}

impl RetryPolicy {
    /// Patterns treated as transient when a backend rejects a request.
    pub const DEFAULT_RETRYABLE_PATTERNS: &'static [&'static str] = &[
        "connection",
        "timeout",
        "network",
        "service_unavailable",
        "error sending request",
    ];

    /// A policy that never retries.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    /// Un-jittered delay for the `attempt`-th retry (1-based).
    ///
    /// `min(max_backoff, initial_backoff * multiplier^(attempt-1))`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.max(1) - 1;
        let exponent = i32::try_from(exponent).unwrap_or(i32::MAX);
        let raw = self.initial_backoff_secs as f64 * self.backoff_multiplier.max(1.0).powi(exponent);
        let capped = raw.min(self.max_backoff_secs as f64);
        if capped.is_finite() && capped > 0.0 {
            Duration::from_secs_f64(capped)
        } else {
            Duration::ZERO
        }
    }

    /// Whether the `attempt`-th retry is still within budget.
    pub fn allows(&self, attempt: u32) -> bool {
        self.enabled && (self.max_attempts == 0 || attempt <= self.max_attempts)
    }

    /// Decide what happens after the `attempt`-th consecutive failure.
    pub fn decide(&self, attempt: u32) -> RetryDecision {
        self.decide_with(attempt, &mut rand::rng())
    }

    /// Same as [`RetryPolicy::decide`] with an explicit RNG.
    pub fn decide_with<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> RetryDecision {
        if !self.allows(attempt) {
            return RetryDecision::Exhausted;
        }

        let base = self.backoff(attempt);
        if !self.jitter || base.is_zero() {
            return RetryDecision::RetryAfter(base);
        }

        let extra = rng.random_range(0.0..=base.as_secs_f64());
        let max = Duration::from_secs(self.max_backoff_secs);
        RetryDecision::RetryAfter((base + Duration::from_secs_f64(extra)).min(max))
    }

    /// Whether an error message matches one of the retryable patterns.
    pub fn is_retryable_message(&self, message: &str) -> bool {
        let message = message.to_ascii_lowercase();
        self.retryable_error_patterns
            .iter()
            .map(|p| p.trim().to_ascii_lowercase())
            .any(|p| !p.is_empty() && message.contains(&p))
    }

    /// Check the policy for values that would make backoff meaningless.
    pub fn validate(&self) -> Result<(), PolicyError> {
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return Err(PolicyError::new(
                "retry.backoff_multiplier",
                format!("must be a finite number >= 1.0, got {}", self.backoff_multiplier),
            ));
        }
        if self.max_backoff_secs < self.initial_backoff_secs {
            return Err(PolicyError::new(
                "retry.max_backoff_secs",
                "must be >= initial_backoff_secs",
            ));
        }
        Ok(())
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: 3,
            initial_backoff_secs: 5,
            max_backoff_secs: 300,
            backoff_multiplier: 2.0,
            jitter: true,
            retryable_error_patterns: Self::DEFAULT_RETRYABLE_PATTERNS
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

/// Slow sweep that re-arms sub-tasks which exhausted the in-line retry budget
/// on a transient failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FailedTaskRetryPolicy {
    /// Whether the sweep considers this batch.
    pub enabled: bool,
    /// Maximum sweep re-arms per sub-task; `0` means unlimited.
    pub max_attempts: u32,
    /// Minimum age of the failure before it is re-armed.
    pub initial_delay_secs: u64,
    /// Minimum spacing between two sweep re-arms of the same sub-task.
    pub interval_secs: u64,
}

impl FailedTaskRetryPolicy {
    /// Whether the `sweep`-th re-arm (1-based) is still within budget.
    pub fn allows(&self, sweep: u32) -> bool {
        self.enabled && (self.max_attempts == 0 || sweep <= self.max_attempts)
    }

    /// Age a failure must reach before the next re-arm, given how many
    /// re-arms already happened.
    pub fn due_after(&self, sweeps_done: u32) -> Duration {
        if sweeps_done == 0 {
            Duration::from_secs(self.initial_delay_secs)
        } else {
            Duration::from_secs(self.initial_delay_secs.max(self.interval_secs))
        }
    }

    /// Check the policy for nonsensical values.
    pub fn validate(&self) -> Result<(), PolicyError> {
        if self.enabled && self.interval_secs < 60 {
            return Err(PolicyError::new(
                "failed_retry.interval_secs",
                "must be >= 60 when the sweep is enabled",
            ));
        }
        Ok(())
    }
}

impl Default for FailedTaskRetryPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: 2,
            initial_delay_secs: 600,
            interval_secs: 1800,
        }
    }
}

/// Parameters attached to a batch-execute request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    /// How often outstanding sub-tasks are polled.
    pub poll_interval_secs: u64,
    /// Give up on a remote analysis after this long; `0` disables the limit.
    pub max_wait_secs: u64,
    /// Minimum spacing between two submissions of the same batch.
    pub submit_interval_ms: u64,
    /// In-line retry policy.
    pub retry: RetryPolicy,
    /// Slow sweep policy.
    pub failed_retry: FailedTaskRetryPolicy,
    /// Sandbox machine name (dynamic family).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub machine: Option<String>,
    /// Extra options forwarded to the backend.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<String>,
    /// Label forwarded to the CFG family.
    pub label: i64,
}

impl ExecutionConfig {
    /// Default poll interval.
    pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 15;

    /// Default inter-submission spacing.
    pub const DEFAULT_SUBMIT_INTERVAL_MS: u64 = 1_000;

    /// Poll interval as a duration, never zero.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }

    /// Submission spacing as a duration.
    pub fn submit_interval(&self) -> Duration {
        Duration::from_millis(self.submit_interval_ms)
    }

    /// Maximum remote wait, if limited.
    pub fn max_wait(&self) -> Option<Duration> {
        (self.max_wait_secs > 0).then(|| Duration::from_secs(self.max_wait_secs))
    }

    /// Validate nested policies and bounds.
    pub fn validate(&self) -> Result<(), PolicyError> {
        if self.poll_interval_secs == 0 || self.poll_interval_secs > 3_600 {
            return Err(PolicyError::new(
                "execution.poll_interval_secs",
                "must be between 1 and 3600",
            ));
        }
        if self.max_wait_secs > 0 && self.max_wait_secs < self.poll_interval_secs {
            return Err(PolicyError::new(
                "execution.max_wait_secs",
                "must be 0 or >= poll_interval_secs",
            ));
        }
        self.retry.validate()?;
        self.failed_retry.validate()
    }
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: Self::DEFAULT_POLL_INTERVAL_SECS,
            max_wait_secs: 0,
            submit_interval_ms: Self::DEFAULT_SUBMIT_INTERVAL_MS,
            retry: RetryPolicy::default(),
            failed_retry: FailedTaskRetryPolicy::default(),
            machine: None,
            options: None,
            label: 0,
        }
    }
}

/// Startup recovery scanner settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    /// Whether the scanner runs at all.
    pub enabled: bool,
    /// Delay after process start before the first scan.
    pub initial_delay_secs: u64,
    /// Interval between scans.
    pub scan_interval_secs: u64,
    /// Maximum stuck sub-tasks handled per scan.
    pub batch_size: u32,
    /// Maximum concurrent recovery actions.
    pub global_concurrency: u32,
    /// Age after which a `submitting` sub-task is considered stuck.
    pub stuck_submitting_threshold_secs: u64,
}

impl RecoveryConfig {
    /// Reject values outside the supported ranges.
    pub fn validate(&self) -> Result<(), PolicyError> {
        if self.initial_delay_secs > 300 {
            return Err(PolicyError::new(
                "recovery.initial_delay_secs",
                "must be <= 300",
            ));
        }
        if self.scan_interval_secs < 60 {
            return Err(PolicyError::new(
                "recovery.scan_interval_secs",
                "must be >= 60",
            ));
        }
        if !(1..=100).contains(&self.batch_size) {
            return Err(PolicyError::new(
                "recovery.batch_size",
                "must be between 1 and 100",
            ));
        }
        if !(1..=50).contains(&self.global_concurrency) {
            return Err(PolicyError::new(
                "recovery.global_concurrency",
                "must be between 1 and 50",
            ));
        }
        if self.stuck_submitting_threshold_secs < 120 {
            return Err(PolicyError::new(
                "recovery.stuck_submitting_threshold_secs",
                "must be >= 120",
            ));
        }
        Ok(())
    }

    /// Initial delay as a duration.
    pub fn initial_delay(&self) -> Duration {
        Duration::from_secs(self.initial_delay_secs)
    }

    /// Scan interval as a duration.
    pub fn scan_interval(&self) -> Duration {
        Duration::from_secs(self.scan_interval_secs)
    }

    /// Stuck threshold as a duration.
    pub fn stuck_threshold(&self) -> Duration {
        Duration::from_secs(self.stuck_submitting_threshold_secs)
    }
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            initial_delay_secs: 10,
            scan_interval_secs: 300,
            batch_size: 20,
            global_concurrency: 8,
            stuck_submitting_threshold_secs: 300,
        }
    }
}
