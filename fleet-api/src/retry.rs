//! Retry classification and backoff decisions.
//!
//! Pure logic: the executor owns the loop and the [`RetryContext`]; the
//! policy only looks at the context it is handed.

use std::time::Duration;

use tokio::time::Instant;

use fleet_core::backoff::exponential_delay;
use fleet_core::config::RetryConfig;

use crate::error::ErrorKind;

/// Outcome of a single attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Success,
    AuthExpired,
    RetryableServerError,
    NonRetryableError,
    NetworkError,
}

impl Classification {
    /// Classify an HTTP status. Anything below 400 counts as success.
    pub fn from_status(status: u16) -> Self {
        match status {
            401 => Classification::AuthExpired,
            408 | 429 | 500 | 502 | 503 | 504 => Classification::RetryableServerError,
            s if s >= 400 => Classification::NonRetryableError,
            _ => Classification::Success,
        }
    }

    /// Error kind for a failed attempt, `None` on success.
    pub fn error_kind(&self) -> Option<ErrorKind> {
        match self {
            Classification::Success => None,
            Classification::AuthExpired => Some(ErrorKind::AuthExpired),
            Classification::RetryableServerError => Some(ErrorKind::RetryableServer),
            Classification::NonRetryableError => Some(ErrorKind::NonRetryableClient),
            Classification::NetworkError => Some(ErrorKind::Network),
        }
    }
}

/// Per-operation retry bookkeeping. Never persisted.
#[derive(Debug, Clone)]
pub struct RetryContext {
    /// Retries already performed.
    pub attempt: u32,
    pub last_error: Option<ErrorKind>,
    pub elapsed_ms: u64,
    started: Instant,
}

impl RetryContext {
    pub fn new() -> Self {
        Self {
            attempt: 0,
            last_error: None,
            elapsed_ms: 0,
            started: Instant::now(),
        }
    }

    /// Note a failed attempt.
    pub fn record(&mut self, kind: ErrorKind) {
        self.last_error = Some(kind);
        self.elapsed_ms = self.started.elapsed().as_millis() as u64;
    }
}

impl Default for RetryContext {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    RetryAfter(Duration),
    GiveUp,
}

/// Bounded exponential retry for transient failures.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub backoff_multiplier: f64,
    pub max_delay: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            retry_delay: Duration::from_millis(config.retry_delay_ms),
            backoff_multiplier: config.backoff_multiplier,
            max_delay: config.max_retry_delay_ms.map(Duration::from_millis),
        }
    }

    /// `retry_delay × backoff_multiplier^attempt`, capped by `max_delay`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        exponential_delay(self.retry_delay, self.backoff_multiplier, attempt, self.max_delay)
    }

    pub fn decide(&self, ctx: &RetryContext) -> RetryDecision {
        match ctx.last_error {
            Some(kind) if kind.is_transient() && ctx.attempt < self.max_retries => {
                RetryDecision::RetryAfter(self.delay_for(ctx.attempt))
            }
            _ => RetryDecision::GiveUp,
        }
    }
}
