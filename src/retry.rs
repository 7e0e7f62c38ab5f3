//! Exponential backoff schedule for fetch retries.

use rand::Rng;
use reqwest::StatusCode;
use std::time::Duration;

use crate::error::{FetchError, NetworkErrorKind};

pub const DEFAULT_MAX_INTERVAL: Duration = Duration::from_secs(600);
pub const DEFAULT_FACTOR: f64 = 2.0;

/// Retry configuration for one fetcher.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub enabled: bool,
    /// First retry interval. `None` picks a random value in [1s, 2s) per fetch.
    pub min_interval: Option<Duration>,
    /// Once the next interval reaches this, no further retry happens.
    pub max_interval: Duration,
    pub factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            enabled: false,
            min_interval: None,
            max_interval: DEFAULT_MAX_INTERVAL,
            factor: DEFAULT_FACTOR,
        }
    }
}

impl RetryPolicy {
    pub fn enabled() -> Self {
        Self {
            enabled: true,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_min_interval(mut self, interval: Duration) -> Self {
        self.min_interval = Some(interval);
        self
    }

    /// A zero max interval restores the default.
    #[must_use]
    pub fn with_max_interval(mut self, interval: Duration) -> Self {
        self.max_interval = if interval.is_zero() {
            DEFAULT_MAX_INTERVAL
        } else {
            interval
        };
        self
    }

    #[must_use]
    pub fn with_factor(mut self, factor: f64) -> Self {
        self.factor = factor;
        self
    }

    /// Start a schedule, resolving a randomized min interval once.
    pub fn schedule(&self) -> RetrySchedule {
        let min_interval = self
            .min_interval
            .unwrap_or_else(|| Duration::from_secs_f64(rand::rng().random_range(1.0..2.0)));
        RetrySchedule {
            enabled: self.enabled,
            min_interval,
            max_interval: if self.max_interval.is_zero() {
                DEFAULT_MAX_INTERVAL
            } else {
                self.max_interval
            },
            // a shrinking factor would break monotonic backoff
            factor: self.factor.max(1.0),
            retry_count: 0,
            last_interval: None,
        }
    }
}

/// Per-fetch backoff state.
#[derive(Debug, Clone)]
pub struct RetrySchedule {
    enabled: bool,
    min_interval: Duration,
    max_interval: Duration,
    factor: f64,
    retry_count: u32,
    last_interval: Option<Duration>,
}

impl RetrySchedule {
    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn last_interval(&self) -> Option<Duration> {
        self.last_interval
    }

    /// Saturates at `Duration::MAX`, which is never below the max interval.
    pub fn next_interval(&self) -> Duration {
        match self.last_interval {
            None => self.min_interval,
            Some(last) => Duration::try_from_secs_f64(last.as_secs_f64() * self.factor)
                .unwrap_or(Duration::MAX),
        }
    }

    /// Whether the schedule has room for another retry, ignoring the error itself.
    pub fn can_retry(&self) -> bool {
        self.enabled && self.next_interval() < self.max_interval
    }

    /// Consume the next interval and count the retry.
    pub fn advance(&mut self) -> Duration {
        let interval = self.next_interval();
        self.last_interval = Some(interval);
        self.retry_count += 1;
        interval
    }
}

/// Default classification: timeouts, dropped connections, 408, 503 and 504.
pub fn is_retryable(error: &FetchError) -> bool {
    match error {
        FetchError::Network(e) => {
            matches!(e.kind, NetworkErrorKind::Timeout | NetworkErrorKind::ConnectionLost)
        }
        FetchError::Status { status, .. } => matches!(
            *status,
            StatusCode::REQUEST_TIMEOUT
                | StatusCode::SERVICE_UNAVAILABLE
                | StatusCode::GATEWAY_TIMEOUT
        ),
        _ => false,
    }
}

/// Errors the caller's predicate is never asked about.
pub fn is_never_retried(error: &FetchError) -> bool {
    matches!(
        error,
        FetchError::AuthChallenge { .. } | FetchError::MalformedRequest(_)
    )
}
