//! Tracing setup and fetch counters

use std::sync::atomic::{AtomicU64, Ordering};
use tracing_subscriber::EnvFilter;

use crate::config::TelemetryConfig;

/// Install the global subscriber. `RUST_LOG` wins over the configured filter.
///
/// Calling this twice is harmless; the second call leaves the first subscriber in place.
pub fn init_tracing(config: &TelemetryConfig) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_filter))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let result = if config.json_logs {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    if result.is_err() {
        tracing::debug!("Tracing subscriber already installed");
    }
}

/// Counters shared by every fetcher a service hands out
#[derive(Debug, Default)]
pub struct FetchMetrics {
    fetches_started: AtomicU64,
    fetches_succeeded: AtomicU64,
    fetches_failed: AtomicU64,
    retries: AtomicU64,
    cache_hits: AtomicU64,
    chunks_uploaded: AtomicU64,
}

impl FetchMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fetch_started(&self) {
        self.fetches_started.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(counter = "fetches_started", "Metric incremented");
    }

    pub fn fetch_succeeded(&self) {
        self.fetches_succeeded.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(counter = "fetches_succeeded", "Metric incremented");
    }

    pub fn fetch_failed(&self) {
        self.fetches_failed.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(counter = "fetches_failed", "Metric incremented");
    }

    pub fn retry_scheduled(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(counter = "retries", "Metric incremented");
    }

    pub fn cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(counter = "cache_hits", "Metric incremented");
    }

    pub fn chunk_uploaded(&self) {
        self.chunks_uploaded.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(counter = "chunks_uploaded", "Metric incremented");
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            fetches_started: self.fetches_started.load(Ordering::Relaxed),
            fetches_succeeded: self.fetches_succeeded.load(Ordering::Relaxed),
            fetches_failed: self.fetches_failed.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            chunks_uploaded: self.chunks_uploaded.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub fetches_started: u64,
    pub fetches_succeeded: u64,
    pub fetches_failed: u64,
    pub retries: u64,
    pub cache_hits: u64,
    pub chunks_uploaded: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let metrics = FetchMetrics::new();
        metrics.fetch_started();
        metrics.fetch_started();
        metrics.retry_scheduled();
        metrics.fetch_succeeded();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.fetches_started, 2);
        assert_eq!(snapshot.retries, 1);
        assert_eq!(snapshot.fetches_succeeded, 1);
        assert_eq!(snapshot.fetches_failed, 0);
    }

    #[test]
    fn init_tracing_twice_is_harmless() {
        let config = TelemetryConfig::default();
        init_tracing(&config);
        init_tracing(&config);
    }
}
