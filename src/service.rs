//! Shared entry point that hands out pre-configured fetchers

use mime::Mime;
use std::sync::Arc;
use tracing::debug;

use crate::config::{Config, HistoryConfig};
use crate::cookies::CookieStore;
use crate::error::Result;
use crate::fetcher::{DEFAULT_MAX_REDIRECTS, Fetcher};
use crate::history::FetchHistory;
use crate::observability::FetchMetrics;
use crate::request::FetchRequest;
use crate::retry::RetryPolicy;
use crate::transport::{HttpTransport, ReqwestTransport};
use crate::units::ByteSize;
use crate::upload::{DEFAULT_CHUNK_SIZE, UploadFetcher, UploadSource};

/// Owns the transport and the defaults every fetcher starts from.
///
/// The default cookie store is explicit: fetchers from the same service share
/// it unless they are given a history or store of their own.
#[derive(Debug)]
pub struct FetchService<T: HttpTransport> {
    transport: Arc<T>,
    cookie_store: Arc<CookieStore>,
    retry: RetryPolicy,
    max_redirects: usize,
    chunk_size: ByteSize,
    history_config: HistoryConfig,
    metrics: Option<Arc<FetchMetrics>>,
}

impl FetchService<ReqwestTransport> {
    /// Build a `reqwest`-backed service from loaded configuration.
    pub fn from_config(config: &Config) -> Result<Self> {
        let transport = ReqwestTransport::new(&config.http)?;
        debug!(
            user_agent = %config.http.user_agent,
            max_redirects = config.http.max_redirects,
            retry = config.retry.enabled,
            "Fetch service configured"
        );
        Ok(Self::new(Arc::new(transport))
            .with_retry(config.retry.policy())
            .with_max_redirects(config.http.max_redirects)
            .with_chunk_size(config.upload.chunk_size)
            .with_history_config(config.history.clone()))
    }
}

impl<T: HttpTransport> FetchService<T> {
    pub fn new(transport: Arc<T>) -> Self {
        Self {
            transport,
            cookie_store: Arc::new(CookieStore::new()),
            retry: RetryPolicy::default(),
            max_redirects: DEFAULT_MAX_REDIRECTS,
            chunk_size: DEFAULT_CHUNK_SIZE,
            history_config: HistoryConfig::default(),
            metrics: None,
        }
    }

    #[must_use]
    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    #[must_use]
    pub fn with_max_redirects(mut self, max_redirects: usize) -> Self {
        self.max_redirects = max_redirects;
        self
    }

    #[must_use]
    pub fn with_chunk_size(mut self, chunk_size: ByteSize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    #[must_use]
    pub fn with_history_config(mut self, config: HistoryConfig) -> Self {
        self.history_config = config;
        self
    }

    #[must_use]
    pub fn with_cookie_store(mut self, store: Arc<CookieStore>) -> Self {
        self.cookie_store = store;
        self
    }

    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<FetchMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    pub fn cookie_store(&self) -> &Arc<CookieStore> {
        &self.cookie_store
    }

    pub fn metrics(&self) -> Option<&Arc<FetchMetrics>> {
        self.metrics.as_ref()
    }

    /// A fetcher carrying the service defaults. Attaching a history afterwards
    /// does not replace the service cookie store; use
    /// [`Fetcher::with_cookie_store`] for that.
    pub fn fetcher(&self, request: FetchRequest) -> Fetcher<T> {
        let fetcher = Fetcher::new(self.transport.clone(), request)
            .with_cookie_store(self.cookie_store.clone())
            .with_retry(self.retry.clone())
            .with_max_redirects(self.max_redirects);
        match self.metrics {
            Some(ref metrics) => fetcher.with_metrics(metrics.clone()),
            None => fetcher,
        }
    }

    /// An upload session whose initial request is `request`.
    pub fn upload_fetcher(
        &self,
        request: FetchRequest,
        source: UploadSource,
        mime: Mime,
    ) -> UploadFetcher<T> {
        UploadFetcher::new(self.fetcher(request), source, mime).with_chunk_size(self.chunk_size)
    }

    /// A fresh history sized by the `[history]` section, sharing the service cookie store.
    pub fn history(&self) -> Arc<FetchHistory> {
        let history = FetchHistory::with_cookie_store(
            self.history_config.cache_dated_data,
            self.history_config.memory_capacity,
            self.cookie_store.clone(),
        );
        Arc::new(history)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::FetchBody;
    use crate::transport::mock::{MockTransport, Reply};
    use bytes::Bytes;
    use reqwest::StatusCode;
    use reqwest::header::{CONTENT_RANGE, COOKIE};

    #[test]
    fn from_config_applies_sections() {
        let mut config = Config::default();
        config.retry.enabled = true;
        config.http.max_redirects = 3;
        config.upload.chunk_size = ByteSize::kib(256);
        config.history.cache_dated_data = true;

        let service = FetchService::from_config(&config).unwrap();
        assert!(service.retry.enabled);
        assert_eq!(service.max_redirects, 3);
        assert_eq!(service.chunk_size, ByteSize::kib(256));
        assert!(service.history().should_cache_dated_data());
    }

    #[tokio::test]
    async fn fetchers_share_the_default_cookie_store() {
        let transport = Arc::new(MockTransport::scripted(vec![
            Reply::status(200, "").with_header("set-cookie", "sid=abc"),
            Reply::status(200, ""),
        ]));
        let service = FetchService::new(transport.clone());

        service
            .fetcher(FetchRequest::get("http://example.com/login"))
            .fetch()
            .await
            .unwrap();
        service
            .fetcher(FetchRequest::get("http://example.com/feed"))
            .fetch()
            .await
            .unwrap();

        assert_eq!(service.cookie_store().len(), 1);
        assert_eq!(transport.requests()[1].header(COOKIE), Some("sid=abc"));
    }

    #[tokio::test]
    async fn history_shares_cookie_store_and_caches() {
        let transport = Arc::new(MockTransport::scripted(vec![
            Reply::status(200, "cached")
                .with_header("last-modified", "Sat, 01 Jan 2022 00:00:00 GMT")
                .with_header("set-cookie", "a=1"),
            Reply::status(304, ""),
        ]));
        let service = FetchService::new(transport.clone()).with_history_config(HistoryConfig {
            cache_dated_data: true,
            ..HistoryConfig::default()
        });
        let history = service.history();
        assert!(Arc::ptr_eq(history.cookie_store(), service.cookie_store()));

        let request = FetchRequest::get("http://example.com/doc");
        service
            .fetcher(request.clone())
            .with_history(history.clone())
            .fetch()
            .await
            .unwrap();
        let second = service
            .fetcher(request)
            .with_history(history)
            .fetch()
            .await
            .unwrap();

        assert_eq!(second.status, StatusCode::NOT_MODIFIED);
        assert!(second.served_from_cache);
        assert_eq!(second.body, FetchBody::Bytes(Bytes::from_static(b"cached")));
    }

    #[tokio::test]
    async fn metrics_are_attached_to_every_fetcher() {
        let transport = Arc::new(MockTransport::scripted(vec![
            Reply::status(200, ""),
            Reply::status(500, ""),
        ]));
        let metrics = Arc::new(FetchMetrics::new());
        let service = FetchService::new(transport).with_metrics(metrics.clone());

        let _ = service.fetcher(FetchRequest::get("http://example.com/a")).fetch().await;
        let _ = service.fetcher(FetchRequest::get("http://example.com/b")).fetch().await;

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.fetches_started, 2);
        assert_eq!(snapshot.fetches_succeeded, 1);
        assert_eq!(snapshot.fetches_failed, 1);
    }

    #[tokio::test]
    async fn upload_fetcher_uses_service_chunk_size() {
        let transport = Arc::new(MockTransport::scripted(vec![
            Reply::status(200, "").with_header("location", "http://example.com/s/1"),
            Reply::status(308, "").with_header("range", "bytes=0-2"),
            Reply::status(201, ""),
        ]));
        let metrics = Arc::new(FetchMetrics::new());
        let service = FetchService::new(transport.clone())
            .with_chunk_size(ByteSize(3))
            .with_metrics(metrics.clone());

        let response = service
            .upload_fetcher(
                FetchRequest::post("http://example.com/upload"),
                UploadSource::Data(Bytes::from_static(b"abcdef")),
                mime::APPLICATION_OCTET_STREAM,
            )
            .fetch()
            .await
            .unwrap();

        assert_eq!(response.status, StatusCode::CREATED);
        assert_eq!(transport.requests()[1].header(CONTENT_RANGE), Some("bytes 0-2/6"));
        assert_eq!(transport.requests()[2].header(CONTENT_RANGE), Some("bytes 3-5/6"));
        assert_eq!(metrics.snapshot().chunks_uploaded, 2);
    }
}
