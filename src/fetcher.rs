//! The one-shot HTTP fetcher.
//!
//! A [`Fetcher`] performs exactly one logical exchange: it follows redirects,
//! answers Basic challenges, applies conditional-GET caching through an
//! attached [`FetchHistory`], streams the body to memory or a file, and retries
//! retryable failures with exponential backoff. Exactly one terminal outcome is
//! reported, unless the fetch is cancelled, in which case none is.
//!
//! The fetcher is consumed when it starts, so it cannot be started twice.
//! [`Fetcher::begin_fetch`] runs it on a tokio task and reports to a
//! [`FetchDelegate`]; [`Fetcher::fetch`] is the same machine as a future.

use bytes::{Bytes, BytesMut};
use futures_util::StreamExt;
use reqwest::header::{
    AUTHORIZATION, CONTENT_LENGTH, CONTENT_TYPE, COOKIE, HeaderMap, HeaderValue, IF_MODIFIED_SINCE,
    LOCATION, PROXY_AUTHORIZATION,
};
use reqwest::{Method, StatusCode, Url};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, info, info_span, warn};
use uuid::Uuid;

use crate::auth::{Challenge, Credential};
use crate::cookies::CookieStore;
use crate::error::{FetchError, Result, TransportError};
use crate::history::FetchHistory;
use crate::observability::FetchMetrics;
use crate::request::{BodySource, FetchBody, FetchRequest, FetchResponse};
use crate::retry::{self, RetryPolicy};
use crate::transport::{HttpTransport, ResponseStream, TransportRequest};

pub const DEFAULT_MAX_REDIRECTS: usize = 10;

/// Lifecycle of one fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchState {
    Idle,
    Connecting,
    Redirecting,
    AwaitingChallengeResponse,
    ReceivingBody,
    WaitingToRetry,
    Succeeded,
    Failed,
    Cancelled,
}

impl FetchState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            FetchState::Succeeded | FetchState::Failed | FetchState::Cancelled
        )
    }

    pub fn can_transition_to(self, next: FetchState) -> bool {
        use FetchState::*;
        match (self, next) {
            (from, _) if from.is_terminal() => false,
            (_, Cancelled | Failed) => true,
            (Idle | Redirecting | AwaitingChallengeResponse | WaitingToRetry, Connecting) => true,
            (Connecting, Redirecting | AwaitingChallengeResponse | ReceivingBody | WaitingToRetry) => {
                true
            }
            (ReceivingBody, Succeeded | WaitingToRetry) => true,
            _ => false,
        }
    }
}

/// Receives the outcome and progress of a fetch started with [`Fetcher::begin_fetch`].
///
/// The delegate is owned by the fetch task and dropped right after the
/// terminal callback, or when the fetch is cancelled.
pub trait FetchDelegate: Send {
    fn fetch_finished(&mut self, response: FetchResponse);

    fn fetch_failed(&mut self, error: FetchError);

    /// The server answered with a status >= 300. `body` is whatever came with it.
    fn fetch_failed_with_status(&mut self, status: StatusCode, body: Bytes, error: FetchError) {
        let _ = (status, body);
        self.fetch_failed(error);
    }

    fn fetch_failed_with_network_error(&mut self, error: FetchError) {
        self.fetch_failed(error);
    }

    /// Bytes of the response body received so far. Drops back toward zero when
    /// a retry restarts the download.
    fn received_data(&mut self, bytes_so_far: u64) {
        let _ = bytes_so_far;
    }

    /// Request body progress for the current send.
    fn sent_data(&mut self, bytes_sent: u64, total_bytes_sent: u64, total_expected: Option<u64>) {
        let _ = (bytes_sent, total_bytes_sent, total_expected);
    }

    /// Final say on retrying `error`, given the default classification.
    fn should_retry(&mut self, suggested: bool, error: &FetchError) -> bool {
        let _ = error;
        suggested
    }
}

struct NoopDelegate;

impl FetchDelegate for NoopDelegate {
    fn fetch_finished(&mut self, _response: FetchResponse) {}
    fn fetch_failed(&mut self, _error: FetchError) {}
}

/// Delegate built from a completion closure.
pub struct OnComplete<F>(Option<F>);

/// Adapt a closure into a [`FetchDelegate`] that only sees the terminal outcome.
pub fn on_complete<F>(callback: F) -> OnComplete<F>
where
    F: FnOnce(Result<FetchResponse>) + Send + 'static,
{
    OnComplete(Some(callback))
}

impl<F> FetchDelegate for OnComplete<F>
where
    F: FnOnce(Result<FetchResponse>) + Send + 'static,
{
    fn fetch_finished(&mut self, response: FetchResponse) {
        if let Some(callback) = self.0.take() {
            callback(Ok(response));
        }
    }

    fn fetch_failed(&mut self, error: FetchError) {
        if let Some(callback) = self.0.take() {
            callback(Err(error));
        }
    }
}

#[derive(Debug)]
struct Progress {
    state: FetchState,
    status: Option<StatusCode>,
    headers: Option<HeaderMap>,
    retry_count: u32,
    next_retry_interval: Option<Duration>,
}

/// State visible through a [`FetchHandle`] while the task runs.
#[derive(Debug, Clone)]
pub(crate) struct SharedProgress(Arc<Mutex<Progress>>);

impl SharedProgress {
    fn new() -> Self {
        Self(Arc::new(Mutex::new(Progress {
            state: FetchState::Idle,
            status: None,
            headers: None,
            retry_count: 0,
            next_retry_interval: None,
        })))
    }

    fn lock(&self) -> MutexGuard<'_, Progress> {
        self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Returns false when the move is not allowed, typically because the fetch
    /// was cancelled meanwhile.
    fn transition(&self, next: FetchState) -> bool {
        let mut progress = self.lock();
        if progress.state == next && !next.is_terminal() {
            return true;
        }
        if !progress.state.can_transition_to(next) {
            if progress.state != FetchState::Cancelled {
                warn!(from = ?progress.state, to = ?next, "Rejected fetch state transition");
            }
            return false;
        }
        progress.state = next;
        true
    }

    /// Cancel unless already terminal.
    fn cancel(&self) -> bool {
        let mut progress = self.lock();
        if progress.state.is_terminal() {
            return false;
        }
        progress.state = FetchState::Cancelled;
        true
    }

    fn record_response(&self, status: StatusCode, headers: &HeaderMap) {
        let mut progress = self.lock();
        progress.status = Some(status);
        progress.headers = Some(headers.clone());
    }

    fn record_retry(&self, retry_count: u32, interval: Duration) {
        let mut progress = self.lock();
        progress.retry_count = retry_count;
        progress.next_retry_interval = Some(interval);
    }

    fn state(&self) -> FetchState {
        self.lock().state
    }
}

/// Handle to a fetch running on a tokio task.
#[derive(Debug)]
pub struct FetchHandle {
    id: Uuid,
    progress: SharedProgress,
    task: JoinHandle<()>,
}

impl FetchHandle {
    pub fn fetch_id(&self) -> Uuid {
        self.id
    }

    /// Cancel the fetch. No callback fires afterwards; the delegate is dropped.
    pub fn stop_fetching(&self) {
        if self.progress.cancel() {
            debug!(fetch_id = %self.id, "Fetch cancelled");
        }
        self.task.abort();
    }

    pub fn is_fetching(&self) -> bool {
        !self.progress.state().is_terminal()
    }

    pub fn state(&self) -> FetchState {
        self.progress.state()
    }

    /// Status of the most recent response, including intermediate hops.
    pub fn status_code(&self) -> Option<StatusCode> {
        self.progress.lock().status
    }

    pub fn response_headers(&self) -> Option<HeaderMap> {
        self.progress.lock().headers.clone()
    }

    pub fn retry_count(&self) -> u32 {
        self.progress.lock().retry_count
    }

    /// Interval of the retry currently scheduled or last waited for.
    pub fn next_retry_interval(&self) -> Option<Duration> {
        self.progress.lock().next_retry_interval
    }

    /// Wait for the task to end, whether by completion or cancellation.
    pub async fn join(self) {
        let _ = self.task.await;
    }
}

/// A single logical HTTP request, configured and then consumed by starting it.
#[derive(Debug)]
pub struct Fetcher<T: HttpTransport> {
    transport: Arc<T>,
    request: FetchRequest,
    credential: Option<Credential>,
    proxy_credential: Option<Credential>,
    history: Option<Arc<FetchHistory>>,
    cookie_store: Option<Arc<CookieStore>>,
    download_path: Option<PathBuf>,
    retry: RetryPolicy,
    max_redirects: usize,
    resume_incomplete: bool,
    metrics: Option<Arc<FetchMetrics>>,
}

impl<T: HttpTransport> Clone for Fetcher<T> {
    fn clone(&self) -> Self {
        Self {
            transport: self.transport.clone(),
            request: self.request.clone(),
            credential: self.credential.clone(),
            proxy_credential: self.proxy_credential.clone(),
            history: self.history.clone(),
            cookie_store: self.cookie_store.clone(),
            download_path: self.download_path.clone(),
            retry: self.retry.clone(),
            max_redirects: self.max_redirects,
            resume_incomplete: self.resume_incomplete,
            metrics: self.metrics.clone(),
        }
    }
}

impl<T: HttpTransport> Fetcher<T> {
    pub fn new(transport: Arc<T>, request: FetchRequest) -> Self {
        Self {
            transport,
            request,
            credential: None,
            proxy_credential: None,
            history: None,
            cookie_store: None,
            download_path: None,
            retry: RetryPolicy::default(),
            max_redirects: DEFAULT_MAX_REDIRECTS,
            resume_incomplete: false,
            metrics: None,
        }
    }

    #[must_use]
    pub fn with_credential(mut self, credential: Credential) -> Self {
        self.credential = Some(credential);
        self
    }

    #[must_use]
    pub fn with_proxy_credential(mut self, credential: Credential) -> Self {
        self.proxy_credential = Some(credential);
        self
    }

    /// Attach a history. Its cookie store is used unless one is set explicitly.
    #[must_use]
    pub fn with_history(mut self, history: Arc<FetchHistory>) -> Self {
        self.history = Some(history);
        self
    }

    #[must_use]
    pub fn with_cookie_store(mut self, store: Arc<CookieStore>) -> Self {
        self.cookie_store = Some(store);
        self
    }

    /// Stream a successful body into `path` instead of memory.
    #[must_use]
    pub fn with_download_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.download_path = Some(path.into());
        self
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
    pub fn with_metrics(mut self, metrics: Arc<FetchMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Report 308 as a status ("Resume Incomplete") instead of following it.
    pub(crate) fn with_resume_incomplete(mut self) -> Self {
        self.resume_incomplete = true;
        self
    }

    pub(crate) fn without_download_path(mut self) -> Self {
        self.download_path = None;
        self
    }

    pub(crate) fn metrics(&self) -> Option<&Arc<FetchMetrics>> {
        self.metrics.as_ref()
    }

    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    pub fn request(&self) -> &FetchRequest {
        &self.request
    }

    pub fn request_mut(&mut self) -> &mut FetchRequest {
        &mut self.request
    }

    /// Start the fetch on a tokio task and return immediately.
    ///
    /// A malformed request fails here, synchronously, and no callback fires.
    pub fn begin_fetch(self, delegate: impl FetchDelegate + 'static) -> Result<FetchHandle> {
        let mut delegate: Box<dyn FetchDelegate> = Box::new(delegate);
        let run = self.prepare()?;
        let id = run.id;
        let progress = run.progress.clone();
        let span = info_span!("fetch", fetch_id = %id, url = %run.url);

        let task = tokio::spawn(
            async move {
                let mut run = run;
                let result = run.run(delegate.as_mut()).await;
                if !run.finish(&result) {
                    debug!("Fetch cancelled before completion; outcome dropped");
                    return;
                }
                deliver(delegate.as_mut(), result);
            }
            .instrument(span),
        );

        Ok(FetchHandle { id, progress, task })
    }

    /// Run the fetch to completion as a future.
    pub async fn fetch(self) -> Result<FetchResponse> {
        self.fetch_with(&mut NoopDelegate).await
    }

    /// Like [`fetch`](Self::fetch), reporting progress and consulting
    /// `should_retry` on `delegate`. Its terminal callbacks are not invoked;
    /// the outcome is returned instead.
    pub async fn fetch_with(self, delegate: &mut dyn FetchDelegate) -> Result<FetchResponse> {
        let mut run = self.prepare()?;
        let span = info_span!("fetch", fetch_id = %run.id, url = %run.url);
        async move {
            let result = run.run(delegate).await;
            run.finish(&result);
            result
        }
        .instrument(span)
        .await
    }

    fn prepare(self) -> Result<FetchRun<T>> {
        let url = self.request.url()?;
        let progress = SharedProgress::new();
        progress.transition(FetchState::Connecting);
        if let Some(ref metrics) = self.metrics {
            metrics.fetch_started();
        }
        let cookie_store = self
            .cookie_store
            .or_else(|| self.history.as_ref().map(|h| h.cookie_store().clone()));

        Ok(FetchRun {
            id: Uuid::now_v7(),
            transport: self.transport,
            request: self.request,
            url,
            credential: self.credential,
            proxy_credential: self.proxy_credential,
            history: self.history,
            cookie_store,
            download_path: self.download_path,
            retry: self.retry,
            max_redirects: self.max_redirects,
            resume_incomplete: self.resume_incomplete,
            metrics: self.metrics,
            progress,
        })
    }
}

pub(crate) fn deliver(delegate: &mut dyn FetchDelegate, result: Result<FetchResponse>) {
    match result {
        Ok(response) => delegate.fetch_finished(response),
        Err(error) => match &error {
            FetchError::Status { status, body, .. } => {
                let (status, body) = (*status, body.clone());
                delegate.fetch_failed_with_status(status, body, error)
            }
            FetchError::Network(_) => delegate.fetch_failed_with_network_error(error),
            _ => delegate.fetch_failed(error),
        },
    }
}

/// Per-hop request shape; redirects rewrite it.
struct Hop {
    url: Url,
    method: Method,
    headers: HeaderMap,
    body: Option<BodySource>,
}

/// Which challenges have been answered in the current attempt.
#[derive(Default)]
struct Answered {
    server: bool,
    proxy: bool,
}

struct FetchRun<T: HttpTransport> {
    id: Uuid,
    transport: Arc<T>,
    request: FetchRequest,
    url: Url,
    credential: Option<Credential>,
    proxy_credential: Option<Credential>,
    history: Option<Arc<FetchHistory>>,
    cookie_store: Option<Arc<CookieStore>>,
    download_path: Option<PathBuf>,
    retry: RetryPolicy,
    max_redirects: usize,
    resume_incomplete: bool,
    metrics: Option<Arc<FetchMetrics>>,
    progress: SharedProgress,
}

impl<T: HttpTransport> FetchRun<T> {
    /// Move to the terminal state matching `result`. False if cancelled first.
    fn finish(&self, result: &Result<FetchResponse>) -> bool {
        let terminal = match result {
            Ok(_) => FetchState::Succeeded,
            Err(_) => FetchState::Failed,
        };
        if !self.progress.transition(terminal) {
            return false;
        }
        match (result, &self.metrics) {
            (Ok(response), Some(metrics)) => {
                metrics.fetch_succeeded();
                if response.served_from_cache {
                    metrics.cache_hit();
                }
            }
            (Err(_), Some(metrics)) => metrics.fetch_failed(),
            _ => {}
        }
        true
    }

    async fn run(&mut self, delegate: &mut dyn FetchDelegate) -> Result<FetchResponse> {
        let mut schedule = self.retry.schedule();
        loop {
            let error = match self.attempt(delegate).await {
                Ok(response) => {
                    info!(
                        status = response.status.as_u16(),
                        bytes = response.body.len(),
                        from_cache = response.served_from_cache,
                        "Fetch succeeded"
                    );
                    return Ok(response);
                }
                Err(error) => error,
            };

            if retry::is_never_retried(&error) || !schedule.can_retry() {
                warn!(error = %error, retries = schedule.retry_count(), "Fetch failed");
                return Err(error);
            }
            let suggested = retry::is_retryable(&error);
            if !delegate.should_retry(suggested, &error) {
                warn!(error = %error, retries = schedule.retry_count(), "Fetch failed");
                return Err(error);
            }

            let interval = schedule.advance();
            if !self.progress.transition(FetchState::WaitingToRetry) {
                return Err(error);
            }
            self.progress.record_retry(schedule.retry_count(), interval);
            if let Some(ref metrics) = self.metrics {
                metrics.retry_scheduled();
            }
            warn!(
                error = %error,
                attempt = schedule.retry_count(),
                interval_ms = interval.as_millis() as u64,
                "Retrying fetch"
            );
            tokio::time::sleep(interval).await;
        }
    }

    /// One attempt: every redirect hop and challenge answer until an outcome.
    async fn attempt(&self, delegate: &mut dyn FetchDelegate) -> Result<FetchResponse> {
        let mut hop = Hop {
            url: self.url.clone(),
            method: self.request.method().clone(),
            headers: self.request.headers().clone(),
            body: self.request.body().cloned(),
        };
        let mut answered = Answered::default();
        let mut redirects = 0usize;

        loop {
            self.progress.transition(FetchState::Connecting);
            let request = self.build_request(&hop, &answered).await?;
            debug!(method = %hop.method, url = %hop.url, "Issuing request");
            let response = self.send_counting(request, delegate).await?;
            let status = response.status;
            self.progress.record_response(status, &response.headers);

            if let Some(ref store) = self.cookie_store {
                store.set_cookies_from_headers(&response.headers, &hop.url);
            }

            if is_redirect(status)
                && !(self.resume_incomplete && status == StatusCode::PERMANENT_REDIRECT)
            {
                if let Some(next) = redirect_target(&hop.url, &response.headers) {
                    redirects += 1;
                    if redirects > self.max_redirects {
                        return Err(FetchError::TooManyRedirects(self.max_redirects));
                    }
                    self.progress.transition(FetchState::Redirecting);
                    debug!(status = status.as_u16(), from = %hop.url, to = %next, "Following redirect");
                    drop(response.body);
                    follow_redirect(&mut hop, &mut answered, status, next);
                    continue;
                }
            }

            if status == StatusCode::NOT_MODIFIED {
                if let Some(cached) = self.cached_body(&hop.url) {
                    self.progress.transition(FetchState::ReceivingBody);
                    drop(response.body);
                    debug!(url = %hop.url, bytes = cached.len(), "Serving 304 from history cache");
                    let body = self.store_cached(cached, delegate).await?;
                    return Ok(FetchResponse {
                        status,
                        headers: response.headers,
                        url: hop.url,
                        body,
                        served_from_cache: true,
                    });
                }
            }

            if let Some(mut challenge) = Challenge::from_response(status, &response.headers) {
                let body = collect_body(response.body).await?;
                let (credential, already) = if challenge.is_proxy {
                    (&self.proxy_credential, &mut answered.proxy)
                } else {
                    (&self.credential, &mut answered.server)
                };
                if challenge.is_basic() && credential.is_some() && !*already {
                    *already = true;
                    self.progress.transition(FetchState::AwaitingChallengeResponse);
                    debug!(challenge = %challenge, "Answering authentication challenge");
                    continue;
                }
                challenge.failure_count = u32::from(*already);
                return Err(FetchError::AuthChallenge {
                    challenge,
                    status,
                    body,
                });
            }

            if status.as_u16() >= 300 {
                let body = collect_body(response.body).await?;
                return Err(FetchError::Status {
                    status,
                    headers: response.headers,
                    body,
                });
            }

            self.progress.transition(FetchState::ReceivingBody);
            let body = self.receive_body(response.body, delegate).await?;
            if let Some(ref history) = self.history {
                history.record_response(&hop.url, status, &response.headers, body.bytes());
            }
            return Ok(FetchResponse {
                status,
                headers: response.headers,
                url: hop.url,
                body,
                served_from_cache: false,
            });
        }
    }

    async fn build_request(&self, hop: &Hop, answered: &Answered) -> Result<TransportRequest> {
        let mut headers = hop.headers.clone();

        if let Some(cookie) = self
            .cookie_store
            .as_ref()
            .and_then(|store| store.cookie_header_for_url(&hop.url))
            && let Ok(value) = HeaderValue::from_str(&cookie)
        {
            headers.insert(COOKIE, value);
        }

        if hop.method == Method::GET
            && !headers.contains_key(IF_MODIFIED_SINCE)
            && let Some(since) = self
                .history
                .as_ref()
                .and_then(|history| history.conditional_header_for(&hop.url))
            && let Ok(value) = HeaderValue::from_str(&since)
        {
            headers.insert(IF_MODIFIED_SINCE, value);
        }

        if answered.server
            && let Some(ref credential) = self.credential
        {
            headers.insert(AUTHORIZATION, credential.basic_authorization());
        }
        if answered.proxy
            && let Some(ref credential) = self.proxy_credential
        {
            headers.insert(PROXY_AUTHORIZATION, credential.basic_authorization());
        }

        let (body, body_len) = match hop.body {
            Some(ref source) => {
                let (stream, len) = source.open().await?;
                (Some(stream), len)
            }
            None => (None, None),
        };

        Ok(TransportRequest {
            method: hop.method.clone(),
            url: hop.url.clone(),
            headers,
            body,
            body_len,
        })
    }

    /// Send, relaying request-body progress to the delegate while the exchange runs.
    async fn send_counting(
        &self,
        mut request: TransportRequest,
        delegate: &mut dyn FetchDelegate,
    ) -> Result<crate::transport::TransportResponse> {
        let expected = request.body_len;
        let (tx, mut rx) = mpsc::unbounded_channel::<u64>();
        if let Some(body) = request.body.take() {
            request.body = Some(
                body.inspect(move |chunk| {
                    if let Ok(chunk) = chunk {
                        let _ = tx.send(chunk.len() as u64);
                    }
                })
                .boxed(),
            );
        } else {
            drop(tx);
        }

        let send = self.transport.send(request);
        tokio::pin!(send);
        let mut total_sent = 0u64;
        let result = loop {
            tokio::select! {
                biased;
                Some(sent) = rx.recv() => {
                    total_sent += sent;
                    delegate.sent_data(sent, total_sent, expected);
                }
                result = &mut send => break result,
            }
        };
        while let Ok(sent) = rx.try_recv() {
            total_sent += sent;
            delegate.sent_data(sent, total_sent, expected);
        }
        Ok(result?)
    }

    fn cached_body(&self, url: &Url) -> Option<Bytes> {
        let history = self.history.as_ref()?;
        if !history.should_cache_dated_data() {
            return None;
        }
        history.cached_body_for(url)
    }

    async fn store_cached(&self, cached: Bytes, delegate: &mut dyn FetchDelegate) -> Result<FetchBody> {
        let len = cached.len() as u64;
        let body = match self.download_path {
            Some(ref path) => {
                tokio::fs::write(path, &cached)
                    .await
                    .map_err(TransportError::from)?;
                FetchBody::File {
                    path: path.clone(),
                    len,
                }
            }
            None => FetchBody::Bytes(cached),
        };
        delegate.received_data(len);
        Ok(body)
    }

    async fn receive_body(
        &self,
        mut stream: ResponseStream,
        delegate: &mut dyn FetchDelegate,
    ) -> Result<FetchBody> {
        let mut received = 0u64;
        match self.download_path {
            Some(ref path) => {
                // truncates whatever an earlier attempt left behind
                let mut file = tokio::fs::File::create(path)
                    .await
                    .map_err(TransportError::from)?;
                while let Some(chunk) = stream.next().await {
                    let chunk = chunk?;
                    file.write_all(&chunk).await.map_err(TransportError::from)?;
                    received += chunk.len() as u64;
                    delegate.received_data(received);
                }
                file.flush().await.map_err(TransportError::from)?;
                Ok(FetchBody::File {
                    path: path.clone(),
                    len: received,
                })
            }
            None => {
                let mut buf = BytesMut::new();
                while let Some(chunk) = stream.next().await {
                    let chunk = chunk?;
                    buf.extend_from_slice(&chunk);
                    received += chunk.len() as u64;
                    delegate.received_data(received);
                }
                Ok(FetchBody::Bytes(buf.freeze()))
            }
        }
    }
}

async fn collect_body(mut stream: ResponseStream) -> Result<Bytes> {
    let mut buf = BytesMut::new();
    while let Some(chunk) = stream.next().await {
        buf.extend_from_slice(&chunk?);
    }
    Ok(buf.freeze())
}

fn is_redirect(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::MOVED_PERMANENTLY
            | StatusCode::FOUND
            | StatusCode::SEE_OTHER
            | StatusCode::TEMPORARY_REDIRECT
            | StatusCode::PERMANENT_REDIRECT
    )
}

fn redirect_target(current: &Url, headers: &HeaderMap) -> Option<Url> {
    let location = headers.get(LOCATION)?.to_str().ok()?;
    let next = current.join(location).ok()?;
    matches!(next.scheme(), "http" | "https").then_some(next)
}

fn follow_redirect(hop: &mut Hop, answered: &mut Answered, status: StatusCode, next: Url) {
    let becomes_get = (status == StatusCode::SEE_OTHER && hop.method != Method::HEAD)
        || (matches!(status, StatusCode::MOVED_PERMANENTLY | StatusCode::FOUND)
            && hop.method == Method::POST);
    if becomes_get {
        hop.method = Method::GET;
        hop.body = None;
        hop.headers.remove(CONTENT_TYPE);
        hop.headers.remove(CONTENT_LENGTH);
    }

    let same_origin = next.scheme() == hop.url.scheme()
        && next.host_str() == hop.url.host_str()
        && next.port_or_known_default() == hop.url.port_or_known_default();
    // a new origin has to challenge again before the credential is sent
    if !same_origin {
        hop.headers.remove(AUTHORIZATION);
        answered.server = false;
    }
    hop.url = next;
}
