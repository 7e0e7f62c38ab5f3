//! Chunked, resumable uploads.
//!
//! An [`UploadFetcher`] presents one logical upload while issuing a sequence of
//! ordinary [`Fetcher`]s underneath:
//!
//! 1. the initial request (the caller's own request, typically carrying
//!    metadata) announces the payload with `X-Upload-Content-Type` and
//!    `X-Upload-Content-Length`; the server answers with a session URL in
//!    `Location`;
//! 2. each chunk is a `PUT` to that URL with `Content-Range: bytes s-e/total`;
//! 3. the server answers `308 Resume Incomplete` with `Range: bytes=0-N` until
//!    it has everything, then a 2xx whose response is the upload's result.
//!
//! Chunks are strictly sequential because each offset comes from the previous
//! response.

use bytes::Bytes;
use mime::Mime;
use reqwest::header::{
    CONTENT_RANGE, CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue, LOCATION, RANGE,
};
use reqwest::{StatusCode, Url};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, info, info_span};
use uuid::Uuid;

use crate::error::{FetchError, Result, TransportError};
use crate::fetcher::{self, FetchDelegate, Fetcher};
use crate::request::{BodySource, FetchRequest, FetchResponse};
use crate::transport::HttpTransport;
use crate::units::ByteSize;

pub const DEFAULT_CHUNK_SIZE: ByteSize = ByteSize::mib(5);

pub static X_UPLOAD_CONTENT_TYPE: HeaderName = HeaderName::from_static("x-upload-content-type");
pub static X_UPLOAD_CONTENT_LENGTH: HeaderName = HeaderName::from_static("x-upload-content-length");

/// Payload to upload. Exactly one source per session.
#[derive(Debug, Clone)]
pub enum UploadSource {
    Data(Bytes),
    File(PathBuf),
}

impl UploadSource {
    pub async fn len(&self) -> std::io::Result<u64> {
        match self {
            UploadSource::Data(data) => Ok(data.len() as u64),
            UploadSource::File(path) => Ok(tokio::fs::metadata(path).await?.len()),
        }
    }

    async fn read_range(&self, offset: u64, len: u64) -> std::io::Result<Bytes> {
        match self {
            UploadSource::Data(data) => {
                let start = usize::try_from(offset).unwrap_or(usize::MAX).min(data.len());
                let end = start
                    .saturating_add(usize::try_from(len).unwrap_or(usize::MAX))
                    .min(data.len());
                Ok(data.slice(start..end))
            }
            UploadSource::File(path) => {
                let mut file = tokio::fs::File::open(path).await?;
                file.seek(std::io::SeekFrom::Start(offset)).await?;
                let mut buf = Vec::with_capacity(usize::try_from(len).unwrap_or(0));
                file.take(len).read_to_end(&mut buf).await?;
                Ok(Bytes::from(buf))
            }
        }
    }
}

/// Where an upload session stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadPhase {
    NotStarted,
    /// Initial request in flight.
    Initiating,
    /// Zero-based index of the chunk in flight.
    UploadingChunk(usize),
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl UploadPhase {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            UploadPhase::Completed | UploadPhase::Failed | UploadPhase::Cancelled
        )
    }
}

/// Configures and starts a chunked upload.
#[derive(Debug)]
pub struct UploadFetcher<T: HttpTransport> {
    initial: Fetcher<T>,
    source: UploadSource,
    mime: Mime,
    chunk_size: u64,
    location: Option<Url>,
}

impl<T: HttpTransport> UploadFetcher<T> {
    /// `initial` carries the session-creating request and the settings (retry,
    /// credentials, cookies) every chunk fetcher inherits.
    pub fn new(initial: Fetcher<T>, source: UploadSource, mime: Mime) -> Self {
        Self {
            initial: initial.without_download_path(),
            source,
            mime,
            chunk_size: DEFAULT_CHUNK_SIZE.as_u64(),
            location: None,
        }
    }

    #[must_use]
    pub fn with_chunk_size(mut self, chunk_size: ByteSize) -> Self {
        self.chunk_size = chunk_size.as_u64();
        self
    }

    /// Resume a session created elsewhere; the initial request is skipped.
    #[must_use]
    pub fn with_location_url(mut self, location: Url) -> Self {
        self.location = Some(location);
        self
    }

    fn into_session(self) -> Result<Session<T>> {
        if self.chunk_size == 0 {
            return Err(FetchError::MalformedRequest("chunk size must be positive".to_string()));
        }
        match self.location {
            Some(ref location) if !matches!(location.scheme(), "http" | "https") => {
                return Err(FetchError::MalformedRequest(format!(
                    "unsupported upload location {location}"
                )));
            }
            Some(_) => {}
            None => {
                self.initial.request().url()?;
            }
        }
        Ok(Session {
            initial: self.initial,
            source: self.source,
            mime: self.mime,
            chunk_size: self.chunk_size,
            location: self.location,
            total: None,
            initial_len: 0,
            offset: 0,
            reported: 0,
            chunks: 0,
        })
    }

    /// Start uploading on a tokio task.
    pub fn begin_fetch(self, delegate: impl FetchDelegate + 'static) -> Result<UploadHandle<T>> {
        let session = self.into_session()?;
        let id = Uuid::now_v7();
        let shared = Arc::new(Mutex::new(UploadState {
            phase: UploadPhase::NotStarted,
            offset: 0,
            location: session.location.clone(),
            status: None,
            headers: None,
            chunk_count: 0,
            pause_requested: false,
            parked: None,
        }));
        let task = spawn_session(id, session, shared.clone(), Box::new(delegate));
        Ok(UploadHandle {
            id,
            shared,
            task: Mutex::new(Some(task)),
        })
    }

    /// Run the whole upload as a future, reporting progress to `delegate`.
    pub async fn fetch_with(self, delegate: &mut dyn FetchDelegate) -> Result<FetchResponse> {
        let mut session = self.into_session()?;
        let shared = Arc::new(Mutex::new(UploadState::<T>::detached()));
        let span = info_span!("upload", upload_id = %Uuid::now_v7());
        match session.run(&shared, delegate).instrument(span).await {
            Outcome::Finished(result) => result,
            Outcome::Paused => Err(FetchError::InvalidState("upload paused".to_string())),
        }
    }

    pub async fn fetch(self) -> Result<FetchResponse> {
        struct Quiet;
        impl FetchDelegate for Quiet {
            fn fetch_finished(&mut self, _: FetchResponse) {}
            fn fetch_failed(&mut self, _: FetchError) {}
        }
        self.fetch_with(&mut Quiet).await
    }
}

struct UploadState<T: HttpTransport> {
    phase: UploadPhase,
    offset: u64,
    location: Option<Url>,
    status: Option<StatusCode>,
    headers: Option<HeaderMap>,
    chunk_count: usize,
    pause_requested: bool,
    parked: Option<Session<T>>,
}

impl<T: HttpTransport> UploadState<T> {
    fn detached() -> Self {
        Self {
            phase: UploadPhase::NotStarted,
            offset: 0,
            location: None,
            status: None,
            headers: None,
            chunk_count: 0,
            pause_requested: false,
            parked: None,
        }
    }
}

type SharedState<T> = Arc<Mutex<UploadState<T>>>;

fn lock<T: HttpTransport>(shared: &SharedState<T>) -> MutexGuard<'_, UploadState<T>> {
    shared.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Handle to a running, paused or finished upload session.
pub struct UploadHandle<T: HttpTransport> {
    id: Uuid,
    shared: SharedState<T>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl<T: HttpTransport> UploadHandle<T> {
    pub fn upload_id(&self) -> Uuid {
        self.id
    }

    fn state(&self) -> MutexGuard<'_, UploadState<T>> {
        lock(&self.shared)
    }

    /// Stop issuing chunks once the one in flight completes.
    pub fn pause_fetching(&self) {
        let mut state = self.state();
        if !state.phase.is_terminal() {
            state.pause_requested = true;
        }
    }

    /// Continue a paused upload from the last acknowledged offset.
    pub fn resume_fetching(&self, delegate: impl FetchDelegate + 'static) -> Result<()> {
        let session = {
            let mut state = self.state();
            if state.phase != UploadPhase::Paused {
                return Err(FetchError::InvalidState(format!(
                    "cannot resume an upload in phase {:?}",
                    state.phase
                )));
            }
            let Some(session) = state.parked.take() else {
                return Err(FetchError::InvalidState("paused upload has no session".to_string()));
            };
            state.pause_requested = false;
            state.phase = UploadPhase::UploadingChunk(state.chunk_count);
            session
        };
        debug!(upload_id = %self.id, "Resuming upload");
        let task = spawn_session(self.id, session, self.shared.clone(), Box::new(delegate));
        *self.task.lock().unwrap_or_else(|p| p.into_inner()) = Some(task);
        Ok(())
    }

    /// Cancel the upload. No callback fires afterwards.
    pub fn stop_fetching(&self) {
        {
            let mut state = self.state();
            if !state.phase.is_terminal() {
                state.phase = UploadPhase::Cancelled;
            }
            state.parked = None;
        }
        if let Some(task) = self.task.lock().unwrap_or_else(|p| p.into_inner()).take() {
            task.abort();
        }
    }

    pub fn phase(&self) -> UploadPhase {
        self.state().phase
    }

    pub fn is_paused(&self) -> bool {
        self.phase() == UploadPhase::Paused
    }

    pub fn is_fetching(&self) -> bool {
        let phase = self.phase();
        !phase.is_terminal() && phase != UploadPhase::Paused
    }

    /// Payload offset the server has acknowledged.
    pub fn current_offset(&self) -> u64 {
        self.state().offset
    }

    pub fn location_url(&self) -> Option<Url> {
        self.state().location.clone()
    }

    /// Status of the most recently completed chunk, else of the initial request.
    pub fn status_code(&self) -> Option<StatusCode> {
        self.state().status
    }

    pub fn response_headers(&self) -> Option<HeaderMap> {
        self.state().headers.clone()
    }

    pub fn chunk_count(&self) -> usize {
        self.state().chunk_count
    }

    /// Wait for the current task to end (completion, pause or cancellation).
    pub async fn join(&self) {
        let task = self.task.lock().unwrap_or_else(|p| p.into_inner()).take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

fn spawn_session<T: HttpTransport>(
    id: Uuid,
    session: Session<T>,
    shared: SharedState<T>,
    mut delegate: Box<dyn FetchDelegate>,
) -> JoinHandle<()> {
    let span = info_span!("upload", upload_id = %id);
    tokio::spawn(
        async move {
            let mut session = session;
            match session.run(&shared, delegate.as_mut()).await {
                Outcome::Paused => {
                    let mut state = lock(&shared);
                    if state.phase.is_terminal() {
                        return;
                    }
                    state.phase = UploadPhase::Paused;
                    state.parked = Some(session);
                    debug!(offset = state.offset, "Upload paused");
                }
                Outcome::Finished(result) => {
                    {
                        let mut state = lock(&shared);
                        if state.phase.is_terminal() {
                            debug!("Upload cancelled before completion; outcome dropped");
                            return;
                        }
                        state.phase = if result.is_ok() {
                            UploadPhase::Completed
                        } else {
                            UploadPhase::Failed
                        };
                    }
                    fetcher::deliver(delegate.as_mut(), result);
                }
            }
        }
        .instrument(span),
    )
}

enum Outcome {
    Paused,
    Finished(Result<FetchResponse>),
}

struct Session<T: HttpTransport> {
    initial: Fetcher<T>,
    source: UploadSource,
    mime: Mime,
    chunk_size: u64,
    location: Option<Url>,
    total: Option<u64>,
    /// Bytes of the initial request body that went out.
    initial_len: u64,
    offset: u64,
    /// Highest progress value reported so far.
    reported: u64,
    chunks: usize,
}

impl<T: HttpTransport> Session<T> {
    async fn run(&mut self, shared: &SharedState<T>, delegate: &mut dyn FetchDelegate) -> Outcome {
        match self.drive(shared, delegate).await {
            Ok(Some(response)) => Outcome::Finished(Ok(response)),
            Ok(None) => Outcome::Paused,
            Err(e) => Outcome::Finished(Err(e)),
        }
    }

    /// `Ok(None)` means a pause was honored.
    async fn drive(
        &mut self,
        shared: &SharedState<T>,
        delegate: &mut dyn FetchDelegate,
    ) -> Result<Option<FetchResponse>> {
        let total = match self.total {
            Some(total) => total,
            None => {
                let total = self.source.len().await.map_err(TransportError::from)?;
                self.total = Some(total);
                total
            }
        };

        if self.location.is_none() {
            lock(shared).phase = UploadPhase::Initiating;
            let location = self.initiate(shared, delegate, total).await?;
            info!(location = %location, bytes = total, "Upload session created");
            let mut state = lock(shared);
            state.location = Some(location.clone());
            self.location = Some(location);
        }

        loop {
            {
                let mut state = lock(shared);
                if state.pause_requested {
                    return Ok(None);
                }
                state.phase = UploadPhase::UploadingChunk(self.chunks);
            }

            let Some(location) = self.location.clone() else {
                return Err(FetchError::Upload("upload location is missing".to_string()));
            };
            let len = self.chunk_size.min(total.saturating_sub(self.offset));
            let chunk = self
                .source
                .read_range(self.offset, len)
                .await
                .map_err(TransportError::from)?;
            let content_range = if total == 0 {
                "bytes */0".to_string()
            } else if chunk.is_empty() {
                format!("bytes */{total}")
            } else {
                format!(
                    "bytes {}-{}/{}",
                    self.offset,
                    self.offset + chunk.len() as u64 - 1,
                    total
                )
            };
            debug!(chunk = self.chunks, range = %content_range, "Uploading chunk");

            let request = FetchRequest::put(location.as_str())
                .with_header(CONTENT_TYPE, mime_header(&self.mime))
                .with_header(CONTENT_RANGE, header_value(&content_range)?)
                .with_body(chunk);
            let mut fetcher = self.initial.clone().with_resume_incomplete();
            *fetcher.request_mut() = request;

            let expected = self.initial_len + total;
            let mut relay = ProgressRelay {
                delegate: &mut *delegate,
                base: self.initial_len + self.offset,
                expected,
                reported: &mut self.reported,
                max_sent: 0,
            };
            let result = fetcher.fetch_with(&mut relay).await;
            self.chunks += 1;
            let acknowledged = match &result {
                Ok(_) => true,
                Err(e) => e.status() == Some(StatusCode::PERMANENT_REDIRECT),
            };
            if acknowledged && let Some(metrics) = self.initial.metrics() {
                metrics.chunk_uploaded();
            }

            match result {
                Ok(response) => {
                    self.offset = total;
                    record(shared, self, response.status, &response.headers);
                    info!(chunks = self.chunks, status = response.status.as_u16(), "Upload completed");
                    return Ok(Some(response));
                }
                Err(FetchError::Status {
                    status: StatusCode::PERMANENT_REDIRECT,
                    headers,
                    ..
                }) => {
                    let next = match next_offset(&headers) {
                        Ok(next) => next.min(total),
                        Err(e) => {
                            record(shared, self, StatusCode::PERMANENT_REDIRECT, &headers);
                            return Err(e);
                        }
                    };
                    debug!(acknowledged = next, "Server acknowledged bytes");
                    self.offset = next;
                    record(shared, self, StatusCode::PERMANENT_REDIRECT, &headers);
                }
                Err(e) => {
                    if let FetchError::Status {
                        status, ref headers, ..
                    } = e
                    {
                        record(shared, self, status, headers);
                    }
                    return Err(e);
                }
            }
        }
    }

    /// Send the caller's request with the upload announcement; returns the session URL.
    async fn initiate(
        &mut self,
        shared: &SharedState<T>,
        delegate: &mut dyn FetchDelegate,
        total: u64,
    ) -> Result<Url> {
        let mut fetcher = self.initial.clone();
        let initial_len = match fetcher.request().body() {
            Some(body) => body_len(body).await,
            None => 0,
        };
        {
            let headers = fetcher.request_mut().headers_mut();
            headers.insert(X_UPLOAD_CONTENT_TYPE.clone(), mime_header(&self.mime));
            headers.insert(X_UPLOAD_CONTENT_LENGTH.clone(), HeaderValue::from(total));
        }

        let mut relay = ProgressRelay {
            delegate: &mut *delegate,
            base: 0,
            expected: initial_len + total,
            reported: &mut self.reported,
            max_sent: 0,
        };
        let result = fetcher.fetch_with(&mut relay).await;
        let sent = relay.max_sent;
        let response = match result {
            Ok(response) => response,
            Err(e) => {
                if let FetchError::Status {
                    status, ref headers, ..
                } = e
                {
                    let mut state = lock(shared);
                    state.status = Some(status);
                    state.headers = Some(headers.clone());
                }
                return Err(e);
            }
        };
        self.initial_len = sent.max(initial_len);
        {
            let mut state = lock(shared);
            state.status = Some(response.status);
            state.headers = Some(response.headers.clone());
        }

        response
            .headers
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|location| response.url.join(location).ok())
            .ok_or_else(|| {
                FetchError::Upload(format!(
                    "initial response {} has no usable Location header",
                    response.status
                ))
            })
    }
}

fn record<T: HttpTransport>(
    shared: &SharedState<T>,
    session: &Session<T>,
    status: StatusCode,
    headers: &HeaderMap,
) {
    let mut state = lock(shared);
    state.offset = session.offset;
    state.chunk_count = session.chunks;
    state.status = Some(status);
    state.headers = Some(headers.clone());
}

async fn body_len(body: &BodySource) -> u64 {
    match body {
        BodySource::Bytes(bytes) => bytes.len() as u64,
        BodySource::File(path) => tokio::fs::metadata(path).await.map(|m| m.len()).unwrap_or(0),
        BodySource::Stream { len, .. } => len.unwrap_or(0),
    }
}

fn mime_header(mime: &Mime) -> HeaderValue {
    HeaderValue::from_str(mime.as_ref())
        .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream"))
}

fn header_value(value: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(value)
        .map_err(|e| FetchError::Upload(format!("invalid header value {value:?}: {e}")))
}

/// Offset after a `308` from its `Range: bytes=0-N` header; no header means nothing was kept.
fn next_offset(headers: &HeaderMap) -> Result<u64> {
    let end = headers
        .get(RANGE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().strip_prefix("bytes="))
        .and_then(|range| range.split_once('-'))
        .and_then(|(_, end)| end.trim().parse::<u64>().ok());
    match end {
        None => Ok(0),
        Some(end) => end
            .checked_add(1)
            .ok_or_else(|| FetchError::Upload(format!("acknowledged range ends past u64: {end}"))),
    }
}

/// Turns per-request send progress into one session-wide, strictly increasing curve.
struct ProgressRelay<'a> {
    delegate: &'a mut dyn FetchDelegate,
    base: u64,
    expected: u64,
    reported: &'a mut u64,
    max_sent: u64,
}

impl FetchDelegate for ProgressRelay<'_> {
    fn fetch_finished(&mut self, _response: FetchResponse) {}

    fn fetch_failed(&mut self, _error: FetchError) {}

    fn sent_data(&mut self, bytes_sent: u64, total_bytes_sent: u64, _expected: Option<u64>) {
        self.max_sent = self.max_sent.max(total_bytes_sent);
        let overall = self.base + total_bytes_sent;
        if overall > *self.reported {
            *self.reported = overall;
            self.delegate.sent_data(bytes_sent, overall, Some(self.expected));
        }
    }

    fn should_retry(&mut self, suggested: bool, error: &FetchError) -> bool {
        // 308 is protocol flow, not a failure
        if error.status() == Some(StatusCode::PERMANENT_REDIRECT) {
            return false;
        }
        self.delegate.should_retry(suggested, error)
    }
}
