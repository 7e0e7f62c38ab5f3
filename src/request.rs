//! Request descriptors, body sources and successful responses.

use bytes::Bytes;
use futures_util::stream::{self, BoxStream, StreamExt};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Method, StatusCode, Url};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::AsyncReadExt;

use crate::error::{FetchError, TransportError};

pub static X_HTTP_METHOD_OVERRIDE: HeaderName = HeaderName::from_static("x-http-method-override");

const FILE_READ_CHUNK: usize = 64 * 1024;

/// Outgoing body bytes as handed to a transport.
pub type BodyStream = BoxStream<'static, Result<Bytes, TransportError>>;

/// Produces a fresh stream each time the body has to be (re)sent.
pub type StreamFactory = Arc<dyn Fn() -> BodyStream + Send + Sync>;

/// Where a request body comes from. Every variant can be replayed, so the body
/// survives 307/308 redirects, challenge answers and retries.
#[derive(Clone)]
pub enum BodySource {
    Bytes(Bytes),
    /// Reopened for every send.
    File(PathBuf),
    Stream {
        factory: StreamFactory,
        len: Option<u64>,
    },
}

impl BodySource {
    pub fn stream<F>(len: Option<u64>, factory: F) -> Self
    where
        F: Fn() -> BodyStream + Send + Sync + 'static,
    {
        BodySource::Stream {
            factory: Arc::new(factory),
            len,
        }
    }

    /// Open the body for one send, returning the stream and its length if known.
    pub async fn open(&self) -> Result<(BodyStream, Option<u64>), TransportError> {
        match self {
            BodySource::Bytes(bytes) => {
                let len = bytes.len() as u64;
                let body = bytes.clone();
                Ok((stream::once(async move { Ok(body) }).boxed(), Some(len)))
            }
            BodySource::File(path) => {
                let file = tokio::fs::File::open(path).await?;
                let len = file.metadata().await?.len();
                Ok((file_stream(file), Some(len)))
            }
            BodySource::Stream { factory, len } => Ok((factory(), *len)),
        }
    }
}

fn file_stream(file: tokio::fs::File) -> BodyStream {
    stream::unfold(Some(file), |state| async move {
        let mut file = state?;
        let mut buf = vec![0u8; FILE_READ_CHUNK];
        match file.read(&mut buf).await {
            Ok(0) => None,
            Ok(n) => {
                buf.truncate(n);
                Some((Ok(Bytes::from(buf)), Some(file)))
            }
            Err(e) => Some((Err(TransportError::from(e)), None)),
        }
    })
    .boxed()
}

impl fmt::Debug for BodySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BodySource::Bytes(b) => f.debug_tuple("Bytes").field(&b.len()).finish(),
            BodySource::File(p) => f.debug_tuple("File").field(p).finish(),
            BodySource::Stream { len, .. } => f.debug_struct("Stream").field("len", len).finish(),
        }
    }
}

impl From<Bytes> for BodySource {
    fn from(bytes: Bytes) -> Self {
        BodySource::Bytes(bytes)
    }
}

impl From<Vec<u8>> for BodySource {
    fn from(bytes: Vec<u8>) -> Self {
        BodySource::Bytes(Bytes::from(bytes))
    }
}

impl From<&'static str> for BodySource {
    fn from(s: &'static str) -> Self {
        BodySource::Bytes(Bytes::from_static(s.as_bytes()))
    }
}

/// One logical request. The target is kept as given and parsed when the fetch starts.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    method: Method,
    target: String,
    headers: HeaderMap,
    body: Option<BodySource>,
}

impl FetchRequest {
    pub fn new(method: Method, target: impl Into<String>) -> Self {
        Self {
            method,
            target: target.into(),
            headers: HeaderMap::new(),
            body: None,
        }
    }

    pub fn get(target: impl Into<String>) -> Self {
        Self::new(Method::GET, target)
    }

    pub fn post(target: impl Into<String>) -> Self {
        Self::new(Method::POST, target)
    }

    pub fn put(target: impl Into<String>) -> Self {
        Self::new(Method::PUT, target)
    }

    #[must_use]
    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Attach a body. A GET with a body is sent as POST.
    #[must_use]
    pub fn with_body(mut self, body: impl Into<BodySource>) -> Self {
        if self.method == Method::GET {
            self.method = Method::POST;
        }
        self.body = Some(body.into());
        self
    }

    /// Tunnel `method` through POST using `X-HTTP-Method-Override`.
    #[must_use]
    pub fn with_method_override(mut self, method: Method) -> Self {
        if let Ok(value) = HeaderValue::from_str(method.as_str()) {
            self.headers.insert(X_HTTP_METHOD_OVERRIDE.clone(), value);
        }
        self.method = Method::POST;
        self
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    pub fn body(&self) -> Option<&BodySource> {
        self.body.as_ref()
    }

    /// Validate the target: it must be an absolute http(s) URL.
    pub fn url(&self) -> Result<Url, FetchError> {
        if self.target.trim().is_empty() {
            return Err(FetchError::MalformedRequest("request has no URL".to_string()));
        }
        let url = Url::parse(self.target.trim())
            .map_err(|e| FetchError::MalformedRequest(format!("invalid URL {:?}: {e}", self.target)))?;
        match url.scheme() {
            "http" | "https" if url.host_str().is_some() => Ok(url),
            scheme => Err(FetchError::MalformedRequest(format!(
                "unsupported URL {:?} (scheme {scheme})",
                self.target
            ))),
        }
    }
}

/// Body of a successful response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchBody {
    Bytes(Bytes),
    /// Streamed into the download file; `len` bytes were written.
    File { path: PathBuf, len: u64 },
}

impl FetchBody {
    pub fn bytes(&self) -> Option<&Bytes> {
        match self {
            FetchBody::Bytes(b) => Some(b),
            FetchBody::File { .. } => None,
        }
    }

    pub fn len(&self) -> u64 {
        match self {
            FetchBody::Bytes(b) => b.len() as u64,
            FetchBody::File { len, .. } => *len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Terminal success of a fetch.
#[derive(Debug, Clone)]
pub struct FetchResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    /// URL of the last hop, after redirects.
    pub url: Url,
    pub body: FetchBody,
    /// Set when a 304 was answered from the history's cached body.
    pub served_from_cache: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::TryStreamExt;

    #[test]
    fn body_on_get_switches_to_post() {
        let request = FetchRequest::get("http://example.com/").with_body("payload");
        assert_eq!(request.method(), Method::POST);

        let put = FetchRequest::put("http://example.com/").with_body("payload");
        assert_eq!(put.method(), Method::PUT);
    }

    #[test]
    fn method_override_sends_post_with_header() {
        let request = FetchRequest::get("http://example.com/").with_method_override(Method::DELETE);
        assert_eq!(request.method(), Method::POST);
        assert_eq!(request.headers()[&X_HTTP_METHOD_OVERRIDE], "DELETE");
    }

    #[test]
    fn url_validation() {
        assert!(FetchRequest::get("https://example.com/feed").url().is_ok());
        for bad in ["", "   ", "not a url", "ftp://example.com/file", "mailto:a@b.c"] {
            assert!(
                matches!(FetchRequest::get(bad).url(), Err(FetchError::MalformedRequest(_))),
                "{bad:?} should be rejected"
            );
        }
    }

    #[tokio::test]
    async fn file_body_is_replayable() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("body.bin");
        tokio::fs::write(&path, vec![7u8; 150_000]).await.unwrap();

        let source = BodySource::File(path);
        for _ in 0..2 {
            let (stream, len) = source.open().await.unwrap();
            let chunks: Vec<Bytes> = stream.try_collect().await.unwrap();
            assert_eq!(len, Some(150_000));
            assert_eq!(chunks.iter().map(Bytes::len).sum::<usize>(), 150_000);
        }
    }

    #[tokio::test]
    async fn missing_file_body_is_io_error() {
        let source = BodySource::File(PathBuf::from("/definitely/not/here.bin"));
        let err = source.open().await.err().unwrap();
        assert_eq!(err.kind, crate::error::NetworkErrorKind::Io);
    }

    #[tokio::test]
    async fn stream_factory_runs_per_open() {
        let source = BodySource::stream(Some(3), || {
            stream::iter(vec![Ok(Bytes::from_static(b"abc"))]).boxed()
        });
        for _ in 0..2 {
            let (stream, _) = source.open().await.unwrap();
            let chunks: Vec<Bytes> = stream.try_collect().await.unwrap();
            assert_eq!(chunks, vec![Bytes::from_static(b"abc")]);
        }
    }
}
