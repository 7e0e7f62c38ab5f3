//! The network seam under the fetcher.
//!
//! A transport performs exactly one HTTP exchange: it never follows redirects,
//! never retries and never answers challenges. All of that belongs to the
//! [`Fetcher`](crate::Fetcher).

use bytes::Bytes;
use futures_util::stream::{BoxStream, StreamExt, TryStreamExt};
use reqwest::header::{CONTENT_LENGTH, HeaderMap, HeaderValue};
use reqwest::{Client, Method, Proxy, StatusCode, Url};
use std::future::Future;
use tracing::debug;

use crate::config::HttpConfig;
use crate::error::{FetchError, NetworkErrorKind, TransportError};
use crate::request::BodyStream;

/// Response body as it arrives from the network.
pub type ResponseStream = BoxStream<'static, Result<Bytes, TransportError>>;

pub struct TransportRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Option<BodyStream>,
    /// Sent as `Content-Length` when known.
    pub body_len: Option<u64>,
}

impl std::fmt::Debug for TransportRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportRequest")
            .field("method", &self.method)
            .field("url", &self.url.as_str())
            .field("headers", &self.headers)
            .field("body_len", &self.body_len)
            .finish()
    }
}

pub struct TransportResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: ResponseStream,
}

/// One HTTP exchange, without redirects.
pub trait HttpTransport: Send + Sync + 'static {
    fn send(
        &self,
        request: TransportRequest,
    ) -> impl Future<Output = Result<TransportResponse, TransportError>> + Send;
}

/// `reqwest`-backed transport with automatic redirects turned off.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: Client,
}

impl ReqwestTransport {
    pub fn new(config: &HttpConfig) -> Result<Self, FetchError> {
        let mut builder = Client::builder()
            .connect_timeout(config.connect_timeout())
            .timeout(config.request_timeout())
            .user_agent(&config.user_agent)
            .redirect(reqwest::redirect::Policy::none());

        if let Some(ref url) = config.proxy {
            let proxy = Proxy::all(url)
                .map_err(|e| FetchError::MalformedRequest(format!("invalid proxy: {e}")))?;
            builder = builder.proxy(proxy);
        }

        let client = builder.build().map_err(|e| {
            FetchError::Network(TransportError::new(NetworkErrorKind::Other, e.to_string()))
        })?;

        Ok(Self { client })
    }

    pub fn from_client(client: Client) -> Self {
        Self { client }
    }
}

fn map_reqwest_error(e: reqwest::Error) -> TransportError {
    let kind = if e.is_timeout() {
        NetworkErrorKind::Timeout
    } else if e.is_connect() {
        NetworkErrorKind::CannotConnect
    } else if e.is_body() || e.is_decode() || peer_went_away(&e) {
        NetworkErrorKind::ConnectionLost
    } else {
        NetworkErrorKind::Other
    };
    TransportError::new(kind, e.to_string())
}

/// Walks the source chain for a connection the peer closed or reset
/// mid-exchange. hyper's own error type is not nameable from here, so its
/// "connection closed before message completed" is matched by message.
fn peer_went_away(e: &reqwest::Error) -> bool {
    let mut source = std::error::Error::source(e);
    while let Some(err) = source {
        if let Some(io) = err.downcast_ref::<std::io::Error>() {
            return matches!(
                io.kind(),
                std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::UnexpectedEof
            );
        }
        let message = err.to_string();
        if message.contains("connection closed") || message.contains("connection reset") {
            return true;
        }
        source = err.source();
    }
    false
}

impl HttpTransport for ReqwestTransport {
    async fn send(&self, request: TransportRequest) -> Result<TransportResponse, TransportError> {
        debug!(method = %request.method, url = %request.url, "Sending request");

        let mut builder = self
            .client
            .request(request.method, request.url)
            .headers(request.headers);

        if let Some(body) = request.body {
            if let Some(len) = request.body_len {
                builder = builder.header(CONTENT_LENGTH, HeaderValue::from(len));
            }
            builder = builder.body(reqwest::Body::wrap_stream(body));
        }

        let response = builder.send().await.map_err(map_reqwest_error)?;
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.bytes_stream().map_err(map_reqwest_error).boxed();

        Ok(TransportResponse {
            status,
            headers,
            body,
        })
    }
}
