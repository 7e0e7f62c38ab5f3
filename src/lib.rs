//! HTTP fetch engine with retry, redirects, challenges, conditional-GET
//! caching, cookies and chunked resumable uploads.

pub mod auth;
pub mod config;
pub mod cookies;
pub mod error;
pub mod fetcher;
pub mod history;
pub mod observability;
pub mod request;
pub mod retry;
pub mod service;
pub mod transport;
pub mod units;
pub mod upload;

pub use auth::{Challenge, Credential};
pub use cookies::{Cookie, CookieStore};
pub use error::{FetchError, NetworkErrorKind, Result, TransportError};
pub use fetcher::{FetchDelegate, FetchHandle, FetchState, Fetcher, on_complete};
pub use history::FetchHistory;
pub use request::{BodySource, FetchBody, FetchRequest, FetchResponse};
pub use retry::RetryPolicy;
pub use service::FetchService;
pub use transport::{HttpTransport, ReqwestTransport};
pub use upload::{UploadFetcher, UploadHandle, UploadPhase, UploadSource};
