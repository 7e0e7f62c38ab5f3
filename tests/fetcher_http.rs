//! Fetcher behavior against a real HTTP server.
//!
//! Each test starts an axum app on an ephemeral port and talks to it through
//! `ReqwestTransport`, so redirects, challenges and cookies go over the wire.

use axum::{
    Router,
    extract::State,
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use fetchengine::config::HttpConfig;
use fetchengine::{
    Credential, FetchBody, FetchError, FetchHistory, FetchRequest, FetchService, ReqwestTransport,
    RetryPolicy, on_complete,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::oneshot;

const LAST_MODIFIED: &str = "Tue, 15 Nov 1994 12:45:26 GMT";

#[derive(Clone, Default)]
struct Counters {
    flaky: Arc<AtomicUsize>,
    versioned: Arc<AtomicUsize>,
}

async fn start_mock_server() -> (String, Counters) {
    let counters = Counters::default();
    let app = Router::new()
        .route("/ok", get(|| async { "ok" }))
        .route(
            "/missing",
            get(|| async { (StatusCode::NOT_FOUND, "not found") }),
        )
        .route("/flaky", get(flaky))
        .route("/versioned", get(versioned))
        .route("/slow", get(slow))
        .route("/old", get(|| async { redirect("/new") }))
        .route("/new", get(|| async { "moved here" }))
        .route("/protected", get(protected))
        .route("/login", get(login))
        .route("/whoami", get(whoami))
        .with_state(counters.clone());

    let addr = SocketAddr::from(([127, 0, 0, 1], 0));
    let listener = tokio::net::TcpListener::bind(addr).await.unwrap();
    let bound_addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (format!("http://{bound_addr}"), counters)
}

fn redirect(location: &str) -> Response {
    (StatusCode::FOUND, [(header::LOCATION, location.to_string())]).into_response()
}

/// Unavailable twice, then fine.
async fn flaky(State(counters): State<Counters>) -> Response {
    if counters.flaky.fetch_add(1, Ordering::SeqCst) < 2 {
        (StatusCode::SERVICE_UNAVAILABLE, "busy").into_response()
    } else {
        "recovered".into_response()
    }
}

/// Serves "v1" dated, then answers conditional requests with 304.
async fn versioned(State(counters): State<Counters>, headers: HeaderMap) -> Response {
    counters.versioned.fetch_add(1, Ordering::SeqCst);
    match headers.get(header::IF_MODIFIED_SINCE) {
        Some(since) if since == LAST_MODIFIED => StatusCode::NOT_MODIFIED.into_response(),
        _ => ([(header::LAST_MODIFIED, LAST_MODIFIED)], "v1").into_response(),
    }
}

async fn slow() -> &'static str {
    tokio::time::sleep(Duration::from_secs(30)).await;
    "too late"
}

async fn protected(headers: HeaderMap) -> Response {
    // alice:secret
    match headers.get(header::AUTHORIZATION) {
        Some(value) if value == "Basic YWxpY2U6c2VjcmV0" => "welcome".into_response(),
        _ => (
            StatusCode::UNAUTHORIZED,
            [(header::WWW_AUTHENTICATE, "Basic realm=\"members\"")],
            "denied",
        )
            .into_response(),
    }
}

async fn login() -> Response {
    (
        [(header::SET_COOKIE, "session=s3cr3t; Path=/")],
        "logged in",
    )
        .into_response()
}

async fn whoami(headers: HeaderMap) -> String {
    headers
        .get(header::COOKIE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("anonymous")
        .to_string()
}

fn service() -> FetchService<ReqwestTransport> {
    let transport = ReqwestTransport::new(&HttpConfig::default()).unwrap();
    FetchService::new(Arc::new(transport))
}

#[tokio::test]
async fn test_success_without_last_modified_leaves_history_untouched() {
    let (base, _) = start_mock_server().await;
    let history = Arc::new(FetchHistory::new(true, fetchengine::units::ByteSize::mib(1)));

    let (tx, rx) = oneshot::channel();
    service()
        .fetcher(FetchRequest::get(format!("{base}/ok")))
        .with_history(history.clone())
        .begin_fetch(on_complete(move |result| {
            let _ = tx.send(result);
        }))
        .unwrap();

    let response = rx.await.unwrap().unwrap();
    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.body.bytes().unwrap().as_ref(), b"ok");
    assert!(!response.served_from_cache);
    assert_eq!(history.stats().dated_entries, 0);
}

#[tokio::test]
async fn test_not_found_reports_status_and_body() {
    let (base, _) = start_mock_server().await;

    let err = service()
        .fetcher(FetchRequest::get(format!("{base}/missing")))
        .fetch()
        .await
        .unwrap_err();

    assert_eq!(err.status(), Some(StatusCode::NOT_FOUND));
    assert_eq!(err.body().unwrap().as_ref(), b"not found");
}

#[tokio::test]
async fn test_service_unavailable_is_retried_until_success() {
    let (base, counters) = start_mock_server().await;
    let policy = RetryPolicy::enabled()
        .with_min_interval(Duration::from_millis(20))
        .with_max_interval(Duration::from_secs(5));

    let response = service()
        .fetcher(FetchRequest::get(format!("{base}/flaky")))
        .with_retry(policy)
        .fetch()
        .await
        .unwrap();

    assert_eq!(response.body.bytes().unwrap().as_ref(), b"recovered");
    assert_eq!(counters.flaky.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_conditional_get_serves_cached_body() {
    let (base, counters) = start_mock_server().await;
    let service = service().with_history_config(fetchengine::config::HistoryConfig {
        cache_dated_data: true,
        ..Default::default()
    });
    let history = service.history();
    let url = format!("{base}/versioned");

    let first = service
        .fetcher(FetchRequest::get(url.clone()))
        .with_history(history.clone())
        .fetch()
        .await
        .unwrap();
    assert_eq!(first.status, StatusCode::OK);
    assert_eq!(
        history.last_modified_for(&first.url).as_deref(),
        Some(LAST_MODIFIED)
    );

    let second = service
        .fetcher(FetchRequest::get(url))
        .with_history(history)
        .fetch()
        .await
        .unwrap();
    assert_eq!(second.status, StatusCode::NOT_MODIFIED);
    assert!(second.served_from_cache);
    assert_eq!(second.body.bytes().unwrap().as_ref(), b"v1");
    assert_eq!(counters.versioned.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_not_modified_without_cache_is_a_status_error() {
    let (base, _) = start_mock_server().await;
    let service = service();
    let history = service.history();
    let url = format!("{base}/versioned");

    service
        .fetcher(FetchRequest::get(url.clone()))
        .with_history(history.clone())
        .fetch()
        .await
        .unwrap();
    let err = service
        .fetcher(FetchRequest::get(url))
        .with_history(history)
        .fetch()
        .await
        .unwrap_err();

    assert_eq!(err.status(), Some(StatusCode::NOT_MODIFIED));
}

#[tokio::test]
async fn test_cancelled_fetch_never_calls_back() {
    let (base, _) = start_mock_server().await;

    let (tx, rx) = oneshot::channel();
    let handle = service()
        .fetcher(FetchRequest::get(format!("{base}/slow")))
        .begin_fetch(on_complete(move |result| {
            let _ = tx.send(result);
        }))
        .unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(handle.is_fetching());
    handle.stop_fetching();
    assert!(!handle.is_fetching());

    // sender dropped with the aborted task
    assert!(rx.await.is_err());
}

#[tokio::test]
async fn test_redirect_reports_final_url() {
    let (base, _) = start_mock_server().await;

    let response = service()
        .fetcher(FetchRequest::get(format!("{base}/old")))
        .fetch()
        .await
        .unwrap();

    assert_eq!(response.url.path(), "/new");
    assert_eq!(response.body.bytes().unwrap().as_ref(), b"moved here");
}

#[tokio::test]
async fn test_basic_challenge_is_answered() {
    let (base, _) = start_mock_server().await;

    let response = service()
        .fetcher(FetchRequest::get(format!("{base}/protected")))
        .with_credential(Credential::new("alice", "secret"))
        .fetch()
        .await
        .unwrap();
    assert_eq!(response.body.bytes().unwrap().as_ref(), b"welcome");
}

#[tokio::test]
async fn test_wrong_credential_surfaces_challenge() {
    let (base, _) = start_mock_server().await;

    let err = service()
        .fetcher(FetchRequest::get(format!("{base}/protected")))
        .with_credential(Credential::new("alice", "guess"))
        .fetch()
        .await
        .unwrap_err();

    let FetchError::AuthChallenge { challenge, status, .. } = err else {
        panic!("expected an auth challenge, got {err:?}");
    };
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(challenge.realm.as_deref(), Some("members"));
    assert_eq!(challenge.failure_count, 1);
}

#[tokio::test]
async fn test_cookies_flow_between_fetchers() {
    let (base, _) = start_mock_server().await;
    let service = service();

    service
        .fetcher(FetchRequest::get(format!("{base}/login")))
        .fetch()
        .await
        .unwrap();
    let response = service
        .fetcher(FetchRequest::get(format!("{base}/whoami")))
        .fetch()
        .await
        .unwrap();

    assert_eq!(response.body.bytes().unwrap().as_ref(), b"session=s3cr3t");
}

#[tokio::test]
async fn test_download_to_file() {
    let (base, _) = start_mock_server().await;
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("ok.txt");

    let response = service()
        .fetcher(FetchRequest::get(format!("{base}/ok")))
        .with_download_path(&path)
        .fetch()
        .await
        .unwrap();

    assert_eq!(response.body, FetchBody::File { path: path.clone(), len: 2 });
    assert_eq!(std::fs::read(&path).unwrap(), b"ok");
}
