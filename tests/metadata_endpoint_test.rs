//! End-to-end tests for the metadata endpoint.
//!
//! Each test spins up a real metafetch server on an ephemeral port via
//! [`run_server_with_config`] next to a small fixture site that serves HTML
//! pages, then drives both through `reqwest`.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::{Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Redirect, Response};
use axum::routing::get;
use axum::Router;
use serde_json::{json, Value};

use metafetch::config::{Environment, ServiceConfig};
use metafetch::server::startup::{run_server_with_config, ServerConfig, ServerHandle};

// ---------------------------------------------------------------------------
// Fixture site
// ---------------------------------------------------------------------------

const FULL_PAGE: &str = r#"<!doctype html>
<html>
<head>
  <title>Fish &amp; Chips</title>
  <meta name="description" content="The best chippy in town">
  <meta property="og:image" content="https://cdn.example.com/chips.png">
</head>
<body><p>Hello</p></body>
</html>"#;

const BARE_PAGE: &str = "<html><body><p>No head here</p></body></html>";

#[derive(Clone, Default)]
struct FixtureState {
    hits: Arc<AtomicUsize>,
    in_flight: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

struct Fixture {
    addr: SocketAddr,
    state: FixtureState,
}

impl Fixture {
    fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    fn hits(&self) -> usize {
        self.state.hits.load(Ordering::SeqCst)
    }

    fn peak_in_flight(&self) -> usize {
        self.state.peak.load(Ordering::SeqCst)
    }
}

async fn html(body: &'static str) -> Response {
    ([(header::CONTENT_TYPE, "text/html; charset=utf-8")], body).into_response()
}

/// Sleeps for `?ms=` milliseconds (default 100) while tracking concurrency.
async fn slow(
    State(state): State<FixtureState>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let ms = params
        .get("ms")
        .and_then(|v| v.parse().ok())
        .unwrap_or(100);

    let now = state.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
    state.peak.fetch_max(now, Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(ms)).await;
    state.in_flight.fetch_sub(1, Ordering::SeqCst);

    html(FULL_PAGE).await
}

async fn huge_stream() -> Response {
    let chunks = (0..64).map(|_| Ok::<_, std::io::Error>(vec![b' '; 1024]));
    (
        [(header::CONTENT_TYPE, "text/html")],
        Body::from_stream(futures_util::stream::iter(chunks)),
    )
        .into_response()
}

async fn start_fixture() -> Fixture {
    let state = FixtureState::default();

    async fn count(
        State(state): State<FixtureState>,
        request: axum::extract::Request,
        next: axum::middleware::Next,
    ) -> Response {
        state.hits.fetch_add(1, Ordering::SeqCst);
        next.run(request).await
    }

    let app = Router::new()
        .route("/full", get(|| html(FULL_PAGE)))
        .route("/bare", get(|| html(BARE_PAGE)))
        .route("/redirect", get(|| async { Redirect::temporary("/full") }))
        .route("/loop", get(|| async { Redirect::temporary("/loop") }))
        .route("/missing", get(|| async { StatusCode::NOT_FOUND }))
        .route("/slow", get(slow))
        .route("/huge", get(huge_stream))
        .route(
            "/data.json",
            get(|| async { ([(header::CONTENT_TYPE, "application/json")], "{}") }),
        )
        .layer(axum::middleware::from_fn_with_state(state.clone(), count))
        .with_state(state.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    Fixture { addr, state }
}

// ---------------------------------------------------------------------------
// Service under test
// ---------------------------------------------------------------------------

fn test_service_config() -> ServiceConfig {
    let mut cfg = ServiceConfig::for_environment(Environment::Test);
    cfg.host = "127.0.0.1".to_string();
    cfg.port = 0;
    cfg
}

async fn start_server_with(cfg: ServiceConfig) -> ServerHandle {
    let mut config = ServerConfig::from_service_config(&cfg).unwrap();
    config.spawn_background_tasks = false;
    run_server_with_config(config).await.unwrap()
}

async fn start_test_server() -> ServerHandle {
    start_server_with(test_service_config()).await
}

/// Browser-like client carrying the session cookie and the current token.
struct ApiClient {
    http: reqwest::Client,
    base: String,
    cookie: Option<String>,
    token: Option<String>,
}

impl ApiClient {
    fn new(handle: &ServerHandle) -> Self {
        ApiClient {
            http: reqwest::Client::new(),
            base: handle.base_url(),
            cookie: None,
            token: None,
        }
    }

    async fn fetch_token(&mut self) {
        let mut req = self.http.get(format!("{}/get-csrf-token", self.base));
        if let Some(cookie) = &self.cookie {
            req = req.header(header::COOKIE, cookie);
        }
        let resp = req.send().await.unwrap();
        assert_eq!(resp.status(), 200);

        if let Some(set_cookie) = resp.headers().get(header::SET_COOKIE) {
            let pair = set_cookie.to_str().unwrap().split(';').next().unwrap();
            self.cookie = Some(pair.to_string());
        }
        let body: Value = resp.json().await.unwrap();
        self.token = Some(body["csrfToken"].as_str().unwrap().to_string());
    }

    async fn post_raw(&self, body: String, token: Option<&str>) -> reqwest::Response {
        let mut req = self
            .http
            .post(format!("{}/fetch-metadata", self.base))
            .header(header::CONTENT_TYPE, "application/json")
            .body(body);
        if let Some(cookie) = &self.cookie {
            req = req.header(header::COOKIE, cookie);
        }
        if let Some(token) = token {
            req = req.header("x-csrf-token", token);
        }
        req.send().await.unwrap()
    }

    /// POST with the current token, adopting the rotated one on success.
    async fn post(&mut self, body: Value) -> (StatusCode, Value) {
        let token = self.token.clone();
        let resp = self.post_raw(body.to_string(), token.as_deref()).await;
        let status = StatusCode::from_u16(resp.status().as_u16()).unwrap();
        let json: Value = resp.json().await.unwrap();
        if status == StatusCode::OK {
            self.token = json["csrfToken"].as_str().map(str::to_string);
        }
        (status, json)
    }
}

// ---------------------------------------------------------------------------
// Happy path
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_empty_batch_returns_empty_results() {
    let handle = start_test_server().await;
    let mut client = ApiClient::new(&handle);
    client.fetch_token().await;

    let (status, body) = client.post(json!({ "urls": [] })).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["metadataResults"], json!([]));
    assert!(body["csrfToken"].is_string());

    handle.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_extracts_all_fields() {
    let fixture = start_fixture().await;
    let handle = start_test_server().await;
    let mut client = ApiClient::new(&handle);
    client.fetch_token().await;

    let (status, body) = client.post(json!({ "urls": [fixture.url("/full")] })).await;
    assert_eq!(status, StatusCode::OK);

    let results = body["metadataResults"].as_array().unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(
        results[0],
        json!({
            "url": fixture.url("/full"),
            "title": "Fish & Chips",
            "description": "The best chippy in town",
            "image": "https://cdn.example.com/chips.png",
        })
    );

    handle.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_page_without_metadata_has_empty_fields() {
    let fixture = start_fixture().await;
    let handle = start_test_server().await;
    let mut client = ApiClient::new(&handle);
    client.fetch_token().await;

    let (_, body) = client.post(json!({ "urls": [fixture.url("/bare")] })).await;
    let entry = &body["metadataResults"][0];
    assert_eq!(entry["title"], "");
    assert_eq!(entry["description"], "");
    assert_eq!(entry["image"], "");
    assert!(entry.get("error").is_none());

    handle.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_results_preserve_input_order() {
    let fixture = start_fixture().await;
    let handle = start_test_server().await;
    let mut client = ApiClient::new(&handle);
    client.fetch_token().await;

    let urls = vec![
        fixture.url("/missing"),
        fixture.url("/full"),
        "http://localhost:1".to_string(),
        fixture.url("/bare"),
        fixture.url("/redirect"),
        fixture.url("/data.json"),
    ];
    let (status, body) = client.post(json!({ "urls": urls })).await;
    assert_eq!(status, StatusCode::OK);

    let results = body["metadataResults"].as_array().unwrap();
    let echoed: Vec<&str> = results.iter().map(|r| r["url"].as_str().unwrap()).collect();
    assert_eq!(echoed, urls.iter().map(String::as_str).collect::<Vec<_>>());

    // 404, unreachable host and non-HTML content fail individually.
    assert!(results[0]["error"].as_str().unwrap().contains("404"));
    assert!(results[2]["error"].is_string());
    assert!(results[5]["error"].is_string());

    // Siblings still succeed; the redirect lands on the full page.
    assert_eq!(results[1]["title"], "Fish & Chips");
    assert!(results[3].get("error").is_none());
    assert_eq!(results[4]["title"], "Fish & Chips");

    handle.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_invalid_and_duplicate_urls_are_dropped() {
    let fixture = start_fixture().await;
    let handle = start_test_server().await;
    let mut client = ApiClient::new(&handle);
    client.fetch_token().await;

    let full = fixture.url("/full");
    let (status, body) = client
        .post(json!({ "urls": ["not a url", full, "", 42, full, "mailto:a@b.example"] }))
        .await;
    assert_eq!(status, StatusCode::OK);

    let results = body["metadataResults"].as_array().unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0]["url"], full);
    assert_eq!(fixture.hits(), 1);

    handle.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_repeated_batch_is_idempotent() {
    let fixture = start_fixture().await;
    let handle = start_test_server().await;
    let mut client = ApiClient::new(&handle);
    client.fetch_token().await;

    let batch = json!({ "urls": [fixture.url("/full"), fixture.url("/bare")] });
    let (_, first) = client.post(batch.clone()).await;
    let (_, second) = client.post(batch).await;
    assert_eq!(first["metadataResults"], second["metadataResults"]);
    assert_ne!(first["csrfToken"], second["csrfToken"]);

    handle.shutdown().await;
}

// ---------------------------------------------------------------------------
// Per-URL failure modes and concurrency
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_slow_url_times_out_alone() {
    let fixture = start_fixture().await;
    let mut cfg = test_service_config();
    cfg.fetch.timeout_ms = 300;
    let handle = start_server_with(cfg).await;
    let mut client = ApiClient::new(&handle);
    client.fetch_token().await;

    let started = std::time::Instant::now();
    let (status, body) = client
        .post(json!({ "urls": [fixture.url("/slow?ms=3000"), fixture.url("/full")] }))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert!(started.elapsed() < Duration::from_secs(2));

    let results = body["metadataResults"].as_array().unwrap();
    assert_eq!(results[0]["error"], "Request timed out after 300ms");
    assert_eq!(results[1]["title"], "Fish & Chips");

    handle.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_redirect_loop_and_oversized_body_fail_per_item() {
    let fixture = start_fixture().await;
    let mut cfg = test_service_config();
    cfg.fetch.max_body_bytes = 16 * 1024;
    let handle = start_server_with(cfg).await;
    let mut client = ApiClient::new(&handle);
    client.fetch_token().await;

    let (status, body) = client
        .post(json!({ "urls": [fixture.url("/loop"), fixture.url("/huge"), fixture.url("/bare")] }))
        .await;
    assert_eq!(status, StatusCode::OK);

    let results = body["metadataResults"].as_array().unwrap();
    assert_eq!(results[0]["error"], "Too many redirects (max 5)");
    assert!(results[1]["error"]
        .as_str()
        .unwrap()
        .starts_with("Response too large"));
    assert!(results[2].get("error").is_none());

    handle.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_max_concurrency_bounds_in_flight_fetches() {
    let fixture = start_fixture().await;
    let mut cfg = test_service_config();
    cfg.batch.max_concurrency = 2;
    let handle = start_server_with(cfg).await;
    let mut client = ApiClient::new(&handle);
    client.fetch_token().await;

    let urls: Vec<String> = (0..6)
        .map(|i| fixture.url(&format!("/slow?ms=150&n={}", i)))
        .collect();
    let (status, body) = client.post(json!({ "urls": urls })).await;
    assert_eq!(status, StatusCode::OK);

    let results = body["metadataResults"].as_array().unwrap();
    assert_eq!(results.len(), 6);
    assert!(results.iter().all(|r| r.get("error").is_none()));
    assert_eq!(fixture.peak_in_flight(), 2);

    handle.shutdown().await;
}

// ---------------------------------------------------------------------------
// Admission and forgery checks
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_malformed_body_is_400() {
    let handle = start_test_server().await;
    let mut client = ApiClient::new(&handle);

    for body in [json!({}), json!({ "urls": "https://example.com" }), json!({ "urls": {} })] {
        client.fetch_token().await;
        let (status, json) = client.post(body).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(json["error"].is_string());
    }

    handle.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_missing_token_is_403_without_fetching() {
    let fixture = start_fixture().await;
    let handle = start_test_server().await;
    let mut client = ApiClient::new(&handle);
    client.fetch_token().await;

    let body = json!({ "urls": [fixture.url("/full")] }).to_string();
    let resp = client.post_raw(body.clone(), None).await;
    assert_eq!(resp.status(), 403);

    let resp = client.post_raw(body, Some("not-the-token")).await;
    assert_eq!(resp.status(), 403);
    let json: Value = resp.json().await.unwrap();
    assert!(json["error"].is_string());

    assert_eq!(fixture.hits(), 0);

    handle.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_used_token_cannot_be_replayed() {
    let handle = start_test_server().await;
    let mut client = ApiClient::new(&handle);
    client.fetch_token().await;
    let original = client.token.clone().unwrap();

    let (status, body) = client.post(json!({ "urls": [] })).await;
    assert_eq!(status, StatusCode::OK);
    assert_ne!(body["csrfToken"].as_str().unwrap(), original);

    let resp = client
        .post_raw(json!({ "urls": [] }).to_string(), Some(&original))
        .await;
    assert_eq!(resp.status(), 403);

    // The rotated token keeps working.
    let (status, _) = client.post(json!({ "urls": [] })).await;
    assert_eq!(status, StatusCode::OK);

    handle.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_posts_with_one_token_admit_one() {
    let fixture = start_fixture().await;
    let handle = start_test_server().await;
    let mut client = ApiClient::new(&handle);
    client.fetch_token().await;
    let token = client.token.clone();

    let body = json!({ "urls": [fixture.url("/slow?ms=300")] }).to_string();
    let (first, second) = tokio::join!(
        client.post_raw(body.clone(), token.as_deref()),
        client.post_raw(body.clone(), token.as_deref()),
    );

    let mut statuses = [first.status().as_u16(), second.status().as_u16()];
    statuses.sort();
    assert_eq!(statuses, [200, 403]);
    assert_eq!(fixture.hits(), 1);

    let winner = if first.status() == 200 { first } else { second };
    let json: Value = winner.json().await.unwrap();
    client.token = json["csrfToken"].as_str().map(str::to_string);

    // The token handed to the admitted request is live.
    let (status, _) = client.post(json!({ "urls": [] })).await;
    assert_eq!(status, StatusCode::OK);

    handle.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_token_is_bound_to_its_session() {
    let handle = start_test_server().await;
    let mut alice = ApiClient::new(&handle);
    let mut mallory = ApiClient::new(&handle);
    alice.fetch_token().await;
    mallory.fetch_token().await;

    let stolen = alice.token.clone();
    let resp = mallory
        .post_raw(json!({ "urls": [] }).to_string(), stolen.as_deref())
        .await;
    assert_eq!(resp.status(), 403);

    handle.shutdown().await;
}

// ---------------------------------------------------------------------------
// Rate limiting
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_rate_limit_rejects_then_recovers() {
    let fixture = start_fixture().await;
    let mut cfg = test_service_config();
    cfg.rate_limit.window_ms = 500;
    cfg.rate_limit.max_requests = 3;
    let handle = start_server_with(cfg).await;
    let mut client = ApiClient::new(&handle);

    // Token fetch counts against the budget too.
    client.fetch_token().await;
    let batch = json!({ "urls": [fixture.url("/full")] });

    let mut statuses = Vec::new();
    for _ in 0..4 {
        let resp = client.post_raw(batch.to_string(), client.token.as_deref()).await;
        statuses.push(resp.status().as_u16());
        if resp.status() == 429 {
            assert!(resp.headers().contains_key(header::RETRY_AFTER));
        }
        if resp.status() == 200 {
            let json: Value = resp.json().await.unwrap();
            client.token = json["csrfToken"].as_str().map(str::to_string);
        }
    }
    assert_eq!(statuses, vec![200, 200, 429, 429]);
    // Rejected requests never reach the network.
    assert_eq!(fixture.hits(), 2);

    tokio::time::sleep(Duration::from_millis(600)).await;
    let (status, _) = client.post(batch).await;
    assert_eq!(status, StatusCode::OK);

    handle.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_rate_limit_reset_hook() {
    let mut cfg = test_service_config();
    cfg.rate_limit.window_ms = 60_000;
    cfg.rate_limit.max_requests = 1;
    let handle = start_server_with(cfg).await;
    let url = format!("{}/health", handle.base_url());

    assert_eq!(reqwest::get(&url).await.unwrap().status(), 200);
    assert_eq!(reqwest::get(&url).await.unwrap().status(), 429);

    handle.rate_limiter().reset_all();
    assert_eq!(reqwest::get(&url).await.unwrap().status(), 200);

    handle.shutdown().await;
}

// ---------------------------------------------------------------------------
// Ambient endpoints
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_health_and_security_headers() {
    let handle = start_test_server().await;

    let resp = reqwest::get(format!("{}/health", handle.base_url()))
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let headers = resp.headers();
    assert_eq!(headers["x-content-type-options"], "nosniff");
    assert_eq!(headers["x-frame-options"], "DENY");
    assert_eq!(headers["referrer-policy"], "no-referrer");
    assert!(headers.contains_key("x-ratelimit-limit"));

    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "ok");
    assert!(body["uptimeSeconds"].is_i64());

    handle.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_nonexistent_route_returns_404() {
    let handle = start_test_server().await;

    let resp = reqwest::get(format!("{}/does-not-exist", handle.base_url()))
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);

    handle.shutdown().await;
}
