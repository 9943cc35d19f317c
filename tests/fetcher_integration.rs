use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::{Duration, Instant},
};

use axum::{
    extract::State,
    http::{header, HeaderMap, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response as HttpResponse},
    Router,
};
use newboy_fetch::{
    remap::{Fields, RemapError},
    CancellationToken, Decode, FetchError, FetchService, Fetcher, FetcherOptions,
    PluginLifecycle, RequestDescriptor, RetryPolicy,
};
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};

#[derive(Clone)]
struct MockResponse {
    status: StatusCode,
    body: String,
    content_type: &'static str,
    delay: Duration,
}

impl MockResponse {
    fn json(status: StatusCode, body: JsonValue) -> Self {
        Self {
            status,
            body: body.to_string(),
            content_type: "application/json",
            delay: Duration::from_millis(0),
        }
    }

    fn raw(status: StatusCode, body: &str, content_type: &'static str) -> Self {
        Self {
            status,
            body: body.to_owned(),
            content_type,
            delay: Duration::from_millis(0),
        }
    }

    fn status(status: StatusCode) -> Self {
        Self::json(status, json!({ "error": status.as_u16() }))
    }

    fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

#[derive(Clone, Debug)]
struct RecordedRequest {
    method: Method,
    path: String,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
}

#[derive(Clone)]
struct MockState {
    responses: Arc<Mutex<VecDeque<MockResponse>>>,
    fallback: MockResponse,
    hits: Arc<AtomicUsize>,
    active: Arc<AtomicUsize>,
    max_active: Arc<AtomicUsize>,
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
}

async fn scripted_handler(
    State(state): State<MockState>,
    method: Method,
    uri: axum::http::Uri,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> HttpResponse {
    state.hits.fetch_add(1, Ordering::SeqCst);
    let now = state.active.fetch_add(1, Ordering::SeqCst) + 1;
    state.max_active.fetch_max(now, Ordering::SeqCst);

    state
        .requests
        .lock()
        .expect("request log mutex must not be poisoned")
        .push(RecordedRequest {
            method,
            path: uri.path().to_owned(),
            headers: headers
                .iter()
                .map(|(k, v)| {
                    (
                        k.as_str().to_owned(),
                        v.to_str().unwrap_or_default().to_owned(),
                    )
                })
                .collect(),
            body: body.to_vec(),
        });

    let response = {
        let mut queue = state
            .responses
            .lock()
            .expect("response queue mutex must not be poisoned");
        queue.pop_front().unwrap_or_else(|| state.fallback.clone())
    };

    if !response.delay.is_zero() {
        tokio::time::sleep(response.delay).await;
    }
    state.active.fetch_sub(1, Ordering::SeqCst);

    let mut out = HeaderMap::new();
    out.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static(response.content_type),
    );
    (response.status, out, response.body).into_response()
}

struct TestServer {
    base_url: String,
    hits: Arc<AtomicUsize>,
    max_active: Arc<AtomicUsize>,
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
    task: tokio::task::JoinHandle<()>,
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl TestServer {
    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }

    fn recorded(&self) -> Vec<RecordedRequest> {
        self.requests
            .lock()
            .expect("request log mutex must not be poisoned")
            .clone()
    }

    async fn wait_for_hits(&self, expected: usize) {
        for _ in 0..400 {
            if self.hits() >= expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("server saw {} hits, expected {expected}", self.hits());
    }
}

async fn spawn_server(responses: Vec<MockResponse>) -> TestServer {
    spawn_server_with_fallback(
        responses,
        MockResponse::json(
            StatusCode::INTERNAL_SERVER_ERROR,
            json!({"error": "no mock response available"}),
        ),
    )
    .await
}

async fn spawn_server_with_fallback(
    responses: Vec<MockResponse>,
    fallback: MockResponse,
) -> TestServer {
    let state = MockState {
        responses: Arc::new(Mutex::new(responses.into())),
        fallback,
        hits: Arc::new(AtomicUsize::new(0)),
        active: Arc::new(AtomicUsize::new(0)),
        max_active: Arc::new(AtomicUsize::new(0)),
        requests: Arc::new(Mutex::new(Vec::new())),
    };

    let app = Router::new()
        .fallback(scripted_handler)
        .with_state(state.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("must bind test listener");
    let address = listener.local_addr().expect("must have local addr");
    let task = tokio::spawn(async move {
        axum::serve(listener, app)
            .await
            .expect("mock server must run");
    });

    TestServer {
        base_url: format!("http://{address}"),
        hits: state.hits,
        max_active: state.max_active,
        requests: state.requests,
        task,
    }
}

fn fetcher(retry: RetryPolicy) -> Fetcher {
    Fetcher::new(
        FetcherOptions::default()
            .with_timeout_ms(2_000)
            .with_retry(retry),
    )
    .expect("must build fetcher")
}

fn fast_retry(max_attempts: u32) -> RetryPolicy {
    RetryPolicy::default()
        .with_max_attempts(max_attempts)
        .with_backoff(1, 1.0)
}

#[derive(Debug, Deserialize)]
struct UserMoney {
    status: i64,
    content: MoneyContent,
}

#[derive(Debug, Deserialize)]
struct MoneyContent {
    pfid: String,
    #[serde(default)]
    vip: bool,
}

impl Decode for UserMoney {
    fn remap(value: &JsonValue) -> Result<Self, RemapError> {
        let fields = Fields::new(value)?;
        let content = fields
            .object("content")?
            .ok_or_else(|| RemapError::Missing("content".to_owned()))?;
        Ok(Self {
            status: fields.i64("status")?,
            content: MoneyContent {
                pfid: content.str_or("pfid", "0")?,
                vip: content.bool_or("vip", false)?,
            },
        })
    }
}

#[tokio::test]
async fn succeeds_on_third_attempt_after_backoff() {
    let server = spawn_server(vec![
        MockResponse::status(StatusCode::SERVICE_UNAVAILABLE),
        MockResponse::status(StatusCode::SERVICE_UNAVAILABLE),
        MockResponse::json(StatusCode::OK, json!({"status": 200})),
    ])
    .await;
    let policy = RetryPolicy::default()
        .with_max_attempts(3)
        .with_backoff(100, 2.0)
        .with_jitter(0)
        .with_retryable_statuses([503]);
    let fetcher = fetcher(RetryPolicy::no_retry());

    let started = Instant::now();
    let response = fetcher
        .fetch_with(&RequestDescriptor::get(server.url("/live")), &policy)
        .await
        .expect("third attempt must succeed");
    let elapsed = started.elapsed();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.attempts(), 3);
    assert_eq!(server.hits(), 3);
    assert!(elapsed >= Duration::from_millis(300), "elapsed {elapsed:?}");
    assert_eq!(fetcher.gate().in_flight(), 0);
}

#[tokio::test]
async fn permanent_transport_failure_makes_exactly_max_attempts() {
    let address = std::net::TcpListener::bind("127.0.0.1:0")
        .expect("must bind")
        .local_addr()
        .expect("must have local addr");
    // Listener dropped above: the port now refuses connections.
    let fetcher = fetcher(fast_retry(4));

    let err = fetcher
        .fetch(&RequestDescriptor::get(format!("http://{address}/")))
        .await
        .expect_err("nothing listens on the port");

    match err {
        FetchError::RetryExhausted { attempts, last } => {
            assert_eq!(attempts, 4);
            assert!(matches!(*last, FetchError::Transport(_)));
        }
        other => panic!("expected retry exhaustion, got {other:?}"),
    }
    assert_eq!(fetcher.gate().in_flight(), 0);
}

#[tokio::test]
async fn terminal_status_is_returned_without_retrying() {
    let server = spawn_server(vec![MockResponse::raw(
        StatusCode::NOT_FOUND,
        "no such room",
        "text/plain",
    )])
    .await;
    let fetcher = fetcher(fast_retry(5));

    let err = fetcher
        .fetch(&RequestDescriptor::get(server.url("/room")))
        .await
        .expect_err("404 is terminal");

    match err {
        FetchError::Status { status, body } => {
            assert_eq!(status, 404);
            assert_eq!(body, "no such room");
        }
        other => panic!("expected status error, got {other:?}"),
    }
    assert_eq!(server.hits(), 1);
}

#[tokio::test]
async fn retryable_status_until_exhaustion() {
    let server = spawn_server_with_fallback(
        vec![],
        MockResponse::status(StatusCode::TOO_MANY_REQUESTS),
    )
    .await;
    let fetcher = fetcher(fast_retry(3));

    let err = fetcher
        .fetch(&RequestDescriptor::get(server.url("/search")))
        .await
        .expect_err("always rate limited");

    assert_eq!(err.attempts(), Some(3));
    assert_eq!(err.status(), Some(429));
    assert_eq!(server.hits(), 3);
}

#[tokio::test]
async fn per_attempt_timeout_is_retried_as_transport_error() {
    let slow = MockResponse::json(StatusCode::OK, json!({})).with_delay(Duration::from_millis(300));
    let server = spawn_server(vec![slow.clone(), slow]).await;
    let fetcher = fetcher(fast_retry(2));

    let err = fetcher
        .fetch(&RequestDescriptor::get(server.url("/slow")).with_timeout(Duration::from_millis(30)))
        .await
        .expect_err("both attempts time out");

    match err {
        FetchError::RetryExhausted { attempts, last } => {
            assert_eq!(attempts, 2);
            match *last {
                FetchError::Transport(inner) => assert!(inner.is_timeout()),
                other => panic!("expected transport timeout, got {other:?}"),
            }
        }
        other => panic!("expected retry exhaustion, got {other:?}"),
    }
}

#[tokio::test]
async fn overall_deadline_stops_retry_loop() {
    let server = spawn_server_with_fallback(
        vec![],
        MockResponse::status(StatusCode::SERVICE_UNAVAILABLE),
    )
    .await;
    let fetcher = fetcher(
        RetryPolicy::default()
            .with_max_attempts(10)
            .with_backoff(100, 2.0),
    );

    let err = fetcher
        .fetch(&RequestDescriptor::get(server.url("/busy")).with_deadline_in(Duration::from_millis(150)))
        .await
        .expect_err("deadline must stop the loop");

    // Attempts at ~0ms and ~100ms; the next would start at ~300ms.
    assert!(matches!(err, FetchError::DeadlineExceeded { attempts: 2 }), "{err:?}");
    assert_eq!(server.hits(), 2);
}

#[tokio::test]
async fn cancel_while_waiting_for_gate_leaves_counter_unchanged() {
    let server = spawn_server(vec![MockResponse::json(StatusCode::OK, json!({}))]).await;
    let fetcher = Fetcher::new(FetcherOptions::default().with_max_concurrency(1))
        .expect("must build fetcher");
    let held = fetcher.gate().acquire().await.expect("slot");

    let cancel = CancellationToken::new();
    let task = {
        let fetcher = fetcher.clone();
        let cancel = cancel.clone();
        let request = RequestDescriptor::get(server.url("/queued"));
        tokio::spawn(async move {
            fetcher
                .fetch_cancellable(&request, &RetryPolicy::default(), &cancel)
                .await
        })
    };

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(fetcher.gate().in_flight(), 1);
    cancel.cancel();

    let result = task.await.expect("task must finish");
    assert!(matches!(result, Err(FetchError::Cancelled)));
    assert_eq!(fetcher.gate().in_flight(), 1);
    assert_eq!(server.hits(), 0);

    drop(held);
    assert_eq!(fetcher.gate().in_flight(), 0);
}

#[tokio::test]
async fn cancel_during_backoff_releases_exactly_one_permit() {
    let server = spawn_server_with_fallback(
        vec![],
        MockResponse::status(StatusCode::SERVICE_UNAVAILABLE),
    )
    .await;
    let fetcher = fetcher(
        RetryPolicy::default()
            .with_max_attempts(3)
            .with_backoff(10_000, 1.0),
    );

    let cancel = CancellationToken::new();
    let task = {
        let fetcher = fetcher.clone();
        let cancel = cancel.clone();
        let request = RequestDescriptor::get(server.url("/backoff"));
        let policy = fetcher.options().retry.clone();
        tokio::spawn(async move {
            fetcher
                .fetch_cancellable(&request, &policy, &cancel)
                .await
        })
    };

    server.wait_for_hits(1).await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(fetcher.gate().in_flight(), 1);

    let started = Instant::now();
    cancel.cancel();
    let result = task.await.expect("task must finish");

    assert!(matches!(result, Err(FetchError::Cancelled)));
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(fetcher.gate().in_flight(), 0);
    assert_eq!(server.hits(), 1);
}

#[tokio::test]
async fn concurrency_cap_holds_under_parallel_load() {
    let delayed = MockResponse::json(StatusCode::OK, json!({})).with_delay(Duration::from_millis(40));
    let server = spawn_server_with_fallback(vec![], delayed).await;
    let fetcher = Fetcher::new(FetcherOptions::default().with_max_concurrency(2))
        .expect("must build fetcher");

    let mut tasks = Vec::new();
    for index in 0..10 {
        let fetcher = fetcher.clone();
        let request = RequestDescriptor::get(server.url(&format!("/item/{index}")));
        tasks.push(tokio::spawn(async move { fetcher.fetch(&request).await }));
    }
    for task in tasks {
        task.await.expect("task must finish").expect("fetch must succeed");
    }

    assert_eq!(server.hits(), 10);
    assert!(server.max_active.load(Ordering::SeqCst) <= 2);
    assert!(fetcher.gate().peak() <= 2);
    assert_eq!(fetcher.gate().in_flight(), 0);
}

#[tokio::test]
async fn decode_falls_back_and_memoizes() {
    let server = spawn_server(vec![MockResponse::json(
        StatusCode::OK,
        json!({"status": "200", "content": {"pfid": 35, "vip": 1}, "message": "success"}),
    )])
    .await;
    let fetcher = fetcher(RetryPolicy::no_retry());

    let response = fetcher
        .fetch(&RequestDescriptor::get(server.url("/user/money")))
        .await
        .expect("fetch must succeed");
    assert_eq!(fetcher.decoder().stats().parses(), 0);

    let money = response.decode::<UserMoney>().expect("fallback must decode");
    assert_eq!(money.status, 200);
    assert_eq!(money.content.pfid, "35");
    assert!(money.content.vip);

    let again = response.decode::<UserMoney>().expect("cached");
    assert!(Arc::ptr_eq(&money, &again));

    let stats = fetcher.decoder().stats();
    assert_eq!(stats.fast_parses(), 1);
    assert_eq!(stats.fallback_parses(), 1);
    assert_eq!(stats.cache_hits(), 1);
}

#[tokio::test]
async fn decode_failure_is_not_retried() {
    let server = spawn_server(vec![MockResponse::raw(
        StatusCode::OK,
        "<html>maintenance</html>",
        "text/html",
    )])
    .await;
    let fetcher = fetcher(fast_retry(3));

    let err = fetcher
        .get_json::<UserMoney>(&server.url("/user/money"))
        .await
        .expect_err("html is not json");

    match err {
        FetchError::Decode(failure) => {
            assert_eq!(failure.stage, newboy_fetch::DecodeStage::Fallback)
        }
        other => panic!("expected decode failure, got {other:?}"),
    }
    assert_eq!(server.hits(), 1);
}

#[tokio::test]
async fn default_and_request_headers_reach_server_in_order() {
    let server = spawn_server(vec![MockResponse::json(StatusCode::OK, json!({}))]).await;
    let fetcher = Fetcher::new(
        FetcherOptions::default()
            .with_user_agent("PocketFans201807/7.1.34")
            .with_default_header("Referer", "https://pocketapi.48.cn/"),
    )
    .expect("must build fetcher");

    let request = RequestDescriptor::post_json(server.url("/im/room"), &json!({"channelId": 1}))
        .expect("must build request")
        .with_header("X-Trace", "a")
        .with_header("X-Trace", "b");
    fetcher.fetch(&request).await.expect("fetch must succeed");

    let recorded = server.recorded();
    assert_eq!(recorded.len(), 1);
    let seen = &recorded[0];
    assert_eq!(seen.method, Method::POST);
    assert_eq!(seen.path, "/im/room");
    assert_eq!(seen.body, br#"{"channelId":1}"#.to_vec());

    let value_of = |name: &str| -> Vec<&str> {
        seen.headers
            .iter()
            .filter(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
            .collect()
    };
    assert_eq!(value_of("user-agent"), vec!["PocketFans201807/7.1.34"]);
    assert_eq!(value_of("referer"), vec!["https://pocketapi.48.cn/"]);
    assert_eq!(value_of("x-trace"), vec!["a", "b"]);
}

#[tokio::test]
async fn probe_reports_availability() {
    let server = spawn_server(vec![
        MockResponse::raw(StatusCode::OK, "", "video/mp4"),
        MockResponse::status(StatusCode::FORBIDDEN),
    ])
    .await;
    let fetcher = fetcher(RetryPolicy::no_retry());

    let ok = fetcher.probe(&server.url("/media/1.mp4")).await;
    assert!(ok.available);
    assert_eq!(ok.status, Some(200));
    assert_eq!(ok.content_type.as_deref(), Some("video/mp4"));
    assert!(ok.error.is_none());

    let denied = fetcher.probe(&server.url("/media/2.mp4")).await;
    assert!(!denied.available);
    assert_eq!(denied.status, Some(403));
    assert!(denied.error.is_some());

    assert!(server.recorded().iter().all(|r| r.method == Method::HEAD));
}

#[tokio::test]
async fn service_fetches_only_while_enabled() {
    let server = spawn_server(vec![MockResponse::json(StatusCode::OK, json!({"ok": true}))]).await;
    let mut service = FetchService::new(FetcherOptions::default());
    assert!(matches!(
        service.spawn_fetch(RequestDescriptor::get(server.url("/early"))),
        Err(FetchError::Disabled)
    ));

    service.on_enable().expect("must enable");
    let response = service
        .spawn_fetch(RequestDescriptor::get(server.url("/live")))
        .expect("enabled")
        .await
        .expect("task must finish")
        .expect("fetch must succeed");
    assert_eq!(response.decode::<JsonValue>().expect("json")["ok"], true);

    let fetcher = service.fetcher().expect("enabled");
    service.on_disable();

    assert!(matches!(
        service.spawn_fetch(RequestDescriptor::get(server.url("/late"))),
        Err(FetchError::Disabled)
    ));
    assert!(matches!(
        fetcher.fetch(&RequestDescriptor::get(server.url("/late"))).await,
        Err(FetchError::Disabled)
    ));
    assert_eq!(server.hits(), 1);
}

#[cfg(feature = "resource-cache")]
#[tokio::test]
async fn resource_cache_downloads_once() {
    use newboy_fetch::cache::ResourceCache;

    let server = spawn_server(vec![MockResponse::raw(StatusCode::OK, "JPEGDATA", "image/jpeg")]).await;
    let fetcher = fetcher(RetryPolicy::no_retry());
    let dir = tempfile::tempdir().expect("tempdir");
    let cache = ResourceCache::new(dir.path().join("pocket48"));
    let url = server.url("/mediasource/avatar.jpg");

    let first = cache.fetch_to_cache(&fetcher, &url, "jpg").await.expect("download");
    let second = cache.fetch_to_cache(&fetcher, &url, ".jpg").await.expect("cached");

    assert_eq!(first, second);
    assert_eq!(first.extension().and_then(|e| e.to_str()), Some("jpg"));
    assert_eq!(std::fs::read(&first).expect("readable"), b"JPEGDATA");
    assert_eq!(server.hits(), 1);

    assert!(cache.remove(&url).await.expect("remove"));
    assert_eq!(cache.cached_path(&url).await.expect("lookup"), None);
}

#[cfg(feature = "resource-cache")]
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn resource_cache_tolerates_concurrent_downloads_of_one_url() {
    use newboy_fetch::cache::ResourceCache;

    let server = spawn_server_with_fallback(
        Vec::new(),
        MockResponse::raw(StatusCode::OK, "MP4DATA", "video/mp4")
            .with_delay(Duration::from_millis(20)),
    )
    .await;
    let fetcher = fetcher(RetryPolicy::no_retry());
    let dir = tempfile::tempdir().expect("tempdir");
    let cache = ResourceCache::new(dir.path().join("live"));
    let url = server.url("/mediasource/live/1.mp4");

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let fetcher = fetcher.clone();
        let cache = cache.clone();
        let url = url.clone();
        tasks.push(tokio::spawn(async move {
            cache.fetch_to_cache(&fetcher, &url, "mp4").await
        }));
    }

    let mut paths = Vec::new();
    for task in tasks {
        paths.push(task.await.expect("task must finish").expect("download must succeed"));
    }

    assert!(paths.windows(2).all(|pair| pair[0] == pair[1]));
    assert_eq!(std::fs::read(&paths[0]).expect("readable"), b"MP4DATA");

    let leftovers = std::fs::read_dir(cache.dir())
        .expect("cache dir")
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_name().to_string_lossy().ends_with(".part"))
        .count();
    assert_eq!(leftovers, 0);
}
