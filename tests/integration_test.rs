//! Integration tests for the live/cache serving decision

use std::io::Write;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;

use flate2::write::GzEncoder;
use flate2::Compression;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::{Bytes, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use apicache::network::NetworkHandler;
use apicache::report::{ChannelReporter, Settlement, Source, CACHE_DATE_HEADER};
use apicache::storage::{EnvelopeBuilder, Lookup};
use apicache::{ApiCache, ApiCacheError, Config};

type Handler = Arc<dyn Fn(&str, &str, Bytes) -> Response<Full<Bytes>> + Send + Sync>;

/// Start an upstream answering every request with `handler`
async fn spawn_upstream(handler: Handler) -> (String, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let task = tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let handler = Arc::clone(&handler);
            tokio::spawn(async move {
                let service = service_fn(move |request: Request<Incoming>| {
                    let handler = Arc::clone(&handler);
                    async move {
                        let method = request.method().to_string();
                        let target = request.uri().to_string();
                        let body = request.into_body().collect().await?.to_bytes();
                        Ok::<_, hyper::Error>(handler(&method, &target, body))
                    }
                });
                http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await
                    .ok();
            });
        }
    });

    (format!("http://{addr}"), task)
}

/// Upstream replying with a fixed status and plain body
fn status_upstream(status: Arc<AtomicU16>, body: &'static str) -> Handler {
    Arc::new(move |_: &str, _: &str, _: Bytes| {
        let mut response = Response::new(Full::new(Bytes::from(body)));
        *response.status_mut() = StatusCode::from_u16(status.load(Ordering::SeqCst)).unwrap();
        response
    })
}

fn refused_url() -> String {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    format!("http://127.0.0.1:{port}")
}

fn gzip(data: &[u8]) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).unwrap();
    encoder.finish().unwrap()
}

fn get(path: &str) -> Request<Empty<Bytes>> {
    Request::get(path).body(Empty::new()).unwrap()
}

async fn body_text(response: Response<Full<Bytes>>) -> String {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    String::from_utf8(bytes.to_vec()).unwrap()
}

#[tokio::test]
async fn test_gzip_response_is_decoded_and_persisted() {
    let temp_dir = TempDir::new().unwrap();
    let (upstream, _task) = spawn_upstream(Arc::new(|_: &str, _: &str, _: Bytes| {
        Response::builder()
            .header("content-encoding", "gzip")
            .header("content-type", "text/plain")
            .body(Full::new(Bytes::from(gzip(b"hello"))))
            .unwrap()
    }))
    .await;
    let proxy = ApiCache::new(Config::new(upstream, temp_dir.path())).unwrap();

    let settlement = proxy.handle(get("/v1/greeting")).await;
    let Settlement::Served(served) = &settlement else {
        panic!("expected a reply, got {settlement:?}");
    };

    assert_eq!(served.source, Source::Api);
    assert_eq!(served.envelope.response_body, "hello");
    assert!(served.envelope.response_header("content-encoding").is_none());
    assert!(served.envelope.response_header("content-length").is_none());
    assert!(served.persist_error.is_none());

    let cache_file = served.cache_file.clone().unwrap();
    assert!(cache_file.exists());
    let key = served.envelope.cache_key();
    assert!(matches!(
        proxy.store().get(&key).await.unwrap(),
        Lookup::Hit { .. }
    ));

    let response = settlement.to_response();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().get(CACHE_DATE_HEADER).is_none());
    assert_eq!(body_text(response).await, "hello");
}

#[tokio::test]
async fn test_rejected_response_served_from_cache() {
    let temp_dir = TempDir::new().unwrap();
    let status = Arc::new(AtomicU16::new(200));
    let (upstream, _task) = spawn_upstream(status_upstream(Arc::clone(&status), "payload")).await;
    let (reporter, mut reports) = ChannelReporter::new();
    let proxy = ApiCache::new(Config::new(upstream, temp_dir.path()))
        .unwrap()
        .with_reporter(Arc::new(reporter));

    let first = proxy.handle(get("/v1/items?page=1")).await;
    assert_eq!(first.source(), Some(Source::Api));

    status.store(500, Ordering::SeqCst);
    let second = proxy.handle(get("/v1/items?page=1")).await;
    assert_eq!(second.source(), Some(Source::Cache));

    let response = second.to_response();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().get(CACHE_DATE_HEADER).is_some());
    assert_eq!(body_text(response).await, "payload");

    assert_eq!(reports.recv().await.unwrap().source, Some(Source::Api));
    assert_eq!(reports.recv().await.unwrap().source, Some(Source::Cache));
    assert!(reports.try_recv().is_err());
}

#[tokio::test]
async fn test_rejected_response_without_cache_is_passed_through() {
    let temp_dir = TempDir::new().unwrap();
    let status = Arc::new(AtomicU16::new(503));
    let (upstream, _task) = spawn_upstream(status_upstream(status, "busy")).await;
    let proxy = ApiCache::new(Config::new(upstream, temp_dir.path())).unwrap();

    let settlement = proxy.handle(get("/v1/items")).await;
    assert_eq!(settlement.source(), Some(Source::Uncached));

    let response = settlement.to_response();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body_text(response).await, "busy");
    assert_eq!(std::fs::read_dir(temp_dir.path()).unwrap().count(), 0);
}

#[tokio::test]
async fn test_connection_refused_served_from_cache() {
    let temp_dir = TempDir::new().unwrap();
    let status = Arc::new(AtomicU16::new(200));
    let (upstream, task) = spawn_upstream(status_upstream(status, "recorded")).await;
    let config = Config::new(upstream, temp_dir.path());

    let recorder = ApiCache::new(config.clone()).unwrap();
    assert_eq!(
        recorder.handle(get("/v1/items")).await.source(),
        Some(Source::Api)
    );

    task.abort();
    task.await.ok();

    // Fresh proxy so no pooled connection survives
    let proxy = ApiCache::new(config).unwrap();
    let settlement = proxy.handle(get("/v1/items")).await;
    assert_eq!(settlement.source(), Some(Source::CacheAfterError));

    let response = settlement.to_response();
    assert!(response.headers().get(CACHE_DATE_HEADER).is_some());
    assert_eq!(body_text(response).await, "recorded");
}

#[tokio::test]
async fn test_connection_refused_without_cache_fails() {
    let temp_dir = TempDir::new().unwrap();
    let (reporter, mut reports) = ChannelReporter::new();
    let proxy = ApiCache::new(Config::new(refused_url(), temp_dir.path()))
        .unwrap()
        .with_reporter(Arc::new(reporter));

    let settlement = proxy.handle(get("/v1/items")).await;
    let Settlement::Failed(failure) = &settlement else {
        panic!("expected a failure, got {settlement:?}");
    };
    assert!(matches!(
        failure.error,
        ApiCacheError::UpstreamConnection { .. }
    ));

    let report = reports.recv().await.unwrap();
    assert_eq!(report.source, None);
    assert!(report.error.is_some());
}

#[tokio::test]
async fn test_stale_entry_is_ignored() {
    let temp_dir = TempDir::new().unwrap();
    let status = Arc::new(AtomicU16::new(500));
    let (upstream, _task) = spawn_upstream(status_upstream(status, "broken")).await;
    let proxy = ApiCache::new(Config::new(upstream, temp_dir.path())).unwrap();

    let url = proxy.translate_url("/v1/items");
    let mut old = EnvelopeBuilder::default().build(
        "GET",
        &url,
        Vec::new(),
        b"",
        200,
        "OK",
        &[],
        "old format".to_string(),
    );
    old.schema_version = "0.0.1-old".to_string();
    let key = old.cache_key();
    proxy.store().put(&key, &old).await.unwrap();

    assert!(matches!(
        proxy.store().get(&key).await.unwrap(),
        Lookup::Stale { .. }
    ));

    let settlement = proxy.handle(get("/v1/items")).await;
    assert_eq!(settlement.source(), Some(Source::Uncached));
    assert_eq!(body_text(settlement.to_response()).await, "broken");
}

#[tokio::test]
async fn test_timeout_is_distinct_from_refusal() {
    let temp_dir = TempDir::new().unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let _silent = tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _)) = listener.accept().await {
            held.push(stream);
        }
    });

    let config = Config::new(format!("http://{addr}"), temp_dir.path())
        .with_timeout(Duration::from_millis(100));
    let proxy = ApiCache::new(config).unwrap();

    let settlement = tokio::time::timeout(Duration::from_secs(5), proxy.handle(get("/slow")))
        .await
        .unwrap();
    let Settlement::Failed(failure) = settlement else {
        panic!("expected a failure");
    };
    assert!(matches!(
        failure.error,
        ApiCacheError::UpstreamTimeout { .. }
    ));
    assert_eq!(
        failure.to_response().status(),
        StatusCode::GATEWAY_TIMEOUT
    );
}

#[tokio::test]
async fn test_post_body_forwarded_and_keyed() {
    let temp_dir = TempDir::new().unwrap();
    let (upstream, _task) = spawn_upstream(Arc::new(|method: &str, _: &str, body: Bytes| {
        assert_eq!(method, "POST");
        Response::new(Full::new(body))
    }))
    .await;
    let proxy = ApiCache::new(Config::new(upstream, temp_dir.path())).unwrap();

    let request = Request::post("/v1/echo")
        .header("content-type", "application/json")
        .body(Full::new(Bytes::from("{\"q\":\"cat\"}")))
        .unwrap();
    let settlement = proxy.handle(request).await;
    let Settlement::Served(served) = settlement else {
        panic!("expected a reply");
    };

    assert_eq!(served.envelope.request_body, "{\"q\":\"cat\"}");
    assert_eq!(served.envelope.response_body, "{\"q\":\"cat\"}");
    assert_eq!(
        served.envelope.cache_key(),
        proxy.cache_key_for("POST", &proxy.translate_url("/v1/echo"), b"{\"q\":\"cat\"}")
    );
    assert!(served
        .envelope
        .request_headers
        .iter()
        .any(|(name, value)| name == "content-type" && value == "application/json"));
}

#[tokio::test]
async fn test_excluded_params_share_one_entry() {
    let temp_dir = TempDir::new().unwrap();
    let status = Arc::new(AtomicU16::new(200));
    let (upstream, _task) = spawn_upstream(status_upstream(Arc::clone(&status), "gifs")).await;
    let config = Config::new(upstream.clone(), temp_dir.path()).with_excluded_params(["api_key"]);
    let proxy = ApiCache::new(config).unwrap();

    let first = proxy
        .handle(get("/v1/gifs/search?q=cat&api_key=one&limit=5"))
        .await;
    let Settlement::Served(served) = &first else {
        panic!("expected a reply");
    };
    assert_eq!(
        served.envelope.request_url,
        format!("{upstream}/v1/gifs/search?q=cat&limit=5")
    );

    status.store(429, Ordering::SeqCst);
    let second = proxy
        .handle(get("/v1/gifs/search?q=cat&api_key=two&limit=5"))
        .await;
    assert_eq!(second.source(), Some(Source::Cache));
}

#[tokio::test]
async fn test_decode_error_does_not_fall_back() {
    let temp_dir = TempDir::new().unwrap();
    let corrupt = Arc::new(AtomicU16::new(0));
    let flag = Arc::clone(&corrupt);
    let (upstream, _task) = spawn_upstream(Arc::new(move |_: &str, _: &str, _: Bytes| {
        if flag.load(Ordering::SeqCst) == 0 {
            Response::new(Full::new(Bytes::from("fine")))
        } else {
            Response::builder()
                .header("content-encoding", "gzip")
                .body(Full::new(Bytes::from("not gzip at all")))
                .unwrap()
        }
    }))
    .await;
    let proxy = ApiCache::new(Config::new(upstream, temp_dir.path())).unwrap();

    assert_eq!(
        proxy.handle(get("/v1/data")).await.source(),
        Some(Source::Api)
    );

    corrupt.store(1, Ordering::SeqCst);
    let settlement = proxy.handle(get("/v1/data")).await;
    let Settlement::Failed(failure) = settlement else {
        panic!("expected a decode failure");
    };
    assert!(matches!(failure.error, ApiCacheError::Decode(_)));
}

#[tokio::test]
async fn test_custom_validity_predicate() {
    let temp_dir = TempDir::new().unwrap();
    let status = Arc::new(AtomicU16::new(404));
    let (upstream, _task) = spawn_upstream(status_upstream(status, "missing")).await;
    let proxy = ApiCache::new(Config::new(upstream, temp_dir.path()))
        .unwrap()
        .with_validity_predicate(|envelope| envelope.status_code < 500);

    let settlement = proxy.handle(get("/v1/unknown")).await;
    let Settlement::Served(served) = settlement else {
        panic!("expected a reply");
    };
    assert_eq!(served.source, Source::Api);
    assert!(served.cache_file.unwrap().exists());
}

#[tokio::test]
async fn test_server_end_to_end() {
    let temp_dir = TempDir::new().unwrap();
    let (upstream, _task) = spawn_upstream(Arc::new(|_: &str, target: &str, _: Bytes| {
        Response::new(Full::new(Bytes::from(format!("upstream saw {target}"))))
    }))
    .await;
    let config = Config::new(upstream, temp_dir.path()).with_mount_prefix("/api");
    let handler = NetworkHandler::new(ApiCache::new(config).unwrap());
    let shutdown = handler.shutdown_handle();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = tokio::spawn(handler.serve(listener));

    let client = Client::builder(TokioExecutor::new()).build_http::<Empty<Bytes>>();
    let uri = format!("http://{addr}/api/v1/items?page=2").parse().unwrap();
    let response = client.get(uri).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(body, Bytes::from("upstream saw /v1/items?page=2"));

    shutdown.send(()).ok();
    tokio::time::timeout(Duration::from_secs(10), server)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_excluded_request_header_never_persisted() {
    let temp_dir = TempDir::new().unwrap();
    let status = Arc::new(AtomicU16::new(200));
    let (upstream, _task) = spawn_upstream(status_upstream(status, "private")).await;
    let config =
        Config::new(upstream, temp_dir.path()).with_excluded_headers(["authorization"]);
    let proxy = ApiCache::new(config).unwrap();

    let request = Request::get("/v1/me")
        .header("authorization", "Bearer top-secret-token")
        .header("accept", "application/json")
        .body(Empty::<Bytes>::new())
        .unwrap();
    let settlement = proxy.handle(request).await;
    let Settlement::Served(served) = settlement else {
        panic!("expected a reply");
    };

    assert!(served
        .envelope
        .request_headers
        .iter()
        .all(|(name, _)| !name.eq_ignore_ascii_case("authorization")));
    assert!(served
        .envelope
        .request_headers
        .iter()
        .any(|(name, _)| name == "accept"));

    let stored = std::fs::read_to_string(served.cache_file.unwrap()).unwrap();
    assert!(!stored.contains("top-secret-token"));
}

#[tokio::test]
async fn test_upstream_reason_phrase_is_kept() {
    let temp_dir = TempDir::new().unwrap();
    let (upstream, _task) = spawn_upstream(Arc::new(|_: &str, _: &str, _: Bytes| {
        let mut response = Response::new(Full::new(Bytes::from("fresh")));
        response
            .extensions_mut()
            .insert(hyper::ext::ReasonPhrase::from_static(b"Fresh From Origin"));
        response
    }))
    .await;
    let proxy = ApiCache::new(Config::new(upstream, temp_dir.path())).unwrap();

    let settlement = proxy.handle(get("/v1/fresh")).await;
    let Settlement::Served(served) = settlement else {
        panic!("expected a reply");
    };

    assert_eq!(served.source, Source::Api);
    assert_eq!(served.envelope.status_message, "Fresh From Origin");
}
