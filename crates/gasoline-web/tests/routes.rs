use std::time::Duration;

use axum::Router;
use axum::body::{Body, to_bytes};
use axum::http::{Method, Request, StatusCode, header};
use gasoline_types::{CommandStatus, PendingQuery, UpgradeMarker};
use gasoline_web::app::{AppState, build_router};
use gasoline_web::config::Config;
use serde_json::{Value as JsonValue, json};
use tower::ServiceExt;

fn app(dir: &std::path::Path) -> (AppState, Router) {
    let state = AppState::new(Config::for_tests(dir));
    let router = build_router(state.clone());
    (state, router)
}

async fn send(router: &Router, req: Request<Body>) -> (StatusCode, JsonValue) {
    let resp = router.clone().oneshot(req).await.expect("response");
    let status = resp.status();
    let bytes = to_bytes(resp.into_body(), usize::MAX).await.expect("body");
    let body = if bytes.is_empty() {
        JsonValue::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or_else(|_| json!(String::from_utf8_lossy(&bytes)))
    };
    (status, body)
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn post(uri: &str, body: JsonValue) -> Request<Body> {
    Request::builder()
        .method(Method::POST)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

#[tokio::test]
async fn health_reports_version_and_upgrade() {
    let dir = tempfile::tempdir().unwrap();
    let (state, router) = app(dir.path());
    state.inner.lock().upgrade = Some(UpgradeMarker {
        from_version: "0.0.1".into(),
        to_version: "0.0.2".into(),
        timestamp: "2026-01-01T00:00:00Z".into(),
    });
    let (status, body) = send(&router, get("/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
    assert_eq!(body["extension"]["status"], "never_connected");
    assert_eq!(body["upgrade"]["to_version"], "0.0.2");
    assert_eq!(body["circuit"]["open"], false);
}

#[tokio::test]
async fn api_key_gates_everything_but_preflight() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = Config::for_tests(dir.path());
    config.api_key = Some("sekrit".into());
    let router = build_router(AppState::new(config));

    let (status, _) = send(&router, get("/health")).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let req = Request::builder()
        .uri("/health")
        .header("X-Gasoline-Key", "sekrit")
        .body(Body::empty())
        .unwrap();
    let (status, _) = send(&router, req).await;
    assert_eq!(status, StatusCode::OK);

    let preflight = Request::builder()
        .method(Method::OPTIONS)
        .uri("/logs")
        .header(header::ORIGIN, "chrome-extension://abc")
        .header(header::ACCESS_CONTROL_REQUEST_METHOD, "POST")
        .body(Body::empty())
        .unwrap();
    let resp = router.clone().oneshot(preflight).await.unwrap();
    assert!(resp.status().is_success());
    assert!(resp.headers().contains_key(header::ACCESS_CONTROL_ALLOW_ORIGIN));
}

#[tokio::test]
async fn logs_post_list_and_clear() {
    let dir = tempfile::tempdir().unwrap();
    let (_, router) = app(dir.path());
    let (status, body) = send(
        &router,
        post(
            "/logs",
            json!({"entries": [
                {"level": "error", "message": "boom", "ts": "2026-01-01T00:00:00Z"},
                {"level": "info", "message": "hello"},
                "not an entry",
            ]}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["received"], 2);
    assert_eq!(body["rejected"], 1);
    assert_eq!(body["entries"], 2);

    let (_, body) = send(&router, get("/logs?limit=1")).await;
    assert_eq!(body["count"], 1);
    assert_eq!(body["total"], 2);
    assert_eq!(body["entries"][0]["message"], "hello");

    let req = Request::builder()
        .method(Method::DELETE)
        .uri("/logs")
        .body(Body::empty())
        .unwrap();
    let (status, body) = send(&router, req).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["cleared"].as_array().is_some_and(|c| c.contains(&json!("console"))));
    let (_, body) = send(&router, get("/logs")).await;
    assert_eq!(body["total"], 0);
}

#[tokio::test]
async fn malformed_json_is_a_400() {
    let dir = tempfile::tempdir().unwrap();
    let (_, router) = app(dir.path());
    let req = Request::builder()
        .method(Method::POST)
        .uri("/network-bodies")
        .body(Body::from("{oops"))
        .unwrap();
    let (status, body) = send(&router, req).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().is_some_and(|e| e.contains("invalid request json")));
}

#[tokio::test]
async fn extension_status_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let (_, router) = app(dir.path());
    let (status, _) = send(
        &router,
        post(
            "/extension-status",
            json!({"trackingEnabled": true, "trackedTabId": 42, "trackedTabUrl": "http://localhost:3000/"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let (_, body) = send(&router, get("/extension-status")).await;
    assert_eq!(body["tracking_enabled"], true);
    assert_eq!(body["tracked_tab_id"], 42);
    assert_eq!(body["extension_connected"], true);
}

#[tokio::test]
async fn legacy_query_result_reaches_waiter() {
    let dir = tempfile::tempdir().unwrap();
    let (state, router) = app(dir.path());
    let correlator = state.store.correlator();
    let id = correlator
        .create_pending_query(
            PendingQuery::new("dom", json!({"selector": "h1"})),
            Duration::from_secs(5),
            None,
        )
        .unwrap();

    let (_, body) = send(&router, get("/pending-queries")).await;
    assert_eq!(body["queries"][0]["id"], json!(id));
    assert_eq!(body["queries"][0]["type"], "dom");

    let (_, body) = send(
        &router,
        post("/dom-result", json!({"id": id, "result": {"matches": 1}})),
    )
    .await;
    assert_eq!(body["matched"], true);
    let got = correlator.wait_for_result(&id, Duration::from_millis(100)).await;
    assert_eq!(got, Some(json!({"matches": 1})));
    assert_eq!(state.store.connectivity().status, "connected");
}

#[tokio::test]
async fn async_command_result_is_terminal_once() {
    let dir = tempfile::tempdir().unwrap();
    let (state, router) = app(dir.path());
    let correlator = state.store.correlator();
    correlator
        .create_pending_query(
            PendingQuery::new("browser_action", json!({"action": "refresh"}))
                .with_correlation("refresh_1"),
            Duration::from_secs(5),
            None,
        )
        .unwrap();

    let (_, body) = send(
        &router,
        post(
            "/query-result",
            json!({"correlation_id": "refresh_1", "status": "complete", "result": {"ok": true}}),
        ),
    )
    .await;
    assert_eq!(body["matched"], true);
    send(
        &router,
        post(
            "/query-result",
            json!({"correlation_id": "refresh_1", "status": "error", "error": "late"}),
        ),
    )
    .await;
    let cmd = correlator.command_for("refresh_1", None).unwrap();
    assert_eq!(cmd.status, CommandStatus::Complete);
    assert_eq!(cmd.result, Some(json!({"ok": true})));
    assert_eq!(correlator.queue_depth(), 0);

    let (status, _) = send(&router, post("/query-result", json!({"result": 1}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn screenshots_are_saved_and_rate_limited() {
    let dir = tempfile::tempdir().unwrap();
    let (_, router) = app(dir.path());
    let upload = || {
        Request::builder()
            .method(Method::POST)
            .uri("/screenshots")
            .header("X-Gasoline-Client", "client-a")
            .body(Body::from(
                json!({
                    "dataUrl": "data:image/jpeg;base64,/9j/4AAQ",
                    "url": "https://example.com/page",
                    "errorType": "TypeError",
                    "errorId": "err 1",
                })
                .to_string(),
            ))
            .unwrap()
    };
    let (status, body) = send(&router, upload()).await;
    assert_eq!(status, StatusCode::OK);
    let filename = body["filename"].as_str().unwrap();
    assert!(filename.starts_with("example.com-"), "{filename}");
    assert!(filename.ends_with("-TypeError-err_1.jpg"), "{filename}");
    let path = body["path"].as_str().unwrap();
    assert_eq!(std::fs::read(path).unwrap(), vec![0xff, 0xd8, 0xff, 0xe0, 0x00, 0x10]);

    let (status, _) = send(&router, upload()).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
}

#[tokio::test]
async fn screenshot_result_resolves_query() {
    let dir = tempfile::tempdir().unwrap();
    let (state, router) = app(dir.path());
    let correlator = state.store.correlator();
    let id = correlator
        .create_pending_query(
            PendingQuery::new("screenshot", json!({})),
            Duration::from_secs(5),
            None,
        )
        .unwrap();
    let (status, body) = send(
        &router,
        post(
            "/screenshot-result",
            json!({"data_url": "data:image/jpeg;base64,aGk=", "query_id": id, "url": "http://localhost:3000/"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let got = correlator
        .wait_for_result(&id, Duration::from_millis(100))
        .await
        .unwrap();
    assert_eq!(got["path"], body["path"]);
    assert!(got["filename"].as_str().unwrap().starts_with("localhost_3000-"));
}

#[tokio::test]
async fn mcp_over_http() {
    let dir = tempfile::tempdir().unwrap();
    let (_, router) = app(dir.path());
    let (status, body) = send(
        &router,
        post("/mcp", json!({"jsonrpc": "2.0", "id": 1, "method": "tools/list"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["result"]["tools"].as_array().map(Vec::len), Some(5));

    let (status, _) = send(
        &router,
        post("/mcp", json!({"jsonrpc": "2.0", "method": "notifications/initialized"})),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);

    let (status, body) = send(
        &router,
        post(
            "/mcp",
            json!({"jsonrpc": "2.0", "id": 2, "method": "tools/call",
                   "params": {"name": "configure", "arguments": {"action": "health"}}}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["result"].get("isError").is_none());
    assert!(body["result"]["content"][0]["text"].is_string());
}

#[tokio::test]
async fn index_negotiates_html_and_json() {
    let dir = tempfile::tempdir().unwrap();
    let (_, router) = app(dir.path());
    let (_, body) = send(&router, get("/")).await;
    assert_eq!(body["name"], "gasoline");
    assert_eq!(body["mcp"]["endpoint"], "/mcp");

    let req = Request::builder()
        .uri("/")
        .header(header::ACCEPT, "text/html,application/xhtml+xml")
        .body(Body::empty())
        .unwrap();
    let resp = router.clone().oneshot(req).await.unwrap();
    let content_type = resp.headers()[header::CONTENT_TYPE].to_str().unwrap().to_string();
    assert!(content_type.starts_with("text/html"));
}

#[tokio::test]
async fn ci_result_queues_an_alert() {
    let dir = tempfile::tempdir().unwrap();
    let (state, router) = app(dir.path());
    let (status, _) = send(
        &router,
        post(
            "/ci-result",
            json!({"status": "failure", "source": "github-actions", "commit": "abc123",
                   "failures": [{"name": "login test", "message": "timeout"}]}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(state.store.ci_results().len(), 1);
    let alerts = state.store.drain_alerts();
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].category, "ci");
}
