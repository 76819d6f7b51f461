use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::Router;
use axum::body::Body;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::{HeaderName, Method, Request, StatusCode};
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{get, post};
use gasoline_capture::{CaptureStore, StoreConfig};
use gasoline_capture::time::now_rfc3339;
use gasoline_types::UpgradeMarker;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value as JsonValue;
use tower_http::cors::{Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;

use crate::api::health::{api_diagnostics, api_health, api_index};
use crate::api::ingest::{
    api_ci_result, api_clear_logs, api_extension_logs, api_extension_status,
    api_get_extension_logs, api_get_extension_status, api_get_logs, api_logs,
    api_network_bodies, api_network_waterfall, api_performance_snapshot, api_enhanced_actions,
    api_websocket_events,
};
use crate::api::mcp::api_mcp;
use crate::api::queries::{api_pending_queries, api_query_result};
use crate::api::screenshots::{api_screenshot_result, api_screenshots};
use crate::config::Config;
use crate::lifecycle::Shutdown;
use crate::mcp::evidence::{EvidenceCapturer, EvidenceTracker, ScreenshotCapturer};
use crate::util::http::json_error;

pub const API_KEY_HEADER: &str = "x-gasoline-key";
pub const CLIENT_HEADER: &str = "x-gasoline-client";

const INGEST_BODY_LIMIT: usize = 10 * 1024 * 1024;
const SCREENSHOT_BODY_LIMIT: usize = 16 * 1024 * 1024;

/// Tool calls admitted per rolling minute, across all clients.
pub const TOOL_CALLS_PER_MINUTE: usize = 500;
const TOOL_RATE_WINDOW: Duration = Duration::from_secs(60);
const SCREENSHOT_MIN_INTERVAL: Duration = Duration::from_secs(1);
const SCREENSHOT_CLIENT_TTL: Duration = Duration::from_secs(60);

#[derive(Clone)]
pub struct AppState {
    pub inner: Arc<Mutex<ServerState>>,
    pub store: Arc<CaptureStore>,
    pub config: Arc<Config>,
    pub shutdown: Shutdown,
    pub evidence: Arc<EvidenceTracker>,
    pub capturer: Arc<dyn EvidenceCapturer>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SecurityMode {
    #[default]
    Normal,
    InsecureProxy,
}

impl SecurityMode {
    pub fn as_str(self) -> &'static str {
        match self {
            SecurityMode::Normal => "normal",
            SecurityMode::InsecureProxy => "insecure_proxy",
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ToolStats {
    pub calls: u64,
    pub errors: u64,
    pub last_called: Option<String>,
}

pub struct ServerState {
    pub security_mode: SecurityMode,
    pub tool_stats: BTreeMap<String, ToolStats>,
    pub tool_calls: VecDeque<Instant>,
    pub screenshot_last: HashMap<String, Instant>,
    /// Marker consumed at startup, surfaced in `/health`.
    pub upgrade: Option<UpgradeMarker>,
    /// Session key/value store behind `configure store`.
    pub kv: BTreeMap<String, JsonValue>,
}

impl ServerState {
    pub fn new() -> Self {
        Self {
            security_mode: SecurityMode::Normal,
            tool_stats: BTreeMap::new(),
            tool_calls: VecDeque::new(),
            screenshot_last: HashMap::new(),
            upgrade: None,
            kv: BTreeMap::new(),
        }
    }

    /// Sliding one-minute window. Returns false once the window is full.
    pub fn admit_tool_call(&mut self, now: Instant) -> bool {
        while self
            .tool_calls
            .front()
            .is_some_and(|t| now.duration_since(*t) >= TOOL_RATE_WINDOW)
        {
            self.tool_calls.pop_front();
        }
        if self.tool_calls.len() >= TOOL_CALLS_PER_MINUTE {
            return false;
        }
        self.tool_calls.push_back(now);
        true
    }

    pub fn record_tool_call(&mut self, tool: &str, is_error: bool) {
        let stats = self.tool_stats.entry(tool.to_string()).or_default();
        stats.calls += 1;
        if is_error {
            stats.errors += 1;
        }
        stats.last_called = Some(now_rfc3339());
    }

    /// One screenshot per second per client.
    pub fn admit_screenshot(&mut self, client: &str, now: Instant) -> bool {
        if let Some(last) = self.screenshot_last.get(client) {
            if now.duration_since(*last) < SCREENSHOT_MIN_INTERVAL {
                return false;
            }
        }
        self.screenshot_last.insert(client.to_string(), now);
        true
    }

    pub fn prune(&mut self, now: Instant) {
        self.screenshot_last
            .retain(|_, last| now.duration_since(*last) < SCREENSHOT_CLIENT_TTL);
        while self
            .tool_calls
            .front()
            .is_some_and(|t| now.duration_since(*t) >= TOOL_RATE_WINDOW)
        {
            self.tool_calls.pop_front();
        }
    }
}

impl Default for ServerState {
    fn default() -> Self {
        Self::new()
    }
}

impl AppState {
    pub fn new(config: Config) -> Self {
        let store = CaptureStore::new(StoreConfig {
            max_console_entries: config.max_entries,
            log_file: Some(config.log_file.clone()),
        });
        Self {
            inner: Arc::new(Mutex::new(ServerState::new())),
            store: Arc::new(store),
            config: Arc::new(config),
            shutdown: Shutdown::new(),
            evidence: Arc::new(EvidenceTracker::new()),
            capturer: Arc::new(ScreenshotCapturer),
        }
    }

    /// Swaps the evidence capture backend.
    pub fn with_capturer(mut self, capturer: Arc<dyn EvidenceCapturer>) -> Self {
        self.capturer = capturer;
        self
    }
}

pub fn build_router(state: AppState) -> Router {
    let ingest = Router::new()
        .route("/logs", get(api_get_logs).post(api_logs).delete(api_clear_logs))
        .route("/network-bodies", post(api_network_bodies))
        .route("/network-waterfall", post(api_network_waterfall))
        .route("/websocket-events", post(api_websocket_events))
        .route("/enhanced-actions", post(api_enhanced_actions))
        .route("/performance-snapshot", post(api_performance_snapshot))
        .route(
            "/extension-logs",
            get(api_get_extension_logs).post(api_extension_logs),
        )
        .route(
            "/extension-status",
            get(api_get_extension_status).post(api_extension_status),
        )
        .route("/ci-result", post(api_ci_result))
        .route("/dom-result", post(api_query_result))
        .route("/a11y-result", post(api_query_result))
        .route("/state-result", post(api_query_result))
        .route("/execute-result", post(api_query_result))
        .route("/highlight-result", post(api_query_result))
        .route("/query-result", post(api_query_result))
        .route("/mcp", post(api_mcp))
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(INGEST_BODY_LIMIT));

    let screenshots = Router::new()
        .route("/screenshots", post(api_screenshots))
        .route("/screenshot-result", post(api_screenshot_result))
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(SCREENSHOT_BODY_LIMIT));

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers([
            axum::http::header::CONTENT_TYPE,
            HeaderName::from_static(API_KEY_HEADER),
            HeaderName::from_static(CLIENT_HEADER),
        ]);

    Router::new()
        .route("/", get(api_index))
        .route("/health", get(api_health))
        .route("/diagnostics", get(api_diagnostics))
        .route("/pending-queries", get(api_pending_queries))
        .merge(ingest)
        .merge(screenshots)
        .layer(middleware::from_fn_with_state(state.clone(), require_api_key))
        .layer(cors)
        .with_state(state)
}

/// Gates every non-OPTIONS request on `X-Gasoline-Key` when a key is configured.
async fn require_api_key(
    State(state): State<AppState>,
    req: Request<Body>,
    next: Next,
) -> Response {
    if req.method() == Method::OPTIONS {
        return next.run(req).await;
    }
    if let Some(expected) = state.config.api_key.as_deref() {
        let provided = req
            .headers()
            .get(API_KEY_HEADER)
            .and_then(|v| v.to_str().ok());
        if provided != Some(expected) {
            return json_error(StatusCode::UNAUTHORIZED, "missing or invalid X-Gasoline-Key");
        }
    }
    next.run(req).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_rate_limit_window_slides() {
        let mut state = ServerState::new();
        let start = Instant::now();
        for _ in 0..TOOL_CALLS_PER_MINUTE {
            assert!(state.admit_tool_call(start));
        }
        assert!(!state.admit_tool_call(start + Duration::from_secs(30)));
        assert!(state.admit_tool_call(start + Duration::from_secs(61)));
    }

    #[test]
    fn screenshots_are_limited_per_client() {
        let mut state = ServerState::new();
        let start = Instant::now();
        assert!(state.admit_screenshot("a", start));
        assert!(!state.admit_screenshot("a", start + Duration::from_millis(500)));
        assert!(state.admit_screenshot("b", start + Duration::from_millis(500)));
        assert!(state.admit_screenshot("a", start + Duration::from_millis(1100)));
        state.prune(start + Duration::from_secs(120));
        assert!(state.screenshot_last.is_empty());
    }
}
