use std::fmt::Write as _;

use axum::extract::State;
use axum::http::{HeaderMap, header};
use axum::response::{Html, IntoResponse};
use gasoline_types::HealthResponse;
use serde_json::json;

use crate::app::AppState;
use crate::config::VERSION;
use crate::mcp::schema::TOOL_NAMES;
use crate::util::http::json_ok;

const ENDPOINTS: &[(&str, &str)] = &[
    ("GET /health", "server and extension health"),
    ("GET /diagnostics", "detailed state dump"),
    ("GET|POST|DELETE /logs", "console entries"),
    ("POST /network-bodies", "network request/response bodies"),
    ("POST /network-waterfall", "resource timing entries"),
    ("POST /websocket-events", "WebSocket lifecycle and frames"),
    ("POST /enhanced-actions", "user actions"),
    ("POST /performance-snapshot", "page performance snapshots"),
    ("GET|POST /extension-status", "tracking and pilot state"),
    ("GET|POST /extension-logs", "extension background logs"),
    ("GET /pending-queries", "queries waiting for the extension"),
    ("POST /query-result", "query and command results"),
    ("POST /screenshots", "error screenshots"),
    ("POST /ci-result", "external CI results"),
    ("POST /mcp", "JSON-RPC 2.0 / MCP"),
];

/// Discovery document, or a small HTML page when a browser asks.
pub async fn api_index(State(state): State<AppState>, headers: HeaderMap) -> impl IntoResponse {
    let wants_html = headers
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|accept| accept.contains("text/html"));
    if wants_html {
        return Html(dashboard(&state)).into_response();
    }
    let endpoints: Vec<_> = ENDPOINTS
        .iter()
        .map(|(route, description)| json!({ "route": route, "description": description }))
        .collect();
    json_ok(&json!({
        "name": "gasoline",
        "version": VERSION,
        "port": state.config.port,
        "mcp": { "endpoint": "/mcp", "tools": TOOL_NAMES },
        "endpoints": endpoints,
    }))
}

fn dashboard(state: &AppState) -> String {
    let health = state.store.health();
    let mut out = String::new();
    let _ = writeln!(out, "<!doctype html>");
    let _ = writeln!(out, "<html><head><meta charset=\"utf-8\"><title>Gasoline</title></head><body>");
    let _ = writeln!(out, "<h1>Gasoline {VERSION}</h1>");
    let _ = writeln!(
        out,
        "<p>Extension: <b>{}</b></p>",
        health.extension.status
    );
    let _ = writeln!(out, "<table>");
    for (name, count) in [
        ("console", health.logs.entries),
        ("network bodies", health.buffers.network_bodies),
        ("websocket events", health.buffers.websocket_events),
        ("actions", health.buffers.actions),
        ("waterfall", health.buffers.waterfall),
        ("performance snapshots", health.buffers.performance_snapshots),
        ("pending queries", health.buffers.pending_queries),
    ] {
        let _ = writeln!(out, "<tr><td>{name}</td><td>{count}</td></tr>");
    }
    let _ = writeln!(out, "</table>");
    let _ = writeln!(out, "<ul>");
    for (route, description) in ENDPOINTS {
        let _ = writeln!(out, "<li><code>{route}</code> {description}</li>");
    }
    let _ = writeln!(out, "</ul></body></html>");
    out
}

pub async fn api_health(State(state): State<AppState>) -> impl IntoResponse {
    let snapshot = state.store.health();
    let upgrade = state.inner.lock().upgrade.clone();
    json_ok(&HealthResponse {
        status: "ok".to_string(),
        version: VERSION.to_string(),
        uptime_seconds: state.store.uptime().as_secs(),
        pid: std::process::id(),
        logs: snapshot.logs,
        buffers: snapshot.buffers,
        extension: snapshot.extension,
        circuit: snapshot.circuit,
        upgrade,
    })
}

/// Everything useful for a bug report. The API key is never echoed.
pub async fn api_diagnostics(State(state): State<AppState>) -> impl IntoResponse {
    let store = &state.store;
    let snapshot = store.health();
    let correlator = store.correlator();
    let (security_mode, tools) = {
        let inner = state.inner.lock();
        (inner.security_mode, inner.tool_stats.clone())
    };
    let connectivity = store.connectivity();
    json_ok(&json!({
        "server": {
            "version": VERSION,
            "pid": std::process::id(),
            "port": state.config.port,
            "uptime_seconds": store.uptime().as_secs(),
            "log_file": state.config.log_file.display().to_string(),
            "screenshot_dir": state.config.screenshot_dir().display().to_string(),
            "api_key_configured": state.config.api_key.is_some(),
            "auto_upgrade": state.config.auto_upgrade,
            "security_mode": security_mode.as_str(),
        },
        "logs": snapshot.logs,
        "buffers": snapshot.buffers,
        "circuit": snapshot.circuit,
        "extension": {
            "status": connectivity.status,
            "connected": connectivity.connected,
            "last_poll_ms": connectivity.last_poll_ms,
            "tracking": store.tracking_status(),
        },
        "websockets": store.websocket_status(None, None),
        "commands": {
            "queue_depth": correlator.queue_depth(),
            "pending": correlator.pending_commands(None).len(),
            "completed": correlator.completed_commands(None).len(),
            "failed": correlator.failed_commands(None).len(),
        },
        "evidence": {
            "tracked": state.evidence.len(),
            "evicted_unfinalized": state.evidence.evicted_unfinalized(),
        },
        "alerts_queued": snapshot.alerts_queued,
        "ci_results": store.ci_results().len(),
        "redaction_rules": store.redactor().rule_names(),
        "tools": tools,
    }))
}
