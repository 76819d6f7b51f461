use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use gasoline_capture::ClearScope;
use gasoline_types::{
    CiResult, ExtensionStatusPost, LogEntry, StatusOk, WaterfallBatch, split_ingest_body,
};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::{debug, info};

use crate::api::parse_body;
use crate::app::AppState;
use crate::util::http::{json_error, json_ok};

const DEFAULT_LOG_LIMIT: usize = 100;

#[derive(Debug, Default, Deserialize)]
pub struct LogsParams {
    #[serde(default)]
    pub limit: Option<usize>,
}

#[derive(Serialize)]
struct LogsListResponse<'a> {
    entries: &'a [LogEntry],
    count: usize,
    total: usize,
}

#[derive(Serialize)]
struct ClearResponse {
    status: &'static str,
    cleared: Vec<&'static str>,
}

pub async fn api_logs(State(state): State<AppState>, body: Bytes) -> impl IntoResponse {
    let value: JsonValue = match parse_body(&body) {
        Ok(value) => value,
        Err(resp) => return resp,
    };
    json_ok(&state.store.add_logs(split_ingest_body(value)))
}

/// Newest `limit` entries, oldest first.
pub async fn api_get_logs(
    State(state): State<AppState>,
    Query(params): Query<LogsParams>,
) -> impl IntoResponse {
    let all = state.store.console_entries();
    let limit = params.limit.unwrap_or(DEFAULT_LOG_LIMIT).max(1);
    let start = all.len().saturating_sub(limit);
    let entries = &all[start..];
    json_ok(&LogsListResponse {
        entries,
        count: entries.len(),
        total: all.len(),
    })
}

pub async fn api_clear_logs(State(state): State<AppState>) -> impl IntoResponse {
    let cleared = state.store.clear(ClearScope::All);
    json_ok(&ClearResponse {
        status: "ok",
        cleared: cleared.iter().map(|c| c.as_str()).collect(),
    })
}

pub async fn api_network_bodies(State(state): State<AppState>, body: Bytes) -> impl IntoResponse {
    let value: JsonValue = match parse_body(&body) {
        Ok(value) => value,
        Err(resp) => return resp,
    };
    json_ok(&state.store.add_network_bodies(split_ingest_body(value)))
}

/// Accepts `{entries, pageUrl}`. A bare array is taken as entries without a
/// page URL.
pub async fn api_network_waterfall(
    State(state): State<AppState>,
    body: Bytes,
) -> impl IntoResponse {
    let value: JsonValue = match parse_body(&body) {
        Ok(value) => value,
        Err(resp) => return resp,
    };
    let batch = match value {
        JsonValue::Object(_) => match serde_json::from_value::<WaterfallBatch>(value) {
            Ok(batch) => batch,
            Err(e) => {
                return json_error(StatusCode::BAD_REQUEST, format!("invalid waterfall batch: {e}"));
            }
        },
        other => WaterfallBatch {
            entries: split_ingest_body(other),
            page_url: String::new(),
        },
    };
    json_ok(&state.store.add_waterfall(batch.entries, &batch.page_url))
}

pub async fn api_websocket_events(
    State(state): State<AppState>,
    body: Bytes,
) -> impl IntoResponse {
    let value: JsonValue = match parse_body(&body) {
        Ok(value) => value,
        Err(resp) => return resp,
    };
    json_ok(&state.store.add_websocket_events(split_ingest_body(value)))
}

pub async fn api_enhanced_actions(
    State(state): State<AppState>,
    body: Bytes,
) -> impl IntoResponse {
    let value: JsonValue = match parse_body(&body) {
        Ok(value) => value,
        Err(resp) => return resp,
    };
    json_ok(&state.store.add_actions(split_ingest_body(value)))
}

pub async fn api_performance_snapshot(
    State(state): State<AppState>,
    body: Bytes,
) -> impl IntoResponse {
    let value: JsonValue = match parse_body(&body) {
        Ok(value) => value,
        Err(resp) => return resp,
    };
    json_ok(&state.store.add_performance_snapshots(split_ingest_body(value)))
}

pub async fn api_extension_logs(State(state): State<AppState>, body: Bytes) -> impl IntoResponse {
    let value: JsonValue = match parse_body(&body) {
        Ok(value) => value,
        Err(resp) => return resp,
    };
    json_ok(&state.store.add_extension_logs(split_ingest_body(value)))
}

pub async fn api_get_extension_logs(State(state): State<AppState>) -> impl IntoResponse {
    let entries = state.store.extension_logs();
    json_ok(&serde_json::json!({
        "count": entries.len(),
        "entries": entries,
    }))
}

pub async fn api_extension_status(
    State(state): State<AppState>,
    body: Bytes,
) -> impl IntoResponse {
    let post: Option<ExtensionStatusPost> = match parse_body(&body) {
        Ok(post) => post,
        Err(resp) => return resp,
    };
    let status = state.store.update_extension_status(post.unwrap_or_default());
    debug!(
        tracking = status.tracking_enabled,
        tab_id = ?status.tracked_tab_id,
        "extension status updated"
    );
    json_ok(&status)
}

pub async fn api_get_extension_status(State(state): State<AppState>) -> impl IntoResponse {
    json_ok(&state.store.tracking_status())
}

/// External CI results become alerts on the next observe call.
pub async fn api_ci_result(State(state): State<AppState>, body: Bytes) -> impl IntoResponse {
    let ci: CiResult = match parse_body(&body) {
        Ok(ci) => ci,
        Err(resp) => return resp,
    };
    if ci.status.trim().is_empty() {
        return json_error(StatusCode::BAD_REQUEST, "ci result needs a status");
    }
    let (status, commit) = (ci.status.clone(), ci.commit.clone());
    let queued = state.store.record_ci(ci);
    info!(%status, %commit, queued, "ci result received");
    json_ok(&StatusOk::ok())
}
