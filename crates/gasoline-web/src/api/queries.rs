use std::time::Duration;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use gasoline_types::{PendingQueriesResponse, ResultPost};
use serde::Serialize;
use serde_json::{Value as JsonValue, json};
use tracing::debug;

use crate::api::parse_body;
use crate::app::AppState;
use crate::util::http::{json_error, json_ok};

/// How long an empty poll is held open.
const LONG_POLL: Duration = Duration::from_secs(5);

#[derive(Serialize)]
struct ResultAck {
    status: &'static str,
    matched: bool,
}

/// Extension poll. Marks the extension as alive, then waits for work.
pub async fn api_pending_queries(State(state): State<AppState>) -> impl IntoResponse {
    state.store.record_poll();
    let correlator = state.store.correlator();
    tokio::select! {
        _ = correlator.query_available(LONG_POLL) => {}
        _ = state.shutdown.wait() => {}
    }
    let queries = correlator.take_for_poll();
    if !queries.is_empty() {
        debug!(count = queries.len(), "queries handed to extension");
    }
    json_ok(&PendingQueriesResponse { queries })
}

/// Result delivery for every `*-result` route.
pub async fn api_query_result(State(state): State<AppState>, body: Bytes) -> impl IntoResponse {
    let post: ResultPost = match parse_body::<Option<ResultPost>>(&body) {
        Ok(post) => post.unwrap_or_default(),
        Err(resp) => return resp,
    };
    let correlator = state.store.correlator();
    let matched = match (post.correlation_id.as_deref(), post.id.as_deref()) {
        (Some(correlation_id), id) => {
            let applied = correlator.apply_command_result(
                correlation_id,
                post.status.as_deref().unwrap_or(""),
                post.result,
                post.error,
            );
            if let Some(id) = id {
                correlator.acknowledge(id);
            }
            applied
        }
        (None, Some(id)) => {
            let value = match (post.result, post.error) {
                (Some(result), _) => result,
                (None, Some(error)) => json!({ "error": error }),
                (None, None) => JsonValue::Null,
            };
            correlator.set_query_result(id, value)
        }
        (None, None) => {
            return json_error(StatusCode::BAD_REQUEST, "result needs an id or correlation_id");
        }
    };
    json_ok(&ResultAck {
        status: "ok",
        matched,
    })
}
