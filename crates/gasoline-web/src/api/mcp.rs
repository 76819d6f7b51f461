use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;

use crate::app::{AppState, CLIENT_HEADER};
use crate::mcp::GasolineMcpHandler;
use crate::util::http::json_ok;

/// One JSON-RPC message per request. Notifications get an empty 202.
pub async fn api_mcp(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    let client_id = headers
        .get(CLIENT_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty());
    let handler = GasolineMcpHandler::new(state);
    match handler.handle_message(&body, client_id).await {
        Some(response) => json_ok(&response),
        None => StatusCode::ACCEPTED.into_response(),
    }
}
