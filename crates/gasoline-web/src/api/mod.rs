pub mod health;
pub mod ingest;
pub mod mcp;
pub mod queries;
pub mod screenshots;

use axum::body::Bytes;
use axum::http::StatusCode;
use axum::response::Response;
use serde::de::DeserializeOwned;

use crate::util::http::json_error;

/// Decodes a request body, or the 400 to send back. An empty body decodes
/// as JSON `null`.
pub(crate) fn parse_body<T: DeserializeOwned>(body: &Bytes) -> Result<T, Response> {
    let raw: &[u8] = if body.is_empty() { b"null" } else { body };
    serde_json::from_slice(raw)
        .map_err(|e| json_error(StatusCode::BAD_REQUEST, format!("invalid request json: {e}")))
}
