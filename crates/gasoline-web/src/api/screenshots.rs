use std::path::{Path, PathBuf};
use std::time::Instant;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use chrono::Local;
use gasoline_types::{ScreenshotSaved, ScreenshotUpload};
use serde_json::json;
use tracing::{info, warn};

use crate::api::parse_body;
use crate::app::{AppState, CLIENT_HEADER};
use crate::util::http::{json_error, json_ok};

const MAX_NAME_PART: usize = 50;

/// Error screenshots pushed by the extension.
pub async fn api_screenshots(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    let upload = match admit_upload(&state, &headers, &body) {
        Ok(upload) => upload,
        Err(resp) => return resp,
    };
    let image = match decode_data_url(&upload.data_url) {
        Ok(image) => image,
        Err(msg) => return json_error(StatusCode::BAD_REQUEST, msg),
    };
    let filename = format!(
        "{}-{}-{}-{}.jpg",
        sanitize(&host_of(upload.url.as_deref())),
        Local::now().format("%Y%m%d-%H%M%S"),
        sanitize(upload.error_type.as_deref().filter(|s| !s.is_empty()).unwrap_or("unknown")),
        sanitize(upload.error_id.as_deref().filter(|s| !s.is_empty()).unwrap_or("manual")),
    );
    match save(&state.config.screenshot_dir(), &filename, &image) {
        Ok(saved) => json_ok(&saved),
        Err(resp) => resp,
    }
}

/// Screenshots taken on request. The saved path resolves the waiting query
/// or command.
pub async fn api_screenshot_result(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    let upload = match admit_upload(&state, &headers, &body) {
        Ok(upload) => upload,
        Err(resp) => return resp,
    };
    let correlator = state.store.correlator();
    let image = match decode_data_url(&upload.data_url) {
        Ok(image) => image,
        Err(msg) => {
            if let Some(id) = upload.query_id.as_deref() {
                correlator.set_query_result(id, json!({ "error": msg }));
            }
            return json_error(StatusCode::BAD_REQUEST, msg);
        }
    };
    let host = sanitize(&host_of(upload.url.as_deref()));
    let stamp = Local::now().format("%Y%m%d-%H%M%S");
    let filename = match upload.correlation_id.as_deref().filter(|s| !s.is_empty()) {
        Some(cid) => format!("{host}-{stamp}-{}.jpg", sanitize(cid)),
        None => format!("{host}-{stamp}.jpg"),
    };
    let saved = match save(&state.config.screenshot_dir(), &filename, &image) {
        Ok(saved) => saved,
        Err(resp) => {
            if let Some(id) = upload.query_id.as_deref() {
                correlator.set_query_result(id, json!({ "error": "screenshot_save_failed" }));
            }
            return resp;
        }
    };
    let result = json!({
        "filename": saved.filename,
        "path": saved.path,
        "correlation_id": upload.correlation_id.clone().unwrap_or_default(),
    });
    if let Some(id) = upload.query_id.as_deref() {
        correlator.set_query_result(id, result.clone());
    } else if let Some(cid) = upload.correlation_id.as_deref() {
        correlator.apply_command_result(cid, "complete", Some(result.clone()), None);
    }
    json_ok(&result)
}

fn admit_upload(
    state: &AppState,
    headers: &HeaderMap,
    body: &Bytes,
) -> Result<ScreenshotUpload, Response> {
    let client = headers
        .get(CLIENT_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty());
    if let Some(client) = client {
        if !state.inner.lock().admit_screenshot(client, Instant::now()) {
            return Err(json_error(
                StatusCode::TOO_MANY_REQUESTS,
                "Rate limit exceeded: max 1 screenshot per second",
            ));
        }
    }
    parse_body(body)
}

/// `data:image/jpeg;base64,<payload>` to raw bytes.
fn decode_data_url(data_url: &str) -> Result<Vec<u8>, &'static str> {
    if data_url.is_empty() {
        return Err("Missing dataUrl");
    }
    let Some((_, payload)) = data_url.split_once(',') else {
        return Err("Invalid dataUrl format");
    };
    STANDARD
        .decode(payload.trim())
        .map_err(|_| "Invalid base64 data")
}

fn host_of(page_url: Option<&str>) -> String {
    page_url
        .and_then(|u| url::Url::parse(u).ok())
        .and_then(|u| {
            let host = u.host_str()?.to_string();
            Some(match u.port() {
                Some(port) => format!("{host}:{port}"),
                None => host,
            })
        })
        .unwrap_or_else(|| "unknown".to_string())
}

fn sanitize(part: &str) -> String {
    part.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .take(MAX_NAME_PART)
        .collect()
}

fn save(dir: &Path, filename: &str, image: &[u8]) -> Result<ScreenshotSaved, Response> {
    let path: PathBuf = dir.join(filename);
    let written = std::fs::create_dir_all(dir).and_then(|()| std::fs::write(&path, image));
    if let Err(e) = written {
        warn!(path = %path.display(), error = %e, "could not save screenshot");
        return Err(json_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to save screenshot",
        ));
    }
    info!(path = %path.display(), bytes = image.len(), "screenshot saved");
    Ok(ScreenshotSaved {
        filename: filename.to_string(),
        path: path.display().to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filename_parts_are_sanitized_and_capped() {
        assert_eq!(sanitize("Type Error/../x"), "Type_Error_.._x");
        assert_eq!(sanitize(&"a".repeat(80)).len(), MAX_NAME_PART);
        assert_eq!(host_of(Some("http://localhost:3000/app")), "localhost:3000");
        assert_eq!(host_of(Some("not a url")), "unknown");
        assert_eq!(host_of(None), "unknown");
    }

    #[test]
    fn data_urls() {
        assert_eq!(decode_data_url("data:image/jpeg;base64,aGk="), Ok(b"hi".to_vec()));
        assert_eq!(decode_data_url(""), Err("Missing dataUrl"));
        assert_eq!(decode_data_url("aGk="), Err("Invalid dataUrl format"));
        assert_eq!(decode_data_url("data:,***"), Err("Invalid base64 data"));
    }
}
