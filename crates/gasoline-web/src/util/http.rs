use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use gasoline_types::ApiError;
use serde::Serialize;

pub fn json_ok<T: Serialize>(value: &T) -> Response {
    json_with_status(StatusCode::OK, value)
}

pub fn json_error(status: StatusCode, message: impl Into<String>) -> Response {
    json_with_status(
        status,
        &ApiError {
            error: message.into(),
        },
    )
}

pub fn json_with_status<T: Serialize>(status: StatusCode, value: &T) -> Response {
    match serde_json::to_string(value) {
        Ok(body) => (
            status,
            [(header::CONTENT_TYPE, "application/json; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            format!("json encode error: {e}"),
        )
            .into_response(),
    }
}
