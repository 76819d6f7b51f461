//! Structured tool errors.
//!
//! A tool error is never a JSON-RPC protocol error. It is a normal tool result
//! with `isError: true` whose text is two lines: a one-line summary with the
//! code and retry instruction, then a JSON object carrying the same fields.

use std::fmt;

use serde::Serialize;
use thiserror::Error;

use super::response::{ToolResult, error_result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    InvalidJson,
    MissingParam,
    InvalidParam,
    UnknownMode,
    PathNotAllowed,
    NotInitialized,
    NoData,
    CodePilotDisabled,
    RateLimited,
    ExtTimeout,
    ExtError,
    Internal,
    MarshalFailed,
    ExportFailed,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::InvalidJson => "invalid_json",
            ErrorCode::MissingParam => "missing_param",
            ErrorCode::InvalidParam => "invalid_param",
            ErrorCode::UnknownMode => "unknown_mode",
            ErrorCode::PathNotAllowed => "path_not_allowed",
            ErrorCode::NotInitialized => "not_initialized",
            ErrorCode::NoData => "no_data",
            ErrorCode::CodePilotDisabled => "code_pilot_disabled",
            ErrorCode::RateLimited => "rate_limited",
            ErrorCode::ExtTimeout => "ext_timeout",
            ErrorCode::ExtError => "ext_error",
            ErrorCode::Internal => "internal",
            ErrorCode::MarshalFailed => "marshal_failed",
            ErrorCode::ExportFailed => "export_failed",
        }
    }

    pub fn retryable(self) -> bool {
        matches!(
            self,
            ErrorCode::ExtTimeout | ErrorCode::RateLimited | ErrorCode::ExtError
        )
    }

    pub fn default_retry_after_ms(self) -> Option<u64> {
        match self {
            ErrorCode::ExtTimeout | ErrorCode::RateLimited => Some(1000),
            ErrorCode::ExtError => Some(2000),
            _ => None,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Error)]
#[error("{code}: {message}")]
pub struct ToolError {
    pub code: ErrorCode,
    pub message: String,
    pub retry: String,
    pub param: Option<String>,
    pub hint: Option<String>,
    pub retry_after_ms: Option<u64>,
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    error: ErrorCode,
    message: &'a str,
    retry: &'a str,
    retryable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    retry_after_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    param: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    hint: Option<&'a str>,
}

impl ToolError {
    pub fn new(code: ErrorCode, message: impl Into<String>, retry: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            retry: retry.into(),
            param: None,
            hint: None,
            retry_after_ms: code.default_retry_after_ms(),
        }
    }

    pub fn with_param(mut self, param: impl Into<String>) -> Self {
        self.param = Some(param.into());
        self
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    pub fn with_retry_after(mut self, ms: u64) -> Self {
        self.retry_after_ms = Some(ms);
        self
    }

    pub fn missing_param(param: &str, retry: impl Into<String>) -> Self {
        Self::new(
            ErrorCode::MissingParam,
            format!("Required parameter '{param}' is missing"),
            retry,
        )
        .with_param(param)
    }

    pub fn invalid_param(param: &str, message: impl Into<String>, retry: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidParam, message, retry).with_param(param)
    }

    pub fn invalid_json(detail: impl fmt::Display) -> Self {
        Self::new(
            ErrorCode::InvalidJson,
            format!("Invalid JSON arguments: {detail}"),
            "Fix the JSON syntax of the arguments and call again",
        )
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(
            ErrorCode::Internal,
            message,
            "Internal server error. Do not retry; report the issue",
        )
    }

    pub fn ext_timeout(what: &str, waited_secs: u64) -> Self {
        Self::new(
            ErrorCode::ExtTimeout,
            format!("Timeout waiting for {what} from the extension after {waited_secs}s"),
            "Check that the browser extension is connected and a tab is tracked, then retry",
        )
    }

    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::new(
            ErrorCode::RateLimited,
            message,
            "Wait before sending more requests, then retry",
        )
    }

    pub fn render(&self) -> String {
        let body = ErrorBody {
            error: self.code,
            message: &self.message,
            retry: &self.retry,
            retryable: self.code.retryable(),
            retry_after_ms: self.retry_after_ms,
            param: self.param.as_deref(),
            hint: self.hint.as_deref(),
        };
        let json = serde_json::to_string(&body)
            .unwrap_or_else(|_| format!("{{\"error\":\"{}\"}}", self.code));
        format!("Error: {} — {}\n{json}", self.code, self.retry)
    }

    pub fn into_result(self) -> ToolResult {
        error_result(self.render())
    }
}
