use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::lenient;

/// A request for the extension, as built by a tool handler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingQuery {
    /// dom, execute, a11y, highlight, screenshot, waterfall, browser_action, ...
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub params: JsonValue,
    #[serde(
        default,
        alias = "tabId",
        deserialize_with = "lenient::opt_i64",
        skip_serializing_if = "Option::is_none"
    )]
    pub tab_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

impl PendingQuery {
    pub fn new(kind: impl Into<String>, params: JsonValue) -> Self {
        Self {
            kind: kind.into(),
            params,
            tab_id: None,
            correlation_id: None,
        }
    }

    pub fn with_tab(mut self, tab_id: Option<i64>) -> Self {
        self.tab_id = tab_id;
        self
    }

    pub fn with_correlation(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }
}

/// What `GET /pending-queries` hands to the extension.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingQueryResponse {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub params: JsonValue,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tab_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

/// Lifecycle of an async command. Everything but `Pending` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandStatus {
    Pending,
    Complete,
    Error,
    Timeout,
    Expired,
    Cancelled,
}

impl CommandStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, CommandStatus::Pending)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CommandStatus::Pending => "pending",
            CommandStatus::Complete => "complete",
            CommandStatus::Error => "error",
            CommandStatus::Timeout => "timeout",
            CommandStatus::Expired => "expired",
            CommandStatus::Cancelled => "cancelled",
        }
    }

    /// Maps the free-form status strings the extension reports onto the
    /// lifecycle. Unknown strings count as completion.
    pub fn normalize(raw: &str) -> CommandStatus {
        match raw.trim().to_ascii_lowercase().as_str() {
            "pending" | "queued" | "running" | "still_processing" => CommandStatus::Pending,
            "error" | "failed" => CommandStatus::Error,
            "canceled" | "cancelled" => CommandStatus::Cancelled,
            "timeout" => CommandStatus::Timeout,
            "expired" => CommandStatus::Expired,
            _ => CommandStatus::Complete,
        }
    }
}

impl fmt::Display for CommandStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Public view of an async command, as returned by `observe command_result`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandResult {
    pub correlation_id: String,
    pub status: CommandStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<JsonValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    /// Wall-clock ms between creation and completion (or now, while pending).
    pub elapsed_ms: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query_type: Option<String>,
}

/// Body of every `*-result` route. The legacy form carries `id`; the async
/// form carries `correlation_id` and a status.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResultPost {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default, alias = "correlationId")]
    pub correlation_id: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub result: Option<JsonValue>,
    #[serde(default)]
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_normalization_table() {
        for raw in ["", "ok", "success", "succeeded", "done", "complete", "whatever"] {
            assert_eq!(CommandStatus::normalize(raw), CommandStatus::Complete, "{raw}");
        }
        for raw in ["pending", "queued", "running", "still_processing"] {
            assert_eq!(CommandStatus::normalize(raw), CommandStatus::Pending, "{raw}");
        }
        assert_eq!(CommandStatus::normalize("FAILED"), CommandStatus::Error);
        assert_eq!(CommandStatus::normalize("canceled"), CommandStatus::Cancelled);
        assert_eq!(CommandStatus::normalize("timeout"), CommandStatus::Timeout);
        assert_eq!(CommandStatus::normalize("expired"), CommandStatus::Expired);
        assert!(!CommandStatus::Pending.is_terminal());
        assert!(CommandStatus::Cancelled.is_terminal());
    }
}
