//! Request and response bodies of the HTTP surface.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::query::PendingQueryResponse;

/// Keys under which a batch ingest may carry its entries.
const BATCH_KEYS: [&str; 5] = ["entries", "events", "bodies", "actions", "snapshots"];

/// Splits an ingest body into individual entries. Accepts `{entries: [...]}`
/// (or one of the per-route batch keys), a bare array, or a single object.
pub fn split_ingest_body(body: JsonValue) -> Vec<JsonValue> {
    match body {
        JsonValue::Array(items) => items,
        JsonValue::Object(mut map) => {
            for key in BATCH_KEYS {
                if matches!(map.get(key), Some(JsonValue::Array(_))) {
                    if let Some(JsonValue::Array(items)) = map.remove(key) {
                        return items;
                    }
                }
            }
            vec![JsonValue::Object(map)]
        }
        JsonValue::Null => Vec::new(),
        other => vec![other],
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusOk {
    pub status: String,
}

impl StatusOk {
    pub fn ok() -> Self {
        Self {
            status: "ok".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiError {
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IngestResponse {
    pub received: usize,
    pub rejected: usize,
}

/// `POST /logs` also reports the console ring size after the append.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LogsPostResponse {
    pub received: usize,
    pub rejected: usize,
    pub entries: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PendingQueriesResponse {
    pub queries: Vec<PendingQueryResponse>,
}

/// Body of `POST /screenshots` and `POST /screenshot-result`.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ScreenshotUpload {
    #[serde(default, alias = "dataUrl")]
    pub data_url: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default, alias = "errorId")]
    pub error_id: Option<String>,
    #[serde(default, alias = "errorType")]
    pub error_type: Option<String>,
    #[serde(default, alias = "correlationId")]
    pub correlation_id: Option<String>,
    #[serde(default, alias = "queryId")]
    pub query_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScreenshotSaved {
    pub filename: String,
    pub path: String,
}

/// Left behind by the binary watcher when a newer build replaced the
/// running one; consumed on the next start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpgradeMarker {
    pub from_version: String,
    pub to_version: String,
    pub timestamp: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HealthLogs {
    pub entries: usize,
    pub max_entries: usize,
    pub total_added: u64,
    pub log_file: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HealthBuffers {
    pub network_bodies: usize,
    pub websocket_events: usize,
    pub actions: usize,
    pub waterfall: usize,
    pub extension_logs: usize,
    pub performance_snapshots: usize,
    pub pending_queries: usize,
    pub network_memory_bytes: usize,
    pub websocket_memory_bytes: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HealthExtension {
    pub connected: bool,
    /// `connected`, `stale`, `disconnected` or `never_connected`.
    pub status: String,
    /// Milliseconds since the last `/pending-queries` poll.
    pub last_poll_ms: Option<i64>,
    pub pilot_enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HealthCircuit {
    pub open: bool,
    pub reason: Option<String>,
    pub window_event_count: u64,
    pub threshold: u64,
    pub open_count: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_seconds: u64,
    pub pid: u32,
    pub logs: HealthLogs,
    pub buffers: HealthBuffers,
    pub extension: HealthExtension,
    pub circuit: HealthCircuit,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upgrade: Option<UpgradeMarker>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn ingest_body_accepts_batch_array_and_single_object() {
        assert_eq!(
            split_ingest_body(json!({"entries": [{"a": 1}, {"a": 2}]})).len(),
            2
        );
        assert_eq!(split_ingest_body(json!([{"a": 1}])).len(), 1);
        assert_eq!(
            split_ingest_body(json!({"event": "open", "id": "ws"})),
            vec![json!({"event": "open", "id": "ws"})]
        );
        assert!(split_ingest_body(JsonValue::Null).is_empty());
    }
}
