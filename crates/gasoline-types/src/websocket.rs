use serde::{Deserialize, Serialize};

use crate::lenient;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WsEventKind {
    Open,
    Message,
    Close,
    Error,
}

impl WsEventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            WsEventKind::Open => "open",
            WsEventKind::Message => "message",
            WsEventKind::Close => "close",
            WsEventKind::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WsDirection {
    Incoming,
    Outgoing,
}

impl WsDirection {
    pub fn as_str(self) -> &'static str {
        match self {
            WsDirection::Incoming => "incoming",
            WsDirection::Outgoing => "outgoing",
        }
    }
}

/// Present when the extension sampled a high-rate stream instead of
/// forwarding every frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplingInfo {
    #[serde(default)]
    pub rate: String,
    #[serde(default)]
    pub logged: String,
    #[serde(default)]
    pub window: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebSocketEvent {
    #[serde(default, alias = "ts")]
    pub timestamp: String,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    pub event: WsEventKind,
    pub id: String,
    #[serde(default)]
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub direction: Option<WsDirection>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    #[serde(
        default,
        deserialize_with = "lenient::opt_i64",
        skip_serializing_if = "Option::is_none"
    )]
    pub size: Option<i64>,
    #[serde(
        default,
        alias = "code",
        deserialize_with = "lenient::opt_i64",
        skip_serializing_if = "Option::is_none"
    )]
    pub close_code: Option<i64>,
    #[serde(default, alias = "reason", skip_serializing_if = "Option::is_none")]
    pub close_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sampled: Option<SamplingInfo>,
    #[serde(
        default,
        alias = "tabId",
        deserialize_with = "lenient::opt_i64",
        skip_serializing_if = "Option::is_none"
    )]
    pub tab_id: Option<i64>,
}

impl WebSocketEvent {
    /// Bytes charged against the WebSocket memory budget.
    pub fn approx_memory_bytes(&self) -> usize {
        self.data.as_ref().map_or(0, String::len) + 200
    }
}

/// Per-direction counters for one connection.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DirectionStats {
    pub total: u64,
    pub bytes: u64,
    pub per_second: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_data: Option<String>,
}

/// Live connection as reported by `observe websocket_status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebSocketConnection {
    pub id: String,
    pub url: String,
    pub state: String,
    pub opened_at: String,
    pub duration_ms: i64,
    pub incoming: DirectionStats,
    pub outgoing: DirectionStats,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sampling: Option<SamplingInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tab_id: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClosedConnection {
    pub id: String,
    pub url: String,
    pub state: String,
    pub opened_at: String,
    pub closed_at: String,
    pub close_code: Option<i64>,
    pub close_reason: Option<String>,
    pub total_messages: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WebSocketStatus {
    pub connections: Vec<WebSocketConnection>,
    pub closed: Vec<ClosedConnection>,
    pub active_count: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn websocket_event_rejects_unknown_event_kind() {
        let ok = serde_json::from_value::<WebSocketEvent>(json!({
            "event": "message",
            "id": "ws-1",
            "direction": "incoming",
            "data": "hello",
            "tabId": 4.0,
        }))
        .expect("decode");
        assert_eq!(ok.direction, Some(WsDirection::Incoming));
        assert_eq!(ok.tab_id, Some(4));
        assert_eq!(ok.approx_memory_bytes(), 205);

        assert!(
            serde_json::from_value::<WebSocketEvent>(json!({"event": "ping", "id": "ws-1"}))
                .is_err()
        );
    }
}
