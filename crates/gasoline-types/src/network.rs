use serde::{Deserialize, Serialize};

use crate::lenient;

/// Request bodies are cut at 8 KiB.
pub const MAX_REQUEST_BODY_BYTES: usize = 8 * 1024;
/// Response bodies are cut at 16 KiB.
pub const MAX_RESPONSE_BODY_BYTES: usize = 16 * 1024;

/// A captured request/response pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkBody {
    #[serde(default, alias = "ts")]
    pub timestamp: String,
    #[serde(default)]
    pub method: String,
    pub url: String,
    #[serde(default, deserialize_with = "lenient::i64_or_zero")]
    pub status: i64,
    #[serde(default, alias = "requestBody")]
    pub request_body: String,
    #[serde(default, alias = "responseBody")]
    pub response_body: String,
    #[serde(default, alias = "contentType")]
    pub content_type: String,
    #[serde(default, alias = "duration", deserialize_with = "lenient::i64_or_zero")]
    pub duration_ms: i64,
    #[serde(default, alias = "requestTruncated")]
    pub request_truncated: bool,
    #[serde(default, alias = "responseTruncated")]
    pub response_truncated: bool,
    #[serde(
        default,
        alias = "tabId",
        deserialize_with = "lenient::opt_i64",
        skip_serializing_if = "Option::is_none"
    )]
    pub tab_id: Option<i64>,
}

impl NetworkBody {
    /// Enforces the body caps, setting the truncation flags when a cut happens.
    /// Cuts land on a char boundary so the stored body stays valid UTF-8.
    pub fn truncate_bodies(&mut self) {
        if truncate_utf8(&mut self.request_body, MAX_REQUEST_BODY_BYTES) {
            self.request_truncated = true;
        }
        if truncate_utf8(&mut self.response_body, MAX_RESPONSE_BODY_BYTES) {
            self.response_truncated = true;
        }
    }

    /// Bytes charged against the network memory budget.
    pub fn approx_memory_bytes(&self) -> usize {
        self.request_body.len() + self.response_body.len() + 300
    }

    pub fn is_failure(&self) -> bool {
        self.status >= 400 || self.status == 0
    }
}

fn truncate_utf8(s: &mut String, max: usize) -> bool {
    if s.len() <= max {
        return false;
    }
    let mut cut = max;
    while !s.is_char_boundary(cut) {
        cut -= 1;
    }
    s.truncate(cut);
    true
}

/// One resource-timing entry from the page's performance timeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkWaterfallEntry {
    #[serde(default, alias = "name")]
    pub url: String,
    #[serde(default, alias = "initiatorType")]
    pub initiator_type: String,
    #[serde(default, alias = "duration", deserialize_with = "lenient::f64_or_zero")]
    pub duration_ms: f64,
    #[serde(default, alias = "startTime", deserialize_with = "lenient::f64_or_zero")]
    pub start_time: f64,
    #[serde(default, alias = "transferSize", deserialize_with = "lenient::i64_or_zero")]
    pub transfer_size: i64,
    #[serde(default, alias = "decodedBodySize", deserialize_with = "lenient::i64_or_zero")]
    pub decoded_body_size: i64,
    #[serde(default, alias = "encodedBodySize", deserialize_with = "lenient::i64_or_zero")]
    pub encoded_body_size: i64,
    /// Stamped by the server on arrival.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_timestamp: Option<String>,
    #[serde(default, alias = "pageUrl")]
    pub page_url: String,
}

/// Body of `POST /network-waterfall`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct WaterfallBatch {
    #[serde(default)]
    pub entries: Vec<serde_json::Value>,
    #[serde(default, alias = "pageUrl")]
    pub page_url: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn network_body_round_trips_every_declared_field() {
        let body = NetworkBody {
            timestamp: "2026-03-01T10:00:00Z".to_string(),
            method: "POST".to_string(),
            url: "https://api.example.com/items".to_string(),
            status: 201,
            request_body: "{\"a\":1}".to_string(),
            response_body: "{\"id\":9}".to_string(),
            content_type: "application/json".to_string(),
            duration_ms: 42,
            request_truncated: false,
            response_truncated: true,
            tab_id: Some(3),
        };
        let encoded = serde_json::to_string(&body).expect("encode");
        let decoded: NetworkBody = serde_json::from_str(&encoded).expect("decode");
        assert_eq!(decoded, body);
    }

    #[test]
    fn truncation_sets_flags_and_respects_char_boundaries() {
        let mut body: NetworkBody = serde_json::from_value(json!({
            "url": "https://example.com",
            "requestBody": "é".repeat(MAX_REQUEST_BODY_BYTES),
            "responseBody": "short",
        }))
        .expect("decode");
        body.truncate_bodies();
        assert!(body.request_truncated);
        assert!(!body.response_truncated);
        assert!(body.request_body.len() <= MAX_REQUEST_BODY_BYTES);
        assert_eq!(body.response_body, "short");
    }

    #[test]
    fn waterfall_entry_accepts_resource_timing_names() {
        let entry: NetworkWaterfallEntry = serde_json::from_value(json!({
            "name": "https://cdn.example.com/app.js",
            "initiatorType": "script",
            "duration": 12.5,
            "startTime": 100,
            "transferSize": 2048,
        }))
        .expect("decode");
        assert_eq!(entry.url, "https://cdn.example.com/app.js");
        assert_eq!(entry.transfer_size, 2048);
        assert_eq!(entry.duration_ms, 12.5);
        assert!(entry.server_timestamp.is_none());
    }
}
