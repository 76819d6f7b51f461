use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::lenient;

/// Body of `POST /extension-status`. Every field is optional so partial
/// heartbeats are accepted.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ExtensionStatusPost {
    #[serde(default, alias = "trackingEnabled")]
    pub tracking_enabled: Option<bool>,
    #[serde(
        default,
        alias = "trackedTabId",
        alias = "tab_id",
        deserialize_with = "lenient::opt_i64"
    )]
    pub tracked_tab_id: Option<i64>,
    #[serde(default, alias = "trackedTabUrl")]
    pub tracked_tab_url: Option<String>,
    #[serde(default, alias = "pilotEnabled")]
    pub pilot_enabled: Option<bool>,
    #[serde(default, alias = "sessionId")]
    pub session_id: Option<String>,
    #[serde(default, alias = "extensionVersion")]
    pub extension_version: Option<String>,
}

/// Tracking state as seen by tools and `GET /extension-status`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrackingStatus {
    pub tracking_enabled: bool,
    pub tracked_tab_id: Option<i64>,
    pub tracked_tab_url: Option<String>,
    pub updated_at: Option<String>,
    pub extension_connected: bool,
    pub pilot_enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extension_version: Option<String>,
}

/// Diagnostic line emitted by the extension's own background script.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtensionLogEntry {
    #[serde(default, alias = "ts")]
    pub timestamp: String,
    #[serde(default)]
    pub level: String,
    pub message: String,
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub category: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<JsonValue>,
}
