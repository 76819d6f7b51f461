use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value as JsonValue};

use crate::lenient;

/// A user (or AI-driven) interaction recorded by the extension.
/// `timestamp` is milliseconds since the Unix epoch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnhancedAction {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, deserialize_with = "lenient::i64_or_zero")]
    pub timestamp: i64,
    #[serde(default)]
    pub url: String,
    #[serde(default, skip_serializing_if = "JsonMap::is_empty")]
    pub selectors: JsonMap<String, JsonValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, alias = "inputType", skip_serializing_if = "Option::is_none")]
    pub input_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default, alias = "fromUrl", skip_serializing_if = "Option::is_none")]
    pub from_url: Option<String>,
    #[serde(default, alias = "toUrl", skip_serializing_if = "Option::is_none")]
    pub to_url: Option<String>,
    #[serde(
        default,
        alias = "scrollY",
        deserialize_with = "lenient::opt_f64",
        skip_serializing_if = "Option::is_none"
    )]
    pub scroll_y: Option<f64>,
    #[serde(
        default,
        alias = "tabId",
        deserialize_with = "lenient::opt_i64",
        skip_serializing_if = "Option::is_none"
    )]
    pub tab_id: Option<i64>,
    /// `human` for page interactions, `ai` for actions issued through `interact`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

impl EnhancedAction {
    pub fn new(kind: impl Into<String>, timestamp_ms: i64, url: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            timestamp: timestamp_ms,
            url: url.into(),
            selectors: JsonMap::new(),
            value: None,
            input_type: None,
            key: None,
            from_url: None,
            to_url: None,
            scroll_y: None,
            tab_id: None,
            source: None,
        }
    }

    /// Best selector for scripts: test id, then id, then css.
    pub fn best_selector(&self) -> Option<String> {
        if let Some(test_id) = self.selectors.get("testId").and_then(JsonValue::as_str) {
            return Some(format!("[data-testid=\"{test_id}\"]"));
        }
        if let Some(id) = self.selectors.get("id").and_then(JsonValue::as_str) {
            return Some(format!("#{id}"));
        }
        self.selectors
            .get("css")
            .and_then(JsonValue::as_str)
            .map(str::to_string)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn best_selector_prefers_test_id() {
        let action: EnhancedAction = serde_json::from_value(json!({
            "type": "click",
            "timestamp": 1_700_000_000_000i64,
            "selectors": {"css": "button.primary", "testId": "save"},
        }))
        .expect("decode");
        assert_eq!(action.best_selector().as_deref(), Some("[data-testid=\"save\"]"));

        let css_only = EnhancedAction {
            selectors: json!({"css": "a.nav"}).as_object().cloned().unwrap_or_default(),
            ..EnhancedAction::new("click", 0, "")
        };
        assert_eq!(css_only.best_selector().as_deref(), Some("a.nav"));
    }
}
