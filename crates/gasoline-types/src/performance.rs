use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::lenient;

/// Navigation timing for one page load. Paint metrics the browser has not
/// reported yet are `null` on the wire, not omitted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PerformanceTiming {
    #[serde(default, alias = "domContentLoaded")]
    pub dom_content_loaded: f64,
    #[serde(default)]
    pub load: f64,
    #[serde(
        default,
        alias = "first_contentful_paint",
        deserialize_with = "lenient::opt_f64"
    )]
    pub fcp: Option<f64>,
    #[serde(
        default,
        alias = "largest_contentful_paint",
        deserialize_with = "lenient::opt_f64"
    )]
    pub lcp: Option<f64>,
    #[serde(
        default,
        alias = "interaction_to_next_paint",
        deserialize_with = "lenient::opt_f64"
    )]
    pub inp: Option<f64>,
    #[serde(default, alias = "time_to_first_byte")]
    pub ttfb: f64,
    #[serde(default, alias = "domInteractive")]
    pub dom_interactive: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TypeSummary {
    pub count: u64,
    pub size: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SlowRequest {
    pub url: String,
    pub duration: f64,
    #[serde(default)]
    pub size: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NetworkSummary {
    #[serde(default)]
    pub request_count: u64,
    #[serde(default)]
    pub transfer_size: i64,
    #[serde(default)]
    pub decoded_size: i64,
    #[serde(default)]
    pub by_type: BTreeMap<String, TypeSummary>,
    #[serde(default, alias = "slowest_requests")]
    pub slowest: Vec<SlowRequest>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LongTaskMetrics {
    #[serde(default)]
    pub count: u64,
    #[serde(default)]
    pub total_blocking_time: f64,
    #[serde(default)]
    pub longest: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceSnapshot {
    pub url: String,
    #[serde(default)]
    pub timestamp: String,
    pub timing: PerformanceTiming,
    #[serde(default)]
    pub network: NetworkSummary,
    #[serde(default, alias = "longTasks")]
    pub long_tasks: LongTaskMetrics,
    #[serde(
        default,
        alias = "cumulative_layout_shift",
        deserialize_with = "lenient::opt_f64",
        skip_serializing_if = "Option::is_none"
    )]
    pub cls: Option<f64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resources: Vec<JsonValue>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BaselineTiming {
    pub dom_content_loaded: f64,
    pub load: f64,
    pub fcp: Option<f64>,
    pub lcp: Option<f64>,
    pub ttfb: f64,
    pub dom_interactive: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BaselineNetwork {
    pub request_count: f64,
    pub transfer_size: f64,
}

/// Running average of every snapshot seen for one URL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceBaseline {
    pub url: String,
    pub sample_count: u64,
    pub last_updated: String,
    pub timing: BaselineTiming,
    pub network: BaselineNetwork,
    pub long_tasks: LongTaskMetrics,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cls: Option<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn snapshot_round_trip_keeps_null_paint_metrics() {
        let snapshot: PerformanceSnapshot = serde_json::from_value(json!({
            "url": "https://example.com/",
            "timestamp": "2026-02-01T00:00:00Z",
            "timing": {
                "dom_content_loaded": 300.0,
                "load": 900.0,
                "first_contentful_paint": 250.5,
                "ttfb": 80.0,
                "dom_interactive": 280.0
            },
            "network": {"request_count": 12, "transfer_size": 4096, "decoded_size": 9000,
                        "by_type": {"script": {"count": 3, "size": 2000}},
                        "slowest_requests": [{"url": "/a.js", "duration": 120.0, "size": 1000}]},
            "long_tasks": {"count": 2, "total_blocking_time": 75.0, "longest": 60.0},
            "cls": 0.02
        }))
        .expect("decode");
        assert_eq!(snapshot.timing.fcp, Some(250.5));
        assert_eq!(snapshot.timing.lcp, None);

        let encoded = serde_json::to_value(&snapshot).expect("encode");
        assert_eq!(encoded["timing"]["lcp"], JsonValue::Null);
        assert_eq!(encoded["timing"]["inp"], JsonValue::Null);
        assert_eq!(encoded["network"]["slowest"][0]["url"], json!("/a.js"));

        let decoded: PerformanceSnapshot = serde_json::from_value(encoded).expect("decode again");
        assert_eq!(decoded, snapshot);
    }
}
