use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Info,
    Warning,
    Error,
}

impl AlertSeverity {
    pub fn as_str(self) -> &'static str {
        match self {
            AlertSeverity::Info => "info",
            AlertSeverity::Warning => "warning",
            AlertSeverity::Error => "error",
        }
    }
}

/// Something worth telling the AI client about on its next observe call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub severity: AlertSeverity,
    pub category: String,
    pub title: String,
    #[serde(default)]
    pub detail: String,
    pub timestamp: String,
    pub source: String,
    /// Number of duplicates folded into this alert when drained.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub count: u32,
}

fn is_zero(n: &u32) -> bool {
    *n == 0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CiFailure {
    pub name: String,
    #[serde(default)]
    pub message: String,
}

/// Body of `POST /ci-result`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CiResult {
    pub status: String,
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub commit: String,
    #[serde(default)]
    pub failures: Vec<CiFailure>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub received_at: Option<String>,
}
