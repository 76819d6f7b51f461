//! Before/after screenshot evidence for interact commands.
//!
//! A command is armed when it is queued: the mode decides whether a "before"
//! shot is taken right away. When the command result is first formatted the
//! "after" shot is taken (budget permitting) and the payload is frozen, so
//! every later read of the same command sees the same evidence.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use gasoline_types::PendingQuery;
use parking_lot::Mutex;
use serde_json::{Map as JsonMap, Value as JsonValue, json};
use tracing::{debug, warn};

use super::args::{Args, optional_string};
use super::commands::{QueryFailure, run_query};
use super::errors::ToolError;
use crate::app::AppState;

const CAPTURE_TIMEOUT: Duration = Duration::from_secs(12);
const RETRY_DELAY: Duration = Duration::from_millis(150);
/// Armed commands kept at once; the oldest is dropped first.
pub const MAX_TRACKED_COMMANDS: usize = 256;

const MUTATING_ACTIONS: &[&str] = &[
    "back",
    "check",
    "click",
    "execute_js",
    "focus",
    "forward",
    "highlight",
    "key_press",
    "navigate",
    "new_tab",
    "paste",
    "refresh",
    "scroll_to",
    "select",
    "set_attribute",
    "type",
    "upload",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvidenceMode {
    Off,
    OnMutation,
    Always,
}

impl EvidenceMode {
    pub fn as_str(self) -> &'static str {
        match self {
            EvidenceMode::Off => "off",
            EvidenceMode::OnMutation => "on_mutation",
            EvidenceMode::Always => "always",
        }
    }
}

pub fn parse_evidence_mode(args: &Args) -> Result<EvidenceMode, ToolError> {
    let Some(raw) = optional_string(args, "evidence")? else {
        return Ok(EvidenceMode::Off);
    };
    match raw.to_ascii_lowercase().as_str() {
        "off" => Ok(EvidenceMode::Off),
        "on_mutation" => Ok(EvidenceMode::OnMutation),
        "always" => Ok(EvidenceMode::Always),
        _ => Err(ToolError::invalid_param(
            "evidence",
            format!("Invalid evidence mode: {raw}"),
            "Use evidence='off', 'on_mutation' or 'always'",
        )
        .with_hint("Valid values: always, off, on_mutation")),
    }
}

pub fn is_mutating(action: &str) -> bool {
    MUTATING_ACTIONS.contains(&action.trim().to_ascii_lowercase().as_str())
}

/// One screenshot attempt.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Shot {
    pub path: Option<String>,
    pub filename: Option<String>,
    pub error: Option<String>,
    pub attempts: u32,
}

impl Shot {
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::default()
        }
    }

    pub fn saved(path: impl Into<String>, filename: impl Into<String>) -> Self {
        Self {
            path: Some(path.into()),
            filename: Some(filename.into()),
            ..Self::default()
        }
    }

    fn succeeded(&self) -> bool {
        self.path.as_deref().is_some_and(|p| !p.trim().is_empty())
    }
}

/// Takes one evidence screenshot.
#[async_trait]
pub trait EvidenceCapturer: Send + Sync {
    async fn capture(&self, state: &AppState, client_id: Option<&str>) -> Shot;
}

/// Asks the extension for a screenshot of the tracked tab and waits for the
/// upload to land on `/screenshot-result`.
pub struct ScreenshotCapturer;

#[async_trait]
impl EvidenceCapturer for ScreenshotCapturer {
    async fn capture(&self, state: &AppState, client_id: Option<&str>) -> Shot {
        if !state.store.tracking_status().tracking_enabled {
            return Shot::failed("no_tracked_tab");
        }
        let query = PendingQuery::new("screenshot", json!({}));
        let payload = match run_query(state, client_id, query, CAPTURE_TIMEOUT).await {
            Ok(payload) => payload,
            Err(QueryFailure::Timeout) => {
                return Shot::failed(format!(
                    "screenshot_timeout: no result within {}s",
                    CAPTURE_TIMEOUT.as_secs()
                ));
            }
            Err(QueryFailure::QueueFull(e)) => return Shot::failed(format!("screenshot_queue_full: {e}")),
        };
        let field = |key: &str| {
            payload
                .get(key)
                .and_then(JsonValue::as_str)
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        };
        if let Some(error) = field("error") {
            return Shot::failed(error);
        }
        match field("path") {
            Some(path) => Shot::saved(path, field("filename").unwrap_or_default()),
            None => Shot {
                filename: field("filename"),
                error: Some("screenshot_missing_path".to_string()),
                ..Shot::default()
            },
        }
    }
}

async fn capture_with_retry(state: &AppState, client_id: Option<&str>) -> Shot {
    let attempts = state.config.evidence.retry_count + 1;
    let mut last = Shot::failed("evidence_capture_not_attempted");
    for attempt in 1..=attempts {
        let mut shot = state.capturer.capture(state, client_id).await;
        shot.attempts = attempt;
        if shot.succeeded() {
            return shot;
        }
        if shot.error.as_deref().is_none_or(|e| e.trim().is_empty()) {
            shot.error = Some("evidence_capture_failed".to_string());
        }
        debug!(attempt, error = shot.error.as_deref().unwrap_or(""), "evidence capture failed");
        last = shot;
        if attempt < attempts {
            tokio::time::sleep(RETRY_DELAY).await;
        }
    }
    last
}

#[derive(Debug, Clone)]
struct CommandEvidence {
    mode: EvidenceMode,
    action: String,
    should_capture: bool,
    max_captures: u32,
    client_id: Option<String>,
    skipped: Option<&'static str>,
    before: Shot,
    after: Shot,
    frozen: Option<JsonMap<String, JsonValue>>,
}

impl CommandEvidence {
    fn payload(&self) -> JsonMap<String, JsonValue> {
        let mut payload = JsonMap::new();
        payload.insert("mode".into(), json!(self.mode.as_str()));
        payload.insert("action".into(), json!(self.action));
        if let Some(path) = &self.before.path {
            payload.insert("before".into(), json!(path));
        }
        if let Some(path) = &self.after.path {
            payload.insert("after".into(), json!(path));
        }

        let pair = |before: &Option<String>, after: &Option<String>| {
            let mut map = JsonMap::new();
            if let Some(v) = before.as_deref().filter(|v| !v.is_empty()) {
                map.insert("before".into(), json!(v));
            }
            if let Some(v) = after.as_deref().filter(|v| !v.is_empty()) {
                map.insert("after".into(), json!(v));
            }
            map
        };
        let filenames = pair(&self.before.filename, &self.after.filename);
        if !filenames.is_empty() {
            payload.insert("filenames".into(), JsonValue::Object(filenames));
        }
        let errors = pair(&self.before.error, &self.after.error);
        let has_errors = !errors.is_empty();
        if has_errors {
            payload.insert("errors".into(), JsonValue::Object(errors));
        }
        if let Some(skipped) = self.skipped {
            payload.insert("skipped".into(), json!(skipped));
        }
        if has_errors && (self.before.path.is_some() || self.after.path.is_some()) {
            payload.insert("partial".into(), json!(true));
        }
        payload
    }
}

#[derive(Default)]
struct TrackerInner {
    states: HashMap<String, CommandEvidence>,
    order: VecDeque<String>,
    evicted_unfinalized: u64,
}

/// Evidence state per correlation id, bounded to [`MAX_TRACKED_COMMANDS`].
#[derive(Default)]
pub struct EvidenceTracker {
    inner: Mutex<TrackerInner>,
}

impl EvidenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(&self, correlation_id: &str, evidence: CommandEvidence) {
        let mut inner = self.inner.lock();
        if inner
            .states
            .insert(correlation_id.to_string(), evidence)
            .is_none()
        {
            inner.order.push_back(correlation_id.to_string());
        }
        while inner.order.len() > MAX_TRACKED_COMMANDS {
            let Some(oldest) = inner.order.pop_front() else {
                break;
            };
            if let Some(dropped) = inner.states.remove(&oldest) {
                if dropped.frozen.is_none() {
                    inner.evicted_unfinalized += 1;
                    warn!(correlation_id = %oldest, "evicted evidence before its result was read");
                }
            }
        }
    }

    pub fn remove(&self, correlation_id: &str) {
        let mut inner = self.inner.lock();
        if inner.states.remove(correlation_id).is_some() {
            inner.order.retain(|id| id != correlation_id);
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Armed commands dropped before their evidence was ever delivered.
    pub fn evicted_unfinalized(&self) -> u64 {
        self.inner.lock().evicted_unfinalized
    }
}

/// Registers evidence for a freshly queued command, taking the "before" shot
/// when the mode asks for it.
pub async fn arm(
    state: &AppState,
    correlation_id: &str,
    action: &str,
    mode: EvidenceMode,
    client_id: Option<&str>,
) {
    if mode == EvidenceMode::Off {
        state.evidence.remove(correlation_id);
        return;
    }
    let action = action.trim().to_ascii_lowercase();
    let max_captures = state.config.evidence.max_captures;
    let mut should_capture = match mode {
        EvidenceMode::Always => true,
        EvidenceMode::OnMutation => is_mutating(&action),
        EvidenceMode::Off => false,
    };
    let mut skipped = (!should_capture).then_some("non_mutating_action");
    if should_capture && max_captures == 0 {
        should_capture = false;
        skipped = Some("capture_budget_zero");
    }
    let before = if should_capture {
        capture_with_retry(state, client_id).await
    } else {
        Shot::default()
    };
    state.evidence.insert(
        correlation_id,
        CommandEvidence {
            mode,
            action,
            should_capture,
            max_captures,
            client_id: client_id.map(str::to_string),
            skipped,
            before,
            after: Shot::default(),
            frozen: None,
        },
    );
}

/// Adds `evidence` to a command result payload. The first call takes the
/// "after" shot and freezes the payload.
pub async fn attach(state: &AppState, correlation_id: &str, response: &mut JsonMap<String, JsonValue>) {
    let (needs_after, client_id) = {
        let inner = state.evidence.inner.lock();
        let Some(evidence) = inner.states.get(correlation_id) else {
            return;
        };
        if let Some(frozen) = &evidence.frozen {
            response.insert("evidence".into(), JsonValue::Object(frozen.clone()));
            return;
        }
        (
            evidence.should_capture && evidence.max_captures > 1,
            evidence.client_id.clone(),
        )
    };

    let after = if needs_after {
        Some(capture_with_retry(state, client_id.as_deref()).await)
    } else {
        None
    };

    let mut inner = state.evidence.inner.lock();
    let Some(evidence) = inner.states.get_mut(correlation_id) else {
        return;
    };
    if evidence.frozen.is_none() {
        if let Some(after) = after {
            evidence.after = after;
        }
        evidence.frozen = Some(evidence.payload());
    }
    if let Some(frozen) = &evidence.frozen {
        response.insert("evidence".into(), JsonValue::Object(frozen.clone()));
    }
}
