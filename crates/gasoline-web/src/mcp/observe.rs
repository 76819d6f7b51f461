//! `observe`: read-only views of captured browser state.

use std::cmp::Reverse;
use std::time::Duration;

use chrono::{DateTime, Utc};
use gasoline_capture::Category;
use gasoline_capture::time::{from_epoch_ms, parse_timestamp, rfc3339};
use gasoline_types::{
    EnhancedAction, LogEntry, LogLevel, NetworkBody, NetworkWaterfallEntry, PendingQuery,
    WebSocketEvent,
};
use serde::Serialize;
use serde_json::{Value as JsonValue, json};

use super::CallContext;
use super::args::{
    Args, clamp_limit, clamp_or_default, limit, optional_i64, optional_string,
    optional_string_list, required_string, select_mode,
};
use super::commands::{QueryFailure, format_command_result, run_query};
use super::errors::{ErrorCode, ToolError};
use super::response::{ToolOutcome, json_response, markdown_response, markdown_table, truncate_chars};
use crate::app::AppState;

pub const MODES: &[&str] = &[
    "actions",
    "command_result",
    "error_bundles",
    "errors",
    "extension_logs",
    "failed_commands",
    "logs",
    "network_bodies",
    "network_waterfall",
    "page",
    "pending_commands",
    "pilot",
    "screenshot",
    "tabs",
    "timeline",
    "vitals",
    "websocket_events",
    "websocket_status",
];

const SCREENSHOT_WAIT: Duration = Duration::from_secs(20);
const WATERFALL_WAIT: Duration = Duration::from_secs(5);
const WATERFALL_FRESH: chrono::Duration = chrono::Duration::seconds(1);
const DEFAULT_TIMELINE_LIMIT: i64 = 50;
const DEFAULT_BUNDLE_LIMIT: i64 = 5;
const MAX_BUNDLES: i64 = 50;
const DEFAULT_BUNDLE_WINDOW_SECS: i64 = 3;
const MAX_BUNDLE_WINDOW_SECS: i64 = 10;
const TIMELINE_SUMMARY_CHARS: usize = 80;

pub async fn observe(ctx: &CallContext, args: &Args) -> ToolOutcome {
    match select_mode(args, &["what"], MODES, "observe")? {
        "actions" => actions(ctx, args),
        "command_result" => command_result(ctx, args).await,
        "error_bundles" => error_bundles(ctx, args),
        "errors" => errors(ctx, args),
        "extension_logs" => extension_logs(ctx, args),
        "failed_commands" => failed_commands(ctx),
        "logs" => logs(ctx, args),
        "network_bodies" => network_bodies(ctx, args),
        "network_waterfall" => network_waterfall(ctx, args).await,
        "page" => page(ctx),
        "pending_commands" => pending_commands(ctx),
        "pilot" => pilot(ctx),
        "screenshot" => screenshot(ctx, args).await,
        "tabs" => tabs(ctx),
        "timeline" => timeline(ctx, args),
        "vitals" => vitals(ctx),
        "websocket_events" => websocket_events(ctx, args),
        "websocket_status" => websocket_status(ctx, args),
        other => Err(ToolError::internal(format!("observe mode {other} has no handler"))),
    }
}

#[derive(Debug, Serialize)]
pub struct Metadata {
    pub retrieved_at: String,
    pub is_stale: bool,
    /// Age of the newest entry, `"12.3s"`, or `no_data`.
    pub data_age: String,
}

pub fn metadata(state: &AppState, newest: Option<DateTime<Utc>>) -> Metadata {
    let now = Utc::now();
    Metadata {
        retrieved_at: rfc3339(now),
        is_stale: !state.store.connectivity().connected,
        data_age: match newest {
            Some(t) => format!("{:.1}s", (now - t).num_milliseconds().max(0) as f64 / 1000.0),
            None => "no_data".to_string(),
        },
    }
}

fn buffer_metadata(ctx: &CallContext, category: Category) -> Metadata {
    metadata(&ctx.state, ctx.state.store.last_write(category))
}

fn contains_ci(haystack: &str, needle: &str) -> bool {
    haystack.to_lowercase().contains(&needle.to_lowercase())
}

fn parse_level(args: &Args, field: &str) -> Result<Option<LogLevel>, ToolError> {
    optional_string(args, field)?
        .map(|raw| {
            raw.to_ascii_lowercase().parse::<LogLevel>().map_err(|_| {
                ToolError::invalid_param(
                    field,
                    format!("Invalid {field}: {raw}"),
                    format!("Use one of debug, log, info, warn, error for '{field}'"),
                )
            })
        })
        .transpose()
}

/// `scope=current_page` narrows to the tracked tab.
#[derive(Debug, Clone, Default)]
struct PageScope {
    tab_id: Option<i64>,
    url: Option<String>,
}

impl PageScope {
    fn from_args(ctx: &CallContext, args: &Args) -> Result<Option<Self>, ToolError> {
        match optional_string(args, "scope")?.as_deref() {
            None | Some("all") => Ok(None),
            Some("current_page") => {
                let tracking = ctx.state.store.tracking_status();
                Ok(Some(Self {
                    tab_id: tracking.tracked_tab_id,
                    url: tracking.tracked_tab_url,
                }))
            }
            Some(other) => Err(ToolError::invalid_param(
                "scope",
                format!("Invalid scope: {other}"),
                "Use scope='current_page' or scope='all'",
            )),
        }
    }

    fn matches(&self, entry: &LogEntry) -> bool {
        if let (Some(want), Some(got)) = (self.tab_id, entry.tab_id) {
            return want == got;
        }
        match (&self.url, &entry.url) {
            (Some(page), Some(url)) => url.starts_with(page.as_str()),
            _ => true,
        }
    }
}

struct LogFilter {
    level: Option<LogLevel>,
    min_level: Option<LogLevel>,
    source: Option<String>,
    url: Option<String>,
    tab_id: Option<i64>,
    scope: Option<PageScope>,
}

impl LogFilter {
    fn from_args(ctx: &CallContext, args: &Args) -> Result<Self, ToolError> {
        Ok(Self {
            level: parse_level(args, "level")?,
            min_level: parse_level(args, "min_level")?,
            source: optional_string(args, "source")?,
            url: optional_string(args, "url")?,
            tab_id: optional_i64(args, "tab_id")?,
            scope: PageScope::from_args(ctx, args)?,
        })
    }

    fn matches(&self, entry: &LogEntry) -> bool {
        if entry.is_internal() {
            return false;
        }
        if self.level.is_some_and(|l| entry.level != l) {
            return false;
        }
        if self.min_level.is_some_and(|l| entry.level.rank() < l.rank()) {
            return false;
        }
        if let Some(source) = &self.source {
            if !entry.source.as_deref().is_some_and(|s| s.contains(source.as_str())) {
                return false;
            }
        }
        if let Some(url) = &self.url {
            if !entry.url.as_deref().is_some_and(|u| contains_ci(u, url)) {
                return false;
            }
        }
        if self.tab_id.is_some() && entry.tab_id != self.tab_id {
            return false;
        }
        self.scope.as_ref().is_none_or(|scope| scope.matches(entry))
    }
}

fn wants_markdown(args: &Args) -> Result<bool, ToolError> {
    match optional_string(args, "format")?.as_deref() {
        None | Some("json") => Ok(false),
        Some("markdown") => Ok(true),
        Some(other) => Err(ToolError::invalid_param(
            "format",
            format!("Invalid format: {other}"),
            "Use format='json' or format='markdown'",
        )),
    }
}

fn log_table(entries: &[LogEntry]) -> String {
    let rows: Vec<Vec<String>> = entries
        .iter()
        .map(|e| {
            vec![
                e.timestamp.clone().unwrap_or_default(),
                e.level.to_string(),
                truncate_chars(e.message_str(), 200),
                e.source.clone().or_else(|| e.url.clone()).unwrap_or_default(),
            ]
        })
        .collect();
    markdown_table(&["Time", "Level", "Message", "Source"], &rows)
}

fn errors(ctx: &CallContext, args: &Args) -> ToolOutcome {
    let mut filter = LogFilter::from_args(ctx, args)?;
    filter.level = Some(LogLevel::Error);
    filter.min_level = None;
    let limit = limit(args)?;
    let markdown = wants_markdown(args)?;
    let scope = if filter.scope.is_some() { "current_page" } else { "all" };
    let errors: Vec<LogEntry> = ctx
        .state
        .store
        .console_entries()
        .into_iter()
        .rev()
        .filter(|e| filter.matches(e))
        .take(limit)
        .collect();
    if markdown {
        return markdown_response(&format!("Browser errors ({})", errors.len()), &log_table(&errors));
    }
    json_response(
        "Browser errors",
        &json!({
            "errors": errors,
            "count": errors.len(),
            "scope": scope,
            "metadata": buffer_metadata(ctx, Category::Console),
        }),
    )
}

fn logs(ctx: &CallContext, args: &Args) -> ToolOutcome {
    let filter = LogFilter::from_args(ctx, args)?;
    let limit = limit(args)?;
    let markdown = wants_markdown(args)?;
    let logs: Vec<LogEntry> = ctx
        .state
        .store
        .console_entries()
        .into_iter()
        .rev()
        .filter(|e| filter.matches(e))
        .take(limit)
        .collect();
    if markdown {
        return markdown_response(&format!("Browser logs ({})", logs.len()), &log_table(&logs));
    }
    json_response(
        "Browser logs",
        &json!({
            "logs": logs,
            "count": logs.len(),
            "metadata": buffer_metadata(ctx, Category::Console),
        }),
    )
}

fn extension_logs(ctx: &CallContext, args: &Args) -> ToolOutcome {
    let level = optional_string(args, "level")?;
    let limit = limit(args)?;
    let logs: Vec<_> = ctx
        .state
        .store
        .extension_logs()
        .into_iter()
        .rev()
        .filter(|e| level.as_deref().is_none_or(|l| e.level.eq_ignore_ascii_case(l)))
        .take(limit)
        .collect();
    json_response(
        "Extension logs",
        &json!({
            "logs": logs,
            "count": logs.len(),
            "metadata": buffer_metadata(ctx, Category::ExtensionLogs),
        }),
    )
}

fn network_bodies(ctx: &CallContext, args: &Args) -> ToolOutcome {
    let url = optional_string(args, "url")?;
    let method = optional_string(args, "method")?;
    let status_min = optional_i64(args, "status_min")?;
    let status_max = optional_i64(args, "status_max")?;
    let limit = limit(args)?;
    let entries: Vec<NetworkBody> = ctx
        .state
        .store
        .network_bodies()
        .into_iter()
        .rev()
        .filter(|b| url.as_deref().is_none_or(|u| contains_ci(&b.url, u)))
        .filter(|b| method.as_deref().is_none_or(|m| b.method.eq_ignore_ascii_case(m)))
        .filter(|b| status_min.is_none_or(|min| b.status >= min))
        .filter(|b| status_max.is_none_or(|max| b.status <= max))
        .take(limit)
        .collect();
    json_response(
        "Network bodies",
        &json!({
            "entries": entries,
            "count": entries.len(),
            "metadata": buffer_metadata(ctx, Category::Network),
        }),
    )
}

fn websocket_events(ctx: &CallContext, args: &Args) -> ToolOutcome {
    let url = optional_string(args, "url")?;
    let connection_id = optional_string(args, "connection_id")?;
    let direction = optional_string(args, "direction")?;
    if let Some(d) = direction.as_deref() {
        if d != "incoming" && d != "outgoing" {
            return Err(ToolError::invalid_param(
                "direction",
                format!("Invalid direction: {d}"),
                "Use direction='incoming' or direction='outgoing'",
            ));
        }
    }
    let limit = limit(args)?;
    let events: Vec<WebSocketEvent> = ctx
        .state
        .store
        .websocket_events()
        .into_iter()
        .rev()
        .filter(|e| url.as_deref().is_none_or(|u| contains_ci(&e.url, u)))
        .filter(|e| connection_id.as_deref().is_none_or(|id| e.id == id))
        .filter(|e| {
            direction
                .as_deref()
                .is_none_or(|d| e.direction.is_some_and(|ed| ed.as_str() == d))
        })
        .take(limit)
        .collect();
    json_response(
        "WebSocket events",
        &json!({
            "events": events,
            "count": events.len(),
            "metadata": buffer_metadata(ctx, Category::WebSocket),
        }),
    )
}

fn websocket_status(ctx: &CallContext, args: &Args) -> ToolOutcome {
    let url = optional_string(args, "url")?;
    let connection_id = optional_string(args, "connection_id")?;
    let status = ctx
        .state
        .store
        .websocket_status(url.as_deref(), connection_id.as_deref());
    json_response(
        "WebSocket status",
        &json!({
            "connections": status.connections,
            "closed": status.closed,
            "active_count": status.connections.len(),
            "closed_count": status.closed.len(),
            "metadata": metadata(&ctx.state, Some(Utc::now())),
        }),
    )
}

fn actions(ctx: &CallContext, args: &Args) -> ToolOutcome {
    let url = optional_string(args, "url")?;
    let limit = limit(args)?;
    let actions: Vec<EnhancedAction> = ctx
        .state
        .store
        .actions()
        .into_iter()
        .rev()
        .filter(|a| url.as_deref().is_none_or(|u| contains_ci(&a.url, u)))
        .take(limit)
        .collect();
    json_response(
        "Enhanced actions",
        &json!({
            "entries": actions,
            "count": actions.len(),
            "metadata": buffer_metadata(ctx, Category::Actions),
        }),
    )
}

/// Asks the extension for a fresh waterfall when the buffer is empty or
/// older than a second. Falls back to what is stored.
async fn refresh_waterfall(ctx: &CallContext) -> Vec<NetworkWaterfallEntry> {
    let store = &ctx.state.store;
    let fresh = store
        .last_write(Category::Waterfall)
        .is_some_and(|t| Utc::now() - t < WATERFALL_FRESH);
    if fresh || !store.connectivity().connected {
        return store.waterfall();
    }
    let query = PendingQuery::new("waterfall", json!({}));
    if let Ok(payload) = run_query(&ctx.state, ctx.client(), query, WATERFALL_WAIT).await {
        let entries = payload
            .get("entries")
            .and_then(JsonValue::as_array)
            .cloned()
            .unwrap_or_default();
        let page_url = payload
            .get("page_url")
            .and_then(JsonValue::as_str)
            .unwrap_or_default();
        if !entries.is_empty() {
            store.add_waterfall(entries, page_url);
        }
    }
    store.waterfall()
}

async fn network_waterfall(ctx: &CallContext, args: &Args) -> ToolOutcome {
    let url = optional_string(args, "url")?;
    let limit = limit(args)?;
    let entries: Vec<NetworkWaterfallEntry> = refresh_waterfall(ctx)
        .await
        .into_iter()
        .rev()
        .filter(|e| url.as_deref().is_none_or(|u| !e.url.is_empty() && contains_ci(&e.url, u)))
        .take(limit)
        .collect();
    json_response(
        "Network waterfall",
        &json!({
            "entries": entries,
            "count": entries.len(),
            "metadata": buffer_metadata(ctx, Category::Waterfall),
        }),
    )
}

fn vitals(ctx: &CallContext) -> ToolOutcome {
    let metrics = match ctx.state.store.performance_snapshots().last() {
        None => json!({ "has_data": false }),
        Some(latest) => {
            let mut m = json!({
                "has_data": true,
                "url": latest.url,
                "timestamp": latest.timestamp,
                "domContentLoaded": latest.timing.dom_content_loaded,
                "load": latest.timing.load,
            });
            if let Some(lcp) = latest.timing.lcp {
                m["lcp"] = json!(lcp);
            }
            if let Some(fcp) = latest.timing.fcp {
                m["fcp"] = json!(fcp);
            }
            if let Some(inp) = latest.timing.inp {
                m["inp"] = json!(inp);
            }
            if let Some(cls) = latest.cls {
                m["cls"] = json!(cls);
            }
            m
        }
    };
    json_response(
        "Web vitals",
        &json!({
            "metrics": metrics,
            "metadata": buffer_metadata(ctx, Category::Performance),
        }),
    )
}

fn page(ctx: &CallContext) -> ToolOutcome {
    let store = &ctx.state.store;
    let tracking = store.tracking_status();
    let url = tracking
        .tracked_tab_url
        .clone()
        .filter(|u| !u.is_empty())
        .or_else(|| store.waterfall().last().map(|e| e.page_url.clone()))
        .unwrap_or_default();
    let title = store
        .console_entries()
        .iter()
        .rev()
        .find_map(|e| e.extra.get("title").and_then(JsonValue::as_str).map(str::to_string))
        .unwrap_or_default();
    let mut body = json!({
        "url": url,
        "title": title,
        "tracked": tracking.tracking_enabled,
        "metadata": metadata(&ctx.state, Some(Utc::now())),
    });
    if let Some(tab_id) = tracking.tracked_tab_id.filter(|id| *id > 0) {
        body["tab_id"] = json!(tab_id);
    }
    json_response("Page info", &body)
}

fn tabs(ctx: &CallContext) -> ToolOutcome {
    let tracking = ctx.state.store.tracking_status();
    let tabs: Vec<JsonValue> = match tracking.tracked_tab_id {
        Some(id) if tracking.tracking_enabled && id > 0 => vec![json!({
            "id": id,
            "url": tracking.tracked_tab_url.clone().unwrap_or_default(),
            "tracked": true,
            "active": true,
        })],
        _ => Vec::new(),
    };
    json_response(
        "Tabs",
        &json!({
            "tabs": tabs,
            "tracking_active": tracking.tracking_enabled,
            "metadata": metadata(&ctx.state, Some(Utc::now())),
        }),
    )
}

fn pilot(ctx: &CallContext) -> ToolOutcome {
    let store = &ctx.state.store;
    let tracking = store.tracking_status();
    let connectivity = store.connectivity();
    let readiness = match store.pilot_readiness() {
        gasoline_capture::PilotReadiness::Ready => "ready",
        gasoline_capture::PilotReadiness::Disabled => "disabled",
        gasoline_capture::PilotReadiness::NeverConnected => "never_connected",
    };
    json_response(
        "Pilot status",
        &json!({
            "enabled": tracking.pilot_enabled,
            "status": readiness,
            "extension_connected": connectivity.connected,
            "extension_status": connectivity.status,
            "extension_version": tracking.extension_version,
            "last_update": tracking.updated_at,
            "metadata": metadata(&ctx.state, connectivity.last_seen),
        }),
    )
}

#[derive(Debug, Serialize)]
struct TimelineEntry {
    timestamp: String,
    #[serde(rename = "type")]
    kind: &'static str,
    summary: String,
}

fn timeline_summary(text: &str) -> String {
    if text.chars().count() > TIMELINE_SUMMARY_CHARS {
        let cut: String = text.chars().take(TIMELINE_SUMMARY_CHARS).collect();
        format!("{cut}...")
    } else {
        text.to_string()
    }
}

fn timeline(ctx: &CallContext, args: &Args) -> ToolOutcome {
    let limit = match optional_i64(args, "limit")? {
        None => clamp_limit(Some(DEFAULT_TIMELINE_LIMIT)),
        raw => clamp_limit(raw),
    };
    let include = optional_string_list(args, "include")?.unwrap_or_default();
    let wants = |kind: &str| include.is_empty() || include.iter().any(|i| i == kind);
    let store = &ctx.state.store;
    let mut entries: Vec<(Option<DateTime<Utc>>, TimelineEntry)> = Vec::new();

    if wants("actions") {
        for action in store.actions() {
            let at = from_epoch_ms(action.timestamp);
            let target = action
                .selectors
                .get("css")
                .and_then(JsonValue::as_str)
                .unwrap_or_default();
            entries.push((
                at,
                TimelineEntry {
                    timestamp: at.map(rfc3339).unwrap_or_default(),
                    kind: "action",
                    summary: format!("{} on {target}", action.kind),
                },
            ));
        }
    }
    if wants("errors") {
        for entry in store.console_entries() {
            if entry.level != LogLevel::Error || entry.is_internal() {
                continue;
            }
            let timestamp = entry.timestamp.clone().unwrap_or_default();
            entries.push((
                parse_timestamp(&timestamp),
                TimelineEntry {
                    timestamp,
                    kind: "error",
                    summary: timeline_summary(entry.message_str()),
                },
            ));
        }
    }
    if wants("network") {
        for body in store.network_bodies() {
            entries.push((
                parse_timestamp(&body.timestamp),
                TimelineEntry {
                    timestamp: body.timestamp.clone(),
                    kind: "network",
                    summary: timeline_summary(&format!("{} {} → {}", body.method, body.url, body.status)),
                },
            ));
        }
    }
    if wants("websocket") {
        for event in store.websocket_events() {
            entries.push((
                parse_timestamp(&event.timestamp),
                TimelineEntry {
                    timestamp: event.timestamp.clone(),
                    kind: "websocket",
                    summary: timeline_summary(&format!("{} {}", event.event.as_str(), event.url)),
                },
            ));
        }
    }

    entries.sort_by_key(|(at, _)| Reverse(*at));
    let entries: Vec<TimelineEntry> = entries.into_iter().take(limit).map(|(_, e)| e).collect();
    json_response(
        "Timeline",
        &json!({
            "entries": entries,
            "count": entries.len(),
            "metadata": metadata(&ctx.state, Some(Utc::now())),
        }),
    )
}

#[derive(Debug, Serialize)]
struct ErrorBundle {
    error: LogEntry,
    network: Vec<NetworkBody>,
    waterfall: Vec<NetworkWaterfallEntry>,
    actions: Vec<EnhancedAction>,
    logs: Vec<LogEntry>,
    context_window_seconds: i64,
}

/// Each recent error joined with the network, action and log activity in
/// the seconds leading up to it. Both window ends are inclusive.
fn error_bundles(ctx: &CallContext, args: &Args) -> ToolOutcome {
    let limit = clamp_or_default(optional_i64(args, "limit")?, DEFAULT_BUNDLE_LIMIT, 1, MAX_BUNDLES) as usize;
    let window_secs = clamp_or_default(
        optional_i64(args, "window_seconds")?,
        DEFAULT_BUNDLE_WINDOW_SECS,
        1,
        MAX_BUNDLE_WINDOW_SECS,
    );
    let url = optional_string(args, "url")?;
    let window = chrono::Duration::seconds(window_secs);
    let store = &ctx.state.store;

    let console = store.console_entries();
    let network = store.network_bodies();
    let waterfall = store.waterfall();
    let actions = store.actions();

    let errors: Vec<(&LogEntry, DateTime<Utc>)> = console
        .iter()
        .rev()
        .filter(|e| e.level == LogLevel::Error && !e.is_internal())
        .filter(|e| url.as_deref().is_none_or(|u| e.url.as_deref().is_some_and(|eu| contains_ci(eu, u))))
        .filter_map(|e| Some((e, parse_timestamp(e.timestamp.as_deref()?)?)))
        .take(limit)
        .collect();

    let bundles: Vec<ErrorBundle> = errors
        .into_iter()
        .map(|(error, at)| {
            let start = at - window;
            let within = |t: Option<DateTime<Utc>>| t.is_some_and(|t| t >= start && t <= at);
            ErrorBundle {
                error: error.clone(),
                network: network
                    .iter()
                    .filter(|b| within(parse_timestamp(&b.timestamp)))
                    .cloned()
                    .collect(),
                waterfall: waterfall
                    .iter()
                    .filter(|w| within(w.server_timestamp.as_deref().and_then(parse_timestamp)))
                    .cloned()
                    .collect(),
                actions: actions
                    .iter()
                    .filter(|a| within(from_epoch_ms(a.timestamp)))
                    .cloned()
                    .collect(),
                logs: console
                    .iter()
                    .filter(|l| l.level != LogLevel::Error && !l.is_internal())
                    .filter(|l| within(l.timestamp.as_deref().and_then(parse_timestamp)))
                    .cloned()
                    .collect(),
                context_window_seconds: window_secs,
            }
        })
        .collect();

    json_response(
        "Error bundles",
        &json!({
            "bundles": bundles,
            "count": bundles.len(),
            "metadata": buffer_metadata(ctx, Category::Console),
        }),
    )
}

pub(super) async fn screenshot(ctx: &CallContext, args: &Args) -> ToolOutcome {
    let format = optional_string(args, "format")?.unwrap_or_else(|| "jpeg".to_string());
    if format != "png" && format != "jpeg" {
        return Err(ToolError::invalid_param(
            "format",
            format!("Invalid screenshot format: {format}"),
            "Use format='png' or format='jpeg'",
        ));
    }
    let quality = optional_i64(args, "quality")?;
    if let Some(q) = quality {
        if !(1..=100).contains(&q) {
            return Err(ToolError::invalid_param(
                "quality",
                format!("quality must be between 1 and 100, got {q}"),
                "Pass an integer quality from 1 to 100",
            ));
        }
    }
    let tracking = ctx.state.store.tracking_status();
    if !tracking.tracking_enabled {
        return Err(ToolError::new(
            ErrorCode::NoData,
            "No tab is being tracked",
            "Enable tracking on a tab from the Gasoline extension popup, then retry",
        ));
    }
    let mut params = json!({ "format": format });
    if let Some(q) = quality {
        params["quality"] = json!(q);
    }
    let query = PendingQuery::new("screenshot", params).with_tab(tracking.tracked_tab_id);
    let payload = run_query(&ctx.state, ctx.client(), query, SCREENSHOT_WAIT)
        .await
        .map_err(|e: QueryFailure| e.into_tool_error("screenshot", SCREENSHOT_WAIT))?;
    if let Some(error) = payload.get("error").and_then(JsonValue::as_str).filter(|e| !e.is_empty()) {
        return Err(ToolError::new(
            ErrorCode::ExtError,
            format!("Screenshot failed: {error}"),
            "Make sure the tracked tab is visible, then retry",
        ));
    }
    json_response("Screenshot captured", &payload)
}

async fn command_result(ctx: &CallContext, args: &Args) -> ToolOutcome {
    let id = required_string(
        args,
        "correlation_id",
        "Add the 'correlation_id' parameter and call again",
    )?;
    let Some(cmd) = ctx.state.store.correlator().command_for(&id, ctx.client()) else {
        return Err(ToolError::new(
            ErrorCode::NoData,
            format!("Command not found: {id}"),
            "The command may have already completed and been cleaned up (60s TTL), or the correlation_id is invalid. Use observe with what='pending_commands' to see active commands.",
        ));
    };
    format_command_result(&ctx.state, cmd).await
}

fn pending_commands(ctx: &CallContext) -> ToolOutcome {
    let correlator = ctx.state.store.correlator();
    let pending = correlator.pending_commands(ctx.client());
    let completed = correlator.completed_commands(ctx.client());
    let failed = correlator.failed_commands(ctx.client());
    json_response(
        &format!(
            "Pending: {}, Completed: {}, Failed: {}",
            pending.len(),
            completed.len(),
            failed.len()
        ),
        &json!({
            "pending": pending,
            "completed": completed,
            "failed": failed,
        }),
    )
}

fn failed_commands(ctx: &CallContext) -> ToolOutcome {
    let failed = ctx.state.store.correlator().failed_commands(ctx.client());
    let summary = if failed.is_empty() {
        "No failed commands found".to_string()
    } else {
        format!("Found {} failed/expired commands", failed.len())
    };
    json_response(
        &summary,
        &json!({
            "status": "ok",
            "commands": failed,
            "count": failed.len(),
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::response::{first_text, is_failure, joined_text};
    use crate::config::Config;
    use chrono::SecondsFormat;

    fn ctx() -> (CallContext, tempfile::TempDir) {
        let dir = tempfile::tempdir().expect("tempdir");
        let state = AppState::new(Config::for_tests(dir.path()));
        (CallContext::new(state, None), dir)
    }

    fn args(v: JsonValue) -> Args {
        v.as_object().cloned().expect("object")
    }

    fn body(outcome: ToolOutcome) -> JsonValue {
        let result = outcome.expect("tool result");
        assert!(!is_failure(&result), "{}", joined_text(&result));
        let text = first_text(&result);
        serde_json::from_str(text.split_once('\n').expect("summary").1).expect("json body")
    }

    fn ts(t: DateTime<Utc>) -> String {
        t.to_rfc3339_opts(SecondsFormat::Nanos, true)
    }

    #[tokio::test]
    async fn logs_filter_internal_kinds_and_levels() {
        let (ctx, _dir) = ctx();
        ctx.state.store.add_logs(vec![
            json!({"level": "info", "message": "hello", "source": "app.js"}),
            json!({"level": "warn", "message": "careful", "source": "lib/vendor.js"}),
            json!({"level": "error", "message": "boom", "source": "app.js"}),
            json!({"level": "info", "type": "lifecycle", "message": "tab tracked"}),
        ]);
        let all = body(observe(&ctx, &args(json!({"what": "logs"}))).await);
        assert_eq!(all["count"], 3);
        assert_eq!(all["logs"][0]["message"], "boom");

        let warn_up = body(observe(&ctx, &args(json!({"what": "logs", "min_level": "warn"}))).await);
        assert_eq!(warn_up["count"], 2);

        let vendor = body(observe(&ctx, &args(json!({"what": "logs", "source": "vendor"}))).await);
        assert_eq!(vendor["count"], 1);

        let errors = body(observe(&ctx, &args(json!({"what": "errors"}))).await);
        assert_eq!(errors["count"], 1);
        assert_eq!(errors["scope"], "all");

        let err = observe(&ctx, &args(json!({"what": "logs", "level": "fatal"})))
            .await
            .expect_err("bad level");
        assert_eq!(err.code, ErrorCode::InvalidParam);
    }

    #[tokio::test]
    async fn unknown_mode_lists_valid_modes() {
        let (ctx, _dir) = ctx();
        let err = observe(&ctx, &args(json!({"what": "everything"})))
            .await
            .expect_err("unknown");
        assert_eq!(err.code, ErrorCode::UnknownMode);
        assert!(err.hint.as_deref().expect("hint").contains("error_bundles"));
    }

    #[tokio::test]
    async fn error_bundle_window_includes_only_recent_context() {
        let (ctx, _dir) = ctx();
        let store = &ctx.state.store;
        let t = from_epoch_ms(Utc::now().timestamp_millis()).expect("now");
        store.add_network_bodies(vec![json!({
            "timestamp": ts(t - chrono::Duration::seconds(1)),
            "method": "GET",
            "url": "https://api.test/items",
            "status": 500,
        })]);
        store.add_actions(vec![
            json!({"type": "click", "timestamp": (t - chrono::Duration::seconds(2)).timestamp_millis(), "url": "https://app.test/"}),
            json!({"type": "input", "timestamp": (t - chrono::Duration::seconds(5)).timestamp_millis(), "url": "https://app.test/"}),
        ]);
        store.add_logs(vec![json!({"level": "error", "message": "request failed", "timestamp": ts(t)})]);

        let narrow = body(
            observe(&ctx, &args(json!({"what": "error_bundles", "window_seconds": 3, "limit": 5}))).await,
        );
        assert_eq!(narrow["count"], 1);
        assert_eq!(narrow["bundles"][0]["network"].as_array().expect("network").len(), 1);
        assert_eq!(narrow["bundles"][0]["actions"].as_array().expect("actions").len(), 1);
        assert_eq!(narrow["bundles"][0]["context_window_seconds"], 3);

        let wide = body(
            observe(&ctx, &args(json!({"what": "error_bundles", "window_seconds": 5, "limit": 5}))).await,
        );
        assert_eq!(wide["bundles"][0]["actions"].as_array().expect("actions").len(), 2);
    }

    #[tokio::test]
    async fn network_bodies_filters() {
        let (ctx, _dir) = ctx();
        ctx.state.store.add_network_bodies(vec![
            json!({"method": "GET", "url": "https://a.test/ok", "status": 200}),
            json!({"method": "POST", "url": "https://a.test/fail", "status": 502}),
        ]);
        let failed = body(observe(&ctx, &args(json!({"what": "network_bodies", "status_min": 400}))).await);
        assert_eq!(failed["count"], 1);
        assert_eq!(failed["entries"][0]["url"], "https://a.test/fail");
        let posts = body(observe(&ctx, &args(json!({"what": "network_bodies", "method": "post"}))).await);
        assert_eq!(posts["count"], 1);
    }

    #[tokio::test]
    async fn timeline_is_newest_first() {
        let (ctx, _dir) = ctx();
        let t = Utc::now();
        ctx.state.store.add_logs(vec![json!({
            "level": "error",
            "message": "x".repeat(120),
            "timestamp": ts(t),
        })]);
        ctx.state.store.add_actions(vec![json!({
            "type": "click",
            "timestamp": (t - chrono::Duration::seconds(1)).timestamp_millis(),
            "selectors": {"css": "#go"},
        })]);
        let timeline = body(observe(&ctx, &args(json!({"what": "timeline"}))).await);
        assert_eq!(timeline["count"], 2);
        assert_eq!(timeline["entries"][0]["type"], "error");
        assert!(timeline["entries"][0]["summary"].as_str().expect("summary").ends_with("..."));
        assert_eq!(timeline["entries"][1]["summary"], "click on #go");
    }

    #[tokio::test]
    async fn screenshot_requires_tracking() {
        let (ctx, _dir) = ctx();
        let err = observe(&ctx, &args(json!({"what": "screenshot"})))
            .await
            .expect_err("no tab");
        assert_eq!(err.code, ErrorCode::NoData);
        let err = observe(&ctx, &args(json!({"what": "screenshot", "quality": 0})))
            .await
            .expect_err("quality");
        assert_eq!(err.code, ErrorCode::InvalidParam);
    }

    #[tokio::test]
    async fn metadata_reports_no_data_for_empty_buffers() {
        let (ctx, _dir) = ctx();
        let vitals = body(observe(&ctx, &args(json!({"what": "vitals"}))).await);
        assert_eq!(vitals["metrics"]["has_data"], false);
        assert_eq!(vitals["metadata"]["data_age"], "no_data");
        assert_eq!(vitals["metadata"]["is_stale"], true);
    }
}
