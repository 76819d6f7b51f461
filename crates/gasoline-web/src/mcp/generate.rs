//! `generate`: artifacts built from captured data. Playwright reproductions
//! and tests from recorded actions, HAR from network bodies, and a Markdown
//! session summary for pull requests.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::{Component, Path};

use axum::http::StatusCode;
use gasoline_capture::time::now_rfc3339;
use gasoline_types::{EnhancedAction, LogLevel, NetworkBody};
use serde::Serialize;
use serde_json::{Map as JsonMap, Value as JsonValue, json};
use tracing::{info, warn};

use super::CallContext;
use super::args::{Args, optional_bool, optional_i64, optional_string, select_mode};
use super::errors::{ErrorCode, ToolError};
use super::response::{ToolOutcome, json_response, truncate_chars};
use crate::config::VERSION;

pub const MODES: &[&str] = &["har", "pr_summary", "reproduction", "test"];

const MAX_SCRIPT_BYTES: usize = 200 * 1024;
/// Gaps longer than this between two actions are written as a pause comment.
const PAUSE_THRESHOLD_MS: i64 = 2000;
const REDACTED_VALUE: &str = "[redacted]";

pub async fn generate(ctx: &CallContext, args: &Args) -> ToolOutcome {
    match select_mode(args, &["format", "what"], MODES, "generate")? {
        "har" => har(ctx, args),
        "pr_summary" => pr_summary(ctx),
        "reproduction" => reproduction(ctx, args),
        "test" => test(ctx, args),
        other => Err(ToolError::internal(format!("generate format {other} has no handler"))),
    }
}

fn last_n(actions: Vec<EnhancedAction>, n: Option<i64>) -> Vec<EnhancedAction> {
    match n {
        Some(n) if n > 0 && (n as usize) < actions.len() => {
            let skip = actions.len() - n as usize;
            actions.into_iter().skip(skip).collect()
        }
        _ => actions,
    }
}

fn escape_js(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\'' => out.push_str("\\'"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c => out.push(c),
        }
    }
    out
}

/// Replaces the origin of `original` with `base`, keeping path and query.
fn rebase_url(original: &str, base: &str) -> String {
    match url::Url::parse(original) {
        Ok(parsed) => {
            let mut out = format!("{}{}", base.trim_end_matches('/'), parsed.path());
            if let Some(query) = parsed.query() {
                let _ = write!(out, "?{query}");
            }
            out
        }
        Err(_) => original.to_string(),
    }
}

fn user_value(action: &EnhancedAction) -> &str {
    match action.value.as_deref() {
        Some(REDACTED_VALUE) => "[user-provided]",
        Some(v) => v,
        None => "",
    }
}

fn selector_str<'a>(selectors: &'a JsonMap<String, JsonValue>, key: &str) -> Option<&'a str> {
    selectors
        .get(key)
        .and_then(JsonValue::as_str)
        .filter(|s| !s.is_empty())
}

/// Best Playwright locator: testId, then role, ariaLabel, text, id, css.
fn playwright_locator(selectors: &JsonMap<String, JsonValue>) -> Option<String> {
    if let Some(test_id) = selector_str(selectors, "testId") {
        return Some(format!("getByTestId('{}')", escape_js(test_id)));
    }
    if let Some(role) = selectors.get("role").and_then(|r| r.get("role")).and_then(JsonValue::as_str) {
        let name = selectors.get("role").and_then(|r| r.get("name")).and_then(JsonValue::as_str);
        return Some(match name.filter(|n| !n.is_empty()) {
            Some(name) => format!("getByRole('{}', {{ name: '{}' }})", escape_js(role), escape_js(name)),
            None => format!("getByRole('{}')", escape_js(role)),
        });
    }
    if let Some(label) = selector_str(selectors, "ariaLabel") {
        return Some(format!("getByLabel('{}')", escape_js(label)));
    }
    if let Some(text) = selector_str(selectors, "text") {
        return Some(format!("getByText('{}')", escape_js(text)));
    }
    if let Some(id) = selector_str(selectors, "id") {
        return Some(format!("locator('#{}')", escape_js(id)));
    }
    ["css", "cssPath", "selector"]
        .iter()
        .find_map(|key| selector_str(selectors, key))
        .map(|css| format!("locator('{}')", escape_js(css)))
}

/// Human-readable element description for the plain-language format.
fn describe_element(selectors: &JsonMap<String, JsonValue>) -> String {
    let role = selectors.get("role").and_then(|r| r.get("role")).and_then(JsonValue::as_str);
    let role_name = selectors.get("role").and_then(|r| r.get("name")).and_then(JsonValue::as_str);
    let text = selector_str(selectors, "text");
    let label = selector_str(selectors, "ariaLabel");
    if let Some(role) = role {
        if let Some(name) = text.or(label).or(role_name.filter(|n| !n.is_empty())) {
            return format!("{name:?} {role}");
        }
    }
    if let Some(test_id) = selector_str(selectors, "testId") {
        return format!("[data-testid={test_id:?}]");
    }
    if let Some(name) = text.or(label) {
        return format!("{name:?}");
    }
    if let Some(id) = selector_str(selectors, "id") {
        return format!("#{id}");
    }
    ["css", "cssPath", "selector"]
        .iter()
        .find_map(|key| selector_str(selectors, key))
        .map(str::to_string)
        .unwrap_or_else(|| "(unknown element)".to_string())
}

fn navigate_target(action: &EnhancedAction) -> Option<&str> {
    action
        .to_url
        .as_deref()
        .or(Some(action.url.as_str()))
        .filter(|u| !u.is_empty())
}

fn target_url(raw: &str, base_url: Option<&str>) -> String {
    match base_url {
        Some(base) => rebase_url(raw, base),
        None => raw.to_string(),
    }
}

fn playwright_step(action: &EnhancedAction, base_url: Option<&str>) -> Option<String> {
    let on_locator = |method: &str, label: &str| {
        Some(match playwright_locator(&action.selectors) {
            Some(loc) => format!("await page.{loc}.{method}();"),
            None => format!("// {label} - no selector available"),
        })
    };
    match action.kind.as_str() {
        "navigate" => navigate_target(action)
            .map(|u| format!("await page.goto('{}');", escape_js(&target_url(u, base_url)))),
        "click" => on_locator("click", "click"),
        "input" => Some(match playwright_locator(&action.selectors) {
            Some(loc) => format!("await page.{loc}.fill('{}');", escape_js(user_value(action))),
            None => "// input - no selector available".to_string(),
        }),
        "select" => Some(match playwright_locator(&action.selectors) {
            Some(loc) => format!("await page.{loc}.selectOption('{}');", escape_js(user_value(action))),
            None => "// select - no selector available".to_string(),
        }),
        "keypress" => action
            .key
            .as_deref()
            .map(|k| format!("await page.keyboard.press('{}');", escape_js(k))),
        "scroll" => Some(format!("// Scroll to y={}", action.scroll_y.unwrap_or(0.0).round() as i64)),
        "scroll_element" => on_locator("scrollIntoViewIfNeeded", "scroll element into view"),
        "focus" => on_locator("focus", "focus"),
        "refresh" => Some("await page.reload();".to_string()),
        "back" => Some("await page.goBack();".to_string()),
        "forward" => Some("await page.goForward();".to_string()),
        "new_tab" => Some(match navigate_target(action) {
            Some(u) => format!("// Open new tab: {}", escape_js(&target_url(u, base_url))),
            None => "// Open new tab".to_string(),
        }),
        _ => None,
    }
}

fn plain_step(action: &EnhancedAction, base_url: Option<&str>) -> Option<String> {
    match action.kind.as_str() {
        "navigate" => navigate_target(action).map(|u| format!("Navigate to: {}", target_url(u, base_url))),
        "click" => Some(format!("Click: {}", describe_element(&action.selectors))),
        "input" => Some(format!(
            "Type {:?} into: {}",
            user_value(action),
            describe_element(&action.selectors)
        )),
        "select" => Some(format!(
            "Select {:?} from: {}",
            user_value(action),
            describe_element(&action.selectors)
        )),
        "keypress" => action.key.as_deref().map(|k| format!("Press: {k}")),
        "scroll" => Some(format!("Scroll to: y={}", action.scroll_y.unwrap_or(0.0).round() as i64)),
        "scroll_element" => Some(format!("Scroll to element: {}", describe_element(&action.selectors))),
        "focus" => Some(format!("Focus: {}", describe_element(&action.selectors))),
        "refresh" => Some("Refresh page".to_string()),
        "back" => Some("Navigate back".to_string()),
        "forward" => Some("Navigate forward".to_string()),
        "new_tab" => Some(match navigate_target(action) {
            Some(u) => format!("Open new tab: {}", target_url(u, base_url)),
            None => "Open new tab".to_string(),
        }),
        _ => None,
    }
}

fn write_pause(out: &mut String, prev_ts: i64, ts: i64, prefix: &str) {
    if prev_ts > 0 && ts - prev_ts > PAUSE_THRESHOLD_MS {
        let _ = writeln!(out, "{prefix}[{}s pause]", (ts - prev_ts) / 1000);
    }
}

fn cap_script(mut script: String) -> String {
    if script.len() > MAX_SCRIPT_BYTES {
        let mut cut = MAX_SCRIPT_BYTES;
        while !script.is_char_boundary(cut) {
            cut -= 1;
        }
        script.truncate(cut);
    }
    script
}

struct ReproOptions {
    base_url: Option<String>,
    error_message: Option<String>,
}

fn playwright_script(actions: &[EnhancedAction], opts: &ReproOptions) -> String {
    if actions.is_empty() {
        return "// No actions captured\n".to_string();
    }
    let mut out = String::from("import { test, expect } from '@playwright/test';\n\n");
    let name = match &opts.error_message {
        Some(msg) => format!("reproduction: {}", truncate_chars(msg, 80)),
        None => "reproduction: captured user actions".to_string(),
    };
    let _ = writeln!(out, "test('{}', async ({{ page }}) => {{", escape_js(&name));
    let mut prev_ts = 0;
    for action in actions {
        write_pause(&mut out, prev_ts, action.timestamp, "  // ");
        prev_ts = action.timestamp;
        if let Some(line) = playwright_step(action, opts.base_url.as_deref()) {
            let _ = writeln!(out, "  {line}");
        }
    }
    if let Some(msg) = &opts.error_message {
        let _ = writeln!(out, "  // Error: {msg}");
    }
    out.push_str("});\n");
    cap_script(out)
}

fn plain_script(actions: &[EnhancedAction], opts: &ReproOptions) -> String {
    if actions.is_empty() {
        return "# No actions captured\n".to_string();
    }
    let mut out = String::new();
    let description = opts
        .error_message
        .as_deref()
        .map(|m| truncate_chars(m, 80))
        .unwrap_or_else(|| "captured user actions".to_string());
    let _ = writeln!(out, "# Reproduction: {description}");
    let _ = writeln!(
        out,
        "# Captured: {} | {} actions | {}\n",
        now_rfc3339(),
        actions.len(),
        start_url(actions)
    );
    let mut step = 0;
    let mut prev_ts = 0;
    for action in actions {
        write_pause(&mut out, prev_ts, action.timestamp, "   ");
        prev_ts = action.timestamp;
        let Some(line) = plain_step(action, opts.base_url.as_deref()) else {
            continue;
        };
        step += 1;
        let by_ai = if action.source.as_deref() == Some("ai") { "(AI) " } else { "" };
        let _ = writeln!(out, "{step}. {by_ai}{line}");
    }
    if let Some(msg) = &opts.error_message {
        let _ = writeln!(out, "\n# Error: {msg}");
    }
    cap_script(out)
}

fn start_url(actions: &[EnhancedAction]) -> &str {
    match actions.first() {
        Some(first) if first.kind == "navigate" => navigate_target(first).unwrap_or(""),
        Some(first) => &first.url,
        None => "",
    }
}

fn selector_kinds(actions: &[EnhancedAction]) -> Vec<String> {
    let mut kinds: Vec<String> = actions
        .iter()
        .flat_map(|a| a.selectors.keys().cloned())
        .collect();
    kinds.sort();
    kinds.dedup();
    kinds
}

fn reproduction(ctx: &CallContext, args: &Args) -> ToolOutcome {
    let output_format = optional_string(args, "output_format")?.unwrap_or_else(|| "playwright".to_string());
    if output_format != "playwright" && output_format != "gasoline" {
        return Err(ToolError::invalid_param(
            "output_format",
            format!("Invalid output_format: {output_format}"),
            "Use 'playwright' or 'gasoline'",
        ));
    }
    let opts = ReproOptions {
        base_url: optional_string(args, "base_url")?,
        error_message: optional_string(args, "error_message")?,
    };
    let all = ctx.state.store.actions();
    let available = all.len();
    let actions = last_n(all, optional_i64(args, "last_n")?);

    let script = if output_format == "playwright" {
        playwright_script(&actions, &opts)
    } else {
        plain_script(&actions, &opts)
    };
    let duration_ms = match (actions.first(), actions.last()) {
        (Some(first), Some(last)) => last.timestamp - first.timestamp,
        _ => 0,
    };
    json_response(
        &format!("Reproduction script ({output_format}, {} actions)", actions.len()),
        &json!({
            "script": script,
            "format": output_format,
            "action_count": actions.len(),
            "duration_ms": duration_ms,
            "start_url": start_url(&actions),
            "metadata": {
                "generated_at": now_rfc3339(),
                "selectors_used": selector_kinds(&actions),
                "actions_available": available,
                "actions_included": actions.len(),
            },
        }),
    )
}

/// Splits at each navigate so every page gets its own `test()` block.
fn group_by_navigation(actions: &[EnhancedAction]) -> Vec<&[EnhancedAction]> {
    let mut groups = Vec::new();
    let mut start = 0;
    for (i, action) in actions.iter().enumerate() {
        if action.kind == "navigate" && i > start {
            groups.push(&actions[start..i]);
            start = i;
        }
    }
    if start < actions.len() {
        groups.push(&actions[start..]);
    }
    groups
}

fn group_label(group: &[EnhancedAction], index: usize) -> String {
    let Some(first) = group.first().filter(|a| a.kind == "navigate") else {
        return format!("step {}", index + 1);
    };
    let Some(target) = navigate_target(first) else {
        return format!("step {}", index + 1);
    };
    let path = match url::Url::parse(target) {
        Ok(parsed) => parsed.path().to_string(),
        Err(_) => target.to_string(),
    };
    let path = if path.is_empty() || path == "/" { "homepage".to_string() } else { path };
    format!("should work on {}", truncate_chars(&path, 60))
}

struct TestOptions {
    name: String,
    base_url: Option<String>,
    assert_no_errors: bool,
    assert_network: bool,
}

fn test_script(actions: &[EnhancedAction], opts: &TestOptions) -> String {
    let mut out = String::from("import { test, expect } from '@playwright/test';\n\n");
    let _ = writeln!(out, "test.describe('{}', () => {{", escape_js(&opts.name));
    if actions.is_empty() {
        out.push_str("  test('should load page', async ({ page }) => {\n");
        out.push_str("    // No actions captured, add test steps here\n");
        out.push_str("    await page.goto('/');\n");
        out.push_str("    await expect(page).toHaveTitle(/.+/);\n");
        out.push_str("  });\n");
    }
    for (index, group) in group_by_navigation(actions).into_iter().enumerate() {
        let _ = writeln!(
            out,
            "  test('{}', async ({{ page }}) => {{",
            escape_js(&group_label(group, index))
        );
        if opts.assert_no_errors {
            out.push_str("    const consoleErrors = [];\n");
            out.push_str("    page.on('console', msg => { if (msg.type() === 'error') consoleErrors.push(msg.text()); });\n");
        }
        if opts.assert_network {
            out.push_str("    const failedRequests = [];\n");
            out.push_str("    page.on('requestfailed', req => failedRequests.push(req.url()));\n");
        }
        let mut prev_ts = 0;
        for action in group {
            write_pause(&mut out, prev_ts, action.timestamp, "    // ");
            prev_ts = action.timestamp;
            if let Some(line) = playwright_step(action, opts.base_url.as_deref()) {
                let _ = writeln!(out, "    {line}");
            }
        }
        if group.iter().any(|a| a.kind == "navigate") {
            out.push_str("    await expect(page).toHaveTitle(/.+/);\n");
        }
        if opts.assert_no_errors {
            out.push_str("    expect(consoleErrors).toHaveLength(0);\n");
        }
        if opts.assert_network {
            out.push_str("    expect(failedRequests).toHaveLength(0);\n");
        }
        out.push_str("  });\n\n");
    }
    out.push_str("});\n");
    cap_script(out)
}

fn test(ctx: &CallContext, args: &Args) -> ToolOutcome {
    let opts = TestOptions {
        name: optional_string(args, "test_name")?.unwrap_or_else(|| "generated test".to_string()),
        base_url: optional_string(args, "base_url")?,
        assert_no_errors: optional_bool(args, "assert_no_errors")?.unwrap_or(true),
        assert_network: optional_bool(args, "assert_network")?.unwrap_or(false),
    };
    let all = ctx.state.store.actions();
    let available = all.len();
    let actions = last_n(all, optional_i64(args, "last_n")?);
    let script = test_script(&actions, &opts);
    json_response(
        &format!("Playwright test '{}' ({} actions)", opts.name, actions.len()),
        &json!({
            "script": script,
            "test_name": opts.name,
            "action_count": actions.len(),
            "metadata": {
                "generated_at": now_rfc3339(),
                "actions_available": available,
                "actions_included": actions.len(),
                "assert_no_errors": opts.assert_no_errors,
                "assert_network": opts.assert_network,
            },
        }),
    )
}

#[derive(Debug, Serialize)]
pub struct Har {
    pub log: HarLog,
}

#[derive(Debug, Serialize)]
pub struct HarLog {
    pub version: &'static str,
    pub creator: HarCreator,
    pub entries: Vec<HarEntry>,
}

#[derive(Debug, Serialize)]
pub struct HarCreator {
    pub name: &'static str,
    pub version: &'static str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HarEntry {
    pub started_date_time: String,
    pub time: i64,
    pub request: HarRequest,
    pub response: HarResponse,
    pub cache: JsonMap<String, JsonValue>,
    pub timings: HarTimings,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HarRequest {
    pub method: String,
    pub url: String,
    pub http_version: &'static str,
    pub headers: Vec<HarPair>,
    pub query_string: Vec<HarPair>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub post_data: Option<HarPostData>,
    pub headers_size: i64,
    pub body_size: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comment: Option<&'static str>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HarResponse {
    pub status: i64,
    pub status_text: &'static str,
    pub http_version: &'static str,
    pub headers: Vec<HarPair>,
    pub content: HarContent,
    #[serde(rename = "redirectURL")]
    pub redirect_url: String,
    pub headers_size: i64,
    pub body_size: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comment: Option<&'static str>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HarContent {
    pub size: usize,
    pub mime_type: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub text: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HarPostData {
    pub mime_type: String,
    pub text: String,
}

#[derive(Debug, Serialize)]
pub struct HarPair {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Serialize)]
pub struct HarTimings {
    pub send: i64,
    pub wait: i64,
    pub receive: i64,
}

fn query_pairs(raw: &str) -> Vec<HarPair> {
    match url::Url::parse(raw) {
        Ok(parsed) => parsed
            .query_pairs()
            .map(|(name, value)| HarPair {
                name: name.into_owned(),
                value: value.into_owned(),
            })
            .collect(),
        Err(_) => Vec::new(),
    }
}

fn har_entry(body: NetworkBody) -> HarEntry {
    let status_text = u16::try_from(body.status)
        .ok()
        .and_then(|s| StatusCode::from_u16(s).ok())
        .and_then(|s| s.canonical_reason())
        .unwrap_or("");
    let post_data = (!body.request_body.is_empty()).then(|| HarPostData {
        mime_type: body.content_type.clone(),
        text: body.request_body.clone(),
    });
    HarEntry {
        started_date_time: body.timestamp,
        time: body.duration_ms,
        request: HarRequest {
            query_string: query_pairs(&body.url),
            method: body.method,
            url: body.url,
            http_version: "HTTP/1.1",
            headers: Vec::new(),
            post_data,
            headers_size: -1,
            body_size: body.request_body.len(),
            comment: body.request_truncated.then_some("Request body truncated by Gasoline"),
        },
        response: HarResponse {
            status: body.status,
            status_text,
            http_version: "HTTP/1.1",
            headers: Vec::new(),
            content: HarContent {
                size: body.response_body.len(),
                mime_type: body.content_type,
                text: body.response_body.clone(),
            },
            redirect_url: String::new(),
            headers_size: -1,
            body_size: body.response_body.len(),
            comment: body.response_truncated.then_some("Response body truncated by Gasoline"),
        },
        cache: JsonMap::new(),
        timings: HarTimings {
            send: -1,
            wait: body.duration_ms,
            receive: -1,
        },
    }
}

/// HAR 1.2 log, oldest entry first.
pub fn build_har(bodies: impl IntoIterator<Item = NetworkBody>) -> Har {
    Har {
        log: HarLog {
            version: "1.2",
            creator: HarCreator {
                name: "Gasoline",
                version: VERSION,
            },
            entries: bodies.into_iter().map(har_entry).collect(),
        },
    }
}

/// Export targets must stay under the temp dir, or be relative without `..`.
fn export_path_allowed(raw: &str) -> bool {
    let path = Path::new(raw);
    if path.is_absolute() {
        let temp = std::env::temp_dir();
        return (path.starts_with("/tmp") || path.starts_with(&temp))
            && !path.components().any(|c| c == Component::ParentDir);
    }
    !path.components().any(|c| c == Component::ParentDir)
}

fn har(ctx: &CallContext, args: &Args) -> ToolOutcome {
    let url_filter = optional_string(args, "url")?;
    let method = optional_string(args, "method")?;
    let status_min = optional_i64(args, "status_min")?.filter(|s| *s > 0);
    let status_max = optional_i64(args, "status_max")?.filter(|s| *s > 0);
    let bodies = ctx.state.store.network_bodies().into_iter().filter(|b| {
        url_filter.as_deref().is_none_or(|u| b.url.contains(u))
            && method.as_deref().is_none_or(|m| b.method.eq_ignore_ascii_case(m))
            && status_min.is_none_or(|min| b.status >= min)
            && status_max.is_none_or(|max| b.status <= max)
    });
    let har = build_har(bodies);
    let count = har.log.entries.len();

    let Some(save_to) = optional_string(args, "save_to")? else {
        return json_response(&format!("HAR export ({count} entries)"), &har);
    };
    if !export_path_allowed(&save_to) {
        return Err(ToolError::new(
            ErrorCode::PathNotAllowed,
            format!("Path not allowed: {save_to}"),
            "Save under the system temp directory or a relative path without '..'",
        )
        .with_param("save_to"));
    }
    let export_failed = |e: String| {
        warn!(path = %save_to, error = %e, "HAR export failed");
        ToolError::new(
            ErrorCode::ExportFailed,
            format!("HAR file export failed: {e}"),
            "Check the save_to path and try again",
        )
    };
    let data = serde_json::to_vec_pretty(&har).map_err(|e| export_failed(e.to_string()))?;
    std::fs::write(&save_to, &data).map_err(|e| export_failed(e.to_string()))?;
    info!(path = %save_to, entries = count, "HAR exported");
    json_response(
        &format!("HAR exported to {save_to} ({count} entries)"),
        &json!({
            "saved_to": save_to,
            "entries_count": count,
            "file_size_bytes": data.len(),
        }),
    )
}

fn pr_summary(ctx: &CallContext) -> ToolOutcome {
    let store = &ctx.state.store;
    let actions = store.actions();
    let bodies = store.network_bodies();
    let errors: Vec<_> = store
        .console_entries()
        .into_iter()
        .filter(|e| e.level == LogLevel::Error && !e.is_internal())
        .collect();
    let correlator = store.correlator();
    let completed = correlator.completed_commands(ctx.client()).len();
    let failed = correlator.failed_commands(ctx.client()).len();
    let failed_requests: Vec<&NetworkBody> = bodies.iter().filter(|b| b.is_failure()).collect();
    let tracking = store.tracking_status();

    let mut by_kind: BTreeMap<&str, usize> = BTreeMap::new();
    for action in &actions {
        *by_kind.entry(action.kind.as_str()).or_default() += 1;
    }

    let mut md = String::from("## Session Summary\n\n");
    if actions.is_empty() && bodies.is_empty() && errors.is_empty() && completed + failed == 0 {
        md.push_str("No activity captured during this session.\n\n");
        md.push_str("Navigate to a page or interact with the browser to generate activity.\n");
    } else {
        if let Some(url) = tracking.tracked_tab_url.as_deref().filter(|u| !u.is_empty()) {
            let _ = writeln!(md, "- **Page:** {url}");
        }
        let _ = write!(md, "- **Actions:** {} total", actions.len());
        if !by_kind.is_empty() {
            let parts: Vec<String> = by_kind.iter().map(|(k, n)| format!("{k}: {n}")).collect();
            let _ = write!(md, " ({})", parts.join(", "));
        }
        md.push('\n');
        let _ = writeln!(md, "- **Commands:** {completed} completed, {failed} failed");
        let _ = writeln!(md, "- **Console Errors:** {}", errors.len());
        let _ = writeln!(md, "- **Failed Requests:** {}", failed_requests.len());
        let _ = writeln!(md, "- **Network Requests Captured:** {}", bodies.len());

        if !errors.is_empty() {
            md.push_str("\n### Errors\n\n");
            for entry in errors.iter().rev().take(10) {
                let _ = writeln!(md, "- `{}`", truncate_chars(entry.message_str(), 160).replace('`', "'"));
            }
        }
        if !failed_requests.is_empty() {
            md.push_str("\n### Failed Requests\n\n");
            for body in failed_requests.iter().rev().take(10) {
                let _ = writeln!(md, "- {} {} → {}", body.method, truncate_chars(&body.url, 120), body.status);
            }
        }
    }

    json_response(
        "PR summary generated",
        &json!({
            "summary": md,
            "stats": {
                "actions": actions.len(),
                "commands_completed": completed,
                "commands_failed": failed,
                "console_errors": errors.len(),
                "network_errors": failed_requests.len(),
                "network_captured": bodies.len(),
            },
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::response::{first_text, is_failure};
    use crate::app::AppState;
    use crate::config::Config;

    fn ctx() -> (CallContext, tempfile::TempDir) {
        let dir = tempfile::tempdir().expect("tempdir");
        let state = AppState::new(Config::for_tests(dir.path()));
        (CallContext::new(state, None), dir)
    }

    fn args(v: JsonValue) -> Args {
        v.as_object().cloned().expect("object")
    }

    fn body_of(outcome: ToolOutcome) -> JsonValue {
        let result = outcome.expect("tool result");
        assert!(!is_failure(&result));
        let text = first_text(&result).to_string();
        serde_json::from_str(text.split_once('\n').expect("summary line").1).expect("json body")
    }

    fn seed_actions(ctx: &CallContext) {
        ctx.state.store.add_actions(vec![
            json!({"type": "navigate", "timestamp": 1_000, "url": "https://app.test/", "toUrl": "https://app.test/login"}),
            json!({"type": "input", "timestamp": 1_500, "url": "https://app.test/login", "selectors": {"id": "email"}, "value": "a@b.test"}),
            json!({"type": "input", "timestamp": 1_800, "url": "https://app.test/login", "selectors": {"ariaLabel": "Password"}, "value": "[redacted]"}),
            json!({"type": "click", "timestamp": 6_000, "url": "https://app.test/login", "selectors": {"role": {"role": "button", "name": "Sign in"}}}),
            json!({"type": "keypress", "timestamp": 6_100, "url": "https://app.test/home", "key": "Enter"}),
        ]);
    }

    #[tokio::test]
    async fn reproduction_emits_playwright_steps() {
        let (ctx, _dir) = ctx();
        seed_actions(&ctx);
        let body = body_of(generate(&ctx, &args(json!({"format": "reproduction"}))).await);
        let script = body["script"].as_str().expect("script");
        assert!(script.starts_with("import { test, expect } from '@playwright/test';"));
        assert!(script.contains("await page.goto('https://app.test/login');"));
        assert!(script.contains("await page.locator('#email').fill('a@b.test');"));
        assert!(script.contains("await page.getByLabel('Password').fill('[user-provided]');"));
        assert!(script.contains("  // [4s pause]\n"));
        assert!(script.contains("await page.getByRole('button', { name: 'Sign in' }).click();"));
        assert!(script.contains("await page.keyboard.press('Enter');"));
        assert_eq!(body["action_count"], 5);
        assert_eq!(body["duration_ms"], 5_100);
        assert_eq!(body["start_url"], "https://app.test/login");
    }

    #[tokio::test]
    async fn reproduction_honours_last_n_and_base_url() {
        let (ctx, _dir) = ctx();
        seed_actions(&ctx);
        let body = body_of(
            generate(
                &ctx,
                &args(json!({"what": "reproduction", "output_format": "gasoline", "base_url": "http://localhost:3000", "last_n": 5})),
            )
            .await,
        );
        let script = body["script"].as_str().expect("script");
        assert!(script.contains("1. Navigate to: http://localhost:3000/login"));
        assert!(script.contains("Type \"[user-provided]\" into: \"Password\""));

        let err = generate(&ctx, &args(json!({"format": "reproduction", "output_format": "cypress"})))
            .await
            .expect_err("bad output format");
        assert_eq!(err.code, ErrorCode::InvalidParam);
    }

    #[tokio::test]
    async fn test_blocks_assert_no_console_errors() {
        let (ctx, _dir) = ctx();
        seed_actions(&ctx);
        let body = body_of(generate(&ctx, &args(json!({"format": "test", "test_name": "login flow"}))).await);
        let script = body["script"].as_str().expect("script");
        assert!(script.contains("test.describe('login flow', () => {"));
        assert!(script.contains("test('should work on /login', async ({ page }) => {"));
        assert!(script.contains("expect(consoleErrors).toHaveLength(0);"));
    }

    #[tokio::test]
    async fn har_filters_and_orders_entries() {
        let (ctx, _dir) = ctx();
        ctx.state.store.add_network_bodies(vec![
            json!({"timestamp": "2026-01-01T00:00:01Z", "method": "GET", "url": "https://api.test/items?page=2", "status": 200, "responseBody": "[]", "contentType": "application/json", "duration": 12}),
            json!({"timestamp": "2026-01-01T00:00:02Z", "method": "POST", "url": "https://api.test/items", "status": 500, "requestBody": "{}", "contentType": "application/json", "duration": 40}),
        ]);
        let body = body_of(generate(&ctx, &args(json!({"format": "har"}))).await);
        assert_eq!(body["log"]["version"], "1.2");
        let entries = body["log"]["entries"].as_array().expect("entries");
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0]["request"]["queryString"][0]["name"], "page");
        assert_eq!(entries[1]["response"]["statusText"], "Internal Server Error");
        assert_eq!(entries[1]["request"]["postData"]["text"], "{}");

        let body = body_of(generate(&ctx, &args(json!({"format": "har", "status_min": 400}))).await);
        assert_eq!(body["log"]["entries"].as_array().expect("entries").len(), 1);

        let err = generate(&ctx, &args(json!({"format": "har", "save_to": "/etc/out.har"})))
            .await
            .expect_err("outside temp");
        assert_eq!(err.code, ErrorCode::PathNotAllowed);
    }

    #[tokio::test]
    async fn pr_summary_counts_activity() {
        let (ctx, _dir) = ctx();
        let body = body_of(generate(&ctx, &args(json!({"format": "pr_summary"}))).await);
        assert!(body["summary"].as_str().expect("summary").contains("No activity captured"));

        seed_actions(&ctx);
        ctx.state.store.add_logs(vec![json!({"level": "error", "message": "boom"})]);
        let body = body_of(generate(&ctx, &args(json!({"format": "pr_summary"}))).await);
        let summary = body["summary"].as_str().expect("summary");
        assert!(summary.contains("- **Actions:** 5 total (click: 1, input: 2, keypress: 1, navigate: 1)"));
        assert!(summary.contains("- `boom`"));
        assert_eq!(body["stats"]["console_errors"], 1);
    }
}
