//! `interact`: commands the extension performs on the tracked page.
//!
//! Every action follows the same path: validate arguments, check the pilot
//! toggle, arm evidence, queue an async command, then wait briefly for the
//! result (or hand back a correlation id when the caller asked for
//! background execution).

use std::path::Path;

use gasoline_capture::PilotReadiness;
use gasoline_capture::time::now_ms;
use gasoline_types::EnhancedAction;
use serde_json::{Map as JsonMap, Value as JsonValue, json};
use tracing::debug;

use super::CallContext;
use super::args::{Args, optional_i64, optional_string, required_string, select_mode};
use super::commands::{enqueue_with_id, ensure_reachable, maybe_wait, new_correlation_id};
use super::errors::{ErrorCode, ToolError};
use super::evidence::{self, EvidenceMode, parse_evidence_mode};
use super::observe;
use super::response::{ToolOutcome, truncate_chars};

pub const MODES: &[&str] = &[
    "back",
    "check",
    "click",
    "execute_js",
    "focus",
    "forward",
    "get_attribute",
    "get_text",
    "highlight",
    "key_press",
    "navigate",
    "new_tab",
    "paste",
    "refresh",
    "screenshot",
    "scroll_to",
    "select",
    "set_attribute",
    "type",
    "upload",
    "wait_for",
];

/// Routed to the extension's pre-compiled DOM primitives.
const DOM_ACTIONS: &[&str] = &[
    "check",
    "click",
    "focus",
    "get_attribute",
    "get_text",
    "key_press",
    "paste",
    "scroll_to",
    "select",
    "set_attribute",
    "type",
    "wait_for",
];

const WORLDS: &[&str] = &["auto", "isolated", "main"];

/// Per-action required field beyond `selector`: (field, retry).
fn dom_required_field(action: &str) -> Option<(&'static str, &'static str)> {
    match action {
        "type" => Some(("text", "Add the 'text' parameter with the text to type")),
        "paste" => Some(("text", "Add the 'text' parameter with the text to paste")),
        "key_press" => Some(("text", "Add the 'text' parameter with the key to press, e.g. 'Enter'")),
        "select" => Some(("value", "Add the 'value' parameter with the option value to select")),
        "get_attribute" | "set_attribute" => {
            Some(("name", "Add the 'name' parameter with the attribute name"))
        }
        _ => None,
    }
}

/// Recorded action type, matching what the reproduction generator replays.
fn recorded_kind(action: &str) -> String {
    match action {
        "click" | "check" => "click".to_string(),
        "type" => "input".to_string(),
        "select" => "select".to_string(),
        "key_press" => "keypress".to_string(),
        "scroll_to" => "scroll_element".to_string(),
        "focus" => "focus".to_string(),
        other => format!("dom_{other}"),
    }
}

/// Turns an interact selector (`text=Submit`, `role=button`, `#id`, css)
/// into the selector map stored on recorded actions.
pub fn selector_map(selector: &str) -> JsonMap<String, JsonValue> {
    let mut map = JsonMap::new();
    if let Some((prefix, value)) = selector.split_once('=').filter(|(p, _)| !p.is_empty()) {
        match prefix {
            "text" => {
                map.insert("text".into(), json!(value));
                return map;
            }
            "role" => {
                map.insert("role".into(), json!({ "role": value }));
                return map;
            }
            "label" | "aria-label" | "placeholder" => {
                map.insert("ariaLabel".into(), json!(value));
                return map;
            }
            _ => {}
        }
    }
    let plain_id = selector
        .strip_prefix('#')
        .filter(|rest| !rest.is_empty() && !rest.contains([' ', '>', '.', '+', '~', '[', ']', ':', '#']));
    match plain_id {
        Some(id) => map.insert("id".into(), json!(id)),
        None => map.insert("css".into(), json!(selector)),
    };
    map
}

/// A command ready to be queued.
struct Command {
    kind: &'static str,
    prefix: String,
    params: JsonValue,
    tab_id: Option<i64>,
    queued_summary: String,
    stash_perf: bool,
}

impl Command {
    fn new(kind: &'static str, prefix: impl Into<String>, params: JsonValue, queued: impl Into<String>) -> Self {
        Self {
            kind,
            prefix: prefix.into(),
            params,
            tab_id: None,
            queued_summary: queued.into(),
            stash_perf: false,
        }
    }

    fn on_tab(mut self, tab_id: Option<i64>) -> Self {
        self.tab_id = tab_id;
        self
    }

    fn with_perf_diff(mut self) -> Self {
        self.stash_perf = true;
        self
    }
}

pub async fn interact(ctx: &CallContext, args: &Args) -> ToolOutcome {
    let action = select_mode(args, &["action"], MODES, "interact")?;
    if action == "screenshot" {
        return observe::screenshot(ctx, args).await;
    }
    let evidence = parse_evidence_mode(args)?;
    validate_pierce_shadow(args)?;
    let tab_id = optional_i64(args, "tab_id")?.filter(|id| *id > 0);
    let forwarded = JsonValue::Object(args.clone());

    let (command, recorded) = match action {
        "highlight" => {
            let selector = required_string(args, "selector", "Add the 'selector' parameter")?;
            require_pilot(ctx)?;
            (
                Command::new("highlight", "highlight", forwarded, "Highlight queued").on_tab(tab_id),
                ai_action("highlight", "", [("selector", json!(selector))]),
            )
        }
        "execute_js" => {
            let script = required_string(args, "script", "Add the 'script' parameter and call again")?;
            let world = optional_string(args, "world")?.unwrap_or_else(|| "auto".to_string());
            if !WORLDS.contains(&world.as_str()) {
                return Err(ToolError::invalid_param(
                    "world",
                    format!("Invalid 'world' value: {world}"),
                    "Use 'auto' (default, tries main then isolated), 'main' (page JS access), or 'isolated' (bypasses CSP, DOM only)",
                ));
            }
            require_pilot(ctx)?;
            let mut params = args.clone();
            params.insert("world".into(), json!(world));
            (
                Command::new("execute", "exec", JsonValue::Object(params), "Command queued").on_tab(tab_id),
                ai_action("execute_js", "", [("script_preview", json!(truncate_chars(&script, 100)))]),
            )
        }
        "navigate" => {
            let url = required_string(args, "url", "Add the 'url' parameter and call again")?;
            require_pilot(ctx)?;
            (
                Command::new("browser_action", "nav", forwarded, "Navigate queued")
                    .on_tab(tab_id)
                    .with_perf_diff(),
                ai_action("navigate", &url, [("target_url", json!(url))]),
            )
        }
        "refresh" => {
            require_pilot(ctx)?;
            (
                Command::new("browser_action", "refresh", json!({"action": "refresh"}), "Refresh queued")
                    .on_tab(tab_id)
                    .with_perf_diff(),
                ai_action("refresh", "", []),
            )
        }
        "back" | "forward" => {
            require_pilot(ctx)?;
            let queued = if action == "back" { "Back queued" } else { "Forward queued" };
            (
                Command::new("browser_action", action, json!({ "action": action }), queued).on_tab(tab_id),
                ai_action(action, "", []),
            )
        }
        "new_tab" => {
            let url = optional_string(args, "url")?.unwrap_or_default();
            require_pilot(ctx)?;
            (
                Command::new("browser_action", "newtab", forwarded, "New tab queued"),
                ai_action("new_tab", &url, [("target_url", json!(url))]),
            )
        }
        "upload" => {
            let selector = required_string(args, "selector", "Add the 'selector' parameter for the file input")?;
            let file_path = required_string(args, "file_path", "Add the 'file_path' parameter with an absolute path")?;
            let (file_name, size) = check_upload_path(&file_path)?;
            require_pilot(ctx)?;
            let params = json!({
                "action": "upload",
                "selector": selector,
                "file_path": file_path,
                "file_name": file_name,
                "file_size": size,
            });
            (
                Command::new("upload", "upload", params, "Upload queued").on_tab(tab_id),
                ai_action("upload", "", [("selector", json!(selector)), ("file_name", json!(file_name))]),
            )
        }
        dom if DOM_ACTIONS.contains(&dom) => {
            let selector = required_string(
                args,
                "selector",
                "Add the 'selector' parameter. Supports CSS selectors or semantic: text=Submit, role=button, placeholder=Email, label=Name, aria-label=Close.",
            )?;
            let mut text = None;
            let mut value = None;
            if let Some((field, retry)) = dom_required_field(dom) {
                let given = optional_string(args, field)?.ok_or_else(|| {
                    ToolError::new(
                        ErrorCode::MissingParam,
                        format!("Required parameter '{field}' is missing for {dom} action"),
                        retry,
                    )
                    .with_param(field)
                })?;
                match field {
                    "text" => text = Some(given),
                    "value" => value = Some(given),
                    _ => {}
                }
            }
            require_pilot(ctx)?;
            (
                Command::new("dom_action", format!("dom_{dom}"), forwarded, format!("{dom} queued"))
                    .on_tab(tab_id),
                dom_action(dom, &selector, text, value),
            )
        }
        other => {
            return Err(ToolError::internal(format!("interact action {other} has no handler")));
        }
    };

    ensure_reachable(ctx, args)?;
    let correlation_id = queue(ctx, action, evidence, &command).await?;
    ctx.state.store.record_ai_action(recorded);
    maybe_wait(ctx, &correlation_id, args, &command.queued_summary).await
}

async fn queue(
    ctx: &CallContext,
    action: &str,
    evidence: EvidenceMode,
    command: &Command,
) -> Result<String, ToolError> {
    let correlation_id = new_correlation_id(&command.prefix);
    if command.stash_perf {
        ctx.state.store.stash_perf_before(&correlation_id);
    }
    evidence::arm(&ctx.state, &correlation_id, action, evidence, ctx.client()).await;
    if let Err(e) = enqueue_with_id(ctx, command.kind, command.params.clone(), &correlation_id, command.tab_id) {
        ctx.state.evidence.remove(&correlation_id);
        return Err(e);
    }
    debug!(%correlation_id, action, "interact command queued");
    Ok(correlation_id)
}

fn require_pilot(ctx: &CallContext) -> Result<(), ToolError> {
    if ctx.state.store.pilot_readiness() == PilotReadiness::Disabled {
        return Err(ToolError::new(
            ErrorCode::CodePilotDisabled,
            "AI Web Pilot is disabled",
            "Enable AI Web Pilot in the extension popup",
        ));
    }
    Ok(())
}

/// `pierce_shadow` is `true`, `false` or `"auto"`.
fn validate_pierce_shadow(args: &Args) -> Result<(), ToolError> {
    match args.get("pierce_shadow") {
        None | Some(JsonValue::Null) | Some(JsonValue::Bool(_)) => Ok(()),
        Some(JsonValue::String(s)) if s == "auto" => Ok(()),
        Some(other) => Err(ToolError::invalid_param(
            "pierce_shadow",
            format!("Invalid 'pierce_shadow' value: {other}"),
            "Use pierce_shadow=true, false, or \"auto\"",
        )),
    }
}

/// Only absolute paths to existing regular files may be handed to the
/// extension.
fn check_upload_path(raw: &str) -> Result<(String, u64), ToolError> {
    let path = Path::new(raw);
    let not_allowed = |why: &str| {
        ToolError::new(
            ErrorCode::PathNotAllowed,
            format!("Upload path {raw} {why}"),
            "Pass the absolute path of an existing regular file",
        )
        .with_param("file_path")
    };
    if !path.is_absolute() {
        return Err(not_allowed("is not absolute"));
    }
    let meta = std::fs::metadata(path).map_err(|_| not_allowed("does not exist"))?;
    if !meta.is_file() {
        return Err(not_allowed("is not a regular file"));
    }
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    Ok((name, meta.len()))
}

fn ai_action<const N: usize>(kind: &str, url: &str, details: [(&str, JsonValue); N]) -> EnhancedAction {
    let mut action = EnhancedAction::new(kind, now_ms(), url);
    for (key, value) in details {
        action.selectors.insert(key.to_string(), value);
    }
    action
}

fn dom_action(action: &str, selector: &str, text: Option<String>, value: Option<String>) -> EnhancedAction {
    let kind = recorded_kind(action);
    if kind.starts_with("dom_") {
        return ai_action(&kind, "", [("selector", json!(selector))]);
    }
    let mut recorded = EnhancedAction::new(kind, now_ms(), "");
    recorded.selectors = selector_map(selector);
    match action {
        "type" => recorded.value = text,
        "key_press" => recorded.key = text,
        "select" => recorded.value = value,
        _ => {}
    }
    recorded
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::response::{first_text};
    use crate::app::AppState;
    use crate::config::Config;
    use gasoline_types::ExtensionStatusPost;

    fn ctx() -> (CallContext, tempfile::TempDir) {
        let dir = tempfile::tempdir().expect("tempdir");
        let state = AppState::new(Config::for_tests(dir.path()));
        (CallContext::new(state, Some("client-a".to_string())), dir)
    }

    fn args(v: JsonValue) -> Args {
        v.as_object().cloned().expect("object")
    }

    fn body(outcome: ToolOutcome) -> JsonValue {
        let result = outcome.expect("tool result");
        let text = first_text(&result);
        serde_json::from_str(text.split_once('\n').expect("summary").1).expect("json body")
    }

    #[tokio::test]
    async fn missing_action_lists_modes() {
        let (ctx, _dir) = ctx();
        let err = interact(&ctx, &args(json!({}))).await.expect_err("missing");
        assert_eq!(err.code, ErrorCode::MissingParam);
        assert_eq!(err.param.as_deref(), Some("action"));
        assert!(err.hint.as_deref().expect("hint").contains("execute_js"));
    }

    #[tokio::test]
    async fn disabled_pilot_blocks_actions() {
        let (ctx, _dir) = ctx();
        ctx.state.store.update_extension_status(ExtensionStatusPost {
            pilot_enabled: Some(false),
            ..ExtensionStatusPost::default()
        });
        let err = interact(&ctx, &args(json!({"action": "navigate", "url": "https://a.test/"})))
            .await
            .expect_err("disabled");
        assert_eq!(err.code, ErrorCode::CodePilotDisabled);
        assert_eq!(ctx.state.store.correlator().queue_depth(), 0);
    }

    #[tokio::test]
    async fn argument_validation() {
        let (ctx, _dir) = ctx();
        let err = interact(&ctx, &args(json!({"action": "execute_js", "script": "1", "world": "page"})))
            .await
            .expect_err("world");
        assert_eq!(err.param.as_deref(), Some("world"));

        let err = interact(&ctx, &args(json!({"action": "type", "selector": "#q"})))
            .await
            .expect_err("text");
        assert_eq!(err.code, ErrorCode::MissingParam);
        assert_eq!(err.param.as_deref(), Some("text"));

        let err = interact(&ctx, &args(json!({"action": "click", "selector": "#go", "pierce_shadow": "yes"})))
            .await
            .expect_err("pierce_shadow");
        assert_eq!(err.code, ErrorCode::InvalidParam);

        let err = interact(&ctx, &args(json!({"action": "click", "selector": "#go", "evidence": "sometimes"})))
            .await
            .expect_err("evidence");
        assert_eq!(err.param.as_deref(), Some("evidence"));

        let err = interact(&ctx, &args(json!({"action": "upload", "selector": "#f", "file_path": "relative.txt"})))
            .await
            .expect_err("path");
        assert_eq!(err.code, ErrorCode::PathNotAllowed);
    }

    #[tokio::test]
    async fn background_click_is_queued_and_recorded() {
        let (ctx, _dir) = ctx();
        let outcome = interact(
            &ctx,
            &args(json!({"action": "click", "selector": "#save", "background": true, "pierce_shadow": "auto"})),
        )
        .await;
        let body = body(outcome);
        assert_eq!(body["status"], "queued");
        let id = body["correlation_id"].as_str().expect("id");
        assert!(id.starts_with("dom_click_"));

        let polled = ctx.state.store.correlator().take_for_poll();
        assert_eq!(polled.len(), 1);
        assert_eq!(polled[0].kind, "dom_action");
        assert_eq!(polled[0].correlation_id.as_deref(), Some(id));

        let pending = ctx.state.store.correlator().pending_commands(Some("client-a"));
        assert_eq!(pending.len(), 1);
        assert!(ctx.state.store.correlator().pending_commands(Some("client-b")).is_empty());

        let actions = ctx.state.store.actions();
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].kind, "click");
        assert_eq!(actions[0].source.as_deref(), Some("ai"));
        assert_eq!(actions[0].best_selector().as_deref(), Some("#save"));
    }

    #[tokio::test]
    async fn disconnected_sync_call_leaves_nothing_behind() {
        let (ctx, _dir) = ctx();
        for _ in 0..6 {
            let err = interact(&ctx, &args(json!({"action": "navigate", "url": "https://a.test/"})))
                .await
                .expect_err("not connected");
            assert_eq!(err.code, ErrorCode::NoData);
        }
        let correlator = ctx.state.store.correlator();
        assert_eq!(correlator.queue_depth(), 0);
        assert!(correlator.take_for_poll().is_empty());
        assert!(correlator.pending_commands(None).is_empty());
        assert!(ctx.state.store.actions().is_empty());
        assert_eq!(ctx.state.evidence.len(), 0);
    }

    #[test]
    fn selector_maps_semantic_prefixes() {
        assert_eq!(selector_map("text=Submit")["text"], "Submit");
        assert_eq!(selector_map("role=button")["role"]["role"], "button");
        assert_eq!(selector_map("placeholder=Email")["ariaLabel"], "Email");
        assert_eq!(selector_map("#main")["id"], "main");
        assert_eq!(selector_map("#main > a")["css"], "#main > a");
        assert_eq!(selector_map("div.card")["css"], "div.card");
    }
}
