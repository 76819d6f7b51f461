//! JSON-RPC/MCP dispatcher shared by the HTTP `/mcp` route and the stdio
//! transport.

use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Instant;

use gasoline_types::Alert;
use parking_lot::Mutex;
use rust_mcp_sdk::schema::{
    Implementation, InitializeResult, ListResourcesResult, ListToolsResult, ServerCapabilities,
    ServerCapabilitiesResources, ServerCapabilitiesTools,
};
use serde::Serialize;
use serde_json::{Value as JsonValue, json};
use tracing::{debug, error, warn};

use crate::app::AppState;
use crate::config::VERSION;
use crate::lifecycle::{PANIC_SLOT, PanicSlot, append_crash_log, panic_message};

pub mod analyze;
pub mod args;
pub mod commands;
pub mod configure;
pub mod errors;
pub mod evidence;
pub mod generate;
pub mod interact;
pub mod jsonrpc;
pub mod links;
pub mod observe;
pub mod response;
pub mod schema;

use args::Args;
use errors::{ErrorCode, ToolError};
use jsonrpc::{
    INTERNAL_ERROR, INVALID_PARAMS, INVALID_REQUEST, JsonRpcRequest, JsonRpcResponse,
    METHOD_NOT_FOUND,
};
use response::{ToolOutcome, ToolResult, is_failure, map_texts, text_block};

pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// Observe modes answered from server state alone.
const SERVER_SIDE_OBSERVE_MODES: &[&str] =
    &["command_result", "failed_commands", "pending_commands", "pilot"];

const DISCONNECTED_WARNING: &str = "⚠ Extension is not connected, results may be stale or empty. Ensure the Gasoline extension shows 'Connected' and a tab is tracked.";
const UNTRACKED_WARNING: &str = "⚠ no tab tracked, results may be stale or empty. Enable tracking on a tab from the Gasoline extension popup.";

/// What a tool handler sees of the caller.
pub struct CallContext {
    pub state: AppState,
    pub client_id: Option<String>,
}

impl CallContext {
    pub fn new(state: AppState, client_id: Option<String>) -> Self {
        Self { state, client_id }
    }

    pub fn client(&self) -> Option<&str> {
        self.client_id.as_deref()
    }
}

#[derive(Clone)]
pub struct GasolineMcpHandler {
    state: AppState,
}

fn typed_result<T: Serialize>(id: JsonValue, value: &T) -> JsonRpcResponse {
    match serde_json::to_value(value) {
        Ok(value) => JsonRpcResponse::result(id, value),
        Err(e) => JsonRpcResponse::error(id, INTERNAL_ERROR, format!("Internal error: {e}")),
    }
}

impl GasolineMcpHandler {
    pub fn new(state: AppState) -> Self {
        Self { state }
    }

    /// Handles one framed message. `None` means nothing is sent back
    /// (notifications).
    pub async fn handle_message(&self, raw: &[u8], client_id: Option<&str>) -> Option<JsonRpcResponse> {
        let value: JsonValue = match serde_json::from_slice(raw) {
            Ok(value) => value,
            Err(e) => {
                debug!(error = %e, "unparseable JSON-RPC message");
                return Some(JsonRpcResponse::parse_error(e));
            }
        };
        let id = value.get("id").cloned().unwrap_or(JsonValue::Null);
        if !value.is_object() {
            return Some(JsonRpcResponse::error(
                JsonValue::Null,
                INVALID_REQUEST,
                "Invalid request: expected a JSON object",
            ));
        }
        let request: JsonRpcRequest = match serde_json::from_value(value) {
            Ok(request) => request,
            Err(e) => {
                debug!(error = %e, "malformed JSON-RPC request");
                return Some(JsonRpcResponse::error(id, INVALID_REQUEST, format!("Invalid request: {e}")));
            }
        };
        let client_id = client_id
            .map(str::to_string)
            .or_else(|| request.client_id.clone())
            .filter(|c| !c.is_empty());
        self.handle_request(request, client_id).await
    }

    pub async fn handle_request(
        &self,
        request: JsonRpcRequest,
        client_id: Option<String>,
    ) -> Option<JsonRpcResponse> {
        if request.is_notification() {
            debug!(method = %request.method, "notification");
            return None;
        }
        let id = request.id.clone().unwrap_or(JsonValue::Null);
        let params = request.params.unwrap_or(JsonValue::Null);
        let response = match request.method.as_str() {
            "" => JsonRpcResponse::error(id, INVALID_REQUEST, "Invalid request: missing method"),
            "initialize" => typed_result(id, &server_details()),
            "initialized" | "notifications/initialized" | "ping" => {
                JsonRpcResponse::result(id, json!({}))
            }
            "tools/list" => typed_result(
                id,
                &ListToolsResult {
                    tools: schema::tool_descriptors(),
                    meta: None,
                    next_cursor: None,
                },
            ),
            "tools/call" => self.call_tool(id, params, client_id).await,
            "resources/list" => typed_result(
                id,
                &ListResourcesResult {
                    resources: schema::resources(),
                    meta: None,
                    next_cursor: None,
                },
            ),
            "resources/read" => {
                let uri = params.get("uri").and_then(JsonValue::as_str).unwrap_or("");
                if uri == schema::GUIDE_URI {
                    JsonRpcResponse::result(
                        id,
                        json!({
                            "contents": [{
                                "uri": schema::GUIDE_URI,
                                "mimeType": "text/markdown",
                                "text": schema::GUIDE,
                            }]
                        }),
                    )
                } else {
                    JsonRpcResponse::error(id, INVALID_PARAMS, format!("Resource not found: {uri}"))
                }
            }
            other => JsonRpcResponse::error(id, METHOD_NOT_FOUND, format!("Method not found: {other}")),
        };
        Some(response)
    }

    async fn call_tool(&self, id: JsonValue, params: JsonValue, client_id: Option<String>) -> JsonRpcResponse {
        let Some(name) = params.get("name").and_then(JsonValue::as_str).map(str::to_string) else {
            return JsonRpcResponse::error(id, INVALID_PARAMS, "Invalid params: missing tool name");
        };
        if !schema::TOOL_NAMES.contains(&name.as_str()) {
            debug!(tool = %name, "unknown tool");
            return typed_result(id, &unknown_tool(&name).into_result());
        }

        let admitted = self.state.inner.lock().admit_tool_call(Instant::now());
        let mut result = if !admitted {
            warn!(tool = %name, "tool call rate limit exceeded");
            ToolError::rate_limited("Tool call rate limit exceeded (500 calls per minute)").into_result()
        } else {
            match tool_arguments(params.get("arguments")) {
                Ok(args) => {
                    let ctx = CallContext::new(self.state.clone(), client_id);
                    let tool = name.clone();
                    self.run_isolated(&name, async move { dispatch_tool(ctx, &tool, args).await })
                        .await
                }
                Err(e) => e.into_result(),
            }
        };

        self.state.inner.lock().record_tool_call(&name, is_failure(&result));
        let redactor = self.state.store.redactor();
        map_texts(&mut result, |text| redactor.redact(text));
        typed_result(id, &result)
    }

    /// Runs a tool call on its own task so a panic becomes an `internal`
    /// error. The panic hook parks the backtrace in the task's slot.
    pub async fn run_isolated<F>(&self, name: &str, call: F) -> ToolResult
    where
        F: Future<Output = ToolResult> + Send + 'static,
    {
        let slot: PanicSlot = Arc::new(Mutex::new(None));
        let task = tokio::spawn(PANIC_SLOT.scope(slot.clone(), call));
        match task.await {
            Ok(result) => result,
            Err(e) if e.is_panic() => {
                let payload = e.into_panic();
                let report = slot.lock().take();
                let message = report
                    .as_ref()
                    .map(|r| r.message.clone())
                    .unwrap_or_else(|| panic_message(payload.as_ref()));
                let location = report
                    .as_ref()
                    .and_then(|r| r.location.clone())
                    .unwrap_or_else(|| "unknown location".to_string());
                let backtrace = report
                    .map(|r| r.backtrace)
                    .unwrap_or_else(|| "<backtrace unavailable: panic hook not installed>".to_string());
                error!(tool = name, panic = %message, %location, %backtrace, "tool handler panicked");
                append_crash_log(
                    &self.state.config.crash_log(),
                    &format!("tool {name} panicked at {location}: {message}\n{backtrace}"),
                );
                ToolError::internal(format!("Tool handler panicked: {message}")).into_result()
            }
            Err(e) => ToolError::internal(format!("Tool handler was cancelled: {e}")).into_result(),
        }
    }
}

fn unknown_tool(name: &str) -> ToolError {
    ToolError::new(
        ErrorCode::UnknownMode,
        format!("Unknown tool: {name}"),
        "Call one of the tools listed by tools/list",
    )
    .with_param("name")
    .with_hint(format!("Valid values: {}", schema::TOOL_NAMES.join(", ")))
}

/// `arguments` may be absent, an object, or an object encoded as a string.
fn tool_arguments(raw: Option<&JsonValue>) -> Result<Args, ToolError> {
    match raw {
        None | Some(JsonValue::Null) => Ok(Args::new()),
        Some(JsonValue::Object(map)) => Ok(map.clone()),
        Some(JsonValue::String(text)) => match serde_json::from_str::<JsonValue>(text) {
            Ok(JsonValue::Object(map)) => Ok(map),
            Ok(_) => Err(ToolError::invalid_json("arguments must be a JSON object")),
            Err(e) => Err(ToolError::invalid_json(e)),
        },
        Some(_) => Err(ToolError::invalid_json("arguments must be a JSON object")),
    }
}

async fn dispatch_tool(ctx: CallContext, tool: &str, args: Args) -> ToolResult {
    let outcome: ToolOutcome = match tool {
        "observe" => observe::observe(&ctx, &args).await,
        "interact" => interact::interact(&ctx, &args).await,
        "analyze" => analyze::analyze(&ctx, &args).await,
        "configure" => configure::configure(&ctx, &args).await,
        "generate" => generate::generate(&ctx, &args).await,
        other => Err(unknown_tool(other)),
    };
    let mut result = outcome.unwrap_or_else(ToolError::into_result);
    if tool == "observe" {
        piggyback(&ctx, &args, &mut result);
    }
    result
}

/// Disconnect warning and queued alerts, added to observe results.
fn piggyback(ctx: &CallContext, args: &Args, result: &mut ToolResult) {
    let mode = args
        .get("what")
        .and_then(JsonValue::as_str)
        .filter(|m| observe::MODES.contains(m));
    if let Some(mode) = mode {
        if !SERVER_SIDE_OBSERVE_MODES.contains(&mode) {
            let store = &ctx.state.store;
            if !store.connectivity().connected {
                result.content.insert(0, text_block(DISCONNECTED_WARNING));
            } else if !store.tracking_status().tracking_enabled {
                result.content.insert(0, text_block(UNTRACKED_WARNING));
            }
        }
    }
    let alerts = ctx.state.store.drain_alerts();
    if !alerts.is_empty() {
        result.content.push(text_block(format_alerts(&alerts)));
    }
}

pub fn format_alerts(alerts: &[Alert]) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "--- ALERTS ({}) ---", alerts.len());
    if alerts.len() > 3 {
        let mut parts = Vec::new();
        for category in ["regression", "anomaly", "ci", "noise", "threshold"] {
            let count = alerts.iter().filter(|a| a.category == category).count();
            if count > 0 {
                parts.push(format!("{count} {category}"));
            }
        }
        let _ = writeln!(out, "{} alerts: {}", alerts.len(), parts.join(", "));
    }
    match serde_json::to_string(alerts) {
        Ok(body) => out.push_str(&body),
        Err(e) => {
            let _ = write!(out, "[alerts could not be encoded: {e}]");
        }
    }
    out
}

fn server_details() -> InitializeResult {
    InitializeResult {
        server_info: Implementation {
            name: "gasoline".into(),
            version: VERSION.into(),
            description: Some("Browser observability bridge for AI coding assistants.".into()),
            title: Some("Gasoline".into()),
            icons: vec![],
            website_url: None,
        },
        capabilities: ServerCapabilities {
            tools: Some(ServerCapabilitiesTools { list_changed: None }),
            resources: Some(ServerCapabilitiesResources {
                list_changed: None,
                subscribe: None,
            }),
            ..Default::default()
        },
        protocol_version: PROTOCOL_VERSION.into(),
        instructions: Some(
            "Gasoline exposes what the browser extension captured: console, network, WebSocket, actions and performance. \
Start with observe (what='errors' or what='logs'). Read the gasoline://guide resource for the full workflow."
                .into(),
        ),
        meta: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use gasoline_types::{AlertSeverity, ExtensionStatusPost};

    fn handler() -> (GasolineMcpHandler, tempfile::TempDir) {
        let dir = tempfile::tempdir().expect("tempdir");
        (GasolineMcpHandler::new(AppState::new(Config::for_tests(dir.path()))), dir)
    }

    async fn call(handler: &GasolineMcpHandler, msg: JsonValue, client: Option<&str>) -> JsonRpcResponse {
        let raw = serde_json::to_vec(&msg).expect("encode");
        handler.handle_message(&raw, client).await.expect("response")
    }

    fn tool_call(tool: &str, args: JsonValue) -> JsonValue {
        json!({"jsonrpc": "2.0", "id": 1, "method": "tools/call", "params": {"name": tool, "arguments": args}})
    }

    fn first_text(resp: &JsonRpcResponse) -> String {
        resp.result.as_ref().expect("result")["content"][0]["text"]
            .as_str()
            .expect("text")
            .to_string()
    }

    fn is_error(resp: &JsonRpcResponse) -> bool {
        resp.result.as_ref().expect("result")["isError"] == json!(true)
    }

    #[tokio::test]
    async fn protocol_errors() {
        let (handler, _dir) = handler();
        let resp = handler.handle_message(b"{not json", None).await.expect("response");
        assert_eq!(resp.id, JsonValue::Null);
        assert_eq!(resp.error.expect("error").code, jsonrpc::PARSE_ERROR);

        let resp = call(&handler, json!({"jsonrpc": "2.0", "id": 2, "method": "nope"}), None).await;
        assert_eq!(resp.error.expect("error").code, METHOD_NOT_FOUND);

        let resp = call(
            &handler,
            json!({"jsonrpc": "2.0", "id": 3, "method": "resources/read", "params": {"uri": "gasoline://missing"}}),
            None,
        )
        .await;
        assert_eq!(resp.error.expect("error").code, INVALID_PARAMS);

        for raw in [&b"[]"[..], b"42", b"\"ping\""] {
            let resp = handler.handle_message(raw, None).await.expect("response");
            assert_eq!(resp.id, JsonValue::Null);
            assert_eq!(resp.error.expect("error").code, INVALID_REQUEST);
        }

        let notification = json!({"jsonrpc": "2.0", "method": "notifications/initialized"});
        let raw = serde_json::to_vec(&notification).expect("encode");
        assert!(handler.handle_message(&raw, None).await.is_none());
    }

    #[tokio::test]
    async fn initialize_and_list() {
        let (handler, _dir) = handler();
        let resp = call(&handler, json!({"jsonrpc": "2.0", "id": 1, "method": "initialize", "params": {}}), None).await;
        let result = resp.result.expect("result");
        assert_eq!(result["serverInfo"]["name"], "gasoline");
        assert!(result["capabilities"]["tools"].is_object());

        let resp = call(&handler, json!({"jsonrpc": "2.0", "id": 2, "method": "tools/list"}), None).await;
        let tools = resp.result.expect("result")["tools"].as_array().cloned().expect("tools");
        let names: Vec<&str> = tools.iter().filter_map(|t| t["name"].as_str()).collect();
        assert_eq!(names, ["observe", "interact", "analyze", "configure", "generate"]);
    }

    #[tokio::test]
    async fn observe_without_what_is_structured_missing_param() {
        let (handler, _dir) = handler();
        let resp = call(&handler, tool_call("observe", json!({})), None).await;
        assert!(is_error(&resp));
        let text = first_text(&resp);
        let (head, body) = text.split_once('\n').expect("two lines");
        assert!(head.starts_with("Error: missing_param"));
        let body: JsonValue = serde_json::from_str(body).expect("json");
        assert_eq!(body["error"], "missing_param");
        assert!(!body["retry"].as_str().expect("retry").is_empty());
        assert_eq!(body["retryable"], false);
    }

    #[tokio::test]
    async fn unknown_tool_is_a_structured_tool_error() {
        let (handler, _dir) = handler();
        let resp = call(&handler, tool_call("teleport", json!({})), None).await;
        assert!(resp.error.is_none());
        assert!(is_error(&resp));
        let text = first_text(&resp);
        let (head, body) = text.split_once('\n').expect("two lines");
        assert!(head.starts_with("Error: unknown_mode"));
        let body: JsonValue = serde_json::from_str(body).expect("json");
        assert_eq!(body["error"], "unknown_mode");
        let hint = body["hint"].as_str().expect("hint");
        for name in schema::TOOL_NAMES {
            assert!(hint.contains(name), "{hint}");
        }
    }

    #[tokio::test]
    async fn panicking_call_is_internal_error_with_logged_backtrace() {
        let (handler, dir) = handler();
        crate::lifecycle::install_panic_hook(dir.path().join("uncaught.log"));
        let result = handler
            .run_isolated("observe", async {
                if std::hint::black_box(true) {
                    panic!("boom in handler");
                }
                response::text_result("unreachable")
            })
            .await;
        assert!(is_failure(&result));
        assert!(response::first_text(&result).contains("Tool handler panicked: boom in handler"));

        let crash = std::fs::read_to_string(handler.state.config.crash_log()).expect("crash log");
        let (head, trace) = crash.split_once('\n').expect("trace after header");
        assert!(head.contains("tool observe panicked at"));
        assert!(head.contains("boom in handler"));
        assert!(!trace.trim().is_empty());
        assert!(!trace.contains("backtrace unavailable"));
    }

    #[tokio::test]
    async fn invalid_arguments_are_invalid_json() {
        let (handler, _dir) = handler();
        let resp = call(&handler, tool_call("observe", json!("{broken")), None).await;
        assert!(is_error(&resp));
        assert!(first_text(&resp).starts_with("Error: invalid_json"));
    }

    #[tokio::test]
    async fn command_result_is_isolated_per_client() {
        let (handler, _dir) = handler();
        let correlator = handler.state.store.correlator();
        let query = gasoline_types::PendingQuery::new("dom_action", json!({})).with_correlation("corr-1");
        correlator
            .create_pending_query(query, std::time::Duration::from_secs(30), Some("client-a"))
            .expect("queued");
        assert!(correlator.apply_command_result("corr-1", "complete", Some(json!({"ok": true})), None));

        let args = json!({"what": "command_result", "correlation_id": "corr-1"});
        let resp = call(&handler, tool_call("observe", args.clone()), Some("client-a")).await;
        assert!(!is_error(&resp));
        let text = first_text(&resp);
        let body: JsonValue = serde_json::from_str(text.split_once('\n').expect("two lines").1).expect("json");
        assert_eq!(body["status"], "complete");
        assert_eq!(body["result"]["ok"], true);

        let resp = call(&handler, tool_call("observe", args), Some("client-b")).await;
        assert!(is_error(&resp));
        assert!(first_text(&resp).contains("Command not found"));
    }

    #[tokio::test]
    async fn observe_piggybacks_warning_and_alerts() {
        let (handler, _dir) = handler();
        handler.state.store.push_alert(Alert {
            severity: AlertSeverity::Warning,
            category: "ci".into(),
            title: "CI failed".into(),
            detail: String::new(),
            timestamp: "2026-01-01T00:00:00Z".into(),
            source: "ci".into(),
            count: 0,
        });
        let resp = call(&handler, tool_call("observe", json!({"what": "logs"})), None).await;
        let content = resp.result.expect("result")["content"].as_array().cloned().expect("content");
        assert!(content[0]["text"].as_str().expect("text").starts_with("⚠ Extension is not connected"));
        assert!(content[1]["text"].as_str().expect("text").starts_with("Browser logs"));
        assert!(content[2]["text"].as_str().expect("text").starts_with("--- ALERTS (1) ---"));

        handler.state.store.update_extension_status(ExtensionStatusPost {
            tracking_enabled: Some(true),
            tracked_tab_id: Some(3),
            ..ExtensionStatusPost::default()
        });
        let resp = call(&handler, tool_call("observe", json!({"what": "logs"})), None).await;
        let content = resp.result.expect("result")["content"].as_array().cloned().expect("content");
        assert_eq!(content.len(), 1, "alerts are delivered once");
        assert!(content[0]["text"].as_str().expect("text").starts_with("Browser logs"));
    }

    #[tokio::test]
    async fn tool_calls_are_counted() {
        let (handler, _dir) = handler();
        call(&handler, tool_call("configure", json!({"action": "health"})), None).await;
        call(&handler, tool_call("configure", json!({})), None).await;
        let inner = handler.state.inner.lock();
        let stats = inner.tool_stats.get("configure").expect("stats");
        assert_eq!(stats.calls, 2);
        assert_eq!(stats.errors, 1);
    }
}
