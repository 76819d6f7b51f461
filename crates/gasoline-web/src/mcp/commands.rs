//! Extension round-trips: synchronous queries, async commands, and the
//! command-result envelope shared by `interact` and `observe command_result`.

use std::time::Duration;

use gasoline_capture::QueueError;
use gasoline_capture::correlator::ASYNC_COMMAND_TIMEOUT;
use gasoline_capture::time::now_nanos;
use gasoline_types::{CommandResult, CommandStatus, PendingQuery};
use serde_json::{Map as JsonMap, Value as JsonValue, json};
use tracing::debug;

use super::CallContext;
use super::args::{Args, optional_bool};
use super::errors::{ErrorCode, ToolError};
use super::evidence;
use super::response::{ToolOutcome, json_failure, json_response};
use crate::app::AppState;

/// Result keys lifted to the top level of a completed command.
const LIFTED_RESULT_KEYS: &[&str] = &[
    "timing",
    "dom_changes",
    "dom_summary",
    "analysis",
    "resolved_tab_id",
    "resolved_url",
    "target_context",
    "effective_tab_id",
    "effective_url",
    "effective_title",
    "final_url",
    "title",
];

const SUGGESTED_RETRY_MS: u64 = 2000;

#[derive(Debug)]
pub enum QueryFailure {
    QueueFull(QueueError),
    Timeout,
}

impl From<QueueError> for QueryFailure {
    fn from(e: QueueError) -> Self {
        QueryFailure::QueueFull(e)
    }
}

impl QueryFailure {
    pub fn into_tool_error(self, what: &str, waited: Duration) -> ToolError {
        match self {
            QueryFailure::QueueFull(e) => queue_full(e),
            QueryFailure::Timeout => ToolError::ext_timeout(what, waited.as_secs()),
        }
    }
}

pub fn queue_full(e: QueueError) -> ToolError {
    ToolError::rate_limited(format!("Too many pending extension requests: {e}"))
}

/// Enqueues `query` and blocks until the extension posts its result.
pub async fn run_query(
    state: &AppState,
    client_id: Option<&str>,
    query: PendingQuery,
    timeout: Duration,
) -> Result<JsonValue, QueryFailure> {
    let correlator = state.store.correlator();
    let id = correlator.create_pending_query(query, timeout, client_id)?;
    correlator
        .wait_for_result(&id, timeout)
        .await
        .ok_or(QueryFailure::Timeout)
}

/// `<prefix>_<unix-nanos>_<random>`.
pub fn new_correlation_id(prefix: &str) -> String {
    let random = uuid::Uuid::new_v4().as_u128() as u32;
    format!("{prefix}_{}_{random:08x}", now_nanos())
}

/// Queues an async command for the extension and returns its correlation id.
pub fn enqueue_command(
    ctx: &CallContext,
    kind: &str,
    params: JsonValue,
    prefix: &str,
    tab_id: Option<i64>,
) -> Result<String, ToolError> {
    let correlation_id = new_correlation_id(prefix);
    enqueue_with_id(ctx, kind, params, &correlation_id, tab_id)?;
    Ok(correlation_id)
}

/// Like [`enqueue_command`], for callers that need the id before queuing.
pub fn enqueue_with_id(
    ctx: &CallContext,
    kind: &str,
    params: JsonValue,
    correlation_id: &str,
    tab_id: Option<i64>,
) -> Result<(), ToolError> {
    let query = PendingQuery::new(kind, params)
        .with_tab(tab_id)
        .with_correlation(correlation_id);
    ctx.state
        .store
        .correlator()
        .create_pending_query(query, ASYNC_COMMAND_TIMEOUT, ctx.client())
        .map_err(queue_full)?;
    debug!(correlation_id, kind, "command queued");
    Ok(())
}

fn wants_background(args: &Args) -> Result<bool, ToolError> {
    Ok(optional_bool(args, "background")? == Some(true)
        || optional_bool(args, "sync")? == Some(false)
        || optional_bool(args, "wait")? == Some(false))
}

fn not_connected() -> ToolError {
    ToolError::new(
        ErrorCode::NoData,
        "Extension is not connected",
        "Ensure the Gasoline extension shows 'Connected' and a tab is tracked.",
    )
}

/// Refuses a synchronous call up front when no extension is polling, so
/// nothing is queued or recorded for a command that would only be reported
/// as failed. Background calls are always accepted.
pub fn ensure_reachable(ctx: &CallContext, args: &Args) -> Result<(), ToolError> {
    if wants_background(args)? || ctx.state.store.connectivity().connected {
        return Ok(());
    }
    Err(not_connected())
}

/// Blocks until the command settles, unless the caller asked for background
/// execution. Gives up with a `still_processing` handle the caller can poll.
pub async fn maybe_wait(
    ctx: &CallContext,
    correlation_id: &str,
    args: &Args,
    queued_summary: &str,
) -> ToolOutcome {
    if wants_background(args)? {
        return json_response(
            queued_summary,
            &json!({
                "status": "queued",
                "correlation_id": correlation_id,
                "queued": true,
                "final": false,
            }),
        );
    }

    let store = &ctx.state.store;
    if !store.connectivity().connected {
        return Err(not_connected());
    }

    let config = &ctx.state.config;
    let correlator = store.correlator();
    let not_found = |stage: &str| ToolError::internal(format!("Command not found {stage}"));
    let mut attempts = 1;
    let mut total_wait = config.command_wait;
    let mut cmd = correlator
        .wait_for_command(correlation_id, config.command_wait)
        .await
        .ok_or_else(|| not_found("after queuing"))?;
    if cmd.status == CommandStatus::Pending && store.connectivity().connected {
        attempts = 2;
        total_wait += config.command_retry_wait;
        cmd = correlator
            .wait_for_command(correlation_id, config.command_retry_wait)
            .await
            .ok_or_else(|| not_found("after retry"))?;
    }

    if cmd.status == CommandStatus::Pending {
        let mut body = json!({
            "status": "still_processing",
            "correlation_id": correlation_id,
            "queued": false,
            "final": false,
            "elapsed_ms": cmd.elapsed_ms,
            "queue_depth": correlator.queue_depth(),
            "retry_context": {
                "attempts": attempts,
                "total_wait_ms": total_wait.as_millis() as u64,
                "extension_connected": store.connectivity().connected,
            },
            "suggested_retry_ms": SUGGESTED_RETRY_MS,
            "message": format!(
                "Action is taking longer than expected. Polling is now required. Use observe({{what:'command_result', correlation_id:'{correlation_id}'}}) to check the result."
            ),
        });
        if let Some(position) = correlator.queue_position(correlation_id) {
            body["queue_position"] = json!(position);
        }
        return json_response("Action still processing", &body);
    }

    format_command_result(&ctx.state, cmd).await
}

/// Error text reported inside an otherwise complete result.
fn embedded_error(result: &JsonMap<String, JsonValue>) -> Option<String> {
    let text = |key: &str| {
        result
            .get(key)
            .and_then(JsonValue::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    };
    if result.get("success").and_then(JsonValue::as_bool) == Some(false) {
        return Some(
            text("error")
                .or_else(|| text("message"))
                .unwrap_or_else(|| "Command reported success=false".to_string()),
        );
    }
    if result.contains_key("error") {
        return text("error").or_else(|| text("message"));
    }
    None
}

pub async fn format_command_result(state: &AppState, cmd: CommandResult) -> ToolOutcome {
    let id = cmd.correlation_id.clone();
    let mut body = JsonMap::new();
    body.insert("correlation_id".into(), json!(id));
    body.insert("status".into(), json!(cmd.status.as_str()));
    body.insert("queued".into(), json!(false));
    body.insert("created_at".into(), json!(cmd.created_at));
    body.insert("elapsed_ms".into(), json!(cmd.elapsed_ms));

    match cmd.status {
        CommandStatus::Complete => {
            body.insert("final".into(), json!(true));
            body.insert("result".into(), cmd.result.clone().unwrap_or(JsonValue::Null));
            if let Some(completed_at) = &cmd.completed_at {
                body.insert("completed_at".into(), json!(completed_at));
            }
            body.insert("timing_ms".into(), json!(cmd.elapsed_ms));

            let mut error = cmd.error.clone().filter(|e| !e.is_empty());
            if let Some(result) = cmd.result.as_ref().and_then(JsonValue::as_object) {
                for key in LIFTED_RESULT_KEYS {
                    if let Some(value) = result.get(*key) {
                        body.insert((*key).to_string(), value.clone());
                    }
                }
                if error.is_none() {
                    error = embedded_error(result);
                }
            }
            if let Some(diff) = state.store.take_perf_diff(&id) {
                body.insert("perf_diff".into(), json!(diff));
            }
            evidence::attach(state, &id, &mut body).await;

            if let Some(error) = error {
                let summary = format!("FAILED — Command {id} completed with error: {error}");
                body.insert("error".into(), json!(error));
                return json_failure(&summary, &body);
            }
            json_response(&format!("Command {id}: complete"), &body)
        }
        CommandStatus::Error | CommandStatus::Cancelled => {
            body.insert("final".into(), json!(true));
            let error = cmd
                .error
                .clone()
                .filter(|e| !e.is_empty())
                .unwrap_or_else(|| "Command failed in extension".to_string());
            body.insert("error".into(), json!(error));
            if let Some(result) = &cmd.result {
                body.insert("result".into(), result.clone());
            }
            evidence::attach(state, &id, &mut body).await;
            json_failure(&format!("FAILED — Command {id} error: {error}"), &body)
        }
        CommandStatus::Expired => {
            let error = cmd.error.clone().unwrap_or_default();
            body.insert("final".into(), json!(true));
            body.insert("error".into(), json!(ErrorCode::ExtTimeout.as_str()));
            body.insert(
                "message".into(),
                json!(format!(
                    "Command {id} expired before the extension could execute it. Error: {error}"
                )),
            );
            body.insert(
                "retry".into(),
                json!("The browser extension may be disconnected or the page is not active. Check observe with what='pilot' to verify extension status, then retry the command."),
            );
            json_failure(&format!("FAILED — Command {id} expired: {error}"), &body)
        }
        CommandStatus::Timeout => {
            let error = cmd.error.clone().unwrap_or_default();
            body.insert("final".into(), json!(true));
            body.insert("error".into(), json!(ErrorCode::ExtTimeout.as_str()));
            body.insert(
                "message".into(),
                json!(format!(
                    "Command {id} timed out waiting for the extension to respond. Error: {error}"
                )),
            );
            body.insert(
                "retry".into(),
                json!("The command took too long. The page may be unresponsive or the action is stuck. Try refreshing the page with interact action='refresh', then retry."),
            );
            json_failure(&format!("FAILED — Command {id} timed out: {error}"), &body)
        }
        CommandStatus::Pending => {
            body.insert("final".into(), json!(false));
            json_response(&format!("Command {id}: pending"), &body)
        }
    }
}
