//! `configure`: server-side knobs and introspection.

use gasoline_capture::{Category, ClearScope, PilotReadiness};
use serde_json::{Value as JsonValue, json};
use tracing::{info, warn};

use super::CallContext;
use super::args::{Args, optional_bool, optional_string, required_string, select_mode};
use super::errors::{ErrorCode, ToolError};
use super::response::{ToolOutcome, json_response};
use crate::app::SecurityMode;
use crate::config::VERSION;

pub const MODES: &[&str] = &["clear", "health", "security_mode", "store", "tracking"];

const STORE_ACTIONS: &[&str] = &["delete", "list", "load", "save", "stats"];
const DEFAULT_NAMESPACE: &str = "default";
const MAX_STORE_KEYS: usize = 1000;

pub async fn configure(ctx: &CallContext, args: &Args) -> ToolOutcome {
    match select_mode(args, &["action"], MODES, "configure")? {
        "clear" => clear(ctx, args),
        "health" => health(ctx),
        "security_mode" => security_mode(ctx, args),
        "store" => store(ctx, args),
        "tracking" => tracking(ctx),
        other => Err(ToolError::internal(format!("configure action {other} has no handler"))),
    }
}

fn clear(ctx: &CallContext, args: &Args) -> ToolOutcome {
    let buffer = optional_string(args, "buffer")?.unwrap_or_else(|| "all".to_string());
    let scope: ClearScope = buffer.parse().map_err(|_| {
        let names: Vec<&str> = Category::ALL.iter().map(|c| c.as_str()).collect();
        ToolError::invalid_param("buffer", format!("Unknown buffer: {buffer}"), "Use a valid buffer value")
            .with_hint(format!("all, logs, {}", names.join(", ")))
    })?;
    let cleared: Vec<&str> = ctx.state.store.clear(scope).iter().map(|c| c.as_str()).collect();
    json_response(
        "Buffer cleared",
        &json!({
            "status": "ok",
            "buffer": buffer,
            "cleared": cleared,
        }),
    )
}

fn health(ctx: &CallContext) -> ToolOutcome {
    let store = &ctx.state.store;
    let snapshot = store.health();
    let (tools, security_mode) = {
        let inner = ctx.state.inner.lock();
        (inner.tool_stats.clone(), inner.security_mode)
    };
    json_response(
        "Server health",
        &json!({
            "server": {
                "version": VERSION,
                "uptime_seconds": store.uptime().as_secs(),
                "pid": std::process::id(),
                "security_mode": security_mode.as_str(),
            },
            "logs": snapshot.logs,
            "buffers": snapshot.buffers,
            "extension": snapshot.extension,
            "circuit": snapshot.circuit,
            "active_websockets": snapshot.active_websockets,
            "alerts_queued": snapshot.alerts_queued,
            "commands": {
                "queue_depth": store.correlator().queue_depth(),
                "evidence_tracked": ctx.state.evidence.len(),
                "evidence_evicted_unfinalized": ctx.state.evidence.evicted_unfinalized(),
            },
            "tools": tools,
        }),
    )
}

fn security_response(mode: SecurityMode, summary: &str) -> ToolOutcome {
    json_response(
        summary,
        &json!({
            "security_mode": mode.as_str(),
            "production_parity": mode == SecurityMode::Normal,
        }),
    )
}

fn security_mode(ctx: &CallContext, args: &Args) -> ToolOutcome {
    let Some(requested) = optional_string(args, "mode")? else {
        let current = ctx.state.inner.lock().security_mode;
        return security_response(current, "Security mode");
    };
    let mode = match requested.as_str() {
        "normal" => SecurityMode::Normal,
        "insecure_proxy" => SecurityMode::InsecureProxy,
        other => {
            return Err(ToolError::invalid_param(
                "mode",
                format!("Invalid security mode: {other}"),
                "Use mode='normal' or mode='insecure_proxy'",
            ));
        }
    };
    if mode == SecurityMode::InsecureProxy && optional_bool(args, "confirm")? != Some(true) {
        return Err(ToolError::invalid_param(
            "confirm",
            "Switching to insecure_proxy requires explicit confirmation",
            "Call again with confirm=true to acknowledge that production parity is lost",
        ));
    }
    let previous = std::mem::replace(&mut ctx.state.inner.lock().security_mode, mode);
    if previous != mode {
        if mode == SecurityMode::InsecureProxy {
            warn!(from = previous.as_str(), to = mode.as_str(), "security mode changed");
        } else {
            info!(from = previous.as_str(), to = mode.as_str(), "security mode changed");
        }
    }
    security_response(mode, "Security mode updated")
}

fn store_key(namespace: &str, key: &str) -> String {
    format!("{namespace}/{key}")
}

/// Session key/value store, namespaced. Lives only as long as the process.
fn store(ctx: &CallContext, args: &Args) -> ToolOutcome {
    let action = optional_string(args, "store_action")?.unwrap_or_else(|| "list".to_string());
    if !STORE_ACTIONS.contains(&action.as_str()) {
        return Err(ToolError::invalid_param(
            "store_action",
            format!("Unknown store_action: {action}"),
            "Use a valid store_action value",
        )
        .with_hint(format!("Valid values: {}", STORE_ACTIONS.join(", "))));
    }
    let namespace = optional_string(args, "namespace")?.unwrap_or_else(|| DEFAULT_NAMESPACE.to_string());
    let prefix = format!("{namespace}/");
    let mut inner = ctx.state.inner.lock();
    let kv = &mut inner.kv;

    let body = match action.as_str() {
        "save" => {
            let key = required_string(args, "key", "Add the 'key' parameter to name the stored value")?;
            let data = args
                .get("data")
                .filter(|d| !d.is_null())
                .cloned()
                .ok_or_else(|| ToolError::missing_param("data", "Add the 'data' parameter with the value to store"))?;
            let full = store_key(&namespace, &key);
            if !kv.contains_key(&full) && kv.len() >= MAX_STORE_KEYS {
                return Err(ToolError::new(
                    ErrorCode::RateLimited,
                    format!("Session store is full ({MAX_STORE_KEYS} keys)"),
                    "Delete unused keys with store_action='delete', then retry",
                ));
            }
            kv.insert(full, data);
            json!({"status": "saved", "namespace": namespace, "key": key})
        }
        "load" => {
            let key = required_string(args, "key", "Add the 'key' parameter to name the value to load")?;
            let Some(data) = kv.get(&store_key(&namespace, &key)) else {
                return Err(ToolError::new(
                    ErrorCode::NoData,
                    format!("Key not found: {namespace}/{key}"),
                    "Use store_action='list' to see stored keys",
                ));
            };
            json!({"namespace": namespace, "key": key, "data": data})
        }
        "delete" => {
            let key = required_string(args, "key", "Add the 'key' parameter to name the value to delete")?;
            let existed = kv.remove(&store_key(&namespace, &key)).is_some();
            json!({"status": if existed { "deleted" } else { "not_found" }, "namespace": namespace, "key": key})
        }
        "stats" => {
            let namespaces: std::collections::BTreeSet<&str> =
                kv.keys().filter_map(|k| k.split_once('/').map(|(ns, _)| ns)).collect();
            json!({"total_keys": kv.len(), "namespaces": namespaces, "max_keys": MAX_STORE_KEYS})
        }
        _ => {
            let keys: Vec<&str> = kv.keys().filter_map(|k| k.strip_prefix(&prefix)).collect();
            json!({"namespace": namespace, "keys": keys, "count": keys.len()})
        }
    };
    json_response("Store operation complete", &body)
}

fn tracking(ctx: &CallContext) -> ToolOutcome {
    let store = &ctx.state.store;
    let status = store.tracking_status();
    let connectivity = store.connectivity();
    let pilot = match store.pilot_readiness() {
        PilotReadiness::Ready => "enabled",
        PilotReadiness::Disabled => "disabled",
        PilotReadiness::NeverConnected => "unknown",
    };
    let mut body = json!({
        "tracking_enabled": status.tracking_enabled,
        "tracked_tab_id": status.tracked_tab_id,
        "tracked_tab_url": status.tracked_tab_url,
        "extension_connected": connectivity.connected,
        "extension_status": connectivity.status,
        "pilot": pilot,
    });
    if !status.tracking_enabled {
        body["hint"] = JsonValue::from(
            "Tracking is controlled from the extension popup: open it on the tab to observe and click 'Track This Tab'.",
        );
    }
    json_response("Tracking status", &body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::response::{first_text};
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
        let text = first_text(&result).to_string();
        serde_json::from_str(text.split_once('\n').expect("summary line").1).expect("json body")
    }

    #[tokio::test]
    async fn insecure_proxy_needs_confirmation() {
        let (ctx, _dir) = ctx();
        let err = configure(&ctx, &args(json!({"action": "security_mode", "mode": "insecure_proxy"})))
            .await
            .expect_err("unconfirmed");
        assert_eq!(err.code, ErrorCode::InvalidParam);
        assert_eq!(err.param.as_deref(), Some("confirm"));
        assert_eq!(ctx.state.inner.lock().security_mode, SecurityMode::Normal);

        let body = body_of(
            configure(
                &ctx,
                &args(json!({"action": "security_mode", "mode": "insecure_proxy", "confirm": true})),
            )
            .await,
        );
        assert_eq!(body["security_mode"], "insecure_proxy");
        assert_eq!(body["production_parity"], false);

        let body = body_of(configure(&ctx, &args(json!({"action": "security_mode", "mode": "normal"}))).await);
        assert_eq!(body["production_parity"], true);
    }

    #[tokio::test]
    async fn clear_preserves_positions_and_rejects_unknown_buffers() {
        let (ctx, _dir) = ctx();
        ctx.state.store.add_logs(vec![json!({"level": "info", "message": "a"})]);
        let body = body_of(configure(&ctx, &args(json!({"action": "clear", "buffer": "logs"}))).await);
        assert_eq!(body["cleared"], json!(["console"]));
        assert!(ctx.state.store.console_entries().is_empty());
        assert_eq!(ctx.state.store.console_position(), 1);

        let err = configure(&ctx, &args(json!({"action": "clear", "buffer": "bogus"})))
            .await
            .expect_err("unknown buffer");
        assert_eq!(err.code, ErrorCode::InvalidParam);

        let body = body_of(configure(&ctx, &args(json!({"action": "clear"}))).await);
        assert_eq!(body["buffer"], "all");
        assert_eq!(body["cleared"].as_array().expect("cleared").len(), Category::ALL.len());
    }

    #[tokio::test]
    async fn store_round_trip_by_namespace() {
        let (ctx, _dir) = ctx();
        let save = json!({"action": "store", "store_action": "save", "namespace": "notes", "key": "bug", "data": {"id": 7}});
        body_of(configure(&ctx, &args(save)).await);

        let body = body_of(
            configure(&ctx, &args(json!({"action": "store", "store_action": "load", "namespace": "notes", "key": "bug"}))).await,
        );
        assert_eq!(body["data"]["id"], 7);

        let body = body_of(configure(&ctx, &args(json!({"action": "store", "namespace": "notes"}))).await);
        assert_eq!(body["keys"], json!(["bug"]));

        let err = configure(&ctx, &args(json!({"action": "store", "store_action": "load", "key": "bug"})))
            .await
            .expect_err("other namespace");
        assert_eq!(err.code, ErrorCode::NoData);

        let err = configure(&ctx, &args(json!({"action": "store", "store_action": "explode"})))
            .await
            .expect_err("bad action");
        assert_eq!(err.code, ErrorCode::InvalidParam);
    }

    #[tokio::test]
    async fn health_reports_version_and_tools() {
        let (ctx, _dir) = ctx();
        ctx.state.inner.lock().record_tool_call("observe", false);
        let body = body_of(configure(&ctx, &args(json!({"action": "health"}))).await);
        assert_eq!(body["server"]["version"], VERSION);
        assert_eq!(body["tools"]["observe"]["calls"], 1);
        assert_eq!(body["extension"]["connected"], false);
    }

    #[tokio::test]
    async fn tracking_hints_when_disabled() {
        let (ctx, _dir) = ctx();
        let body = body_of(configure(&ctx, &args(json!({"action": "tracking"}))).await);
        assert_eq!(body["tracking_enabled"], false);
        assert!(body["hint"].is_string());
    }
}
