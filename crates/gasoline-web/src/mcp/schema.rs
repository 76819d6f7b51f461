//! Tool descriptors for `tools/list` and the static usage guide resource.

use rust_mcp_sdk::schema::{Resource, Tool};
use serde::de::DeserializeOwned;
use serde_json::{Value as JsonValue, json};
use tracing::error;

use super::{analyze, configure, generate, interact, observe};

pub const TOOL_NAMES: &[&str] = &["observe", "interact", "analyze", "configure", "generate"];

pub const GUIDE_URI: &str = "gasoline://guide";

pub const GUIDE: &str = r#"# Gasoline usage guide

Gasoline bridges a browser extension and AI coding assistants. The extension
captures console logs, network traffic, WebSocket frames, user actions and
performance data from the tracked tab; these tools read and act on it.

## Workflow

1. `observe` with `what: "errors"` to see what is broken right now.
2. `observe` with `what: "error_bundles"` to get each error joined with the
   network calls, actions and logs that happened just before it.
3. `interact` to reproduce or fix (`navigate`, `click`, `type`, `execute_js`).
   Commands run asynchronously; a slow one returns a `correlation_id` you can
   poll with `observe` `what: "command_result"`.
4. `generate` with `format: "reproduction"` or `"test"` to turn the recorded
   actions into a Playwright script.

## Tips

- If results are empty, check `observe` `what: "pilot"` and make sure a tab
  is tracked from the extension popup.
- `interact` actions accept `background: true` to return immediately.
- `evidence: "always"` attaches before/after screenshots to a command result.
- Errors are two lines: `Error: <code> — <what to do>` and a JSON body with
  `retryable` and, when it makes sense, `retry_after_ms`.
"#;

/// Decodes a descriptor table into SDK schema types. Entries that do not
/// fit are logged and left out.
fn decode<T: DeserializeOwned>(what: &str, raw: Vec<JsonValue>) -> Vec<T> {
    raw.into_iter()
        .filter_map(|value| {
            let name = value["name"].as_str().unwrap_or_default().to_string();
            serde_json::from_value(value)
                .map_err(|e| error!(what, %name, error = %e, "invalid MCP descriptor"))
                .ok()
        })
        .collect()
}

pub fn resources() -> Vec<Resource> {
    decode("resource", vec![guide_resource_json()])
}

pub fn tool_descriptors() -> Vec<Tool> {
    decode("tool", tool_descriptor_json())
}

fn guide_resource_json() -> JsonValue {
    json!({
        "uri": GUIDE_URI,
        "name": "Gasoline guide",
        "description": "How to use the Gasoline tools together",
        "mimeType": "text/markdown",
    })
}

fn tool_descriptor_json() -> Vec<JsonValue> {
    vec![
        json!({
            "name": "observe",
            "description": "Read what the browser extension captured: console errors and logs, network requests and bodies, WebSocket traffic, user actions, web vitals, screenshots, and async command results.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "what": {"type": "string", "enum": observe::MODES, "description": "What to read"},
                    "limit": {"type": "number", "description": "Max entries (default 100, max 1000)"},
                    "level": {"type": "string", "description": "Exact log level"},
                    "min_level": {"type": "string", "description": "Minimum log level: debug, log, info, warn, error"},
                    "source": {"type": "string", "description": "Substring filter on log source"},
                    "url": {"type": "string", "description": "Substring filter on URL"},
                    "method": {"type": "string", "description": "HTTP method filter"},
                    "status_min": {"type": "number"},
                    "status_max": {"type": "number"},
                    "tab_id": {"type": "number"},
                    "scope": {"type": "string", "enum": ["current_page", "all"]},
                    "format": {"type": "string", "enum": ["json", "markdown"]},
                    "window_seconds": {"type": "number", "description": "error_bundles context window (default 3, max 10)"},
                    "correlation_id": {"type": "string", "description": "For command_result"},
                    "connection_id": {"type": "string"},
                    "direction": {"type": "string", "enum": ["incoming", "outgoing"]},
                    "quality": {"type": "number", "description": "JPEG quality for screenshot"},
                    "include": {"type": "array", "items": {"type": "string"}, "description": "Extra sections for page"},
                },
                "required": ["what"],
            },
        }),
        json!({
            "name": "interact",
            "description": "Drive the tracked browser tab: navigate, click, type, run JavaScript, upload files, take screenshots. Requires AI Web Pilot to be enabled in the extension.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "action": {"type": "string", "enum": interact::MODES},
                    "selector": {"type": "string", "description": "CSS or semantic selector (text=, role=, label=, placeholder=, aria-label=)"},
                    "text": {"type": "string"},
                    "value": {"type": "string"},
                    "name": {"type": "string", "description": "Attribute name for get_attribute / set_attribute"},
                    "url": {"type": "string"},
                    "script": {"type": "string"},
                    "world": {"type": "string", "enum": ["auto", "main", "isolated"]},
                    "file_path": {"type": "string", "description": "Absolute path for upload"},
                    "tab_id": {"type": "number"},
                    "pierce_shadow": {"description": "true, false or \"auto\""},
                    "evidence": {"type": "string", "enum": ["off", "on_mutation", "always"]},
                    "background": {"type": "boolean", "description": "Return a correlation_id immediately"},
                },
                "required": ["action"],
            },
        }),
        json!({
            "name": "analyze",
            "description": "Run audits: accessibility, DOM queries, page summaries, link health in the page, server-side link validation, error clustering and performance baselines.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "what": {"type": "string", "enum": analyze::MODES},
                    "selector": {"type": "string"},
                    "urls": {"type": "array", "items": {"type": "string"}, "description": "For link_validation (max 1000)"},
                    "timeout_ms": {"type": "number"},
                    "max_workers": {"type": "number"},
                    "scope": {"type": "string"},
                    "tags": {"type": "array", "items": {"type": "string"}},
                    "url": {"type": "string"},
                    "tab_id": {"type": "number"},
                    "background": {"type": "boolean"},
                },
                "required": ["what"],
            },
        }),
        json!({
            "name": "configure",
            "description": "Server settings and state: clear buffers, health, security mode, session key/value store, tracking status.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "action": {"type": "string", "enum": configure::MODES},
                    "buffer": {"type": "string", "description": "For clear: all, logs, console, network, websocket, actions, waterfall, performance, extension_logs"},
                    "mode": {"type": "string", "enum": ["normal", "insecure_proxy"]},
                    "confirm": {"type": "boolean"},
                    "store_action": {"type": "string", "enum": ["delete", "list", "load", "save", "stats"]},
                    "namespace": {"type": "string"},
                    "key": {"type": "string"},
                    "data": {"description": "Any JSON value to store"},
                },
                "required": ["action"],
            },
        }),
        json!({
            "name": "generate",
            "description": "Generate artifacts from captured data: Playwright reproduction scripts and tests, HAR exports, PR summaries.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "format": {"type": "string", "enum": generate::MODES},
                    "output_format": {"type": "string", "enum": ["playwright", "gasoline"]},
                    "last_n": {"type": "number"},
                    "base_url": {"type": "string"},
                    "error_message": {"type": "string"},
                    "test_name": {"type": "string"},
                    "assert_no_errors": {"type": "boolean"},
                    "assert_network": {"type": "boolean"},
                    "url": {"type": "string"},
                    "method": {"type": "string"},
                    "status_min": {"type": "number"},
                    "status_max": {"type": "number"},
                    "save_to": {"type": "string"},
                },
                "required": ["format"],
            },
        }),
    ]
}
