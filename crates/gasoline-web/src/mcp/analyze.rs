//! `analyze`: audits that either run in the extension (accessibility, DOM
//! queries, page summaries, link health) or are computed server-side from
//! captured data (error clusters, performance, link validation).

use std::collections::HashMap;
use std::time::Duration;

use gasoline_capture::Category;
use gasoline_types::{LogEntry, LogLevel, PendingQuery};
use serde::Serialize;
use serde_json::{Value as JsonValue, json};
use tracing::info;

use super::CallContext;
use super::args::{Args, clamp_or_default, optional_i64, optional_string, required_string, select_mode};
use super::commands::{enqueue_command, ensure_reachable, maybe_wait, run_query};
use super::errors::{ErrorCode, ToolError};
use super::links;
use super::observe::{self, Metadata};
use super::response::{ToolOutcome, json_response, truncate_chars};

pub const MODES: &[&str] = &[
    "accessibility",
    "dom",
    "error_clusters",
    "link_health",
    "link_validation",
    "page_summary",
    "performance",
];

const A11Y_WAIT: Duration = Duration::from_secs(30);
const CLUSTER_KEY_CHARS: usize = 100;
const PAGE_SUMMARY_DEFAULT_TIMEOUT_MS: i64 = 10_000;
const PAGE_SUMMARY_MAX_TIMEOUT_MS: i64 = 30_000;

/// Runs in the page; returns a compact description of what is on screen.
const PAGE_SUMMARY_SCRIPT: &str = r#"(() => {
  const text = (el) => (el && el.textContent ? el.textContent.replace(/\s+/g, ' ').trim() : '');
  const headings = Array.from(document.querySelectorAll('h1,h2,h3')).slice(0, 30)
    .map((h) => ({ level: Number(h.tagName.slice(1)), text: text(h).slice(0, 120) }));
  const forms = Array.from(document.forms).slice(0, 10).map((f) => ({
    id: f.id || null,
    action: f.getAttribute('action') || null,
    fields: Array.from(f.elements).slice(0, 30)
      .map((e) => e.name || e.id || e.type).filter(Boolean),
  }));
  const main = document.querySelector('main,[role=main],article') || document.body;
  const interactive = document.querySelectorAll('a[href],button,input,select,textarea,[role=button]').length;
  let type = 'generic';
  if (document.forms.length > 0 && document.querySelector('input[type=password]')) type = 'auth';
  else if (document.querySelector('article')) type = 'article';
  else if (document.forms.length > 0) type = 'form';
  else if (document.querySelectorAll('table,[role=grid]').length > 0) type = 'data';
  return {
    url: location.href,
    title: document.title,
    type,
    headings,
    forms,
    link_count: document.links.length,
    interactive_count: interactive,
    main_text_preview: text(main).slice(0, 500),
  };
})()"#;

pub async fn analyze(ctx: &CallContext, args: &Args) -> ToolOutcome {
    match select_mode(args, &["what"], MODES, "analyze")? {
        "accessibility" => accessibility(ctx, args).await,
        "dom" => dom(ctx, args).await,
        "error_clusters" => error_clusters(ctx),
        "link_health" => link_health(ctx, args).await,
        "link_validation" => link_validation(args).await,
        "page_summary" => page_summary(ctx, args).await,
        "performance" => performance(ctx, args),
        other => Err(ToolError::internal(format!("analyze mode {other} has no handler"))),
    }
}

fn tab_id(args: &Args) -> Result<Option<i64>, ToolError> {
    Ok(optional_i64(args, "tab_id")?.filter(|id| *id > 0))
}

async fn accessibility(ctx: &CallContext, args: &Args) -> ToolOutcome {
    if !ctx.state.store.tracking_status().tracking_enabled {
        return Err(ToolError::new(
            ErrorCode::NoData,
            "No tab is tracked, so there is no page to audit",
            "Enable tracking on a tab from the Gasoline extension popup, then retry",
        ));
    }
    let params = json!({
        "scope": args.get("scope").cloned().unwrap_or(JsonValue::Null),
        "tags": args.get("tags").cloned().unwrap_or(JsonValue::Null),
        "frame": args.get("frame").cloned().unwrap_or(JsonValue::Null),
    });
    let query = PendingQuery::new("a11y", params).with_tab(tab_id(args)?);
    let mut audit = run_query(&ctx.state, ctx.client(), query, A11Y_WAIT)
        .await
        .map_err(|e| e.into_tool_error("accessibility audit", A11Y_WAIT))?;

    if let Some(error) = audit.get("error").and_then(JsonValue::as_str) {
        return Err(ToolError::new(
            ErrorCode::ExtError,
            format!("Accessibility audit failed in the extension: {error}"),
            "Reload the page and retry the audit",
        ));
    }
    if let Some(map) = audit.as_object_mut() {
        if !map.contains_key("summary") {
            let count = |key: &str| map.get(key).and_then(JsonValue::as_array).map_or(0, Vec::len);
            let summary = json!({
                "violation_count": count("violations"),
                "pass_count": count("passes"),
            });
            map.insert("summary".into(), summary);
        }
    }
    json_response("A11y audit", &audit)
}

async fn dom(ctx: &CallContext, args: &Args) -> ToolOutcome {
    required_string(args, "selector", "Add the 'selector' parameter with a CSS selector to query")?;
    ensure_reachable(ctx, args)?;
    let id = enqueue_command(ctx, "dom", JsonValue::Object(args.clone()), "dom", tab_id(args)?)?;
    maybe_wait(ctx, &id, args, "DOM query queued").await
}

async fn link_health(ctx: &CallContext, args: &Args) -> ToolOutcome {
    ensure_reachable(ctx, args)?;
    let id = enqueue_command(
        ctx,
        "link_health",
        JsonValue::Object(args.clone()),
        "link_health",
        tab_id(args)?,
    )?;
    maybe_wait(ctx, &id, args, "Link health check initiated").await
}

async fn page_summary(ctx: &CallContext, args: &Args) -> ToolOutcome {
    let world = optional_string(args, "world")?.unwrap_or_else(|| "isolated".to_string());
    if !["auto", "isolated", "main"].contains(&world.as_str()) {
        return Err(ToolError::invalid_param(
            "world",
            format!("Invalid 'world' value: {world}"),
            "Use 'isolated' (default), 'main' or 'auto'",
        ));
    }
    let timeout_ms = clamp_or_default(
        optional_i64(args, "timeout_ms")?,
        PAGE_SUMMARY_DEFAULT_TIMEOUT_MS,
        1,
        PAGE_SUMMARY_MAX_TIMEOUT_MS,
    );
    let params = json!({
        "script": PAGE_SUMMARY_SCRIPT,
        "timeout_ms": timeout_ms,
        "world": world,
        "reason": "page_summary",
    });
    ensure_reachable(ctx, args)?;
    let id = enqueue_command(ctx, "execute", params, "page_summary", tab_id(args)?)?;
    maybe_wait(ctx, &id, args, "Page summary queued").await
}

#[derive(Debug, Serialize)]
struct ErrorCluster {
    message: String,
    count: usize,
    first_seen: Option<String>,
    last_seen: Option<String>,
    urls: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stack_trace: Option<String>,
}

/// Groups error entries whose messages share the same leading characters.
fn cluster_errors(entries: &[LogEntry]) -> Vec<ErrorCluster> {
    let mut clusters: Vec<ErrorCluster> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();
    for entry in entries
        .iter()
        .filter(|e| e.level == LogLevel::Error && !e.is_internal())
    {
        let key: String = entry.message_str().chars().take(CLUSTER_KEY_CHARS).collect();
        let slot = *index.entry(key).or_insert_with(|| {
            clusters.push(ErrorCluster {
                message: truncate_chars(entry.message_str(), 200),
                count: 0,
                first_seen: entry.timestamp.clone(),
                last_seen: None,
                urls: Vec::new(),
                stack_trace: None,
            });
            clusters.len() - 1
        });
        let cluster = &mut clusters[slot];
        cluster.count += 1;
        cluster.last_seen = entry.timestamp.clone().or(cluster.last_seen.take());
        if let Some(url) = entry.url.as_deref().filter(|u| !u.is_empty()) {
            if !cluster.urls.iter().any(|u| u == url) {
                cluster.urls.push(url.to_string());
            }
        }
        if cluster.stack_trace.is_none() {
            cluster.stack_trace = entry.stack.clone().filter(|s| !s.is_empty());
        }
    }
    clusters.sort_by(|a, b| b.count.cmp(&a.count));
    clusters
}

fn error_clusters(ctx: &CallContext) -> ToolOutcome {
    let store = &ctx.state.store;
    let clusters = cluster_errors(&store.console_entries());
    let total: usize = clusters.iter().map(|c| c.count).sum();
    let meta: Metadata = observe::metadata(&ctx.state, store.last_write(Category::Console));
    json_response(
        &format!("Error clusters ({} clusters, {total} errors)", clusters.len()),
        &json!({
            "clusters": clusters,
            "total_count": total,
            "metadata": meta,
        }),
    )
}

fn performance(ctx: &CallContext, args: &Args) -> ToolOutcome {
    let store = &ctx.state.store;
    let meta = observe::metadata(&ctx.state, store.last_write(Category::Performance));
    if let Some(url) = optional_string(args, "url")? {
        let snapshot = store.performance_snapshot(Some(&url));
        let baseline = store.performance_baseline(&url);
        return json_response(
            &format!("Performance for {url}"),
            &json!({
                "url": url,
                "snapshot": snapshot,
                "baseline": baseline,
                "metadata": meta,
            }),
        );
    }
    let snapshots = store.performance_snapshots();
    json_response(
        "Performance",
        &json!({
            "snapshots": snapshots,
            "count": snapshots.len(),
            "baselines": store.performance_baselines(),
            "metadata": meta,
        }),
    )
}

async fn link_validation(args: &Args) -> ToolOutcome {
    let raw = match args.get("urls") {
        None | Some(JsonValue::Null) => None,
        Some(JsonValue::Array(items)) => Some(items),
        Some(_) => {
            return Err(ToolError::invalid_param(
                "urls",
                "`urls` must be an array of strings",
                "Pass 'urls' as an array of http(s) URLs",
            ));
        }
    };
    let Some(raw) = raw.filter(|items| !items.is_empty()) else {
        return Err(ToolError::missing_param(
            "urls",
            "Add the 'urls' parameter with an array of URLs to check",
        ));
    };
    let urls: Vec<String> = raw
        .iter()
        .filter_map(JsonValue::as_str)
        .map(str::trim)
        .filter(|u| links::is_http_url(u))
        .map(str::to_string)
        .collect();
    if urls.is_empty() {
        return Err(ToolError::invalid_param(
            "urls",
            "No valid HTTP/HTTPS URLs provided",
            "Pass absolute URLs starting with http:// or https://",
        ));
    }
    if urls.len() > links::MAX_URLS {
        return Err(ToolError::invalid_param(
            "urls",
            format!("Too many URLs: got {}, max {}", urls.len(), links::MAX_URLS),
            "Split the URLs into batches of at most 1000",
        ));
    }

    let timeout_ms = clamp_or_default(
        optional_i64(args, "timeout_ms")?,
        links::DEFAULT_TIMEOUT_MS,
        1000,
        60_000,
    );
    let max_workers = clamp_or_default(optional_i64(args, "max_workers")?, links::DEFAULT_WORKERS, 1, 100);
    info!(count = urls.len(), timeout_ms, max_workers, "validating links");

    let results = links::validate(urls, Duration::from_millis(timeout_ms as u64), max_workers as usize).await;
    json_response(
        "Server-side link validation completed",
        &json!({
            "status": "completed",
            "total": results.len(),
            "results": results,
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::response::{first_text, is_failure};
    use crate::app::AppState;
    use crate::config::Config;
    use gasoline_types::ExtensionStatusPost;

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

    #[tokio::test]
    async fn link_validation_blocks_loopback() {
        let outcome = analyze(
            &ctx().0,
            &args(json!({
                "what": "link_validation",
                "urls": ["http://127.0.0.1:22", "https://example.com"],
                "timeout_ms": 2000,
            })),
        )
        .await;
        let body = body_of(outcome);
        assert_eq!(body["status"], "completed");
        assert_eq!(body["total"], 2);
        let results = body["results"].as_array().expect("results");
        assert_eq!(results.len(), 2);
        assert_eq!(results[0]["url"], "http://127.0.0.1:22");
        assert_eq!(results[0]["code"], "broken");
        assert!(results[0]["error"].as_str().is_some_and(|e| !e.is_empty()));
        assert_eq!(results[1]["url"], "https://example.com");
    }

    #[tokio::test]
    async fn link_validation_argument_errors() {
        let (ctx, _dir) = ctx();
        let err = analyze(&ctx, &args(json!({"what": "link_validation"})))
            .await
            .expect_err("missing");
        assert_eq!(err.code, ErrorCode::MissingParam);

        let err = analyze(&ctx, &args(json!({"what": "link_validation", "urls": ["ftp://x", "mailto:a@b"]})))
            .await
            .expect_err("no http urls");
        assert_eq!(err.code, ErrorCode::InvalidParam);
        assert_eq!(err.message, "No valid HTTP/HTTPS URLs provided");

        let many: Vec<String> = (0..1001).map(|i| format!("https://a.test/{i}")).collect();
        let err = analyze(&ctx, &args(json!({"what": "link_validation", "urls": many})))
            .await
            .expect_err("too many");
        assert_eq!(err.message, "Too many URLs: got 1001, max 1000");
    }

    #[tokio::test]
    async fn error_clusters_group_by_message_prefix() {
        let (ctx, _dir) = ctx();
        let long = "x".repeat(150);
        ctx.state.store.add_logs(vec![
            json!({"level": "error", "message": format!("{long} first"), "url": "https://a.test/", "timestamp": "2026-01-01T00:00:01Z"}),
            json!({"level": "error", "message": format!("{long} second"), "url": "https://b.test/", "timestamp": "2026-01-01T00:00:02Z", "stack": "at f (a.js:1)"}),
            json!({"level": "error", "message": "TypeError: x is undefined", "timestamp": "2026-01-01T00:00:03Z"}),
            json!({"level": "warn", "message": "ignored", "timestamp": "2026-01-01T00:00:04Z"}),
        ]);
        let body = body_of(analyze(&ctx, &args(json!({"what": "error_clusters"}))).await);
        assert_eq!(body["total_count"], 3);
        let clusters = body["clusters"].as_array().expect("clusters");
        assert_eq!(clusters.len(), 2);
        assert_eq!(clusters[0]["count"], 2);
        assert_eq!(clusters[0]["first_seen"], "2026-01-01T00:00:01Z");
        assert_eq!(clusters[0]["last_seen"], "2026-01-01T00:00:02Z");
        assert_eq!(clusters[0]["urls"], json!(["https://a.test/", "https://b.test/"]));
        assert_eq!(clusters[0]["stack_trace"], "at f (a.js:1)");
        assert_eq!(clusters[1]["count"], 1);
    }

    #[tokio::test]
    async fn accessibility_requires_tracking() {
        let (ctx, _dir) = ctx();
        let err = analyze(&ctx, &args(json!({"what": "accessibility"})))
            .await
            .expect_err("untracked");
        assert_eq!(err.code, ErrorCode::NoData);
    }

    #[tokio::test]
    async fn accessibility_adds_summary() {
        let (ctx, _dir) = ctx();
        ctx.state.store.update_extension_status(ExtensionStatusPost {
            tracking_enabled: Some(true),
            tracked_tab_id: Some(4),
            ..ExtensionStatusPost::default()
        });
        let store = ctx.state.store.clone();
        let extension = tokio::spawn(async move {
            loop {
                if let Some(query) = store.correlator().take_for_poll().into_iter().next() {
                    assert_eq!(query.kind, "a11y");
                    store.correlator().set_query_result(
                        &query.id,
                        json!({"violations": [{"id": "color-contrast"}], "passes": [{}, {}]}),
                    );
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        });
        let body = body_of(analyze(&ctx, &args(json!({"what": "accessibility"}))).await);
        extension.await.expect("extension task");
        assert_eq!(body["summary"]["violation_count"], 1);
        assert_eq!(body["summary"]["pass_count"], 2);
    }

    #[tokio::test]
    async fn dom_requires_selector_and_queues() {
        let (ctx, _dir) = ctx();
        let err = analyze(&ctx, &args(json!({"what": "dom"}))).await.expect_err("missing");
        assert_eq!(err.code, ErrorCode::MissingParam);

        let body = body_of(analyze(&ctx, &args(json!({"what": "dom", "selector": "h1", "background": true}))).await);
        assert_eq!(body["status"], "queued");
        let id = body["correlation_id"].as_str().expect("id");
        assert!(id.starts_with("dom_"));
        let pending = ctx.state.store.correlator().take_for_poll();
        assert_eq!(pending[0].kind, "dom");
    }

    #[tokio::test]
    async fn page_summary_defaults_to_isolated_world() {
        let (ctx, _dir) = ctx();
        body_of(analyze(&ctx, &args(json!({"what": "page_summary", "background": true}))).await);
        let pending = ctx.state.store.correlator().take_for_poll();
        assert_eq!(pending[0].kind, "execute");
        assert_eq!(pending[0].params["world"], "isolated");
        assert_eq!(pending[0].params["timeout_ms"], 10_000);
    }

    #[tokio::test]
    async fn performance_without_data_is_empty() {
        let (ctx, _dir) = ctx();
        let body = body_of(analyze(&ctx, &args(json!({"what": "performance"}))).await);
        assert_eq!(body["count"], 0);
        assert_eq!(body["metadata"]["data_age"], "no_data");
    }
}
