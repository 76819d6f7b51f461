//! Bridges pull-based extension polling with request/response tool calls.
//!
//! A tool enqueues a [`PendingQuery`]; the extension picks it up from
//! `GET /pending-queries` and later posts a result. Two ways of waiting exist:
//!
//! * legacy queries are awaited by query id with [`Correlator::wait_for_result`];
//! * async commands carry a correlation id and keep a [`CommandResult`] record
//!   that moves from `pending` to exactly one terminal status.
//!
//! Each query and command owns its own [`Notify`], so a result wakes only the
//! callers waiting on it.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use gasoline_types::{CommandResult, CommandStatus, PendingQuery, PendingQueryResponse};
use parking_lot::Mutex;
use serde_json::Value as JsonValue;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::error::QueueError;
use crate::ring::RingBuffer;
use crate::time::rfc3339;

pub const MAX_PENDING_QUERIES: usize = 5;
pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(10);
pub const MAX_QUERY_TIMEOUT: Duration = Duration::from_secs(30);
/// Deadline for commands the caller may poll for instead of awaiting.
pub const ASYNC_COMMAND_TIMEOUT: Duration = Duration::from_secs(60);
/// Unclaimed legacy results are dropped after this long.
pub const QUERY_RESULT_TTL: Duration = Duration::from_secs(5 * 60);
/// Terminal command records stay readable this long.
pub const COMMAND_RESULT_TTL: Duration = Duration::from_secs(60);
pub const FAILED_COMMANDS_CAP: usize = 50;

struct PendingEntry {
    id: String,
    query: PendingQuery,
    client_id: Option<String>,
    deadline: Instant,
    timeout: Duration,
    dispatched: bool,
    notify: Arc<Notify>,
}

struct StoredResult {
    value: JsonValue,
    stored_at: Instant,
}

struct CommandRecord {
    correlation_id: String,
    status: CommandStatus,
    result: Option<JsonValue>,
    error: Option<String>,
    created_at: DateTime<Utc>,
    created: Instant,
    completed_at: Option<DateTime<Utc>>,
    terminal_at: Option<Instant>,
    deadline: Instant,
    client_id: Option<String>,
    query_type: Option<String>,
    notify: Arc<Notify>,
}

impl CommandRecord {
    fn view(&self, now: DateTime<Utc>) -> CommandResult {
        let end = self.completed_at.unwrap_or(now);
        CommandResult {
            correlation_id: self.correlation_id.clone(),
            status: self.status,
            result: self.result.clone(),
            error: self.error.clone(),
            created_at: rfc3339(self.created_at),
            completed_at: self.completed_at.map(rfc3339),
            client_id: self.client_id.clone(),
            elapsed_ms: (end - self.created_at).num_milliseconds().max(0),
            query_type: self.query_type.clone(),
        }
    }
}

/// True when `requester` may see a record owned by `owner`. Records without
/// an owner are visible to everyone.
fn visible_to(owner: Option<&str>, requester: Option<&str>) -> bool {
    match owner.filter(|o| !o.is_empty()) {
        None => true,
        Some(owner) => requester == Some(owner),
    }
}

#[derive(Default)]
struct Inner {
    next_query_seq: u64,
    pending: VecDeque<PendingEntry>,
    results: HashMap<String, StoredResult>,
    commands: HashMap<String, CommandRecord>,
    failed: Option<RingBuffer<CommandResult>>,
}

impl Inner {
    fn failed_mut(&mut self) -> &mut RingBuffer<CommandResult> {
        self.failed
            .get_or_insert_with(|| RingBuffer::new(FAILED_COMMANDS_CAP))
    }

    /// Moves a pending command to `status`. No-op once terminal.
    fn finish(
        &mut self,
        correlation_id: &str,
        status: CommandStatus,
        result: Option<JsonValue>,
        error: Option<String>,
    ) -> bool {
        let now = Utc::now();
        let Some(record) = self.commands.get_mut(correlation_id) else {
            return false;
        };
        if record.status.is_terminal() || !status.is_terminal() {
            return false;
        }
        record.status = status;
        record.result = result;
        record.error = error;
        record.completed_at = Some(now);
        record.terminal_at = Some(Instant::now());
        record.notify.notify_waiters();
        let view = record.view(now);
        debug!(correlation_id, status = %status, "command finished");
        if status != CommandStatus::Complete {
            self.failed_mut().push(view, now);
        }
        true
    }
}

/// Outcome of one sweeper pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub timed_out: usize,
    pub evicted_commands: usize,
    pub purged_results: usize,
}

#[derive(Default)]
pub struct Correlator {
    inner: Mutex<Inner>,
    query_available: Notify,
}

impl Correlator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueues a query for the extension. When the query carries a
    /// correlation id a pending command record is registered as well.
    pub fn create_pending_query(
        &self,
        query: PendingQuery,
        timeout: Duration,
        client_id: Option<&str>,
    ) -> Result<String, QueueError> {
        let timeout = timeout.min(ASYNC_COMMAND_TIMEOUT);
        let id = {
            let mut inner = self.inner.lock();
            if inner.pending.len() >= MAX_PENDING_QUERIES {
                warn!(kind = %query.kind, cap = MAX_PENDING_QUERIES, "pending query queue full");
                return Err(QueueError::Full {
                    cap: MAX_PENDING_QUERIES,
                });
            }
            inner.next_query_seq += 1;
            let id = format!("q-{}", inner.next_query_seq);
            let now = Instant::now();
            if let Some(correlation_id) = query.correlation_id.clone() {
                inner.commands.insert(
                    correlation_id.clone(),
                    CommandRecord {
                        correlation_id,
                        status: CommandStatus::Pending,
                        result: None,
                        error: None,
                        created_at: Utc::now(),
                        created: now,
                        completed_at: None,
                        terminal_at: None,
                        deadline: now + timeout,
                        client_id: client_id.map(str::to_string),
                        query_type: Some(query.kind.clone()),
                        notify: Arc::new(Notify::new()),
                    },
                );
            }
            debug!(id, kind = %query.kind, "pending query created");
            inner.pending.push_back(PendingEntry {
                id: id.clone(),
                query,
                client_id: client_id.map(str::to_string),
                deadline: now + timeout,
                timeout,
                dispatched: false,
                notify: Arc::new(Notify::new()),
            });
            id
        };
        self.query_available.notify_waiters();
        Ok(id)
    }

    /// Hands every not-yet-dispatched query to the extension and marks it dispatched.
    pub fn take_for_poll(&self) -> Vec<PendingQueryResponse> {
        let mut inner = self.inner.lock();
        inner
            .pending
            .iter_mut()
            .filter(|entry| !entry.dispatched)
            .map(|entry| {
                entry.dispatched = true;
                PendingQueryResponse {
                    id: entry.id.clone(),
                    kind: entry.query.kind.clone(),
                    params: entry.query.params.clone(),
                    tab_id: entry.query.tab_id,
                    correlation_id: entry.query.correlation_id.clone(),
                }
            })
            .collect()
    }

    /// Resolves once a query is enqueued (or immediately if one is waiting).
    pub async fn query_available(&self, timeout: Duration) {
        let notified = self.query_available.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if self.inner.lock().pending.iter().any(|e| !e.dispatched) {
            return;
        }
        let _ = tokio::time::timeout(timeout, notified).await;
    }

    /// Drops a delivered query without a result; its command stays pending
    /// until the extension reports a status or the deadline passes.
    pub fn acknowledge(&self, query_id: &str) -> bool {
        let mut inner = self.inner.lock();
        let before = inner.pending.len();
        inner.pending.retain(|e| e.id != query_id);
        before != inner.pending.len()
    }

    /// Legacy result delivery. Completes the linked command, if any.
    pub fn set_query_result(&self, query_id: &str, value: JsonValue) -> bool {
        let mut inner = self.inner.lock();
        let Some(pos) = inner.pending.iter().position(|e| e.id == query_id) else {
            debug!(query_id, "result for unknown or expired query");
            return false;
        };
        let Some(entry) = inner.pending.remove(pos) else {
            return false;
        };
        if let Some(correlation_id) = entry.query.correlation_id.as_deref() {
            inner.finish(
                correlation_id,
                CommandStatus::Complete,
                Some(value.clone()),
                None,
            );
        }
        inner.results.insert(
            query_id.to_string(),
            StoredResult {
                value,
                stored_at: Instant::now(),
            },
        );
        entry.notify.notify_waiters();
        true
    }

    /// Async result delivery. Pending statuses are ignored; the first
    /// terminal status wins and later ones are no-ops.
    pub fn apply_command_result(
        &self,
        correlation_id: &str,
        raw_status: &str,
        result: Option<JsonValue>,
        error: Option<String>,
    ) -> bool {
        let status = CommandStatus::normalize(raw_status);
        let mut inner = self.inner.lock();
        if status.is_terminal() {
            inner.pending.retain(|e| e.query.correlation_id.as_deref() != Some(correlation_id));
        }
        inner.finish(correlation_id, status, result, error)
    }

    /// Retrieves and removes a legacy result.
    pub fn take_result(&self, query_id: &str) -> Option<JsonValue> {
        self.inner.lock().results.remove(query_id).map(|r| r.value)
    }

    pub async fn wait_for_result(&self, query_id: &str, timeout: Duration) -> Option<JsonValue> {
        let deadline = tokio::time::Instant::now() + timeout.min(MAX_QUERY_TIMEOUT);
        loop {
            let notify = {
                let mut inner = self.inner.lock();
                if let Some(result) = inner.results.remove(query_id) {
                    return Some(result.value);
                }
                match inner.pending.iter().find(|e| e.id == query_id) {
                    Some(entry) => entry.notify.clone(),
                    None => return None,
                }
            };
            let notified = notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.inner.lock().results.contains_key(query_id) {
                continue;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.take_result(query_id);
            }
        }
    }

    /// Waits until the command is terminal or `timeout` passes, then returns
    /// its current state (possibly still pending).
    pub async fn wait_for_command(
        &self,
        correlation_id: &str,
        timeout: Duration,
    ) -> Option<CommandResult> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notify = self
                .inner
                .lock()
                .commands
                .get(correlation_id)
                .filter(|r| r.status == CommandStatus::Pending)
                .map(|r| r.notify.clone());
            let Some(notify) = notify else {
                return self.command_unchecked(correlation_id);
            };
            let notified = notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if !self.is_command_pending(correlation_id) {
                continue;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.command_unchecked(correlation_id);
            }
        }
    }

    fn is_command_pending(&self, correlation_id: &str) -> bool {
        self.inner
            .lock()
            .commands
            .get(correlation_id)
            .is_some_and(|r| r.status == CommandStatus::Pending)
    }

    /// Command state as seen by `requester`. A command owned by another
    /// client is reported as absent.
    pub fn command_for(&self, correlation_id: &str, requester: Option<&str>) -> Option<CommandResult> {
        let inner = self.inner.lock();
        let now = Utc::now();
        if let Some(record) = inner.commands.get(correlation_id) {
            return visible_to(record.client_id.as_deref(), requester).then(|| record.view(now));
        }
        inner.failed.as_ref().and_then(|failed| {
            failed
                .iter()
                .rev()
                .find(|c| c.correlation_id == correlation_id)
                .filter(|c| visible_to(c.client_id.as_deref(), requester))
                .cloned()
        })
    }

    /// Lookup without ownership filtering, for callers that created the command.
    fn command_unchecked(&self, correlation_id: &str) -> Option<CommandResult> {
        let inner = self.inner.lock();
        if let Some(record) = inner.commands.get(correlation_id) {
            return Some(record.view(Utc::now()));
        }
        inner.failed.as_ref().and_then(|failed| {
            failed
                .iter()
                .rev()
                .find(|c| c.correlation_id == correlation_id)
                .cloned()
        })
    }

    fn commands_with(&self, requester: Option<&str>, pred: impl Fn(CommandStatus) -> bool) -> Vec<CommandResult> {
        let inner = self.inner.lock();
        let now = Utc::now();
        let mut out: Vec<(Instant, CommandResult)> = inner
            .commands
            .values()
            .filter(|r| pred(r.status) && visible_to(r.client_id.as_deref(), requester))
            .map(|r| (r.created, r.view(now)))
            .collect();
        out.sort_by_key(|(created, _)| *created);
        out.into_iter().map(|(_, view)| view).collect()
    }

    pub fn pending_commands(&self, requester: Option<&str>) -> Vec<CommandResult> {
        self.commands_with(requester, |s| s == CommandStatus::Pending)
    }

    pub fn completed_commands(&self, requester: Option<&str>) -> Vec<CommandResult> {
        self.commands_with(requester, |s| s == CommandStatus::Complete)
    }

    /// Recent failures, newest first.
    pub fn failed_commands(&self, requester: Option<&str>) -> Vec<CommandResult> {
        let inner = self.inner.lock();
        inner
            .failed
            .as_ref()
            .map(|failed| {
                failed
                    .iter()
                    .rev()
                    .filter(|c| visible_to(c.client_id.as_deref(), requester))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn queue_depth(&self) -> usize {
        self.inner.lock().pending.len()
    }

    /// 1-based position of the command's query in the queue.
    pub fn queue_position(&self, correlation_id: &str) -> Option<usize> {
        self.inner
            .lock()
            .pending
            .iter()
            .position(|e| e.query.correlation_id.as_deref() == Some(correlation_id))
            .map(|i| i + 1)
    }

    /// Expires every queued query and pending command (shutdown, disconnect).
    pub fn expire_all_pending(&self, reason: &str) -> usize {
        let mut inner = self.inner.lock();
        let drained: Vec<PendingEntry> = inner.pending.drain(..).collect();
        let pending_ids: Vec<String> = inner
            .commands
            .values()
            .filter(|r| r.status == CommandStatus::Pending)
            .map(|r| r.correlation_id.clone())
            .collect();
        let mut expired = 0;
        for correlation_id in pending_ids {
            if inner.finish(
                &correlation_id,
                CommandStatus::Expired,
                None,
                Some(reason.to_string()),
            ) {
                expired += 1;
            }
        }
        for entry in drained {
            entry.notify.notify_waiters();
        }
        if expired > 0 {
            info!(expired, reason, "expired pending commands");
        }
        expired
    }

    /// Times out overdue queries and commands, drops old terminal records and
    /// unclaimed results. A deadline only counts once it has strictly passed.
    pub fn sweep(&self, now: Instant) -> SweepReport {
        let mut report = SweepReport::default();
        let mut inner = self.inner.lock();

        let mut overdue = Vec::new();
        inner.pending.retain_mut(|entry| {
            if now > entry.deadline {
                overdue.push((
                    entry.query.correlation_id.clone(),
                    entry.timeout,
                    entry.notify.clone(),
                    entry.client_id.clone(),
                ));
                false
            } else {
                true
            }
        });
        for (correlation_id, timeout, notify, client_id) in overdue {
            report.timed_out += 1;
            if let Some(correlation_id) = correlation_id {
                inner.finish(
                    &correlation_id,
                    CommandStatus::Timeout,
                    None,
                    Some(format!(
                        "extension did not respond within {}s",
                        timeout.as_secs()
                    )),
                );
            }
            debug!(client_id = client_id.as_deref().unwrap_or(""), "pending query timed out");
            notify.notify_waiters();
        }

        let stale_pending: Vec<String> = inner
            .commands
            .values()
            .filter(|r| r.status == CommandStatus::Pending && now > r.deadline)
            .map(|r| r.correlation_id.clone())
            .collect();
        for correlation_id in stale_pending {
            if inner.finish(
                &correlation_id,
                CommandStatus::Timeout,
                None,
                Some("command deadline passed without a result".to_string()),
            ) {
                report.timed_out += 1;
            }
        }

        let before = inner.commands.len();
        inner.commands.retain(|_, r| {
            r.terminal_at
                .is_none_or(|at| now.saturating_duration_since(at) < COMMAND_RESULT_TTL)
        });
        report.evicted_commands = before - inner.commands.len();

        let before = inner.results.len();
        inner
            .results
            .retain(|_, r| now.saturating_duration_since(r.stored_at) < QUERY_RESULT_TTL);
        report.purged_results = before - inner.results.len();

        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn command_query(correlation_id: &str) -> PendingQuery {
        PendingQuery::new("dom_action", json!({"action": "click"})).with_correlation(correlation_id)
    }

    #[tokio::test]
    async fn legacy_query_round_trip() {
        let correlator = Arc::new(Correlator::new());
        let id = correlator
            .create_pending_query(PendingQuery::new("dom", json!({"selector": "h1"})), DEFAULT_QUERY_TIMEOUT, None)
            .expect("enqueue");
        assert_eq!(id, "q-1");

        let polled = correlator.take_for_poll();
        assert_eq!(polled.len(), 1);
        assert!(correlator.take_for_poll().is_empty(), "dispatched queries are not re-sent");

        let waiter = {
            let correlator = correlator.clone();
            let id = id.clone();
            tokio::spawn(async move { correlator.wait_for_result(&id, Duration::from_secs(5)).await })
        };
        tokio::task::yield_now().await;
        assert!(correlator.set_query_result(&id, json!({"text": "Hello"})));
        let got = waiter.await.expect("join");
        assert_eq!(got, Some(json!({"text": "Hello"})));
        assert!(correlator.take_result(&id).is_none(), "results are consumed on read");
    }

    #[test]
    fn queue_rejects_when_full() {
        let correlator = Correlator::new();
        for _ in 0..MAX_PENDING_QUERIES {
            correlator
                .create_pending_query(PendingQuery::new("dom", JsonValue::Null), DEFAULT_QUERY_TIMEOUT, None)
                .expect("room");
        }
        let err = correlator
            .create_pending_query(PendingQuery::new("dom", JsonValue::Null), DEFAULT_QUERY_TIMEOUT, None)
            .expect_err("full");
        assert_eq!(err, QueueError::Full { cap: MAX_PENDING_QUERIES });
        assert_eq!(correlator.queue_depth(), MAX_PENDING_QUERIES);
    }

    #[test]
    fn first_terminal_status_wins() {
        let correlator = Correlator::new();
        correlator
            .create_pending_query(command_query("corr-1"), ASYNC_COMMAND_TIMEOUT, Some("a"))
            .expect("enqueue");
        assert!(!correlator.apply_command_result("corr-1", "running", None, None));
        assert!(correlator.apply_command_result("corr-1", "ok", Some(json!({"ok": true})), None));
        assert!(!correlator.apply_command_result("corr-1", "timeout", None, Some("late".into())));
        assert_eq!(correlator.expire_all_pending("shutdown"), 0);

        let view = correlator.command_for("corr-1", Some("a")).expect("visible");
        assert_eq!(view.status, CommandStatus::Complete);
        assert_eq!(view.result, Some(json!({"ok": true})));
        assert!(view.error.is_none());
        assert_eq!(correlator.queue_depth(), 0);
    }

    #[test]
    fn command_results_are_isolated_per_client() {
        let correlator = Correlator::new();
        correlator
            .create_pending_query(command_query("corr-1"), ASYNC_COMMAND_TIMEOUT, Some("client-a"))
            .expect("enqueue");
        correlator.apply_command_result("corr-1", "complete", Some(json!({"ok": true})), None);

        assert!(correlator.command_for("corr-1", Some("client-a")).is_some());
        assert!(correlator.command_for("corr-1", Some("client-b")).is_none());
        assert!(correlator.command_for("corr-1", None).is_none());
        assert!(correlator.completed_commands(Some("client-b")).is_empty());
        assert_eq!(correlator.completed_commands(Some("client-a")).len(), 1);
    }

    #[test]
    fn sweeper_times_out_after_deadline_and_records_failure() {
        let correlator = Correlator::new();
        let start = Instant::now();
        correlator
            .create_pending_query(command_query("corr-2"), Duration::from_secs(10), None)
            .expect("enqueue");
        assert_eq!(correlator.queue_position("corr-2"), Some(1));

        let report = correlator.sweep(start);
        assert_eq!(report.timed_out, 0);

        let report = correlator.sweep(start + Duration::from_secs(11));
        assert_eq!(report.timed_out, 1);
        let view = correlator.command_for("corr-2", None).expect("present");
        assert_eq!(view.status, CommandStatus::Timeout);
        assert!(view.error.as_deref().is_some_and(|e| e.contains("10s")));
        assert_eq!(correlator.failed_commands(None).len(), 1);

        // Terminal records leave the map after the TTL but stay in the failed ring.
        let report = correlator.sweep(Instant::now() + COMMAND_RESULT_TTL + Duration::from_secs(1));
        assert_eq!(report.evicted_commands, 1);
        assert_eq!(
            correlator.command_for("corr-2", None).map(|c| c.status),
            Some(CommandStatus::Timeout)
        );
    }

    #[tokio::test]
    async fn wait_for_command_wakes_on_completion() {
        let correlator = Arc::new(Correlator::new());
        correlator
            .create_pending_query(command_query("corr-3"), ASYNC_COMMAND_TIMEOUT, None)
            .expect("enqueue");
        let waiter = {
            let correlator = correlator.clone();
            tokio::spawn(async move { correlator.wait_for_command("corr-3", Duration::from_secs(5)).await })
        };
        tokio::task::yield_now().await;
        correlator.apply_command_result("corr-3", "error", None, Some("element not found".into()));
        let view = waiter.await.expect("join").expect("present");
        assert_eq!(view.status, CommandStatus::Error);
        assert_eq!(view.error.as_deref(), Some("element not found"));
    }

    #[tokio::test]
    async fn wait_for_command_returns_pending_on_timeout() {
        let correlator = Correlator::new();
        correlator
            .create_pending_query(command_query("corr-4"), ASYNC_COMMAND_TIMEOUT, None)
            .expect("enqueue");
        let view = correlator
            .wait_for_command("corr-4", Duration::from_millis(20))
            .await
            .expect("present");
        assert_eq!(view.status, CommandStatus::Pending);
    }

    #[test]
    fn expire_all_pending_marks_commands_expired() {
        let correlator = Correlator::new();
        correlator
            .create_pending_query(command_query("corr-5"), ASYNC_COMMAND_TIMEOUT, None)
            .expect("enqueue");
        assert_eq!(correlator.expire_all_pending("server shutting down"), 1);
        let view = correlator.command_for("corr-5", None).expect("present");
        assert_eq!(view.status, CommandStatus::Expired);
        assert_eq!(correlator.queue_depth(), 0);
    }
}
