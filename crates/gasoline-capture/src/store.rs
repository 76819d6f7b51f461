//! The process-wide capture store.
//!
//! Every typed buffer lives behind one mutex so a health snapshot is a
//! consistent tuple. File I/O for the console log happens after that lock is
//! released, but the file lock is taken first so writes land in the same
//! order as the ring mutations they mirror. Lock order is state, then file.

use std::path::PathBuf;
use std::time::Instant;

use chrono::{DateTime, Duration, Utc};
use gasoline_types::{
    Alert, CiResult, EnhancedAction, ExtensionLogEntry, ExtensionStatusPost, HealthBuffers,
    HealthCircuit, HealthExtension, HealthLogs, LogEntry, LogLevel, LogsPostResponse,
    IngestResponse, NetworkBody, NetworkWaterfallEntry, PerformanceBaseline, PerformanceSnapshot,
    TrackingStatus, WebSocketEvent, WebSocketStatus,
};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use tracing::{debug, info, warn};

use crate::alerts::AlertQueue;
use crate::circuit::{Admission, Category, CircuitBreaker};
use crate::correlator::Correlator;
use crate::error::IngestError;
use crate::perf::{PerfDiff, PerformanceStore};
use crate::persist::ConsoleLog;
use crate::redact::Redactor;
use crate::ring::{BufferCursor, RingBuffer};
use crate::time::{parse_timestamp, rfc3339};
use crate::websocket::ConnectionTracker;

pub const DEFAULT_MAX_CONSOLE_ENTRIES: usize = 1000;
pub const MAX_NETWORK_BODIES: usize = 100;
pub const MAX_WEBSOCKET_EVENTS: usize = 500;
pub const MAX_ENHANCED_ACTIONS: usize = 50;
pub const MAX_WATERFALL_ENTRIES: usize = 1000;
pub const MAX_EXTENSION_LOGS: usize = 500;
pub const NETWORK_MEMORY_BUDGET: usize = 8 * 1024 * 1024;
pub const WEBSOCKET_MEMORY_BUDGET: usize = 4 * 1024 * 1024;
pub const MAX_LOG_ENTRY_BYTES: usize = 1024 * 1024;

/// Any poll or status ping this recent counts as a connected extension.
const EXTENSION_CONNECTED_SECS: i64 = 120;
/// Activity this recent reports `connected` rather than `stale` in health.
const EXTENSION_FRESH_SECS: i64 = 10;

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub max_console_entries: usize,
    /// Console persistence target; `None` keeps the console in memory only.
    pub log_file: Option<PathBuf>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_console_entries: DEFAULT_MAX_CONSOLE_ENTRIES,
            log_file: None,
        }
    }
}

/// What an ingest call may be asked to clear.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClearScope {
    One(Category),
    All,
}

impl std::str::FromStr for ClearScope {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "all" | "" => Ok(ClearScope::All),
            "logs" => Ok(ClearScope::One(Category::Console)),
            other => other.parse().map(ClearScope::One),
        }
    }
}

/// Extension liveness, derived from the last poll and status ping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connectivity {
    pub connected: bool,
    /// `connected`, `stale`, `disconnected` or `never_connected`.
    pub status: &'static str,
    pub last_poll_ms: Option<i64>,
    pub last_seen: Option<DateTime<Utc>>,
}

/// Whether interact commands may be sent to the extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PilotReadiness {
    Ready,
    /// The extension reported the pilot toggle as off.
    Disabled,
    /// No poll or status ping was ever received.
    NeverConnected,
}

#[derive(Debug, Clone, Default)]
struct ExtensionState {
    tracking_enabled: bool,
    tracked_tab_id: Option<i64>,
    tracked_tab_url: Option<String>,
    tracking_updated_at: Option<DateTime<Utc>>,
    last_poll_at: Option<DateTime<Utc>>,
    session_id: Option<String>,
    session_changed_at: Option<DateTime<Utc>>,
    pilot_enabled: Option<bool>,
    extension_version: Option<String>,
}

impl ExtensionState {
    fn last_seen(&self) -> Option<DateTime<Utc>> {
        self.last_poll_at.max(self.tracking_updated_at)
    }
}

struct State {
    console: RingBuffer<LogEntry>,
    network: RingBuffer<NetworkBody>,
    network_bytes: usize,
    websocket: RingBuffer<WebSocketEvent>,
    websocket_bytes: usize,
    connections: ConnectionTracker,
    actions: RingBuffer<EnhancedAction>,
    waterfall: RingBuffer<NetworkWaterfallEntry>,
    extension_logs: RingBuffer<ExtensionLogEntry>,
    perf: PerformanceStore,
    circuit: CircuitBreaker,
    alerts: AlertQueue,
    extension: ExtensionState,
}

enum Persist {
    Nothing,
    Append(Vec<LogEntry>),
    Rewrite(Vec<LogEntry>),
}

pub struct CaptureStore {
    state: Mutex<State>,
    console_log: Option<ConsoleLog>,
    /// Serializes file writes. Always acquired while `state` is held.
    file_lock: Mutex<()>,
    correlator: Correlator,
    redactor: Redactor,
    max_console_entries: usize,
    started: Instant,
}

impl Default for CaptureStore {
    fn default() -> Self {
        Self::new(StoreConfig::default())
    }
}

/// Parses each raw entry, counting the ones that do not fit `T`.
fn parse_entries<T: DeserializeOwned>(category: Category, raw: Vec<JsonValue>) -> (Vec<T>, usize) {
    let mut parsed = Vec::with_capacity(raw.len());
    let mut rejected = 0;
    for value in raw {
        match serde_json::from_value::<T>(value) {
            Ok(entry) => parsed.push(entry),
            Err(e) => {
                rejected += 1;
                let err = IngestError::Shape {
                    category,
                    reason: e.to_string(),
                };
                debug!(error = %err, "rejected ingest entry");
            }
        }
    }
    if rejected > 0 {
        warn!(%category, rejected, "rejected malformed ingest entries");
    }
    (parsed, rejected)
}

impl CaptureStore {
    pub fn new(config: StoreConfig) -> Self {
        let max_console_entries = config.max_console_entries.max(1);
        let console_log = config.log_file.map(ConsoleLog::new);
        let mut console = RingBuffer::new(max_console_entries);
        if let Some(log) = &console_log {
            match log.load(max_console_entries) {
                Ok(entries) => {
                    if !entries.is_empty() {
                        info!(count = entries.len(), path = %log.path().display(), "restored console entries");
                    }
                    console.write(entries);
                }
                Err(e) => warn!(error = %e, "could not restore console log"),
            }
        }
        Self {
            state: Mutex::new(State {
                console,
                network: RingBuffer::new(MAX_NETWORK_BODIES),
                network_bytes: 0,
                websocket: RingBuffer::new(MAX_WEBSOCKET_EVENTS),
                websocket_bytes: 0,
                connections: ConnectionTracker::new(),
                actions: RingBuffer::new(MAX_ENHANCED_ACTIONS),
                waterfall: RingBuffer::new(MAX_WATERFALL_ENTRIES),
                extension_logs: RingBuffer::new(MAX_EXTENSION_LOGS),
                perf: PerformanceStore::default(),
                circuit: CircuitBreaker::default(),
                alerts: AlertQueue::new(),
                extension: ExtensionState::default(),
            }),
            console_log,
            file_lock: Mutex::new(()),
            correlator: Correlator::new(),
            redactor: Redactor::new(),
            max_console_entries,
            started: Instant::now(),
        }
    }

    pub fn correlator(&self) -> &Correlator {
        &self.correlator
    }

    pub fn redactor(&self) -> &Redactor {
        &self.redactor
    }

    pub fn uptime(&self) -> std::time::Duration {
        self.started.elapsed()
    }

    /// Runs the circuit breaker for a parsed batch. Returns false when the
    /// batch must be dropped.
    fn admit(state: &mut State, category: Category, n: usize, now: DateTime<Utc>) -> bool {
        if n == 0 {
            return true;
        }
        match state.circuit.admit(category, n as u64, now) {
            Admission::Accepted | Admission::Tripped { .. } => true,
            Admission::Dropped { reason } => {
                let err = IngestError::CircuitOpen { category, reason };
                debug!(error = %err, dropped = n, "ingest batch dropped");
                false
            }
        }
    }

    // Console

    pub fn add_logs(&self, raw: Vec<JsonValue>) -> LogsPostResponse {
        let now = Utc::now();
        let mut rejected = 0;
        let mut sized = Vec::with_capacity(raw.len());
        for value in raw {
            let size = serde_json::to_vec(&value).map(|v| v.len()).unwrap_or(usize::MAX);
            if size > MAX_LOG_ENTRY_BYTES {
                let err = IngestError::TooLarge {
                    size,
                    max: MAX_LOG_ENTRY_BYTES,
                };
                warn!(error = %err, "rejected oversized console entry");
                rejected += 1;
                continue;
            }
            sized.push(value);
        }
        let (entries, bad) = parse_entries::<LogEntry>(Category::Console, sized);
        rejected += bad;

        let (persist, received, total, file_guard) = {
            let mut state = self.state.lock();
            if !Self::admit(&mut state, Category::Console, entries.len(), now) {
                let total = state.console.len();
                return LogsPostResponse {
                    received: 0,
                    rejected: rejected + entries.len(),
                    entries: total,
                };
            }
            let mut evicted = false;
            for entry in &entries {
                if entry.level == LogLevel::Error && !entry.is_internal() {
                    let at = entry
                        .timestamp
                        .as_deref()
                        .and_then(parse_timestamp)
                        .unwrap_or(now);
                    state.alerts.record_error(at);
                }
                evicted |= state.console.push(entry.clone(), now).is_some();
            }
            let persist = match (&self.console_log, entries.is_empty(), evicted) {
                (None, _, _) | (_, true, _) => Persist::Nothing,
                (Some(_), false, true) => Persist::Rewrite(state.console.read_all()),
                (Some(_), false, false) => Persist::Append(entries.clone()),
            };
            let file_guard = match persist {
                Persist::Nothing => None,
                _ => Some(self.file_lock.lock()),
            };
            (persist, entries.len(), state.console.len(), file_guard)
        };
        debug!(received, rejected, "console batch ingested");
        self.persist(persist);
        drop(file_guard);
        LogsPostResponse {
            received,
            rejected,
            entries: total,
        }
    }

    /// Writes a persistence decision. The caller holds `file_lock`.
    fn persist(&self, persist: Persist) {
        let Some(log) = &self.console_log else {
            return;
        };
        let result = match persist {
            Persist::Nothing => return,
            Persist::Append(entries) => log.append(&entries),
            Persist::Rewrite(entries) => log.rewrite(&entries),
        };
        if let Err(e) = result {
            warn!(error = %e, "console log persistence failed");
        }
    }

    pub fn console_entries(&self) -> Vec<LogEntry> {
        self.state.lock().console.read_all()
    }

    /// Console entries written after `cursor` that match `pred`.
    pub fn console_since(
        &self,
        cursor: BufferCursor,
        pred: impl FnMut(&LogEntry) -> bool,
        limit: usize,
    ) -> (Vec<LogEntry>, BufferCursor) {
        self.state
            .lock()
            .console
            .read_from_with_filter(cursor, pred, limit)
    }

    pub fn console_position(&self) -> u64 {
        self.state.lock().console.current_position()
    }

    /// Position of the first console entry stored at or after `t`.
    pub fn console_position_at(&self, t: DateTime<Utc>) -> i64 {
        self.state.lock().console.find_position_at_time(t)
    }

    // Network

    pub fn add_network_bodies(&self, raw: Vec<JsonValue>) -> IngestResponse {
        let now = Utc::now();
        let (mut bodies, rejected) = parse_entries::<NetworkBody>(Category::Network, raw);
        let mut state = self.state.lock();
        if !Self::admit(&mut state, Category::Network, bodies.len(), now) {
            return IngestResponse {
                received: 0,
                rejected: rejected + bodies.len(),
            };
        }
        let received = bodies.len();
        for mut body in bodies.drain(..) {
            body.truncate_bodies();
            state.network_bytes += body.approx_memory_bytes();
            if let Some(old) = state.network.push(body, now) {
                state.network_bytes = state.network_bytes.saturating_sub(old.approx_memory_bytes());
            }
        }
        let mut evicted = 0;
        while state.network_bytes > NETWORK_MEMORY_BUDGET {
            let Some(old) = state.network.pop_oldest() else {
                break;
            };
            state.network_bytes = state.network_bytes.saturating_sub(old.approx_memory_bytes());
            evicted += 1;
        }
        if evicted > 0 {
            warn!(evicted, budget = NETWORK_MEMORY_BUDGET, "network bodies over memory budget");
        }
        debug!(received, rejected, "network batch ingested");
        IngestResponse { received, rejected }
    }

    pub fn network_bodies(&self) -> Vec<NetworkBody> {
        self.state.lock().network.read_all()
    }

    pub fn add_waterfall(&self, raw: Vec<JsonValue>, page_url: &str) -> IngestResponse {
        let now = Utc::now();
        let (entries, rejected) = parse_entries::<NetworkWaterfallEntry>(Category::Waterfall, raw);
        let mut state = self.state.lock();
        if !Self::admit(&mut state, Category::Waterfall, entries.len(), now) {
            return IngestResponse {
                received: 0,
                rejected: rejected + entries.len(),
            };
        }
        let stamp = rfc3339(now);
        let received = state.waterfall.write_at(
            entries.into_iter().map(|mut entry| {
                entry.server_timestamp = Some(stamp.clone());
                if entry.page_url.is_empty() {
                    entry.page_url = page_url.to_string();
                }
                entry
            }),
            now,
        );
        IngestResponse { received, rejected }
    }

    pub fn waterfall(&self) -> Vec<NetworkWaterfallEntry> {
        self.state.lock().waterfall.read_all()
    }

    // WebSocket

    pub fn add_websocket_events(&self, raw: Vec<JsonValue>) -> IngestResponse {
        let now = Utc::now();
        let (events, rejected) = parse_entries::<WebSocketEvent>(Category::WebSocket, raw);
        let mut state = self.state.lock();
        if !Self::admit(&mut state, Category::WebSocket, events.len(), now) {
            return IngestResponse {
                received: 0,
                rejected: rejected + events.len(),
            };
        }
        let received = events.len();
        for event in events {
            state.connections.track(&event, now);
            state.websocket_bytes += event.approx_memory_bytes();
            if let Some(old) = state.websocket.push(event, now) {
                state.websocket_bytes = state.websocket_bytes.saturating_sub(old.approx_memory_bytes());
            }
        }
        while state.websocket_bytes > WEBSOCKET_MEMORY_BUDGET {
            let Some(old) = state.websocket.pop_oldest() else {
                break;
            };
            state.websocket_bytes = state.websocket_bytes.saturating_sub(old.approx_memory_bytes());
        }
        IngestResponse { received, rejected }
    }

    pub fn websocket_events(&self) -> Vec<WebSocketEvent> {
        self.state.lock().websocket.read_all()
    }

    pub fn websocket_status(&self, url_filter: Option<&str>, connection_id: Option<&str>) -> WebSocketStatus {
        self.state
            .lock()
            .connections
            .status(url_filter, connection_id, Utc::now())
    }

    // Actions

    pub fn add_actions(&self, raw: Vec<JsonValue>) -> IngestResponse {
        let now = Utc::now();
        let (actions, rejected) = parse_entries::<EnhancedAction>(Category::Actions, raw);
        self.record_actions(actions, now, rejected)
    }

    /// Records actions the server itself performed on the page.
    pub fn record_ai_action(&self, mut action: EnhancedAction) {
        action.source = Some("ai".to_string());
        self.record_actions(vec![action], Utc::now(), 0);
    }

    fn record_actions(&self, actions: Vec<EnhancedAction>, now: DateTime<Utc>, rejected: usize) -> IngestResponse {
        let mut state = self.state.lock();
        if !Self::admit(&mut state, Category::Actions, actions.len(), now) {
            return IngestResponse {
                received: 0,
                rejected: rejected + actions.len(),
            };
        }
        let received = state.actions.write_at(actions, now);
        IngestResponse { received, rejected }
    }

    pub fn actions(&self) -> Vec<EnhancedAction> {
        self.state.lock().actions.read_all()
    }

    // Extension logs

    pub fn add_extension_logs(&self, raw: Vec<JsonValue>) -> IngestResponse {
        let now = Utc::now();
        let (mut entries, rejected) =
            parse_entries::<ExtensionLogEntry>(Category::ExtensionLogs, raw);
        let mut state = self.state.lock();
        if !Self::admit(&mut state, Category::ExtensionLogs, entries.len(), now) {
            return IngestResponse {
                received: 0,
                rejected: rejected + entries.len(),
            };
        }
        for entry in &mut entries {
            if entry.timestamp.is_empty() {
                entry.timestamp = rfc3339(now);
            }
        }
        let received = state.extension_logs.write_at(entries, now);
        IngestResponse { received, rejected }
    }

    pub fn extension_logs(&self) -> Vec<ExtensionLogEntry> {
        self.state.lock().extension_logs.read_all()
    }

    // Performance

    pub fn add_performance_snapshots(&self, raw: Vec<JsonValue>) -> IngestResponse {
        let now = Utc::now();
        let (snapshots, rejected) =
            parse_entries::<PerformanceSnapshot>(Category::Performance, raw);
        let mut state = self.state.lock();
        if !Self::admit(&mut state, Category::Performance, snapshots.len(), now) {
            return IngestResponse {
                received: 0,
                rejected: rejected + snapshots.len(),
            };
        }
        let stamp = rfc3339(now);
        let received = snapshots.len();
        for mut snapshot in snapshots {
            if snapshot.timestamp.is_empty() {
                snapshot.timestamp = stamp.clone();
            }
            state.perf.add(snapshot, &stamp);
        }
        IngestResponse { received, rejected }
    }

    pub fn performance_snapshot(&self, url: Option<&str>) -> Option<PerformanceSnapshot> {
        let state = self.state.lock();
        match url {
            Some(url) => state.perf.snapshot(url).cloned(),
            None => state.perf.latest().cloned(),
        }
    }

    pub fn performance_snapshots(&self) -> Vec<PerformanceSnapshot> {
        self.state.lock().perf.snapshots()
    }

    pub fn performance_baseline(&self, url: &str) -> Option<PerformanceBaseline> {
        self.state.lock().perf.baseline(url).cloned()
    }

    pub fn performance_baselines(&self) -> Vec<PerformanceBaseline> {
        self.state.lock().perf.baselines()
    }

    pub fn stash_perf_before(&self, correlation_id: &str) -> bool {
        self.state.lock().perf.stash_before(correlation_id)
    }

    pub fn take_perf_diff(&self, correlation_id: &str) -> Option<PerfDiff> {
        self.state.lock().perf.take_diff(correlation_id)
    }

    // Extension status

    pub fn update_extension_status(&self, post: ExtensionStatusPost) -> TrackingStatus {
        let now = Utc::now();
        let mut state = self.state.lock();
        let ext = &mut state.extension;
        if let Some(enabled) = post.tracking_enabled {
            ext.tracking_enabled = enabled;
            ext.tracked_tab_id = post.tracked_tab_id.filter(|_| enabled);
            ext.tracked_tab_url = post.tracked_tab_url.filter(|_| enabled);
        }
        if post.pilot_enabled.is_some() {
            ext.pilot_enabled = post.pilot_enabled;
        }
        if post.extension_version.is_some() {
            ext.extension_version = post.extension_version;
        }
        ext.tracking_updated_at = Some(now);
        let session_changed = match (&post.session_id, &ext.session_id) {
            (Some(new), Some(old)) => new != old,
            (Some(_), None) => true,
            (None, _) => false,
        };
        if session_changed {
            info!(session_id = post.session_id.as_deref().unwrap_or(""), "extension session changed");
            ext.session_id = post.session_id;
            ext.session_changed_at = Some(now);
            state.connections.reset_active();
        }
        Self::tracking_view(&state.extension, now)
    }

    fn tracking_view(ext: &ExtensionState, now: DateTime<Utc>) -> TrackingStatus {
        TrackingStatus {
            tracking_enabled: ext.tracking_enabled,
            tracked_tab_id: ext.tracked_tab_id,
            tracked_tab_url: ext.tracked_tab_url.clone(),
            updated_at: ext.tracking_updated_at.map(rfc3339),
            extension_connected: ext
                .tracking_updated_at
                .is_some_and(|t| now - t < Duration::seconds(EXTENSION_CONNECTED_SECS)),
            pilot_enabled: ext.pilot_enabled.unwrap_or(false),
            session_id: ext.session_id.clone(),
            extension_version: ext.extension_version.clone(),
        }
    }

    pub fn tracking_status(&self) -> TrackingStatus {
        Self::tracking_view(&self.state.lock().extension, Utc::now())
    }

    pub fn session_changed_at(&self) -> Option<DateTime<Utc>> {
        self.state.lock().extension.session_changed_at
    }

    /// Called on every `GET /pending-queries`.
    pub fn record_poll(&self) {
        self.state.lock().extension.last_poll_at = Some(Utc::now());
    }

    pub fn connectivity(&self) -> Connectivity {
        Self::connectivity_of(&self.state.lock().extension, Utc::now())
    }

    fn connectivity_of(ext: &ExtensionState, now: DateTime<Utc>) -> Connectivity {
        let last_seen = ext.last_seen();
        let status = match last_seen.map(|t| now - t) {
            None => "never_connected",
            Some(age) if age < Duration::seconds(EXTENSION_FRESH_SECS) => "connected",
            Some(age) if age < Duration::seconds(EXTENSION_CONNECTED_SECS) => "stale",
            Some(_) => "disconnected",
        };
        Connectivity {
            connected: matches!(status, "connected" | "stale"),
            status,
            last_poll_ms: ext
                .last_poll_at
                .map(|t| (now - t).num_milliseconds().max(0)),
            last_seen,
        }
    }

    pub fn pilot_readiness(&self) -> PilotReadiness {
        let state = self.state.lock();
        let ext = &state.extension;
        if ext.last_seen().is_none() {
            return PilotReadiness::NeverConnected;
        }
        match ext.pilot_enabled {
            Some(false) => PilotReadiness::Disabled,
            _ => PilotReadiness::Ready,
        }
    }

    // Alerts

    pub fn drain_alerts(&self) -> Vec<Alert> {
        self.state.lock().alerts.drain()
    }

    pub fn push_alert(&self, alert: Alert) {
        self.state.lock().alerts.push(alert);
    }

    pub fn record_ci(&self, ci: CiResult) -> bool {
        self.state.lock().alerts.record_ci(ci, Utc::now())
    }

    pub fn ci_results(&self) -> Vec<CiResult> {
        self.state.lock().alerts.ci_results()
    }

    // Maintenance

    /// Empties the selected buffers. Positions are preserved.
    pub fn clear(&self, scope: ClearScope) -> Vec<Category> {
        let cleared: Vec<Category> = match scope {
            ClearScope::All => Category::ALL.to_vec(),
            ClearScope::One(category) => vec![category],
        };
        let (clear_console, file_guard) = {
            let mut state = self.state.lock();
            for category in &cleared {
                match category {
                    Category::Console => state.console.clear(),
                    Category::Network => {
                        state.network.clear();
                        state.network_bytes = 0;
                    }
                    Category::WebSocket => {
                        state.websocket.clear();
                        state.websocket_bytes = 0;
                        state.connections.clear();
                    }
                    Category::Actions => state.actions.clear(),
                    Category::Waterfall => state.waterfall.clear(),
                    Category::Performance => state.perf.clear(),
                    Category::ExtensionLogs => state.extension_logs.clear(),
                }
            }
            let clear_console = cleared.contains(&Category::Console);
            let file_guard = (clear_console && self.console_log.is_some())
                .then(|| self.file_lock.lock());
            (clear_console, file_guard)
        };
        if clear_console {
            if let Some(log) = &self.console_log {
                if let Err(e) = log.truncate() {
                    warn!(error = %e, "could not truncate console log");
                }
            }
        }
        drop(file_guard);
        info!(categories = ?cleared, "buffers cleared");
        cleared
    }

    /// Newest `added_at` of the given buffer, for staleness metadata.
    pub fn last_write(&self, category: Category) -> Option<DateTime<Utc>> {
        let state = self.state.lock();
        match category {
            Category::Console => state.console.newest_added_at(),
            Category::Network => state.network.newest_added_at(),
            Category::WebSocket => state.websocket.newest_added_at(),
            Category::Actions => state.actions.newest_added_at(),
            Category::Waterfall => state.waterfall.newest_added_at(),
            Category::ExtensionLogs => state.extension_logs.newest_added_at(),
            Category::Performance => state
                .perf
                .latest()
                .and_then(|s| parse_timestamp(&s.timestamp)),
        }
    }

    /// Every health field read under one lock acquisition.
    pub fn health(&self) -> HealthSnapshot {
        let now = Utc::now();
        let state = self.state.lock();
        let circuit = state.circuit.snapshot(now);
        let connectivity = Self::connectivity_of(&state.extension, now);
        HealthSnapshot {
            logs: HealthLogs {
                entries: state.console.len(),
                max_entries: self.max_console_entries,
                total_added: state.console.current_position(),
                log_file: self
                    .console_log
                    .as_ref()
                    .map(|l| l.path().display().to_string())
                    .unwrap_or_default(),
            },
            buffers: HealthBuffers {
                network_bodies: state.network.len(),
                websocket_events: state.websocket.len(),
                actions: state.actions.len(),
                waterfall: state.waterfall.len(),
                extension_logs: state.extension_logs.len(),
                performance_snapshots: state.perf.snapshot_count(),
                pending_queries: self.correlator.queue_depth(),
                network_memory_bytes: state.network_bytes,
                websocket_memory_bytes: state.websocket_bytes,
            },
            extension: HealthExtension {
                connected: connectivity.connected,
                status: connectivity.status.to_string(),
                last_poll_ms: connectivity.last_poll_ms,
                pilot_enabled: state.extension.pilot_enabled.unwrap_or(false),
                session_id: state.extension.session_id.clone(),
            },
            circuit: HealthCircuit {
                open: circuit.open,
                reason: circuit.reason,
                window_event_count: circuit.window_event_count,
                threshold: circuit.threshold,
                open_count: circuit.open_transitions,
            },
            active_websockets: state.connections.active_count(),
            alerts_queued: state.alerts.len(),
        }
    }
}

/// Store-side half of `/health`; the web layer adds version and process info.
#[derive(Debug, Clone, PartialEq)]
pub struct HealthSnapshot {
    pub logs: HealthLogs,
    pub buffers: HealthBuffers,
    pub extension: HealthExtension,
    pub circuit: HealthCircuit,
    pub active_websockets: usize,
    pub alerts_queued: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn log(level: &str, message: &str) -> JsonValue {
        json!({"level": level, "message": message, "timestamp": "2026-03-01T10:00:00Z"})
    }

    #[test]
    fn add_logs_counts_rejects_without_aborting_batch() {
        let store = CaptureStore::default();
        let resp = store.add_logs(vec![
            log("info", "a"),
            json!({"message": "no level"}),
            json!({"level": "fatal"}),
            log("error", "b"),
        ]);
        assert_eq!(resp.received, 2);
        assert_eq!(resp.rejected, 2);
        assert_eq!(resp.entries, 2);
    }

    #[test]
    fn oversized_log_entry_is_rejected() {
        let store = CaptureStore::default();
        let big = "x".repeat(MAX_LOG_ENTRY_BYTES + 1);
        let resp = store.add_logs(vec![log("info", &big)]);
        assert_eq!(resp.received, 0);
        assert_eq!(resp.rejected, 1);
    }

    #[test]
    fn console_persists_and_rewrites_on_eviction() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("gasoline-logs.jsonl");
        let store = CaptureStore::new(StoreConfig {
            max_console_entries: 3,
            log_file: Some(path.clone()),
        });
        store.add_logs(vec![log("info", "1"), log("info", "2")]);
        store.add_logs(vec![log("info", "3"), log("info", "4")]);

        let contents = std::fs::read_to_string(&path).expect("read log");
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].contains("\"2\""));

        let restored = CaptureStore::new(StoreConfig {
            max_console_entries: 3,
            log_file: Some(path),
        });
        let messages: Vec<String> = restored
            .console_entries()
            .iter()
            .map(|e| e.message_str().to_string())
            .collect();
        assert_eq!(messages, ["2", "3", "4"]);
    }

    #[test]
    fn concurrent_ingest_keeps_file_in_step_with_ring() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("gasoline-logs.jsonl");
        for round in 0..10 {
            let _ = std::fs::remove_file(&path);
            let store = CaptureStore::new(StoreConfig {
                max_console_entries: 20,
                log_file: Some(path.clone()),
            });
            std::thread::scope(|s| {
                for t in 0..8 {
                    let store = &store;
                    s.spawn(move || {
                        for i in 0..50 {
                            store.add_logs(vec![log("info", &format!("{t}-{i}"))]);
                            if t == 0 && i == 25 {
                                store.clear(ClearScope::One(Category::Console));
                            }
                        }
                    });
                }
            });
            let ring: Vec<String> = store
                .console_entries()
                .iter()
                .map(|e| e.message_str().to_string())
                .collect();
            let on_disk: Vec<String> = ConsoleLog::new(&path)
                .load(20)
                .expect("load")
                .iter()
                .map(|e| e.message_str().to_string())
                .collect();
            assert_eq!(ring, on_disk, "round {round}");
        }
    }

    #[test]
    fn clear_preserves_positions() {
        let store = CaptureStore::default();
        store.add_logs(vec![log("info", "a"), log("warn", "b")]);
        assert_eq!(store.console_position(), 2);
        store.clear(ClearScope::One(Category::Console));
        assert_eq!(store.console_position(), 2);
        assert!(store.console_entries().is_empty());

        store.add_logs(vec![log("info", "c")]);
        let (entries, cursor) = store.console_since(BufferCursor::at(2), |_| true, 0);
        assert_eq!(entries.len(), 1);
        assert_eq!(cursor, BufferCursor::at(3));
    }

    #[test]
    fn network_bodies_are_truncated_and_budgeted() {
        let store = CaptureStore::default();
        let body = "y".repeat(64 * 1024);
        let resp = store.add_network_bodies(vec![
            json!({"url": "https://api.test/a", "method": "POST", "status": 500, "response_body": body}),
            json!({"method": "GET"}),
        ]);
        assert_eq!(resp.received, 1);
        assert_eq!(resp.rejected, 1);
        let stored = store.network_bodies();
        assert!(stored[0].response_truncated);
        assert!(stored[0].response_body.len() <= gasoline_types::network::MAX_RESPONSE_BODY_BYTES);
        assert!(store.health().buffers.network_memory_bytes > 0);
    }

    #[test]
    fn session_change_resets_active_websockets() {
        let store = CaptureStore::default();
        store.add_websocket_events(vec![
            json!({"event": "open", "id": "ws-1", "url": "wss://x.test/feed"}),
        ]);
        assert_eq!(store.websocket_status(None, None).active_count, 1);

        store.update_extension_status(ExtensionStatusPost {
            session_id: Some("s1".into()),
            ..Default::default()
        });
        assert_eq!(store.websocket_status(None, None).active_count, 0);
        assert!(store.session_changed_at().is_some());
        assert_eq!(store.websocket_events().len(), 1);
    }

    #[test]
    fn tracking_status_and_connectivity() {
        let store = CaptureStore::default();
        assert_eq!(store.connectivity().status, "never_connected");
        assert_eq!(store.pilot_readiness(), PilotReadiness::NeverConnected);

        let status = store.update_extension_status(ExtensionStatusPost {
            tracking_enabled: Some(true),
            tracked_tab_id: Some(42),
            tracked_tab_url: Some("https://app.test/".into()),
            pilot_enabled: Some(false),
            ..Default::default()
        });
        assert!(status.tracking_enabled);
        assert_eq!(status.tracked_tab_id, Some(42));
        assert!(status.extension_connected);
        assert_eq!(store.connectivity().status, "connected");
        assert_eq!(store.pilot_readiness(), PilotReadiness::Disabled);

        store.record_poll();
        assert!(store.health().extension.last_poll_ms.is_some());
    }

    #[test]
    fn console_error_spike_queues_alert() {
        let store = CaptureStore::default();
        let now = Utc::now();
        let batch: Vec<JsonValue> = (0..10)
            .map(|i| {
                json!({
                    "level": "error",
                    "message": format!("boom {i}"),
                    "timestamp": rfc3339(now + Duration::milliseconds(i * 50)),
                })
            })
            .collect();
        store.add_logs(batch);
        let alerts = store.drain_alerts();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].category, "anomaly");
        assert!(store.drain_alerts().is_empty());
    }

    #[test]
    fn clear_scope_parses_categories() {
        assert_eq!("all".parse::<ClearScope>(), Ok(ClearScope::All));
        assert_eq!(
            "network".parse::<ClearScope>(),
            Ok(ClearScope::One(Category::Network))
        );
        assert!("bogus".parse::<ClearScope>().is_err());
    }
}
