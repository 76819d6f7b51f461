//! Process lifecycle: PID file, upgrade marker, binary watcher, sweeper,
//! panic capture and shutdown signalling.

use std::any::Any;
use std::backtrace::Backtrace;
use std::fs;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use gasoline_capture::time::now_rfc3339;
use gasoline_types::UpgradeMarker;
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::app::AppState;
use crate::config::VERSION;

const SWEEP_INTERVAL: Duration = Duration::from_secs(1);
const HOUSEKEEPING_INTERVAL: Duration = Duration::from_secs(30);
const WATCH_INTERVAL: Duration = Duration::from_secs(30);
const UPGRADE_GRACE: Duration = Duration::from_secs(5);
const VERSION_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// One-shot, cloneable shutdown flag. Waiters registered after the trigger
/// resolve immediately.
#[derive(Clone)]
pub struct Shutdown {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }

    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        let _ = rx.wait_for(|stopped| *stopped).await;
    }
}

/// Removes the PID file when dropped.
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    pub fn write(path: PathBuf) -> Result<Self, String> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)
                .map_err(|e| format!("create state dir {}: {e}", dir.display()))?;
        }
        fs::write(&path, std::process::id().to_string())
            .map_err(|e| format!("write pid file {}: {e}", path.display()))?;
        debug!(path = %path.display(), "pid file written");
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), error = %e, "could not remove pid file");
        }
    }
}

/// Reads and deletes the marker. A second call returns `None`.
pub fn take_upgrade_marker(path: &Path) -> Option<UpgradeMarker> {
    let raw = fs::read_to_string(path).ok()?;
    if let Err(e) = fs::remove_file(path) {
        warn!(path = %path.display(), error = %e, "could not remove upgrade marker");
    }
    match serde_json::from_str(&raw) {
        Ok(marker) => Some(marker),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "ignoring malformed upgrade marker");
            None
        }
    }
}

pub fn write_upgrade_marker(path: &Path, marker: &UpgradeMarker) -> Result<(), String> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir).map_err(|e| format!("create {}: {e}", dir.display()))?;
    }
    let body = serde_json::to_string(marker).map_err(|e| format!("encode upgrade marker: {e}"))?;
    fs::write(path, body).map_err(|e| format!("write {}: {e}", path.display()))
}

/// Appends a timestamped record to the crash log. Failures are only logged.
pub fn append_crash_log(path: &Path, text: &str) {
    let result = (|| -> std::io::Result<()> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        writeln!(file, "[{}] {text}", now_rfc3339())
    })();
    if let Err(e) = result {
        warn!(path = %path.display(), error = %e, "could not append to crash log");
    }
}

/// A panic caught inside a [`PANIC_SLOT`] scope.
#[derive(Debug, Clone)]
pub struct PanicReport {
    pub message: String,
    pub location: Option<String>,
    pub backtrace: String,
}

pub type PanicSlot = Arc<Mutex<Option<PanicReport>>>;

tokio::task_local! {
    /// Set around each tool call. A panic inside the scope is handed to the
    /// dispatcher through this slot instead of going to the crash log directly.
    pub static PANIC_SLOT: PanicSlot;
}

pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Installs the process panic hook. Every panic gets a forced backtrace.
/// Panics inside a tool call are parked in its [`PANIC_SLOT`]; any other
/// panic is appended to `crash_log` before the previous hook runs.
pub fn install_panic_hook(crash_log: PathBuf) {
    let previous = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let report = PanicReport {
            message: panic_message(info.payload()),
            location: info.location().map(ToString::to_string),
            backtrace: Backtrace::force_capture().to_string(),
        };
        let parked = PANIC_SLOT
            .try_with(|slot| *slot.lock() = Some(report.clone()))
            .is_ok();
        if parked {
            return;
        }
        append_crash_log(
            &crash_log,
            &format!(
                "panic at {}: {}\n{}",
                report.location.as_deref().unwrap_or("unknown location"),
                report.message,
                report.backtrace
            ),
        );
        previous(info);
    }));
}

/// Resolves on ctrl-c, SIGTERM or SIGHUP.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match (signal(SignalKind::terminate()), signal(SignalKind::hangup())) {
            (Ok(mut term), Ok(mut hup)) => {
                tokio::select! {
                    _ = term.recv() => {}
                    _ = hup.recv() => {}
                }
            }
            _ => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

/// Command deadlines every second; server-side map pruning every 30 s.
pub async fn run_sweeper(state: AppState) {
    let mut sweep = tokio::time::interval(SWEEP_INTERVAL);
    let mut housekeeping = tokio::time::interval(HOUSEKEEPING_INTERVAL);
    loop {
        tokio::select! {
            _ = state.shutdown.wait() => break,
            _ = sweep.tick() => {
                let report = state.store.correlator().sweep(Instant::now());
                if report.timed_out > 0 || report.evicted_commands > 0 || report.purged_results > 0 {
                    debug!(
                        timed_out = report.timed_out,
                        evicted = report.evicted_commands,
                        purged = report.purged_results,
                        "correlator sweep"
                    );
                }
            }
            _ = housekeeping.tick() => {
                state.inner.lock().prune(Instant::now());
            }
        }
    }
    debug!("sweeper stopped");
}

type Fingerprint = (SystemTime, u64);

fn fingerprint(path: &Path) -> Option<Fingerprint> {
    let meta = fs::metadata(path).ok()?;
    Some((meta.modified().ok()?, meta.len()))
}

async fn probe_version(exe: &Path) -> Option<String> {
    let output = tokio::time::timeout(
        VERSION_PROBE_TIMEOUT,
        tokio::process::Command::new(exe).arg("--version").output(),
    )
    .await
    .ok()?
    .ok()?;
    if !output.status.success() {
        return None;
    }
    let text = String::from_utf8_lossy(&output.stdout);
    text.split_whitespace().last().map(str::to_string)
}

/// Dotted numeric comparison; a leading `v` is ignored.
pub fn is_newer(candidate: &str, current: &str) -> bool {
    fn parts(v: &str) -> Vec<u64> {
        v.trim()
            .trim_start_matches('v')
            .split(['.', '-', '+'])
            .map_while(|p| p.parse().ok())
            .collect()
    }
    let (a, b) = (parts(candidate), parts(current));
    if a.is_empty() {
        return false;
    }
    a > b
}

/// Polls the running executable. When it is replaced by a newer build the
/// marker is written and shutdown is triggered after a grace period.
pub async fn watch_binary(exe: PathBuf, marker_path: PathBuf, shutdown: Shutdown) {
    let mut last = fingerprint(&exe);
    let mut ticker = tokio::time::interval(WATCH_INTERVAL);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = shutdown.wait() => return,
            _ = ticker.tick() => {}
        }
        let current = fingerprint(&exe);
        if current.is_none() || current == last {
            continue;
        }
        last = current;
        let Some(version) = probe_version(&exe).await else {
            debug!(exe = %exe.display(), "binary changed but version probe failed");
            continue;
        };
        if !is_newer(&version, VERSION) {
            continue;
        }
        info!(from = VERSION, to = %version, "newer gasoline binary detected, restarting");
        let marker = UpgradeMarker {
            from_version: VERSION.to_string(),
            to_version: version,
            timestamp: now_rfc3339(),
        };
        if let Err(e) = write_upgrade_marker(&marker_path, &marker) {
            warn!(error = %e, "could not write upgrade marker");
        }
        tokio::time::sleep(UPGRADE_GRACE).await;
        shutdown.trigger();
        return;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upgrade_marker_is_consumed_once() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("state").join("last-upgrade.json");
        let marker = UpgradeMarker {
            from_version: "0.7.1".into(),
            to_version: "0.7.2".into(),
            timestamp: "2026-01-02T03:04:05Z".into(),
        };
        write_upgrade_marker(&path, &marker).expect("write");
        assert_eq!(take_upgrade_marker(&path), Some(marker));
        assert!(!path.exists());
        assert_eq!(take_upgrade_marker(&path), None);
    }

    #[test]
    fn pid_file_is_removed_on_drop() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("gasoline-7890.pid");
        {
            let pid = PidFile::write(path.clone()).expect("write");
            let body = fs::read_to_string(pid.path()).expect("read");
            assert_eq!(body, std::process::id().to_string());
        }
        assert!(!path.exists());
    }

    #[test]
    fn version_comparison() {
        assert!(is_newer("0.2.0", "0.1.9"));
        assert!(is_newer("v1.0.0", "0.9.9"));
        assert!(!is_newer("0.1.0", "0.1.0"));
        assert!(!is_newer("0.0.9", "0.1.0"));
        assert!(!is_newer("garbage", "0.1.0"));
    }

    #[tokio::test]
    async fn shutdown_wakes_late_waiters() {
        let shutdown = Shutdown::new();
        assert!(!shutdown.is_triggered());
        shutdown.trigger();
        tokio::time::timeout(Duration::from_millis(100), shutdown.wait())
            .await
            .expect("already triggered");
    }
}
