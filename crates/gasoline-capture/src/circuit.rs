//! Per-category ingest rate limiting.
//!
//! Each category counts events in a fixed window. The window restarts on the
//! first write after it ends. Going over the threshold opens that category's
//! circuit: later writes are dropped until a fresh window starts, at which
//! point the circuit closes again (and may reopen if the new window also
//! overflows).

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use tracing::{info, warn};

pub const RATE_WINDOW_SECS: i64 = 5;
pub const RATE_THRESHOLD: u64 = 1000;

/// One kind of captured data. Used for rate limiting and for `clear`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Category {
    Console,
    Network,
    WebSocket,
    Actions,
    Waterfall,
    Performance,
    ExtensionLogs,
}

impl Category {
    pub const ALL: [Category; 7] = [
        Category::Console,
        Category::Network,
        Category::WebSocket,
        Category::Actions,
        Category::Waterfall,
        Category::Performance,
        Category::ExtensionLogs,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Category::Console => "console",
            Category::Network => "network",
            Category::WebSocket => "websocket",
            Category::Actions => "actions",
            Category::Waterfall => "waterfall",
            Category::Performance => "performance",
            Category::ExtensionLogs => "extension_logs",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Category {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Category::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| format!("unknown buffer category `{s}`"))
    }
}

#[derive(Debug, Clone)]
struct Window {
    started_at: DateTime<Utc>,
    count: u64,
    open: bool,
    reason: Option<String>,
    dropped: u64,
}

/// Outcome of [`CircuitBreaker::admit`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Accepted,
    /// The batch was accepted but pushed the category over the threshold.
    Tripped { reason: String },
    Dropped { reason: String },
}

#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    window: Duration,
    threshold: u64,
    windows: BTreeMap<Category, Window>,
    open_transitions: u64,
}

/// Consistent view for `/health`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CircuitSnapshot {
    pub open: bool,
    pub reason: Option<String>,
    pub window_event_count: u64,
    pub threshold: u64,
    pub open_transitions: u64,
    pub dropped: u64,
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(Duration::seconds(RATE_WINDOW_SECS), RATE_THRESHOLD)
    }
}

impl CircuitBreaker {
    pub fn new(window: Duration, threshold: u64) -> Self {
        Self {
            window,
            threshold,
            windows: BTreeMap::new(),
            open_transitions: 0,
        }
    }

    /// Counts `n` events for `category` at `now` and decides whether they may
    /// be stored.
    pub fn admit(&mut self, category: Category, n: u64, now: DateTime<Utc>) -> Admission {
        let window = self.windows.entry(category).or_insert_with(|| Window {
            started_at: now,
            count: 0,
            open: false,
            reason: None,
            dropped: 0,
        });

        if now - window.started_at >= self.window {
            if window.open {
                info!(%category, dropped = window.dropped, "ingest circuit closed");
            }
            window.started_at = now;
            window.count = 0;
            window.open = false;
            window.reason = None;
        }

        if window.open {
            window.dropped += n;
            return Admission::Dropped {
                reason: window.reason.clone().unwrap_or_default(),
            };
        }

        window.count += n;
        if window.count > self.threshold {
            let reason = format!(
                "{category} ingest rate {} events in {}s exceeds {}",
                window.count,
                self.window.num_seconds(),
                self.threshold
            );
            warn!(%category, count = window.count, threshold = self.threshold, "ingest circuit opened");
            window.open = true;
            window.reason = Some(reason.clone());
            self.open_transitions += 1;
            return Admission::Tripped { reason };
        }
        Admission::Accepted
    }

    pub fn is_open(&self, category: Category) -> bool {
        self.windows.get(&category).is_some_and(|w| w.open)
    }

    pub fn snapshot(&self, now: DateTime<Utc>) -> CircuitSnapshot {
        let mut snap = CircuitSnapshot {
            threshold: self.threshold,
            open_transitions: self.open_transitions,
            ..CircuitSnapshot::default()
        };
        for window in self.windows.values() {
            if now - window.started_at < self.window {
                snap.window_event_count += window.count;
            }
            snap.dropped += window.dropped;
            if window.open {
                snap.open = true;
                if snap.reason.is_none() {
                    snap.reason = window.reason.clone();
                }
            }
        }
        snap
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn circuit_opens_over_threshold_and_closes_on_next_window() {
        let t0 = Utc::now();
        let mut breaker = CircuitBreaker::new(Duration::seconds(5), 10);

        assert_eq!(breaker.admit(Category::Console, 10, t0), Admission::Accepted);
        assert!(matches!(
            breaker.admit(Category::Console, 1, t0),
            Admission::Tripped { .. }
        ));
        assert!(breaker.is_open(Category::Console));
        assert!(matches!(
            breaker.admit(Category::Console, 1, t0 + Duration::seconds(4)),
            Admission::Dropped { .. }
        ));
        // Other categories are unaffected.
        assert_eq!(breaker.admit(Category::Network, 5, t0), Admission::Accepted);

        let snap = breaker.snapshot(t0 + Duration::seconds(1));
        assert!(snap.open);
        assert_eq!(snap.open_transitions, 1);
        assert!(snap.reason.as_deref().is_some_and(|r| r.contains("console")));

        // First write after the window ends resets it.
        assert_eq!(
            breaker.admit(Category::Console, 1, t0 + Duration::seconds(5)),
            Admission::Accepted
        );
        assert!(!breaker.is_open(Category::Console));
    }

    #[test]
    fn oversized_batch_in_fresh_window_reopens() {
        let t0 = Utc::now();
        let mut breaker = CircuitBreaker::new(Duration::seconds(5), 3);
        assert!(matches!(breaker.admit(Category::WebSocket, 4, t0), Admission::Tripped { .. }));
        assert!(matches!(
            breaker.admit(Category::WebSocket, 4, t0 + Duration::seconds(6)),
            Admission::Tripped { .. }
        ));
        assert_eq!(breaker.snapshot(t0 + Duration::seconds(6)).open_transitions, 2);
    }
}
