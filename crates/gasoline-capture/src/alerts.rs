//! Alerts waiting to be piggybacked onto the next observe response.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Duration, Utc};
use gasoline_types::{Alert, AlertSeverity, CiResult};
use tracing::info;

use crate::time::{parse_timestamp, rfc3339};

pub const ALERT_QUEUE_CAP: usize = 50;
pub const CI_RESULTS_CAP: usize = 20;
const ANOMALY_WINDOW_SECS: i64 = 60;
const ANOMALY_BUCKET_SECS: i64 = 10;

#[derive(Debug, Clone, Default)]
pub struct AlertQueue {
    alerts: VecDeque<Alert>,
    ci_results: VecDeque<CiResult>,
    error_times: VecDeque<DateTime<Utc>>,
}

impl AlertQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, alert: Alert) {
        if self.alerts.len() >= ALERT_QUEUE_CAP {
            self.alerts.pop_front();
        }
        self.alerts.push_back(alert);
    }

    pub fn len(&self) -> usize {
        self.alerts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.alerts.is_empty()
    }

    /// Takes every queued alert, folding duplicates (same title and category)
    /// into one with a `count`, most severe first and newest first within a
    /// severity.
    pub fn drain(&mut self) -> Vec<Alert> {
        let raw: Vec<Alert> = self.alerts.drain(..).collect();
        let mut index: HashMap<(String, String), usize> = HashMap::new();
        let mut out: Vec<Alert> = Vec::new();
        for mut alert in raw {
            let key = (alert.title.clone(), alert.category.clone());
            if let Some(&i) = index.get(&key) {
                let existing = &mut out[i];
                existing.count += 1;
                if alert.timestamp > existing.timestamp {
                    existing.timestamp = alert.timestamp;
                }
            } else {
                alert.count = 1;
                index.insert(key, out.len());
                out.push(alert);
            }
        }
        for alert in &mut out {
            if alert.count == 1 {
                alert.count = 0;
            }
        }
        out.sort_by(|a, b| {
            b.severity
                .cmp(&a.severity)
                .then_with(|| b.timestamp.cmp(&a.timestamp))
        });
        out
    }

    /// Stores a CI result and raises an alert for it. A repeat of the same
    /// commit and status replaces the earlier result (and its queued alert)
    /// instead of adding a new one. Returns true when a new alert was queued.
    pub fn record_ci(&mut self, mut ci: CiResult, now: DateTime<Utc>) -> bool {
        if ci.received_at.is_none() {
            ci.received_at = Some(rfc3339(now));
        }
        if let Some(existing) = self
            .ci_results
            .iter_mut()
            .find(|r| r.commit == ci.commit && r.status == ci.status)
        {
            *existing = ci.clone();
            let rebuilt = ci_alert(&ci);
            if let Some(slot) = self
                .alerts
                .iter_mut()
                .find(|a| a.category == "ci" && !ci.commit.is_empty() && a.detail.contains(&ci.commit))
            {
                *slot = rebuilt;
            }
            return false;
        }
        if self.ci_results.len() >= CI_RESULTS_CAP {
            self.ci_results.pop_front();
        }
        let alert = ci_alert(&ci);
        self.ci_results.push_back(ci);
        self.push(alert);
        true
    }

    pub fn ci_results(&self) -> Vec<CiResult> {
        self.ci_results.iter().cloned().collect()
    }

    /// Feeds one console error into the spike detector. Raises a warning when
    /// the last bucket holds more than 3x the rolling per-bucket average.
    pub fn record_error(&mut self, at: DateTime<Utc>) {
        self.error_times.push_back(at);
        let window_start = at - Duration::seconds(ANOMALY_WINDOW_SECS);
        while self.error_times.front().is_some_and(|t| *t <= window_start) {
            self.error_times.pop_front();
        }
        if self.error_times.len() < 2 {
            return;
        }
        let bucket_start = at - Duration::seconds(ANOMALY_BUCKET_SECS);
        let recent = self.error_times.iter().filter(|t| **t > bucket_start).count();
        let rolling_avg = self.error_times.len() as f64
            / (ANOMALY_WINDOW_SECS as f64 / ANOMALY_BUCKET_SECS as f64);
        if rolling_avg <= 0.0 || (recent as f64) <= 3.0 * rolling_avg {
            return;
        }
        let already = self.alerts.iter().any(|a| {
            a.category == "anomaly"
                && parse_timestamp(&a.timestamp)
                    .is_some_and(|t| at - t < Duration::seconds(ANOMALY_BUCKET_SECS))
        });
        if already {
            return;
        }
        info!(recent, rolling_avg, "error frequency spike");
        self.push(Alert {
            severity: AlertSeverity::Warning,
            category: "anomaly".to_string(),
            title: "Error frequency spike detected".to_string(),
            detail: format!(
                "{recent} errors in last {ANOMALY_BUCKET_SECS}s vs {rolling_avg:.1} rolling average"
            ),
            timestamp: rfc3339(at),
            source: "anomaly_detector".to_string(),
            count: 0,
        });
    }
}

fn ci_alert(ci: &CiResult) -> Alert {
    let severity = if ci.status == "failure" || ci.status == "error" {
        AlertSeverity::Error
    } else {
        AlertSeverity::Info
    };
    let mut detail = ci.summary.clone();
    if !ci.failures.is_empty() {
        let names: Vec<&str> = ci.failures.iter().map(|f| f.name.as_str()).collect();
        detail.push_str(" | Failed: ");
        detail.push_str(&names.join(", "));
    }
    if !ci.commit.is_empty() {
        detail.push_str(&format!(" [{}]", ci.commit));
    }
    Alert {
        severity,
        category: "ci".to_string(),
        title: format!("CI {} ({})", ci.status, ci.source),
        detail,
        timestamp: ci.received_at.clone().unwrap_or_default(),
        source: "ci_webhook".to_string(),
        count: 0,
    }
}
