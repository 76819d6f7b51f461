//! Latest performance snapshot per URL plus running-average baselines.

use std::collections::{HashMap, VecDeque};

use gasoline_types::{
    BaselineNetwork, BaselineTiming, LongTaskMetrics, PerformanceBaseline, PerformanceSnapshot,
};
use serde::Serialize;

pub const MAX_SNAPSHOTS: usize = 20;
pub const MAX_BASELINES: usize = 20;
const MAX_STASHED: usize = 20;

/// Keyed store with insertion-order eviction.
#[derive(Debug, Clone)]
struct Bounded<V> {
    cap: usize,
    map: HashMap<String, V>,
    order: VecDeque<String>,
}

impl<V> Bounded<V> {
    fn new(cap: usize) -> Self {
        Self {
            cap,
            map: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    fn insert(&mut self, key: String, value: V) {
        if self.map.insert(key.clone(), value).is_some() {
            self.order.retain(|k| k != &key);
        }
        self.order.push_back(key);
        while self.order.len() > self.cap {
            if let Some(oldest) = self.order.pop_front() {
                self.map.remove(&oldest);
            }
        }
    }

    fn get(&self, key: &str) -> Option<&V> {
        self.map.get(key)
    }

    fn remove(&mut self, key: &str) -> Option<V> {
        let value = self.map.remove(key)?;
        self.order.retain(|k| k != key);
        Some(value)
    }

    fn values_in_order(&self) -> impl Iterator<Item = &V> {
        self.order.iter().filter_map(|k| self.map.get(k))
    }

    fn len(&self) -> usize {
        self.map.len()
    }

    fn clear(&mut self) {
        self.map.clear();
        self.order.clear();
    }
}

#[derive(Debug, Clone)]
pub struct PerformanceStore {
    snapshots: Bounded<PerformanceSnapshot>,
    baselines: Bounded<PerformanceBaseline>,
    before: Bounded<PerformanceSnapshot>,
}

impl Default for PerformanceStore {
    fn default() -> Self {
        Self {
            snapshots: Bounded::new(MAX_SNAPSHOTS),
            baselines: Bounded::new(MAX_BASELINES),
            before: Bounded::new(MAX_STASHED),
        }
    }
}

/// Signed change between two snapshots, for navigate/refresh results.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PerfDiff {
    pub url: String,
    pub load_ms: f64,
    pub dom_content_loaded_ms: f64,
    pub ttfb_ms: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fcp_ms: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lcp_ms: Option<f64>,
    pub request_count: i64,
    pub transfer_size: i64,
}

impl PerformanceStore {
    pub fn add(&mut self, snapshot: PerformanceSnapshot, now: &str) {
        self.update_baseline(&snapshot, now);
        self.snapshots.insert(snapshot.url.clone(), snapshot);
    }

    fn update_baseline(&mut self, s: &PerformanceSnapshot, now: &str) {
        let next = match self.baselines.get(&s.url) {
            None => PerformanceBaseline {
                url: s.url.clone(),
                sample_count: 1,
                last_updated: now.to_string(),
                timing: BaselineTiming {
                    dom_content_loaded: s.timing.dom_content_loaded,
                    load: s.timing.load,
                    fcp: s.timing.fcp,
                    lcp: s.timing.lcp,
                    ttfb: s.timing.ttfb,
                    dom_interactive: s.timing.dom_interactive,
                },
                network: BaselineNetwork {
                    request_count: s.network.request_count as f64,
                    transfer_size: s.network.transfer_size as f64,
                },
                long_tasks: s.long_tasks.clone(),
                cls: s.cls,
            },
            Some(prev) => {
                let n = prev.sample_count as f64;
                let avg = |old: f64, new: f64| (old * n + new) / (n + 1.0);
                let avg_opt = |old: Option<f64>, new: Option<f64>| match (old, new) {
                    (Some(o), Some(v)) => Some(avg(o, v)),
                    (None, v) => v,
                    (o, None) => o,
                };
                PerformanceBaseline {
                    url: s.url.clone(),
                    sample_count: prev.sample_count + 1,
                    last_updated: now.to_string(),
                    timing: BaselineTiming {
                        dom_content_loaded: avg(
                            prev.timing.dom_content_loaded,
                            s.timing.dom_content_loaded,
                        ),
                        load: avg(prev.timing.load, s.timing.load),
                        fcp: avg_opt(prev.timing.fcp, s.timing.fcp),
                        lcp: avg_opt(prev.timing.lcp, s.timing.lcp),
                        ttfb: avg(prev.timing.ttfb, s.timing.ttfb),
                        dom_interactive: avg(prev.timing.dom_interactive, s.timing.dom_interactive),
                    },
                    network: BaselineNetwork {
                        request_count: avg(
                            prev.network.request_count,
                            s.network.request_count as f64,
                        ),
                        transfer_size: avg(
                            prev.network.transfer_size,
                            s.network.transfer_size as f64,
                        ),
                    },
                    long_tasks: LongTaskMetrics {
                        count: avg(prev.long_tasks.count as f64, s.long_tasks.count as f64).round()
                            as u64,
                        total_blocking_time: avg(
                            prev.long_tasks.total_blocking_time,
                            s.long_tasks.total_blocking_time,
                        ),
                        longest: avg(prev.long_tasks.longest, s.long_tasks.longest),
                    },
                    cls: avg_opt(prev.cls, s.cls),
                }
            }
        };
        self.baselines.insert(s.url.clone(), next);
    }

    pub fn snapshot(&self, url: &str) -> Option<&PerformanceSnapshot> {
        self.snapshots.get(url)
    }

    /// Most recently updated snapshot.
    pub fn latest(&self) -> Option<&PerformanceSnapshot> {
        self.snapshots.order.back().and_then(|k| self.snapshots.get(k))
    }

    pub fn snapshots(&self) -> Vec<PerformanceSnapshot> {
        self.snapshots.values_in_order().cloned().collect()
    }

    pub fn baseline(&self, url: &str) -> Option<&PerformanceBaseline> {
        self.baselines.get(url)
    }

    pub fn baselines(&self) -> Vec<PerformanceBaseline> {
        self.baselines.values_in_order().cloned().collect()
    }

    pub fn snapshot_count(&self) -> usize {
        self.snapshots.len()
    }

    /// Remembers the current page's snapshot before a navigation so the
    /// command result can report what changed.
    pub fn stash_before(&mut self, correlation_id: &str) -> bool {
        match self.latest().cloned() {
            Some(snapshot) => {
                self.before.insert(correlation_id.to_string(), snapshot);
                true
            }
            None => false,
        }
    }

    pub fn take_diff(&mut self, correlation_id: &str) -> Option<PerfDiff> {
        let before = self.before.remove(correlation_id)?;
        let after = self.snapshots.get(&before.url).or_else(|| self.latest())?;
        if after == &before {
            return None;
        }
        let delta_opt = |a: Option<f64>, b: Option<f64>| Some(a? - b?);
        Some(PerfDiff {
            url: after.url.clone(),
            load_ms: after.timing.load - before.timing.load,
            dom_content_loaded_ms: after.timing.dom_content_loaded
                - before.timing.dom_content_loaded,
            ttfb_ms: after.timing.ttfb - before.timing.ttfb,
            fcp_ms: delta_opt(after.timing.fcp, before.timing.fcp),
            lcp_ms: delta_opt(after.timing.lcp, before.timing.lcp),
            request_count: after.network.request_count as i64 - before.network.request_count as i64,
            transfer_size: after.network.transfer_size - before.network.transfer_size,
        })
    }

    pub fn clear(&mut self) {
        self.snapshots.clear();
        self.baselines.clear();
        self.before.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gasoline_types::PerformanceTiming;

    fn snap(url: &str, load: f64, fcp: Option<f64>) -> PerformanceSnapshot {
        PerformanceSnapshot {
            url: url.to_string(),
            timestamp: String::new(),
            timing: PerformanceTiming {
                load,
                fcp,
                ..PerformanceTiming::default()
            },
            network: Default::default(),
            long_tasks: Default::default(),
            cls: None,
            resources: Vec::new(),
        }
    }

    #[test]
    fn baseline_is_running_average() {
        let mut store = PerformanceStore::default();
        store.add(snap("/", 100.0, None), "t1");
        store.add(snap("/", 200.0, Some(50.0)), "t2");
        store.add(snap("/", 300.0, Some(150.0)), "t3");
        let baseline = store.baseline("/").expect("baseline");
        assert_eq!(baseline.sample_count, 3);
        assert!((baseline.timing.load - 200.0).abs() < 1e-9);
        assert_eq!(baseline.last_updated, "t3");
        assert!(baseline.timing.fcp.is_some());
    }

    #[test]
    fn snapshots_are_capped_by_url() {
        let mut store = PerformanceStore::default();
        for i in 0..(MAX_SNAPSHOTS + 5) {
            store.add(snap(&format!("/p{i}"), 1.0, None), "t");
        }
        assert_eq!(store.snapshot_count(), MAX_SNAPSHOTS);
        assert!(store.snapshot("/p0").is_none());
        assert_eq!(store.latest().map(|s| s.url.as_str()), Some("/p24"));
    }

    #[test]
    fn stashed_snapshot_yields_diff_after_reload() {
        let mut store = PerformanceStore::default();
        store.add(snap("/", 500.0, Some(100.0)), "t1");
        assert!(store.stash_before("nav_1"));
        store.add(snap("/", 350.0, Some(80.0)), "t2");
        let diff = store.take_diff("nav_1").expect("diff");
        assert_eq!(diff.load_ms, -150.0);
        assert_eq!(diff.fcp_ms, Some(-20.0));
        assert!(store.take_diff("nav_1").is_none());
    }
}
