//! Live WebSocket connection table fed from captured events.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Duration, Utc};
use gasoline_types::{
    ClosedConnection, DirectionStats, SamplingInfo, WebSocketConnection, WebSocketEvent,
    WebSocketStatus, WsDirection, WsEventKind,
};

use crate::time::{parse_timestamp, rfc3339};

pub const MAX_ACTIVE_CONNECTIONS: usize = 20;
pub const MAX_CLOSED_CONNECTIONS: usize = 10;
/// Rate window for `per_second`.
const RATE_WINDOW_SECS: i64 = 5;

#[derive(Debug, Clone, Default)]
struct Direction {
    total: u64,
    bytes: u64,
    last_at: Option<String>,
    last_data: Option<String>,
    recent_times: VecDeque<DateTime<Utc>>,
}

impl Direction {
    fn record(&mut self, event: &WebSocketEvent, at: DateTime<Utc>) {
        self.total += 1;
        let size = event
            .size
            .and_then(|s| u64::try_from(s).ok())
            .unwrap_or_else(|| event.data.as_ref().map_or(0, |d| d.len() as u64));
        self.bytes += size;
        self.last_at = Some(event.timestamp.clone());
        self.last_data = event.data.clone();
        prune(&mut self.recent_times, at);
        self.recent_times.push_back(at);
    }

    fn stats(&self, now: DateTime<Utc>) -> DirectionStats {
        let cutoff = now - Duration::seconds(RATE_WINDOW_SECS);
        let recent = self.recent_times.iter().filter(|t| **t > cutoff).count();
        DirectionStats {
            total: self.total,
            bytes: self.bytes,
            per_second: recent as f64 / RATE_WINDOW_SECS as f64,
            last_at: self.last_at.clone(),
            last_data: self.last_data.clone(),
        }
    }
}

fn prune(times: &mut VecDeque<DateTime<Utc>>, now: DateTime<Utc>) {
    let cutoff = now - Duration::seconds(RATE_WINDOW_SECS);
    while times.front().is_some_and(|t| *t < cutoff) {
        times.pop_front();
    }
}

#[derive(Debug, Clone)]
struct Connection {
    id: String,
    url: String,
    state: &'static str,
    opened_at: String,
    opened: DateTime<Utc>,
    incoming: Direction,
    outgoing: Direction,
    sampling: Option<SamplingInfo>,
    tab_id: Option<i64>,
}

#[derive(Debug, Clone, Default)]
pub struct ConnectionTracker {
    connections: HashMap<String, Connection>,
    /// Open order, oldest first; drives LRU eviction.
    order: VecDeque<String>,
    closed: VecDeque<ClosedConnection>,
}

impl ConnectionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track(&mut self, event: &WebSocketEvent, now: DateTime<Utc>) {
        let at = parse_timestamp(&event.timestamp).unwrap_or(now);
        match event.event {
            WsEventKind::Open => self.open(event, at),
            WsEventKind::Close => self.close(event, at),
            WsEventKind::Error => {
                if let Some(conn) = self.connections.get_mut(&event.id) {
                    conn.state = "error";
                }
            }
            WsEventKind::Message => {
                let Some(conn) = self.connections.get_mut(&event.id) else {
                    return;
                };
                match event.direction {
                    Some(WsDirection::Incoming) => conn.incoming.record(event, at),
                    Some(WsDirection::Outgoing) => conn.outgoing.record(event, at),
                    None => {}
                }
                if event.sampled.is_some() {
                    conn.sampling = event.sampled.clone();
                }
            }
        }
    }

    fn open(&mut self, event: &WebSocketEvent, at: DateTime<Utc>) {
        if self.connections.contains_key(&event.id) {
            self.order.retain(|id| id != &event.id);
        } else if self.connections.len() >= MAX_ACTIVE_CONNECTIONS {
            if let Some(oldest) = self.order.pop_front() {
                self.connections.remove(&oldest);
            }
        }
        self.connections.insert(
            event.id.clone(),
            Connection {
                id: event.id.clone(),
                url: event.url.clone(),
                state: "open",
                opened_at: if event.timestamp.is_empty() {
                    rfc3339(at)
                } else {
                    event.timestamp.clone()
                },
                opened: at,
                incoming: Direction::default(),
                outgoing: Direction::default(),
                sampling: None,
                tab_id: event.tab_id,
            },
        );
        self.order.push_back(event.id.clone());
    }

    fn close(&mut self, event: &WebSocketEvent, at: DateTime<Utc>) {
        let Some(conn) = self.connections.remove(&event.id) else {
            return;
        };
        self.order.retain(|id| id != &event.id);
        self.closed.push_back(ClosedConnection {
            id: conn.id,
            url: conn.url,
            state: "closed".to_string(),
            opened_at: conn.opened_at,
            closed_at: if event.timestamp.is_empty() {
                rfc3339(at)
            } else {
                event.timestamp.clone()
            },
            close_code: event.close_code,
            close_reason: event.close_reason.clone(),
            total_messages: conn.incoming.total + conn.outgoing.total,
        });
        while self.closed.len() > MAX_CLOSED_CONNECTIONS {
            self.closed.pop_front();
        }
    }

    pub fn active_count(&self) -> usize {
        self.connections.len()
    }

    /// Forgets live connections (new extension session). Closed history stays.
    pub fn reset_active(&mut self) {
        self.connections.clear();
        self.order.clear();
    }

    pub fn clear(&mut self) {
        self.reset_active();
        self.closed.clear();
    }

    pub fn status(
        &self,
        url_filter: Option<&str>,
        connection_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> WebSocketStatus {
        let keep = |id: &str, url: &str| {
            url_filter.is_none_or(|f| url.contains(f)) && connection_id.is_none_or(|c| c == id)
        };
        let connections: Vec<WebSocketConnection> = self
            .order
            .iter()
            .filter_map(|id| self.connections.get(id))
            .filter(|conn| keep(&conn.id, &conn.url))
            .map(|conn| WebSocketConnection {
                id: conn.id.clone(),
                url: conn.url.clone(),
                state: conn.state.to_string(),
                opened_at: conn.opened_at.clone(),
                duration_ms: (now - conn.opened).num_milliseconds().max(0),
                incoming: conn.incoming.stats(now),
                outgoing: conn.outgoing.stats(now),
                sampling: conn.sampling.clone(),
                tab_id: conn.tab_id,
            })
            .collect();
        let closed = self
            .closed
            .iter()
            .filter(|c| keep(&c.id, &c.url))
            .cloned()
            .collect();
        WebSocketStatus {
            active_count: connections.len(),
            connections,
            closed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(kind: WsEventKind, id: &str, direction: Option<WsDirection>, data: Option<&str>) -> WebSocketEvent {
        WebSocketEvent {
            timestamp: String::new(),
            kind: None,
            event: kind,
            id: id.to_string(),
            url: format!("wss://example.com/{id}"),
            direction,
            data: data.map(str::to_string),
            size: None,
            close_code: None,
            close_reason: None,
            sampled: None,
            tab_id: None,
        }
    }

    #[test]
    fn message_stats_accumulate_per_direction() {
        let now = Utc::now();
        let mut tracker = ConnectionTracker::new();
        tracker.track(&event(WsEventKind::Open, "a", None, None), now);
        tracker.track(&event(WsEventKind::Message, "a", Some(WsDirection::Incoming), Some("hello")), now);
        tracker.track(&event(WsEventKind::Message, "a", Some(WsDirection::Incoming), Some("hi")), now);
        tracker.track(&event(WsEventKind::Message, "a", Some(WsDirection::Outgoing), Some("x")), now);

        let status = tracker.status(None, None, now);
        assert_eq!(status.active_count, 1);
        let conn = &status.connections[0];
        assert_eq!(conn.incoming.total, 2);
        assert_eq!(conn.incoming.bytes, 7);
        assert_eq!(conn.outgoing.total, 1);
        assert!(conn.incoming.per_second > 0.0);

        tracker.track(&event(WsEventKind::Close, "a", None, None), now);
        let status = tracker.status(None, None, now);
        assert_eq!(status.active_count, 0);
        assert_eq!(status.closed[0].total_messages, 3);
    }

    #[test]
    fn active_connections_are_lru_capped() {
        let now = Utc::now();
        let mut tracker = ConnectionTracker::new();
        for i in 0..(MAX_ACTIVE_CONNECTIONS + 3) {
            tracker.track(&event(WsEventKind::Open, &format!("c{i}"), None, None), now);
        }
        assert_eq!(tracker.active_count(), MAX_ACTIVE_CONNECTIONS);
        let status = tracker.status(Some("/c0"), None, now);
        assert!(status.connections.is_empty());
        assert_eq!(tracker.status(None, Some("c22"), now).connections.len(), 1);
    }

    #[test]
    fn closed_ring_keeps_last_ten() {
        let now = Utc::now();
        let mut tracker = ConnectionTracker::new();
        for i in 0..15 {
            let id = format!("c{i}");
            tracker.track(&event(WsEventKind::Open, &id, None, None), now);
            tracker.track(&event(WsEventKind::Close, &id, None, None), now);
        }
        let status = tracker.status(None, None, now);
        assert_eq!(status.closed.len(), MAX_CLOSED_CONNECTIONS);
        assert_eq!(status.closed[0].id, "c5");
    }
}
