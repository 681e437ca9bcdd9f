// =============================================================================
// Activity Log — bounded ring of typed operator events
// =============================================================================
//
// The dashboard's near-real-time feed. Insertion-ordered, capped at a fixed
// capacity with oldest-first eviction. This is an operator aid, not a record
// of truth: no durability, cleared freely.
// =============================================================================

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// Default ring capacity.
pub const DEFAULT_CAPACITY: usize = 500;

/// What part of the pipeline produced the event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityKind {
    Analysis,
    Signal,
    Order,
    Position,
    Warning,
    Error,
}

impl std::str::FromStr for ActivityKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "analysis" => Ok(Self::Analysis),
            "signal" => Ok(Self::Signal),
            "order" => Ok(Self::Order),
            "position" => Ok(Self::Position),
            "warning" => Ok(Self::Warning),
            "error" => Ok(Self::Error),
            other => Err(format!("unknown activity kind: {other}")),
        }
    }
}

/// Display severity for the dashboard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityLevel {
    Info,
    Success,
    Warning,
    Error,
}

/// A single operator-visible event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Activity {
    pub timestamp: DateTime<Utc>,
    pub kind: ActivityKind,
    pub level: ActivityLevel,
    #[serde(default)]
    pub symbol: Option<String>,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
}

impl Activity {
    pub fn new(kind: ActivityKind, level: ActivityLevel, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            kind,
            level,
            symbol: None,
            message: message.into(),
            payload: None,
        }
    }

    pub fn with_symbol(mut self, symbol: impl Into<String>) -> Self {
        self.symbol = Some(symbol.into());
        self
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn analysis(message: impl Into<String>) -> Self {
        Self::new(ActivityKind::Analysis, ActivityLevel::Info, message)
    }

    pub fn signal(message: impl Into<String>) -> Self {
        Self::new(ActivityKind::Signal, ActivityLevel::Info, message)
    }

    pub fn order(message: impl Into<String>) -> Self {
        Self::new(ActivityKind::Order, ActivityLevel::Success, message)
    }

    pub fn position(message: impl Into<String>) -> Self {
        Self::new(ActivityKind::Position, ActivityLevel::Info, message)
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self::new(ActivityKind::Warning, ActivityLevel::Warning, message)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(ActivityKind::Error, ActivityLevel::Error, message)
    }
}

// =============================================================================
// ActivityLog
// =============================================================================

/// Thread-safe bounded ring of the most recent activities.
///
/// The supervisor and adapters hold this as an `Arc<ActivityLog>` event-sink
/// capability; the HTTP layer reads snapshots.
pub struct ActivityLog {
    ring: RwLock<VecDeque<Activity>>,
    capacity: usize,
}

impl ActivityLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            ring: RwLock::new(VecDeque::with_capacity(capacity.min(DEFAULT_CAPACITY) + 1)),
            capacity: capacity.max(1),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Append an activity, evicting the oldest entries beyond capacity.
    pub fn push(&self, activity: Activity) {
        let mut ring = self.ring.write();
        ring.push_back(activity);
        while ring.len() > self.capacity {
            ring.pop_front();
        }
    }

    /// Newest-first, up to `limit`, optionally filtered by kind.
    pub fn recent(&self, limit: usize, kind: Option<ActivityKind>) -> Vec<Activity> {
        let ring = self.ring.read();
        ring.iter()
            .rev()
            .filter(|a| kind.map_or(true, |k| a.kind == k))
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.ring.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.read().is_empty()
    }

    pub fn clear(&self) {
        self.ring.write().clear();
    }
}

impl Default for ActivityLog {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_is_bounded_and_evicts_oldest() {
        let log = ActivityLog::new(500);
        for i in 0..600 {
            log.push(Activity::analysis(format!("event {i}")));
        }
        assert_eq!(log.len(), 500);

        let all = log.recent(1000, None);
        assert_eq!(all.len(), 500);
        // Newest first.
        assert_eq!(all[0].message, "event 599");
        assert_eq!(all.last().unwrap().message, "event 100");
        // The oldest 100 were evicted.
        assert!(!all.iter().any(|a| a.message == "event 99"));
    }

    #[test]
    fn recent_respects_limit_and_filter() {
        let log = ActivityLog::new(100);
        log.push(Activity::analysis("a"));
        log.push(Activity::warning("w1"));
        log.push(Activity::order("o"));
        log.push(Activity::warning("w2"));

        let warnings = log.recent(10, Some(ActivityKind::Warning));
        assert_eq!(warnings.len(), 2);
        assert_eq!(warnings[0].message, "w2");
        assert_eq!(warnings[1].message, "w1");

        assert_eq!(log.recent(2, None).len(), 2);
    }

    #[test]
    fn clear_empties_the_ring() {
        let log = ActivityLog::new(10);
        log.push(Activity::error("boom"));
        assert!(!log.is_empty());
        log.clear();
        assert!(log.is_empty());
    }

    #[test]
    fn constructors_set_levels() {
        assert_eq!(Activity::warning("x").level, ActivityLevel::Warning);
        assert_eq!(Activity::error("x").level, ActivityLevel::Error);
        assert_eq!(Activity::order("x").level, ActivityLevel::Success);
        assert_eq!(Activity::analysis("x").level, ActivityLevel::Info);
    }

    #[test]
    fn builder_attaches_symbol_and_payload() {
        let a = Activity::signal("buy signal")
            .with_symbol("RELIANCE")
            .with_payload(serde_json::json!({"confidence": 0.8}));
        assert_eq!(a.symbol.as_deref(), Some("RELIANCE"));
        assert!(a.payload.is_some());
    }
}
