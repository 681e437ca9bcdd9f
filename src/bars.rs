// =============================================================================
// Bar Buffer — per-(instrument, timeframe) rolling bar series
// =============================================================================
//
// Owned exclusively by the supervisor (no interior locking): the HTTP layer
// only ever sees copy-on-read snapshots taken by the supervisor itself.
// History polls are merged in, keeping bars strictly time-ordered per key,
// replacing the unclosed tail bar in place and trimming the ring to a
// fixed depth.
// =============================================================================

use std::collections::{HashMap, VecDeque};

use crate::types::{Bar, Timeframe};

/// Identifies one bar series.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq)]
pub struct BarSeriesKey {
    pub instrument_token: u32,
    pub timeframe: Timeframe,
}

impl std::fmt::Display for BarSeriesKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.instrument_token, self.timeframe)
    }
}

pub struct BarBuffer {
    buffers: HashMap<BarSeriesKey, VecDeque<Bar>>,
    max_bars: usize,
}

impl BarBuffer {
    /// Retain at most `max_bars` closed bars per key, plus one in-progress
    /// bar.
    pub fn new(max_bars: usize) -> Self {
        Self {
            buffers: HashMap::new(),
            max_bars: max_bars.max(1),
        }
    }

    /// Merge a freshly fetched (ascending) bar slice into the series.
    ///
    /// Incoming bars older than the newest stored final bar are ignored; a
    /// bar with the same timestamp as the stored tail replaces it (partial
    /// bars firming up into final ones).
    pub fn merge(&mut self, key: BarSeriesKey, incoming: &[Bar]) {
        let ring = self
            .buffers
            .entry(key)
            .or_insert_with(|| VecDeque::with_capacity(self.max_bars + 1));

        for bar in incoming {
            match ring.back() {
                None => ring.push_back(bar.clone()),
                Some(last) if bar.timestamp > last.timestamp => {
                    // A new final bar supersedes any lingering partial tail
                    // from the previous poll.
                    if !last.is_final {
                        ring.pop_back();
                        // The incoming slice normally re-delivers the firmed
                        // tail; if not, the partial is simply dropped.
                        if let Some(newer_last) = ring.back() {
                            if bar.timestamp <= newer_last.timestamp {
                                continue;
                            }
                        }
                    }
                    ring.push_back(bar.clone());
                }
                Some(last) if bar.timestamp == last.timestamp => {
                    // Same interval observed again: replace in place.
                    *ring.back_mut().expect("back exists") = bar.clone();
                }
                Some(_) => {} // older than stored history
            }
        }

        // Trim closed history to the budget, never dropping the live tail.
        while ring.len() > self.max_bars + 1
            || (ring.len() > self.max_bars && ring.back().map_or(false, |b| b.is_final))
        {
            ring.pop_front();
        }
    }

    /// The most recent `count` closed bars, oldest first.
    pub fn closed_bars(&self, key: &BarSeriesKey, count: usize) -> Vec<Bar> {
        match self.buffers.get(key) {
            Some(ring) => {
                let closed: Vec<&Bar> = ring.iter().filter(|b| b.is_final).collect();
                let start = closed.len().saturating_sub(count);
                closed[start..].iter().map(|b| (*b).clone()).collect()
            }
            None => Vec::new(),
        }
    }

    pub fn last_bar(&self, key: &BarSeriesKey) -> Option<&Bar> {
        self.buffers.get(key).and_then(|ring| ring.back())
    }

    pub fn closed_len(&self, key: &BarSeriesKey) -> usize {
        self.buffers
            .get(key)
            .map_or(0, |ring| ring.iter().filter(|b| b.is_final).count())
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Duration, TimeZone, Utc};

    fn key() -> BarSeriesKey {
        BarSeriesKey {
            instrument_token: 1,
            timeframe: Timeframe::M5,
        }
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 9, 15, 0).unwrap()
    }

    fn bar(index: i64, close: f64, is_final: bool) -> Bar {
        Bar {
            open: close,
            high: close + 1.0,
            low: close - 1.0,
            close,
            volume: 100,
            timestamp: t0() + Duration::minutes(5 * index),
            is_final,
        }
    }

    #[test]
    fn merge_keeps_strict_order() {
        let mut buffer = BarBuffer::new(100);
        buffer.merge(key(), &[bar(0, 100.0, true), bar(1, 101.0, true)]);
        buffer.merge(key(), &[bar(1, 101.0, true), bar(2, 102.0, true)]);

        let bars = buffer.closed_bars(&key(), 10);
        assert_eq!(bars.len(), 3);
        for pair in bars.windows(2) {
            assert!(pair[0].timestamp < pair[1].timestamp);
        }
    }

    #[test]
    fn partial_tail_firms_up_in_place() {
        let mut buffer = BarBuffer::new(100);
        buffer.merge(key(), &[bar(0, 100.0, true), bar(1, 101.0, false)]);
        assert_eq!(buffer.closed_len(&key()), 1);

        // Next poll re-delivers bar 1 as final plus a new partial bar 2.
        buffer.merge(key(), &[bar(1, 101.5, true), bar(2, 102.0, false)]);
        let bars = buffer.closed_bars(&key(), 10);
        assert_eq!(bars.len(), 2);
        assert!((bars[1].close - 101.5).abs() < 1e-12);
        assert!(!buffer.last_bar(&key()).unwrap().is_final);
    }

    #[test]
    fn stale_bars_are_ignored() {
        let mut buffer = BarBuffer::new(100);
        buffer.merge(key(), &[bar(5, 105.0, true)]);
        buffer.merge(key(), &[bar(3, 103.0, true)]);
        assert_eq!(buffer.closed_len(&key()), 1);
        assert_eq!(buffer.closed_bars(&key(), 10)[0].close, 105.0);
    }

    #[test]
    fn ring_is_trimmed_to_budget() {
        let mut buffer = BarBuffer::new(10);
        let bars: Vec<Bar> = (0..25).map(|i| bar(i, 100.0 + i as f64, true)).collect();
        buffer.merge(key(), &bars);

        assert_eq!(buffer.closed_len(&key()), 10);
        let kept = buffer.closed_bars(&key(), 100);
        // Oldest bars evicted, newest kept.
        assert!((kept[0].close - 115.0).abs() < 1e-12);
        assert!((kept[9].close - 124.0).abs() < 1e-12);
    }

    #[test]
    fn closed_bars_excludes_live_tail() {
        let mut buffer = BarBuffer::new(100);
        buffer.merge(
            key(),
            &[bar(0, 100.0, true), bar(1, 101.0, true), bar(2, 102.0, false)],
        );
        let closed = buffer.closed_bars(&key(), 10);
        assert_eq!(closed.len(), 2);
        assert!(closed.iter().all(|b| b.is_final));
    }

    #[test]
    fn series_are_independent_per_key() {
        let other = BarSeriesKey {
            instrument_token: 2,
            timeframe: Timeframe::M5,
        };
        let mut buffer = BarBuffer::new(100);
        buffer.merge(key(), &[bar(0, 100.0, true)]);
        assert_eq!(buffer.closed_len(&key()), 1);
        assert_eq!(buffer.closed_len(&other), 0);
    }
}
