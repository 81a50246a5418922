//! Order lifecycle tracker: the single serialization point making "at most
//! one concurrent exit per position" a cheap, race-free guarantee.

use crate::position::types::Side;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    None,
    EntryPending,
    Open,
    ExitPending,
}

#[derive(Debug, Clone)]
struct TrackedOrder {
    state: LifecycleState,
    order_id: Option<i64>,
    ts: DateTime<Utc>,
    source: Option<String>,
}

pub struct OrderLifecycleTracker {
    inner: Mutex<HashMap<String, TrackedOrder>>,
}

impl OrderLifecycleTracker {
    pub fn new() -> Self {
        Self { inner: Mutex::new(HashMap::new()) }
    }

    fn key(symbol: &str, side: Side) -> String {
        format!("{}|{}", symbol.to_uppercase(), side.as_str())
    }

    pub fn track_entry(&self, symbol: &str, side: Side, order_id: i64, source: &str) {
        let mut table = self.inner.lock().expect("tracker lock poisoned");
        table.insert(
            Self::key(symbol, side),
            TrackedOrder { state: LifecycleState::EntryPending, order_id: Some(order_id), ts: Utc::now(), source: Some(source.to_string()) },
        );
    }

    pub fn mark_open(&self, symbol: &str, side: Side) {
        let mut table = self.inner.lock().expect("tracker lock poisoned");
        let entry = table.entry(Self::key(symbol, side)).or_insert(TrackedOrder {
            state: LifecycleState::None,
            order_id: None,
            ts: Utc::now(),
            source: None,
        });
        entry.state = LifecycleState::Open;
        entry.ts = Utc::now();
    }

    /// CAS: succeeds (returns true) only if the current state isn't already
    /// `ExitPending`. A caller that gets `false` must abort — a concurrent
    /// actor already owns this position's exit.
    pub fn mark_exit_pending(&self, symbol: &str, side: Side) -> bool {
        let mut table = self.inner.lock().expect("tracker lock poisoned");
        let key = Self::key(symbol, side);
        let current_state = table.get(&key).map(|t| t.state).unwrap_or(LifecycleState::None);
        if current_state == LifecycleState::ExitPending {
            return false;
        }
        let entry = table.entry(key).or_insert(TrackedOrder {
            state: LifecycleState::None,
            order_id: None,
            ts: Utc::now(),
            source: None,
        });
        entry.state = LifecycleState::ExitPending;
        entry.ts = Utc::now();
        true
    }

    pub fn is_exit_pending(&self, symbol: &str, side: Side) -> bool {
        self.state(symbol, side) == LifecycleState::ExitPending
    }

    pub fn clear(&self, symbol: &str, side: Side) {
        let mut table = self.inner.lock().expect("tracker lock poisoned");
        table.remove(&Self::key(symbol, side));
    }

    pub fn state(&self, symbol: &str, side: Side) -> LifecycleState {
        let table = self.inner.lock().expect("tracker lock poisoned");
        table.get(&Self::key(symbol, side)).map(|t| t.state).unwrap_or(LifecycleState::None)
    }

    pub fn all(&self) -> Vec<(String, LifecycleState)> {
        let table = self.inner.lock().expect("tracker lock poisoned");
        table.iter().map(|(k, v)| (k.clone(), v.state)).collect()
    }
}

impl Default for OrderLifecycleTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_key_starts_as_none() {
        let tracker = OrderLifecycleTracker::new();
        assert_eq!(tracker.state("BTCUSDT", Side::Long), LifecycleState::None);
    }

    #[test]
    fn track_entry_then_mark_open() {
        let tracker = OrderLifecycleTracker::new();
        tracker.track_entry("BTCUSDT", Side::Long, 1, "scalper");
        assert_eq!(tracker.state("BTCUSDT", Side::Long), LifecycleState::EntryPending);
        tracker.mark_open("BTCUSDT", Side::Long);
        assert_eq!(tracker.state("BTCUSDT", Side::Long), LifecycleState::Open);
    }

    #[test]
    fn mark_exit_pending_is_cas() {
        let tracker = OrderLifecycleTracker::new();
        tracker.mark_open("BTCUSDT", Side::Long);
        assert!(tracker.mark_exit_pending("BTCUSDT", Side::Long));
        assert!(!tracker.mark_exit_pending("BTCUSDT", Side::Long));
    }

    #[test]
    fn clear_resets_to_none() {
        let tracker = OrderLifecycleTracker::new();
        tracker.mark_open("BTCUSDT", Side::Long);
        tracker.clear("BTCUSDT", Side::Long);
        assert_eq!(tracker.state("BTCUSDT", Side::Long), LifecycleState::None);
    }
}
