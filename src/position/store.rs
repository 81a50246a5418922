//! In-memory position table with JSON snapshot persistence.
//!
//! A single lock serializes every mutation, invariants are checked on every
//! write, and a record that fails sanity is diverted to a
//! `_synced_incomplete` namespace instead of being silently dropped.

use crate::position::types::{Position, Side};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, warn};

/// Suffix applied to the position key when a record fails sanity checks but
/// is kept around for operator inspection rather than discarded.
const SYNCED_INCOMPLETE_SUFFIX: &str = "_synced_incomplete";

pub struct PositionStore {
    inner: Mutex<HashMap<String, Position>>,
    snapshot_path: PathBuf,
    min_sl_distance_pct: Decimal,
}

impl PositionStore {
    pub fn new(snapshot_path: impl Into<PathBuf>, min_sl_distance_pct: Decimal) -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
            snapshot_path: snapshot_path.into(),
            min_sl_distance_pct,
        }
    }

    /// Load the snapshot file if it exists, re-applying sanity checks and
    /// diverting unsane records the same way a live mutation would.
    pub fn load(snapshot_path: impl Into<PathBuf>, min_sl_distance_pct: Decimal) -> std::io::Result<Self> {
        let path = snapshot_path.into();
        let store = Self {
            inner: Mutex::new(HashMap::new()),
            snapshot_path: path.clone(),
            min_sl_distance_pct,
        };
        if !path.exists() {
            return Ok(store);
        }
        let content = std::fs::read_to_string(&path)?;
        let raw: HashMap<String, Position> = serde_json::from_str(&content).unwrap_or_default();
        let mut table = store.inner.lock().expect("position store lock poisoned");
        for (key, pos) in raw {
            if store.is_sane(&pos) {
                table.insert(key, pos);
            } else {
                warn!(key, "position store: dropped-sanity record diverted to synced_incomplete on load");
                table.insert(format!("{}{}", key, SYNCED_INCOMPLETE_SUFFIX), pos);
            }
        }
        drop(table);
        Ok(store)
    }

    fn persist(&self, table: &HashMap<String, Position>) {
        let json = match serde_json::to_string_pretty(table) {
            Ok(j) => j,
            Err(e) => {
                warn!("position store: failed to serialize snapshot: {}", e);
                return;
            }
        };
        if let Some(parent) = self.snapshot_path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let tmp_path = tmp_path_for(&self.snapshot_path);
        if let Err(e) = std::fs::write(&tmp_path, json) {
            warn!("position store: failed to write snapshot tmp file: {}", e);
            return;
        }
        if let Err(e) = std::fs::rename(&tmp_path, &self.snapshot_path) {
            warn!("position store: failed to atomically rename snapshot: {}", e);
        }
    }

    /// §3 invariants: correct SL/TP directionality and a stop loss at least
    /// `min_sl_distance_pct` away from entry, with a breakeven tolerance
    /// exception when TP1/trail/breakeven flags permit it.
    pub fn is_sane(&self, pos: &Position) -> bool {
        if pos.entry_price <= Decimal::ZERO || pos.size <= Decimal::ZERO {
            return false;
        }
        let eps = (pos.entry_price.abs() * Decimal::new(1, 8)).max(Decimal::new(1, 12));
        let allow_breakeven = pos.breakeven_allowed();
        let at_breakeven = allow_breakeven && (pos.stop_loss - pos.entry_price).abs() <= eps;
        let min_distance = pos.entry_price.abs() * self.min_sl_distance_pct;
        let distance_ok = (pos.entry_price - pos.stop_loss).abs() >= min_distance || at_breakeven;
        match pos.side {
            Side::Long => {
                let sl_ok = (pos.stop_loss < pos.entry_price || at_breakeven) && distance_ok;
                sl_ok && pos.entry_price < pos.take_profit
            }
            Side::Short => {
                let sl_ok = (pos.stop_loss > pos.entry_price || at_breakeven) && distance_ok;
                sl_ok && pos.entry_price > pos.take_profit
            }
        }
    }

    pub fn get(&self, symbol: &str, side: Side) -> Option<Position> {
        let table = self.inner.lock().expect("position store lock poisoned");
        table.get(&Position::key(symbol, side)).cloned()
    }

    pub fn exists(&self, symbol: &str, side: Side) -> bool {
        self.get(symbol, side).is_some()
    }

    pub fn all(&self) -> Vec<Position> {
        let table = self.inner.lock().expect("position store lock poisoned");
        table.values().cloned().collect()
    }

    /// Insert a new position. Auto-widens the stop loss if it's closer to
    /// entry than the larger of the two configured minimum distances.
    pub fn add(&self, mut pos: Position, min_sl_distance_pct: Decimal, fallback_sl_pct: Decimal) {
        let min_distance = pos.entry_price.abs() * min_sl_distance_pct.max(fallback_sl_pct);
        let risk = (pos.entry_price - pos.stop_loss).abs();
        if risk < min_distance {
            let widened = pos.entry_price.abs() * fallback_sl_pct;
            pos.stop_loss = match pos.side {
                Side::Long => pos.entry_price - widened,
                Side::Short => pos.entry_price + widened,
            };
            warn!(symbol = %pos.symbol, "position store: stop loss too close to entry, auto-widened to {}", pos.stop_loss);
        }

        let key = pos.position_key();
        let sane = self.is_sane(&pos);
        let mut table = self.inner.lock().expect("position store lock poisoned");
        if sane {
            table.insert(key, pos);
        } else {
            warn!(key, "position store: add() produced an unsane record, diverting");
            table.insert(format!("{}{}", key, SYNCED_INCOMPLETE_SUFFIX), pos);
        }
        self.persist(&table);
    }

    /// Apply `patch` to an existing record, or create one if both
    /// `entry_price` and `size` in the patch resolve to positive values.
    pub fn update(&self, symbol: &str, side: Side, patch: impl FnOnce(&mut Position)) {
        let key = Position::key(symbol, side);
        let mut table = self.inner.lock().expect("position store lock poisoned");
        if let Some(existing) = table.get_mut(&key) {
            patch(existing);
            if !self.is_sane(existing) {
                let bad = table.remove(&key).unwrap();
                warn!(key, "position store: update() produced an unsane record, diverting");
                table.insert(format!("{}{}", key, SYNCED_INCOMPLETE_SUFFIX), bad);
            }
            self.persist(&table);
        } else {
            debug!(key, "position store: update() on missing key is a no-op (only add() creates records)");
        }
    }

    /// Monotone update: the new price only replaces the stored peak when it
    /// represents further favorable excursion.
    pub fn set_peak(&self, symbol: &str, side: Side, price: Decimal) {
        self.update(symbol, side, |pos| {
            let improves = match pos.side {
                Side::Long => price > pos.peak_price,
                Side::Short => price < pos.peak_price,
            };
            if improves {
                pos.peak_price = price;
            }
        });
    }

    /// Remove the record. Returns the removed position (if any) so the
    /// caller can best-effort cancel its attached orders.
    pub fn close(&self, symbol: &str, side: Side) -> Option<Position> {
        let key = Position::key(symbol, side);
        let mut table = self.inner.lock().expect("position store lock poisoned");
        let removed = table.remove(&key);
        if removed.is_some() {
            debug!(key, "position store: close()");
            self.persist(&table);
        }
        removed
    }
}

fn tmp_path_for(path: &Path) -> PathBuf {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    PathBuf::from(tmp)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn sample_long(entry: Decimal, sl: Decimal, tp: Decimal) -> Position {
        Position {
            symbol: "BTCUSDT".into(),
            side: Side::Long,
            entry_price: entry,
            size: dec!(1),
            original_size: dec!(1),
            stop_loss: sl,
            take_profit: tp,
            peak_price: entry,
            partial_tp_price: None,
            partial_tp_size: None,
            partial_tp_done: false,
            tp1_triggered: false,
            awaiting_trail_activation: false,
            trail_active: false,
            trailing_sl: None,
            breakeven: false,
            breakeven_set_at: None,
            binance_missing_since: None,
            source: "scalper".into(),
            label: None,
            confidence: dec!(1.0),
            entry_time: chrono::Utc::now(),
            exit_time: None,
            entry_price_estimated: false,
            last_order_refs: Default::default(),
        }
    }

    fn temp_store() -> PositionStore {
        temp_store_with_min_distance(dec!(0.0001))
    }

    fn temp_store_with_min_distance(min_sl_distance_pct: Decimal) -> PositionStore {
        let dir = std::env::temp_dir().join(format!("posengine-test-{}", std::process::id()));
        let _ = std::fs::create_dir_all(&dir);
        PositionStore::new(dir.join(format!("snap-{:?}-{:?}.json", std::thread::current().id(), min_sl_distance_pct)), min_sl_distance_pct)
    }

    #[test]
    fn add_auto_widens_tight_stop_loss() {
        let store = temp_store();
        let pos = sample_long(dec!(100), dec!(99.99), dec!(110));
        store.add(pos, dec!(0.01), dec!(0.02));
        let stored = store.get("BTCUSDT", Side::Long).unwrap();
        assert!(stored.stop_loss < dec!(99));
    }

    #[test]
    fn update_on_missing_key_is_noop() {
        let store = temp_store();
        store.update("ETHUSDT", Side::Long, |p| p.size = dec!(5));
        assert!(store.get("ETHUSDT", Side::Long).is_none());
    }

    #[test]
    fn set_peak_is_monotone_for_longs() {
        let store = temp_store();
        store.add(sample_long(dec!(100), dec!(95), dec!(110)), dec!(0.0001), dec!(0.0001));
        store.set_peak("BTCUSDT", Side::Long, dec!(105));
        store.set_peak("BTCUSDT", Side::Long, dec!(102));
        assert_eq!(store.get("BTCUSDT", Side::Long).unwrap().peak_price, dec!(105));
    }

    #[test]
    fn unsane_update_diverts_record_out_of_normal_key() {
        let store = temp_store();
        store.add(sample_long(dec!(100), dec!(95), dec!(110)), dec!(0.0001), dec!(0.0001));
        store.update("BTCUSDT", Side::Long, |p| p.stop_loss = dec!(500));
        assert!(store.get("BTCUSDT", Side::Long).is_none());
    }

    #[test]
    fn update_moving_sl_too_close_to_entry_is_diverted() {
        // 1% minimum distance; moving SL to within 0.1% of entry is
        // directionally correct but violates the minimum-distance invariant.
        let store = temp_store_with_min_distance(dec!(0.01));
        store.add(sample_long(dec!(100), dec!(95), dec!(110)), dec!(0.01), dec!(0.02));
        store.update("BTCUSDT", Side::Long, |p| p.stop_loss = dec!(99.9));
        assert!(store.get("BTCUSDT", Side::Long).is_none());
    }

    #[test]
    fn breakeven_exception_permits_sl_at_entry_once_tp1_triggered() {
        let store = temp_store_with_min_distance(dec!(0.01));
        store.add(sample_long(dec!(100), dec!(95), dec!(110)), dec!(0.01), dec!(0.02));
        store.update("BTCUSDT", Side::Long, |p| {
            p.tp1_triggered = true;
            p.stop_loss = p.entry_price;
        });
        assert_eq!(store.get("BTCUSDT", Side::Long).unwrap().stop_loss, dec!(100));
    }

    #[test]
    fn close_removes_and_returns_record() {
        let store = temp_store();
        store.add(sample_long(dec!(100), dec!(95), dec!(110)), dec!(0.0001), dec!(0.0001));
        let removed = store.close("BTCUSDT", Side::Long);
        assert!(removed.is_some());
        assert!(store.get("BTCUSDT", Side::Long).is_none());
    }
}
