//! Reconciliation loop: keeps the local position table consistent with what
//! the exchange actually holds.
//!
//! Exchange positions with no local record are synthesized (diverted to
//! `_synced_incomplete` when the fill price can't be trusted); local records
//! with no matching exchange position are given a grace window before being
//! dropped, since a position can vanish from one positions-risk response
//! right as an order fills.

use crate::binance::gateway::{BinancePosition, ExchangeGateway};
use crate::config::WatchdogConfig;
use crate::position::{OrderRefs, Position, PositionStore, Side};
use chrono::Utc;
use rust_decimal::Decimal;
use tracing::{info, warn};

pub struct Reconciler<'a> {
    pub gateway: &'a ExchangeGateway,
    pub store: &'a PositionStore,
    pub watchdog_config: &'a WatchdogConfig,
}

impl<'a> Reconciler<'a> {
    pub async fn run_once(&self) {
        let exchange_positions = match self.gateway.positions(None).await {
            Ok(p) => p,
            Err(e) => {
                warn!("reconcile: failed to fetch exchange positions: {}", e);
                return;
            }
        };
        let live: Vec<&BinancePosition> = exchange_positions.iter().filter(|p| !p.position_amt.is_zero()).collect();

        self.adopt_unmatched(&live);
        self.age_out_missing(&live);
    }

    /// Synthesize a local record for any non-zero exchange position this
    /// process doesn't already track.
    fn adopt_unmatched(&self, live: &[&BinancePosition]) {
        for p in live {
            let side = if p.position_amt > Decimal::ZERO { Side::Long } else { Side::Short };
            if self.store.exists(&p.symbol, side) {
                self.store.update(&p.symbol, side, |pos| pos.binance_missing_since = None);
                continue;
            }

            warn!(symbol = %p.symbol, ?side, "reconcile: adopting untracked exchange position");
            let qty = p.position_amt.abs();
            let synthesized = Position {
                symbol: p.symbol.clone(),
                side,
                entry_price: p.entry_price,
                size: qty,
                original_size: qty,
                stop_loss: fallback_stop(side, p.entry_price),
                take_profit: fallback_target(side, p.entry_price),
                peak_price: p.entry_price,
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
                source: "reconcile".to_string(),
                label: None,
                confidence: Decimal::ZERO,
                entry_time: Utc::now(),
                exit_time: None,
                entry_price_estimated: p.entry_price <= Decimal::ZERO,
                last_order_refs: OrderRefs::default(),
            };
            self.store.add(synthesized, Decimal::new(5, 4), Decimal::new(3, 3));
        }
    }

    /// Age out local records whose exchange position has disappeared for
    /// longer than the configured grace window.
    fn age_out_missing(&self, live: &[&BinancePosition]) {
        let grace = chrono::Duration::seconds(self.watchdog_config.grace_seconds());
        for pos in self.store.all() {
            let still_live = live.iter().any(|p| {
                p.symbol.eq_ignore_ascii_case(&pos.symbol) && (p.position_amt > Decimal::ZERO) == (pos.side == Side::Long)
            });
            if still_live {
                continue;
            }

            match pos.binance_missing_since {
                None => {
                    self.store.update(&pos.symbol, pos.side, |p| p.binance_missing_since = Some(Utc::now()));
                }
                Some(since) if Utc::now() - since >= grace => {
                    warn!(symbol = %pos.symbol, side = ?pos.side, "reconcile: local position missing from exchange past grace window, dropping");
                    self.store.close(&pos.symbol, pos.side);
                }
                Some(_) => {
                    info!(symbol = %pos.symbol, side = ?pos.side, "reconcile: local position still within grace window");
                }
            }
        }
    }
}

fn fallback_stop(side: Side, entry: Decimal) -> Decimal {
    let widened = entry.abs() * Decimal::new(3, 3);
    match side {
        Side::Long => entry - widened,
        Side::Short => entry + widened,
    }
}

fn fallback_target(side: Side, entry: Decimal) -> Decimal {
    let widened = entry.abs() * Decimal::new(6, 3);
    match side {
        Side::Long => entry + widened,
        Side::Short => entry - widened,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn fallback_geometry_brackets_entry_for_long_and_short() {
        let entry = dec!(100);
        assert!(fallback_stop(Side::Long, entry) < entry);
        assert!(fallback_target(Side::Long, entry) > entry);
        assert!(fallback_stop(Side::Short, entry) > entry);
        assert!(fallback_target(Side::Short, entry) < entry);
    }
}
