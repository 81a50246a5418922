//! Exit controller: a ~0.5s poll loop evaluating every open position through
//! seven ordered checks, plus the two poll-confirmed-fill exit algorithms.

use crate::binance::gateway::{ExchangeGateway, OrderSide};
use crate::config::ScalperConfig;
use crate::position::{OrderLifecycleTracker, Position, PositionStore, Side};
use crate::precision::SymbolPrecisionRegistry;
use crate::risk::RiskManager;
use crate::sink::{AlertLevel, LifecycleEvent, LifecycleSink};
use chrono::Utc;
use rust_decimal::Decimal;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

const ORDER_POLL_INTERVAL: Duration = Duration::from_millis(500);
const ORDER_POLL_TIMEOUT: Duration = Duration::from_secs(8);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    StopLoss,
    Trailing,
    TakeProfit,
    TimeExit,
}

impl ExitReason {
    fn as_str(&self) -> &'static str {
        match self {
            ExitReason::StopLoss => "SL",
            ExitReason::Trailing => "TRAILING",
            ExitReason::TakeProfit => "TP",
            ExitReason::TimeExit => "TIME_EXIT",
        }
    }
}

pub struct ExitController<'a> {
    pub gateway: &'a ExchangeGateway,
    pub precision: &'a SymbolPrecisionRegistry,
    pub store: &'a PositionStore,
    pub tracker: &'a OrderLifecycleTracker,
    pub risk: &'a Mutex<RiskManager>,
    pub sink: &'a LifecycleSink,
    pub scalper_config: &'a ScalperConfig,
    pub dry_run: bool,
}

impl<'a> ExitController<'a> {
    /// One pass over all open positions, evaluating the seven-step order for
    /// each against its latest price.
    pub async fn evaluate_all(&self) {
        for pos in self.store.all() {
            let Ok(Some(price)) = self.gateway.latest_price(&pos.symbol).await else { continue };
            self.evaluate_one(&pos, price).await;
        }
    }

    async fn evaluate_one(&self, pos: &Position, price: Decimal) {
        // Step 1: sanity gate.
        if !self.store.is_sane(pos) {
            if pos.entry_price <= Decimal::ZERO {
                self.store.update(&pos.symbol, pos.side, |p| {
                    p.binance_missing_since.get_or_insert(Utc::now());
                });
            }
            return;
        }

        // Step 2: stop loss.
        let sl_hit = match pos.side {
            Side::Long => price <= pos.stop_loss,
            Side::Short => price >= pos.stop_loss,
        };
        if !pos.trail_active && sl_hit {
            self.full_exit(pos, price, ExitReason::StopLoss).await;
            return;
        }

        // Step 3: partial TP (TP1).
        if !pos.partial_tp_done {
            if let Some(partial_price) = pos.partial_tp_price {
                let reached = match pos.side {
                    Side::Long => price >= partial_price,
                    Side::Short => price <= partial_price,
                };
                if reached {
                    self.handle_tp1(pos, price).await;
                    return;
                }
            }
        }

        // Step 4: trail activation.
        if pos.awaiting_trail_activation {
            if let Some(partial_price) = pos.partial_tp_price {
                let buffer = partial_price.abs() * Decimal::try_from(self.scalper_config.trail_activation_buffer_pct).unwrap_or(Decimal::new(2, 3));
                let crossed = match pos.side {
                    Side::Long => price >= partial_price + buffer,
                    Side::Short => price <= partial_price - buffer,
                };
                if crossed {
                    self.store.update(&pos.symbol, pos.side, |p| {
                        p.trail_active = true;
                        p.stop_loss = partial_price;
                        p.awaiting_trail_activation = false;
                    });
                    return;
                }
            }
        }

        // Step 5: trailing exit.
        if pos.trail_active {
            self.store.set_peak(&pos.symbol, pos.side, price);
            if let Some(updated) = self.store.get(&pos.symbol, pos.side) {
                let trailing_sl = self.compute_trailing_stop(&updated);
                self.store.update(&pos.symbol, pos.side, |p| p.trailing_sl = Some(trailing_sl));
                let adverse = match updated.side {
                    Side::Long => price <= trailing_sl,
                    Side::Short => price >= trailing_sl,
                };
                if adverse {
                    self.full_exit(&updated, price, ExitReason::Trailing).await;
                    return;
                }
            }
        }

        // Step 6: final TP.
        let tp_hit = match pos.side {
            Side::Long => price >= pos.take_profit,
            Side::Short => price <= pos.take_profit,
        };
        if tp_hit {
            self.full_exit(pos, price, ExitReason::TakeProfit).await;
            return;
        }

        // Step 7: time exit.
        if let Some(exit_time) = pos.exit_time {
            if Utc::now() >= exit_time {
                self.full_exit(pos, price, ExitReason::TimeExit).await;
            }
        }
    }

    fn compute_trailing_stop(&self, pos: &Position) -> Decimal {
        let distance = pos.peak_price.abs() * Decimal::try_from(self.scalper_config.trail_distance_pct).unwrap_or(Decimal::new(5, 3));
        match pos.side {
            Side::Long => pos.peak_price - distance,
            Side::Short => pos.peak_price + distance,
        }
    }

    /// Exit side for a reduce-only order against this position.
    fn exit_side(side: Side) -> OrderSide {
        match side {
            Side::Long => OrderSide::Sell,
            Side::Short => OrderSide::Buy,
        }
    }

    pub async fn full_exit(&self, pos: &Position, price: Decimal, reason: ExitReason) {
        if self.dry_run {
            self.finalize_exit(pos, price, pos.size, reason).await;
            return;
        }

        let positions = match self.gateway.positions(Some(&pos.symbol)).await {
            Ok(p) => p,
            Err(e) => {
                warn!(symbol = %pos.symbol, "exit: failed to query positions before full_exit: {}", e);
                Vec::new()
            }
        };
        let live = positions.iter().any(|p| !p.position_amt.is_zero());
        if !live {
            warn!(symbol = %pos.symbol, "exit: Binance reports no live position, preserving local state for reconciliation");
            self.store.update(&pos.symbol, pos.side, |p| {
                p.binance_missing_since.get_or_insert(Utc::now());
            });
            return;
        }

        if !self.tracker.mark_exit_pending(&pos.symbol, pos.side) {
            info!(symbol = %pos.symbol, "exit: another actor already owns this exit");
            return;
        }

        let qty = self.precision.floor_qty(&pos.symbol, pos.size);
        let hedge = self.gateway.position_mode().await.map(|m| m.hedge_mode).unwrap_or(false);
        let position_side = hedge.then(|| match pos.side {
            Side::Long => "LONG",
            Side::Short => "SHORT",
        });

        let ack = match self.gateway.place_market(&pos.symbol, Self::exit_side(pos.side), qty, position_side, !hedge).await {
            Ok(a) => a,
            Err(e) => {
                warn!(symbol = %pos.symbol, "exit: failed to submit market exit: {}", e);
                self.tracker.clear(&pos.symbol, pos.side);
                return;
            }
        };

        let executed = self.poll_fill(&pos.symbol, ack.order_id, ack.executed_qty).await;
        if executed <= Decimal::ZERO {
            warn!(symbol = %pos.symbol, "exit: no fill confirmed within poll timeout, manual reconciliation required");
            let _ = self.gateway.cancel_order(&pos.symbol, ack.order_id).await;
            self.store.update(&pos.symbol, pos.side, |p| {
                p.last_order_refs.last_attempted_order_id = Some(ack.order_id);
                p.last_order_refs.last_stop_order_status = Some("exit timed out unconfirmed, cancel requested".to_string());
            });
            self.sink.alert(AlertLevel::Critical, &format!("exit-timeout:{}", pos.symbol), &format!("{} exit order {} unconfirmed after poll timeout, manual reconciliation required", pos.symbol, ack.order_id)).await;
            self.tracker.clear(&pos.symbol, pos.side);
            return;
        }

        self.finalize_exit(pos, price, executed, reason).await;
    }

    async fn finalize_exit(&self, pos: &Position, price: Decimal, qty: Decimal, reason: ExitReason) {
        let pnl = match pos.side {
            Side::Long => (price - pos.entry_price) * qty,
            Side::Short => (pos.entry_price - price) * qty,
        };
        self.store.close(&pos.symbol, pos.side);
        self.tracker.clear(&pos.symbol, pos.side);
        self.sink.record_lifecycle_event(LifecycleEvent {
            ts: Utc::now(),
            symbol: pos.symbol.clone(),
            side: pos.side.to_string(),
            event_type: "EXIT".to_string(),
            price,
            qty,
            entry_price: pos.entry_price,
            pnl,
            sl: pos.stop_loss,
            tp: pos.take_profit,
            reason: reason.as_str().to_string(),
            source: pos.source.clone(),
        });
        {
            let mut risk = self.risk.lock().expect("risk manager lock poisoned");
            risk.record_close(&pos.symbol, pnl, reason, pos.tp1_triggered);
            self.sink.snapshot_equity("exit", risk.balance());
        }
        self.sink
            .alert(AlertLevel::Info, &format!("exit:{}:{}", pos.symbol, reason.as_str()), &format!("{} {} exited at {} ({}), pnl={}", pos.symbol, pos.side, price, reason.as_str(), pnl))
            .await;
    }

    pub async fn handle_tp1(&self, pos: &Position, price: Decimal) {
        let Some(target_size) = pos.partial_tp_size else { return };

        if self.dry_run {
            self.apply_tp1(pos, target_size).await;
            return;
        }

        let qty_to_close = self.precision.floor_qty(&pos.symbol, target_size);
        if qty_to_close <= Decimal::ZERO {
            let positions = self.gateway.positions(Some(&pos.symbol)).await.unwrap_or_default();
            if positions.iter().any(|p| !p.position_amt.is_zero()) {
                self.full_exit(pos, price, ExitReason::TakeProfit).await;
            } else {
                self.store.update(&pos.symbol, pos.side, |p| {
                    p.binance_missing_since.get_or_insert(Utc::now());
                });
            }
            return;
        }

        let hedge = self.gateway.position_mode().await.map(|m| m.hedge_mode).unwrap_or(false);
        let position_side = hedge.then(|| match pos.side {
            Side::Long => "LONG",
            Side::Short => "SHORT",
        });
        let ack = match self.gateway.place_market(&pos.symbol, Self::exit_side(pos.side), qty_to_close, position_side, !hedge).await {
            Ok(a) => a,
            Err(e) => {
                warn!(symbol = %pos.symbol, "exit: handle_tp1 order submission failed: {}", e);
                return;
            }
        };

        let executed = self.poll_fill(&pos.symbol, ack.order_id, ack.executed_qty).await;
        if executed <= Decimal::ZERO {
            warn!(symbol = %pos.symbol, "exit: handle_tp1 unconfirmed after poll timeout");
            let _ = self.gateway.cancel_order(&pos.symbol, ack.order_id).await;
            self.store.update(&pos.symbol, pos.side, |p| {
                p.last_order_refs.last_attempted_order_id = Some(ack.order_id);
                p.last_order_refs.last_stop_order_status = Some("TP1 partial close timed out unconfirmed, cancel requested".to_string());
            });
            self.sink.alert(AlertLevel::Critical, &format!("tp1-timeout:{}", pos.symbol), &format!("{} TP1 order unconfirmed, manual reconciliation required", pos.symbol)).await;
            return;
        }

        let residual = pos.size - executed;
        if self.precision.floor_qty(&pos.symbol, residual) <= Decimal::ZERO {
            self.full_exit(pos, price, ExitReason::TakeProfit).await;
            return;
        }

        self.apply_tp1(pos, executed).await;
    }

    async fn apply_tp1(&self, pos: &Position, executed: Decimal) {
        self.store.update(&pos.symbol, pos.side, |p| {
            p.size -= executed;
            p.partial_tp_done = true;
            p.tp1_triggered = true;
            p.awaiting_trail_activation = true;
            p.stop_loss = p.entry_price;
            p.breakeven = true;
            p.breakeven_set_at = Some(Utc::now());
        });
        let pnl = match pos.side {
            Side::Long => (pos.partial_tp_price.unwrap_or(pos.entry_price) - pos.entry_price) * executed,
            Side::Short => (pos.entry_price - pos.partial_tp_price.unwrap_or(pos.entry_price)) * executed,
        };
        self.sink.record_lifecycle_event(LifecycleEvent {
            ts: Utc::now(),
            symbol: pos.symbol.clone(),
            side: pos.side.to_string(),
            event_type: "TP1_PARTIAL".to_string(),
            price: pos.partial_tp_price.unwrap_or(pos.entry_price),
            qty: executed,
            entry_price: pos.entry_price,
            pnl,
            sl: pos.stop_loss,
            tp: pos.take_profit,
            reason: String::new(),
            source: pos.source.clone(),
        });
        {
            let risk = self.risk.lock().expect("risk manager lock poisoned");
            self.sink.snapshot_equity("tp1", risk.balance());
        }
        self.sink.alert(AlertLevel::Info, &format!("tp1:{}", pos.symbol), &format!("{} TP1 partial close, qty={}", pos.symbol, executed)).await;
    }

    /// Poll order status until it stops changing or the timeout elapses,
    /// accumulating `executedQty`.
    async fn poll_fill(&self, symbol: &str, order_id: i64, initial_executed: Decimal) -> Decimal {
        if order_id == 0 {
            // dry-run ack: fill is synthesized immediately.
            return initial_executed;
        }
        let deadline = Instant::now() + ORDER_POLL_TIMEOUT;
        let mut executed = initial_executed;
        while Instant::now() < deadline {
            match self.gateway.get_order(symbol, order_id).await {
                Ok(ack) => {
                    executed = ack.executed_qty;
                    if ack.status == "FILLED" {
                        return executed;
                    }
                }
                Err(e) => warn!(symbol, order_id, "exit: poll_fill get_order failed: {}", e),
            }
            tokio::time::sleep(ORDER_POLL_INTERVAL).await;
        }
        executed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_reason_labels_are_short_codes() {
        assert_eq!(ExitReason::StopLoss.as_str(), "SL");
        assert_eq!(ExitReason::Trailing.as_str(), "TRAILING");
        assert_eq!(ExitReason::TakeProfit.as_str(), "TP");
        assert_eq!(ExitReason::TimeExit.as_str(), "TIME_EXIT");
    }
}
