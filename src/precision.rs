//! Symbol precision registry: normalizes prices and quantities to exchange
//! step/tick/notional boundaries using decimal arithmetic only.
//!
//! Ported from the floor-then-escalate algorithm in the original Python
//! `get_trimmed_quantity`: floor to the step size, and if flooring a
//! positive request yields zero, escalate to the smallest step multiple
//! that clears `minNotional` at the current price.

use crate::binance::exchange_info::{ExchangeInfoManager, SymbolInfo};
use rust_decimal::Decimal;
use std::collections::HashMap;
use tracing::warn;

const DEFAULT_STEP: Decimal = Decimal::from_parts(1, 0, 0, false, 8); // 0.00000001

#[derive(Debug, Clone)]
struct DefaultPrecision {
    tick_size: Decimal,
    step_size: Decimal,
    min_qty: Decimal,
    min_notional: Decimal,
}

impl Default for DefaultPrecision {
    fn default() -> Self {
        Self {
            tick_size: DEFAULT_STEP,
            step_size: DEFAULT_STEP,
            min_qty: DEFAULT_STEP,
            min_notional: Decimal::ZERO,
        }
    }
}

/// Pure decimal rounding over a (possibly stale or missing) table of
/// exchange filters. Never panics and never raises to the caller: a missing
/// symbol falls back to an 8-decimal floor and logs once.
pub struct SymbolPrecisionRegistry {
    table: HashMap<String, SymbolInfo>,
    fallback: DefaultPrecision,
}

impl SymbolPrecisionRegistry {
    pub fn new() -> Self {
        Self {
            table: HashMap::new(),
            fallback: DefaultPrecision::default(),
        }
    }

    pub fn from_exchange_info(mgr: &ExchangeInfoManager) -> Self {
        let mut table = HashMap::new();
        for (symbol, info) in mgr.symbols() {
            table.insert(symbol.clone(), info.clone());
        }
        Self {
            table,
            fallback: DefaultPrecision::default(),
        }
    }

    pub fn upsert(&mut self, info: SymbolInfo) {
        self.table.insert(info.symbol.to_uppercase(), info);
    }

    fn info(&self, symbol: &str) -> Option<&SymbolInfo> {
        self.table.get(&symbol.to_uppercase())
    }

    fn tick_size(&self, symbol: &str) -> Decimal {
        self.info(symbol).map(|i| i.tick_size).unwrap_or(self.fallback.tick_size)
    }

    fn step_size(&self, symbol: &str) -> Decimal {
        self.info(symbol).map(|i| i.step_size).unwrap_or(self.fallback.step_size)
    }

    fn min_notional(&self, symbol: &str) -> Decimal {
        self.info(symbol).map(|i| i.min_notional).unwrap_or(self.fallback.min_notional)
    }

    /// `floor(price / tickSize) * tickSize`.
    pub fn round_price_down(&self, symbol: &str, price: Decimal) -> Decimal {
        let tick = self.tick_size(symbol);
        if tick <= Decimal::ZERO {
            warn!(symbol, "precision: tick size missing or zero, returning raw price");
            return price;
        }
        (price / tick).floor() * tick
    }

    /// `floor(qty / stepSize) * stepSize`.
    pub fn floor_qty(&self, symbol: &str, qty: Decimal) -> Decimal {
        let step = self.step_size(symbol);
        if step <= Decimal::ZERO {
            warn!(symbol, "precision: step size missing or zero, returning raw qty");
            return qty;
        }
        (qty / step).floor() * step
    }

    /// `ceil(minNotional / price, stepSize)`, at least one step.
    pub fn min_qty_for_notional(&self, symbol: &str, price: Decimal) -> Decimal {
        let step = self.step_size(symbol);
        let min_notional = self.min_notional(symbol);
        if price <= Decimal::ZERO || step <= Decimal::ZERO {
            return step.max(self.fallback.min_qty);
        }
        let raw = min_notional / price;
        let steps = (raw / step).ceil();
        let steps = if steps < Decimal::ONE { Decimal::ONE } else { steps };
        steps * step
    }

    /// Floor-then-escalate: if the floored quantity is zero but the caller
    /// asked for a positive amount, escalate to the minimum notional-legal
    /// quantity instead of silently returning zero.
    pub fn trim_qty(&self, symbol: &str, qty: Decimal, price: Decimal) -> Decimal {
        let floored = self.floor_qty(symbol, qty);
        if floored > Decimal::ZERO || qty <= Decimal::ZERO {
            return floored;
        }
        let escalated = self.min_qty_for_notional(symbol, price);
        warn!(
            symbol,
            requested = %qty,
            escalated = %escalated,
            "precision: requested quantity floors to zero, escalating to min-notional quantity"
        );
        escalated
    }
}

impl Default for SymbolPrecisionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn registry_with(symbol: &str, tick: Decimal, step: Decimal, min_notional: Decimal) -> SymbolPrecisionRegistry {
        let mut reg = SymbolPrecisionRegistry::new();
        reg.upsert(SymbolInfo {
            symbol: symbol.into(),
            status: "TRADING".into(),
            base_asset: "BTC".into(),
            quote_asset: "USDT".into(),
            tick_size: tick,
            min_price: Decimal::ZERO,
            max_price: Decimal::MAX,
            step_size: step,
            min_qty: step,
            max_qty: Decimal::MAX,
            min_notional,
            quantity_precision: 3,
            price_precision: 2,
        });
        reg
    }

    /// S1: stepSize=0.001, minNotional=5, price=100, requested qty=0.0004.
    #[test]
    fn s1_precision_escalation() {
        let reg = registry_with("BTCUSDT", dec!(0.1), dec!(0.001), dec!(5));
        let trimmed = reg.trim_qty("BTCUSDT", dec!(0.0004), dec!(100));
        assert_eq!(trimmed, dec!(0.05));
    }

    #[test]
    fn i1_monotone_trim() {
        let reg = registry_with("ETHUSDT", dec!(0.01), dec!(0.001), dec!(5));
        let once = reg.trim_qty("ETHUSDT", dec!(1.2345), dec!(2000));
        let twice = reg.trim_qty("ETHUSDT", once, dec!(2000));
        assert_eq!(once, twice);
    }

    #[test]
    fn i2_step_legal() {
        let reg = registry_with("ETHUSDT", dec!(0.01), dec!(0.001), dec!(5));
        let trimmed = reg.trim_qty("ETHUSDT", dec!(1.2345), dec!(2000));
        assert_eq!(trimmed % dec!(0.001), Decimal::ZERO);
    }

    #[test]
    fn i3_notional_respected_after_escalation() {
        let reg = registry_with("BTCUSDT", dec!(0.1), dec!(0.001), dec!(5));
        let trimmed = reg.trim_qty("BTCUSDT", dec!(0.0004), dec!(100));
        assert!(trimmed * dec!(100) >= dec!(5));
    }

    #[test]
    fn missing_symbol_falls_back_to_eight_decimals() {
        let reg = SymbolPrecisionRegistry::new();
        let trimmed = reg.floor_qty("UNKNOWNUSDT", dec!(1.123456789));
        assert_eq!(trimmed, dec!(1.12345678));
    }

    #[test]
    fn floor_not_round_half_even() {
        // 50002.5 with tick 0.1 would round to 50003.0 under round-half-even,
        // but must floor to 50002.5 itself (already on a tick boundary) —
        // use a value strictly between ticks to show floor, not round.
        let reg = registry_with("BTCUSDT", dec!(0.1), dec!(0.001), dec!(5));
        let price = dec!(50002.49);
        let rounded = reg.round_price_down("BTCUSDT", price);
        assert_eq!(rounded, dec!(50002.4));
    }
}
