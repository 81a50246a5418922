//! Daily loss limits, margin prechecks, and anti-streak hibernation.
//!
//! Tracks concurrent open positions and the running daily-loss halt, plus a
//! per-symbol cooldown that arms after too many consecutive losing trades.

use crate::config::RiskConfig;
use crate::exit::ExitReason;
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{info, warn};

pub struct RiskManager {
    config: RiskConfig,
    balance: Decimal,
    daily_pnl: Decimal,
    daily_limit: Decimal,
    daily_halted: bool,
    open_symbols: BTreeSet<String>,
    consecutive_losses: BTreeMap<String, u32>,
    cooldown_until: BTreeMap<String, DateTime<Utc>>,
}

impl RiskManager {
    pub fn new(config: &RiskConfig) -> Self {
        let balance = Decimal::try_from(config.initial_balance).unwrap_or(Decimal::from(10_000));
        let daily_limit = balance * Decimal::try_from(config.daily_loss_limit_pct).unwrap_or(Decimal::new(5, 2));
        Self {
            config: config.clone(),
            balance,
            daily_pnl: Decimal::ZERO,
            daily_limit,
            daily_halted: false,
            open_symbols: BTreeSet::new(),
            consecutive_losses: BTreeMap::new(),
            cooldown_until: BTreeMap::new(),
        }
    }

    /// Entry pipeline step 0 (ahead of step 1): global halt, concurrency cap,
    /// and per-symbol cooldown from the anti-streak decorator.
    pub fn can_trade(&self, symbol: &str) -> bool {
        if self.daily_halted {
            warn!("risk: trading halted, daily loss limit reached");
            return false;
        }
        if self.open_symbols.len() >= self.config.max_concurrent_positions {
            warn!(max = self.config.max_concurrent_positions, "risk: max concurrent positions reached");
            return false;
        }
        if let Some(until) = self.cooldown_until.get(symbol) {
            if Utc::now() < *until {
                warn!(symbol, until = %until, "risk: symbol is hibernating after a losing streak");
                return false;
            }
        }
        true
    }

    /// Entry pipeline step 6: margin precheck.
    /// `required = (qty*price)/leverage + notional*maintenanceRate`.
    pub fn has_sufficient_margin(&self, qty: Decimal, price: Decimal, leverage: Decimal) -> bool {
        if leverage <= Decimal::ZERO {
            return false;
        }
        let notional = qty * price;
        let required = notional / leverage + notional * Decimal::try_from(self.config.maintenance_margin_rate).unwrap_or(Decimal::new(1, 2));
        let sufficient = required <= self.balance;
        if !sufficient {
            warn!(%required, balance = %self.balance, "risk: insufficient margin for position");
        }
        sufficient
    }

    pub fn register_open(&mut self, symbol: &str) {
        self.open_symbols.insert(symbol.to_string());
    }

    /// Records a closed trade's realized PnL, updates daily totals and the
    /// per-symbol loss streak, and arms a cooldown once the streak reaches
    /// `consecutive_loss_limit`.
    ///
    /// The streak only counts an un-TP1'd stop-loss exit — a trailing-stop
    /// exit or a post-TP1 SL touch is already a managed, partially-profitable
    /// outcome and shouldn't arm hibernation the same way a raw SL hit does.
    pub fn record_close(&mut self, symbol: &str, pnl: Decimal, reason: ExitReason, tp1_triggered: bool) {
        self.open_symbols.remove(symbol);
        self.daily_pnl += pnl;
        self.balance += pnl;

        if pnl < Decimal::ZERO {
            if reason == ExitReason::StopLoss && !tp1_triggered {
                let streak = self.consecutive_losses.entry(symbol.to_string()).or_insert(0);
                *streak += 1;
                if *streak >= self.config.consecutive_loss_limit {
                    let until = Utc::now() + Duration::minutes(self.config.symbol_cooldown_minutes as i64);
                    warn!(symbol, streak = *streak, until = %until, "risk: consecutive loss limit hit, hibernating symbol");
                    self.cooldown_until.insert(symbol.to_string(), until);
                    *streak = 0;
                }
            }
        } else {
            self.consecutive_losses.insert(symbol.to_string(), 0);
        }

        info!(symbol, %pnl, daily_pnl = %self.daily_pnl, balance = %self.balance, "risk: position closed");

        if self.daily_pnl < -self.daily_limit {
            warn!(daily_pnl = %self.daily_pnl, limit = %self.daily_limit, "risk: daily loss limit reached, halting trading");
            self.daily_halted = true;
        }
    }

    pub fn reset_daily(&mut self) {
        self.daily_pnl = Decimal::ZERO;
        self.daily_halted = false;
        info!("risk: daily stats reset");
    }

    pub fn is_halted(&self) -> bool {
        self.daily_halted
    }

    pub fn balance(&self) -> Decimal {
        self.balance
    }

    pub fn daily_pnl(&self) -> Decimal {
        self.daily_pnl
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use std::collections::HashMap;

    fn cfg() -> RiskConfig {
        RiskConfig {
            initial_balance: 1000.0,
            max_risk_per_trade: 0.01,
            daily_loss_limit_pct: 0.05,
            max_concurrent_positions: 2,
            consecutive_loss_limit: 2,
            symbol_cooldown_minutes: 30,
            maintenance_margin_rate: 0.01,
            usd_allocation: HashMap::new(),
            default_usd_allocation: 50.0,
        }
    }

    #[test]
    fn hibernates_symbol_after_consecutive_losses() {
        let mut rm = RiskManager::new(&cfg());
        rm.record_close("BTCUSDT", dec!(-5), ExitReason::StopLoss, false);
        assert!(rm.can_trade("BTCUSDT"));
        rm.record_close("BTCUSDT", dec!(-5), ExitReason::StopLoss, false);
        assert!(!rm.can_trade("BTCUSDT"));
    }

    #[test]
    fn a_win_resets_the_streak() {
        let mut rm = RiskManager::new(&cfg());
        rm.record_close("BTCUSDT", dec!(-5), ExitReason::StopLoss, false);
        rm.record_close("BTCUSDT", dec!(5), ExitReason::TakeProfit, false);
        rm.record_close("BTCUSDT", dec!(-5), ExitReason::StopLoss, false);
        assert!(rm.can_trade("BTCUSDT"));
    }

    #[test]
    fn trailing_loss_does_not_count_toward_the_streak() {
        let mut rm = RiskManager::new(&cfg());
        rm.record_close("BTCUSDT", dec!(-5), ExitReason::Trailing, false);
        rm.record_close("BTCUSDT", dec!(-5), ExitReason::Trailing, false);
        rm.record_close("BTCUSDT", dec!(-5), ExitReason::Trailing, false);
        assert!(rm.can_trade("BTCUSDT"));
    }

    #[test]
    fn sl_after_tp1_does_not_count_toward_the_streak() {
        let mut rm = RiskManager::new(&cfg());
        rm.record_close("BTCUSDT", dec!(-5), ExitReason::StopLoss, true);
        rm.record_close("BTCUSDT", dec!(-5), ExitReason::StopLoss, true);
        assert!(rm.can_trade("BTCUSDT"));
    }

    #[test]
    fn margin_precheck_rejects_when_insufficient() {
        let rm = RiskManager::new(&cfg());
        assert!(!rm.has_sufficient_margin(dec!(1000), dec!(100), dec!(1)));
        assert!(rm.has_sufficient_margin(dec!(1), dec!(100), dec!(10)));
    }

    #[test]
    fn daily_loss_limit_halts_trading() {
        let mut rm = RiskManager::new(&cfg());
        rm.record_close("BTCUSDT", dec!(-100), ExitReason::StopLoss, false);
        assert!(rm.is_halted());
        assert!(!rm.can_trade("ETHUSDT"));
    }
}
