use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Long,
    Short,
}

impl Side {
    pub fn opposite(self) -> Self {
        match self {
            Side::Long => Side::Short,
            Side::Short => Side::Long,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Side::Long => "long",
            Side::Short => "short",
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// References to the live orders currently attached to a position, so a
/// reconnect or restart can re-poll exactly the orders it placed.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrderRefs {
    pub entry_order_id: Option<i64>,
    pub stop_order_id: Option<i64>,
    pub take_profit_order_id: Option<i64>,

    /// The order id of the most recent exit attempt whose fill could not be
    /// confirmed within the poll timeout, so a restart or reconciliation
    /// pass can re-poll it instead of assuming the position is still flat.
    pub last_attempted_order_id: Option<i64>,
    /// Human-readable status of that unconfirmed attempt (e.g. "exit timed
    /// out unconfirmed, cancel requested").
    pub last_stop_order_status: Option<String>,
}

/// A single open or recently-closed position tracked locally, mirrored to a
/// JSON snapshot after every mutation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub side: Side,
    pub entry_price: Decimal,
    pub size: Decimal,
    pub original_size: Decimal,
    pub stop_loss: Decimal,
    pub take_profit: Decimal,
    pub peak_price: Decimal,

    pub partial_tp_price: Option<Decimal>,
    pub partial_tp_size: Option<Decimal>,
    pub partial_tp_done: bool,

    pub tp1_triggered: bool,
    pub awaiting_trail_activation: bool,
    pub trail_active: bool,
    pub trailing_sl: Option<Decimal>,

    pub breakeven: bool,
    pub breakeven_set_at: Option<DateTime<Utc>>,

    /// Set the first time a reconciliation pass fails to find this position
    /// on the exchange; cleared if it reappears. Removed locally only after
    /// the configured grace window elapses.
    pub binance_missing_since: Option<DateTime<Utc>>,

    pub source: String,
    pub label: Option<String>,
    pub confidence: Decimal,

    pub entry_time: DateTime<Utc>,
    pub exit_time: Option<DateTime<Utc>>,

    /// True when the entry fill price could not be confirmed from the
    /// exchange and a pre-trade estimate was kept instead.
    pub entry_price_estimated: bool,

    pub last_order_refs: OrderRefs,
}

impl Position {
    pub fn key(symbol: &str, side: Side) -> String {
        format!("{}|{}", symbol.to_uppercase(), side.as_str())
    }

    pub fn position_key(&self) -> String {
        Self::key(&self.symbol, self.side)
    }

    /// Whether breakeven-style stop placement is currently permitted: either
    /// TP1 already triggered, the trailing-stop arm sequence has started, or
    /// the breakeven flag was set directly.
    pub fn breakeven_allowed(&self) -> bool {
        self.tp1_triggered || self.awaiting_trail_activation || self.breakeven
    }

    pub fn unrealized_pnl(&self, mark_price: Decimal) -> Decimal {
        match self.side {
            Side::Long => (mark_price - self.entry_price) * self.size,
            Side::Short => (self.entry_price - mark_price) * self.size,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn sample() -> Position {
        Position {
            symbol: "BTCUSDT".into(),
            side: Side::Long,
            entry_price: dec!(100),
            size: dec!(1),
            original_size: dec!(1),
            stop_loss: dec!(95),
            take_profit: dec!(110),
            peak_price: dec!(100),
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
            entry_time: Utc::now(),
            exit_time: None,
            entry_price_estimated: false,
            last_order_refs: OrderRefs::default(),
        }
    }

    #[test]
    fn key_is_uppercase_symbol_and_side() {
        assert_eq!(Position::key("btcusdt", Side::Short), "BTCUSDT|short");
    }

    #[test]
    fn breakeven_allowed_tracks_tp1_and_trail_flags() {
        let mut pos = sample();
        assert!(!pos.breakeven_allowed());
        pos.tp1_triggered = true;
        assert!(pos.breakeven_allowed());
    }

    #[test]
    fn unrealized_pnl_long_and_short() {
        let long = sample();
        assert_eq!(long.unrealized_pnl(dec!(110)), dec!(10));
        let mut short = sample();
        short.side = Side::Short;
        assert_eq!(short.unrealized_pnl(dec!(90)), dec!(10));
    }
}
