//! Strategy contract: closed-candle evaluation feeding the entry pipeline.
//!
//! Concrete trend/oscillator indicator math is deliberately not implemented
//! here — it's pure signal computation with no lifecycle concerns, and
//! lives outside this crate's scope. What's fixed is the contract: a
//! strategy evaluates only closed candles and returns an optional signal
//! carrying the SL/TP/trailing geometry the entry pipeline will trim and
//! persist.

use crate::config::ScalperConfig;
use crate::market_data::Candle;
use crate::position::Side;
use rust_decimal::Decimal;

#[derive(Debug, Clone)]
pub struct StrategySignal {
    pub side: Side,
    pub stop_loss: Decimal,
    pub take_profit: Decimal,
    pub trailing_stop_distance: Option<Decimal>,
    pub partial_tp: Option<Decimal>,
    pub partial_size_pct: Option<Decimal>,
}

/// Implemented by concrete strategies. `evaluate` receives only closed
/// candles, oldest first, and must not suspend or perform I/O.
pub trait Strategy: Send + Sync {
    fn evaluate(&self, symbol: &str, candles: &[Candle], cfg: &ScalperConfig) -> Option<StrategySignal>;
}

/// A strategy that never signals. Used in tests and as a safe default so the
/// entry pipeline has something to call without depending on indicator
/// internals that are out of scope for this crate.
pub struct NullStrategy;

impl Strategy for NullStrategy {
    fn evaluate(&self, _symbol: &str, _candles: &[Candle], _cfg: &ScalperConfig) -> Option<StrategySignal> {
        None
    }
}

/// Widens SL/TP so they never collide, mirroring the geometry fixup the
/// entry pipeline repeats independently during final trimming (step 7/8 of
/// the entry pipeline). Exposed here so a strategy can apply the same rule
/// before returning a signal.
pub fn enforce_min_tp_sl_gap(side: Side, entry: Decimal, mut sl: Decimal, mut tp: Decimal, min_gap_pct: Decimal) -> (Decimal, Decimal) {
    let min_gap = entry.abs() * min_gap_pct;
    match side {
        Side::Long => {
            if tp - sl < min_gap {
                tp = sl + min_gap;
            }
        }
        Side::Short => {
            if sl - tp < min_gap {
                tp = sl - min_gap;
            }
        }
    }
    (sl, tp)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn scalper_cfg() -> ScalperConfig {
        ScalperConfig {
            timeframe: "5m".into(),
            min_candles: 50,
            swing_sl_lookback: 10,
            min_sl_distance_pct: 0.0005,
            fallback_sl_pct: 0.003,
            risk_reward_ratio: 1.5,
            min_tp_sl_gap_pct: 0.001,
            leverage: 10.0,
            partial_tp: crate::config::PartialTpConfig { enabled: true, first_rr: 1.0, first_size_pct: 0.5 },
            trail_activation_buffer_pct: 0.002,
            trail_distance_pct: 0.005,
        }
    }

    #[test]
    fn null_strategy_never_signals() {
        let cfg = scalper_cfg();
        assert!(NullStrategy.evaluate("BTCUSDT", &[], &cfg).is_none());
    }

    #[test]
    fn enforce_min_tp_sl_gap_widens_long_tp() {
        let (sl, tp) = enforce_min_tp_sl_gap(Side::Long, dec!(100), dec!(99), dec!(99.05), dec!(0.01));
        assert!(tp - sl >= dec!(1));
        let _ = tp;
    }
}
