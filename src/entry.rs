//! Fourteen-step entry pipeline: validate, size, risk-check, place, attach.
//!
//! Shares its hedge-mode detection and dry-run short-circuit with the exit
//! side, and its margin precheck with the sizing logic in `risk.rs`.

use crate::binance::gateway::{ConditionalOrderType, ExchangeError, Gateway, OrderSide};
use crate::config::{GeneralConfig, RiskConfig, ScalperConfig};
use crate::position::{OrderLifecycleTracker, OrderRefs, Position, PositionStore, Side};
use crate::precision::SymbolPrecisionRegistry;
use crate::risk::RiskManager;
use crate::sink::{AlertLevel, LifecycleEvent, LifecycleSink};
use crate::strategy::StrategySignal;
use chrono::Utc;
use rust_decimal::Decimal;
use std::sync::Mutex;
use tracing::{info, warn};

pub struct EntryPipeline<'a> {
    pub gateway: &'a dyn Gateway,
    pub precision: &'a SymbolPrecisionRegistry,
    pub store: &'a PositionStore,
    pub tracker: &'a OrderLifecycleTracker,
    pub risk: &'a Mutex<RiskManager>,
    pub sink: &'a LifecycleSink,
    pub risk_config: &'a RiskConfig,
    pub scalper_config: &'a ScalperConfig,
    pub general_config: &'a GeneralConfig,
}

#[derive(Debug)]
pub enum EntryRejected {
    AlreadyOpen,
    QtyInvalidAfterTrim,
    InsufficientMargin,
    EntryPriceUnresolved,
    Exchange(ExchangeError),
}

impl<'a> EntryPipeline<'a> {
    pub async fn run(&self, symbol: &str, signal: StrategySignal, price: Decimal) -> Result<(), EntryRejected> {
        // Step 1: reject if a position already exists on this (symbol,side).
        if self.store.exists(symbol, signal.side) {
            self.reject(symbol, signal.side, "already_open").await;
            return Err(EntryRejected::AlreadyOpen);
        }

        // Step 2: raw qty from USD allocation, trimmed via the registry.
        let allocation = self.risk_config.allocation_for(symbol);
        let raw_qty = allocation / price;
        let mut qty = self.precision.trim_qty(symbol, raw_qty, price);

        // Step 3: reject if trimming collapses the quantity to zero.
        if qty <= Decimal::ZERO {
            self.reject(symbol, signal.side, "qty_invalid_after_trim").await;
            return Err(EntryRejected::QtyInvalidAfterTrim);
        }

        // Step 4: escalate to min-notional quantity if below the exchange floor.
        let min_notional_qty = self.precision.min_qty_for_notional(symbol, price);
        if qty < min_notional_qty {
            qty = self.precision.trim_qty(symbol, min_notional_qty, price);
        }

        // Step 5: re-validate against LOT_SIZE/MIN_NOTIONAL (trimQty already
        // enforces both; a post-trim floor-to-zero means the symbol cannot
        // be traded with the configured allocation).
        if qty <= Decimal::ZERO {
            self.reject(symbol, signal.side, "qty_invalid_after_trim").await;
            return Err(EntryRejected::QtyInvalidAfterTrim);
        }

        // Step 6: margin precheck.
        let leverage = Decimal::try_from(self.scalper_config.leverage).unwrap_or(Decimal::from(1));
        let has_sufficient_margin = {
            let risk = self.risk.lock().expect("risk manager lock poisoned");
            risk.has_sufficient_margin(qty, price, leverage)
        };
        if !has_sufficient_margin {
            self.reject(symbol, signal.side, "insufficient_margin").await;
            return Err(EntryRejected::InsufficientMargin);
        }

        // Step 7: enforce SL/TP geometry against the configured minimum distance.
        let (mut sl, mut tp) = (signal.stop_loss, signal.take_profit);
        let min_sl_distance = price.abs() * Decimal::try_from(self.scalper_config.min_sl_distance_pct).unwrap_or(Decimal::new(5, 4));
        let risk_distance = (price - sl).abs();
        if risk_distance <= min_sl_distance {
            let widened = price.abs() * Decimal::try_from(self.scalper_config.fallback_sl_pct).unwrap_or(Decimal::new(3, 3));
            let rr = Decimal::try_from(self.scalper_config.risk_reward_ratio).unwrap_or(Decimal::from(1));
            match signal.side {
                Side::Long => {
                    sl = price - widened;
                    tp = price + widened * rr;
                }
                Side::Short => {
                    sl = price + widened;
                    tp = price - widened * rr;
                }
            }
            warn!(symbol, "entry: widened SL/TP to satisfy minimum distance");
        }

        // Step 8: trim SL/TP to tickSize.
        sl = self.precision.round_price_down(symbol, sl);
        tp = self.precision.round_price_down(symbol, tp);

        // Step 9: opposite-side cleanup — close any opposite-side position first.
        if self.store.exists(symbol, signal.side.opposite()) {
            let close_side = match signal.side.opposite() {
                Side::Long => OrderSide::Sell,
                Side::Short => OrderSide::Buy,
            };
            let opposite_size = self.store.get(symbol, signal.side.opposite()).map(|p| p.size).unwrap_or(Decimal::ZERO);
            if opposite_size > Decimal::ZERO {
                let hedge = self.gateway.position_mode().await.map_err(EntryRejected::Exchange)?.hedge_mode;
                let position_side = hedge.then(|| match signal.side.opposite() {
                    Side::Long => "LONG",
                    Side::Short => "SHORT",
                });
                let _ = self.gateway.place_market(symbol, close_side, opposite_size, position_side, !hedge).await;
                self.store.close(symbol, signal.side.opposite());
            }
        }

        // Step 10: set leverage and place the entry order.
        self.gateway.set_leverage(symbol, leverage.to_string().parse().unwrap_or(1)).await.map_err(EntryRejected::Exchange)?;
        let order_side = match signal.side {
            Side::Long => OrderSide::Buy,
            Side::Short => OrderSide::Sell,
        };
        let hedge = self.gateway.position_mode().await.map_err(EntryRejected::Exchange)?.hedge_mode;
        let position_side = hedge.then(|| match signal.side {
            Side::Long => "LONG",
            Side::Short => "SHORT",
        });
        let ack = self.gateway.place_market(symbol, order_side, qty, position_side, false).await.map_err(EntryRejected::Exchange)?;

        // Step 11: resolve the entry fill price.
        let (entry_price, estimated) = if ack.avg_price > Decimal::ZERO {
            (ack.avg_price, false)
        } else if let Ok(Some(ticker)) = self.gateway.latest_price(symbol).await {
            (ticker, true)
        } else {
            (Decimal::ZERO, true)
        };
        if entry_price <= Decimal::ZERO {
            self.reject(symbol, signal.side, "entry_price_unresolved").await;
            return Err(EntryRejected::EntryPriceUnresolved);
        }

        // Step 12: persist the position record, including partial TP1 geometry.
        let partial_tp_price = signal.partial_tp.map(|risk_mult| match signal.side {
            Side::Long => entry_price + (entry_price - sl).abs() * risk_mult,
            Side::Short => entry_price - (entry_price - sl).abs() * risk_mult,
        });
        let partial_tp_size = signal.partial_size_pct.map(|pct| qty * pct);

        let position = Position {
            symbol: symbol.to_string(),
            side: signal.side,
            entry_price,
            size: qty,
            original_size: qty,
            stop_loss: sl,
            take_profit: tp,
            peak_price: entry_price,
            partial_tp_price,
            partial_tp_size,
            partial_tp_done: false,
            tp1_triggered: false,
            awaiting_trail_activation: false,
            trail_active: false,
            trailing_sl: None,
            breakeven: false,
            breakeven_set_at: None,
            binance_missing_since: None,
            source: "scalper".to_string(),
            label: None,
            confidence: Decimal::ONE,
            entry_time: Utc::now(),
            exit_time: Some(Utc::now() + chrono::Duration::hours(self.general_config.hold_limit_hours as i64)),
            entry_price_estimated: estimated,
            last_order_refs: OrderRefs { entry_order_id: Some(ack.order_id), stop_order_id: None, take_profit_order_id: None, last_attempted_order_id: None, last_stop_order_status: None },
        };
        self.store.add(
            position,
            Decimal::try_from(self.scalper_config.min_sl_distance_pct).unwrap_or(Decimal::new(5, 4)),
            Decimal::try_from(self.scalper_config.fallback_sl_pct).unwrap_or(Decimal::new(3, 3)),
        );
        self.tracker.track_entry(symbol, signal.side, ack.order_id, "scalper");
        self.tracker.mark_open(symbol, signal.side);

        // Step 13: attach reduce-only SL/TP orders (best-effort; failures are logged, not fatal).
        let exit_side = match signal.side {
            Side::Long => OrderSide::Sell,
            Side::Short => OrderSide::Buy,
        };
        let stop_order_id = self
            .gateway
            .place_conditional(symbol, exit_side, ConditionalOrderType::StopMarket, sl, position_side, true)
            .await
            .map(|ack| ack.order_id)
            .ok();
        let take_profit_order_id = self
            .gateway
            .place_conditional(symbol, exit_side, ConditionalOrderType::TakeProfitMarket, tp, position_side, true)
            .await
            .map(|ack| ack.order_id)
            .ok();
        self.store.update(symbol, signal.side, |pos| {
            pos.last_order_refs.stop_order_id = stop_order_id;
            pos.last_order_refs.take_profit_order_id = take_profit_order_id;
        });

        // Step 14: lifecycle event.
        self.sink.record_lifecycle_event(LifecycleEvent {
            ts: Utc::now(),
            symbol: symbol.to_string(),
            side: signal.side.to_string(),
            event_type: "ENTRY".to_string(),
            price: entry_price,
            qty,
            entry_price,
            pnl: Decimal::ZERO,
            sl,
            tp,
            reason: String::new(),
            source: "scalper".to_string(),
        });
        {
            let mut risk = self.risk.lock().expect("risk manager lock poisoned");
            risk.register_open(symbol);
        }
        info!(symbol, side = ?signal.side, %qty, %entry_price, "entry: position opened");
        Ok(())
    }

    async fn reject(&self, symbol: &str, side: Side, reason: &str) {
        warn!(symbol, ?side, reason, "entry: rejected");
        self.sink.alert(AlertLevel::Warning, &format!("entry-reject:{}:{}", symbol, reason), &format!("{} {} entry rejected: {}", symbol, side, reason)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binance::exchange_info::SymbolInfo;
    use crate::binance::gateway::{BinancePosition, OrderAck, PositionModeInfo};
    use crate::config::PartialTpConfig;
    use async_trait::async_trait;
    use rust_decimal_macros::dec;
    use std::collections::HashMap;

    /// Records every call it receives so tests can assert on call counts
    /// without needing a real network or exchange account.
    struct MockGateway {
        next_order_id: std::sync::atomic::AtomicI64,
        hedge_mode: bool,
        market_orders: Mutex<Vec<(String, OrderSide, Decimal)>>,
    }

    impl MockGateway {
        fn new() -> Self {
            Self {
                next_order_id: std::sync::atomic::AtomicI64::new(1),
                hedge_mode: false,
                market_orders: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl Gateway for MockGateway {
        async fn latest_price(&self, _symbol: &str) -> Result<Option<Decimal>, ExchangeError> {
            Ok(Some(dec!(100)))
        }

        async fn positions(&self, _symbol: Option<&str>) -> Result<Vec<BinancePosition>, ExchangeError> {
            Ok(Vec::new())
        }

        async fn position_mode(&self) -> Result<PositionModeInfo, ExchangeError> {
            Ok(PositionModeInfo { hedge_mode: self.hedge_mode })
        }

        async fn set_leverage(&self, _symbol: &str, _leverage: u32) -> Result<(), ExchangeError> {
            Ok(())
        }

        async fn place_market(
            &self,
            symbol: &str,
            side: OrderSide,
            qty: Decimal,
            _position_side: Option<&str>,
            _reduce_only: bool,
        ) -> Result<OrderAck, ExchangeError> {
            self.market_orders.lock().unwrap().push((symbol.to_string(), side, qty));
            let order_id = self.next_order_id.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            Ok(OrderAck { order_id, status: "FILLED".into(), executed_qty: qty, avg_price: dec!(100) })
        }

        async fn place_conditional(
            &self,
            _symbol: &str,
            _side: OrderSide,
            _order_type: ConditionalOrderType,
            _stop_price: Decimal,
            _position_side: Option<&str>,
            _reduce_only: bool,
        ) -> Result<OrderAck, ExchangeError> {
            let order_id = self.next_order_id.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            Ok(OrderAck { order_id, status: "NEW".into(), executed_qty: Decimal::ZERO, avg_price: Decimal::ZERO })
        }

        async fn get_order(&self, _symbol: &str, order_id: i64) -> Result<OrderAck, ExchangeError> {
            Ok(OrderAck { order_id, status: "FILLED".into(), executed_qty: dec!(1), avg_price: dec!(100) })
        }

        async fn cancel_order(&self, _symbol: &str, _order_id: i64) -> Result<(), ExchangeError> {
            Ok(())
        }
    }

    fn precision_with(symbol: &str, tick: Decimal, step: Decimal, min_notional: Decimal) -> SymbolPrecisionRegistry {
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

    fn temp_store() -> PositionStore {
        let dir = std::env::temp_dir().join(format!("posengine-entry-test-{}-{:?}", std::process::id(), std::thread::current().id()));
        let _ = std::fs::create_dir_all(&dir);
        PositionStore::new(dir.join("snap.json"), dec!(0.0001))
    }

    fn temp_sink() -> LifecycleSink {
        let dir = std::env::temp_dir().join(format!("posengine-entry-sink-test-{}-{:?}", std::process::id(), std::thread::current().id()));
        let _ = std::fs::create_dir_all(&dir);
        LifecycleSink::new(
            dir.join("lifecycle.csv").to_string_lossy().into(),
            dir.join("equity.csv").to_string_lossy().into(),
            dir.join("lifecycle.db").to_string_lossy().into(),
            None,
            false,
            60,
            true,
        )
    }

    fn risk_config() -> RiskConfig {
        RiskConfig {
            initial_balance: 100_000.0,
            max_risk_per_trade: 0.01,
            daily_loss_limit_pct: 0.05,
            max_concurrent_positions: 5,
            consecutive_loss_limit: 3,
            symbol_cooldown_minutes: 30,
            maintenance_margin_rate: 0.01,
            usd_allocation: HashMap::new(),
            default_usd_allocation: 100.0,
        }
    }

    fn scalper_config() -> ScalperConfig {
        ScalperConfig {
            timeframe: "5m".into(),
            min_candles: 50,
            swing_sl_lookback: 10,
            min_sl_distance_pct: 0.005,
            fallback_sl_pct: 0.01,
            risk_reward_ratio: 1.5,
            min_tp_sl_gap_pct: 0.001,
            leverage: 10.0,
            partial_tp: PartialTpConfig { enabled: false, first_rr: 1.0, first_size_pct: 0.5 },
            trail_activation_buffer_pct: 0.002,
            trail_distance_pct: 0.005,
        }
    }

    fn general_config() -> GeneralConfig {
        GeneralConfig {
            symbols: vec!["BTCUSDT".into()],
            log_level: "info".into(),
            dry_run: false,
            live_mode: false,
            hold_limit_hours: 24,
        }
    }

    fn long_signal() -> StrategySignal {
        StrategySignal {
            side: Side::Long,
            stop_loss: dec!(95),
            take_profit: dec!(110),
            trailing_stop_distance: None,
            partial_tp: None,
            partial_size_pct: None,
        }
    }

    #[tokio::test]
    async fn rejects_entry_when_position_already_open() {
        let gateway = MockGateway::new();
        let precision = precision_with("BTCUSDT", dec!(0.1), dec!(0.001), dec!(5));
        let store = temp_store();
        let tracker = OrderLifecycleTracker::new();
        let risk = Mutex::new(RiskManager::new(&risk_config()));
        let sink = temp_sink();
        let rc = risk_config();
        let sc = scalper_config();
        let gc = general_config();

        store.add(
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
                confidence: dec!(1),
                entry_time: Utc::now(),
                exit_time: None,
                entry_price_estimated: false,
                last_order_refs: OrderRefs::default(),
            },
            dec!(0.005),
            dec!(0.01),
        );

        let pipeline = EntryPipeline {
            gateway: &gateway,
            precision: &precision,
            store: &store,
            tracker: &tracker,
            risk: &risk,
            sink: &sink,
            risk_config: &rc,
            scalper_config: &sc,
            general_config: &gc,
        };

        let result = pipeline.run("BTCUSDT", long_signal(), dec!(100)).await;
        assert!(matches!(result, Err(EntryRejected::AlreadyOpen)));
        assert!(gateway.market_orders.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn widens_sl_tp_when_signal_stop_is_too_tight() {
        let gateway = MockGateway::new();
        let precision = precision_with("BTCUSDT", dec!(0.1), dec!(0.001), dec!(5));
        let store = temp_store();
        let tracker = OrderLifecycleTracker::new();
        let risk = Mutex::new(RiskManager::new(&risk_config()));
        let sink = temp_sink();
        let rc = risk_config();
        let sc = scalper_config();
        let gc = general_config();

        let pipeline = EntryPipeline {
            gateway: &gateway,
            precision: &precision,
            store: &store,
            tracker: &tracker,
            risk: &risk,
            sink: &sink,
            risk_config: &rc,
            scalper_config: &sc,
            general_config: &gc,
        };

        // Stop only 0.1% away from price, well inside the configured 0.5% floor.
        let mut signal = long_signal();
        signal.stop_loss = dec!(99.9);
        signal.take_profit = dec!(110);

        pipeline.run("BTCUSDT", signal, dec!(100)).await.expect("entry should succeed");
        let stored = store.get("BTCUSDT", Side::Long).expect("position recorded");
        // fallback_sl_pct=0.01 -> widened distance is 1.0 at price 100.
        assert_eq!(stored.stop_loss, dec!(99));
        assert!(stored.take_profit > dec!(100));
    }

    #[tokio::test]
    async fn escalates_quantity_to_min_notional_floor() {
        let gateway = MockGateway::new();
        // minNotional=5000 forces escalation: allocation/price alone would
        // trim to a quantity whose notional falls below the floor.
        let precision = precision_with("BTCUSDT", dec!(0.1), dec!(0.001), dec!(5000));
        let store = temp_store();
        let tracker = OrderLifecycleTracker::new();
        let risk = Mutex::new(RiskManager::new(&risk_config()));
        let sink = temp_sink();
        let mut rc = risk_config();
        rc.default_usd_allocation = 10.0;
        let sc = scalper_config();
        let gc = general_config();

        let pipeline = EntryPipeline {
            gateway: &gateway,
            precision: &precision,
            store: &store,
            tracker: &tracker,
            risk: &risk,
            sink: &sink,
            risk_config: &rc,
            scalper_config: &sc,
            general_config: &gc,
        };

        pipeline.run("BTCUSDT", long_signal(), dec!(100)).await.expect("entry should succeed");
        let stored = store.get("BTCUSDT", Side::Long).expect("position recorded");
        assert!(stored.size * stored.entry_price >= dec!(5000));
    }
}
