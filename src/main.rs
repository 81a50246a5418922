use posengine::binance::{ExchangeGateway, ExchangeInfoManager, GatewayCredentials, TimeSyncChecker};
use posengine::config::AppConfig;
use posengine::entry::EntryPipeline;
use posengine::exit::ExitController;
use posengine::market_data::{BinanceKlineStream, Candle, MarketEvent};
use posengine::position::{OrderLifecycleTracker, PositionStore};
use posengine::precision::SymbolPrecisionRegistry;
use posengine::reconcile::Reconciler;
use posengine::risk::RiskManager;
use posengine::sink::LifecycleSink;
use posengine::strategy::{NullStrategy, Strategy};
use posengine::watchdog::{HeartbeatRegistry, Watchdog};

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();

    let config = AppConfig::load("config.toml").unwrap_or_else(|e| {
        eprintln!("Failed to load config: {}", e);
        std::process::exit(1);
    });

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.general.log_level));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    info!("position engine starting, dry_run={}", config.general.dry_run);

    // === pre-flight checks ===
    let time_checker = TimeSyncChecker::new(
        config.binance.api_url.clone(),
        config.binance.max_time_offset_ms,
        config.binance.max_latency_ms,
        config.binance.ping_samples,
    );
    if let Err(e) = time_checker.check().await {
        error!("time sync failed: {}", e);
        std::process::exit(1);
    }

    let mut exchange_info = ExchangeInfoManager::new(config.binance.api_url.clone());
    if let Err(e) = exchange_info.sync().await {
        error!("exchange info sync failed: {}", e);
        std::process::exit(1);
    }
    for symbol in &config.general.symbols {
        if !exchange_info.has_symbol(symbol) {
            error!(symbol, "symbol not found in exchange info");
            std::process::exit(1);
        }
    }
    info!(count = config.general.symbols.len(), "all configured symbols validated");

    let precision = Arc::new(SymbolPrecisionRegistry::from_exchange_info(&exchange_info));

    let credentials = if config.general.dry_run {
        None
    } else {
        match (std::env::var("BINANCE_API_KEY"), std::env::var("BINANCE_API_SECRET")) {
            (Ok(api_key), Ok(api_secret)) => Some(GatewayCredentials { api_key, api_secret }),
            _ => {
                error!("live mode requires BINANCE_API_KEY and BINANCE_API_SECRET in the environment");
                std::process::exit(1);
            }
        }
    };
    let gateway = Arc::new(ExchangeGateway::new(
        config.binance.api_url.clone(),
        credentials,
        config.general.dry_run,
        time_checker,
    ));

    let min_sl_distance_pct = rust_decimal::Decimal::try_from(config.scalper.min_sl_distance_pct).unwrap_or(rust_decimal::Decimal::new(5, 4));
    let store = Arc::new(PositionStore::load(config.logging.positions_snapshot_path.clone(), min_sl_distance_pct)?);
    let tracker = Arc::new(OrderLifecycleTracker::new());
    let risk = Arc::new(Mutex::new(RiskManager::new(&config.risk)));
    let heartbeats = Arc::new(HeartbeatRegistry::new());

    let db_path = config.logging.lifecycle_csv_path.replace(".csv", ".db");
    let webhook_url = config.alerts.webhook_url().ok();
    let sink = Arc::new(LifecycleSink::new(
        config.logging.lifecycle_csv_path.clone(),
        config.logging.equity_csv_path.clone(),
        db_path,
        webhook_url,
        config.alerts.enabled,
        config.alerts.dedup_ttl_secs,
        config.general.dry_run,
    ));

    // === market data ===
    let (market_tx, _) = broadcast::channel::<MarketEvent>(10_000);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let kline_stream = BinanceKlineStream::new(
        config.general.symbols.clone(),
        config.scalper.timeframe.clone(),
        config.binance.ws_url.clone(),
        market_tx.clone(),
    );
    let ws_shutdown = shutdown_rx.clone();
    let ws_handle = tokio::spawn(async move {
        kline_stream.run(ws_shutdown).await;
    });

    // === strategy + entry worker ===
    let entry_gateway = gateway.clone();
    let entry_precision = precision.clone();
    let entry_store = store.clone();
    let entry_tracker = tracker.clone();
    let entry_risk = risk.clone();
    let entry_sink = sink.clone();
    let entry_heartbeats = heartbeats.clone();
    let entry_risk_config = config.risk.clone();
    let entry_scalper_config = config.scalper.clone();
    let entry_general_config = config.general.clone();
    let mut entry_market_rx = market_tx.subscribe();
    let mut entry_shutdown = shutdown_rx.clone();
    let entry_handle = tokio::spawn(async move {
        let strategy = NullStrategy;
        let mut candle_buffers: HashMap<String, Vec<Candle>> = HashMap::new();
        loop {
            tokio::select! {
                event = entry_market_rx.recv() => {
                    let event = match event {
                        Ok(e) => e,
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!(skipped = n, "entry worker: lagged behind candle stream");
                            continue;
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    };
                    let MarketEvent::Candle(candle) = event;
                    let buf = candle_buffers.entry(candle.symbol.clone()).or_default();
                    buf.push(candle.clone());
                    let cap = entry_scalper_config.min_candles * 2;
                    if buf.len() > cap {
                        let excess = buf.len() - cap;
                        buf.drain(0..excess);
                    }
                    if buf.len() >= entry_scalper_config.min_candles {
                        if let Some(signal) = strategy.evaluate(&candle.symbol, buf, &entry_scalper_config) {
                            let allowed = entry_risk.lock().expect("risk lock poisoned").can_trade(&candle.symbol);
                            if allowed {
                                let pipeline = EntryPipeline {
                                    gateway: entry_gateway.as_ref(),
                                    precision: &entry_precision,
                                    store: &entry_store,
                                    tracker: &entry_tracker,
                                    risk: &entry_risk,
                                    sink: &entry_sink,
                                    risk_config: &entry_risk_config,
                                    scalper_config: &entry_scalper_config,
                                    general_config: &entry_general_config,
                                };
                                if let Err(e) = pipeline.run(&candle.symbol, signal, candle.close).await {
                                    warn!(symbol = %candle.symbol, "entry worker: pipeline rejected entry: {:?}", e);
                                }
                            }
                        }
                    }
                    entry_heartbeats.beat("entry");
                }
                _ = entry_shutdown.changed() => {
                    if *entry_shutdown.borrow() {
                        info!("entry worker shutting down");
                        return;
                    }
                }
            }
        }
    });

    // === exit controller worker ===
    let exit_gateway = gateway.clone();
    let exit_precision = precision.clone();
    let exit_store = store.clone();
    let exit_tracker = tracker.clone();
    let exit_risk = risk.clone();
    let exit_sink = sink.clone();
    let exit_heartbeats = heartbeats.clone();
    let exit_scalper_config = config.scalper.clone();
    let exit_dry_run = config.general.dry_run;
    let mut exit_shutdown = shutdown_rx.clone();
    let exit_handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_millis(500));
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let controller = ExitController {
                        gateway: &exit_gateway,
                        precision: &exit_precision,
                        store: &exit_store,
                        tracker: &exit_tracker,
                        risk: &exit_risk,
                        sink: &exit_sink,
                        scalper_config: &exit_scalper_config,
                        dry_run: exit_dry_run,
                    };
                    controller.evaluate_all().await;
                    exit_heartbeats.beat("exit");
                }
                _ = exit_shutdown.changed() => {
                    if *exit_shutdown.borrow() {
                        info!("exit worker shutting down");
                        return;
                    }
                }
            }
        }
    });

    // === reconciliation worker ===
    let reconcile_gateway = gateway.clone();
    let reconcile_store = store.clone();
    let reconcile_watchdog_config = config.watchdog.clone();
    let reconcile_heartbeats = heartbeats.clone();
    let mut reconcile_shutdown = shutdown_rx.clone();
    let reconcile_handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(reconcile_watchdog_config.poll_interval_sec));
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let reconciler = Reconciler {
                        gateway: &reconcile_gateway,
                        store: &reconcile_store,
                        watchdog_config: &reconcile_watchdog_config,
                    };
                    reconciler.run_once().await;
                    reconcile_heartbeats.beat("reconcile");
                }
                _ = reconcile_shutdown.changed() => {
                    if *reconcile_shutdown.borrow() {
                        info!("reconciliation worker shutting down");
                        return;
                    }
                }
            }
        }
    });

    // === watchdog worker ===
    let watchdog_gateway = gateway.clone();
    let watchdog_store = store.clone();
    let watchdog_sink = sink.clone();
    let watchdog_heartbeats = heartbeats.clone();
    let watchdog_config = config.watchdog.clone();
    let mut watchdog_shutdown = shutdown_rx.clone();
    let watchdog_handle = tokio::spawn(async move {
        let sweep_interval = Duration::from_secs((watchdog_config.heartbeat_timeout_sec / 2).max(1));
        let mut ticker = tokio::time::interval(sweep_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let watchdog = Watchdog {
                        heartbeats: &watchdog_heartbeats,
                        gateway: &watchdog_gateway,
                        store: &watchdog_store,
                        sink: &watchdog_sink,
                        config: &watchdog_config,
                        watched_workers: vec!["entry", "exit", "reconcile"],
                    };
                    watchdog.sweep().await;
                }
                _ = watchdog_shutdown.changed() => {
                    if *watchdog_shutdown.borrow() {
                        info!("watchdog shutting down");
                        return;
                    }
                }
            }
        }
    });

    info!("position engine running. Press Ctrl+C to stop.");
    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);

    let _ = tokio::join!(ws_handle, entry_handle, exit_handle, reconcile_handle, watchdog_handle);
    info!("position engine shut down cleanly");
    Ok(())
}
