//! Lifecycle event log, equity/drawdown snapshots, and deduplicated webhook
//! alerts.
//!
//! Every ENTRY/EXIT/TP1 event is appended to CSV and SQLite for durability,
//! balance snapshots feed an equity curve, and webhook alerts go out with a
//! TTL dedup map so a stuck condition doesn't spam the same alert forever.

use chrono::{DateTime, Utc};
use reqwest::Client;
use rust_decimal::Decimal;
use rusqlite::Connection;
use serde_json::json;
use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertLevel {
    Info,
    Warning,
    Critical,
}

#[derive(Debug, Clone)]
pub struct LifecycleEvent {
    pub ts: DateTime<Utc>,
    pub symbol: String,
    pub side: String,
    pub event_type: String,
    pub price: Decimal,
    pub qty: Decimal,
    pub entry_price: Decimal,
    pub pnl: Decimal,
    pub sl: Decimal,
    pub tp: Decimal,
    pub reason: String,
    pub source: String,
}

pub struct LifecycleSink {
    lifecycle_csv_path: String,
    equity_csv_path: String,
    db: Arc<Mutex<Connection>>,
    client: Client,
    webhook_url: Option<String>,
    alerts_enabled: bool,
    dedup_ttl: Duration,
    dedup: Mutex<HashMap<String, Instant>>,
    peak_equity: Mutex<Decimal>,
    dry_run: bool,
}

impl LifecycleSink {
    pub fn new(
        lifecycle_csv_path: String,
        equity_csv_path: String,
        db_path: String,
        webhook_url: Option<String>,
        alerts_enabled: bool,
        dedup_ttl_secs: u64,
        dry_run: bool,
    ) -> Self {
        let conn = Connection::open(&db_path).unwrap_or_else(|e| {
            error!("sink: failed to open SQLite database: {}", e);
            panic!("cannot continue without a lifecycle database");
        });
        if let Err(e) = conn.execute(
            "CREATE TABLE IF NOT EXISTS lifecycle_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                ts TEXT NOT NULL,
                symbol TEXT NOT NULL,
                side TEXT NOT NULL,
                event_type TEXT NOT NULL,
                price REAL NOT NULL,
                qty REAL NOT NULL,
                entry_price REAL NOT NULL,
                pnl REAL NOT NULL,
                sl REAL NOT NULL,
                tp REAL NOT NULL,
                reason TEXT NOT NULL,
                source TEXT NOT NULL
            )",
            [],
        ) {
            error!("sink: failed to create lifecycle_events table: {}", e);
            panic!("cannot continue without lifecycle schema");
        }

        Self {
            lifecycle_csv_path,
            equity_csv_path,
            db: Arc::new(Mutex::new(conn)),
            client: Client::new(),
            webhook_url,
            alerts_enabled,
            dedup_ttl: Duration::from_secs(dedup_ttl_secs),
            dedup: Mutex::new(HashMap::new()),
            peak_equity: Mutex::new(Decimal::ZERO),
            dry_run,
        }
    }

    pub fn record_lifecycle_event(&self, event: LifecycleEvent) {
        self.append_csv(&event);
        self.append_sqlite(&event);
    }

    fn append_csv(&self, event: &LifecycleEvent) {
        let is_new = !std::path::Path::new(&self.lifecycle_csv_path).exists();
        let file = OpenOptions::new().create(true).append(true).open(&self.lifecycle_csv_path);
        let mut file = match file {
            Ok(f) => f,
            Err(e) => {
                error!("sink: failed to open lifecycle csv: {}", e);
                return;
            }
        };
        if is_new {
            let _ = writeln!(file, "ts,symbol,side,event_type,price,qty,entry_price,pnl,sl,tp,reason,source");
        }
        let _ = writeln!(
            file,
            "{},{},{},{},{},{},{},{},{},{},{},{}",
            event.ts.to_rfc3339(),
            event.symbol,
            event.side,
            event.event_type,
            event.price,
            event.qty,
            event.entry_price,
            event.pnl,
            event.sl,
            event.tp,
            event.reason,
            event.source,
        );
    }

    fn append_sqlite(&self, event: &LifecycleEvent) {
        let conn = self.db.lock().expect("lifecycle db lock poisoned");
        let result = conn.execute(
            "INSERT INTO lifecycle_events (ts, symbol, side, event_type, price, qty, entry_price, pnl, sl, tp, reason, source)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            rusqlite::params![
                event.ts.to_rfc3339(),
                event.symbol,
                event.side,
                event.event_type,
                event.price.to_string(),
                event.qty.to_string(),
                event.entry_price.to_string(),
                event.pnl.to_string(),
                event.sl.to_string(),
                event.tp.to_string(),
                event.reason,
                event.source,
            ],
        );
        if let Err(e) = result {
            error!("sink: failed to insert lifecycle event into SQLite: {}", e);
        }
    }

    /// Snapshot mark-to-market equity; `drawdownPct` is relative to the
    /// running peak seen so far in this process's lifetime.
    pub fn snapshot_equity(&self, tag: &str, equity: Decimal) {
        let mut peak = self.peak_equity.lock().expect("peak equity lock poisoned");
        if equity > *peak {
            *peak = equity;
        }
        let drawdown_pct = if *peak > Decimal::ZERO {
            (equity - *peak) / *peak * Decimal::from(100)
        } else {
            Decimal::ZERO
        };
        drop(peak);

        let is_new = !std::path::Path::new(&self.equity_csv_path).exists();
        let file = OpenOptions::new().create(true).append(true).open(&self.equity_csv_path);
        match file {
            Ok(mut f) => {
                if is_new {
                    let _ = writeln!(f, "ts,tag,equity_usdt,drawdown_pct");
                }
                let _ = writeln!(f, "{},{},{},{}", Utc::now().to_rfc3339(), tag, equity, drawdown_pct);
            }
            Err(e) => error!("sink: failed to open equity csv: {}", e),
        }
    }

    /// Send an alert unless an identical dedup key was seen within the TTL.
    pub async fn alert(&self, level: AlertLevel, dedup_key: &str, message: &str) {
        if !self.alerts_enabled {
            return;
        }
        {
            let mut dedup = self.dedup.lock().expect("dedup lock poisoned");
            if let Some(last) = dedup.get(dedup_key) {
                if last.elapsed() < self.dedup_ttl {
                    return;
                }
            }
            dedup.insert(dedup_key.to_string(), Instant::now());
        }

        let prefixed = if self.dry_run { format!("(DRY) {}", message) } else { message.to_string() };
        info!(level = ?level, "alert: {}", prefixed);

        let Some(url) = &self.webhook_url else { return };
        let color = match level {
            AlertLevel::Info => 0x3498db,
            AlertLevel::Warning => 0xf1c40f,
            AlertLevel::Critical => 0xe74c3c,
        };
        let payload = json!({
            "embeds": [{
                "title": format!("{:?}", level),
                "description": prefixed,
                "color": color,
            }]
        });
        if let Err(e) = self.client.post(url).json(&payload).send().await {
            warn!("sink: failed to send webhook alert: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn temp_sink() -> LifecycleSink {
        let dir = std::env::temp_dir().join(format!("posengine-sink-test-{}-{:?}", std::process::id(), std::thread::current().id()));
        let _ = std::fs::create_dir_all(&dir);
        LifecycleSink::new(
            dir.join("lifecycle.csv").to_string_lossy().into(),
            dir.join("equity.csv").to_string_lossy().into(),
            dir.join("lifecycle.db").to_string_lossy().into(),
            None,
            true,
            60,
            true,
        )
    }

    #[test]
    fn equity_snapshot_tracks_peak_drawdown() {
        let sink = temp_sink();
        sink.snapshot_equity("exit", dec!(1000));
        sink.snapshot_equity("exit", dec!(900));
        let peak = *sink.peak_equity.lock().unwrap();
        assert_eq!(peak, dec!(1000));
    }

    #[tokio::test]
    async fn alert_dedup_suppresses_repeat_within_ttl() {
        let sink = temp_sink();
        sink.alert(AlertLevel::Warning, "k1", "first").await;
        let seen_before = sink.dedup.lock().unwrap().contains_key("k1");
        sink.alert(AlertLevel::Warning, "k1", "second").await;
        assert!(seen_before);
    }

    #[test]
    fn lifecycle_event_is_recorded() {
        let sink = temp_sink();
        sink.record_lifecycle_event(LifecycleEvent {
            ts: Utc::now(),
            symbol: "BTCUSDT".into(),
            side: "long".into(),
            event_type: "ENTRY".into(),
            price: dec!(100),
            qty: dec!(1),
            entry_price: dec!(100),
            pnl: dec!(0),
            sl: dec!(95),
            tp: dec!(110),
            reason: "".into(),
            source: "scalper".into(),
        });
        assert!(std::path::Path::new(&sink.lifecycle_csv_path).exists());
    }
}
