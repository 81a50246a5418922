//! Heartbeat registry and the emergency flatten it triggers on worker death.
//!
//! Each long-running worker calls `beat()` after every loop iteration. A
//! missed heartbeat past `heartbeatTimeoutSec` means that worker's control
//! loop has wedged — the trailing-stop/exit logic it would have run is no
//! longer happening even though real money is still at risk. The response
//! is to flatten every open position through the exchange directly rather
//! than trust any further in-process state.

use crate::binance::gateway::{ExchangeGateway, OrderSide};
use crate::config::WatchdogConfig;
use crate::position::PositionStore;
use crate::sink::{AlertLevel, LifecycleSink};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{error, warn};

pub struct HeartbeatRegistry {
    inner: Mutex<HashMap<String, Instant>>,
}

impl HeartbeatRegistry {
    pub fn new() -> Self {
        Self { inner: Mutex::new(HashMap::new()) }
    }

    pub fn beat(&self, worker: &str) {
        self.inner.lock().expect("heartbeat lock poisoned").insert(worker.to_string(), Instant::now());
    }

    /// Workers that have never beaten, or whose last beat is older than `timeout`.
    fn stale(&self, expected: &[&str], timeout: Duration) -> Vec<String> {
        let table = self.inner.lock().expect("heartbeat lock poisoned");
        expected
            .iter()
            .filter(|w| table.get(**w).map(|t| t.elapsed() > timeout).unwrap_or(true))
            .map(|w| w.to_string())
            .collect()
    }
}

impl Default for HeartbeatRegistry {
    fn default() -> Self {
        Self::new()
    }
}

pub struct Watchdog<'a> {
    pub heartbeats: &'a HeartbeatRegistry,
    pub gateway: &'a ExchangeGateway,
    pub store: &'a PositionStore,
    pub sink: &'a LifecycleSink,
    pub config: &'a WatchdogConfig,
    pub watched_workers: Vec<&'static str>,
}

impl<'a> Watchdog<'a> {
    /// One sweep: if any watched worker is stale, flatten every open
    /// position directly via the exchange and alert critically. Does not
    /// rely on the exit controller, since the thing that might be wedged is
    /// exactly the loop the exit controller runs in.
    pub async fn sweep(&self) {
        let timeout = Duration::from_secs(self.config.heartbeat_timeout_sec);
        let stale = self.heartbeats.stale(&self.watched_workers, timeout);
        if stale.is_empty() {
            return;
        }

        error!(workers = ?stale, "watchdog: heartbeat timeout, flattening all positions");
        self.sink
            .alert(
                AlertLevel::Critical,
                "watchdog-flatten",
                &format!("watchdog: workers {:?} stopped heartbeating, force-flattening all positions", stale),
            )
            .await;

        self.flatten_all().await;
    }

    async fn flatten_all(&self) {
        for pos in self.store.all() {
            let exit_side = match pos.side {
                crate::position::Side::Long => OrderSide::Sell,
                crate::position::Side::Short => OrderSide::Buy,
            };
            let hedge = self.gateway.position_mode().await.map(|m| m.hedge_mode).unwrap_or(false);
            let position_side = hedge.then(|| match pos.side {
                crate::position::Side::Long => "LONG",
                crate::position::Side::Short => "SHORT",
            });
            match self.gateway.place_market(&pos.symbol, exit_side, pos.size, position_side, !hedge).await {
                Ok(_) => {
                    warn!(symbol = %pos.symbol, "watchdog: flatten order submitted");
                    self.store.close(&pos.symbol, pos.side);
                }
                Err(e) => error!(symbol = %pos.symbol, "watchdog: flatten order failed: {}", e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stale_reports_workers_with_no_heartbeat() {
        let reg = HeartbeatRegistry::new();
        reg.beat("entry");
        let stale = reg.stale(&["entry", "exit"], Duration::from_secs(60));
        assert_eq!(stale, vec!["exit".to_string()]);
    }

    #[test]
    fn beat_clears_staleness() {
        let reg = HeartbeatRegistry::new();
        reg.beat("exit");
        let stale = reg.stale(&["exit"], Duration::from_secs(60));
        assert!(stale.is_empty());
    }
}
