use chrono::Utc;
use reqwest::Client;
use serde::Deserialize;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

#[derive(Debug, Deserialize)]
struct ServerTime {
    #[serde(rename = "serverTime")]
    server_time: i64,
}

/// Network latency and time synchronization statistics from a one-shot
/// pre-flight check.
#[derive(Debug, Clone)]
pub struct NetworkStats {
    pub avg_latency_ms: f64,
    pub max_latency_ms: f64,
    pub min_latency_ms: f64,
    pub time_offset_ms: i64,
    pub samples: usize,
}

/// Checks time synchronization with Binance Futures API and holds a live,
/// atomically-updatable offset the exchange gateway re-syncs on `-1021`.
pub struct TimeSyncChecker {
    client: Client,
    base_url: String,
    max_time_offset_ms: i64,
    max_latency_ms: f64,
    ping_samples: usize,
    offset_ms: Arc<AtomicI64>,
}

impl TimeSyncChecker {
    pub fn new(base_url: String, max_time_offset_ms: i64, max_latency_ms: f64, ping_samples: usize) -> Self {
        Self {
            client: Client::new(),
            base_url,
            max_time_offset_ms,
            max_latency_ms,
            ping_samples,
            offset_ms: Arc::new(AtomicI64::new(0)),
        }
    }

    pub fn offset_handle(&self) -> Arc<AtomicI64> {
        self.offset_ms.clone()
    }

    /// Perform full network and time synchronization check.
    pub async fn check(&self) -> Result<NetworkStats, String> {
        info!("Starting Binance time synchronization check...");

        let rtt_stats = self.measure_rtt().await?;
        let time_offset = self.sync_offset().await?;

        let stats = NetworkStats {
            avg_latency_ms: rtt_stats.0,
            max_latency_ms: rtt_stats.1,
            min_latency_ms: rtt_stats.2,
            time_offset_ms: time_offset,
            samples: self.ping_samples,
        };

        if stats.time_offset_ms.abs() > self.max_time_offset_ms {
            error!("Time offset too large: {}ms (max: {}ms)", stats.time_offset_ms, self.max_time_offset_ms);
            return Err(format!(
                "Time offset {}ms exceeds maximum {}ms. Please sync your system clock.",
                stats.time_offset_ms, self.max_time_offset_ms
            ));
        }

        if stats.avg_latency_ms > self.max_latency_ms {
            warn!(
                "Average latency {}ms exceeds recommended maximum {}ms",
                stats.avg_latency_ms, self.max_latency_ms
            );
        }

        info!(
            "Time sync check passed: offset={}ms, avg_latency={:.2}ms, max_latency={:.2}ms",
            stats.time_offset_ms, stats.avg_latency_ms, stats.max_latency_ms
        );

        Ok(stats)
    }

    async fn measure_rtt(&self) -> Result<(f64, f64, f64), String> {
        let ping_url = format!("{}/fapi/v1/ping", self.base_url);
        let mut latencies = Vec::new();

        for i in 0..self.ping_samples {
            let start = Instant::now();
            match self.client.get(&ping_url).send().await {
                Ok(response) => {
                    if response.status().is_success() {
                        latencies.push(start.elapsed().as_secs_f64() * 1000.0);
                    } else {
                        warn!("Ping failed with status: {}", response.status());
                    }
                }
                Err(e) => {
                    error!("Ping request failed: {}", e);
                    return Err(format!("Failed to ping Binance API: {}", e));
                }
            }
            if i < self.ping_samples - 1 {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        }

        if latencies.is_empty() {
            return Err("No successful ping responses".to_string());
        }

        let avg = latencies.iter().sum::<f64>() / latencies.len() as f64;
        let max = latencies.iter().cloned().fold(f64::MIN, f64::max);
        let min = latencies.iter().cloned().fold(f64::MAX, f64::min);
        Ok((avg, max, min))
    }

    /// Fetch the server clock and update the shared offset. Returns the new
    /// offset in milliseconds (server - local).
    pub async fn sync_offset(&self) -> Result<i64, String> {
        let time_url = format!("{}/fapi/v1/time", self.base_url);
        let local_before = Utc::now().timestamp_millis();

        let response = self
            .client
            .get(&time_url)
            .send()
            .await
            .map_err(|e| format!("Failed to get server time: {}", e))?;
        let local_after = Utc::now().timestamp_millis();

        if !response.status().is_success() {
            return Err(format!("Server time request failed with status: {}", response.status()));
        }

        let server_time: ServerTime = response
            .json()
            .await
            .map_err(|e| format!("Failed to parse server time: {}", e))?;

        let local_estimate = (local_before + local_after) / 2;
        let offset = server_time.server_time - local_estimate;
        self.offset_ms.store(offset, Ordering::Relaxed);

        info!("Server time: {}, Local estimate: {}, Offset: {}ms", server_time.server_time, local_estimate, offset);
        Ok(offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offset_handle_shares_state() {
        let checker = TimeSyncChecker::new("https://fapi.binance.com".into(), 500, 15.0, 1);
        let handle = checker.offset_handle();
        handle.store(42, Ordering::Relaxed);
        assert_eq!(checker.offset_ms.load(Ordering::Relaxed), 42);
    }
}
