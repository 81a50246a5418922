use crate::market_data::types::BinanceCombinedStream;
use crate::market_data::MarketEvent;
use futures_util::StreamExt;
use tokio::sync::broadcast;
use tokio::time::{Duration, Instant};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{error, info, warn};

/// Reconnect if the stream goes this long without delivering a message, even
/// if the socket itself never reports an error or close.
const SILENCE_TIMEOUT: Duration = Duration::from_secs(150);

/// Consumes closed-candle kline streams for a set of symbols and republishes
/// them on a broadcast channel. In-progress (unclosed) candles never reach
/// subscribers.
pub struct BinanceKlineStream {
    symbols: Vec<String>,
    interval: String,
    ws_base_url: String,
    tx: broadcast::Sender<MarketEvent>,
}

impl BinanceKlineStream {
    pub fn new(symbols: Vec<String>, interval: String, ws_base_url: String, tx: broadcast::Sender<MarketEvent>) -> Self {
        Self { symbols, interval, ws_base_url, tx }
    }

    fn build_url(&self) -> String {
        let streams: Vec<String> = self
            .symbols
            .iter()
            .map(|s| format!("{}@kline_{}", s.to_lowercase(), self.interval))
            .collect();
        format!("{}/stream?streams={}", self.ws_base_url, streams.join("/"))
    }

    pub async fn run(&self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        loop {
            let url = self.build_url();
            info!("Connecting to closed-candle stream: {}", url);

            match connect_async(&url).await {
                Ok((ws_stream, _response)) => {
                    info!("Connected to kline stream");
                    let (_write, mut read) = ws_stream.split();
                    let mut idle_timeout = Box::pin(tokio::time::sleep(SILENCE_TIMEOUT));

                    loop {
                        tokio::select! {
                            msg = read.next() => {
                                idle_timeout.as_mut().reset(Instant::now() + SILENCE_TIMEOUT);
                                match msg {
                                    Some(Ok(Message::Text(text))) => {
                                        self.handle_message(&text);
                                    }
                                    Some(Ok(Message::Ping(_))) => {}
                                    Some(Ok(Message::Close(_))) => {
                                        warn!("Kline stream closed by server");
                                        break;
                                    }
                                    Some(Err(e)) => {
                                        error!("Kline stream error: {}", e);
                                        break;
                                    }
                                    None => {
                                        warn!("Kline stream ended");
                                        break;
                                    }
                                    _ => {}
                                }
                            }
                            _ = &mut idle_timeout => {
                                warn!("Kline stream silent for {}s, reconnecting", SILENCE_TIMEOUT.as_secs());
                                break;
                            }
                            _ = shutdown.changed() => {
                                if *shutdown.borrow() {
                                    info!("Shutdown signal received, closing kline stream");
                                    return;
                                }
                            }
                        }
                    }
                }
                Err(e) => {
                    error!("Failed to connect to kline stream: {}", e);
                }
            }

            if *shutdown.borrow() {
                return;
            }

            warn!("Reconnecting to kline stream in 5 seconds...");
            tokio::time::sleep(tokio::time::Duration::from_secs(5)).await;
        }
    }

    fn handle_message(&self, text: &str) {
        let combined: BinanceCombinedStream = match serde_json::from_str(text) {
            Ok(c) => c,
            Err(e) => {
                warn!("Failed to parse combined stream: {}", e);
                return;
            }
        };

        if !combined.stream.contains("kline") {
            return;
        }

        let event: super::types::BinanceKlineEvent = match serde_json::from_value(combined.data) {
            Ok(e) => e,
            Err(e) => {
                warn!("Failed to parse kline event: {}", e);
                return;
            }
        };

        if let Some(candle) = event.into_closed_candle() {
            let _ = self.tx.send(MarketEvent::Candle(candle));
        }
    }
}
