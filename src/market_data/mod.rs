pub mod binance_ws;
pub mod types;

pub use binance_ws::BinanceKlineStream;
pub use types::Candle;

/// Events published on the shared market-data broadcast channel. Closed
/// candles are the only variant; no trade/depth stream is consumed.
#[derive(Debug, Clone)]
pub enum MarketEvent {
    Candle(Candle),
}
