use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::str::FromStr;

/// A single closed candlestick. Only fully-closed candles (`k.x == true`
/// on the wire) become one of these; in-progress candles are dropped by the
/// stream consumer before reaching the rest of the system.
#[derive(Debug, Clone, PartialEq)]
pub struct Candle {
    pub symbol: String,
    pub open_time: DateTime<Utc>,
    pub close_time: DateTime<Utc>,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
}

/// Raw Binance kline stream message.
/// Stream: <symbol>@kline_<interval>
#[derive(Debug, Deserialize)]
pub struct BinanceKlineEvent {
    #[serde(rename = "e")]
    pub event_type: String,
    #[serde(rename = "s")]
    pub symbol: String,
    #[serde(rename = "k")]
    pub kline: BinanceKline,
}

#[derive(Debug, Deserialize)]
pub struct BinanceKline {
    #[serde(rename = "t")]
    pub open_time: i64,
    #[serde(rename = "T")]
    pub close_time: i64,
    #[serde(rename = "i")]
    pub interval: String,
    #[serde(rename = "o")]
    pub open: String,
    #[serde(rename = "h")]
    pub high: String,
    #[serde(rename = "l")]
    pub low: String,
    #[serde(rename = "c")]
    pub close: String,
    #[serde(rename = "v")]
    pub volume: String,
    /// Whether this kline is closed (final tick for its interval).
    #[serde(rename = "x")]
    pub is_closed: bool,
}

#[derive(Debug, Deserialize)]
pub struct BinanceCombinedStream {
    pub stream: String,
    pub data: serde_json::Value,
}

impl BinanceKlineEvent {
    /// Convert to a `Candle`, or `None` if the kline is still open or any
    /// numeric field fails to parse.
    pub fn into_closed_candle(self) -> Option<Candle> {
        if !self.kline.is_closed {
            return None;
        }
        Some(Candle {
            symbol: self.symbol.to_uppercase(),
            open_time: DateTime::from_timestamp_millis(self.kline.open_time)?,
            close_time: DateTime::from_timestamp_millis(self.kline.close_time)?,
            open: Decimal::from_str(&self.kline.open).ok()?,
            high: Decimal::from_str(&self.kline.high).ok()?,
            low: Decimal::from_str(&self.kline.low).ok()?,
            close: Decimal::from_str(&self.kline.close).ok()?,
            volume: Decimal::from_str(&self.kline.volume).ok()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(is_closed: bool) -> BinanceKlineEvent {
        BinanceKlineEvent {
            event_type: "kline".into(),
            symbol: "btcusdt".into(),
            kline: BinanceKline {
                open_time: 1_700_000_000_000,
                close_time: 1_700_000_299_999,
                interval: "5m".into(),
                open: "100.0".into(),
                high: "101.5".into(),
                low: "99.0".into(),
                close: "100.8".into(),
                volume: "12.34".into(),
                is_closed,
            },
        }
    }

    #[test]
    fn open_kline_is_dropped() {
        assert!(event(false).into_closed_candle().is_none());
    }

    #[test]
    fn closed_kline_converts_and_uppercases_symbol() {
        let candle = event(true).into_closed_candle().unwrap();
        assert_eq!(candle.symbol, "BTCUSDT");
        assert_eq!(candle.close, Decimal::from_str("100.8").unwrap());
    }
}
