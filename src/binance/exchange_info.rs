use reqwest::Client;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::HashMap;
use std::str::FromStr;
use tracing::{info, warn};

#[derive(Debug, Deserialize)]
struct ExchangeInfoResponse {
    symbols: Vec<SymbolData>,
}

#[derive(Debug, Clone, Deserialize)]
struct SymbolData {
    symbol: String,
    status: String,
    #[serde(rename = "baseAsset")]
    base_asset: String,
    #[serde(rename = "quoteAsset")]
    quote_asset: String,
    #[serde(default)]
    #[serde(rename = "quantityPrecision")]
    quantity_precision: u32,
    #[serde(default)]
    #[serde(rename = "pricePrecision")]
    price_precision: u32,
    filters: Vec<Filter>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "filterType")]
enum Filter {
    #[serde(rename = "PRICE_FILTER")]
    PriceFilter {
        #[serde(rename = "minPrice")]
        min_price: String,
        #[serde(rename = "maxPrice")]
        max_price: String,
        #[serde(rename = "tickSize")]
        tick_size: String,
    },
    #[serde(rename = "LOT_SIZE")]
    LotSize {
        #[serde(rename = "minQty")]
        min_qty: String,
        #[serde(rename = "maxQty")]
        max_qty: String,
        #[serde(rename = "stepSize")]
        step_size: String,
    },
    #[serde(rename = "MIN_NOTIONAL")]
    MinNotional {
        #[serde(rename = "notional")]
        notional: String,
    },
    #[serde(other)]
    Other,
}

/// Exchange-reported filters for a single tradable symbol. Floor/escalation
/// arithmetic lives in [`crate::precision::SymbolPrecisionRegistry`]; this
/// type is pure exchange-reported data.
#[derive(Debug, Clone)]
pub struct SymbolInfo {
    pub symbol: String,
    pub status: String,
    pub base_asset: String,
    pub quote_asset: String,
    pub tick_size: Decimal,
    pub min_price: Decimal,
    pub max_price: Decimal,
    pub step_size: Decimal,
    pub min_qty: Decimal,
    pub max_qty: Decimal,
    pub min_notional: Decimal,
    pub quantity_precision: u32,
    pub price_precision: u32,
}

/// Fetches and caches `/fapi/v1/exchangeInfo` symbol filters.
pub struct ExchangeInfoManager {
    client: Client,
    base_url: String,
    symbols: HashMap<String, SymbolInfo>,
}

impl ExchangeInfoManager {
    pub fn new(base_url: String) -> Self {
        Self {
            client: Client::new(),
            base_url,
            symbols: HashMap::new(),
        }
    }

    pub async fn sync(&mut self) -> Result<(), String> {
        let url = format!("{}/fapi/v1/exchangeInfo", self.base_url);
        info!("Fetching exchange info from {}...", url);

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| format!("Failed to fetch exchange info: {}", e))?;

        if !response.status().is_success() {
            return Err(format!(
                "Exchange info request failed with status: {}",
                response.status()
            ));
        }

        let exchange_info: ExchangeInfoResponse = response
            .json()
            .await
            .map_err(|e| format!("Failed to parse exchange info: {}", e))?;

        info!("Received exchange info for {} symbols", exchange_info.symbols.len());

        for symbol_data in exchange_info.symbols {
            if symbol_data.status != "TRADING" {
                continue;
            }
            let symbol_name = symbol_data.symbol.clone();
            match self.parse_symbol_info(symbol_data) {
                Ok(info) => {
                    self.symbols.insert(info.symbol.to_uppercase(), info);
                }
                Err(e) => {
                    warn!("Failed to parse symbol info for {}: {}", symbol_name, e);
                }
            }
        }

        info!("Exchange info sync completed: {} symbols loaded", self.symbols.len());
        Ok(())
    }

    fn parse_symbol_info(&self, data: SymbolData) -> Result<SymbolInfo, String> {
        let mut tick_size = None;
        let mut min_price = None;
        let mut max_price = None;
        let mut step_size = None;
        let mut min_qty = None;
        let mut max_qty = None;
        let mut min_notional = None;

        for filter in data.filters {
            match filter {
                Filter::PriceFilter { min_price: min, max_price: max, tick_size: tick } => {
                    tick_size = Some(Decimal::from_str(&tick).unwrap_or(Decimal::ZERO));
                    min_price = Some(Decimal::from_str(&min).unwrap_or(Decimal::ZERO));
                    max_price = Some(Decimal::from_str(&max).unwrap_or(Decimal::MAX));
                }
                Filter::LotSize { min_qty: min, max_qty: max, step_size: step } => {
                    step_size = Some(Decimal::from_str(&step).unwrap_or(Decimal::ZERO));
                    min_qty = Some(Decimal::from_str(&min).unwrap_or(Decimal::ZERO));
                    max_qty = Some(Decimal::from_str(&max).unwrap_or(Decimal::MAX));
                }
                Filter::MinNotional { notional } => {
                    min_notional = Some(Decimal::from_str(&notional).unwrap_or(Decimal::ZERO));
                }
                Filter::Other => {}
            }
        }

        Ok(SymbolInfo {
            symbol: data.symbol,
            status: data.status,
            base_asset: data.base_asset,
            quote_asset: data.quote_asset,
            tick_size: tick_size.ok_or("Missing price tick size")?,
            min_price: min_price.ok_or("Missing min price")?,
            max_price: max_price.ok_or("Missing max price")?,
            step_size: step_size.ok_or("Missing quantity step size")?,
            min_qty: min_qty.ok_or("Missing min quantity")?,
            max_qty: max_qty.ok_or("Missing max quantity")?,
            min_notional: min_notional.unwrap_or(Decimal::ZERO),
            quantity_precision: data.quantity_precision,
            price_precision: data.price_precision,
        })
    }

    pub fn get_symbol_info(&self, symbol: &str) -> Option<&SymbolInfo> {
        self.symbols.get(&symbol.to_uppercase())
    }

    pub fn has_symbol(&self, symbol: &str) -> bool {
        self.symbols.contains_key(&symbol.to_uppercase())
    }

    pub fn symbols(&self) -> &HashMap<String, SymbolInfo> {
        &self.symbols
    }

    /// Insert a statically-configured symbol (used when the live exchangeInfo
    /// sync hasn't run yet, e.g. tests or an offline default table).
    pub fn insert(&mut self, info: SymbolInfo) {
        self.symbols.insert(info.symbol.to_uppercase(), info);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_filters_into_symbol_info() {
        let mgr = ExchangeInfoManager::new("https://fapi.binance.com".into());
        let data = SymbolData {
            symbol: "BTCUSDT".into(),
            status: "TRADING".into(),
            base_asset: "BTC".into(),
            quote_asset: "USDT".into(),
            quantity_precision: 3,
            price_precision: 1,
            filters: vec![
                Filter::PriceFilter {
                    min_price: "100".into(),
                    max_price: "1000000".into(),
                    tick_size: "0.1".into(),
                },
                Filter::LotSize {
                    min_qty: "0.001".into(),
                    max_qty: "1000".into(),
                    step_size: "0.001".into(),
                },
                Filter::MinNotional { notional: "5".into() },
            ],
        };
        let info = mgr.parse_symbol_info(data).unwrap();
        assert_eq!(info.tick_size, Decimal::new(1, 1));
        assert_eq!(info.step_size, Decimal::new(1, 3));
        assert_eq!(info.min_notional, Decimal::from(5));
    }
}
