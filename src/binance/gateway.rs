//! Narrow typed surface over the Binance USDT-M futures REST API.
//!
//! No trading logic lives here: callers get typed requests/responses and a
//! tagged error; sizing, order sequencing and lifecycle tracking belong to
//! the position and entry/exit modules. Every mutating call respects
//! dry-run and resolves hedge-mode vs one-way positionSide handling before
//! it touches the wire.

use crate::binance::signing::build_signed_query;
use crate::binance::time_sync::TimeSyncChecker;
use async_trait::async_trait;
use chrono::Utc;
use reqwest::{Client, StatusCode};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::str::FromStr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum ExchangeError {
    #[error("transient error: {0}")]
    Transient(String),
    #[error("authentication error: {0}")]
    Auth(String),
    #[error("exchange rejected request: code={code} msg={msg}")]
    ExchangeReject { code: i64, msg: String },
    #[error("not found: {0}")]
    NotFound(String),
    #[error("network error: {0}")]
    Network(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    fn as_str(&self) -> &'static str {
        match self {
            OrderSide::Buy => "BUY",
            OrderSide::Sell => "SELL",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConditionalOrderType {
    StopMarket,
    TakeProfitMarket,
}

impl ConditionalOrderType {
    fn as_str(&self) -> &'static str {
        match self {
            ConditionalOrderType::StopMarket => "STOP_MARKET",
            ConditionalOrderType::TakeProfitMarket => "TAKE_PROFIT_MARKET",
        }
    }
}

#[derive(Debug, Clone)]
pub struct OrderAck {
    pub order_id: i64,
    pub status: String,
    pub executed_qty: Decimal,
    pub avg_price: Decimal,
}

#[derive(Debug, Clone, Copy)]
pub struct PositionModeInfo {
    pub hedge_mode: bool,
}

#[derive(Debug, Clone)]
pub struct BinancePosition {
    pub symbol: String,
    pub position_amt: Decimal,
    pub entry_price: Decimal,
}

#[derive(Debug, Clone)]
pub struct Candle {
    pub open_time_ms: i64,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
    pub closed: bool,
}

#[derive(Deserialize)]
struct RawApiError {
    code: i64,
    msg: String,
}

/// Errors whose Binance error code indicates the local clock has drifted
/// from the exchange's; the gateway re-syncs and retries once.
const TIMESTAMP_ERROR_CODE: i64 = -1021;

/// Credentials + signed-call configuration for the exchange gateway.
pub struct GatewayCredentials {
    pub api_key: String,
    pub api_secret: String,
}

/// The subset of the exchange surface the entry pipeline, exit controller
/// and reconciliation loop actually call, extracted so those modules can be
/// exercised against an in-memory mock instead of a live REST client.
#[async_trait]
pub trait Gateway: Send + Sync {
    async fn latest_price(&self, symbol: &str) -> Result<Option<Decimal>, ExchangeError>;
    async fn positions(&self, symbol: Option<&str>) -> Result<Vec<BinancePosition>, ExchangeError>;
    async fn position_mode(&self) -> Result<PositionModeInfo, ExchangeError>;
    async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<(), ExchangeError>;
    async fn place_market(
        &self,
        symbol: &str,
        side: OrderSide,
        qty: Decimal,
        position_side: Option<&str>,
        reduce_only: bool,
    ) -> Result<OrderAck, ExchangeError>;
    async fn place_conditional(
        &self,
        symbol: &str,
        side: OrderSide,
        order_type: ConditionalOrderType,
        stop_price: Decimal,
        position_side: Option<&str>,
        reduce_only: bool,
    ) -> Result<OrderAck, ExchangeError>;
    async fn get_order(&self, symbol: &str, order_id: i64) -> Result<OrderAck, ExchangeError>;
    async fn cancel_order(&self, symbol: &str, order_id: i64) -> Result<(), ExchangeError>;
}

pub struct ExchangeGateway {
    client: Client,
    base_url: String,
    credentials: Option<GatewayCredentials>,
    dry_run: bool,
    time_offset_ms: Arc<AtomicI64>,
    time_sync: TimeSyncChecker,
}

impl ExchangeGateway {
    pub fn new(base_url: String, credentials: Option<GatewayCredentials>, dry_run: bool, time_sync: TimeSyncChecker) -> Self {
        let time_offset_ms = time_sync.offset_handle();
        Self {
            client: Client::new(),
            base_url,
            credentials,
            dry_run,
            time_offset_ms,
            time_sync,
        }
    }

    fn now_ms(&self) -> i64 {
        Utc::now().timestamp_millis() + self.time_offset_ms.load(Ordering::Relaxed)
    }

    fn creds(&self) -> Result<&GatewayCredentials, ExchangeError> {
        self.credentials
            .as_ref()
            .ok_or_else(|| ExchangeError::Auth("no API credentials configured".into()))
    }

    async fn signed_get(&self, path: &str, params: &[(&str, String)]) -> Result<String, ExchangeError> {
        self.signed_call(reqwest::Method::GET, path, params).await
    }

    async fn signed_post(&self, path: &str, params: &[(&str, String)]) -> Result<String, ExchangeError> {
        self.signed_call(reqwest::Method::POST, path, params).await
    }

    async fn signed_delete(&self, path: &str, params: &[(&str, String)]) -> Result<String, ExchangeError> {
        self.signed_call(reqwest::Method::DELETE, path, params).await
    }

    async fn signed_call(&self, method: reqwest::Method, path: &str, params: &[(&str, String)]) -> Result<String, ExchangeError> {
        let creds = self.creds()?;
        let mut retried_after_resync = false;
        loop {
            let query = build_signed_query(params, &creds.api_secret, self.now_ms());
            let url = format!("{}{}?{}", self.base_url, path, query);
            let resp = self
                .client
                .request(method.clone(), &url)
                .header("X-MBX-APIKEY", &creds.api_key)
                .send()
                .await
                .map_err(|e| ExchangeError::Network(e.to_string()))?;

            let status = resp.status();
            let body = resp.text().await.map_err(|e| ExchangeError::Network(e.to_string()))?;

            if status.is_success() {
                return Ok(body);
            }

            if let Ok(err) = serde_json::from_str::<RawApiError>(&body) {
                if err.code == TIMESTAMP_ERROR_CODE && !retried_after_resync {
                    warn!("gateway: timestamp skew detected (code {}), resyncing clock and retrying", err.code);
                    self.time_sync
                        .sync_offset()
                        .await
                        .map_err(ExchangeError::Network)?;
                    retried_after_resync = true;
                    continue;
                }
                return Err(classify_rejection(status, err.code, err.msg));
            }

            return Err(classify_status(status, body));
        }
    }

    /// Latest mark/last price for a symbol, or `None` if unknown.
    pub async fn latest_price(&self, symbol: &str) -> Result<Option<Decimal>, ExchangeError> {
        let url = format!("{}/fapi/v1/ticker/price?symbol={}", self.base_url, symbol);
        let resp = self.client.get(&url).send().await.map_err(|e| ExchangeError::Network(e.to_string()))?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        #[derive(Deserialize)]
        struct Ticker {
            price: String,
        }
        let status = resp.status();
        let body = resp.text().await.map_err(|e| ExchangeError::Network(e.to_string()))?;
        if !status.is_success() {
            return Err(classify_status(status, body));
        }
        let t: Ticker = serde_json::from_str(&body).map_err(|e| ExchangeError::Network(e.to_string()))?;
        Ok(Decimal::from_str(&t.price).ok())
    }

    /// Most recent `limit` klines for `symbol` at the given interval.
    pub async fn recent_candles(&self, symbol: &str, interval: &str, limit: u32) -> Result<Vec<Candle>, ExchangeError> {
        let url = format!(
            "{}/fapi/v1/klines?symbol={}&interval={}&limit={}",
            self.base_url, symbol, interval, limit
        );
        let resp = self.client.get(&url).send().await.map_err(|e| ExchangeError::Network(e.to_string()))?;
        let status = resp.status();
        let body = resp.text().await.map_err(|e| ExchangeError::Network(e.to_string()))?;
        if !status.is_success() {
            return Err(classify_status(status, body));
        }
        let raw: Vec<Vec<serde_json::Value>> = serde_json::from_str(&body).map_err(|e| ExchangeError::Network(e.to_string()))?;
        Ok(raw
            .into_iter()
            .filter_map(|row| parse_kline_row(&row))
            .collect())
    }

    /// Open positions, optionally filtered to one symbol.
    pub async fn positions(&self, symbol: Option<&str>) -> Result<Vec<BinancePosition>, ExchangeError> {
        if self.dry_run {
            return Ok(Vec::new());
        }
        let mut params: Vec<(&str, String)> = Vec::new();
        if let Some(s) = symbol {
            params.push(("symbol", s.to_string()));
        }
        let body = self.signed_get("/fapi/v2/positionRisk", &params).await?;
        #[derive(Deserialize)]
        struct RawPosition {
            symbol: String,
            #[serde(rename = "positionAmt")]
            position_amt: String,
            #[serde(rename = "entryPrice")]
            entry_price: String,
        }
        let raw: Vec<RawPosition> = serde_json::from_str(&body).map_err(|e| ExchangeError::Network(e.to_string()))?;
        Ok(raw
            .into_iter()
            .filter_map(|p| {
                Some(BinancePosition {
                    symbol: p.symbol,
                    position_amt: Decimal::from_str(&p.position_amt).ok()?,
                    entry_price: Decimal::from_str(&p.entry_price).ok()?,
                })
            })
            .collect())
    }

    /// Whether the account trades in hedge (dual-side) mode. Conservative:
    /// assumes one-way mode if credentials are absent or the call fails.
    pub async fn position_mode(&self) -> Result<PositionModeInfo, ExchangeError> {
        if self.credentials.is_none() {
            return Ok(PositionModeInfo { hedge_mode: false });
        }
        #[derive(Deserialize)]
        struct Resp {
            #[serde(rename = "dualSidePosition")]
            dual_side_position: bool,
        }
        match self.signed_get("/fapi/v1/positionSide/dual", &[]).await {
            Ok(body) => {
                let r: Resp = serde_json::from_str(&body).map_err(|e| ExchangeError::Network(e.to_string()))?;
                Ok(PositionModeInfo { hedge_mode: r.dual_side_position })
            }
            Err(e) => {
                warn!("gateway: could not determine position mode, assuming one-way: {}", e);
                Ok(PositionModeInfo { hedge_mode: false })
            }
        }
    }

    pub async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<(), ExchangeError> {
        if self.dry_run {
            info!(symbol, leverage, "gateway: dry-run set_leverage");
            return Ok(());
        }
        let params = [("symbol", symbol.to_string()), ("leverage", leverage.to_string())];
        self.signed_post("/fapi/v1/leverage", &params).await?;
        Ok(())
    }

    /// Place a market order. If `position_side` is `Some`, the account is in
    /// hedge mode and the order carries `positionSide`; otherwise `reduceOnly`
    /// marks exit-only orders in one-way mode.
    pub async fn place_market(
        &self,
        symbol: &str,
        side: OrderSide,
        qty: Decimal,
        position_side: Option<&str>,
        reduce_only: bool,
    ) -> Result<OrderAck, ExchangeError> {
        if qty <= Decimal::ZERO {
            return Err(ExchangeError::ExchangeReject { code: -4003, msg: "quantity must be positive".into() });
        }
        if self.dry_run || self.credentials.is_none() {
            info!(symbol, side = side.as_str(), %qty, "gateway: dry-run place_market");
            return Ok(OrderAck {
                order_id: 0,
                status: "dry_run".into(),
                executed_qty: qty,
                avg_price: Decimal::ZERO,
            });
        }
        let mut params: Vec<(&str, String)> = vec![
            ("symbol", symbol.to_string()),
            ("side", side.as_str().to_string()),
            ("type", "MARKET".to_string()),
            ("quantity", qty.to_string()),
        ];
        if let Some(ps) = position_side {
            params.push(("positionSide", ps.to_string()));
        } else if reduce_only {
            params.push(("reduceOnly", "true".to_string()));
        }
        let body = self.signed_post("/fapi/v1/order", &params).await?;
        parse_order_ack(&body)
    }

    /// Attach a reduce-only `STOP_MARKET` or `TAKE_PROFIT_MARKET` order at
    /// `stop_price`, used to place the SL/TP legs of a position (entry
    /// pipeline step 13).
    pub async fn place_conditional(
        &self,
        symbol: &str,
        side: OrderSide,
        order_type: ConditionalOrderType,
        stop_price: Decimal,
        position_side: Option<&str>,
        reduce_only: bool,
    ) -> Result<OrderAck, ExchangeError> {
        if self.dry_run || self.credentials.is_none() {
            info!(symbol, side = side.as_str(), %stop_price, "gateway: dry-run place_conditional");
            return Ok(OrderAck { order_id: 0, status: "dry_run".into(), executed_qty: Decimal::ZERO, avg_price: Decimal::ZERO });
        }
        let mut params: Vec<(&str, String)> = vec![
            ("symbol", symbol.to_string()),
            ("side", side.as_str().to_string()),
            ("type", order_type.as_str().to_string()),
            ("stopPrice", stop_price.to_string()),
            ("closePosition", "true".to_string()),
        ];
        if let Some(ps) = position_side {
            params.push(("positionSide", ps.to_string()));
        } else if reduce_only {
            params.push(("reduceOnly", "true".to_string()));
        }
        let body = self.signed_post("/fapi/v1/order", &params).await?;
        parse_order_ack(&body)
    }

    pub async fn get_order(&self, symbol: &str, order_id: i64) -> Result<OrderAck, ExchangeError> {
        let params = [("symbol", symbol.to_string()), ("orderId", order_id.to_string())];
        let body = self.signed_get("/fapi/v1/order", &params).await?;
        parse_order_ack(&body)
    }

    pub async fn cancel_order(&self, symbol: &str, order_id: i64) -> Result<(), ExchangeError> {
        let params = [("symbol", symbol.to_string()), ("orderId", order_id.to_string())];
        self.signed_delete("/fapi/v1/order", &params).await?;
        Ok(())
    }

    pub async fn server_time(&self) -> Result<i64, ExchangeError> {
        self.time_sync.sync_offset().await.map_err(ExchangeError::Network)
    }

    pub async fn sync_time_offset(&self) -> Result<i64, ExchangeError> {
        self.server_time().await
    }

    pub async fn balance(&self, asset: &str) -> Result<Decimal, ExchangeError> {
        if self.dry_run || self.credentials.is_none() {
            return Ok(Decimal::ZERO);
        }
        #[derive(Deserialize)]
        struct RawBalance {
            asset: String,
            balance: String,
        }
        let body = self.signed_get("/fapi/v2/balance", &[]).await?;
        let raw: Vec<RawBalance> = serde_json::from_str(&body).map_err(|e| ExchangeError::Network(e.to_string()))?;
        raw.into_iter()
            .find(|b| b.asset == asset)
            .and_then(|b| Decimal::from_str(&b.balance).ok())
            .ok_or_else(|| ExchangeError::NotFound(format!("asset {} not found in balance response", asset)))
    }
}

#[async_trait]
impl Gateway for ExchangeGateway {
    async fn latest_price(&self, symbol: &str) -> Result<Option<Decimal>, ExchangeError> {
        ExchangeGateway::latest_price(self, symbol).await
    }

    async fn positions(&self, symbol: Option<&str>) -> Result<Vec<BinancePosition>, ExchangeError> {
        ExchangeGateway::positions(self, symbol).await
    }

    async fn position_mode(&self) -> Result<PositionModeInfo, ExchangeError> {
        ExchangeGateway::position_mode(self).await
    }

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<(), ExchangeError> {
        ExchangeGateway::set_leverage(self, symbol, leverage).await
    }

    async fn place_market(
        &self,
        symbol: &str,
        side: OrderSide,
        qty: Decimal,
        position_side: Option<&str>,
        reduce_only: bool,
    ) -> Result<OrderAck, ExchangeError> {
        ExchangeGateway::place_market(self, symbol, side, qty, position_side, reduce_only).await
    }

    async fn place_conditional(
        &self,
        symbol: &str,
        side: OrderSide,
        order_type: ConditionalOrderType,
        stop_price: Decimal,
        position_side: Option<&str>,
        reduce_only: bool,
    ) -> Result<OrderAck, ExchangeError> {
        ExchangeGateway::place_conditional(self, symbol, side, order_type, stop_price, position_side, reduce_only).await
    }

    async fn get_order(&self, symbol: &str, order_id: i64) -> Result<OrderAck, ExchangeError> {
        ExchangeGateway::get_order(self, symbol, order_id).await
    }

    async fn cancel_order(&self, symbol: &str, order_id: i64) -> Result<(), ExchangeError> {
        ExchangeGateway::cancel_order(self, symbol, order_id).await
    }
}

fn parse_kline_row(row: &[serde_json::Value]) -> Option<Candle> {
    Some(Candle {
        open_time_ms: row.first()?.as_i64()?,
        open: Decimal::from_str(row.get(1)?.as_str()?).ok()?,
        high: Decimal::from_str(row.get(2)?.as_str()?).ok()?,
        low: Decimal::from_str(row.get(3)?.as_str()?).ok()?,
        close: Decimal::from_str(row.get(4)?.as_str()?).ok()?,
        volume: Decimal::from_str(row.get(5)?.as_str()?).ok()?,
        closed: true,
    })
}

fn parse_order_ack(body: &str) -> Result<OrderAck, ExchangeError> {
    #[derive(Deserialize)]
    struct RawOrder {
        #[serde(rename = "orderId")]
        order_id: i64,
        status: String,
        #[serde(rename = "executedQty")]
        executed_qty: String,
        #[serde(rename = "avgPrice", default)]
        avg_price: Option<String>,
    }
    let raw: RawOrder = serde_json::from_str(body).map_err(|e| ExchangeError::Network(e.to_string()))?;
    Ok(OrderAck {
        order_id: raw.order_id,
        status: raw.status,
        executed_qty: Decimal::from_str(&raw.executed_qty).unwrap_or(Decimal::ZERO),
        avg_price: raw.avg_price.and_then(|s| Decimal::from_str(&s).ok()).unwrap_or(Decimal::ZERO),
    })
}

fn classify_rejection(status: StatusCode, code: i64, msg: String) -> ExchangeError {
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return ExchangeError::Auth(msg);
    }
    if status.as_u16() >= 500 {
        return ExchangeError::Transient(msg);
    }
    ExchangeError::ExchangeReject { code, msg }
}

fn classify_status(status: StatusCode, body: String) -> ExchangeError {
    match status {
        StatusCode::NOT_FOUND => ExchangeError::NotFound(body),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ExchangeError::Auth(body),
        s if s.as_u16() >= 500 => ExchangeError::Transient(body),
        s if s.as_u16() == 429 || s.as_u16() == 418 => ExchangeError::Transient(body),
        _ => ExchangeError::ExchangeReject { code: status.as_u16() as i64, msg: body },
    }
}
