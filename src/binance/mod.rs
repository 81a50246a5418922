pub mod exchange_info;
pub mod gateway;
pub mod signing;
pub mod time_sync;

pub use exchange_info::{ExchangeInfoManager, SymbolInfo};
pub use gateway::{
    BinancePosition, ConditionalOrderType, ExchangeError, ExchangeGateway, Gateway, GatewayCredentials, OrderAck, OrderSide,
    PositionModeInfo,
};
pub use time_sync::{NetworkStats, TimeSyncChecker};
