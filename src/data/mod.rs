//! External collaborators: the upstream market-data API and the local store

#[cfg(feature = "rusqlite-support")]
pub mod store;
#[cfg(feature = "async")]
pub mod tushare;

#[cfg(feature = "rusqlite-support")]
pub use store::{PersistReport, TimeSeriesStore};
#[cfg(feature = "async")]
pub use tushare::TushareClient;

use crate::error::Result;
use crate::pipeline::{ConstituentWeight, DailyFundamental, StockListing};
use crate::types::{Exchange, PriceBar, SymbolKind, TradeDate};
use std::future::Future;

/// Upstream provider of daily bars and reference data
pub trait MarketDataSource: Send + Sync {
    /// Daily bars of one symbol in `[start, end]`, any order
    fn fetch_daily(
        &self,
        kind: SymbolKind,
        ts_code: &str,
        start: TradeDate,
        end: TradeDate,
    ) -> impl Future<Output = Result<Vec<PriceBar>>> + Send;

    /// Open sessions of an exchange in `[start, end]`
    fn fetch_trade_calendar(
        &self,
        exchange: Exchange,
        start: TradeDate,
        end: TradeDate,
    ) -> impl Future<Output = Result<Vec<TradeDate>>> + Send;

    /// Daily valuation fundamentals of one stock in `[start, end]`
    fn fetch_daily_basic(
        &self,
        ts_code: &str,
        start: TradeDate,
        end: TradeDate,
    ) -> impl Future<Output = Result<Vec<DailyFundamental>>> + Send;

    /// Constituent weight snapshots of an index published in `[start, end]`
    fn fetch_index_weight(
        &self,
        index_code: &str,
        start: TradeDate,
        end: TradeDate,
    ) -> impl Future<Output = Result<Vec<ConstituentWeight>>> + Send;

    /// Stock listings with a given status (`L`, `D` or `P`)
    fn fetch_stock_basic(
        &self,
        list_status: &str,
    ) -> impl Future<Output = Result<Vec<StockListing>>> + Send;
}
