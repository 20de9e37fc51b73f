//! # rusty-ashare
//!
//! Incremental sync of A-share index and fund daily bars with a technical
//! indicator pipeline, rolling percentile ranks and index valuation
//! aggregated from constituent fundamentals.
//!
//! ## Example
//!
//! ```rust,no_run
//! use rusty_ashare::prelude::*;
//!
//! fn main() -> Result<()> {
//!     let config = Config::load(None)?;
//!     let pipeline = Pipeline::new(config.indicators.index.clone(), 1250, 2, false)?;
//!
//!     let store = TimeSeriesStore::open(&config.database_path)?;
//!     let bars = store.load_bars("000300.SH", None, None)?;
//!     let rows = pipeline.run(&bars)?;
//!     if let Some(last) = rows.last() {
//!         println!("{} close {:.2} rsi {:?}", last.trade_date(), last.close(), last.rsi);
//!     }
//!     Ok(())
//! }
//! ```

pub mod calendar;
#[cfg(feature = "cli")]
pub mod chart;
pub mod config;
pub mod data;
pub mod error;
pub mod pipeline;
#[cfg(feature = "async")]
pub mod sync;
pub mod types;

pub mod prelude {
    //! Commonly used types and traits
    pub use crate::calendar::{ExchangeCalendar, TradingCalendar};
    pub use crate::config::{Config, SymbolSpec};
    pub use crate::data::MarketDataSource;
    #[cfg(feature = "rusqlite-support")]
    pub use crate::data::{PersistReport, TimeSeriesStore};
    #[cfg(feature = "async")]
    pub use crate::data::TushareClient;
    pub use crate::error::{AshareError, Result};
    pub use crate::pipeline::{
        CrossKey, CrossSignal, IndicatorConfig, IndicatorRow, PercentileKey, PercentileLevel,
        Pipeline,
    };
    #[cfg(feature = "async")]
    pub use crate::sync::{RunSummary, SyncOptions, SyncOrchestrator};
    pub use crate::types::*;
}
