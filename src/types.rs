//! Core types and constants

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{AshareError, Result};

/// Calendar date of a trading session
pub type TradeDate = NaiveDate;

/// Tushare-style security code, e.g. `000300.SH`
pub type Symbol = String;

/// Price type (using f64 for precision)
pub type Price = f64;

/// Wire format used by the upstream API for dates
pub const COMPACT_DATE_FORMAT: &str = "%Y%m%d";

/// Trading days per year used to turn lookback years into rows
pub const TRADING_DAYS_PER_YEAR: usize = 250;

/// Parse a `YYYYMMDD` date
pub fn parse_compact_date(s: &str) -> Result<TradeDate> {
    NaiveDate::parse_from_str(s.trim(), COMPACT_DATE_FORMAT)
        .map_err(|e| AshareError::ParseError(format!("Invalid date '{}': {}", s, e)))
}

/// Format a date as `YYYYMMDD`
pub fn format_compact_date(date: TradeDate) -> String {
    date.format(COMPACT_DATE_FORMAT).to_string()
}

/// What kind of instrument a symbol is; selects the upstream endpoint
/// and the indicator profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SymbolKind {
    Index,
    Fund,
    Stock,
}

impl SymbolKind {
    /// Upstream daily-bar endpoint name
    pub fn daily_api(&self) -> &'static str {
        match self {
            SymbolKind::Index => "index_daily",
            SymbolKind::Fund => "fund_daily",
            SymbolKind::Stock => "daily",
        }
    }
}

impl fmt::Display for SymbolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SymbolKind::Index => write!(f, "index"),
            SymbolKind::Fund => write!(f, "fund"),
            SymbolKind::Stock => write!(f, "stock"),
        }
    }
}

/// Exchange a code trades on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Exchange {
    /// Shanghai
    SSE,
    /// Shenzhen
    SZSE,
}

impl Exchange {
    /// Derive the exchange from a code suffix (`.SZ` is Shenzhen, everything
    /// else is treated as Shanghai)
    pub fn of_code(ts_code: &str) -> Self {
        if ts_code.ends_with("SZ") {
            Exchange::SZSE
        } else {
            Exchange::SSE
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Exchange::SSE => "SSE",
            Exchange::SZSE => "SZSE",
        }
    }
}

impl FromStr for Exchange {
    type Err = AshareError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "SSE" => Ok(Exchange::SSE),
            "SZSE" => Ok(Exchange::SZSE),
            other => Err(AshareError::ParseError(format!("Unknown exchange: {}", other))),
        }
    }
}

/// One trading day for one symbol
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PriceBar {
    pub ts_code: Symbol,
    pub trade_date: TradeDate,
    pub open: Price,
    pub high: Price,
    pub low: Price,
    pub close: Price,
    pub pre_close: Option<Price>,
    pub change: Option<f64>,
    pub pct_chg: Option<f64>,
    pub vol: Option<f64>,
    pub amount: Option<f64>,
}

impl PriceBar {
    /// Create a bar with only OHLC + volume populated
    pub fn new(
        ts_code: impl Into<Symbol>,
        trade_date: TradeDate,
        open: Price,
        high: Price,
        low: Price,
        close: Price,
        vol: f64,
    ) -> Self {
        Self {
            ts_code: ts_code.into(),
            trade_date,
            open,
            high,
            low,
            close,
            pre_close: None,
            change: None,
            pct_chg: None,
            vol: Some(vol),
            amount: None,
        }
    }
}

/// Sort bars ascending by date and drop duplicate dates, keeping the
/// last occurrence. Returns the number of duplicates dropped.
pub fn sort_and_dedup(bars: &mut Vec<PriceBar>) -> usize {
    let before = bars.len();
    // stable sort keeps insertion order among equal dates
    bars.sort_by_key(|b| b.trade_date);
    let mut out: Vec<PriceBar> = Vec::with_capacity(bars.len());
    for bar in bars.drain(..) {
        match out.last_mut() {
            Some(last) if last.trade_date == bar.trade_date => *last = bar,
            _ => out.push(bar),
        }
    }
    *bars = out;
    before - bars.len()
}

/// Check that dates are strictly increasing
pub fn is_strictly_ascending(bars: &[PriceBar]) -> bool {
    bars.windows(2).all(|w| w[0].trade_date < w[1].trade_date)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(y: i32, m: u32, day: u32) -> TradeDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[test]
    fn test_compact_date_round_trip() {
        let date = parse_compact_date("20240105").unwrap();
        assert_eq!(date, d(2024, 1, 5));
        assert_eq!(format_compact_date(date), "20240105");
        assert!(parse_compact_date("2024-01-05").is_err());
    }

    #[test]
    fn test_exchange_of_code() {
        assert_eq!(Exchange::of_code("399001.SZ"), Exchange::SZSE);
        assert_eq!(Exchange::of_code("000300.SH"), Exchange::SSE);
        assert_eq!("SZSE".parse::<Exchange>().unwrap(), Exchange::SZSE);
    }

    #[test]
    fn test_sort_and_dedup_keeps_latest() {
        let mut bars = vec![
            PriceBar::new("A", d(2024, 1, 3), 1.0, 1.0, 1.0, 3.0, 1.0),
            PriceBar::new("A", d(2024, 1, 2), 1.0, 1.0, 1.0, 2.0, 1.0),
            PriceBar::new("A", d(2024, 1, 3), 1.0, 1.0, 1.0, 3.5, 1.0),
        ];
        let dropped = sort_and_dedup(&mut bars);
        assert_eq!(dropped, 1);
        assert!(is_strictly_ascending(&bars));
        assert_eq!(bars[1].close, 3.5);
    }
}
