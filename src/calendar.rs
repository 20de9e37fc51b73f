//! Exchange trading calendars

use crate::types::{Exchange, PriceBar};
use chrono::{Datelike, NaiveDate, Utc, Weekday};
use log::debug;
use std::collections::BTreeSet;

pub trait TradingCalendar: Send + Sync {
    fn is_trading_day(&self, date: NaiveDate) -> bool;
}

/// Shanghai or Shenzhen calendar built from the exchange's published open days
///
/// Dates inside the covered range are trading days only if published as
/// open. Outside it the calendar falls back to Monday-Friday.
#[derive(Debug, Clone)]
pub struct ExchangeCalendar {
    exchange: Exchange,
    open_days: BTreeSet<NaiveDate>,
    covered: Option<(NaiveDate, NaiveDate)>,
}

impl ExchangeCalendar {
    /// Calendar with no published days
    pub fn new(exchange: Exchange) -> Self {
        Self {
            exchange,
            open_days: BTreeSet::new(),
            covered: None,
        }
    }

    /// Calendar covering `[start, end]` where `open_days` are the sessions
    pub fn from_open_days(
        exchange: Exchange,
        start: NaiveDate,
        end: NaiveDate,
        open_days: impl IntoIterator<Item = NaiveDate>,
    ) -> Self {
        let open_days: BTreeSet<NaiveDate> = open_days
            .into_iter()
            .filter(|d| *d >= start && *d <= end)
            .collect();
        Self {
            exchange,
            open_days,
            covered: (start <= end).then_some((start, end)),
        }
    }

    /// Whether no published days are known
    pub fn is_empty(&self) -> bool {
        self.open_days.is_empty()
    }

    /// Drop bars that fall on non-trading days. Without published days the
    /// bars are returned unchanged.
    pub fn filter_bars(&self, bars: Vec<PriceBar>) -> Vec<PriceBar> {
        if self.is_empty() {
            return bars;
        }
        let before = bars.len();
        let kept: Vec<PriceBar> = bars
            .into_iter()
            .filter(|b| self.is_trading_day(b.trade_date))
            .collect();
        if kept.len() < before {
            debug!(
                "{} calendar dropped {} non-trading bars",
                self.exchange.as_str(),
                before - kept.len()
            );
        }
        kept
    }

    fn is_weekend(date: NaiveDate) -> bool {
        matches!(date.weekday(), Weekday::Sat | Weekday::Sun)
    }
}

impl TradingCalendar for ExchangeCalendar {
    fn is_trading_day(&self, date: NaiveDate) -> bool {
        match self.covered {
            Some((start, end)) if date >= start && date <= end => self.open_days.contains(&date),
            _ => !Self::is_weekend(date),
        }
    }
}

/// Current calendar date at the exchanges
pub fn today_in_shanghai() -> NaiveDate {
    Utc::now().with_timezone(&chrono_tz::Asia::Shanghai).date_naive()
}
