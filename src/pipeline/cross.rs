//! Golden/death cross detection and MACD histogram trend

use serde_json::Value;
use std::fmt;

use super::blob::{parse_period, BlobKey, BlobValue, KeyedMap};
use super::indicators::{IndicatorConfig, IndicatorRow};
use crate::types::TradeDate;

/// Signal recorded for one key on one row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CrossSignal {
    /// Short series moved from strictly below to strictly above
    GoldenCross,
    /// Short series moved from strictly above to strictly below
    DeathCross,
    /// Positive histogram that grew
    RedLonger,
    /// Positive histogram that did not grow
    RedShorter,
    /// Negative histogram that grew in magnitude
    GreenLonger,
    /// Negative histogram that did not grow in magnitude
    GreenShorter,
}

impl CrossSignal {
    pub fn as_str(&self) -> &'static str {
        match self {
            CrossSignal::GoldenCross => "golden_cross",
            CrossSignal::DeathCross => "death_cross",
            CrossSignal::RedLonger => "red_longer",
            CrossSignal::RedShorter => "red_shorter",
            CrossSignal::GreenLonger => "green_longer",
            CrossSignal::GreenShorter => "green_shorter",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "golden_cross" => Some(CrossSignal::GoldenCross),
            "death_cross" => Some(CrossSignal::DeathCross),
            "red_longer" => Some(CrossSignal::RedLonger),
            "red_shorter" => Some(CrossSignal::RedShorter),
            "green_longer" => Some(CrossSignal::GreenLonger),
            "green_shorter" => Some(CrossSignal::GreenShorter),
            _ => None,
        }
    }

    pub fn is_cross(&self) -> bool {
        matches!(self, CrossSignal::GoldenCross | CrossSignal::DeathCross)
    }
}

impl fmt::Display for CrossSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl BlobValue for CrossSignal {
    fn to_json(&self) -> Value {
        Value::String(self.as_str().to_string())
    }

    fn from_json(value: &Value) -> Option<Self> {
        value.as_str().and_then(CrossSignal::parse)
    }
}

/// Which pair of series a signal was computed from
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum CrossKey {
    /// `ma_<short>_<long>`
    Ma { short: usize, long: usize },
    /// MACD line against its signal line
    Macd,
    /// MACD histogram trend
    MacdHistTrend,
}

impl BlobKey for CrossKey {
    fn encode(&self) -> String {
        match self {
            CrossKey::Ma { short, long } => format!("ma_{}_{}", short, long),
            CrossKey::Macd => "macd".to_string(),
            CrossKey::MacdHistTrend => "macd_hist_trend".to_string(),
        }
    }

    fn decode(key: &str) -> Option<Self> {
        match key {
            "macd" => Some(CrossKey::Macd),
            "macd_hist_trend" => Some(CrossKey::MacdHistTrend),
            _ => {
                let (short, long) = key.strip_prefix("ma_")?.split_once('_')?;
                Some(CrossKey::Ma {
                    short: parse_period(short)?,
                    long: parse_period(long)?,
                })
            }
        }
    }
}

impl fmt::Display for CrossKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

pub type CrossSignalMap = KeyedMap<CrossKey, CrossSignal>;

/// Cross state from two consecutive differences. Both sides are strict, so
/// touching zero is never a cross.
pub fn classify_cross(prev_diff: f64, diff: f64) -> Option<CrossSignal> {
    if prev_diff < 0.0 && diff > 0.0 {
        Some(CrossSignal::GoldenCross)
    } else if prev_diff > 0.0 && diff < 0.0 {
        Some(CrossSignal::DeathCross)
    } else {
        None
    }
}

/// Histogram trend from two consecutive bars; null across a sign change or
/// when the bar did not change
pub fn classify_trend(prev: f64, current: f64) -> Option<CrossSignal> {
    let red = prev > 0.0 && current > 0.0;
    let green = prev < 0.0 && current < 0.0;
    match (red, green) {
        (true, _) if current > prev => Some(CrossSignal::RedLonger),
        (true, _) if current < prev => Some(CrossSignal::RedShorter),
        (_, true) if current < prev => Some(CrossSignal::GreenLonger),
        (_, true) if current > prev => Some(CrossSignal::GreenShorter),
        _ => None,
    }
}

/// Detects crosses between configured series pairs
#[derive(Debug, Clone)]
pub struct CrossSignalEngine {
    ma_pairs: Vec<(usize, usize)>,
}

impl CrossSignalEngine {
    pub fn new(ma_pairs: Vec<(usize, usize)>) -> Self {
        Self { ma_pairs }
    }

    pub fn from_config(config: &IndicatorConfig) -> Self {
        Self::new(config.ma_cross_pairs.clone())
    }

    /// Keys every emitted map carries. The MACD keys are always present and
    /// stay null for profiles without MACD.
    pub fn keys(&self) -> Vec<CrossKey> {
        self.ma_pairs
            .iter()
            .map(|&(short, long)| CrossKey::Ma { short, long })
            .chain([CrossKey::Macd, CrossKey::MacdHistTrend])
            .collect()
    }

    /// One map per row. Row 0 has no predecessor, so all its entries are null.
    pub fn detect(&self, rows: &[IndicatorRow]) -> Vec<CrossSignalMap> {
        let keys = self.keys();
        (0..rows.len())
            .map(|i| {
                keys.iter()
                    .map(|&key| {
                        let signal = if i == 0 {
                            None
                        } else {
                            self.signal_at(key, &rows[i - 1], &rows[i])
                        };
                        (key, signal)
                    })
                    .collect()
            })
            .collect()
    }

    /// Attach cross maps to rows in place
    pub fn apply(&self, rows: &mut [IndicatorRow]) {
        let maps = self.detect(rows);
        for (row, map) in rows.iter_mut().zip(maps) {
            row.cross = map;
        }
    }

    fn signal_at(&self, key: CrossKey, prev: &IndicatorRow, cur: &IndicatorRow) -> Option<CrossSignal> {
        let diff = |row: &IndicatorRow| -> Option<f64> {
            match key {
                CrossKey::Ma { short, long } => Some(row.ma(short)? - row.ma(long)?),
                CrossKey::Macd => Some(row.macd? - row.macd_signal?),
                CrossKey::MacdHistTrend => row.macd_histogram,
            }
        };
        let (p, c) = (diff(prev)?, diff(cur)?);
        match key {
            CrossKey::MacdHistTrend => classify_trend(p, c),
            _ => classify_cross(p, c),
        }
    }
}

/// Most recent row whose `key` entry equals `signal`, as
/// `(trade_date, rows_ago)` where the last row is 0 rows ago
pub fn find_latest_cross_date(
    rows: &[IndicatorRow],
    signal: CrossSignal,
    key: CrossKey,
) -> Option<(TradeDate, usize)> {
    let last = rows.len().checked_sub(1)?;
    rows.iter()
        .enumerate()
        .rev()
        .find(|(_, row)| row.cross.get(&key) == Some(&signal))
        .map(|(i, row)| (row.trade_date(), last - i))
}
