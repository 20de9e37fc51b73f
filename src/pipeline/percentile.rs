//! Rolling historical percentile ranks
//!
//! Each metric is ranked against its own trailing window of rows. The
//! window expands from the start of the series until it holds `lookback`
//! rows and then slides. Ties count half, so the unique maximum of an
//! `n`-value window ranks `100 * (n - 0.5) / n`.

use log::debug;
use rayon::prelude::*;
use std::fmt;

use super::blob::{parse_period, BlobKey, KeyedMap, MaKey};
use super::indicators::{IndicatorConfig, IndicatorRow};
use super::round_to;
use crate::error::{AshareError, Result};

/// Metric a percentile is computed for
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PercentileKey {
    Amount,
    Vol,
    Macd,
    MacdHistogram,
    Rsi,
    PeTtm,
    Pb,
    /// A deviation-rate entry, `deviation_ma_<period>`
    Deviation(usize),
}

impl PercentileKey {
    /// Keys ranked for a symbol with the given indicator profile
    pub fn defaults_for(config: &IndicatorConfig, with_valuation: bool) -> Vec<PercentileKey> {
        let mut keys = vec![PercentileKey::Amount, PercentileKey::Vol];
        if config.macd.is_some() {
            keys.push(PercentileKey::Macd);
            keys.push(PercentileKey::MacdHistogram);
        }
        if config.rsi_period.is_some() {
            keys.push(PercentileKey::Rsi);
        }
        if with_valuation {
            keys.push(PercentileKey::PeTtm);
            keys.push(PercentileKey::Pb);
        }
        keys.extend(config.ma_periods.iter().map(|&p| PercentileKey::Deviation(p)));
        keys
    }

    /// Read this metric from a row
    pub fn value(&self, row: &IndicatorRow) -> Option<f64> {
        let v = match self {
            PercentileKey::Amount => row.bar.amount,
            PercentileKey::Vol => row.bar.vol,
            PercentileKey::Macd => row.macd,
            PercentileKey::MacdHistogram => row.macd_histogram,
            PercentileKey::Rsi => row.rsi,
            PercentileKey::PeTtm => row.pe_ttm,
            PercentileKey::Pb => row.pb,
            PercentileKey::Deviation(p) => row.deviation.get(&MaKey(*p)).copied(),
        };
        v.filter(|x| x.is_finite())
    }
}

impl BlobKey for PercentileKey {
    fn encode(&self) -> String {
        match self {
            PercentileKey::Amount => "amount".into(),
            PercentileKey::Vol => "vol".into(),
            PercentileKey::Macd => "macd".into(),
            PercentileKey::MacdHistogram => "macd_histogram".into(),
            PercentileKey::Rsi => "rsi".into(),
            PercentileKey::PeTtm => "pe_ttm".into(),
            PercentileKey::Pb => "pb".into(),
            PercentileKey::Deviation(p) => format!("deviation_ma_{}", p),
        }
    }

    fn decode(key: &str) -> Option<Self> {
        Some(match key {
            "amount" => PercentileKey::Amount,
            "vol" => PercentileKey::Vol,
            "macd" => PercentileKey::Macd,
            "macd_histogram" => PercentileKey::MacdHistogram,
            "rsi" => PercentileKey::Rsi,
            "pe_ttm" => PercentileKey::PeTtm,
            "pb" => PercentileKey::Pb,
            other => PercentileKey::Deviation(parse_period(other.strip_prefix("deviation_ma_")?)?),
        })
    }
}

impl fmt::Display for PercentileKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

pub type PercentileMap = KeyedMap<PercentileKey, f64>;

/// Split per-row values into one series for `key`. Deviation keys read the
/// decoded deviation map of each row.
pub fn demux(rows: &[IndicatorRow], key: PercentileKey) -> Vec<Option<f64>> {
    rows.iter().map(|row| key.value(row)).collect()
}

/// Rolling percentile of each value against the trailing `lookback` rows.
///
/// The denominator is the number of rows in the window, null rows included;
/// only non-null values are compared against. A value is null when it is
/// itself null or the window holds fewer than two non-null values.
pub fn rolling_percentile(values: &[Option<f64>], lookback: usize, precision: u32) -> Vec<Option<f64>> {
    let mut window: Vec<f64> = Vec::with_capacity(lookback.min(values.len()));
    let mut out = Vec::with_capacity(values.len());

    for (i, value) in values.iter().enumerate() {
        if let Some(v) = value.filter(|v| v.is_finite()) {
            let pos = window.partition_point(|x| *x < v);
            window.insert(pos, v);
        }
        if i >= lookback {
            if let Some(old) = values[i - lookback].filter(|v| v.is_finite()) {
                let pos = window.partition_point(|x| *x < old);
                window.remove(pos);
            }
        }

        let rank = match value.filter(|v| v.is_finite()) {
            Some(v) if window.len() >= 2 => {
                let below = window.partition_point(|x| *x < v);
                let equal = window.partition_point(|x| *x <= v) - below;
                let rows_in_window = (i + 1).min(lookback);
                let pct = (below as f64 + equal as f64 / 2.0) / rows_in_window as f64 * 100.0;
                Some(round_to(pct, precision))
            }
            _ => None,
        };
        out.push(rank);
    }
    out
}

/// Ranks configured metrics over a bounded trailing window
#[derive(Debug, Clone)]
pub struct PercentileRankEngine {
    lookback: usize,
    precision: u32,
}

impl PercentileRankEngine {
    pub fn new(lookback: usize, precision: u32) -> Result<Self> {
        if lookback < 2 {
            return Err(AshareError::ConfigError(format!(
                "percentile lookback must be at least 2 rows, got {}",
                lookback
            )));
        }
        Ok(Self { lookback, precision })
    }

    pub fn lookback(&self) -> usize {
        self.lookback
    }

    /// One map per row holding every key in `keys`
    pub fn compute(&self, rows: &[IndicatorRow], keys: &[PercentileKey]) -> Vec<PercentileMap> {
        let series: Vec<(PercentileKey, Vec<Option<f64>>)> = keys
            .par_iter()
            .map(|&key| {
                let values = demux(rows, key);
                (key, rolling_percentile(&values, self.lookback, self.precision))
            })
            .collect();

        if rows.len() < 2 {
            debug!("Percentiles need at least 2 rows, got {}", rows.len());
        }

        (0..rows.len())
            .map(|i| series.iter().map(|(key, ranks)| (*key, ranks[i])).collect())
            .collect()
    }

    /// Attach percentile maps to rows in place
    pub fn apply(&self, rows: &mut [IndicatorRow], keys: &[PercentileKey]) {
        let maps = self.compute(rows, keys);
        for (row, map) in rows.iter_mut().zip(maps) {
            row.percentile = map;
        }
    }
}

/// Coarse band a percentile falls in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PercentileLevel {
    ExtremelyHigh,
    High,
    UpperMiddle,
    Middle,
    LowerMiddle,
    Low,
    ExtremelyLow,
    Unknown,
}

impl PercentileLevel {
    pub fn classify(percentile: Option<f64>) -> Self {
        match percentile {
            None => PercentileLevel::Unknown,
            Some(p) if p.is_nan() => PercentileLevel::Unknown,
            Some(p) if p >= 90.0 => PercentileLevel::ExtremelyHigh,
            Some(p) if p >= 80.0 => PercentileLevel::High,
            Some(p) if p >= 60.0 => PercentileLevel::UpperMiddle,
            Some(p) if p >= 40.0 => PercentileLevel::Middle,
            Some(p) if p >= 20.0 => PercentileLevel::LowerMiddle,
            Some(p) if p >= 10.0 => PercentileLevel::Low,
            Some(_) => PercentileLevel::ExtremelyLow,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PercentileLevel::ExtremelyHigh => "extremely high",
            PercentileLevel::High => "high",
            PercentileLevel::UpperMiddle => "upper middle",
            PercentileLevel::Middle => "middle",
            PercentileLevel::LowerMiddle => "lower middle",
            PercentileLevel::Low => "low",
            PercentileLevel::ExtremelyLow => "extremely low",
            PercentileLevel::Unknown => "unknown",
        }
    }
}

impl fmt::Display for PercentileLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl serde::Serialize for PercentileLevel {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}
