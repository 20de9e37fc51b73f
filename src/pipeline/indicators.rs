//! Technical indicator engine
//!
//! Turns a date-sorted series of [`PriceBar`]s into [`IndicatorRow`]s.
//! Look-back windows count present rows, not calendar days, so gaps in the
//! series are never interpolated.

use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::cross::CrossSignalMap;
use super::deviation::DeviationMap;
use super::factors::{
    BollingerBands, OnBalanceVolume, SimpleMovingAverage, Stochastic, WeightedMovingAverage, MACD,
    RSI,
};
use super::percentile::PercentileMap;
use crate::error::{AshareError, Result};
use crate::types::{is_strictly_ascending, PriceBar, TradeDate};

/// MACD spans
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MacdParams {
    pub fast: usize,
    pub slow: usize,
    pub signal: usize,
}

impl Default for MacdParams {
    fn default() -> Self {
        Self {
            fast: 12,
            slow: 26,
            signal: 9,
        }
    }
}

/// KDJ windows: raw %K look-back, K smoothing, D smoothing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdjParams {
    pub period: usize,
    pub k_smooth: usize,
    pub d_smooth: usize,
}

impl Default for KdjParams {
    fn default() -> Self {
        Self {
            period: 9,
            k_smooth: 3,
            d_smooth: 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BollingerParams {
    pub period: usize,
    pub num_std: f64,
}

impl Default for BollingerParams {
    fn default() -> Self {
        Self {
            period: 20,
            num_std: 2.0,
        }
    }
}

/// Which indicators to compute for a symbol kind
///
/// Optional indicators left out of a TOML table are disabled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndicatorConfig {
    pub ma_periods: Vec<usize>,
    #[serde(default)]
    pub wma_periods: Vec<usize>,
    #[serde(default)]
    pub macd: Option<MacdParams>,
    #[serde(default)]
    pub rsi_period: Option<usize>,
    #[serde(default)]
    pub kdj: Option<KdjParams>,
    #[serde(default)]
    pub bollinger: Option<BollingerParams>,
    #[serde(default)]
    pub obv: bool,
    /// (short, long) moving-average pairs checked for crosses
    #[serde(default)]
    pub ma_cross_pairs: Vec<(usize, usize)>,
    #[serde(default = "default_deviation_precision")]
    pub deviation_precision: u32,
}

fn default_deviation_precision() -> u32 {
    4
}

impl IndicatorConfig {
    /// Full profile used for indices
    pub fn index() -> Self {
        Self {
            ma_periods: vec![5, 10, 20, 50],
            wma_periods: vec![5, 10, 20, 50],
            macd: Some(MacdParams::default()),
            rsi_period: Some(14),
            kdj: Some(KdjParams::default()),
            bollinger: Some(BollingerParams::default()),
            obv: true,
            ma_cross_pairs: vec![(5, 10), (10, 20)],
            deviation_precision: default_deviation_precision(),
        }
    }

    /// Moving averages only, used for funds
    pub fn fund() -> Self {
        Self {
            ma_periods: vec![5, 10, 20, 60, 120],
            wma_periods: Vec::new(),
            macd: None,
            rsi_period: None,
            kdj: None,
            bollinger: None,
            obv: false,
            ma_cross_pairs: vec![(5, 10), (10, 20)],
            deviation_precision: default_deviation_precision(),
        }
    }

    /// Reject configurations that cannot produce meaningful output
    pub fn validate(&self) -> Result<()> {
        let bad = |msg: String| Err(AshareError::ConfigError(msg));

        if self.ma_periods.is_empty() {
            return bad("at least one MA period is required".into());
        }
        for &p in self.ma_periods.iter().chain(&self.wma_periods) {
            if p == 0 {
                return bad("moving-average period must be greater than 0".into());
            }
        }
        if let Some(m) = self.macd {
            if m.fast == 0 || m.slow == 0 || m.signal == 0 {
                return bad(format!("MACD spans must be positive: {:?}", m));
            }
            if m.fast >= m.slow {
                return bad(format!(
                    "MACD fast span {} must be below slow span {}",
                    m.fast, m.slow
                ));
            }
        }
        if self.rsi_period == Some(0) {
            return bad("RSI period must be greater than 0".into());
        }
        if let Some(k) = self.kdj {
            if k.period == 0 || k.k_smooth == 0 || k.d_smooth == 0 {
                return bad(format!("KDJ windows must be positive: {:?}", k));
            }
        }
        if let Some(b) = self.bollinger {
            if b.period == 0 || !b.num_std.is_finite() || b.num_std <= 0.0 {
                return bad(format!("invalid Bollinger parameters: {:?}", b));
            }
        }
        for &(short, long) in &self.ma_cross_pairs {
            if short >= long {
                return bad(format!("cross pair ({}, {}) must be short < long", short, long));
            }
            if !self.ma_periods.contains(&short) || !self.ma_periods.contains(&long) {
                return bad(format!(
                    "cross pair ({}, {}) uses a period that is not in ma_periods",
                    short, long
                ));
            }
        }
        if self.deviation_precision > 12 {
            return bad(format!(
                "deviation precision {} is too large",
                self.deviation_precision
            ));
        }
        Ok(())
    }

    /// Rows of history each enabled indicator needs before its first value
    pub fn required_rows(&self) -> Vec<(String, usize)> {
        let mut out: Vec<(String, usize)> = self
            .ma_periods
            .iter()
            .map(|&p| (format!("ma_{}", p), p))
            .chain(self.wma_periods.iter().map(|&p| (format!("wma_{}", p), p)))
            .collect();
        if let Some(m) = self.macd {
            out.push(("macd".into(), m.slow + m.signal - 1));
        }
        if let Some(p) = self.rsi_period {
            out.push(("rsi".into(), p + 1));
        }
        if let Some(k) = self.kdj {
            out.push(("kdj".into(), k.period + k.k_smooth + k.d_smooth - 2));
        }
        if let Some(b) = self.bollinger {
            out.push(("bollinger".into(), b.period));
        }
        out
    }
}

/// A price bar with its derived columns
#[derive(Debug, Clone, PartialEq, Default)]
pub struct IndicatorRow {
    pub bar: PriceBar,
    /// Simple moving averages keyed by period
    pub ma: BTreeMap<usize, Option<f64>>,
    /// Weighted moving averages keyed by period
    pub wma: BTreeMap<usize, Option<f64>>,
    pub macd: Option<f64>,
    pub macd_signal: Option<f64>,
    pub macd_histogram: Option<f64>,
    pub rsi: Option<f64>,
    pub kdj_k: Option<f64>,
    pub kdj_d: Option<f64>,
    pub kdj_j: Option<f64>,
    pub bb_upper: Option<f64>,
    pub bb_mid: Option<f64>,
    pub bb_lower: Option<f64>,
    pub obv: Option<f64>,
    /// Equal-weight PE-TTM of the index, joined from valuation snapshots
    pub pe_ttm: Option<f64>,
    /// Equal-weight PB of the index, joined from valuation snapshots
    pub pb: Option<f64>,
    pub deviation: DeviationMap,
    pub cross: CrossSignalMap,
    pub percentile: PercentileMap,
}

impl IndicatorRow {
    pub fn from_bar(bar: PriceBar) -> Self {
        Self {
            bar,
            ..Default::default()
        }
    }

    pub fn trade_date(&self) -> TradeDate {
        self.bar.trade_date
    }

    pub fn close(&self) -> f64 {
        self.bar.close
    }

    /// Moving average for a period, `None` when not configured or not yet defined
    pub fn ma(&self, period: usize) -> Option<f64> {
        self.ma.get(&period).copied().flatten()
    }

    pub fn wma(&self, period: usize) -> Option<f64> {
        self.wma.get(&period).copied().flatten()
    }
}

/// Computes moving averages and oscillators over a price series
#[derive(Debug, Clone)]
pub struct TechnicalIndicatorEngine {
    config: IndicatorConfig,
}

impl TechnicalIndicatorEngine {
    /// Build an engine; fails on an invalid configuration
    pub fn new(config: IndicatorConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &IndicatorConfig {
        &self.config
    }

    /// Compute indicator rows for `bars`, which must be sorted strictly
    /// ascending by trade date
    pub fn compute(&self, bars: &[PriceBar]) -> Result<Vec<IndicatorRow>> {
        if !is_strictly_ascending(bars) {
            return Err(AshareError::DataError(
                "bars must be strictly ascending by trade date".into(),
            ));
        }

        if let Some(first) = bars.first() {
            for (name, required) in self.config.required_rows() {
                if bars.len() < required {
                    let gap = AshareError::DataGap {
                        symbol: first.ts_code.clone(),
                        required,
                        available: bars.len(),
                    };
                    debug!("{} ({} stays null)", gap, name);
                }
            }
        }

        let closes: Vec<f64> = bars.iter().map(|b| b.close).collect();
        let mut rows: Vec<IndicatorRow> = bars.iter().cloned().map(IndicatorRow::from_bar).collect();

        for &period in &self.config.ma_periods {
            let values = SimpleMovingAverage::compute(period, &closes)?;
            for (row, v) in rows.iter_mut().zip(values) {
                row.ma.insert(period, v);
            }
        }

        for &period in &self.config.wma_periods {
            let values = WeightedMovingAverage::compute(period, &closes)?;
            for (row, v) in rows.iter_mut().zip(values) {
                row.wma.insert(period, v);
            }
        }

        if let Some(p) = self.config.macd {
            let mut macd = MACD::with_params(p.fast, p.slow, p.signal)?;
            for (row, &close) in rows.iter_mut().zip(&closes) {
                if let Some((line, signal, histogram)) = macd.update(close) {
                    row.macd = Some(line);
                    row.macd_signal = Some(signal);
                    row.macd_histogram = Some(histogram);
                }
            }
        }

        if let Some(period) = self.config.rsi_period {
            for (row, v) in rows.iter_mut().zip(RSI::compute(period, &closes)?) {
                row.rsi = v;
            }
        }

        if let Some(p) = self.config.kdj {
            let mut kdj = Stochastic::new(p.period, p.k_smooth, p.d_smooth)?;
            for row in rows.iter_mut() {
                if let Some((k, d, j)) = kdj.update(row.bar.high, row.bar.low, row.bar.close) {
                    row.kdj_k = Some(k);
                    row.kdj_d = Some(d);
                    row.kdj_j = Some(j);
                }
            }
        }

        if let Some(p) = self.config.bollinger {
            let mut bands = BollingerBands::new(p.period, p.num_std)?;
            for (row, &close) in rows.iter_mut().zip(&closes) {
                if let Some((upper, mid, lower)) = bands.update(close) {
                    row.bb_upper = Some(upper);
                    row.bb_mid = Some(mid);
                    row.bb_lower = Some(lower);
                }
            }
        }

        if self.config.obv {
            let mut obv = OnBalanceVolume::new();
            for row in rows.iter_mut() {
                // a missing volume leaves the running total unchanged
                row.obv = Some(obv.update(row.bar.close, row.bar.vol.unwrap_or(0.0)));
            }
        }

        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use chrono::{Duration, NaiveDate};

    fn bars(closes: &[f64]) -> Vec<PriceBar> {
        let start = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        closes
            .iter()
            .enumerate()
            .map(|(i, &c)| {
                PriceBar::new(
                    "000300.SH",
                    start + Duration::days(i as i64),
                    c,
                    c + 1.0,
                    c - 1.0,
                    c,
                    1000.0 + i as f64,
                )
            })
            .collect()
    }

    #[test]
    fn test_ma_leading_nulls() {
        let mut config = IndicatorConfig::fund();
        config.ma_periods = vec![3];
        config.ma_cross_pairs.clear();
        let engine = TechnicalIndicatorEngine::new(config).unwrap();

        let rows = engine.compute(&bars(&[1.0, 2.0, 3.0, 4.0, 5.0])).unwrap();
        let ma: Vec<Option<f64>> = rows.iter().map(|r| r.ma(3)).collect();
        assert_eq!(ma, vec![None, None, Some(2.0), Some(3.0), Some(4.0)]);
    }

    #[test]
    fn test_index_profile_first_defined_rows() {
        let closes: Vec<f64> = (0..80).map(|i| 3000.0 + (i as f64 * 0.7).sin() * 50.0).collect();
        let engine = TechnicalIndicatorEngine::new(IndicatorConfig::index()).unwrap();
        let rows = engine.compute(&bars(&closes)).unwrap();

        let first = |f: &dyn Fn(&IndicatorRow) -> Option<f64>| rows.iter().position(|r| f(r).is_some());
        assert_eq!(first(&|r| r.ma(50)), Some(49));
        assert_eq!(first(&|r| r.wma(5)), Some(4));
        assert_eq!(first(&|r| r.macd), Some(33));
        assert_eq!(first(&|r| r.macd_signal), Some(33));
        assert_eq!(first(&|r| r.rsi), Some(14));
        assert_eq!(first(&|r| r.kdj_j), Some(12));
        assert_eq!(first(&|r| r.bb_mid), Some(19));
        assert_eq!(first(&|r| r.obv), Some(0));

        for row in rows.iter().filter(|r| r.bb_mid.is_some()) {
            assert_relative_eq!(row.bb_mid.unwrap(), row.ma(20).unwrap(), epsilon = 1e-9);
            assert!(row.bb_upper.unwrap() >= row.bb_lower.unwrap());
        }
    }

    #[test]
    fn test_short_series_is_all_null_not_error() {
        let engine = TechnicalIndicatorEngine::new(IndicatorConfig::index()).unwrap();
        let rows = engine.compute(&bars(&[10.0, 11.0])).unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|r| r.ma(5).is_none() && r.macd.is_none()));
    }

    #[test]
    fn test_unsorted_input_rejected() {
        let engine = TechnicalIndicatorEngine::new(IndicatorConfig::fund()).unwrap();
        let mut input = bars(&[1.0, 2.0, 3.0]);
        input.swap(0, 2);
        assert!(engine.compute(&input).is_err());
    }

    #[test]
    fn test_validate() {
        assert!(IndicatorConfig::index().validate().is_ok());
        assert!(IndicatorConfig::fund().validate().is_ok());

        let mut config = IndicatorConfig::index();
        config.ma_periods.push(0);
        assert!(matches!(config.validate(), Err(AshareError::ConfigError(_))));

        let mut config = IndicatorConfig::index();
        config.macd = Some(MacdParams {
            fast: 26,
            slow: 12,
            signal: 9,
        });
        assert!(config.validate().is_err());

        let mut config = IndicatorConfig::index();
        config.ma_cross_pairs = vec![(5, 30)];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_from_toml() {
        let config: IndicatorConfig = toml::from_str(
            r#"
            ma_periods = [5, 10]
            ma_cross_pairs = [[5, 10]]
            rsi_period = 6
            "#,
        )
        .unwrap();
        assert_eq!(config.rsi_period, Some(6));
        assert_eq!(config.macd, None);
        assert_eq!(config.deviation_precision, 4);
        assert!(config.validate().is_ok());
    }
}
