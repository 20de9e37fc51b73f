//! Indicator and valuation pipeline
//!
//! Stages run in a fixed order over one symbol's date-sorted series:
//! indicators, then deviation rates and cross signals (both read indicator
//! columns), then percentile ranks (read all of the above). Index valuation
//! is independent of the price series and is joined in by the sync layer.

pub mod blob;
pub mod cross;
pub mod deviation;
pub mod factors;
pub mod indicators;
pub mod percentile;
pub mod valuation;

pub use blob::{BlobKey, BlobValue, KeyedMap, MaKey, WmaKey};
pub use cross::{
    find_latest_cross_date, CrossKey, CrossSignal, CrossSignalEngine, CrossSignalMap,
};
pub use deviation::{DeviationMap, DeviationRateEngine};
pub use factors::{
    BollingerBands, ExponentialMovingAverage, OnBalanceVolume, SimpleMovingAverage, Stochastic,
    WeightedMovingAverage, MACD, RSI,
};
pub use indicators::{
    BollingerParams, IndicatorConfig, IndicatorRow, KdjParams, MacdParams,
    TechnicalIndicatorEngine,
};
pub use percentile::{
    demux, rolling_percentile, PercentileKey, PercentileLevel, PercentileMap,
    PercentileRankEngine,
};
pub use valuation::{
    aggregate_day, ConstituentWeight, DailyFundamental, IndexValuationSnapshot, StockListing,
    ValuationAggregator, ValuationSource,
};

use crate::error::Result;
use crate::types::PriceBar;

/// Round half away from zero to `precision` decimals
pub(crate) fn round_to(value: f64, precision: u32) -> f64 {
    let factor = 10f64.powi(precision as i32);
    (value * factor).round() / factor
}

/// All per-symbol stages wired together
#[derive(Debug, Clone)]
pub struct Pipeline {
    indicators: TechnicalIndicatorEngine,
    deviation: DeviationRateEngine,
    cross: CrossSignalEngine,
    percentile: PercentileRankEngine,
    percentile_keys: Vec<PercentileKey>,
}

impl Pipeline {
    /// Build the stage engines for one indicator profile. Fails before any
    /// I/O if the configuration is invalid.
    pub fn new(
        config: IndicatorConfig,
        lookback: usize,
        precision: u32,
        with_valuation: bool,
    ) -> Result<Self> {
        let percentile_keys = PercentileKey::defaults_for(&config, with_valuation);
        Ok(Self {
            deviation: DeviationRateEngine::from_config(&config),
            cross: CrossSignalEngine::from_config(&config),
            indicators: TechnicalIndicatorEngine::new(config)?,
            percentile: PercentileRankEngine::new(lookback, precision)?,
            percentile_keys,
        })
    }

    pub fn percentile_keys(&self) -> &[PercentileKey] {
        &self.percentile_keys
    }

    /// Run every stage over a strictly ascending bar series
    pub fn run(&self, bars: &[PriceBar]) -> Result<Vec<IndicatorRow>> {
        self.run_with_valuation(bars, &[])
    }

    /// Same as [`Pipeline::run`], with `(pe_ttm, pb)` supplied per bar.
    /// Bars past the end of `multiples` get no valuation.
    pub fn run_with_valuation(
        &self,
        bars: &[PriceBar],
        multiples: &[(Option<f64>, Option<f64>)],
    ) -> Result<Vec<IndicatorRow>> {
        let mut rows = self.indicators.compute(bars)?;
        for (row, &(pe_ttm, pb)) in rows.iter_mut().zip(multiples) {
            row.pe_ttm = pe_ttm;
            row.pb = pb;
        }
        self.deviation.apply(&mut rows);
        self.cross.apply(&mut rows);
        self.percentile.apply(&mut rows, &self.percentile_keys);
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_to() {
        assert_eq!(round_to(0.123456, 4), 0.1235);
        assert_eq!(round_to(-0.66666, 2), -0.67);
        assert_eq!(round_to(83.3333, 0), 83.0);
    }
}
