//! Close-versus-moving-average deviation rates

use super::blob::{KeyedMap, MaKey};
use super::indicators::{IndicatorConfig, IndicatorRow};
use super::round_to;

/// Per-row `{ma_N: (close - ma_N) / ma_N}`
pub type DeviationMap = KeyedMap<MaKey, f64>;

/// Stateless per-row deviation calculator
#[derive(Debug, Clone)]
pub struct DeviationRateEngine {
    periods: Vec<usize>,
    precision: u32,
}

impl DeviationRateEngine {
    pub fn new(periods: Vec<usize>, precision: u32) -> Self {
        Self { periods, precision }
    }

    /// One deviation key per configured MA period
    pub fn from_config(config: &IndicatorConfig) -> Self {
        Self::new(config.ma_periods.clone(), config.deviation_precision)
    }

    pub fn periods(&self) -> &[usize] {
        &self.periods
    }

    /// Deviation map for one row. Every configured key is present; the value
    /// is null when the average is missing or zero.
    pub fn compute_row(&self, row: &IndicatorRow) -> DeviationMap {
        self.periods
            .iter()
            .map(|&period| {
                let ratio = row
                    .ma(period)
                    .filter(|&ma| ma != 0.0)
                    .map(|ma| (row.close() - ma) / ma)
                    .filter(|r| r.is_finite())
                    .map(|r| round_to(r, self.precision));
                (MaKey(period), ratio)
            })
            .collect()
    }

    pub fn compute(&self, rows: &[IndicatorRow]) -> Vec<DeviationMap> {
        rows.iter().map(|row| self.compute_row(row)).collect()
    }

    /// Attach deviation maps to rows in place
    pub fn apply(&self, rows: &mut [IndicatorRow]) {
        for row in rows.iter_mut() {
            row.deviation = self.compute_row(row);
        }
    }
}
