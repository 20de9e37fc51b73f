//! Index-level PE/PB aggregation from constituent fundamentals
//!
//! Two families are produced per trading day:
//!
//! - index-weighted (`weighted_*`): `Σ circ_mv·w / Σ (total_mv / multiple)·w`
//!   with `w` the published index weight as a fraction
//! - market-cap weighted (`equal_weight_*`): the same ratio with
//!   `w = total_mv / Σ total_mv` over the day's constituents
//!
//! A constituent whose multiple is null or not strictly positive is left out
//! of both numerator and denominator for that multiple.

use chrono::NaiveDate;
use hashbrown::{HashMap, HashSet};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::Result;
use crate::types::{Symbol, TradeDate};

/// One constituent's published weight in an index snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConstituentWeight {
    pub index_code: Symbol,
    pub con_code: Symbol,
    pub trade_date: TradeDate,
    /// Percent, summing to roughly 100 across a snapshot
    pub weight: f64,
}

/// Daily valuation fundamentals of one stock
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DailyFundamental {
    pub ts_code: Symbol,
    pub trade_date: TradeDate,
    pub close: Option<f64>,
    pub pe: Option<f64>,
    pub pe_ttm: Option<f64>,
    pub pb: Option<f64>,
    /// Total market value, ten-thousands CNY
    pub total_mv: Option<f64>,
    /// Circulating market value, ten-thousands CNY
    pub circ_mv: Option<f64>,
}

/// Listing reference data for one stock
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StockListing {
    pub ts_code: Symbol,
    pub name: String,
    /// `L` listed, `D` delisted, `P` suspended
    pub list_status: String,
    pub list_date: Option<TradeDate>,
    pub delist_date: Option<TradeDate>,
}

impl StockListing {
    /// Listed on or before `start` and not delisted before `end`
    pub fn is_active_between(&self, start: TradeDate, end: TradeDate) -> bool {
        self.list_date.map_or(false, |d| d <= start) && self.delist_date.map_or(true, |d| d >= end)
    }
}

/// Index valuation for one trading day
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexValuationSnapshot {
    pub index_code: Symbol,
    pub trade_date: TradeDate,
    pub weighted_pe: Option<f64>,
    pub weighted_pe_ttm: Option<f64>,
    pub weighted_pb: Option<f64>,
    pub equal_weight_pe: Option<f64>,
    pub equal_weight_pe_ttm: Option<f64>,
    pub equal_weight_pb: Option<f64>,
    pub valid_pe: usize,
    pub valid_pe_ttm: usize,
    pub valid_pb: usize,
    pub total_stocks: usize,
}

/// Reference data the aggregator reads
pub trait ValuationSource {
    /// Constituents of the most recent weight snapshot on or before `end`
    fn latest_weights(
        &self,
        index_code: &str,
        start: TradeDate,
        end: TradeDate,
    ) -> Result<Vec<ConstituentWeight>>;

    /// Stocks listed throughout `[start, end]`
    fn active_listings(&self, start: TradeDate, end: TradeDate) -> Result<Vec<StockListing>>;

    /// Fundamentals of `codes` with trade dates in `[start, end]`
    fn fundamentals_between(
        &self,
        codes: &[Symbol],
        start: TradeDate,
        end: TradeDate,
    ) -> Result<Vec<DailyFundamental>>;
}

#[derive(Debug, Default, Clone, Copy)]
struct Ratio {
    numerator: f64,
    denominator: f64,
    contributors: usize,
}

impl Ratio {
    fn add(&mut self, value: f64, total_mv: f64, multiple: Option<f64>, weight: f64) {
        let Some(m) = multiple.filter(|m| m.is_finite() && *m > 0.0) else {
            return;
        };
        self.numerator += value * weight;
        self.denominator += total_mv / m * weight;
        self.contributors += 1;
    }

    fn value(&self) -> Option<f64> {
        if self.denominator > 0.0 {
            Some(self.numerator / self.denominator).filter(|v| v.is_finite())
        } else {
            None
        }
    }
}

/// Aggregate one day's fundamentals. `members` pairs each constituent's
/// fundamentals with its index weight in percent. Returns `None` when no
/// constituent contributes to any multiple.
pub fn aggregate_day(
    index_code: &str,
    trade_date: TradeDate,
    members: &[(&DailyFundamental, f64)],
) -> Option<IndexValuationSnapshot> {
    let usable: Vec<(&DailyFundamental, f64, f64)> = members
        .iter()
        .filter_map(|&(f, weight)| {
            let total_mv = f.total_mv.filter(|mv| mv.is_finite() && *mv > 0.0)?;
            Some((f, weight, total_mv))
        })
        .collect();

    let mut weighted = [Ratio::default(); 3];
    for &(f, weight, total_mv) in &usable {
        let Some(circ_mv) = f.circ_mv.filter(|mv| mv.is_finite()) else {
            continue;
        };
        let w = weight / 100.0;
        for (ratio, multiple) in weighted.iter_mut().zip([f.pe, f.pe_ttm, f.pb]) {
            ratio.add(circ_mv, total_mv, multiple, w);
        }
    }

    let market_cap: f64 = usable.iter().map(|&(_, _, mv)| mv).sum();
    let mut cap_weighted = [Ratio::default(); 3];
    if market_cap > 0.0 {
        for &(f, _, total_mv) in &usable {
            let w = total_mv / market_cap;
            for (ratio, multiple) in cap_weighted.iter_mut().zip([f.pe, f.pe_ttm, f.pb]) {
                ratio.add(total_mv, total_mv, multiple, w);
            }
        }
    }

    let [pe, pe_ttm, pb] = weighted;
    let [eq_pe, eq_pe_ttm, eq_pb] = cap_weighted;
    let snapshot = IndexValuationSnapshot {
        index_code: index_code.to_string(),
        trade_date,
        weighted_pe: pe.value(),
        weighted_pe_ttm: pe_ttm.value(),
        weighted_pb: pb.value(),
        equal_weight_pe: eq_pe.value(),
        equal_weight_pe_ttm: eq_pe_ttm.value(),
        equal_weight_pb: eq_pb.value(),
        valid_pe: pe.contributors,
        valid_pe_ttm: pe_ttm.contributors,
        valid_pb: pb.contributors,
        total_stocks: members.len(),
    };

    let any = [
        snapshot.weighted_pe,
        snapshot.weighted_pe_ttm,
        snapshot.weighted_pb,
        snapshot.equal_weight_pe,
        snapshot.equal_weight_pe_ttm,
        snapshot.equal_weight_pb,
    ]
    .iter()
    .any(Option::is_some);

    if any {
        Some(snapshot)
    } else {
        debug!("{} {}: no contributing constituents", index_code, trade_date);
        None
    }
}

/// Computes index valuation snapshots over a date range
pub struct ValuationAggregator<'a, S: ValuationSource> {
    source: &'a S,
}

impl<'a, S: ValuationSource> ValuationAggregator<'a, S> {
    pub fn new(source: &'a S) -> Self {
        Self { source }
    }

    /// Constituents used for the whole range: non-zero weight in the latest
    /// snapshot and listed throughout the range. Returns `(code, weight%)`.
    pub fn constituents(
        &self,
        index_code: &str,
        start: TradeDate,
        end: TradeDate,
    ) -> Result<Vec<(Symbol, f64)>> {
        let active: HashSet<Symbol> = self
            .source
            .active_listings(start, end)?
            .into_iter()
            .filter(|l| l.is_active_between(start, end))
            .map(|l| l.ts_code)
            .collect();

        let mut seen = HashSet::new();
        let constituents: Vec<(Symbol, f64)> = self
            .source
            .latest_weights(index_code, start, end)?
            .into_iter()
            .filter(|w| w.weight.is_finite() && w.weight > 0.0)
            .filter(|w| active.contains(&w.con_code))
            .filter(|w| seen.insert(w.con_code.clone()))
            .map(|w| (w.con_code, w.weight))
            .collect();
        Ok(constituents)
    }

    /// One snapshot per trading day in `[start, end]` that has data
    pub fn aggregate(
        &self,
        index_code: &str,
        start: TradeDate,
        end: TradeDate,
    ) -> Result<Vec<IndexValuationSnapshot>> {
        if start > end {
            return Ok(Vec::new());
        }

        let constituents = self.constituents(index_code, start, end)?;
        if constituents.is_empty() {
            warn!(
                "{}: no constituents between {} and {}, skipping valuation",
                index_code, start, end
            );
            return Ok(Vec::new());
        }

        let weights: HashMap<&str, f64> = constituents
            .iter()
            .map(|(code, w)| (code.as_str(), *w))
            .collect();
        let codes: Vec<Symbol> = constituents.iter().map(|(c, _)| c.clone()).collect();
        let fundamentals = self.source.fundamentals_between(&codes, start, end)?;

        let mut by_date: BTreeMap<NaiveDate, Vec<(&DailyFundamental, f64)>> = BTreeMap::new();
        for f in &fundamentals {
            if let Some(&w) = weights.get(f.ts_code.as_str()) {
                by_date.entry(f.trade_date).or_default().push((f, w));
            }
        }

        let snapshots: Vec<IndexValuationSnapshot> = by_date
            .iter()
            .filter_map(|(&date, members)| aggregate_day(index_code, date, members))
            .collect();

        debug!(
            "{}: {} constituents, {} snapshots",
            index_code,
            constituents.len(),
            snapshots.len()
        );
        Ok(snapshots)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn d(day: u32) -> TradeDate {
        NaiveDate::from_ymd_opt(2024, 6, day).unwrap()
    }

    fn fundamental(code: &str, day: u32, mv: f64, pe: Option<f64>) -> DailyFundamental {
        DailyFundamental {
            ts_code: code.into(),
            trade_date: d(day),
            pe,
            pe_ttm: pe,
            pb: Some(1.0),
            total_mv: Some(mv),
            circ_mv: Some(mv),
            ..Default::default()
        }
    }

    #[test]
    fn test_weighted_pe_literal() {
        let a = fundamental("600000.SH", 3, 100.0, Some(10.0));
        let b = fundamental("000001.SZ", 3, 50.0, Some(20.0));
        let snap = aggregate_day("000300.SH", d(3), &[(&a, 60.0), (&b, 40.0)]).unwrap();

        assert_relative_eq!(snap.weighted_pe.unwrap(), 80.0 / 7.0, epsilon = 1e-12);
        assert_eq!(snap.valid_pe, 2);
        assert_eq!(snap.total_stocks, 2);
        // cap weights 2/3, 1/3: (100·2/3 + 50/3) / (10·2/3 + 2.5/3)
        assert_relative_eq!(snap.equal_weight_pe.unwrap(), 250.0 / 22.5, epsilon = 1e-12);
    }

    #[test]
    fn test_non_positive_pe_excluded() {
        let a = fundamental("600000.SH", 3, 100.0, Some(10.0));
        let b = fundamental("000001.SZ", 3, 50.0, Some(-5.0));
        let c = fundamental("000002.SZ", 3, 70.0, None);
        let snap = aggregate_day("000300.SH", d(3), &[(&a, 50.0), (&b, 30.0), (&c, 20.0)]).unwrap();

        // only the first constituent counts
        assert_relative_eq!(snap.weighted_pe.unwrap(), 10.0, epsilon = 1e-12);
        assert_relative_eq!(snap.equal_weight_pe.unwrap(), 10.0, epsilon = 1e-12);
        assert_eq!(snap.valid_pe, 1);
        assert_eq!(snap.valid_pb, 3);
        assert_eq!(snap.total_stocks, 3);
    }

    #[test]
    fn test_no_contributors_is_skipped() {
        let mut a = fundamental("600000.SH", 3, 100.0, None);
        a.pb = None;
        assert!(aggregate_day("000300.SH", d(3), &[(&a, 100.0)]).is_none());
        assert!(aggregate_day("000300.SH", d(3), &[]).is_none());
    }

    struct Fixture {
        weights: Vec<ConstituentWeight>,
        listings: Vec<StockListing>,
        fundamentals: Vec<DailyFundamental>,
    }

    impl ValuationSource for Fixture {
        fn latest_weights(&self, _: &str, _: TradeDate, _: TradeDate) -> Result<Vec<ConstituentWeight>> {
            Ok(self.weights.clone())
        }

        fn active_listings(&self, _: TradeDate, _: TradeDate) -> Result<Vec<StockListing>> {
            Ok(self.listings.clone())
        }

        fn fundamentals_between(
            &self,
            codes: &[Symbol],
            start: TradeDate,
            end: TradeDate,
        ) -> Result<Vec<DailyFundamental>> {
            Ok(self
                .fundamentals
                .iter()
                .filter(|f| codes.contains(&f.ts_code) && f.trade_date >= start && f.trade_date <= end)
                .cloned()
                .collect())
        }
    }

    fn listing(code: &str, listed: TradeDate, delisted: Option<TradeDate>) -> StockListing {
        StockListing {
            ts_code: code.into(),
            name: code.into(),
            list_status: (if delisted.is_some() { "D" } else { "L" }).into(),
            list_date: Some(listed),
            delist_date: delisted,
        }
    }

    fn weight(code: &str, w: f64) -> ConstituentWeight {
        ConstituentWeight {
            index_code: "000300.SH".into(),
            con_code: code.into(),
            trade_date: d(1),
            weight: w,
        }
    }

    #[test]
    fn test_aggregate_fixed_constituent_set() {
        let old = NaiveDate::from_ymd_opt(2010, 1, 4).unwrap();
        let fixture = Fixture {
            weights: vec![weight("A", 60.0), weight("B", 40.0), weight("C", 0.0), weight("D", 10.0)],
            listings: vec![
                listing("A", old, None),
                listing("B", old, None),
                listing("C", old, None),
                // delisted mid-range
                listing("D", old, Some(d(4))),
            ],
            fundamentals: vec![
                fundamental("A", 3, 100.0, Some(10.0)),
                fundamental("B", 3, 50.0, Some(20.0)),
                fundamental("D", 3, 500.0, Some(1.0)),
                fundamental("A", 4, 100.0, Some(10.0)),
                fundamental("A", 30, 100.0, Some(10.0)),
            ],
        };

        let aggregator = ValuationAggregator::new(&fixture);
        let codes: Vec<Symbol> = aggregator
            .constituents("000300.SH", d(3), d(10))
            .unwrap()
            .into_iter()
            .map(|(c, _)| c)
            .collect();
        assert_eq!(codes, vec!["A".to_string(), "B".to_string()]);

        let snaps = aggregator.aggregate("000300.SH", d(3), d(10)).unwrap();
        assert_eq!(snaps.len(), 2);
        assert_eq!(snaps[0].trade_date, d(3));
        assert_relative_eq!(snaps[0].weighted_pe.unwrap(), 80.0 / 7.0, epsilon = 1e-12);
        assert_eq!(snaps[1].total_stocks, 1);
        assert_relative_eq!(snaps[1].weighted_pe.unwrap(), 10.0, epsilon = 1e-12);

        assert!(aggregator.aggregate("000300.SH", d(10), d(3)).unwrap().is_empty());
    }
}
