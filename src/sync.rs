//! Sync orchestration
//!
//! One sync cycle refreshes reference data (listings, index weights,
//! constituent fundamentals) and then every configured symbol. Symbols run
//! concurrently on a bounded pool; inside a symbol the stages run strictly
//! in order over the full date-sorted series. A failing symbol is logged and
//! counted and the run moves on.

use chrono::{Datelike, Duration as ChronoDuration, NaiveDate};
use hashbrown::{HashMap, HashSet};
use log::{debug, error, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::calendar::{today_in_shanghai, ExchangeCalendar};
use crate::config::{Config, SymbolSpec};
use crate::data::{MarketDataSource, PersistReport, TimeSeriesStore};
use crate::error::{AshareError, Result};
use crate::pipeline::{
    ConstituentWeight, IndexValuationSnapshot, Pipeline, ValuationAggregator, ValuationSource,
};
use crate::types::{sort_and_dedup, Exchange, PriceBar, SymbolKind, TradeDate};

/// Listing statuses fetched during reference sync
const LISTING_STATUSES: [&str; 3] = ["L", "D", "P"];

/// What to sync in one run
#[derive(Debug, Clone, Default)]
pub struct SyncOptions {
    /// Skip reference data and sync only the configured symbols
    pub index_only: bool,
    /// Re-sync from this date when it is earlier than the incremental start
    pub start_date: Option<TradeDate>,
    /// Last date to sync, today in Shanghai when `None`
    pub end_date: Option<TradeDate>,
    /// Restrict the run to these codes
    pub symbols: Option<Vec<String>>,
}

/// Result of one symbol's sync
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SymbolOutcome {
    pub ts_code: String,
    pub new_bars: usize,
    pub rows_written: usize,
    pub rows_failed: usize,
    pub valuation_days: usize,
}

/// Reference data counts for one run
#[derive(Debug, Clone, Default)]
pub struct ReferenceSummary {
    pub listings: usize,
    pub weights: usize,
    pub fundamentals: usize,
    /// Rows of any reference table that failed to persist
    pub rows_failed: usize,
    pub failures: Vec<(String, String)>,
}

/// Summary of a whole sync run
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: Vec<(String, String)>,
    pub rows_written: usize,
    pub rows_failed: usize,
    pub symbols: Vec<SymbolOutcome>,
    pub reference: Option<ReferenceSummary>,
}

impl RunSummary {
    fn record(&mut self, ts_code: &str, outcome: &Result<SymbolOutcome>) {
        match outcome {
            Ok(o) => {
                self.succeeded += 1;
                self.rows_written += o.rows_written;
                self.rows_failed += o.rows_failed;
                self.symbols.push(o.clone());
            }
            Err(e) => self.failed.push((ts_code.to_string(), e.to_string())),
        }
    }
}

/// Month-aligned `[start, end]` ranges covering `[from, to]`
pub fn month_ranges(from: NaiveDate, to: NaiveDate) -> Vec<(NaiveDate, NaiveDate)> {
    let mut out = Vec::new();
    let mut cursor = from;
    while cursor <= to {
        let next_month = if cursor.month() == 12 {
            NaiveDate::from_ymd_opt(cursor.year() + 1, 1, 1)
        } else {
            NaiveDate::from_ymd_opt(cursor.year(), cursor.month() + 1, 1)
        };
        let Some(next_month) = next_month else { break };
        let month_end = (next_month - ChronoDuration::days(1)).min(to);
        out.push((cursor, month_end));
        cursor = next_month;
    }
    out
}

/// Keep the first row per constituent and snapshot month
fn dedup_monthly_weights(weights: Vec<ConstituentWeight>) -> Vec<ConstituentWeight> {
    let mut seen = HashSet::new();
    weights
        .into_iter()
        .filter(|w| {
            seen.insert((
                w.con_code.clone(),
                w.trade_date.year(),
                w.trade_date.month(),
            ))
        })
        .collect()
}

/// Join stored valuation snapshots into the bar series as `(pe_ttm, pb)`
fn valuation_multiples(
    bars: &[PriceBar],
    snapshots: &[IndexValuationSnapshot],
) -> Vec<(Option<f64>, Option<f64>)> {
    let by_date: HashMap<TradeDate, &IndexValuationSnapshot> =
        snapshots.iter().map(|s| (s.trade_date, s)).collect();
    bars.iter()
        .map(|b| match by_date.get(&b.trade_date) {
            Some(s) => (s.equal_weight_pe_ttm, s.equal_weight_pb),
            None => (None, None),
        })
        .collect()
}

/// Run a store operation on the blocking pool; SQLite calls stay off the
/// async workers
async fn on_blocking_pool<T, F>(store: &Arc<TimeSeriesStore>, op: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce(&TimeSeriesStore) -> Result<T> + Send + 'static,
{
    let store = Arc::clone(store);
    tokio::task::spawn_blocking(move || op(&store))
        .await
        .map_err(|e| AshareError::DataError(format!("store task failed: {}", e)))?
}

/// Compute every stage over the full series and persist rows from `start`
fn compute_and_persist(
    store: &TimeSeriesStore,
    pipeline: &Pipeline,
    spec: &SymbolSpec,
    bars: Vec<PriceBar>,
    start: TradeDate,
    end: TradeDate,
) -> Result<(PersistReport, usize)> {
    let mut valuation_days = 0;
    let rows = if spec.with_valuation {
        let snapshots = ValuationAggregator::new(store).aggregate(&spec.ts_code, start, end)?;
        valuation_days = snapshots.len();
        let report = store.upsert_valuations(&snapshots)?;
        if report.failed > 0 {
            warn!(
                "{}: {} valuation snapshots failed to persist",
                spec.ts_code, report.failed
            );
        }
        let stored = store.load_valuations(&spec.ts_code, None, None)?;
        pipeline.run_with_valuation(&bars, &valuation_multiples(&bars, &stored))?
    } else {
        pipeline.run(&bars)?
    };

    let fresh: Vec<_> = rows.into_iter().filter(|r| r.trade_date() >= start).collect();
    let report = store.upsert_rows(&fresh)?;
    Ok((report, valuation_days))
}

/// Runs sync cycles against an upstream provider and the local store
pub struct SyncOrchestrator<P: MarketDataSource + 'static> {
    config: Arc<Config>,
    provider: Arc<P>,
    store: Arc<TimeSeriesStore>,
}

impl<P: MarketDataSource + 'static> Clone for SyncOrchestrator<P> {
    fn clone(&self) -> Self {
        Self {
            config: Arc::clone(&self.config),
            provider: Arc::clone(&self.provider),
            store: Arc::clone(&self.store),
        }
    }
}

impl<P: MarketDataSource + 'static> SyncOrchestrator<P> {
    /// Validate the configuration and wire the collaborators. Nothing is
    /// fetched or written here.
    pub fn new(config: Config, provider: Arc<P>, store: Arc<TimeSeriesStore>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config: Arc::new(config),
            provider,
            store,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &Arc<TimeSeriesStore> {
        &self.store
    }

    fn pipeline_for(&self, spec: &SymbolSpec) -> Result<Pipeline> {
        Pipeline::new(
            self.config.indicators.for_kind(spec.kind).clone(),
            self.config.percentile.lookback_rows(),
            self.config.percentile.precision,
            spec.with_valuation,
        )
    }

    fn selected_symbols(&self, options: &SyncOptions) -> Result<Vec<SymbolSpec>> {
        let all = self.config.symbols();
        let Some(wanted) = &options.symbols else {
            return Ok(all);
        };
        wanted
            .iter()
            .map(|code| {
                all.iter().find(|s| &s.ts_code == code).cloned().ok_or_else(|| {
                    AshareError::ConfigError(format!("{} is not a configured symbol", code))
                })
            })
            .collect()
    }

    /// Refresh listings, index weights and constituent fundamentals.
    /// Failures are collected per item; only store errors abort.
    pub async fn sync_reference_data(&self, end: TradeDate) -> Result<ReferenceSummary> {
        let mut summary = ReferenceSummary::default();
        let sync_cfg = &self.config.sync;
        let mut listings_report = PersistReport::default();
        let mut weights_report = PersistReport::default();
        let mut fundamentals_report = PersistReport::default();

        for status in LISTING_STATUSES {
            match self.provider.fetch_stock_basic(status).await {
                Ok(listings) => {
                    let report =
                        on_blocking_pool(&self.store, move |s| s.upsert_listings(&listings)).await?;
                    listings_report.merge(report);
                }
                Err(e) => {
                    warn!("stock_basic {} failed: {}", status, e);
                    summary.failures.push((format!("stock_basic:{}", status), e.to_string()));
                }
            }
        }

        let valuation_indices: Vec<SymbolSpec> = self
            .config
            .symbols()
            .into_iter()
            .filter(|s| s.kind == SymbolKind::Index && s.with_valuation)
            .collect();

        for spec in &valuation_indices {
            let code = spec.ts_code.clone();
            let last_weight =
                on_blocking_pool(&self.store, move |s| s.max_weight_date(&code)).await?;
            let from = match last_weight {
                Some(last) => last + ChronoDuration::days(1),
                None => sync_cfg.default_start_date.min(spec.history_start),
            };
            for (month_start, month_end) in month_ranges(from, end) {
                match self
                    .provider
                    .fetch_index_weight(&spec.ts_code, month_start, month_end)
                    .await
                {
                    Ok(weights) => {
                        let weights = dedup_monthly_weights(weights);
                        let report =
                            on_blocking_pool(&self.store, move |s| s.upsert_weights(&weights))
                                .await?;
                        weights_report.merge(report);
                    }
                    Err(e) => {
                        warn!("{} weights for {} failed: {}", spec.ts_code, month_start, e);
                        summary
                            .failures
                            .push((format!("index_weight:{}", spec.ts_code), e.to_string()));
                    }
                }
            }
        }

        let mut codes: Vec<String> = Vec::new();
        let mut seen = HashSet::new();
        for spec in &valuation_indices {
            let code = spec.ts_code.clone();
            let latest =
                on_blocking_pool(&self.store, move |s| s.latest_weights(&code, end, end)).await?;
            for w in latest {
                if seen.insert(w.con_code.clone()) {
                    codes.push(w.con_code);
                }
            }
        }
        info!("Refreshing fundamentals for {} constituents", codes.len());

        for code in &codes {
            let owned = code.clone();
            let last_fundamental =
                on_blocking_pool(&self.store, move |s| s.max_fundamental_date(&owned)).await?;
            let from = match last_fundamental {
                Some(last) => last - ChronoDuration::days(sync_cfg.fundamentals_overlap_days),
                None => sync_cfg.default_start_date,
            };
            if from > end {
                continue;
            }
            match self.provider.fetch_daily_basic(code, from, end).await {
                Ok(rows) => {
                    let report =
                        on_blocking_pool(&self.store, move |s| s.upsert_fundamentals(&rows))
                            .await?;
                    fundamentals_report.merge(report);
                }
                Err(e) => {
                    warn!("daily_basic {} failed: {}", code, e);
                    summary.failures.push((format!("daily_basic:{}", code), e.to_string()));
                }
            }
        }

        summary.listings = listings_report.written;
        summary.weights = weights_report.written;
        summary.fundamentals = fundamentals_report.written;
        summary.rows_failed =
            listings_report.failed + weights_report.failed + fundamentals_report.failed;
        info!(
            "Reference data: {} listings, {} weights, {} fundamentals, {} rows failed, {} fetch failures",
            summary.listings,
            summary.weights,
            summary.fundamentals,
            summary.rows_failed,
            summary.failures.len()
        );
        Ok(summary)
    }

    /// Incremental sync of one symbol through every pipeline stage
    pub async fn sync_symbol(
        &self,
        spec: &SymbolSpec,
        start_override: Option<TradeDate>,
        end: TradeDate,
    ) -> Result<SymbolOutcome> {
        let code = spec.ts_code.clone();
        let last_stored = on_blocking_pool(&self.store, move |s| s.max_trade_date(&code)).await?;
        let mut start = match last_stored {
            Some(last) => last + ChronoDuration::days(1),
            None => spec.history_start,
        };
        if let Some(override_start) = start_override {
            start = start.min(override_start);
        }

        let mut outcome = SymbolOutcome {
            ts_code: spec.ts_code.clone(),
            ..Default::default()
        };
        if start > end {
            debug!("{} is up to date", spec.ts_code);
            return Ok(outcome);
        }

        let fetched = self
            .provider
            .fetch_daily(spec.kind, &spec.ts_code, start, end)
            .await?;
        if fetched.is_empty() {
            info!("{}: no new bars since {}", spec.ts_code, start);
            return Ok(outcome);
        }

        let exchange = Exchange::of_code(&spec.ts_code);
        let calendar = match self.provider.fetch_trade_calendar(exchange, start, end).await {
            Ok(days) => ExchangeCalendar::from_open_days(exchange, start, end, days),
            Err(e) => {
                warn!("{}: trade calendar unavailable ({}), not filtering", spec.ts_code, e);
                ExchangeCalendar::new(exchange)
            }
        };
        let fetched = calendar.filter_bars(fetched);
        outcome.new_bars = fetched.len();

        let code = spec.ts_code.clone();
        let mut bars = on_blocking_pool(&self.store, move |s| s.load_bars(&code, None, None)).await?;
        bars.extend(fetched);
        let dropped = sort_and_dedup(&mut bars);
        if dropped > 0 {
            debug!("{}: {} stored bars replaced by upstream", spec.ts_code, dropped);
        }

        let pipeline = self.pipeline_for(spec)?;
        let spec_owned = spec.clone();
        let (report, valuation_days) = on_blocking_pool(&self.store, move |s| {
            compute_and_persist(s, &pipeline, &spec_owned, bars, start, end)
        })
        .await?;

        outcome.rows_written = report.written;
        outcome.rows_failed = report.failed;
        outcome.valuation_days = valuation_days;
        info!(
            "{}: {} new bars, {} rows written, {} failed",
            spec.ts_code, outcome.new_bars, outcome.rows_written, outcome.rows_failed
        );
        Ok(outcome)
    }

    /// Sync with a per-symbol timeout
    async fn sync_symbol_bounded(
        &self,
        spec: &SymbolSpec,
        start_override: Option<TradeDate>,
        end: TradeDate,
    ) -> Result<SymbolOutcome> {
        let seconds = self.config.sync.symbol_timeout_secs;
        match tokio::time::timeout(
            Duration::from_secs(seconds),
            self.sync_symbol(spec, start_override, end),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(AshareError::Timeout {
                symbol: spec.ts_code.clone(),
                seconds,
            }),
        }
    }

    pub async fn run(&self, options: SyncOptions) -> Result<RunSummary> {
        self.run_with_progress(options, |_, _| {}).await
    }

    /// Run one sync cycle. `on_symbol` is called as each symbol finishes.
    pub async fn run_with_progress<F>(&self, options: SyncOptions, on_symbol: F) -> Result<RunSummary>
    where
        F: Fn(&str, &Result<SymbolOutcome>),
    {
        let symbols = self.selected_symbols(&options)?;
        let end = options.end_date.unwrap_or_else(today_in_shanghai);
        let mut summary = RunSummary::default();

        if !options.index_only {
            summary.reference = Some(self.sync_reference_data(end).await?);
        }

        let semaphore = Arc::new(Semaphore::new(self.config.sync.max_concurrency));
        let mut tasks = JoinSet::new();
        for spec in symbols {
            summary.attempted += 1;
            let this = self.clone();
            let semaphore = Arc::clone(&semaphore);
            let start_override = options.start_date;
            tasks.spawn(async move {
                let result = match semaphore.acquire_owned().await {
                    Ok(_permit) => this.sync_symbol_bounded(&spec, start_override, end).await,
                    Err(e) => Err(AshareError::DataError(format!("worker pool closed: {}", e))),
                };
                (spec.ts_code, result)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            let (ts_code, result) = match joined {
                Ok(pair) => pair,
                Err(e) => {
                    error!("sync task panicked: {}", e);
                    summary.failed.push(("<task>".to_string(), e.to_string()));
                    continue;
                }
            };

            if let Err(e) = &result {
                if !e.is_recoverable() {
                    tasks.abort_all();
                    return Err(AshareError::ConfigError(format!("{}: {}", ts_code, e)));
                }
                error!("{}: sync abandoned for this cycle: {}", ts_code, e);
            }
            on_symbol(&ts_code, &result);
            summary.record(&ts_code, &result);
        }

        summary.symbols.sort_by(|a, b| a.ts_code.cmp(&b.ts_code));
        info!(
            "Sync finished: {} attempted, {} succeeded, {} failed, {} rows written",
            summary.attempted,
            summary.succeeded,
            summary.failed.len(),
            summary.rows_written
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_store_calls_leave_runtime_free() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let store = Arc::new(TimeSeriesStore::open_in_memory().unwrap());
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ticks);
        let ticker = tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_millis(10)).await;
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        let rows = on_blocking_pool(&store, |s| {
            std::thread::sleep(Duration::from_millis(200));
            s.count_rows("000300.SH")
        })
        .await
        .unwrap();
        ticker.abort();

        assert_eq!(rows, 0);
        // the single runtime thread kept ticking while the store call slept
        assert!(ticks.load(Ordering::SeqCst) >= 5);
    }

    #[test]
    fn test_month_ranges() {
        let ranges = month_ranges(d(2023, 11, 15), d(2024, 2, 10));
        assert_eq!(
            ranges,
            vec![
                (d(2023, 11, 15), d(2023, 11, 30)),
                (d(2023, 12, 1), d(2023, 12, 31)),
                (d(2024, 1, 1), d(2024, 1, 31)),
                (d(2024, 2, 1), d(2024, 2, 10)),
            ]
        );
        assert!(month_ranges(d(2024, 3, 1), d(2024, 2, 1)).is_empty());
    }

    #[test]
    fn test_dedup_monthly_weights_first_wins() {
        let w = |code: &str, date: NaiveDate, weight: f64| ConstituentWeight {
            index_code: "000300.SH".into(),
            con_code: code.into(),
            trade_date: date,
            weight,
        };
        let out = dedup_monthly_weights(vec![
            w("600000.SH", d(2024, 1, 2), 1.0),
            w("600000.SH", d(2024, 1, 31), 2.0),
            w("600000.SH", d(2024, 2, 1), 3.0),
        ]);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].weight, 1.0);
        assert_eq!(out[1].weight, 3.0);
    }

    #[test]
    fn test_valuation_multiples_join_by_date() {
        let bars = vec![
            PriceBar::new("000300.SH", d(2024, 1, 2), 1.0, 1.0, 1.0, 1.0, 1.0),
            PriceBar::new("000300.SH", d(2024, 1, 3), 1.0, 1.0, 1.0, 1.0, 1.0),
        ];
        let snap = IndexValuationSnapshot {
            index_code: "000300.SH".into(),
            trade_date: d(2024, 1, 3),
            weighted_pe: None,
            weighted_pe_ttm: Some(12.0),
            weighted_pb: None,
            equal_weight_pe: None,
            equal_weight_pe_ttm: Some(11.0),
            equal_weight_pb: Some(1.3),
            valid_pe: 0,
            valid_pe_ttm: 1,
            valid_pb: 1,
            total_stocks: 1,
        };
        let joined = valuation_multiples(&bars, &[snap]);
        assert_eq!(joined, vec![(None, None), (Some(11.0), Some(1.3))]);
    }
}
