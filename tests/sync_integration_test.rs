//! Orchestrator tests against a scripted upstream provider

#[cfg(feature = "async")]
mod tests {
    use approx::assert_relative_eq;
    use chrono::{Datelike, Duration as ChronoDuration, NaiveDate, Weekday};
    use rusty_ashare::config::{Config, FundEntry, IndexEntry};
    use rusty_ashare::data::{MarketDataSource, TimeSeriesStore};
    use rusty_ashare::error::{AshareError, Result};
    use rusty_ashare::pipeline::{
        ConstituentWeight, CrossKey, DailyFundamental, PercentileKey, StockListing,
    };
    use rusty_ashare::sync::{SyncOptions, SyncOrchestrator};
    use rusty_ashare::types::{Exchange, PriceBar, SymbolKind, TradeDate};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    const FAILING: &str = "399006.SZ";
    const SLOW: &str = "000852.SH";

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn first_day() -> NaiveDate {
        d(2024, 1, 1)
    }

    fn weekdays(start: NaiveDate, end: NaiveDate) -> Vec<NaiveDate> {
        let mut out = Vec::new();
        let mut day = start.max(first_day());
        while day <= end {
            if !matches!(day.weekday(), Weekday::Sat | Weekday::Sun) {
                out.push(day);
            }
            day += ChronoDuration::days(1);
        }
        out
    }

    /// Deterministic upstream: weekday bars, two constituents, one holiday
    #[derive(Default)]
    struct ScriptedProvider {
        daily_calls: AtomicUsize,
    }

    impl ScriptedProvider {
        fn holiday() -> NaiveDate {
            d(2024, 2, 12)
        }
    }

    impl MarketDataSource for ScriptedProvider {
        async fn fetch_daily(
            &self,
            _kind: SymbolKind,
            ts_code: &str,
            start: TradeDate,
            end: TradeDate,
        ) -> Result<Vec<PriceBar>> {
            self.daily_calls.fetch_add(1, Ordering::SeqCst);
            if ts_code == FAILING {
                return Err(AshareError::UpstreamFetch {
                    api: "index_daily".into(),
                    message: "connection reset".into(),
                });
            }
            if ts_code == SLOW {
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
            // newest first, the way the upstream API returns rows
            let mut bars: Vec<PriceBar> = weekdays(start, end)
                .into_iter()
                .map(|day| {
                    let i = (day - first_day()).num_days() as f64;
                    let close = 3500.0 + 60.0 * (i / 6.0).sin() + i;
                    let mut bar = PriceBar::new(ts_code, day, close - 3.0, close + 9.0, close - 11.0, close, 2.0e8 + i * 1.0e6);
                    bar.amount = Some(3.0e8 + (i % 9.0) * 1.0e6);
                    bar
                })
                .collect();
            bars.reverse();
            Ok(bars)
        }

        async fn fetch_trade_calendar(
            &self,
            _exchange: Exchange,
            start: TradeDate,
            end: TradeDate,
        ) -> Result<Vec<TradeDate>> {
            Ok(weekdays(start, end)
                .into_iter()
                .filter(|day| *day != Self::holiday())
                .collect())
        }

        async fn fetch_daily_basic(
            &self,
            ts_code: &str,
            start: TradeDate,
            end: TradeDate,
        ) -> Result<Vec<DailyFundamental>> {
            let (mv, pe) = if ts_code == "600000.SH" { (100.0, 10.0) } else { (50.0, 20.0) };
            Ok(weekdays(start, end)
                .into_iter()
                .map(|day| DailyFundamental {
                    ts_code: ts_code.to_string(),
                    trade_date: day,
                    pe: Some(pe),
                    pe_ttm: Some(pe),
                    pb: Some(1.2),
                    total_mv: Some(mv),
                    circ_mv: Some(mv),
                    ..Default::default()
                })
                .collect())
        }

        async fn fetch_index_weight(
            &self,
            index_code: &str,
            start: TradeDate,
            end: TradeDate,
        ) -> Result<Vec<ConstituentWeight>> {
            if start < first_day() || start > end {
                return Ok(Vec::new());
            }
            let weight = |con: &str, w: f64| ConstituentWeight {
                index_code: index_code.to_string(),
                con_code: con.to_string(),
                trade_date: start,
                weight: w,
            };
            // duplicated row within the month, first one wins
            Ok(vec![
                weight("600000.SH", 60.0),
                weight("000001.SZ", 40.0),
                weight("600000.SH", 99.0),
            ])
        }

        async fn fetch_stock_basic(&self, list_status: &str) -> Result<Vec<StockListing>> {
            if list_status != "L" {
                return Ok(Vec::new());
            }
            Ok(["600000.SH", "000001.SZ"]
                .iter()
                .map(|code| StockListing {
                    ts_code: code.to_string(),
                    name: code.to_string(),
                    list_status: "L".into(),
                    list_date: Some(d(1999, 11, 10)),
                    delist_date: None,
                })
                .collect())
        }
    }

    fn config(with_slow: bool) -> Config {
        let mut config = Config::default();
        config.indices = vec![
            IndexEntry {
                ts_code: "000300.SH".into(),
                name: "CSI 300".into(),
                history_start: first_day(),
                with_valuation: true,
            },
            IndexEntry {
                ts_code: FAILING.into(),
                name: "ChiNext".into(),
                history_start: first_day(),
                with_valuation: false,
            },
        ];
        if with_slow {
            config.indices.push(IndexEntry {
                ts_code: SLOW.into(),
                name: "CSI 1000".into(),
                history_start: first_day(),
                with_valuation: false,
            });
        }
        config.funds = vec![FundEntry {
            ts_code: "510300.SH".into(),
            name: "300 ETF".into(),
            history_start: first_day(),
        }];
        config.sync.default_start_date = first_day();
        config.sync.symbol_timeout_secs = 1;
        config.sync.max_concurrency = 2;
        config
    }

    fn options() -> SyncOptions {
        SyncOptions {
            end_date: Some(d(2024, 3, 29)),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_full_sync_then_rerun() {
        let store = Arc::new(TimeSeriesStore::open_in_memory().unwrap());
        let provider = Arc::new(ScriptedProvider::default());
        let orchestrator =
            SyncOrchestrator::new(config(false), Arc::clone(&provider), Arc::clone(&store)).unwrap();

        let summary = orchestrator.run(options()).await.unwrap();
        assert_eq!(summary.attempted, 3);
        assert_eq!(summary.succeeded, 2);
        assert_eq!(summary.failed.len(), 1);
        assert_eq!(summary.failed[0].0, FAILING);
        assert_eq!(summary.rows_failed, 0);

        let reference = summary.reference.unwrap();
        assert_eq!(reference.listings, 2);
        // three months, two constituents each after dedup
        assert_eq!(reference.weights, 6);
        assert!(reference.failures.is_empty());
        assert_eq!(reference.rows_failed, 0);

        let index_rows = store.load_rows("000300.SH", None, None).unwrap();
        let fund_rows = store.load_rows("510300.SH", None, None).unwrap();
        assert_eq!(index_rows.len(), weekdays(first_day(), d(2024, 3, 29)).len() - 1);
        assert!(index_rows.iter().all(|r| r.trade_date() != ScriptedProvider::holiday()));
        assert_eq!(fund_rows.len(), index_rows.len());
        assert_eq!(summary.rows_written, index_rows.len() + fund_rows.len());

        // index rows carry the cap-weighted PE-TTM of the constituents
        let last = index_rows.last().unwrap();
        assert_relative_eq!(last.pe_ttm.unwrap(), 250.0 / 22.5, epsilon = 1e-9);
        assert!(last.percentile.contains_key(&PercentileKey::PeTtm));
        assert!(last.cross.contains_key(&CrossKey::Macd));
        assert!(!fund_rows[0].percentile.contains_key(&PercentileKey::PeTtm));

        let valuations = store.load_valuations("000300.SH", None, None).unwrap();
        assert_eq!(valuations.len(), weekdays(first_day(), d(2024, 3, 29)).len());
        assert_eq!(valuations[0].valid_pe, 2);

        // nothing new upstream: same rows, no fetches for the synced symbols
        let calls_before = provider.daily_calls.load(Ordering::SeqCst);
        let again = orchestrator
            .run(SyncOptions {
                index_only: true,
                ..options()
            })
            .await
            .unwrap();
        assert_eq!(again.rows_written, 0);
        assert!(again.reference.is_none());
        // only the failing symbol has no stored rows and is fetched again
        assert_eq!(provider.daily_calls.load(Ordering::SeqCst), calls_before + 1);
        assert_eq!(store.load_rows("000300.SH", None, None).unwrap(), index_rows);
    }

    #[tokio::test]
    async fn test_start_date_override_rewrites_identical_rows() {
        let store = Arc::new(TimeSeriesStore::open_in_memory().unwrap());
        let orchestrator = SyncOrchestrator::new(
            config(false),
            Arc::new(ScriptedProvider::default()),
            Arc::clone(&store),
        )
        .unwrap();

        orchestrator.run(options()).await.unwrap();
        let before = store.load_rows("000300.SH", None, None).unwrap();

        let summary = orchestrator
            .run(SyncOptions {
                index_only: true,
                start_date: Some(d(2024, 3, 1)),
                symbols: Some(vec!["000300.SH".into()]),
                ..options()
            })
            .await
            .unwrap();
        assert_eq!(summary.attempted, 1);
        assert_eq!(summary.rows_written, weekdays(d(2024, 3, 1), d(2024, 3, 29)).len());

        let after = store.load_rows("000300.SH", None, None).unwrap();
        assert_eq!(after, before);
    }

    #[tokio::test]
    async fn test_slow_symbol_times_out_without_stalling_the_run() {
        let store = Arc::new(TimeSeriesStore::open_in_memory().unwrap());
        let orchestrator = SyncOrchestrator::new(
            config(true),
            Arc::new(ScriptedProvider::default()),
            Arc::clone(&store),
        )
        .unwrap();

        let summary = orchestrator
            .run(SyncOptions {
                index_only: true,
                ..options()
            })
            .await
            .unwrap();
        assert_eq!(summary.attempted, 4);
        assert_eq!(summary.succeeded, 2);
        let slow = summary.failed.iter().find(|(code, _)| code == SLOW).unwrap();
        assert!(slow.1.contains("timed out"));
        assert_eq!(store.count_rows(SLOW).unwrap(), 0);
    }

    #[tokio::test]
    async fn test_invalid_config_rejected_before_io() {
        let mut bad = config(false);
        bad.indicators.index.ma_periods = vec![0];
        let result = SyncOrchestrator::new(
            bad,
            Arc::new(ScriptedProvider::default()),
            Arc::new(TimeSeriesStore::open_in_memory().unwrap()),
        );
        assert!(matches!(result, Err(AshareError::ConfigError(_))));
    }

    #[tokio::test]
    async fn test_unknown_symbol_rejected() {
        let orchestrator = SyncOrchestrator::new(
            config(false),
            Arc::new(ScriptedProvider::default()),
            Arc::new(TimeSeriesStore::open_in_memory().unwrap()),
        )
        .unwrap();
        let result = orchestrator
            .run(SyncOptions {
                symbols: Some(vec!["999999.SH".into()]),
                ..options()
            })
            .await;
        assert!(matches!(result, Err(AshareError::ConfigError(_))));
    }
}
