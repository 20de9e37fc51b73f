//! Storage round trip and upsert idempotence on an on-disk database

use chrono::{Duration, NaiveDate};
use rusty_ashare::data::{PersistReport, TimeSeriesStore};
use rusty_ashare::pipeline::{IndicatorConfig, Pipeline};
use rusty_ashare::types::PriceBar;

fn bars(n: usize) -> Vec<PriceBar> {
    let start = NaiveDate::from_ymd_opt(2022, 1, 3).unwrap();
    (0..n)
        .map(|i| {
            let close = 3000.0 + 80.0 * (i as f64 / 11.0).sin() + i as f64;
            let mut bar = PriceBar::new(
                "000300.SH",
                start + Duration::days(i as i64),
                close - 5.0,
                close + 12.0,
                close - 15.0,
                close,
                1.0e7 + (i % 17) as f64 * 1.0e5,
            );
            bar.amount = Some(2.0e7 + (i % 23) as f64 * 3.0e5);
            bar.pre_close = Some(close - 1.0);
            bar
        })
        .collect()
}

#[test]
fn test_rows_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ashare.db");

    let pipeline = Pipeline::new(IndicatorConfig::index(), 250, 2, false).unwrap();
    let rows = pipeline.run(&bars(150)).unwrap();

    {
        let store = TimeSeriesStore::open(&path).unwrap().with_batch_size(40);
        let report = store.upsert_rows(&rows).unwrap();
        assert_eq!(report, PersistReport { written: 150, failed: 0 });
    }

    let store = TimeSeriesStore::open(&path).unwrap();
    let loaded = store.load_rows("000300.SH", None, None).unwrap();
    assert_eq!(loaded, rows);
    assert_eq!(
        store.load_bars("000300.SH", None, None).unwrap(),
        bars(150)
    );
}

#[test]
fn test_rerun_is_idempotent() {
    let store = TimeSeriesStore::open_in_memory().unwrap().with_batch_size(32);
    let pipeline = Pipeline::new(IndicatorConfig::index(), 250, 2, false).unwrap();

    let first = pipeline.run(&bars(120)).unwrap();
    store.upsert_rows(&first).unwrap();
    let persisted = store.load_rows("000300.SH", None, None).unwrap();

    // second cycle recomputes from the stored bars and rewrites the same range
    let stored_bars = store.load_bars("000300.SH", None, None).unwrap();
    let second = pipeline.run(&stored_bars).unwrap();
    store.upsert_rows(&second).unwrap();

    assert_eq!(store.count_rows("000300.SH").unwrap(), 120);
    assert_eq!(store.load_rows("000300.SH", None, None).unwrap(), persisted);
}

#[test]
fn test_incremental_tail_matches_full_recompute() {
    let store = TimeSeriesStore::open_in_memory().unwrap();
    let pipeline = Pipeline::new(IndicatorConfig::index(), 250, 2, false).unwrap();
    let all = bars(130);

    store.upsert_rows(&pipeline.run(&all[..100]).unwrap()).unwrap();
    let cutoff = store.max_trade_date("000300.SH").unwrap().unwrap();

    let mut merged = store.load_bars("000300.SH", None, None).unwrap();
    merged.extend_from_slice(&all[100..]);
    let tail: Vec<_> = pipeline
        .run(&merged)
        .unwrap()
        .into_iter()
        .filter(|r| r.trade_date() > cutoff)
        .collect();
    store.upsert_rows(&tail).unwrap();

    let full = pipeline.run(&all).unwrap();
    assert_eq!(store.load_rows("000300.SH", None, None).unwrap(), full);
}
