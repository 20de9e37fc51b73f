use chrono::{Duration, NaiveDate};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use rusty_ashare::pipeline::{
    aggregate_day, rolling_percentile, DailyFundamental, IndicatorConfig, Pipeline,
    TechnicalIndicatorEngine,
};
use rusty_ashare::types::PriceBar;

fn synthetic_bars(n: usize) -> Vec<PriceBar> {
    let start = NaiveDate::from_ymd_opt(2010, 1, 4).unwrap();
    (0..n)
        .map(|i| {
            let x = i as f64;
            let close = 3000.0 + 150.0 * (x / 37.0).sin() + 40.0 * (x / 5.0).cos() + x * 0.2;
            let mut bar = PriceBar::new(
                "000300.SH",
                start + Duration::days(i as i64),
                close - 4.0,
                close + 15.0,
                close - 18.0,
                close,
                1.0e8 + (i % 31) as f64 * 2.0e6,
            );
            bar.amount = Some(2.5e8 + (i % 13) as f64 * 4.0e6);
            bar
        })
        .collect()
}

fn benchmark_indicator_engine(c: &mut Criterion) {
    let engine = TechnicalIndicatorEngine::new(IndicatorConfig::index()).unwrap();
    let mut group = c.benchmark_group("indicator_engine");
    for n in [500usize, 2500, 5000] {
        let bars = synthetic_bars(n);
        group.bench_with_input(BenchmarkId::from_parameter(n), &bars, |b, bars| {
            b.iter(|| engine.compute(black_box(bars)).unwrap());
        });
    }
    group.finish();
}

fn benchmark_full_pipeline(c: &mut Criterion) {
    let pipeline = Pipeline::new(IndicatorConfig::index(), 1250, 2, false).unwrap();
    let bars = synthetic_bars(5000);

    c.bench_function("pipeline_5000_rows", |b| {
        b.iter(|| pipeline.run(black_box(&bars)).unwrap());
    });
}

fn benchmark_rolling_percentile(c: &mut Criterion) {
    let values: Vec<Option<f64>> = (0..5000)
        .map(|i| {
            if i % 97 == 0 {
                None
            } else {
                Some((i as f64 / 11.0).sin() * 100.0)
            }
        })
        .collect();

    let mut group = c.benchmark_group("rolling_percentile");
    for lookback in [250usize, 1250, 2500] {
        group.bench_with_input(BenchmarkId::from_parameter(lookback), &lookback, |b, &lb| {
            b.iter(|| rolling_percentile(black_box(&values), lb, 2));
        });
    }
    group.finish();
}

fn benchmark_valuation_day(c: &mut Criterion) {
    let day = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
    let fundamentals: Vec<DailyFundamental> = (0..300)
        .map(|i| DailyFundamental {
            ts_code: format!("{:06}.SH", 600000 + i),
            trade_date: day,
            pe_ttm: Some(5.0 + (i % 40) as f64),
            pb: Some(0.8 + (i % 7) as f64 * 0.3),
            total_mv: Some(1.0e5 + i as f64 * 3.0e3),
            circ_mv: Some(8.0e4 + i as f64 * 2.0e3),
            ..Default::default()
        })
        .collect();
    let members: Vec<(&DailyFundamental, f64)> =
        fundamentals.iter().map(|f| (f, 1.0 / 3.0)).collect();

    c.bench_function("valuation_day_300_constituents", |b| {
        b.iter(|| aggregate_day("000300.SH", day, black_box(&members)));
    });
}

criterion_group!(
    benches,
    benchmark_indicator_engine,
    benchmark_full_pipeline,
    benchmark_rolling_percentile,
    benchmark_valuation_day
);
criterion_main!(benches);
