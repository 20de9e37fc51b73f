//! PNG charts of computed rows
//!
//! Index charts have two panels: close with moving averages and Bollinger
//! bands on top, valuation PE-TTM with its percentile below. Fund charts
//! only have the price panel. Dates are plotted as f64 day numbers.

use chrono::{Datelike, NaiveDate};
use log::{debug, info};
use plotters::prelude::*;
use rayon::prelude::*;
use std::ops::Range;
use std::path::{Path, PathBuf};

use crate::error::{AshareError, Result};
use crate::pipeline::{IndicatorRow, PercentileKey};
use crate::types::format_compact_date;

const MA_COLORS: [RGBColor; 6] = [
    RGBColor(230, 120, 0),
    RGBColor(0, 140, 70),
    RGBColor(150, 60, 200),
    RGBColor(200, 40, 120),
    RGBColor(20, 160, 200),
    RGBColor(120, 120, 0),
];

/// Chart size and colors
#[derive(Debug, Clone)]
pub struct ChartConfig {
    pub width: u32,
    pub height: u32,
    pub close_color: RGBColor,
    pub band_color: RGBColor,
    pub valuation_color: RGBColor,
    pub percentile_color: RGBColor,
}

impl Default for ChartConfig {
    fn default() -> Self {
        Self {
            width: 1600,
            height: 1000,
            close_color: RGBColor(0, 90, 180),
            band_color: RGBColor(170, 170, 170),
            valuation_color: RGBColor(200, 50, 50),
            percentile_color: RGBColor(60, 60, 60),
        }
    }
}

fn draw_err(e: impl std::fmt::Display) -> AshareError {
    AshareError::DataError(format!("chart rendering failed: {}", e))
}

fn day_number(date: NaiveDate) -> f64 {
    date.num_days_from_ce() as f64
}

fn date_label(x: &f64) -> String {
    NaiveDate::from_num_days_from_ce_opt(x.round() as i32)
        .map(|d| d.format("%Y-%m").to_string())
        .unwrap_or_default()
}

/// Padded `[min, max]` of the finite values, `None` when there are none
pub fn value_range(values: impl IntoIterator<Item = f64>) -> Option<Range<f64>> {
    let (lo, hi) = values
        .into_iter()
        .filter(|v| v.is_finite())
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| {
            (lo.min(v), hi.max(v))
        });
    if lo > hi {
        return None;
    }
    let pad = ((hi - lo) * 0.05).max(hi.abs() * 1e-3).max(1e-9);
    Some(lo - pad..hi + pad)
}

/// `<code>_<first>_<last>.png`
pub fn chart_file_name(ts_code: &str, rows: &[IndicatorRow]) -> Option<String> {
    let first = rows.first()?.trade_date();
    let last = rows.last()?.trade_date();
    Some(format!(
        "{}_{}_{}.png",
        ts_code.replace('.', "_"),
        format_compact_date(first),
        format_compact_date(last)
    ))
}

fn line_points(
    rows: &[IndicatorRow],
    value: impl Fn(&IndicatorRow) -> Option<f64>,
) -> Vec<(f64, f64)> {
    rows.iter()
        .filter_map(|r| value(r).map(|v| (day_number(r.trade_date()), v)))
        .filter(|(_, v)| v.is_finite())
        .collect()
}

/// Renders charts for computed rows
pub struct ChartRenderer {
    config: ChartConfig,
}

impl Default for ChartRenderer {
    fn default() -> Self {
        Self::new()
    }
}

impl ChartRenderer {
    pub fn new() -> Self {
        Self {
            config: ChartConfig::default(),
        }
    }

    pub fn with_config(config: ChartConfig) -> Self {
        Self { config }
    }

    /// Render one symbol into `dir`, returning the written path
    pub fn render(
        &self,
        ts_code: &str,
        title: &str,
        rows: &[IndicatorRow],
        with_valuation: bool,
        dir: &Path,
    ) -> Result<PathBuf> {
        if rows.len() < 2 {
            return Err(AshareError::DataError(format!(
                "{}: need at least 2 rows to chart, have {}",
                ts_code,
                rows.len()
            )));
        }
        let file_name = chart_file_name(ts_code, rows)
            .ok_or_else(|| AshareError::DataError(format!("{}: no rows", ts_code)))?;
        let path = dir.join(file_name);

        let root = BitMapBackend::new(&path, (self.config.width, self.config.height))
            .into_drawing_area();
        root.fill(&WHITE).map_err(draw_err)?;

        let x_range = day_number(rows[0].trade_date())..day_number(rows[rows.len() - 1].trade_date());
        let has_valuation = with_valuation && rows.iter().any(|r| r.pe_ttm.is_some());

        if has_valuation {
            let (upper, lower) = root.split_vertically(self.config.height * 6 / 10);
            self.draw_price_panel(&upper, title, rows, x_range.clone())?;
            self.draw_valuation_panel(&lower, rows, x_range)?;
        } else {
            self.draw_price_panel(&root, title, rows, x_range)?;
        }

        root.present().map_err(draw_err)?;
        drop(root);
        debug!("{}: chart written to {}", ts_code, path.display());
        Ok(path)
    }

    fn draw_price_panel<DB: DrawingBackend>(
        &self,
        area: &DrawingArea<DB, plotters::coord::Shift>,
        title: &str,
        rows: &[IndicatorRow],
        x_range: Range<f64>,
    ) -> Result<()> {
        let y_range = value_range(rows.iter().flat_map(|r| {
            [Some(r.close()), r.bb_upper, r.bb_lower]
                .into_iter()
                .flatten()
        }))
        .ok_or_else(|| AshareError::DataError("no prices to chart".into()))?;

        let mut chart = ChartBuilder::on(area)
            .caption(title, ("sans-serif", 24))
            .margin(10)
            .x_label_area_size(30)
            .y_label_area_size(60)
            .build_cartesian_2d(x_range, y_range)
            .map_err(draw_err)?;

        chart
            .configure_mesh()
            .x_label_formatter(&date_label)
            .y_desc("close")
            .draw()
            .map_err(draw_err)?;

        let band = self.config.band_color;
        let bands: [(&str, fn(&IndicatorRow) -> Option<f64>); 2] = [
            ("boll upper", |r| r.bb_upper),
            ("boll lower", |r| r.bb_lower),
        ];
        for (label, pick) in bands {
            chart
                .draw_series(LineSeries::new(line_points(rows, pick), band.stroke_width(1)))
                .map_err(draw_err)?
                .label(label)
                .legend(move |(x, y)| PathElement::new(vec![(x, y), (x + 20, y)], band));
        }

        let periods: Vec<usize> = rows.last().map(|r| r.ma.keys().copied().collect()).unwrap_or_default();
        for (i, period) in periods.into_iter().enumerate() {
            let color = MA_COLORS[i % MA_COLORS.len()];
            chart
                .draw_series(LineSeries::new(
                    line_points(rows, |r| r.ma(period)),
                    color.stroke_width(1),
                ))
                .map_err(draw_err)?
                .label(format!("MA{}", period))
                .legend(move |(x, y)| PathElement::new(vec![(x, y), (x + 20, y)], color));
        }

        let close = self.config.close_color;
        chart
            .draw_series(LineSeries::new(
                line_points(rows, |r| Some(r.close())),
                close.stroke_width(2),
            ))
            .map_err(draw_err)?
            .label("close")
            .legend(move |(x, y)| PathElement::new(vec![(x, y), (x + 20, y)], close));

        chart
            .configure_series_labels()
            .position(SeriesLabelPosition::UpperLeft)
            .background_style(WHITE.mix(0.8))
            .border_style(BLACK)
            .draw()
            .map_err(draw_err)?;
        Ok(())
    }

    fn draw_valuation_panel<DB: DrawingBackend>(
        &self,
        area: &DrawingArea<DB, plotters::coord::Shift>,
        rows: &[IndicatorRow],
        x_range: Range<f64>,
    ) -> Result<()> {
        let pe_points = line_points(rows, |r| r.pe_ttm);
        let y_range = value_range(pe_points.iter().map(|&(_, v)| v))
            .ok_or_else(|| AshareError::DataError("no valuation to chart".into()))?;

        let mut chart = ChartBuilder::on(area)
            .margin(10)
            .x_label_area_size(30)
            .y_label_area_size(60)
            .right_y_label_area_size(50)
            .build_cartesian_2d(x_range.clone(), y_range)
            .map_err(draw_err)?
            .set_secondary_coord(x_range, 0f64..100f64);

        chart
            .configure_mesh()
            .x_label_formatter(&date_label)
            .y_desc("PE-TTM")
            .draw()
            .map_err(draw_err)?;
        chart
            .configure_secondary_axes()
            .y_desc("percentile")
            .draw()
            .map_err(draw_err)?;

        let pe_color = self.config.valuation_color;
        chart
            .draw_series(LineSeries::new(pe_points, pe_color.stroke_width(2)))
            .map_err(draw_err)?
            .label("PE-TTM")
            .legend(move |(x, y)| PathElement::new(vec![(x, y), (x + 20, y)], pe_color));

        let pct_color = self.config.percentile_color;
        chart
            .draw_secondary_series(LineSeries::new(
                line_points(rows, |r| r.percentile.get(&PercentileKey::PeTtm).copied()),
                pct_color.stroke_width(1),
            ))
            .map_err(draw_err)?
            .label("PE-TTM percentile")
            .legend(move |(x, y)| PathElement::new(vec![(x, y), (x + 20, y)], pct_color));

        chart
            .configure_series_labels()
            .position(SeriesLabelPosition::UpperLeft)
            .background_style(WHITE.mix(0.8))
            .border_style(BLACK)
            .draw()
            .map_err(draw_err)?;
        Ok(())
    }
}

/// One symbol to chart
pub struct ChartJob {
    pub ts_code: String,
    pub title: String,
    pub with_valuation: bool,
    pub rows: Vec<IndicatorRow>,
}

/// Render every job in parallel. Each result pairs the code with its path
/// or the rendering error.
pub fn render_all(
    renderer: &ChartRenderer,
    jobs: &[ChartJob],
    dir: &Path,
) -> Vec<(String, Result<PathBuf>)> {
    let results: Vec<(String, Result<PathBuf>)> = jobs
        .par_iter()
        .map(|job| {
            let result = renderer.render(&job.ts_code, &job.title, &job.rows, job.with_valuation, dir);
            (job.ts_code.clone(), result)
        })
        .collect();
    info!(
        "Rendered {}/{} charts into {}",
        results.iter().filter(|(_, r)| r.is_ok()).count(),
        jobs.len(),
        dir.display()
    );
    results
}
