//! rusty-ashare CLI - sync, chart and report A-share index/fund indicators
//!
//! ## Example Usage
//!
//! ```bash
//! # Full sync: reference data, then every configured symbol
//! rusty-ashare sync
//!
//! # Only the configured indices and funds, re-computing from a date
//! rusty-ashare sync --index-only --start-date 20240101
//!
//! # Charts for one symbol
//! rusty-ashare plot --ts-code 000300.SH --save-dir ./charts --show
//!
//! # Latest signals and percentiles
//! rusty-ashare report --ts-code 000300.SH --format json
//! ```

use anyhow::{bail, Context};
use clap::{Parser, Subcommand, ValueEnum};
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use rusty_ashare::chart::{render_all, ChartJob, ChartRenderer};
use rusty_ashare::config::{Config, SymbolSpec};
use rusty_ashare::data::{TimeSeriesStore, TushareClient};
use rusty_ashare::pipeline::{
    find_latest_cross_date, BlobKey, CrossKey, CrossSignal, IndicatorRow, PercentileLevel,
};
use rusty_ashare::sync::{SyncOptions, SyncOrchestrator};
use rusty_ashare::types::{parse_compact_date, TradeDate};
use serde::Serialize;
use std::fs;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::Instant;

/// rusty-ashare: A-share index and fund indicator sync
#[derive(Parser)]
#[command(name = "rusty-ashare")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "A-share index/fund sync with indicators, percentiles and valuation", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Configuration file path
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Sync reference data and daily series, then recompute indicators
    Sync {
        /// Skip listings, index weights and fundamentals
        #[arg(long)]
        index_only: bool,

        /// Recompute from this date (YYYYMMDD) when earlier than the stored data
        #[arg(long)]
        start_date: Option<String>,

        /// Last date to sync (YYYYMMDD), today by default
        #[arg(long)]
        end_date: Option<String>,

        /// Only sync this symbol
        #[arg(short = 't', long)]
        ts_code: Option<String>,
    },

    /// Render PNG charts from stored rows
    Plot {
        /// Only chart this symbol
        #[arg(short = 't', long)]
        ts_code: Option<String>,

        /// Output directory, the configured chart_dir by default
        #[arg(short = 's', long)]
        save_dir: Option<PathBuf>,

        /// Print the path of every chart written
        #[arg(long)]
        show: bool,
    },

    /// Show the latest signals and percentile levels
    Report {
        /// Only report this symbol
        #[arg(short = 't', long)]
        ts_code: Option<String>,

        /// Output format
        #[arg(short = 'f', long, value_enum, default_value = "table")]
        format: ReportFormat,

        /// Write the report to a file instead of stdout
        #[arg(short = 'o', long)]
        output: Option<PathBuf>,
    },

    /// Show configuration and store status
    Info {
        /// Show per-symbol store details
        #[arg(short = 'd', long)]
        detailed: bool,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum ReportFormat {
    Table,
    Json,
    Csv,
}

fn main() {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .init();

    let result = load_config(cli.config.as_ref()).and_then(|config| match cli.command {
        Commands::Sync {
            index_only,
            start_date,
            end_date,
            ts_code,
        } => run_sync(
            config,
            SyncArgs {
                index_only,
                start_date,
                end_date,
                ts_code,
            },
        ),
        Commands::Plot {
            ts_code,
            save_dir,
            show,
        } => run_plot(&config, ts_code, save_dir, show),
        Commands::Report {
            ts_code,
            format,
            output,
        } => run_report(&config, ts_code, format, output),
        Commands::Info { detailed } => show_info(&config, cli.config.as_ref(), detailed),
    });

    if let Err(e) = result {
        eprintln!("{} {:#}", "Error:".red().bold(), e);
        process::exit(1);
    }
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<Config> {
    let config = Config::load(path.map(PathBuf::as_path))?;
    config.validate()?;
    config
        .ensure_dirs()
        .context("Failed to create data directories")?;
    Ok(config)
}

fn open_store(config: &Config) -> anyhow::Result<TimeSeriesStore> {
    let store = TimeSeriesStore::open(&config.database_path)
        .with_context(|| format!("Failed to open store {}", config.database_path.display()))?;
    Ok(store.with_batch_size(config.sync.batch_size))
}

fn parse_date_arg(value: Option<String>, flag: &str) -> anyhow::Result<Option<TradeDate>> {
    value
        .map(|s| parse_compact_date(&s).with_context(|| format!("Invalid {} '{}'", flag, s)))
        .transpose()
}

fn selected_symbols(config: &Config, ts_code: Option<String>) -> anyhow::Result<Vec<SymbolSpec>> {
    match ts_code {
        Some(code) => match config.symbol(&code) {
            Some(spec) => Ok(vec![spec]),
            None => bail!("{} is not a configured symbol", code),
        },
        None => Ok(config.symbols()),
    }
}

struct SyncArgs {
    index_only: bool,
    start_date: Option<String>,
    end_date: Option<String>,
    ts_code: Option<String>,
}

fn run_sync(config: Config, args: SyncArgs) -> anyhow::Result<()> {
    let options = SyncOptions {
        index_only: args.index_only,
        start_date: parse_date_arg(args.start_date, "--start-date")?,
        end_date: parse_date_arg(args.end_date, "--end-date")?,
        symbols: args.ts_code.map(|code| vec![code]),
    };
    let symbol_count = options
        .symbols
        .as_ref()
        .map(Vec::len)
        .unwrap_or_else(|| config.symbols().len());

    let store = Arc::new(open_store(&config)?);
    let client = Arc::new(TushareClient::new(&config.tushare)?);
    let orchestrator = SyncOrchestrator::new(config, client, store)?;

    println!("{}", "Syncing...".cyan().bold());
    if !options.index_only {
        println!("  {} listings, index weights, fundamentals", "Reference:".bold());
    }

    let pb = ProgressBar::new(symbol_count as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")?
            .progress_chars("#>-"),
    );

    let started = Instant::now();
    let runtime = tokio::runtime::Runtime::new().context("Failed to start async runtime")?;
    let summary = runtime.block_on(orchestrator.run_with_progress(options, |code, result| {
        match result {
            Ok(outcome) => pb.println(format!(
                "  {} {} ({} new bars, {} rows)",
                "✓".green(),
                code,
                outcome.new_bars,
                outcome.rows_written
            )),
            Err(e) => pb.println(format!("  {} {}: {}", "✗".red(), code, e)),
        }
        pb.set_message(code.to_string());
        pb.inc(1);
    }))?;
    pb.finish_with_message("done");

    println!();
    println!("{}", "Sync Summary".green().bold());
    println!("{}", "============".green());
    if let Some(reference) = &summary.reference {
        println!(
            "  {} {} listings, {} weights, {} fundamentals",
            "Reference:".bold(),
            reference.listings,
            reference.weights,
            reference.fundamentals
        );
        if reference.rows_failed > 0 {
            println!(
                "  {} {} reference rows failed to persist",
                "Warning:".yellow(),
                reference.rows_failed
            );
        }
        if !reference.failures.is_empty() {
            println!(
                "  {} {} reference fetches failed",
                "Warning:".yellow(),
                reference.failures.len()
            );
        }
    }
    println!("  {} {}", "Attempted:".bold(), summary.attempted);
    println!("  {} {}", "Succeeded:".bold(), summary.succeeded.to_string().green());
    let failed = summary.failed.len().to_string();
    println!(
        "  {} {}",
        "Failed:".bold(),
        if summary.failed.is_empty() { failed.normal() } else { failed.red() }
    );
    println!("  {} {}", "Rows written:".bold(), summary.rows_written);
    if summary.rows_failed > 0 {
        println!("  {} {}", "Rows failed:".bold(), summary.rows_failed.to_string().red());
    }
    println!("  {} {:.1}s", "Elapsed:".bold(), started.elapsed().as_secs_f64());
    for (code, reason) in &summary.failed {
        println!("    {} {}: {}", "-".red(), code, reason.dimmed());
    }
    Ok(())
}

fn run_plot(
    config: &Config,
    ts_code: Option<String>,
    save_dir: Option<PathBuf>,
    show: bool,
) -> anyhow::Result<()> {
    let store = open_store(config)?;
    let dir = save_dir.unwrap_or_else(|| config.chart_dir.clone());
    fs::create_dir_all(&dir).with_context(|| format!("Failed to create {}", dir.display()))?;

    let mut jobs = Vec::new();
    for spec in selected_symbols(config, ts_code)? {
        let rows = store.load_rows(&spec.ts_code, None, None)?;
        if rows.is_empty() {
            println!("  {} {}: no stored rows, run sync first", "Skip:".yellow(), spec.ts_code);
            continue;
        }
        let title = if spec.name.is_empty() {
            spec.ts_code.clone()
        } else {
            format!("{} {}", spec.ts_code, spec.name)
        };
        jobs.push(ChartJob {
            ts_code: spec.ts_code,
            title,
            with_valuation: spec.with_valuation,
            rows,
        });
    }

    println!("{}", format!("Rendering {} charts...", jobs.len()).cyan().bold());
    let results = render_all(&ChartRenderer::new(), &jobs, &dir);
    let mut written = 0;
    for (code, result) in results {
        match result {
            Ok(path) => {
                written += 1;
                if show {
                    println!("  {} {} -> {}", "✓".green(), code, path.display());
                }
            }
            Err(e) => println!("  {} {}: {}", "✗".red(), code, e),
        }
    }
    println!(
        "{} {} charts written to {}",
        "✓".green().bold(),
        written,
        dir.display()
    );
    Ok(())
}

#[derive(Debug, Serialize)]
struct SignalEntry {
    key: String,
    today: Option<String>,
    last_golden: Option<(TradeDate, usize)>,
    last_death: Option<(TradeDate, usize)>,
}

#[derive(Debug, Serialize)]
struct PercentileEntry {
    key: String,
    value: Option<f64>,
    level: PercentileLevel,
}

#[derive(Debug, Serialize)]
struct SymbolReport {
    ts_code: String,
    name: String,
    trade_date: TradeDate,
    close: f64,
    pe_ttm: Option<f64>,
    pb: Option<f64>,
    deviation: Vec<(String, Option<f64>)>,
    signals: Vec<SignalEntry>,
    percentiles: Vec<PercentileEntry>,
}

fn build_report(spec: &SymbolSpec, rows: &[IndicatorRow]) -> Option<SymbolReport> {
    let last = rows.last()?;
    let signals = last
        .cross
        .iter()
        .map(|(key, signal)| {
            let (last_golden, last_death) = match key {
                CrossKey::MacdHistTrend => (None, None),
                _ => (
                    find_latest_cross_date(rows, CrossSignal::GoldenCross, *key),
                    find_latest_cross_date(rows, CrossSignal::DeathCross, *key),
                ),
            };
            SignalEntry {
                key: key.encode(),
                today: signal.map(|s| s.as_str().to_string()),
                last_golden,
                last_death,
            }
        })
        .collect();

    Some(SymbolReport {
        ts_code: spec.ts_code.clone(),
        name: spec.name.clone(),
        trade_date: last.trade_date(),
        close: last.close(),
        pe_ttm: last.pe_ttm,
        pb: last.pb,
        deviation: last
            .deviation
            .iter()
            .map(|(k, v)| (k.encode(), v.copied()))
            .collect(),
        signals,
        percentiles: last
            .percentile
            .iter()
            .map(|(k, v)| PercentileEntry {
                key: k.encode(),
                value: v.copied(),
                level: PercentileLevel::classify(v.copied()),
            })
            .collect(),
    })
}

fn fmt_opt(value: Option<f64>, decimals: usize) -> String {
    value
        .map(|v| format!("{:.*}", decimals, v))
        .unwrap_or_else(|| "-".to_string())
}

fn fmt_cross(found: Option<(TradeDate, usize)>) -> String {
    found
        .map(|(date, ago)| format!("{} ({} rows ago)", date, ago))
        .unwrap_or_else(|| "-".to_string())
}

fn print_report_table(report: &SymbolReport) {
    println!(
        "{} {} {}",
        report.ts_code.cyan().bold(),
        report.name,
        report.trade_date.to_string().dimmed()
    );
    println!("  {} {:.2}", "Close:".bold(), report.close);
    if report.pe_ttm.is_some() || report.pb.is_some() {
        println!(
            "  {} {}  {} {}",
            "PE-TTM:".bold(),
            fmt_opt(report.pe_ttm, 2),
            "PB:".bold(),
            fmt_opt(report.pb, 2)
        );
    }

    println!("  {}", "Deviation".bold());
    for (key, value) in &report.deviation {
        println!("    {:<12} {}", key, fmt_opt(value.map(|v| v * 100.0), 2) + "%");
    }

    println!("  {}", "Signals".bold());
    for s in &report.signals {
        let today = match s.today.as_deref() {
            Some(t) if t == CrossSignal::GoldenCross.as_str() => t.green().bold(),
            Some(t) if t == CrossSignal::DeathCross.as_str() => t.red().bold(),
            Some(t) => t.normal(),
            None => "-".dimmed(),
        };
        println!("    {:<16} {}", s.key, today);
        if s.key != CrossKey::MacdHistTrend.encode() {
            println!(
                "      {} {}  {} {}",
                "golden:".dimmed(),
                fmt_cross(s.last_golden),
                "death:".dimmed(),
                fmt_cross(s.last_death)
            );
        }
    }

    println!("  {}", "Percentiles".bold());
    for p in &report.percentiles {
        let level = match p.level {
            PercentileLevel::ExtremelyHigh | PercentileLevel::High => p.level.as_str().red(),
            PercentileLevel::ExtremelyLow | PercentileLevel::Low => p.level.as_str().green(),
            _ => p.level.as_str().normal(),
        };
        println!("    {:<16} {:>7}  {}", p.key, fmt_opt(p.value, 2), level);
    }
    println!();
}

fn write_report_csv(reports: &[SymbolReport], out: impl std::io::Write) -> anyhow::Result<()> {
    let mut writer = csv::Writer::from_writer(out);
    writer.write_record(["ts_code", "trade_date", "section", "key", "value", "detail"])?;
    for r in reports {
        let code = r.ts_code.as_str();
        let date = r.trade_date.to_string();
        let date = date.as_str();
        let close = r.close.to_string();
        writer.write_record([code, date, "price", "close", close.as_str(), ""])?;
        for (key, value) in &r.deviation {
            let value = fmt_opt(*value, 6);
            writer.write_record([code, date, "deviation", key.as_str(), value.as_str(), ""])?;
        }
        for s in &r.signals {
            let today = s.today.clone().unwrap_or_default();
            let detail = format!(
                "golden={} death={}",
                fmt_cross(s.last_golden),
                fmt_cross(s.last_death)
            );
            writer.write_record([
                code,
                date,
                "signal",
                s.key.as_str(),
                today.as_str(),
                detail.as_str(),
            ])?;
        }
        for p in &r.percentiles {
            let value = fmt_opt(p.value, 2);
            writer.write_record([
                code,
                date,
                "percentile",
                p.key.as_str(),
                value.as_str(),
                p.level.as_str(),
            ])?;
        }
    }
    writer.flush()?;
    Ok(())
}

fn run_report(
    config: &Config,
    ts_code: Option<String>,
    format: ReportFormat,
    output: Option<PathBuf>,
) -> anyhow::Result<()> {
    let store = open_store(config)?;
    let mut reports = Vec::new();
    for spec in selected_symbols(config, ts_code)? {
        let rows = store.load_rows(&spec.ts_code, None, None)?;
        match build_report(&spec, &rows) {
            Some(report) => reports.push(report),
            None => eprintln!("{} {}: no stored rows", "Warning:".yellow(), spec.ts_code),
        }
    }

    match (format, output) {
        (ReportFormat::Table, _) => reports.iter().for_each(print_report_table),
        (ReportFormat::Json, None) => println!("{}", serde_json::to_string_pretty(&reports)?),
        (ReportFormat::Json, Some(path)) => {
            fs::write(&path, serde_json::to_string_pretty(&reports)?)?;
            println!("{} Report saved to: {}", "✓".green().bold(), path.display());
        }
        (ReportFormat::Csv, None) => write_report_csv(&reports, std::io::stdout())?,
        (ReportFormat::Csv, Some(path)) => {
            write_report_csv(&reports, fs::File::create(&path)?)?;
            println!("{} Report saved to: {}", "✓".green().bold(), path.display());
        }
    }
    Ok(())
}

fn show_info(config: &Config, config_path: Option<&PathBuf>, detailed: bool) -> anyhow::Result<()> {
    println!(
        "{} {}",
        "rusty-ashare".cyan().bold(),
        format!("v{}", env!("CARGO_PKG_VERSION")).dimmed()
    );
    println!("{}", env!("CARGO_PKG_DESCRIPTION"));
    println!();

    println!("{}", "Configuration".bold());
    println!("{}", "=============".dimmed());
    let path = config_path.cloned().unwrap_or_else(Config::default_path);
    println!("  {} {}", "Config file:".bold(), path.display());
    println!("  {} {}", "Database:".bold(), config.database_path.display());
    println!("  {} {}", "Chart directory:".bold(), config.chart_dir.display());
    println!(
        "  {} {}",
        "Tushare token:".bold(),
        if config.tushare.token.is_empty() { "missing".red() } else { "set".green() }
    );
    println!("  {} {}", "Max concurrency:".bold(), config.sync.max_concurrency);
    println!(
        "  {} {} years",
        "Percentile lookback:".bold(),
        config.percentile.lookback_years
    );
    println!();

    println!("{}", "Symbols".bold());
    println!("{}", "=======".dimmed());
    let store = if detailed { Some(open_store(config)?) } else { None };
    for spec in config.symbols() {
        let mut line = format!("  {:<10} {:<6} {}", spec.ts_code, spec.kind.to_string(), spec.name);
        if spec.with_valuation {
            line.push_str(" [valuation]");
        }
        println!("{}", line);
        if let Some(store) = &store {
            let count = store.count_rows(&spec.ts_code)?;
            let last = store
                .max_trade_date(&spec.ts_code)?
                .map(|d| d.to_string())
                .unwrap_or_else(|| "-".to_string());
            println!("      {} rows, last {}", count, last.dimmed());
        }
    }
    println!();
    Ok(())
}
