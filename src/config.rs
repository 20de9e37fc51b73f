//! Runtime configuration loaded from TOML

use chrono::NaiveDate;
use hashbrown::HashSet;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{AshareError, Result};
use crate::pipeline::IndicatorConfig;
use crate::types::{SymbolKind, TRADING_DAYS_PER_YEAR};

/// Environment variable that overrides `tushare.token`
pub const TOKEN_ENV: &str = "TUSHARE_TOKEN";

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,
    #[serde(default = "default_chart_dir")]
    pub chart_dir: PathBuf,
    #[serde(default)]
    pub tushare: TushareConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default = "default_indices")]
    pub indices: Vec<IndexEntry>,
    #[serde(default = "default_funds")]
    pub funds: Vec<FundEntry>,
    #[serde(default)]
    pub indicators: IndicatorProfiles,
    #[serde(default)]
    pub percentile: PercentileConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TushareConfig {
    #[serde(default)]
    pub token: String,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Minimum delay between two upstream calls
    #[serde(default = "default_api_sleep_ms")]
    pub api_sleep_ms: u64,
    /// Wait before the single retry of a failed call
    #[serde(default = "default_retry_cooldown_ms")]
    pub retry_cooldown_ms: u64,
    #[serde(default = "default_http_timeout")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    #[serde(default = "default_symbol_timeout")]
    pub symbol_timeout_secs: u64,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Start of reference data history when nothing is stored yet
    #[serde(default = "default_start_date")]
    pub default_start_date: NaiveDate,
    /// Fundamentals are re-fetched this many days back to pick up restatements
    #[serde(default = "default_overlap_days")]
    pub fundamentals_overlap_days: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexEntry {
    pub ts_code: String,
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_start_date")]
    pub history_start: NaiveDate,
    #[serde(default = "default_true")]
    pub with_valuation: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FundEntry {
    pub ts_code: String,
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_start_date")]
    pub history_start: NaiveDate,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndicatorProfiles {
    #[serde(default = "IndicatorConfig::index")]
    pub index: IndicatorConfig,
    #[serde(default = "IndicatorConfig::fund")]
    pub fund: IndicatorConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PercentileConfig {
    #[serde(default = "default_lookback_years")]
    pub lookback_years: usize,
    #[serde(default = "default_precision")]
    pub precision: u32,
}

/// One symbol to sync, resolved from the config lists
#[derive(Debug, Clone, PartialEq)]
pub struct SymbolSpec {
    pub ts_code: String,
    pub name: String,
    pub kind: SymbolKind,
    pub history_start: NaiveDate,
    pub with_valuation: bool,
}

fn data_root() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".rusty-ashare")
}

fn default_database_path() -> PathBuf {
    data_root().join("ashare.db")
}

fn default_chart_dir() -> PathBuf {
    data_root().join("charts")
}

fn default_base_url() -> String {
    "http://api.tushare.pro".to_string()
}

fn default_api_sleep_ms() -> u64 {
    300
}

fn default_retry_cooldown_ms() -> u64 {
    50_000
}

fn default_http_timeout() -> u64 {
    30
}

fn default_max_concurrency() -> usize {
    4
}

fn default_symbol_timeout() -> u64 {
    600
}

fn default_batch_size() -> usize {
    100
}

fn default_start_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2015, 1, 1).unwrap_or_default()
}

fn default_overlap_days() -> i64 {
    93
}

fn default_true() -> bool {
    true
}

fn default_lookback_years() -> usize {
    5
}

fn default_precision() -> u32 {
    2
}

fn default_indices() -> Vec<IndexEntry> {
    let entry = |code: &str, name: &str, start: NaiveDate, with_valuation: bool| IndexEntry {
        ts_code: code.to_string(),
        name: name.to_string(),
        history_start: start,
        with_valuation,
    };
    let star_start = NaiveDate::from_ymd_opt(2020, 3, 15).unwrap_or_else(default_start_date);
    vec![
        entry("399001.SZ", "深证成指", default_start_date(), true),
        entry("399006.SZ", "创业板指", default_start_date(), true),
        // no published constituent weights
        entry("000001.SH", "上证指数", default_start_date(), false),
        entry("000300.SH", "沪深300", default_start_date(), true),
        entry("000688.SH", "科创50", star_start, true),
        entry("000852.SH", "中证1000", default_start_date(), true),
    ]
}

fn default_funds() -> Vec<FundEntry> {
    vec![FundEntry {
        ts_code: "510300.SH".to_string(),
        name: "沪深300ETF".to_string(),
        history_start: default_start_date(),
    }]
}

impl Default for TushareConfig {
    fn default() -> Self {
        Self {
            token: String::new(),
            base_url: default_base_url(),
            api_sleep_ms: default_api_sleep_ms(),
            retry_cooldown_ms: default_retry_cooldown_ms(),
            timeout_secs: default_http_timeout(),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            symbol_timeout_secs: default_symbol_timeout(),
            batch_size: default_batch_size(),
            default_start_date: default_start_date(),
            fundamentals_overlap_days: default_overlap_days(),
        }
    }
}

impl Default for IndicatorProfiles {
    fn default() -> Self {
        Self {
            index: IndicatorConfig::index(),
            fund: IndicatorConfig::fund(),
        }
    }
}

impl IndicatorProfiles {
    pub fn for_kind(&self, kind: SymbolKind) -> &IndicatorConfig {
        match kind {
            SymbolKind::Fund => &self.fund,
            SymbolKind::Index | SymbolKind::Stock => &self.index,
        }
    }
}

impl Default for PercentileConfig {
    fn default() -> Self {
        Self {
            lookback_years: default_lookback_years(),
            precision: default_precision(),
        }
    }
}

impl PercentileConfig {
    /// Window length in rows
    pub fn lookback_rows(&self) -> usize {
        self.lookback_years * TRADING_DAYS_PER_YEAR
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            chart_dir: default_chart_dir(),
            tushare: TushareConfig::default(),
            sync: SyncConfig::default(),
            indices: default_indices(),
            funds: default_funds(),
            indicators: IndicatorProfiles::default(),
            percentile: PercentileConfig::default(),
        }
    }
}

impl Config {
    /// Default config file location
    pub fn default_path() -> PathBuf {
        data_root().join("config.toml")
    }

    /// Load from `path`, or from the default location when `None`. A
    /// missing file yields the built-in defaults; a file that does not
    /// parse is a configuration error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = path.map(Path::to_path_buf).unwrap_or_else(Self::default_path);
        let mut config = if path.exists() {
            let contents = fs::read_to_string(&path)?;
            debug!("Loading config from {}", path.display());
            Self::from_toml_str(&contents)?
        } else {
            debug!("No config at {}, using defaults", path.display());
            Self::default()
        };

        if let Ok(token) = std::env::var(TOKEN_ENV) {
            if !token.trim().is_empty() {
                config.tushare.token = token.trim().to_string();
            }
        }
        Ok(config)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self> {
        toml::from_str(contents)
            .map_err(|e| AshareError::ConfigError(format!("Failed to parse config: {}", e)))
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| AshareError::ConfigError(format!("Failed to serialize config: {}", e)))
    }

    /// Create the directories the database and charts live in
    pub fn ensure_dirs(&self) -> Result<()> {
        if let Some(parent) = self.database_path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::create_dir_all(&self.chart_dir)?;
        Ok(())
    }

    /// Check everything that can be checked without I/O
    pub fn validate(&self) -> Result<()> {
        let bad = |msg: String| Err(AshareError::ConfigError(msg));

        self.indicators.index.validate()?;
        self.indicators.fund.validate()?;

        if self.percentile.lookback_rows() < 2 {
            return bad("percentile.lookback_years must be at least 1".into());
        }
        if self.percentile.precision > 10 {
            return bad(format!(
                "percentile.precision {} is too large",
                self.percentile.precision
            ));
        }
        if self.sync.max_concurrency == 0 {
            return bad("sync.max_concurrency must be greater than 0".into());
        }
        if self.sync.batch_size == 0 {
            return bad("sync.batch_size must be greater than 0".into());
        }
        if self.sync.symbol_timeout_secs == 0 {
            return bad("sync.symbol_timeout_secs must be greater than 0".into());
        }
        if self.sync.fundamentals_overlap_days < 0 {
            return bad("sync.fundamentals_overlap_days must not be negative".into());
        }
        if self.indices.is_empty() && self.funds.is_empty() {
            return bad("no indices or funds configured".into());
        }
        if self.tushare.base_url.trim().is_empty() {
            return bad("tushare.base_url is empty".into());
        }

        let mut seen = HashSet::new();
        for spec in self.symbols() {
            if spec.ts_code.trim().is_empty() {
                return bad("empty ts_code in symbol list".into());
            }
            if !seen.insert(spec.ts_code.clone()) {
                return bad(format!("{} is configured twice", spec.ts_code));
            }
        }
        Ok(())
    }

    /// Every configured symbol, indices first
    pub fn symbols(&self) -> Vec<SymbolSpec> {
        let indices = self.indices.iter().map(|e| SymbolSpec {
            ts_code: e.ts_code.clone(),
            name: e.name.clone(),
            kind: SymbolKind::Index,
            history_start: e.history_start,
            with_valuation: e.with_valuation,
        });
        let funds = self.funds.iter().map(|e| SymbolSpec {
            ts_code: e.ts_code.clone(),
            name: e.name.clone(),
            kind: SymbolKind::Fund,
            history_start: e.history_start,
            with_valuation: false,
        });
        indices.chain(funds).collect()
    }

    /// Look up one configured symbol
    pub fn symbol(&self, ts_code: &str) -> Option<SymbolSpec> {
        let found = self.symbols().into_iter().find(|s| s.ts_code == ts_code);
        if found.is_none() {
            warn!("{} is not a configured symbol", ts_code);
        }
        found
    }
}
