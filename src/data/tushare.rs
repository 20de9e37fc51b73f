//! Tushare Pro HTTP client
//!
//! Every endpoint takes `{api_name, token, params, fields}` and answers with
//! a row-oriented frame `{fields: [...], items: [[...], ...]}`. Rows are
//! mapped to entities by looking up column positions by name.

use chrono::NaiveDate;
use hashbrown::HashMap;
use log::{debug, warn};
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

use super::MarketDataSource;
use crate::config::TushareConfig;
use crate::error::{AshareError, Result};
use crate::pipeline::{ConstituentWeight, DailyFundamental, StockListing};
use crate::types::{format_compact_date, parse_compact_date, Exchange, PriceBar, SymbolKind, TradeDate};

/// Rows per page of paged endpoints
const PAGE_LIMIT: usize = 1000;

const DAILY_FIELDS: &str =
    "ts_code,trade_date,open,high,low,close,pre_close,change,pct_chg,vol,amount";
const DAILY_BASIC_FIELDS: &str = "ts_code,trade_date,close,pe,pe_ttm,pb,total_mv,circ_mv";
const INDEX_WEIGHT_FIELDS: &str = "index_code,con_code,trade_date,weight";
const STOCK_BASIC_FIELDS: &str = "ts_code,name,list_status,list_date,delist_date";
const TRADE_CAL_FIELDS: &str = "exchange,cal_date,is_open";

#[derive(Debug, Deserialize)]
struct TushareResponse {
    code: i64,
    #[serde(default)]
    msg: Option<String>,
    #[serde(default)]
    data: Option<Frame>,
}

/// Row-oriented result set
#[derive(Debug, Default, Deserialize)]
pub struct Frame {
    pub fields: Vec<String>,
    #[serde(default)]
    pub items: Vec<Vec<Value>>,
}

impl Frame {
    /// Parse a raw response body, mapping a non-zero code to an upstream error
    pub fn from_response(api: &str, body: &str) -> Result<Frame> {
        let response: TushareResponse = serde_json::from_str(body)
            .map_err(|e| AshareError::upstream(api, format!("invalid response: {}", e)))?;
        if response.code != 0 {
            return Err(AshareError::upstream(
                api,
                format!(
                    "code {}: {}",
                    response.code,
                    response.msg.unwrap_or_default()
                ),
            ));
        }
        Ok(response.data.unwrap_or_default())
    }

    fn columns(&self) -> Columns<'_> {
        Columns {
            index: self
                .fields
                .iter()
                .enumerate()
                .map(|(i, name)| (name.as_str(), i))
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Map every row, skipping (and logging) rows that do not decode
    fn decode<T>(&self, api: &str, from_row: impl Fn(&Columns<'_>, &[Value]) -> Result<T>) -> Vec<T> {
        let columns = self.columns();
        self.items
            .iter()
            .filter_map(|row| match from_row(&columns, row) {
                Ok(v) => Some(v),
                Err(e) => {
                    warn!("{}: skipping row: {}", api, e);
                    None
                }
            })
            .collect()
    }
}

/// Column name to position lookup for one frame
struct Columns<'a> {
    index: HashMap<&'a str, usize>,
}

impl<'a> Columns<'a> {
    fn value<'r>(&self, row: &'r [Value], name: &str) -> Option<&'r Value> {
        self.index.get(name).and_then(|&i| row.get(i))
    }

    fn f64(&self, row: &[Value], name: &str) -> Option<f64> {
        match self.value(row, name)? {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.parse().ok(),
            _ => None,
        }
        .filter(|v| v.is_finite())
    }

    fn require_f64(&self, row: &[Value], name: &str) -> Result<f64> {
        self.f64(row, name)
            .ok_or_else(|| AshareError::DataError(format!("missing '{}'", name)))
    }

    fn str(&self, row: &[Value], name: &str) -> Option<String> {
        self.value(row, name)?.as_str().map(str::to_string)
    }

    fn require_str(&self, row: &[Value], name: &str) -> Result<String> {
        self.str(row, name)
            .ok_or_else(|| AshareError::DataError(format!("missing '{}'", name)))
    }

    fn date(&self, row: &[Value], name: &str) -> Result<Option<NaiveDate>> {
        match self.str(row, name) {
            Some(s) if !s.is_empty() => parse_compact_date(&s).map(Some),
            _ => Ok(None),
        }
    }

    fn require_date(&self, row: &[Value], name: &str) -> Result<NaiveDate> {
        self.date(row, name)?
            .ok_or_else(|| AshareError::DataError(format!("missing '{}'", name)))
    }
}

fn price_bar_from_row(cols: &Columns<'_>, row: &[Value]) -> Result<PriceBar> {
    Ok(PriceBar {
        ts_code: cols.require_str(row, "ts_code")?,
        trade_date: cols.require_date(row, "trade_date")?,
        open: cols.require_f64(row, "open")?,
        high: cols.require_f64(row, "high")?,
        low: cols.require_f64(row, "low")?,
        close: cols.require_f64(row, "close")?,
        pre_close: cols.f64(row, "pre_close"),
        change: cols.f64(row, "change"),
        pct_chg: cols.f64(row, "pct_chg"),
        vol: cols.f64(row, "vol"),
        amount: cols.f64(row, "amount"),
    })
}

fn fundamental_from_row(cols: &Columns<'_>, row: &[Value]) -> Result<DailyFundamental> {
    Ok(DailyFundamental {
        ts_code: cols.require_str(row, "ts_code")?,
        trade_date: cols.require_date(row, "trade_date")?,
        close: cols.f64(row, "close"),
        pe: cols.f64(row, "pe"),
        pe_ttm: cols.f64(row, "pe_ttm"),
        pb: cols.f64(row, "pb"),
        total_mv: cols.f64(row, "total_mv"),
        circ_mv: cols.f64(row, "circ_mv"),
    })
}

fn weight_from_row(cols: &Columns<'_>, row: &[Value]) -> Result<ConstituentWeight> {
    Ok(ConstituentWeight {
        index_code: cols.require_str(row, "index_code")?,
        con_code: cols.require_str(row, "con_code")?,
        trade_date: cols.require_date(row, "trade_date")?,
        weight: cols.require_f64(row, "weight")?,
    })
}

fn listing_from_row(cols: &Columns<'_>, row: &[Value]) -> Result<StockListing> {
    Ok(StockListing {
        ts_code: cols.require_str(row, "ts_code")?,
        name: cols.str(row, "name").unwrap_or_default(),
        list_status: cols.str(row, "list_status").unwrap_or_default(),
        list_date: cols.date(row, "list_date")?,
        delist_date: cols.date(row, "delist_date")?,
    })
}

/// Open sessions from a `trade_cal` frame
fn open_days_from_frame(frame: &Frame) -> Vec<TradeDate> {
    frame.decode("trade_cal", |cols, row| {
        let open = cols.f64(row, "is_open").map_or(false, |v| v == 1.0);
        Ok(open.then(|| cols.require_date(row, "cal_date")).transpose()?)
    })
    .into_iter()
    .flatten()
    .collect()
}

/// Rate-limited Tushare client
///
/// Calls from all tasks sharing a client are spaced at least
/// `api_sleep_ms` apart. A failed call is retried once after
/// `retry_cooldown_ms`.
#[derive(Clone)]
pub struct TushareClient {
    token: String,
    base_url: String,
    client: Client,
    min_interval: Duration,
    retry_cooldown: Duration,
    last_request_time: Arc<Mutex<Option<Instant>>>,
}

impl TushareClient {
    /// Create a client; fails when no token is configured
    pub fn new(config: &TushareConfig) -> Result<Self> {
        if config.token.trim().is_empty() {
            return Err(AshareError::ConfigError(format!(
                "no Tushare token: set tushare.token or {}",
                crate::config::TOKEN_ENV
            )));
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| AshareError::DataError(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            token: config.token.clone(),
            base_url: config.base_url.clone(),
            client,
            min_interval: Duration::from_millis(config.api_sleep_ms),
            retry_cooldown: Duration::from_millis(config.retry_cooldown_ms),
            last_request_time: Arc::new(Mutex::new(None)),
        })
    }

    /// Call an endpoint, retrying once after the cooldown
    pub async fn query(&self, api: &str, params: Value, fields: &str) -> Result<Frame> {
        match self.query_once(api, &params, fields).await {
            Ok(frame) => Ok(frame),
            Err(e) => {
                warn!(
                    "{} failed ({}), retrying in {} ms",
                    api,
                    e,
                    self.retry_cooldown.as_millis()
                );
                tokio::time::sleep(self.retry_cooldown).await;
                self.query_once(api, &params, fields).await
            }
        }
    }

    async fn query_once(&self, api: &str, params: &Value, fields: &str) -> Result<Frame> {
        self.enforce_rate_limit().await;

        let body = json!({
            "api_name": api,
            "token": self.token,
            "params": params,
            "fields": fields,
        });
        let response = self
            .client
            .post(&self.base_url)
            .json(&body)
            .send()
            .await
            .map_err(|e| AshareError::upstream(api, format!("HTTP request failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(AshareError::upstream(
                api,
                format!("HTTP {}", response.status()),
            ));
        }

        let text = response
            .text()
            .await
            .map_err(|e| AshareError::upstream(api, format!("read failed: {}", e)))?;
        let frame = Frame::from_response(api, &text)?;
        debug!("{} {} -> {} rows", api, params, frame.len());
        Ok(frame)
    }

    async fn enforce_rate_limit(&self) {
        // held across the sleep so concurrent callers queue up
        let mut last_request = self.last_request_time.lock().await;
        if let Some(last_time) = *last_request {
            let elapsed = last_time.elapsed();
            if elapsed < self.min_interval {
                tokio::time::sleep(self.min_interval - elapsed).await;
            }
        }
        *last_request = Some(Instant::now());
    }

    fn range_params(code_key: &str, code: &str, start: TradeDate, end: TradeDate) -> Value {
        json!({
            code_key: code,
            "start_date": format_compact_date(start),
            "end_date": format_compact_date(end),
        })
    }
}

impl MarketDataSource for TushareClient {
    async fn fetch_daily(
        &self,
        kind: SymbolKind,
        ts_code: &str,
        start: TradeDate,
        end: TradeDate,
    ) -> Result<Vec<PriceBar>> {
        let api = kind.daily_api();
        let mut bars = Vec::new();

        if kind == SymbolKind::Fund {
            let mut offset = 0;
            loop {
                let mut params = Self::range_params("ts_code", ts_code, start, end);
                params["limit"] = json!(PAGE_LIMIT);
                params["offset"] = json!(offset);
                let frame = self.query(api, params, DAILY_FIELDS).await?;
                let page = frame.len();
                bars.extend(frame.decode(api, price_bar_from_row));
                if page < PAGE_LIMIT {
                    break;
                }
                offset += page;
            }
        } else {
            let frame = self
                .query(api, Self::range_params("ts_code", ts_code, start, end), DAILY_FIELDS)
                .await?;
            bars = frame.decode(api, price_bar_from_row);
        }

        if kind == SymbolKind::Index {
            // thousands of CNY upstream, stored in ten-thousands
            for bar in &mut bars {
                bar.amount = bar.amount.map(|a| a / 10.0);
            }
        }
        Ok(bars)
    }

    async fn fetch_trade_calendar(
        &self,
        exchange: Exchange,
        start: TradeDate,
        end: TradeDate,
    ) -> Result<Vec<TradeDate>> {
        let params = Self::range_params("exchange", exchange.as_str(), start, end);
        let frame = self.query("trade_cal", params, TRADE_CAL_FIELDS).await?;
        Ok(open_days_from_frame(&frame))
    }

    async fn fetch_daily_basic(
        &self,
        ts_code: &str,
        start: TradeDate,
        end: TradeDate,
    ) -> Result<Vec<DailyFundamental>> {
        let params = Self::range_params("ts_code", ts_code, start, end);
        let frame = self.query("daily_basic", params, DAILY_BASIC_FIELDS).await?;
        Ok(frame.decode("daily_basic", fundamental_from_row))
    }

    async fn fetch_index_weight(
        &self,
        index_code: &str,
        start: TradeDate,
        end: TradeDate,
    ) -> Result<Vec<ConstituentWeight>> {
        let params = Self::range_params("index_code", index_code, start, end);
        let frame = self.query("index_weight", params, INDEX_WEIGHT_FIELDS).await?;
        Ok(frame.decode("index_weight", weight_from_row))
    }

    async fn fetch_stock_basic(&self, list_status: &str) -> Result<Vec<StockListing>> {
        let params = json!({ "list_status": list_status });
        let frame = self.query("stock_basic", params, STOCK_BASIC_FIELDS).await?;
        Ok(frame.decode("stock_basic", listing_from_row))
    }
}
