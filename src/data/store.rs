//! SQLite persistence for price rows and reference data
//!
//! Every table has a natural unique key and all writes are
//! `INSERT ... ON CONFLICT DO UPDATE`, so re-writing a date range leaves the
//! same rows behind. Batches run inside a transaction; a batch that fails
//! twice is written row by row and the rows that still fail are counted.

use chrono::NaiveDate;
use log::{debug, warn};
use rusqlite::{params, Connection, OptionalExtension, Row, Statement};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use crate::error::{AshareError, Result};
use crate::pipeline::{
    ConstituentWeight, CrossSignalMap, DailyFundamental, DeviationMap, IndexValuationSnapshot,
    IndicatorRow, KeyedMap, MaKey, PercentileMap, StockListing, ValuationSource, WmaKey,
};
use crate::types::{PriceBar, Symbol, TradeDate};

/// Outcome of an upsert call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PersistReport {
    pub written: usize,
    pub failed: usize,
}

impl PersistReport {
    pub fn merge(&mut self, other: PersistReport) {
        self.written += other.written;
        self.failed += other.failed;
    }
}

const PRICE_COLUMNS: &[&str] = &[
    "ts_code",
    "trade_date",
    "open",
    "high",
    "low",
    "close",
    "pre_close",
    "change",
    "pct_chg",
    "vol",
    "amount",
    "ma",
    "wma",
    "macd",
    "macd_signal",
    "macd_histogram",
    "rsi",
    "kdj_k",
    "kdj_d",
    "kdj_j",
    "bb_upper",
    "bb_mid",
    "bb_lower",
    "obv",
    "pe_ttm",
    "pb",
    "deviation",
    "cross_signals",
    "percentiles",
];

const WEIGHT_COLUMNS: &[&str] = &["index_code", "con_code", "trade_date", "weight"];

const LISTING_COLUMNS: &[&str] = &["ts_code", "name", "list_status", "list_date", "delist_date"];

const FUNDAMENTAL_COLUMNS: &[&str] = &[
    "ts_code",
    "trade_date",
    "close",
    "pe",
    "pe_ttm",
    "pb",
    "total_mv",
    "circ_mv",
];

const VALUATION_COLUMNS: &[&str] = &[
    "index_code",
    "trade_date",
    "weighted_pe",
    "weighted_pe_ttm",
    "weighted_pb",
    "equal_weight_pe",
    "equal_weight_pe_ttm",
    "equal_weight_pb",
    "valid_pe",
    "valid_pe_ttm",
    "valid_pb",
    "total_stocks",
];

/// `INSERT ... ON CONFLICT(key) DO UPDATE SET` every non-key column
fn upsert_sql(table: &str, columns: &[&str], key: &[&str]) -> String {
    let placeholders: Vec<String> = (1..=columns.len()).map(|i| format!("?{}", i)).collect();
    let updates: Vec<String> = columns
        .iter()
        .filter(|c| !key.contains(c))
        .map(|c| format!("{c} = excluded.{c}"))
        .collect();
    format!(
        "INSERT INTO {} ({}) VALUES ({}) ON CONFLICT({}) DO UPDATE SET {}",
        table,
        columns.join(", "),
        placeholders.join(", "),
        key.join(", "),
        updates.join(", ")
    )
}

fn ma_blob(values: &BTreeMap<usize, Option<f64>>) -> String {
    values
        .iter()
        .map(|(&p, &v)| (MaKey(p), v))
        .collect::<KeyedMap<MaKey, f64>>()
        .to_blob()
}

fn wma_blob(values: &BTreeMap<usize, Option<f64>>) -> String {
    values
        .iter()
        .map(|(&p, &v)| (WmaKey(p), v))
        .collect::<KeyedMap<WmaKey, f64>>()
        .to_blob()
}

fn bar_from_row(row: &Row<'_>) -> rusqlite::Result<PriceBar> {
    Ok(PriceBar {
        ts_code: row.get("ts_code")?,
        trade_date: row.get("trade_date")?,
        open: row.get("open")?,
        high: row.get("high")?,
        low: row.get("low")?,
        close: row.get("close")?,
        pre_close: row.get("pre_close")?,
        change: row.get("change")?,
        pct_chg: row.get("pct_chg")?,
        vol: row.get("vol")?,
        amount: row.get("amount")?,
    })
}

fn indicator_row_from_row(row: &Row<'_>) -> rusqlite::Result<IndicatorRow> {
    let blob = |name: &str| -> rusqlite::Result<String> {
        Ok(row.get::<_, Option<String>>(name)?.unwrap_or_else(|| "{}".to_string()))
    };

    let ma = KeyedMap::<MaKey, f64>::from_blob(&blob("ma")?)
        .iter()
        .map(|(k, v)| (k.0, v.copied()))
        .collect();
    let wma = KeyedMap::<WmaKey, f64>::from_blob(&blob("wma")?)
        .iter()
        .map(|(k, v)| (k.0, v.copied()))
        .collect();

    Ok(IndicatorRow {
        bar: bar_from_row(row)?,
        ma,
        wma,
        macd: row.get("macd")?,
        macd_signal: row.get("macd_signal")?,
        macd_histogram: row.get("macd_histogram")?,
        rsi: row.get("rsi")?,
        kdj_k: row.get("kdj_k")?,
        kdj_d: row.get("kdj_d")?,
        kdj_j: row.get("kdj_j")?,
        bb_upper: row.get("bb_upper")?,
        bb_mid: row.get("bb_mid")?,
        bb_lower: row.get("bb_lower")?,
        obv: row.get("obv")?,
        pe_ttm: row.get("pe_ttm")?,
        pb: row.get("pb")?,
        deviation: DeviationMap::from_blob(&blob("deviation")?),
        cross: CrossSignalMap::from_blob(&blob("cross_signals")?),
        percentile: PercentileMap::from_blob(&blob("percentiles")?),
    })
}

fn weight_from_row(row: &Row<'_>) -> rusqlite::Result<ConstituentWeight> {
    Ok(ConstituentWeight {
        index_code: row.get("index_code")?,
        con_code: row.get("con_code")?,
        trade_date: row.get("trade_date")?,
        weight: row.get("weight")?,
    })
}

fn listing_from_row(row: &Row<'_>) -> rusqlite::Result<StockListing> {
    Ok(StockListing {
        ts_code: row.get("ts_code")?,
        name: row.get::<_, Option<String>>("name")?.unwrap_or_default(),
        list_status: row.get::<_, Option<String>>("list_status")?.unwrap_or_default(),
        list_date: row.get("list_date")?,
        delist_date: row.get("delist_date")?,
    })
}

fn fundamental_from_row(row: &Row<'_>) -> rusqlite::Result<DailyFundamental> {
    Ok(DailyFundamental {
        ts_code: row.get("ts_code")?,
        trade_date: row.get("trade_date")?,
        close: row.get("close")?,
        pe: row.get("pe")?,
        pe_ttm: row.get("pe_ttm")?,
        pb: row.get("pb")?,
        total_mv: row.get("total_mv")?,
        circ_mv: row.get("circ_mv")?,
    })
}

fn valuation_from_row(row: &Row<'_>) -> rusqlite::Result<IndexValuationSnapshot> {
    Ok(IndexValuationSnapshot {
        index_code: row.get("index_code")?,
        trade_date: row.get("trade_date")?,
        weighted_pe: row.get("weighted_pe")?,
        weighted_pe_ttm: row.get("weighted_pe_ttm")?,
        weighted_pb: row.get("weighted_pb")?,
        equal_weight_pe: row.get("equal_weight_pe")?,
        equal_weight_pe_ttm: row.get("equal_weight_pe_ttm")?,
        equal_weight_pb: row.get("equal_weight_pb")?,
        valid_pe: row.get::<_, i64>("valid_pe")? as usize,
        valid_pe_ttm: row.get::<_, i64>("valid_pe_ttm")? as usize,
        valid_pb: row.get::<_, i64>("valid_pb")? as usize,
        total_stocks: row.get::<_, i64>("total_stocks")? as usize,
    })
}

fn bind_indicator_row(stmt: &mut Statement<'_>, r: &IndicatorRow) -> rusqlite::Result<usize> {
    let b = &r.bar;
    stmt.execute(params![
        &b.ts_code,
        b.trade_date,
        b.open,
        b.high,
        b.low,
        b.close,
        b.pre_close,
        b.change,
        b.pct_chg,
        b.vol,
        b.amount,
        ma_blob(&r.ma),
        wma_blob(&r.wma),
        r.macd,
        r.macd_signal,
        r.macd_histogram,
        r.rsi,
        r.kdj_k,
        r.kdj_d,
        r.kdj_j,
        r.bb_upper,
        r.bb_mid,
        r.bb_lower,
        r.obv,
        r.pe_ttm,
        r.pb,
        r.deviation.to_blob(),
        r.cross.to_blob(),
        r.percentile.to_blob(),
    ])
}

fn bind_weight(stmt: &mut Statement<'_>, w: &ConstituentWeight) -> rusqlite::Result<usize> {
    stmt.execute(params![&w.index_code, &w.con_code, w.trade_date, w.weight])
}

fn bind_listing(stmt: &mut Statement<'_>, l: &StockListing) -> rusqlite::Result<usize> {
    stmt.execute(params![
        &l.ts_code,
        &l.name,
        &l.list_status,
        l.list_date,
        l.delist_date
    ])
}

fn bind_fundamental(stmt: &mut Statement<'_>, f: &DailyFundamental) -> rusqlite::Result<usize> {
    stmt.execute(params![
        &f.ts_code,
        f.trade_date,
        f.close,
        f.pe,
        f.pe_ttm,
        f.pb,
        f.total_mv,
        f.circ_mv
    ])
}

fn bind_valuation(stmt: &mut Statement<'_>, v: &IndexValuationSnapshot) -> rusqlite::Result<usize> {
    stmt.execute(params![
        &v.index_code,
        v.trade_date,
        v.weighted_pe,
        v.weighted_pe_ttm,
        v.weighted_pb,
        v.equal_weight_pe,
        v.equal_weight_pe_ttm,
        v.equal_weight_pb,
        v.valid_pe as i64,
        v.valid_pe_ttm as i64,
        v.valid_pb as i64,
        v.total_stocks as i64,
    ])
}

/// Local time-series and reference store
pub struct TimeSeriesStore {
    conn: Mutex<Connection>,
    batch_size: usize,
}

impl TimeSeriesStore {
    /// Create or open database at path
    pub fn open(db_path: &Path) -> Result<Self> {
        let conn = Connection::open(db_path).map_err(|e| {
            AshareError::Persistence(format!(
                "Failed to open database {}: {}",
                db_path.display(),
                e
            ))
        })?;
        Self::with_connection(conn)
    }

    /// Create in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|e| {
            AshareError::Persistence(format!("Failed to create in-memory database: {}", e))
        })?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        let store = Self {
            conn: Mutex::new(conn),
            batch_size: 100,
        };
        store.create_tables()?;
        Ok(store)
    }

    /// Rows per upsert transaction
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| AshareError::Persistence("store connection lock poisoned".to_string()))
    }

    fn create_tables(&self) -> Result<()> {
        self.lock()?.execute_batch(
            "CREATE TABLE IF NOT EXISTS price_rows (
                ts_code TEXT NOT NULL,
                trade_date TEXT NOT NULL,
                open REAL NOT NULL,
                high REAL NOT NULL,
                low REAL NOT NULL,
                close REAL NOT NULL,
                pre_close REAL,
                change REAL,
                pct_chg REAL,
                vol REAL,
                amount REAL,
                ma TEXT,
                wma TEXT,
                macd REAL,
                macd_signal REAL,
                macd_histogram REAL,
                rsi REAL,
                kdj_k REAL,
                kdj_d REAL,
                kdj_j REAL,
                bb_upper REAL,
                bb_mid REAL,
                bb_lower REAL,
                obv REAL,
                pe_ttm REAL,
                pb REAL,
                deviation TEXT,
                cross_signals TEXT,
                percentiles TEXT,
                UNIQUE(ts_code, trade_date)
            );
            CREATE TABLE IF NOT EXISTS index_weights (
                index_code TEXT NOT NULL,
                con_code TEXT NOT NULL,
                trade_date TEXT NOT NULL,
                weight REAL NOT NULL,
                UNIQUE(index_code, con_code, trade_date)
            );
            CREATE TABLE IF NOT EXISTS stock_basic (
                ts_code TEXT NOT NULL UNIQUE,
                name TEXT,
                list_status TEXT,
                list_date TEXT,
                delist_date TEXT
            );
            CREATE TABLE IF NOT EXISTS daily_basic (
                ts_code TEXT NOT NULL,
                trade_date TEXT NOT NULL,
                close REAL,
                pe REAL,
                pe_ttm REAL,
                pb REAL,
                total_mv REAL,
                circ_mv REAL,
                UNIQUE(ts_code, trade_date)
            );
            CREATE TABLE IF NOT EXISTS index_valuations (
                index_code TEXT NOT NULL,
                trade_date TEXT NOT NULL,
                weighted_pe REAL,
                weighted_pe_ttm REAL,
                weighted_pb REAL,
                equal_weight_pe REAL,
                equal_weight_pe_ttm REAL,
                equal_weight_pb REAL,
                valid_pe INTEGER NOT NULL,
                valid_pe_ttm INTEGER NOT NULL,
                valid_pb INTEGER NOT NULL,
                total_stocks INTEGER NOT NULL,
                UNIQUE(index_code, trade_date)
            );
            CREATE INDEX IF NOT EXISTS idx_daily_basic_date ON daily_basic(trade_date);",
        )?;
        Ok(())
    }

    fn write_batch<T>(
        conn: &mut Connection,
        sql: &str,
        chunk: &[T],
        bind: &impl Fn(&mut Statement<'_>, &T) -> rusqlite::Result<usize>,
    ) -> rusqlite::Result<()> {
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(sql)?;
            for item in chunk {
                bind(&mut stmt, item)?;
            }
        }
        tx.commit()
    }

    fn upsert_all<T>(
        &self,
        table: &str,
        sql: &str,
        items: &[T],
        bind: impl Fn(&mut Statement<'_>, &T) -> rusqlite::Result<usize>,
    ) -> Result<PersistReport> {
        let mut conn = self.lock()?;
        let mut report = PersistReport::default();

        for chunk in items.chunks(self.batch_size) {
            let first = Self::write_batch(&mut conn, sql, chunk, &bind);
            let outcome = match first {
                Ok(()) => Ok(()),
                Err(e) => {
                    warn!("{}: batch of {} failed ({}), retrying", table, chunk.len(), e);
                    Self::write_batch(&mut conn, sql, chunk, &bind)
                }
            };

            match outcome {
                Ok(()) => report.written += chunk.len(),
                Err(e) => {
                    warn!("{}: batch failed again ({}), writing rows one by one", table, e);
                    for item in chunk {
                        match conn.prepare_cached(sql).and_then(|mut stmt| bind(&mut stmt, item)) {
                            Ok(_) => report.written += 1,
                            Err(e) => {
                                warn!("{}: row failed: {}", table, e);
                                report.failed += 1;
                            }
                        }
                    }
                }
            }
        }

        debug!("{}: {} written, {} failed", table, report.written, report.failed);
        Ok(report)
    }

    /// Insert or update computed rows keyed by (ts_code, trade_date)
    pub fn upsert_rows(&self, rows: &[IndicatorRow]) -> Result<PersistReport> {
        let sql = upsert_sql("price_rows", PRICE_COLUMNS, &["ts_code", "trade_date"]);
        self.upsert_all("price_rows", &sql, rows, bind_indicator_row)
    }

    pub fn upsert_weights(&self, weights: &[ConstituentWeight]) -> Result<PersistReport> {
        let sql = upsert_sql(
            "index_weights",
            WEIGHT_COLUMNS,
            &["index_code", "con_code", "trade_date"],
        );
        self.upsert_all("index_weights", &sql, weights, bind_weight)
    }

    pub fn upsert_listings(&self, listings: &[StockListing]) -> Result<PersistReport> {
        let sql = upsert_sql("stock_basic", LISTING_COLUMNS, &["ts_code"]);
        self.upsert_all("stock_basic", &sql, listings, bind_listing)
    }

    pub fn upsert_fundamentals(&self, rows: &[DailyFundamental]) -> Result<PersistReport> {
        let sql = upsert_sql("daily_basic", FUNDAMENTAL_COLUMNS, &["ts_code", "trade_date"]);
        self.upsert_all("daily_basic", &sql, rows, bind_fundamental)
    }

    pub fn upsert_valuations(&self, rows: &[IndexValuationSnapshot]) -> Result<PersistReport> {
        let sql = upsert_sql(
            "index_valuations",
            VALUATION_COLUMNS,
            &["index_code", "trade_date"],
        );
        self.upsert_all("index_valuations", &sql, rows, bind_valuation)
    }

    /// Latest stored trade date of a symbol
    pub fn max_trade_date(&self, ts_code: &str) -> Result<Option<NaiveDate>> {
        let conn = self.lock()?;
        let date = conn.query_row(
            "SELECT MAX(trade_date) FROM price_rows WHERE ts_code = ?1",
            params![ts_code],
            |row| row.get::<_, Option<NaiveDate>>(0),
        )?;
        Ok(date)
    }

    /// Stored bars of a symbol, ascending, optionally bounded
    pub fn load_bars(
        &self,
        ts_code: &str,
        start: Option<TradeDate>,
        end: Option<TradeDate>,
    ) -> Result<Vec<PriceBar>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {} FROM price_rows
             WHERE ts_code = ?1 AND (?2 IS NULL OR trade_date >= ?2) AND (?3 IS NULL OR trade_date <= ?3)
             ORDER BY trade_date",
            PRICE_COLUMNS.join(", ")
        ))?;
        let bars = stmt
            .query_map(params![ts_code, start, end], bar_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(bars)
    }

    /// Stored rows of a symbol with all derived columns, ascending.
    /// Malformed blobs decode as empty maps.
    pub fn load_rows(
        &self,
        ts_code: &str,
        start: Option<TradeDate>,
        end: Option<TradeDate>,
    ) -> Result<Vec<IndicatorRow>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {} FROM price_rows
             WHERE ts_code = ?1 AND (?2 IS NULL OR trade_date >= ?2) AND (?3 IS NULL OR trade_date <= ?3)
             ORDER BY trade_date",
            PRICE_COLUMNS.join(", ")
        ))?;
        let rows = stmt
            .query_map(params![ts_code, start, end], indicator_row_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Number of stored rows for a symbol
    pub fn count_rows(&self, ts_code: &str) -> Result<usize> {
        let conn = self.lock()?;
        let n: i64 = conn.query_row(
            "SELECT COUNT(*) FROM price_rows WHERE ts_code = ?1",
            params![ts_code],
            |row| row.get(0),
        )?;
        Ok(n as usize)
    }

    /// Latest weight snapshot date of an index
    pub fn max_weight_date(&self, index_code: &str) -> Result<Option<NaiveDate>> {
        let conn = self.lock()?;
        let date = conn.query_row(
            "SELECT MAX(trade_date) FROM index_weights WHERE index_code = ?1",
            params![index_code],
            |row| row.get::<_, Option<NaiveDate>>(0),
        )?;
        Ok(date)
    }

    /// Latest stored fundamentals date of a stock
    pub fn max_fundamental_date(&self, ts_code: &str) -> Result<Option<NaiveDate>> {
        let conn = self.lock()?;
        let date = conn
            .query_row(
                "SELECT trade_date FROM daily_basic WHERE ts_code = ?1
                 ORDER BY trade_date DESC LIMIT 1",
                params![ts_code],
                |row| row.get::<_, NaiveDate>(0),
            )
            .optional()?;
        Ok(date)
    }

    /// Stored valuation snapshots of an index, ascending
    pub fn load_valuations(
        &self,
        index_code: &str,
        start: Option<TradeDate>,
        end: Option<TradeDate>,
    ) -> Result<Vec<IndexValuationSnapshot>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {} FROM index_valuations
             WHERE index_code = ?1 AND (?2 IS NULL OR trade_date >= ?2) AND (?3 IS NULL OR trade_date <= ?3)
             ORDER BY trade_date",
            VALUATION_COLUMNS.join(", ")
        ))?;
        let rows = stmt
            .query_map(params![index_code, start, end], valuation_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }
}

impl ValuationSource for TimeSeriesStore {
    /// The most recent snapshot on or before `end`; when `[start, end]`
    /// holds snapshots that is the newest of them
    fn latest_weights(
        &self,
        index_code: &str,
        _start: TradeDate,
        end: TradeDate,
    ) -> Result<Vec<ConstituentWeight>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {} FROM index_weights
             WHERE index_code = ?1 AND trade_date = (
                 SELECT MAX(trade_date) FROM index_weights WHERE index_code = ?1 AND trade_date <= ?2
             )
             ORDER BY con_code",
            WEIGHT_COLUMNS.join(", ")
        ))?;
        let rows = stmt
            .query_map(params![index_code, end], weight_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    fn active_listings(&self, start: TradeDate, end: TradeDate) -> Result<Vec<StockListing>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {} FROM stock_basic
             WHERE list_date IS NOT NULL AND list_date <= ?1
               AND (delist_date IS NULL OR delist_date >= ?2)
             ORDER BY ts_code",
            LISTING_COLUMNS.join(", ")
        ))?;
        let rows = stmt
            .query_map(params![start, end], listing_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    fn fundamentals_between(
        &self,
        codes: &[Symbol],
        start: TradeDate,
        end: TradeDate,
    ) -> Result<Vec<DailyFundamental>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {} FROM daily_basic
             WHERE ts_code = ?1 AND trade_date >= ?2 AND trade_date <= ?3
             ORDER BY trade_date",
            FUNDAMENTAL_COLUMNS.join(", ")
        ))?;

        let mut out = Vec::new();
        for code in codes {
            let rows = stmt
                .query_map(params![code, start, end], fundamental_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            out.extend(rows);
        }
        Ok(out)
    }
}
