use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};

use super::{CandleStore, SettingsStore, TradeLedger};
use crate::error::{Error, Result};
use crate::models::{
    is_aligned, Candle, CloseTrade, NewTrade, PairSettings, Trade, TradeFilter, TradeStatus,
};

const TRADE_COLUMNS: &str = "id, pair, side, entry_price, exit_price, amount, invested, \
     stop_loss, take_profit, status, opened_at, closed_at, pnl";

/// SQLite-backed candle store, trade ledger and settings store
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (or create) the database at `database_url` and run migrations
    ///
    /// # Arguments
    /// * `database_url` - e.g. `sqlite://data.db`
    pub async fn new(database_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        tracing::info!("Connected to SQLite at {}", database_url);

        Ok(Self { pool })
    }

    /// Private in-memory database with the schema applied
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;

        // Every connection to :memory: is a distinct database, so pin a single one
        let pool = SqlitePoolOptions::new()
            .min_connections(1)
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        Ok(Self { pool })
    }

    /// Wrap an existing pool without running migrations
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn table_exists(&self, table: &str) -> Result<bool> {
        let row = sqlx::query("SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?")
            .bind(table)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn timestamp_to_datetime(secs: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp(secs, 0)
        .ok_or_else(|| Error::Validation(format!("Invalid timestamp: {}", secs)))
}

fn candle_from_row(pair: &str, row: &SqliteRow) -> Candle {
    Candle {
        pair: pair.to_string(),
        time: row.get("time"),
        open: row.get("open"),
        high: row.get("high"),
        low: row.get("low"),
        close: row.get("close"),
        volume: row.get("volume"),
    }
}

fn trade_from_row(row: &SqliteRow) -> Result<Trade> {
    let side: String = row.get("side");
    let status: String = row.get("status");
    let opened_at: i64 = row.get("opened_at");
    let closed_at: Option<i64> = row.get("closed_at");

    Ok(Trade {
        id: row.get("id"),
        pair: row.get("pair"),
        side: side.parse()?,
        entry_price: row.get("entry_price"),
        exit_price: row.get("exit_price"),
        amount: row.get("amount"),
        invested: row.get("invested"),
        stop_loss: row.get("stop_loss"),
        take_profit: row.get("take_profit"),
        status: status.parse()?,
        opened_at: timestamp_to_datetime(opened_at)?,
        closed_at: closed_at.map(timestamp_to_datetime).transpose()?,
        pnl: row.get("pnl"),
    })
}

fn settings_from_row(row: &SqliteRow) -> PairSettings {
    PairSettings {
        pair: row.get("pair"),
        max_invest_fiat: row.get("max_invest_fiat"),
        max_per_tx_fiat: row.get("max_per_tx_fiat"),
        take_profit_pct: row.get("take_profit_pct"),
        stop_loss_pct: row.get("stop_loss_pct"),
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}

#[async_trait]
impl CandleStore for SqliteStore {
    async fn get_candles(&self, pair: &str, since: Option<i64>, limit: i64) -> Result<Vec<Candle>> {
        // Newest `limit` rows, re-ordered ascending for the caller
        let rows = sqlx::query(
            r#"
            SELECT time, open, high, low, close, volume
            FROM (
                SELECT time, open, high, low, close, volume
                FROM candles
                WHERE pair = ? AND (? IS NULL OR time >= ?)
                ORDER BY time DESC
                LIMIT ?
            )
            ORDER BY time ASC
            "#,
        )
        .bind(pair)
        .bind(since)
        .bind(since)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(|row| candle_from_row(pair, row)).collect())
    }

    async fn upsert_candles(&self, pair: &str, candles: &[Candle]) -> Result<usize> {
        if candles.is_empty() {
            return Ok(0);
        }

        let kept: Vec<&Candle> = candles.iter().filter(|c| is_aligned(c.time)).collect();

        let mut tx = self.pool.begin().await?;
        let mut written = 0usize;

        for candle in &kept {
            let result = sqlx::query(
                r#"
                INSERT INTO candles (pair, time, open, high, low, close, volume)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT (pair, time) DO UPDATE SET
                    open = excluded.open,
                    high = excluded.high,
                    low = excluded.low,
                    close = excluded.close,
                    volume = excluded.volume
                "#,
            )
            .bind(pair)
            .bind(candle.time)
            .bind(candle.open)
            .bind(candle.high)
            .bind(candle.low)
            .bind(candle.close)
            .bind(candle.volume)
            .execute(&mut *tx)
            .await?;

            written += result.rows_affected() as usize;
        }

        tx.commit().await?;

        tracing::debug!(
            "upsert_candles {}: in={} kept={} written={}",
            pair,
            candles.len(),
            kept.len(),
            written
        );

        Ok(written)
    }

    async fn last_candle_time(&self, pair: &str) -> Result<Option<i64>> {
        let time: Option<i64> = sqlx::query_scalar("SELECT MAX(time) FROM candles WHERE pair = ?")
            .bind(pair)
            .fetch_one(&self.pool)
            .await?;
        Ok(time)
    }

    async fn count_candles(&self, pair: &str, since: Option<i64>, until: Option<i64>) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*)
            FROM candles
            WHERE pair = ?
              AND (? IS NULL OR time >= ?)
              AND (? IS NULL OR time < ?)
            "#,
        )
        .bind(pair)
        .bind(since)
        .bind(since)
        .bind(until)
        .bind(until)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }
}

#[async_trait]
impl TradeLedger for SqliteStore {
    async fn open_trade(&self, trade: NewTrade) -> Result<i64> {
        let open_count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM trades WHERE pair = ? AND status = 'OPEN'",
        )
        .bind(&trade.pair)
        .fetch_one(&self.pool)
        .await?;

        if open_count > 0 {
            return Err(Error::Conflict(format!(
                "{} already has an open trade",
                trade.pair
            )));
        }

        let opened_at = trade.opened_at.unwrap_or_else(Utc::now).timestamp();

        let result = sqlx::query(
            r#"
            INSERT INTO trades (
                pair, side, entry_price, amount, invested,
                stop_loss, take_profit, status, opened_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, 'OPEN', ?)
            "#,
        )
        .bind(&trade.pair)
        .bind(trade.side.as_str())
        .bind(trade.entry_price)
        .bind(trade.amount)
        .bind(trade.invested)
        .bind(trade.stop_loss)
        .bind(trade.take_profit)
        .bind(opened_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                Error::Conflict(format!("{} already has an open trade", trade.pair))
            } else {
                Error::Database(e)
            }
        })?;

        let id = result.last_insert_rowid();
        tracing::debug!("Opened trade #{} for {}", id, trade.pair);

        Ok(id)
    }

    async fn get_trade(&self, id: i64) -> Result<Option<Trade>> {
        let sql = format!("SELECT {} FROM trades WHERE id = ?", TRADE_COLUMNS);
        let row = sqlx::query(&sql).bind(id).fetch_optional(&self.pool).await?;
        row.as_ref().map(trade_from_row).transpose()
    }

    async fn open_trades(&self, pair: Option<&str>) -> Result<Vec<Trade>> {
        let filter = TradeFilter {
            pair: pair.map(str::to_string),
            status: Some(TradeStatus::Open),
            limit: 1000,
            offset: 0,
        };
        self.list_trades(&filter).await
    }

    async fn close_trade(&self, id: i64, close: CloseTrade) -> Result<Trade> {
        let trade = self
            .get_trade(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("trade #{}", id)))?;

        if !trade.is_open() {
            return Err(Error::Conflict(format!("trade #{} is already closed", id)));
        }

        let pnl = trade.pnl_at(close.exit_price);
        let closed_at = close.closed_at.unwrap_or_else(Utc::now).timestamp();

        let result = sqlx::query(
            r#"
            UPDATE trades
            SET exit_price = ?,
                closed_at = ?,
                status = 'CLOSED',
                pnl = ?
            WHERE id = ? AND status = 'OPEN'
            "#,
        )
        .bind(close.exit_price)
        .bind(closed_at)
        .bind(pnl)
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() != 1 {
            return Err(Error::Conflict(format!(
                "trade #{} was not open when closing",
                id
            )));
        }

        self.get_trade(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("trade #{} after close", id)))
    }

    async fn list_trades(&self, filter: &TradeFilter) -> Result<Vec<Trade>> {
        let mut query: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
            "SELECT {} FROM trades WHERE 1 = 1",
            TRADE_COLUMNS
        ));

        if let Some(pair) = &filter.pair {
            query.push(" AND pair = ").push_bind(pair.clone());
        }
        if let Some(status) = filter.status {
            query.push(" AND status = ").push_bind(status.as_str());
        }

        query
            .push(" ORDER BY opened_at DESC, id DESC LIMIT ")
            .push_bind(filter.limit.max(0))
            .push(" OFFSET ")
            .push_bind(filter.offset.max(0));

        let rows = query.build().fetch_all(&self.pool).await?;
        rows.iter().map(trade_from_row).collect()
    }

    async fn delete_trade(&self, id: i64) -> Result<()> {
        let result = sqlx::query("DELETE FROM trades WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() != 1 {
            return Err(Error::NotFound(format!("trade #{}", id)));
        }
        Ok(())
    }
}

#[async_trait]
impl SettingsStore for SqliteStore {
    async fn pair_settings(&self, pair: &str) -> Result<Option<PairSettings>> {
        let row = sqlx::query(
            r#"
            SELECT pair, max_invest_fiat, max_per_tx_fiat, take_profit_pct, stop_loss_pct
            FROM pairs
            WHERE pair = ?
            "#,
        )
        .bind(pair)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.as_ref().map(settings_from_row))
    }

    async fn pair_list(&self) -> Result<Vec<String>> {
        let pairs: Vec<String> = sqlx::query_scalar("SELECT pair FROM pairs ORDER BY pair ASC")
            .fetch_all(&self.pool)
            .await?;
        Ok(pairs)
    }

    async fn upsert_pair_settings(&self, settings: &PairSettings) -> Result<()> {
        settings.validate()?;

        sqlx::query(
            r#"
            INSERT INTO pairs (pair, max_invest_fiat, max_per_tx_fiat, take_profit_pct, stop_loss_pct)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT (pair) DO UPDATE SET
                max_invest_fiat = excluded.max_invest_fiat,
                max_per_tx_fiat = excluded.max_per_tx_fiat,
                take_profit_pct = excluded.take_profit_pct,
                stop_loss_pct = excluded.stop_loss_pct
            "#,
        )
        .bind(&settings.pair)
        .bind(settings.max_invest_fiat)
        .bind(settings.max_per_tx_fiat)
        .bind(settings.take_profit_pct)
        .bind(settings.stop_loss_pct)
        .execute(&self.pool)
        .await?;

        tracing::debug!("Saved settings for {}", settings.pair);

        Ok(())
    }
}
