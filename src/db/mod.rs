// Persistence layer: candle archive, trade ledger and pair settings
pub mod sqlite;

pub use sqlite::SqliteStore;

use async_trait::async_trait;

use crate::error::Result;
use crate::models::{
    Candle, CloseTrade, NewTrade, PairSettings, Trade, TradeFilter, CANDLE_INTERVAL_SECS,
};

/// OHLCV archive keyed by (pair, time)
#[async_trait]
pub trait CandleStore: Send + Sync {
    /// Latest `limit` candles at or after `since`, returned oldest first
    async fn get_candles(&self, pair: &str, since: Option<i64>, limit: i64) -> Result<Vec<Candle>>;

    /// Insert or replace candles. Misaligned candles are skipped.
    /// Returns the number of rows written.
    async fn upsert_candles(&self, pair: &str, candles: &[Candle]) -> Result<usize>;

    async fn last_candle_time(&self, pair: &str) -> Result<Option<i64>>;

    /// `since` inclusive, `until` exclusive
    async fn count_candles(&self, pair: &str, since: Option<i64>, until: Option<i64>) -> Result<i64>;
}

/// Opened/closed position records
#[async_trait]
pub trait TradeLedger: Send + Sync {
    /// Fails with `Conflict` if the pair already has an open trade
    async fn open_trade(&self, trade: NewTrade) -> Result<i64>;

    async fn get_trade(&self, id: i64) -> Result<Option<Trade>>;

    async fn open_trades(&self, pair: Option<&str>) -> Result<Vec<Trade>>;

    /// Fails with `NotFound` for an unknown id and `Conflict` if not open
    async fn close_trade(&self, id: i64, close: CloseTrade) -> Result<Trade>;

    /// Newest first
    async fn list_trades(&self, filter: &TradeFilter) -> Result<Vec<Trade>>;

    async fn delete_trade(&self, id: i64) -> Result<()>;
}

/// Candles needed for one week of 4h history
pub const WEEKLY_CANDLES: i64 = 42;

/// At least a week of contiguous 4h candles, the latest no older than 8h
pub async fn has_min_weekly_history<S>(store: &S, pair: &str, now: i64) -> Result<bool>
where
    S: CandleStore + ?Sized,
{
    let rows = store.get_candles(pair, None, WEEKLY_CANDLES).await?;
    if (rows.len() as i64) < WEEKLY_CANDLES {
        tracing::warn!(
            "{}: not enough candles for weekly history ({} < {})",
            pair,
            rows.len(),
            WEEKLY_CANDLES
        );
        return Ok(false);
    }

    if let Some(i) = rows
        .windows(2)
        .position(|w| w[1].time - w[0].time != CANDLE_INTERVAL_SECS)
    {
        tracing::warn!("{}: candles not contiguous, gap at index {}", pair, i + 1);
        return Ok(false);
    }

    let last = rows.last().map(|c| c.time).unwrap_or_default();
    if now - last > 2 * CANDLE_INTERVAL_SECS {
        tracing::warn!(
            "{}: last candle too old ({}s behind now)",
            pair,
            now - last
        );
        return Ok(false);
    }

    Ok(true)
}

/// Per-pair strategy settings
#[async_trait]
pub trait SettingsStore: Send + Sync {
    async fn pair_settings(&self, pair: &str) -> Result<Option<PairSettings>>;

    async fn pair_list(&self) -> Result<Vec<String>>;

    async fn upsert_pair_settings(&self, settings: &PairSettings) -> Result<()>;
}
