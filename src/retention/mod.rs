// Tiered downsampling of the candle archive
use chrono::DateTime;
use serde::{Deserialize, Serialize};
use sqlx::Row;

use crate::db::SqliteStore;
use crate::error::{Error, Result};
use crate::models::CANDLE_INTERVAL_SECS;

const SECS_PER_DAY: i64 = 86_400;

/// Age thresholds, in days, for the three retention tiers
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct RetentionPolicy {
    /// Everything newer than this is kept at full 4h resolution
    pub full_days: u32,
    /// Between `full_days` and `half_days`, every second candle is kept (8h)
    pub half_days: u32,
    /// Between `half_days` and `sixth_days`, every sixth candle is kept (24h).
    /// Older rows are deleted.
    pub sixth_days: u32,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            full_days: 30,
            half_days: 90,
            sixth_days: 180,
        }
    }
}

impl RetentionPolicy {
    pub fn validate(&self) -> Result<()> {
        if !(self.full_days < self.half_days && self.half_days < self.sixth_days) {
            return Err(Error::Validation(format!(
                "retention tiers must satisfy full < half < sixth (got {}/{}/{})",
                self.full_days, self.half_days, self.sixth_days
            )));
        }
        Ok(())
    }

    pub fn cutoffs(&self, now: i64) -> RetentionCutoffs {
        RetentionCutoffs {
            full_cut: now - i64::from(self.full_days) * SECS_PER_DAY,
            half_cut: now - i64::from(self.half_days) * SECS_PER_DAY,
            sixth_cut: now - i64::from(self.sixth_days) * SECS_PER_DAY,
        }
    }
}

/// Absolute epoch-second boundaries derived from a policy.
/// `sixth_cut < half_cut < full_cut`.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct RetentionCutoffs {
    pub full_cut: i64,
    pub half_cut: i64,
    pub sixth_cut: i64,
}

impl RetentionCutoffs {
    /// Whether a candle at `time` survives a retention pass
    pub fn keeps(&self, time: i64) -> bool {
        let bucket = time / CANDLE_INTERVAL_SECS;
        if time >= self.full_cut {
            true
        } else if time >= self.half_cut {
            bucket % 2 == 0
        } else if time >= self.sixth_cut {
            bucket % 6 == 0
        } else {
            false
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RetentionReport {
    pub pair: String,
    pub removed: u64,
    pub cutoffs: RetentionCutoffs,
}

/// Downsample every pair present in the candle archive.
///
/// A missing `candles` table is a setup error; a pair that fails is logged
/// and skipped.
pub async fn run_retention(
    store: &SqliteStore,
    policy: &RetentionPolicy,
    now: i64,
) -> Result<Vec<RetentionReport>> {
    policy.validate()?;

    if !store.table_exists("candles").await? {
        return Err(Error::Setup(
            "candles table not found, run migrations first".to_string(),
        ));
    }

    let cutoffs = policy.cutoffs(now);
    tracing::info!(
        "Retention cutoffs: full={} half={} sixth={}",
        fmt_cut(cutoffs.full_cut),
        fmt_cut(cutoffs.half_cut),
        fmt_cut(cutoffs.sixth_cut)
    );

    let rows = sqlx::query("SELECT DISTINCT pair FROM candles ORDER BY pair")
        .fetch_all(store.pool())
        .await?;
    let pairs: Vec<String> = rows.iter().map(|row| row.get("pair")).collect();

    let mut reports = Vec::with_capacity(pairs.len());
    for pair in pairs {
        match downsample_pair(store, &pair, &cutoffs).await {
            Ok(removed) => {
                tracing::info!("{}: removed {} candles", pair, removed);
                reports.push(RetentionReport {
                    pair,
                    removed,
                    cutoffs,
                });
            }
            Err(e) => {
                tracing::error!("{}: retention failed: {}", pair, e);
            }
        }
    }

    let total: u64 = reports.iter().map(|r| r.removed).sum();
    tracing::info!("Retention complete: {} candles removed", total);

    Ok(reports)
}

/// Apply the three tier deletions for one pair in a single transaction
pub async fn downsample_pair(
    store: &SqliteStore,
    pair: &str,
    cutoffs: &RetentionCutoffs,
) -> Result<u64> {
    let mut tx = store.pool().begin().await?;

    let expired = sqlx::query("DELETE FROM candles WHERE pair = ? AND time < ?")
        .bind(pair)
        .bind(cutoffs.sixth_cut)
        .execute(&mut *tx)
        .await?
        .rows_affected();

    let daily = sqlx::query(
        r#"
        DELETE FROM candles
        WHERE pair = ? AND time >= ? AND time < ? AND (time / ?) % 6 != 0
        "#,
    )
    .bind(pair)
    .bind(cutoffs.sixth_cut)
    .bind(cutoffs.half_cut)
    .bind(CANDLE_INTERVAL_SECS)
    .execute(&mut *tx)
    .await?
    .rows_affected();

    let half = sqlx::query(
        r#"
        DELETE FROM candles
        WHERE pair = ? AND time >= ? AND time < ? AND (time / ?) % 2 != 0
        "#,
    )
    .bind(pair)
    .bind(cutoffs.half_cut)
    .bind(cutoffs.full_cut)
    .bind(CANDLE_INTERVAL_SECS)
    .execute(&mut *tx)
    .await?
    .rows_affected();

    tx.commit().await?;

    tracing::debug!(
        "{}: expired={} daily_tier={} half_tier={}",
        pair,
        expired,
        daily,
        half
    );

    Ok(expired + daily + half)
}

fn fmt_cut(secs: i64) -> String {
    DateTime::from_timestamp(secs, 0)
        .map(|t| t.to_rfc3339())
        .unwrap_or_else(|| secs.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::CandleStore;
    use crate::models::Candle;
    use sqlx::sqlite::SqlitePoolOptions;

    const NOW: i64 = CANDLE_INTERVAL_SECS * 200_000;

    fn policy() -> RetentionPolicy {
        RetentionPolicy {
            full_days: 1,
            half_days: 2,
            sixth_days: 3,
        }
    }

    /// Four days of 4h candles ending at NOW
    fn history(pair: &str) -> Vec<Candle> {
        (0..=24)
            .map(|i| {
                let time = NOW - i * CANDLE_INTERVAL_SECS;
                Candle {
                    pair: pair.to_string(),
                    time,
                    open: 1.0,
                    high: 1.0,
                    low: 1.0,
                    close: 1.0,
                    volume: 1.0,
                }
            })
            .collect()
    }

    #[test]
    fn test_validate_rejects_unordered_tiers() {
        assert!(RetentionPolicy::default().validate().is_ok());
        let bad = RetentionPolicy {
            full_days: 90,
            half_days: 30,
            sixth_days: 180,
        };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_cutoffs_are_ordered() {
        let c = RetentionPolicy::default().cutoffs(NOW);
        assert!(c.sixth_cut < c.half_cut && c.half_cut < c.full_cut);
        assert_eq!(NOW - c.full_cut, 30 * SECS_PER_DAY);
    }

    #[test]
    fn test_keeps_by_tier() {
        let c = policy().cutoffs(NOW);
        assert!(c.keeps(NOW));
        assert!(c.keeps(c.full_cut));
        assert!(!c.keeps(c.sixth_cut - CANDLE_INTERVAL_SECS));

        let odd = (c.half_cut / CANDLE_INTERVAL_SECS + 1) | 1;
        assert!(!c.keeps(odd * CANDLE_INTERVAL_SECS));
    }

    #[tokio::test]
    async fn test_downsample_matches_tiers() {
        let store = SqliteStore::in_memory().await.unwrap();
        store.upsert_candles("ETH/EUR", &history("ETH/EUR")).await.unwrap();

        let reports = run_retention(&store, &policy(), NOW).await.unwrap();
        assert_eq!(reports.len(), 1);
        let cutoffs = reports[0].cutoffs;

        let remaining = store.get_candles("ETH/EUR", None, 1000).await.unwrap();
        let expected: Vec<i64> = history("ETH/EUR")
            .into_iter()
            .map(|c| c.time)
            .filter(|&t| cutoffs.keeps(t))
            .rev()
            .collect();
        let kept: Vec<i64> = remaining.iter().map(|c| c.time).collect();
        assert_eq!(kept, expected);
        assert_eq!(reports[0].removed as usize, 25 - kept.len());

        // Full-resolution tier untouched
        let recent = store
            .count_candles("ETH/EUR", Some(cutoffs.full_cut), None)
            .await
            .unwrap();
        assert_eq!(recent, 7);

        for t in kept.iter().filter(|&&t| t >= cutoffs.half_cut && t < cutoffs.full_cut) {
            assert_eq!((t / CANDLE_INTERVAL_SECS) % 2, 0);
        }
    }

    #[tokio::test]
    async fn test_second_pass_removes_nothing() {
        let store = SqliteStore::in_memory().await.unwrap();
        store.upsert_candles("ETH/EUR", &history("ETH/EUR")).await.unwrap();

        run_retention(&store, &policy(), NOW).await.unwrap();
        let again = run_retention(&store, &policy(), NOW).await.unwrap();
        assert_eq!(again[0].removed, 0);
    }

    #[tokio::test]
    async fn test_missing_table_is_setup_error() {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let store = SqliteStore::from_pool(pool);

        let err = run_retention(&store, &policy(), NOW).await.unwrap_err();
        assert!(matches!(err, Error::Setup(_)));
    }
}
