// Periodic OHLC ingestion from the exchange into the candle store
use tokio::sync::watch;
use tokio::time::sleep;

use crate::api::{CandleSource, INTERVAL_4H_MIN};
use crate::config::FetchConfig;
use crate::db::{CandleStore, SettingsStore};
use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchReport {
    pub pair: String,
    pub inserted: usize,
}

/// One ingestion pass over every configured pair.
///
/// Only candles strictly newer than the last stored one are written. A pair
/// that fails is logged and skipped.
pub async fn fetch_once<S, C>(store: &S, source: &C) -> Result<Vec<FetchReport>>
where
    S: CandleStore + SettingsStore + ?Sized,
    C: CandleSource + ?Sized,
{
    let server_time = source.server_time().await?;
    tracing::debug!("Kraken server time: {}", server_time);

    let pairs = store.pair_list().await?;
    let mut reports = Vec::with_capacity(pairs.len());

    for pair in pairs {
        match fetch_pair(store, source, &pair).await {
            Ok(inserted) => reports.push(FetchReport { pair, inserted }),
            Err(e) => tracing::warn!("{}: fetch failed: {}", pair, e),
        }
    }

    Ok(reports)
}

async fn fetch_pair<S, C>(store: &S, source: &C, pair: &str) -> Result<usize>
where
    S: CandleStore + ?Sized,
    C: CandleSource + ?Sized,
{
    let last = store.last_candle_time(pair).await?;
    let candles = source.ohlc(pair, INTERVAL_4H_MIN, last).await?;

    let fresh: Vec<_> = candles
        .into_iter()
        .filter(|c| last.map_or(true, |last| c.time > last))
        .collect();

    let inserted = store.upsert_candles(pair, &fresh).await?;

    match (fresh.first(), fresh.last()) {
        (Some(first), Some(newest)) if inserted > 0 => {
            tracing::info!(
                "{}: +{} candles [{} .. {}]",
                pair,
                inserted,
                first.time,
                newest.time
            );
        }
        _ => {
            tracing::debug!(
                "{}: no new candles (last={})",
                pair,
                last.map(|t| t.to_string()).unwrap_or_else(|| "none".to_string())
            );
        }
    }

    Ok(inserted)
}

/// Run `fetch_once` every `config.interval()` until `shutdown` flips to true.
///
/// A pass in flight when shutdown is requested runs to completion; no new
/// pass starts afterwards.
pub async fn run_fetch_loop<S, C>(
    store: &S,
    source: &C,
    config: &FetchConfig,
    mut shutdown: watch::Receiver<bool>,
) where
    S: CandleStore + SettingsStore + ?Sized,
    C: CandleSource + ?Sized,
{
    let interval = config.interval();
    tracing::info!(
        "🔄 Fetch loop started: interval={}s on_start={}",
        interval.as_secs(),
        config.on_start
    );

    if config.on_start && !*shutdown.borrow() {
        run_pass(store, source).await;
    }

    loop {
        if *shutdown.borrow() {
            break;
        }

        tokio::select! {
            _ = sleep(interval) => {}
            changed = shutdown.changed() => {
                // Sender gone counts as shutdown
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
        }

        if *shutdown.borrow() {
            break;
        }
        run_pass(store, source).await;
    }

    tracing::info!("Fetch loop stopped");
}

async fn run_pass<S, C>(store: &S, source: &C)
where
    S: CandleStore + SettingsStore + ?Sized,
    C: CandleSource + ?Sized,
{
    match fetch_once(store, source).await {
        Ok(reports) => {
            let total: usize = reports.iter().map(|r| r.inserted).sum();
            tracing::info!("Fetch pass complete: {} pairs, {} new candles", reports.len(), total);
        }
        Err(e) => tracing::error!("Fetch pass failed: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::SqliteStore;
    use crate::error::Error;
    use crate::models::{Candle, PairSettings, CANDLE_INTERVAL_SECS};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    const T0: i64 = CANDLE_INTERVAL_SECS * 120_000;

    /// Serves a fixed candle series, ignoring `since`
    struct FakeSource {
        candles: Vec<Candle>,
        failing_pair: Option<String>,
        calls: AtomicUsize,
        sinces: Mutex<Vec<Option<i64>>>,
    }

    impl FakeSource {
        fn new(candles: Vec<Candle>) -> Self {
            Self {
                candles,
                failing_pair: None,
                calls: AtomicUsize::new(0),
                sinces: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl CandleSource for FakeSource {
        async fn server_time(&self) -> Result<i64> {
            Ok(T0)
        }

        async fn ohlc(&self, pair: &str, _interval_min: u32, since: Option<i64>) -> Result<Vec<Candle>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.sinces.lock().unwrap().push(since);
            if self.failing_pair.as_deref() == Some(pair) {
                return Err(Error::Exchange("boom".to_string()));
            }
            Ok(self
                .candles
                .iter()
                .map(|c| Candle {
                    pair: pair.to_string(),
                    ..c.clone()
                })
                .collect())
        }
    }

    fn candle(i: i64, close: f64) -> Candle {
        Candle {
            pair: String::new(),
            time: T0 + i * CANDLE_INTERVAL_SECS,
            open: close,
            high: close,
            low: close,
            close,
            volume: 1.0,
        }
    }

    fn settings(pair: &str) -> PairSettings {
        PairSettings {
            pair: pair.to_string(),
            max_invest_fiat: 100.0,
            max_per_tx_fiat: 20.0,
            take_profit_pct: 0.0,
            stop_loss_pct: 0.0,
        }
    }

    #[tokio::test]
    async fn test_only_newer_candles_are_written() {
        let store = SqliteStore::in_memory().await.unwrap();
        store.upsert_pair_settings(&settings("ETH/EUR")).await.unwrap();
        store
            .upsert_candles("ETH/EUR", &[Candle { pair: "ETH/EUR".to_string(), ..candle(1, 99.0) }])
            .await
            .unwrap();

        let source = FakeSource::new(vec![candle(0, 1.0), candle(1, 2.0), candle(2, 3.0), candle(3, 4.0)]);
        let reports = fetch_once(&store, &source).await.unwrap();

        assert_eq!(reports, vec![FetchReport { pair: "ETH/EUR".to_string(), inserted: 2 }]);
        assert_eq!(source.sinces.lock().unwrap()[0], Some(T0 + CANDLE_INTERVAL_SECS));

        let stored = store.get_candles("ETH/EUR", None, 10).await.unwrap();
        assert_eq!(stored.len(), 3);
        // The stored candle at the last time is not overwritten
        assert_eq!(stored[0].close, 99.0);
        assert_eq!(stored[2].close, 4.0);
    }

    #[tokio::test]
    async fn test_failing_pair_is_skipped() {
        let store = SqliteStore::in_memory().await.unwrap();
        store.upsert_pair_settings(&settings("ETH/EUR")).await.unwrap();
        store.upsert_pair_settings(&settings("XBT/EUR")).await.unwrap();

        let mut source = FakeSource::new(vec![candle(0, 1.0)]);
        source.failing_pair = Some("ETH/EUR".to_string());

        let reports = fetch_once(&store, &source).await.unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].pair, "XBT/EUR");
        assert_eq!(store.count_candles("XBT/EUR", None, None).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_loop_stops_on_shutdown() {
        let store = SqliteStore::in_memory().await.unwrap();
        store.upsert_pair_settings(&settings("ETH/EUR")).await.unwrap();
        let source = FakeSource::new(vec![candle(0, 1.0)]);
        let config = FetchConfig {
            interval_secs: 3600,
            on_start: true,
        };

        let (tx, rx) = watch::channel(false);
        let stopper = async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            tx.send(true).unwrap();
        };

        tokio::time::timeout(
            Duration::from_secs(5),
            async { tokio::join!(run_fetch_loop(&store, &source, &config, rx), stopper) },
        )
        .await
        .unwrap();

        // Only the start-up pass ran
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_no_pass_when_already_stopped() {
        let store = SqliteStore::in_memory().await.unwrap();
        store.upsert_pair_settings(&settings("ETH/EUR")).await.unwrap();
        let source = FakeSource::new(vec![candle(0, 1.0)]);
        let config = FetchConfig {
            interval_secs: 5,
            on_start: true,
        };

        let (_tx, rx) = watch::channel(true);
        run_fetch_loop(&store, &source, &config, rx).await;
        assert_eq!(source.calls.load(Ordering::SeqCst), 0);
    }
}
