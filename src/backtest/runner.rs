use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::backtest::metrics::{SimulationMetrics, TradeRecord};
use crate::db::{CandleStore, SettingsStore, TradeLedger};
use crate::error::{Error, Result};
use crate::execution::InMemoryPositions;
use crate::models::{Candle, HoldReason, SwingAction};
use crate::strategy::SwingStrategy;

/// Result of replaying one pair's history
#[derive(Debug, Clone, Serialize)]
pub struct SimulationReport {
    pub pair: String,
    pub candles: usize,
    pub decisions: usize,
    /// Entries skipped because the pair's allowance was used up
    pub no_budget: usize,
    /// A position was still open after the last candle
    pub open_at_end: bool,
    pub metrics: SimulationMetrics,
}

#[derive(Debug, Clone, Copy)]
struct OpenEntry {
    time: i64,
    price: f64,
    qty: f64,
    invest: f64,
}

/// Replays stored candles through the swing strategy without touching the ledger
pub struct SimulationRunner {
    strategy: SwingStrategy,
    candles_limit: i64,
}

impl SimulationRunner {
    /// # Arguments
    /// * `strategy` - Strategy under test
    /// * `candles_limit` - Most recent candles loaded per pair
    pub fn new(strategy: SwingStrategy, candles_limit: i64) -> Self {
        Self {
            strategy,
            candles_limit,
        }
    }

    /// Replay `candles` (ascending) for `pair`.
    ///
    /// Each step sees a window of the `max(ma_short, ma_long) + 1` candles
    /// ending at the current one. Simulated positions live in `positions`,
    /// which this call consumes.
    pub async fn run<S>(
        &self,
        pair: &str,
        candles: &[Candle],
        mut positions: InMemoryPositions,
        settings: &S,
    ) -> Result<SimulationReport>
    where
        S: SettingsStore + ?Sized,
    {
        let need = self.strategy.params().min_candles();
        let mut open: Option<OpenEntry> = None;
        let mut trades = Vec::new();
        let mut decisions = 0;
        let mut no_budget = 0;

        for end in need.saturating_sub(1)..candles.len() {
            let window = &candles[(end + 1).saturating_sub(need)..=end];
            let action = self
                .strategy
                .decide(pair, window, &mut positions, settings)
                .await?;
            decisions += 1;

            match action {
                SwingAction::Buy {
                    price,
                    qty,
                    invest,
                    time,
                    ..
                } => {
                    open = Some(OpenEntry {
                        time,
                        price,
                        qty,
                        invest,
                    });
                }
                SwingAction::Sell {
                    price,
                    reason,
                    pnl,
                    time,
                } => {
                    if let Some(entry) = open.take() {
                        let pnl = pnl.unwrap_or((price - entry.price) * entry.qty);
                        trades.push(TradeRecord::new(
                            to_datetime(entry.time)?,
                            to_datetime(time)?,
                            entry.price,
                            price,
                            entry.qty,
                            entry.invest,
                            pnl,
                            reason,
                        ));
                    }
                }
                SwingAction::Hold {
                    reason: HoldReason::NoBudget,
                } => no_budget += 1,
                SwingAction::Hold { .. } => {}
            }
        }

        Ok(SimulationReport {
            pair: pair.to_string(),
            candles: candles.len(),
            decisions,
            no_budget,
            open_at_end: open.is_some(),
            metrics: SimulationMetrics::from_trades(trades),
        })
    }

    /// Load the latest candles for `pair` and replay them.
    ///
    /// Fiat invested in the pair's open ledger trades counts against the
    /// simulated budget. Returns `None` when the pair has no stored candles.
    pub async fn run_pair<S>(&self, store: &S, pair: &str) -> Result<Option<SimulationReport>>
    where
        S: CandleStore + TradeLedger + SettingsStore + ?Sized,
    {
        tracing::info!("Starting simulation for {}", pair);

        let candles = store.get_candles(pair, None, self.candles_limit).await?;
        if candles.is_empty() {
            tracing::warn!("No candles for {}", pair);
            return Ok(None);
        }

        let committed: f64 = store
            .open_trades(Some(pair))
            .await?
            .iter()
            .map(|t| t.invested)
            .sum();
        if committed > 0.0 {
            tracing::info!("  {:.2} already invested in open trades", committed);
        }

        let positions = InMemoryPositions::new().with_committed(pair, committed);
        let report = self.run(pair, &candles, positions, store).await?;
        report.metrics.log_report(pair);
        if report.open_at_end {
            tracing::info!("  Position still open after the last candle");
        }

        Ok(Some(report))
    }

    /// Simulate one pair, or every configured pair when `pair` is `None`.
    /// A failing pair is logged and skipped.
    pub async fn run_all<S>(&self, store: &S, pair: Option<&str>) -> Result<Vec<SimulationReport>>
    where
        S: CandleStore + TradeLedger + SettingsStore + ?Sized,
    {
        if let Some(pair) = pair {
            return Ok(self.run_pair(store, pair).await?.into_iter().collect());
        }

        let pairs = store.pair_list().await?;
        if pairs.is_empty() {
            tracing::warn!("No pairs configured");
            return Ok(vec![]);
        }

        let mut reports = Vec::with_capacity(pairs.len());
        for pair in pairs {
            match self.run_pair(store, &pair).await {
                Ok(Some(report)) => reports.push(report),
                Ok(None) => {}
                Err(e) => tracing::warn!("{}: simulation failed: {}", pair, e),
            }
        }

        Ok(reports)
    }
}

fn to_datetime(secs: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp(secs, 0)
        .ok_or_else(|| Error::Validation(format!("Invalid candle time: {}", secs)))
}
