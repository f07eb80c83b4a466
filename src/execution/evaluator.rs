use crate::db::{CandleStore, SettingsStore, TradeLedger};
use crate::error::Result;
use crate::execution::LedgerPositions;
use crate::models::SwingAction;
use crate::strategy::SwingStrategy;

/// Outcome of one evaluation pass over the configured pairs
#[derive(Debug, Default)]
pub struct EvaluationReport {
    pub decisions: Vec<(String, SwingAction)>,
    pub failures: Vec<(String, String)>,
}

impl EvaluationReport {
    pub fn buys(&self) -> usize {
        self.decisions
            .iter()
            .filter(|(_, a)| matches!(a, SwingAction::Buy { .. }))
            .count()
    }

    pub fn sells(&self) -> usize {
        self.decisions
            .iter()
            .filter(|(_, a)| matches!(a, SwingAction::Sell { .. }))
            .count()
    }
}

/// Run one real-mode decision per configured pair.
///
/// Each pair loads its latest `lookback` candles and trades through the
/// ledger. A failing pair is logged and recorded, the rest still run.
pub async fn evaluate_pairs<S>(store: &S, strategy: &SwingStrategy) -> Result<EvaluationReport>
where
    S: CandleStore + TradeLedger + SettingsStore + ?Sized,
{
    let pairs = store.pair_list().await?;
    let lookback = strategy.params().lookback as i64;
    let mut report = EvaluationReport::default();

    tracing::info!("Evaluating {} pairs", pairs.len());

    for pair in pairs {
        match evaluate_pair(store, strategy, &pair, lookback).await {
            Ok(action) => {
                tracing::debug!("{}: {:?}", pair, action);
                report.decisions.push((pair, action));
            }
            Err(e) => {
                tracing::warn!("{}: evaluation failed: {}", pair, e);
                report.failures.push((pair, e.to_string()));
            }
        }
    }

    tracing::info!(
        "Evaluation complete: {} buys, {} sells, {} failed",
        report.buys(),
        report.sells(),
        report.failures.len()
    );

    Ok(report)
}

async fn evaluate_pair<S>(
    store: &S,
    strategy: &SwingStrategy,
    pair: &str,
    lookback: i64,
) -> Result<SwingAction>
where
    S: CandleStore + TradeLedger + SettingsStore + ?Sized,
{
    let candles = store.get_candles(pair, None, lookback).await?;
    let mut positions = LedgerPositions::new(store);
    strategy.decide(pair, &candles, &mut positions, store).await
}
