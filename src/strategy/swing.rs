use serde::{Deserialize, Serialize};

use crate::db::SettingsStore;
use crate::error::{Error, Result};
use crate::execution::PositionStore;
use crate::indicators::{calculate_sma, detect_crossover, sma_series, Crossover};
use crate::models::{Candle, HoldReason, NewTrade, SellReason, SwingAction, TradeSide};
use crate::strategy::budget::order_budget;

/// Moving-average windows and history depth for the swing strategy
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct SwingParams {
    pub ma_short: usize,
    pub ma_long: usize,
    /// Candles callers load per decision
    pub lookback: usize,
}

impl SwingParams {
    /// Candles required before a crossover can be evaluated
    pub fn min_candles(&self) -> usize {
        self.ma_short.max(self.ma_long) + 1
    }
}

impl Default for SwingParams {
    fn default() -> Self {
        Self {
            ma_short: 10,
            ma_long: 42,
            lookback: 300,
        }
    }
}

/// MA crossover swing strategy with stop loss / take profit exits.
///
/// FLAT: enter on a confirmed upward crossover if the pair has budget left.
/// LONG: exit on stop loss, then take profit, then a confirmed downward
/// crossover, checked in that order against the last close.
#[derive(Debug, Clone, Default)]
pub struct SwingStrategy {
    params: SwingParams,
}

impl SwingStrategy {
    pub fn new(params: SwingParams) -> Self {
        Self { params }
    }

    pub fn params(&self) -> &SwingParams {
        &self.params
    }

    /// Decide for one pair at the close of the last candle.
    ///
    /// `candles` must be sorted ascending by time. Position changes go through
    /// `positions`; settings are only read on the entry path.
    pub async fn decide<P, S>(
        &self,
        pair: &str,
        candles: &[Candle],
        positions: &mut P,
        settings: &S,
    ) -> Result<SwingAction>
    where
        P: PositionStore + ?Sized,
        S: SettingsStore + ?Sized,
    {
        let need = self.params.min_candles();
        let last = match candles.last() {
            Some(last) if candles.len() >= need => last,
            _ => {
                tracing::warn!(
                    "{}: not enough candles to detect a crossover (need={}, have={})",
                    pair,
                    need,
                    candles.len()
                );
                return Ok(SwingAction::hold(HoldReason::NotEnoughHistory));
            }
        };

        let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
        let last_close = last.close;
        let short_ma = sma_series(&closes, self.params.ma_short);
        let long_ma = sma_series(&closes, self.params.ma_long);

        let crossover = detect_crossover(&short_ma, &long_ma);

        let open = positions.open_position(pair).await?;

        let Some(open) = open else {
            // FLAT
            if crossover != Some(Crossover::Up) {
                tracing::debug!(
                    "{}: no buy signal (MA{}={:?} MA{}={:?})",
                    pair,
                    self.params.ma_short,
                    calculate_sma(&closes, self.params.ma_short),
                    self.params.ma_long,
                    calculate_sma(&closes, self.params.ma_long)
                );
                return Ok(SwingAction::hold(HoldReason::NoSignal));
            }

            if last_close <= 0.0 {
                tracing::warn!("{}: non-positive close {}, skipping entry", pair, last_close);
                return Ok(SwingAction::hold(HoldReason::NoSignal));
            }

            let settings = settings
                .pair_settings(pair)
                .await?
                .ok_or_else(|| Error::NotFound(format!("settings for pair {}", pair)))?;

            let invested_open = positions.invested_open(pair).await?;
            let budget = order_budget(&settings, invested_open);
            if budget <= 0.0 {
                tracing::warn!("{}: no budget available (caps reached)", pair);
                return Ok(SwingAction::hold(HoldReason::NoBudget));
            }

            let qty = budget / last_close;
            let stop_loss =
                (settings.stop_loss_pct > 0.0).then(|| last_close * (1.0 - settings.stop_loss_pct));
            let take_profit = (settings.take_profit_pct > 0.0)
                .then(|| last_close * (1.0 + settings.take_profit_pct));

            let trade = positions
                .open(NewTrade {
                    pair: pair.to_string(),
                    side: TradeSide::Buy,
                    entry_price: last_close,
                    amount: qty,
                    invested: budget,
                    stop_loss,
                    take_profit,
                    opened_at: None,
                })
                .await?;

            tracing::info!(
                "BUY {} #{} @ {:.6} qty={} invest={:.2} SL={} TP={}",
                pair,
                trade.id,
                last_close,
                qty,
                budget,
                fmt_level(stop_loss),
                fmt_level(take_profit)
            );

            return Ok(SwingAction::Buy {
                price: last_close,
                qty,
                invest: budget,
                stop_loss,
                take_profit,
                time: last.time,
            });
        };

        // LONG
        let stop_loss_hit = open.stop_loss_hit(last_close);
        let take_profit_hit = open.take_profit_hit(last_close);
        let cross_down = crossover == Some(Crossover::Down);

        let reason = if stop_loss_hit {
            SellReason::StopLoss
        } else if take_profit_hit {
            SellReason::TakeProfit
        } else if cross_down {
            SellReason::Cross
        } else {
            tracing::debug!("{}: holding position (close={:.6})", pair, last_close);
            return Ok(SwingAction::hold(HoldReason::NoSignal));
        };

        let closed = positions.close(&open, last_close).await?;

        tracing::info!(
            "SELL {} #{} reason={} @ {:.6} PnL={:.2}",
            pair,
            closed.id,
            reason,
            last_close,
            closed.pnl.unwrap_or_default()
        );

        Ok(SwingAction::Sell {
            price: last_close,
            reason,
            pnl: closed.pnl,
            time: last.time,
        })
    }
}

fn fmt_level(level: Option<f64>) -> String {
    level
        .map(|v| format!("{:.6}", v))
        .unwrap_or_else(|| "-".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{SqliteStore, TradeLedger};
    use crate::execution::{InMemoryPositions, LedgerPositions};
    use crate::models::{PairSettings, TradeStatus, CANDLE_INTERVAL_SECS};
    use async_trait::async_trait;

    const PAIR: &str = "ETH/EUR";

    struct FixedSettings(Option<PairSettings>);

    #[async_trait]
    impl SettingsStore for FixedSettings {
        async fn pair_settings(&self, _pair: &str) -> Result<Option<PairSettings>> {
            Ok(self.0.clone())
        }

        async fn pair_list(&self) -> Result<Vec<String>> {
            Ok(self.0.iter().map(|s| s.pair.clone()).collect())
        }

        async fn upsert_pair_settings(&self, _settings: &PairSettings) -> Result<()> {
            Ok(())
        }
    }

    fn default_settings() -> FixedSettings {
        FixedSettings(Some(PairSettings {
            pair: PAIR.to_string(),
            max_invest_fiat: 100.0,
            max_per_tx_fiat: 20.0,
            take_profit_pct: 0.06,
            stop_loss_pct: 0.03,
        }))
    }

    fn make_candles(closes: &[f64]) -> Vec<Candle> {
        let t0 = CANDLE_INTERVAL_SECS * 120_000;
        closes
            .iter()
            .enumerate()
            .map(|(i, &c)| Candle {
                pair: PAIR.to_string(),
                time: t0 + i as i64 * CANDLE_INTERVAL_SECS,
                open: c,
                high: c,
                low: c,
                close: c,
                volume: 0.0,
            })
            .collect()
    }

    fn strategy() -> SwingStrategy {
        SwingStrategy::new(SwingParams {
            ma_short: 2,
            ma_long: 3,
            lookback: 50,
        })
    }

    #[tokio::test]
    async fn test_not_enough_history() {
        let mut positions = InMemoryPositions::new();
        let action = strategy()
            .decide(PAIR, &make_candles(&[10.0, 10.0, 10.0]), &mut positions, &default_settings())
            .await
            .unwrap();

        assert_eq!(action, SwingAction::hold(HoldReason::NotEnoughHistory));
        assert!(positions.open_position(PAIR).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_flat_without_cross_holds() {
        let mut positions = InMemoryPositions::new();
        let action = strategy()
            .decide(PAIR, &make_candles(&[10.0, 10.0, 10.0, 10.0]), &mut positions, &default_settings())
            .await
            .unwrap();

        assert_eq!(action, SwingAction::hold(HoldReason::NoSignal));
    }

    #[tokio::test]
    async fn test_buy_on_cross_up() {
        let mut positions = InMemoryPositions::new();
        let candles = make_candles(&[10.0, 10.0, 10.0, 20.0]);
        let action = strategy()
            .decide(PAIR, &candles, &mut positions, &default_settings())
            .await
            .unwrap();

        match action {
            SwingAction::Buy {
                price,
                qty,
                invest,
                stop_loss,
                take_profit,
                time,
            } => {
                assert_eq!(price, 20.0);
                assert!((qty - 1.0).abs() < 1e-10);
                assert_eq!(invest, 20.0);
                assert!((stop_loss.unwrap() - 19.4).abs() < 1e-10);
                assert!((take_profit.unwrap() - 21.2).abs() < 1e-10);
                assert_eq!(time, candles[3].time);
            }
            other => panic!("expected BUY, got {:?}", other),
        }

        assert!(positions.open_position(PAIR).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_zero_percentages_disable_exits() {
        let settings = FixedSettings(Some(PairSettings {
            pair: PAIR.to_string(),
            max_invest_fiat: 100.0,
            max_per_tx_fiat: 20.0,
            take_profit_pct: 0.0,
            stop_loss_pct: 0.0,
        }));
        let mut positions = InMemoryPositions::new();
        let action = strategy()
            .decide(PAIR, &make_candles(&[10.0, 10.0, 10.0, 20.0]), &mut positions, &settings)
            .await
            .unwrap();

        match action {
            SwingAction::Buy {
                stop_loss,
                take_profit,
                ..
            } => {
                assert_eq!(stop_loss, None);
                assert_eq!(take_profit, None);
            }
            other => panic!("expected BUY, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_no_budget_when_allowance_used() {
        let mut positions = InMemoryPositions::new().with_committed(PAIR, 100.0);
        let action = strategy()
            .decide(PAIR, &make_candles(&[10.0, 10.0, 10.0, 20.0]), &mut positions, &default_settings())
            .await
            .unwrap();

        assert_eq!(action, SwingAction::hold(HoldReason::NoBudget));
        assert!(positions.open_position(PAIR).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_missing_settings_on_entry_is_not_found() {
        let mut positions = InMemoryPositions::new();
        let err = strategy()
            .decide(PAIR, &make_candles(&[10.0, 10.0, 10.0, 20.0]), &mut positions, &FixedSettings(None))
            .await
            .unwrap_err();

        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_sell_on_take_profit_after_buy() {
        let mut positions = InMemoryPositions::new();
        let strategy = strategy();
        let settings = default_settings();

        let buy = strategy
            .decide(PAIR, &make_candles(&[10.0, 10.0, 10.0, 20.0]), &mut positions, &settings)
            .await
            .unwrap();
        assert!(matches!(buy, SwingAction::Buy { .. }));

        let sell = strategy
            .decide(PAIR, &make_candles(&[10.0, 10.0, 10.0, 25.0]), &mut positions, &settings)
            .await
            .unwrap();

        match sell {
            SwingAction::Sell { reason, pnl, price, .. } => {
                assert_eq!(reason, SellReason::TakeProfit);
                assert_eq!(price, 25.0);
                // (25 - 20) * 1
                assert!((pnl.unwrap() - 5.0).abs() < 1e-10);
            }
            other => panic!("expected SELL, got {:?}", other),
        }
        assert!(positions.open_position(PAIR).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_long_without_trigger_holds() {
        let mut positions = InMemoryPositions::new();
        let strategy = strategy();
        let settings = default_settings();

        strategy
            .decide(PAIR, &make_candles(&[10.0, 10.0, 10.0, 20.0]), &mut positions, &settings)
            .await
            .unwrap();

        // 20.5 is between SL (19.4) and TP (21.2); MAs keep rising
        let action = strategy
            .decide(PAIR, &make_candles(&[10.0, 10.0, 20.0, 20.5]), &mut positions, &settings)
            .await
            .unwrap();

        assert_eq!(action, SwingAction::hold(HoldReason::NoSignal));
        assert!(positions.open_position(PAIR).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_exit_path_does_not_need_settings() {
        let mut positions = InMemoryPositions::new();
        let strategy = strategy();

        strategy
            .decide(PAIR, &make_candles(&[10.0, 10.0, 10.0, 20.0]), &mut positions, &default_settings())
            .await
            .unwrap();

        let sell = strategy
            .decide(PAIR, &make_candles(&[10.0, 10.0, 10.0, 25.0]), &mut positions, &FixedSettings(None))
            .await
            .unwrap();
        assert!(matches!(sell, SwingAction::Sell { .. }));
    }

    #[tokio::test]
    async fn test_real_mode_sells_on_cross_down() {
        let store = SqliteStore::in_memory().await.unwrap();
        let id = store
            .open_trade(NewTrade {
                pair: PAIR.to_string(),
                side: TradeSide::Buy,
                entry_price: 20.0,
                amount: 2.0,
                invested: 40.0,
                stop_loss: None,
                take_profit: None,
                opened_at: None,
            })
            .await
            .unwrap();

        let mut positions = LedgerPositions::new(&store);
        let action = strategy()
            .decide(PAIR, &make_candles(&[10.0, 10.0, 10.0, 0.0]), &mut positions, &store)
            .await
            .unwrap();

        match action {
            SwingAction::Sell { reason, pnl, price, .. } => {
                assert_eq!(reason, SellReason::Cross);
                assert_eq!(price, 0.0);
                assert_eq!(pnl, Some(-40.0));
            }
            other => panic!("expected SELL, got {:?}", other),
        }

        let trade = store.get_trade(id).await.unwrap().unwrap();
        assert_eq!(trade.status, TradeStatus::Closed);
        assert_eq!(trade.exit_price, Some(0.0));
    }

    #[tokio::test]
    async fn test_stop_loss_takes_priority_over_cross() {
        let store = SqliteStore::in_memory().await.unwrap();
        store
            .open_trade(NewTrade {
                pair: PAIR.to_string(),
                side: TradeSide::Buy,
                entry_price: 20.0,
                amount: 1.0,
                invested: 20.0,
                stop_loss: Some(15.0),
                take_profit: None,
                opened_at: None,
            })
            .await
            .unwrap();

        let mut positions = LedgerPositions::new(&store);
        let action = strategy()
            .decide(PAIR, &make_candles(&[10.0, 10.0, 10.0, 0.0]), &mut positions, &store)
            .await
            .unwrap();

        assert!(matches!(
            action,
            SwingAction::Sell {
                reason: SellReason::StopLoss,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_real_mode_buy_records_trade() {
        let store = SqliteStore::in_memory().await.unwrap();
        store
            .upsert_pair_settings(&PairSettings {
                pair: PAIR.to_string(),
                max_invest_fiat: 100.0,
                max_per_tx_fiat: 20.0,
                take_profit_pct: 0.06,
                stop_loss_pct: 0.03,
            })
            .await
            .unwrap();

        let mut positions = LedgerPositions::new(&store);
        let action = strategy()
            .decide(PAIR, &make_candles(&[10.0, 10.0, 10.0, 20.0]), &mut positions, &store)
            .await
            .unwrap();
        assert!(matches!(action, SwingAction::Buy { .. }));

        let open = store.open_trades(Some(PAIR)).await.unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].invested, 20.0);
        assert_eq!(open[0].entry_price, 20.0);
    }
}
