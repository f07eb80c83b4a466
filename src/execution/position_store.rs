use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;

use crate::db::TradeLedger;
use crate::error::{Error, Result};
use crate::models::{CloseTrade, NewTrade, Trade, TradeStatus};

/// Where the decision engine keeps position state.
///
/// `InMemoryPositions` backs simulation runs, `LedgerPositions` backs real
/// evaluation through the trade ledger.
#[async_trait]
pub trait PositionStore: Send + Sync {
    /// The open position for `pair`, if any
    async fn open_position(&self, pair: &str) -> Result<Option<Trade>>;

    /// Fiat currently committed to open positions of `pair`
    async fn invested_open(&self, pair: &str) -> Result<f64>;

    async fn open(&mut self, trade: NewTrade) -> Result<Trade>;

    /// Close `trade` at `exit_price`, returning it with `pnl` set
    async fn close(&mut self, trade: &Trade, exit_price: f64) -> Result<Trade>;
}

/// Process-local position slots, one per pair.
///
/// Owned by a single simulation run and dropped with it.
#[derive(Debug, Default)]
pub struct InMemoryPositions {
    slots: HashMap<String, Trade>,
    committed: HashMap<String, f64>,
    closed: Vec<Trade>,
    next_id: i64,
}

impl InMemoryPositions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Capital already committed elsewhere for `pair`, counted against its budget
    pub fn with_committed(mut self, pair: &str, invested: f64) -> Self {
        self.committed.insert(pair.to_string(), invested);
        self
    }

    /// Trades closed during this run, oldest first
    pub fn closed_trades(&self) -> &[Trade] {
        &self.closed
    }
}

#[async_trait]
impl PositionStore for InMemoryPositions {
    async fn open_position(&self, pair: &str) -> Result<Option<Trade>> {
        Ok(self.slots.get(pair).cloned())
    }

    async fn invested_open(&self, pair: &str) -> Result<f64> {
        let committed = self.committed.get(pair).copied().unwrap_or(0.0);
        let slot = self.slots.get(pair).map(|t| t.invested).unwrap_or(0.0);
        Ok(committed + slot)
    }

    async fn open(&mut self, trade: NewTrade) -> Result<Trade> {
        if self.slots.contains_key(&trade.pair) {
            return Err(Error::Conflict(format!(
                "{} already has an open simulated position",
                trade.pair
            )));
        }

        self.next_id += 1;
        let opened = Trade {
            id: self.next_id,
            pair: trade.pair.clone(),
            side: trade.side,
            entry_price: trade.entry_price,
            exit_price: None,
            amount: trade.amount,
            invested: trade.invested,
            stop_loss: trade.stop_loss,
            take_profit: trade.take_profit,
            status: TradeStatus::Open,
            opened_at: trade.opened_at.unwrap_or_else(Utc::now),
            closed_at: None,
            pnl: None,
        };

        self.slots.insert(trade.pair, opened.clone());
        Ok(opened)
    }

    async fn close(&mut self, trade: &Trade, exit_price: f64) -> Result<Trade> {
        let matches = self
            .slots
            .get(&trade.pair)
            .is_some_and(|slot| slot.id == trade.id);
        if !matches {
            return Err(Error::Conflict(format!(
                "simulated trade #{} for {} is not open",
                trade.id, trade.pair
            )));
        }

        let mut closed = self
            .slots
            .remove(&trade.pair)
            .ok_or_else(|| Error::NotFound(format!("simulated trade #{}", trade.id)))?;

        closed.pnl = Some(closed.pnl_at(exit_price));
        closed.exit_price = Some(exit_price);
        closed.closed_at = Some(Utc::now());
        closed.status = TradeStatus::Closed;

        self.closed.push(closed.clone());
        Ok(closed)
    }
}

/// Position state read from and written to the trade ledger
pub struct LedgerPositions<'a, L: TradeLedger + ?Sized> {
    ledger: &'a L,
}

impl<'a, L: TradeLedger + ?Sized> LedgerPositions<'a, L> {
    pub fn new(ledger: &'a L) -> Self {
        Self { ledger }
    }
}

#[async_trait]
impl<'a, L: TradeLedger + ?Sized> PositionStore for LedgerPositions<'a, L> {
    async fn open_position(&self, pair: &str) -> Result<Option<Trade>> {
        let mut open = self.ledger.open_trades(Some(pair)).await?;
        if open.len() > 1 {
            return Err(Error::Conflict(format!(
                "{} has {} open trades, expected at most one",
                pair,
                open.len()
            )));
        }
        Ok(open.pop())
    }

    async fn invested_open(&self, pair: &str) -> Result<f64> {
        let open = self.ledger.open_trades(Some(pair)).await?;
        Ok(open.iter().map(|t| t.invested).sum())
    }

    async fn open(&mut self, trade: NewTrade) -> Result<Trade> {
        let id = self.ledger.open_trade(trade).await?;
        self.ledger
            .get_trade(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("trade #{} after open", id)))
    }

    async fn close(&mut self, trade: &Trade, exit_price: f64) -> Result<Trade> {
        self.ledger
            .close_trade(
                trade.id,
                CloseTrade {
                    exit_price,
                    closed_at: None,
                },
            )
            .await
    }
}
