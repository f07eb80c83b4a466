use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::SellReason;

/// Record of a single simulated round trip
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeRecord {
    pub entry_time: DateTime<Utc>,
    pub exit_time: DateTime<Utc>,
    pub entry_price: f64,
    pub exit_price: f64,
    pub quantity: f64,
    pub invested: f64,
    pub pnl: f64,
    pub pnl_pct: f64,
    pub exit_reason: SellReason,
    pub holding_period_hours: i64,
}

impl TradeRecord {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        entry_time: DateTime<Utc>,
        exit_time: DateTime<Utc>,
        entry_price: f64,
        exit_price: f64,
        quantity: f64,
        invested: f64,
        pnl: f64,
        exit_reason: SellReason,
    ) -> Self {
        let pnl_pct = if entry_price > 0.0 {
            ((exit_price - entry_price) / entry_price) * 100.0
        } else {
            0.0
        };

        Self {
            entry_time,
            exit_time,
            entry_price,
            exit_price,
            quantity,
            invested,
            pnl,
            pnl_pct,
            exit_reason,
            holding_period_hours: (exit_time - entry_time).num_hours(),
        }
    }
}

/// Performance summary of one simulation run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationMetrics {
    // P&L
    pub total_pnl: f64,

    // Trade statistics
    pub total_trades: usize,
    pub winning_trades: usize,
    pub losing_trades: usize,
    pub win_rate: f64,

    // P&L distribution
    pub avg_win: f64,
    pub avg_loss: f64,
    pub largest_win: f64,
    pub largest_loss: f64,
    pub profit_factor: f64, // Total wins / Total losses

    // Risk
    pub max_drawdown: f64,

    // Holding period
    pub avg_holding_period_hours: f64,
    pub max_holding_period_hours: i64,

    // Exits by trigger
    pub stop_loss_exits: usize,
    pub take_profit_exits: usize,
    pub cross_exits: usize,

    pub trades: Vec<TradeRecord>,
}

impl SimulationMetrics {
    /// Calculate metrics from completed round trips, oldest first
    pub fn from_trades(trades: Vec<TradeRecord>) -> Self {
        let total_trades = trades.len();
        if total_trades == 0 {
            return Self::empty();
        }

        let total_pnl: f64 = trades.iter().map(|t| t.pnl).sum();

        let winning: Vec<f64> = trades.iter().map(|t| t.pnl).filter(|p| *p > 0.0).collect();
        let losing: Vec<f64> = trades.iter().map(|t| t.pnl).filter(|p| *p <= 0.0).collect();

        let win_rate = (winning.len() as f64 / total_trades as f64) * 100.0;

        let total_wins: f64 = winning.iter().sum();
        let total_losses: f64 = losing.iter().map(|p| p.abs()).sum();

        let avg_win = if winning.is_empty() {
            0.0
        } else {
            total_wins / winning.len() as f64
        };
        let avg_loss = if losing.is_empty() {
            0.0
        } else {
            total_losses / losing.len() as f64
        };

        let largest_win = winning.iter().copied().fold(0.0, f64::max);
        let largest_loss = losing.iter().copied().fold(0.0, f64::min);

        let profit_factor = if total_losses > 0.0 {
            total_wins / total_losses
        } else if total_wins > 0.0 {
            f64::INFINITY
        } else {
            0.0
        };

        let holding: Vec<i64> = trades.iter().map(|t| t.holding_period_hours).collect();
        let avg_holding_period_hours = holding.iter().sum::<i64>() as f64 / holding.len() as f64;
        let max_holding_period_hours = holding.iter().copied().max().unwrap_or(0);

        let count = |reason: SellReason| trades.iter().filter(|t| t.exit_reason == reason).count();

        Self {
            total_pnl,
            total_trades,
            winning_trades: winning.len(),
            losing_trades: losing.len(),
            win_rate,
            avg_win,
            avg_loss,
            largest_win,
            largest_loss,
            profit_factor,
            max_drawdown: Self::calculate_drawdown(&trades),
            avg_holding_period_hours,
            max_holding_period_hours,
            stop_loss_exits: count(SellReason::StopLoss),
            take_profit_exits: count(SellReason::TakeProfit),
            cross_exits: count(SellReason::Cross),
            trades,
        }
    }

    /// Empty metrics for when no trades occurred
    fn empty() -> Self {
        Self {
            total_pnl: 0.0,
            total_trades: 0,
            winning_trades: 0,
            losing_trades: 0,
            win_rate: 0.0,
            avg_win: 0.0,
            avg_loss: 0.0,
            largest_win: 0.0,
            largest_loss: 0.0,
            profit_factor: 0.0,
            max_drawdown: 0.0,
            avg_holding_period_hours: 0.0,
            max_holding_period_hours: 0,
            stop_loss_exits: 0,
            take_profit_exits: 0,
            cross_exits: 0,
            trades: vec![],
        }
    }

    /// Largest peak-to-trough fall of cumulative realized PnL
    fn calculate_drawdown(trades: &[TradeRecord]) -> f64 {
        let mut peak = 0.0_f64;
        let mut cumulative = 0.0;
        let mut max_dd = 0.0;

        for trade in trades {
            cumulative += trade.pnl;
            peak = peak.max(cumulative);
            let drawdown = peak - cumulative;
            if drawdown > max_dd {
                max_dd = drawdown;
            }
        }

        max_dd
    }

    /// Log a formatted report
    pub fn log_report(&self, pair: &str) {
        tracing::info!("📊 SIMULATION {}", pair);
        tracing::info!("  Total PnL:             {:.2}", self.total_pnl);
        tracing::info!(
            "  Trades:                {} ({} won, {} lost, {:.1}% win rate)",
            self.total_trades,
            self.winning_trades,
            self.losing_trades,
            self.win_rate
        );

        if self.total_trades > 0 {
            tracing::info!("  Average Win:           {:.2}", self.avg_win);
            tracing::info!("  Average Loss:          {:.2}", self.avg_loss);
            tracing::info!("  Largest Win:           {:.2}", self.largest_win);
            tracing::info!("  Largest Loss:          {:.2}", self.largest_loss);
            tracing::info!("  Profit Factor:         {:.2}", self.profit_factor);
            tracing::info!("  Max Drawdown:          {:.2}", self.max_drawdown);
            tracing::info!(
                "  Holding:               avg {:.1}h, max {}h",
                self.avg_holding_period_hours,
                self.max_holding_period_hours
            );
            tracing::info!(
                "  Exits:                 SL={} TP={} CROSS={}",
                self.stop_loss_exits,
                self.take_profit_exits,
                self.cross_exits
            );
        }
    }
}
