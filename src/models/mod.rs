use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Length of one candle in seconds (4h)
pub const CANDLE_INTERVAL_SECS: i64 = 4 * 60 * 60;

/// Is `time` on an absolute 4h boundary
pub fn is_aligned(time: i64) -> bool {
    time % CANDLE_INTERVAL_SECS == 0
}

/// Current time in epoch seconds
pub fn now_secs() -> i64 {
    Utc::now().timestamp()
}

/// OHLCV candle, keyed by (pair, time)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Candle {
    pub pair: String,
    /// Epoch seconds, aligned on `CANDLE_INTERVAL_SECS`
    pub time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// Per-pair budget caps and exit percentages.
///
/// Percentages are fractions (0.06 = 6%). A percentage of 0 disables that exit.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PairSettings {
    pub pair: String,
    pub max_invest_fiat: f64,
    pub max_per_tx_fiat: f64,
    pub take_profit_pct: f64,
    pub stop_loss_pct: f64,
}

impl PairSettings {
    pub fn validate(&self) -> Result<(), Error> {
        let fields = [
            ("max_invest_fiat", self.max_invest_fiat),
            ("max_per_tx_fiat", self.max_per_tx_fiat),
            ("take_profit_pct", self.take_profit_pct),
            ("stop_loss_pct", self.stop_loss_pct),
        ];
        for (name, value) in fields {
            if !value.is_finite() || value < 0.0 {
                return Err(Error::Validation(format!(
                    "{} for {} must be >= 0, got {}",
                    name, self.pair, value
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum TradeSide {
    Buy,
    Sell,
}

impl TradeSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeSide::Buy => "BUY",
            TradeSide::Sell => "SELL",
        }
    }
}

impl FromStr for TradeSide {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "BUY" => Ok(TradeSide::Buy),
            "SELL" => Ok(TradeSide::Sell),
            other => Err(Error::Validation(format!("Invalid trade side: {}", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum TradeStatus {
    Open,
    Closed,
}

impl TradeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeStatus::Open => "OPEN",
            TradeStatus::Closed => "CLOSED",
        }
    }
}

impl FromStr for TradeStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "OPEN" => Ok(TradeStatus::Open),
            "CLOSED" => Ok(TradeStatus::Closed),
            other => Err(Error::Validation(format!("Invalid trade status: {}", other))),
        }
    }
}

/// A position record. Created Open, closed exactly once.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Trade {
    pub id: i64,
    pub pair: String,
    pub side: TradeSide,
    pub entry_price: f64,
    pub exit_price: Option<f64>,
    /// Quantity in base asset
    pub amount: f64,
    /// Fiat committed at entry
    pub invested: f64,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    pub status: TradeStatus,
    pub opened_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    /// Fiat, set only at close
    pub pnl: Option<f64>,
}

impl Trade {
    pub fn is_open(&self) -> bool {
        self.status == TradeStatus::Open
    }

    /// Close price at or below the stop loss
    pub fn stop_loss_hit(&self, close: f64) -> bool {
        self.stop_loss.is_some_and(|sl| close <= sl)
    }

    /// Close price at or above the take profit
    pub fn take_profit_hit(&self, close: f64) -> bool {
        self.take_profit.is_some_and(|tp| close >= tp)
    }

    /// Realized P&L if the trade were closed at `exit_price`
    pub fn pnl_at(&self, exit_price: f64) -> f64 {
        match self.side {
            TradeSide::Buy => (exit_price - self.entry_price) * self.amount,
            TradeSide::Sell => (self.entry_price - exit_price) * self.amount,
        }
    }
}

/// Fields needed to open a trade
#[derive(Debug, Clone, PartialEq)]
pub struct NewTrade {
    pub pair: String,
    pub side: TradeSide,
    pub entry_price: f64,
    pub amount: f64,
    pub invested: f64,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    /// Defaults to now
    pub opened_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CloseTrade {
    pub exit_price: f64,
    /// Defaults to now
    pub closed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TradeFilter {
    pub pair: Option<String>,
    pub status: Option<TradeStatus>,
    pub limit: i64,
    pub offset: i64,
}

impl Default for TradeFilter {
    fn default() -> Self {
        Self {
            pair: None,
            status: None,
            limit: 100,
            offset: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HoldReason {
    NotEnoughHistory,
    NoSignal,
    NoBudget,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum SellReason {
    #[serde(rename = "SL")]
    StopLoss,
    #[serde(rename = "TP")]
    TakeProfit,
    #[serde(rename = "CROSS")]
    Cross,
}

impl fmt::Display for SellReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SellReason::StopLoss => "SL",
            SellReason::TakeProfit => "TP",
            SellReason::Cross => "CROSS",
        };
        f.write_str(s)
    }
}

/// Outcome of one decision for one pair at one candle close
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "UPPERCASE")]
pub enum SwingAction {
    Hold {
        reason: HoldReason,
    },
    Buy {
        price: f64,
        qty: f64,
        invest: f64,
        stop_loss: Option<f64>,
        take_profit: Option<f64>,
        time: i64,
    },
    Sell {
        price: f64,
        reason: SellReason,
        pnl: Option<f64>,
        time: i64,
    },
}

impl SwingAction {
    pub fn hold(reason: HoldReason) -> Self {
        SwingAction::Hold { reason }
    }
}
