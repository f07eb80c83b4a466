// Offline replay of stored candles
pub mod metrics;
pub mod runner;

pub use metrics::{SimulationMetrics, TradeRecord};
pub use runner::{SimulationReport, SimulationRunner};
