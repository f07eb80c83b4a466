// Technical indicators module
// Moving averages and crossover detection for the swing strategy

pub mod crossover;
pub mod moving_average;

pub use crossover::{detect_crossover, is_cross_down, is_cross_up, last_two_defined, Crossover};
pub use moving_average::{calculate_sma, sma_series};
