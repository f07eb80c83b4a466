// Core modules
pub mod api;
pub mod backtest;
pub mod config;
pub mod db;
pub mod error;
pub mod execution;
pub mod fetch;
pub mod indicators;
pub mod models;
pub mod retention;
pub mod strategy;

// Re-export commonly used types
pub use error::{Error, Result};
pub use models::*;
