//! Martingale Sniper
//!
//! A leveraged breakout engine with martingale bet sizing, sharing one
//! deterministic per-symbol replay engine between backtesting, parameter
//! optimization and live trading.

pub mod config;
pub mod data;
pub mod types;
pub mod error;
pub mod signal;
pub mod martingale;
pub mod ledger;
pub mod engine;
pub mod backtest;
pub mod scanner;
pub mod optimizer;
pub mod state_manager;
pub mod live;

pub use config::Config;
pub use error::{EngineError, ExecutionError};
pub use types::*;
