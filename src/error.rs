//! Error types for the engine and the order execution boundary

use thiserror::Error;

use crate::Symbol;

/// Programming or state errors inside the engine. These are never retried.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EngineError {
    #[error("martingale level {level} is outside the sequence (len {len})")]
    LevelOutOfBounds { level: usize, len: usize },

    #[error("{0}: a position is already open")]
    PositionAlreadyOpen(Symbol),

    #[error("{0}: no open position to close")]
    NoOpenPosition(Symbol),

    #[error("{symbol}: cannot open at price {price}")]
    InvalidPrice { symbol: Symbol, price: f64 },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Failures reported by an `OrderExecutor`
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("order rejected: {0}")]
    Rejected(String),

    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("exchange API error (status {status}): {body}")]
    Api { status: u16, body: String },

    #[error("missing API credentials (set BINANCE_API_KEY and BINANCE_API_SECRET)")]
    MissingCredentials,
}

impl ExecutionError {
    /// Transient failures are worth retrying on the next cycle
    pub fn is_transient(&self) -> bool {
        match self {
            ExecutionError::Network(_) => true,
            ExecutionError::Api { status, .. } => *status == 429 || *status >= 500,
            ExecutionError::Rejected(_) | ExecutionError::MissingCredentials => false,
        }
    }
}
