//! Live and paper trading
//!
//! - `feed`: polled bar sources
//! - `executor`: paper and Binance futures order execution
//! - `notifier`: webhook / log notifications
//! - `backoff`: retry delays for failing cycles
//! - `trader`: the cancellable polling loop

pub mod backoff;
pub mod executor;
pub mod feed;
pub mod notifier;
pub mod trader;

pub use backoff::ExponentialBackoff;
pub use executor::{BinanceFuturesExecutor, Fill, OrderExecutor, OrderRequest, PaperExecutor};
pub use feed::{BarFeed, BinanceFeed};
pub use notifier::{LogNotifier, Notifier, WebhookNotifier};
pub use trader::{CycleError, CycleReport, LiveTrader};
