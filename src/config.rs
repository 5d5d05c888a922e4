//! Configuration management
//!
//! Handles loading and parsing of JSON configuration files with environment
//! variable support for API credentials and the notification webhook.
//! Every section has defaults, so a config file only needs the keys it changes.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::error::EngineError;
use crate::{Side, Symbol};

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub exchange: ExchangeConfig,
    pub trading: TradingConfig,
    pub strategy: StrategyConfig,
    pub backtest: BacktestConfig,
    pub live: LiveConfig,
    /// Custom grid for `optimize --mode custom`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub grid: Option<GridConfig>,
}

impl Config {
    /// Load configuration from JSON file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let mut config: Config =
            serde_json::from_str(&contents).context("Failed to parse config JSON")?;

        config.apply_env();
        config.validate()?;

        Ok(config)
    }

    /// Pull API credentials and the webhook URL from the environment when set
    pub fn apply_env(&mut self) {
        if let Ok(api_key) = std::env::var("BINANCE_API_KEY") {
            self.exchange.api_key = Some(api_key);
        }
        if let Ok(api_secret) = std::env::var("BINANCE_API_SECRET") {
            self.exchange.api_secret = Some(api_secret);
        }
        if let Ok(url) = std::env::var("NOTIFY_WEBHOOK_URL") {
            self.live.webhook_url = Some(url);
        }
    }

    /// Reject parameter combinations the engine cannot run with
    pub fn validate(&self) -> Result<(), EngineError> {
        self.strategy.validate()?;
        self.exchange.validate()?;

        if !(self.trading.initial_capital.is_finite() && self.trading.initial_capital > 0.0) {
            return Err(EngineError::InvalidConfig(format!(
                "initial_capital must be positive, got {}",
                self.trading.initial_capital
            )));
        }
        if self.trading.max_open_positions == 0 {
            return Err(EngineError::InvalidConfig(
                "max_open_positions must be at least 1".to_string(),
            ));
        }
        if self.backtest.window_size < self.strategy.min_history {
            return Err(EngineError::InvalidConfig(format!(
                "window_size ({}) must be >= min_history ({})",
                self.backtest.window_size, self.strategy.min_history
            )));
        }

        Ok(())
    }
}

/// Exchange configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExchangeConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_secret: Option<String>,
    pub base_url: String,
    pub taker_fee: f64,
    pub slippage: f64,
    pub recv_window_ms: u64,
    pub request_timeout_secs: u64,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        ExchangeConfig {
            api_key: None,
            api_secret: None,
            base_url: "https://fapi.binance.com".to_string(),
            taker_fee: 0.0005, // 0.05%
            slippage: 0.0005,
            recv_window_ms: 5000,
            request_timeout_secs: 10,
        }
    }
}

impl ExchangeConfig {
    fn validate(&self) -> Result<(), EngineError> {
        for (name, value) in [("taker_fee", self.taker_fee), ("slippage", self.slippage)] {
            if !(value.is_finite() && (0.0..1.0).contains(&value)) {
                return Err(EngineError::InvalidConfig(format!(
                    "{name} must be in [0, 1), got {value}"
                )));
            }
        }
        Ok(())
    }
}

/// Trading configuration
///
/// Capital and martingale stakes are in the quote currency of the traded
/// pairs (USDT for Binance futures).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TradingConfig {
    pub symbols: Vec<String>,
    pub timeframe: String,
    /// Capital per symbol engine
    pub initial_capital: f64,
    /// Cap on concurrently open positions across all symbols
    pub max_open_positions: usize,
}

impl Default for TradingConfig {
    fn default() -> Self {
        TradingConfig {
            symbols: vec!["BTCUSDT".to_string()],
            timeframe: "5m".to_string(),
            initial_capital: 300.0,
            max_open_positions: 1,
        }
    }
}

impl TradingConfig {
    pub fn symbols(&self) -> Vec<Symbol> {
        self.symbols.iter().map(Symbol::new).collect()
    }
}

/// Which way explosions are traded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    #[default]
    Long,
    Short,
}

impl Direction {
    pub fn side(self) -> Side {
        match self {
            Direction::Long => Side::Buy,
            Direction::Short => Side::Sell,
        }
    }
}

/// Martingale and breakout parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StrategyConfig {
    /// Stake per martingale level
    pub martingale_sequence: Vec<f64>,
    pub leverage: u32,
    pub take_profit_pct: f64,
    pub stop_loss_pct: f64,
    /// Fraction of the liquidation distance treated as liquidation
    pub liquidation_safety_margin: f64,
    pub explosion_threshold: f64,
    pub volume_spike_ratio: f64,
    pub min_secondary_change: f64,
    pub cooldown_minutes: i64,
    pub max_daily_rounds: u32,
    pub min_history: usize,
    pub lookback_bars: usize,
    pub lookback_threshold: f64,
    pub direction: Direction,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        StrategyConfig {
            martingale_sequence: vec![10.0, 20.0, 40.0, 80.0, 150.0],
            leverage: 5,
            take_profit_pct: 0.15,
            stop_loss_pct: 0.10,
            liquidation_safety_margin: 0.95,
            explosion_threshold: 0.025,
            volume_spike_ratio: 4.0,
            min_secondary_change: 0.015,
            cooldown_minutes: 5,
            max_daily_rounds: 10,
            min_history: 3,
            lookback_bars: 5,
            lookback_threshold: 0.05,
            direction: Direction::Long,
        }
    }
}

impl StrategyConfig {
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.martingale_sequence.is_empty() {
            return Err(EngineError::InvalidConfig(
                "martingale_sequence must not be empty".to_string(),
            ));
        }
        if let Some(bad) = self
            .martingale_sequence
            .iter()
            .find(|b| !(b.is_finite() && **b > 0.0))
        {
            return Err(EngineError::InvalidConfig(format!(
                "martingale_sequence entries must be positive, got {bad}"
            )));
        }
        if self.leverage == 0 {
            return Err(EngineError::InvalidConfig(
                "leverage must be at least 1".to_string(),
            ));
        }

        let positive = [
            ("take_profit_pct", self.take_profit_pct),
            ("stop_loss_pct", self.stop_loss_pct),
            ("explosion_threshold", self.explosion_threshold),
            ("volume_spike_ratio", self.volume_spike_ratio),
        ];
        for (name, value) in positive {
            if !(value.is_finite() && value > 0.0) {
                return Err(EngineError::InvalidConfig(format!(
                    "{name} must be positive, got {value}"
                )));
            }
        }

        if !(self.liquidation_safety_margin > 0.0 && self.liquidation_safety_margin <= 1.0) {
            return Err(EngineError::InvalidConfig(format!(
                "liquidation_safety_margin must be in (0, 1], got {}",
                self.liquidation_safety_margin
            )));
        }
        if self.cooldown_minutes < 0 {
            return Err(EngineError::InvalidConfig(
                "cooldown_minutes must not be negative".to_string(),
            ));
        }
        if self.max_daily_rounds == 0 {
            return Err(EngineError::InvalidConfig(
                "max_daily_rounds must be at least 1".to_string(),
            ));
        }
        if self.min_history < 2 {
            return Err(EngineError::InvalidConfig(
                "min_history must be at least 2".to_string(),
            ));
        }

        Ok(())
    }

    /// Total capital a full losing round can consume
    pub fn round_exposure(&self) -> f64 {
        self.martingale_sequence.iter().sum()
    }
}

/// Backtest configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BacktestConfig {
    pub data_dir: String,
    pub results_dir: String,
    /// Bars handed to the signal detector per step
    pub window_size: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_date: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_date: Option<String>,
}

impl Default for BacktestConfig {
    fn default() -> Self {
        BacktestConfig {
            data_dir: "data".to_string(),
            results_dir: "results".to_string(),
            window_size: 50,
            start_date: None,
            end_date: None,
        }
    }
}

/// Live trading loop configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LiveConfig {
    pub poll_interval_secs: u64,
    /// Bars fetched per symbol per cycle
    pub kline_limit: usize,
    pub max_backoff_secs: u64,
    pub state_dir: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub webhook_url: Option<String>,
}

impl Default for LiveConfig {
    fn default() -> Self {
        LiveConfig {
            poll_interval_secs: 60,
            kline_limit: 50,
            max_backoff_secs: 300,
            state_dir: "state".to_string(),
            webhook_url: None,
        }
    }
}

/// Parameter grid for the optimizer. Empty axes keep the base config value.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GridConfig {
    pub martingale_sequence: Vec<Vec<f64>>,
    pub leverage: Vec<u32>,
    pub take_profit_pct: Vec<f64>,
    pub stop_loss_pct: Vec<f64>,
    pub explosion_threshold: Vec<f64>,
    pub volume_spike_ratio: Vec<f64>,
    pub cooldown_minutes: Vec<i64>,
    pub max_daily_rounds: Vec<u32>,
}
