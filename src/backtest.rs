//! Backtesting engine
//!
//! Replays one symbol's bars through a `ReplayEngine` with a bounded lookback
//! window, recording the trade log and an equity curve.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::Path;
use tracing::{debug, info};

use crate::engine::{EngineStats, ReplayEngine, SkipReason, StepOutcome};
use crate::error::EngineError;
use crate::ledger::{TradeOutcome, TradeRecord};
use crate::{Candle, Config, Money, Symbol};

/// Backtest engine
pub struct Backtester {
    config: Config,
}

impl Backtester {
    pub fn new(config: Config) -> Self {
        Backtester { config }
    }

    /// Run a single-symbol backtest. Stops early on game over.
    pub fn run(&self, symbol: &Symbol, candles: &[Candle]) -> Result<BacktestResult, EngineError> {
        let mut engine = ReplayEngine::new(symbol.clone(), &self.config)?;
        let window_size = self.config.backtest.window_size.max(2);

        let mut equity_curve = Vec::with_capacity(candles.len());
        let mut trades = Vec::new();
        let mut game_over_at = None;
        let mut bars_processed = 0usize;

        for i in 0..candles.len() {
            let start = (i + 1).saturating_sub(window_size);
            let window = &candles[start..=i];
            let bar = &candles[i];

            let outcome = engine.step(window)?;
            match outcome {
                StepOutcome::Skipped(SkipReason::DataGap) | StepOutcome::Skipped(SkipReason::Stale) => {
                    continue;
                }
                StepOutcome::Closed(trade) => trades.push(trade),
                StepOutcome::GameOver => {
                    equity_curve.push((bar.datetime, engine.equity(bar.close)));
                    info!(
                        "{}: game over at {} with capital {}",
                        symbol,
                        bar.datetime,
                        engine.current_capital()
                    );
                    game_over_at = Some(bar.datetime);
                    bars_processed += 1;
                    break;
                }
                StepOutcome::Opened(_) | StepOutcome::Held | StepOutcome::Idle => {}
            }

            bars_processed += 1;
            equity_curve.push((bar.datetime, engine.equity(bar.close)));
        }

        let stats = engine.get_stats();
        let metrics = calculate_metrics(
            stats.initial_capital.to_f64(),
            &trades,
            &equity_curve,
            &[&stats],
        );
        debug!("{}: {} bars processed, {} trades", symbol, bars_processed, trades.len());

        Ok(BacktestResult {
            symbol: symbol.clone(),
            trades,
            equity_curve,
            metrics,
            open_position: engine.has_position(),
            stats,
            game_over_at,
            bars_processed,
        })
    }
}

#[derive(Debug, Clone)]
pub struct BacktestResult {
    pub symbol: Symbol,
    pub trades: Vec<TradeRecord>,
    pub equity_curve: Vec<(DateTime<Utc>, f64)>,
    pub metrics: PerformanceMetrics,
    pub stats: EngineStats,
    /// A position still open when the data ran out
    pub open_position: bool,
    pub game_over_at: Option<DateTime<Utc>>,
    pub bars_processed: usize,
}

/// Summary statistics of a run
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PerformanceMetrics {
    pub initial_capital: f64,
    pub final_capital: f64,
    pub peak_capital: f64,
    /// Percent
    pub total_return: f64,
    /// Percent, on the equity curve
    pub max_drawdown: f64,
    pub total_trades: usize,
    pub winning_trades: usize,
    pub losing_trades: usize,
    /// Percent of trades
    pub win_rate: f64,
    pub total_rounds: u32,
    pub rounds_won: u32,
    pub busts: u32,
    /// Percent of completed rounds
    pub round_win_rate: f64,
    pub longest_losing_streak: usize,
    pub total_fees: f64,
    pub profit_factor: f64,
    pub avg_win: f64,
    pub avg_loss: f64,
}

/// Metrics over a trade log and equity curve. `initial_capital` is the sum
/// over all engines in `stats`.
pub fn calculate_metrics(
    initial_capital: f64,
    trades: &[TradeRecord],
    equity_curve: &[(DateTime<Utc>, f64)],
    stats: &[&EngineStats],
) -> PerformanceMetrics {
    let final_capital: f64 = stats.iter().map(|s| s.current_capital.to_f64()).sum();
    let total_rounds: u32 = stats.iter().map(|s| s.total_rounds).sum();
    let rounds_won: u32 = stats.iter().map(|s| s.rounds_won).sum();
    let busts: u32 = stats.iter().map(|s| s.rounds_lost).sum();

    let total_return = if initial_capital > 0.0 {
        (final_capital - initial_capital) / initial_capital * 100.0
    } else {
        0.0
    };

    let winners: Vec<f64> = trades
        .iter()
        .filter(|t| t.realized_pnl.is_positive())
        .map(|t| t.realized_pnl.to_f64())
        .collect();
    let losers: Vec<f64> = trades
        .iter()
        .filter(|t| !t.realized_pnl.is_positive())
        .map(|t| t.realized_pnl.to_f64().abs())
        .collect();

    let gross_profits: f64 = winners.iter().sum();
    let gross_losses: f64 = losers.iter().sum();
    let profit_factor = if gross_losses > 0.0 {
        gross_profits / gross_losses
    } else if gross_profits > 0.0 {
        f64::INFINITY
    } else {
        0.0
    };

    let win_rate = if trades.is_empty() {
        0.0
    } else {
        winners.len() as f64 / trades.len() as f64 * 100.0
    };
    let round_win_rate = if total_rounds == 0 {
        0.0
    } else {
        rounds_won as f64 / total_rounds as f64 * 100.0
    };

    let mut longest_losing_streak = 0;
    let mut streak = 0;
    for t in trades {
        if t.outcome == TradeOutcome::Won {
            streak = 0;
        } else {
            streak += 1;
            longest_losing_streak = longest_losing_streak.max(streak);
        }
    }

    let mut peak = initial_capital;
    let mut max_dd = 0.0;
    let mut peak_capital = initial_capital;
    for (_, equity) in equity_curve {
        if *equity > peak {
            peak = *equity;
        }
        peak_capital = peak_capital.max(*equity);
        if peak > 0.0 {
            let dd = (peak - equity) / peak;
            if dd > max_dd {
                max_dd = dd;
            }
        }
    }

    let total_fees: Money = trades.iter().map(|t| t.fees).sum();

    PerformanceMetrics {
        initial_capital,
        final_capital,
        peak_capital,
        total_return,
        max_drawdown: max_dd * 100.0,
        total_trades: trades.len(),
        winning_trades: winners.len(),
        losing_trades: losers.len(),
        win_rate,
        total_rounds,
        rounds_won,
        busts,
        round_win_rate,
        longest_losing_streak,
        total_fees: total_fees.to_f64(),
        profit_factor,
        avg_win: if winners.is_empty() { 0.0 } else { gross_profits / winners.len() as f64 },
        avg_loss: if losers.is_empty() { 0.0 } else { gross_losses / losers.len() as f64 },
    }
}

/// Write the trade log as CSV
pub fn write_trades_csv(path: impl AsRef<Path>, trades: &[TradeRecord]) -> Result<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut writer = csv::Writer::from_path(path)
        .with_context(|| format!("Failed to create trade log: {}", path.display()))?;
    for trade in trades {
        writer.serialize(trade)?;
    }
    writer.flush()?;
    info!("Wrote {} trades to {}", trades.len(), path.display());
    Ok(())
}
