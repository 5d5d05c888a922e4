//! Per-symbol replay engine
//!
//! Wires the signal detector, the martingale controller and the position
//! ledger together and advances them one bar at a time. Exits are evaluated
//! before entries, and a bar that closes a position never opens one.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::EngineError;
use crate::ledger::{Position, PositionLedger, TradeOutcome, TradeRecord};
use crate::martingale::{CapitalState, CloseOutcome, MartingaleController, RoundState, RoundStats};
use crate::signal::{EntrySignal, ExitSignal, Signal, SignalDetector};
use crate::{Candle, Money, Symbol};

/// Why a bar was not processed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Timestamp at or before the last processed bar
    Stale,
    /// NaN, non-finite or non-positive fields
    DataGap,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    Skipped(SkipReason),
    Opened(EntrySignal),
    Closed(TradeRecord),
    Held,
    Idle,
    /// Capital can no longer fund the first stake
    GameOver,
}

/// Snapshot of the engine for reporting
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EngineStats {
    pub symbol: Symbol,
    pub current_capital: Money,
    pub initial_capital: Money,
    pub peak_capital: Money,
    pub martingale_level: usize,
    pub current_bet: Option<Money>,
    pub total_rounds: u32,
    pub rounds_won: u32,
    pub rounds_lost: u32,
    pub total_trades: u32,
    pub has_position: bool,
    pub daily_round_count: u32,
    pub cooldown_until: Option<DateTime<Utc>>,
    pub data_gaps: u64,
}

/// Crash-recovery state, JSON round-trippable
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedState {
    pub symbol: Symbol,
    pub position: Option<Position>,
    #[serde(flatten)]
    pub round: RoundState,
    #[serde(flatten)]
    pub capital: CapitalState,
    pub stats: RoundStats,
    pub last_processed: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct ReplayEngine {
    symbol: Symbol,
    detector: SignalDetector,
    controller: MartingaleController,
    ledger: PositionLedger,
    last_processed: Option<DateTime<Utc>>,
    data_gaps: u64,
    /// Last gap bar seen, so a re-fetched gap is only counted once
    last_gap: Option<DateTime<Utc>>,
}

impl ReplayEngine {
    pub fn new(symbol: Symbol, config: &Config) -> Result<Self, EngineError> {
        config.strategy.validate()?;
        let controller =
            MartingaleController::new(&config.strategy, config.trading.initial_capital)?;

        Ok(ReplayEngine {
            detector: SignalDetector::new(&config.strategy),
            ledger: PositionLedger::new(symbol.clone(), &config.strategy, &config.exchange),
            controller,
            symbol,
            last_processed: None,
            data_gaps: 0,
            last_gap: None,
        })
    }

    pub fn symbol(&self) -> &Symbol {
        &self.symbol
    }

    pub fn position(&self) -> Option<&Position> {
        self.ledger.position()
    }

    pub fn has_position(&self) -> bool {
        self.ledger.has_position()
    }

    pub fn current_capital(&self) -> Money {
        self.controller.current_capital()
    }

    pub fn last_processed(&self) -> Option<DateTime<Utc>> {
        self.last_processed
    }

    pub fn is_game_over(&self) -> bool {
        !self.has_position() && self.controller.is_game_over()
    }

    /// Capital plus the open position marked at `price`
    pub fn equity(&self, price: f64) -> f64 {
        let capital = self.current_capital().to_f64();
        match self.ledger.position() {
            Some(pos) if price.is_finite() && price > 0.0 => capital + pos.unrealized_pnl(price),
            _ => capital,
        }
    }

    /// Whether `bar` would be processed: newer than the last processed bar
    /// and free of data gaps
    pub fn admit(&mut self, bar: &Candle) -> Result<(), SkipReason> {
        if !self.is_fresh(bar.datetime) {
            return Err(SkipReason::Stale);
        }
        if let Err(e) = bar.validate() {
            if self.last_gap == Some(bar.datetime) {
                debug!("{}: gap bar at {} seen again", self.symbol, bar.datetime);
            } else {
                self.last_gap = Some(bar.datetime);
                self.data_gaps += 1;
                warn!("{}: skipping bar at {} ({})", self.symbol, bar.datetime, e);
            }
            return Err(SkipReason::DataGap);
        }
        Ok(())
    }

    pub fn is_fresh(&self, ts: DateTime<Utc>) -> bool {
        self.last_processed.map_or(true, |last| ts > last)
    }

    pub fn mark_processed(&mut self, ts: DateTime<Utc>) {
        if self.is_fresh(ts) {
            self.last_processed = Some(ts);
        }
    }

    /// Gate and detect an entry on the last bar of `window`
    pub fn analyze(&mut self, window: &[Candle]) -> Option<EntrySignal> {
        if self.ledger.has_position() {
            return None;
        }
        let now = window.last()?.datetime;
        if !self.controller.can_enter(now) {
            return None;
        }
        let bet = self.controller.current_bet()?;
        self.detector
            .detect(&self.symbol, window, self.controller.level(), bet)
    }

    pub fn check_position(&self, price: f64, now: DateTime<Utc>) -> Option<ExitSignal> {
        self.ledger.check_exit(price, now)
    }

    /// Apply an open or close. Returns the trade record for closes.
    pub fn update_position(&mut self, signal: Signal) -> Result<Option<TradeRecord>, EngineError> {
        match signal {
            Signal::Entry(entry) => {
                let len = self.controller.sequence().len();
                if entry.martingale_level >= len {
                    return Err(EngineError::LevelOutOfBounds {
                        level: entry.martingale_level,
                        len,
                    });
                }
                let pos = self.ledger.open(&entry)?;
                info!(
                    "{} OPEN {} level {} @ {:.6} bet={} x{} amount={:.6} SL={:.6} TP={:.6} [{}]",
                    pos.symbol,
                    pos.side,
                    pos.martingale_level + 1,
                    pos.entry_price,
                    pos.bet_amount,
                    pos.leverage,
                    pos.amount,
                    pos.stop_loss_price,
                    pos.take_profit_price,
                    entry.reason
                );
                self.controller.on_open();
                Ok(None)
            }
            Signal::Exit(exit) => {
                let settlement = self.ledger.settle(&exit)?;
                let outcome = self.controller.on_close(
                    settlement.is_win(),
                    settlement.realized_pnl,
                    settlement.position.bet_amount,
                    exit.timestamp,
                )?;
                let outcome = match outcome {
                    CloseOutcome::Won => TradeOutcome::Won,
                    CloseOutcome::Lost { .. } => TradeOutcome::Lost,
                    CloseOutcome::Busted { .. } => TradeOutcome::Busted,
                };
                let record =
                    TradeRecord::from_settlement(&settlement, outcome, self.current_capital());

                info!(
                    "{} CLOSE {} @ {:.6} ({:+.2}%) pnl={} fees={} capital={} [{}]",
                    record.symbol,
                    record.exit_reason,
                    record.exit_price,
                    record.pnl_pct * 100.0,
                    record.realized_pnl,
                    record.fees,
                    record.capital_after,
                    outcome.as_str()
                );
                Ok(Some(record))
            }
            Signal::Hold => Ok(None),
        }
    }

    /// Process the last bar of `window`
    pub fn step(&mut self, window: &[Candle]) -> Result<StepOutcome, EngineError> {
        self.step_gated(window, true)
    }

    /// Process the last bar of `window`; `entries_allowed` lets a caller
    /// holding a portfolio-wide cap veto new positions.
    pub fn step_gated(
        &mut self,
        window: &[Candle],
        entries_allowed: bool,
    ) -> Result<StepOutcome, EngineError> {
        let Some(bar) = window.last() else {
            return Ok(StepOutcome::Skipped(SkipReason::DataGap));
        };
        if let Err(reason) = self.admit(bar) {
            return Ok(StepOutcome::Skipped(reason));
        }
        let now = bar.datetime;

        if self.ledger.has_position() {
            let outcome = match self.check_position(bar.close, now) {
                Some(exit) => match self.update_position(Signal::Exit(exit))? {
                    Some(record) => StepOutcome::Closed(record),
                    None => StepOutcome::Held,
                },
                None => StepOutcome::Held,
            };
            self.mark_processed(now);
            return Ok(outcome);
        }

        if entries_allowed {
            if let Some(entry) = self.analyze(window) {
                self.update_position(Signal::Entry(entry.clone()))?;
                self.mark_processed(now);
                return Ok(StepOutcome::Opened(entry));
            }
        }

        self.mark_processed(now);
        if self.controller.is_game_over() {
            debug!(
                "{}: capital {} below first stake",
                self.symbol,
                self.current_capital()
            );
            return Ok(StepOutcome::GameOver);
        }
        Ok(StepOutcome::Idle)
    }

    pub fn get_stats(&self) -> EngineStats {
        let capital = self.controller.capital_state();
        let round = self.controller.round_state();
        let stats = self.controller.stats();
        EngineStats {
            symbol: self.symbol.clone(),
            current_capital: capital.current_capital,
            initial_capital: capital.initial_capital,
            peak_capital: capital.peak_capital,
            martingale_level: round.martingale_level,
            current_bet: self.controller.current_bet(),
            total_rounds: stats.total_rounds,
            rounds_won: stats.rounds_won,
            rounds_lost: stats.rounds_lost,
            total_trades: stats.total_trades,
            has_position: self.ledger.has_position(),
            daily_round_count: round.daily_round_count,
            cooldown_until: round.cooldown_until,
            data_gaps: self.data_gaps,
        }
    }

    pub fn last_trade_date(&self) -> Option<NaiveDate> {
        self.controller.round_state().last_trade_date
    }

    pub fn snapshot(&self) -> PersistedState {
        PersistedState {
            symbol: self.symbol.clone(),
            position: self.ledger.position().cloned(),
            round: self.controller.round_state().clone(),
            capital: self.controller.capital_state().clone(),
            stats: self.controller.stats().clone(),
            last_processed: self.last_processed,
        }
    }

    pub fn restore(&mut self, state: PersistedState) -> Result<(), EngineError> {
        if state.symbol != self.symbol {
            return Err(EngineError::InvalidConfig(format!(
                "snapshot for {} cannot be restored into {}",
                state.symbol, self.symbol
            )));
        }
        if let Some(pos) = &state.position {
            if pos.symbol != self.symbol {
                return Err(EngineError::InvalidConfig(format!(
                    "snapshot position for {} does not belong to {}",
                    pos.symbol, self.symbol
                )));
            }
        }

        self.controller
            .restore(state.round, state.capital, state.stats)?;
        self.ledger.restore(state.position);
        self.last_processed = state.last_processed;

        info!(
            "{}: restored state, capital={} level={} position={}",
            self.symbol,
            self.current_capital(),
            self.controller.level(),
            self.ledger.has_position()
        );
        Ok(())
    }
}
