//! Martingale bet progression with cooldown and daily round gating
//!
//! A round starts at level 0 and ends either with a win (back to level 0) or
//! with a bust after the last level loses (also back to level 0). Between
//! losing levels the controller enforces a cooldown.

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::StrategyConfig;
use crate::error::EngineError;
use crate::Money;

/// Position in the bet sequence plus the gating clocks
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RoundState {
    pub martingale_level: usize,
    pub cooldown_until: Option<DateTime<Utc>>,
    pub daily_round_count: u32,
    pub last_trade_date: Option<NaiveDate>,
    /// Realized PnL accumulated by the round in progress
    pub round_pnl: Money,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapitalState {
    pub current_capital: Money,
    pub initial_capital: Money,
    pub peak_capital: Money,
}

impl CapitalState {
    pub fn new(initial: Money) -> Self {
        CapitalState {
            current_capital: initial,
            initial_capital: initial,
            peak_capital: initial,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RoundStats {
    pub total_rounds: u32,
    pub rounds_won: u32,
    pub rounds_lost: u32,
    pub total_trades: u32,
}

/// Why an entry is not allowed right now
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EntryBlocked {
    #[error("martingale sequence exhausted at level {0}")]
    SequenceExhausted(usize),

    #[error("insufficient capital: {capital} < bet {bet}")]
    InsufficientCapital { capital: Money, bet: Money },

    #[error("cooling down until {0}")]
    Cooldown(DateTime<Utc>),

    #[error("daily round cap reached ({0})")]
    DailyRoundCap(u32),
}

/// Result of settling a closed position into the round state
#[derive(Debug, Clone, PartialEq)]
pub enum CloseOutcome {
    Won,
    Lost {
        next_level: usize,
        cooldown_until: DateTime<Utc>,
    },
    /// The last level lost; the round is over and the level is back at 0
    Busted { round_loss: Money },
}

#[derive(Debug, Clone)]
pub struct MartingaleController {
    sequence: Vec<Money>,
    cooldown: Duration,
    max_daily_rounds: u32,
    round: RoundState,
    capital: CapitalState,
    stats: RoundStats,
}

impl MartingaleController {
    pub fn new(config: &StrategyConfig, initial_capital: f64) -> Result<Self, EngineError> {
        if config.martingale_sequence.is_empty() {
            return Err(EngineError::InvalidConfig(
                "martingale_sequence must not be empty".to_string(),
            ));
        }
        let sequence = config
            .martingale_sequence
            .iter()
            .map(|b| Money::from_f64(*b))
            .collect();

        Ok(MartingaleController {
            sequence,
            cooldown: Duration::minutes(config.cooldown_minutes),
            max_daily_rounds: config.max_daily_rounds,
            round: RoundState::default(),
            capital: CapitalState::new(Money::from_f64(initial_capital)),
            stats: RoundStats::default(),
        })
    }

    pub fn sequence(&self) -> &[Money] {
        &self.sequence
    }

    pub fn level(&self) -> usize {
        self.round.martingale_level
    }

    /// Stake for the current level, `None` once the sequence is exhausted
    pub fn current_bet(&self) -> Option<Money> {
        self.sequence.get(self.round.martingale_level).copied()
    }

    pub fn current_capital(&self) -> Money {
        self.capital.current_capital
    }

    pub fn round_state(&self) -> &RoundState {
        &self.round
    }

    pub fn capital_state(&self) -> &CapitalState {
        &self.capital
    }

    pub fn stats(&self) -> &RoundStats {
        &self.stats
    }

    /// Capital can no longer fund the first stake
    pub fn is_game_over(&self) -> bool {
        self.capital.current_capital < self.sequence[0]
    }

    /// Gate an entry at `now`, returning the stake to use
    pub fn check_entry(&mut self, now: DateTime<Utc>) -> Result<Money, EntryBlocked> {
        self.roll_date(now);

        let level = self.round.martingale_level;
        let bet = self
            .sequence
            .get(level)
            .copied()
            .ok_or(EntryBlocked::SequenceExhausted(level))?;

        if let Some(until) = self.round.cooldown_until {
            if now < until {
                return Err(EntryBlocked::Cooldown(until));
            }
        }

        if self.round.daily_round_count >= self.max_daily_rounds {
            return Err(EntryBlocked::DailyRoundCap(self.round.daily_round_count));
        }

        if self.capital.current_capital < bet {
            return Err(EntryBlocked::InsufficientCapital {
                capital: self.capital.current_capital,
                bet,
            });
        }

        Ok(bet)
    }

    pub fn can_enter(&mut self, now: DateTime<Utc>) -> bool {
        match self.check_entry(now) {
            Ok(_) => true,
            Err(reason) => {
                debug!("Entry blocked: {}", reason);
                false
            }
        }
    }

    /// Count an opened position
    pub fn on_open(&mut self) {
        self.stats.total_trades += 1;
    }

    /// Settle a closed position.
    ///
    /// Losses are clamped to `-bet_amount`, so capital never drops by more
    /// than the stake of the losing level.
    pub fn on_close(
        &mut self,
        win: bool,
        pnl: Money,
        bet_amount: Money,
        now: DateTime<Utc>,
    ) -> Result<CloseOutcome, EngineError> {
        let len = self.sequence.len();
        if self.round.martingale_level >= len {
            return Err(EngineError::LevelOutOfBounds {
                level: self.round.martingale_level,
                len,
            });
        }

        // A round closing after midnight counts against the new day
        self.roll_date(now);

        if win {
            self.apply_pnl(pnl);
            self.round.martingale_level = 0;
            self.round.cooldown_until = None;
            self.round.daily_round_count += 1;
            self.round.round_pnl = Money::ZERO;
            self.stats.rounds_won += 1;
            self.stats.total_rounds += 1;

            info!(
                "Round won: pnl={} capital={}",
                pnl, self.capital.current_capital
            );
            return Ok(CloseOutcome::Won);
        }

        let pnl = pnl.max(-bet_amount);
        self.apply_pnl(pnl);
        self.round.round_pnl += pnl;
        self.round.martingale_level += 1;

        if self.round.martingale_level >= len {
            let round_loss = -self.round.round_pnl;
            self.round.martingale_level = 0;
            self.round.cooldown_until = None;
            self.round.daily_round_count += 1;
            self.round.round_pnl = Money::ZERO;
            self.stats.rounds_lost += 1;
            self.stats.total_rounds += 1;

            warn!(
                "BUST: all {} levels lost, round loss {} capital={}",
                len, round_loss, self.capital.current_capital
            );
            return Ok(CloseOutcome::Busted { round_loss });
        }

        let cooldown_until = now + self.cooldown;
        self.round.cooldown_until = Some(cooldown_until);
        info!(
            "Loss at level {}: pnl={} capital={} next bet={}",
            self.round.martingale_level,
            pnl,
            self.capital.current_capital,
            self.sequence[self.round.martingale_level]
        );

        Ok(CloseOutcome::Lost {
            next_level: self.round.martingale_level,
            cooldown_until,
        })
    }

    /// Replace state from a persisted snapshot
    pub fn restore(
        &mut self,
        mut round: RoundState,
        capital: CapitalState,
        stats: RoundStats,
    ) -> Result<(), EngineError> {
        let len = self.sequence.len();
        if round.martingale_level > len {
            return Err(EngineError::LevelOutOfBounds {
                level: round.martingale_level,
                len,
            });
        }
        if round.martingale_level == len {
            // Crashed mid-bust
            round.martingale_level = 0;
            round.round_pnl = Money::ZERO;
        }
        self.round = round;
        self.capital = capital;
        self.stats = stats;
        Ok(())
    }

    fn apply_pnl(&mut self, pnl: Money) {
        self.capital.current_capital += pnl;
        if self.capital.current_capital > self.capital.peak_capital {
            self.capital.peak_capital = self.capital.current_capital;
        }
    }

    fn roll_date(&mut self, now: DateTime<Utc>) {
        let today = now.date_naive();
        if self.round.last_trade_date != Some(today) {
            if self.round.last_trade_date.is_some() && self.round.daily_round_count > 0 {
                debug!("New trading day {}, resetting daily rounds", today);
            }
            self.round.daily_round_count = 0;
            self.round.last_trade_date = Some(today);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn config(sequence: &[f64]) -> StrategyConfig {
        StrategyConfig {
            martingale_sequence: sequence.to_vec(),
            ..StrategyConfig::default()
        }
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    fn m(v: f64) -> Money {
        Money::from_f64(v)
    }

    #[test]
    fn test_consecutive_losses_advance_level() {
        let mut ctl = MartingaleController::new(&config(&[10.0, 20.0, 40.0, 80.0]), 300.0).unwrap();
        let mut now = t0();
        for n in 1..4 {
            let bet = ctl.check_entry(now).unwrap();
            let outcome = ctl.on_close(false, -bet, bet, now).unwrap();
            assert!(matches!(outcome, CloseOutcome::Lost { next_level, .. } if next_level == n));
            assert_eq!(ctl.level(), n);
            now += Duration::minutes(10);
        }
        assert_eq!(ctl.current_bet(), Some(m(80.0)));
    }

    #[test]
    fn test_bust_resets_level_and_bounds_loss() {
        let mut ctl = MartingaleController::new(&config(&[10.0, 20.0, 40.0]), 300.0).unwrap();
        let mut now = t0();
        let mut last = None;
        for _ in 0..3 {
            let bet = ctl.check_entry(now).unwrap();
            // a loss larger than the stake is clamped
            last = Some(ctl.on_close(false, m(-1000.0), bet, now).unwrap());
            now += Duration::minutes(10);
        }
        assert_eq!(last, Some(CloseOutcome::Busted { round_loss: m(70.0) }));
        assert_eq!(ctl.level(), 0);
        assert_eq!(ctl.current_capital(), m(230.0));
        assert_eq!(ctl.stats().rounds_lost, 1);
        assert_eq!(ctl.round_state().daily_round_count, 1);
        assert_eq!(ctl.round_state().cooldown_until, None);
    }

    #[test]
    fn test_win_resets_round() {
        let mut ctl = MartingaleController::new(&config(&[10.0, 20.0]), 100.0).unwrap();
        let now = t0();
        ctl.on_close(false, m(-10.0), m(10.0), now).unwrap();
        assert_eq!(ctl.level(), 1);
        let outcome = ctl.on_close(true, m(15.0), m(20.0), now + Duration::minutes(6)).unwrap();
        assert_eq!(outcome, CloseOutcome::Won);
        assert_eq!(ctl.level(), 0);
        assert_eq!(ctl.current_capital(), m(105.0));
        assert_eq!(ctl.capital_state().peak_capital, m(105.0));
        assert_eq!(ctl.stats().rounds_won, 1);
    }

    #[test]
    fn test_cooldown_blocks_entry() {
        let mut ctl = MartingaleController::new(&config(&[10.0, 20.0]), 100.0).unwrap();
        let now = t0();
        ctl.on_close(false, m(-10.0), m(10.0), now).unwrap();

        assert!(matches!(
            ctl.check_entry(now + Duration::minutes(4)),
            Err(EntryBlocked::Cooldown(_))
        ));
        assert_eq!(ctl.check_entry(now + Duration::minutes(5)), Ok(m(20.0)));
    }

    #[test]
    fn test_daily_cap_and_rollover() {
        let cfg = StrategyConfig {
            martingale_sequence: vec![10.0],
            max_daily_rounds: 2,
            ..StrategyConfig::default()
        };
        let mut ctl = MartingaleController::new(&cfg, 100.0).unwrap();
        let now = t0();
        ctl.on_close(true, m(1.0), m(10.0), now).unwrap();
        ctl.on_close(true, m(1.0), m(10.0), now).unwrap();
        assert_eq!(ctl.check_entry(now), Err(EntryBlocked::DailyRoundCap(2)));

        let tomorrow = now + Duration::days(1);
        assert!(ctl.can_enter(tomorrow));
        assert_eq!(ctl.round_state().daily_round_count, 0);
    }

    #[test]
    fn test_round_closing_after_midnight_counts_for_new_day() {
        let cfg = StrategyConfig {
            martingale_sequence: vec![10.0],
            max_daily_rounds: 1,
            ..StrategyConfig::default()
        };
        let mut ctl = MartingaleController::new(&cfg, 100.0).unwrap();
        let evening = Utc.with_ymd_and_hms(2024, 5, 1, 23, 58, 0).unwrap();
        assert!(ctl.can_enter(evening));
        let after_midnight = Utc.with_ymd_and_hms(2024, 5, 2, 0, 3, 0).unwrap();
        ctl.on_close(true, m(2.0), m(10.0), after_midnight).unwrap();

        assert_eq!(
            ctl.round_state().last_trade_date,
            Some(after_midnight.date_naive())
        );
        assert_eq!(ctl.round_state().daily_round_count, 1);
        assert!(!ctl.can_enter(after_midnight + Duration::hours(1)));
    }

    #[test]
    fn test_insufficient_capital() {
        let mut ctl = MartingaleController::new(&config(&[10.0, 20.0]), 25.0).unwrap();
        let now = t0();
        ctl.on_close(false, m(-10.0), m(10.0), now).unwrap();
        assert!(matches!(
            ctl.check_entry(now + Duration::hours(1)),
            Err(EntryBlocked::InsufficientCapital { .. })
        ));
        assert!(!ctl.is_game_over());
    }

    #[test]
    fn test_restore_rejects_bad_level() {
        let mut ctl = MartingaleController::new(&config(&[10.0, 20.0]), 100.0).unwrap();
        let round = RoundState {
            martingale_level: 3,
            ..RoundState::default()
        };
        let err = ctl
            .restore(round, CapitalState::new(m(100.0)), RoundStats::default())
            .unwrap_err();
        assert_eq!(err, EngineError::LevelOutOfBounds { level: 3, len: 2 });
    }
}
