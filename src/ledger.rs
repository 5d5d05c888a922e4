//! Lifecycle of a single leveraged position: exit evaluation and
//! fee/slippage-adjusted settlement.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::{ExchangeConfig, StrategyConfig};
use crate::error::EngineError;
use crate::signal::{EntrySignal, ExitReason, ExitSignal};
use crate::{Money, Side, Symbol};

/// An open leveraged position
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub symbol: Symbol,
    pub side: Side,
    pub entry_price: f64,
    pub amount: f64,
    pub bet_amount: Money,
    pub leverage: u32,
    pub martingale_level: usize,
    pub entry_time: DateTime<Utc>,
    pub stop_loss_price: f64,
    pub take_profit_price: f64,
}

impl Position {
    pub fn from_entry(signal: &EntrySignal) -> Self {
        Position {
            symbol: signal.symbol.clone(),
            side: signal.side,
            entry_price: signal.price,
            amount: signal.amount,
            bet_amount: signal.bet_amount,
            leverage: signal.leverage,
            martingale_level: signal.martingale_level,
            entry_time: signal.timestamp,
            stop_loss_price: signal.stop_loss_price,
            take_profit_price: signal.take_profit_price,
        }
    }

    /// Unleveraged price move in the position's favour
    pub fn pnl_pct(&self, price: f64) -> f64 {
        if self.entry_price <= 0.0 {
            return 0.0;
        }
        (price - self.entry_price) / self.entry_price * self.side.sign()
    }

    /// Mark-to-market PnL before costs, never worse than losing the stake
    pub fn unrealized_pnl(&self, price: f64) -> f64 {
        let bet = self.bet_amount.to_f64();
        (bet * self.pnl_pct(price) * self.leverage as f64).max(-bet)
    }
}

/// Outcome of closing a position, before it is applied to the round state
#[derive(Debug, Clone, PartialEq)]
pub struct Settlement {
    pub position: Position,
    pub exit_price: f64,
    pub exit_time: DateTime<Utc>,
    pub reason: ExitReason,
    pub pnl_pct: f64,
    pub gross_pnl: Money,
    pub fees: Money,
    pub realized_pnl: Money,
}

impl Settlement {
    /// A take-profit ends the round, even when costs leave it slightly negative
    pub fn is_win(&self) -> bool {
        self.reason == ExitReason::TakeProfit
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeOutcome {
    Won,
    Lost,
    Busted,
}

impl TradeOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            TradeOutcome::Won => "won",
            TradeOutcome::Lost => "lost",
            TradeOutcome::Busted => "busted",
        }
    }
}

/// One closed trade, as written to the trade log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeRecord {
    pub symbol: Symbol,
    pub side: Side,
    pub martingale_level: usize,
    pub entry_time: DateTime<Utc>,
    pub exit_time: DateTime<Utc>,
    pub entry_price: f64,
    pub exit_price: f64,
    pub amount: f64,
    pub bet_amount: Money,
    pub leverage: u32,
    pub gross_pnl: Money,
    pub fees: Money,
    pub realized_pnl: Money,
    pub pnl_pct: f64,
    pub exit_reason: ExitReason,
    pub outcome: TradeOutcome,
    pub capital_after: Money,
}

impl TradeRecord {
    pub fn from_settlement(s: &Settlement, outcome: TradeOutcome, capital_after: Money) -> Self {
        TradeRecord {
            symbol: s.position.symbol.clone(),
            side: s.position.side,
            martingale_level: s.position.martingale_level,
            entry_time: s.position.entry_time,
            exit_time: s.exit_time,
            entry_price: s.position.entry_price,
            exit_price: s.exit_price,
            amount: s.position.amount,
            bet_amount: s.position.bet_amount,
            leverage: s.position.leverage,
            gross_pnl: s.gross_pnl,
            fees: s.fees,
            realized_pnl: s.realized_pnl,
            pnl_pct: s.pnl_pct,
            exit_reason: s.reason,
            outcome,
            capital_after,
        }
    }
}

/// Holds at most one open position and knows how to close it
#[derive(Debug, Clone)]
pub struct PositionLedger {
    symbol: Symbol,
    take_profit_pct: f64,
    stop_loss_pct: f64,
    liquidation_safety_margin: f64,
    taker_fee: f64,
    slippage: f64,
    position: Option<Position>,
}

impl PositionLedger {
    pub fn new(symbol: Symbol, strategy: &StrategyConfig, exchange: &ExchangeConfig) -> Self {
        PositionLedger {
            symbol,
            take_profit_pct: strategy.take_profit_pct,
            stop_loss_pct: strategy.stop_loss_pct,
            liquidation_safety_margin: strategy.liquidation_safety_margin,
            taker_fee: exchange.taker_fee,
            slippage: exchange.slippage,
            position: None,
        }
    }

    pub fn position(&self) -> Option<&Position> {
        self.position.as_ref()
    }

    pub fn has_position(&self) -> bool {
        self.position.is_some()
    }

    pub fn open(&mut self, signal: &EntrySignal) -> Result<&Position, EngineError> {
        if self.position.is_some() {
            return Err(EngineError::PositionAlreadyOpen(self.symbol.clone()));
        }
        if !(signal.price.is_finite() && signal.price > 0.0 && signal.amount.is_finite()) {
            return Err(EngineError::InvalidPrice {
                symbol: self.symbol.clone(),
                price: signal.price,
            });
        }
        Ok(self.position.insert(Position::from_entry(signal)))
    }

    /// Restore a position loaded from a snapshot
    pub fn restore(&mut self, position: Option<Position>) {
        self.position = position;
    }

    /// Evaluate exits at `price`. Take-profit wins over stop-loss, which
    /// wins over liquidation.
    pub fn check_exit(&self, price: f64, now: DateTime<Utc>) -> Option<ExitSignal> {
        let pos = self.position.as_ref()?;
        if !(price.is_finite() && price > 0.0) {
            return None;
        }

        let pnl_pct = pos.pnl_pct(price);
        let liquidation_pct =
            -(1.0 / pos.leverage.max(1) as f64) * self.liquidation_safety_margin;

        let reason = if pnl_pct >= self.take_profit_pct {
            ExitReason::TakeProfit
        } else if pnl_pct <= -self.stop_loss_pct {
            ExitReason::StopLoss
        } else if pnl_pct <= liquidation_pct {
            ExitReason::Liquidation
        } else {
            return None;
        };

        Some(ExitSignal {
            symbol: pos.symbol.clone(),
            price,
            timestamp: now,
            reason,
            pnl_pct,
        })
    }

    /// Close the open position at the exit signal's price
    pub fn settle(&mut self, exit: &ExitSignal) -> Result<Settlement, EngineError> {
        let position = self
            .position
            .take()
            .ok_or_else(|| EngineError::NoOpenPosition(self.symbol.clone()))?;

        let bet = position.bet_amount;
        let pnl_pct = position.pnl_pct(exit.price);

        if exit.reason == ExitReason::Liquidation {
            return Ok(Settlement {
                position,
                exit_price: exit.price,
                exit_time: exit.timestamp,
                reason: exit.reason,
                pnl_pct,
                gross_pnl: -bet,
                fees: Money::ZERO,
                realized_pnl: -bet,
            });
        }

        let (gross, fees) = self.costs(&position, exit.price);
        let gross_pnl = Money::settle(gross);
        let fees = Money::settle(fees);
        let realized_pnl = (gross_pnl - fees).max(-bet);

        Ok(Settlement {
            position,
            exit_price: exit.price,
            exit_time: exit.timestamp,
            reason: exit.reason,
            pnl_pct,
            gross_pnl,
            fees,
            realized_pnl,
        })
    }

    /// Gross PnL on slippage-adjusted prices and the taker fees for both legs
    fn costs(&self, pos: &Position, exit_price: f64) -> (f64, f64) {
        let sign = pos.side.sign();
        let effective_entry = pos.entry_price * (1.0 + sign * self.slippage);
        let effective_exit = exit_price * (1.0 - sign * self.slippage);

        let gross = (effective_exit - effective_entry) * pos.amount * sign;
        let fees = self.taker_fee * (pos.amount * pos.entry_price)
            + self.taker_fee * (pos.amount * effective_exit);
        (gross, fees)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap()
    }

    fn entry(side: Side, price: f64, bet: f64, leverage: u32) -> EntrySignal {
        EntrySignal {
            symbol: Symbol::new("BTCUSDT"),
            side,
            price,
            amount: bet * leverage as f64 / price,
            bet_amount: Money::from_f64(bet),
            leverage,
            martingale_level: 0,
            timestamp: now(),
            reason: String::new(),
            change: 0.03,
            vol_ratio: 1.0,
            score: 50,
            stop_loss_price: 0.0,
            take_profit_price: 0.0,
        }
    }

    fn ledger(leverage: u32, sl: f64, fee: f64, slippage: f64) -> PositionLedger {
        let strategy = StrategyConfig {
            leverage,
            stop_loss_pct: sl,
            ..StrategyConfig::default()
        };
        let exchange = ExchangeConfig {
            taker_fee: fee,
            slippage,
            ..ExchangeConfig::default()
        };
        PositionLedger::new(Symbol::new("BTCUSDT"), &strategy, &exchange)
    }

    #[test]
    fn test_take_profit_settlement_without_costs() {
        let mut ledger = ledger(5, 0.10, 0.0, 0.0);
        ledger.open(&entry(Side::Buy, 100.0, 10.0, 5)).unwrap();

        let exit = ledger.check_exit(115.0, now()).unwrap();
        assert_eq!(exit.reason, ExitReason::TakeProfit);

        let s = ledger.settle(&exit).unwrap();
        assert_relative_eq!(s.realized_pnl.to_f64(), 7.5, epsilon = 1e-8);
        assert!(s.is_win());
        assert!(!ledger.has_position());
    }

    #[test]
    fn test_stop_loss_with_fees_and_slippage() {
        let mut ledger = ledger(5, 0.10, 0.0005, 0.0005);
        ledger.open(&entry(Side::Buy, 100.0, 10.0, 5)).unwrap();

        let exit = ledger.check_exit(90.0, now()).unwrap();
        assert_eq!(exit.reason, ExitReason::StopLoss);
        let s = ledger.settle(&exit).unwrap();
        assert!(!s.is_win());

        let amount = 0.5;
        let eff_entry = 100.0 * 1.0005;
        let eff_exit = 90.0 * 0.9995;
        let gross = (eff_exit - eff_entry) * amount;
        let fees = 0.0005 * amount * 100.0 + 0.0005 * amount * eff_exit;
        assert_relative_eq!(s.gross_pnl.to_f64(), gross, epsilon = 1e-7);
        assert_relative_eq!(s.fees.to_f64(), fees, epsilon = 1e-7);
        assert_relative_eq!(s.realized_pnl.to_f64(), gross - fees, epsilon = 1e-7);
        assert!(s.realized_pnl >= -Money::from_f64(10.0));
    }

    #[test]
    fn test_gap_through_take_and_stop_prefers_take_profit() {
        // overlapping bands so one price satisfies both thresholds
        let mut ledger = ledger(5, 0.10, 0.0, 0.0);
        ledger.take_profit_pct = -0.2;
        ledger.open(&entry(Side::Buy, 100.0, 10.0, 5)).unwrap();
        let exit = ledger.check_exit(85.0, now()).unwrap();
        assert_eq!(exit.reason, ExitReason::TakeProfit);
    }

    #[test]
    fn test_liquidation_realizes_exact_stake() {
        // 20x leverage: liquidation at -4.75%, wider stop never reached first
        let mut ledger = ledger(20, 0.08, 0.0005, 0.0005);
        ledger.open(&entry(Side::Buy, 100.0, 40.0, 20)).unwrap();

        assert!(ledger.check_exit(95.5, now()).is_none());
        let exit = ledger.check_exit(95.0, now()).unwrap();
        assert_eq!(exit.reason, ExitReason::Liquidation);

        let s = ledger.settle(&exit).unwrap();
        assert_eq!(s.realized_pnl, -Money::from_f64(40.0));
        assert_eq!(s.fees, Money::ZERO);
    }

    #[test]
    fn test_loss_clamped_to_stake() {
        let mut ledger = ledger(5, 0.10, 0.0005, 0.0005);
        ledger.open(&entry(Side::Buy, 100.0, 10.0, 5)).unwrap();
        // -50% gap: stop loss fires but the loss cannot exceed the stake
        let exit = ledger.check_exit(50.0, now()).unwrap();
        assert_eq!(exit.reason, ExitReason::StopLoss);
        let s = ledger.settle(&exit).unwrap();
        assert_eq!(s.realized_pnl, -Money::from_f64(10.0));
    }

    #[test]
    fn test_short_position_profits_on_drop() {
        let mut ledger = ledger(5, 0.10, 0.0, 0.0);
        ledger.open(&entry(Side::Sell, 100.0, 10.0, 5)).unwrap();
        assert!(ledger.check_exit(110.0, now()).map(|e| e.reason) == Some(ExitReason::StopLoss));
        let exit = ledger.check_exit(85.0, now()).unwrap();
        assert_eq!(exit.reason, ExitReason::TakeProfit);
        let s = ledger.settle(&exit).unwrap();
        assert_relative_eq!(s.realized_pnl.to_f64(), 7.5, epsilon = 1e-8);
    }

    #[test]
    fn test_open_and_close_guards() {
        let mut ledger = ledger(5, 0.10, 0.0, 0.0);
        let exit = ExitSignal {
            symbol: Symbol::new("BTCUSDT"),
            price: 100.0,
            timestamp: now(),
            reason: ExitReason::StopLoss,
            pnl_pct: 0.0,
        };
        assert!(matches!(
            ledger.settle(&exit),
            Err(EngineError::NoOpenPosition(_))
        ));

        assert!(matches!(
            ledger.open(&entry(Side::Buy, 0.0, 10.0, 5)),
            Err(EngineError::InvalidPrice { .. })
        ));

        ledger.open(&entry(Side::Buy, 100.0, 10.0, 5)).unwrap();
        assert!(matches!(
            ledger.open(&entry(Side::Buy, 100.0, 10.0, 5)),
            Err(EngineError::PositionAlreadyOpen(_))
        ));
        assert!(ledger.check_exit(f64::NAN, now()).is_none());
    }
}
