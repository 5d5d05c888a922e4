//! Explosion / breakout entry detection and the signal types exchanged with
//! the engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::StrategyConfig;
use crate::{Candle, Money, Side, Symbol};

/// Candidate entry produced by the detector
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntrySignal {
    pub symbol: Symbol,
    pub side: Side,
    pub price: f64,
    /// Contract quantity, `bet_amount * leverage / price`
    pub amount: f64,
    pub bet_amount: Money,
    pub leverage: u32,
    pub martingale_level: usize,
    pub timestamp: DateTime<Utc>,
    pub reason: String,
    pub change: f64,
    pub vol_ratio: f64,
    /// Strength ranking, 0-100
    pub score: u32,
    pub stop_loss_price: f64,
    pub take_profit_price: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    TakeProfit,
    StopLoss,
    Liquidation,
}

impl ExitReason {
    pub fn as_str(self) -> &'static str {
        match self {
            ExitReason::TakeProfit => "take_profit",
            ExitReason::StopLoss => "stop_loss",
            ExitReason::Liquidation => "liquidation",
        }
    }
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExitSignal {
    pub symbol: Symbol,
    pub price: f64,
    pub timestamp: DateTime<Utc>,
    pub reason: ExitReason,
    pub pnl_pct: f64,
}

/// What the engine should do on this step
#[derive(Debug, Clone, PartialEq)]
pub enum Signal {
    Entry(EntrySignal),
    Exit(ExitSignal),
    Hold,
}

/// Scans the tail of a bar window for an explosive move
#[derive(Debug, Clone)]
pub struct SignalDetector {
    side: Side,
    leverage: u32,
    explosion_threshold: f64,
    volume_spike_ratio: f64,
    min_secondary_change: f64,
    min_history: usize,
    lookback_bars: usize,
    lookback_threshold: f64,
    take_profit_pct: f64,
    stop_loss_pct: f64,
}

impl SignalDetector {
    pub fn new(config: &StrategyConfig) -> Self {
        SignalDetector {
            side: config.direction.side(),
            leverage: config.leverage,
            explosion_threshold: config.explosion_threshold,
            volume_spike_ratio: config.volume_spike_ratio,
            min_secondary_change: config.min_secondary_change,
            min_history: config.min_history.max(2),
            lookback_bars: config.lookback_bars,
            lookback_threshold: config.lookback_threshold,
            take_profit_pct: config.take_profit_pct,
            stop_loss_pct: config.stop_loss_pct,
        }
    }

    pub fn side(&self) -> Side {
        self.side
    }

    /// Look for an entry on the last bar of `window`.
    ///
    /// Returns `None` for short windows and for unusable prices in the last
    /// two bars; those are not errors.
    pub fn detect(
        &self,
        symbol: &Symbol,
        window: &[Candle],
        level: usize,
        bet: Money,
    ) -> Option<EntrySignal> {
        if window.len() < self.min_history {
            return None;
        }

        let current = &window[window.len() - 1];
        let prev = &window[window.len() - 2];
        let price = current.close;
        if !usable(price) || !usable(prev.close) {
            return None;
        }

        // Signed so that a favourable move is positive for either side
        let sign = self.side.sign();
        let change = (price - prev.close) / prev.close;
        let directional = change * sign;
        let vol_ratio = if prev.volume > 0.0 && current.volume.is_finite() {
            current.volume / prev.volume
        } else {
            0.0
        };

        let primary = directional >= self.explosion_threshold;
        let volume_spike = vol_ratio >= self.volume_spike_ratio;
        if !primary && !(volume_spike && directional > self.min_secondary_change) {
            return None;
        }

        let lookback_change = self.lookback_change(window).map(|c| c * sign);

        let mut score = 0;
        let mut reasons = Vec::new();
        if primary {
            score += 50;
            reasons.push(format!("bar {:+.2}%", change * 100.0));
        }
        if let Some(lb) = lookback_change.filter(|lb| *lb >= self.lookback_threshold) {
            score += 30;
            reasons.push(format!("{}bar {:+.2}%", self.lookback_bars, lb * sign * 100.0));
        }
        if volume_spike {
            score += 20;
            reasons.push(format!("vol x{:.1}", vol_ratio));
        }

        let bet_f = bet.to_f64();
        let amount = bet_f * self.leverage as f64 / price;
        let (stop_loss_price, take_profit_price) = match self.side {
            Side::Buy => (
                price * (1.0 - self.stop_loss_pct),
                price * (1.0 + self.take_profit_pct),
            ),
            Side::Sell => (
                price * (1.0 + self.stop_loss_pct),
                price * (1.0 - self.take_profit_pct),
            ),
        };

        Some(EntrySignal {
            symbol: symbol.clone(),
            side: self.side,
            price,
            amount,
            bet_amount: bet,
            leverage: self.leverage,
            martingale_level: level,
            timestamp: current.datetime,
            reason: reasons.join(" | "),
            change,
            vol_ratio,
            score,
            stop_loss_price,
            take_profit_price,
        })
    }

    fn lookback_change(&self, window: &[Candle]) -> Option<f64> {
        if self.lookback_bars == 0 || window.len() <= self.lookback_bars {
            return None;
        }
        let base = window[window.len() - 1 - self.lookback_bars].close;
        let last = window[window.len() - 1].close;
        usable(base).then(|| (last - base) / base)
    }
}

fn usable(price: f64) -> bool {
    price.is_finite() && price > 0.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Direction;
    use approx::assert_relative_eq;
    use chrono::{Duration, TimeZone};

    fn bars(closes: &[f64], volumes: &[f64]) -> Vec<Candle> {
        let start = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
        closes
            .iter()
            .zip(volumes)
            .enumerate()
            .map(|(i, (&c, &v))| {
                Candle::new_unchecked(start + Duration::minutes(5 * i as i64), c, c, c, c, v)
            })
            .collect()
    }

    fn detector() -> SignalDetector {
        SignalDetector::new(&StrategyConfig::default())
    }

    #[test]
    fn test_explosion_fires_with_first_stake() {
        let window = bars(&[100.0, 100.0, 103.0], &[10.0, 10.0, 10.0]);
        let sig = detector()
            .detect(&Symbol::new("BTCUSDT"), &window, 0, Money::from_f64(10.0))
            .unwrap();

        assert_eq!(sig.bet_amount, Money::from_f64(10.0));
        assert_eq!(sig.side, Side::Buy);
        assert_relative_eq!(sig.change, 0.03, epsilon = 1e-12);
        assert_relative_eq!(sig.amount, 10.0 * 5.0 / 103.0, epsilon = 1e-12);
        assert_relative_eq!(sig.stop_loss_price, 103.0 * 0.9, epsilon = 1e-9);
        assert_relative_eq!(sig.take_profit_price, 103.0 * 1.15, epsilon = 1e-9);
        assert_eq!(sig.score, 50);
    }

    #[test]
    fn test_small_move_without_volume_is_ignored() {
        let window = bars(&[100.0, 100.0, 102.0], &[10.0, 10.0, 10.0]);
        assert!(detector()
            .detect(&Symbol::new("X"), &window, 0, Money::from_f64(10.0))
            .is_none());
    }

    #[test]
    fn test_volume_spike_needs_secondary_move() {
        let sym = Symbol::new("X");
        let stake = Money::from_f64(10.0);

        // +2% on 5x volume fires
        let window = bars(&[100.0, 100.0, 102.0], &[10.0, 10.0, 50.0]);
        let sig = detector().detect(&sym, &window, 0, stake).unwrap();
        assert_eq!(sig.score, 20);

        // +1% on 5x volume does not
        let window = bars(&[100.0, 100.0, 101.0], &[10.0, 10.0, 50.0]);
        assert!(detector().detect(&sym, &window, 0, stake).is_none());

        // zero previous volume means no spike
        let window = bars(&[100.0, 100.0, 102.0], &[10.0, 0.0, 50.0]);
        assert!(detector().detect(&sym, &window, 0, stake).is_none());
    }

    #[test]
    fn test_short_window_and_bad_prices() {
        let sym = Symbol::new("X");
        let stake = Money::from_f64(10.0);
        let window = bars(&[100.0, 110.0], &[1.0, 1.0]);
        assert!(detector().detect(&sym, &window, 0, stake).is_none());

        let window = bars(&[100.0, 0.0, 110.0], &[1.0, 1.0, 1.0]);
        assert!(detector().detect(&sym, &window, 0, stake).is_none());

        let window = bars(&[100.0, 100.0, f64::NAN], &[1.0, 1.0, 1.0]);
        assert!(detector().detect(&sym, &window, 0, stake).is_none());
    }

    #[test]
    fn test_lookback_adds_score() {
        let window = bars(
            &[100.0, 100.0, 101.0, 102.0, 103.0, 104.0, 108.0],
            &[1.0; 7],
        );
        let sig = detector()
            .detect(&Symbol::new("X"), &window, 2, Money::from_f64(40.0))
            .unwrap();
        assert_eq!(sig.score, 80);
        assert_eq!(sig.martingale_level, 2);
    }

    #[test]
    fn test_short_mirrors_long() {
        let config = StrategyConfig {
            direction: Direction::Short,
            ..StrategyConfig::default()
        };
        let det = SignalDetector::new(&config);
        let sym = Symbol::new("X");
        let stake = Money::from_f64(10.0);

        let up = bars(&[100.0, 100.0, 103.0], &[1.0; 3]);
        assert!(det.detect(&sym, &up, 0, stake).is_none());

        let down = bars(&[100.0, 100.0, 97.0], &[1.0; 3]);
        let sig = det.detect(&sym, &down, 0, stake).unwrap();
        assert_eq!(sig.side, Side::Sell);
        assert!(sig.stop_loss_price > sig.price);
        assert!(sig.take_profit_price < sig.price);
    }
}
