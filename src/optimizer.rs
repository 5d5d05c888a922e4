//! Parameter optimization
//!
//! Grid search over martingale and breakout parameters. Every combination
//! runs its own engines over shared read-only data, in parallel with rayon.

use indicatif::ProgressBar;
use itertools::iproduct;
use rayon::prelude::*;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

use crate::backtest::{Backtester, PerformanceMetrics};
use crate::config::GridConfig;
use crate::error::EngineError;
use crate::scanner::SymbolScanner;
use crate::{Candle, Config, Symbol};

/// Axes of the parameter grid
#[derive(Debug, Clone, Serialize)]
pub struct GridParams {
    pub sequences: Vec<Vec<f64>>,
    pub leverage: Vec<u32>,
    pub take_profit_pct: Vec<f64>,
    pub stop_loss_pct: Vec<f64>,
    pub explosion_threshold: Vec<f64>,
    pub volume_spike_ratio: Vec<f64>,
    pub cooldown_minutes: Vec<i64>,
    pub max_daily_rounds: Vec<u32>,
}

impl GridParams {
    /// Quick grid for faster optimization
    pub fn quick(base: &Config) -> Self {
        GridParams {
            sequences: vec![base.strategy.martingale_sequence.clone()],
            leverage: vec![5, 10],
            take_profit_pct: vec![0.10, 0.15],
            stop_loss_pct: vec![0.10],
            explosion_threshold: vec![0.025, 0.04],
            volume_spike_ratio: vec![4.0],
            cooldown_minutes: vec![5],
            max_daily_rounds: vec![base.strategy.max_daily_rounds],
        }
    }

    /// Full grid for comprehensive optimization
    pub fn full(base: &Config) -> Self {
        GridParams {
            sequences: vec![
                base.strategy.martingale_sequence.clone(),
                vec![1.0, 2.0, 4.0, 8.0, 16.0],
                vec![1.0, 3.0, 9.0, 27.0, 81.0],
            ],
            leverage: vec![5, 10, 20],
            take_profit_pct: vec![0.10, 0.15, 0.20],
            stop_loss_pct: vec![0.08, 0.10],
            explosion_threshold: vec![0.03, 0.045, 0.06],
            volume_spike_ratio: vec![3.0, 4.0, 5.0],
            cooldown_minutes: vec![5, 15],
            max_daily_rounds: vec![5, 10],
        }
    }

    /// Grid from the config file; empty axes keep the base value
    pub fn custom(grid: &GridConfig, base: &Config) -> Self {
        fn or_base<T: Clone>(axis: &[T], base: T) -> Vec<T> {
            if axis.is_empty() {
                vec![base]
            } else {
                axis.to_vec()
            }
        }
        let s = &base.strategy;
        GridParams {
            sequences: or_base(&grid.martingale_sequence, s.martingale_sequence.clone()),
            leverage: or_base(&grid.leverage, s.leverage),
            take_profit_pct: or_base(&grid.take_profit_pct, s.take_profit_pct),
            stop_loss_pct: or_base(&grid.stop_loss_pct, s.stop_loss_pct),
            explosion_threshold: or_base(&grid.explosion_threshold, s.explosion_threshold),
            volume_spike_ratio: or_base(&grid.volume_spike_ratio, s.volume_spike_ratio),
            cooldown_minutes: or_base(&grid.cooldown_minutes, s.cooldown_minutes),
            max_daily_rounds: or_base(&grid.max_daily_rounds, s.max_daily_rounds),
        }
    }

    /// All valid configs in the grid
    pub fn generate_configs(&self, base: &Config) -> Vec<Config> {
        iproduct!(
            &self.sequences,
            &self.leverage,
            &self.take_profit_pct,
            &self.stop_loss_pct,
            &self.explosion_threshold,
            &self.volume_spike_ratio,
            &self.cooldown_minutes,
            &self.max_daily_rounds
        )
        .filter_map(|(seq, lev, tp, sl, thresh, vol, cooldown, rounds)| {
            let mut config = base.clone();
            config.strategy.martingale_sequence = seq.clone();
            config.strategy.leverage = *lev;
            config.strategy.take_profit_pct = *tp;
            config.strategy.stop_loss_pct = *sl;
            config.strategy.explosion_threshold = *thresh;
            config.strategy.volume_spike_ratio = *vol;
            config.strategy.cooldown_minutes = *cooldown;
            config.strategy.max_daily_rounds = *rounds;
            config.validate().is_ok().then_some(config)
        })
        .collect()
    }

    pub fn total_combinations(&self) -> usize {
        self.sequences.len()
            * self.leverage.len()
            * self.take_profit_pct.len()
            * self.stop_loss_pct.len()
            * self.explosion_threshold.len()
            * self.volume_spike_ratio.len()
            * self.cooldown_minutes.len()
            * self.max_daily_rounds.len()
    }
}

/// The varied parameters of one run
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParamSet {
    pub martingale_sequence: Vec<f64>,
    pub leverage: u32,
    pub take_profit_pct: f64,
    pub stop_loss_pct: f64,
    pub explosion_threshold: f64,
    pub volume_spike_ratio: f64,
    pub cooldown_minutes: i64,
    pub max_daily_rounds: u32,
}

impl ParamSet {
    pub fn from_config(config: &Config) -> Self {
        let s = &config.strategy;
        ParamSet {
            martingale_sequence: s.martingale_sequence.clone(),
            leverage: s.leverage,
            take_profit_pct: s.take_profit_pct,
            stop_loss_pct: s.stop_loss_pct,
            explosion_threshold: s.explosion_threshold,
            volume_spike_ratio: s.volume_spike_ratio,
            cooldown_minutes: s.cooldown_minutes,
            max_daily_rounds: s.max_daily_rounds,
        }
    }
}

impl fmt::Display for ParamSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let seq: Vec<String> = self
            .martingale_sequence
            .iter()
            .map(|b| format!("{}", b))
            .collect();
        write!(
            f,
            "Seq:[{}] Lev:{}x TP:{:.1}% SL:{:.1}% Exp:{:.1}% Vol:{:.1}x CD:{}m Rounds:{}",
            seq.join(","),
            self.leverage,
            self.take_profit_pct * 100.0,
            self.stop_loss_pct * 100.0,
            self.explosion_threshold * 100.0,
            self.volume_spike_ratio,
            self.cooldown_minutes,
            self.max_daily_rounds
        )
    }
}

/// Optimization result for a single parameter combination
#[derive(Debug, Clone, Serialize)]
pub struct OptimizationResult {
    pub params: ParamSet,
    pub metrics: PerformanceMetrics,
}

pub struct Optimizer {
    base_config: Config,
}

impl Optimizer {
    pub fn new(base_config: Config) -> Self {
        Optimizer { base_config }
    }

    pub fn base_config(&self) -> &Config {
        &self.base_config
    }

    /// Run every config over `data`. Configs that fail to build an engine
    /// are dropped.
    pub fn optimize(
        &self,
        data: &BTreeMap<Symbol, Vec<Candle>>,
        configs: &[Config],
        progress: Option<&ProgressBar>,
        sequential: bool,
    ) -> Vec<OptimizationResult> {
        tracing::info!(
            "Testing {} parameter combinations ({})",
            configs.len(),
            if sequential { "sequential" } else { "parallel" }
        );

        let run_one = |config: &Config| {
            let result = evaluate(config, data);
            if let Some(pb) = progress {
                pb.inc(1);
            }
            match result {
                Ok(metrics) => Some(OptimizationResult {
                    params: ParamSet::from_config(config),
                    metrics,
                }),
                Err(e) => {
                    tracing::warn!("Skipping combination: {}", e);
                    None
                }
            }
        };

        if sequential {
            configs.iter().filter_map(run_one).collect()
        } else {
            configs.par_iter().filter_map(run_one).collect()
        }
    }

    /// Sort best-first by `sort_by`: return, round_win_rate, drawdown,
    /// profit_factor or survival (no busts first, then return)
    pub fn sort_results(results: &mut [OptimizationResult], sort_by: &str) {
        use std::cmp::Ordering;
        let desc = |a: f64, b: f64| b.partial_cmp(&a).unwrap_or(Ordering::Equal);

        results.sort_by(|a, b| {
            let (ma, mb) = (&a.metrics, &b.metrics);
            match sort_by {
                "round_win_rate" | "win_rate" => desc(ma.round_win_rate, mb.round_win_rate),
                "drawdown" => ma
                    .max_drawdown
                    .partial_cmp(&mb.max_drawdown)
                    .unwrap_or(Ordering::Equal),
                "profit_factor" => desc(ma.profit_factor, mb.profit_factor),
                "survival" => (ma.busts > 0)
                    .cmp(&(mb.busts > 0))
                    .then_with(|| desc(ma.total_return, mb.total_return)),
                _ => desc(ma.total_return, mb.total_return),
            }
        });
    }
}

/// Backtest one config: single symbols go through the `Backtester`, several
/// through the capped `SymbolScanner`.
pub fn evaluate(
    config: &Config,
    data: &BTreeMap<Symbol, Vec<Candle>>,
) -> Result<PerformanceMetrics, EngineError> {
    if data.len() == 1 {
        if let Some((symbol, candles)) = data.iter().next() {
            let result = Backtester::new(config.clone()).run(symbol, candles)?;
            return Ok(result.metrics);
        }
    }
    let symbols: Vec<Symbol> = data.keys().cloned().collect();
    let mut scanner = SymbolScanner::new(config, &symbols)?;
    Ok(scanner.run(data)?.metrics)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};

    fn data() -> BTreeMap<Symbol, Vec<Candle>> {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let closes = [100.0, 100.0, 103.0, 112.0, 120.0, 120.0, 124.0, 110.0, 110.0];
        let candles = closes
            .iter()
            .enumerate()
            .map(|(i, &c)| {
                Candle::new_unchecked(start + Duration::minutes(5 * i as i64), c, c, c, c, 10.0)
            })
            .collect();
        BTreeMap::from([(Symbol::new("BTCUSDT"), candles)])
    }

    #[test]
    fn test_quick_grid_size() {
        let base = Config::default();
        let grid = GridParams::quick(&base);
        assert_eq!(grid.total_combinations(), 8);
        assert_eq!(grid.generate_configs(&base).len(), 8);
    }

    #[test]
    fn test_invalid_combinations_are_dropped() {
        let base = Config::default();
        let grid = GridConfig {
            leverage: vec![0, 5],
            ..GridConfig::default()
        };
        let params = GridParams::custom(&grid, &base);
        assert_eq!(params.total_combinations(), 2);
        let configs = params.generate_configs(&base);
        assert_eq!(configs.len(), 1);
        assert_eq!(configs[0].strategy.leverage, 5);
    }

    #[test]
    fn test_parallel_matches_sequential() {
        let base = Config::default();
        let configs = GridParams::quick(&base).generate_configs(&base);
        let optimizer = Optimizer::new(base);
        let data = data();

        let par = optimizer.optimize(&data, &configs, None, false);
        let seq = optimizer.optimize(&data, &configs, None, true);
        assert_eq!(par.len(), seq.len());
        for (a, b) in par.iter().zip(&seq) {
            assert_eq!(a.params, b.params);
            assert_eq!(a.metrics, b.metrics);
        }
    }

    #[test]
    fn test_sort_survival_puts_busted_runs_last() {
        let mk = |ret: f64, busts: u32| OptimizationResult {
            params: ParamSet::from_config(&Config::default()),
            metrics: PerformanceMetrics {
                total_return: ret,
                busts,
                ..PerformanceMetrics::default()
            },
        };
        let mut results = vec![mk(50.0, 1), mk(10.0, 0), mk(20.0, 0)];
        Optimizer::sort_results(&mut results, "survival");
        let returns: Vec<f64> = results.iter().map(|r| r.metrics.total_return).collect();
        assert_eq!(returns, vec![20.0, 10.0, 50.0]);

        Optimizer::sort_results(&mut results, "return");
        assert_eq!(results[0].metrics.total_return, 50.0);
    }
}
