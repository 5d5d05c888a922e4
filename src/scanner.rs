//! Multi-symbol scanning
//!
//! One independent `ReplayEngine` per symbol, advanced in chronological order
//! with symbols visited in sorted order. A portfolio-wide cap on open
//! positions is checked before any new entry; when more symbols fire than
//! there are free slots, the strongest signals win.

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use tracing::{debug, info};

use crate::backtest::{calculate_metrics, PerformanceMetrics};
use crate::engine::{EngineStats, ReplayEngine, StepOutcome};
use crate::error::EngineError;
use crate::ledger::TradeRecord;
use crate::signal::EntrySignal;
use crate::{Candle, Config, Symbol};

/// Keep the `slots` strongest candidates. Ties go to the symbol that sorts first.
pub fn select_entries(mut candidates: Vec<EntrySignal>, slots: usize) -> Vec<EntrySignal> {
    candidates.sort_by(|a, b| b.score.cmp(&a.score).then_with(|| a.symbol.cmp(&b.symbol)));
    candidates.truncate(slots);
    candidates
}

pub struct SymbolScanner {
    engines: BTreeMap<Symbol, ReplayEngine>,
    max_open_positions: usize,
    window_size: usize,
}

#[derive(Debug, Clone)]
pub struct PortfolioResult {
    pub trades: Vec<TradeRecord>,
    pub equity_curve: Vec<(DateTime<Utc>, f64)>,
    pub metrics: PerformanceMetrics,
    pub per_symbol: Vec<EngineStats>,
}

impl SymbolScanner {
    pub fn new(config: &Config, symbols: &[Symbol]) -> Result<Self, EngineError> {
        let engines = symbols
            .iter()
            .map(|s| Ok((s.clone(), ReplayEngine::new(s.clone(), config)?)))
            .collect::<Result<BTreeMap<_, _>, EngineError>>()?;

        Ok(SymbolScanner {
            engines,
            max_open_positions: config.trading.max_open_positions,
            window_size: config.backtest.window_size.max(2),
        })
    }

    pub fn engines(&self) -> impl Iterator<Item = &ReplayEngine> {
        self.engines.values()
    }

    pub fn open_positions(&self) -> usize {
        self.engines.values().filter(|e| e.has_position()).count()
    }

    /// Replay all symbols over their union timeline
    pub fn run(&mut self, data: &BTreeMap<Symbol, Vec<Candle>>) -> Result<PortfolioResult, EngineError> {
        let timeline: BTreeSet<DateTime<Utc>> = data
            .iter()
            .filter(|(s, _)| self.engines.contains_key(*s))
            .flat_map(|(_, candles)| candles.iter().map(|c| c.datetime))
            .collect();

        let mut cursors: HashMap<Symbol, usize> = HashMap::new();
        let mut last_price: HashMap<Symbol, f64> = HashMap::new();
        let mut trades = Vec::new();
        let mut equity_curve = Vec::with_capacity(timeline.len());

        for ts in timeline {
            // windows of symbols with a bar at `ts`
            let mut windows: Vec<(Symbol, &[Candle])> = Vec::new();
            for (symbol, candles) in data {
                if !self.engines.contains_key(symbol) {
                    continue;
                }
                let cursor = cursors.entry(symbol.clone()).or_insert(0);
                while *cursor < candles.len() && candles[*cursor].datetime < ts {
                    *cursor += 1;
                }
                if *cursor < candles.len() && candles[*cursor].datetime == ts {
                    let start = (*cursor + 1).saturating_sub(self.window_size);
                    windows.push((symbol.clone(), &candles[start..=*cursor]));
                }
            }

            trades.extend(self.step_all(&windows)?);

            for (symbol, window) in &windows {
                if let Some(bar) = window.last() {
                    if bar.is_valid() {
                        last_price.insert(symbol.clone(), bar.close);
                    }
                }
            }
            let equity: f64 = self
                .engines
                .iter()
                .map(|(s, e)| last_price.get(s).map_or(e.current_capital().to_f64(), |p| e.equity(*p)))
                .sum();
            equity_curve.push((ts, equity));

            if self.engines.values().all(|e| e.is_game_over()) {
                info!("All symbols out of capital at {}", ts);
                break;
            }
        }

        let per_symbol: Vec<EngineStats> = self.engines.values().map(|e| e.get_stats()).collect();
        let initial: f64 = per_symbol.iter().map(|s| s.initial_capital.to_f64()).sum();
        let refs: Vec<&EngineStats> = per_symbol.iter().collect();
        let metrics = calculate_metrics(initial, &trades, &equity_curve, &refs);

        Ok(PortfolioResult {
            trades,
            equity_curve,
            metrics,
            per_symbol,
        })
    }

    /// Advance every symbol that has a bar in this slice. Exits first, then
    /// entries ranked by signal strength within the free slots.
    pub fn step_all(&mut self, windows: &[(Symbol, &[Candle])]) -> Result<Vec<TradeRecord>, EngineError> {
        let mut closed = Vec::new();

        for (symbol, window) in windows {
            let Some(engine) = self.engines.get_mut(symbol) else { continue };
            if !engine.has_position() {
                continue;
            }
            if let StepOutcome::Closed(trade) = engine.step_gated(window, false)? {
                closed.push(trade);
            }
        }

        let slots = self.max_open_positions.saturating_sub(self.open_positions());
        let mut candidates = Vec::new();
        for (symbol, window) in windows {
            let Some(engine) = self.engines.get_mut(symbol) else { continue };
            let Some(bar) = window.last() else { continue };
            if engine.has_position() || !engine.is_fresh(bar.datetime) || !bar.is_valid() {
                continue;
            }
            if let Some(signal) = engine.analyze(window) {
                candidates.push(signal);
            }
        }

        let chosen: HashSet<Symbol> = select_entries(candidates.clone(), slots)
            .into_iter()
            .map(|s| s.symbol)
            .collect();
        if candidates.len() > chosen.len() {
            debug!(
                "{} signals, {} free slots: skipping {}",
                candidates.len(),
                slots,
                candidates.len() - chosen.len()
            );
        }

        for (symbol, window) in windows {
            let Some(engine) = self.engines.get_mut(symbol) else { continue };
            let Some(bar) = window.last() else { continue };
            if !engine.is_fresh(bar.datetime) {
                continue;
            }
            engine.step_gated(window, chosen.contains(symbol))?;
        }

        Ok(closed)
    }
}
