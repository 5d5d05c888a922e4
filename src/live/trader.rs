//! Live trading loop
//!
//! One `ReplayEngine` per symbol driven by polled bars. Each cycle fetches
//! every symbol, settles exits first, then opens the strongest entries that
//! fit under the open-position cap. Engine state only moves after the
//! executor confirms a fill, and is persisted after every processed bar.

use anyhow::Context;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::backoff::ExponentialBackoff;
use super::executor::{Fill, OrderExecutor, OrderRequest};
use super::feed::BarFeed;
use super::notifier::Notifier;
use crate::engine::ReplayEngine;
use crate::error::ExecutionError;
use crate::ledger::{TradeOutcome, TradeRecord};
use crate::scanner::select_entries;
use crate::signal::{EntrySignal, Signal};
use crate::state_manager::StateStore;
use crate::{Candle, Config, Symbol};

#[derive(Debug, Error)]
pub enum CycleError {
    /// Market data unavailable; nothing was processed
    #[error("bar fetch failed: {0:#}")]
    Fetch(anyhow::Error),

    /// Engine or persistence failure; the session must stop
    #[error("fatal: {0:#}")]
    Fatal(anyhow::Error),
}

/// What one cycle did
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CycleReport {
    pub bars_processed: usize,
    pub opened: Vec<Symbol>,
    pub closed: Vec<TradeRecord>,
    /// Orders that failed and will be retried on the next cycle
    pub failed_orders: usize,
    pub game_over: bool,
}

pub struct LiveTrader {
    engines: BTreeMap<Symbol, ReplayEngine>,
    feed: Box<dyn BarFeed>,
    executor: Box<dyn OrderExecutor>,
    notifier: Box<dyn Notifier>,
    store: StateStore,
    max_open_positions: usize,
    kline_limit: usize,
    poll_interval: Duration,
    backoff: ExponentialBackoff,
    mode: String,
    game_over_notified: HashSet<Symbol>,
}

impl LiveTrader {
    /// Build one engine per configured symbol and restore any saved state
    pub fn new(
        config: &Config,
        feed: Box<dyn BarFeed>,
        executor: Box<dyn OrderExecutor>,
        notifier: Box<dyn Notifier>,
        store: StateStore,
        mode: impl Into<String>,
    ) -> anyhow::Result<Self> {
        let mut engines = BTreeMap::new();
        for symbol in config.trading.symbols() {
            let mut engine = ReplayEngine::new(symbol.clone(), config)?;
            if let Some(state) = store.load_state(symbol.as_str())? {
                engine
                    .restore(state)
                    .with_context(|| format!("Failed to restore state for {}", symbol))?;
            }
            engines.insert(symbol, engine);
        }
        if engines.is_empty() {
            anyhow::bail!("No symbols configured");
        }

        Ok(LiveTrader {
            engines,
            feed,
            executor,
            notifier,
            store,
            max_open_positions: config.trading.max_open_positions,
            kline_limit: config.live.kline_limit.max(2),
            poll_interval: Duration::from_secs(config.live.poll_interval_secs.max(1)),
            backoff: ExponentialBackoff::new(
                Duration::from_secs(1),
                Duration::from_secs(config.live.max_backoff_secs.max(1)),
            ),
            mode: mode.into(),
            game_over_notified: HashSet::new(),
        })
    }

    pub fn engine(&self, symbol: &Symbol) -> Option<&ReplayEngine> {
        self.engines.get(symbol)
    }

    pub fn engines(&self) -> impl Iterator<Item = &ReplayEngine> {
        self.engines.values()
    }

    pub fn open_positions(&self) -> usize {
        self.engines.values().filter(|e| e.has_position()).count()
    }

    pub fn is_game_over(&self) -> bool {
        self.engines.values().all(|e| e.is_game_over())
    }

    /// Run until shutdown is signalled, every engine is out of capital, or
    /// after a single cycle when `once` is set. State is saved on exit.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>, once: bool) -> anyhow::Result<()> {
        let capital: f64 = self.engines.values().map(|e| e.current_capital().to_f64()).sum();
        info!(
            "Live trader started ({}): {} symbols, capital {:.2}",
            self.mode,
            self.engines.len(),
            capital
        );
        self.notifier
            .send(
                "Martingale sniper started",
                &format!(
                    "Mode: {}\nSymbols: {}\nCapital: {:.2}",
                    self.mode,
                    self.engines.keys().map(|s| s.as_str()).collect::<Vec<_>>().join(", "),
                    capital
                ),
            )
            .await;

        let result = self.run_loop(&mut shutdown, once).await;

        self.persist_all();
        self.notify_stopped().await;
        result
    }

    async fn run_loop(&mut self, shutdown: &mut watch::Receiver<bool>, once: bool) -> anyhow::Result<()> {
        loop {
            if *shutdown.borrow() {
                info!("Shutdown requested");
                break;
            }

            let delay = match self.run_cycle().await {
                Ok(report) => {
                    if report.bars_processed > 0 {
                        self.log_status();
                    }
                    if report.game_over {
                        warn!("All symbols out of capital, stopping");
                        break;
                    }
                    if report.failed_orders > 0 {
                        self.backoff.next_delay()
                    } else {
                        self.backoff.reset();
                        self.poll_interval
                    }
                }
                Err(CycleError::Fetch(e)) => {
                    let delay = self.backoff.next_delay();
                    warn!(
                        "{:#}; retry {} in {:?}",
                        e,
                        self.backoff.attempt(),
                        delay
                    );
                    delay
                }
                Err(CycleError::Fatal(e)) => {
                    error!("Stopping on fatal error: {:#}", e);
                    return Err(e);
                }
            };

            if once {
                break;
            }

            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Shutdown requested");
                        break;
                    }
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
        Ok(())
    }

    /// Fetch every symbol, then process exits and entries on the newest bars
    pub async fn run_cycle(&mut self) -> Result<CycleReport, CycleError> {
        let windows = self.fetch_all().await.map_err(CycleError::Fetch)?;
        self.process(&windows).await.map_err(CycleError::Fatal)
    }

    async fn fetch_all(&self) -> anyhow::Result<BTreeMap<Symbol, Vec<Candle>>> {
        let mut windows = BTreeMap::new();
        for symbol in self.engines.keys() {
            let bars = self
                .feed
                .fetch_bars(symbol, self.kline_limit)
                .await
                .with_context(|| format!("{}: fetch failed", symbol))?;
            windows.insert(symbol.clone(), bars);
        }
        Ok(windows)
    }

    /// Apply one set of fetched windows. A symbol whose order fails keeps its
    /// bar unprocessed so the next cycle retries it.
    pub async fn process(&mut self, windows: &BTreeMap<Symbol, Vec<Candle>>) -> anyhow::Result<CycleReport> {
        let mut report = CycleReport::default();
        let mut touched: BTreeSet<Symbol> = BTreeSet::new();
        let mut retry: BTreeSet<Symbol> = BTreeSet::new();

        // exits
        for (symbol, window) in windows {
            let Some(engine) = self.engines.get_mut(symbol) else { continue };
            let Some(bar) = window.last() else { continue };
            if !engine.has_position() || engine.admit(bar).is_err() {
                continue;
            }

            let Some(mut exit) = engine.check_position(bar.close, bar.datetime) else {
                engine.mark_processed(bar.datetime);
                touched.insert(symbol.clone());
                report.bars_processed += 1;
                continue;
            };
            let Some(position) = engine.position() else { continue };
            let order = OrderRequest {
                symbol: symbol.clone(),
                side: position.side.opposite(),
                amount: position.amount,
                reference_price: exit.price,
                leverage: position.leverage,
                reduce_only: true,
            };

            match self.executor.close(&order).await {
                Ok(fill) => {
                    exit.price = fill.price;
                    let Some(record) = engine.update_position(Signal::Exit(exit))? else {
                        continue;
                    };
                    engine.mark_processed(bar.datetime);
                    touched.insert(symbol.clone());
                    report.bars_processed += 1;

                    if let Err(e) = self.store.record_trade(&record) {
                        error!("{}: failed to record trade: {:#}", symbol, e);
                    }
                    let (title, message) = close_message(&record);
                    self.notifier.send(&title, &message).await;
                    report.closed.push(record);
                }
                Err(e) => {
                    if handle_order_failure(engine, bar, &e, "close") {
                        touched.insert(symbol.clone());
                    } else {
                        retry.insert(symbol.clone());
                    }
                    report.failed_orders += 1;
                }
            }
        }

        // entry candidates on bars not consumed by an exit
        let mut candidates = Vec::new();
        for (symbol, window) in windows {
            let Some(engine) = self.engines.get_mut(symbol) else { continue };
            let Some(bar) = window.last() else { continue };
            if engine.has_position() || engine.admit(bar).is_err() {
                continue;
            }
            if let Some(signal) = engine.analyze(window) {
                candidates.push(signal);
            }
        }

        let slots = self.max_open_positions.saturating_sub(self.open_positions());
        let chosen = select_entries(candidates, slots);
        for signal in chosen {
            let symbol = signal.symbol.clone();
            let Some(engine) = self.engines.get_mut(&symbol) else { continue };
            let Some(bar) = windows.get(&symbol).and_then(|w| w.last()) else { continue };

            let order = OrderRequest {
                symbol: symbol.clone(),
                side: signal.side,
                amount: signal.amount,
                reference_price: signal.price,
                leverage: signal.leverage,
                reduce_only: false,
            };

            match self.executor.open(&order).await {
                Ok(fill) => {
                    let signal = apply_fill(signal, &fill);
                    let (title, message) = open_message(&signal);
                    engine.update_position(Signal::Entry(signal))?;
                    engine.mark_processed(bar.datetime);
                    touched.insert(symbol.clone());
                    report.bars_processed += 1;
                    self.notifier.send(&title, &message).await;
                    report.opened.push(symbol);
                }
                Err(e) => {
                    if handle_order_failure(engine, bar, &e, "open") {
                        touched.insert(symbol.clone());
                    } else {
                        retry.insert(symbol);
                    }
                    report.failed_orders += 1;
                }
            }
        }

        // everything else that was fresh and valid is now processed
        for (symbol, window) in windows {
            let Some(engine) = self.engines.get_mut(symbol) else { continue };
            let Some(bar) = window.last() else { continue };
            if touched.contains(symbol) || retry.contains(symbol) || engine.has_position() {
                continue;
            }
            if !engine.is_fresh(bar.datetime) || !bar.is_valid() {
                continue;
            }
            engine.mark_processed(bar.datetime);
            touched.insert(symbol.clone());
            report.bars_processed += 1;
        }

        for symbol in &touched {
            if let Some(engine) = self.engines.get(symbol) {
                if let Err(e) = self.store.save_state(&engine.snapshot()) {
                    error!("{}: failed to save state: {:#}", symbol, e);
                }
            }
        }

        for engine in self.engines.values() {
            if engine.is_game_over() && self.game_over_notified.insert(engine.symbol().clone()) {
                warn!("{}: game over, capital {}", engine.symbol(), engine.current_capital());
                self.notifier
                    .send(
                        "Game over",
                        &format!(
                            "{}: capital {} can no longer fund the first stake",
                            engine.symbol(),
                            engine.current_capital()
                        ),
                    )
                    .await;
            }
        }
        report.game_over = self.is_game_over();

        Ok(report)
    }

    fn log_status(&self) {
        for engine in self.engines.values() {
            let stats = engine.get_stats();
            if stats.total_trades == 0 {
                continue;
            }
            info!(
                "{} capital {} | L{} bet {} | rounds {}/{} | {}",
                stats.symbol,
                stats.current_capital,
                stats.martingale_level + 1,
                stats
                    .current_bet
                    .map_or_else(|| "-".to_string(), |b| b.to_string()),
                stats.rounds_won,
                stats.total_rounds,
                if stats.has_position { "in position" } else { "flat" }
            );
        }
    }

    fn persist_all(&self) {
        for engine in self.engines.values() {
            if let Err(e) = self.store.save_state(&engine.snapshot()) {
                error!("{}: failed to save state on shutdown: {:#}", engine.symbol(), e);
            }
        }
    }

    async fn notify_stopped(&self) {
        let mut lines = Vec::new();
        for engine in self.engines.values() {
            let stats = engine.get_stats();
            let initial = stats.initial_capital.to_f64();
            let ret = if initial > 0.0 {
                (stats.current_capital.to_f64() - initial) / initial * 100.0
            } else {
                0.0
            };
            info!(
                "{}: capital {} ({:+.1}%), rounds {}/{}",
                stats.symbol, stats.current_capital, ret, stats.rounds_won, stats.total_rounds
            );
            lines.push(format!(
                "{}: {} ({:+.1}%) rounds {}/{}",
                stats.symbol, stats.current_capital, ret, stats.rounds_won, stats.total_rounds
            ));
        }
        self.notifier
            .send("Martingale sniper stopped", &lines.join("\n"))
            .await;
    }
}

/// Log an order failure. Transient failures leave the bar for the next
/// cycle; a permanent rejection consumes it. Returns whether the bar was
/// consumed.
fn handle_order_failure(engine: &mut ReplayEngine, bar: &Candle, err: &ExecutionError, what: &str) -> bool {
    if err.is_transient() {
        warn!("{}: {} order failed, will retry: {}", engine.symbol(), what, err);
        false
    } else {
        error!("{}: {} order rejected: {}", engine.symbol(), what, err);
        engine.mark_processed(bar.datetime);
        true
    }
}

/// Reprice an entry to its actual fill. Stop and target move with the price.
fn apply_fill(mut signal: EntrySignal, fill: &Fill) -> EntrySignal {
    if fill.price.is_finite() && fill.price > 0.0 && signal.price > 0.0 {
        let ratio = fill.price / signal.price;
        signal.stop_loss_price *= ratio;
        signal.take_profit_price *= ratio;
        signal.price = fill.price;
    }
    if fill.amount.is_finite() && fill.amount > 0.0 {
        signal.amount = fill.amount;
    }
    signal
}

fn open_message(signal: &EntrySignal) -> (String, String) {
    (
        format!("Opened {} L{}", signal.symbol, signal.martingale_level + 1),
        format!(
            "{} @ {:.6}\nBet: {} x{}\nSL: {:.6} TP: {:.6}\n{}",
            signal.side.as_str().to_uppercase(),
            signal.price,
            signal.bet_amount,
            signal.leverage,
            signal.stop_loss_price,
            signal.take_profit_price,
            signal.reason
        ),
    )
}

fn close_message(record: &TradeRecord) -> (String, String) {
    let title = match record.outcome {
        TradeOutcome::Won => format!("Round won on {}", record.symbol),
        TradeOutcome::Lost => format!("Loss on {} L{}", record.symbol, record.martingale_level + 1),
        TradeOutcome::Busted => format!("Bust on {}", record.symbol),
    };
    debug!("{}: close notification for {}", record.symbol, record.exit_reason);
    (
        title,
        format!(
            "{} @ {:.6} ({:+.2}%)\nPnL: {}\nCapital: {}",
            record.exit_reason,
            record.exit_price,
            record.pnl_pct * 100.0,
            record.realized_pnl,
            record.capital_after
        ),
    )
}
