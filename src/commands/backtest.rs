//! Backtest command implementation

use anyhow::Result;
use martingale_sniper::backtest::{write_trades_csv, Backtester, PerformanceMetrics};
use martingale_sniper::scanner::SymbolScanner;
use martingale_sniper::{data, Config, Symbol};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

pub fn run(
    config_path: String,
    capital_override: Option<f64>,
    start_override: Option<String>,
    end_override: Option<String>,
    trades_out: Option<String>,
) -> Result<()> {
    info!("Starting backtest");

    let mut config = Config::from_file(&config_path)?;
    info!("Loaded configuration from: {}", config_path);

    if let Some(capital) = capital_override {
        info!("Overriding initial capital to: {:.2}", capital);
        config.trading.initial_capital = capital;
    }
    if let Some(start) = start_override {
        info!("Overriding start date to: {}", start);
        config.backtest.start_date = Some(start);
    }
    if let Some(end) = end_override {
        info!("Overriding end date to: {}", end);
        config.backtest.end_date = Some(end);
    }
    config.validate()?;

    info!("Loading data from: {}", config.backtest.data_dir);
    let symbols = config.trading.symbols();
    debug!("Symbols: {:?}", symbols);

    let raw = data::load_multi_symbol(&config.backtest.data_dir, &symbols, &config.trading.timeframe)?;
    let mut data: BTreeMap<Symbol, Vec<_>> = BTreeMap::new();
    for (symbol, candles) in raw {
        let candles = data::filter_by_date(
            candles,
            config.backtest.start_date.as_deref(),
            config.backtest.end_date.as_deref(),
        )?;
        if candles.is_empty() {
            warn!("{}: no bars in the selected date range", symbol);
            continue;
        }
        data.insert(symbol, candles);
    }
    if data.is_empty() {
        anyhow::bail!("No bars to backtest");
    }
    info!("Loaded data for {} symbols", data.len());

    let (trades, metrics) = if data.len() == 1 {
        let (symbol, candles) = data.iter().next().ok_or_else(|| anyhow::anyhow!("No data"))?;
        let result = Backtester::new(config.clone()).run(symbol, candles)?;
        if let Some(at) = result.game_over_at {
            println!("Game over at {}: capital below the first stake", at);
        }
        if result.open_position {
            println!("Note: a position was still open when the data ended");
        }
        (result.trades, result.metrics)
    } else {
        let symbols: Vec<Symbol> = data.keys().cloned().collect();
        let mut scanner = SymbolScanner::new(&config, &symbols)?;
        let result = scanner.run(&data)?;
        for stats in &result.per_symbol {
            info!(
                "{}: capital {} level {} rounds {}/{} busts {}",
                stats.symbol,
                stats.current_capital,
                stats.martingale_level + 1,
                stats.rounds_won,
                stats.total_rounds,
                stats.rounds_lost
            );
        }
        (result.trades, result.metrics)
    };

    print_metrics(&metrics);

    if let Some(path) = trades_out {
        write_trades_csv(&path, &trades)?;
    }

    info!("Backtest completed successfully");
    Ok(())
}

fn print_metrics(m: &PerformanceMetrics) {
    println!("\n{}", "=".repeat(60));
    println!("BACKTEST RESULTS");
    println!("{}", "=".repeat(60));
    println!("Initial Capital:    {:.2}", m.initial_capital);
    println!("Final Capital:      {:.2}", m.final_capital);
    println!("Peak Capital:       {:.2}", m.peak_capital);
    println!("Total Return:       {:.2}%", m.total_return);
    println!("Max Drawdown:       {:.2}%", m.max_drawdown);
    println!("Total Trades:       {}", m.total_trades);
    println!("Winning Trades:     {}", m.winning_trades);
    println!("Losing Trades:      {}", m.losing_trades);
    println!("Win Rate:           {:.2}%", m.win_rate);
    println!("Rounds:             {} ({} won, {} busts)", m.total_rounds, m.rounds_won, m.busts);
    println!("Round Win Rate:     {:.2}%", m.round_win_rate);
    println!("Longest Loss Run:   {}", m.longest_losing_streak);
    println!("Profit Factor:      {:.2}", m.profit_factor);
    println!("Average Win:        {:.2}", m.avg_win);
    println!("Average Loss:       {:.2}", m.avg_loss);
    println!("Total Fees:         {:.2}", m.total_fees);
    println!("{}", "=".repeat(60));
}
