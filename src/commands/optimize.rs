//! Optimize command implementation with progress tracking

use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use martingale_sniper::optimizer::{GridParams, OptimizationResult, Optimizer};
use martingale_sniper::{data, Config, Symbol};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::info;

pub fn run(
    config_path: String,
    mode: String,
    sort_by: String,
    top: usize,
    sequential: bool,
) -> Result<()> {
    info!("Starting optimization");

    let config = Config::from_file(&config_path)?;
    info!("Loaded configuration from: {}", config_path);

    let grid = match mode.as_str() {
        "quick" => GridParams::quick(&config),
        "full" => GridParams::full(&config),
        "custom" => {
            let grid = config
                .grid
                .as_ref()
                .context("custom mode needs a \"grid\" section in the config")?;
            GridParams::custom(grid, &config)
        }
        other => anyhow::bail!("Unknown mode: {}. Use quick, full or custom", other),
    };

    let symbols = config.trading.symbols();
    let raw = data::load_multi_symbol(&config.backtest.data_dir, &symbols, &config.trading.timeframe)?;
    let mut data: BTreeMap<Symbol, Vec<_>> = BTreeMap::new();
    for (symbol, candles) in raw {
        let candles = data::filter_by_date(
            candles,
            config.backtest.start_date.as_deref(),
            config.backtest.end_date.as_deref(),
        )?;
        if !candles.is_empty() {
            data.insert(symbol, candles);
        }
    }
    if data.is_empty() {
        anyhow::bail!("No bars to optimize over");
    }

    let configs = grid.generate_configs(&config);
    let total = configs.len();
    info!(
        "Optimization mode: {}, {} combinations ({} valid)",
        mode,
        grid.total_combinations(),
        total
    );

    println!("\n{}", "=".repeat(70));
    println!("OPTIMIZATION SUMMARY");
    println!("{}", "=".repeat(70));
    println!("  Symbols:       {}", data.keys().map(|s| s.as_str()).collect::<Vec<_>>().join(", "));
    println!("  Timeframe:     {}", config.trading.timeframe);
    println!("  Parameters:    {} combinations", total);
    println!("  Mode:          {}", if sequential { "sequential" } else { "parallel" });
    println!("{}\n", "=".repeat(70));

    if total == 0 {
        info!("No valid parameter combinations");
        return Ok(());
    }

    let pb = ProgressBar::new(total as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("⚡ {percent:>3}%|{bar:40}| {pos}/{len} [{elapsed}<{eta}, {per_sec:.2}]")?
            .progress_chars("█░ "),
    );

    let optimizer = Optimizer::new(config.clone());
    let mut results = optimizer.optimize(&data, &configs, Some(&pb), sequential);
    pb.finish();
    println!();

    if results.is_empty() {
        info!("No valid results found.");
        return Ok(());
    }

    Optimizer::sort_results(&mut results, &sort_by);
    info!("Total results: {}, sorted by: {}", results.len(), sort_by);

    print_top(&results, top, &sort_by);
    save_results(&config.backtest.results_dir, &results)?;

    info!("Optimization completed successfully");
    Ok(())
}

fn print_top(results: &[OptimizationResult], top: usize, sort_by: &str) {
    let display_count = top.min(results.len());
    println!("\n{}", "=".repeat(130));
    println!("TOP {} OPTIMIZATION RESULTS (sorted by {})", display_count, sort_by);
    println!("{}", "=".repeat(130));
    println!(
        "{:<4} {:>9} {:>8} {:>7} {:>6} {:>6} {:>6} | Parameters",
        "Rank", "Return%", "MaxDD%", "RndW%", "Rounds", "Busts", "Trades"
    );
    println!("{}", "-".repeat(130));

    for (i, r) in results.iter().take(top).enumerate() {
        let m = &r.metrics;
        println!(
            "{:<4} {:>9.2} {:>8.2} {:>7.2} {:>6} {:>6} {:>6} | {}",
            i + 1,
            m.total_return,
            m.max_drawdown,
            m.round_win_rate,
            m.total_rounds,
            m.busts,
            m.total_trades,
            r.params
        );
    }
    println!("{}", "=".repeat(130));
}

fn save_results(results_dir: &str, results: &[OptimizationResult]) -> Result<()> {
    std::fs::create_dir_all(results_dir)?;
    let path = Path::new(results_dir).join(format!(
        "optimization_{}.json",
        chrono::Local::now().format("%Y%m%d_%H%M%S")
    ));
    std::fs::write(&path, serde_json::to_string_pretty(results)?)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    info!("Results saved to {}", path.display());
    println!("Results saved to {}", path.display());
    Ok(())
}
