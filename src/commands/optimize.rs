//! Optimize command: grid-search detection thresholds over the trade ledger

use anyhow::{bail, Context, Result};
use breakout_reentry::ledger::OperationLedger;
use breakout_reentry::optimizer::{OptimizerGrid, ParameterOptimizer, Recommendation};
use breakout_reentry::Config;
use chrono::Utc;
use indicatif::{ProgressBar, ProgressStyle};
use ordered_float::OrderedFloat;
use tracing::info;

pub fn run(config_path: String, grid: Option<String>, top: usize, dry_run: bool) -> Result<()> {
    info!("Starting optimization");

    let config = Config::from_file(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path))?;
    info!("Loaded configuration from: {}", config_path);

    let grid_name = grid.unwrap_or_else(|| config.optimizer.grid.clone());
    let Some(grid) = OptimizerGrid::from_name(&grid_name) else {
        bail!("Unknown grid '{}', expected 'quick' or 'full'", grid_name);
    };

    let ledger = OperationLedger::new(config.files.ledger_path());
    let records = ledger.load()?;
    let optimizer_config = config.optimizer_config();

    println!("\n{}", "=".repeat(70));
    println!("OPTIMIZATION SUMMARY");
    println!("{}", "=".repeat(70));
    println!("  Ledger:        {}", ledger.path().display());
    println!("  Trades:        {}", records.len());
    println!("  Grid:          {} ({} combinations)", grid_name, grid.len());
    println!("  Min samples:   {}", optimizer_config.min_samples);
    println!("{}\n", "=".repeat(70));

    if records.len() < optimizer_config.min_samples {
        println!(
            "Not enough closed trades to optimize (need {}, have {})",
            optimizer_config.min_samples,
            records.len()
        );
        return Ok(());
    }

    let optimizer = ParameterOptimizer::new(optimizer_config, grid);

    let pb = ProgressBar::new(optimizer.grid().len() as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("⚡ {percent:>3}%|{bar:40}| {pos}/{len} [{elapsed}<{eta}, {per_sec:.2}] ✓ {msg}")?
            .progress_chars("█░ "),
    );

    let mut scores = optimizer.evaluate_all(&records, Some(&pb));
    let valid = scores.iter().filter(|s| s.meets_floor()).count();
    pb.finish_with_message(format!("{} valid", valid));
    println!();

    // Stable sort keeps grid order among equal scores
    scores.sort_by_key(|s| std::cmp::Reverse(OrderedFloat(s.score)));

    let display_count = top.min(scores.len());
    println!("\n{}", "=".repeat(90));
    println!("TOP {} PARAMETER SETS (sorted by score)", display_count);
    println!("{}", "=".repeat(90));
    println!(
        "{:<4} {:>10} {:>8} {:>8} {:>9} {:>7} | Parameters",
        "Rank", "Score", "WinR%", "MeanPnL", "Samples", "Floor"
    );
    println!("{}", "-".repeat(90));
    for (i, s) in scores.iter().take(display_count).enumerate() {
        println!(
            "{:<4} {:>10.4} {:>8.1} {:>8.3} {:>9} {:>7} | Trend:{:.0}° Strength:{:.0}° Margin:{:.4}",
            i + 1,
            s.score,
            s.win_rate * 100.0,
            s.mean_pnl,
            s.samples,
            if s.meets_floor() { "ok" } else { "-" },
            s.trend_threshold_degrees,
            s.min_trend_strength_degrees,
            s.entry_margin
        );
    }
    println!("{}", "=".repeat(90));

    // Same pick the engine would make: first maximum in grid order
    let Some(recommendation) = optimizer.recommend(&records, Utc::now(), None) else {
        println!("No parameter set reached the sample floor; nothing saved");
        return Ok(());
    };

    if dry_run {
        println!("Dry run: best parameters not saved");
    } else {
        let path = config.files.best_params_path();
        save(&recommendation, &path)?;
        println!("Best parameters saved to {}", path.display());
    }

    info!("Optimization completed successfully");
    Ok(())
}

fn save(recommendation: &Recommendation, path: &std::path::Path) -> Result<()> {
    recommendation
        .save(path)
        .with_context(|| format!("Failed to save best parameters to {}", path.display()))
}
