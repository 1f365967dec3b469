//! Status command: read-only view of the persisted engine state

use anyhow::{Context, Result};
use breakout_reentry::detector::SymbolPhase;
use breakout_reentry::ledger::{OperationLedger, WeeklySummary};
use breakout_reentry::state_manager::read_snapshot;
use breakout_reentry::Config;
use chrono::{Duration, Utc};

pub fn run(config_path: String) -> Result<()> {
    let config = Config::from_file(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path))?;
    let now = Utc::now();

    let state_path = config.files.state_path();
    let Some(state) = read_snapshot(&state_path) else {
        println!("No readable state at {}", state_path.display());
        return Ok(());
    };

    println!("\n{}", "=".repeat(70));
    println!("ENGINE STATUS");
    println!("{}", "=".repeat(70));
    if let Some(saved_at) = state.saved_at {
        println!("  Saved at:          {}", saved_at.format("%Y-%m-%d %H:%M:%S UTC"));
    }
    let params = &state.parameters;
    println!(
        "  Parameters:        trend {:.0}°, strength {:.0}°, margin {:.4}{}",
        params.trend_threshold_degrees,
        params.min_trend_strength_degrees,
        params.entry_margin,
        params
            .score
            .map(|s| format!(" (score {:.4}, n={})", s, params.samples))
            .unwrap_or_default()
    );
    println!("  Total trades:      {}", state.total_trades);
    println!("  Since optimizing:  {}", state.trades_since_optimization);
    if let Some(at) = state.last_optimization_at {
        println!("  Last optimization: {}", at.format("%Y-%m-%d %H:%M UTC"));
    }
    println!("{}", "-".repeat(70));

    for (symbol, symbol_state) in &state.symbols {
        let detail = match &symbol_state.phase {
            SymbolPhase::Idle => String::new(),
            SymbolPhase::PendingReentry(pending) => format!(
                "{} at {:.8}, {} min ago",
                pending.kind,
                pending.price_at_breakout,
                pending.age(now).num_minutes()
            ),
            SymbolPhase::InPosition(position) => format!(
                "{} entry {:.8} TP {:.8} SL {:.8} ({})",
                position.side,
                position.entry_price,
                position.take_profit,
                position.stop_loss,
                position.timeframe
            ),
        };
        let scan = symbol_state
            .scan_config
            .as_ref()
            .map(|c| format!("{}/{}", c.timeframe, c.candles))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "  {:<12} {:<16} {:<8} {}",
            symbol.as_str(),
            symbol_state.phase.label(),
            scan,
            detail
        );
    }
    println!("{}", "=".repeat(70));

    let ledger = OperationLedger::new(config.files.ledger_path());
    let recent = ledger.load_since(now, Duration::days(7))?;
    match WeeklySummary::from_records(&recent) {
        Some(summary) => println!("\n{}", summary.render(now)),
        None => println!("\nNo closed trades in the last 7 days"),
    }

    Ok(())
}
