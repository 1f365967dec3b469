//! Breakout/reentry scanner - main entry point
//!
//! This binary provides three subcommands:
//! - run: scan symbols on a fixed interval and emit signals
//! - optimize: grid-search detection thresholds against the trade ledger
//! - status: print the persisted engine state and last week's results

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod commands;

#[derive(Parser, Debug)]
#[command(name = "breakout-reentry")]
#[command(about = "Channel breakout/reentry scanner with self-tuning thresholds", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the scanner
    Run {
        /// Path to configuration file
        #[arg(short, long, default_value = "config.json")]
        config: String,

        /// Seconds between scan cycles (overrides config file)
        #[arg(long)]
        interval: Option<u64>,

        /// Run a single cycle and exit
        #[arg(long)]
        once: bool,
    },

    /// Optimize detection thresholds from the trade ledger
    Optimize {
        /// Path to configuration file
        #[arg(short, long, default_value = "config.json")]
        config: String,

        /// Parameter grid (quick or full)
        #[arg(short, long)]
        grid: Option<String>,

        /// Number of top results to show
        #[arg(short, long, default_value = "10")]
        top: usize,

        /// Print results without writing the best-parameters file
        #[arg(long)]
        dry_run: bool,
    },

    /// Show persisted engine state
    Status {
        /// Path to configuration file
        #[arg(short, long, default_value = "config.json")]
        config: String,
    },
}

fn setup_logging(verbose: bool, command_name: &str, file_only: bool) -> Result<()> {
    std::fs::create_dir_all("logs")?;

    let log_filename = format!(
        "{}_{}.log",
        command_name,
        chrono::Local::now().format("%Y-%m-%d_%H-%M-%S")
    );
    let log_path = PathBuf::from("logs").join(&log_filename);

    // Keep HTTP stack chatter out of the scan log
    let level = if verbose { "debug" } else { "info" };
    let filter_str = format!(
        "{},hyper=warn,hyper_util=warn,reqwest=warn,rustls=warn,h2=warn",
        level
    );
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&filter_str));

    let file_appender = tracing_appender::rolling::never("logs", &log_filename);

    if file_only {
        // Console stays free for the progress bar
        let file_layer = tracing_subscriber::fmt::layer()
            .with_writer(file_appender)
            .with_target(true)
            .with_line_number(true)
            .with_file(true)
            .with_ansi(false);

        tracing_subscriber::registry()
            .with(env_filter)
            .with(file_layer)
            .init();
    } else {
        let console_layer = tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_thread_ids(false)
            .with_thread_names(false)
            .with_line_number(true)
            .with_file(true)
            .with_ansi(true);

        let file_layer = tracing_subscriber::fmt::layer()
            .with_writer(file_appender)
            .with_target(true)
            .with_line_number(true)
            .with_file(true)
            .with_ansi(false);

        tracing_subscriber::registry()
            .with(env_filter)
            .with(console_layer)
            .with(file_layer)
            .init();

        info!("Logging initialized");
        info!("Log file: {}", log_path.display());
    }

    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let (command_name, file_only) = match &cli.command {
        Commands::Run { .. } => ("run", false),
        Commands::Optimize { .. } => ("optimize", true),
        Commands::Status { .. } => ("status", true),
    };

    setup_logging(cli.verbose, command_name, file_only)?;

    match cli.command {
        Commands::Run {
            config,
            interval,
            once,
        } => commands::run::run(config, interval, once),

        Commands::Optimize {
            config,
            grid,
            top,
            dry_run,
        } => commands::optimize::run(config, grid, top, dry_run),

        Commands::Status { config } => commands::status::run(config),
    }
}
