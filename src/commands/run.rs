//! Scanner loop: one engine cycle per interval until Ctrl+C

use anyhow::{Context, Result};
use breakout_reentry::bingx::{BingxClient, Credentials};
use breakout_reentry::binance::BinanceClient;
use breakout_reentry::config::DataSource;
use breakout_reentry::engine::Engine;
use breakout_reentry::exchange::OrderGateway;
use breakout_reentry::http::ClientConfig;
use breakout_reentry::market_data::MarketDataProvider;
use breakout_reentry::notify::{LogNotifier, Notifier, TelegramNotifier};
use breakout_reentry::Config;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info, warn};

pub fn run(config_path: String, interval_secs: Option<u64>, once: bool) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;

    runtime.block_on(run_async(config_path, interval_secs, once))
}

fn bingx_client(config: &Config) -> Result<Arc<BingxClient>> {
    // Market data endpoints are public, so a keyless client is enough to read quotes
    let credentials = config
        .exchange
        .credentials()
        .unwrap_or_else(|| Credentials::new("", ""));
    let mut client = BingxClient::new(credentials, config.exchange.client_config())
        .context("Failed to build BingX client")?;
    if let Some(base_url) = &config.exchange.base_url {
        client = client.with_base_url(base_url);
    }
    Ok(Arc::new(client))
}

fn build_notifier(config: &Config) -> Result<Arc<dyn Notifier>> {
    match &config.telegram.bot_token {
        Some(token) if config.telegram.is_configured() => {
            let notifier = TelegramNotifier::new(
                token.clone(),
                config.telegram.chat_ids.clone(),
                &ClientConfig::default(),
            )
            .context("Failed to build Telegram notifier")?;
            info!("📨 Telegram notifications to {} chats", notifier.chat_ids().len());
            Ok(Arc::new(notifier))
        }
        _ => {
            warn!("Telegram not configured; notifications go to the log only");
            Ok(Arc::new(LogNotifier))
        }
    }
}

async fn run_async(config_path: String, interval_secs: Option<u64>, once: bool) -> Result<()> {
    let config = Config::from_file(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path))?;
    config.validate()?;

    let cycle_every = interval_secs
        .map(Duration::from_secs)
        .unwrap_or_else(|| config.trading.scan_interval());

    info!("{}", "=".repeat(60));
    info!("BREAKOUT/REENTRY SCANNER");
    info!("{}", "=".repeat(60));
    info!("Symbols:     {}", config.trading.symbols.join(", "));
    info!("Timeframes:  {}", config.trading.timeframes.join(", "));
    info!("Data source: {:?}", config.trading.data_source);
    info!("Interval:    {}s", cycle_every.as_secs());
    info!(
        "Execution:   {}",
        if config.exchange.enabled { "BingX (LIVE ORDERS)" } else { "signals only" }
    );
    info!("{}", "=".repeat(60));

    let bingx = if config.trading.data_source == DataSource::Bingx || config.exchange.enabled {
        Some(bingx_client(&config)?)
    } else {
        None
    };

    let market: Arc<dyn MarketDataProvider> = match (&config.trading.data_source, &bingx) {
        (DataSource::Bingx, Some(client)) => client.clone() as Arc<dyn MarketDataProvider>,
        _ => Arc::new(
            BinanceClient::new(ClientConfig::default())
                .context("Failed to build Binance client")?,
        ) as Arc<dyn MarketDataProvider>,
    };
    let notifier = build_notifier(&config)?;

    let mut engine = Engine::new(&config, market, notifier);
    if config.exchange.enabled {
        if let Some(client) = bingx {
            warn!("⚠️  LIVE EXECUTION ENABLED - orders will be sent to BingX");
            let gateway: Arc<dyn OrderGateway> = client;
            engine = engine.with_gateway(gateway);
        }
    }

    if once {
        let report = engine.run_cycle(Utc::now()).await;
        info!("Single cycle finished: {:?}", report);
        return Ok(());
    }

    let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received Ctrl+C, initiating shutdown...");
                let _ = shutdown_tx.send(()).await;
            }
            Err(e) => {
                error!("Error setting up signal handler: {}", e);
            }
        }
    });

    let mut cycle_interval = interval(cycle_every);
    cycle_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    info!("Starting scan loop...");

    loop {
        tokio::select! {
            _ = cycle_interval.tick() => {
                let report = engine.run_cycle(Utc::now()).await;
                if report.critical > 0 {
                    error!("🚨 {} critical failures this cycle, check open positions", report.critical);
                }
            }
            _ = shutdown_rx.recv() => {
                info!("Shutdown signal received");
                break;
            }
        }
    }

    engine.persist(Utc::now());
    info!("Scanner stopped, state saved.");
    Ok(())
}
