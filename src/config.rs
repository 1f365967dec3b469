//! Configuration management
//!
//! Handles loading and parsing of JSON configuration files with environment
//! variable support for API credentials. Every section falls back to its
//! defaults, so a partial file (or none at all) is a valid configuration.

use anyhow::{bail, Context, Result};
use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration as StdDuration;

use crate::bingx::Credentials;
use crate::channel::OscillatorSettings;
use crate::detector::DetectorConfig;
use crate::exchange::ExecutionConfig;
use crate::http::ClientConfig;
use crate::optimizer::{OptimizerConfig, OptimizerGrid, ParameterSet};
use crate::risk::RiskConfig;
use crate::scan_config::ScanConfigSearch;
use crate::types::timeframe_minutes;
use crate::Symbol;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub trading: TradingConfig,
    pub strategy: StrategyConfig,
    pub optimizer: OptimizerSettings,
    pub files: FilesConfig,
    pub exchange: ExchangeConfig,
    pub telegram: TelegramConfig,
}

impl Config {
    /// Load configuration from JSON file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let mut config: Config =
            serde_json::from_str(&contents).context("Failed to parse config JSON")?;
        config.apply_env();
        Ok(config)
    }

    /// Overlay credentials (and the optional symbol list) from the environment
    pub fn apply_env(&mut self) {
        dotenv::dotenv().ok();

        if let Ok(api_key) = std::env::var("BINGX_API_KEY") {
            self.exchange.api_key = Some(api_key);
        }
        if let Ok(api_secret) = std::env::var("BINGX_API_SECRET") {
            self.exchange.api_secret = Some(api_secret);
        }
        if let Ok(token) = std::env::var("TELEGRAM_BOT_TOKEN") {
            self.telegram.bot_token = Some(token);
        }
        if let Ok(chat_ids) = std::env::var("TELEGRAM_CHAT_IDS") {
            self.telegram.chat_ids = split_list(&chat_ids);
        }
        if let Ok(symbols) = std::env::var("SYMBOLS") {
            let symbols = split_list(&symbols);
            if !symbols.is_empty() {
                self.trading.symbols = symbols;
            }
        }
    }

    /// Reject settings the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.trading.symbols.is_empty() {
            bail!("trading.symbols must not be empty");
        }
        if self.trading.candle_options.is_empty() || self.trading.candle_options.contains(&0) {
            bail!("trading.candle_options must be a non-empty list of positive counts");
        }
        for timeframe in &self.trading.timeframes {
            if timeframe_minutes(timeframe).is_none() {
                bail!("unsupported timeframe '{}'", timeframe);
            }
        }
        if self.trading.timeframes.is_empty() {
            bail!("trading.timeframes must not be empty");
        }
        if !(self.strategy.stop_loss_pct > 0.0 && self.strategy.stop_loss_pct < 1.0) {
            bail!("strategy.stop_loss_pct must be in (0, 1)");
        }
        if OptimizerGrid::from_name(&self.optimizer.grid).is_none() {
            bail!("optimizer.grid must be 'quick' or 'full'");
        }
        if self.exchange.enabled && self.exchange.credentials().is_none() {
            bail!("exchange.enabled requires BINGX_API_KEY and BINGX_API_SECRET");
        }
        Ok(())
    }

    pub fn symbols(&self) -> Vec<Symbol> {
        self.trading.symbols.iter().map(|s| Symbol::new(s)).collect()
    }

    pub fn scan_config_search(&self) -> ScanConfigSearch {
        ScanConfigSearch::new(
            self.trading.timeframes.clone(),
            self.trading.candle_options.clone(),
            self.trading.timeframe_priority.clone(),
            self.strategy.detector_config(),
        )
    }

    pub fn optimizer_config(&self) -> OptimizerConfig {
        OptimizerConfig {
            min_pearson: self.strategy.min_pearson,
            min_r2: self.strategy.min_r2,
            min_strength_level: self.strategy.min_strength_level,
            ..OptimizerConfig::default()
        }
        .with_min_samples(self.optimizer.min_samples)
    }

    pub fn optimizer_grid(&self) -> OptimizerGrid {
        OptimizerGrid::from_name(&self.optimizer.grid).unwrap_or_else(OptimizerGrid::quick)
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

/// Where candles come from
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataSource {
    #[default]
    Binance,
    Bingx,
}

/// Symbols, timeframes and scan cadence
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TradingConfig {
    pub symbols: Vec<String>,
    pub data_source: DataSource,
    pub timeframes: Vec<String>,
    pub candle_options: Vec<usize>,
    /// Preference weight per timeframe for the scan-config search
    pub timeframe_priority: HashMap<String, f64>,
    pub scan_interval_secs: u64,
    pub scan_config_ttl_minutes: i64,
}

impl Default for TradingConfig {
    fn default() -> Self {
        TradingConfig {
            symbols: vec!["BTCUSDT".to_string(), "ETHUSDT".to_string()],
            data_source: DataSource::Binance,
            timeframes: ["1m", "3m", "5m", "15m", "30m"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            candle_options: vec![80, 100, 120, 150, 200],
            timeframe_priority: [("1m", 200.0), ("3m", 150.0), ("5m", 120.0), ("15m", 100.0), ("30m", 80.0)]
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect(),
            scan_interval_secs: 60,
            scan_config_ttl_minutes: 120,
        }
    }
}

impl TradingConfig {
    pub fn scan_interval(&self) -> StdDuration {
        StdDuration::from_secs(self.scan_interval_secs.max(1))
    }

    pub fn scan_config_ttl(&self) -> Duration {
        Duration::minutes(self.scan_config_ttl_minutes)
    }
}

/// Detection, risk and oscillator thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StrategyConfig {
    pub min_channel_width_percent: f64,
    pub trend_threshold_degrees: f64,
    pub min_trend_strength_degrees: f64,
    pub entry_margin: f64,
    pub min_rr_ratio: f64,
    pub stop_loss_pct: f64,
    pub breakout_cooldown_minutes: i64,
    pub reentry_timeout_minutes: i64,
    pub signal_cooldown_minutes: i64,
    pub min_pearson: f64,
    pub min_r2: f64,
    pub min_strength_level: u8,
    pub oversold: f64,
    pub overbought: f64,
    pub stoch_period: usize,
    pub stoch_k_smoothing: usize,
    pub stoch_d_smoothing: usize,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        let detector = DetectorConfig::default();
        let risk = RiskConfig::default();
        let params = ParameterSet::default();
        let oscillator = OscillatorSettings::default();
        StrategyConfig {
            min_channel_width_percent: detector.min_channel_width_percent,
            trend_threshold_degrees: params.trend_threshold_degrees,
            min_trend_strength_degrees: params.min_trend_strength_degrees,
            entry_margin: params.entry_margin,
            min_rr_ratio: risk.min_rr_ratio,
            stop_loss_pct: risk.stop_loss_pct,
            breakout_cooldown_minutes: detector.breakout_cooldown.num_minutes(),
            reentry_timeout_minutes: detector.reentry_timeout.num_minutes(),
            signal_cooldown_minutes: detector.signal_cooldown.num_minutes(),
            min_pearson: detector.min_pearson,
            min_r2: detector.min_r2,
            min_strength_level: detector.min_strength_level,
            oversold: detector.oversold,
            overbought: detector.overbought,
            stoch_period: oscillator.period,
            stoch_k_smoothing: oscillator.k_smoothing,
            stoch_d_smoothing: oscillator.d_smoothing,
        }
    }
}

impl StrategyConfig {
    pub fn detector_config(&self) -> DetectorConfig {
        DetectorConfig {
            min_channel_width_percent: self.min_channel_width_percent,
            min_pearson: self.min_pearson,
            min_r2: self.min_r2,
            min_strength_level: self.min_strength_level,
            oversold: self.oversold,
            overbought: self.overbought,
            breakout_cooldown: Duration::minutes(self.breakout_cooldown_minutes),
            reentry_timeout: Duration::minutes(self.reentry_timeout_minutes),
            signal_cooldown: Duration::minutes(self.signal_cooldown_minutes),
        }
    }

    pub fn risk_config(&self) -> RiskConfig {
        RiskConfig::new()
            .with_stop_loss_pct(self.stop_loss_pct)
            .with_min_rr_ratio(self.min_rr_ratio)
    }

    pub fn oscillator_settings(&self) -> OscillatorSettings {
        OscillatorSettings {
            period: self.stoch_period,
            k_smoothing: self.stoch_k_smoothing,
            d_smoothing: self.stoch_d_smoothing,
        }
    }

    /// Parameter set used until the optimizer produces one
    pub fn initial_parameters(&self) -> ParameterSet {
        ParameterSet {
            trend_threshold_degrees: self.trend_threshold_degrees,
            min_trend_strength_degrees: self.min_trend_strength_degrees,
            entry_margin: self.entry_margin,
            ..ParameterSet::default()
        }
    }
}

/// Self-tuning schedule
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerSettings {
    pub auto_optimize: bool,
    pub min_samples: usize,
    pub reoptimize_hours: i64,
    pub reoptimize_after_trades: u32,
    /// "quick" or "full"
    pub grid: String,
}

impl Default for OptimizerSettings {
    fn default() -> Self {
        OptimizerSettings {
            auto_optimize: true,
            min_samples: 15,
            reoptimize_hours: 24,
            reoptimize_after_trades: 8,
            grid: "quick".to_string(),
        }
    }
}

impl OptimizerSettings {
    pub fn reoptimize_interval(&self) -> Duration {
        Duration::hours(self.reoptimize_hours)
    }
}

/// Persistent file locations, relative to `data_dir`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FilesConfig {
    pub data_dir: PathBuf,
    pub ledger_file: String,
    pub state_file: String,
    pub best_params_file: String,
}

impl Default for FilesConfig {
    fn default() -> Self {
        FilesConfig {
            data_dir: PathBuf::from("data"),
            ledger_file: "operations_log.csv".to_string(),
            state_file: "bot_state.json".to_string(),
            best_params_file: "best_params.json".to_string(),
        }
    }
}

impl FilesConfig {
    pub fn ledger_path(&self) -> PathBuf {
        self.data_dir.join(&self.ledger_file)
    }

    pub fn state_path(&self) -> PathBuf {
        self.data_dir.join(&self.state_file)
    }

    pub fn best_params_path(&self) -> PathBuf {
        self.data_dir.join(&self.best_params_file)
    }
}

/// Exchange configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExchangeConfig {
    /// Place real orders on BingX for every signal
    pub enabled: bool,
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    #[serde(skip_serializing)]
    pub api_secret: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    pub order_notional_usdt: f64,
    pub leverage: u32,
    pub quantity_precision: u32,
    pub timeout_secs: u64,
    pub max_retries: u32,
    pub protective_order_attempts: u32,
    pub safety_margin_base: f64,
    pub safety_margin_step: f64,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        let execution = ExecutionConfig::default();
        let client = ClientConfig::default();
        ExchangeConfig {
            enabled: false,
            api_key: None,
            api_secret: None,
            base_url: None,
            order_notional_usdt: execution.order_notional_usdt,
            leverage: execution.leverage,
            quantity_precision: execution.quantity_precision,
            timeout_secs: client.timeout.as_secs(),
            max_retries: client.max_retries,
            protective_order_attempts: execution.protective_order_attempts,
            safety_margin_base: execution.safety_margin_base,
            safety_margin_step: execution.safety_margin_step,
        }
    }
}

impl ExchangeConfig {
    pub fn credentials(&self) -> Option<Credentials> {
        match (&self.api_key, &self.api_secret) {
            (Some(key), Some(secret)) if !key.is_empty() && !secret.is_empty() => {
                Some(Credentials::new(key.clone(), secret.clone()))
            }
            _ => None,
        }
    }

    pub fn client_config(&self) -> ClientConfig {
        ClientConfig::default()
            .with_timeout(StdDuration::from_secs(self.timeout_secs))
            .with_max_retries(self.max_retries)
    }

    pub fn execution_config(&self) -> ExecutionConfig {
        ExecutionConfig {
            order_notional_usdt: self.order_notional_usdt,
            leverage: self.leverage,
            quantity_precision: self.quantity_precision,
            protective_order_attempts: self.protective_order_attempts,
            safety_margin_base: self.safety_margin_base,
            safety_margin_step: self.safety_margin_step,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TelegramConfig {
    #[serde(skip_serializing)]
    pub bot_token: Option<String>,
    pub chat_ids: Vec<String>,
}

impl TelegramConfig {
    pub fn is_configured(&self) -> bool {
        self.bot_token.as_deref().is_some_and(|t| !t.is_empty()) && !self.chat_ids.is_empty()
    }
}
