//! Scan orchestrator
//!
//! One [`Engine`] owns all mutable state and advances it one cycle at a time:
//!
//! 1. price-driven exits for open positions
//! 2. reentry timeouts, before any data is fetched
//! 3. scan-config resolution, candle fetch, channel + oscillator analysis
//! 4. detector transitions, notifications and optional order execution
//! 5. optimizer and weekly-report schedules
//! 6. pruning and an unconditional state save
//!
//! Failures are isolated per symbol; only the save at the end of the cycle
//! touches every symbol at once.

use chrono::{DateTime, Duration, Utc};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::channel::{self, OscillatorSettings};
use crate::config::Config;
use crate::detector::{ActivePosition, BreakoutDetector, Decision, Observation};
use crate::error::ScanError;
use crate::exchange::{self, ExecutionConfig, OrderGateway};
use crate::ledger::{OperationLedger, OperationRecord, WeeklySummary};
use crate::market_data::MarketDataProvider;
use crate::notify::{self, Notifier};
use crate::optimizer::{ParameterOptimizer, ParameterSet, Recommendation};
use crate::risk::RiskCalculator;
use crate::scan_config::{ScanConfig, ScanConfigSearch};
use crate::state_manager::{EngineState, StateStore};
use crate::Symbol;

/// Stale cooldown stamps are dropped after this long
const PRUNE_HORIZON_DAYS: i64 = 30;
const WEEKLY_REPORT_DAYS: i64 = 7;

/// Scheduling knobs taken from [`Config`]
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub symbols: Vec<Symbol>,
    pub scan_config_ttl: Duration,
    pub oscillator: OscillatorSettings,
    pub auto_optimize: bool,
    pub reoptimize_interval: Duration,
    pub reoptimize_after_trades: u32,
    pub weekly_report_interval: Duration,
    pub prune_horizon: Duration,
    pub best_params_path: PathBuf,
    /// Present when live execution is enabled
    pub execution: Option<ExecutionConfig>,
}

impl EngineSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            symbols: config.symbols(),
            scan_config_ttl: config.trading.scan_config_ttl(),
            oscillator: config.strategy.oscillator_settings(),
            auto_optimize: config.optimizer.auto_optimize,
            reoptimize_interval: config.optimizer.reoptimize_interval(),
            reoptimize_after_trades: config.optimizer.reoptimize_after_trades,
            weekly_report_interval: Duration::days(WEEKLY_REPORT_DAYS),
            prune_horizon: Duration::days(PRUNE_HORIZON_DAYS),
            best_params_path: config.files.best_params_path(),
            execution: config
                .exchange
                .enabled
                .then(|| config.exchange.execution_config()),
        }
    }
}

/// What happened during one cycle
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CycleReport {
    pub scanned: usize,
    pub skipped: usize,
    pub breakouts: usize,
    pub signals: usize,
    pub suppressed: usize,
    pub expired: usize,
    pub closed: Vec<OperationRecord>,
    pub errors: usize,
    pub critical: usize,
    pub optimized: bool,
    pub weekly_report_sent: bool,
}

pub struct Engine {
    settings: EngineSettings,
    detector: BreakoutDetector,
    search: ScanConfigSearch,
    optimizer: ParameterOptimizer,
    ledger: OperationLedger,
    store: StateStore,
    market: Arc<dyn MarketDataProvider>,
    notifier: Arc<dyn Notifier>,
    gateway: Option<Arc<dyn OrderGateway>>,
    state: EngineState,
}

impl Engine {
    /// Build an engine and restore its persisted state
    pub fn new(
        config: &Config,
        market: Arc<dyn MarketDataProvider>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let store = StateStore::new(config.files.state_path());
        let mut state = store.load_or_default();
        let settings = EngineSettings::from_config(config);

        if state.parameters.score.is_none() {
            state.parameters = initial_parameters(config, &settings);
        }

        Self {
            detector: BreakoutDetector::new(
                config.strategy.detector_config(),
                RiskCalculator::new(config.strategy.risk_config()),
            ),
            search: config.scan_config_search(),
            optimizer: ParameterOptimizer::new(config.optimizer_config(), config.optimizer_grid()),
            ledger: OperationLedger::new(config.files.ledger_path()),
            store,
            market,
            notifier,
            gateway: None,
            state,
            settings,
        }
    }

    /// Route signals to an exchange; ignored unless execution is enabled
    pub fn with_gateway(mut self, gateway: Arc<dyn OrderGateway>) -> Self {
        if self.settings.execution.is_some() {
            self.gateway = Some(gateway);
        } else {
            warn!("Exchange gateway supplied but execution is disabled; ignoring it");
        }
        self
    }

    pub fn state(&self) -> &EngineState {
        &self.state
    }

    pub fn parameters(&self) -> &ParameterSet {
        &self.state.parameters
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Run one full scan over every configured symbol
    pub async fn run_cycle(&mut self, now: DateTime<Utc>) -> CycleReport {
        let mut report = CycleReport::default();
        let symbols = self.settings.symbols.clone();

        for symbol in &symbols {
            report.scanned += 1;
            match self.scan_symbol(symbol, now, &mut report).await {
                Ok(()) => {}
                Err(e) if e.is_skip() => {
                    debug!("{} - skipped: {}", symbol, e);
                    report.skipped += 1;
                }
                Err(e) if e.is_critical() => {
                    error!("🚨 {}", e);
                    report.critical += 1;
                    notify::notify(self.notifier.as_ref(), &notify::critical_message(&e)).await;
                }
                Err(e) => {
                    warn!("❌ {} - {}", symbol, e);
                    report.errors += 1;
                }
            }
        }

        report.optimized = self.maybe_optimize(now);
        report.weekly_report_sent = self.maybe_send_weekly_report(now).await;

        self.state
            .prune(now, self.settings.prune_horizon, &self.settings.symbols);
        self.persist(now);

        info!(
            "🔄 Cycle done: {} scanned, {} skipped, {} breakouts, {} signals, {} closed, {} open",
            report.scanned,
            report.skipped,
            report.breakouts,
            report.signals,
            report.closed.len(),
            self.state.open_positions()
        );
        report
    }

    /// Save state; failures are logged and retried on the next cycle
    pub fn persist(&mut self, now: DateTime<Utc>) {
        if let Err(e) = self.store.save(&mut self.state, now) {
            error!("Failed to save state: {:#}", e);
        }
    }

    async fn scan_symbol(
        &mut self,
        symbol: &Symbol,
        now: DateTime<Utc>,
        report: &mut CycleReport,
    ) -> Result<(), ScanError> {
        if self.state.symbol_mut(symbol).position().is_some() {
            return self.check_exit(symbol, now, report).await;
        }

        if let Some(expired) = self
            .detector
            .expire_pending(self.state.symbol_mut(symbol), now)
        {
            debug!("{} - {} expired", symbol, expired.kind);
            report.expired += 1;
        }

        let scan_config = self.resolve_scan_config(symbol, now).await?;
        let count = scan_config.candles + self.settings.oscillator.warmup();
        let candles = self
            .market
            .fetch_ohlc(symbol, &scan_config.timeframe, count)
            .await?;

        let channel = channel::analyze(&candles, scan_config.candles).map_err(|source| {
            ScanError::ComputationDegenerate {
                symbol: symbol.clone(),
                source,
            }
        })?;
        let oscillator = self.settings.oscillator.compute(&candles);
        let price = candles
            .last()
            .map(|c| c.close)
            .ok_or_else(|| ScanError::DataUnavailable {
                symbol: symbol.clone(),
                reason: "empty candle series".into(),
            })?;

        debug!(
            "{} {} - price {:.8} {} channel [{:.8}, {:.8}], angle {:.1}°, %K {:.1}",
            symbol,
            scan_config.timeframe,
            price,
            channel.position_label(price),
            channel.support,
            channel.resistance,
            channel.trend_angle_degrees,
            oscillator.k
        );

        let observation = Observation {
            channel,
            oscillator,
            price,
            timeframe: scan_config.timeframe.clone(),
            candles: scan_config.candles,
        };
        let params = self.state.parameters.clone();
        let decision = self.detector.evaluate(
            symbol,
            self.state.symbol_mut(symbol),
            &observation,
            &params,
            now,
        );

        match decision {
            Decision::BreakoutDetected(breakout) => {
                report.breakouts += 1;
                let text = notify::breakout_message(&breakout, &observation.channel);
                notify::notify(self.notifier.as_ref(), &text).await;
            }
            Decision::Signal(position) => {
                report.signals += 1;
                notify::notify(self.notifier.as_ref(), &notify::signal_message(&position)).await;
                self.execute(&position).await?;
            }
            Decision::SignalSuppressed { .. } => report.suppressed += 1,
            Decision::BreakoutExpired(_) => report.expired += 1,
            Decision::Hold | Decision::Filtered(_) | Decision::BreakoutCooldown { .. } => {}
        }
        Ok(())
    }

    /// Cached scan config, refreshed once stale.
    ///
    /// While a breakout is pending the cached config is kept regardless of
    /// age so the reentry is judged on the channel that produced it.
    async fn resolve_scan_config(
        &mut self,
        symbol: &Symbol,
        now: DateTime<Utc>,
    ) -> Result<ScanConfig, ScanError> {
        let ttl = self.settings.scan_config_ttl;
        let state = self.state.symbol_mut(symbol);
        if let Some(cached) = &state.scan_config {
            if state.pending().is_some() || cached.is_fresh(now, ttl) {
                return Ok(cached.clone());
            }
        }

        let found = self.search.search(self.market.as_ref(), symbol, now).await;
        let state = self.state.symbol_mut(symbol);
        match found {
            Some(config) => {
                state.scan_config = Some(config.clone());
                Ok(config)
            }
            None => {
                state.scan_config = None;
                Err(ScanError::DataUnavailable {
                    symbol: symbol.clone(),
                    reason: "no valid scan configuration".into(),
                })
            }
        }
    }

    async fn check_exit(
        &mut self,
        symbol: &Symbol,
        now: DateTime<Utc>,
        report: &mut CycleReport,
    ) -> Result<(), ScanError> {
        let price = self.market.latest_price(symbol).await?;
        let Some(record) = self
            .detector
            .check_exit(self.state.symbol_mut(symbol), price, now)
        else {
            return Ok(());
        };

        if let Err(e) = self.ledger.append(&record) {
            error!("Failed to append {} to the ledger: {:#}", symbol, e);
        }
        self.state.trades_since_optimization += 1;
        self.state.total_trades += 1;

        notify::notify(self.notifier.as_ref(), &notify::close_message(&record)).await;
        if let Some(gateway) = &self.gateway {
            exchange::cancel_remaining_orders(gateway.as_ref(), symbol).await;
        }
        report.closed.push(record);
        Ok(())
    }

    async fn execute(&self, position: &ActivePosition) -> Result<(), ScanError> {
        let (Some(gateway), Some(execution)) = (&self.gateway, &self.settings.execution) else {
            return Ok(());
        };
        let entry = exchange::open_protected_position(gateway.as_ref(), execution, position).await?;
        info!(
            "💼 {} {} live: fill {:.8}, SL {:.8}, TP {:.8}",
            position.symbol,
            position.side,
            entry.fill_price(position.entry_price),
            entry.stop_price,
            entry.take_profit_price
        );
        Ok(())
    }

    fn optimization_due(&self, now: DateTime<Utc>) -> bool {
        if !self.settings.auto_optimize {
            return false;
        }
        let by_time = self
            .state
            .last_optimization_at
            .map_or(true, |last| now - last >= self.settings.reoptimize_interval);
        let by_trades = self.state.trades_since_optimization >= self.settings.reoptimize_after_trades;
        by_time || by_trades
    }

    /// Re-tune thresholds from the ledger when a schedule trigger fired.
    ///
    /// Every attempt stamps the time and resets the trade counter; only a
    /// recommendation replaces the parameters.
    fn maybe_optimize(&mut self, now: DateTime<Utc>) -> bool {
        if !self.optimization_due(now) {
            return false;
        }

        let records = match self.ledger.load() {
            Ok(records) => records,
            Err(e) => {
                warn!("Optimizer skipped, ledger unreadable: {:#}", e);
                return false;
            }
        };

        self.state.last_optimization_at = Some(now);
        self.state.trades_since_optimization = 0;

        let Some(recommendation) = self.optimizer.recommend(&records, now, None) else {
            return false;
        };
        if let Err(e) = recommendation.save(&self.settings.best_params_path) {
            warn!("Failed to write best parameters: {:#}", e);
        }
        info!(
            "🧠 Parameters updated: trend {:.0}° strength {:.0}° margin {:.4}",
            recommendation.params.trend_threshold_degrees,
            recommendation.params.min_trend_strength_degrees,
            recommendation.params.entry_margin
        );
        self.state.parameters = recommendation.params;
        true
    }

    /// Send the 7-day summary once per interval.
    ///
    /// The first cycle only starts the clock.
    async fn maybe_send_weekly_report(&mut self, now: DateTime<Utc>) -> bool {
        let Some(last) = self.state.last_weekly_report_at else {
            self.state.last_weekly_report_at = Some(now);
            return false;
        };
        if now - last < self.settings.weekly_report_interval {
            return false;
        }
        self.state.last_weekly_report_at = Some(now);

        let records = match self
            .ledger
            .load_since(now, Duration::days(WEEKLY_REPORT_DAYS))
        {
            Ok(records) => records,
            Err(e) => {
                warn!("Weekly report skipped, ledger unreadable: {:#}", e);
                return false;
            }
        };
        match WeeklySummary::from_records(&records) {
            Some(summary) => {
                notify::notify(self.notifier.as_ref(), &summary.render(now)).await;
                true
            }
            None => {
                info!("📊 No closed trades in the last 7 days, weekly report skipped");
                false
            }
        }
    }
}

/// Configured thresholds, or the last optimizer output when one exists
fn initial_parameters(config: &Config, settings: &EngineSettings) -> ParameterSet {
    match Recommendation::load(&settings.best_params_path) {
        Ok(recommendation) => {
            info!(
                "✅ Loaded best parameters from {}",
                settings.best_params_path.display()
            );
            recommendation.params
        }
        Err(_) => config.strategy.initial_parameters(),
    }
}
