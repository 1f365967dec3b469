//! Breakout/reentry state machine
//!
//! Each symbol moves through three phases:
//!
//! ```text
//! IDLE --breakout--> PENDING_REENTRY --reentry--> IN_POSITION --TP/SL--> IDLE
//!                         |
//!                         +--timeout--> IDLE
//! ```
//!
//! There is no edge from IDLE straight into IN_POSITION: a position is only
//! ever opened from a pending breakout. All per-symbol fields live in one
//! [`SymbolState`] record so they cannot drift apart.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::channel::{ChannelDescriptor, TrendDirection};
use crate::indicators::OscillatorReading;
use crate::ledger::OperationRecord;
use crate::optimizer::ParameterSet;
use crate::risk::{RiskCalculator, RiskLevels};
use crate::scan_config::ScanConfig;
use crate::{BreakoutKind, Side, Symbol, TradeResult};

// =============================================================================
// Per-symbol state
// =============================================================================

/// A breakout waiting for price to come back into the channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingBreakout {
    pub symbol: Symbol,
    pub kind: BreakoutKind,
    pub detected_at: DateTime<Utc>,
    pub price_at_breakout: f64,
}

impl PendingBreakout {
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        now - self.detected_at
    }
}

/// An open position and the channel context that justified it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivePosition {
    pub symbol: Symbol,
    pub side: Side,
    pub entry_price: f64,
    pub take_profit: f64,
    pub stop_loss: f64,
    pub opened_at: DateTime<Utc>,
    pub channel: ChannelDescriptor,
    pub oscillator: OscillatorReading,
    pub timeframe: String,
    pub candles: usize,
    pub breakout_preceded: bool,
}

impl ActivePosition {
    /// Outcome if the position were closed at `price`, if any level is hit
    pub fn exit_result(&self, price: f64) -> Option<TradeResult> {
        match self.side {
            Side::Long if price >= self.take_profit => Some(TradeResult::TakeProfit),
            Side::Long if price <= self.stop_loss => Some(TradeResult::StopLoss),
            Side::Short if price <= self.take_profit => Some(TradeResult::TakeProfit),
            Side::Short if price >= self.stop_loss => Some(TradeResult::StopLoss),
            _ => None,
        }
    }

    /// Side-aware return in percent
    pub fn pnl_percent(&self, exit_price: f64) -> f64 {
        (exit_price - self.entry_price) / self.entry_price * 100.0 * self.side.sign()
    }

    pub fn levels(&self) -> RiskLevels {
        RiskLevels {
            entry: self.entry_price,
            stop_loss: self.stop_loss,
            take_profit: self.take_profit,
            adjusted: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SymbolPhase {
    #[default]
    Idle,
    PendingReentry(PendingBreakout),
    InPosition(ActivePosition),
}

impl SymbolPhase {
    pub fn label(&self) -> &'static str {
        match self {
            SymbolPhase::Idle => "IDLE",
            SymbolPhase::PendingReentry(_) => "PENDING_REENTRY",
            SymbolPhase::InPosition(_) => "IN_POSITION",
        }
    }
}

/// Everything the engine tracks for one symbol
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SymbolState {
    #[serde(default)]
    pub phase: SymbolPhase,
    /// Last time a breakout was registered, kept after the breakout resolves
    #[serde(default)]
    pub last_breakout_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_signal_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_closed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub scan_config: Option<ScanConfig>,
}

impl SymbolState {
    pub fn pending(&self) -> Option<&PendingBreakout> {
        match &self.phase {
            SymbolPhase::PendingReentry(pending) => Some(pending),
            _ => None,
        }
    }

    pub fn position(&self) -> Option<&ActivePosition> {
        match &self.phase {
            SymbolPhase::InPosition(position) => Some(position),
            _ => None,
        }
    }

    pub fn is_idle(&self) -> bool {
        matches!(self.phase, SymbolPhase::Idle)
    }

    /// Drop cooldown stamps older than `horizon`
    pub fn prune_timestamps(&mut self, now: DateTime<Utc>, horizon: Duration) {
        for stamp in [
            &mut self.last_breakout_at,
            &mut self.last_signal_at,
            &mut self.last_closed_at,
        ] {
            if stamp.is_some_and(|t| now - t > horizon) {
                *stamp = None;
            }
        }
    }
}

// =============================================================================
// Detector
// =============================================================================

/// Thresholds that are fixed per deployment
#[derive(Debug, Clone, PartialEq)]
pub struct DetectorConfig {
    pub min_channel_width_percent: f64,
    pub min_pearson: f64,
    pub min_r2: f64,
    pub min_strength_level: u8,
    pub oversold: f64,
    pub overbought: f64,
    pub breakout_cooldown: Duration,
    pub reentry_timeout: Duration,
    pub signal_cooldown: Duration,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            min_channel_width_percent: 4.0,
            min_pearson: 0.4,
            min_r2: 0.4,
            min_strength_level: 2,
            oversold: 30.0,
            overbought: 70.0,
            breakout_cooldown: Duration::minutes(25),
            reentry_timeout: Duration::minutes(30),
            signal_cooldown: Duration::minutes(120),
        }
    }
}

/// Why the quality gate rejected a channel
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum GateRejection {
    WeakTrend(u8),
    LowCorrelation(f64),
    PoorFit(f64),
    NarrowChannel(f64),
}

impl std::fmt::Display for GateRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GateRejection::WeakTrend(level) => write!(f, "strength level {} too low", level),
            GateRejection::LowCorrelation(p) => write!(f, "|pearson| {:.2} too low", p.abs()),
            GateRejection::PoorFit(r2) => write!(f, "r2 {:.2} too low", r2),
            GateRejection::NarrowChannel(w) => write!(f, "channel width {:.2}% too narrow", w),
        }
    }
}

/// One scan's view of a symbol
#[derive(Debug, Clone)]
pub struct Observation {
    pub channel: ChannelDescriptor,
    pub oscillator: OscillatorReading,
    /// Latest close
    pub price: f64,
    pub timeframe: String,
    pub candles: usize,
}

/// Result of feeding one observation to the detector
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// No transition
    Hold,
    /// Channel failed the data-quality gate
    Filtered(GateRejection),
    BreakoutDetected(PendingBreakout),
    /// A breakout formed but one was registered too recently
    BreakoutCooldown { minutes_since: i64 },
    /// Pending breakout timed out without reentry
    BreakoutExpired(PendingBreakout),
    /// Reentry confirmed inside the minimum signal spacing
    SignalSuppressed { side: Side, minutes_since: i64 },
    Signal(ActivePosition),
}

#[derive(Debug, Clone, Default)]
pub struct BreakoutDetector {
    config: DetectorConfig,
    risk: RiskCalculator,
}

impl BreakoutDetector {
    pub fn new(config: DetectorConfig, risk: RiskCalculator) -> Self {
        Self { config, risk }
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    /// Hard data-quality filters applied before any transition
    pub fn quality_gate(&self, channel: &ChannelDescriptor) -> Result<(), GateRejection> {
        if channel.strength_level < self.config.min_strength_level {
            return Err(GateRejection::WeakTrend(channel.strength_level));
        }
        if channel.pearson.abs() < self.config.min_pearson {
            return Err(GateRejection::LowCorrelation(channel.pearson));
        }
        if channel.r2 < self.config.min_r2 {
            return Err(GateRejection::PoorFit(channel.r2));
        }
        if channel.channel_width_percent < self.config.min_channel_width_percent {
            return Err(GateRejection::NarrowChannel(channel.channel_width_percent));
        }
        Ok(())
    }

    /// Discard a pending breakout older than the reentry timeout.
    ///
    /// Runs ahead of data fetching so a timeout is honored even when the
    /// symbol cannot be analyzed this cycle.
    pub fn expire_pending(
        &self,
        state: &mut SymbolState,
        now: DateTime<Utc>,
    ) -> Option<PendingBreakout> {
        let expired = state
            .pending()
            .is_some_and(|pending| pending.age(now) > self.config.reentry_timeout);
        if !expired {
            return None;
        }

        match std::mem::take(&mut state.phase) {
            SymbolPhase::PendingReentry(pending) => {
                info!(
                    "⏰ {} - reentry timeout after {} min, discarding {}",
                    pending.symbol,
                    pending.age(now).num_minutes(),
                    pending.kind
                );
                Some(pending)
            }
            other => {
                state.phase = other;
                None
            }
        }
    }

    /// Advance the state machine for one observation
    pub fn evaluate(
        &self,
        symbol: &Symbol,
        state: &mut SymbolState,
        observation: &Observation,
        params: &ParameterSet,
        now: DateTime<Utc>,
    ) -> Decision {
        if let Some(expired) = self.expire_pending(state, now) {
            return Decision::BreakoutExpired(expired);
        }

        // exits are price driven and handled by check_exit
        if state.position().is_some() {
            return Decision::Hold;
        }

        if let Err(rejection) = self.quality_gate(&observation.channel) {
            debug!("{} - filtered: {}", symbol, rejection);
            return Decision::Filtered(rejection);
        }

        match state.pending().cloned() {
            None => self.detect_breakout(symbol, state, observation, params, now),
            Some(pending) => self.confirm_reentry(state, &pending, observation, params, now),
        }
    }

    fn detect_breakout(
        &self,
        symbol: &Symbol,
        state: &mut SymbolState,
        observation: &Observation,
        params: &ParameterSet,
        now: DateTime<Utc>,
    ) -> Decision {
        let channel = &observation.channel;
        let angle = channel.trend_angle_degrees.abs();
        if angle < params.min_trend_strength_degrees || angle < params.trend_threshold_degrees {
            return Decision::Hold;
        }

        let price = observation.price;
        let kind = match channel.direction {
            TrendDirection::Up if price < channel.support => BreakoutKind::BreakoutLong,
            TrendDirection::Down if price > channel.resistance => BreakoutKind::BreakoutShort,
            _ => return Decision::Hold,
        };

        if let Some(last) = state.last_breakout_at {
            let since = now - last;
            if since < self.config.breakout_cooldown {
                info!(
                    "⏰ {} - breakout seen {} min ago, skipping",
                    symbol,
                    since.num_minutes()
                );
                return Decision::BreakoutCooldown {
                    minutes_since: since.num_minutes(),
                };
            }
        }

        let pending = PendingBreakout {
            symbol: symbol.clone(),
            kind,
            detected_at: now,
            price_at_breakout: price,
        };
        info!(
            "🎯 {} - {} at {:.8} (support {:.8}, resistance {:.8}), waiting for reentry",
            symbol, kind, price, channel.support, channel.resistance
        );
        state.last_breakout_at = Some(now);
        state.phase = SymbolPhase::PendingReentry(pending.clone());
        Decision::BreakoutDetected(pending)
    }

    fn confirm_reentry(
        &self,
        state: &mut SymbolState,
        pending: &PendingBreakout,
        observation: &Observation,
        params: &ParameterSet,
        now: DateTime<Utc>,
    ) -> Decision {
        let channel = &observation.channel;
        let price = observation.price;
        if !channel.contains(price) {
            return Decision::Hold;
        }

        let tolerance = params.entry_margin * price;
        let oscillator = observation.oscillator;
        let confirmed = match pending.kind {
            BreakoutKind::BreakoutLong => {
                (price - channel.support).abs() <= tolerance
                    && oscillator.is_oversold(self.config.oversold)
            }
            BreakoutKind::BreakoutShort => {
                (price - channel.resistance).abs() <= tolerance
                    && oscillator.is_overbought(self.config.overbought)
            }
        };
        if !confirmed {
            return Decision::Hold;
        }

        let side = pending.kind.side();
        if let Some(since) = self.time_since_last_trade(state, now) {
            if since < self.config.signal_cooldown {
                info!(
                    "⏳ {} - reentry {} confirmed but last signal was {} min ago",
                    pending.symbol,
                    side,
                    since.num_minutes()
                );
                return Decision::SignalSuppressed {
                    side,
                    minutes_since: since.num_minutes(),
                };
            }
        }

        let Some(levels) = self.risk.compute_levels(side, price, channel) else {
            debug!("{} - no valid risk levels at {}", pending.symbol, price);
            return Decision::Hold;
        };

        let position = ActivePosition {
            symbol: pending.symbol.clone(),
            side,
            entry_price: levels.entry,
            take_profit: levels.take_profit,
            stop_loss: levels.stop_loss,
            opened_at: now,
            channel: channel.clone(),
            oscillator,
            timeframe: observation.timeframe.clone(),
            candles: observation.candles,
            breakout_preceded: true,
        };
        info!(
            "✅ {} - REENTRY {} confirmed: entry {:.8}, TP {:.8}, SL {:.8}",
            position.symbol, side, position.entry_price, position.take_profit, position.stop_loss
        );
        state.last_signal_at = Some(now);
        state.phase = SymbolPhase::InPosition(position.clone());
        Decision::Signal(position)
    }

    /// Most recent of the last signal and the last close
    fn time_since_last_trade(&self, state: &SymbolState, now: DateTime<Utc>) -> Option<Duration> {
        state
            .last_signal_at
            .into_iter()
            .chain(state.last_closed_at)
            .max()
            .map(|t| now - t)
    }

    /// Close the position if `price` touches its target or stop
    pub fn check_exit(
        &self,
        state: &mut SymbolState,
        price: f64,
        now: DateTime<Utc>,
    ) -> Option<OperationRecord> {
        let result = state.position()?.exit_result(price)?;
        let SymbolPhase::InPosition(position) = std::mem::take(&mut state.phase) else {
            return None;
        };

        let record = OperationRecord::close(&position, price, result, now);
        info!(
            "📊 {} {} closed {} at {:.8}, PnL {:.2}%",
            position.symbol, position.side, result, price, record.pnl_percent
        );
        state.last_closed_at = Some(now);
        Some(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
    }

    fn rising_channel() -> ChannelDescriptor {
        ChannelDescriptor {
            resistance: 105.0,
            support: 100.0,
            resistance_slope: 0.2,
            support_slope: 0.2,
            trend_slope: 0.2,
            trend_angle_degrees: 30.0,
            pearson: 0.9,
            r2: 0.8,
            channel_width: 5.0,
            channel_width_percent: 5.0 / 102.5 * 100.0,
            direction: TrendDirection::Up,
            strength_level: 4,
        }
    }

    fn falling_channel() -> ChannelDescriptor {
        ChannelDescriptor {
            trend_angle_degrees: -30.0,
            pearson: -0.9,
            direction: TrendDirection::Down,
            ..rising_channel()
        }
    }

    fn observe(channel: ChannelDescriptor, price: f64, k: f64, d: f64) -> Observation {
        Observation {
            channel,
            oscillator: OscillatorReading { k, d },
            price,
            timeframe: "5m".into(),
            candles: 100,
        }
    }

    fn symbol() -> Symbol {
        Symbol::new("BTCUSDT")
    }

    #[test]
    fn test_long_breakout_then_reentry() {
        let detector = BreakoutDetector::default();
        let params = ParameterSet::default();
        let mut state = SymbolState::default();

        let decision = detector.evaluate(
            &symbol(),
            &mut state,
            &observe(rising_channel(), 99.0, 50.0, 50.0),
            &params,
            t0(),
        );
        assert!(matches!(decision, Decision::BreakoutDetected(ref p) if p.kind == BreakoutKind::BreakoutLong));
        assert!(state.pending().is_some());

        let decision = detector.evaluate(
            &symbol(),
            &mut state,
            &observe(rising_channel(), 100.05, 20.0, 25.0),
            &params,
            t0() + Duration::minutes(5),
        );
        let Decision::Signal(position) = decision else {
            panic!("expected signal, got {:?}", decision);
        };
        assert_eq!(position.side, Side::Long);
        assert!((position.take_profit - (100.05 + 5.0)).abs() < 1e-9);
        assert!(state.position().is_some());
        assert!(state.pending().is_none());
    }

    #[test]
    fn test_short_breakout_then_reentry() {
        let detector = BreakoutDetector::default();
        let params = ParameterSet::default();
        let mut state = SymbolState::default();

        let decision = detector.evaluate(
            &symbol(),
            &mut state,
            &observe(falling_channel(), 106.0, 50.0, 50.0),
            &params,
            t0(),
        );
        assert!(matches!(decision, Decision::BreakoutDetected(ref p) if p.kind == BreakoutKind::BreakoutShort));

        // oscillator not yet overbought
        let decision = detector.evaluate(
            &symbol(),
            &mut state,
            &observe(falling_channel(), 104.95, 60.0, 75.0),
            &params,
            t0() + Duration::minutes(2),
        );
        assert_eq!(decision, Decision::Hold);

        let decision = detector.evaluate(
            &symbol(),
            &mut state,
            &observe(falling_channel(), 104.95, 80.0, 75.0),
            &params,
            t0() + Duration::minutes(3),
        );
        let Decision::Signal(position) = decision else {
            panic!("expected signal, got {:?}", decision);
        };
        assert_eq!(position.side, Side::Short);
        assert!(position.stop_loss > position.entry_price);
        assert!(position.take_profit < position.entry_price);
    }

    #[test]
    fn test_never_idle_to_position() {
        let detector = BreakoutDetector::default();
        let params = ParameterSet::default();
        let mut state = SymbolState::default();

        // perfect reentry conditions without a preceding breakout
        let decision = detector.evaluate(
            &symbol(),
            &mut state,
            &observe(rising_channel(), 100.0, 10.0, 10.0),
            &params,
            t0(),
        );
        assert_eq!(decision, Decision::Hold);
        assert!(state.is_idle());
    }

    #[test]
    fn test_timeout_returns_to_idle_regardless_of_price() {
        let detector = BreakoutDetector::default();
        let params = ParameterSet::default();
        let mut state = SymbolState::default();
        detector.evaluate(
            &symbol(),
            &mut state,
            &observe(rising_channel(), 99.0, 50.0, 50.0),
            &params,
            t0(),
        );

        // a would-be perfect reentry after the timeout
        let decision = detector.evaluate(
            &symbol(),
            &mut state,
            &observe(rising_channel(), 100.0, 10.0, 10.0),
            &params,
            t0() + Duration::minutes(31),
        );
        assert!(matches!(decision, Decision::BreakoutExpired(_)));
        assert!(state.is_idle());
        assert_eq!(state.last_breakout_at, Some(t0()));
    }

    #[test]
    fn test_quality_gate_blocks_transitions() {
        let detector = BreakoutDetector::default();
        let params = ParameterSet::default();
        let mut state = SymbolState::default();

        let weak = ChannelDescriptor {
            r2: 0.2,
            ..rising_channel()
        };
        let decision = detector.evaluate(
            &symbol(),
            &mut state,
            &observe(weak, 99.0, 50.0, 50.0),
            &params,
            t0(),
        );
        assert_eq!(decision, Decision::Filtered(GateRejection::PoorFit(0.2)));

        let narrow = ChannelDescriptor {
            channel_width_percent: 1.0,
            ..rising_channel()
        };
        let decision = detector.evaluate(
            &symbol(),
            &mut state,
            &observe(narrow, 99.0, 50.0, 50.0),
            &params,
            t0(),
        );
        assert_eq!(decision, Decision::Filtered(GateRejection::NarrowChannel(1.0)));
        assert!(state.is_idle());
    }

    #[test]
    fn test_angle_below_threshold_is_not_breakout() {
        let detector = BreakoutDetector::default();
        let params = ParameterSet::default();
        let mut state = SymbolState::default();
        let shallow = ChannelDescriptor {
            trend_angle_degrees: 10.0,
            strength_level: 2,
            ..rising_channel()
        };
        let decision = detector.evaluate(
            &symbol(),
            &mut state,
            &observe(shallow, 99.0, 50.0, 50.0),
            &params,
            t0(),
        );
        assert_eq!(decision, Decision::Hold);
    }

    #[test]
    fn test_breakout_cooldown() {
        let detector = BreakoutDetector::default();
        let params = ParameterSet::default();
        let mut state = SymbolState {
            last_breakout_at: Some(t0() - Duration::minutes(10)),
            ..Default::default()
        };
        let decision = detector.evaluate(
            &symbol(),
            &mut state,
            &observe(rising_channel(), 99.0, 50.0, 50.0),
            &params,
            t0(),
        );
        assert_eq!(decision, Decision::BreakoutCooldown { minutes_since: 10 });
        assert!(state.is_idle());
    }

    #[test]
    fn test_signal_spacing_keeps_pending() {
        let detector = BreakoutDetector::default();
        let params = ParameterSet::default();
        let mut state = SymbolState {
            last_closed_at: Some(t0() - Duration::minutes(60)),
            ..Default::default()
        };
        detector.evaluate(
            &symbol(),
            &mut state,
            &observe(rising_channel(), 99.0, 50.0, 50.0),
            &params,
            t0(),
        );
        let decision = detector.evaluate(
            &symbol(),
            &mut state,
            &observe(rising_channel(), 100.0, 10.0, 10.0),
            &params,
            t0() + Duration::minutes(1),
        );
        assert!(matches!(decision, Decision::SignalSuppressed { side: Side::Long, .. }));
        assert!(state.pending().is_some());
    }

    #[test]
    fn test_exit_long_take_profit_and_short_stop() {
        let detector = BreakoutDetector::default();
        let position = ActivePosition {
            symbol: symbol(),
            side: Side::Long,
            entry_price: 100.0,
            take_profit: 105.0,
            stop_loss: 98.0,
            opened_at: t0(),
            channel: rising_channel(),
            oscillator: OscillatorReading { k: 20.0, d: 20.0 },
            timeframe: "5m".into(),
            candles: 100,
            breakout_preceded: true,
        };
        let mut state = SymbolState {
            phase: SymbolPhase::InPosition(position.clone()),
            ..Default::default()
        };

        assert!(detector.check_exit(&mut state, 103.0, t0()).is_none());
        let record = detector
            .check_exit(&mut state, 105.5, t0() + Duration::minutes(42))
            .unwrap();
        assert_eq!(record.result, TradeResult::TakeProfit);
        assert!((record.pnl_percent - 5.5).abs() < 1e-9);
        assert!((record.duration_minutes - 42.0).abs() < 1e-9);
        assert!(state.is_idle());
        assert_eq!(state.last_closed_at, Some(t0() + Duration::minutes(42)));

        let short = ActivePosition {
            side: Side::Short,
            take_profit: 95.0,
            stop_loss: 102.0,
            ..position
        };
        assert_eq!(short.exit_result(102.5), Some(TradeResult::StopLoss));
        assert_eq!(short.exit_result(94.0), Some(TradeResult::TakeProfit));
        assert_eq!(short.exit_result(99.0), None);
        assert!((short.pnl_percent(102.0) + 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_prune_timestamps() {
        let mut state = SymbolState {
            last_breakout_at: Some(t0() - Duration::days(40)),
            last_signal_at: Some(t0() - Duration::days(2)),
            ..Default::default()
        };
        state.prune_timestamps(t0(), Duration::days(30));
        assert!(state.last_breakout_at.is_none());
        assert!(state.last_signal_at.is_some());
    }
}
