//! Regression channel analyzer
//!
//! Fits independent least-squares lines through the highs, lows and closes of
//! the most recent `window` candles. Resistance and support are the fitted
//! high/low at the last bar widened by one standard deviation of their
//! residuals, so the band covers the typical excursion rather than the raw
//! extremes.

use serde::{Deserialize, Serialize};

use crate::error::AnalysisError;
use crate::indicators::{self, OscillatorReading};
use crate::Candle;

/// Absolute angle below which a channel is considered flat
pub const RANGE_ANGLE_DEGREES: f64 = 1.0;

/// Upper bounds (exclusive) of strength tiers 1..=4; anything above is tier 5
const STRENGTH_TIERS: [f64; 4] = [3.0, 13.0, 27.0, 45.0];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TrendDirection {
    Up,
    Down,
    Range,
}

impl TrendDirection {
    pub fn from_angle(angle_degrees: f64) -> Self {
        if angle_degrees.abs() < RANGE_ANGLE_DEGREES {
            TrendDirection::Range
        } else if angle_degrees > 0.0 {
            TrendDirection::Up
        } else {
            TrendDirection::Down
        }
    }
}

impl std::fmt::Display for TrendDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TrendDirection::Up => f.write_str("UP"),
            TrendDirection::Down => f.write_str("DOWN"),
            TrendDirection::Range => f.write_str("RANGE"),
        }
    }
}

/// Bucket `|angle|` into tiers 1..=5, each boundary inclusive-above
pub fn strength_level(angle_degrees: f64) -> u8 {
    let abs = angle_degrees.abs();
    STRENGTH_TIERS
        .iter()
        .position(|&bound| abs < bound)
        .map(|tier| tier as u8 + 1)
        .unwrap_or(5)
}

/// Channel snapshot for one (symbol, timeframe, window) combination
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelDescriptor {
    pub resistance: f64,
    pub support: f64,
    pub resistance_slope: f64,
    pub support_slope: f64,
    pub trend_slope: f64,
    pub trend_angle_degrees: f64,
    pub pearson: f64,
    pub r2: f64,
    /// `resistance - support`
    pub channel_width: f64,
    /// Width relative to the channel midpoint, in percent
    pub channel_width_percent: f64,
    pub direction: TrendDirection,
    pub strength_level: u8,
}

impl ChannelDescriptor {
    pub fn midpoint(&self) -> f64 {
        (self.resistance + self.support) / 2.0
    }

    pub fn contains(&self, price: f64) -> bool {
        self.support <= price && price <= self.resistance
    }

    /// Where `price` sits relative to the band, for scan logs
    pub fn position_label(&self, price: f64) -> &'static str {
        if price > self.resistance {
            "above"
        } else if price < self.support {
            "below"
        } else {
            "inside"
        }
    }
}

/// Fit a channel over the last `window` candles.
///
/// Fails when fewer than `window` candles are available or the fit is
/// degenerate.
pub fn analyze(candles: &[Candle], window: usize) -> Result<ChannelDescriptor, AnalysisError> {
    if window < 2 || candles.len() < window {
        return Err(AnalysisError::InsufficientBars {
            needed: window.max(2),
            available: candles.len(),
        });
    }

    let recent = &candles[candles.len() - window..];
    let highs: Vec<f64> = recent.iter().map(|c| c.high).collect();
    let lows: Vec<f64> = recent.iter().map(|c| c.low).collect();
    let closes: Vec<f64> = recent.iter().map(|c| c.close).collect();

    let high_fit = indicators::linear_regression(&highs)
        .ok_or(AnalysisError::DegenerateRegression("high"))?;
    let low_fit = indicators::linear_regression(&lows)
        .ok_or(AnalysisError::DegenerateRegression("low"))?;
    let close_fit = indicators::linear_regression(&closes)
        .ok_or(AnalysisError::DegenerateRegression("close"))?;

    let last = (window - 1) as f64;
    let resistance = high_fit.at(last) + indicators::residual_std(&highs, &high_fit);
    let support = low_fit.at(last) - indicators::residual_std(&lows, &low_fit);

    let midpoint = (resistance + support) / 2.0;
    if !resistance.is_finite() || !support.is_finite() || midpoint <= 0.0 {
        return Err(AnalysisError::DegenerateRegression("channel bounds"));
    }
    let channel_width = resistance - support;

    let pearson = indicators::pearson(&closes);
    // an undefined correlation means there is no trend to measure
    let trend_angle_degrees = if pearson == 0.0 {
        0.0
    } else {
        indicators::trend_angle_degrees(close_fit.slope, &closes)
    };

    Ok(ChannelDescriptor {
        resistance,
        support,
        resistance_slope: high_fit.slope,
        support_slope: low_fit.slope,
        trend_slope: close_fit.slope,
        trend_angle_degrees,
        pearson,
        r2: indicators::r_squared(&closes, &close_fit),
        channel_width,
        channel_width_percent: channel_width / midpoint * 100.0,
        direction: TrendDirection::from_angle(trend_angle_degrees),
        strength_level: strength_level(trend_angle_degrees),
    })
}

/// Settings of the stochastic oscillator
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OscillatorSettings {
    pub period: usize,
    pub k_smoothing: usize,
    pub d_smoothing: usize,
}

impl Default for OscillatorSettings {
    fn default() -> Self {
        Self {
            period: 14,
            k_smoothing: 3,
            d_smoothing: 3,
        }
    }
}

impl OscillatorSettings {
    /// Extra bars to request beyond the channel window
    pub fn warmup(&self) -> usize {
        self.period
    }

    pub fn compute(&self, candles: &[Candle]) -> OscillatorReading {
        let highs: Vec<f64> = candles.iter().map(|c| c.high).collect();
        let lows: Vec<f64> = candles.iter().map(|c| c.low).collect();
        let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
        indicators::stochastic(
            &highs,
            &lows,
            &closes,
            self.period,
            self.k_smoothing,
            self.d_smoothing,
        )
    }
}
