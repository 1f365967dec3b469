//! Risk level calculator
//!
//! Derives entry, stop-loss and take-profit for a confirmed reentry from the
//! channel geometry:
//!
//! ```text
//! LONG:  entry = price, SL = entry * (1 - sl_pct),      TP = entry + width
//! SHORT: entry = price, SL = resistance * (1 + sl_pct), TP = entry - width
//! ```
//!
//! When the reward/risk ratio falls short of `min_rr_ratio` the target is
//! pushed out to `entry ± risk * min_rr_ratio`. The stop is never touched by
//! that adjustment.

use serde::{Deserialize, Serialize};

use crate::channel::ChannelDescriptor;
use crate::Side;

/// Configuration for [`RiskCalculator`] using builder pattern
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskConfig {
    pub stop_loss_pct: f64,
    pub min_rr_ratio: f64,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            stop_loss_pct: 0.02,
            min_rr_ratio: 1.2,
        }
    }
}

impl RiskConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_stop_loss_pct(mut self, pct: f64) -> Self {
        self.stop_loss_pct = pct;
        self
    }

    pub fn with_min_rr_ratio(mut self, ratio: f64) -> Self {
        self.min_rr_ratio = ratio;
        self
    }
}

/// Computed order levels for a new position
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RiskLevels {
    pub entry: f64,
    pub stop_loss: f64,
    pub take_profit: f64,
    /// True when the target was widened to honor the minimum ratio
    pub adjusted: bool,
}

impl RiskLevels {
    pub fn risk(&self) -> f64 {
        (self.entry - self.stop_loss).abs()
    }

    pub fn reward(&self) -> f64 {
        (self.take_profit - self.entry).abs()
    }

    pub fn rr_ratio(&self) -> f64 {
        let risk = self.risk();
        if risk > 0.0 {
            self.reward() / risk
        } else {
            0.0
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RiskCalculator {
    config: RiskConfig,
}

impl RiskCalculator {
    pub fn new(config: RiskConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RiskConfig {
        &self.config
    }

    /// Levels for a position opened at `price`.
    ///
    /// Returns `None` when the stop would sit at or beyond the entry on the
    /// wrong side, which leaves no meaningful risk to size against.
    pub fn compute_levels(
        &self,
        side: Side,
        price: f64,
        channel: &ChannelDescriptor,
    ) -> Option<RiskLevels> {
        if !price.is_finite() || price <= 0.0 {
            return None;
        }

        let entry = price;
        let width = channel.channel_width;
        let (stop_loss, mut take_profit) = match side {
            Side::Long => (entry * (1.0 - self.config.stop_loss_pct), entry + width),
            Side::Short => (
                channel.resistance * (1.0 + self.config.stop_loss_pct),
                entry - width,
            ),
        };

        // stop must be on the losing side of entry
        let risk = (entry - stop_loss) * side.sign();
        if risk <= 0.0 {
            return None;
        }

        let reward = (take_profit - entry) * side.sign();
        let mut adjusted = false;
        if reward / risk < self.config.min_rr_ratio {
            take_profit = entry + side.sign() * risk * self.config.min_rr_ratio;
            adjusted = true;
        }

        Some(RiskLevels {
            entry,
            stop_loss,
            take_profit,
            adjusted,
        })
    }
}
