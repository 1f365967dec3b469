//! Parameter optimizer
//!
//! Grid-searches the detection thresholds against the operation ledger.
//! Each combination of (trend threshold, minimum strength, entry margin)
//! selects the historical trades that would have passed it and is scored by
//!
//! ```text
//! score = (mean_pnl - 0.5 * stdev_pnl) * win_rate * sqrt(n)
//! ```
//!
//! with a 1.2x boost when the subset contains high-quality channels.
//! Subsets below the sample floor get `-10000 - n`, so a data-starved
//! combination can never beat one that meets the floor.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use indicatif::ProgressBar;
use itertools::iproduct;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use statrs::statistics::Statistics;
use std::path::Path;
use tracing::{info, warn};

use crate::ledger::OperationRecord;
use crate::state_manager::write_atomic;

/// The active detection thresholds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterSet {
    pub trend_threshold_degrees: f64,
    pub min_trend_strength_degrees: f64,
    /// Reentry tolerance as a fraction of price
    pub entry_margin: f64,
    /// Optimizer score that produced this set, `None` for defaults
    #[serde(default)]
    pub score: Option<f64>,
    #[serde(default)]
    pub samples: usize,
}

impl Default for ParameterSet {
    fn default() -> Self {
        Self {
            trend_threshold_degrees: 16.0,
            min_trend_strength_degrees: 16.0,
            entry_margin: 0.001,
            score: None,
            samples: 0,
        }
    }
}

/// Candidate values for each tunable threshold
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizerGrid {
    pub trend_thresholds: Vec<f64>,
    pub min_strengths: Vec<f64>,
    pub entry_margins: Vec<f64>,
}

impl OptimizerGrid {
    /// 12 x 10 x 10 = 1200 combinations
    pub fn full() -> Self {
        Self {
            trend_thresholds: vec![
                3.0, 5.0, 8.0, 10.0, 12.0, 15.0, 18.0, 20.0, 25.0, 30.0, 35.0, 40.0,
            ],
            min_strengths: vec![3.0, 5.0, 8.0, 10.0, 12.0, 15.0, 18.0, 20.0, 25.0, 30.0],
            entry_margins: vec![
                0.0005, 0.001, 0.0015, 0.002, 0.0025, 0.003, 0.004, 0.005, 0.008, 0.01,
            ],
        }
    }

    /// 6 x 5 x 4 = 120 combinations, for in-cycle runs
    pub fn quick() -> Self {
        Self {
            trend_thresholds: vec![5.0, 10.0, 15.0, 20.0, 30.0, 40.0],
            min_strengths: vec![5.0, 10.0, 15.0, 20.0, 30.0],
            entry_margins: vec![0.0005, 0.001, 0.002, 0.005],
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "full" => Some(Self::full()),
            "quick" => Some(Self::quick()),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.trend_thresholds.len() * self.min_strengths.len() * self.entry_margins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Combinations in nested (trend, strength, margin) order
    pub fn combinations(&self) -> Vec<(f64, f64, f64)> {
        iproduct!(
            self.trend_thresholds.iter().copied(),
            self.min_strengths.iter().copied(),
            self.entry_margins.iter().copied()
        )
        .collect()
    }
}

/// Filters and scoring constants
#[derive(Debug, Clone, PartialEq)]
pub struct OptimizerConfig {
    /// Below this many ledger rows there is no recommendation
    pub min_samples: usize,
    pub min_pearson: f64,
    pub min_r2: f64,
    pub min_strength_level: u8,
    pub floor_min: usize,
    pub floor_fraction: f64,
    pub high_quality_r2: f64,
    pub high_quality_strength: u8,
    pub high_quality_boost: f64,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            min_samples: 15,
            min_pearson: 0.4,
            min_r2: 0.4,
            min_strength_level: 2,
            floor_min: 8,
            floor_fraction: 0.15,
            high_quality_r2: 0.6,
            high_quality_strength: 3,
            high_quality_boost: 1.2,
        }
    }
}

impl OptimizerConfig {
    pub fn with_min_samples(mut self, min_samples: usize) -> Self {
        self.min_samples = min_samples;
        self
    }

    /// Minimum filtered sample count for a combination to be scored
    pub fn sample_floor(&self, total: usize) -> usize {
        self.floor_min
            .max((self.floor_fraction * total as f64) as usize)
    }
}

/// Score of one grid point
#[derive(Debug, Clone, PartialEq)]
pub struct CandidateScore {
    pub trend_threshold_degrees: f64,
    pub min_trend_strength_degrees: f64,
    pub entry_margin: f64,
    pub score: f64,
    pub samples: usize,
    pub win_rate: f64,
    pub mean_pnl: f64,
}

impl CandidateScore {
    pub fn meets_floor(&self) -> bool {
        self.score > -10000.0
    }

    pub fn to_parameter_set(&self) -> ParameterSet {
        ParameterSet {
            trend_threshold_degrees: self.trend_threshold_degrees,
            min_trend_strength_degrees: self.min_trend_strength_degrees,
            entry_margin: self.entry_margin,
            score: Some(self.score),
            samples: self.samples,
        }
    }
}

/// Winning parameter set plus search metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recommendation {
    #[serde(flatten)]
    pub params: ParameterSet,
    pub evaluated_samples: usize,
    pub total_combinations: usize,
    pub generated_at: DateTime<Utc>,
}

impl Recommendation {
    /// Atomically replace the best-parameters file
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let json = serde_json::to_vec_pretty(self).context("Failed to serialize parameters")?;
        write_atomic(path.as_ref(), &json)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref()).with_context(|| {
            format!("Failed to read best parameters {}", path.as_ref().display())
        })?;
        serde_json::from_str(&contents).context("Failed to parse best parameters JSON")
    }
}

#[derive(Debug, Clone)]
pub struct ParameterOptimizer {
    config: OptimizerConfig,
    grid: OptimizerGrid,
}

impl ParameterOptimizer {
    pub fn new(config: OptimizerConfig, grid: OptimizerGrid) -> Self {
        Self { config, grid }
    }

    pub fn grid(&self) -> &OptimizerGrid {
        &self.grid
    }

    pub fn config(&self) -> &OptimizerConfig {
        &self.config
    }

    /// Score one combination against the full ledger
    pub fn score_combination(
        &self,
        records: &[OperationRecord],
        trend_threshold: f64,
        min_strength: f64,
        entry_margin: f64,
    ) -> CandidateScore {
        let cfg = &self.config;
        let filtered: Vec<&OperationRecord> = records
            .iter()
            .filter(|r| {
                let angle = r.trend_angle_degrees.abs();
                angle >= trend_threshold
                    && angle >= min_strength
                    && r.pearson.abs() >= cfg.min_pearson
                    && r.strength_level >= cfg.min_strength_level
                    && r.r2 >= cfg.min_r2
            })
            .collect();

        let n = filtered.len();
        let mut candidate = CandidateScore {
            trend_threshold_degrees: trend_threshold,
            min_trend_strength_degrees: min_strength,
            entry_margin,
            score: -10000.0 - n as f64,
            samples: n,
            win_rate: 0.0,
            mean_pnl: 0.0,
        };
        if n == 0 || n < cfg.sample_floor(records.len()) {
            return candidate;
        }

        let pnls: Vec<f64> = filtered.iter().map(|r| r.pnl_percent).collect();
        let mean = pnls.iter().mean();
        let std_dev = if n > 1 { pnls.iter().std_dev() } else { 0.0 };
        let win_rate = pnls.iter().filter(|p| **p > 0.0).count() as f64 / n as f64;

        let mut score = (mean - 0.5 * std_dev) * win_rate * (n as f64).sqrt();
        let has_high_quality = filtered
            .iter()
            .any(|r| r.r2 >= cfg.high_quality_r2 && r.strength_level >= cfg.high_quality_strength);
        if has_high_quality {
            score *= cfg.high_quality_boost;
        }

        candidate.score = score;
        candidate.win_rate = win_rate;
        candidate.mean_pnl = mean;
        candidate
    }

    /// Score every grid point in parallel; output follows grid order
    pub fn evaluate_all(
        &self,
        records: &[OperationRecord],
        progress: Option<&ProgressBar>,
    ) -> Vec<CandidateScore> {
        info!("Testing {} parameter combinations", self.grid.len());
        self.grid
            .combinations()
            .par_iter()
            .map(|&(t, s, m)| {
                let candidate = self.score_combination(records, t, s, m);
                if let Some(pb) = progress {
                    pb.inc(1);
                }
                candidate
            })
            .collect()
    }

    /// Best combination, or `None` when the ledger is too small to judge
    /// or no combination keeps enough trades to clear the sample floor.
    ///
    /// Ties keep the earliest grid point so repeated runs agree.
    pub fn recommend(
        &self,
        records: &[OperationRecord],
        now: DateTime<Utc>,
        progress: Option<&ProgressBar>,
    ) -> Option<Recommendation> {
        if records.len() < self.config.min_samples {
            info!(
                "ℹ️ Not enough closed trades to optimize (need {}, have {})",
                self.config.min_samples,
                records.len()
            );
            return None;
        }

        let scores = self.evaluate_all(records, progress);
        let best = scores.iter().fold(None::<&CandidateScore>, |best, candidate| match best {
            Some(b) if candidate.score <= b.score => Some(b),
            _ => Some(candidate),
        })?;

        if !best.meets_floor() {
            warn!(
                "⚠️ No combination reached the sample floor of {}; keeping current parameters",
                self.config.sample_floor(records.len())
            );
            return None;
        }
        info!(
            "✅ Best parameters: trend {:.0}°, strength {:.0}°, margin {:.4} (score {:.4}, n={})",
            best.trend_threshold_degrees,
            best.min_trend_strength_degrees,
            best.entry_margin,
            best.score,
            best.samples
        );

        Some(Recommendation {
            params: best.to_parameter_set(),
            evaluated_samples: records.len(),
            total_combinations: scores.len(),
            generated_at: now,
        })
    }
}
