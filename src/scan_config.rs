//! Per-symbol scan configuration search
//!
//! Picks the (timeframe, candle count) pair whose channel is of acceptable
//! quality and ranks best by `priority(timeframe) * 100 + width% * 10`.
//! The first pass also demands the minimum channel width; if nothing
//! qualifies a second pass drops that requirement. Results are cached on the
//! symbol state and re-evaluated once they go stale.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, info};

use crate::channel::{self, ChannelDescriptor};
use crate::detector::DetectorConfig;
use crate::market_data::MarketDataProvider;
use crate::Symbol;

/// Priority used for timeframes missing from the priority table
const DEFAULT_PRIORITY: f64 = 50.0;

/// Best known analysis window for a symbol
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanConfig {
    pub timeframe: String,
    pub candles: usize,
    pub width_percent: f64,
    pub score: f64,
    pub evaluated_at: DateTime<Utc>,
}

impl ScanConfig {
    pub fn is_fresh(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        now - self.evaluated_at < ttl
    }
}

/// One evaluated (timeframe, candles) combination
#[derive(Debug, Clone)]
pub struct Candidate {
    pub timeframe: String,
    pub candles: usize,
    pub channel: ChannelDescriptor,
}

#[derive(Debug, Clone)]
pub struct ScanConfigSearch {
    timeframes: Vec<String>,
    candle_options: Vec<usize>,
    priority: HashMap<String, f64>,
    gate: DetectorConfig,
}

impl ScanConfigSearch {
    pub fn new(
        timeframes: Vec<String>,
        candle_options: Vec<usize>,
        priority: HashMap<String, f64>,
        gate: DetectorConfig,
    ) -> Self {
        Self {
            timeframes,
            candle_options,
            priority,
            gate,
        }
    }

    fn passes(&self, channel: &ChannelDescriptor, require_width: bool) -> bool {
        channel.strength_level >= self.gate.min_strength_level
            && channel.pearson.abs() >= self.gate.min_pearson
            && channel.r2 >= self.gate.min_r2
            && (!require_width || channel.channel_width_percent >= self.gate.min_channel_width_percent)
    }

    pub fn score(&self, timeframe: &str, width_percent: f64) -> f64 {
        let priority = self.priority.get(timeframe).copied().unwrap_or(DEFAULT_PRIORITY);
        priority * 100.0 + width_percent * 10.0
    }

    /// Rank candidates; earlier candidates win ties
    pub fn select(&self, candidates: &[Candidate], now: DateTime<Utc>) -> Option<ScanConfig> {
        for require_width in [true, false] {
            let mut best: Option<ScanConfig> = None;
            for candidate in candidates {
                if !self.passes(&candidate.channel, require_width) {
                    continue;
                }
                let width = candidate.channel.channel_width_percent;
                let score = self.score(&candidate.timeframe, width);
                if best.as_ref().map_or(true, |b| score > b.score) {
                    best = Some(ScanConfig {
                        timeframe: candidate.timeframe.clone(),
                        candles: candidate.candles,
                        width_percent: width,
                        score,
                        evaluated_at: now,
                    });
                }
            }
            if best.is_some() {
                return best;
            }
            debug!("No candidate met the width requirement, relaxing");
        }
        None
    }

    /// Evaluate every timeframe and candle count for `symbol`.
    ///
    /// Each timeframe is fetched once at the largest candle count and the
    /// smaller windows are taken from its tail. Timeframes whose data is
    /// unavailable are skipped.
    pub async fn search(
        &self,
        provider: &dyn MarketDataProvider,
        symbol: &Symbol,
        now: DateTime<Utc>,
    ) -> Option<ScanConfig> {
        let max_candles = self.candle_options.iter().copied().max()?;
        let mut candidates = Vec::new();

        for timeframe in &self.timeframes {
            let candles = match provider.fetch_ohlc(symbol, timeframe, max_candles).await {
                Ok(candles) => candles,
                Err(e) => {
                    debug!("{} {} - skipped in config search: {}", symbol, timeframe, e);
                    continue;
                }
            };
            for &count in &self.candle_options {
                if let Ok(channel) = channel::analyze(&candles, count) {
                    candidates.push(Candidate {
                        timeframe: timeframe.clone(),
                        candles: count,
                        channel,
                    });
                }
            }
        }

        let selected = self.select(&candidates, now);
        match &selected {
            Some(config) => info!(
                "✅ {} - scan config {} / {} candles (width {:.1}%)",
                symbol, config.timeframe, config.candles, config.width_percent
            ),
            None => info!("❌ {} - no valid scan configuration", symbol),
        }
        selected
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::TrendDirection;
    use chrono::TimeZone;

    fn search() -> ScanConfigSearch {
        let priority = [("1m", 200.0), ("3m", 150.0), ("5m", 120.0), ("15m", 100.0), ("30m", 80.0)]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();
        ScanConfigSearch::new(
            vec!["1m".into(), "5m".into(), "15m".into()],
            vec![80, 100],
            priority,
            DetectorConfig::default(),
        )
    }

    fn candidate(timeframe: &str, candles: usize, width: f64, r2: f64) -> Candidate {
        Candidate {
            timeframe: timeframe.into(),
            candles,
            channel: ChannelDescriptor {
                resistance: 105.0,
                support: 100.0,
                resistance_slope: 0.1,
                support_slope: 0.1,
                trend_slope: 0.1,
                trend_angle_degrees: 20.0,
                pearson: 0.8,
                r2,
                channel_width: 5.0,
                channel_width_percent: width,
                direction: TrendDirection::Up,
                strength_level: 3,
            },
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    #[test]
    fn test_priority_dominates_width() {
        let s = search();
        let picked = s
            .select(
                &[candidate("15m", 80, 9.0, 0.7), candidate("1m", 100, 4.5, 0.7)],
                now(),
            )
            .unwrap();
        assert_eq!(picked.timeframe, "1m");
        assert_eq!(picked.candles, 100);
        assert!((picked.score - (200.0 * 100.0 + 45.0)).abs() < 1e-9);
    }

    #[test]
    fn test_quality_gate_excludes_candidates() {
        let s = search();
        let picked = s
            .select(
                &[candidate("1m", 80, 6.0, 0.2), candidate("5m", 80, 6.0, 0.6)],
                now(),
            )
            .unwrap();
        assert_eq!(picked.timeframe, "5m");
    }

    #[test]
    fn test_second_pass_relaxes_width() {
        let s = search();
        let picked = s
            .select(
                &[candidate("5m", 80, 2.0, 0.6), candidate("15m", 100, 3.0, 0.6)],
                now(),
            )
            .unwrap();
        assert_eq!(picked.timeframe, "5m");
        assert!(s.select(&[candidate("5m", 80, 2.0, 0.1)], now()).is_none());
    }

    #[test]
    fn test_freshness() {
        let config = ScanConfig {
            timeframe: "5m".into(),
            candles: 100,
            width_percent: 5.0,
            score: 12050.0,
            evaluated_at: now(),
        };
        assert!(config.is_fresh(now() + Duration::minutes(119), Duration::hours(2)));
        assert!(!config.is_fresh(now() + Duration::minutes(121), Duration::hours(2)));
    }
}
