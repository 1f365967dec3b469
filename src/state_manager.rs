// State Manager for the scan engine
// JSON snapshot with atomic replacement
//
// One document holds the active parameter set, every symbol's detector
// state and the engine counters. Saves go through a temp file plus rename so
// a concurrent reader sees either the old or the new snapshot, never a torn
// one.

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::detector::SymbolState;
use crate::error::ScanError;
use crate::optimizer::ParameterSet;
use crate::Symbol;

pub const STATE_VERSION: u32 = 1;

// =============================================================================
// Data Model
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineState {
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub saved_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub parameters: ParameterSet,
    #[serde(default)]
    pub symbols: BTreeMap<Symbol, SymbolState>,
    #[serde(default)]
    pub trades_since_optimization: u32,
    #[serde(default)]
    pub total_trades: u64,
    #[serde(default)]
    pub last_optimization_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_weekly_report_at: Option<DateTime<Utc>>,
}

fn default_version() -> u32 {
    STATE_VERSION
}

impl Default for EngineState {
    fn default() -> Self {
        Self {
            version: STATE_VERSION,
            saved_at: None,
            parameters: ParameterSet::default(),
            symbols: BTreeMap::new(),
            trades_since_optimization: 0,
            total_trades: 0,
            last_optimization_at: None,
            last_weekly_report_at: None,
        }
    }
}

impl EngineState {
    pub fn symbol_mut(&mut self, symbol: &Symbol) -> &mut SymbolState {
        self.symbols.entry(symbol.clone()).or_default()
    }

    pub fn open_positions(&self) -> usize {
        self.symbols.values().filter(|s| s.position().is_some()).count()
    }

    pub fn pending_breakouts(&self) -> usize {
        self.symbols.values().filter(|s| s.pending().is_some()).count()
    }

    /// Forget cooldown stamps older than `horizon` and empty idle entries
    /// for symbols no longer traded
    pub fn prune(&mut self, now: DateTime<Utc>, horizon: Duration, active: &[Symbol]) {
        for state in self.symbols.values_mut() {
            state.prune_timestamps(now, horizon);
        }
        self.symbols.retain(|symbol, state| {
            active.contains(symbol) || *state != SymbolState::default()
        });
    }
}

// =============================================================================
// Store
// =============================================================================

#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Strict load: `Ok(None)` for a missing file, `StateCorruption` for an
    /// unreadable or invalid one
    pub fn try_load(&self) -> Result<Option<EngineState>, ScanError> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(ScanError::StateCorruption {
                    path: self.path.clone(),
                    message: e.to_string(),
                })
            }
        };

        serde_json::from_str(&contents)
            .map(Some)
            .map_err(|e| ScanError::StateCorruption {
                path: self.path.clone(),
                message: e.to_string(),
            })
    }

    /// Load for startup: any failure falls back to an empty state
    pub fn load_or_default(&self) -> EngineState {
        match self.try_load() {
            Ok(Some(state)) => {
                info!(
                    "✅ State restored from {} ({} symbols, {} open, {} pending)",
                    self.path.display(),
                    state.symbols.len(),
                    state.open_positions(),
                    state.pending_breakouts()
                );
                state
            }
            Ok(None) => {
                info!("No state file at {}, starting fresh", self.path.display());
                EngineState::default()
            }
            Err(e) => {
                warn!("⚠️ {} - starting with empty state", e);
                EngineState::default()
            }
        }
    }

    /// Atomically replace the state file, stamping `saved_at`
    pub fn save(&self, state: &mut EngineState, now: DateTime<Utc>) -> Result<()> {
        state.saved_at = Some(now);
        let json = serde_json::to_vec_pretty(state).context("Failed to serialize state")?;
        write_atomic(&self.path, &json)?;
        debug!("State saved to: {}", self.path.display());
        Ok(())
    }
}

/// Read-only snapshot for observers running next to the engine.
///
/// Missing, partial or invalid files yield `None` instead of an error.
pub fn read_snapshot(path: impl AsRef<Path>) -> Option<EngineState> {
    let contents = fs::read_to_string(path.as_ref()).ok()?;
    serde_json::from_str(&contents).ok()
}

/// Write `bytes` to a sibling temp file, fsync, then rename over `path`
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory {}", parent.display()))?;
        }
    }

    let mut tmp_name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "state".into());
    tmp_name.push(".tmp");
    let tmp_path = path.with_file_name(tmp_name);

    {
        let mut file = fs::File::create(&tmp_path)
            .with_context(|| format!("Failed to create {}", tmp_path.display()))?;
        file.write_all(bytes)
            .with_context(|| format!("Failed to write {}", tmp_path.display()))?;
        file.sync_all()
            .with_context(|| format!("Failed to sync {}", tmp_path.display()))?;
    }

    fs::rename(&tmp_path, path).with_context(|| {
        format!(
            "Failed to move {} into place at {}",
            tmp_path.display(),
            path.display()
        )
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{ChannelDescriptor, TrendDirection};
    use crate::detector::{ActivePosition, PendingBreakout, SymbolPhase};
    use crate::indicators::OscillatorReading;
    use crate::scan_config::ScanConfig;
    use crate::{BreakoutKind, Side};
    use chrono::TimeZone;

    fn populated_state() -> EngineState {
        let t = Utc.with_ymd_and_hms(2024, 7, 1, 9, 30, 15).unwrap();
        let channel = ChannelDescriptor {
            resistance: 61234.56789,
            support: 60001.123,
            resistance_slope: 1.0 / 3.0,
            support_slope: 0.1,
            trend_slope: 0.2,
            trend_angle_degrees: 21.7,
            pearson: 0.83,
            r2: 0.69,
            channel_width: 1233.44489,
            channel_width_percent: 2.03,
            direction: TrendDirection::Up,
            strength_level: 3,
        };

        let mut state = EngineState {
            parameters: ParameterSet {
                trend_threshold_degrees: 12.0,
                min_trend_strength_degrees: 18.0,
                entry_margin: 0.0015,
                score: Some(4.2),
                samples: 33,
            },
            trades_since_optimization: 3,
            total_trades: 41,
            last_optimization_at: Some(t - Duration::hours(5)),
            ..Default::default()
        };

        state.symbols.insert(
            Symbol::new("BTCUSDT"),
            SymbolState {
                phase: SymbolPhase::InPosition(ActivePosition {
                    symbol: Symbol::new("BTCUSDT"),
                    side: Side::Long,
                    entry_price: 60010.5,
                    take_profit: 61243.94489,
                    stop_loss: 58810.29,
                    opened_at: t,
                    channel: channel.clone(),
                    oscillator: OscillatorReading { k: 21.5, d: 24.75 },
                    timeframe: "3m".into(),
                    candles: 150,
                    breakout_preceded: true,
                }),
                last_breakout_at: Some(t - Duration::minutes(12)),
                last_signal_at: Some(t),
                last_closed_at: None,
                scan_config: Some(ScanConfig {
                    timeframe: "3m".into(),
                    candles: 150,
                    width_percent: 4.4,
                    score: 15044.0,
                    evaluated_at: t - Duration::minutes(40),
                }),
            },
        );
        state.symbols.insert(
            Symbol::new("ETHUSDT"),
            SymbolState {
                phase: SymbolPhase::PendingReentry(PendingBreakout {
                    symbol: Symbol::new("ETHUSDT"),
                    kind: BreakoutKind::BreakoutShort,
                    detected_at: t + Duration::milliseconds(250),
                    price_at_breakout: 3456.789,
                }),
                last_breakout_at: Some(t + Duration::milliseconds(250)),
                ..Default::default()
            },
        );
        state.symbols.insert(Symbol::new("SOLUSDT"), SymbolState::default());
        state
    }

    #[test]
    fn test_roundtrip_is_identical() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path().join("state.json"));
        let mut state = populated_state();
        let now = Utc.with_ymd_and_hms(2024, 7, 1, 10, 0, 0).unwrap();

        store.save(&mut state, now).unwrap();
        let loaded = store.try_load().unwrap().unwrap();
        assert_eq!(loaded, state);
        assert_eq!(loaded.saved_at, Some(now));
    }

    #[test]
    fn test_json_uses_iso_timestamps() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path().join("state.json"));
        let mut state = populated_state();
        store
            .save(&mut state, Utc.with_ymd_and_hms(2024, 7, 1, 10, 0, 0).unwrap())
            .unwrap();

        let text = std::fs::read_to_string(store.path()).unwrap();
        assert!(text.contains("\"saved_at\": \"2024-07-01T10:00:00Z\""));
        assert!(text.contains("\"state\": \"PENDING_REENTRY\""));
        assert!(text.contains("\"kind\": \"BREAKOUT_SHORT\""));
    }

    #[test]
    fn test_missing_file_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path().join("nothing.json"));
        assert!(store.try_load().unwrap().is_none());
        assert_eq!(store.load_or_default(), EngineState::default());
    }

    #[test]
    fn test_corrupt_file_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, "{\"symbols\": {\"BTC").unwrap();
        let store = StateStore::new(&path);

        assert!(matches!(
            store.try_load(),
            Err(ScanError::StateCorruption { .. })
        ));
        assert_eq!(store.load_or_default(), EngineState::default());
        assert!(read_snapshot(&path).is_none());
    }

    #[test]
    fn test_partial_document_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, r#"{"total_trades": 7}"#).unwrap();
        let state = StateStore::new(&path).try_load().unwrap().unwrap();
        assert_eq!(state.total_trades, 7);
        assert_eq!(state.parameters, ParameterSet::default());
        assert!(state.symbols.is_empty());
    }

    #[test]
    fn test_save_leaves_no_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path().join("nested").join("state.json"));
        let mut state = EngineState::default();
        store.save(&mut state, Utc::now()).unwrap();
        store.save(&mut state, Utc::now()).unwrap();

        let entries: Vec<_> = std::fs::read_dir(dir.path().join("nested"))
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(entries, vec![std::ffi::OsString::from("state.json")]);
    }

    #[test]
    fn test_prune_drops_stale_entries() {
        let now = Utc.with_ymd_and_hms(2024, 7, 1, 0, 0, 0).unwrap();
        let mut state = EngineState::default();
        state.symbols.insert(
            Symbol::new("OLDUSDT"),
            SymbolState {
                last_signal_at: Some(now - Duration::days(60)),
                ..Default::default()
            },
        );
        state.symbols.insert(Symbol::new("BTCUSDT"), SymbolState::default());

        state.prune(now, Duration::days(30), &[Symbol::new("BTCUSDT")]);
        assert!(state.symbols.contains_key(&Symbol::new("BTCUSDT")));
        assert!(!state.symbols.contains_key(&Symbol::new("OLDUSDT")));
    }
}
