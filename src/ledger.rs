//! Operation ledger
//!
//! Append-only CSV of closed trades. Each row carries the trade outcome plus
//! the channel and oscillator features that were active at entry, which makes
//! the file the training corpus for the parameter optimizer. Rows are only
//! ever appended; the file is never rewritten.

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::detector::ActivePosition;
use crate::{Side, Symbol, TradeResult};

/// One closed trade
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationRecord {
    pub timestamp: DateTime<Utc>,
    pub symbol: Symbol,
    pub side: Side,
    pub entry_price: f64,
    pub take_profit: f64,
    pub stop_loss: f64,
    pub exit_price: f64,
    pub result: TradeResult,
    pub pnl_percent: f64,
    pub duration_minutes: f64,
    pub trend_angle_degrees: f64,
    pub pearson: f64,
    pub r2: f64,
    /// Channel width as a fraction of the entry price
    pub channel_width_relative: f64,
    pub channel_width_percent: f64,
    pub strength_level: u8,
    pub timeframe: String,
    pub candles: usize,
    pub stoch_k: f64,
    pub stoch_d: f64,
    pub breakout_preceded: bool,
}

impl OperationRecord {
    /// Build the ledger row for `position` closed at `exit_price`
    pub fn close(
        position: &ActivePosition,
        exit_price: f64,
        result: TradeResult,
        closed_at: DateTime<Utc>,
    ) -> Self {
        let channel = &position.channel;
        Self {
            timestamp: closed_at,
            symbol: position.symbol.clone(),
            side: position.side,
            entry_price: position.entry_price,
            take_profit: position.take_profit,
            stop_loss: position.stop_loss,
            exit_price,
            result,
            pnl_percent: position.pnl_percent(exit_price),
            duration_minutes: (closed_at - position.opened_at).num_seconds() as f64 / 60.0,
            trend_angle_degrees: channel.trend_angle_degrees,
            pearson: channel.pearson,
            r2: channel.r2,
            channel_width_relative: channel.channel_width / position.entry_price,
            channel_width_percent: channel.channel_width_percent,
            strength_level: channel.strength_level,
            timeframe: position.timeframe.clone(),
            candles: position.candles,
            stoch_k: position.oscillator.k,
            stoch_d: position.oscillator.d,
            breakout_preceded: position.breakout_preceded,
        }
    }

    pub fn is_win(&self) -> bool {
        self.result == TradeResult::TakeProfit
    }
}

/// CSV-backed append-only ledger
#[derive(Debug, Clone)]
pub struct OperationLedger {
    path: PathBuf,
}

impl OperationLedger {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one row, writing the header first when the file is new
    pub fn append(&self, record: &OperationRecord) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create ledger directory {}", parent.display())
                })?;
            }
        }

        let needs_header = fs::metadata(&self.path)
            .map(|m| m.len() == 0)
            .unwrap_or(true);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("Failed to open ledger {}", self.path.display()))?;

        let mut writer = csv::WriterBuilder::new()
            .has_headers(needs_header)
            .from_writer(file);
        writer
            .serialize(record)
            .context("Failed to serialize ledger row")?;
        writer.flush().context("Failed to flush ledger")?;
        Ok(())
    }

    /// All readable rows; a missing file is an empty ledger.
    ///
    /// Malformed rows are skipped with a warning so one bad line cannot
    /// starve the optimizer.
    pub fn load(&self) -> Result<Vec<OperationRecord>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }

        let mut reader = csv::Reader::from_path(&self.path)
            .with_context(|| format!("Failed to open ledger {}", self.path.display()))?;

        let mut records = Vec::new();
        for (line, row) in reader.deserialize::<OperationRecord>().enumerate() {
            match row {
                Ok(record) => records.push(record),
                Err(e) => warn!("Skipping ledger row {}: {}", line + 2, e),
            }
        }
        Ok(records)
    }

    /// Rows closed within `window` of `now`
    pub fn load_since(&self, now: DateTime<Utc>, window: Duration) -> Result<Vec<OperationRecord>> {
        let cutoff = now - window;
        Ok(self
            .load()?
            .into_iter()
            .filter(|r| r.timestamp >= cutoff)
            .collect())
    }
}

// =============================================================================
// Weekly report
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WeeklySummary {
    pub total: usize,
    pub wins: usize,
    pub losses: usize,
    pub win_rate: f64,
    pub total_pnl_percent: f64,
    pub average_gain_percent: f64,
    pub average_loss_percent: f64,
    pub best: Option<(Symbol, Side, f64)>,
    pub worst: Option<(Symbol, Side, f64)>,
    /// Consecutive take-profits counting back from the latest trade
    pub current_streak: usize,
}

impl WeeklySummary {
    /// Summarize trades in ledger order; `None` for an empty slice
    pub fn from_records(records: &[OperationRecord]) -> Option<Self> {
        if records.is_empty() {
            return None;
        }

        let total = records.len();
        let wins = records.iter().filter(|r| r.is_win()).count();
        let losses = records
            .iter()
            .filter(|r| r.result == TradeResult::StopLoss)
            .count();
        let gains: Vec<f64> = records
            .iter()
            .map(|r| r.pnl_percent)
            .filter(|p| *p > 0.0)
            .collect();
        let losses_abs: Vec<f64> = records
            .iter()
            .map(|r| r.pnl_percent)
            .filter(|p| *p < 0.0)
            .map(f64::abs)
            .collect();

        let average = |values: &[f64]| {
            if values.is_empty() {
                0.0
            } else {
                values.iter().sum::<f64>() / values.len() as f64
            }
        };

        let by_pnl = |a: &&OperationRecord, b: &&OperationRecord| a.pnl_percent.total_cmp(&b.pnl_percent);
        let summarize = |r: &OperationRecord| (r.symbol.clone(), r.side, r.pnl_percent);

        Some(Self {
            total,
            wins,
            losses,
            win_rate: wins as f64 / total as f64 * 100.0,
            total_pnl_percent: records.iter().map(|r| r.pnl_percent).sum(),
            average_gain_percent: average(&gains),
            average_loss_percent: average(&losses_abs),
            best: records.iter().max_by(by_pnl).map(summarize),
            worst: records.iter().min_by(by_pnl).map(summarize),
            current_streak: records.iter().rev().take_while(|r| r.is_win()).count(),
        })
    }

    /// Plain-text report for the notification channel
    pub fn render(&self, now: DateTime<Utc>) -> String {
        let marker = if self.total_pnl_percent > 0.0 {
            "🟢"
        } else if self.total_pnl_percent < 0.0 {
            "🔴"
        } else {
            "⚪"
        };
        let mut out = String::new();
        out.push_str("📊 WEEKLY REPORT\n");
        out.push_str(&format!("📅 {} | last 7 days\n\n", now.format("%d/%m/%Y")));
        out.push_str(&format!("{} Total PnL: {:+.2}%\n", marker, self.total_pnl_percent));
        out.push_str(&format!("📈 Win rate: {:.1}%\n", self.win_rate));
        out.push_str(&format!("✅ Wins: {} | ❌ Losses: {}\n\n", self.wins, self.losses));
        out.push_str(&format!("📊 Trades: {}\n", self.total));
        out.push_str(&format!("💰 Average gain: +{:.2}%\n", self.average_gain_percent));
        out.push_str(&format!("📉 Average loss: -{:.2}%\n", self.average_loss_percent));
        out.push_str(&format!("🔥 Current streak: {} wins\n", self.current_streak));
        if let Some((symbol, side, pnl)) = &self.best {
            out.push_str(&format!("\n🏆 Best: {} ({}) {:+.2}%\n", symbol, side, pnl));
        }
        if let Some((symbol, side, pnl)) = &self.worst {
            out.push_str(&format!("⚠️ Worst: {} ({}) {:+.2}%\n", symbol, side, pnl));
        }
        out
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::TimeZone;

    pub(crate) fn sample_record(symbol: &str, pnl: f64, at: DateTime<Utc>) -> OperationRecord {
        OperationRecord {
            timestamp: at,
            symbol: Symbol::new(symbol),
            side: Side::Long,
            entry_price: 100.0,
            take_profit: 105.0,
            stop_loss: 98.0,
            exit_price: 100.0 + pnl,
            result: if pnl > 0.0 {
                TradeResult::TakeProfit
            } else {
                TradeResult::StopLoss
            },
            pnl_percent: pnl,
            duration_minutes: 30.0,
            trend_angle_degrees: 25.0,
            pearson: 0.8,
            r2: 0.7,
            channel_width_relative: 0.05,
            channel_width_percent: 5.0,
            strength_level: 3,
            timeframe: "5m".into(),
            candles: 100,
            stoch_k: 20.0,
            stoch_d: 22.0,
            breakout_preceded: true,
        }
    }

    #[test]
    fn test_append_writes_single_header() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = OperationLedger::new(dir.path().join("ops.csv"));
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap();

        ledger.append(&sample_record("BTCUSDT", 2.0, now)).unwrap();
        ledger.append(&sample_record("ETHUSDT", -1.5, now)).unwrap();

        let text = std::fs::read_to_string(ledger.path()).unwrap();
        assert_eq!(text.lines().count(), 3);
        assert!(text.starts_with("timestamp,symbol,side,entry_price"));
        assert_eq!(text.matches("timestamp").count(), 1);

        let loaded = ledger.load().unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0], sample_record("BTCUSDT", 2.0, now));
        assert_eq!(loaded[1].result, TradeResult::StopLoss);
    }

    #[test]
    fn test_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = OperationLedger::new(dir.path().join("absent.csv"));
        assert!(ledger.load().unwrap().is_empty());
    }

    #[test]
    fn test_malformed_rows_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = OperationLedger::new(dir.path().join("ops.csv"));
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap();
        ledger.append(&sample_record("BTCUSDT", 2.0, now)).unwrap();

        let mut text = std::fs::read_to_string(ledger.path()).unwrap();
        text.push_str("garbage,row\n");
        std::fs::write(ledger.path(), text).unwrap();

        assert_eq!(ledger.load().unwrap().len(), 1);
    }

    #[test]
    fn test_weekly_summary() {
        let now = Utc.with_ymd_and_hms(2024, 5, 8, 0, 0, 0).unwrap();
        let records = vec![
            sample_record("BTCUSDT", -2.0, now),
            sample_record("ETHUSDT", 3.0, now),
            sample_record("SOLUSDT", 5.0, now),
        ];
        let summary = WeeklySummary::from_records(&records).unwrap();
        assert_eq!(summary.total, 3);
        assert_eq!(summary.wins, 2);
        assert_eq!(summary.losses, 1);
        assert_eq!(summary.current_streak, 2);
        assert!((summary.total_pnl_percent - 6.0).abs() < 1e-9);
        assert!((summary.average_gain_percent - 4.0).abs() < 1e-9);
        assert!((summary.average_loss_percent - 2.0).abs() < 1e-9);
        assert_eq!(summary.best.as_ref().unwrap().0, Symbol::new("SOLUSDT"));
        assert_eq!(summary.worst.as_ref().unwrap().0, Symbol::new("BTCUSDT"));
        assert!(summary.render(now).contains("Win rate: 66.7%"));

        assert!(WeeklySummary::from_records(&[]).is_none());
    }

    #[test]
    fn test_load_since_filters_window() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = OperationLedger::new(dir.path().join("ops.csv"));
        let now = Utc.with_ymd_and_hms(2024, 5, 15, 0, 0, 0).unwrap();
        ledger
            .append(&sample_record("OLD", 1.0, now - Duration::days(10)))
            .unwrap();
        ledger
            .append(&sample_record("NEW", 1.0, now - Duration::days(2)))
            .unwrap();
        let recent = ledger.load_since(now, Duration::days(7)).unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].symbol, Symbol::new("NEW"));
    }
}
