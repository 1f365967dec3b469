//! Notification channel
//!
//! Alerts are best-effort: a failed delivery is logged and the scan goes on.
//! [`TelegramNotifier`] posts to the Bot API; [`LogNotifier`] only writes to
//! the log and is used when no bot is configured.

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::Client;
use serde::Deserialize;
use tracing::{info, warn};

use crate::channel::ChannelDescriptor;
use crate::detector::{ActivePosition, PendingBreakout};
use crate::error::ScanError;
use crate::http::ClientConfig;
use crate::ledger::OperationRecord;
use crate::{BreakoutKind, Side, TradeResult};

pub const TELEGRAM_API_BASE: &str = "https://api.telegram.org";

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send_message(&self, text: &str) -> Result<(), ScanError>;

    async fn send_image(&self, image: Vec<u8>, caption: &str) -> Result<(), ScanError>;
}

/// Send `text`, logging instead of propagating a failure
pub async fn notify(notifier: &dyn Notifier, text: &str) {
    if let Err(e) = notifier.send_message(text).await {
        warn!("📭 notification dropped: {}", e);
    }
}

/// Writes alerts to the log only
#[derive(Debug, Clone, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send_message(&self, text: &str) -> Result<(), ScanError> {
        info!("📨 {}", text.replace('\n', " | "));
        Ok(())
    }

    async fn send_image(&self, image: Vec<u8>, caption: &str) -> Result<(), ScanError> {
        info!("🖼️ image ({} bytes): {}", image.len(), caption);
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct TelegramResponse {
    ok: bool,
    #[serde(default)]
    description: Option<String>,
}

/// Telegram Bot API notifier broadcasting to every configured chat
#[derive(Debug, Clone)]
pub struct TelegramNotifier {
    client: Client,
    base_url: String,
    bot_token: String,
    chat_ids: Vec<String>,
}

fn telegram_error(message: impl Into<String>) -> ScanError {
    ScanError::ExternalService {
        service: "telegram",
        message: message.into(),
    }
}

impl TelegramNotifier {
    pub fn new(
        bot_token: impl Into<String>,
        chat_ids: Vec<String>,
        config: &ClientConfig,
    ) -> Result<Self, ScanError> {
        let client = config
            .build_client()
            .map_err(|e| telegram_error(e.to_string()))?;
        Ok(Self {
            client,
            base_url: TELEGRAM_API_BASE.to_string(),
            bot_token: bot_token.into(),
            chat_ids,
        })
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn chat_ids(&self) -> &[String] {
        &self.chat_ids
    }

    fn method_url(&self, method: &str) -> String {
        format!("{}/bot{}/{}", self.base_url, self.bot_token, method)
    }

    async fn check(response: reqwest::Response) -> Result<(), ScanError> {
        let status = response.status();
        let body: TelegramResponse = response
            .json()
            .await
            .map_err(|e| telegram_error(format!("HTTP {}: {}", status, e)))?;
        if !body.ok {
            return Err(telegram_error(
                body.description.unwrap_or_else(|| format!("HTTP {}", status)),
            ));
        }
        Ok(())
    }

    /// First failure is reported after every chat has been attempted
    fn merge(first_error: &mut Option<ScanError>, result: Result<(), ScanError>, chat_id: &str) {
        if let Err(e) = result {
            warn!("Telegram delivery to {} failed: {}", chat_id, e);
            first_error.get_or_insert(e);
        }
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn send_message(&self, text: &str) -> Result<(), ScanError> {
        let url = self.method_url("sendMessage");
        let mut first_error = None;
        for chat_id in &self.chat_ids {
            let result = match self
                .client
                .post(&url)
                .json(&serde_json::json!({ "chat_id": chat_id, "text": text }))
                .send()
                .await
            {
                Ok(response) => Self::check(response).await,
                Err(e) => Err(telegram_error(e.to_string())),
            };
            Self::merge(&mut first_error, result, chat_id);
        }
        first_error.map_or(Ok(()), Err)
    }

    async fn send_image(&self, image: Vec<u8>, caption: &str) -> Result<(), ScanError> {
        let url = self.method_url("sendPhoto");
        let mut first_error = None;
        for chat_id in &self.chat_ids {
            let photo = Part::bytes(image.clone())
                .file_name("chart.png")
                .mime_str("image/png")
                .map_err(|e| telegram_error(e.to_string()))?;
            let form = Form::new()
                .text("chat_id", chat_id.clone())
                .text("caption", caption.to_string())
                .part("photo", photo);
            let result = match self.client.post(&url).multipart(form).send().await {
                Ok(response) => Self::check(response).await,
                Err(e) => Err(telegram_error(e.to_string())),
            };
            Self::merge(&mut first_error, result, chat_id);
        }
        first_error.map_or(Ok(()), Err)
    }
}

// =============================================================================
// Message rendering
// =============================================================================

fn side_marker(side: Side) -> &'static str {
    match side {
        Side::Long => "🟢",
        Side::Short => "🔴",
    }
}

fn channel_lines(channel: &ChannelDescriptor) -> String {
    format!(
        "📐 Angle: {:.1}° ({:?}, strength {})\n📊 Pearson: {:.3} | R²: {:.3}\n↔️ Width: {:.2}%\n",
        channel.trend_angle_degrees,
        channel.direction,
        channel.strength_level,
        channel.pearson,
        channel.r2,
        channel.channel_width_percent
    )
}

pub fn breakout_message(breakout: &PendingBreakout, channel: &ChannelDescriptor) -> String {
    let (title, waiting_for) = match breakout.kind {
        BreakoutKind::BreakoutLong => ("🚧 BREAKOUT LONG", "reentry above support"),
        BreakoutKind::BreakoutShort => ("🚧 BREAKOUT SHORT", "reentry below resistance"),
    };
    format!(
        "{}\n💱 {}\n💰 Price: {:.8}\n🔺 Resistance: {:.8}\n🔻 Support: {:.8}\n{}⏳ Waiting for {}",
        title,
        breakout.symbol,
        breakout.price_at_breakout,
        channel.resistance,
        channel.support,
        channel_lines(channel),
        waiting_for
    )
}

pub fn signal_message(position: &ActivePosition) -> String {
    let levels = position.levels();
    format!(
        "{} SIGNAL {} {}\n⏱️ {} / {} candles\n💰 Entry: {:.8}\n🎯 TP: {:.8}\n🛑 SL: {:.8}\n⚖️ R:R {:.2}{}\n{}📈 Stoch %K {:.1} / %D {:.1}",
        side_marker(position.side),
        position.side,
        position.symbol,
        position.timeframe,
        position.candles,
        position.entry_price,
        position.take_profit,
        position.stop_loss,
        levels.rr_ratio(),
        if levels.adjusted { " (adjusted)" } else { "" },
        channel_lines(&position.channel),
        position.oscillator.k,
        position.oscillator.d
    )
}

pub fn close_message(record: &OperationRecord) -> String {
    let outcome = match record.result {
        TradeResult::TakeProfit => "🎯 TAKE PROFIT",
        TradeResult::StopLoss => "🛑 STOP LOSS",
    };
    format!(
        "{} {} {}\n💰 Entry: {:.8}\n🏁 Exit: {:.8}\n📊 PnL: {:+.2}%\n⏱️ Duration: {:.0} min",
        outcome,
        record.side,
        record.symbol,
        record.entry_price,
        record.exit_price,
        record.pnl_percent,
        record.duration_minutes
    )
}

pub fn critical_message(error: &ScanError) -> String {
    format!("🚨 {}\nManual intervention required.", error)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::TrendDirection;
    use crate::indicators::OscillatorReading;
    use crate::ledger::tests::sample_record;
    use crate::Symbol;
    use chrono::{TimeZone, Utc};
    use std::sync::Mutex;

    struct FailingNotifier(Mutex<u32>);

    #[async_trait]
    impl Notifier for FailingNotifier {
        async fn send_message(&self, _: &str) -> Result<(), ScanError> {
            *self.0.lock().unwrap() += 1;
            Err(telegram_error("chat not found"))
        }

        async fn send_image(&self, _: Vec<u8>, _: &str) -> Result<(), ScanError> {
            Err(telegram_error("chat not found"))
        }
    }

    fn channel() -> ChannelDescriptor {
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
            channel_width_percent: 4.88,
            direction: TrendDirection::Up,
            strength_level: 4,
        }
    }

    #[tokio::test]
    async fn test_notify_swallows_failures() {
        let notifier = FailingNotifier(Mutex::new(0));
        notify(&notifier, "hello").await;
        assert_eq!(*notifier.0.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_log_notifier_accepts_everything() {
        assert!(LogNotifier.send_message("a\nb").await.is_ok());
        assert!(LogNotifier.send_image(vec![1, 2, 3], "chart").await.is_ok());
    }

    #[tokio::test]
    async fn test_telegram_unreachable_is_external_error() {
        let notifier = TelegramNotifier::new(
            "token",
            vec!["1".into(), "2".into()],
            &ClientConfig::default().with_timeout(std::time::Duration::from_millis(200)),
        )
        .unwrap()
        .with_base_url("http://127.0.0.1:9");
        let err = notifier.send_message("hi").await.unwrap_err();
        assert!(matches!(err, ScanError::ExternalService { service: "telegram", .. }));
    }

    #[test]
    fn test_method_url() {
        let notifier = TelegramNotifier::new("abc", vec![], &ClientConfig::default()).unwrap();
        assert_eq!(
            notifier.method_url("sendMessage"),
            "https://api.telegram.org/botabc/sendMessage"
        );
    }

    #[test]
    fn test_breakout_message() {
        let breakout = PendingBreakout {
            symbol: Symbol::new("BTCUSDT"),
            kind: BreakoutKind::BreakoutLong,
            detected_at: Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap(),
            price_at_breakout: 99.0,
        };
        let text = breakout_message(&breakout, &channel());
        assert!(text.starts_with("🚧 BREAKOUT LONG"));
        assert!(text.contains("BTCUSDT"));
        assert!(text.contains("reentry above support"));
    }

    #[test]
    fn test_signal_message() {
        let position = ActivePosition {
            symbol: Symbol::new("ETHUSDT"),
            side: Side::Long,
            entry_price: 100.5,
            take_profit: 105.5,
            stop_loss: 98.49,
            opened_at: Utc.with_ymd_and_hms(2024, 3, 1, 12, 5, 0).unwrap(),
            channel: channel(),
            oscillator: OscillatorReading { k: 18.0, d: 21.0 },
            timeframe: "5m".into(),
            candles: 100,
            breakout_preceded: true,
        };
        let text = signal_message(&position);
        assert!(text.contains("SIGNAL LONG ETHUSDT"));
        assert!(text.contains("TP: 105.50000000"));
        assert!(text.contains("%K 18.0"));
    }

    #[test]
    fn test_close_and_critical_messages() {
        let at = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let text = close_message(&sample_record("BTCUSDT", -2.0, at));
        assert!(text.starts_with("🛑 STOP LOSS"));
        assert!(text.contains("-2.00%"));

        let critical = critical_message(&ScanError::CriticalUnprotectedPosition {
            symbol: Symbol::new("BTCUSDT"),
            side: Side::Long,
            message: "stop rejected".into(),
        });
        assert!(critical.contains("CRITICAL"));
    }
}
