//! Run notifications
//!
//! Every notification is logged. Discord and Telegram deliveries happen when
//! configured; a failed delivery is logged and never fails the run.

use async_trait::async_trait;
use exchange_gateway::{Exchange, PositionSide};
use reqwest::Client;
use rust_decimal::Decimal;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::signal::{SignalAction, TradeSignal};

pub const TELEGRAM_API_BASE: &str = "https://api.telegram.org";

#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    /// Actionable signal from an analysis-only bot
    Signal {
        bot_name: String,
        subscription_id: Uuid,
        signal: TradeSignal,
    },
    TradeOpened {
        bot_name: String,
        subscription_id: Uuid,
        exchange: Exchange,
        symbol: String,
        side: PositionSide,
        quantity: Decimal,
        entry_price: Decimal,
        stop_loss: Decimal,
        take_profit: Decimal,
    },
    TradeFailed {
        bot_name: String,
        subscription_id: Uuid,
        symbol: String,
        error: String,
    },
    TradeClosed {
        bot_name: String,
        subscription_id: Uuid,
        symbol: String,
        exit_price: Decimal,
        realized_pnl: Decimal,
    },
}

impl Notification {
    pub fn kind(&self) -> &'static str {
        match self {
            Notification::Signal { .. } => "signal",
            Notification::TradeOpened { .. } => "trade_opened",
            Notification::TradeFailed { .. } => "trade_failed",
            Notification::TradeClosed { .. } => "trade_closed",
        }
    }

    pub fn subscription_id(&self) -> Uuid {
        match self {
            Notification::Signal { subscription_id, .. }
            | Notification::TradeOpened { subscription_id, .. }
            | Notification::TradeFailed { subscription_id, .. }
            | Notification::TradeClosed { subscription_id, .. } => *subscription_id,
        }
    }

    /// Title, body and Discord embed color
    pub fn render(&self) -> (String, String, u32) {
        match self {
            Notification::Signal {
                bot_name, signal, ..
            } => {
                let color = match signal.action {
                    SignalAction::Buy => 0x2ecc71,
                    SignalAction::Sell => 0xe74c3c,
                    SignalAction::Hold => 0x95a5a6,
                };
                let mut body = format!(
                    "**{}** {} at {} (confidence {:.0}%)\n{}",
                    signal.action.as_str(),
                    signal.symbol,
                    signal.price,
                    signal.confidence * 100.0,
                    signal.reasoning
                );
                if let Some(sl) = signal.stop_loss {
                    body.push_str(&format!("\nStop loss: {}", sl));
                }
                if let Some(tp) = signal.take_profit {
                    body.push_str(&format!("\nTake profit: {}", tp));
                }
                (format!("Signal [{}]", bot_name), body, color)
            }
            Notification::TradeOpened {
                bot_name,
                exchange,
                symbol,
                side,
                quantity,
                entry_price,
                stop_loss,
                take_profit,
                ..
            } => (
                format!("Position opened [{}]", bot_name),
                format!(
                    "{:?} {} {} on {} at {}\nSL {} / TP {}",
                    side, quantity, symbol, exchange, entry_price, stop_loss, take_profit
                ),
                0x3498db,
            ),
            Notification::TradeFailed {
                bot_name,
                symbol,
                error,
                ..
            } => (
                format!("Trade failed [{}]", bot_name),
                format!("{}: {}", symbol, error),
                0xf39c12,
            ),
            Notification::TradeClosed {
                bot_name,
                symbol,
                exit_price,
                realized_pnl,
                ..
            } => (
                format!("Position closed [{}]", bot_name),
                format!("{} closed at {}, PnL **{}** USDT", symbol, exit_price, realized_pnl),
                if realized_pnl.is_sign_negative() { 0xe74c3c } else { 0x2ecc71 },
            ),
        }
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notification: &Notification);
}

fn log_notification(notification: &Notification) {
    let (title, body, _) = notification.render();
    info!(
        subscription_id = %notification.subscription_id(),
        kind = notification.kind(),
        title = %title,
        "{}",
        body
    );
}

/// Log only
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, notification: &Notification) {
        log_notification(notification);
    }
}

#[derive(Debug, Clone, Default)]
pub struct NotifierConfig {
    pub discord_webhook_url: Option<String>,
    pub telegram_bot_token: Option<String>,
    pub telegram_chat_id: Option<String>,
    pub telegram_api_base: Option<String>,
}

impl NotifierConfig {
    pub fn is_empty(&self) -> bool {
        self.discord_webhook_url.is_none()
            && (self.telegram_bot_token.is_none() || self.telegram_chat_id.is_none())
    }
}

/// Discord embeds and Telegram messages
pub struct WebhookNotifier {
    config: NotifierConfig,
    client: Client,
}

impl WebhookNotifier {
    pub fn new(config: NotifierConfig) -> anyhow::Result<Self> {
        let client = Client::builder().timeout(Duration::from_secs(10)).build()?;
        Ok(Self { config, client })
    }

    async fn send_discord(&self, url: &str, notification: &Notification) -> anyhow::Result<()> {
        let (title, description, color) = notification.render();
        let payload = json!({
            "embeds": [{
                "title": title,
                "description": description,
                "color": color,
                "timestamp": chrono::Utc::now().to_rfc3339(),
                "footer": { "text": format!("subscription {}", notification.subscription_id()) }
            }]
        });

        let response = self.client.post(url).json(&payload).send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow::anyhow!("Discord webhook failed: {} - {}", status, body));
        }
        debug!("Discord notification sent");
        Ok(())
    }

    async fn send_telegram(
        &self,
        token: &str,
        chat_id: &str,
        notification: &Notification,
    ) -> anyhow::Result<()> {
        let (title, body, _) = notification.render();
        let base = self
            .config
            .telegram_api_base
            .as_deref()
            .unwrap_or(TELEGRAM_API_BASE)
            .trim_end_matches('/');
        let payload = json!({
            "chat_id": chat_id,
            "text": format!("*{}*\n{}", title, body),
            "parse_mode": "Markdown",
            "disable_web_page_preview": true,
        });

        let response = self
            .client
            .post(format!("{}/bot{}/sendMessage", base, token))
            .json(&payload)
            .send()
            .await?;
        if !response.status().is_success() {
            // The URL carries the token, so only the status is reported
            return Err(anyhow::anyhow!("Telegram sendMessage failed: {}", response.status()));
        }
        debug!("Telegram notification sent");
        Ok(())
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, notification: &Notification) {
        log_notification(notification);

        if let Some(url) = &self.config.discord_webhook_url {
            if let Err(e) = self.send_discord(url, notification).await {
                error!("Failed to send Discord notification: {}", e);
            }
        }
        if let (Some(token), Some(chat_id)) = (
            &self.config.telegram_bot_token,
            &self.config.telegram_chat_id,
        ) {
            if let Err(e) = self.send_telegram(token, chat_id, notification).await {
                error!("Failed to send Telegram notification: {}", e);
            }
        }
    }
}

/// Keeps everything it is sent
#[derive(Clone, Default)]
pub struct MemoryNotifier {
    sent: Arc<Mutex<Vec<Notification>>>,
}

impl MemoryNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn sent(&self) -> Vec<Notification> {
        self.sent.lock().await.clone()
    }
}

#[async_trait]
impl Notifier for MemoryNotifier {
    async fn notify(&self, notification: &Notification) {
        self.sent.lock().await.push(notification.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::SignalSource;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn signal_notification() -> Notification {
        Notification::Signal {
            bot_name: "Momentum".to_string(),
            subscription_id: Uuid::nil(),
            signal: TradeSignal {
                symbol: "BTCUSDT".to_string(),
                action: SignalAction::Buy,
                confidence: 0.8,
                reasoning: "trend".to_string(),
                price: Decimal::from(50_000),
                stop_loss: Some(Decimal::from(49_000)),
                take_profit: None,
                source: SignalSource::Llm,
                generated_at: chrono::Utc::now(),
            },
        }
    }

    #[test]
    fn test_render_signal() {
        let (title, body, color) = signal_notification().render();
        assert_eq!(title, "Signal [Momentum]");
        assert!(body.contains("**BUY** BTCUSDT at 50000 (confidence 80%)"));
        assert!(body.contains("Stop loss: 49000"));
        assert!(!body.contains("Take profit"));
        assert_eq!(color, 0x2ecc71);
    }

    #[tokio::test]
    async fn test_delivers_to_discord_and_telegram() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/discord"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/bottoken123/sendMessage"))
            .and(body_partial_json(json!({ "chat_id": "42" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "ok": true })))
            .expect(1)
            .mount(&server)
            .await;

        let notifier = WebhookNotifier::new(NotifierConfig {
            discord_webhook_url: Some(format!("{}/discord", server.uri())),
            telegram_bot_token: Some("token123".to_string()),
            telegram_chat_id: Some("42".to_string()),
            telegram_api_base: Some(server.uri()),
        })
        .unwrap();

        notifier.notify(&signal_notification()).await;
    }

    #[tokio::test]
    async fn test_delivery_failure_is_swallowed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let notifier = WebhookNotifier::new(NotifierConfig {
            discord_webhook_url: Some(format!("{}/discord", server.uri())),
            ..Default::default()
        })
        .unwrap();
        // Must not panic or propagate
        notifier.notify(&signal_notification()).await;
    }

    #[test]
    fn test_config_is_empty() {
        assert!(NotifierConfig::default().is_empty());
        let telegram_without_chat = NotifierConfig {
            telegram_bot_token: Some("t".to_string()),
            ..Default::default()
        };
        assert!(telegram_without_chat.is_empty());
    }
}
