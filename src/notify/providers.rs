//! Notification channel providers
//!
//! One provider per delivery medium, behind a common trait. Providers are
//! expected to be idempotent within a retry window; the notification id is
//! handed to every provider as the correlation token.
//!
//! Email and SMS are structured-log deliveries here - the actual gateway
//! integration lives outside the core and tails these events. Slack,
//! generic webhook and Telegram post for real.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tracing::{info, instrument};

use crate::storage::NotificationRow;

#[async_trait]
pub trait NotificationProvider: Send + Sync {
    fn name(&self) -> &'static str;

    /// Deliver one notification over this channel.
    async fn send(&self, notification: &NotificationRow) -> anyhow::Result<()>;
}

pub struct EmailProvider;

#[async_trait]
impl NotificationProvider for EmailProvider {
    fn name(&self) -> &'static str {
        "email"
    }

    async fn send(&self, notification: &NotificationRow) -> anyhow::Result<()> {
        info!(
            notification_id = %notification.id,
            severity = %notification.severity,
            message = %notification.message,
            "sending email notification"
        );
        Ok(())
    }
}

pub struct SmsProvider;

#[async_trait]
impl NotificationProvider for SmsProvider {
    fn name(&self) -> &'static str {
        "sms"
    }

    async fn send(&self, notification: &NotificationRow) -> anyhow::Result<()> {
        info!(
            notification_id = %notification.id,
            severity = %notification.severity,
            message = %notification.message,
            "sending SMS notification"
        );
        Ok(())
    }
}

pub struct WebhookProvider {
    client: reqwest::Client,
    url: String,
}

impl WebhookProvider {
    pub fn new(client: reqwest::Client, url: String) -> Self {
        Self { client, url }
    }
}

#[async_trait]
impl NotificationProvider for WebhookProvider {
    fn name(&self) -> &'static str {
        "webhook"
    }

    #[instrument(skip(self, notification), fields(notification_id = %notification.id))]
    async fn send(&self, notification: &NotificationRow) -> anyhow::Result<()> {
        let payload = json!({
            "notification_id": notification.id,
            "incident_id": notification.incident_id,
            "monitor_id": notification.monitor_id,
            "severity": notification.severity.to_string(),
            "message": notification.message,
            "timestamp": notification.created_at.to_rfc3339(),
        });

        let response = self.client.post(&self.url).json(&payload).send().await?;
        if !response.status().is_success() {
            anyhow::bail!("webhook returned status {}", response.status());
        }
        info!("webhook notification delivered");
        Ok(())
    }
}

pub struct SlackProvider {
    client: reqwest::Client,
    webhook_url: String,
}

impl SlackProvider {
    pub fn new(client: reqwest::Client, webhook_url: String) -> Self {
        Self { client, webhook_url }
    }
}

#[async_trait]
impl NotificationProvider for SlackProvider {
    fn name(&self) -> &'static str {
        "slack"
    }

    #[instrument(skip(self, notification), fields(notification_id = %notification.id))]
    async fn send(&self, notification: &NotificationRow) -> anyhow::Result<()> {
        let payload = json!({
            "text": format!(
                "[{}] {} (notification {})",
                notification.severity, notification.message, notification.id
            ),
        });

        let response = self
            .client
            .post(&self.webhook_url)
            .json(&payload)
            .send()
            .await?;
        if !response.status().is_success() {
            anyhow::bail!("slack webhook returned status {}", response.status());
        }
        info!("slack notification delivered");
        Ok(())
    }
}

pub struct TelegramProvider {
    client: reqwest::Client,
    bot_token: String,
    chat_id: String,
}

impl TelegramProvider {
    pub fn new(client: reqwest::Client, bot_token: String, chat_id: String) -> Self {
        Self {
            client,
            bot_token,
            chat_id,
        }
    }
}

#[async_trait]
impl NotificationProvider for TelegramProvider {
    fn name(&self) -> &'static str {
        "telegram"
    }

    #[instrument(skip(self, notification), fields(notification_id = %notification.id))]
    async fn send(&self, notification: &NotificationRow) -> anyhow::Result<()> {
        let url = format!("https://api.telegram.org/bot{}/sendMessage", self.bot_token);
        let payload = json!({
            "chat_id": self.chat_id,
            "text": format!("[{}] {}", notification.severity, notification.message),
        });

        let response = self.client.post(&url).json(&payload).send().await?;
        if !response.status().is_success() {
            anyhow::bail!("telegram API returned status {}", response.status());
        }
        info!("telegram notification delivered");
        Ok(())
    }
}

/// Build the default provider registry from the environment. Channels
/// without configuration are simply not registered.
///
/// - `PULSEWATCH_WEBHOOK_URL`
/// - `PULSEWATCH_SLACK_WEBHOOK_URL`
/// - `PULSEWATCH_TELEGRAM_BOT_TOKEN` + `PULSEWATCH_TELEGRAM_CHAT_ID`
pub fn default_providers(
    client: &reqwest::Client,
) -> HashMap<String, Arc<dyn NotificationProvider>> {
    let mut providers: HashMap<String, Arc<dyn NotificationProvider>> = HashMap::new();
    providers.insert("email".to_string(), Arc::new(EmailProvider));
    providers.insert("sms".to_string(), Arc::new(SmsProvider));

    if let Ok(url) = std::env::var("PULSEWATCH_WEBHOOK_URL") {
        providers.insert(
            "webhook".to_string(),
            Arc::new(WebhookProvider::new(client.clone(), url)),
        );
    }
    if let Ok(url) = std::env::var("PULSEWATCH_SLACK_WEBHOOK_URL") {
        providers.insert(
            "slack".to_string(),
            Arc::new(SlackProvider::new(client.clone(), url)),
        );
    }
    if let (Ok(token), Ok(chat_id)) = (
        std::env::var("PULSEWATCH_TELEGRAM_BOT_TOKEN"),
        std::env::var("PULSEWATCH_TELEGRAM_CHAT_ID"),
    ) {
        providers.insert(
            "telegram".to_string(),
            Arc::new(TelegramProvider::new(client.clone(), token, chat_id)),
        );
    }

    providers
}
