//! Session notifications. Delivery is best effort: failures are logged and
//! never reach the trading loop.

use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;
use tracing::{debug, info, warn};

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, title: &str, message: &str);
}

/// Writes notifications to the log only
#[derive(Debug, Default, Clone)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, title: &str, message: &str) {
        info!("[notify] {}: {}", title, message.replace('\n', " | "));
    }
}

/// Posts rich-text messages to a chat webhook (Feishu/Lark "post" format)
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    client: Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>) -> anyhow::Result<Self> {
        let client = Client::builder().timeout(Duration::from_secs(5)).build()?;
        Ok(WebhookNotifier {
            client,
            url: url.into(),
        })
    }

    pub fn payload(title: &str, message: &str) -> serde_json::Value {
        serde_json::json!({
            "msg_type": "post",
            "content": {
                "post": {
                    "en_us": {
                        "title": title,
                        "content": [[{ "tag": "text", "text": message }]]
                    }
                }
            }
        })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn send(&self, title: &str, message: &str) {
        let result = self
            .client
            .post(&self.url)
            .json(&Self::payload(title, message))
            .send()
            .await;

        match result {
            Ok(resp) if resp.status().is_success() => debug!("Notification sent: {}", title),
            Ok(resp) => warn!("Notification '{}' rejected: HTTP {}", title, resp.status()),
            Err(e) => warn!("Notification '{}' failed: {}", title, e),
        }
    }
}

/// Webhook notifier when a URL is configured, log notifier otherwise
pub fn from_config(webhook_url: Option<&str>) -> Box<dyn Notifier> {
    match webhook_url.filter(|u| !u.trim().is_empty()) {
        Some(url) => match WebhookNotifier::new(url) {
            Ok(n) => Box::new(n),
            Err(e) => {
                warn!("Webhook notifier unavailable ({}), logging only", e);
                Box::new(LogNotifier)
            }
        },
        None => Box::new(LogNotifier),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_shape() {
        let payload = WebhookNotifier::payload("Opened", "BTCUSDT level 1");
        assert_eq!(payload["msg_type"], "post");
        let post = &payload["content"]["post"]["en_us"];
        assert_eq!(post["title"], "Opened");
        assert_eq!(post["content"][0][0]["text"], "BTCUSDT level 1");
    }

    #[tokio::test]
    async fn test_unreachable_webhook_does_not_fail() {
        let notifier = WebhookNotifier::new("http://127.0.0.1:9/hook").unwrap();
        notifier.send("title", "message").await;
    }
}
