//! Mutex-guarded delivery to the destination platform.

pub mod lock;

use std::sync::Arc;

use anyhow::{Context, Result};
use serde_json::Value;
use tracing::debug;

use feedrelay_common::Webhook;

use lock::{lock_key, DeliveryMutex};

/// REST client for outbound sends. Every call runs under the delivery
/// mutex, scoped to exactly one outbound request.
pub struct DeliveryClient {
    http: reqwest::Client,
    api_base: String,
    token: String,
    mutex: Arc<dyn DeliveryMutex>,
}

impl DeliveryClient {
    pub fn new(
        api_base: impl Into<String>,
        token: impl Into<String>,
        mutex: Arc<dyn DeliveryMutex>,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_base: api_base.into(),
            token: token.into(),
            mutex,
        }
    }

    /// Post a formatted message payload to a channel.
    pub async fn send_channel_message(&self, channel_id: &str, payload: &Value) -> Result<()> {
        let url = format!("{}/channels/{}/messages", self.api_base, channel_id);
        self.guarded_post(&lock_key("channel", channel_id), &url, payload, true)
            .await
    }

    /// Post a formatted message payload through a webhook.
    pub async fn send_webhook_message(&self, webhook: &Webhook, payload: &Value) -> Result<()> {
        let url = format!("{}/webhooks/{}/{}", self.api_base, webhook.id, webhook.token);
        self.guarded_post(&lock_key("webhook", &webhook.id), &url, payload, false)
            .await
    }

    async fn guarded_post(
        &self,
        key: &str,
        url: &str,
        payload: &Value,
        authorized: bool,
    ) -> Result<()> {
        let lease = self.mutex.acquire(key).await?;
        let result = self.post(url, payload, authorized).await;
        // Release before surfacing the send outcome; a coordination
        // failure here is fatal and takes precedence.
        self.mutex.release(lease).await?;
        result
    }

    async fn post(&self, url: &str, payload: &Value, authorized: bool) -> Result<()> {
        let mut request = self.http.post(url).json(payload);
        if authorized {
            request = request.header(reqwest::header::AUTHORIZATION, format!("Bot {}", self.token));
        }
        let response = request
            .send()
            .await
            .with_context(|| format!("Delivery POST to {url} failed"))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Delivery POST to {url} returned {status}: {body}");
        }
        debug!(url, "Delivered message");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lock::LocalMutex;
    use serde_json::json;

    #[tokio::test]
    async fn lock_is_released_even_when_the_send_fails() {
        // Port 1 refuses connections immediately; the send errors but
        // the channel lock must come back.
        let mutex = Arc::new(LocalMutex::new());
        let client = DeliveryClient::new("http://127.0.0.1:1", "t", mutex.clone());

        let result = client.send_channel_message("c1", &json!({ "content": "hi" })).await;
        assert!(result.is_err());

        // Re-acquirable without blocking proves the release happened.
        let lease = tokio::time::timeout(
            std::time::Duration::from_millis(200),
            mutex.acquire(&lock_key("channel", "c1")),
        )
        .await
        .expect("lock was not released")
        .unwrap();
        mutex.release(lease).await.unwrap();
    }

    #[tokio::test]
    async fn webhook_send_targets_the_webhook_route_under_its_own_lock() {
        let mutex = Arc::new(LocalMutex::new());
        let client = DeliveryClient::new("http://127.0.0.1:1", "t", mutex.clone());
        let webhook = Webhook {
            id: "w1".to_string(),
            token: "tok".to_string(),
        };

        let err = client
            .send_webhook_message(&webhook, &json!({ "content": "hi" }))
            .await
            .unwrap_err();
        // The failed POST names the id/token webhook route.
        assert!(err.to_string().contains("/webhooks/w1/tok"));

        let lease = tokio::time::timeout(
            std::time::Duration::from_millis(200),
            mutex.acquire(&lock_key("webhook", "w1")),
        )
        .await
        .expect("lock was not released")
        .unwrap();
        mutex.release(lease).await.unwrap();
    }
}
