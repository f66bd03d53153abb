// Trait abstractions for the service's external collaborators.
//
// The persistent document layer (feed history, subscriptions,
// subscribers) and the destination platform are external per the
// system boundary; these traits are their interfaces. In-memory and
// mock implementations live in testing.rs, so the dedup, cycle, and
// consistency paths test with no network and no database.

use std::collections::HashSet;

use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use feedrelay_common::{ComparisonDoc, FeedSubscription, PlatformError, Subscriber, Webhook};

use crate::delivery::DeliveryClient;

// ---------------------------------------------------------------------------
// Document stores
// ---------------------------------------------------------------------------

/// Durable per-link comparison history.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    async fn docs(&self, link: &str) -> Result<Vec<ComparisonDoc>>;
    /// Merge snapshots into the stored history, keyed by article ID.
    /// Existing docs gain any new property values.
    async fn upsert(&self, link: &str, docs: Vec<ComparisonDoc>) -> Result<()>;
}

#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    async fn all(&self) -> Result<Vec<FeedSubscription>>;
}

#[async_trait]
pub trait SubscriberStore: Send + Sync {
    async fn all(&self) -> Result<Vec<Subscriber>>;
    async fn delete(&self, id: &str) -> Result<()>;
}

// ---------------------------------------------------------------------------
// Destination platform
// ---------------------------------------------------------------------------

/// Live destination platform lookups used by the consistency job.
#[async_trait]
pub trait PlatformDirectory: Send + Sync {
    /// Membership in the already-cached role set of a destination.
    /// No network call. `None` means no role set has been cached for
    /// the destination, which callers must treat as inconclusive
    /// rather than as absence.
    fn role_exists(&self, destination_id: &str, role_id: &str) -> Option<bool>;

    /// Network existence check for a user. `Ok` confirms existence;
    /// errors are classified by their platform code.
    async fn fetch_user(&self, user_id: &str) -> Result<(), PlatformError>;
}

/// Outbound message delivery (implemented by the mutex-guarded client).
#[async_trait]
pub trait Delivery: Send + Sync {
    async fn send_channel_message(&self, channel_id: &str, payload: &Value) -> Result<()>;
    async fn send_webhook_message(&self, webhook: &Webhook, payload: &Value) -> Result<()>;
}

#[async_trait]
impl Delivery for crate::delivery::DeliveryClient {
    async fn send_channel_message(&self, channel_id: &str, payload: &Value) -> Result<()> {
        DeliveryClient::send_channel_message(self, channel_id, payload).await
    }

    async fn send_webhook_message(&self, webhook: &Webhook, payload: &Value) -> Result<()> {
        DeliveryClient::send_webhook_message(self, webhook, payload).await
    }
}

// ---------------------------------------------------------------------------
// HTTP-backed PlatformDirectory
// ---------------------------------------------------------------------------

/// Directory over the platform REST API. Role sets are cached
/// explicitly via `refresh_roles`; user checks always go out.
pub struct HttpPlatformDirectory {
    http: reqwest::Client,
    api_base: String,
    token: String,
    roles: std::sync::RwLock<std::collections::HashMap<String, HashSet<String>>>,
}

#[derive(Deserialize)]
struct RoleRow {
    id: String,
}

#[derive(Deserialize)]
struct ApiErrorBody {
    code: Option<i64>,
    message: Option<String>,
}

impl HttpPlatformDirectory {
    pub fn new(api_base: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_base: api_base.into(),
            token: token.into(),
            roles: std::sync::RwLock::new(std::collections::HashMap::new()),
        }
    }

    /// Refresh the cached role set for one destination.
    pub async fn refresh_roles(&self, destination_id: &str) -> Result<()> {
        let url = format!("{}/guilds/{}/roles", self.api_base, destination_id);
        let rows: Vec<RoleRow> = self
            .http
            .get(&url)
            .header(reqwest::header::AUTHORIZATION, format!("Bot {}", self.token))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        let set: HashSet<String> = rows.into_iter().map(|r| r.id).collect();
        debug!(destination = destination_id, roles = set.len(), "Refreshed role cache");
        self.roles
            .write()
            .expect("role cache poisoned")
            .insert(destination_id.to_string(), set);
        Ok(())
    }
}

#[async_trait]
impl PlatformDirectory for HttpPlatformDirectory {
    fn role_exists(&self, destination_id: &str, role_id: &str) -> Option<bool> {
        self.roles
            .read()
            .expect("role cache poisoned")
            .get(destination_id)
            .map(|set| set.contains(role_id))
    }

    async fn fetch_user(&self, user_id: &str) -> Result<(), PlatformError> {
        let url = format!("{}/users/{}", self.api_base, user_id);
        let response = self
            .http
            .get(&url)
            .header(reqwest::header::AUTHORIZATION, format!("Bot {}", self.token))
            .send()
            .await
            .map_err(|e| PlatformError::new(None, e.to_string()))?;

        if response.status().is_success() {
            return Ok(());
        }
        let status = response.status();
        let body: ApiErrorBody = response
            .json()
            .await
            .unwrap_or(ApiErrorBody {
                code: None,
                message: None,
            });
        Err(PlatformError::new(
            body.code,
            body.message.unwrap_or_else(|| format!("HTTP {status}")),
        ))
    }
}
