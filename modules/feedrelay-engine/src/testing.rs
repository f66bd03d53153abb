// Test mocks for the relay pipeline.
//
// One mock per trait boundary:
// - MemoryHistoryStore (HistoryStore): per-link doc map with merge upsert
// - MemorySubscriptionStore (SubscriptionStore): fixed list
// - MemorySubscriberStore (SubscriberStore): stateful, records deletions
// - MockDirectory (PlatformDirectory): scripted role sets and user
//   outcomes, counts every user fetch
// - MockDelivery (Delivery): records outbound payloads
//
// Plus helpers for constructing subscriptions, subscribers, and articles.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;

use feedrelay_common::{
    ComparisonDoc, FeedSubscription, MentionKind, PlatformError, Subscriber, Webhook,
};

use crate::traits::{
    Delivery, HistoryStore, PlatformDirectory, SubscriberStore, SubscriptionStore,
};

// ---------------------------------------------------------------------------
// Builders
// ---------------------------------------------------------------------------

/// Subscription with no comparison lists on a canonical test feed.
pub fn subscription(id: &str) -> FeedSubscription {
    FeedSubscription {
        id: id.to_string(),
        feed_url: "https://example.com/feed.xml".to_string(),
        destination_id: "g1".to_string(),
        channel_id: format!("chan-{id}"),
        negative_comparisons: Vec::new(),
        positive_comparisons: Vec::new(),
        age_cutoff_days: None,
        check_dates: None,
    }
}

pub fn user_subscriber(id: &str, subscription_id: &str, target_id: &str) -> Subscriber {
    Subscriber {
        id: id.to_string(),
        subscription_id: subscription_id.to_string(),
        target_id: target_id.to_string(),
        kind: MentionKind::User,
    }
}

// ---------------------------------------------------------------------------
// MemoryHistoryStore
// ---------------------------------------------------------------------------

/// Per-link comparison history held in memory. Upserts merge property
/// values into existing docs by article ID, matching the durable
/// store's semantics.
#[derive(Default)]
pub struct MemoryHistoryStore {
    docs: Mutex<HashMap<String, Vec<ComparisonDoc>>>,
}

impl MemoryHistoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_docs(link: &str, docs: Vec<ComparisonDoc>) -> Self {
        let store = Self::new();
        store
            .docs
            .lock()
            .unwrap()
            .insert(link.to_string(), docs);
        store
    }

    pub fn stored(&self, link: &str) -> Vec<ComparisonDoc> {
        self.docs
            .lock()
            .unwrap()
            .get(link)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl HistoryStore for MemoryHistoryStore {
    async fn docs(&self, link: &str) -> Result<Vec<ComparisonDoc>> {
        Ok(self.stored(link))
    }

    async fn upsert(&self, link: &str, docs: Vec<ComparisonDoc>) -> Result<()> {
        let mut map = self.docs.lock().unwrap();
        let existing = map.entry(link.to_string()).or_default();
        for doc in docs {
            match existing.iter_mut().find(|d| d.article_id == doc.article_id) {
                Some(found) => found.properties.extend(doc.properties),
                None => existing.push(doc),
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MemorySubscriptionStore / MemorySubscriberStore
// ---------------------------------------------------------------------------

pub struct MemorySubscriptionStore {
    subscriptions: Vec<FeedSubscription>,
}

impl MemorySubscriptionStore {
    pub fn new(subscriptions: Vec<FeedSubscription>) -> Self {
        Self { subscriptions }
    }
}

#[async_trait]
impl SubscriptionStore for MemorySubscriptionStore {
    async fn all(&self) -> Result<Vec<FeedSubscription>> {
        Ok(self.subscriptions.clone())
    }
}

/// Subscriber store that applies deletions to its in-memory list and
/// remembers which IDs were deleted.
pub struct MemorySubscriberStore {
    subscribers: Mutex<Vec<Subscriber>>,
    deleted: Mutex<Vec<String>>,
}

impl MemorySubscriberStore {
    pub fn new(subscribers: Vec<Subscriber>) -> Self {
        Self {
            subscribers: Mutex::new(subscribers),
            deleted: Mutex::new(Vec::new()),
        }
    }

    pub fn remaining(&self) -> Vec<Subscriber> {
        self.subscribers.lock().unwrap().clone()
    }

    pub fn deleted_ids(&self) -> Vec<String> {
        self.deleted.lock().unwrap().clone()
    }
}

#[async_trait]
impl SubscriberStore for MemorySubscriberStore {
    async fn all(&self) -> Result<Vec<Subscriber>> {
        Ok(self.remaining())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        self.subscribers.lock().unwrap().retain(|s| s.id != id);
        self.deleted.lock().unwrap().push(id.to_string());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MockDirectory
// ---------------------------------------------------------------------------

/// Scripted platform directory. Builder pattern: `.with_role()`,
/// `.with_user()`, `.with_user_error()`. Unregistered users fail with
/// no platform code. Every `fetch_user` call is counted.
#[derive(Default)]
pub struct MockDirectory {
    roles: HashMap<String, HashSet<String>>,
    users: HashMap<String, Result<(), Option<i64>>>,
    fetch_counts: Mutex<HashMap<String, u32>>,
}

impl MockDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_role(mut self, destination_id: &str, role_id: &str) -> Self {
        self.roles
            .entry(destination_id.to_string())
            .or_default()
            .insert(role_id.to_string());
        self
    }

    pub fn with_user(mut self, user_id: &str) -> Self {
        self.users.insert(user_id.to_string(), Ok(()));
        self
    }

    pub fn with_user_error(mut self, user_id: &str, code: Option<i64>) -> Self {
        self.users.insert(user_id.to_string(), Err(code));
        self
    }

    pub fn fetch_count(&self, user_id: &str) -> u32 {
        self.fetch_counts
            .lock()
            .unwrap()
            .get(user_id)
            .copied()
            .unwrap_or(0)
    }

    pub fn total_fetches(&self) -> u32 {
        self.fetch_counts.lock().unwrap().values().sum()
    }
}

#[async_trait]
impl PlatformDirectory for MockDirectory {
    fn role_exists(&self, destination_id: &str, role_id: &str) -> Option<bool> {
        self.roles
            .get(destination_id)
            .map(|set| set.contains(role_id))
    }

    async fn fetch_user(&self, user_id: &str) -> Result<(), PlatformError> {
        *self
            .fetch_counts
            .lock()
            .unwrap()
            .entry(user_id.to_string())
            .or_insert(0) += 1;
        match self.users.get(user_id) {
            Some(Ok(())) => Ok(()),
            Some(Err(code)) => Err(PlatformError::new(*code, "scripted failure")),
            None => Err(PlatformError::new(None, "connection refused")),
        }
    }
}

// ---------------------------------------------------------------------------
// MockDelivery
// ---------------------------------------------------------------------------

/// Records every outbound payload instead of sending it.
#[derive(Default)]
pub struct MockDelivery {
    sent: Mutex<Vec<(String, Value)>>,
}

impl MockDelivery {
    pub fn new() -> Self {
        Self::default()
    }

    /// (destination, payload) pairs in send order. Channel sends use
    /// the channel ID, webhook sends the webhook ID.
    pub fn sent(&self) -> Vec<(String, Value)> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Delivery for MockDelivery {
    async fn send_channel_message(&self, channel_id: &str, payload: &Value) -> Result<()> {
        self.sent
            .lock()
            .unwrap()
            .push((channel_id.to_string(), payload.clone()));
        Ok(())
    }

    async fn send_webhook_message(&self, webhook: &Webhook, payload: &Value) -> Result<()> {
        self.sent
            .lock()
            .unwrap()
            .push((webhook.id.clone(), payload.clone()));
        Ok(())
    }
}
