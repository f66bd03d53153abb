//! Seed-file-backed stores.
//!
//! The configuration CRUD layer lives outside this service; the binary
//! reads its exported JSON snapshot at startup. Subscriptions are
//! fixed for the process lifetime, subscriber deletions apply in
//! memory, and comparison history accumulates in memory across cycles.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use tracing::info;

use feedrelay_common::{ComparisonDoc, FeedSubscription, Subscriber};

use crate::traits::{HistoryStore, SubscriberStore, SubscriptionStore};

#[derive(Debug, Deserialize)]
pub struct SeedFile {
    #[serde(default)]
    pub subscriptions: Vec<FeedSubscription>,
    #[serde(default)]
    pub subscribers: Vec<Subscriber>,
}

impl SeedFile {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read seed file {}", path.display()))?;
        let seed: SeedFile = serde_json::from_str(&raw)
            .with_context(|| format!("Malformed seed file {}", path.display()))?;
        info!(
            path = %path.display(),
            subscriptions = seed.subscriptions.len(),
            subscribers = seed.subscribers.len(),
            "Seed file loaded"
        );
        Ok(seed)
    }
}

pub struct SeedSubscriptionStore {
    subscriptions: Vec<FeedSubscription>,
}

impl SeedSubscriptionStore {
    pub fn new(subscriptions: Vec<FeedSubscription>) -> Self {
        Self { subscriptions }
    }
}

#[async_trait]
impl SubscriptionStore for SeedSubscriptionStore {
    async fn all(&self) -> Result<Vec<FeedSubscription>> {
        Ok(self.subscriptions.clone())
    }
}

pub struct SeedSubscriberStore {
    subscribers: Mutex<Vec<Subscriber>>,
}

impl SeedSubscriberStore {
    pub fn new(subscribers: Vec<Subscriber>) -> Self {
        Self {
            subscribers: Mutex::new(subscribers),
        }
    }
}

#[async_trait]
impl SubscriberStore for SeedSubscriberStore {
    async fn all(&self) -> Result<Vec<Subscriber>> {
        Ok(self.subscribers.lock().expect("subscriber list poisoned").clone())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        self.subscribers
            .lock()
            .expect("subscriber list poisoned")
            .retain(|s| s.id != id);
        Ok(())
    }
}

/// Per-link comparison history held for the process lifetime. Upserts
/// merge property values into existing docs by article ID.
#[derive(Default)]
pub struct InMemoryHistoryStore {
    docs: Mutex<HashMap<String, Vec<ComparisonDoc>>>,
}

impl InMemoryHistoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl HistoryStore for InMemoryHistoryStore {
    async fn docs(&self, link: &str) -> Result<Vec<ComparisonDoc>> {
        Ok(self
            .docs
            .lock()
            .expect("history map poisoned")
            .get(link)
            .cloned()
            .unwrap_or_default())
    }

    async fn upsert(&self, link: &str, docs: Vec<ComparisonDoc>) -> Result<()> {
        let mut map = self.docs.lock().expect("history map poisoned");
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
