//! One fetch-and-deliver cycle across all tracked feed links.
//!
//! Subscriptions are grouped by feed link so each link is fetched once
//! per cycle regardless of how many destinations follow it. Links are
//! processed concurrently up to a bound; each link locks a pool worker
//! for the fetch, runs the dedup engine against the link's history,
//! persists newly observed identifiers and comparison values, then
//! delivers accepted articles oldest-first.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::{bail, Result};
use futures::stream::{self, StreamExt};
use serde_json::{json, Value};
use tracing::{info, warn};

use feedrelay_common::{Article, ComparisonDoc, FeedSubscription, NewArticle};

use crate::dedup::{DedupDefaults, DedupEngine};
use crate::traits::{Delivery, HistoryStore, SubscriptionStore};
use crate::worker::protocol::FetchJob;
use crate::worker::WorkerPool;

/// Turns an accepted article into the outbound message payload.
pub trait MessageFormatter: Send + Sync {
    fn format(&self, new_article: &NewArticle) -> Value;
}

/// Title on one line, link on the next. Untitled articles fall back to
/// the link alone.
pub struct DefaultFormatter;

impl MessageFormatter for DefaultFormatter {
    fn format(&self, new_article: &NewArticle) -> Value {
        let title = new_article.article.property_str("title");
        let link = new_article.article.property_str("link");
        let content = match (title, link) {
            (Some(title), Some(link)) => format!("**{title}**\n{link}"),
            (Some(title), None) => title.to_string(),
            (None, Some(link)) => link.to_string(),
            (None, None) => "New article".to_string(),
        };
        json!({ "content": content })
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct CycleStats {
    pub links: usize,
    pub failed_links: usize,
    pub delivered: usize,
}

pub struct CycleRunner {
    pool: Arc<WorkerPool>,
    history: Arc<dyn HistoryStore>,
    subscriptions: Arc<dyn SubscriptionStore>,
    delivery: Arc<dyn Delivery>,
    formatter: Arc<dyn MessageFormatter>,
    defaults: DedupDefaults,
    /// Bound on links processed concurrently.
    link_concurrency: usize,
}

impl CycleRunner {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pool: Arc<WorkerPool>,
        history: Arc<dyn HistoryStore>,
        subscriptions: Arc<dyn SubscriptionStore>,
        delivery: Arc<dyn Delivery>,
        formatter: Arc<dyn MessageFormatter>,
        defaults: DedupDefaults,
        link_concurrency: usize,
    ) -> Self {
        Self {
            pool,
            history,
            subscriptions,
            delivery,
            formatter,
            defaults,
            link_concurrency: link_concurrency.max(1),
        }
    }

    pub async fn run_cycle(&self) -> Result<CycleStats> {
        let mut by_link: HashMap<String, Vec<FeedSubscription>> = HashMap::new();
        for subscription in self.subscriptions.all().await? {
            by_link
                .entry(subscription.feed_url.clone())
                .or_default()
                .push(subscription);
        }

        let mut stats = CycleStats {
            links: by_link.len(),
            ..CycleStats::default()
        };
        let mut outcomes = stream::iter(by_link.into_iter().map(|(link, subs)| async move {
            let result = self.process_link(&link, &subs).await;
            (link, result)
        }))
        .buffer_unordered(self.link_concurrency);

        while let Some((link, result)) = outcomes.next().await {
            match result {
                Ok(delivered) => stats.delivered += delivered,
                Err(e) => {
                    warn!(link = %link, error = %e, "Link processing failed");
                    stats.failed_links += 1;
                }
            }
        }

        info!(
            links = stats.links,
            failed = stats.failed_links,
            delivered = stats.delivered,
            "Cycle complete"
        );
        Ok(stats)
    }

    /// Fetch one link, dedup its batch for every subscription, persist
    /// history, deliver. Returns the delivered message count.
    async fn process_link(&self, link: &str, subscriptions: &[FeedSubscription]) -> Result<usize> {
        let mut worker = self.pool.acquire().await?;
        let job = FetchJob {
            link: link.to_string(),
        };
        let reply = match worker.dispatch(&job).await {
            Ok(reply) => {
                self.pool.release(worker).await;
                reply
            }
            Err(e) => {
                // A worker whose protocol state is unknown cannot be
                // reused.
                self.pool.kill(worker).await;
                return Err(e);
            }
        };
        if let Some(error) = reply.error {
            bail!("Feed fetch failed: {error}");
        }

        let history_docs = self.history.docs(link).await?;
        let mut engine = DedupEngine::new(&history_docs, self.defaults);
        let unseen: HashSet<String> = engine
            .unseen_ids(&reply.articles)
            .into_iter()
            .map(str::to_string)
            .collect();
        let new_articles = engine.run(subscriptions, &reply.articles);

        self.persist_history(link, subscriptions, &reply.articles, &unseen, &new_articles)
            .await?;

        let mut delivered = 0;
        for new_article in &new_articles {
            let payload = self.formatter.format(new_article);
            match self
                .delivery
                .send_channel_message(&new_article.channel_id, &payload)
                .await
            {
                Ok(()) => delivered += 1,
                Err(e) => warn!(
                    channel = %new_article.channel_id,
                    subscription = %new_article.subscription_id,
                    error = %e,
                    "Delivery failed"
                ),
            }
        }
        Ok(delivered)
    }

    /// Record every newly observed identifier, plus the comparison
    /// property values of accepted articles, so later cycles can block
    /// republished values.
    async fn persist_history(
        &self,
        link: &str,
        subscriptions: &[FeedSubscription],
        batch: &[Article],
        unseen: &HashSet<String>,
        accepted: &[NewArticle],
    ) -> Result<()> {
        let properties: HashSet<&str> = subscriptions
            .iter()
            .flat_map(|s| {
                s.negative_comparisons
                    .iter()
                    .chain(s.positive_comparisons.iter())
            })
            .map(String::as_str)
            .collect();
        let accepted_ids: HashSet<&str> = accepted
            .iter()
            .filter_map(|n| n.article.id.as_deref())
            .collect();

        let docs: Vec<ComparisonDoc> = batch
            .iter()
            .filter_map(|article| {
                let id = article.id.as_deref()?;
                if !unseen.contains(id) && !accepted_ids.contains(id) {
                    return None;
                }
                let values: HashMap<String, Value> = properties
                    .iter()
                    .filter_map(|p| {
                        article
                            .property_str(p)
                            .map(|v| (p.to_string(), Value::String(v.to_string())))
                    })
                    .collect();
                Some(ComparisonDoc {
                    article_id: id.to_string(),
                    properties: values,
                })
            })
            .collect();
        if docs.is_empty() {
            return Ok(());
        }
        self.history.upsert(link, docs).await
    }
}
