//! Per-run novelty decisions for fetched articles.
//!
//! One `DedupEngine` is built per link-processing run from that link's
//! persisted history, then `run` evaluates the fetched batch for every
//! subscription sharing the link. The engine is synchronous and owns
//! no shared state; concurrent links get independent engines.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Duration, Utc};
use tracing::debug;

use feedrelay_common::{Article, ComparisonDoc, FeedSubscription, NewArticle};

use crate::comparisons::{comparison_references, ReferenceSets, SentReferences};

/// Global fallbacks for subscriptions that do not set their own
/// date-check flag or age cutoff.
#[derive(Debug, Clone, Copy)]
pub struct DedupDefaults {
    pub check_dates: bool,
    pub max_age_days: i64,
}

pub struct DedupEngine {
    /// Article identifiers already persisted for this link.
    history_ids: HashSet<String>,
    /// Historical per-property "seen values" sets.
    references: ReferenceSets,
    /// In-cycle buffers, one per subscription, discarded with the run.
    sent: HashMap<String, SentReferences>,
    defaults: DedupDefaults,
    now: DateTime<Utc>,
}

impl DedupEngine {
    pub fn new(history_docs: &[ComparisonDoc], defaults: DedupDefaults) -> Self {
        Self::at(history_docs, defaults, Utc::now())
    }

    /// Like `new` but with an explicit evaluation time for the age
    /// cutoff. Exists so tests control the clock.
    pub fn at(history_docs: &[ComparisonDoc], defaults: DedupDefaults, now: DateTime<Utc>) -> Self {
        Self {
            history_ids: history_docs
                .iter()
                .map(|d| d.article_id.clone())
                .collect(),
            references: comparison_references(history_docs),
            sent: HashMap::new(),
            defaults,
            now,
        }
    }

    /// Whether the link's history is entirely uninitialized. Such
    /// runs store the batch's article IDs but never send anything.
    pub fn history_is_empty(&self) -> bool {
        self.history_ids.is_empty()
    }

    /// Identifiers of batch articles not yet present in the history.
    /// The cycle runner persists these after the run.
    pub fn unseen_ids<'a>(&self, batch: &'a [Article]) -> Vec<&'a str> {
        batch
            .iter()
            .filter_map(|a| a.id.as_deref())
            .filter(|id| !self.history_ids.contains(*id))
            .collect()
    }

    /// Evaluate the fetched batch for every subscription on this link.
    ///
    /// The batch arrives newest-first from the fetch; it is walked in
    /// reverse so accepted articles come out oldest-first, preserving
    /// chronological send order.
    pub fn run(
        &mut self,
        subscriptions: &[FeedSubscription],
        batch: &[Article],
    ) -> Vec<NewArticle> {
        let mut new_articles = Vec::new();
        for subscription in subscriptions {
            if self.history_is_empty() {
                // Uninitialized collection: store-only pass, otherwise a
                // newly tracked feed would deliver its entire backlog.
                debug!(
                    subscription = %subscription.id,
                    "History uninitialized for link, skipping all articles"
                );
                continue;
            }
            for article in batch.iter().rev() {
                if self.is_new_article(article, subscription) {
                    new_articles.push(NewArticle {
                        article: article.clone(),
                        subscription_id: subscription.id.clone(),
                        channel_id: subscription.channel_id.clone(),
                    });
                }
            }
        }
        new_articles
    }

    fn is_new_article(&mut self, article: &Article, subscription: &FeedSubscription) -> bool {
        let Some(article_id) = article.id.as_deref() else {
            debug!(subscription = %subscription.id, "Article has no ID, blocked");
            return false;
        };
        let sent = self.sent.entry(subscription.id.clone()).or_default();

        if !self.history_ids.contains(article_id) {
            // Unseen ID passes by default unless a negative comparison
            // matches a republished value.
            if negative_comparison_blocks(
                article,
                &subscription.negative_comparisons,
                &self.references,
                sent,
            ) {
                debug!(
                    subscription = %subscription.id,
                    article = article_id,
                    "Unseen ID blocked by negative comparison"
                );
                return false;
            }
        } else {
            // Seen ID is blocked by default unless a positive
            // comparison finds a genuinely novel value.
            if !positive_comparison_passes(
                article,
                &subscription.positive_comparisons,
                &self.references,
                sent,
            ) {
                debug!(
                    subscription = %subscription.id,
                    article = article_id,
                    "Seen ID, no positive comparison passed"
                );
                return false;
            }
        }

        let check_dates = subscription.check_dates.unwrap_or(self.defaults.check_dates);
        if check_dates {
            let max_age_days = subscription
                .age_cutoff_days
                .unwrap_or(self.defaults.max_age_days);
            let cutoff = self.now - Duration::days(max_age_days);
            let too_old = match article.published_at {
                None => true,
                Some(published) => published < cutoff,
            };
            if too_old {
                debug!(
                    subscription = %subscription.id,
                    article = article_id,
                    "Blocked by date check"
                );
                return false;
            }
        }

        // Accepted: buffer this article's comparison values before the
        // next article in the batch is evaluated.
        self.store_properties_to_buffer(article, subscription);
        true
    }

    fn store_properties_to_buffer(&mut self, article: &Article, subscription: &FeedSubscription) {
        let sent = self.sent.entry(subscription.id.clone()).or_default();
        let properties = subscription
            .negative_comparisons
            .iter()
            .chain(subscription.positive_comparisons.iter());
        for property in properties {
            if let Some(value) = article.property_str(property) {
                sent.store(property, value);
            }
        }
    }
}

/// Negative comparisons block articles whose ID was not seen. Empty
/// comparison lists vacuously never block.
fn negative_comparison_blocks(
    article: &Article,
    comparisons: &[String],
    references: &ReferenceSets,
    sent: &SentReferences,
) -> bool {
    for property in comparisons {
        let Some(value) = article.property_str(property) else {
            continue;
        };
        if references
            .get(property.as_str())
            .is_some_and(|set| set.contains(value))
        {
            return true;
        }
        if sent.contains(property, value) {
            return true;
        }
    }
    false
}

/// Positive comparisons let articles through whose ID was seen. A
/// property with no recorded historical values never passes; without
/// that guard, enabling a new comparison rule would resend the whole
/// backlog. Empty comparison lists vacuously never pass.
fn positive_comparison_passes(
    article: &Article,
    comparisons: &[String],
    references: &ReferenceSets,
    sent: &SentReferences,
) -> bool {
    for property in comparisons {
        let Some(value) = article.property_str(property) else {
            continue;
        };
        let Some(recorded) = references.get(property.as_str()) else {
            continue;
        };
        if recorded.contains(value) {
            continue;
        }
        if sent.contains(property, value) {
            continue;
        }
        return true;
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const DEFAULTS: DedupDefaults = DedupDefaults {
        check_dates: false,
        max_age_days: 1,
    };

    fn doc(id: &str, props: serde_json::Value) -> ComparisonDoc {
        ComparisonDoc {
            article_id: id.to_string(),
            properties: serde_json::from_value(props).unwrap(),
        }
    }

    fn article(id: Option<&str>, props: serde_json::Value) -> Article {
        Article {
            id: id.map(str::to_string),
            published_at: None,
            properties: serde_json::from_value(props).unwrap(),
        }
    }

    fn subscription(id: &str) -> FeedSubscription {
        FeedSubscription {
            id: id.to_string(),
            feed_url: "https://example.com/feed.xml".to_string(),
            destination_id: "g1".to_string(),
            channel_id: "c1".to_string(),
            negative_comparisons: vec![],
            positive_comparisons: vec![],
            age_cutoff_days: None,
            check_dates: None,
        }
    }

    #[test]
    fn article_without_id_is_never_accepted() {
        let docs = vec![doc("a0", json!({}))];
        let mut engine = DedupEngine::new(&docs, DEFAULTS);
        let batch = vec![article(None, json!({ "title": "x" }))];
        assert!(engine.run(&[subscription("s1")], &batch).is_empty());
    }

    #[test]
    fn empty_comparison_lists_neither_block_nor_pass() {
        let a = article(Some("a1"), json!({ "title": "x" }));
        let refs = ReferenceSets::new();
        let sent = SentReferences::default();
        assert!(!negative_comparison_blocks(&a, &[], &refs, &sent));
        assert!(!positive_comparison_passes(&a, &[], &refs, &sent));
    }

    #[test]
    fn unseen_id_accepted_by_default() {
        let docs = vec![doc("a0", json!({}))];
        let mut engine = DedupEngine::new(&docs, DEFAULTS);
        let batch = vec![article(Some("a1"), json!({ "title": "x" }))];
        let result = engine.run(&[subscription("s1")], &batch);
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].article.id.as_deref(), Some("a1"));
        assert_eq!(result[0].subscription_id, "s1");
    }

    #[test]
    fn negative_comparison_blocks_republished_value_from_history() {
        let docs = vec![doc("a0", json!({ "title": "x" }))];
        let mut engine = DedupEngine::new(&docs, DEFAULTS);
        let mut sub = subscription("s1");
        sub.negative_comparisons = vec!["title".to_string()];
        // New guid, same title as a stored article
        let batch = vec![article(Some("a1"), json!({ "title": "x" }))];
        assert!(engine.run(&[sub], &batch).is_empty());
    }

    #[test]
    fn in_cycle_buffer_blocks_lookalike_within_one_batch() {
        let docs = vec![doc("a0", json!({}))];
        let mut engine = DedupEngine::new(&docs, DEFAULTS);
        let mut sub = subscription("s1");
        sub.negative_comparisons = vec!["title".to_string()];
        // Newest-first batch; both IDs unseen, same title, which the
        // durable history does not contain yet.
        let batch = vec![
            article(Some("a2"), json!({ "title": "x" })),
            article(Some("a1"), json!({ "title": "x" })),
        ];
        let result = engine.run(&[sub], &batch);
        assert_eq!(result.len(), 1);
        // The older article was evaluated first and won.
        assert_eq!(result[0].article.id.as_deref(), Some("a1"));
    }

    #[test]
    fn seen_id_rejected_without_positive_comparisons() {
        let docs = vec![doc("a1", json!({ "title": "x" }))];
        let mut engine = DedupEngine::new(&docs, DEFAULTS);
        let mut sub = subscription("s1");
        sub.negative_comparisons = vec!["title".to_string()];
        let batch = vec![article(Some("a1"), json!({ "title": "x" }))];
        assert!(engine.run(&[sub], &batch).is_empty());
    }

    #[test]
    fn positive_comparison_passes_seen_id_with_novel_value() {
        let docs = vec![doc("a1", json!({ "description": "d1" }))];
        let mut engine = DedupEngine::new(&docs, DEFAULTS);
        let mut sub = subscription("s1");
        sub.positive_comparisons = vec!["description".to_string()];
        let batch = vec![article(Some("a1"), json!({ "description": "d2" }))];
        assert_eq!(engine.run(&[sub], &batch).len(), 1);
    }

    #[test]
    fn uninitialized_positive_property_never_passes() {
        // "description" has no recorded values at all, so a seen ID
        // must stay blocked even though its value is technically new.
        let docs = vec![doc("a1", json!({ "title": "t1" }))];
        let mut engine = DedupEngine::new(&docs, DEFAULTS);
        let mut sub = subscription("s1");
        sub.positive_comparisons = vec!["description".to_string()];
        let batch = vec![article(Some("a1"), json!({ "description": "brand new" }))];
        assert!(engine.run(&[sub], &batch).is_empty());
    }

    #[test]
    fn date_check_rejects_old_and_undated_articles() {
        let docs = vec![doc("a0", json!({}))];
        let now = Utc::now();
        let defaults = DedupDefaults {
            check_dates: true,
            max_age_days: 2,
        };
        let mut engine = DedupEngine::at(&docs, defaults, now);
        let fresh = Article {
            published_at: Some(now - Duration::hours(1)),
            ..article(Some("a1"), json!({}))
        };
        let stale = Article {
            published_at: Some(now - Duration::days(10)),
            ..article(Some("a2"), json!({}))
        };
        let undated = article(Some("a3"), json!({}));
        let batch = vec![undated, stale, fresh];
        let result = engine.run(&[subscription("s1")], &batch);
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].article.id.as_deref(), Some("a1"));
    }

    #[test]
    fn subscription_age_cutoff_overrides_default() {
        let docs = vec![doc("a0", json!({}))];
        let now = Utc::now();
        let defaults = DedupDefaults {
            check_dates: true,
            max_age_days: 1,
        };
        let mut engine = DedupEngine::at(&docs, defaults, now);
        let mut sub = subscription("s1");
        sub.age_cutoff_days = Some(30);
        let week_old = Article {
            published_at: Some(now - Duration::days(7)),
            ..article(Some("a1"), json!({}))
        };
        assert_eq!(engine.run(&[sub], &[week_old]).len(), 1);
    }

    #[test]
    fn empty_history_accepts_nothing() {
        let mut engine = DedupEngine::new(&[], DEFAULTS);
        let batch = vec![
            article(Some("a1"), json!({ "title": "x" })),
            article(Some("a2"), json!({ "title": "y" })),
        ];
        let subs = vec![subscription("s1"), subscription("s2")];
        assert!(engine.run(&subs, &batch).is_empty());
        assert_eq!(engine.unseen_ids(&batch).len(), 2);
    }

    #[test]
    fn results_are_oldest_first() {
        let docs = vec![doc("a0", json!({}))];
        let mut engine = DedupEngine::new(&docs, DEFAULTS);
        let batch = vec![
            article(Some("a3"), json!({})),
            article(Some("a2"), json!({})),
            article(Some("a1"), json!({})),
        ];
        let ids: Vec<_> = engine
            .run(&[subscription("s1")], &batch)
            .into_iter()
            .map(|n| n.article.id.unwrap())
            .collect();
        assert_eq!(ids, vec!["a1", "a2", "a3"]);
    }

    #[test]
    fn comparison_rules_are_independent_per_subscription() {
        let docs = vec![doc("a0", json!({ "title": "x" }))];
        let mut engine = DedupEngine::new(&docs, DEFAULTS);
        let mut strict = subscription("s1");
        strict.negative_comparisons = vec!["title".to_string()];
        let lenient = subscription("s2");
        let batch = vec![article(Some("a1"), json!({ "title": "x" }))];
        let result = engine.run(&[strict, lenient], &batch);
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].subscription_id, "s2");
    }
}
