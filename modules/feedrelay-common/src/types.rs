use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// --- Feed content ---

/// One fetched feed item: a unique identifier, an optional publish
/// timestamp, and an open bag of properties (title, description,
/// author, ...). Only string-valued properties participate in
/// comparisons.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Article {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub published_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub properties: HashMap<String, Value>,
}

impl Article {
    /// Resolve a comparison property to a non-empty string value.
    ///
    /// Accessors may address nested objects with underscore-separated
    /// segments (`media_thumbnail` reads `properties["media"]["thumbnail"]`
    /// when no flat `media_thumbnail` key exists). Non-string and empty
    /// values resolve to None and never participate in comparisons.
    pub fn property_str(&self, accessor: &str) -> Option<&str> {
        if let Some(value) = self.properties.get(accessor) {
            return as_comparison_str(value);
        }
        let mut segments = accessor.split('_');
        let mut current = self.properties.get(segments.next()?)?;
        for segment in segments {
            current = current.as_object()?.get(segment)?;
        }
        as_comparison_str(current)
    }
}

fn as_comparison_str(value: &Value) -> Option<&str> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s),
        _ => None,
    }
}

/// Persisted snapshot of the property values previously observed for
/// one article on a feed link. The historical "seen values" sets are
/// built from these.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComparisonDoc {
    pub article_id: String,
    #[serde(default)]
    pub properties: HashMap<String, Value>,
}

// --- Subscriptions ---

/// One destination's configuration for a feed link. Several
/// subscriptions may share the same `feed_url`; comparison rules are
/// evaluated independently per subscription.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedSubscription {
    pub id: String,
    pub feed_url: String,
    /// Server/guild the destination channel belongs to. Used by the
    /// consistency job's cached role check.
    pub destination_id: String,
    pub channel_id: String,
    /// Properties whose matching prior value blocks an otherwise-new
    /// article. Missing in stored documents means "none".
    #[serde(default)]
    pub negative_comparisons: Vec<String>,
    /// Properties whose novel value lets an already-seen article
    /// through.
    #[serde(default)]
    pub positive_comparisons: Vec<String>,
    /// Per-subscription override of the global age cutoff.
    #[serde(default)]
    pub age_cutoff_days: Option<i64>,
    /// Per-subscription override of the global date-check flag.
    #[serde(default)]
    pub check_dates: Option<bool>,
}

/// A dedup-accepted article bound to the subscription it should be
/// delivered for.
#[derive(Debug, Clone)]
pub struct NewArticle {
    pub article: Article,
    pub subscription_id: String,
    pub channel_id: String,
}

// --- Subscribers ---

/// Mention target type. Stored records with any other string
/// deserialize to `Unknown` and are pruned by the consistency job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MentionKind {
    Role,
    User,
    #[serde(other)]
    Unknown,
}

/// A mention target (role or user) attached to one subscription.
/// `target_id` is the platform identifier being mentioned; several
/// subscriber records across subscriptions may share one target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscriber {
    pub id: String,
    pub subscription_id: String,
    pub target_id: String,
    pub kind: MentionKind,
}

// --- Delivery ---

/// Webhook delivery target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Webhook {
    pub id: String,
    pub token: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn article(props: Value) -> Article {
        Article {
            id: Some("a1".to_string()),
            published_at: None,
            properties: serde_json::from_value(props).unwrap(),
        }
    }

    #[test]
    fn property_str_reads_flat_values() {
        let a = article(json!({ "title": "hello" }));
        assert_eq!(a.property_str("title"), Some("hello"));
    }

    #[test]
    fn property_str_traverses_nested_objects() {
        let a = article(json!({ "media": { "thumbnail": "http://x/y.png" } }));
        assert_eq!(a.property_str("media_thumbnail"), Some("http://x/y.png"));
        assert_eq!(a.property_str("media_thumbnail_width"), None);
    }

    #[test]
    fn property_str_skips_non_string_and_empty_values() {
        let a = article(json!({ "count": 3, "flag": true, "title": "" }));
        assert_eq!(a.property_str("count"), None);
        assert_eq!(a.property_str("flag"), None);
        assert_eq!(a.property_str("title"), None);
    }

    #[test]
    fn subscription_missing_comparison_lists_default_to_empty() {
        let sub: FeedSubscription = serde_json::from_value(json!({
            "id": "s1",
            "feed_url": "https://example.com/feed.xml",
            "destination_id": "g1",
            "channel_id": "c1"
        }))
        .unwrap();
        assert!(sub.negative_comparisons.is_empty());
        assert!(sub.positive_comparisons.is_empty());
        assert_eq!(sub.check_dates, None);
    }

    #[test]
    fn unknown_mention_kind_deserializes_to_unknown() {
        let sub: Subscriber = serde_json::from_value(json!({
            "id": "m1",
            "subscription_id": "s1",
            "target_id": "t1",
            "kind": "everyone"
        }))
        .unwrap();
        assert_eq!(sub.kind, MentionKind::Unknown);
    }
}
