//! Comparison reference sets.
//!
//! The historical sets are built once per link-processing run from the
//! persisted comparison docs; the in-cycle buffer accumulates the
//! values of articles accepted earlier in the same run so two
//! look-alike articles in one batch cannot both be accepted.

use std::collections::{HashMap, HashSet};

use feedrelay_common::ComparisonDoc;

/// Property name to the set of distinct string values recorded for it.
pub type ReferenceSets = HashMap<String, HashSet<String>>;

/// Build per-property "seen values" sets from the persisted history of
/// one link. Non-string values are ignored, matching how they are
/// skipped during predicate evaluation.
pub fn comparison_references(docs: &[ComparisonDoc]) -> ReferenceSets {
    let mut references = ReferenceSets::new();
    for doc in docs {
        for (property, value) in &doc.properties {
            let Some(value) = value.as_str() else {
                continue;
            };
            references
                .entry(property.clone())
                .or_default()
                .insert(value.to_string());
        }
    }
    references
}

/// Per-run, per-subscription memory of property values accepted
/// earlier in the same run ("sent references"). Created fresh for each
/// run and discarded with it; never persisted.
#[derive(Debug, Default)]
pub struct SentReferences {
    values: ReferenceSets,
}

impl SentReferences {
    pub fn contains(&self, property: &str, value: &str) -> bool {
        self.values
            .get(property)
            .is_some_and(|set| set.contains(value))
    }

    pub fn store(&mut self, property: &str, value: &str) {
        self.values
            .entry(property.to_string())
            .or_default()
            .insert(value.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(id: &str, props: serde_json::Value) -> ComparisonDoc {
        ComparisonDoc {
            article_id: id.to_string(),
            properties: serde_json::from_value(props).unwrap(),
        }
    }

    #[test]
    fn collects_distinct_values_per_property() {
        let docs = vec![
            doc("a1", json!({ "title": "t1", "description": "d1" })),
            doc("a2", json!({ "title": "t2" })),
            doc("a3", json!({ "title": "t1" })),
        ];
        let refs = comparison_references(&docs);
        assert_eq!(refs["title"], HashSet::from(["t1".into(), "t2".into()]));
        assert_eq!(refs["description"], HashSet::from(["d1".into()]));
    }

    #[test]
    fn ignores_non_string_values() {
        let docs = vec![doc("a1", json!({ "title": "t1", "rank": 4, "live": false }))];
        let refs = comparison_references(&docs);
        assert!(refs.contains_key("title"));
        assert!(!refs.contains_key("rank"));
        assert!(!refs.contains_key("live"));
    }

    #[test]
    fn sent_references_remember_stored_values() {
        let mut sent = SentReferences::default();
        assert!(!sent.contains("title", "t1"));
        sent.store("title", "t1");
        assert!(sent.contains("title", "t1"));
        assert!(!sent.contains("title", "t2"));
        assert!(!sent.contains("description", "t1"));
    }
}
