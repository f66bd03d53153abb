//! Feed fetch + parse, executed inside the worker process.

use anyhow::{Context, Result};
use serde_json::Value;
use tracing::debug;

use feedrelay_common::Article;

/// Fetch a feed URL and map its entries to article property bags,
/// preserving the feed's own (typically newest-first) order.
pub async fn fetch_feed(client: &reqwest::Client, link: &str) -> Result<Vec<Article>> {
    let parsed = url::Url::parse(link).context("Invalid feed URL")?;
    if parsed.scheme() != "http" && parsed.scheme() != "https" {
        anyhow::bail!("Only http/https feed URLs are allowed, got: {}", parsed.scheme());
    }

    let body = client
        .get(link)
        .send()
        .await
        .with_context(|| format!("Failed to fetch feed {link}"))?
        .error_for_status()
        .with_context(|| format!("Feed {link} returned an error status"))?
        .bytes()
        .await
        .context("Failed to read feed body")?;

    let feed = feed_rs::parser::parse(&body[..]).with_context(|| format!("Failed to parse feed {link}"))?;
    debug!(link, entries = feed.entries.len(), "Parsed feed");
    Ok(feed.entries.into_iter().map(entry_to_article).collect())
}

/// Map a parsed entry to the open property bag the dedup engine
/// compares on. An empty entry ID becomes `None`; such articles are
/// silently excluded from dedup results downstream.
pub fn entry_to_article(entry: feed_rs::model::Entry) -> Article {
    let mut properties = serde_json::Map::new();
    if let Some(title) = &entry.title {
        properties.insert("title".to_string(), Value::String(title.content.clone()));
    }
    if let Some(summary) = &entry.summary {
        properties.insert(
            "description".to_string(),
            Value::String(summary.content.clone()),
        );
    }
    if let Some(link) = entry.links.first() {
        properties.insert("link".to_string(), Value::String(link.href.clone()));
    }
    if let Some(author) = entry.authors.first() {
        properties.insert("author".to_string(), Value::String(author.name.clone()));
    }
    if !entry.categories.is_empty() {
        let tags = entry
            .categories
            .iter()
            .map(|c| c.term.as_str())
            .collect::<Vec<_>>()
            .join(",");
        properties.insert("tags".to_string(), Value::String(tags));
    }

    Article {
        id: if entry.id.is_empty() {
            None
        } else {
            Some(entry.id)
        },
        published_at: entry.published.or(entry.updated),
        properties: properties.into_iter().collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RSS: &str = r#"<?xml version="1.0"?>
    <rss version="2.0">
      <channel>
        <title>Example</title>
        <item>
          <guid>item-1</guid>
          <title>First post</title>
          <description>Hello world</description>
          <link>https://example.com/1</link>
          <category>news</category>
          <category>updates</category>
          <pubDate>Mon, 06 Sep 2021 00:01:00 +0000</pubDate>
        </item>
        <item>
          <title>No guid here</title>
        </item>
      </channel>
    </rss>"#;

    #[test]
    fn maps_entries_to_property_bags() {
        let feed = feed_rs::parser::parse(RSS.as_bytes()).unwrap();
        let articles: Vec<Article> = feed.entries.into_iter().map(entry_to_article).collect();
        assert_eq!(articles.len(), 2);

        let first = &articles[0];
        assert_eq!(first.id.as_deref(), Some("item-1"));
        assert!(first.published_at.is_some());
        assert_eq!(first.property_str("title"), Some("First post"));
        assert_eq!(first.property_str("description"), Some("Hello world"));
        assert_eq!(first.property_str("link"), Some("https://example.com/1"));
        assert_eq!(first.property_str("tags"), Some("news,updates"));
    }

    #[tokio::test]
    async fn rejects_non_http_schemes() {
        let client = reqwest::Client::new();
        let err = fetch_feed(&client, "file:///etc/passwd").await.unwrap_err();
        assert!(err.to_string().contains("http"));
    }
}
