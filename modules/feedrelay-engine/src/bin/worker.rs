//! Worker process: reads fetch jobs from stdin as JSON lines, fetches
//! and parses the feed, writes one reply line per job to stdout.
//! Stdout carries the protocol, so logs go to stderr.

use std::time::Duration;

use anyhow::Result;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

use feedrelay_engine::worker::fetch::fetch_feed;
use feedrelay_engine::worker::protocol::{FetchJob, FetchReply};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("feedrelay=info".parse()?))
        .with_writer(std::io::stderr)
        .init();

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(30))
        .user_agent("feedrelay")
        .build()?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let job: FetchJob = match serde_json::from_str(&line) {
            Ok(job) => job,
            Err(e) => {
                warn!(error = %e, "Malformed job line, skipping");
                continue;
            }
        };
        // Fetch and parse failures go back in-band; the process stays
        // up for the next job.
        let reply = match fetch_feed(&client, &job.link).await {
            Ok(articles) => {
                debug!(link = %job.link, articles = articles.len(), "Fetched feed");
                FetchReply {
                    link: job.link,
                    articles,
                    error: None,
                }
            }
            Err(e) => FetchReply {
                link: job.link,
                articles: Vec::new(),
                error: Some(format!("{e:#}")),
            },
        };
        let mut out = serde_json::to_string(&reply)?;
        out.push('\n');
        stdout.write_all(out.as_bytes()).await?;
        stdout.flush().await?;
    }
    Ok(())
}
