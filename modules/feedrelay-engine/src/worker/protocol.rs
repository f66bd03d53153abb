//! Newline-delimited JSON protocol between the pool and a worker
//! process. One request line in, one reply line out.

use serde::{Deserialize, Serialize};

use feedrelay_common::Article;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchJob {
    pub link: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchReply {
    pub link: String,
    #[serde(default)]
    pub articles: Vec<Article>,
    /// Fetch or parse failure, reported in-band so the worker process
    /// survives bad feeds.
    #[serde(default)]
    pub error: Option<String>,
}
