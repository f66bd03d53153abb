use std::env;

use tracing::info;

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Coordination backend. Absent = in-process delivery lock only.
    pub redis_url: Option<String>,

    // Destination platform REST API
    pub chat_api_base: String,
    pub chat_api_token: String,

    // Subscription/subscriber seed file (the config CRUD layer is an
    // external collaborator; the service only reads its output)
    pub seed_file: String,

    // Dedup defaults (per-subscription settings override these)
    pub check_dates: bool,
    pub cycle_max_age_days: i64,

    // Worker pool
    pub worker_bin: String,
    /// Max live workers. 0 = unbounded.
    pub worker_cap: usize,

    // Cycle cadence
    pub cycle_interval_secs: u64,
    pub consistency_interval_secs: u64,
    /// Bound on concurrent user-existence fetches in the consistency job.
    pub consistency_concurrency: usize,
}

impl Config {
    /// Load configuration from environment variables.
    /// Panics with a clear message if required vars are missing.
    pub fn from_env() -> Self {
        Self {
            redis_url: env::var("REDIS_URL").ok(),
            chat_api_base: env::var("CHAT_API_BASE")
                .unwrap_or_else(|_| "https://discord.com/api/v9".to_string()),
            chat_api_token: required_env("CHAT_API_TOKEN"),
            seed_file: env::var("SEED_FILE").unwrap_or_else(|_| "feedrelay.json".to_string()),
            check_dates: parsed_env("CHECK_DATES", true),
            cycle_max_age_days: parsed_env("CYCLE_MAX_AGE_DAYS", 1),
            worker_bin: env::var("WORKER_BIN").unwrap_or_else(|_| "feedrelay-worker".to_string()),
            worker_cap: parsed_env("WORKER_CAP", 10),
            cycle_interval_secs: parsed_env("CYCLE_INTERVAL_SECS", 600),
            consistency_interval_secs: parsed_env("CONSISTENCY_INTERVAL_SECS", 3600),
            consistency_concurrency: parsed_env("CONSISTENCY_CONCURRENCY", 8),
        }
    }

    /// Log the loaded configuration without secrets.
    pub fn log_redacted(&self) {
        info!(
            coordinated = self.redis_url.is_some(),
            chat_api_base = %self.chat_api_base,
            seed_file = %self.seed_file,
            check_dates = self.check_dates,
            cycle_max_age_days = self.cycle_max_age_days,
            worker_cap = self.worker_cap,
            cycle_interval_secs = self.cycle_interval_secs,
            "Configuration loaded"
        );
    }
}

fn required_env(key: &str) -> String {
    env::var(key).unwrap_or_else(|_| panic!("{key} environment variable is required"))
}

fn parsed_env<T: std::str::FromStr>(key: &str, default: T) -> T {
    match env::var(key) {
        Ok(raw) => raw
            .parse()
            .unwrap_or_else(|_| panic!("{key} has an invalid value: {raw}")),
        Err(_) => default,
    }
}
