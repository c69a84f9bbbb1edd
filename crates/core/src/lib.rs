pub mod applier;
pub mod domain;
pub mod error;
pub mod execution;
pub mod feed;
pub mod generator;
pub mod storage;
pub mod time;
pub mod workflow;

pub mod config {
    use anyhow::Context;
    use std::str::FromStr;

    #[derive(Debug, Clone)]
    pub struct Settings {
        pub database_url: Option<String>,
        pub sentry_dsn: Option<String>,
        pub feed_base_url: Option<String>,
        pub feed_api_key: Option<String>,
        pub applier_base_url: Option<String>,
        pub applier_api_key: Option<String>,
        pub worker_id: String,
    }

    impl Settings {
        pub fn from_env() -> anyhow::Result<Self> {
            let worker_id = std::env::var("WORKER_ID")
                .ok()
                .filter(|s| !s.trim().is_empty())
                .unwrap_or_else(|| format!("worker-{}", std::process::id()));

            Ok(Self {
                database_url: std::env::var("DATABASE_URL").ok(),
                sentry_dsn: std::env::var("SENTRY_DSN").ok(),
                feed_base_url: std::env::var("FEED_BASE_URL").ok(),
                feed_api_key: std::env::var("FEED_API_KEY").ok(),
                applier_base_url: std::env::var("APPLIER_BASE_URL").ok(),
                applier_api_key: std::env::var("APPLIER_API_KEY").ok(),
                worker_id,
            })
        }

        pub fn require_database_url(&self) -> anyhow::Result<&str> {
            self.database_url
                .as_deref()
                .context("DATABASE_URL is required")
        }

        pub fn require_feed_base_url(&self) -> anyhow::Result<&str> {
            self.feed_base_url
                .as_deref()
                .context("FEED_BASE_URL is required")
        }

        pub fn require_applier_base_url(&self) -> anyhow::Result<&str> {
            self.applier_base_url
                .as_deref()
                .context("APPLIER_BASE_URL is required")
        }
    }

    /// Reads and parses an env var; unset or unparsable values yield `None`.
    pub fn env_parse<T: FromStr>(key: &str) -> Option<T> {
        std::env::var(key)
            .ok()
            .and_then(|s| s.trim().parse::<T>().ok())
    }
}
