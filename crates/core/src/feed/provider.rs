use crate::config::{env_parse, Settings};
use crate::domain::contract::FeedPredictionBatch;
use crate::feed::FeedClient;
use anyhow::{Context, Result};
use reqwest::header::{HeaderMap, HeaderValue};
use serde_json::Value;
use std::time::Duration;

const DEFAULT_TIMEOUT_SECS: u64 = 30;
const DEFAULT_PATH: &str = "/v1/predictions/latest";
const DEFAULT_RETRIES: u32 = 3;

/// Prediction feed served as JSON over HTTP.
#[derive(Debug, Clone)]
pub struct HttpJsonFeed {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    path: String,
    retries: u32,
}

impl HttpJsonFeed {
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        let base_url = settings.require_feed_base_url()?.to_string();
        let api_key = settings.feed_api_key.clone();

        let timeout_secs = env_parse::<u64>("FEED_TIMEOUT_SECS").unwrap_or(DEFAULT_TIMEOUT_SECS);
        let retries = env_parse::<u32>("FEED_RETRIES")
            .unwrap_or(DEFAULT_RETRIES)
            .max(1);

        let path = std::env::var("FEED_PREDICTIONS_PATH")
            .ok()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_PATH.to_string());

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .context("failed to build feed http client")?;

        Ok(Self {
            http,
            base_url,
            api_key,
            path,
            retries,
        })
    }

    fn url(&self) -> String {
        let path = if self.path.starts_with('/') {
            self.path.clone()
        } else {
            format!("/{}", self.path)
        };

        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }

    fn headers(&self) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        if let Some(api_key) = &self.api_key {
            headers.insert("x-api-key", HeaderValue::from_str(api_key)?);
        }
        Ok(headers)
    }

    async fn fetch_once(&self) -> Result<(FeedPredictionBatch, Value)> {
        let res = self
            .http
            .get(self.url())
            .headers(self.headers()?)
            .send()
            .await
            .context("feed request failed")?;

        let status = res.status();
        let text = res.text().await.context("failed to read feed response")?;
        if !status.is_success() {
            anyhow::bail!("feed HTTP {status}: {}", text.trim());
        }

        crate::feed::parse_batch(&text)
    }
}

#[async_trait::async_trait]
impl FeedClient for HttpJsonFeed {
    fn source_name(&self) -> &'static str {
        "http_json"
    }

    async fn fetch_predictions(&self) -> Result<(FeedPredictionBatch, Value)> {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            match self.fetch_once().await {
                Ok(out) => return Ok(out),
                Err(err) => {
                    if attempt >= self.retries {
                        return Err(err);
                    }
                    let backoff = Duration::from_secs(1 << (attempt - 1).min(6));
                    tracing::warn!(attempt, ?backoff, error = %err, "feed fetch failed; retrying");
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }
}
