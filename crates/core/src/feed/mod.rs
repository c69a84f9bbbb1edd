use crate::domain::contract::FeedPredictionBatch;
use anyhow::{Context, Result};
use serde_json::Value;
use std::path::{Path, PathBuf};

pub mod provider;

/// Source of one generation cycle's predictions. Returns the parsed batch and the raw
/// payload so the cycle can be audited.
#[async_trait::async_trait]
pub trait FeedClient: Send + Sync {
    fn source_name(&self) -> &'static str;

    async fn fetch_predictions(&self) -> Result<(FeedPredictionBatch, Value)>;
}

/// Replays a batch saved to disk in the wire format.
#[derive(Debug, Clone)]
pub struct FileFeed {
    path: PathBuf,
}

impl FileFeed {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait::async_trait]
impl FeedClient for FileFeed {
    fn source_name(&self) -> &'static str {
        "file"
    }

    async fn fetch_predictions(&self) -> Result<(FeedPredictionBatch, Value)> {
        load_from_file(&self.path)
    }
}

/// Reads a batch saved in the wire format, e.g. a feed export replayed by hand.
pub fn load_from_file(path: &Path) -> Result<(FeedPredictionBatch, Value)> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read feed file {}", path.display()))?;
    parse_batch(&text).with_context(|| format!("invalid feed file {}", path.display()))
}

pub fn parse_batch(text: &str) -> Result<(FeedPredictionBatch, Value)> {
    let raw = serde_json::from_str::<Value>(text).context("feed payload is not valid JSON")?;
    let batch = serde_json::from_value::<FeedPredictionBatch>(raw.clone())
        .context("failed to parse feed payload into FeedPredictionBatch")?;
    Ok((batch, raw))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_batch_and_keeps_raw_payload() {
        let payload = json!({
            "generated_at": "2026-03-01T00:00:00Z",
            "predictions": [{
                "resource_id": "i-0abc",
                "resource_type": "compute",
                "forecast_utilization": [3.0, 4.5],
                "anomaly_score": 0.1,
                "prediction_horizon_days": 7
            }]
        });

        let (batch, raw) = parse_batch(&payload.to_string()).unwrap();
        assert_eq!(batch.predictions.len(), 1);
        assert!(batch.usage.is_empty());
        assert_eq!(raw, payload);
    }

    #[test]
    fn rejects_wrong_shapes() {
        assert!(parse_batch("not json").is_err());
        assert!(parse_batch(r#"{"generated_at": "2026-03-01T00:00:00Z"}"#).is_err());

        let bad_forecast = json!({
            "generated_at": "2026-03-01T00:00:00Z",
            "predictions": [{
                "resource_id": "i-0abc",
                "resource_type": "compute",
                "forecast_utilization": ["3.0"],
                "anomaly_score": 0.1,
                "prediction_horizon_days": 7
            }]
        });
        assert!(parse_batch(&bad_forecast.to_string()).is_err());
    }

    #[test]
    fn load_from_file_reports_missing_path() {
        let err = load_from_file(Path::new("/nonexistent/feed.json")).unwrap_err();
        assert!(format!("{err:#}").contains("/nonexistent/feed.json"));
    }
}
