use anyhow::Context;
use chrono::{DateTime, Utc};
use rightsize_core::domain::contract::{FeedPrediction, FeedPredictionBatch, FeedUsage};
use rightsize_core::feed::FeedClient;
use serde_json::Value;

/// Deterministic feed for `--dry-run`: a small fleet covering every generator branch.
#[derive(Debug, Clone)]
pub struct StubFeed {
    generated_at: DateTime<Utc>,
}

impl StubFeed {
    pub fn new(generated_at: DateTime<Utc>) -> Self {
        Self { generated_at }
    }
}

#[async_trait::async_trait]
impl FeedClient for StubFeed {
    fn source_name(&self) -> &'static str {
        "stub"
    }

    async fn fetch_predictions(&self) -> anyhow::Result<(FeedPredictionBatch, Value)> {
        let batch = stub_batch(self.generated_at);
        let raw = serde_json::to_value(&batch).context("serialize stub batch failed")?;
        Ok((batch, raw))
    }
}

struct Row {
    id: &'static str,
    kind: &'static str,
    forecast: &'static [f64],
    anomaly: f64,
    horizon_days: u32,
    monthly_cost: f64,
    spec: Option<&'static str>,
    storage_class: Option<&'static str>,
    // cpu, memory, network
    avg: (f64, f64, f64),
}

const FLEET: &[Row] = &[
    Row {
        id: "i-idle01",
        kind: "compute",
        forecast: &[0.5, 1.0, 0.8],
        anomaly: 0.05,
        horizon_days: 14,
        monthly_cost: 70.0,
        spec: Some("m5.large"),
        storage_class: None,
        avg: (1.0, 3.0, 0.5),
    },
    Row {
        id: "i-low02",
        kind: "compute",
        forecast: &[8.0, 10.0, 12.0],
        anomaly: 0.1,
        horizon_days: 7,
        monthly_cost: 400.0,
        spec: Some("m5.2xlarge"),
        storage_class: None,
        avg: (9.0, 15.0, 2.0),
    },
    Row {
        id: "db-reporting",
        kind: "database",
        forecast: &[5.0, 6.0],
        anomaly: 0.2,
        horizon_days: 30,
        monthly_cost: 180.0,
        spec: None,
        storage_class: None,
        avg: (5.0, 12.0, 1.0),
    },
    Row {
        id: "logs-archive",
        kind: "storage",
        forecast: &[0.1, 0.1],
        anomaly: 0.0,
        horizon_days: 30,
        monthly_cost: 120.0,
        spec: None,
        storage_class: Some("STANDARD"),
        avg: (0.0, 0.0, 0.2),
    },
    Row {
        id: "fn-thumbnails",
        kind: "function",
        forecast: &[1.0, 2.0],
        anomaly: 0.0,
        horizon_days: 7,
        monthly_cost: 15.0,
        spec: None,
        storage_class: None,
        avg: (1.0, 1.0, 1.0),
    },
    Row {
        id: "i-busy03",
        kind: "compute",
        forecast: &[55.0, 70.0],
        anomaly: 0.1,
        horizon_days: 7,
        monthly_cost: 300.0,
        spec: Some("c5.xlarge"),
        storage_class: None,
        avg: (60.0, 50.0, 20.0),
    },
    Row {
        id: "i-spiky04",
        kind: "compute",
        forecast: &[1.0, 1.5],
        anomaly: 0.85,
        horizon_days: 7,
        monthly_cost: 90.0,
        spec: Some("t3.micro"),
        storage_class: None,
        avg: (1.0, 4.0, 0.5),
    },
];

pub fn stub_batch(generated_at: DateTime<Utc>) -> FeedPredictionBatch {
    let predictions = FLEET
        .iter()
        .map(|r| FeedPrediction {
            resource_id: r.id.to_string(),
            resource_type: r.kind.to_string(),
            forecast_utilization: r.forecast.to_vec(),
            anomaly_score: r.anomaly,
            prediction_horizon_days: r.horizon_days,
        })
        .collect();

    let usage = FLEET
        .iter()
        .map(|r| FeedUsage {
            resource_id: r.id.to_string(),
            resource_type: r.kind.to_string(),
            monthly_cost: r.monthly_cost,
            current_spec: r.spec.map(str::to_string),
            storage_class: r.storage_class.map(str::to_string),
            avg_cpu_pct: r.avg.0,
            avg_memory_pct: r.avg.1,
            avg_network_pct: r.avg.2,
        })
        .collect();

    FeedPredictionBatch {
        generated_at,
        predictions,
        usage,
    }
}
