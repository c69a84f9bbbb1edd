use crate::domain::prediction::{CurrentUtilization, PredictionInput, ResourceUsage};
use crate::domain::recommendation::{ResourceKind, ResourceRef};
use anyhow::ensure;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Wire payload of one prediction feed cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedPredictionBatch {
    pub generated_at: DateTime<Utc>,
    pub predictions: Vec<FeedPrediction>,
    #[serde(default)]
    pub usage: Vec<FeedUsage>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedPrediction {
    pub resource_id: String,
    pub resource_type: String,
    pub forecast_utilization: Vec<f64>,
    pub anomaly_score: f64,
    pub prediction_horizon_days: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedUsage {
    pub resource_id: String,
    pub resource_type: String,
    pub monthly_cost: f64,
    pub current_spec: Option<String>,
    pub storage_class: Option<String>,
    #[serde(default)]
    pub avg_cpu_pct: f64,
    #[serde(default)]
    pub avg_memory_pct: f64,
    #[serde(default)]
    pub avg_network_pct: f64,
}

#[derive(Debug, Clone)]
pub struct ValidatedFeed {
    pub generated_at: DateTime<Utc>,
    pub predictions: Vec<PredictionInput>,
    pub usage: CurrentUtilization,
}

impl FeedPredictionBatch {
    pub fn validate_and_into_inputs(self) -> anyhow::Result<ValidatedFeed> {
        let mut predictions = Vec::with_capacity(self.predictions.len());
        for p in self.predictions {
            predictions.push(p.validate_and_into_input()?);
        }

        let mut seen = BTreeSet::<ResourceRef>::new();
        let mut usage = Vec::with_capacity(self.usage.len());
        for u in self.usage {
            let row = u.validate_and_into_usage()?;
            ensure!(
                seen.insert(row.resource.clone()),
                "duplicate usage row for {}",
                row.resource
            );
            usage.push(row);
        }

        Ok(ValidatedFeed {
            generated_at: self.generated_at,
            predictions,
            usage: CurrentUtilization::new(usage),
        })
    }
}

fn resource_ref(resource_id: &str, resource_type: &str) -> anyhow::Result<ResourceRef> {
    let id = resource_id.trim();
    ensure!(!id.is_empty(), "resource_id must be non-empty");
    let kind: ResourceKind = resource_type.parse()?;
    Ok(ResourceRef::new(kind, id))
}

impl FeedPrediction {
    fn validate_and_into_input(self) -> anyhow::Result<PredictionInput> {
        let resource = resource_ref(&self.resource_id, &self.resource_type)?;

        ensure!(
            (0.0..=1.0).contains(&self.anomaly_score),
            "anomaly_score must be between 0 and 1 for {resource} (got {})",
            self.anomaly_score
        );
        ensure!(
            self.forecast_utilization.iter().all(|v| v.is_finite() && *v >= 0.0),
            "forecast_utilization must be finite and non-negative for {resource}"
        );

        Ok(PredictionInput {
            resource,
            forecast_utilization: self.forecast_utilization,
            anomaly_score: self.anomaly_score,
            prediction_horizon_days: self.prediction_horizon_days,
        })
    }
}

impl FeedUsage {
    fn validate_and_into_usage(self) -> anyhow::Result<ResourceUsage> {
        let resource = resource_ref(&self.resource_id, &self.resource_type)?;

        ensure!(
            self.monthly_cost.is_finite() && self.monthly_cost >= 0.0,
            "monthly_cost must be non-negative for {resource} (got {})",
            self.monthly_cost
        );

        let trimmed = |s: Option<String>| s.map(|s| s.trim().to_string()).filter(|s| !s.is_empty());

        Ok(ResourceUsage {
            resource,
            monthly_cost: self.monthly_cost,
            current_spec: trimmed(self.current_spec),
            storage_class: trimmed(self.storage_class),
            avg_cpu_pct: self.avg_cpu_pct,
            avg_memory_pct: self.avg_memory_pct,
            avg_network_pct: self.avg_network_pct,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn batch(value: serde_json::Value) -> FeedPredictionBatch {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn accepts_valid_batch() {
        let feed = batch(json!({
            "generated_at": "2026-03-01T00:00:00Z",
            "predictions": [{
                "resource_id": "i-0abc",
                "resource_type": "EC2",
                "forecast_utilization": [3.0, 4.5],
                "anomaly_score": 0.1,
                "prediction_horizon_days": 14
            }],
            "usage": [{
                "resource_id": "i-0abc",
                "resource_type": "compute",
                "monthly_cost": 120.0,
                "current_spec": " m5.xlarge ",
                "storage_class": ""
            }]
        }))
        .validate_and_into_inputs()
        .unwrap();

        assert_eq!(feed.predictions.len(), 1);
        let resource = ResourceRef::new(ResourceKind::Compute, "i-0abc");
        assert_eq!(feed.predictions[0].resource, resource);
        let usage = feed.usage.get(&resource).unwrap();
        assert_eq!(usage.current_spec.as_deref(), Some("m5.xlarge"));
        assert_eq!(usage.storage_class, None);
    }

    #[test]
    fn usage_is_optional() {
        let feed = batch(json!({
            "generated_at": "2026-03-01T00:00:00Z",
            "predictions": []
        }))
        .validate_and_into_inputs()
        .unwrap();
        assert!(feed.usage.is_empty());
    }

    #[test]
    fn rejects_out_of_range_anomaly_score() {
        let res = batch(json!({
            "generated_at": "2026-03-01T00:00:00Z",
            "predictions": [{
                "resource_id": "i-0abc",
                "resource_type": "compute",
                "forecast_utilization": [3.0],
                "anomaly_score": 1.5,
                "prediction_horizon_days": 7
            }]
        }))
        .validate_and_into_inputs();
        assert!(res.is_err());
    }

    #[test]
    fn rejects_unknown_kind_and_duplicate_usage() {
        let unknown = batch(json!({
            "generated_at": "2026-03-01T00:00:00Z",
            "predictions": [{
                "resource_id": "q-1",
                "resource_type": "queue",
                "forecast_utilization": [],
                "anomaly_score": 0.0,
                "prediction_horizon_days": 7
            }]
        }))
        .validate_and_into_inputs();
        assert!(unknown.is_err());

        let row = json!({
            "resource_id": "vol-1",
            "resource_type": "storage",
            "monthly_cost": 10.0
        });
        let dup = batch(json!({
            "generated_at": "2026-03-01T00:00:00Z",
            "predictions": [],
            "usage": [row.clone(), row]
        }))
        .validate_and_into_inputs();
        assert!(dup.is_err());
    }

    #[test]
    fn rejects_negative_cost() {
        let res = batch(json!({
            "generated_at": "2026-03-01T00:00:00Z",
            "predictions": [],
            "usage": [{
                "resource_id": "db-1",
                "resource_type": "rds",
                "monthly_cost": -1.0
            }]
        }))
        .validate_and_into_inputs();
        assert!(res.is_err());
    }
}
