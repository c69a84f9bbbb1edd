use crate::domain::recommendation::ResourceRef;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One forecast for one resource, as delivered by the prediction feed. Not persisted here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionInput {
    pub resource: ResourceRef,
    /// Forecast utilization in percent (0..=100), one point per forecast step.
    pub forecast_utilization: Vec<f64>,
    pub anomaly_score: f64,
    pub prediction_horizon_days: u32,
}

impl PredictionInput {
    pub fn peak(&self) -> Option<f64> {
        self.forecast_utilization
            .iter()
            .copied()
            .fold(None, |acc, v| Some(acc.map_or(v, |a: f64| a.max(v))))
    }

    pub fn mean(&self) -> Option<f64> {
        if self.forecast_utilization.is_empty() {
            return None;
        }
        let n = self.forecast_utilization.len() as f64;
        Some(self.forecast_utilization.iter().sum::<f64>() / n)
    }

    /// Population standard deviation of the forecast.
    pub fn std_dev(&self) -> Option<f64> {
        let mean = self.mean()?;
        let n = self.forecast_utilization.len() as f64;
        let var = self
            .forecast_utilization
            .iter()
            .map(|v| (v - mean).powi(2))
            .sum::<f64>()
            / n;
        Some(var.sqrt())
    }
}

/// Current usage and cost of a resource (the collectors' latest sample).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub resource: ResourceRef,
    pub monthly_cost: f64,
    pub current_spec: Option<String>,
    pub storage_class: Option<String>,
    pub avg_cpu_pct: f64,
    pub avg_memory_pct: f64,
    pub avg_network_pct: f64,
}

impl ResourceUsage {
    pub fn utilization_score(&self) -> f64 {
        utilization_score(self.avg_cpu_pct, self.avg_memory_pct, self.avg_network_pct)
    }
}

/// Weighted utilization: CPU 50%, memory 40%, network 10%, clamped to 0..=100.
pub fn utilization_score(cpu_pct: f64, memory_pct: f64, network_pct: f64) -> f64 {
    let score = cpu_pct * 0.5 + memory_pct * 0.4 + network_pct * 0.1;
    score.clamp(0.0, 100.0)
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CurrentUtilization {
    by_resource: BTreeMap<ResourceRef, ResourceUsage>,
}

impl CurrentUtilization {
    pub fn new(rows: impl IntoIterator<Item = ResourceUsage>) -> Self {
        Self {
            by_resource: rows
                .into_iter()
                .map(|row| (row.resource.clone(), row))
                .collect(),
        }
    }

    pub fn get(&self, resource: &ResourceRef) -> Option<&ResourceUsage> {
        self.by_resource.get(resource)
    }

    pub fn len(&self) -> usize {
        self.by_resource.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_resource.is_empty()
    }
}
