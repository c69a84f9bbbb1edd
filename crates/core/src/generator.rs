use crate::config::env_parse;
use crate::domain::prediction::{CurrentUtilization, PredictionInput, ResourceUsage};
use crate::domain::recommendation::{Action, Recommendation, ResourceKind};
use chrono::{DateTime, Utc};

/// Instance size suffixes, smallest first. Each step roughly doubles capacity and price.
const SIZE_LADDER: &[&str] = &[
    "nano", "micro", "small", "medium", "large", "xlarge", "2xlarge", "4xlarge", "8xlarge",
    "12xlarge", "16xlarge", "24xlarge",
];

/// Storage classes, warmest first, with price relative to STANDARD.
const STORAGE_CLASSES: &[(&str, f64)] = &[
    ("STANDARD", 1.0),
    ("STANDARD_IA", 0.54),
    ("GLACIER_IR", 0.17),
    ("DEEP_ARCHIVE", 0.04),
];

const RESIZE_SAVINGS_RATIO: f64 = 0.5;
// Stopped instances keep paying for attached storage.
const STOP_SAVINGS_RATIO: f64 = 0.9;

#[derive(Debug, Clone)]
pub struct GeneratorOptions {
    /// Forecast and current utilization (percent) must stay below this for the whole horizon.
    pub low_utilization_pct: f64,

    /// At or below this for the whole horizon counts as idle.
    pub near_zero_pct: f64,

    /// Anomaly scores at or above this suppress `Terminate` and deep storage moves.
    pub anomaly_flag_score: f64,
}

impl Default for GeneratorOptions {
    fn default() -> Self {
        Self {
            low_utilization_pct: 20.0,
            near_zero_pct: 2.0,
            anomaly_flag_score: 0.7,
        }
    }
}

impl GeneratorOptions {
    pub fn from_env() -> anyhow::Result<Self> {
        let mut out = Self::default();

        if let Some(v) = env_parse::<f64>("GEN_LOW_UTILIZATION_PCT") {
            out.low_utilization_pct = v;
        }
        if let Some(v) = env_parse::<f64>("GEN_NEAR_ZERO_PCT") {
            out.near_zero_pct = v;
        }
        if let Some(v) = env_parse::<f64>("GEN_ANOMALY_FLAG_SCORE") {
            out.anomaly_flag_score = v;
        }

        out.validate()?;
        Ok(out)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(
            self.low_utilization_pct > 0.0 && self.low_utilization_pct <= 100.0,
            "low utilization threshold must be in (0, 100] (got {})",
            self.low_utilization_pct
        );
        anyhow::ensure!(
            self.near_zero_pct >= 0.0 && self.near_zero_pct < self.low_utilization_pct,
            "near-zero threshold must be in [0, low utilization threshold) (got {})",
            self.near_zero_pct
        );
        anyhow::ensure!(
            self.anomaly_flag_score > 0.0 && self.anomaly_flag_score <= 1.0,
            "anomaly flag score must be in (0, 1] (got {})",
            self.anomaly_flag_score
        );
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub action: Action,
    pub estimated_monthly_savings: f64,
    pub risk_score: f64,
}

/// Turns one feed cycle into fresh `PENDING` recommendations. Pure apart from id generation:
/// identical inputs give identical actions, savings and risk scores.
pub fn generate(
    predictions: &[PredictionInput],
    usage: &CurrentUtilization,
    opts: &GeneratorOptions,
    generated_at: DateTime<Utc>,
) -> Vec<Recommendation> {
    let mut out = Vec::new();
    for prediction in predictions {
        let Some(current) = usage.get(&prediction.resource) else {
            tracing::debug!(resource = %prediction.resource, "no usage sample; skipping");
            continue;
        };

        if let Some(candidate) = evaluate(prediction, current, opts) {
            out.push(Recommendation::new_pending(
                prediction.resource.clone(),
                candidate.action,
                candidate.estimated_monthly_savings,
                candidate.risk_score,
                generated_at,
            ));
        }
    }
    out
}

pub fn evaluate(
    prediction: &PredictionInput,
    usage: &ResourceUsage,
    opts: &GeneratorOptions,
) -> Option<Candidate> {
    if prediction.prediction_horizon_days == 0 {
        return None;
    }
    let peak = prediction.peak()?;

    if peak >= opts.low_utilization_pct || usage.utilization_score() >= opts.low_utilization_pct {
        return None;
    }

    let near_zero = peak <= opts.near_zero_pct;
    let anomalous = prediction.anomaly_score >= opts.anomaly_flag_score;
    let aggressive = near_zero && !anomalous;

    let (action, savings_ratio) = match prediction.resource.kind {
        // Already billed per invocation.
        ResourceKind::Function => return None,
        ResourceKind::Storage => {
            let steps = if aggressive { 2 } else { 1 };
            let (target, ratio) = colder_storage_class(usage.storage_class.as_deref(), steps)?;
            (
                Action::MigrateStorageClass {
                    target: target.to_string(),
                },
                1.0 - ratio,
            )
        }
        ResourceKind::Compute | ResourceKind::Database => {
            if aggressive {
                (Action::Terminate, 1.0)
            } else {
                match usage.current_spec.as_deref().and_then(smaller_spec) {
                    Some(new_spec) => (Action::Resize { new_spec }, RESIZE_SAVINGS_RATIO),
                    None => (Action::Stop, STOP_SAVINGS_RATIO),
                }
            }
        }
    };

    let estimated_monthly_savings = round_to(usage.monthly_cost * savings_ratio, 2);
    if estimated_monthly_savings <= 0.0 {
        return None;
    }

    Some(Candidate {
        action,
        estimated_monthly_savings,
        risk_score: risk_score(prediction, opts),
    })
}

/// Higher with anomaly score and forecast volatility, lower with longer horizons.
pub fn risk_score(prediction: &PredictionInput, opts: &GeneratorOptions) -> f64 {
    let horizon = prediction.prediction_horizon_days as f64;
    let horizon_term = 7.0 / (7.0 + horizon);
    let volatility = prediction
        .std_dev()
        .map(|sd| (sd / opts.low_utilization_pct).min(1.0))
        .unwrap_or(1.0);
    let anomaly = prediction.anomaly_score.clamp(0.0, 1.0);

    let raw = 0.5 * anomaly + 0.3 * horizon_term + 0.2 * volatility;
    round_to(raw.clamp(0.0, 1.0), 4)
}

fn smaller_spec(spec: &str) -> Option<String> {
    let (family, size) = spec.rsplit_once('.')?;
    let idx = SIZE_LADDER.iter().position(|s| *s == size)?;
    if idx == 0 {
        return None;
    }
    Some(format!("{family}.{}", SIZE_LADDER[idx - 1]))
}

/// Returns the target class and its price relative to the current class.
fn colder_storage_class(current: Option<&str>, steps: usize) -> Option<(&'static str, f64)> {
    let current = current.unwrap_or("STANDARD").to_ascii_uppercase();
    let idx = STORAGE_CLASSES.iter().position(|(name, _)| *name == current)?;
    let target_idx = (idx + steps).min(STORAGE_CLASSES.len() - 1);
    if target_idx == idx {
        return None;
    }
    let (target, target_price) = STORAGE_CLASSES[target_idx];
    Some((target, target_price / STORAGE_CLASSES[idx].1))
}

fn round_to(v: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (v * factor).round() / factor
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::recommendation::{ResourceRef, Status};
    use chrono::TimeZone;

    fn usage(kind: ResourceKind, id: &str, cost: f64, spec: Option<&str>) -> ResourceUsage {
        ResourceUsage {
            resource: ResourceRef::new(kind, id),
            monthly_cost: cost,
            current_spec: spec.map(str::to_string),
            storage_class: None,
            avg_cpu_pct: 5.0,
            avg_memory_pct: 10.0,
            avg_network_pct: 1.0,
        }
    }

    fn prediction(kind: ResourceKind, id: &str, forecast: &[f64], anomaly: f64) -> PredictionInput {
        PredictionInput {
            resource: ResourceRef::new(kind, id),
            forecast_utilization: forecast.to_vec(),
            anomaly_score: anomaly,
            prediction_horizon_days: 14,
        }
    }

    #[test]
    fn low_utilization_compute_is_resized_one_step() {
        let opts = GeneratorOptions::default();
        let c = evaluate(
            &prediction(ResourceKind::Compute, "i-1", &[8.0, 12.0, 10.0], 0.1),
            &usage(ResourceKind::Compute, "i-1", 120.0, Some("m5.xlarge")),
            &opts,
        )
        .unwrap();

        assert_eq!(
            c.action,
            Action::Resize {
                new_spec: "m5.large".to_string()
            }
        );
        assert_eq!(c.estimated_monthly_savings, 60.0);
    }

    #[test]
    fn idle_compute_without_anomaly_is_terminated() {
        let opts = GeneratorOptions::default();
        let c = evaluate(
            &prediction(ResourceKind::Compute, "i-1", &[0.5, 1.0, 0.0], 0.1),
            &usage(ResourceKind::Compute, "i-1", 99.99, Some("m5.xlarge")),
            &opts,
        )
        .unwrap();
        assert_eq!(c.action, Action::Terminate);
        assert_eq!(c.estimated_monthly_savings, 99.99);
    }

    #[test]
    fn anomaly_suppresses_terminate() {
        let opts = GeneratorOptions::default();
        let c = evaluate(
            &prediction(ResourceKind::Database, "db-1", &[0.5, 1.0], 0.9),
            &usage(ResourceKind::Database, "db-1", 200.0, Some("db.r5.large")),
            &opts,
        )
        .unwrap();
        assert_eq!(
            c.action,
            Action::Resize {
                new_spec: "db.r5.medium".to_string()
            }
        );
    }

    #[test]
    fn smallest_or_unknown_size_is_stopped() {
        let opts = GeneratorOptions::default();
        let p = prediction(ResourceKind::Compute, "i-1", &[5.0, 6.0], 0.0);

        let c = evaluate(&p, &usage(ResourceKind::Compute, "i-1", 10.0, Some("t3.nano")), &opts)
            .unwrap();
        assert_eq!(c.action, Action::Stop);
        assert_eq!(c.estimated_monthly_savings, 9.0);

        let c = evaluate(&p, &usage(ResourceKind::Compute, "i-1", 10.0, None), &opts).unwrap();
        assert_eq!(c.action, Action::Stop);
    }

    #[test]
    fn any_forecast_point_above_threshold_blocks_action() {
        let opts = GeneratorOptions::default();
        let u = usage(ResourceKind::Compute, "i-1", 120.0, Some("m5.xlarge"));
        assert!(evaluate(
            &prediction(ResourceKind::Compute, "i-1", &[5.0, 25.0, 5.0], 0.0),
            &u,
            &opts
        )
        .is_none());

        let busy_now = ResourceUsage {
            avg_cpu_pct: 60.0,
            ..u
        };
        assert!(evaluate(
            &prediction(ResourceKind::Compute, "i-1", &[5.0, 5.0], 0.0),
            &busy_now,
            &opts
        )
        .is_none());
    }

    #[test]
    fn storage_moves_to_colder_class() {
        let opts = GeneratorOptions::default();
        let u = usage(ResourceKind::Storage, "bucket-1", 100.0, None);

        let c = evaluate(
            &prediction(ResourceKind::Storage, "bucket-1", &[10.0], 0.0),
            &u,
            &opts,
        )
        .unwrap();
        assert_eq!(
            c.action,
            Action::MigrateStorageClass {
                target: "STANDARD_IA".to_string()
            }
        );
        assert_eq!(c.estimated_monthly_savings, 46.0);

        let c = evaluate(
            &prediction(ResourceKind::Storage, "bucket-1", &[0.0], 0.0),
            &u,
            &opts,
        )
        .unwrap();
        assert_eq!(
            c.action,
            Action::MigrateStorageClass {
                target: "GLACIER_IR".to_string()
            }
        );

        let coldest = ResourceUsage {
            storage_class: Some("DEEP_ARCHIVE".to_string()),
            ..u
        };
        assert!(evaluate(
            &prediction(ResourceKind::Storage, "bucket-1", &[0.0], 0.0),
            &coldest,
            &opts
        )
        .is_none());
    }

    #[test]
    fn functions_and_empty_forecasts_are_skipped() {
        let opts = GeneratorOptions::default();
        assert!(evaluate(
            &prediction(ResourceKind::Function, "fn-1", &[0.0], 0.0),
            &usage(ResourceKind::Function, "fn-1", 50.0, None),
            &opts
        )
        .is_none());
        assert!(evaluate(
            &prediction(ResourceKind::Compute, "i-1", &[], 0.0),
            &usage(ResourceKind::Compute, "i-1", 50.0, None),
            &opts
        )
        .is_none());
    }

    #[test]
    fn risk_rises_with_anomaly_and_falls_with_horizon() {
        let opts = GeneratorOptions::default();
        let calm = prediction(ResourceKind::Compute, "i-1", &[5.0, 5.0], 0.1);
        let spiky = PredictionInput {
            anomaly_score: 0.6,
            ..calm.clone()
        };
        let long = PredictionInput {
            prediction_horizon_days: 60,
            ..calm.clone()
        };

        assert!(risk_score(&spiky, &opts) > risk_score(&calm, &opts));
        assert!(risk_score(&long, &opts) < risk_score(&calm, &opts));
        for p in [&calm, &spiky, &long] {
            let r = risk_score(p, &opts);
            assert!((0.0..=1.0).contains(&r));
        }
    }

    #[test]
    fn generate_is_reproducible() {
        let opts = GeneratorOptions::default();
        let at = Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap();
        let predictions = vec![
            prediction(ResourceKind::Compute, "i-1", &[8.0, 12.0], 0.2),
            prediction(ResourceKind::Compute, "i-2", &[0.0, 0.1], 0.0),
            prediction(ResourceKind::Compute, "i-missing", &[0.0], 0.0),
        ];
        let current = CurrentUtilization::new(vec![
            usage(ResourceKind::Compute, "i-1", 120.0, Some("m5.xlarge")),
            usage(ResourceKind::Compute, "i-2", 80.0, Some("m5.large")),
        ]);

        let a = generate(&predictions, &current, &opts, at);
        let b = generate(&predictions, &current, &opts, at);

        assert_eq!(a.len(), 2);
        assert_eq!(a.len(), b.len());
        for (x, y) in a.iter().zip(&b) {
            assert_ne!(x.id, y.id);
            assert_eq!(x.action, y.action);
            assert_eq!(x.estimated_monthly_savings, y.estimated_monthly_savings);
            assert_eq!(x.risk_score, y.risk_score);
            assert_eq!(x.status, Status::Pending);
            assert_eq!(x.history.len(), 1);
        }
    }

    #[test]
    fn options_validation() {
        assert!(GeneratorOptions::default().validate().is_ok());
        let bad = GeneratorOptions {
            near_zero_pct: 30.0,
            ..GeneratorOptions::default()
        };
        assert!(bad.validate().is_err());
    }
}
