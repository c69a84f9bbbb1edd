use anyhow::Context;
use rightsize_core::domain::contract::FeedPredictionBatch;
use rightsize_core::domain::recommendation::Status;
use rightsize_core::generator::{generate, GeneratorOptions};
use rightsize_core::storage::RecommendationStore;
use rightsize_core::workflow::ApprovalWorkflow;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub generated: usize,
    pub created: usize,
    /// Resources that already have an open (non-terminal) recommendation.
    pub skipped_open: usize,
    pub auto_approved: usize,
    pub awaiting_review: usize,
    /// Created but left `PENDING` because routing failed; reconciliation picks them up.
    pub routing_failed: usize,
}

/// feed batch -> generator -> store -> approval routing.
pub async fn run_cycle(
    store: &dyn RecommendationStore,
    workflow: &ApprovalWorkflow,
    batch: FeedPredictionBatch,
    opts: &GeneratorOptions,
) -> anyhow::Result<CycleReport> {
    let feed = batch
        .validate_and_into_inputs()
        .context("feed batch failed validation")?;
    tracing::info!(
        generated_at = %feed.generated_at,
        predictions = feed.predictions.len(),
        usage_rows = feed.usage.len(),
        "feed batch accepted"
    );

    let recs = generate(&feed.predictions, &feed.usage, opts, feed.generated_at);
    let mut report = CycleReport {
        generated: recs.len(),
        ..CycleReport::default()
    };

    for rec in recs {
        let open = store.list_open_for_resource(&rec.resource).await?;
        if let Some(existing) = open.first() {
            tracing::debug!(
                resource = %rec.resource,
                existing_id = %existing.id,
                status = %existing.status,
                "open recommendation exists; skipping"
            );
            report.skipped_open += 1;
            continue;
        }

        store.create(&rec).await?;
        report.created += 1;

        match workflow.submit(rec.id).await {
            Ok(routed) if routed.status == Status::AutoApproved => report.auto_approved += 1,
            Ok(_) => report.awaiting_review += 1,
            Err(err) => {
                tracing::warn!(
                    recommendation_id = %rec.id,
                    resource = %rec.resource,
                    error = %err,
                    "routing failed; left pending for reconciliation"
                );
                report.routing_failed += 1;
            }
        }
    }

    Ok(report)
}
