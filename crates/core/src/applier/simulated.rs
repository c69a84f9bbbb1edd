use crate::applier::{Applier, AttemptTag};
use crate::domain::recommendation::{Action, ResourceRef};
use crate::error::ApplierError;

/// Logs the change and reports success without touching any infrastructure. Used by dry runs.
#[derive(Debug, Clone, Default)]
pub struct SimulatedApplier;

#[async_trait::async_trait]
impl Applier for SimulatedApplier {
    fn name(&self) -> &'static str {
        "simulated"
    }

    async fn apply(
        &self,
        action: &Action,
        resource: &ResourceRef,
        tag: AttemptTag,
    ) -> Result<(), ApplierError> {
        tracing::info!(
            %resource,
            action = action.label(),
            recommendation_id = %tag.recommendation_id,
            attempt = tag.attempt_number,
            "simulated apply"
        );
        Ok(())
    }

    async fn revert(
        &self,
        action: &Action,
        resource: &ResourceRef,
        tag: AttemptTag,
    ) -> Result<(), ApplierError> {
        tracing::info!(
            %resource,
            action = action.label(),
            recommendation_id = %tag.recommendation_id,
            attempt = tag.attempt_number,
            "simulated revert"
        );
        Ok(())
    }
}
