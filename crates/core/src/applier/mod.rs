use crate::domain::recommendation::{Action, ResourceRef};
use crate::error::ApplierError;
use serde::Serialize;
use uuid::Uuid;

pub mod http;
pub mod simulated;

/// Identifies one call so the applier can deduplicate repeated deliveries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AttemptTag {
    pub recommendation_id: Uuid,
    pub attempt_number: u32,
    pub try_number: u32,
}

impl AttemptTag {
    pub fn idempotency_key(&self, op: &str) -> String {
        format!(
            "{}:{}:{}:{op}",
            self.recommendation_id, self.attempt_number, self.try_number
        )
    }
}

/// Executes or reverts infrastructure changes. `Ok(())` means the change is in place.
#[async_trait::async_trait]
pub trait Applier: Send + Sync {
    fn name(&self) -> &'static str;

    async fn apply(
        &self,
        action: &Action,
        resource: &ResourceRef,
        tag: AttemptTag,
    ) -> Result<(), ApplierError>;

    async fn revert(
        &self,
        action: &Action,
        resource: &ResourceRef,
        tag: AttemptTag,
    ) -> Result<(), ApplierError>;
}
