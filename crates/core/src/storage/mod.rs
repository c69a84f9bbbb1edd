use crate::domain::recommendation::{
    Actor, ExecutionAttempt, Recommendation, ResourceRef, SavingsSummary, Status,
};
use crate::error::EngineError;
use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

pub mod attempts;
pub mod lock;
pub mod memory;
pub mod pg;
pub mod recommendations;
pub mod runs;

pub async fn migrate(pool: &sqlx::PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .context("sqlx migrations failed")?;
    Ok(())
}

/// Who is asking for a status change, when, and why.
#[derive(Debug, Clone)]
pub struct StatusChange {
    pub actor: Actor,
    pub at: DateTime<Utc>,
    pub note: Option<String>,
}

impl StatusChange {
    pub fn system(note: Option<String>) -> Self {
        Self {
            actor: Actor::System,
            at: Utc::now(),
            note,
        }
    }

    pub fn by(actor: Actor, note: Option<String>) -> Self {
        Self {
            actor,
            at: Utc::now(),
            note,
        }
    }
}

/// Time-boxed exclusive ownership of one recommendation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub recommendation_id: Uuid,
    pub owner: String,
    pub token: Uuid,
    pub expires_at: DateTime<Utc>,
}

/// Durable source of truth for recommendations. Every call is atomic for a single record.
#[async_trait::async_trait]
pub trait RecommendationStore: Send + Sync {
    async fn create(&self, rec: &Recommendation) -> Result<(), EngineError>;

    async fn get(&self, id: Uuid) -> Result<Recommendation, EngineError>;

    /// Moves `id` from `expected` to `next` and appends the history entry in one write.
    /// Fails with `ConcurrentModification` if the stored status is not `expected`, and with
    /// `InvalidTransition` if the edge is not part of the lifecycle. Both leave state untouched.
    async fn compare_and_set_status(
        &self,
        id: Uuid,
        expected: Status,
        next: Status,
        change: StatusChange,
    ) -> Result<Recommendation, EngineError>;

    async fn list_by_status(&self, status: Status) -> Result<Vec<Recommendation>, EngineError>;

    /// Non-terminal recommendations targeting `resource`.
    async fn list_open_for_resource(
        &self,
        resource: &ResourceRef,
    ) -> Result<Vec<Recommendation>, EngineError>;

    /// Returns `None` while another owner holds an unexpired lease.
    async fn try_acquire_lease(
        &self,
        id: Uuid,
        owner: &str,
        ttl: Duration,
    ) -> Result<Option<Lease>, EngineError>;

    /// Only the token holder can release; a stale token is a no-op.
    async fn release_lease(&self, lease: &Lease) -> Result<(), EngineError>;

    /// Closes any abandoned in-flight attempt, then opens the next numbered one.
    async fn begin_attempt(
        &self,
        id: Uuid,
        started_at: DateTime<Utc>,
    ) -> Result<ExecutionAttempt, EngineError>;

    async fn finish_attempt(&self, attempt: &ExecutionAttempt) -> Result<(), EngineError>;

    async fn list_attempts(&self, id: Uuid) -> Result<Vec<ExecutionAttempt>, EngineError>;

    /// Savings of `SUCCEEDED` recommendations completed in `[start, end)`.
    async fn realized_savings(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<SavingsSummary, EngineError>;
}

pub(crate) const ABANDONED_ATTEMPT_REASON: &str = "abandoned: lease expired before completion";

pub(crate) fn ttl_to_chrono(ttl: Duration) -> anyhow::Result<chrono::Duration> {
    chrono::Duration::from_std(ttl).context("lease ttl out of range")
}
