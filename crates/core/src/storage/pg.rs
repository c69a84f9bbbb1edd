use crate::domain::recommendation::{
    ExecutionAttempt, Recommendation, ResourceRef, SavingsSummary, Status,
};
use crate::error::EngineError;
use crate::storage::{attempts, lock, recommendations, Lease, RecommendationStore, StatusChange};
use chrono::{DateTime, Utc};
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: sqlx::PgPool,
}

impl PgStore {
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl RecommendationStore for PgStore {
    async fn create(&self, rec: &Recommendation) -> Result<(), EngineError> {
        Ok(recommendations::insert(&self.pool, rec).await?)
    }

    async fn get(&self, id: Uuid) -> Result<Recommendation, EngineError> {
        recommendations::fetch(&self.pool, id)
            .await?
            .ok_or(EngineError::NotFound { id })
    }

    async fn compare_and_set_status(
        &self,
        id: Uuid,
        expected: Status,
        next: Status,
        change: StatusChange,
    ) -> Result<Recommendation, EngineError> {
        recommendations::compare_and_set_status(&self.pool, id, expected, next, change).await
    }

    async fn list_by_status(&self, status: Status) -> Result<Vec<Recommendation>, EngineError> {
        Ok(recommendations::fetch_by_status(&self.pool, status).await?)
    }

    async fn list_open_for_resource(
        &self,
        resource: &ResourceRef,
    ) -> Result<Vec<Recommendation>, EngineError> {
        Ok(recommendations::fetch_open_for_resource(&self.pool, resource).await?)
    }

    async fn try_acquire_lease(
        &self,
        id: Uuid,
        owner: &str,
        ttl: Duration,
    ) -> Result<Option<Lease>, EngineError> {
        Ok(lock::try_acquire_lease(&self.pool, id, owner, ttl).await?)
    }

    async fn release_lease(&self, lease: &Lease) -> Result<(), EngineError> {
        Ok(lock::release_lease(&self.pool, lease).await?)
    }

    async fn begin_attempt(
        &self,
        id: Uuid,
        started_at: DateTime<Utc>,
    ) -> Result<ExecutionAttempt, EngineError> {
        Ok(attempts::begin(&self.pool, id, started_at).await?)
    }

    async fn finish_attempt(&self, attempt: &ExecutionAttempt) -> Result<(), EngineError> {
        Ok(attempts::finish(&self.pool, attempt).await?)
    }

    async fn list_attempts(&self, id: Uuid) -> Result<Vec<ExecutionAttempt>, EngineError> {
        Ok(attempts::list(&self.pool, id).await?)
    }

    async fn realized_savings(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<SavingsSummary, EngineError> {
        Ok(recommendations::realized_savings(&self.pool, start, end).await?)
    }
}
