use crate::domain::recommendation::{
    AttemptOutcome, ExecutionAttempt, Recommendation, ResourceRef, SavingsSummary, Status,
};
use crate::error::EngineError;
use crate::storage::{
    ttl_to_chrono, Lease, RecommendationStore, StatusChange, ABANDONED_ATTEMPT_REASON,
};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use uuid::Uuid;

/// Process-local store used for dry runs and tests. One mutex makes every call atomic.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    recommendations: HashMap<Uuid, Recommendation>,
    attempts: HashMap<Uuid, Vec<ExecutionAttempt>>,
    leases: HashMap<Uuid, Lease>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn sorted(mut recs: Vec<Recommendation>) -> Vec<Recommendation> {
    recs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
    recs
}

#[async_trait::async_trait]
impl RecommendationStore for MemoryStore {
    async fn create(&self, rec: &Recommendation) -> Result<(), EngineError> {
        let mut inner = self.lock();
        if inner.recommendations.contains_key(&rec.id) {
            return Err(anyhow::anyhow!("recommendation {} already exists", rec.id).into());
        }
        inner.recommendations.insert(rec.id, rec.clone());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Recommendation, EngineError> {
        self.lock()
            .recommendations
            .get(&id)
            .cloned()
            .ok_or(EngineError::NotFound { id })
    }

    async fn compare_and_set_status(
        &self,
        id: Uuid,
        expected: Status,
        next: Status,
        change: StatusChange,
    ) -> Result<Recommendation, EngineError> {
        let mut inner = self.lock();
        let rec = inner
            .recommendations
            .get_mut(&id)
            .ok_or(EngineError::NotFound { id })?;

        if rec.status != expected {
            return Err(EngineError::ConcurrentModification {
                id,
                expected,
                actual: rec.status,
            });
        }

        let entry = rec.plan_transition(next, change.actor, change.at, change.note)?;
        rec.apply(entry);
        Ok(rec.clone())
    }

    async fn list_by_status(&self, status: Status) -> Result<Vec<Recommendation>, EngineError> {
        let inner = self.lock();
        Ok(sorted(
            inner
                .recommendations
                .values()
                .filter(|r| r.status == status)
                .cloned()
                .collect(),
        ))
    }

    async fn list_open_for_resource(
        &self,
        resource: &ResourceRef,
    ) -> Result<Vec<Recommendation>, EngineError> {
        let inner = self.lock();
        Ok(sorted(
            inner
                .recommendations
                .values()
                .filter(|r| &r.resource == resource && !r.status.is_terminal())
                .cloned()
                .collect(),
        ))
    }

    async fn try_acquire_lease(
        &self,
        id: Uuid,
        owner: &str,
        ttl: Duration,
    ) -> Result<Option<Lease>, EngineError> {
        let ttl = ttl_to_chrono(ttl)?;
        let now = Utc::now();
        let mut inner = self.lock();
        if !inner.recommendations.contains_key(&id) {
            return Err(EngineError::NotFound { id });
        }

        if let Some(held) = inner.leases.get(&id) {
            if held.expires_at > now {
                return Ok(None);
            }
        }

        let lease = Lease {
            recommendation_id: id,
            owner: owner.to_string(),
            token: Uuid::new_v4(),
            expires_at: now + ttl,
        };
        inner.leases.insert(id, lease.clone());
        Ok(Some(lease))
    }

    async fn release_lease(&self, lease: &Lease) -> Result<(), EngineError> {
        let mut inner = self.lock();
        if inner
            .leases
            .get(&lease.recommendation_id)
            .is_some_and(|held| held.token == lease.token)
        {
            inner.leases.remove(&lease.recommendation_id);
        }
        Ok(())
    }

    async fn begin_attempt(
        &self,
        id: Uuid,
        started_at: DateTime<Utc>,
    ) -> Result<ExecutionAttempt, EngineError> {
        let mut inner = self.lock();
        if !inner.recommendations.contains_key(&id) {
            return Err(EngineError::NotFound { id });
        }

        let attempts = inner.attempts.entry(id).or_default();
        for open in attempts.iter_mut().filter(|a| a.is_in_flight()) {
            open.finished_at = Some(started_at);
            open.outcome = Some(AttemptOutcome::Failure {
                reason: ABANDONED_ATTEMPT_REASON.to_string(),
            });
        }

        let attempt = ExecutionAttempt {
            recommendation_id: id,
            attempt_number: attempts.last().map(|a| a.attempt_number).unwrap_or(0) + 1,
            tries: 0,
            outcome: None,
            started_at,
            finished_at: None,
        };
        attempts.push(attempt.clone());
        Ok(attempt)
    }

    async fn finish_attempt(&self, attempt: &ExecutionAttempt) -> Result<(), EngineError> {
        let mut inner = self.lock();
        let slot = inner
            .attempts
            .get_mut(&attempt.recommendation_id)
            .and_then(|list| {
                list.iter_mut()
                    .find(|a| a.attempt_number == attempt.attempt_number && a.is_in_flight())
            });

        match slot {
            Some(slot) => {
                *slot = attempt.clone();
                Ok(())
            }
            None => Err(anyhow::anyhow!(
                "no in-flight attempt {} for recommendation {}",
                attempt.attempt_number,
                attempt.recommendation_id
            )
            .into()),
        }
    }

    async fn list_attempts(&self, id: Uuid) -> Result<Vec<ExecutionAttempt>, EngineError> {
        Ok(self.lock().attempts.get(&id).cloned().unwrap_or_default())
    }

    async fn realized_savings(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<SavingsSummary, EngineError> {
        let inner = self.lock();
        let mut succeeded_count = 0u64;
        let mut realized_monthly_savings = 0.0;
        for rec in inner.recommendations.values() {
            if rec.status != Status::Succeeded {
                continue;
            }
            if rec.completed_at.is_some_and(|t| t >= start && t < end) {
                succeeded_count += 1;
                realized_monthly_savings += rec.estimated_monthly_savings;
            }
        }

        Ok(SavingsSummary {
            window_start: start,
            window_end: end,
            succeeded_count,
            realized_monthly_savings,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::recommendation::{Action, Actor, ResourceKind};
    use chrono::Duration as ChronoDuration;

    fn rec(id: &str) -> Recommendation {
        Recommendation::new_pending(
            ResourceRef::new(ResourceKind::Compute, id),
            Action::Stop,
            25.0,
            0.1,
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn cas_rejects_stale_expected_status() {
        let store = MemoryStore::new();
        let r = rec("i-1");
        store.create(&r).await.unwrap();

        store
            .compare_and_set_status(r.id, Status::Pending, Status::AwaitingReview, StatusChange::system(None))
            .await
            .unwrap();

        let err = store
            .compare_and_set_status(r.id, Status::Pending, Status::AutoApproved, StatusChange::system(None))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::ConcurrentModification {
                actual: Status::AwaitingReview,
                ..
            }
        ));

        let stored = store.get(r.id).await.unwrap();
        assert_eq!(stored.status, Status::AwaitingReview);
        assert_eq!(stored.history.len(), 2);
    }

    #[tokio::test]
    async fn cas_rejects_illegal_edge_without_mutation() {
        let store = MemoryStore::new();
        let r = rec("i-1");
        store.create(&r).await.unwrap();

        let err = store
            .compare_and_set_status(r.id, Status::Pending, Status::Succeeded, StatusChange::system(None))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidTransition { .. }));
        assert_eq!(store.get(r.id).await.unwrap(), r);
    }

    #[tokio::test]
    async fn lease_is_exclusive_until_released_or_expired() {
        let store = MemoryStore::new();
        let r = rec("i-1");
        store.create(&r).await.unwrap();

        let ttl = Duration::from_secs(60);
        let first = store.try_acquire_lease(r.id, "a", ttl).await.unwrap().unwrap();
        assert!(store.try_acquire_lease(r.id, "b", ttl).await.unwrap().is_none());

        // A stale token cannot release someone else's lease.
        let forged = Lease {
            token: Uuid::new_v4(),
            ..first.clone()
        };
        store.release_lease(&forged).await.unwrap();
        assert!(store.try_acquire_lease(r.id, "b", ttl).await.unwrap().is_none());

        store.release_lease(&first).await.unwrap();
        assert!(store.try_acquire_lease(r.id, "b", ttl).await.unwrap().is_some());

        let expired = MemoryStore::new();
        expired.create(&r).await.unwrap();
        expired
            .try_acquire_lease(r.id, "crashed", Duration::ZERO)
            .await
            .unwrap()
            .unwrap();
        assert!(expired.try_acquire_lease(r.id, "b", ttl).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn begin_attempt_closes_abandoned_attempts() {
        let store = MemoryStore::new();
        let r = rec("i-1");
        store.create(&r).await.unwrap();

        let first = store.begin_attempt(r.id, Utc::now()).await.unwrap();
        assert_eq!(first.attempt_number, 1);
        let second = store.begin_attempt(r.id, Utc::now()).await.unwrap();
        assert_eq!(second.attempt_number, 2);

        let attempts = store.list_attempts(r.id).await.unwrap();
        assert_eq!(attempts.iter().filter(|a| a.is_in_flight()).count(), 1);
        assert_eq!(
            attempts[0].outcome,
            Some(AttemptOutcome::Failure {
                reason: ABANDONED_ATTEMPT_REASON.to_string()
            })
        );
    }

    #[tokio::test]
    async fn realized_savings_counts_succeeded_in_window() {
        let store = MemoryStore::new();
        let now = Utc::now();
        for (id, finish) in [("i-1", true), ("i-2", true), ("i-3", false)] {
            let r = rec(id);
            store.create(&r).await.unwrap();
            for (from, to) in [
                (Status::Pending, Status::AutoApproved),
                (Status::AutoApproved, Status::Executing),
            ] {
                store
                    .compare_and_set_status(r.id, from, to, StatusChange::system(None))
                    .await
                    .unwrap();
            }
            if finish {
                store
                    .compare_and_set_status(
                        r.id,
                        Status::Executing,
                        Status::Succeeded,
                        StatusChange::by(Actor::System, None),
                    )
                    .await
                    .unwrap();
            }
        }

        let summary = store
            .realized_savings(now - ChronoDuration::hours(1), Utc::now() + ChronoDuration::hours(1))
            .await
            .unwrap();
        assert_eq!(summary.succeeded_count, 2);
        assert_eq!(summary.realized_monthly_savings, 50.0);

        let empty = store
            .realized_savings(now - ChronoDuration::days(2), now - ChronoDuration::days(1))
            .await
            .unwrap();
        assert_eq!(empty.succeeded_count, 0);
    }
}
