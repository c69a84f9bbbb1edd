use crate::config::env_parse;
use crate::domain::recommendation::{Actor, Recommendation, Status};
use crate::error::EngineError;
use crate::storage::{RecommendationStore, StatusChange};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct ApprovalPolicy {
    /// Savings at or below this bypass human review (subject to the risk ceiling).
    pub auto_approve_max_savings: f64,

    /// Risk scores strictly below this may be auto-approved.
    pub risk_ceiling: f64,

    /// Optional: reviews left undecided this long are rejected by the system.
    /// Disabled unless configured.
    pub review_expiry: Option<Duration>,

    /// `PENDING` records older than this are routed again by reconciliation.
    pub pending_grace: Duration,
}

impl Default for ApprovalPolicy {
    fn default() -> Self {
        Self {
            auto_approve_max_savings: 100.0,
            risk_ceiling: 0.3,
            review_expiry: None,
            pending_grace: Duration::seconds(900),
        }
    }
}

impl ApprovalPolicy {
    pub fn from_env() -> anyhow::Result<Self> {
        let mut out = Self::default();

        if let Some(v) = env_parse::<f64>("AUTO_APPROVE_MAX_SAVINGS") {
            out.auto_approve_max_savings = v;
        }
        if let Some(v) = env_parse::<f64>("AUTO_APPROVE_RISK_CEILING") {
            out.risk_ceiling = v;
        }
        if let Some(hours) = env_parse::<i64>("REVIEW_EXPIRY_HOURS") {
            out.review_expiry = Some(Duration::hours(hours));
        }
        if let Some(secs) = env_parse::<i64>("PENDING_GRACE_SECS") {
            out.pending_grace = Duration::seconds(secs);
        }

        out.validate()?;
        Ok(out)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(
            self.auto_approve_max_savings >= 0.0,
            "AUTO_APPROVE_MAX_SAVINGS must be >= 0 (got {})",
            self.auto_approve_max_savings
        );
        anyhow::ensure!(
            (0.0..=1.0).contains(&self.risk_ceiling),
            "AUTO_APPROVE_RISK_CEILING must be within 0..=1 (got {})",
            self.risk_ceiling
        );
        if let Some(expiry) = self.review_expiry {
            anyhow::ensure!(
                expiry > Duration::zero(),
                "REVIEW_EXPIRY_HOURS must be > 0"
            );
        }
        anyhow::ensure!(
            self.pending_grace >= Duration::zero(),
            "PENDING_GRACE_SECS must be >= 0"
        );
        Ok(())
    }

    /// Where a `PENDING` recommendation goes. Depends only on savings and risk.
    pub fn route(&self, estimated_monthly_savings: f64, risk_score: f64) -> Status {
        if estimated_monthly_savings <= self.auto_approve_max_savings
            && risk_score < self.risk_ceiling
        {
            Status::AutoApproved
        } else {
            Status::AwaitingReview
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Approve,
    Reject,
}

impl Decision {
    fn target(self) -> Status {
        match self {
            Self::Approve => Status::Approved,
            Self::Reject => Status::Rejected,
        }
    }
}

impl FromStr for Decision {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "approve" => Ok(Self::Approve),
            "reject" => Ok(Self::Reject),
            other => anyhow::bail!("unknown decision: {other}"),
        }
    }
}

/// Drives recommendations from `PENDING` through review. Holds no status of its own:
/// every step re-reads the store and writes through compare-and-set.
#[derive(Clone)]
pub struct ApprovalWorkflow {
    store: Arc<dyn RecommendationStore>,
    policy: ApprovalPolicy,
}

impl ApprovalWorkflow {
    pub fn new(store: Arc<dyn RecommendationStore>, policy: ApprovalPolicy) -> Self {
        Self { store, policy }
    }

    /// `PENDING -> AUTO_APPROVED | AWAITING_REVIEW`.
    pub async fn submit(&self, id: Uuid) -> Result<Recommendation, EngineError> {
        let rec = self.store.get(id).await?;
        let next = self
            .policy
            .route(rec.estimated_monthly_savings, rec.risk_score);

        if rec.status != Status::Pending {
            tracing::warn!(recommendation_id = %id, status = %rec.status, "submit on non-pending recommendation");
            return Err(EngineError::InvalidTransition {
                id,
                from: rec.status,
                to: next,
            });
        }

        let note = match next {
            Status::AutoApproved => None,
            _ => Some(format!(
                "savings {:.2} / risk {:.4} exceed auto-approval limits ({:.2} / {:.4})",
                rec.estimated_monthly_savings,
                rec.risk_score,
                self.policy.auto_approve_max_savings,
                self.policy.risk_ceiling
            )),
        };

        let updated = self
            .store
            .compare_and_set_status(id, Status::Pending, next, StatusChange::system(note))
            .await?;

        tracing::info!(
            recommendation_id = %id,
            resource = %updated.resource,
            savings = updated.estimated_monthly_savings,
            risk = updated.risk_score,
            status = %updated.status,
            "recommendation routed"
        );
        Ok(updated)
    }

    /// External review outcome: `AWAITING_REVIEW -> APPROVED | REJECTED`. Only a human
    /// approver may decide.
    pub async fn decide(
        &self,
        id: Uuid,
        decision: Decision,
        actor: Actor,
    ) -> Result<Recommendation, EngineError> {
        let next = decision.target();
        if !actor.is_human() {
            return Err(EngineError::PreconditionFailed {
                id,
                detail: "review decisions require an approver identity".to_string(),
            });
        }

        let rec = self.store.get(id).await?;
        if rec.status != Status::AwaitingReview {
            tracing::warn!(
                recommendation_id = %id,
                status = %rec.status,
                ?decision,
                "decision rejected: recommendation is not awaiting review"
            );
            return Err(EngineError::InvalidTransition {
                id,
                from: rec.status,
                to: next,
            });
        }

        let updated = self
            .store
            .compare_and_set_status(
                id,
                Status::AwaitingReview,
                next,
                StatusChange::by(actor.clone(), None),
            )
            .await?;

        tracing::info!(recommendation_id = %id, %actor, status = %updated.status, "review decision recorded");
        Ok(updated)
    }

    /// Routes `PENDING` records whose submit never landed, e.g. after a crash between
    /// create and submit. Records younger than `pending_grace` are left to their cycle.
    pub async fn route_stranded_pending(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<Uuid>, EngineError> {
        let mut routed = Vec::new();
        for rec in self.store.list_by_status(Status::Pending).await? {
            if now - rec.status_since() < self.policy.pending_grace {
                continue;
            }

            match self.submit(rec.id).await {
                Ok(updated) => {
                    tracing::info!(
                        recommendation_id = %rec.id,
                        status = %updated.status,
                        "stranded pending recommendation routed"
                    );
                    routed.push(rec.id);
                }
                // Another worker routed it first.
                Err(
                    err @ (EngineError::ConcurrentModification { .. }
                    | EngineError::InvalidTransition { .. }),
                ) => {
                    tracing::debug!(recommendation_id = %rec.id, error = %err, "pending record already routed");
                }
                Err(err) => return Err(err),
            }
        }
        Ok(routed)
    }

    /// Applies the optional expiry policy. Returns the ids that were rejected.
    pub async fn expire_stale_reviews(&self, now: DateTime<Utc>) -> Result<Vec<Uuid>, EngineError> {
        let Some(expiry) = self.policy.review_expiry else {
            return Ok(Vec::new());
        };

        let mut expired = Vec::new();
        for rec in self.store.list_by_status(Status::AwaitingReview).await? {
            let waiting = now - rec.status_since();
            if waiting < expiry {
                continue;
            }

            let note = format!("review expired after {}h", expiry.num_hours());
            let change = StatusChange {
                actor: Actor::System,
                at: now,
                note: Some(note),
            };
            match self
                .store
                .compare_and_set_status(rec.id, Status::AwaitingReview, Status::Rejected, change)
                .await
            {
                Ok(_) => {
                    tracing::info!(recommendation_id = %rec.id, "review expired; rejected");
                    expired.push(rec.id);
                }
                // A decision landed first.
                Err(EngineError::ConcurrentModification { actual, .. }) => {
                    tracing::debug!(recommendation_id = %rec.id, %actual, "review decided before expiry");
                }
                Err(err) => return Err(err),
            }
        }
        Ok(expired)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::recommendation::{Action, ResourceKind, ResourceRef};
    use crate::storage::memory::MemoryStore;

    fn rec(savings: f64, risk: f64) -> Recommendation {
        Recommendation::new_pending(
            ResourceRef::new(ResourceKind::Compute, "i-1"),
            Action::Stop,
            savings,
            risk,
            Utc::now(),
        )
    }

    fn setup(policy: ApprovalPolicy) -> (Arc<MemoryStore>, ApprovalWorkflow) {
        let store = Arc::new(MemoryStore::new());
        let workflow = ApprovalWorkflow::new(store.clone(), policy);
        (store, workflow)
    }

    fn alice() -> Actor {
        Actor::approver("alice").unwrap()
    }

    #[tokio::test]
    async fn small_low_risk_savings_are_auto_approved() {
        let (store, workflow) = setup(ApprovalPolicy::default());
        let r = rec(50.0, 0.1);
        store.create(&r).await.unwrap();

        let updated = workflow.submit(r.id).await.unwrap();
        assert_eq!(updated.status, Status::AutoApproved);
        assert!(updated.decided_at.is_some());
        assert_eq!(updated.history.last().unwrap().actor, Actor::System);
    }

    #[tokio::test]
    async fn large_savings_wait_for_review_and_can_be_rejected() {
        let (store, workflow) = setup(ApprovalPolicy::default());
        let r = rec(500.0, 0.1);
        store.create(&r).await.unwrap();

        assert_eq!(workflow.submit(r.id).await.unwrap().status, Status::AwaitingReview);

        let rejected = workflow.decide(r.id, Decision::Reject, alice()).await.unwrap();
        assert_eq!(rejected.status, Status::Rejected);
        assert!(rejected.status.is_terminal());
        assert!(rejected.completed_at.is_some());
        assert_eq!(rejected.history.last().unwrap().actor, alice());
        assert!(store.list_attempts(r.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn routing_is_deterministic() {
        let policy = ApprovalPolicy::default();
        let (store, workflow) = setup(policy.clone());

        for (savings, risk) in [(50.0, 0.1), (100.0, 0.29), (100.0, 0.3), (100.01, 0.0), (0.0, 0.9)] {
            let a = rec(savings, risk);
            let b = rec(savings, risk);
            store.create(&a).await.unwrap();
            store.create(&b).await.unwrap();

            let sa = workflow.submit(a.id).await.unwrap().status;
            let sb = workflow.submit(b.id).await.unwrap().status;
            assert_eq!(sa, sb);
            assert_eq!(sa, policy.route(savings, risk));
        }

        assert_eq!(policy.route(100.0, 0.29), Status::AutoApproved);
        assert_eq!(policy.route(100.0, 0.3), Status::AwaitingReview);
        assert_eq!(policy.route(100.01, 0.0), Status::AwaitingReview);
    }

    #[tokio::test]
    async fn decisions_on_terminal_or_unreviewed_records_are_rejected() {
        let (store, workflow) = setup(ApprovalPolicy::default());
        let r = rec(500.0, 0.1);
        store.create(&r).await.unwrap();

        // Not yet routed.
        let err = workflow.decide(r.id, Decision::Approve, alice()).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidTransition { from: Status::Pending, .. }));

        workflow.submit(r.id).await.unwrap();
        workflow.decide(r.id, Decision::Reject, alice()).await.unwrap();
        let before = store.get(r.id).await.unwrap();

        // Redelivered decision after the terminal state.
        let err = workflow.decide(r.id, Decision::Approve, alice()).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidTransition { from: Status::Rejected, .. }));
        assert_eq!(store.get(r.id).await.unwrap(), before);

        let err = workflow.submit(r.id).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidTransition { .. }));
        assert_eq!(store.get(r.id).await.unwrap(), before);
    }

    #[tokio::test]
    async fn system_cannot_synthesize_review_decisions() {
        let (store, workflow) = setup(ApprovalPolicy::default());
        let r = rec(500.0, 0.1);
        store.create(&r).await.unwrap();
        workflow.submit(r.id).await.unwrap();

        let err = workflow
            .decide(r.id, Decision::Approve, Actor::System)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::PreconditionFailed { .. }));
        assert_eq!(store.get(r.id).await.unwrap().status, Status::AwaitingReview);
    }

    #[tokio::test]
    async fn reviews_expire_only_when_configured() {
        let (store, workflow) = setup(ApprovalPolicy::default());
        let r = rec(500.0, 0.1);
        store.create(&r).await.unwrap();
        workflow.submit(r.id).await.unwrap();

        let later = Utc::now() + Duration::days(30);
        assert!(workflow.expire_stale_reviews(later).await.unwrap().is_empty());

        let policy = ApprovalPolicy {
            review_expiry: Some(Duration::hours(24)),
            ..ApprovalPolicy::default()
        };
        let expiring = ApprovalWorkflow::new(store.clone(), policy);

        assert!(expiring
            .expire_stale_reviews(Utc::now() + Duration::hours(1))
            .await
            .unwrap()
            .is_empty());

        let expired = expiring
            .expire_stale_reviews(Utc::now() + Duration::hours(25))
            .await
            .unwrap();
        assert_eq!(expired, vec![r.id]);

        let stored = store.get(r.id).await.unwrap();
        assert_eq!(stored.status, Status::Rejected);
        let last = stored.history.last().unwrap();
        assert_eq!(last.actor, Actor::System);
        assert!(last.note.as_deref().unwrap().contains("expired"));
    }

    #[tokio::test]
    async fn stranded_pending_records_are_routed_after_grace() {
        let (store, workflow) = setup(ApprovalPolicy::default());
        let small = rec(50.0, 0.1);
        let large = rec(500.0, 0.1);
        store.create(&small).await.unwrap();
        store.create(&large).await.unwrap();

        let fresh = workflow.route_stranded_pending(Utc::now()).await.unwrap();
        assert!(fresh.is_empty());
        assert_eq!(store.get(small.id).await.unwrap().status, Status::Pending);

        let later = Utc::now() + Duration::hours(1);
        let mut routed = workflow.route_stranded_pending(later).await.unwrap();
        routed.sort();
        let mut expected = vec![small.id, large.id];
        expected.sort();
        assert_eq!(routed, expected);

        assert_eq!(store.get(small.id).await.unwrap().status, Status::AutoApproved);
        assert_eq!(store.get(large.id).await.unwrap().status, Status::AwaitingReview);

        // Nothing left to route on the next pass.
        assert!(workflow.route_stranded_pending(later).await.unwrap().is_empty());
    }

    #[test]
    fn decision_parsing() {
        assert_eq!("Approve".parse::<Decision>().unwrap(), Decision::Approve);
        assert_eq!(" reject ".parse::<Decision>().unwrap(), Decision::Reject);
        assert!("maybe".parse::<Decision>().is_err());
    }
}
