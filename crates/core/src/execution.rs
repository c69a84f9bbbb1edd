use crate::applier::{Applier, AttemptTag};
use crate::config::env_parse;
use crate::domain::recommendation::{AttemptOutcome, ExecutionAttempt, Recommendation, Status};
use crate::error::{ApplierError, EngineError};
use crate::storage::{Lease, RecommendationStore, StatusChange};
use chrono::{DateTime, Utc};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use uuid::Uuid;

const DEFAULT_APPLIER_TIMEOUT_SECS: u64 = 60;
const DEFAULT_MAX_TRIES: u32 = 3;
const DEFAULT_BACKOFF_MS: u64 = 500;
const DEFAULT_LEASE_TTL_SECS: u64 = 900;
const DEFAULT_STALE_EXECUTING_SECS: u64 = 1800;
const DEFAULT_CONCURRENCY: usize = 8;
const MAX_BACKOFF: Duration = Duration::from_secs(60);
const MAX_TRIES_LIMIT: u32 = 10;

#[derive(Debug, Clone)]
pub struct ExecutionPolicy {
    /// Upper bound for one applier call; exceeding it counts as a transient timeout.
    pub applier_timeout: Duration,

    /// Applier calls per attempt, first try included. Only transient failures are retried.
    pub max_tries: u32,

    /// Backoff before retry `n` is `backoff_base * 2^(n-1)`, capped at one minute.
    pub backoff_base: Duration,

    pub lease_ttl: Duration,

    /// `EXECUTING`/`FAILED` records untouched for this long are picked up by reconciliation.
    pub stale_after: Duration,

    /// Recommendations executed in parallel by one dispatch pass.
    pub concurrency: usize,
}

impl Default for ExecutionPolicy {
    fn default() -> Self {
        Self {
            applier_timeout: Duration::from_secs(DEFAULT_APPLIER_TIMEOUT_SECS),
            max_tries: DEFAULT_MAX_TRIES,
            backoff_base: Duration::from_millis(DEFAULT_BACKOFF_MS),
            lease_ttl: Duration::from_secs(DEFAULT_LEASE_TTL_SECS),
            stale_after: Duration::from_secs(DEFAULT_STALE_EXECUTING_SECS),
            concurrency: DEFAULT_CONCURRENCY,
        }
    }
}

impl ExecutionPolicy {
    pub fn from_env() -> anyhow::Result<Self> {
        let mut out = Self::default();

        if let Some(v) = env_parse::<u64>("APPLIER_TIMEOUT_SECS") {
            out.applier_timeout = Duration::from_secs(v);
        }
        if let Some(v) = env_parse::<u32>("APPLIER_MAX_TRIES") {
            out.max_tries = v;
        }
        if let Some(v) = env_parse::<u64>("APPLIER_BACKOFF_MS") {
            out.backoff_base = Duration::from_millis(v);
        }
        if let Some(v) = env_parse::<u64>("LEASE_TTL_SECS") {
            out.lease_ttl = Duration::from_secs(v);
        }
        if let Some(v) = env_parse::<u64>("STALE_EXECUTING_SECS") {
            out.stale_after = Duration::from_secs(v);
        }
        if let Some(v) = env_parse::<usize>("WORKER_CONCURRENCY") {
            out.concurrency = v;
        }

        out.validate()?;
        Ok(out)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(
            (1..=MAX_TRIES_LIMIT).contains(&self.max_tries),
            "APPLIER_MAX_TRIES must be within 1..={MAX_TRIES_LIMIT} (got {})",
            self.max_tries
        );
        anyhow::ensure!(self.concurrency >= 1, "WORKER_CONCURRENCY must be >= 1");
        anyhow::ensure!(
            !self.applier_timeout.is_zero(),
            "APPLIER_TIMEOUT_SECS must be > 0"
        );

        let worst = self.worst_case_attempt();
        anyhow::ensure!(
            self.lease_ttl >= worst,
            "LEASE_TTL_SECS ({}s) must cover a worst-case attempt ({}s)",
            self.lease_ttl.as_secs(),
            worst.as_secs()
        );
        anyhow::ensure!(
            self.stale_after >= self.lease_ttl,
            "STALE_EXECUTING_SECS must be >= LEASE_TTL_SECS"
        );
        Ok(())
    }

    pub fn backoff(&self, try_number: u32) -> Duration {
        let exp = try_number.saturating_sub(1).min(16);
        self.backoff_base
            .saturating_mul(1u32 << exp)
            .min(MAX_BACKOFF)
    }

    /// Every apply try plus one revert, each at the timeout, plus all backoffs.
    pub fn worst_case_attempt(&self) -> Duration {
        let tries = self.max_tries.min(MAX_TRIES_LIMIT);
        let calls = self.applier_timeout.saturating_mul(tries.saturating_add(1));
        (1..tries).fold(calls, |acc, n| acc.saturating_add(self.backoff(n)))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub succeeded: usize,
    pub rolled_back: usize,
    pub failed_terminal: usize,
    pub skipped: usize,
    pub errors: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub reattempted: usize,
    pub settled_failures: usize,
    pub skipped: usize,
    pub errors: usize,
}

/// Runs approved recommendations through the applier. One attempt per `execute` call;
/// retries of transient applier errors stay inside that attempt and are counted in `tries`.
#[derive(Clone)]
pub struct ExecutionCoordinator {
    store: Arc<dyn RecommendationStore>,
    applier: Arc<dyn Applier>,
    policy: ExecutionPolicy,
    worker_id: String,
}

impl ExecutionCoordinator {
    pub fn new(
        store: Arc<dyn RecommendationStore>,
        applier: Arc<dyn Applier>,
        policy: ExecutionPolicy,
        worker_id: impl Into<String>,
    ) -> Self {
        Self {
            store,
            applier,
            policy,
            worker_id: worker_id.into(),
        }
    }

    /// `APPROVED | AUTO_APPROVED -> EXECUTING -> ...`. Fails fast with `AlreadyExecuting`
    /// while another worker holds the lease.
    pub async fn execute(&self, id: Uuid) -> Result<ExecutionAttempt, EngineError> {
        self.store.get(id).await?;

        self.with_lease(id, async {
            let rec = self.store.get(id).await?;
            if !rec.status.is_executable() {
                return Err(EngineError::PreconditionFailed {
                    id,
                    detail: format!(
                        "status is {}, expected {} or {}",
                        rec.status,
                        Status::Approved,
                        Status::AutoApproved
                    ),
                });
            }

            // Commit intent before touching infrastructure.
            let rec = self
                .store
                .compare_and_set_status(id, rec.status, Status::Executing, StatusChange::system(None))
                .await?;
            tracing::info!(
                recommendation_id = %id,
                resource = %rec.resource,
                action = rec.action.label(),
                "execution started"
            );

            self.run_attempt(&rec).await
        })
        .await
    }

    /// Re-runs a recommendation left in `EXECUTING` by a worker that lost its lease.
    pub async fn reattempt(&self, id: Uuid) -> Result<ExecutionAttempt, EngineError> {
        self.with_lease(id, async {
            let rec = self.store.get(id).await?;
            if rec.status != Status::Executing {
                return Err(EngineError::PreconditionFailed {
                    id,
                    detail: format!("status is {}, expected {}", rec.status, Status::Executing),
                });
            }
            tracing::warn!(recommendation_id = %id, "re-attempting stale execution");
            self.run_attempt(&rec).await
        })
        .await
    }

    /// Finishes the rollback step for a recommendation left in `FAILED`.
    pub async fn settle_failed(&self, id: Uuid) -> Result<Status, EngineError> {
        self.with_lease(id, async {
            let rec = self.store.get(id).await?;
            if rec.status != Status::Failed {
                return Err(EngineError::PreconditionFailed {
                    id,
                    detail: format!("status is {}, expected {}", rec.status, Status::Failed),
                });
            }

            let reason = rec
                .history
                .iter()
                .rev()
                .find(|e| e.to == Status::Failed)
                .and_then(|e| e.note.clone())
                .unwrap_or_else(|| "unknown failure".to_string());

            let attempts = self.store.list_attempts(id).await?;
            let attempt_number = attempts.last().map(|a| a.attempt_number).unwrap_or(0);
            let outcome = self.settle_failure(&rec, attempt_number, reason).await?;

            if let Some(mut open) = attempts.into_iter().rev().find(|a| a.is_in_flight()) {
                open.outcome = Some(outcome);
                open.finished_at = Some(Utc::now());
                self.store.finish_attempt(&open).await?;
            }

            Ok(self.store.get(id).await?.status)
        })
        .await
    }

    /// Holds the lease for the duration of `work` and releases it on every exit path.
    async fn with_lease<T, F>(&self, id: Uuid, work: F) -> Result<T, EngineError>
    where
        F: Future<Output = Result<T, EngineError>>,
    {
        let lease = self
            .store
            .try_acquire_lease(id, &self.worker_id, self.policy.lease_ttl)
            .await?;
        let Some(lease) = lease else {
            tracing::debug!(recommendation_id = %id, "lease held elsewhere");
            return Err(EngineError::AlreadyExecuting { id });
        };

        let result = work.await;
        self.release(&lease).await;
        result
    }

    async fn release(&self, lease: &Lease) {
        if let Err(err) = self.store.release_lease(lease).await {
            // Expiry reclaims it.
            tracing::warn!(
                recommendation_id = %lease.recommendation_id,
                error = %err,
                "lease release failed"
            );
        }
    }

    async fn run_attempt(&self, rec: &Recommendation) -> Result<ExecutionAttempt, EngineError> {
        let mut attempt = self.store.begin_attempt(rec.id, Utc::now()).await?;
        let (result, tries) = self.apply_with_retry(rec, attempt.attempt_number).await;
        attempt.tries = tries;

        let outcome = match result {
            Ok(()) => {
                self.store
                    .compare_and_set_status(
                        rec.id,
                        Status::Executing,
                        Status::Succeeded,
                        StatusChange::system(None),
                    )
                    .await?;
                tracing::info!(
                    recommendation_id = %rec.id,
                    attempt = attempt.attempt_number,
                    tries,
                    "execution succeeded"
                );
                AttemptOutcome::Success
            }
            Err(err) => {
                tracing::warn!(
                    recommendation_id = %rec.id,
                    attempt = attempt.attempt_number,
                    tries,
                    error = %err,
                    "execution failed"
                );
                let failed = self
                    .store
                    .compare_and_set_status(
                        rec.id,
                        Status::Executing,
                        Status::Failed,
                        StatusChange::system(Some(err.reason.clone())),
                    )
                    .await?;
                self.settle_failure(&failed, attempt.attempt_number, err.reason)
                    .await?
            }
        };

        attempt.outcome = Some(outcome);
        attempt.finished_at = Some(Utc::now());
        self.store.finish_attempt(&attempt).await?;
        Ok(attempt)
    }

    /// `FAILED -> ROLLED_BACK | FAILED_TERMINAL`. One revert call for reversible actions.
    async fn settle_failure(
        &self,
        rec: &Recommendation,
        attempt_number: u32,
        reason: String,
    ) -> Result<AttemptOutcome, EngineError> {
        if !rec.action.is_reversible() {
            self.store
                .compare_and_set_status(
                    rec.id,
                    Status::Failed,
                    Status::FailedTerminal,
                    StatusChange::system(Some(format!(
                        "{} is not reversible; no rollback attempted",
                        rec.action.label()
                    ))),
                )
                .await?;
            tracing::error!(recommendation_id = %rec.id, %reason, "execution failed terminally");
            return Ok(AttemptOutcome::Failure { reason });
        }

        let tag = AttemptTag {
            recommendation_id: rec.id,
            attempt_number,
            try_number: 1,
        };
        let reverted = self
            .call_with_timeout(self.applier.revert(&rec.action, &rec.resource, tag))
            .await;

        match reverted {
            Ok(()) => {
                self.store
                    .compare_and_set_status(
                        rec.id,
                        Status::Failed,
                        Status::RolledBack,
                        StatusChange::system(Some(format!("rolled back after: {reason}"))),
                    )
                    .await?;
                tracing::info!(recommendation_id = %rec.id, "rollback succeeded");
                Ok(AttemptOutcome::RolledBack { reason })
            }
            Err(err) => {
                self.store
                    .compare_and_set_status(
                        rec.id,
                        Status::Failed,
                        Status::FailedTerminal,
                        StatusChange::system(Some(format!("rollback failed: {}", err.reason))),
                    )
                    .await?;
                tracing::error!(recommendation_id = %rec.id, error = %err, "rollback failed");
                Ok(AttemptOutcome::Failure {
                    reason: format!("{reason}; rollback failed: {}", err.reason),
                })
            }
        }
    }

    async fn apply_with_retry(
        &self,
        rec: &Recommendation,
        attempt_number: u32,
    ) -> (Result<(), ApplierError>, u32) {
        let mut try_number: u32 = 0;
        loop {
            try_number += 1;
            let tag = AttemptTag {
                recommendation_id: rec.id,
                attempt_number,
                try_number,
            };

            let res = self
                .call_with_timeout(self.applier.apply(&rec.action, &rec.resource, tag))
                .await;
            match res {
                Ok(()) => return (Ok(()), try_number),
                Err(err) if err.is_transient() && try_number < self.policy.max_tries => {
                    let backoff = self.policy.backoff(try_number);
                    tracing::warn!(
                        recommendation_id = %rec.id,
                        attempt = attempt_number,
                        try_number,
                        ?backoff,
                        error = %err,
                        "transient applier failure; retrying"
                    );
                    tokio::time::sleep(backoff).await;
                }
                Err(err) => return (Err(err), try_number),
            }
        }
    }

    async fn call_with_timeout<F>(&self, call: F) -> Result<(), ApplierError>
    where
        F: Future<Output = Result<(), ApplierError>>,
    {
        match tokio::time::timeout(self.policy.applier_timeout, call).await {
            Ok(res) => res,
            Err(_) => Err(ApplierError::timeout()),
        }
    }

    /// Executes every `AUTO_APPROVED` and `APPROVED` recommendation, bounded by
    /// `policy.concurrency`. Distinct recommendations run independently.
    pub async fn dispatch_approved(&self) -> Result<DispatchReport, EngineError> {
        let mut ids = Vec::new();
        for status in [Status::AutoApproved, Status::Approved] {
            ids.extend(self.store.list_by_status(status).await?.into_iter().map(|r| r.id));
        }

        let permits = Arc::new(Semaphore::new(self.policy.concurrency));
        let mut tasks = JoinSet::new();
        for id in ids {
            let coordinator = self.clone();
            let permits = permits.clone();
            tasks.spawn(async move {
                let _permit = permits.acquire_owned().await;
                (id, coordinator.execute(id).await)
            });
        }

        let mut report = DispatchReport::default();
        while let Some(joined) = tasks.join_next().await {
            let (id, res) = match joined {
                Ok(v) => v,
                Err(err) => {
                    tracing::error!(error = %err, "execution task panicked");
                    report.errors += 1;
                    continue;
                }
            };

            match res {
                Ok(attempt) => match attempt.outcome {
                    Some(AttemptOutcome::Success) => report.succeeded += 1,
                    Some(AttemptOutcome::RolledBack { .. }) => report.rolled_back += 1,
                    _ => report.failed_terminal += 1,
                },
                Err(err) if err.is_retryable() || matches!(err, EngineError::PreconditionFailed { .. }) => {
                    tracing::debug!(recommendation_id = %id, error = %err, "execution skipped");
                    report.skipped += 1;
                }
                Err(err) => {
                    tracing::error!(recommendation_id = %id, error = %err, "execution errored");
                    report.errors += 1;
                }
            }
        }

        Ok(report)
    }

    /// Picks up recommendations stranded in `EXECUTING` or `FAILED` by crashed workers.
    pub async fn reconcile(&self, now: DateTime<Utc>) -> Result<ReconcileReport, EngineError> {
        let stale_after = chrono::Duration::from_std(self.policy.stale_after)
            .map_err(|e| anyhow::anyhow!("stale threshold out of range: {e}"))?;
        let mut report = ReconcileReport::default();

        for rec in self.store.list_by_status(Status::Executing).await? {
            let attempts = self.store.list_attempts(rec.id).await?;
            let last_activity = attempts
                .last()
                .map(|a| a.started_at)
                .into_iter()
                .chain(rec.executed_at)
                .max()
                .unwrap_or(rec.created_at);
            if now - last_activity < stale_after {
                continue;
            }

            match self.reattempt(rec.id).await {
                Ok(_) => report.reattempted += 1,
                Err(err) => Self::tally_skip(&mut report, rec.id, err),
            }
        }

        for rec in self.store.list_by_status(Status::Failed).await? {
            if now - rec.status_since() < stale_after {
                continue;
            }

            match self.settle_failed(rec.id).await {
                Ok(status) => {
                    tracing::info!(recommendation_id = %rec.id, %status, "stale failure settled");
                    report.settled_failures += 1;
                }
                Err(err) => Self::tally_skip(&mut report, rec.id, err),
            }
        }

        Ok(report)
    }

    fn tally_skip(report: &mut ReconcileReport, id: Uuid, err: EngineError) {
        if err.is_retryable() || matches!(err, EngineError::PreconditionFailed { .. }) {
            tracing::debug!(recommendation_id = %id, error = %err, "reconcile skipped");
            report.skipped += 1;
        } else {
            tracing::error!(recommendation_id = %id, error = %err, "reconcile failed");
            report.errors += 1;
        }
    }
}
