use crate::error::EngineError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Compute,
    Database,
    Function,
    Storage,
}

impl ResourceKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Compute => "compute",
            Self::Database => "database",
            Self::Function => "function",
            Self::Storage => "storage",
        }
    }
}

impl FromStr for ResourceKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "compute" | "ec2" => Ok(Self::Compute),
            "database" | "rds" => Ok(Self::Database),
            "function" | "lambda" => Ok(Self::Function),
            "storage" | "s3" | "ebs" => Ok(Self::Storage),
            other => anyhow::bail!("unknown resource kind: {other}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceRef {
    pub id: String,
    pub kind: ResourceKind,
}

impl ResourceRef {
    pub fn new(kind: ResourceKind, id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind,
        }
    }
}

impl fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind.as_str(), self.id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Action {
    Resize { new_spec: String },
    Terminate,
    Stop,
    MigrateStorageClass { target: String },
}

impl Action {
    /// Everything except `Terminate` can be reverted by the applier.
    pub fn is_reversible(&self) -> bool {
        !matches!(self, Self::Terminate)
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Resize { .. } => "resize",
            Self::Terminate => "terminate",
            Self::Stop => "stop",
            Self::MigrateStorageClass { .. } => "migrate_storage_class",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    Pending,
    AutoApproved,
    AwaitingReview,
    Approved,
    Rejected,
    Executing,
    Succeeded,
    Failed,
    RolledBack,
    FailedTerminal,
}

impl Status {
    pub const ALL: [Status; 10] = [
        Status::Pending,
        Status::AutoApproved,
        Status::AwaitingReview,
        Status::Approved,
        Status::Rejected,
        Status::Executing,
        Status::Succeeded,
        Status::Failed,
        Status::RolledBack,
        Status::FailedTerminal,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::AutoApproved => "AUTO_APPROVED",
            Self::AwaitingReview => "AWAITING_REVIEW",
            Self::Approved => "APPROVED",
            Self::Rejected => "REJECTED",
            Self::Executing => "EXECUTING",
            Self::Succeeded => "SUCCEEDED",
            Self::Failed => "FAILED",
            Self::RolledBack => "ROLLED_BACK",
            Self::FailedTerminal => "FAILED_TERMINAL",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Rejected | Self::Succeeded | Self::RolledBack | Self::FailedTerminal
        )
    }

    /// The only edges of the lifecycle. Every status change goes through this table.
    pub fn allowed_next(self) -> &'static [Status] {
        match self {
            Self::Pending => &[Self::AutoApproved, Self::AwaitingReview],
            Self::AwaitingReview => &[Self::Approved, Self::Rejected],
            Self::AutoApproved | Self::Approved => &[Self::Executing],
            Self::Executing => &[Self::Succeeded, Self::Failed],
            Self::Failed => &[Self::RolledBack, Self::FailedTerminal],
            Self::Rejected | Self::Succeeded | Self::RolledBack | Self::FailedTerminal => &[],
        }
    }

    pub fn can_transition_to(self, next: Status) -> bool {
        self.allowed_next().contains(&next)
    }

    /// Approved by policy or by a human, ready for the execution coordinator.
    pub fn is_executable(self) -> bool {
        matches!(self, Self::AutoApproved | Self::Approved)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Status {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.trim().to_ascii_uppercase();
        Status::ALL
            .into_iter()
            .find(|status| status.as_str() == upper)
            .ok_or_else(|| anyhow::anyhow!("unknown status: {s}"))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum Actor {
    System,
    Approver(String),
}

impl Actor {
    pub fn approver(identity: &str) -> anyhow::Result<Self> {
        let identity = identity.trim();
        anyhow::ensure!(!identity.is_empty(), "approver identity must be non-empty");
        Ok(Self::Approver(identity.to_string()))
    }

    pub fn is_human(&self) -> bool {
        matches!(self, Self::Approver(_))
    }
}

impl fmt::Display for Actor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::System => f.write_str("system"),
            Self::Approver(identity) => write!(f, "approver:{identity}"),
        }
    }
}

impl From<Actor> for String {
    fn from(actor: Actor) -> Self {
        actor.to_string()
    }
}

impl TryFrom<String> for Actor {
    type Error = anyhow::Error;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        if s == "system" {
            return Ok(Self::System);
        }
        match s.strip_prefix("approver:") {
            Some(identity) => Actor::approver(identity),
            None => anyhow::bail!("unknown actor: {s}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// Commit sequence within one recommendation; the ordering key for the audit trail.
    pub seq: u32,
    pub at: DateTime<Utc>,
    pub from: Option<Status>,
    pub to: Status,
    pub actor: Actor,
    pub note: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recommendation {
    pub id: Uuid,
    pub resource: ResourceRef,
    pub action: Action,
    pub estimated_monthly_savings: f64,
    pub risk_score: f64,
    pub status: Status,
    pub created_at: DateTime<Utc>,
    pub decided_at: Option<DateTime<Utc>>,
    pub executed_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub history: Vec<HistoryEntry>,
}

impl Recommendation {
    pub fn new_pending(
        resource: ResourceRef,
        action: Action,
        estimated_monthly_savings: f64,
        risk_score: f64,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            resource,
            action,
            estimated_monthly_savings,
            risk_score,
            status: Status::Pending,
            created_at,
            decided_at: None,
            executed_at: None,
            completed_at: None,
            history: vec![HistoryEntry {
                seq: 1,
                at: created_at,
                from: None,
                to: Status::Pending,
                actor: Actor::System,
                note: None,
            }],
        }
    }

    pub fn latest_timestamp(&self) -> DateTime<Utc> {
        [
            Some(self.created_at),
            self.decided_at,
            self.executed_at,
            self.completed_at,
            self.history.last().map(|e| e.at),
        ]
        .into_iter()
        .flatten()
        .max()
        .unwrap_or(self.created_at)
    }

    /// Validates `self.status -> next` and builds the history entry that records it.
    /// The entry time never goes backwards relative to earlier stamps.
    pub fn plan_transition(
        &self,
        next: Status,
        actor: Actor,
        at: DateTime<Utc>,
        note: Option<String>,
    ) -> Result<HistoryEntry, EngineError> {
        if !self.status.can_transition_to(next) {
            return Err(EngineError::InvalidTransition {
                id: self.id,
                from: self.status,
                to: next,
            });
        }

        let seq = self.history.last().map(|e| e.seq).unwrap_or(0) + 1;
        Ok(HistoryEntry {
            seq,
            at: at.max(self.latest_timestamp()),
            from: Some(self.status),
            to: next,
            actor,
            note,
        })
    }

    /// Applies a planned entry: status, the matching lifecycle stamp, and the history append.
    pub fn apply(&mut self, entry: HistoryEntry) {
        let at = entry.at;
        match entry.to {
            Status::AutoApproved | Status::Approved => {
                self.decided_at.get_or_insert(at);
            }
            Status::Rejected => {
                self.decided_at.get_or_insert(at);
                self.completed_at.get_or_insert(at);
            }
            Status::Executing => {
                self.executed_at.get_or_insert(at);
            }
            s if s.is_terminal() => {
                self.completed_at.get_or_insert(at);
            }
            _ => {}
        }
        self.status = entry.to;
        self.history.push(entry);
    }

    pub fn transition(
        &mut self,
        next: Status,
        actor: Actor,
        at: DateTime<Utc>,
        note: Option<String>,
    ) -> Result<HistoryEntry, EngineError> {
        let entry = self.plan_transition(next, actor, at, note)?;
        self.apply(entry.clone());
        Ok(entry)
    }

    /// When the recommendation entered its current status.
    pub fn status_since(&self) -> DateTime<Utc> {
        self.history
            .iter()
            .rev()
            .find(|e| e.to == self.status)
            .map(|e| e.at)
            .unwrap_or(self.created_at)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AttemptOutcome {
    Success,
    Failure { reason: String },
    RolledBack { reason: String },
}

impl AttemptOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure { .. } => "failure",
            Self::RolledBack { .. } => "rolled_back",
        }
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            Self::Success => None,
            Self::Failure { reason } | Self::RolledBack { reason } => Some(reason),
        }
    }

    pub fn from_parts(kind: &str, reason: Option<String>) -> anyhow::Result<Self> {
        let reason = reason.unwrap_or_default();
        match kind {
            "success" => Ok(Self::Success),
            "failure" => Ok(Self::Failure { reason }),
            "rolled_back" => Ok(Self::RolledBack { reason }),
            other => anyhow::bail!("unknown attempt outcome: {other}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionAttempt {
    pub recommendation_id: Uuid,
    /// 1-based, monotonic per recommendation. Applier retries inside one attempt are
    /// counted in `tries`, not as separate attempts.
    pub attempt_number: u32,
    pub tries: u32,
    pub outcome: Option<AttemptOutcome>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl ExecutionAttempt {
    pub fn is_in_flight(&self) -> bool {
        self.finished_at.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SavingsSummary {
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub succeeded_count: u64,
    pub realized_monthly_savings: f64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use serde_json::json;

    fn sample(created_at: DateTime<Utc>) -> Recommendation {
        Recommendation::new_pending(
            ResourceRef::new(ResourceKind::Compute, "i-0abc"),
            Action::Stop,
            42.0,
            0.2,
            created_at,
        )
    }

    #[test]
    fn only_listed_edges_are_allowed() {
        let allowed = [
            (Status::Pending, Status::AutoApproved),
            (Status::Pending, Status::AwaitingReview),
            (Status::AwaitingReview, Status::Approved),
            (Status::AwaitingReview, Status::Rejected),
            (Status::AutoApproved, Status::Executing),
            (Status::Approved, Status::Executing),
            (Status::Executing, Status::Succeeded),
            (Status::Executing, Status::Failed),
            (Status::Failed, Status::RolledBack),
            (Status::Failed, Status::FailedTerminal),
        ];

        for from in Status::ALL {
            for to in Status::ALL {
                assert_eq!(
                    from.can_transition_to(to),
                    allowed.contains(&(from, to)),
                    "{from} -> {to}"
                );
            }
        }
    }

    #[test]
    fn terminal_states_have_no_exits() {
        for status in Status::ALL {
            assert_eq!(status.is_terminal(), status.allowed_next().is_empty());
        }
    }

    #[test]
    fn invalid_transition_leaves_record_unchanged() {
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap();
        let mut rec = sample(now);
        let before = rec.clone();

        let err = rec
            .transition(Status::Executing, Actor::System, now, None)
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidTransition { .. }));
        assert_eq!(rec, before);
    }

    #[test]
    fn lifecycle_stamps_are_set_once_and_ordered() {
        let t0 = Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap();
        let mut rec = sample(t0);

        rec.transition(Status::AutoApproved, Actor::System, t0 + Duration::minutes(1), None)
            .unwrap();
        // A skewed clock must not move the audit trail backwards.
        rec.transition(Status::Executing, Actor::System, t0 - Duration::hours(1), None)
            .unwrap();
        rec.transition(Status::Succeeded, Actor::System, t0 + Duration::minutes(5), None)
            .unwrap();

        let decided = rec.decided_at.unwrap();
        let executed = rec.executed_at.unwrap();
        let completed = rec.completed_at.unwrap();
        assert!(rec.created_at <= decided);
        assert!(decided <= executed);
        assert!(executed <= completed);

        let seqs: Vec<u32> = rec.history.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![1, 2, 3, 4]);
        assert_eq!(rec.history[0].from, None);
        assert_eq!(rec.history[3].from, Some(Status::Executing));
    }

    #[test]
    fn status_round_trips_through_strings() {
        for status in Status::ALL {
            assert_eq!(status.as_str().parse::<Status>().unwrap(), status);
        }
        assert_eq!("awaiting_review".parse::<Status>().unwrap(), Status::AwaitingReview);
        assert!("DONE".parse::<Status>().is_err());
    }

    #[test]
    fn actor_serializes_as_tagged_string() {
        let actor = Actor::approver("  alice ").unwrap();
        assert_eq!(serde_json::to_value(&actor).unwrap(), json!("approver:alice"));
        assert_eq!(
            serde_json::from_value::<Actor>(json!("system")).unwrap(),
            Actor::System
        );
        assert!(Actor::approver("   ").is_err());
        assert!(serde_json::from_value::<Actor>(json!("root")).is_err());
    }

    #[test]
    fn action_json_shape_and_reversibility() {
        let action = Action::Resize {
            new_spec: "m5.large".to_string(),
        };
        assert_eq!(
            serde_json::to_value(&action).unwrap(),
            json!({"kind": "resize", "new_spec": "m5.large"})
        );
        assert!(action.is_reversible());
        assert!(Action::Stop.is_reversible());
        assert!(!Action::Terminate.is_reversible());
    }
}
