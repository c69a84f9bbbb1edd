use crate::domain::recommendation::{
    Action, HistoryEntry, Recommendation, ResourceKind, ResourceRef, SavingsSummary, Status,
};
use crate::error::EngineError;
use crate::storage::StatusChange;
use anyhow::Context;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use uuid::Uuid;

type RecommendationRow = (
    Uuid,
    String,
    String,
    serde_json::Value,
    f64,
    f64,
    String,
    DateTime<Utc>,
    Option<DateTime<Utc>>,
    Option<DateTime<Utc>>,
    Option<DateTime<Utc>>,
);

type HistoryRow = (
    Uuid,
    i32,
    DateTime<Utc>,
    Option<String>,
    String,
    String,
    Option<String>,
);

const RECOMMENDATION_COLUMNS: &str = "id, resource_id, resource_kind, action, \
     estimated_monthly_savings, risk_score, status, created_at, decided_at, executed_at, completed_at";

pub async fn insert(pool: &sqlx::PgPool, rec: &Recommendation) -> anyhow::Result<()> {
    let action = serde_json::to_value(&rec.action).context("action serialize failed")?;

    let mut tx = pool.begin().await.context("begin transaction failed")?;

    sqlx::query(
        "INSERT INTO recommendations (id, resource_id, resource_kind, action, estimated_monthly_savings, \
         risk_score, status, created_at, decided_at, executed_at, completed_at) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
    )
    .bind(rec.id)
    .bind(&rec.resource.id)
    .bind(rec.resource.kind.as_str())
    .bind(action)
    .bind(rec.estimated_monthly_savings)
    .bind(rec.risk_score)
    .bind(rec.status.as_str())
    .bind(rec.created_at)
    .bind(rec.decided_at)
    .bind(rec.executed_at)
    .bind(rec.completed_at)
    .execute(&mut *tx)
    .await
    .context("insert recommendations failed")?;

    for entry in &rec.history {
        insert_history(&mut tx, rec.id, entry).await?;
    }

    tx.commit().await.context("commit transaction failed")?;
    Ok(())
}

pub async fn fetch(pool: &sqlx::PgPool, id: Uuid) -> anyhow::Result<Option<Recommendation>> {
    let row = sqlx::query_as::<_, RecommendationRow>(&format!(
        "SELECT {RECOMMENDATION_COLUMNS} FROM recommendations WHERE id = $1"
    ))
    .bind(id)
    .fetch_optional(pool)
    .await
    .context("select recommendations failed")?;

    let Some(row) = row else {
        return Ok(None);
    };

    let mut history = fetch_history(pool, &[id]).await?;
    let rec = into_recommendation(row, history.remove(&id).unwrap_or_default())?;
    Ok(Some(rec))
}

pub async fn fetch_by_status(
    pool: &sqlx::PgPool,
    status: Status,
) -> anyhow::Result<Vec<Recommendation>> {
    let rows = sqlx::query_as::<_, RecommendationRow>(&format!(
        "SELECT {RECOMMENDATION_COLUMNS} FROM recommendations \
         WHERE status = $1 \
         ORDER BY created_at ASC, id ASC"
    ))
    .bind(status.as_str())
    .fetch_all(pool)
    .await
    .context("select recommendations by status failed")?;

    with_history(pool, rows).await
}

pub async fn fetch_open_for_resource(
    pool: &sqlx::PgPool,
    resource: &ResourceRef,
) -> anyhow::Result<Vec<Recommendation>> {
    let terminal: Vec<&str> = Status::ALL
        .into_iter()
        .filter(|s| s.is_terminal())
        .map(Status::as_str)
        .collect();

    let rows = sqlx::query_as::<_, RecommendationRow>(&format!(
        "SELECT {RECOMMENDATION_COLUMNS} FROM recommendations \
         WHERE resource_kind = $1 AND resource_id = $2 AND NOT (status = ANY($3)) \
         ORDER BY created_at ASC, id ASC"
    ))
    .bind(resource.kind.as_str())
    .bind(&resource.id)
    .bind(terminal)
    .fetch_all(pool)
    .await
    .context("select open recommendations for resource failed")?;

    with_history(pool, rows).await
}

/// Row lock, expected-status check, transition validation, update and history append,
/// all inside one transaction.
pub async fn compare_and_set_status(
    pool: &sqlx::PgPool,
    id: Uuid,
    expected: Status,
    next: Status,
    change: StatusChange,
) -> Result<Recommendation, EngineError> {
    let mut tx = pool.begin().await.context("begin transaction failed")?;

    let row = sqlx::query_as::<_, RecommendationRow>(&format!(
        "SELECT {RECOMMENDATION_COLUMNS} FROM recommendations WHERE id = $1 FOR UPDATE"
    ))
    .bind(id)
    .fetch_optional(&mut *tx)
    .await
    .context("select recommendations for update failed")?;

    let Some(row) = row else {
        return Err(EngineError::NotFound { id });
    };

    let history = sqlx::query_as::<_, HistoryRow>(
        "SELECT recommendation_id, seq, at, from_status, to_status, actor, note \
         FROM recommendation_history \
         WHERE recommendation_id = $1 \
         ORDER BY seq ASC",
    )
    .bind(id)
    .fetch_all(&mut *tx)
    .await
    .context("select recommendation_history failed")?
    .into_iter()
    .map(into_history_entry)
    .collect::<anyhow::Result<Vec<_>>>()?;

    let mut rec = into_recommendation(row, history)?;
    if rec.status != expected {
        return Err(EngineError::ConcurrentModification {
            id,
            expected,
            actual: rec.status,
        });
    }

    let entry = rec.plan_transition(next, change.actor, change.at, change.note)?;
    rec.apply(entry.clone());

    sqlx::query(
        "UPDATE recommendations \
         SET status = $2, decided_at = $3, executed_at = $4, completed_at = $5, version = version + 1 \
         WHERE id = $1",
    )
    .bind(id)
    .bind(rec.status.as_str())
    .bind(rec.decided_at)
    .bind(rec.executed_at)
    .bind(rec.completed_at)
    .execute(&mut *tx)
    .await
    .context("update recommendations status failed")?;

    insert_history(&mut tx, id, &entry).await?;

    tx.commit().await.context("commit transaction failed")?;
    Ok(rec)
}

pub async fn realized_savings(
    pool: &sqlx::PgPool,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> anyhow::Result<SavingsSummary> {
    let (count, total): (i64, Option<f64>) = sqlx::query_as(
        "SELECT COUNT(*), SUM(estimated_monthly_savings) \
         FROM recommendations \
         WHERE status = 'SUCCEEDED' AND completed_at >= $1 AND completed_at < $2",
    )
    .bind(start)
    .bind(end)
    .fetch_one(pool)
    .await
    .context("select realized savings failed")?;

    Ok(SavingsSummary {
        window_start: start,
        window_end: end,
        succeeded_count: count.max(0) as u64,
        realized_monthly_savings: total.unwrap_or(0.0),
    })
}

async fn insert_history(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    recommendation_id: Uuid,
    entry: &HistoryEntry,
) -> anyhow::Result<()> {
    sqlx::query(
        "INSERT INTO recommendation_history (recommendation_id, seq, at, from_status, to_status, actor, note) \
         VALUES ($1, $2, $3, $4, $5, $6, $7)",
    )
    .bind(recommendation_id)
    .bind(entry.seq as i32)
    .bind(entry.at)
    .bind(entry.from.map(Status::as_str))
    .bind(entry.to.as_str())
    .bind(entry.actor.to_string())
    .bind(&entry.note)
    .execute(&mut **tx)
    .await
    .context("insert recommendation_history failed")?;

    Ok(())
}

async fn fetch_history(
    pool: &sqlx::PgPool,
    ids: &[Uuid],
) -> anyhow::Result<HashMap<Uuid, Vec<HistoryEntry>>> {
    let rows = sqlx::query_as::<_, HistoryRow>(
        "SELECT recommendation_id, seq, at, from_status, to_status, actor, note \
         FROM recommendation_history \
         WHERE recommendation_id = ANY($1) \
         ORDER BY recommendation_id, seq ASC",
    )
    .bind(ids)
    .fetch_all(pool)
    .await
    .context("select recommendation_history failed")?;

    let mut out: HashMap<Uuid, Vec<HistoryEntry>> = HashMap::new();
    for row in rows {
        let id = row.0;
        out.entry(id).or_default().push(into_history_entry(row)?);
    }
    Ok(out)
}

async fn with_history(
    pool: &sqlx::PgPool,
    rows: Vec<RecommendationRow>,
) -> anyhow::Result<Vec<Recommendation>> {
    if rows.is_empty() {
        return Ok(Vec::new());
    }

    let ids: Vec<Uuid> = rows.iter().map(|r| r.0).collect();
    let mut history = fetch_history(pool, &ids).await?;

    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        let entries = history.remove(&row.0).unwrap_or_default();
        out.push(into_recommendation(row, entries)?);
    }
    Ok(out)
}

fn into_recommendation(
    row: RecommendationRow,
    history: Vec<HistoryEntry>,
) -> anyhow::Result<Recommendation> {
    let (
        id,
        resource_id,
        resource_kind,
        action,
        estimated_monthly_savings,
        risk_score,
        status,
        created_at,
        decided_at,
        executed_at,
        completed_at,
    ) = row;

    anyhow::ensure!(
        !history.is_empty(),
        "recommendation {id} has no history in DB"
    );

    let kind: ResourceKind = resource_kind.parse()?;
    let action: Action = serde_json::from_value(action)
        .with_context(|| format!("invalid action JSON in DB for recommendation {id}"))?;

    Ok(Recommendation {
        id,
        resource: ResourceRef::new(kind, resource_id),
        action,
        estimated_monthly_savings,
        risk_score,
        status: status.parse()?,
        created_at,
        decided_at,
        executed_at,
        completed_at,
        history,
    })
}

fn into_history_entry(row: HistoryRow) -> anyhow::Result<HistoryEntry> {
    let (_, seq, at, from_status, to_status, actor, note) = row;
    anyhow::ensure!(seq >= 1, "invalid history seq in DB: {seq}");

    Ok(HistoryEntry {
        seq: seq as u32,
        at,
        from: from_status.as_deref().map(str::parse).transpose()?,
        to: to_status.parse()?,
        actor: actor.try_into()?,
        note,
    })
}
