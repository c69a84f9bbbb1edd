use crate::domain::recommendation::{AttemptOutcome, ExecutionAttempt};
use crate::storage::ABANDONED_ATTEMPT_REASON;
use anyhow::Context;
use chrono::{DateTime, Utc};
use uuid::Uuid;

type AttemptRow = (
    Uuid,
    i32,
    i32,
    Option<String>,
    Option<String>,
    DateTime<Utc>,
    Option<DateTime<Utc>>,
);

pub async fn begin(
    pool: &sqlx::PgPool,
    recommendation_id: Uuid,
    started_at: DateTime<Utc>,
) -> anyhow::Result<ExecutionAttempt> {
    let mut tx = pool.begin().await.context("begin transaction failed")?;

    let abandoned = sqlx::query(
        "UPDATE execution_attempts \
         SET finished_at = $2, outcome = 'failure', reason = $3 \
         WHERE recommendation_id = $1 AND finished_at IS NULL",
    )
    .bind(recommendation_id)
    .bind(started_at)
    .bind(ABANDONED_ATTEMPT_REASON)
    .execute(&mut *tx)
    .await
    .context("close abandoned execution_attempts failed")?;

    if abandoned.rows_affected() > 0 {
        tracing::warn!(
            %recommendation_id,
            abandoned = abandoned.rows_affected(),
            "closed abandoned execution attempts"
        );
    }

    let attempt_number: i32 = sqlx::query_scalar(
        "INSERT INTO execution_attempts (recommendation_id, attempt_number, tries, started_at) \
         SELECT $1, COALESCE(MAX(attempt_number), 0) + 1, 0, $2 \
         FROM execution_attempts WHERE recommendation_id = $1 \
         RETURNING attempt_number",
    )
    .bind(recommendation_id)
    .bind(started_at)
    .fetch_one(&mut *tx)
    .await
    .context("insert execution_attempts failed")?;

    tx.commit().await.context("commit transaction failed")?;

    Ok(ExecutionAttempt {
        recommendation_id,
        attempt_number: attempt_number as u32,
        tries: 0,
        outcome: None,
        started_at,
        finished_at: None,
    })
}

pub async fn finish(pool: &sqlx::PgPool, attempt: &ExecutionAttempt) -> anyhow::Result<()> {
    let outcome = attempt.outcome.as_ref();

    let res = sqlx::query(
        "UPDATE execution_attempts \
         SET tries = $3, outcome = $4, reason = $5, finished_at = $6 \
         WHERE recommendation_id = $1 AND attempt_number = $2 AND finished_at IS NULL",
    )
    .bind(attempt.recommendation_id)
    .bind(attempt.attempt_number as i32)
    .bind(attempt.tries as i32)
    .bind(outcome.map(AttemptOutcome::as_str))
    .bind(outcome.and_then(AttemptOutcome::reason))
    .bind(attempt.finished_at)
    .execute(pool)
    .await
    .context("update execution_attempts failed")?;

    anyhow::ensure!(
        res.rows_affected() == 1,
        "no in-flight attempt {} for recommendation {}",
        attempt.attempt_number,
        attempt.recommendation_id
    );
    Ok(())
}

pub async fn list(
    pool: &sqlx::PgPool,
    recommendation_id: Uuid,
) -> anyhow::Result<Vec<ExecutionAttempt>> {
    let rows = sqlx::query_as::<_, AttemptRow>(
        "SELECT recommendation_id, attempt_number, tries, outcome, reason, started_at, finished_at \
         FROM execution_attempts \
         WHERE recommendation_id = $1 \
         ORDER BY attempt_number ASC",
    )
    .bind(recommendation_id)
    .fetch_all(pool)
    .await
    .context("select execution_attempts failed")?;

    let mut out = Vec::with_capacity(rows.len());
    for (recommendation_id, attempt_number, tries, outcome, reason, started_at, finished_at) in rows
    {
        let outcome = outcome
            .as_deref()
            .map(|kind| AttemptOutcome::from_parts(kind, reason))
            .transpose()?;

        out.push(ExecutionAttempt {
            recommendation_id,
            attempt_number: attempt_number as u32,
            tries: tries.max(0) as u32,
            outcome,
            started_at,
            finished_at,
        });
    }
    Ok(out)
}
