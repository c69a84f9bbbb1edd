use anyhow::Context;
use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct GenerationRun<'a> {
    pub generated_at: DateTime<Utc>,
    pub source: &'a str,
    pub error: Option<&'a str>,
    pub created_count: usize,
    pub skipped_count: usize,
    pub raw_feed: Option<Value>,
}

/// Audit row for one generation cycle, success or failure, with the raw feed payload.
pub async fn record_generation_run(
    pool: &sqlx::PgPool,
    run: GenerationRun<'_>,
) -> anyhow::Result<Uuid> {
    let id = Uuid::new_v4();
    let status = if run.error.is_some() { "error" } else { "success" };

    sqlx::query(
        "INSERT INTO generation_runs (id, generated_at, source, status, error, created_count, skipped_count, raw_feed) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
    )
    .persistent(false)
    .bind(id)
    .bind(run.generated_at)
    .bind(run.source)
    .bind(status)
    .bind(run.error)
    .bind(run.created_count as i32)
    .bind(run.skipped_count as i32)
    .bind(run.raw_feed)
    .execute(pool)
    .await
    .context("insert generation_runs failed")?;

    Ok(id)
}
