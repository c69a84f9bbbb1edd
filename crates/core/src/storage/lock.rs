use crate::storage::Lease;
use anyhow::Context;
use chrono::{DateTime, Utc};
use std::time::Duration;
use uuid::Uuid;

// Expiry is judged by the database clock, never the worker's.

pub async fn try_acquire_lease(
    pool: &sqlx::PgPool,
    recommendation_id: Uuid,
    owner: &str,
    ttl: Duration,
) -> anyhow::Result<Option<Lease>> {
    let token = Uuid::new_v4();
    let row: Option<(Uuid, DateTime<Utc>)> = sqlx::query_as(
        "INSERT INTO recommendation_leases (recommendation_id, owner, token, expires_at) \
         VALUES ($1, $2, $3, now() + make_interval(secs => $4)) \
         ON CONFLICT (recommendation_id) DO UPDATE \
           SET owner = EXCLUDED.owner, token = EXCLUDED.token, expires_at = EXCLUDED.expires_at \
           WHERE recommendation_leases.expires_at <= now() \
         RETURNING token, expires_at",
    )
    .persistent(false)
    .bind(recommendation_id)
    .bind(owner)
    .bind(token)
    .bind(ttl.as_secs_f64())
    .fetch_optional(pool)
    .await
    .with_context(|| format!("failed to acquire lease (recommendation_id={recommendation_id})"))?;

    Ok(row.map(|(token, expires_at)| Lease {
        recommendation_id,
        owner: owner.to_string(),
        token,
        expires_at,
    }))
}

pub async fn release_lease(pool: &sqlx::PgPool, lease: &Lease) -> anyhow::Result<()> {
    let res = sqlx::query(
        "DELETE FROM recommendation_leases WHERE recommendation_id = $1 AND token = $2",
    )
    .persistent(false)
    .bind(lease.recommendation_id)
    .bind(lease.token)
    .execute(pool)
    .await
    .with_context(|| {
        format!(
            "failed to release lease (recommendation_id={})",
            lease.recommendation_id
        )
    })?;

    if res.rows_affected() == 0 {
        tracing::warn!(
            recommendation_id = %lease.recommendation_id,
            owner = %lease.owner,
            "lease already expired and reclaimed before release"
        );
    }
    Ok(())
}
