use serde_json::Value;
use sha2::{Digest, Sha256};
use sqlx::{Executor, PgConnection, PgPool, Postgres, Row};
use uuid::Uuid;

use crate::error::CoreResult;

use super::PlacementIntent;

/// Stable key for one intent: sha256 over app guid, version and the encoded payload.
/// Redelivery of the same row always carries the same key.
pub fn idempotency_key(intent: &PlacementIntent) -> Result<String, serde_json::Error> {
    let payload = serde_json::to_string(intent)?;
    let mut hasher = Sha256::new();
    hasher.update(intent.app_guid().as_bytes());
    hasher.update(b":");
    hasher.update(intent.version().as_bytes());
    hasher.update(b":");
    hasher.update(payload.as_bytes());
    Ok(hex::encode(hasher.finalize()))
}

/// key: placement-outbox -> persisted inside the committing transaction
pub async fn enqueue(conn: &mut PgConnection, intent: &PlacementIntent) -> CoreResult<i64> {
    let payload = serde_json::to_value(intent)?;
    let key = idempotency_key(intent)?;
    let id: i64 = sqlx::query_scalar(
        r#"
        INSERT INTO placement_intents (app_guid, app_version, payload, idempotency_key)
        VALUES ($1, $2, $3, $4)
        RETURNING id
        "#,
    )
    .bind(intent.app_guid())
    .bind(intent.version())
    .bind(payload)
    .bind(&key)
    .fetch_one(&mut *conn)
    .await?;
    tracing::debug!(intent_id = id, op = intent.op(), app_guid = %intent.app_guid(), "placement intent queued");
    Ok(id)
}

pub async fn enqueue_all(conn: &mut PgConnection, intents: &[PlacementIntent]) -> CoreResult<()> {
    for intent in intents {
        enqueue(conn, intent).await?;
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct QueuedIntent {
    pub id: i64,
    pub app_guid: Uuid,
    pub payload: Value,
    pub idempotency_key: String,
    pub attempts: i32,
}

impl QueuedIntent {
    pub fn intent(&self) -> Result<PlacementIntent, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }
}

pub async fn fetch_queued(pool: &PgPool, limit: i64) -> Result<Vec<QueuedIntent>, sqlx::Error> {
    let rows = sqlx::query(
        r#"
        SELECT id, app_guid, payload, idempotency_key, attempts
        FROM placement_intents
        WHERE status = 'queued'
        ORDER BY id
        LIMIT $1
        "#,
    )
    .bind(limit)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .into_iter()
        .map(|row| QueuedIntent {
            id: row.get("id"),
            app_guid: row.get("app_guid"),
            payload: row.get("payload"),
            idempotency_key: row.get("idempotency_key"),
            attempts: row.get("attempts"),
        })
        .collect())
}

/// Decoded intents still waiting for delivery for one app, oldest first.
pub async fn queued_for_app<'c, E>(
    executor: E,
    app_guid: Uuid,
) -> Result<Vec<PlacementIntent>, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    let payloads: Vec<Value> = sqlx::query_scalar(
        "SELECT payload FROM placement_intents WHERE app_guid = $1 AND status = 'queued' ORDER BY id",
    )
    .bind(app_guid)
    .fetch_all(executor)
    .await?;
    Ok(payloads
        .into_iter()
        .filter_map(|payload| serde_json::from_value(payload).ok())
        .collect())
}

pub async fn mark_delivered(pool: &PgPool, id: i64) -> Result<(), sqlx::Error> {
    sqlx::query("DELETE FROM placement_intents WHERE id = $1")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Records a failed attempt. Returns true when the intent has been parked as `failed`.
pub async fn record_failure(
    pool: &PgPool,
    id: i64,
    error: &str,
    max_attempts: i32,
) -> Result<bool, sqlx::Error> {
    let status: String = sqlx::query_scalar(
        r#"
        UPDATE placement_intents
        SET attempts = attempts + 1,
            last_error = $2,
            status = CASE WHEN attempts + 1 >= $3 THEN 'failed' ELSE 'queued' END,
            updated_at = NOW()
        WHERE id = $1
        RETURNING status
        "#,
    )
    .bind(id)
    .bind(error)
    .bind(max_attempts)
    .fetch_one(pool)
    .await?;
    Ok(status == "failed")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idempotency_key_depends_on_version_and_payload() {
        let app_guid = Uuid::new_v4();
        let version = Uuid::new_v4();
        let stop = PlacementIntent::stop_all(app_guid, version);

        let key = idempotency_key(&stop).unwrap();
        assert_eq!(key.len(), 64);
        assert_eq!(key, idempotency_key(&stop.clone()).unwrap());

        let other_version = PlacementIntent::stop_all(app_guid, Uuid::new_v4());
        assert_ne!(key, idempotency_key(&other_version).unwrap());

        let routes = PlacementIntent::UpdateRoutes { app_guid, version };
        assert_ne!(key, idempotency_key(&routes).unwrap());
    }
}
