// db/outbox.rs - Durable outbox of local mutations awaiting acknowledgment

use chrono::Utc;
use serde_json::Value;
use sqlx::{SqliteConnection, SqlitePool};
use uuid::Uuid;

use crate::db::models::OutboxChange;
use crate::protocol::{codec, ChangeOperation, EntityType};
use crate::Result;

/// Enqueue one outbox row for a local mutation, coalescing with any pending
/// row for the same entity.
///
/// Runs inside the mutation's transaction: the entity write and its outbox
/// row commit or roll back together. Coalescing keeps at most one pending
/// row per (entity_type, entity_id); the latest payload and operation win
/// and the idempotency key is regenerated for the new change sequence.
pub(crate) async fn enqueue_change(
    conn: &mut SqliteConnection,
    device_id: &str,
    entity_type: EntityType,
    entity_id: &str,
    operation: ChangeOperation,
    payload: Option<&Value>,
) -> Result<()> {
    let change_id = Uuid::new_v4().to_string();
    let idempotency_key = codec::create_idempotency_key(device_id, &change_id)?;
    let payload_json = match payload {
        Some(value) => Some(serde_json::to_string(value)?),
        None => None,
    };
    let now = Utc::now();

    sqlx::query(
        r#"
        INSERT INTO sync_outbox (
            entity_type, entity_id, operation, payload_json,
            idempotency_key, attempts, created_at, updated_at
        ) VALUES (?, ?, ?, ?, ?, 0, ?, ?)
        ON CONFLICT(entity_type, entity_id) DO UPDATE SET
            operation = excluded.operation,
            payload_json = excluded.payload_json,
            idempotency_key = excluded.idempotency_key,
            attempts = 0,
            last_error = NULL,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(entity_type.as_str())
    .bind(entity_id)
    .bind(operation.as_str())
    .bind(&payload_json)
    .bind(&idempotency_key)
    .bind(now)
    .bind(now)
    .execute(&mut *conn)
    .await?;

    tracing::debug!(
        "Enqueued {} for {} {}",
        operation.as_str(),
        entity_type.as_str(),
        entity_id
    );

    Ok(())
}

/// List pending outbox rows, FIFO by creation time.
pub async fn list_pending(pool: &SqlitePool, limit: i64) -> Result<Vec<OutboxChange>> {
    let changes = sqlx::query_as::<_, OutboxChange>(
        r#"
        SELECT * FROM sync_outbox
        ORDER BY created_at ASC, id ASC
        LIMIT ?
        "#,
    )
    .bind(limit)
    .fetch_all(pool)
    .await?;

    Ok(changes)
}

/// Remove outbox rows the server accepted.
pub async fn remove_changes(pool: &SqlitePool, ids: &[i64]) -> Result<u64> {
    if ids.is_empty() {
        return Ok(0);
    }

    let mut tx = pool.begin().await?;
    let mut removed = 0u64;
    for id in ids {
        let result = sqlx::query("DELETE FROM sync_outbox WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        removed += result.rows_affected();
    }
    tx.commit().await?;

    tracing::debug!("Removed {} acknowledged outbox rows", removed);

    Ok(removed)
}

/// Record a server rejection on an outbox row. The row stays pending; the
/// idempotency key makes the next push attempt safe.
pub async fn mark_failed(pool: &SqlitePool, id: i64, message: &str) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE sync_outbox
        SET attempts = attempts + 1,
            last_error = ?,
            updated_at = ?
        WHERE id = ?
        "#,
    )
    .bind(message)
    .bind(Utc::now())
    .bind(id)
    .execute(pool)
    .await?;

    tracing::debug!("Marked outbox row {} failed: {}", id, message);

    Ok(())
}

/// Queue statistics for diagnostics snapshots.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct OutboxStats {
    pub pending_count: i64,
    pub failing_count: i64,
    pub oldest_pending: Option<String>,
}

pub async fn stats(pool: &SqlitePool) -> Result<OutboxStats> {
    let pending_count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM sync_outbox")
        .fetch_one(pool)
        .await?;

    let failing_count: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM sync_outbox WHERE attempts > 0")
            .fetch_one(pool)
            .await?;

    let oldest_pending: Option<String> = sqlx::query_scalar(
        "SELECT created_at FROM sync_outbox ORDER BY created_at ASC LIMIT 1",
    )
    .fetch_optional(pool)
    .await?;

    Ok(OutboxStats {
        pending_count,
        failing_count,
        oldest_pending,
    })
}

/// Drop every pending row (forced restore discards unsynced work).
pub(crate) async fn clear_all(conn: &mut SqliteConnection) -> Result<u64> {
    let result = sqlx::query("DELETE FROM sync_outbox")
        .execute(conn)
        .await?;

    Ok(result.rows_affected())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    /// Enqueue on a short-lived connection so the pool is free for reads.
    async fn enqueue(
        pool: &SqlitePool,
        entity_type: EntityType,
        entity_id: &str,
        operation: ChangeOperation,
        payload: Option<Value>,
    ) {
        let mut conn = pool.acquire().await.unwrap();
        enqueue_change(
            &mut conn,
            "dev-a",
            entity_type,
            entity_id,
            operation,
            payload.as_ref(),
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_enqueue_coalesces_per_entity() {
        let pool = crate::db::test_pool().await;

        enqueue(
            &pool,
            EntityType::Task,
            "t4",
            ChangeOperation::Upsert,
            Some(json!({"title": "first"})),
        )
        .await;

        let first = list_pending(&pool, 10).await.unwrap();
        let first_key = first[0].idempotency_key.clone();

        enqueue(
            &pool,
            EntityType::Task,
            "t4",
            ChangeOperation::Upsert,
            Some(json!({"title": "second"})),
        )
        .await;

        let pending = list_pending(&pool, 10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert!(pending[0].payload_json.as_ref().unwrap().contains("second"));
        // A coalesced row represents a new change sequence
        assert_ne!(pending[0].idempotency_key, first_key);
    }

    #[tokio::test]
    async fn test_enqueue_upgrades_upsert_to_delete() {
        let pool = crate::db::test_pool().await;

        enqueue(
            &pool,
            EntityType::Task,
            "t1",
            ChangeOperation::Upsert,
            Some(json!({"title": "x"})),
        )
        .await;
        enqueue(&pool, EntityType::Task, "t1", ChangeOperation::Delete, None).await;

        let pending = list_pending(&pool, 10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].operation, "DELETE");
        assert_eq!(pending[0].payload_json, None);
        assert_eq!(pending[0].attempts, 0);
    }

    #[tokio::test]
    async fn test_mark_failed_keeps_row_pending() {
        let pool = crate::db::test_pool().await;

        enqueue(
            &pool,
            EntityType::Project,
            "p1",
            ChangeOperation::Upsert,
            Some(json!({"name": "Inbox"})),
        )
        .await;

        let pending = list_pending(&pool, 10).await.unwrap();
        mark_failed(&pool, pending[0].id, "[CONFLICT] newer on server")
            .await
            .unwrap();

        let pending = list_pending(&pool, 10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].attempts, 1);
        assert_eq!(
            pending[0].last_error.as_deref(),
            Some("[CONFLICT] newer on server")
        );

        let stats = stats(&pool).await.unwrap();
        assert_eq!(stats.pending_count, 1);
        assert_eq!(stats.failing_count, 1);
    }

    #[tokio::test]
    async fn test_remove_changes() {
        let pool = crate::db::test_pool().await;

        for id in ["a", "b"] {
            enqueue(
                &pool,
                EntityType::Task,
                id,
                ChangeOperation::Upsert,
                Some(json!({})),
            )
            .await;
        }

        let pending = list_pending(&pool, 10).await.unwrap();
        let removed = remove_changes(&pool, &[pending[0].id]).await.unwrap();
        assert_eq!(removed, 1);
        assert_eq!(list_pending(&pool, 10).await.unwrap().len(), 1);
    }
}
