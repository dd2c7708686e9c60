// db/checkpoint.rs - Singleton sync checkpoint cursor

use chrono::{DateTime, Utc};
use sqlx::{SqliteConnection, SqlitePool};

use crate::db::models::Checkpoint;
use crate::{Error, Result};

/// Read the checkpoint row (seeded by migration, id = 1).
pub async fn get_checkpoint(pool: &SqlitePool) -> Result<Checkpoint> {
    let checkpoint = sqlx::query_as::<_, Checkpoint>(
        "SELECT last_sync_cursor, last_synced_at, updated_at FROM sync_checkpoint WHERE id = 1",
    )
    .fetch_optional(pool)
    .await?
    .ok_or_else(|| Error::Database("sync checkpoint row missing".to_string()))?;

    Ok(checkpoint)
}

/// Advance the checkpoint cursor. Only called after a page (or push result)
/// has been fully applied and persisted.
pub async fn set_checkpoint(
    pool: &SqlitePool,
    cursor: &str,
    synced_at: DateTime<Utc>,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE sync_checkpoint
        SET last_sync_cursor = ?,
            last_synced_at = ?,
            updated_at = ?
        WHERE id = 1
        "#,
    )
    .bind(cursor)
    .bind(synced_at)
    .bind(Utc::now())
    .execute(pool)
    .await?;

    tracing::debug!("Checkpoint advanced to {}", cursor);

    Ok(())
}

/// Reset the checkpoint to its initial state (forced restore).
pub(crate) async fn reset(conn: &mut SqliteConnection) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE sync_checkpoint
        SET last_sync_cursor = NULL,
            last_synced_at = NULL,
            updated_at = ?
        WHERE id = 1
        "#,
    )
    .bind(Utc::now())
    .execute(conn)
    .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[tokio::test]
    async fn test_checkpoint_round_trip() {
        let pool = crate::db::test_pool().await;

        let initial = get_checkpoint(&pool).await.unwrap();
        assert_eq!(initial.last_sync_cursor, None);
        assert_eq!(initial.last_synced_at, None);

        let synced_at = Utc.with_ymd_and_hms(2026, 2, 17, 2, 0, 0).unwrap();
        set_checkpoint(&pool, "c1", synced_at).await.unwrap();

        let checkpoint = get_checkpoint(&pool).await.unwrap();
        assert_eq!(checkpoint.last_sync_cursor.as_deref(), Some("c1"));
        assert_eq!(checkpoint.last_synced_at, Some(synced_at));
    }
}
