// db/conflicts.rs - Conflict records, resolution, events, and observability

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use sqlx::{SqliteConnection, SqlitePool};

use crate::db::models::{
    ConflictEvent, ConflictEventType, ConflictRecord, ConflictStatus, ConflictType,
    ResolutionStrategy,
};
use crate::db::{outbox, tasks};
use crate::protocol::{ChangeOperation, ChangeRecord, EntityType};
use crate::sync::apply;
use crate::{Error, Result};

/// A conflict detected by the apply pipeline, before persistence.
#[derive(Debug, Clone)]
pub struct NewConflict {
    pub incoming_idempotency_key: String,
    pub entity_type: EntityType,
    pub entity_id: String,
    pub operation: ChangeOperation,
    pub conflict_type: ConflictType,
    pub reason_code: String,
    pub message: String,
    pub local_payload: Option<Value>,
    pub remote_payload: Option<Value>,
    pub base_payload: Option<Value>,
}

/// Persist a detected conflict (status open) and its `detected` event.
/// Runs inside the apply transaction.
pub(crate) async fn record_conflict(
    conn: &mut SqliteConnection,
    conflict: NewConflict,
) -> Result<i64> {
    let now = Utc::now();

    let result = sqlx::query(
        r#"
        INSERT INTO sync_conflicts (
            incoming_idempotency_key, entity_type, entity_id, operation,
            conflict_type, reason_code, message,
            local_payload_json, remote_payload_json, base_payload_json,
            status, detected_at, created_at, updated_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 'open', ?, ?, ?)
        "#,
    )
    .bind(&conflict.incoming_idempotency_key)
    .bind(conflict.entity_type.as_str())
    .bind(&conflict.entity_id)
    .bind(conflict.operation.as_str())
    .bind(conflict.conflict_type)
    .bind(&conflict.reason_code)
    .bind(&conflict.message)
    .bind(conflict.local_payload.as_ref().map(|v| v.to_string()))
    .bind(conflict.remote_payload.as_ref().map(|v| v.to_string()))
    .bind(conflict.base_payload.as_ref().map(|v| v.to_string()))
    .bind(now)
    .bind(now)
    .bind(now)
    .execute(&mut *conn)
    .await?;

    let conflict_id = result.last_insert_rowid();

    append_event(
        conn,
        conflict_id,
        ConflictEventType::Detected,
        Some(json!({
            "reason_code": conflict.reason_code,
            "entity_type": conflict.entity_type.as_str(),
            "entity_id": conflict.entity_id,
        })),
    )
    .await?;

    tracing::warn!(
        "Sync conflict {} on {} {}: {}",
        conflict_id,
        conflict.entity_type.as_str(),
        conflict.entity_id,
        conflict.reason_code
    );

    Ok(conflict_id)
}

async fn append_event(
    conn: &mut SqliteConnection,
    conflict_id: i64,
    event_type: ConflictEventType,
    payload: Option<Value>,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO sync_conflict_events (conflict_id, event_type, event_payload_json, created_at)
        VALUES (?, ?, ?, ?)
        "#,
    )
    .bind(conflict_id)
    .bind(event_type)
    .bind(payload.map(|v| v.to_string()))
    .bind(Utc::now())
    .execute(conn)
    .await?;

    Ok(())
}

/// Get one conflict by id.
pub async fn get_conflict(pool: &SqlitePool, id: i64) -> Result<ConflictRecord> {
    sqlx::query_as::<_, ConflictRecord>("SELECT * FROM sync_conflicts WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| Error::NotFound(format!("Conflict {} not found", id)))
}

/// List conflicts, optionally filtered by status, newest detection first.
pub async fn list_conflicts(
    pool: &SqlitePool,
    status: Option<ConflictStatus>,
) -> Result<Vec<ConflictRecord>> {
    let conflicts = match status {
        Some(status) => {
            sqlx::query_as::<_, ConflictRecord>(
                "SELECT * FROM sync_conflicts WHERE status = ? ORDER BY detected_at DESC, id DESC",
            )
            .bind(status)
            .fetch_all(pool)
            .await?
        }
        None => {
            sqlx::query_as::<_, ConflictRecord>(
                "SELECT * FROM sync_conflicts ORDER BY detected_at DESC, id DESC",
            )
            .fetch_all(pool)
            .await?
        }
    };

    Ok(conflicts)
}

/// Events for a conflict in chronological order.
pub async fn list_events(pool: &SqlitePool, conflict_id: i64) -> Result<Vec<ConflictEvent>> {
    let events = sqlx::query_as::<_, ConflictEvent>(
        "SELECT * FROM sync_conflict_events WHERE conflict_id = ? ORDER BY created_at ASC, id ASC",
    )
    .bind(conflict_id)
    .fetch_all(pool)
    .await?;

    Ok(events)
}

/// Resolve an open conflict with the given strategy.
///
/// - `keep_local` re-emits the local row as a fresh UPSERT (version bump +
///   outbox) so the server learns our side.
/// - `keep_remote` re-applies the remote payload as authoritative, bypassing
///   conflict detection; nothing is pushed back.
/// - `manual_merge` writes the supplied merged payload as a local UPSERT.
/// - `retry` leaves the conflict open and only records a `retried` event;
///   the next sync cycle re-evaluates the entity.
pub async fn resolve_conflict(
    pool: &SqlitePool,
    resolved_by_device: &str,
    conflict_id: i64,
    strategy: ResolutionStrategy,
    resolution_payload: Option<Value>,
) -> Result<ConflictRecord> {
    let conflict = get_conflict(pool, conflict_id).await?;
    if conflict.status != ConflictStatus::Open {
        return Err(Error::InvalidInput(format!(
            "Conflict {} is already {:?}",
            conflict_id, conflict.status
        )));
    }

    let entity_type = EntityType::parse(&conflict.entity_type)
        .ok_or_else(|| Error::Database(format!("Unknown entity type {}", conflict.entity_type)))?;

    let mut tx = pool.begin().await?;

    match strategy {
        ResolutionStrategy::Retry => {
            append_event(&mut tx, conflict_id, ConflictEventType::Retried, None).await?;
            sqlx::query("UPDATE sync_conflicts SET updated_at = ? WHERE id = ?")
                .bind(Utc::now())
                .bind(conflict_id)
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;
            return get_conflict(pool, conflict_id).await;
        }
        ResolutionStrategy::KeepLocal => {
            crate::db::ensure_writes_allowed(&mut tx).await?;
            keep_local(&mut tx, resolved_by_device, entity_type, &conflict).await?;
        }
        ResolutionStrategy::KeepRemote => {
            keep_remote(&mut tx, resolved_by_device, entity_type, &conflict).await?;
        }
        ResolutionStrategy::ManualMerge => {
            crate::db::ensure_writes_allowed(&mut tx).await?;
            let merged = resolution_payload.clone().ok_or_else(|| {
                Error::InvalidInput("manual_merge requires a resolution payload".to_string())
            })?;
            manual_merge(&mut tx, resolved_by_device, entity_type, &conflict, merged).await?;
        }
    }

    let now = Utc::now();
    sqlx::query(
        r#"
        UPDATE sync_conflicts
        SET status = 'resolved',
            resolution_strategy = ?,
            resolution_payload_json = ?,
            resolved_by_device = ?,
            resolved_at = ?,
            updated_at = ?
        WHERE id = ?
        "#,
    )
    .bind(strategy)
    .bind(resolution_payload.as_ref().map(|v| v.to_string()))
    .bind(resolved_by_device)
    .bind(now)
    .bind(now)
    .bind(conflict_id)
    .execute(&mut *tx)
    .await?;

    append_event(
        &mut tx,
        conflict_id,
        ConflictEventType::Resolved,
        Some(json!({ "strategy": strategy })),
    )
    .await?;

    tx.commit().await?;

    tracing::info!("Conflict {} resolved with {:?}", conflict_id, strategy);

    get_conflict(pool, conflict_id).await
}

/// Mark a conflict ignored without touching entity state.
pub async fn ignore_conflict(pool: &SqlitePool, conflict_id: i64) -> Result<ConflictRecord> {
    let conflict = get_conflict(pool, conflict_id).await?;
    if conflict.status != ConflictStatus::Open {
        return Err(Error::InvalidInput(format!(
            "Conflict {} is already {:?}",
            conflict_id, conflict.status
        )));
    }

    let mut tx = pool.begin().await?;

    sqlx::query("UPDATE sync_conflicts SET status = 'ignored', updated_at = ? WHERE id = ?")
        .bind(Utc::now())
        .bind(conflict_id)
        .execute(&mut *tx)
        .await?;
    append_event(&mut tx, conflict_id, ConflictEventType::Ignored, None).await?;

    tx.commit().await?;

    get_conflict(pool, conflict_id).await
}

async fn keep_local(
    conn: &mut SqliteConnection,
    device_id: &str,
    entity_type: EntityType,
    conflict: &ConflictRecord,
) -> Result<()> {
    let local = apply::load_local(conn, entity_type, &conflict.entity_id).await?;

    let local = match local {
        Some(local) => local,
        // Nothing local to keep (e.g. validation_error on a fresh insert):
        // closing the conflict is the whole resolution.
        None => return Ok(()),
    };

    let change = ChangeRecord {
        entity_type,
        entity_id: conflict.entity_id.clone(),
        operation: ChangeOperation::Upsert,
        updated_at: tasks::monotonic_now(local.updated_at),
        updated_by_device: device_id.to_string(),
        sync_version: local.sync_version + 1,
        payload: Some(local.payload.clone()),
        idempotency_key: String::new(),
    };

    apply::upsert_row(conn, &change, &local.payload, Some(&local)).await?;
    enqueue_resolution_upsert(conn, device_id, entity_type, &conflict.entity_id).await?;

    Ok(())
}

async fn keep_remote(
    conn: &mut SqliteConnection,
    device_id: &str,
    entity_type: EntityType,
    conflict: &ConflictRecord,
) -> Result<()> {
    let operation = ChangeOperation::parse(&conflict.operation)
        .ok_or_else(|| Error::Database(format!("Unknown operation {}", conflict.operation)))?;

    match operation {
        ChangeOperation::Delete => {
            apply::delete_row(conn, entity_type, &conflict.entity_id).await?;
            tasks::write_tombstone(conn, entity_type, &conflict.entity_id, device_id, Utc::now())
                .await?;
        }
        ChangeOperation::Upsert => {
            let payload: Value = conflict
                .remote_payload_json
                .as_deref()
                .map(serde_json::from_str)
                .transpose()?
                .filter(Value::is_object)
                .unwrap_or_else(|| Value::Object(Default::default()));

            let metadata = RemoteMetadata::from_payload(&payload);
            let local = apply::load_local(conn, entity_type, &conflict.entity_id).await?;

            let change = ChangeRecord {
                entity_type,
                entity_id: conflict.entity_id.clone(),
                operation: ChangeOperation::Upsert,
                updated_at: metadata.updated_at,
                updated_by_device: metadata.updated_by_device,
                sync_version: metadata.sync_version,
                payload: Some(payload.clone()),
                idempotency_key: String::new(),
            };

            apply::upsert_row(conn, &change, &payload, local.as_ref()).await?;
            tasks::remove_tombstone(conn, entity_type, &conflict.entity_id).await?;
        }
    }

    Ok(())
}

async fn manual_merge(
    conn: &mut SqliteConnection,
    device_id: &str,
    entity_type: EntityType,
    conflict: &ConflictRecord,
    merged: Value,
) -> Result<()> {
    let local = apply::load_local(conn, entity_type, &conflict.entity_id).await?;
    let (base_version, base_updated_at) = local
        .as_ref()
        .map(|l| (l.sync_version, l.updated_at))
        .unwrap_or((0, Utc::now()));

    let change = ChangeRecord {
        entity_type,
        entity_id: conflict.entity_id.clone(),
        operation: ChangeOperation::Upsert,
        updated_at: tasks::monotonic_now(base_updated_at),
        updated_by_device: device_id.to_string(),
        sync_version: base_version + 1,
        payload: Some(merged.clone()),
        idempotency_key: String::new(),
    };

    apply::upsert_row(conn, &change, &merged, local.as_ref()).await?;
    tasks::remove_tombstone(conn, entity_type, &conflict.entity_id).await?;
    enqueue_resolution_upsert(conn, device_id, entity_type, &conflict.entity_id).await?;

    Ok(())
}

/// Enqueue the just-written row as a local UPSERT so the resolution reaches
/// the server on the next push.
async fn enqueue_resolution_upsert(
    conn: &mut SqliteConnection,
    device_id: &str,
    entity_type: EntityType,
    entity_id: &str,
) -> Result<()> {
    let current = apply::load_local(conn, entity_type, entity_id)
        .await?
        .ok_or_else(|| Error::Database(format!("Resolved row {} missing", entity_id)))?;

    outbox::enqueue_change(
        conn,
        device_id,
        entity_type,
        entity_id,
        ChangeOperation::Upsert,
        Some(&current.payload),
    )
    .await
}

struct RemoteMetadata {
    updated_at: DateTime<Utc>,
    updated_by_device: String,
    sync_version: i64,
}

impl RemoteMetadata {
    /// Entity payloads carry their own sync metadata; fall back to "now" for
    /// payloads that do not.
    fn from_payload(payload: &Value) -> Self {
        let updated_at = payload
            .get("updated_at")
            .and_then(Value::as_str)
            .map(crate::protocol::codec::coerce_timestamp)
            .unwrap_or_else(Utc::now);
        let updated_by_device = payload
            .get("updated_by_device")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();
        let sync_version = payload
            .get("sync_version")
            .and_then(Value::as_i64)
            .unwrap_or(1)
            .max(1);

        Self {
            updated_at,
            updated_by_device,
            sync_version,
        }
    }
}

// ============================================================================
// Observability
// ============================================================================

/// Aggregated conflict counters for the diagnostics surface.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ConflictCounters {
    pub total_conflicts: i64,
    pub open_conflicts: i64,
    pub resolved_conflicts: i64,
    pub ignored_conflicts: i64,
    pub retried_events: i64,
    pub exported_events: i64,
    pub resolution_rate_percent: i64,
    pub median_resolution_time_ms: Option<i64>,
    pub latest_detected_at: Option<DateTime<Utc>>,
    pub latest_resolved_at: Option<DateTime<Utc>>,
}

pub async fn observability_counters(pool: &SqlitePool) -> Result<ConflictCounters> {
    let totals: (i64, Option<i64>, Option<i64>, Option<i64>) = sqlx::query_as(
        r#"
        SELECT
            COUNT(*),
            SUM(CASE WHEN status = 'open' THEN 1 ELSE 0 END),
            SUM(CASE WHEN status = 'resolved' THEN 1 ELSE 0 END),
            SUM(CASE WHEN status = 'ignored' THEN 1 ELSE 0 END)
        FROM sync_conflicts
        "#,
    )
    .fetch_one(pool)
    .await?;
    let (total, open, resolved, ignored) = (
        totals.0,
        totals.1.unwrap_or(0),
        totals.2.unwrap_or(0),
        totals.3.unwrap_or(0),
    );

    let retried_events: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM sync_conflict_events WHERE event_type = 'retried'",
    )
    .fetch_one(pool)
    .await?;

    let exported_events: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM sync_conflict_events WHERE event_type = 'exported'",
    )
    .fetch_one(pool)
    .await?;

    let resolution_rate_percent = if total == 0 {
        0
    } else {
        ((resolved as f64 / total as f64) * 100.0).round() as i64
    };

    let resolved_pairs: Vec<(DateTime<Utc>, DateTime<Utc>)> = sqlx::query_as(
        r#"
        SELECT detected_at, resolved_at FROM sync_conflicts
        WHERE status = 'resolved' AND resolved_at IS NOT NULL
        "#,
    )
    .fetch_all(pool)
    .await?;

    let mut durations_ms: Vec<i64> = resolved_pairs
        .iter()
        .map(|(detected, resolved)| (*resolved - *detected).num_milliseconds().max(0))
        .collect();
    durations_ms.sort_unstable();

    let median_resolution_time_ms = if durations_ms.is_empty() {
        None
    } else {
        let mid = durations_ms.len() / 2;
        Some(if durations_ms.len() % 2 == 1 {
            durations_ms[mid]
        } else {
            (durations_ms[mid - 1] + durations_ms[mid]) / 2
        })
    };

    let latest_detected_at: Option<DateTime<Utc>> =
        sqlx::query_scalar("SELECT MAX(detected_at) FROM sync_conflicts")
            .fetch_one(pool)
            .await?;
    let latest_resolved_at: Option<DateTime<Utc>> =
        sqlx::query_scalar("SELECT MAX(resolved_at) FROM sync_conflicts")
            .fetch_one(pool)
            .await?;

    Ok(ConflictCounters {
        total_conflicts: total,
        open_conflicts: open,
        resolved_conflicts: resolved,
        ignored_conflicts: ignored,
        retried_events,
        exported_events,
        resolution_rate_percent,
        median_resolution_time_ms,
        latest_detected_at,
        latest_resolved_at,
    })
}

/// Export a stable JSON report of conflicts and their event trails.
///
/// Emits an `exported` event for every conflict included.
pub async fn export_report(
    pool: &SqlitePool,
    status_filter: Option<ConflictStatus>,
) -> Result<Value> {
    let conflicts = list_conflicts(pool, status_filter).await?;

    let mut items = Vec::with_capacity(conflicts.len());
    let mut tx = pool.begin().await?;
    for conflict in &conflicts {
        let events = sqlx::query_as::<_, ConflictEvent>(
            "SELECT * FROM sync_conflict_events WHERE conflict_id = ? ORDER BY created_at ASC, id ASC",
        )
        .bind(conflict.id)
        .fetch_all(&mut *tx)
        .await?;

        items.push(json!({
            "conflict": conflict,
            "events": events,
        }));

        append_event(&mut tx, conflict.id, ConflictEventType::Exported, None).await?;
    }
    tx.commit().await?;

    let status_filter = match status_filter {
        Some(status) => serde_json::to_value(status)?,
        None => json!("all"),
    };

    Ok(json!({
        "version": 1,
        "exported_at": Utc::now(),
        "report_type": "sync_conflicts",
        "total_conflicts": conflicts.len(),
        "status_filter": status_filter,
        "items": items,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::tasks::{create_task, get_task, TaskDraft};
    use crate::sync::apply::{apply_incoming_change, ApplyOutcome};
    use serde_json::json;

    /// Open a notes-collision conflict between the seeded local row and a
    /// concurrent remote edit, returning the conflict id.
    async fn open_conflict(pool: &SqlitePool) -> i64 {
        let seed = ChangeRecord {
            entity_type: EntityType::Task,
            entity_id: "t1".to_string(),
            operation: ChangeOperation::Upsert,
            updated_at: crate::protocol::codec::coerce_timestamp("2026-02-17T10:00:00Z"),
            updated_by_device: "dev-a2".to_string(),
            sync_version: 1,
            payload: Some(json!({"title": "Shared", "notes_markdown": "local"})),
            idempotency_key: "dev-a2:seed".to_string(),
        };
        apply_incoming_change(pool, "dev-local", &seed).await.unwrap();

        let concurrent = ChangeRecord {
            updated_by_device: "dev-b".to_string(),
            payload: Some(json!({"title": "Shared", "notes_markdown": "remote"})),
            idempotency_key: "dev-b:edit".to_string(),
            ..seed
        };
        assert_eq!(
            apply_incoming_change(pool, "dev-local", &concurrent)
                .await
                .unwrap(),
            ApplyOutcome::Conflict
        );

        list_conflicts(pool, Some(ConflictStatus::Open))
            .await
            .unwrap()[0]
            .id
    }

    #[tokio::test]
    async fn test_keep_local_bumps_version_and_enqueues() {
        let pool = crate::db::test_pool().await;
        let id = open_conflict(&pool).await;

        let resolved = resolve_conflict(&pool, "dev-local", id, ResolutionStrategy::KeepLocal, None)
            .await
            .unwrap();
        assert_eq!(resolved.status, ConflictStatus::Resolved);
        assert_eq!(resolved.resolution_strategy, Some(ResolutionStrategy::KeepLocal));
        assert!(resolved.resolved_at.is_some());

        let task = get_task(&pool, "t1").await.unwrap().unwrap();
        assert_eq!(task.notes_markdown.as_deref(), Some("local"));
        assert_eq!(task.sync_version, 2);
        assert_eq!(task.updated_by_device, "dev-local");

        let pending = crate::db::outbox::list_pending(&pool, 10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].entity_id, "t1");
        assert_eq!(pending[0].operation, "UPSERT");
    }

    #[tokio::test]
    async fn test_keep_remote_applies_remote_payload() {
        let pool = crate::db::test_pool().await;
        let id = open_conflict(&pool).await;

        resolve_conflict(&pool, "dev-local", id, ResolutionStrategy::KeepRemote, None)
            .await
            .unwrap();

        let task = get_task(&pool, "t1").await.unwrap().unwrap();
        assert_eq!(task.notes_markdown.as_deref(), Some("remote"));

        // Server already has this state; nothing is pushed back
        assert!(crate::db::outbox::list_pending(&pool, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_manual_merge_requires_and_applies_payload() {
        let pool = crate::db::test_pool().await;
        let id = open_conflict(&pool).await;

        let err = resolve_conflict(&pool, "dev-local", id, ResolutionStrategy::ManualMerge, None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));

        let merged = json!({"title": "Shared", "notes_markdown": "local\n\nremote"});
        resolve_conflict(
            &pool,
            "dev-local",
            id,
            ResolutionStrategy::ManualMerge,
            Some(merged),
        )
        .await
        .unwrap();

        let task = get_task(&pool, "t1").await.unwrap().unwrap();
        assert_eq!(task.notes_markdown.as_deref(), Some("local\n\nremote"));
        assert_eq!(task.sync_version, 2);
        assert_eq!(
            crate::db::outbox::list_pending(&pool, 10).await.unwrap().len(),
            1
        );
    }

    #[tokio::test]
    async fn test_retry_keeps_conflict_open() {
        let pool = crate::db::test_pool().await;
        let id = open_conflict(&pool).await;

        let after = resolve_conflict(&pool, "dev-local", id, ResolutionStrategy::Retry, None)
            .await
            .unwrap();
        assert_eq!(after.status, ConflictStatus::Open);
        assert_eq!(after.resolved_at, None);

        let events = list_events(&pool, id).await.unwrap();
        let kinds: Vec<ConflictEventType> = events.iter().map(|e| e.event_type).collect();
        assert!(kinds.contains(&ConflictEventType::Detected));
        assert!(kinds.contains(&ConflictEventType::Retried));
    }

    #[tokio::test]
    async fn test_ignore_conflict() {
        let pool = crate::db::test_pool().await;
        let id = open_conflict(&pool).await;

        let ignored = ignore_conflict(&pool, id).await.unwrap();
        assert_eq!(ignored.status, ConflictStatus::Ignored);

        let err = resolve_conflict(&pool, "dev-local", id, ResolutionStrategy::KeepLocal, None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_counters_and_resolution_rate() {
        let pool = crate::db::test_pool().await;

        let empty = observability_counters(&pool).await.unwrap();
        assert_eq!(empty.total_conflicts, 0);
        assert_eq!(empty.resolution_rate_percent, 0);
        assert_eq!(empty.median_resolution_time_ms, None);

        let first = open_conflict(&pool).await;
        resolve_conflict(&pool, "dev-local", first, ResolutionStrategy::KeepLocal, None)
            .await
            .unwrap();

        // A second, distinct conflict stays open
        let task = create_task(
            &pool,
            "dev-local",
            TaskDraft {
                title: "Other".to_string(),
                ..TaskDraft::default()
            },
        )
        .await
        .unwrap();
        let stale_delete = ChangeRecord {
            entity_type: EntityType::Task,
            entity_id: task.id.clone(),
            operation: ChangeOperation::Delete,
            updated_at: task.updated_at - chrono::Duration::seconds(5),
            updated_by_device: "dev-b".to_string(),
            sync_version: 1,
            payload: None,
            idempotency_key: "dev-b:del".to_string(),
        };
        apply_incoming_change(&pool, "dev-local", &stale_delete)
            .await
            .unwrap();

        let counters = observability_counters(&pool).await.unwrap();
        assert_eq!(counters.total_conflicts, 2);
        assert_eq!(counters.open_conflicts, 1);
        assert_eq!(counters.resolved_conflicts, 1);
        assert_eq!(counters.resolution_rate_percent, 50);
        assert!(counters.median_resolution_time_ms.is_some());
        assert!(counters.latest_detected_at.is_some());
        assert!(counters.latest_resolved_at.is_some());
    }

    #[tokio::test]
    async fn test_export_report_shape_and_events() {
        let pool = crate::db::test_pool().await;
        let id = open_conflict(&pool).await;

        let report = export_report(&pool, Some(ConflictStatus::Open)).await.unwrap();
        assert_eq!(report["version"], 1);
        assert_eq!(report["report_type"], "sync_conflicts");
        assert_eq!(report["total_conflicts"], 1);
        assert_eq!(report["status_filter"], "open");
        assert_eq!(report["items"].as_array().unwrap().len(), 1);

        let counters = observability_counters(&pool).await.unwrap();
        assert_eq!(counters.exported_events, 1);

        let events = list_events(&pool, id).await.unwrap();
        assert!(events
            .iter()
            .any(|e| e.event_type == ConflictEventType::Exported));
    }
}
