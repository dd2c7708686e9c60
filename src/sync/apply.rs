// sync/apply.rs - Incoming-change apply pipeline and conflict detection
//
// Decision order for an incoming change: self-change filter, tombstone
// checks, idempotent-replay equality, last-write-wins merge, and the
// notes-collision carve-out. Anything that cannot be applied cleanly is
// recorded as an open conflict; nothing here ever enqueues an outbox row.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;
use sqlx::{SqliteConnection, SqlitePool};

use crate::db::conflicts::{self, NewConflict};
use crate::db::models::{
    DeletedRecord, Project, ProjectStatus, Recurrence, Task, TaskPriority, TaskStatus,
    TaskSubtask, TaskTemplate,
};
use crate::db::tasks::{remove_tombstone, write_tombstone};
use crate::protocol::{ChangeOperation, ChangeRecord, EntityType};
use crate::{Error, Result};

/// Outcome of applying one incoming change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The change was written to the store.
    Applied,
    /// The change was a no-op (self-change, replay, stale, tombstoned).
    Skipped,
    /// A conflict record was opened instead of applying.
    Conflict,
}

/// Apply one incoming change against the local store.
///
/// Idempotent: replaying the same change yields `Skipped` via the
/// (updated_at, updated_by_device, sync_version) equality tuple.
pub async fn apply_incoming_change(
    pool: &SqlitePool,
    local_device_id: &str,
    change: &ChangeRecord,
) -> Result<ApplyOutcome> {
    // Self-change filter: never loop our own mutations back in.
    if change.updated_by_device == local_device_id {
        return Ok(ApplyOutcome::Skipped);
    }

    // Sync-plane settings are never writable from the wire.
    if change.entity_type == EntityType::Setting
        && change
            .entity_id
            .starts_with(crate::db::settings_keys::INTERNAL_PREFIX)
    {
        tracing::warn!("Ignoring incoming change to reserved setting {}", change.entity_id);
        return Ok(ApplyOutcome::Skipped);
    }

    let mut tx = pool.begin().await?;

    let local = load_local(&mut tx, change.entity_type, &change.entity_id).await?;
    let tombstone = get_tombstone(&mut tx, change.entity_type, &change.entity_id).await?;

    let outcome = match change.operation {
        ChangeOperation::Delete => {
            apply_delete(&mut tx, change, local.as_ref(), tombstone.as_ref()).await?
        }
        ChangeOperation::Upsert => {
            apply_upsert(&mut tx, change, local.as_ref(), tombstone.as_ref()).await?
        }
    };

    tx.commit().await?;

    Ok(outcome)
}

async fn apply_delete(
    conn: &mut SqliteConnection,
    change: &ChangeRecord,
    local: Option<&LocalEntity>,
    tombstone: Option<&DeletedRecord>,
) -> Result<ApplyOutcome> {
    if let Some(existing) = tombstone {
        if existing.deleted_at >= change.updated_at {
            // Already deleted at least as recently; replay.
            return Ok(ApplyOutcome::Skipped);
        }
    }

    if let Some(local) = local {
        if local.updated_at > change.updated_at {
            let conflict = NewConflict {
                incoming_idempotency_key: change.idempotency_key.clone(),
                entity_type: change.entity_type,
                entity_id: change.entity_id.clone(),
                operation: change.operation,
                conflict_type: crate::db::models::ConflictType::DeleteVsUpdate,
                reason_code: "DELETE_OLDER_THAN_LOCAL".to_string(),
                message: "Incoming delete is older than the local edit".to_string(),
                local_payload: Some(local.payload.clone()),
                remote_payload: change.payload.clone(),
                base_payload: None,
            };
            conflicts::record_conflict(conn, conflict).await?;
            return Ok(ApplyOutcome::Conflict);
        }

        delete_row(conn, change.entity_type, &change.entity_id).await?;
    }

    write_tombstone(
        conn,
        change.entity_type,
        &change.entity_id,
        &change.updated_by_device,
        change.updated_at,
    )
    .await?;

    Ok(ApplyOutcome::Applied)
}

async fn apply_upsert(
    conn: &mut SqliteConnection,
    change: &ChangeRecord,
    local: Option<&LocalEntity>,
    tombstone: Option<&DeletedRecord>,
) -> Result<ApplyOutcome> {
    if let Some(existing) = tombstone {
        if existing.deleted_at >= change.updated_at {
            // The tombstone wins over an older or concurrent upsert.
            return Ok(ApplyOutcome::Skipped);
        }
    }

    let payload = change
        .payload
        .clone()
        .filter(Value::is_object)
        .unwrap_or_else(|| Value::Object(Default::default()));

    let local = match local {
        None => {
            if let Some((reason_code, message)) = validate_incoming(conn, change, &payload).await? {
                let conflict = NewConflict {
                    incoming_idempotency_key: change.idempotency_key.clone(),
                    entity_type: change.entity_type,
                    entity_id: change.entity_id.clone(),
                    operation: change.operation,
                    conflict_type: crate::db::models::ConflictType::ValidationError,
                    reason_code,
                    message,
                    local_payload: None,
                    remote_payload: change.payload.clone(),
                    base_payload: None,
                };
                conflicts::record_conflict(conn, conflict).await?;
                return Ok(ApplyOutcome::Conflict);
            }

            upsert_row(conn, change, &payload, None).await?;
            remove_tombstone(conn, change.entity_type, &change.entity_id).await?;
            return Ok(ApplyOutcome::Applied);
        }
        Some(local) => local,
    };

    // Idempotent replay: exact metadata tuple already present.
    if local.updated_at == change.updated_at
        && local.updated_by_device == change.updated_by_device
        && local.sync_version == change.sync_version
    {
        return Ok(ApplyOutcome::Skipped);
    }

    if local.updated_at < change.updated_at {
        // Strictly newer incoming: last write wins across all fields.
        if let Some((reason_code, message)) = validate_incoming(conn, change, &payload).await? {
            let conflict = NewConflict {
                incoming_idempotency_key: change.idempotency_key.clone(),
                entity_type: change.entity_type,
                entity_id: change.entity_id.clone(),
                operation: change.operation,
                conflict_type: crate::db::models::ConflictType::ValidationError,
                reason_code,
                message,
                local_payload: Some(local.payload.clone()),
                remote_payload: change.payload.clone(),
                base_payload: None,
            };
            conflicts::record_conflict(conn, conflict).await?;
            return Ok(ApplyOutcome::Conflict);
        }

        upsert_row(conn, change, &payload, Some(local)).await?;
        remove_tombstone(conn, change.entity_type, &change.entity_id).await?;
        return Ok(ApplyOutcome::Applied);
    }

    if local.updated_at > change.updated_at {
        // Stale incoming: our copy is newer.
        return Ok(ApplyOutcome::Skipped);
    }

    // Equal timestamps from the same device: replay variant, nothing to do.
    if local.updated_by_device == change.updated_by_device {
        return Ok(ApplyOutcome::Skipped);
    }

    // Equal timestamps, different devices: a genuine concurrent edit.
    let incoming_fields = payload.as_object().cloned().unwrap_or_default();

    // Notes are never auto-merged; a divergent concurrent notes edit is its
    // own conflict type.
    if change.entity_type == EntityType::Task {
        if let Some(incoming_notes) = incoming_fields.get("notes_markdown") {
            let local_notes = local
                .payload
                .get("notes_markdown")
                .cloned()
                .unwrap_or(Value::Null);
            if !values_equivalent(&local_notes, incoming_notes) {
                let conflict = NewConflict {
                    incoming_idempotency_key: change.idempotency_key.clone(),
                    entity_type: change.entity_type,
                    entity_id: change.entity_id.clone(),
                    operation: change.operation,
                    conflict_type: crate::db::models::ConflictType::NotesCollision,
                    reason_code: "NOTES_CONCURRENT_EDIT".to_string(),
                    message: "Concurrent edits touched the task notes".to_string(),
                    local_payload: Some(local.payload.clone()),
                    remote_payload: change.payload.clone(),
                    base_payload: None,
                };
                conflicts::record_conflict(conn, conflict).await?;
                return Ok(ApplyOutcome::Conflict);
            }
        }
    }

    if fields_disagree(&local.payload, &incoming_fields) {
        let conflict = NewConflict {
            incoming_idempotency_key: change.idempotency_key.clone(),
            entity_type: change.entity_type,
            entity_id: change.entity_id.clone(),
            operation: change.operation,
            conflict_type: crate::db::models::ConflictType::FieldConflict,
            reason_code: "CONCURRENT_FIELD_EDIT".to_string(),
            message: "Concurrent edits disagree on entity fields".to_string(),
            local_payload: Some(local.payload.clone()),
            remote_payload: change.payload.clone(),
            base_payload: None,
        };
        conflicts::record_conflict(conn, conflict).await?;
        return Ok(ApplyOutcome::Conflict);
    }

    // Same instant, same content: tie-break is irrelevant.
    Ok(ApplyOutcome::Skipped)
}

/// Validation rules for incoming task payloads.
///
/// Returns Some((reason_code, message)) when the change must be rejected as
/// a validation_error conflict.
async fn validate_incoming(
    conn: &mut SqliteConnection,
    change: &ChangeRecord,
    payload: &Value,
) -> Result<Option<(String, String)>> {
    if change.entity_type != EntityType::Task {
        return Ok(None);
    }

    let title = payload.get("title").and_then(Value::as_str).unwrap_or("");
    if title.trim().is_empty() {
        return Ok(Some((
            "MISSING_TASK_TITLE".to_string(),
            "Task title is empty".to_string(),
        )));
    }

    if let Some(project_id) = payload.get("project_id").and_then(Value::as_str) {
        let exists: Option<(i64,)> = sqlx::query_as("SELECT 1 FROM projects WHERE id = ?")
            .bind(project_id)
            .fetch_optional(&mut *conn)
            .await?;
        if exists.is_none() {
            return Ok(Some((
                "TASK_PROJECT_NOT_FOUND".to_string(),
                format!("Task references unknown project {}", project_id),
            )));
        }
    }

    Ok(None)
}

// ============================================================================
// Local snapshots
// ============================================================================

/// Sync-relevant view of a local row: metadata tuple plus the serialized
/// entity used for comparisons and conflict records.
#[derive(Debug, Clone)]
pub(crate) struct LocalEntity {
    pub updated_at: DateTime<Utc>,
    pub updated_by_device: String,
    pub sync_version: i64,
    pub payload: Value,
}

pub(crate) async fn load_local(
    conn: &mut SqliteConnection,
    entity_type: EntityType,
    entity_id: &str,
) -> Result<Option<LocalEntity>> {
    let snapshot = match entity_type {
        EntityType::Project => {
            sqlx::query_as::<_, Project>("SELECT * FROM projects WHERE id = ?")
                .bind(entity_id)
                .fetch_optional(&mut *conn)
                .await?
                .map(|row| LocalEntity {
                    updated_at: row.updated_at,
                    updated_by_device: row.updated_by_device.clone(),
                    sync_version: row.sync_version,
                    payload: serde_json::to_value(&row).unwrap_or(Value::Null),
                })
        }
        EntityType::Task => sqlx::query_as::<_, Task>("SELECT * FROM tasks WHERE id = ?")
            .bind(entity_id)
            .fetch_optional(&mut *conn)
            .await?
            .map(|row| LocalEntity {
                updated_at: row.updated_at,
                updated_by_device: row.updated_by_device.clone(),
                sync_version: row.sync_version,
                payload: serde_json::to_value(&row).unwrap_or(Value::Null),
            }),
        EntityType::TaskSubtask => {
            sqlx::query_as::<_, TaskSubtask>("SELECT * FROM task_subtasks WHERE id = ?")
                .bind(entity_id)
                .fetch_optional(&mut *conn)
                .await?
                .map(|row| LocalEntity {
                    updated_at: row.updated_at,
                    updated_by_device: row.updated_by_device.clone(),
                    sync_version: row.sync_version,
                    payload: serde_json::to_value(&row).unwrap_or(Value::Null),
                })
        }
        EntityType::TaskTemplate => {
            sqlx::query_as::<_, TaskTemplate>("SELECT * FROM task_templates WHERE id = ?")
                .bind(entity_id)
                .fetch_optional(&mut *conn)
                .await?
                .map(|row| LocalEntity {
                    updated_at: row.updated_at,
                    updated_by_device: row.updated_by_device.clone(),
                    sync_version: row.sync_version,
                    payload: serde_json::to_value(&row).unwrap_or(Value::Null),
                })
        }
        EntityType::Setting => {
            let row: Option<(String, String, DateTime<Utc>, i64, String)> = sqlx::query_as(
                "SELECT key, value, updated_at, sync_version, updated_by_device FROM settings WHERE key = ?",
            )
            .bind(entity_id)
            .fetch_optional(&mut *conn)
            .await?;
            row.map(|(key, value, updated_at, sync_version, updated_by_device)| LocalEntity {
                updated_at,
                updated_by_device,
                sync_version,
                payload: serde_json::json!({ "key": key, "value": value }),
            })
        }
    };

    Ok(snapshot)
}

pub(crate) async fn get_tombstone(
    conn: &mut SqliteConnection,
    entity_type: EntityType,
    entity_id: &str,
) -> Result<Option<DeletedRecord>> {
    let tombstone = sqlx::query_as::<_, DeletedRecord>(
        "SELECT * FROM deleted_records WHERE entity_type = ? AND entity_id = ?",
    )
    .bind(entity_type.as_str())
    .bind(entity_id)
    .fetch_optional(conn)
    .await?;

    Ok(tombstone)
}

pub(crate) async fn delete_row(
    conn: &mut SqliteConnection,
    entity_type: EntityType,
    entity_id: &str,
) -> Result<()> {
    let sql = match entity_type {
        EntityType::Project => "DELETE FROM projects WHERE id = ?",
        EntityType::Task => "DELETE FROM tasks WHERE id = ?",
        EntityType::TaskSubtask => "DELETE FROM task_subtasks WHERE id = ?",
        EntityType::TaskTemplate => "DELETE FROM task_templates WHERE id = ?",
        EntityType::Setting => "DELETE FROM settings WHERE key = ?",
    };

    sqlx::query(sql).bind(entity_id).execute(conn).await?;

    Ok(())
}

// ============================================================================
// Typed payload decode + row writes
// ============================================================================

/// Write an incoming payload into the store as the authoritative row state.
///
/// Payloads are decoded into typed entity structs; unknown fields are
/// ignored on ingest. The change metadata (updated_at, device, version)
/// always comes from the change envelope, not the payload.
pub(crate) async fn upsert_row(
    conn: &mut SqliteConnection,
    change: &ChangeRecord,
    payload: &Value,
    existing: Option<&LocalEntity>,
) -> Result<()> {
    match change.entity_type {
        EntityType::Project => {
            let fields: ProjectPayload = decode_payload(payload)?;
            let created_at = fields.created_at.unwrap_or(change.updated_at);
            let project = Project {
                id: change.entity_id.clone(),
                name: fields.name,
                description: fields.description,
                color: fields.color,
                status: fields.status,
                created_at,
                updated_at: change.updated_at,
                sync_version: change.sync_version,
                updated_by_device: change.updated_by_device.clone(),
            };
            if existing.is_some() {
                crate::db::projects::update_project_row(conn, &project).await?;
            } else {
                crate::db::projects::insert_project_row(conn, &project).await?;
            }
        }
        EntityType::Task => {
            let fields: TaskPayload = decode_payload(payload)?;
            let created_at = fields.created_at.unwrap_or(change.updated_at);
            let task = Task {
                id: change.entity_id.clone(),
                title: fields.title,
                description: fields.description,
                notes_markdown: fields.notes_markdown,
                project_id: fields.project_id,
                status: fields.status,
                priority: fields.priority,
                is_important: fields.is_important,
                due_at: fields.due_at,
                remind_at: fields.remind_at,
                recurrence: fields.recurrence,
                created_at,
                updated_at: change.updated_at,
                sync_version: change.sync_version,
                updated_by_device: change.updated_by_device.clone(),
            };
            if existing.is_some() {
                crate::db::tasks::update_task_row(conn, &task).await?;
            } else {
                crate::db::tasks::insert_task_row(conn, &task).await?;
            }
        }
        EntityType::TaskSubtask => {
            let fields: SubtaskPayload = decode_payload(payload)?;
            let created_at = fields.created_at.unwrap_or(change.updated_at);
            sqlx::query(
                r#"
                INSERT INTO task_subtasks (
                    id, task_id, title, is_done, created_at, updated_at,
                    sync_version, updated_by_device
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(id) DO UPDATE SET
                    task_id = excluded.task_id,
                    title = excluded.title,
                    is_done = excluded.is_done,
                    updated_at = excluded.updated_at,
                    sync_version = excluded.sync_version,
                    updated_by_device = excluded.updated_by_device
                "#,
            )
            .bind(&change.entity_id)
            .bind(&fields.task_id)
            .bind(&fields.title)
            .bind(fields.is_done)
            .bind(created_at)
            .bind(change.updated_at)
            .bind(change.sync_version)
            .bind(&change.updated_by_device)
            .execute(conn)
            .await?;
        }
        EntityType::TaskTemplate => {
            let fields: TemplatePayload = decode_payload(payload)?;
            let created_at = fields.created_at.unwrap_or(change.updated_at);
            sqlx::query(
                r#"
                INSERT INTO task_templates (
                    id, name, title_template, description, priority, is_important,
                    created_at, updated_at, sync_version, updated_by_device
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(id) DO UPDATE SET
                    name = excluded.name,
                    title_template = excluded.title_template,
                    description = excluded.description,
                    priority = excluded.priority,
                    is_important = excluded.is_important,
                    updated_at = excluded.updated_at,
                    sync_version = excluded.sync_version,
                    updated_by_device = excluded.updated_by_device
                "#,
            )
            .bind(&change.entity_id)
            .bind(&fields.name)
            .bind(&fields.title_template)
            .bind(&fields.description)
            .bind(fields.priority)
            .bind(fields.is_important)
            .bind(created_at)
            .bind(change.updated_at)
            .bind(change.sync_version)
            .bind(&change.updated_by_device)
            .execute(conn)
            .await?;
        }
        EntityType::Setting => {
            // Sync-plane keys are never writable from the wire.
            if change
                .entity_id
                .starts_with(crate::db::settings_keys::INTERNAL_PREFIX)
            {
                tracing::warn!("Ignoring incoming write to reserved setting {}", change.entity_id);
                return Ok(());
            }

            let value = payload
                .get("value")
                .and_then(Value::as_str)
                .unwrap_or("")
                .to_string();
            sqlx::query(
                r#"
                INSERT INTO settings (key, value, updated_at, sync_version, updated_by_device)
                VALUES (?, ?, ?, ?, ?)
                ON CONFLICT(key) DO UPDATE SET
                    value = excluded.value,
                    updated_at = excluded.updated_at,
                    sync_version = excluded.sync_version,
                    updated_by_device = excluded.updated_by_device
                "#,
            )
            .bind(&change.entity_id)
            .bind(&value)
            .bind(change.updated_at)
            .bind(change.sync_version)
            .bind(&change.updated_by_device)
            .execute(conn)
            .await?;
        }
    }

    Ok(())
}

fn decode_payload<T: serde::de::DeserializeOwned>(payload: &Value) -> Result<T> {
    serde_json::from_value(payload.clone())
        .map_err(|e| Error::Validation(format!("INVALID_PAYLOAD: {}", e)))
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct ProjectPayload {
    name: String,
    description: Option<String>,
    color: Option<String>,
    status: ProjectStatus,
    created_at: Option<DateTime<Utc>>,
}

impl Default for ProjectPayload {
    fn default() -> Self {
        Self {
            name: String::new(),
            description: None,
            color: None,
            status: ProjectStatus::Active,
            created_at: None,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct TaskPayload {
    title: String,
    description: Option<String>,
    notes_markdown: Option<String>,
    project_id: Option<String>,
    status: TaskStatus,
    priority: TaskPriority,
    is_important: bool,
    due_at: Option<DateTime<Utc>>,
    remind_at: Option<DateTime<Utc>>,
    recurrence: Recurrence,
    created_at: Option<DateTime<Utc>>,
}

impl Default for TaskPayload {
    fn default() -> Self {
        Self {
            title: String::new(),
            description: None,
            notes_markdown: None,
            project_id: None,
            status: TaskStatus::Todo,
            priority: TaskPriority::Normal,
            is_important: false,
            due_at: None,
            remind_at: None,
            recurrence: Recurrence::None,
            created_at: None,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct SubtaskPayload {
    task_id: String,
    title: String,
    is_done: bool,
    created_at: Option<DateTime<Utc>>,
}

impl Default for SubtaskPayload {
    fn default() -> Self {
        Self {
            task_id: String::new(),
            title: String::new(),
            is_done: false,
            created_at: None,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct TemplatePayload {
    name: String,
    title_template: String,
    description: Option<String>,
    priority: TaskPriority,
    is_important: bool,
    created_at: Option<DateTime<Utc>>,
}

impl Default for TemplatePayload {
    fn default() -> Self {
        Self {
            name: String::new(),
            title_template: String::new(),
            description: None,
            priority: TaskPriority::Normal,
            is_important: false,
            created_at: None,
        }
    }
}

// ============================================================================
// Field comparison
// ============================================================================

/// Metadata keys excluded from field-level disagreement checks.
const METADATA_KEYS: [&str; 5] = [
    "id",
    "updated_at",
    "updated_by_device",
    "sync_version",
    "created_at",
];

fn fields_disagree(local_payload: &Value, incoming: &serde_json::Map<String, Value>) -> bool {
    incoming.iter().any(|(key, incoming_value)| {
        if METADATA_KEYS.contains(&key.as_str()) {
            return false;
        }
        let local_value = local_payload.get(key).cloned().unwrap_or(Value::Null);
        !values_equivalent(&local_value, incoming_value)
    })
}

/// Value equality that treats timestamps as instants, so formatting
/// differences between producers do not read as edits.
fn values_equivalent(a: &Value, b: &Value) -> bool {
    if a == b {
        return true;
    }
    if let (Value::String(a), Value::String(b)) = (a, b) {
        if let (Ok(a), Ok(b)) = (
            DateTime::parse_from_rfc3339(a),
            DateTime::parse_from_rfc3339(b),
        ) {
            return a == b;
        }
    }
    false
}
