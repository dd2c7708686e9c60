// db/tasks.rs - Task and subtask CRUD with sync invariant enforcement
//
// Every mutation here is atomic and performs, in one transaction: the entity
// write, the sync_version bump, the changelog rows, the tombstone bookkeeping,
// and the outbox enqueue.

use chrono::{DateTime, Duration, Utc};
use sqlx::{SqliteConnection, SqlitePool};
use uuid::Uuid;

use crate::db::models::{
    ChangelogAction, Recurrence, Task, TaskChangelog, TaskPriority, TaskStatus, TaskSubtask,
};
use crate::db::outbox;
use crate::protocol::{ChangeOperation, EntityType};
use crate::{Error, Result};

/// Input for creating a task.
#[derive(Debug, Clone, Default)]
pub struct TaskDraft {
    pub title: String,
    pub description: Option<String>,
    pub notes_markdown: Option<String>,
    pub project_id: Option<String>,
    pub priority: Option<TaskPriority>,
    pub is_important: bool,
    pub due_at: Option<DateTime<Utc>>,
    pub remind_at: Option<DateTime<Utc>>,
    pub recurrence: Option<Recurrence>,
}

/// Partial update for a task. `None` leaves a field unchanged; the nested
/// Option clears a nullable field.
#[derive(Debug, Clone, Default)]
pub struct TaskPatch {
    pub title: Option<String>,
    pub description: Option<Option<String>>,
    pub notes_markdown: Option<Option<String>>,
    pub project_id: Option<Option<String>>,
    pub status: Option<TaskStatus>,
    pub priority: Option<TaskPriority>,
    pub is_important: Option<bool>,
    pub due_at: Option<Option<DateTime<Utc>>>,
    pub remind_at: Option<Option<DateTime<Utc>>>,
    pub recurrence: Option<Recurrence>,
}

/// Create a task. Removes any stale tombstone for the id and enqueues an
/// UPSERT outbox row.
pub async fn create_task(pool: &SqlitePool, device_id: &str, draft: TaskDraft) -> Result<Task> {
    let title = draft.title.trim().to_string();
    if title.is_empty() {
        return Err(Error::Validation("Task title cannot be empty".to_string()));
    }

    let recurrence = draft.recurrence.unwrap_or(Recurrence::None);
    validate_schedule(draft.due_at, draft.remind_at, recurrence)?;

    let now = Utc::now();
    let task = Task {
        id: Uuid::new_v4().to_string(),
        title,
        description: draft.description,
        notes_markdown: draft.notes_markdown,
        project_id: draft.project_id,
        status: TaskStatus::Todo,
        priority: draft.priority.unwrap_or(TaskPriority::Normal),
        is_important: draft.is_important,
        due_at: draft.due_at,
        remind_at: draft.remind_at,
        recurrence,
        created_at: now,
        updated_at: now,
        sync_version: 1,
        updated_by_device: device_id.to_string(),
    };

    let mut tx = pool.begin().await?;
    crate::db::ensure_writes_allowed(&mut tx).await?;

    insert_task_row(&mut tx, &task).await?;
    remove_tombstone(&mut tx, EntityType::Task, &task.id).await?;
    record_changelog(&mut tx, &task.id, ChangelogAction::Created, None, None, None).await?;
    outbox::enqueue_change(
        &mut tx,
        device_id,
        EntityType::Task,
        &task.id,
        ChangeOperation::Upsert,
        Some(&serde_json::to_value(&task)?),
    )
    .await?;

    tx.commit().await?;

    tracing::debug!("Created task {}", task.id);

    Ok(task)
}

/// Get task by ID
pub async fn get_task(pool: &SqlitePool, id: &str) -> Result<Option<Task>> {
    let task = sqlx::query_as::<_, Task>("SELECT * FROM tasks WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?;

    Ok(task)
}

/// List tasks, most recently updated first.
pub async fn list_tasks(pool: &SqlitePool) -> Result<Vec<Task>> {
    let tasks = sqlx::query_as::<_, Task>("SELECT * FROM tasks ORDER BY updated_at DESC")
        .fetch_all(pool)
        .await?;

    Ok(tasks)
}

/// List tasks belonging to a project.
pub async fn list_tasks_for_project(pool: &SqlitePool, project_id: &str) -> Result<Vec<Task>> {
    let tasks = sqlx::query_as::<_, Task>(
        "SELECT * FROM tasks WHERE project_id = ? ORDER BY updated_at DESC",
    )
    .bind(project_id)
    .fetch_all(pool)
    .await?;

    Ok(tasks)
}

/// Apply a partial update to a task.
///
/// Writes one changelog row per changed field (STATUS_CHANGED for the status
/// field) and, when a recurring task transitions to DONE, spawns the next
/// occurrence as a fresh TODO task.
pub async fn update_task(
    pool: &SqlitePool,
    device_id: &str,
    id: &str,
    patch: TaskPatch,
) -> Result<Task> {
    let existing = get_task(pool, id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("Task {} not found", id)))?;

    let mut updated = existing.clone();

    if let Some(title) = patch.title {
        let title = title.trim().to_string();
        if title.is_empty() {
            return Err(Error::Validation("Task title cannot be empty".to_string()));
        }
        updated.title = title;
    }
    if let Some(description) = patch.description {
        updated.description = description;
    }
    if let Some(notes) = patch.notes_markdown {
        updated.notes_markdown = notes;
    }
    if let Some(project_id) = patch.project_id {
        updated.project_id = project_id;
    }
    if let Some(status) = patch.status {
        updated.status = status;
    }
    if let Some(priority) = patch.priority {
        updated.priority = priority;
    }
    if let Some(is_important) = patch.is_important {
        updated.is_important = is_important;
    }
    if let Some(due_at) = patch.due_at {
        updated.due_at = due_at;
    }
    if let Some(remind_at) = patch.remind_at {
        updated.remind_at = remind_at;
    }
    if let Some(recurrence) = patch.recurrence {
        updated.recurrence = recurrence;
    }

    validate_schedule(updated.due_at, updated.remind_at, updated.recurrence)?;

    updated.updated_at = monotonic_now(existing.updated_at);
    updated.sync_version = existing.sync_version + 1;
    updated.updated_by_device = device_id.to_string();

    let mut tx = pool.begin().await?;
    crate::db::ensure_writes_allowed(&mut tx).await?;

    update_task_row(&mut tx, &updated).await?;
    record_field_changes(&mut tx, &existing, &updated).await?;
    outbox::enqueue_change(
        &mut tx,
        device_id,
        EntityType::Task,
        &updated.id,
        ChangeOperation::Upsert,
        Some(&serde_json::to_value(&updated)?),
    )
    .await?;

    // A recurring task completing spawns its next occurrence.
    let spawned = if existing.status != TaskStatus::Done
        && updated.status == TaskStatus::Done
        && updated.recurrence != Recurrence::None
    {
        spawn_next_occurrence(&mut tx, device_id, &updated).await?
    } else {
        None
    };

    tx.commit().await?;

    if let Some(next) = &spawned {
        tracing::info!("Recurring task {} spawned next occurrence {}", id, next.id);
    }

    Ok(updated)
}

/// Delete a task: remove the row, write a tombstone, enqueue a DELETE.
pub async fn delete_task(pool: &SqlitePool, device_id: &str, id: &str) -> Result<()> {
    let existing = get_task(pool, id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("Task {} not found", id)))?;

    let mut tx = pool.begin().await?;
    crate::db::ensure_writes_allowed(&mut tx).await?;

    sqlx::query("DELETE FROM tasks WHERE id = ?")
        .bind(&existing.id)
        .execute(&mut *tx)
        .await?;
    write_tombstone(&mut tx, EntityType::Task, &existing.id, device_id, Utc::now()).await?;
    outbox::enqueue_change(
        &mut tx,
        device_id,
        EntityType::Task,
        &existing.id,
        ChangeOperation::Delete,
        None,
    )
    .await?;

    tx.commit().await?;

    tracing::debug!("Deleted task {}", id);

    Ok(())
}

/// List changelog entries for a task, newest first.
pub async fn list_task_changelog(pool: &SqlitePool, task_id: &str) -> Result<Vec<TaskChangelog>> {
    let entries = sqlx::query_as::<_, TaskChangelog>(
        r#"
        SELECT * FROM task_changelogs
        WHERE task_id = ?
        ORDER BY created_at DESC, id DESC
        "#,
    )
    .bind(task_id)
    .fetch_all(pool)
    .await?;

    Ok(entries)
}

// ============================================================================
// Subtasks
// ============================================================================

/// Create a subtask under an existing task.
pub async fn create_subtask(
    pool: &SqlitePool,
    device_id: &str,
    task_id: &str,
    title: &str,
) -> Result<TaskSubtask> {
    let title = title.trim().to_string();
    if title.is_empty() {
        return Err(Error::Validation("Subtask title cannot be empty".to_string()));
    }

    get_task(pool, task_id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("Task {} not found", task_id)))?;

    let now = Utc::now();
    let subtask = TaskSubtask {
        id: Uuid::new_v4().to_string(),
        task_id: task_id.to_string(),
        title,
        is_done: false,
        created_at: now,
        updated_at: now,
        sync_version: 1,
        updated_by_device: device_id.to_string(),
    };

    let mut tx = pool.begin().await?;
    crate::db::ensure_writes_allowed(&mut tx).await?;

    sqlx::query(
        r#"
        INSERT INTO task_subtasks (
            id, task_id, title, is_done, created_at, updated_at,
            sync_version, updated_by_device
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&subtask.id)
    .bind(&subtask.task_id)
    .bind(&subtask.title)
    .bind(subtask.is_done)
    .bind(subtask.created_at)
    .bind(subtask.updated_at)
    .bind(subtask.sync_version)
    .bind(&subtask.updated_by_device)
    .execute(&mut *tx)
    .await?;

    remove_tombstone(&mut tx, EntityType::TaskSubtask, &subtask.id).await?;
    outbox::enqueue_change(
        &mut tx,
        device_id,
        EntityType::TaskSubtask,
        &subtask.id,
        ChangeOperation::Upsert,
        Some(&serde_json::to_value(&subtask)?),
    )
    .await?;

    tx.commit().await?;

    Ok(subtask)
}

/// Rename a subtask or toggle completion.
pub async fn update_subtask(
    pool: &SqlitePool,
    device_id: &str,
    id: &str,
    title: Option<&str>,
    is_done: Option<bool>,
) -> Result<TaskSubtask> {
    let mut subtask = sqlx::query_as::<_, TaskSubtask>("SELECT * FROM task_subtasks WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| Error::NotFound(format!("Subtask {} not found", id)))?;

    if let Some(title) = title {
        let title = title.trim();
        if title.is_empty() {
            return Err(Error::Validation("Subtask title cannot be empty".to_string()));
        }
        subtask.title = title.to_string();
    }
    if let Some(is_done) = is_done {
        subtask.is_done = is_done;
    }

    subtask.updated_at = monotonic_now(subtask.updated_at);
    subtask.sync_version += 1;
    subtask.updated_by_device = device_id.to_string();

    let mut tx = pool.begin().await?;
    crate::db::ensure_writes_allowed(&mut tx).await?;

    sqlx::query(
        r#"
        UPDATE task_subtasks
        SET title = ?, is_done = ?, updated_at = ?, sync_version = ?, updated_by_device = ?
        WHERE id = ?
        "#,
    )
    .bind(&subtask.title)
    .bind(subtask.is_done)
    .bind(subtask.updated_at)
    .bind(subtask.sync_version)
    .bind(&subtask.updated_by_device)
    .bind(&subtask.id)
    .execute(&mut *tx)
    .await?;

    outbox::enqueue_change(
        &mut tx,
        device_id,
        EntityType::TaskSubtask,
        &subtask.id,
        ChangeOperation::Upsert,
        Some(&serde_json::to_value(&subtask)?),
    )
    .await?;

    tx.commit().await?;

    Ok(subtask)
}

/// Delete a subtask (tombstone + DELETE outbox row).
pub async fn delete_subtask(pool: &SqlitePool, device_id: &str, id: &str) -> Result<()> {
    let existing = sqlx::query_as::<_, TaskSubtask>("SELECT * FROM task_subtasks WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| Error::NotFound(format!("Subtask {} not found", id)))?;

    let mut tx = pool.begin().await?;
    crate::db::ensure_writes_allowed(&mut tx).await?;

    sqlx::query("DELETE FROM task_subtasks WHERE id = ?")
        .bind(&existing.id)
        .execute(&mut *tx)
        .await?;
    write_tombstone(&mut tx, EntityType::TaskSubtask, &existing.id, device_id, Utc::now()).await?;
    outbox::enqueue_change(
        &mut tx,
        device_id,
        EntityType::TaskSubtask,
        &existing.id,
        ChangeOperation::Delete,
        None,
    )
    .await?;

    tx.commit().await?;

    Ok(())
}

/// List subtasks for a task in creation order.
pub async fn list_subtasks(pool: &SqlitePool, task_id: &str) -> Result<Vec<TaskSubtask>> {
    let subtasks = sqlx::query_as::<_, TaskSubtask>(
        "SELECT * FROM task_subtasks WHERE task_id = ? ORDER BY created_at ASC",
    )
    .bind(task_id)
    .fetch_all(pool)
    .await?;

    Ok(subtasks)
}

// ============================================================================
// Shared helpers (also used by the incoming-apply pipeline)
// ============================================================================

/// Next updated_at for a mutation: wall clock, but never behind the previous
/// value (a skewed clock must not reorder the entity's own history).
pub(crate) fn monotonic_now(previous: DateTime<Utc>) -> DateTime<Utc> {
    let now = Utc::now();
    if now > previous {
        now
    } else {
        previous + Duration::milliseconds(1)
    }
}

fn validate_schedule(
    due_at: Option<DateTime<Utc>>,
    remind_at: Option<DateTime<Utc>>,
    recurrence: Recurrence,
) -> Result<()> {
    if let (Some(due), Some(remind)) = (due_at, remind_at) {
        if remind > due {
            return Err(Error::Validation(
                "Reminder must not be after the due time".to_string(),
            ));
        }
    }
    if recurrence != Recurrence::None && due_at.is_none() {
        return Err(Error::Validation(
            "Recurring tasks need a due time".to_string(),
        ));
    }
    Ok(())
}

pub(crate) async fn insert_task_row(conn: &mut SqliteConnection, task: &Task) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO tasks (
            id, title, description, notes_markdown, project_id, status, priority,
            is_important, due_at, remind_at, recurrence, created_at, updated_at,
            sync_version, updated_by_device
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&task.id)
    .bind(&task.title)
    .bind(&task.description)
    .bind(&task.notes_markdown)
    .bind(&task.project_id)
    .bind(task.status)
    .bind(task.priority)
    .bind(task.is_important)
    .bind(task.due_at)
    .bind(task.remind_at)
    .bind(task.recurrence)
    .bind(task.created_at)
    .bind(task.updated_at)
    .bind(task.sync_version)
    .bind(&task.updated_by_device)
    .execute(conn)
    .await?;

    Ok(())
}

pub(crate) async fn update_task_row(conn: &mut SqliteConnection, task: &Task) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE tasks SET
            title = ?, description = ?, notes_markdown = ?, project_id = ?,
            status = ?, priority = ?, is_important = ?, due_at = ?, remind_at = ?,
            recurrence = ?, updated_at = ?, sync_version = ?, updated_by_device = ?
        WHERE id = ?
        "#,
    )
    .bind(&task.title)
    .bind(&task.description)
    .bind(&task.notes_markdown)
    .bind(&task.project_id)
    .bind(task.status)
    .bind(task.priority)
    .bind(task.is_important)
    .bind(task.due_at)
    .bind(task.remind_at)
    .bind(task.recurrence)
    .bind(task.updated_at)
    .bind(task.sync_version)
    .bind(&task.updated_by_device)
    .bind(&task.id)
    .execute(conn)
    .await?;

    Ok(())
}

pub(crate) async fn record_changelog(
    conn: &mut SqliteConnection,
    task_id: &str,
    action: ChangelogAction,
    field_name: Option<&str>,
    old_value: Option<String>,
    new_value: Option<String>,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO task_changelogs (task_id, action, field_name, old_value, new_value, created_at)
        VALUES (?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(task_id)
    .bind(action)
    .bind(field_name)
    .bind(old_value)
    .bind(new_value)
    .bind(Utc::now())
    .execute(conn)
    .await?;

    Ok(())
}

/// One changelog row per changed field; the status field gets STATUS_CHANGED.
pub(crate) async fn record_field_changes(
    conn: &mut SqliteConnection,
    old: &Task,
    new: &Task,
) -> Result<()> {
    let mut changes: Vec<(&str, Option<String>, Option<String>)> = Vec::new();

    if old.title != new.title {
        changes.push(("title", Some(old.title.clone()), Some(new.title.clone())));
    }
    if old.description != new.description {
        changes.push(("description", old.description.clone(), new.description.clone()));
    }
    if old.notes_markdown != new.notes_markdown {
        changes.push(("notes_markdown", old.notes_markdown.clone(), new.notes_markdown.clone()));
    }
    if old.project_id != new.project_id {
        changes.push(("project_id", old.project_id.clone(), new.project_id.clone()));
    }
    if old.priority != new.priority {
        changes.push((
            "priority",
            Some(format!("{:?}", old.priority).to_uppercase()),
            Some(format!("{:?}", new.priority).to_uppercase()),
        ));
    }
    if old.is_important != new.is_important {
        changes.push((
            "is_important",
            Some(old.is_important.to_string()),
            Some(new.is_important.to_string()),
        ));
    }
    if old.due_at != new.due_at {
        changes.push((
            "due_at",
            old.due_at.map(|d| d.to_rfc3339()),
            new.due_at.map(|d| d.to_rfc3339()),
        ));
    }
    if old.remind_at != new.remind_at {
        changes.push((
            "remind_at",
            old.remind_at.map(|d| d.to_rfc3339()),
            new.remind_at.map(|d| d.to_rfc3339()),
        ));
    }
    if old.recurrence != new.recurrence {
        changes.push((
            "recurrence",
            Some(format!("{:?}", old.recurrence).to_uppercase()),
            Some(format!("{:?}", new.recurrence).to_uppercase()),
        ));
    }

    for (field, old_value, new_value) in changes {
        record_changelog(conn, &new.id, ChangelogAction::Updated, Some(field), old_value, new_value)
            .await?;
    }

    if old.status != new.status {
        record_changelog(
            conn,
            &new.id,
            ChangelogAction::StatusChanged,
            Some("status"),
            Some(format!("{:?}", old.status).to_uppercase()),
            Some(format!("{:?}", new.status).to_uppercase()),
        )
        .await?;
    }

    Ok(())
}

pub(crate) async fn write_tombstone(
    conn: &mut SqliteConnection,
    entity_type: EntityType,
    entity_id: &str,
    device_id: &str,
    deleted_at: DateTime<Utc>,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO deleted_records (entity_type, entity_id, deleted_at, deleted_by_device)
        VALUES (?, ?, ?, ?)
        ON CONFLICT(entity_type, entity_id) DO UPDATE SET
            deleted_at = excluded.deleted_at,
            deleted_by_device = excluded.deleted_by_device
        "#,
    )
    .bind(entity_type.as_str())
    .bind(entity_id)
    .bind(deleted_at)
    .bind(device_id)
    .execute(conn)
    .await?;

    Ok(())
}

pub(crate) async fn remove_tombstone(
    conn: &mut SqliteConnection,
    entity_type: EntityType,
    entity_id: &str,
) -> Result<()> {
    sqlx::query("DELETE FROM deleted_records WHERE entity_type = ? AND entity_id = ?")
        .bind(entity_type.as_str())
        .bind(entity_id)
        .execute(conn)
        .await?;

    Ok(())
}

/// Spawn the next occurrence of a recurring task that just completed.
async fn spawn_next_occurrence(
    conn: &mut SqliteConnection,
    device_id: &str,
    done: &Task,
) -> Result<Option<Task>> {
    let due_at = match done.due_at {
        Some(due) => due,
        // Recurrence without a due date has nothing to shift.
        None => return Ok(None),
    };

    let next_due = done.recurrence.shift(due_at);
    let next_remind = done.remind_at.map(|remind| next_due - (due_at - remind));

    let now = Utc::now();
    let next = Task {
        id: Uuid::new_v4().to_string(),
        title: done.title.clone(),
        description: done.description.clone(),
        notes_markdown: None,
        project_id: done.project_id.clone(),
        status: TaskStatus::Todo,
        priority: done.priority,
        is_important: done.is_important,
        due_at: Some(next_due),
        remind_at: next_remind,
        recurrence: done.recurrence,
        created_at: now,
        updated_at: now,
        sync_version: 1,
        updated_by_device: device_id.to_string(),
    };

    insert_task_row(conn, &next).await?;
    record_changelog(conn, &next.id, ChangelogAction::Created, None, None, None).await?;
    outbox::enqueue_change(
        conn,
        device_id,
        EntityType::Task,
        &next.id,
        ChangeOperation::Upsert,
        Some(&serde_json::to_value(&next)?),
    )
    .await?;

    Ok(Some(next))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::outbox::list_pending;
    use chrono::TimeZone;

    fn draft(title: &str) -> TaskDraft {
        TaskDraft {
            title: title.to_string(),
            ..TaskDraft::default()
        }
    }

    #[tokio::test]
    async fn test_create_task_enqueues_outbox_and_changelog() {
        let pool = crate::db::test_pool().await;

        let task = create_task(&pool, "dev-a", draft("Write report")).await.unwrap();
        assert_eq!(task.sync_version, 1);
        assert_eq!(task.updated_by_device, "dev-a");

        let pending = list_pending(&pool, 10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].entity_type, "TASK");
        assert_eq!(pending[0].operation, "UPSERT");
        assert!(pending[0].idempotency_key.starts_with("dev-a:"));

        let log = list_task_changelog(&pool, &task.id).await.unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].action, ChangelogAction::Created);
    }

    #[tokio::test]
    async fn test_create_task_rejects_blank_title() {
        let pool = crate::db::test_pool().await;
        let err = create_task(&pool, "dev-a", draft("   ")).await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[tokio::test]
    async fn test_update_task_bumps_version_and_logs_fields() {
        let pool = crate::db::test_pool().await;
        let task = create_task(&pool, "dev-a", draft("Initial")).await.unwrap();

        let updated = update_task(
            &pool,
            "dev-b",
            &task.id,
            TaskPatch {
                title: Some("Renamed".to_string()),
                status: Some(TaskStatus::Doing),
                ..TaskPatch::default()
            },
        )
        .await
        .unwrap();

        assert_eq!(updated.sync_version, 2);
        assert_eq!(updated.updated_by_device, "dev-b");
        assert!(updated.updated_at >= task.updated_at);

        let log = list_task_changelog(&pool, &task.id).await.unwrap();
        let actions: Vec<ChangelogAction> = log.iter().map(|e| e.action).collect();
        assert!(actions.contains(&ChangelogAction::Updated));
        assert!(actions.contains(&ChangelogAction::StatusChanged));

        // Coalesced: one pending outbox row with the latest payload
        let pending = list_pending(&pool, 10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert!(pending[0].payload_json.as_ref().unwrap().contains("Renamed"));
    }

    #[tokio::test]
    async fn test_delete_task_writes_tombstone_and_delete_row() {
        let pool = crate::db::test_pool().await;
        let task = create_task(&pool, "dev-a", draft("Doomed")).await.unwrap();

        delete_task(&pool, "dev-a", &task.id).await.unwrap();

        assert!(get_task(&pool, &task.id).await.unwrap().is_none());

        let tombstones: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM deleted_records WHERE entity_type = 'TASK' AND entity_id = ?",
        )
        .bind(&task.id)
        .fetch_one(&pool)
        .await
        .unwrap();
        assert_eq!(tombstones, 1);

        let pending = list_pending(&pool, 10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].operation, "DELETE");
        assert_eq!(pending[0].payload_json, None);
    }

    #[tokio::test]
    async fn test_recurrence_spawns_next_occurrence() {
        let pool = crate::db::test_pool().await;

        let due = Utc.with_ymd_and_hms(2026, 2, 20, 9, 0, 0).unwrap();
        let remind = Utc.with_ymd_and_hms(2026, 2, 19, 9, 0, 0).unwrap();
        let task = create_task(
            &pool,
            "dev-a",
            TaskDraft {
                title: "Weekly review".to_string(),
                priority: Some(TaskPriority::Urgent),
                due_at: Some(due),
                remind_at: Some(remind),
                recurrence: Some(Recurrence::Weekly),
                ..TaskDraft::default()
            },
        )
        .await
        .unwrap();

        update_task(
            &pool,
            "dev-a",
            &task.id,
            TaskPatch {
                status: Some(TaskStatus::Done),
                ..TaskPatch::default()
            },
        )
        .await
        .unwrap();

        let tasks = list_tasks(&pool).await.unwrap();
        assert_eq!(tasks.len(), 2);

        let next = tasks.iter().find(|t| t.id != task.id).unwrap();
        assert_eq!(next.status, TaskStatus::Todo);
        assert_eq!(next.title, "Weekly review");
        assert_eq!(next.priority, TaskPriority::Urgent);
        assert_eq!(
            next.due_at.unwrap(),
            Utc.with_ymd_and_hms(2026, 2, 27, 9, 0, 0).unwrap()
        );
        assert_eq!(
            next.remind_at.unwrap(),
            Utc.with_ymd_and_hms(2026, 2, 26, 9, 0, 0).unwrap()
        );

        // Completing again must not spawn another
        update_task(
            &pool,
            "dev-a",
            &task.id,
            TaskPatch {
                status: Some(TaskStatus::Done),
                ..TaskPatch::default()
            },
        )
        .await
        .unwrap();
        assert_eq!(list_tasks(&pool).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_reminder_after_due_rejected() {
        let pool = crate::db::test_pool().await;
        let due = Utc.with_ymd_and_hms(2026, 2, 20, 9, 0, 0).unwrap();

        let err = create_task(
            &pool,
            "dev-a",
            TaskDraft {
                title: "Bad schedule".to_string(),
                due_at: Some(due),
                remind_at: Some(due + Duration::hours(1)),
                ..TaskDraft::default()
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));

        let err = create_task(
            &pool,
            "dev-a",
            TaskDraft {
                title: "Recurring without due".to_string(),
                recurrence: Some(Recurrence::Daily),
                ..TaskDraft::default()
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[tokio::test]
    async fn test_subtask_lifecycle() {
        let pool = crate::db::test_pool().await;
        let task = create_task(&pool, "dev-a", draft("Parent")).await.unwrap();

        let subtask = create_subtask(&pool, "dev-a", &task.id, "Step one").await.unwrap();
        let updated = update_subtask(&pool, "dev-a", &subtask.id, None, Some(true))
            .await
            .unwrap();
        assert!(updated.is_done);
        assert_eq!(updated.sync_version, 2);

        delete_subtask(&pool, "dev-a", &subtask.id).await.unwrap();
        assert!(list_subtasks(&pool, &task.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_guardrail_blocks_mutations() {
        let pool = crate::db::test_pool().await;
        crate::db::diagnostics::set_sync_write_blocked(&pool, "verification failed")
            .await
            .unwrap();

        let err = create_task(&pool, "dev-a", draft("Blocked")).await.unwrap_err();
        assert!(matches!(err, Error::WriteBlocked(_)));

        crate::db::diagnostics::clear_sync_write_blocked(&pool)
            .await
            .unwrap();
        create_task(&pool, "dev-a", draft("Allowed")).await.unwrap();
    }
}
