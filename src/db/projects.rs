// db/projects.rs - Projects, task templates, session records, app settings

use chrono::{DateTime, Utc};
use sqlx::{SqliteConnection, SqlitePool};
use uuid::Uuid;

use crate::db::models::{Project, ProjectStatus, SessionRecord, TaskPriority, TaskTemplate};
use crate::db::outbox;
use crate::db::settings_keys;
use crate::db::tasks::{monotonic_now, remove_tombstone, write_tombstone};
use crate::protocol::{ChangeOperation, EntityType};
use crate::{Error, Result};

/// Input for creating a project.
#[derive(Debug, Clone, Default)]
pub struct ProjectDraft {
    pub name: String,
    pub description: Option<String>,
    pub color: Option<String>,
}

/// Partial update for a project.
#[derive(Debug, Clone, Default)]
pub struct ProjectPatch {
    pub name: Option<String>,
    pub description: Option<Option<String>>,
    pub color: Option<Option<String>>,
    pub status: Option<ProjectStatus>,
}

/// Create a project. Names are unique case-insensitively.
pub async fn create_project(
    pool: &SqlitePool,
    device_id: &str,
    draft: ProjectDraft,
) -> Result<Project> {
    let name = draft.name.trim().to_string();
    if name.is_empty() {
        return Err(Error::Validation("Project name cannot be empty".to_string()));
    }
    if let Some(color) = &draft.color {
        validate_color(color)?;
    }
    if find_project_by_name(pool, &name).await?.is_some() {
        return Err(Error::Validation(format!(
            "Project name '{}' is already taken",
            name
        )));
    }

    let now = Utc::now();
    let project = Project {
        id: Uuid::new_v4().to_string(),
        name,
        description: draft.description,
        color: draft.color,
        status: ProjectStatus::Active,
        created_at: now,
        updated_at: now,
        sync_version: 1,
        updated_by_device: device_id.to_string(),
    };

    let mut tx = pool.begin().await?;
    crate::db::ensure_writes_allowed(&mut tx).await?;

    insert_project_row(&mut tx, &project).await?;
    remove_tombstone(&mut tx, EntityType::Project, &project.id).await?;
    outbox::enqueue_change(
        &mut tx,
        device_id,
        EntityType::Project,
        &project.id,
        ChangeOperation::Upsert,
        Some(&serde_json::to_value(&project)?),
    )
    .await?;

    tx.commit().await?;

    tracing::debug!("Created project {}", project.id);

    Ok(project)
}

/// Get project by ID
pub async fn get_project(pool: &SqlitePool, id: &str) -> Result<Option<Project>> {
    let project = sqlx::query_as::<_, Project>("SELECT * FROM projects WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?;

    Ok(project)
}

/// Case-insensitive lookup by name.
pub async fn find_project_by_name(pool: &SqlitePool, name: &str) -> Result<Option<Project>> {
    let project = sqlx::query_as::<_, Project>("SELECT * FROM projects WHERE name = ? COLLATE NOCASE")
        .bind(name)
        .fetch_optional(pool)
        .await?;

    Ok(project)
}

/// List projects, active first, then by name.
pub async fn list_projects(pool: &SqlitePool) -> Result<Vec<Project>> {
    let projects = sqlx::query_as::<_, Project>(
        r#"
        SELECT * FROM projects
        ORDER BY CASE status WHEN 'ACTIVE' THEN 0 WHEN 'COMPLETED' THEN 1 ELSE 2 END, name
        "#,
    )
    .fetch_all(pool)
    .await?;

    Ok(projects)
}

/// Apply a partial update to a project.
pub async fn update_project(
    pool: &SqlitePool,
    device_id: &str,
    id: &str,
    patch: ProjectPatch,
) -> Result<Project> {
    let existing = get_project(pool, id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("Project {} not found", id)))?;

    let mut updated = existing.clone();

    if let Some(name) = patch.name {
        let name = name.trim().to_string();
        if name.is_empty() {
            return Err(Error::Validation("Project name cannot be empty".to_string()));
        }
        if let Some(other) = find_project_by_name(pool, &name).await? {
            if other.id != existing.id {
                return Err(Error::Validation(format!(
                    "Project name '{}' is already taken",
                    name
                )));
            }
        }
        updated.name = name;
    }
    if let Some(description) = patch.description {
        updated.description = description;
    }
    if let Some(color) = patch.color {
        if let Some(value) = &color {
            validate_color(value)?;
        }
        updated.color = color;
    }
    if let Some(status) = patch.status {
        updated.status = status;
    }

    updated.updated_at = monotonic_now(existing.updated_at);
    updated.sync_version = existing.sync_version + 1;
    updated.updated_by_device = device_id.to_string();

    let mut tx = pool.begin().await?;
    crate::db::ensure_writes_allowed(&mut tx).await?;

    update_project_row(&mut tx, &updated).await?;
    outbox::enqueue_change(
        &mut tx,
        device_id,
        EntityType::Project,
        &updated.id,
        ChangeOperation::Upsert,
        Some(&serde_json::to_value(&updated)?),
    )
    .await?;

    tx.commit().await?;

    Ok(updated)
}

/// Delete a project. Tasks referencing it keep existing with project_id NULL
/// (enforced by the foreign key).
pub async fn delete_project(pool: &SqlitePool, device_id: &str, id: &str) -> Result<()> {
    let existing = get_project(pool, id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("Project {} not found", id)))?;

    let mut tx = pool.begin().await?;
    crate::db::ensure_writes_allowed(&mut tx).await?;

    sqlx::query("DELETE FROM projects WHERE id = ?")
        .bind(&existing.id)
        .execute(&mut *tx)
        .await?;
    write_tombstone(&mut tx, EntityType::Project, &existing.id, device_id, Utc::now()).await?;
    outbox::enqueue_change(
        &mut tx,
        device_id,
        EntityType::Project,
        &existing.id,
        ChangeOperation::Delete,
        None,
    )
    .await?;

    tx.commit().await?;

    tracing::debug!("Deleted project {}", id);

    Ok(())
}

// ============================================================================
// Task templates
// ============================================================================

/// Input for creating a task template.
#[derive(Debug, Clone, Default)]
pub struct TemplateDraft {
    pub name: String,
    pub title_template: String,
    pub description: Option<String>,
    pub priority: Option<TaskPriority>,
    pub is_important: bool,
}

pub async fn create_template(
    pool: &SqlitePool,
    device_id: &str,
    draft: TemplateDraft,
) -> Result<TaskTemplate> {
    let name = draft.name.trim().to_string();
    let title_template = draft.title_template.trim().to_string();
    if name.is_empty() || title_template.is_empty() {
        return Err(Error::Validation(
            "Template name and title cannot be empty".to_string(),
        ));
    }

    let now = Utc::now();
    let template = TaskTemplate {
        id: Uuid::new_v4().to_string(),
        name,
        title_template,
        description: draft.description,
        priority: draft.priority.unwrap_or(TaskPriority::Normal),
        is_important: draft.is_important,
        created_at: now,
        updated_at: now,
        sync_version: 1,
        updated_by_device: device_id.to_string(),
    };

    let mut tx = pool.begin().await?;
    crate::db::ensure_writes_allowed(&mut tx).await?;

    sqlx::query(
        r#"
        INSERT INTO task_templates (
            id, name, title_template, description, priority, is_important,
            created_at, updated_at, sync_version, updated_by_device
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&template.id)
    .bind(&template.name)
    .bind(&template.title_template)
    .bind(&template.description)
    .bind(template.priority)
    .bind(template.is_important)
    .bind(template.created_at)
    .bind(template.updated_at)
    .bind(template.sync_version)
    .bind(&template.updated_by_device)
    .execute(&mut *tx)
    .await?;

    remove_tombstone(&mut tx, EntityType::TaskTemplate, &template.id).await?;
    outbox::enqueue_change(
        &mut tx,
        device_id,
        EntityType::TaskTemplate,
        &template.id,
        ChangeOperation::Upsert,
        Some(&serde_json::to_value(&template)?),
    )
    .await?;

    tx.commit().await?;

    Ok(template)
}

/// Partial update for a task template.
#[derive(Debug, Clone, Default)]
pub struct TemplatePatch {
    pub name: Option<String>,
    pub title_template: Option<String>,
    pub description: Option<Option<String>>,
    pub priority: Option<TaskPriority>,
    pub is_important: Option<bool>,
}

pub async fn update_template(
    pool: &SqlitePool,
    device_id: &str,
    id: &str,
    patch: TemplatePatch,
) -> Result<TaskTemplate> {
    let mut template = sqlx::query_as::<_, TaskTemplate>("SELECT * FROM task_templates WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| Error::NotFound(format!("Template {} not found", id)))?;

    if let Some(name) = patch.name {
        let name = name.trim().to_string();
        if name.is_empty() {
            return Err(Error::Validation("Template name cannot be empty".to_string()));
        }
        template.name = name;
    }
    if let Some(title_template) = patch.title_template {
        let title_template = title_template.trim().to_string();
        if title_template.is_empty() {
            return Err(Error::Validation("Template title cannot be empty".to_string()));
        }
        template.title_template = title_template;
    }
    if let Some(description) = patch.description {
        template.description = description;
    }
    if let Some(priority) = patch.priority {
        template.priority = priority;
    }
    if let Some(is_important) = patch.is_important {
        template.is_important = is_important;
    }

    template.updated_at = monotonic_now(template.updated_at);
    template.sync_version += 1;
    template.updated_by_device = device_id.to_string();

    let mut tx = pool.begin().await?;
    crate::db::ensure_writes_allowed(&mut tx).await?;

    sqlx::query(
        r#"
        UPDATE task_templates SET
            name = ?, title_template = ?, description = ?, priority = ?, is_important = ?,
            updated_at = ?, sync_version = ?, updated_by_device = ?
        WHERE id = ?
        "#,
    )
    .bind(&template.name)
    .bind(&template.title_template)
    .bind(&template.description)
    .bind(template.priority)
    .bind(template.is_important)
    .bind(template.updated_at)
    .bind(template.sync_version)
    .bind(&template.updated_by_device)
    .bind(&template.id)
    .execute(&mut *tx)
    .await?;

    outbox::enqueue_change(
        &mut tx,
        device_id,
        EntityType::TaskTemplate,
        &template.id,
        ChangeOperation::Upsert,
        Some(&serde_json::to_value(&template)?),
    )
    .await?;

    tx.commit().await?;

    Ok(template)
}

pub async fn list_templates(pool: &SqlitePool) -> Result<Vec<TaskTemplate>> {
    let templates =
        sqlx::query_as::<_, TaskTemplate>("SELECT * FROM task_templates ORDER BY name")
            .fetch_all(pool)
            .await?;

    Ok(templates)
}

pub async fn delete_template(pool: &SqlitePool, device_id: &str, id: &str) -> Result<()> {
    let existing = sqlx::query_as::<_, TaskTemplate>("SELECT * FROM task_templates WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| Error::NotFound(format!("Template {} not found", id)))?;

    let mut tx = pool.begin().await?;
    crate::db::ensure_writes_allowed(&mut tx).await?;

    sqlx::query("DELETE FROM task_templates WHERE id = ?")
        .bind(&existing.id)
        .execute(&mut *tx)
        .await?;
    write_tombstone(&mut tx, EntityType::TaskTemplate, &existing.id, device_id, Utc::now())
        .await?;
    outbox::enqueue_change(
        &mut tx,
        device_id,
        EntityType::TaskTemplate,
        &existing.id,
        ChangeOperation::Delete,
        None,
    )
    .await?;

    tx.commit().await?;

    Ok(())
}

// ============================================================================
// Session records (local-only: sessions do not travel over sync)
// ============================================================================

/// Start a work session, optionally attached to a task.
pub async fn start_session(
    pool: &SqlitePool,
    device_id: &str,
    task_id: Option<&str>,
) -> Result<SessionRecord> {
    let now = Utc::now();
    let session = SessionRecord {
        id: Uuid::new_v4().to_string(),
        task_id: task_id.map(|t| t.to_string()),
        started_at: now,
        ended_at: None,
        notes: None,
        created_at: now,
        updated_at: now,
        sync_version: 1,
        updated_by_device: device_id.to_string(),
    };

    sqlx::query(
        r#"
        INSERT INTO session_records (
            id, task_id, started_at, ended_at, notes, created_at, updated_at,
            sync_version, updated_by_device
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&session.id)
    .bind(&session.task_id)
    .bind(session.started_at)
    .bind(session.ended_at)
    .bind(&session.notes)
    .bind(session.created_at)
    .bind(session.updated_at)
    .bind(session.sync_version)
    .bind(&session.updated_by_device)
    .execute(pool)
    .await?;

    Ok(session)
}

/// Close a session and attach optional notes.
pub async fn end_session(
    pool: &SqlitePool,
    device_id: &str,
    id: &str,
    notes: Option<&str>,
) -> Result<SessionRecord> {
    let mut session = sqlx::query_as::<_, SessionRecord>("SELECT * FROM session_records WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| Error::NotFound(format!("Session {} not found", id)))?;

    session.ended_at = Some(Utc::now());
    session.notes = notes.map(|n| n.to_string());
    session.updated_at = monotonic_now(session.updated_at);
    session.sync_version += 1;
    session.updated_by_device = device_id.to_string();

    sqlx::query(
        r#"
        UPDATE session_records
        SET ended_at = ?, notes = ?, updated_at = ?, sync_version = ?, updated_by_device = ?
        WHERE id = ?
        "#,
    )
    .bind(session.ended_at)
    .bind(&session.notes)
    .bind(session.updated_at)
    .bind(session.sync_version)
    .bind(&session.updated_by_device)
    .bind(&session.id)
    .execute(pool)
    .await?;

    Ok(session)
}

/// Sessions within a date range, newest first.
pub async fn list_sessions_in_range(
    pool: &SqlitePool,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Result<Vec<SessionRecord>> {
    let sessions = sqlx::query_as::<_, SessionRecord>(
        r#"
        SELECT * FROM session_records
        WHERE started_at >= ? AND started_at <= ?
        ORDER BY started_at DESC
        "#,
    )
    .bind(start)
    .bind(end)
    .fetch_all(pool)
    .await?;

    Ok(sessions)
}

// ============================================================================
// App settings (user-facing key/value rows, synced as SETTING entities)
// ============================================================================

/// Write a user-facing setting and enqueue it for sync.
///
/// Keys under the reserved `sync.` prefix belong to the sync plane and are
/// rejected here.
pub async fn set_app_setting(
    pool: &SqlitePool,
    device_id: &str,
    key: &str,
    value: &str,
) -> Result<()> {
    let key = key.trim();
    if key.is_empty() {
        return Err(Error::Validation("Setting key cannot be empty".to_string()));
    }
    if key.starts_with(settings_keys::INTERNAL_PREFIX) {
        return Err(Error::Validation(format!(
            "Setting key '{}' is reserved",
            key
        )));
    }

    let existing_version: Option<i64> =
        sqlx::query_scalar("SELECT sync_version FROM settings WHERE key = ?")
            .bind(key)
            .fetch_optional(pool)
            .await?;
    let sync_version = existing_version.unwrap_or(0) + 1;
    let now = Utc::now();

    let mut tx = pool.begin().await?;
    crate::db::ensure_writes_allowed(&mut tx).await?;

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
    .bind(key)
    .bind(value)
    .bind(now)
    .bind(sync_version)
    .bind(device_id)
    .execute(&mut *tx)
    .await?;

    remove_tombstone(&mut tx, EntityType::Setting, key).await?;

    let payload = serde_json::json!({
        "key": key,
        "value": value,
        "updated_at": now,
        "updated_by_device": device_id,
        "sync_version": sync_version,
    });
    outbox::enqueue_change(
        &mut tx,
        device_id,
        EntityType::Setting,
        key,
        ChangeOperation::Upsert,
        Some(&payload),
    )
    .await?;

    tx.commit().await?;

    Ok(())
}

/// Remove a user-facing setting (tombstone + DELETE outbox row).
pub async fn delete_app_setting(pool: &SqlitePool, device_id: &str, key: &str) -> Result<()> {
    if key.starts_with(settings_keys::INTERNAL_PREFIX) {
        return Err(Error::Validation(format!(
            "Setting key '{}' is reserved",
            key
        )));
    }

    let mut tx = pool.begin().await?;
    crate::db::ensure_writes_allowed(&mut tx).await?;

    let result = sqlx::query("DELETE FROM settings WHERE key = ?")
        .bind(key)
        .execute(&mut *tx)
        .await?;
    if result.rows_affected() == 0 {
        return Err(Error::NotFound(format!("Setting {} not found", key)));
    }

    write_tombstone(&mut tx, EntityType::Setting, key, device_id, Utc::now()).await?;
    outbox::enqueue_change(
        &mut tx,
        device_id,
        EntityType::Setting,
        key,
        ChangeOperation::Delete,
        None,
    )
    .await?;

    tx.commit().await?;

    Ok(())
}

// ============================================================================
// Internal row helpers (shared with the incoming-apply pipeline)
// ============================================================================

fn validate_color(color: &str) -> Result<()> {
    let valid = color.len() == 7
        && color.starts_with('#')
        && color[1..].chars().all(|c| c.is_ascii_hexdigit());
    if !valid {
        return Err(Error::Validation(format!(
            "Color '{}' must be in #RRGGBB format",
            color
        )));
    }
    Ok(())
}

pub(crate) async fn insert_project_row(conn: &mut SqliteConnection, project: &Project) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO projects (
            id, name, description, color, status, created_at, updated_at,
            sync_version, updated_by_device
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&project.id)
    .bind(&project.name)
    .bind(&project.description)
    .bind(&project.color)
    .bind(project.status)
    .bind(project.created_at)
    .bind(project.updated_at)
    .bind(project.sync_version)
    .bind(&project.updated_by_device)
    .execute(conn)
    .await?;

    Ok(())
}

pub(crate) async fn update_project_row(conn: &mut SqliteConnection, project: &Project) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE projects SET
            name = ?, description = ?, color = ?, status = ?,
            updated_at = ?, sync_version = ?, updated_by_device = ?
        WHERE id = ?
        "#,
    )
    .bind(&project.name)
    .bind(&project.description)
    .bind(&project.color)
    .bind(project.status)
    .bind(project.updated_at)
    .bind(project.sync_version)
    .bind(&project.updated_by_device)
    .bind(&project.id)
    .execute(conn)
    .await?;

    Ok(())
}
