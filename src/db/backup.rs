// db/backup.rs - Full data export and guarded restore

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;

use crate::db::models::{
    AppSetting, Project, SessionRecord, Task, TaskChangelog, TaskSubtask, TaskTemplate,
};
use crate::db::{checkpoint, outbox, settings_keys};
use crate::{Error, Result};

/// Versioned backup envelope.
#[derive(Debug, Serialize, Deserialize)]
pub struct BackupExport {
    pub version: u32,
    pub exported_at: DateTime<Utc>,
    pub data: BackupData,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct BackupData {
    pub settings: Vec<AppSetting>,
    pub projects: Vec<Project>,
    pub tasks: Vec<Task>,
    pub sessions: Vec<SessionRecord>,
    pub task_subtasks: Vec<TaskSubtask>,
    pub task_changelogs: Vec<TaskChangelog>,
    pub task_templates: Vec<TaskTemplate>,
}

/// Counts recorded alongside the latest backup for the restore preflight.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupSummary {
    pub projects: usize,
    pub tasks: usize,
    pub task_subtasks: usize,
    pub task_templates: usize,
    pub sessions: usize,
    pub settings: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LatestBackup {
    exported_at: DateTime<Utc>,
    summary: BackupSummary,
}

/// Export the full data set. Sync-plane settings are never included.
pub async fn export_backup(pool: &SqlitePool) -> Result<BackupExport> {
    let settings = sqlx::query_as::<_, AppSetting>(
        "SELECT * FROM settings WHERE key NOT LIKE 'sync.%' ORDER BY key",
    )
    .fetch_all(pool)
    .await?;
    let projects = sqlx::query_as::<_, Project>("SELECT * FROM projects ORDER BY created_at")
        .fetch_all(pool)
        .await?;
    let tasks = sqlx::query_as::<_, Task>("SELECT * FROM tasks ORDER BY created_at")
        .fetch_all(pool)
        .await?;
    let sessions =
        sqlx::query_as::<_, SessionRecord>("SELECT * FROM session_records ORDER BY started_at")
            .fetch_all(pool)
            .await?;
    let task_subtasks =
        sqlx::query_as::<_, TaskSubtask>("SELECT * FROM task_subtasks ORDER BY created_at")
            .fetch_all(pool)
            .await?;
    let task_changelogs =
        sqlx::query_as::<_, TaskChangelog>("SELECT * FROM task_changelogs ORDER BY id")
            .fetch_all(pool)
            .await?;
    let task_templates =
        sqlx::query_as::<_, TaskTemplate>("SELECT * FROM task_templates ORDER BY created_at")
            .fetch_all(pool)
            .await?;

    let export = BackupExport {
        version: 1,
        exported_at: Utc::now(),
        data: BackupData {
            settings,
            projects,
            tasks,
            sessions,
            task_subtasks,
            task_changelogs,
            task_templates,
        },
    };

    let latest = LatestBackup {
        exported_at: export.exported_at,
        summary: summarize(&export.data),
    };
    crate::db::set_meta_setting(
        pool,
        settings_keys::LATEST_BACKUP,
        &serde_json::to_string(&latest)?,
    )
    .await?;

    tracing::info!(
        "Exported backup: {} projects, {} tasks",
        export.data.projects.len(),
        export.data.tasks.len()
    );

    Ok(export)
}

fn summarize(data: &BackupData) -> BackupSummary {
    BackupSummary {
        projects: data.projects.len(),
        tasks: data.tasks.len(),
        task_subtasks: data.task_subtasks.len(),
        task_templates: data.task_templates.len(),
        sessions: data.sessions.len(),
        settings: data.settings.len(),
    }
}

/// What a restore would discard, and whether it must be forced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestorePreflight {
    pub pending_outbox_changes: i64,
    pub open_conflicts: i64,
    pub has_latest_backup: bool,
    pub latest_backup_exported_at: Option<DateTime<Utc>>,
    pub latest_backup_summary: Option<BackupSummary>,
    pub requires_force_restore: bool,
}

pub async fn restore_preflight(pool: &SqlitePool) -> Result<RestorePreflight> {
    let pending_outbox_changes: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM sync_outbox")
        .fetch_one(pool)
        .await?;
    let open_conflicts: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM sync_conflicts WHERE status = 'open'")
            .fetch_one(pool)
            .await?;

    let latest: Option<LatestBackup> = crate::db::get_setting(pool, settings_keys::LATEST_BACKUP)
        .await?
        .and_then(|v| serde_json::from_str(&v).ok());

    Ok(RestorePreflight {
        pending_outbox_changes,
        open_conflicts,
        has_latest_backup: latest.is_some(),
        latest_backup_exported_at: latest.as_ref().map(|l| l.exported_at),
        latest_backup_summary: latest.map(|l| l.summary),
        requires_force_restore: pending_outbox_changes > 0 || open_conflicts > 0,
    })
}

/// Counts of restored rows.
#[derive(Debug, Default, Serialize)]
pub struct RestoreStats {
    pub projects: usize,
    pub tasks: usize,
    pub task_subtasks: usize,
    pub task_templates: usize,
    pub sessions: usize,
    pub settings: usize,
    pub changelog_entries: usize,
}

/// Replace the local data set with a backup.
///
/// When the preflight reports unsynced work, `force` must be set: the
/// pending outbox is discarded and sync state (checkpoint, conflicts,
/// tombstones) is reset. Restored rows are not re-enqueued; the restored
/// state is treated as the new baseline.
pub async fn restore_backup(
    pool: &SqlitePool,
    backup: &BackupExport,
    force: bool,
) -> Result<RestoreStats> {
    if backup.version != 1 {
        return Err(Error::Validation(format!(
            "Unsupported backup version {}",
            backup.version
        )));
    }

    let preflight = restore_preflight(pool).await?;
    if preflight.requires_force_restore && !force {
        return Err(Error::InvalidInput(format!(
            "Restore would discard {} pending changes and {} open conflicts; pass force to proceed",
            preflight.pending_outbox_changes, preflight.open_conflicts
        )));
    }

    let mut tx = pool.begin().await?;

    // Clear current data and sync state
    for table in [
        "task_changelogs",
        "task_subtasks",
        "session_records",
        "tasks",
        "task_templates",
        "projects",
        "deleted_records",
        "sync_conflict_events",
        "sync_conflicts",
    ] {
        sqlx::query(&format!("DELETE FROM {}", table))
            .execute(&mut *tx)
            .await?;
    }
    sqlx::query("DELETE FROM settings WHERE key NOT LIKE 'sync.%'")
        .execute(&mut *tx)
        .await?;
    outbox::clear_all(&mut tx).await?;
    checkpoint::reset(&mut tx).await?;

    let mut stats = RestoreStats::default();

    for project in &backup.data.projects {
        crate::db::projects::insert_project_row(&mut tx, project).await?;
        stats.projects += 1;
    }
    for task in &backup.data.tasks {
        crate::db::tasks::insert_task_row(&mut tx, task).await?;
        stats.tasks += 1;
    }
    for subtask in &backup.data.task_subtasks {
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
        stats.task_subtasks += 1;
    }
    for template in &backup.data.task_templates {
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
        stats.task_templates += 1;
    }
    for session in &backup.data.sessions {
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
        .execute(&mut *tx)
        .await?;
        stats.sessions += 1;
    }
    for setting in &backup.data.settings {
        sqlx::query(
            r#"
            INSERT INTO settings (key, value, updated_at, sync_version, updated_by_device)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&setting.key)
        .bind(&setting.value)
        .bind(setting.updated_at)
        .bind(setting.sync_version)
        .bind(&setting.updated_by_device)
        .execute(&mut *tx)
        .await?;
        stats.settings += 1;
    }
    for entry in &backup.data.task_changelogs {
        sqlx::query(
            r#"
            INSERT INTO task_changelogs (task_id, action, field_name, old_value, new_value, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&entry.task_id)
        .bind(entry.action)
        .bind(&entry.field_name)
        .bind(&entry.old_value)
        .bind(&entry.new_value)
        .bind(entry.created_at)
        .execute(&mut *tx)
        .await?;
        stats.changelog_entries += 1;
    }

    tx.commit().await?;

    tracing::info!(
        "Restore completed: {} projects, {} tasks, {} subtasks",
        stats.projects,
        stats.tasks,
        stats.task_subtasks
    );

    Ok(stats)
}
