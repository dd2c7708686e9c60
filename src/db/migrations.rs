// db/migrations.rs - Database schema migrations

use sqlx::{Row, SqlitePool};

use crate::db::settings_keys;
use crate::provider::config::RuntimePreset;
use crate::Result;

/// Run all database migrations
///
/// Migrations are idempotent and safe to run multiple times. A failed
/// integrity verification at the end sets the one-shot write guardrail
/// instead of failing open.
pub async fn run(pool: &SqlitePool) -> Result<()> {
    // Create migrations table
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS _migrations (
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            applied_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Run migrations in order
    run_if_needed(pool, 1, "create_projects_table").await?;
    run_if_needed(pool, 2, "create_tasks_table").await?;
    run_if_needed(pool, 3, "create_task_subtasks_table").await?;
    run_if_needed(pool, 4, "create_task_templates_table").await?;
    run_if_needed(pool, 5, "create_session_records_table").await?;
    run_if_needed(pool, 6, "create_settings_table").await?;
    run_if_needed(pool, 7, "create_task_changelogs_table").await?;
    run_if_needed(pool, 8, "create_deleted_records_table").await?;
    run_if_needed(pool, 9, "create_sync_outbox_table").await?;
    run_if_needed(pool, 10, "create_sync_checkpoint_table").await?;
    run_if_needed(pool, 11, "create_sync_conflict_tables").await?;
    run_if_needed(pool, 12, "create_sync_diagnostics_table").await?;
    run_if_needed(pool, 13, "create_indices").await?;
    run_if_needed(pool, 14, "ensure_sync_columns").await?;
    run_if_needed(pool, 15, "seed_sync_singletons").await?;

    verify_integrity(pool).await?;

    Ok(())
}

/// Check if migration is needed and run the appropriate SQL
async fn run_if_needed(pool: &SqlitePool, id: i32, name: &str) -> Result<()> {
    let exists: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM _migrations WHERE id = ?")
        .bind(id)
        .fetch_one(pool)
        .await?;

    if exists.0 == 0 {
        tracing::info!("Running migration {}: {}", id, name);

        match id {
            1 => create_projects_table(pool).await?,
            2 => create_tasks_table(pool).await?,
            3 => create_task_subtasks_table(pool).await?,
            4 => create_task_templates_table(pool).await?,
            5 => create_session_records_table(pool).await?,
            6 => create_settings_table(pool).await?,
            7 => create_task_changelogs_table(pool).await?,
            8 => create_deleted_records_table(pool).await?,
            9 => create_sync_outbox_table(pool).await?,
            10 => create_sync_checkpoint_table(pool).await?,
            11 => create_sync_conflict_tables(pool).await?,
            12 => create_sync_diagnostics_table(pool).await?,
            13 => create_indices(pool).await?,
            14 => ensure_sync_columns(pool).await?,
            15 => seed_sync_singletons(pool).await?,
            _ => {
                return Err(crate::Error::Config(format!(
                    "Unknown migration id: {}",
                    id
                )))
            }
        }

        sqlx::query("INSERT INTO _migrations (id, name) VALUES (?, ?)")
            .bind(id)
            .bind(name)
            .execute(pool)
            .await?;

        tracing::info!("Migration {} completed", id);
    }

    Ok(())
}

/// Migration 1: Create projects table
async fn create_projects_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS projects (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL COLLATE NOCASE UNIQUE,
            description TEXT,
            color TEXT,
            status TEXT NOT NULL DEFAULT 'ACTIVE'
                CHECK(status IN ('ACTIVE', 'COMPLETED', 'ARCHIVED')),
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            sync_version INTEGER NOT NULL DEFAULT 1,
            updated_by_device TEXT NOT NULL DEFAULT ''
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Migration 2: Create tasks table
async fn create_tasks_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS tasks (
            id TEXT PRIMARY KEY,
            title TEXT NOT NULL,
            description TEXT,
            notes_markdown TEXT,
            project_id TEXT REFERENCES projects(id) ON DELETE SET NULL,
            status TEXT NOT NULL DEFAULT 'TODO'
                CHECK(status IN ('TODO', 'DOING', 'DONE', 'ARCHIVED')),
            priority TEXT NOT NULL DEFAULT 'NORMAL'
                CHECK(priority IN ('URGENT', 'NORMAL', 'LOW')),
            is_important BOOLEAN NOT NULL DEFAULT 0,
            due_at TEXT,
            remind_at TEXT,
            recurrence TEXT NOT NULL DEFAULT 'NONE'
                CHECK(recurrence IN ('NONE', 'DAILY', 'WEEKLY', 'MONTHLY')),
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            sync_version INTEGER NOT NULL DEFAULT 1,
            updated_by_device TEXT NOT NULL DEFAULT ''
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Migration 3: Create task subtasks table
async fn create_task_subtasks_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS task_subtasks (
            id TEXT PRIMARY KEY,
            task_id TEXT NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
            title TEXT NOT NULL,
            is_done BOOLEAN NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            sync_version INTEGER NOT NULL DEFAULT 1,
            updated_by_device TEXT NOT NULL DEFAULT ''
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Migration 4: Create task templates table
async fn create_task_templates_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS task_templates (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            title_template TEXT NOT NULL,
            description TEXT,
            priority TEXT NOT NULL DEFAULT 'NORMAL'
                CHECK(priority IN ('URGENT', 'NORMAL', 'LOW')),
            is_important BOOLEAN NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            sync_version INTEGER NOT NULL DEFAULT 1,
            updated_by_device TEXT NOT NULL DEFAULT ''
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Migration 5: Create session records table
async fn create_session_records_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS session_records (
            id TEXT PRIMARY KEY,
            task_id TEXT REFERENCES tasks(id) ON DELETE SET NULL,
            started_at TEXT NOT NULL,
            ended_at TEXT,
            notes TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            sync_version INTEGER NOT NULL DEFAULT 1,
            updated_by_device TEXT NOT NULL DEFAULT ''
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Migration 6: Create key/value settings table
async fn create_settings_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS settings (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            sync_version INTEGER NOT NULL DEFAULT 1,
            updated_by_device TEXT NOT NULL DEFAULT ''
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Migration 7: Create task changelogs table
async fn create_task_changelogs_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS task_changelogs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            task_id TEXT NOT NULL,
            action TEXT NOT NULL CHECK(action IN ('CREATED', 'UPDATED', 'STATUS_CHANGED')),
            field_name TEXT,
            old_value TEXT,
            new_value TEXT,
            created_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Migration 8: Create deletion tombstones table
async fn create_deleted_records_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS deleted_records (
            entity_type TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            deleted_at TEXT NOT NULL,
            deleted_by_device TEXT NOT NULL,
            PRIMARY KEY (entity_type, entity_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Migration 9: Create sync outbox table
///
/// One pending row per (entity_type, entity_id); later mutations coalesce.
async fn create_sync_outbox_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS sync_outbox (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            entity_type TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            operation TEXT NOT NULL CHECK(operation IN ('UPSERT', 'DELETE')),
            payload_json TEXT,
            idempotency_key TEXT NOT NULL UNIQUE,
            attempts INTEGER NOT NULL DEFAULT 0,
            last_error TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            UNIQUE(entity_type, entity_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Migration 10: Create singleton sync checkpoint row
async fn create_sync_checkpoint_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS sync_checkpoint (
            id INTEGER PRIMARY KEY CHECK(id = 1),
            last_sync_cursor TEXT,
            last_synced_at TEXT,
            updated_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        INSERT OR IGNORE INTO sync_checkpoint (id, last_sync_cursor, last_synced_at, updated_at)
        VALUES (1, NULL, NULL, ?)
        "#,
    )
    .bind(chrono::Utc::now())
    .execute(pool)
    .await?;

    Ok(())
}

/// Migration 11: Create conflict record and event tables
async fn create_sync_conflict_tables(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS sync_conflicts (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            incoming_idempotency_key TEXT NOT NULL,
            entity_type TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            operation TEXT NOT NULL,
            conflict_type TEXT NOT NULL
                CHECK(conflict_type IN ('field_conflict', 'delete_vs_update', 'notes_collision', 'validation_error')),
            reason_code TEXT NOT NULL,
            message TEXT NOT NULL,
            local_payload_json TEXT,
            remote_payload_json TEXT,
            base_payload_json TEXT,
            status TEXT NOT NULL DEFAULT 'open'
                CHECK(status IN ('open', 'resolved', 'ignored')),
            resolution_strategy TEXT
                CHECK(resolution_strategy IN ('keep_local', 'keep_remote', 'manual_merge', 'retry')),
            resolution_payload_json TEXT,
            resolved_by_device TEXT,
            detected_at TEXT NOT NULL,
            resolved_at TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS sync_conflict_events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            conflict_id INTEGER NOT NULL REFERENCES sync_conflicts(id) ON DELETE CASCADE,
            event_type TEXT NOT NULL
                CHECK(event_type IN ('detected', 'resolved', 'ignored', 'retried', 'exported')),
            event_payload_json TEXT,
            created_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Migration 12: Create sync diagnostics snapshots table
async fn create_sync_diagnostics_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS sync_diagnostics (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            source TEXT NOT NULL,
            captured_at TEXT NOT NULL,
            payload_json TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Migration 13: Create performance indices
async fn create_indices(pool: &SqlitePool) -> Result<()> {
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_tasks_due_at ON tasks(due_at)")
        .execute(pool)
        .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_tasks_project ON tasks(project_id)")
        .execute(pool)
        .await?;

    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_task_changelogs_task
        ON task_changelogs(task_id, created_at DESC)
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_task_subtasks_task
        ON task_subtasks(task_id, created_at ASC)
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_sync_outbox_created ON sync_outbox(created_at)")
        .execute(pool)
        .await?;

    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_sync_conflicts_status
        ON sync_conflicts(status, detected_at DESC)
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Migration 14: Ensure sync columns exist on legacy tables
///
/// Databases created before the sync plane shipped are missing the sync
/// metadata columns; add whichever are absent.
async fn ensure_sync_columns(pool: &SqlitePool) -> Result<()> {
    ensure_column(pool, "tasks", "notes_markdown", "TEXT").await?;
    ensure_column(pool, "tasks", "recurrence", "TEXT NOT NULL DEFAULT 'NONE'").await?;
    ensure_column(pool, "tasks", "project_id", "TEXT").await?;

    for table in [
        "projects",
        "tasks",
        "task_subtasks",
        "task_templates",
        "session_records",
        "settings",
    ] {
        ensure_column(pool, table, "sync_version", "INTEGER NOT NULL DEFAULT 1").await?;
        ensure_column(pool, table, "updated_by_device", "TEXT NOT NULL DEFAULT ''").await?;
    }

    Ok(())
}

/// Migration 15: Seed singleton settings rows
///
/// Seeding is idempotent: existing values are never overwritten.
async fn seed_sync_singletons(pool: &SqlitePool) -> Result<()> {
    let now = chrono::Utc::now();

    seed_setting(pool, settings_keys::PROVIDER, "provider_neutral", now).await?;
    seed_setting(pool, settings_keys::RUNTIME_PROFILE, "desktop", now).await?;
    seed_setting(
        pool,
        settings_keys::RUNTIME_PRESET_DESKTOP,
        &serde_json::to_string(&RuntimePreset::desktop())?,
        now,
    )
    .await?;
    seed_setting(
        pool,
        settings_keys::RUNTIME_PRESET_MOBILE,
        &serde_json::to_string(&RuntimePreset::mobile())?,
        now,
    )
    .await?;

    Ok(())
}

async fn seed_setting(
    pool: &SqlitePool,
    key: &str,
    value: &str,
    now: chrono::DateTime<chrono::Utc>,
) -> Result<()> {
    sqlx::query("INSERT OR IGNORE INTO settings (key, value, updated_at) VALUES (?, ?, ?)")
        .bind(key)
        .bind(value)
        .bind(now)
        .execute(pool)
        .await?;

    Ok(())
}

/// Add a column if the table does not already have it
async fn ensure_column(pool: &SqlitePool, table: &str, column: &str, definition: &str) -> Result<()> {
    let rows = sqlx::query(&format!("PRAGMA table_info({})", table))
        .fetch_all(pool)
        .await?;

    let present = rows
        .iter()
        .any(|row| row.get::<String, _>("name") == column);

    if !present {
        tracing::info!("Adding column {}.{}", table, column);
        sqlx::query(&format!(
            "ALTER TABLE {} ADD COLUMN {} {}",
            table, column, definition
        ))
        .execute(pool)
        .await?;
    }

    Ok(())
}

/// Verify store integrity after migration. A failure sets the one-shot
/// sync_write_blocked guardrail rather than leaving a corrupt store writable.
async fn verify_integrity(pool: &SqlitePool) -> Result<()> {
    let quick_check: (String,) = sqlx::query_as("PRAGMA quick_check(1)")
        .fetch_one(pool)
        .await?;

    let fk_violations = sqlx::query("PRAGMA foreign_key_check")
        .fetch_all(pool)
        .await?;

    if quick_check.0 != "ok" || !fk_violations.is_empty() {
        let reason = if quick_check.0 != "ok" {
            format!("integrity check failed: {}", quick_check.0)
        } else {
            format!("{} foreign key violations after migration", fk_violations.len())
        };

        tracing::error!("Migration verification failed, blocking sync writes: {}", reason);
        crate::db::diagnostics::set_sync_write_blocked(pool, &reason).await?;
    }

    Ok(())
}
