// db/mod.rs - Database module with SQLx integration

pub mod backup;
pub mod checkpoint;
pub mod conflicts;
pub mod diagnostics;
pub mod migrations;
pub mod models;
pub mod outbox;
pub mod projects;
pub mod tasks;

use std::path::Path;
use std::str::FromStr;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{SqliteConnection, SqlitePool};

use crate::Result;

/// Reserved settings keys used by the sync plane. Rows under the `sync.`
/// prefix never travel through the outbox.
pub mod settings_keys {
    pub const DEVICE_ID: &str = "sync.device_id";
    pub const PROVIDER: &str = "sync.provider";
    pub const PROVIDER_CONFIG: &str = "sync.provider_config";
    pub const RUNTIME_PROFILE: &str = "sync.runtime_profile";
    pub const RUNTIME_PRESET_DESKTOP: &str = "sync.runtime.desktop";
    pub const RUNTIME_PRESET_MOBILE: &str = "sync.runtime.mobile";
    pub const RUNTIME_PRESET_CUSTOM: &str = "sync.runtime.custom";
    pub const MIGRATION_DIAGNOSTICS: &str = "sync.migration_diagnostics";
    pub const LATEST_BACKUP: &str = "sync.latest_backup";

    /// Prefix marking process-internal settings.
    pub const INTERNAL_PREFIX: &str = "sync.";
}

/// Database abstraction with connection pooling
///
/// Owns the single relational connection pool for the process and the device
/// identity stamped onto every local mutation.
#[derive(Clone)]
pub struct Database {
    pub pool: SqlitePool,
    pub device_id: String,
}

impl Database {
    /// Open (or create) the database at the given path and migrate it.
    ///
    /// Uses WAL mode for better concurrency and enables foreign keys.
    pub async fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let db_url = format!("sqlite:{}", db_path.display());

        let options = SqliteConnectOptions::from_str(&db_url)?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        Self::finish_open(pool).await
    }

    /// Open an ephemeral in-memory database (tests, dry runs).
    pub async fn open_in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);

        // A single connection: each in-memory connection is its own database.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        Self::finish_open(pool).await
    }

    /// Default database location under the platform data directory.
    pub fn default_path() -> Result<std::path::PathBuf> {
        let base = dirs::data_dir()
            .ok_or_else(|| crate::Error::Config("No platform data directory".to_string()))?;
        Ok(base.join("solostack").join("solostack.db"))
    }

    async fn finish_open(pool: SqlitePool) -> Result<Self> {
        migrations::run(&pool).await?;
        let device_id = crate::device::ensure_device_id(&pool).await?;

        tracing::info!("Database opened, device id {}", device_id);

        Ok(Self { pool, device_id })
    }

    /// Execute health check query
    pub async fn health_check(&self) -> Result<bool> {
        let result: (i64,) = sqlx::query_as("SELECT 1").fetch_one(&self.pool).await?;
        Ok(result.0 == 1)
    }
}

/// Read a settings row. Used for both internal sync-plane keys and
/// user-facing settings.
pub async fn get_setting(pool: &SqlitePool, key: &str) -> Result<Option<String>> {
    let value: Option<(String,)> = sqlx::query_as("SELECT value FROM settings WHERE key = ?")
        .bind(key)
        .fetch_optional(pool)
        .await?;

    Ok(value.map(|(v,)| v))
}

/// Write an internal sync-plane settings row. Never enqueues an outbox row.
pub async fn set_meta_setting(pool: &SqlitePool, key: &str, value: &str) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO settings (key, value, updated_at)
        VALUES (?, ?, ?)
        ON CONFLICT(key) DO UPDATE SET
            value = excluded.value,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(key)
    .bind(value)
    .bind(chrono::Utc::now())
    .execute(pool)
    .await?;

    Ok(())
}

/// Refuse mutations that would enqueue outbox rows while the migration
/// guardrail is set. Runs inside the caller's transaction.
pub(crate) async fn ensure_writes_allowed(conn: &mut SqliteConnection) -> Result<()> {
    let flag: Option<(String,)> = sqlx::query_as("SELECT value FROM settings WHERE key = ?")
        .bind(settings_keys::MIGRATION_DIAGNOSTICS)
        .fetch_optional(&mut *conn)
        .await?;

    if let Some((value,)) = flag {
        if let Ok(diag) = serde_json::from_str::<diagnostics::MigrationDiagnostics>(&value) {
            if diag.sync_write_blocked {
                return Err(crate::Error::WriteBlocked(format!(
                    "local changes are paused until the store is repaired ({})",
                    diag.reason
                )));
            }
        }
    }

    Ok(())
}

// Ensure pool is Send + Sync for cross-thread sharing
const _: () = {
    fn assert_send_sync<T: Send + Sync>() {}
    fn assert_all() {
        assert_send_sync::<Database>();
    }
};

/// Fresh migrated in-memory pool for unit tests.
#[cfg(test)]
pub(crate) async fn test_pool() -> SqlitePool {
    let db = Database::open_in_memory().await.expect("in-memory database");
    db.pool
}

/// Fresh migrated in-memory database for unit tests.
#[cfg(test)]
pub(crate) async fn test_db() -> Database {
    Database::open_in_memory().await.expect("in-memory database")
}
