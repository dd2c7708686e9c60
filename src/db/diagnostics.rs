// db/diagnostics.rs - Sync diagnostics snapshots and the migration guardrail

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sqlx::SqlitePool;

use crate::db::models::DiagnosticsSnapshot;
use crate::db::settings_keys;
use crate::Result;

/// Persisted migration guardrail state.
///
/// While `sync_write_blocked` is set, every write path that would enqueue an
/// outbox row refuses with the stored reason.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationDiagnostics {
    pub sync_write_blocked: bool,
    pub reason: String,
    pub set_at: DateTime<Utc>,
}

pub async fn set_sync_write_blocked(pool: &SqlitePool, reason: &str) -> Result<()> {
    let diagnostics = MigrationDiagnostics {
        sync_write_blocked: true,
        reason: reason.to_string(),
        set_at: Utc::now(),
    };

    crate::db::set_meta_setting(
        pool,
        settings_keys::MIGRATION_DIAGNOSTICS,
        &serde_json::to_string(&diagnostics)?,
    )
    .await?;

    tracing::error!("Sync write guardrail set: {}", reason);

    Ok(())
}

pub async fn clear_sync_write_blocked(pool: &SqlitePool) -> Result<()> {
    sqlx::query("DELETE FROM settings WHERE key = ?")
        .bind(settings_keys::MIGRATION_DIAGNOSTICS)
        .execute(pool)
        .await?;

    tracing::info!("Sync write guardrail cleared");

    Ok(())
}

pub async fn get_migration_diagnostics(pool: &SqlitePool) -> Result<Option<MigrationDiagnostics>> {
    let value = crate::db::get_setting(pool, settings_keys::MIGRATION_DIAGNOSTICS).await?;
    Ok(value.and_then(|v| serde_json::from_str(&v).ok()))
}

/// Append one diagnostics snapshot. Identical payloads at the identical
/// capture instant are deduplicated (a cycle retried after a crash must not
/// double-count itself).
pub async fn append_snapshot(
    pool: &SqlitePool,
    source: &str,
    captured_at: DateTime<Utc>,
    payload: &Value,
) -> Result<bool> {
    let payload_json = payload.to_string();

    let duplicate: Option<(i64,)> = sqlx::query_as(
        "SELECT 1 FROM sync_diagnostics WHERE captured_at = ? AND payload_json = ? LIMIT 1",
    )
    .bind(captured_at)
    .bind(&payload_json)
    .fetch_optional(pool)
    .await?;

    if duplicate.is_some() {
        tracing::debug!("Skipping duplicate diagnostics snapshot from {}", source);
        return Ok(false);
    }

    sqlx::query(
        "INSERT INTO sync_diagnostics (source, captured_at, payload_json) VALUES (?, ?, ?)",
    )
    .bind(source)
    .bind(captured_at)
    .bind(&payload_json)
    .execute(pool)
    .await?;

    Ok(true)
}

/// Filters for the diagnostics history export.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HistoryFilter {
    pub source_filter: Option<String>,
    pub query: Option<String>,
    pub date_from: Option<DateTime<Utc>>,
    pub date_to: Option<DateTime<Utc>>,
    pub limit: Option<i64>,
}

/// Export the diagnostics history as a stable JSON report.
///
/// An inverted date range is reported (`date_range_invalid`) and the date
/// filter is ignored rather than silently returning nothing.
pub async fn export_history(pool: &SqlitePool, filter: &HistoryFilter) -> Result<Value> {
    let date_range_invalid = matches!(
        (filter.date_from, filter.date_to),
        (Some(from), Some(to)) if from > to
    );

    let snapshots = sqlx::query_as::<_, DiagnosticsSnapshot>(
        "SELECT * FROM sync_diagnostics ORDER BY captured_at DESC, id DESC",
    )
    .fetch_all(pool)
    .await?;

    let filtered: Vec<&DiagnosticsSnapshot> = snapshots
        .iter()
        .filter(|snapshot| {
            if let Some(source) = &filter.source_filter {
                if &snapshot.source != source {
                    return false;
                }
            }
            if let Some(query) = &filter.query {
                if !snapshot
                    .payload_json
                    .to_lowercase()
                    .contains(&query.to_lowercase())
                {
                    return false;
                }
            }
            if !date_range_invalid {
                if let Some(from) = filter.date_from {
                    if snapshot.captured_at < from {
                        return false;
                    }
                }
                if let Some(to) = filter.date_to {
                    if snapshot.captured_at > to {
                        return false;
                    }
                }
            }
            true
        })
        .collect();

    let total_filtered = filtered.len();
    let limit = filter.limit.unwrap_or(i64::MAX).max(0) as usize;
    let exported: Vec<&&DiagnosticsSnapshot> = filtered.iter().take(limit).collect();

    Ok(json!({
        "report_type": "sync_diagnostics_history",
        "filters": {
            "source_filter": filter.source_filter,
            "query": filter.query,
            "date_from": filter.date_from,
            "date_to": filter.date_to,
            "limit": filter.limit,
            "date_range_invalid": date_range_invalid,
        },
        "total_filtered": total_filtered,
        "total_exported": exported.len(),
        "items": exported,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[tokio::test]
    async fn test_snapshot_dedup() {
        let pool = crate::db::test_pool().await;
        let at = Utc.with_ymd_and_hms(2026, 2, 17, 1, 0, 0).unwrap();
        let payload = json!({"applied": 3, "conflicts": 1});

        assert!(append_snapshot(&pool, "sync_cycle", at, &payload).await.unwrap());
        assert!(!append_snapshot(&pool, "sync_cycle", at, &payload).await.unwrap());

        // Same payload at a different instant is a new snapshot
        let later = at + chrono::Duration::minutes(1);
        assert!(append_snapshot(&pool, "sync_cycle", later, &payload).await.unwrap());

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM sync_diagnostics")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count, 2);
    }

    #[tokio::test]
    async fn test_history_export_filters() {
        let pool = crate::db::test_pool().await;
        let base = Utc.with_ymd_and_hms(2026, 2, 17, 1, 0, 0).unwrap();

        for (offset, source, note) in [
            (0, "sync_cycle", "offline"),
            (1, "sync_cycle", "applied=5"),
            (2, "manual", "applied=2"),
        ] {
            append_snapshot(
                &pool,
                source,
                base + chrono::Duration::minutes(offset),
                &json!({ "note": note }),
            )
            .await
            .unwrap();
        }

        let report = export_history(
            &pool,
            &HistoryFilter {
                source_filter: Some("sync_cycle".to_string()),
                query: Some("applied".to_string()),
                ..HistoryFilter::default()
            },
        )
        .await
        .unwrap();

        assert_eq!(report["report_type"], "sync_diagnostics_history");
        assert_eq!(report["total_filtered"], 1);
        assert_eq!(report["total_exported"], 1);
        assert_eq!(report["filters"]["date_range_invalid"], false);
    }

    #[tokio::test]
    async fn test_history_export_inverted_range() {
        let pool = crate::db::test_pool().await;
        let base = Utc.with_ymd_and_hms(2026, 2, 17, 1, 0, 0).unwrap();
        append_snapshot(&pool, "sync_cycle", base, &json!({"n": 1}))
            .await
            .unwrap();

        let report = export_history(
            &pool,
            &HistoryFilter {
                date_from: Some(base + chrono::Duration::days(1)),
                date_to: Some(base - chrono::Duration::days(1)),
                ..HistoryFilter::default()
            },
        )
        .await
        .unwrap();

        assert_eq!(report["filters"]["date_range_invalid"], true);
        // Invalid range: the date filter is ignored, not fatal
        assert_eq!(report["total_filtered"], 1);
    }

    #[tokio::test]
    async fn test_guardrail_round_trip() {
        let pool = crate::db::test_pool().await;

        assert!(get_migration_diagnostics(&pool).await.unwrap().is_none());

        set_sync_write_blocked(&pool, "copy verification failed")
            .await
            .unwrap();
        let diag = get_migration_diagnostics(&pool).await.unwrap().unwrap();
        assert!(diag.sync_write_blocked);
        assert_eq!(diag.reason, "copy verification failed");

        clear_sync_write_blocked(&pool).await.unwrap();
        assert!(get_migration_diagnostics(&pool).await.unwrap().is_none());
    }
}
