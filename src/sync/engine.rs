// sync/engine.rs - Pure batch logic for one sync cycle
//
// These functions hold the decision logic of the push and pull stages and do
// no I/O themselves: they turn store rows into wire frames and server
// responses into plans the runner executes against the store.

use std::future::Future;

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::db::models::OutboxChange;
use crate::protocol::{
    codec, ChangeOperation, ChangeRecord, EntityType, PullResponse, PushRequest, PushResponse,
};
use crate::sync::apply::ApplyOutcome;
use crate::{Error, Result};

/// Maps one outbox row to its position in the push request.
#[derive(Debug, Clone, PartialEq)]
pub struct PushEntry {
    pub outbox_id: i64,
    pub idempotency_key: String,
}

/// An outbox row excluded from the batch, with the reason.
#[derive(Debug, Clone, PartialEq)]
pub struct SkippedChange {
    pub outbox_id: i64,
    pub reason: &'static str,
}

/// Result of assembling a push batch.
#[derive(Debug)]
pub struct PreparedPush {
    pub request: PushRequest,
    pub entries: Vec<PushEntry>,
    pub skipped: Vec<SkippedChange>,
}

/// Build a push request from pending outbox rows.
///
/// Rows with an empty entity id or an unparseable UPSERT payload are skipped
/// (MISSING_ENTITY_ID / INVALID_PAYLOAD_JSON) rather than poisoning the
/// batch. Change metadata is taken from the payload when present, falling
/// back to the row. `entries` mirrors `request.changes` in order.
pub fn prepare_push_batch(
    device_id: &str,
    base_cursor: Option<&str>,
    outbox_changes: &[OutboxChange],
) -> Result<PreparedPush> {
    let mut skipped = Vec::new();
    let mut changes = Vec::new();
    let mut keyed: Vec<(String, i64)> = Vec::new();

    for row in outbox_changes {
        if row.entity_id.trim().is_empty() {
            skipped.push(SkippedChange {
                outbox_id: row.id,
                reason: "MISSING_ENTITY_ID",
            });
            continue;
        }

        let entity_type = match EntityType::parse(&row.entity_type) {
            Some(entity_type) => entity_type,
            None => {
                skipped.push(SkippedChange {
                    outbox_id: row.id,
                    reason: "INVALID_ENTITY_TYPE",
                });
                continue;
            }
        };

        let operation = match ChangeOperation::parse(&row.operation) {
            Some(operation) => operation,
            None => {
                skipped.push(SkippedChange {
                    outbox_id: row.id,
                    reason: "INVALID_OPERATION",
                });
                continue;
            }
        };

        let payload = match (operation, row.payload_json.as_deref()) {
            (ChangeOperation::Delete, _) => None,
            (ChangeOperation::Upsert, Some(raw)) => match serde_json::from_str::<Value>(raw) {
                Ok(value) if value.is_object() => Some(value),
                _ => {
                    skipped.push(SkippedChange {
                        outbox_id: row.id,
                        reason: "INVALID_PAYLOAD_JSON",
                    });
                    continue;
                }
            },
            (ChangeOperation::Upsert, None) => Some(Value::Object(Default::default())),
        };

        let updated_at = payload
            .as_ref()
            .and_then(|p| p.get("updated_at"))
            .and_then(Value::as_str)
            .map(codec::coerce_timestamp)
            .unwrap_or(row.updated_at);
        let updated_by_device = payload
            .as_ref()
            .and_then(|p| p.get("updated_by_device"))
            .and_then(Value::as_str)
            .unwrap_or(device_id)
            .to_string();
        let sync_version = payload
            .as_ref()
            .and_then(|p| p.get("sync_version"))
            .and_then(Value::as_i64)
            .unwrap_or(1);

        keyed.push((row.idempotency_key.clone(), row.id));
        changes.push(ChangeRecord {
            entity_type,
            entity_id: row.entity_id.clone(),
            operation,
            updated_at,
            updated_by_device,
            sync_version,
            payload,
            idempotency_key: row.idempotency_key.clone(),
        });
    }

    let request = codec::build_push_request(device_id, base_cursor, changes)?;

    // Entries follow the request's deterministic order
    let entries = request
        .changes
        .iter()
        .map(|change| {
            let outbox_id = keyed
                .iter()
                .find(|(key, _)| key == &change.idempotency_key)
                .map(|(_, id)| *id)
                .unwrap_or_default();
            PushEntry {
                outbox_id,
                idempotency_key: change.idempotency_key.clone(),
            }
        })
        .collect();

    Ok(PreparedPush {
        request,
        entries,
        skipped,
    })
}

/// A rejected outbox row and the message to record on it.
#[derive(Debug, Clone, PartialEq)]
pub struct FailedOutboxChange {
    pub outbox_id: i64,
    pub message: String,
}

/// Bookkeeping plan derived from a push response.
#[derive(Debug, Default)]
pub struct PushAckSummary {
    pub removed_outbox_ids: Vec<i64>,
    pub failed: Vec<FailedOutboxChange>,
    pub pending_outbox_ids: Vec<i64>,
}

/// Classify every pushed entry against the server's verdict.
///
/// Accepted keys map to outbox removals; rejected keys map to failure marks
/// formatted `"[<reason>] <message>"`; entries the server did not mention
/// stay pending for the next cycle.
pub fn acknowledge_push_result(entries: &[PushEntry], response: &PushResponse) -> PushAckSummary {
    let mut summary = PushAckSummary::default();

    for entry in entries {
        if response.accepted.contains(&entry.idempotency_key) {
            summary.removed_outbox_ids.push(entry.outbox_id);
        } else if let Some(rejected) = response
            .rejected
            .iter()
            .find(|r| r.idempotency_key == entry.idempotency_key)
        {
            summary.failed.push(FailedOutboxChange {
                outbox_id: entry.outbox_id,
                message: format!("[{}] {}", rejected.reason, rejected.message),
            });
        } else {
            summary.pending_outbox_ids.push(entry.outbox_id);
        }
    }

    summary
}

/// One failed incoming change, kept for the cycle summary.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq)]
pub struct PullFailure {
    pub idempotency_key: String,
    pub error: String,
}

/// Counters for one applied pull page.
#[derive(Debug, Default, Clone, serde::Serialize, serde::Deserialize, PartialEq)]
pub struct PullBatchSummary {
    pub applied: u64,
    pub skipped: u64,
    pub conflicts: u64,
    pub failed: u64,
    pub skipped_self: u64,
    pub failures: Vec<PullFailure>,
}

impl PullBatchSummary {
    pub fn absorb(&mut self, other: PullBatchSummary) {
        self.applied += other.applied;
        self.skipped += other.skipped;
        self.conflicts += other.conflicts;
        self.failed += other.failed;
        self.skipped_self += other.skipped_self;
        self.failures.extend(other.failures);
    }
}

/// Apply one pull page through the provided apply function.
///
/// Changes are applied in the same deterministic order the codec uses for
/// push batches; self-changes are filtered out before applying. An error on
/// one change is recorded and the page continues.
pub async fn apply_pull_batch<F, Fut>(
    response: &PullResponse,
    local_device_id: &str,
    mut apply_change: F,
) -> PullBatchSummary
where
    F: FnMut(ChangeRecord) -> Fut,
    Fut: Future<Output = Result<ApplyOutcome>>,
{
    let mut changes = response.changes.clone();
    changes.sort_by_key(|c| c.sort_key());

    let mut summary = PullBatchSummary::default();

    for change in changes {
        if change.updated_by_device == local_device_id {
            summary.skipped_self += 1;
            continue;
        }

        let idempotency_key = change.idempotency_key.clone();
        match apply_change(change).await {
            Ok(ApplyOutcome::Applied) => summary.applied += 1,
            Ok(ApplyOutcome::Skipped) => summary.skipped += 1,
            Ok(ApplyOutcome::Conflict) => summary.conflicts += 1,
            Err(err) => {
                summary.failed += 1;
                summary.failures.push(PullFailure {
                    idempotency_key,
                    error: err.to_string(),
                });
            }
        }
    }

    summary
}

/// Validated cursor advance derived from server metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct CursorAdvance {
    pub cursor: String,
    pub synced_at: DateTime<Utc>,
}

/// Validate and normalize a cursor advance.
///
/// Blank cursors are rejected; an unparseable server time falls back to the
/// epoch rather than failing the page.
pub fn advance_cursor(server_cursor: &str, server_time: &str) -> Result<CursorAdvance> {
    let cursor = server_cursor.trim();
    if cursor.is_empty() {
        return Err(Error::Sync(
            "Server cursor must not be empty or whitespace".to_string(),
        ));
    }

    Ok(CursorAdvance {
        cursor: cursor.to_string(),
        synced_at: codec::coerce_timestamp(server_time),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::RejectedChange;
    use chrono::TimeZone;
    use serde_json::json;

    fn outbox_row(
        id: i64,
        entity_type: &str,
        entity_id: &str,
        operation: &str,
        payload: Option<&str>,
        key: &str,
    ) -> OutboxChange {
        let now = Utc.with_ymd_and_hms(2026, 2, 17, 0, 0, 0).unwrap();
        OutboxChange {
            id,
            entity_type: entity_type.to_string(),
            entity_id: entity_id.to_string(),
            operation: operation.to_string(),
            payload_json: payload.map(|p| p.to_string()),
            idempotency_key: key.to_string(),
            attempts: 0,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_prepare_push_batch_skips_bad_rows() {
        let rows = vec![
            outbox_row(1, "TASK", "t1", "UPSERT", Some(r#"{"title":"ok"}"#), "dev-a:1"),
            outbox_row(2, "TASK", "  ", "UPSERT", Some("{}"), "dev-a:2"),
            outbox_row(3, "TASK", "t3", "UPSERT", Some("not json"), "dev-a:3"),
            outbox_row(4, "TASK", "t4", "DELETE", None, "dev-a:4"),
        ];

        let prepared = prepare_push_batch("dev-a", None, &rows).unwrap();

        assert_eq!(prepared.request.changes.len(), 2);
        assert_eq!(prepared.entries.len(), 2);
        assert_eq!(prepared.skipped.len(), 2);
        assert_eq!(prepared.skipped[0].reason, "MISSING_ENTITY_ID");
        assert_eq!(prepared.skipped[1].reason, "INVALID_PAYLOAD_JSON");
    }

    #[test]
    fn test_prepare_push_batch_metadata_from_payload() {
        let payload = r#"{
            "title": "x",
            "updated_at": "2026-02-17T05:00:00Z",
            "updated_by_device": "dev-z",
            "sync_version": 7
        }"#;
        let rows = vec![outbox_row(1, "TASK", "t1", "UPSERT", Some(payload), "dev-a:1")];

        let prepared = prepare_push_batch("dev-a", Some("c0"), &rows).unwrap();
        let change = &prepared.request.changes[0];
        assert_eq!(
            change.updated_at,
            Utc.with_ymd_and_hms(2026, 2, 17, 5, 0, 0).unwrap()
        );
        assert_eq!(change.updated_by_device, "dev-z");
        assert_eq!(change.sync_version, 7);
    }

    #[test]
    fn test_prepare_push_entries_follow_request_order() {
        // The project carries the earlier timestamp, so it must lead the
        // batch despite being listed second.
        let task_payload = r#"{"title":"t","updated_at":"2026-02-17T06:00:00Z"}"#;
        let project_payload = r#"{"name":"p","updated_at":"2026-02-17T05:00:00Z"}"#;
        let rows = vec![
            outbox_row(10, "TASK", "t1", "UPSERT", Some(task_payload), "dev-a:t"),
            outbox_row(11, "PROJECT", "p1", "UPSERT", Some(project_payload), "dev-a:p"),
        ];

        let prepared = prepare_push_batch("dev-a", None, &rows).unwrap();
        assert_eq!(prepared.request.changes[0].entity_id, "p1");
        assert_eq!(prepared.entries[0].outbox_id, 11);
        assert_eq!(prepared.entries[1].outbox_id, 10);
    }

    #[test]
    fn test_acknowledge_push_result_partitions_entries() {
        let entries = vec![
            PushEntry {
                outbox_id: 1,
                idempotency_key: "dev-a:1".to_string(),
            },
            PushEntry {
                outbox_id: 2,
                idempotency_key: "dev-a:2".to_string(),
            },
            PushEntry {
                outbox_id: 3,
                idempotency_key: "dev-a:3".to_string(),
            },
        ];

        let response = PushResponse {
            accepted: vec!["dev-a:1".to_string()],
            rejected: vec![RejectedChange {
                idempotency_key: "dev-a:2".to_string(),
                reason: "VALIDATION_ERROR".to_string(),
                message: "title required".to_string(),
            }],
            server_cursor: "c1".to_string(),
            server_time: "2026-02-17T02:00:00Z".to_string(),
        };

        let summary = acknowledge_push_result(&entries, &response);
        assert_eq!(summary.removed_outbox_ids, vec![1]);
        assert_eq!(summary.failed.len(), 1);
        assert_eq!(summary.failed[0].outbox_id, 2);
        assert_eq!(summary.failed[0].message, "[VALIDATION_ERROR] title required");
        assert_eq!(summary.pending_outbox_ids, vec![3]);
    }

    #[tokio::test]
    async fn test_apply_pull_batch_filters_and_counts() {
        let make_change = |id: &str, device: &str| ChangeRecord {
            entity_type: EntityType::Task,
            entity_id: id.to_string(),
            operation: ChangeOperation::Upsert,
            updated_at: Utc.with_ymd_and_hms(2026, 2, 17, 1, 0, 0).unwrap(),
            updated_by_device: device.to_string(),
            sync_version: 1,
            payload: Some(json!({"title": "x"})),
            idempotency_key: format!("{}:{}", device, id),
        };

        let response = PullResponse {
            server_cursor: "c1".to_string(),
            server_time: "2026-02-17T02:00:00Z".to_string(),
            changes: vec![
                make_change("a", "dev-b"),
                make_change("mine", "dev-a"),
                make_change("boom", "dev-b"),
                make_change("c", "dev-b"),
            ],
            has_more: false,
        };

        let summary = apply_pull_batch(&response, "dev-a", |change| async move {
            match change.entity_id.as_str() {
                "boom" => Err(Error::Database("disk full".to_string())),
                "c" => Ok(ApplyOutcome::Conflict),
                _ => Ok(ApplyOutcome::Applied),
            }
        })
        .await;

        assert_eq!(summary.applied, 1);
        assert_eq!(summary.skipped_self, 1);
        assert_eq!(summary.conflicts, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.failures[0].idempotency_key, "dev-b:boom");
        assert!(summary.failures[0].error.contains("disk full"));
    }

    #[test]
    fn test_advance_cursor_validation() {
        assert!(advance_cursor("", "2026-02-17T02:00:00Z").is_err());
        assert!(advance_cursor("   ", "2026-02-17T02:00:00Z").is_err());

        let advance = advance_cursor("  c9 ", "2026-02-17T02:00:00Z").unwrap();
        assert_eq!(advance.cursor, "c9");
        assert_eq!(
            advance.synced_at,
            Utc.with_ymd_and_hms(2026, 2, 17, 2, 0, 0).unwrap()
        );

        // Unparseable server time falls back to the epoch
        let advance = advance_cursor("c1", "garbage").unwrap();
        assert_eq!(advance.synced_at.timestamp(), 0);
    }
}
