// sync/sync_tests.rs - End-to-end sync cycle tests
//
// Test Coverage:
// 1. Push happy path (outbox drained, checkpoint advanced)
// 2. Rejected outbox rows stay pending with the recorded reason
// 3. Pull conflict on equal timestamps (checkpoint still advances)
// 4. Idempotent replay of a page after a crash
// 5. Pagination limits and has_more reporting
// 6. Transport failures, backoff, and the manual bypass

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::db::models::ConflictType;
use crate::db::{checkpoint, outbox, Database};
use crate::protocol::{ChangeOperation, ChangeRecord, EntityType, PullRequest, PushRequest};
use crate::provider::config::RuntimePreset;
use crate::sync::apply::{apply_incoming_change, ApplyOutcome};
use crate::sync::runner::{CycleOptions, SyncRunner};
use crate::sync::transport::SyncTransport;
use crate::{Error, Result};

/// Scripted transport step: a canned frame or a network failure.
enum Step {
    Frame(Value),
    Offline,
}

/// Transport that replays scripted responses and records every request.
#[derive(Default)]
struct ScriptedTransport {
    push_script: Mutex<VecDeque<Step>>,
    pull_script: Mutex<VecDeque<Step>>,
    push_requests: Mutex<Vec<PushRequest>>,
    pull_requests: Mutex<Vec<PullRequest>>,
}

impl ScriptedTransport {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn script_push(&self, step: Step) {
        self.push_script.lock().unwrap().push_back(step);
    }

    fn script_pull(&self, step: Step) {
        self.pull_script.lock().unwrap().push_back(step);
    }

    fn pushes(&self) -> Vec<PushRequest> {
        self.push_requests.lock().unwrap().clone()
    }

    fn pulls(&self) -> Vec<PullRequest> {
        self.pull_requests.lock().unwrap().clone()
    }
}

fn empty_push_response(cursor: &str) -> Value {
    json!({
        "accepted": [],
        "rejected": [],
        "server_cursor": cursor,
        "server_time": "2026-02-17T02:00:00Z"
    })
}

fn empty_pull_response(cursor: &str) -> Value {
    json!({
        "server_cursor": cursor,
        "server_time": "2026-02-17T02:00:00Z",
        "changes": [],
        "has_more": false
    })
}

#[async_trait]
impl SyncTransport for ScriptedTransport {
    async fn push(&self, request: &PushRequest, _deadline: Duration) -> Result<Value> {
        self.push_requests.lock().unwrap().push(request.clone());
        match self.push_script.lock().unwrap().pop_front() {
            Some(Step::Frame(frame)) => Ok(frame),
            Some(Step::Offline) => Err(Error::Network("connection refused".to_string())),
            None => Ok(empty_push_response("c-push")),
        }
    }

    async fn pull(&self, request: &PullRequest, _deadline: Duration) -> Result<Value> {
        self.pull_requests.lock().unwrap().push(request.clone());
        match self.pull_script.lock().unwrap().pop_front() {
            Some(Step::Frame(frame)) => Ok(frame),
            Some(Step::Offline) => Err(Error::Network("connection refused".to_string())),
            None => Ok(empty_pull_response("c-pull")),
        }
    }
}

async fn test_runner(db: &Database, transport: Arc<ScriptedTransport>) -> SyncRunner {
    SyncRunner::new(db.clone(), transport, RuntimePreset::desktop())
}

fn manual() -> CycleOptions {
    CycleOptions {
        manual: true,
        ..CycleOptions::default()
    }
}

fn task_change(entity_id: &str, device: &str, updated_at: &str, payload: Value) -> Value {
    json!({
        "entity_type": "TASK",
        "entity_id": entity_id,
        "operation": "UPSERT",
        "updated_at": updated_at,
        "updated_by_device": device,
        "sync_version": 1,
        "payload": payload,
        "idempotency_key": format!("{}:{}", device, entity_id)
    })
}

mod push_stage {
    use super::*;
    use crate::db::tasks::{create_task, TaskDraft};

    #[tokio::test]
    async fn test_push_happy_path_drains_outbox_and_advances_checkpoint() {
        let db = crate::db::test_db().await;
        let transport = ScriptedTransport::new();

        create_task(
            &db.pool,
            &db.device_id,
            TaskDraft {
                title: "Ship it".to_string(),
                ..TaskDraft::default()
            },
        )
        .await
        .unwrap();

        let pending = outbox::list_pending(&db.pool, 10).await.unwrap();
        let key = pending[0].idempotency_key.clone();

        transport.script_push(Step::Frame(json!({
            "accepted": [key],
            "rejected": [],
            "server_cursor": "c1",
            "server_time": "2026-02-17T02:00:00Z"
        })));
        transport.script_pull(Step::Frame(empty_pull_response("c2")));

        let runner = test_runner(&db, transport.clone()).await;
        let summary = runner.run_cycle(manual()).await.unwrap().unwrap();

        assert_eq!(summary.checkpoint_before, None);
        assert_eq!(summary.removed_outbox_changes, 1);
        assert_eq!(summary.failed_outbox_changes, 0);
        assert!(outbox::list_pending(&db.pool, 10).await.unwrap().is_empty());

        // Push advanced to c1, the pull page then to c2
        assert_eq!(summary.checkpoint_after.as_deref(), Some("c2"));
        let cp = checkpoint::get_checkpoint(&db.pool).await.unwrap();
        assert_eq!(cp.last_sync_cursor.as_deref(), Some("c2"));

        // The request carried our device and the wire schema
        let pushes = transport.pushes();
        assert_eq!(pushes.len(), 1);
        assert_eq!(pushes[0].device_id, db.device_id);
        assert_eq!(pushes[0].schema_version, 1);
        assert_eq!(pushes[0].base_cursor, None);
        assert_eq!(pushes[0].changes.len(), 1);
    }

    #[tokio::test]
    async fn test_rejected_rows_stay_pending_with_reason() {
        let db = crate::db::test_db().await;
        let transport = ScriptedTransport::new();

        create_task(
            &db.pool,
            &db.device_id,
            TaskDraft {
                title: "Refused".to_string(),
                ..TaskDraft::default()
            },
        )
        .await
        .unwrap();

        let pending = outbox::list_pending(&db.pool, 10).await.unwrap();
        let key = pending[0].idempotency_key.clone();

        transport.script_push(Step::Frame(json!({
            "accepted": [],
            "rejected": [
                {"idempotency_key": key, "reason": "CONFLICT", "message": "newer on server"}
            ],
            "server_cursor": "c1",
            "server_time": "2026-02-17T02:00:00Z"
        })));

        let runner = test_runner(&db, transport).await;
        let summary = runner
            .run_cycle(CycleOptions {
                skip_pull: true,
                manual: true,
            })
            .await
            .unwrap()
            .unwrap();

        assert_eq!(summary.removed_outbox_changes, 0);
        assert_eq!(summary.failed_outbox_changes, 1);

        let pending = outbox::list_pending(&db.pool, 10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].attempts, 1);
        assert_eq!(
            pending[0].last_error.as_deref(),
            Some("[CONFLICT] newer on server")
        );
    }

    #[tokio::test]
    async fn test_empty_outbox_skips_push_entirely() {
        let db = crate::db::test_db().await;
        let transport = ScriptedTransport::new();
        transport.script_pull(Step::Frame(empty_pull_response("c1")));

        let runner = test_runner(&db, transport.clone()).await;
        runner.run_cycle(manual()).await.unwrap().unwrap();

        assert!(transport.pushes().is_empty());
        assert_eq!(transport.pulls().len(), 1);
    }
}

mod pull_stage {
    use super::*;
    use crate::db::tasks::get_task;

    #[tokio::test]
    async fn test_pull_applies_changes_and_filters_self() {
        let db = crate::db::test_db().await;
        let transport = ScriptedTransport::new();

        transport.script_pull(Step::Frame(json!({
            "server_cursor": "c1",
            "server_time": "2026-02-17T02:00:00Z",
            "changes": [
                task_change("t1", "dev-b", "2026-02-17T01:00:00Z", json!({"title": "theirs"})),
                task_change("mine", &db.device_id, "2026-02-17T01:00:00Z", json!({"title": "loopback"})),
            ],
            "has_more": false
        })));

        let runner = test_runner(&db, transport).await;
        let summary = runner.run_cycle(manual()).await.unwrap().unwrap();

        assert_eq!(summary.pull.applied, 1);
        assert_eq!(summary.pull.skipped_self, 1);
        assert!(get_task(&db.pool, "t1").await.unwrap().is_some());
        assert!(get_task(&db.pool, "mine").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_equal_timestamp_notes_conflict_still_advances_checkpoint() {
        let db = crate::db::test_db().await;
        let transport = ScriptedTransport::new();

        // Local copy of t2 authored elsewhere at T with local notes
        let seed = ChangeRecord {
            entity_type: EntityType::Task,
            entity_id: "t2".to_string(),
            operation: ChangeOperation::Upsert,
            updated_at: crate::protocol::codec::coerce_timestamp("2026-02-17T10:00:00Z"),
            updated_by_device: "dev-a".to_string(),
            sync_version: 1,
            payload: Some(json!({"title": "Notes doc", "notes_markdown": "local"})),
            idempotency_key: "dev-a:t2".to_string(),
        };
        assert_eq!(
            apply_incoming_change(&db.pool, &db.device_id, &seed)
                .await
                .unwrap(),
            ApplyOutcome::Applied
        );

        // Concurrent remote edit from dev-B at the same instant
        transport.script_pull(Step::Frame(json!({
            "server_cursor": "c7",
            "server_time": "2026-02-17T11:00:00Z",
            "changes": [
                task_change("t2", "dev-b", "2026-02-17T10:00:00Z",
                            json!({"title": "Notes doc", "notes_markdown": "remote"})),
            ],
            "has_more": false
        })));

        let runner = test_runner(&db, transport).await;
        let summary = runner.run_cycle(manual()).await.unwrap().unwrap();

        assert_eq!(summary.pull.conflicts, 1);
        assert_eq!(summary.pull.applied, 0);

        let conflicts = crate::db::conflicts::list_conflicts(&db.pool, None)
            .await
            .unwrap();
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].conflict_type, ConflictType::NotesCollision);
        assert_eq!(conflicts[0].reason_code, "NOTES_CONCURRENT_EDIT");

        // The conflict does not hold the cursor back
        let cp = checkpoint::get_checkpoint(&db.pool).await.unwrap();
        assert_eq!(cp.last_sync_cursor.as_deref(), Some("c7"));
    }

    #[tokio::test]
    async fn test_page_replay_after_crash_is_idempotent() {
        let db = crate::db::test_db().await;

        let page = json!({
            "server_cursor": "c3",
            "server_time": "2026-02-17T02:00:00Z",
            "changes": [
                task_change("c1", "dev-b", "2026-02-17T01:00:00Z", json!({"title": "one"})),
                task_change("c2", "dev-b", "2026-02-17T01:00:01Z", json!({"title": "two"})),
                task_change("c3", "dev-b", "2026-02-17T01:00:02Z", json!({"title": "three"})),
            ],
            "has_more": false
        });

        // First delivery: the process dies after applying the page but
        // before the checkpoint advance.
        let parsed = crate::protocol::codec::parse_pull_response(&page).unwrap();
        for change in &parsed.changes {
            apply_incoming_change(&db.pool, &db.device_id, change)
                .await
                .unwrap();
        }
        let cp = checkpoint::get_checkpoint(&db.pool).await.unwrap();
        assert_eq!(cp.last_sync_cursor, None);

        // Next cycle replays the identical page
        let transport = ScriptedTransport::new();
        transport.script_pull(Step::Frame(page));

        let runner = test_runner(&db, transport).await;
        let summary = runner.run_cycle(manual()).await.unwrap().unwrap();

        assert_eq!(summary.pull.applied, 0);
        assert_eq!(summary.pull.skipped, 3);
        assert_eq!(summary.pull.conflicts, 0);

        let cp = checkpoint::get_checkpoint(&db.pool).await.unwrap();
        assert_eq!(cp.last_sync_cursor.as_deref(), Some("c3"));
    }

    #[tokio::test]
    async fn test_pagination_respects_max_pages_and_reports_residual() {
        let db = crate::db::test_db().await;
        let transport = ScriptedTransport::new();

        let preset = RuntimePreset {
            max_pull_pages: 2,
            ..RuntimePreset::desktop()
        };

        for cursor in ["p1", "p2", "p3"] {
            transport.script_pull(Step::Frame(json!({
                "server_cursor": cursor,
                "server_time": "2026-02-17T02:00:00Z",
                "changes": [],
                "has_more": true
            })));
        }

        let runner = SyncRunner::new(db.clone(), transport.clone(), preset);
        let summary = runner.run_cycle(manual()).await.unwrap().unwrap();

        // Two pages consumed, residual reported
        assert_eq!(transport.pulls().len(), 2);
        assert!(summary.pull.has_more);
        assert_eq!(summary.checkpoint_after.as_deref(), Some("p2"));

        // The second request carried the first page's cursor
        let pulls = transport.pulls();
        assert_eq!(pulls[0].cursor, None);
        assert_eq!(pulls[1].cursor.as_deref(), Some("p1"));
        assert_eq!(pulls[1].limit, 200);
    }

    #[tokio::test]
    async fn test_skip_pull_short_circuits() {
        let db = crate::db::test_db().await;
        let transport = ScriptedTransport::new();

        let runner = test_runner(&db, transport.clone()).await;
        runner
            .run_cycle(CycleOptions {
                skip_pull: true,
                manual: true,
            })
            .await
            .unwrap()
            .unwrap();

        assert!(transport.pulls().is_empty());
    }
}

mod failure_handling {
    use super::*;

    #[tokio::test]
    async fn test_transport_error_aborts_cycle_and_sets_backoff() {
        let db = crate::db::test_db().await;
        let transport = ScriptedTransport::new();
        transport.script_pull(Step::Offline);

        let runner = test_runner(&db, transport.clone()).await;
        let err = runner.run_cycle(manual()).await.unwrap_err();
        assert!(matches!(err, Error::Network(_)));

        // Backoff gate is armed; the next auto attempt is a no-op
        assert!(runner.next_attempt_at().await.is_some());
        let gated = runner.run_cycle(CycleOptions::default()).await.unwrap();
        assert!(gated.is_none());

        // A manual attempt bypasses the gate and resets the counter
        transport.script_pull(Step::Frame(empty_pull_response("c1")));
        let summary = runner.run_cycle(manual()).await.unwrap();
        assert!(summary.is_some());
        assert!(runner.next_attempt_at().await.is_none());
    }

    #[tokio::test]
    async fn test_malformed_pull_frame_fails_cycle() {
        let db = crate::db::test_db().await;
        let transport = ScriptedTransport::new();
        transport.script_pull(Step::Frame(json!({"server_time": "2026-02-17T02:00:00Z"})));

        let runner = test_runner(&db, transport).await;
        let err = runner.run_cycle(manual()).await.unwrap_err();
        assert!(err.has_code("PULL_METADATA_INVALID"));
    }

    #[tokio::test]
    async fn test_cycle_appends_one_diagnostics_snapshot() {
        let db = crate::db::test_db().await;
        let transport = ScriptedTransport::new();
        transport.script_pull(Step::Frame(empty_pull_response("c1")));

        let runner = test_runner(&db, transport).await;
        runner.run_cycle(manual()).await.unwrap().unwrap();

        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM sync_diagnostics WHERE source = 'sync_cycle'",
        )
        .fetch_one(&db.pool)
        .await
        .unwrap();
        assert_eq!(count, 1);
    }
}
