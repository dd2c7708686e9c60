// db/models.rs - Entity models and status enums

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Project lifecycle status.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[sqlx(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProjectStatus {
    Active,
    Completed,
    Archived,
}

/// Task lifecycle status.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[sqlx(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Todo,
    Doing,
    Done,
    Archived,
}

/// Task priority.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[sqlx(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskPriority {
    Urgent,
    Normal,
    Low,
}

/// Task recurrence period. NONE unless due_at is set.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[sqlx(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Recurrence {
    None,
    Daily,
    Weekly,
    Monthly,
}

impl Recurrence {
    /// Shift a timestamp forward by one period. Identity for NONE.
    pub fn shift(&self, at: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            Recurrence::None => at,
            Recurrence::Daily => at + chrono::Duration::days(1),
            Recurrence::Weekly => at + chrono::Duration::weeks(1),
            Recurrence::Monthly => at
                .checked_add_months(chrono::Months::new(1))
                .unwrap_or(at),
        }
    }
}

/// Project entity
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Project {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub color: Option<String>,
    pub status: ProjectStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub sync_version: i64,
    pub updated_by_device: String,
}

/// Task entity
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Task {
    pub id: String,
    pub title: String,
    pub description: Option<String>,
    pub notes_markdown: Option<String>,
    pub project_id: Option<String>,
    pub status: TaskStatus,
    pub priority: TaskPriority,
    pub is_important: bool,
    pub due_at: Option<DateTime<Utc>>,
    pub remind_at: Option<DateTime<Utc>>,
    pub recurrence: Recurrence,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub sync_version: i64,
    pub updated_by_device: String,
}

/// Subtask attached to a task (cascade-deleted with it).
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct TaskSubtask {
    pub id: String,
    pub task_id: String,
    pub title: String,
    pub is_done: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub sync_version: i64,
    pub updated_by_device: String,
}

/// Reusable task template.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct TaskTemplate {
    pub id: String,
    pub name: String,
    pub title_template: String,
    pub description: Option<String>,
    pub priority: TaskPriority,
    pub is_important: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub sync_version: i64,
    pub updated_by_device: String,
}

/// Recorded work session, optionally attached to a task.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct SessionRecord {
    pub id: String,
    pub task_id: Option<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub sync_version: i64,
    pub updated_by_device: String,
}

/// User-facing key/value setting row.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct AppSetting {
    pub key: String,
    pub value: String,
    pub updated_at: DateTime<Utc>,
    pub sync_version: i64,
    pub updated_by_device: String,
}

/// Task changelog action.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[sqlx(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChangelogAction {
    Created,
    Updated,
    StatusChanged,
}

/// One row of task history.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct TaskChangelog {
    pub id: i64,
    pub task_id: String,
    pub action: ChangelogAction,
    pub field_name: Option<String>,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Soft-deletion tombstone. Distinguishes "never existed" from "deleted on
/// device X at time T"; removed when the entity is re-upserted.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct DeletedRecord {
    pub entity_type: String,
    pub entity_id: String,
    pub deleted_at: DateTime<Utc>,
    pub deleted_by_device: String,
}

/// Durable outbox row awaiting server acknowledgment.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct OutboxChange {
    pub id: i64,
    pub entity_type: String,
    pub entity_id: String,
    pub operation: String,
    pub payload_json: Option<String>,
    pub idempotency_key: String,
    pub attempts: i64,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Singleton sync checkpoint (row id = 1).
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Checkpoint {
    pub last_sync_cursor: Option<String>,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

/// Conflict taxonomy.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum ConflictType {
    FieldConflict,
    DeleteVsUpdate,
    NotesCollision,
    ValidationError,
}

/// Conflict record lifecycle status.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum ConflictStatus {
    Open,
    Resolved,
    Ignored,
}

/// How a conflict was (or will be) resolved.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum ResolutionStrategy {
    KeepLocal,
    KeepRemote,
    ManualMerge,
    Retry,
}

/// Persisted conflict record.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ConflictRecord {
    pub id: i64,
    pub incoming_idempotency_key: String,
    pub entity_type: String,
    pub entity_id: String,
    pub operation: String,
    pub conflict_type: ConflictType,
    pub reason_code: String,
    pub message: String,
    pub local_payload_json: Option<String>,
    pub remote_payload_json: Option<String>,
    pub base_payload_json: Option<String>,
    pub status: ConflictStatus,
    pub resolution_strategy: Option<ResolutionStrategy>,
    pub resolution_payload_json: Option<String>,
    pub resolved_by_device: Option<String>,
    pub detected_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Conflict audit event type.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum ConflictEventType {
    Detected,
    Resolved,
    Ignored,
    Retried,
    Exported,
}

/// Conflict audit trail entry.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ConflictEvent {
    pub id: i64,
    pub conflict_id: i64,
    pub event_type: ConflictEventType,
    pub event_payload_json: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// One diagnostics snapshot captured after a sync cycle.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct DiagnosticsSnapshot {
    pub id: i64,
    pub source: String,
    pub captured_at: DateTime<Utc>,
    pub payload_json: String,
}
