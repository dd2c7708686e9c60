// protocol/types.rs - Wire types for the push/pull sync protocol

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Wire schema version spoken by this client.
pub const SCHEMA_VERSION: i64 = 1;

/// Entity kinds that travel over the sync protocol.
///
/// The ordering rank encodes dependency order: referents sort before
/// referrers at equal timestamps (a project must exist before a task that
/// points at it).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntityType {
    Project,
    Task,
    TaskSubtask,
    TaskTemplate,
    Setting,
}

impl EntityType {
    /// Dependency rank used as the secondary sort key for change batches.
    pub fn sort_rank(&self) -> u8 {
        match self {
            EntityType::Project => 0,
            EntityType::Task => 1,
            EntityType::TaskSubtask => 2,
            EntityType::TaskTemplate => 3,
            EntityType::Setting => 4,
        }
    }

    /// Wire identifier for this entity type.
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Project => "PROJECT",
            EntityType::Task => "TASK",
            EntityType::TaskSubtask => "TASK_SUBTASK",
            EntityType::TaskTemplate => "TASK_TEMPLATE",
            EntityType::Setting => "SETTING",
        }
    }

    /// Parse a wire identifier; None for unknown types.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "PROJECT" => Some(EntityType::Project),
            "TASK" => Some(EntityType::Task),
            "TASK_SUBTASK" => Some(EntityType::TaskSubtask),
            "TASK_TEMPLATE" => Some(EntityType::TaskTemplate),
            "SETTING" => Some(EntityType::Setting),
            _ => None,
        }
    }
}

impl std::fmt::Display for EntityType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Operation carried by a change record.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChangeOperation {
    Upsert,
    Delete,
}

impl ChangeOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeOperation::Upsert => "UPSERT",
            ChangeOperation::Delete => "DELETE",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "UPSERT" => Some(ChangeOperation::Upsert),
            "DELETE" => Some(ChangeOperation::Delete),
            _ => None,
        }
    }
}

/// A single entity change, identical in shape for push and pull.
///
/// `payload` is None exactly when `operation` is DELETE.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChangeRecord {
    pub entity_type: EntityType,
    pub entity_id: String,
    pub operation: ChangeOperation,
    pub updated_at: DateTime<Utc>,
    pub updated_by_device: String,
    pub sync_version: i64,
    pub payload: Option<serde_json::Value>,
    pub idempotency_key: String,
}

impl ChangeRecord {
    /// Deterministic sort key: (updated_at, entity rank, idempotency_key).
    pub fn sort_key(&self) -> (DateTime<Utc>, u8, String) {
        (
            self.updated_at,
            self.entity_type.sort_rank(),
            self.idempotency_key.clone(),
        )
    }
}

/// Push request frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushRequest {
    pub schema_version: i64,
    pub device_id: String,
    pub base_cursor: Option<String>,
    pub changes: Vec<ChangeRecord>,
}

/// A change the server refused to apply.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RejectedChange {
    pub idempotency_key: String,
    pub reason: String,
    pub message: String,
}

/// Push response frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushResponse {
    pub accepted: Vec<String>,
    pub rejected: Vec<RejectedChange>,
    pub server_cursor: String,
    pub server_time: String,
}

/// Pull request frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullRequest {
    pub schema_version: i64,
    pub device_id: String,
    pub cursor: Option<String>,
    pub limit: i64,
}

/// Pull response frame (one page).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullResponse {
    pub server_cursor: String,
    pub server_time: String,
    pub changes: Vec<ChangeRecord>,
    pub has_more: bool,
}

/// Closed error taxonomy spoken by the sync API.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncApiErrorCode {
    SchemaMismatch,
    Unauthorized,
    Forbidden,
    RateLimited,
    InvalidCursor,
    ValidationError,
    InternalError,
    Unavailable,
}

impl SyncApiErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncApiErrorCode::SchemaMismatch => "SCHEMA_MISMATCH",
            SyncApiErrorCode::Unauthorized => "UNAUTHORIZED",
            SyncApiErrorCode::Forbidden => "FORBIDDEN",
            SyncApiErrorCode::RateLimited => "RATE_LIMITED",
            SyncApiErrorCode::InvalidCursor => "INVALID_CURSOR",
            SyncApiErrorCode::ValidationError => "VALIDATION_ERROR",
            SyncApiErrorCode::InternalError => "INTERNAL_ERROR",
            SyncApiErrorCode::Unavailable => "UNAVAILABLE",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "SCHEMA_MISMATCH" => Some(SyncApiErrorCode::SchemaMismatch),
            "UNAUTHORIZED" => Some(SyncApiErrorCode::Unauthorized),
            "FORBIDDEN" => Some(SyncApiErrorCode::Forbidden),
            "RATE_LIMITED" => Some(SyncApiErrorCode::RateLimited),
            "INVALID_CURSOR" => Some(SyncApiErrorCode::InvalidCursor),
            "VALIDATION_ERROR" => Some(SyncApiErrorCode::ValidationError),
            "INTERNAL_ERROR" => Some(SyncApiErrorCode::InternalError),
            "UNAVAILABLE" => Some(SyncApiErrorCode::Unavailable),
            _ => None,
        }
    }
}

/// Parsed API error envelope.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SyncApiError {
    pub code: SyncApiErrorCode,
    pub message: String,
    pub retry_after_ms: Option<i64>,
    pub details: Option<serde_json::Value>,
}
