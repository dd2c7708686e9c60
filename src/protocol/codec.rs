// protocol/codec.rs - Deterministic push/pull frame construction and strict parsing

use chrono::{DateTime, NaiveDateTime, Utc};
use serde_json::{json, Value};

use crate::{Error, Result};

use super::types::{
    ChangeOperation, ChangeRecord, EntityType, PullRequest, PullResponse, PushRequest,
    PushResponse, RejectedChange, SyncApiError, SyncApiErrorCode, SCHEMA_VERSION,
};

/// Default pull page size when the caller does not specify one.
pub const DEFAULT_PULL_LIMIT: i64 = 200;

/// Hard cap on a single pull page.
pub const MAX_PULL_LIMIT: i64 = 500;

/// Build a push request frame from normalized local changes.
///
/// Fails when `device_id` is empty. Each change is normalized (sync_version
/// clamped to >= 1, payload forced to NULL for DELETE and defaulted to `{}`
/// for UPSERT) and the batch is sorted deterministically by
/// (updated_at, entity rank, idempotency_key).
pub fn build_push_request(
    device_id: &str,
    base_cursor: Option<&str>,
    changes: Vec<ChangeRecord>,
) -> Result<PushRequest> {
    let device_id = device_id.trim();
    if device_id.is_empty() {
        return Err(Error::Validation(
            "PUSH_DEVICE_ID_REQUIRED: device_id must not be empty".to_string(),
        ));
    }

    let mut changes: Vec<ChangeRecord> = changes.into_iter().map(normalize_change).collect();
    changes.sort_by_key(|c| c.sort_key());

    Ok(PushRequest {
        schema_version: SCHEMA_VERSION,
        device_id: device_id.to_string(),
        base_cursor: base_cursor.map(|c| c.to_string()),
        changes,
    })
}

/// Build a pull request frame. The page limit is clamped to [1, 500] and
/// defaults to 200 when absent or non-positive.
pub fn build_pull_request(
    device_id: &str,
    cursor: Option<&str>,
    limit: Option<i64>,
) -> Result<PullRequest> {
    let device_id = device_id.trim();
    if device_id.is_empty() {
        return Err(Error::Validation(
            "PULL_DEVICE_ID_REQUIRED: device_id must not be empty".to_string(),
        ));
    }

    Ok(PullRequest {
        schema_version: SCHEMA_VERSION,
        device_id: device_id.to_string(),
        cursor: cursor.map(|c| c.to_string()),
        limit: clamp_pull_limit(limit.unwrap_or(DEFAULT_PULL_LIMIT)),
    })
}

/// Clamp a requested pull page size to the protocol bounds.
///
/// Non-positive values fall back to the default page size rather than the
/// minimum: a caller passing 0 or -1 asked for "no preference", not "one".
pub fn clamp_pull_limit(limit: i64) -> i64 {
    if limit < 1 {
        DEFAULT_PULL_LIMIT
    } else {
        limit.min(MAX_PULL_LIMIT)
    }
}

/// Derive the deterministic idempotency key for a local change:
/// `lowercase(trim(device_id)) + ":" + lowercase(trim(change_id))`.
pub fn create_idempotency_key(device_id: &str, change_id: &str) -> Result<String> {
    let device_id = device_id.trim();
    let change_id = change_id.trim();
    if device_id.is_empty() {
        return Err(Error::Validation(
            "IDEMPOTENCY_DEVICE_ID_REQUIRED: device_id must not be empty".to_string(),
        ));
    }
    if change_id.is_empty() {
        return Err(Error::Validation(
            "IDEMPOTENCY_CHANGE_ID_REQUIRED: change_id must not be empty".to_string(),
        ));
    }
    Ok(format!(
        "{}:{}",
        device_id.to_lowercase(),
        change_id.to_lowercase()
    ))
}

/// Parse a push response frame.
///
/// Strict on the envelope (root object, non-empty server_cursor and
/// server_time), lenient on list entries: malformed accepted keys or
/// rejected records are dropped silently.
pub fn parse_push_response(payload: &Value) -> Result<PushResponse> {
    let root = payload.as_object().ok_or_else(|| {
        Error::protocol("PUSH_RESPONSE_INVALID", "response root must be an object")
    })?;

    check_schema_version(root)?;

    let server_cursor = require_metadata_string(root, "server_cursor", "PUSH_METADATA_INVALID")?;
    let server_time = require_metadata_string(root, "server_time", "PUSH_METADATA_INVALID")?;

    let accepted = root
        .get("accepted")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_str())
                .filter(|s| !s.is_empty())
                .map(|s| s.to_string())
                .collect()
        })
        .unwrap_or_default();

    let rejected = root
        .get("rejected")
        .and_then(Value::as_array)
        .map(|items| items.iter().filter_map(parse_rejected).collect())
        .unwrap_or_default();

    Ok(PushResponse {
        accepted,
        rejected,
        server_cursor,
        server_time,
    })
}

/// Parse a pull response frame (one page).
pub fn parse_pull_response(payload: &Value) -> Result<PullResponse> {
    let root = payload.as_object().ok_or_else(|| {
        Error::protocol("PULL_RESPONSE_INVALID", "response root must be an object")
    })?;

    check_schema_version(root)?;

    let server_cursor = require_metadata_string(root, "server_cursor", "PULL_METADATA_INVALID")?;
    let server_time = require_metadata_string(root, "server_time", "PULL_METADATA_INVALID")?;

    let changes = root
        .get("changes")
        .and_then(Value::as_array)
        .map(|items| items.iter().filter_map(parse_change).collect())
        .unwrap_or_default();

    let has_more = root.get("has_more").and_then(Value::as_bool).unwrap_or(false);

    Ok(PullResponse {
        server_cursor,
        server_time,
        changes,
        has_more,
    })
}

/// Parse a push request frame (the server-facing side of the codec; the
/// client uses it to verify round-trips).
pub fn parse_push_request(payload: &Value) -> Result<PushRequest> {
    let root = payload.as_object().ok_or_else(|| {
        Error::protocol("PUSH_REQUEST_INVALID", "request root must be an object")
    })?;

    check_schema_version(root)?;

    let device_id = root
        .get("device_id")
        .and_then(Value::as_str)
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| Error::protocol("PUSH_REQUEST_INVALID", "device_id is required"))?
        .to_string();

    let base_cursor = root
        .get("base_cursor")
        .and_then(Value::as_str)
        .map(|s| s.to_string());

    let changes = root
        .get("changes")
        .and_then(Value::as_array)
        .map(|items| items.iter().filter_map(parse_change).collect())
        .unwrap_or_default();

    Ok(PushRequest {
        schema_version: SCHEMA_VERSION,
        device_id,
        base_cursor,
        changes,
    })
}

/// Parse an API error envelope into the closed taxonomy.
///
/// Unknown or missing codes map to INTERNAL_ERROR; retry_after_ms is coerced
/// to a non-negative integer or None.
pub fn parse_api_error(payload: &Value) -> SyncApiError {
    let root = match payload.as_object() {
        Some(root) => root,
        None => {
            return SyncApiError {
                code: SyncApiErrorCode::InternalError,
                message: "malformed error envelope".to_string(),
                retry_after_ms: None,
                details: None,
            }
        }
    };

    let code = root
        .get("code")
        .and_then(Value::as_str)
        .and_then(SyncApiErrorCode::parse)
        .unwrap_or(SyncApiErrorCode::InternalError);

    let message = root
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or("unknown error")
        .to_string();

    let retry_after_ms = root
        .get("retry_after_ms")
        .and_then(Value::as_i64)
        .filter(|ms| *ms >= 0);

    let details = root
        .get("details")
        .filter(|v| v.is_object())
        .cloned();

    SyncApiError {
        code,
        message,
        retry_after_ms,
        details,
    }
}

/// Coerce a timestamp value to UTC. Accepts RFC 3339 and a bare
/// `YYYY-MM-DDTHH:MM:SS[.fff]` form; anything else falls back to the epoch.
pub fn coerce_timestamp(value: &str) -> DateTime<Utc> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(value) {
        return parsed.with_timezone(&Utc);
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f") {
        return naive.and_utc();
    }
    DateTime::<Utc>::from_timestamp(0, 0).unwrap_or_default()
}

/// Normalize one change for the wire: sync_version >= 1, DELETE carries no
/// payload, UPSERT always carries an object.
fn normalize_change(mut change: ChangeRecord) -> ChangeRecord {
    change.sync_version = change.sync_version.max(1);
    change.payload = match change.operation {
        ChangeOperation::Delete => None,
        ChangeOperation::Upsert => match change.payload {
            Some(value) if value.is_object() => Some(value),
            _ => Some(json!({})),
        },
    };
    change
}

/// Parse one change entry; malformed entries return None and are dropped.
fn parse_change(value: &Value) -> Option<ChangeRecord> {
    let obj = value.as_object()?;

    let entity_type = EntityType::parse(obj.get("entity_type")?.as_str()?)?;
    let operation = ChangeOperation::parse(obj.get("operation")?.as_str()?)?;

    let entity_id = obj
        .get("entity_id")
        .and_then(Value::as_str)
        .filter(|s| !s.trim().is_empty())?
        .to_string();

    let idempotency_key = obj
        .get("idempotency_key")
        .and_then(Value::as_str)
        .filter(|s| !s.trim().is_empty())?
        .to_string();

    let updated_at = obj
        .get("updated_at")
        .and_then(Value::as_str)
        .map(coerce_timestamp)
        .unwrap_or_else(|| DateTime::<Utc>::from_timestamp(0, 0).unwrap_or_default());

    let updated_by_device = obj
        .get("updated_by_device")
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string();

    let sync_version = obj
        .get("sync_version")
        .and_then(Value::as_i64)
        .unwrap_or(1)
        .max(1);

    let payload = match operation {
        ChangeOperation::Delete => None,
        ChangeOperation::Upsert => Some(
            obj.get("payload")
                .filter(|v| v.is_object())
                .cloned()
                .unwrap_or_else(|| json!({})),
        ),
    };

    Some(ChangeRecord {
        entity_type,
        entity_id,
        operation,
        updated_at,
        updated_by_device,
        sync_version,
        payload,
        idempotency_key,
    })
}

fn parse_rejected(value: &Value) -> Option<RejectedChange> {
    let obj = value.as_object()?;
    let idempotency_key = obj
        .get("idempotency_key")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())?
        .to_string();

    Some(RejectedChange {
        idempotency_key,
        reason: obj
            .get("reason")
            .and_then(Value::as_str)
            .unwrap_or("UNKNOWN")
            .to_string(),
        message: obj
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string(),
    })
}

fn check_schema_version(root: &serde_json::Map<String, Value>) -> Result<()> {
    if let Some(version) = root.get("schema_version").and_then(Value::as_i64) {
        if version != SCHEMA_VERSION {
            return Err(Error::protocol(
                "SCHEMA_MISMATCH",
                format!("expected schema_version {}, got {}", SCHEMA_VERSION, version),
            ));
        }
    }
    Ok(())
}

fn require_metadata_string(
    root: &serde_json::Map<String, Value>,
    field: &str,
    code: &str,
) -> Result<String> {
    root.get(field)
        .and_then(Value::as_str)
        .filter(|s| !s.trim().is_empty())
        .map(|s| s.to_string())
        .ok_or_else(|| {
            Error::protocol(code, format!("{} must be a non-empty string", field))
        })
}
