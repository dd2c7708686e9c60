// protocol/mod.rs - Sync wire protocol: types and codec

pub mod codec;
pub mod types;

pub use codec::{
    build_pull_request, build_push_request, clamp_pull_limit, create_idempotency_key,
    parse_api_error, parse_pull_response, parse_push_request, parse_push_response,
};
pub use types::{
    ChangeOperation, ChangeRecord, EntityType, PullRequest, PullResponse, PushRequest,
    PushResponse, RejectedChange, SyncApiError, SyncApiErrorCode, SCHEMA_VERSION,
};
