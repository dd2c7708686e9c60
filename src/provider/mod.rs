// provider/mod.rs - Provider configuration and managed connector auth

pub mod config;
pub mod connector;
pub mod session;

pub use config::{
    classify_storage_policy, detect_platform, load_provider_config, load_runtime_preset,
    persist_provider_config, sanitize_provider_config, HostEnvironment, Platform, RuntimePreset,
    RuntimeProfile, TokenStoragePolicy,
};
pub use connector::{ConnectorErrorCode, ManagedAuth, ManagedConnector};
pub use session::SessionAuthStore;
