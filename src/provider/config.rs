// provider/config.rs - Provider config sanitization and runtime profiles

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sqlx::SqlitePool;

use crate::db::settings_keys;
use crate::provider::session::SessionAuthStore;
use crate::Result;

/// Fields that must never reach the settings table.
const SENSITIVE_KEYS: [&str; 3] = ["access_token", "refresh_token", "client_secret"];

/// Non-sensitive managed_auth fields that survive persistence.
const RETAINED_AUTH_KEYS: [&str; 5] = [
    "token_type",
    "token_refresh_url",
    "expires_at",
    "scope",
    "client_id",
];

/// Where sensitive auth material may be held for a provider.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TokenStoragePolicy {
    DesktopSecureKeystore,
    MobileSecureKeystore,
    BrowserSecureKeystore,
    DesktopSessionOnly,
    MobileSessionOnly,
    BrowserSessionOnly,
}

/// Host platform derived from the user-agent heuristic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    Desktop,
    Mobile,
    Browser,
}

/// Facts about the embedding host used for policy classification.
#[derive(Debug, Clone)]
pub struct HostEnvironment {
    /// A native shell is present (not a plain browser tab).
    pub native_host: bool,
    /// The OS keystore is reachable from this host.
    pub keystore_available: bool,
    pub user_agent: String,
}

/// Mobile user agents per the classic substring heuristic.
pub fn detect_platform(native_host: bool, user_agent: &str) -> Platform {
    if !native_host {
        return Platform::Browser;
    }
    let mobile_markers = ["Android", "iPhone", "iPad", "iPod"];
    if mobile_markers.iter().any(|m| user_agent.contains(m)) {
        Platform::Mobile
    } else {
        Platform::Desktop
    }
}

/// Choose the storage policy for sensitive auth material: the OS keystore
/// when a native host exposes one, session-only memory otherwise.
pub fn classify_storage_policy(env: &HostEnvironment) -> TokenStoragePolicy {
    let platform = detect_platform(env.native_host, &env.user_agent);
    let secure = env.native_host && env.keystore_available;

    match (platform, secure) {
        (Platform::Desktop, true) => TokenStoragePolicy::DesktopSecureKeystore,
        (Platform::Desktop, false) => TokenStoragePolicy::DesktopSessionOnly,
        (Platform::Mobile, true) => TokenStoragePolicy::MobileSecureKeystore,
        (Platform::Mobile, false) => TokenStoragePolicy::MobileSessionOnly,
        (Platform::Browser, true) => TokenStoragePolicy::BrowserSecureKeystore,
        (Platform::Browser, false) => TokenStoragePolicy::BrowserSessionOnly,
    }
}

/// Split a provider config into its persistable part and the sensitive
/// fields that stay in process memory.
///
/// Strips {access_token, refresh_token, client_secret} from the top level
/// and from nested `managed_auth`; inside `managed_auth` only the known
/// non-sensitive fields are retained.
pub fn sanitize_provider_config(config: &Value) -> (Value, Map<String, Value>) {
    let mut sensitive = Map::new();

    let root = match config.as_object() {
        Some(root) => root.clone(),
        None => return (Value::Object(Map::new()), sensitive),
    };

    let mut persisted = Map::new();
    for (key, value) in root {
        if SENSITIVE_KEYS.contains(&key.as_str()) {
            sensitive.insert(key, value);
            continue;
        }

        if key == "managed_auth" {
            let mut retained = Map::new();
            if let Some(auth) = value.as_object() {
                for (auth_key, auth_value) in auth {
                    if SENSITIVE_KEYS.contains(&auth_key.as_str()) {
                        sensitive.insert(auth_key.clone(), auth_value.clone());
                    } else if RETAINED_AUTH_KEYS.contains(&auth_key.as_str()) {
                        retained.insert(auth_key.clone(), auth_value.clone());
                    }
                }
            }
            persisted.insert(key, Value::Object(retained));
            continue;
        }

        persisted.insert(key, value);
    }

    (Value::Object(persisted), sensitive)
}

/// Sanitize and persist a provider config; sensitive fields go to the
/// session store only.
pub async fn persist_provider_config(
    pool: &SqlitePool,
    session: &SessionAuthStore,
    provider: &str,
    config: &Value,
) -> Result<Value> {
    let (persisted, sensitive) = sanitize_provider_config(config);

    crate::db::set_meta_setting(pool, settings_keys::PROVIDER, provider).await?;
    crate::db::set_meta_setting(
        pool,
        settings_keys::PROVIDER_CONFIG,
        &persisted.to_string(),
    )
    .await?;
    session.merge(provider, sensitive).await;

    tracing::debug!("Persisted sanitized provider config for {}", provider);

    Ok(persisted)
}

/// Load the provider config, hydrating session-held sensitive fields back
/// into `managed_auth` for connector consumption.
pub async fn load_provider_config(
    pool: &SqlitePool,
    session: &SessionAuthStore,
) -> Result<(String, Value)> {
    let provider = crate::db::get_setting(pool, settings_keys::PROVIDER)
        .await?
        .unwrap_or_else(|| "provider_neutral".to_string());

    let mut config: Value = crate::db::get_setting(pool, settings_keys::PROVIDER_CONFIG)
        .await?
        .and_then(|raw| serde_json::from_str(&raw).ok())
        .unwrap_or_else(|| Value::Object(Map::new()));

    if !config.is_object() {
        config = Value::Object(Map::new());
    }

    if let Some(sensitive) = session.get(&provider).await {
        if let Some(root) = config.as_object_mut() {
            let auth = root
                .entry("managed_auth")
                .or_insert_with(|| Value::Object(Map::new()));
            if let Some(auth) = auth.as_object_mut() {
                for (key, value) in sensitive {
                    auth.insert(key, value);
                }
            }
        }
    }

    Ok((provider, config))
}

// ============================================================================
// Runtime profiles
// ============================================================================

/// Sync cadence and paging preset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimePreset {
    pub auto_interval_secs: u64,
    pub background_interval_secs: u64,
    pub push_limit: i64,
    pub pull_limit: i64,
    pub max_pull_pages: u32,
}

impl RuntimePreset {
    pub fn desktop() -> Self {
        Self {
            auto_interval_secs: 60,
            background_interval_secs: 300,
            push_limit: 200,
            pull_limit: 200,
            max_pull_pages: 5,
        }
    }

    pub fn mobile() -> Self {
        Self {
            auto_interval_secs: 120,
            background_interval_secs: 600,
            push_limit: 120,
            pull_limit: 120,
            max_pull_pages: 3,
        }
    }
}

/// Persisted runtime profile preference.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeProfile {
    Desktop,
    MobileBeta,
    Custom,
}

impl RuntimeProfile {
    fn as_str(&self) -> &'static str {
        match self {
            RuntimeProfile::Desktop => "desktop",
            RuntimeProfile::MobileBeta => "mobile_beta",
            RuntimeProfile::Custom => "custom",
        }
    }

    fn parse(value: &str) -> Self {
        match value {
            "mobile_beta" => RuntimeProfile::MobileBeta,
            "custom" => RuntimeProfile::Custom,
            _ => RuntimeProfile::Desktop,
        }
    }
}

/// Resolve the effective runtime preset from the persisted profile.
///
/// `user_agent` feeds the mobile heuristic when the profile is not a user
/// override; a `custom` profile reads the user-edited preset row.
pub async fn load_runtime_preset(pool: &SqlitePool, user_agent: &str) -> Result<RuntimePreset> {
    let profile = crate::db::get_setting(pool, settings_keys::RUNTIME_PROFILE)
        .await?
        .map(|v| RuntimeProfile::parse(&v))
        .unwrap_or(RuntimeProfile::Desktop);

    let key = match profile {
        RuntimeProfile::Custom => settings_keys::RUNTIME_PRESET_CUSTOM,
        RuntimeProfile::MobileBeta => settings_keys::RUNTIME_PRESET_MOBILE,
        RuntimeProfile::Desktop => {
            match detect_platform(true, user_agent) {
                Platform::Mobile => settings_keys::RUNTIME_PRESET_MOBILE,
                _ => settings_keys::RUNTIME_PRESET_DESKTOP,
            }
        }
    };

    let preset = crate::db::get_setting(pool, key)
        .await?
        .and_then(|raw| serde_json::from_str(&raw).ok());

    Ok(preset.unwrap_or_else(|| {
        if key == settings_keys::RUNTIME_PRESET_MOBILE {
            RuntimePreset::mobile()
        } else {
            RuntimePreset::desktop()
        }
    }))
}

/// Apply a user override: the preset is stored under the custom key and the
/// profile flips to `custom`.
pub async fn set_runtime_override(pool: &SqlitePool, preset: &RuntimePreset) -> Result<()> {
    crate::db::set_meta_setting(
        pool,
        settings_keys::RUNTIME_PRESET_CUSTOM,
        &serde_json::to_string(preset)?,
    )
    .await?;
    crate::db::set_meta_setting(
        pool,
        settings_keys::RUNTIME_PROFILE,
        RuntimeProfile::Custom.as_str(),
    )
    .await?;

    Ok(())
}
