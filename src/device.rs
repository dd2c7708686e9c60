// device.rs - Stable per-install device identity

use sqlx::SqlitePool;
use uuid::Uuid;

use crate::db::{self, settings_keys};
use crate::Result;

/// Load the device id, generating and persisting one on first use.
///
/// The id is stamped onto every local mutation and used to derive
/// idempotency keys, so it must never change once issued.
pub async fn ensure_device_id(pool: &SqlitePool) -> Result<String> {
    if let Some(existing) = db::get_setting(pool, settings_keys::DEVICE_ID).await? {
        if !existing.trim().is_empty() {
            return Ok(existing);
        }
    }

    let device_id = generate_device_id();
    db::set_meta_setting(pool, settings_keys::DEVICE_ID, &device_id).await?;

    tracing::info!("Generated device id {}", device_id);

    Ok(device_id)
}

/// `<hostname-slug>-<uuid8>`, lowercase, safe for idempotency keys.
fn generate_device_id() -> String {
    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "device".to_string());

    let slug: String = host
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect::<String>()
        .trim_matches('-')
        .chars()
        .take(24)
        .collect();

    let slug = if slug.is_empty() {
        "device".to_string()
    } else {
        slug
    };

    let suffix = Uuid::new_v4().simple().to_string();
    format!("{}-{}", slug, &suffix[..8])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_device_id_is_stable_across_reads() {
        let pool = crate::db::test_pool().await;

        let first = ensure_device_id(&pool).await.unwrap();
        let second = ensure_device_id(&pool).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(first, first.to_lowercase());
        assert!(!first.contains(':'));
    }
}
