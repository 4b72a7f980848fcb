//! S3-based state storage backend.
//!
//! Shares the platform state between operators and CI. The lock is an
//! advisory object next to the state; S3 offers no compare-and-swap here, so
//! two processes racing for an unlocked state can both win.

use async_trait::async_trait;
use aws_sdk_s3::Client;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};

use crate::error::{Result, StateError};

use super::lock::{LOCK_EXPIRY_SECS, LockInfo, generate_holder_id};
use super::store::StateStore;
use super::types::PlatformState;

/// State file key suffix.
const STATE_KEY: &str = "state.json";

/// Lock file key suffix.
const LOCK_KEY: &str = "state.lock";

/// S3-based state store.
#[derive(Debug)]
pub struct S3StateStore {
    client: Client,
    bucket: String,
    prefix: String,
}

fn normalize_prefix(prefix: Option<&str>) -> String {
    prefix
        .map(|p| p.trim_matches('/'))
        .filter(|p| !p.is_empty())
        .map(|p| format!("{p}/"))
        .unwrap_or_default()
}

impl S3StateStore {
    /// Creates a store using the ambient AWS configuration.
    pub async fn new(bucket: &str, prefix: Option<&str>, region: Option<&str>) -> Self {
        let config = if let Some(region) = region {
            aws_config::from_env()
                .region(aws_config::Region::new(region.to_string()))
                .load()
                .await
        } else {
            aws_config::load_from_env().await
        };

        Self::with_client(Client::new(&config), bucket, prefix)
    }

    /// Creates a store with an existing client.
    #[must_use]
    pub fn with_client(client: Client, bucket: &str, prefix: Option<&str>) -> Self {
        Self {
            client,
            bucket: bucket.to_string(),
            prefix: normalize_prefix(prefix),
        }
    }

    fn key(&self, file: &str) -> String {
        format!("{}{file}", self.prefix)
    }

    async fn get_object(&self, key: &str) -> Result<Option<String>> {
        let result = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await;

        match result {
            Ok(response) => {
                let bytes = response
                    .body
                    .collect()
                    .await
                    .map_err(|e| StateError::storage(format!("Failed to read S3 object: {e}")))?;

                let content = String::from_utf8(bytes.to_vec()).map_err(|e| StateError::Corrupted {
                    message: format!("Invalid UTF-8 in S3 object: {e}"),
                })?;

                Ok(Some(content))
            }
            Err(sdk_err) => {
                let service_err = sdk_err.into_service_error();
                if service_err.is_no_such_key() {
                    Ok(None)
                } else {
                    Err(StateError::storage(format!("S3 get error: {service_err}")).into())
                }
            }
        }
    }

    async fn get_json<T: DeserializeOwned>(&self, key: &str, what: &str) -> Result<Option<T>> {
        let Some(content) = self.get_object(key).await? else {
            return Ok(None);
        };
        let value = serde_json::from_str(&content).map_err(|e| StateError::Corrupted {
            message: format!("Failed to parse {what}: {e}"),
        })?;
        Ok(Some(value))
    }

    async fn put_json<T: Serialize + Sync>(&self, key: &str, value: &T, what: &str) -> Result<()> {
        let content = serde_json::to_string_pretty(value)
            .map_err(|e| StateError::serialization(format!("Failed to serialize {what}: {e}")))?;

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(content.into_bytes().into())
            .content_type("application/json")
            .send()
            .await
            .map_err(|e| StateError::storage(format!("S3 put error: {e}")))?;

        Ok(())
    }

    async fn delete_object(&self, key: &str) -> Result<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| StateError::storage(format!("S3 delete error: {e}")))?;

        Ok(())
    }
}

#[async_trait]
impl StateStore for S3StateStore {
    async fn load(&self) -> Result<Option<PlatformState>> {
        let key = self.key(STATE_KEY);
        debug!("Loading state from s3://{}/{key}", self.bucket);

        let Some(state) = self.get_json::<PlatformState>(&key, "state").await? else {
            debug!("No state found in S3");
            return Ok(None);
        };
        state.check_version()?;
        info!("Loaded state for project {}", state.project);
        Ok(Some(state))
    }

    async fn save(&self, state: &PlatformState) -> Result<()> {
        let key = self.key(STATE_KEY);
        info!("Saving state to s3://{}/{key}", self.bucket);
        self.put_json(&key, state, "state").await
    }

    async fn delete(&self) -> Result<()> {
        let state_key = self.key(STATE_KEY);
        info!("Deleting state from s3://{}/{state_key}", self.bucket);

        self.delete_object(&state_key).await?;
        self.delete_object(&self.key(LOCK_KEY)).await
    }

    async fn exists(&self) -> Result<bool> {
        let result = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(self.key(STATE_KEY))
            .send()
            .await;

        match result {
            Ok(_) => Ok(true),
            Err(sdk_err) => {
                let service_err = sdk_err.into_service_error();
                if service_err.is_not_found() {
                    Ok(false)
                } else {
                    Err(StateError::storage(format!("S3 head error: {service_err}")).into())
                }
            }
        }
    }

    async fn acquire_lock(&self, holder: &str, purpose: &str) -> Result<LockInfo> {
        if let Some(existing) = self.get_lock_info().await? {
            if !existing.is_expired() {
                return Err(StateError::LockedByOther {
                    holder: existing.holder,
                    purpose: existing.purpose,
                    since: existing.acquired_at.to_rfc3339(),
                }
                .into());
            }
            warn!("Taking over expired lock held by {}", existing.holder);
        }

        let holder_id = if holder.is_empty() {
            generate_holder_id()
        } else {
            holder.to_string()
        };

        let lock_info = LockInfo::new(&holder_id, purpose);
        self.put_json(&self.key(LOCK_KEY), &lock_info, "lock").await?;

        info!(
            "Acquired state lock {} for {purpose} (expires in {LOCK_EXPIRY_SECS}s)",
            lock_info.lock_id
        );
        Ok(lock_info)
    }

    async fn release_lock(&self, lock_id: &str) -> Result<()> {
        if let Some(existing) = self.get_lock_info().await? {
            if existing.lock_id == lock_id {
                self.delete_object(&self.key(LOCK_KEY)).await?;
                info!("Released state lock: {lock_id}");
            } else {
                debug!("Lock ID mismatch: expected {lock_id}, found {}", existing.lock_id);
            }
        }
        Ok(())
    }

    async fn force_unlock(&self) -> Result<Option<LockInfo>> {
        let existing = self.get_lock_info().await?;
        if let Some(lock) = &existing {
            warn!("Force-releasing lock held by {}", lock.holder);
            self.delete_object(&self.key(LOCK_KEY)).await?;
        }
        Ok(existing)
    }

    async fn get_lock_info(&self) -> Result<Option<LockInfo>> {
        self.get_json(&self.key(LOCK_KEY), "lock").await
    }

    fn backend_type(&self) -> &'static str {
        "s3"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix_normalization() {
        assert_eq!(normalize_prefix(None), "");
        assert_eq!(normalize_prefix(Some("/")), "");
        assert_eq!(normalize_prefix(Some("/platform/prod/")), "platform/prod/");
        assert_eq!(normalize_prefix(Some("converge")), "converge/");
    }
}
