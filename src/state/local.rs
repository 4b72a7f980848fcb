//! Local file-based state storage backend.
//!
//! State lives in `.converge/state.json` next to the platform file. Writes go
//! to a temporary file that is renamed over the old one, so a crash never
//! leaves a half-written state behind.

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::error::{ConvergeError, Result, StateError};

use super::lock::{LOCK_EXPIRY_SECS, LockInfo, generate_holder_id};
use super::store::StateStore;
use super::types::PlatformState;

/// Default state directory name.
pub const STATE_DIR: &str = ".converge";

/// State file name.
const STATE_FILE: &str = "state.json";

/// Lock file name.
const LOCK_FILE: &str = "state.lock";

/// Local file-based state store.
#[derive(Debug)]
pub struct LocalStateStore {
    base_dir: PathBuf,
    state_path: PathBuf,
    lock_path: PathBuf,
}

impl LocalStateStore {
    /// Creates a store in `.converge` under the current directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the current directory cannot be determined.
    pub fn new() -> Result<Self> {
        let base_dir = std::env::current_dir()
            .map_err(|e| ConvergeError::internal(format!("Cannot determine current directory: {e}")))?
            .join(STATE_DIR);

        Ok(Self::with_base_dir(base_dir))
    }

    /// Creates a store in a custom directory.
    #[must_use]
    pub fn with_base_dir(base_dir: impl Into<PathBuf>) -> Self {
        let base_dir = base_dir.into();
        Self {
            state_path: base_dir.join(STATE_FILE),
            lock_path: base_dir.join(LOCK_FILE),
            base_dir,
        }
    }

    /// Creates a store from a state file path; the lock sits next to it.
    #[must_use]
    pub fn with_state_path(state_path: impl Into<PathBuf>) -> Self {
        let state_path = state_path.into();
        let base_dir = state_path
            .parent()
            .map_or_else(|| PathBuf::from("."), Path::to_path_buf);
        Self {
            lock_path: base_dir.join(LOCK_FILE),
            base_dir,
            state_path,
        }
    }

    /// Returns the state file path.
    #[must_use]
    pub fn state_path(&self) -> &Path {
        &self.state_path
    }

    async fn ensure_dir(&self) -> Result<()> {
        if !self.base_dir.exists() {
            debug!("Creating state directory: {}", self.base_dir.display());
            fs::create_dir_all(&self.base_dir).await.map_err(|e| {
                StateError::storage(format!("Failed to create state directory: {e}"))
            })?;
        }
        Ok(())
    }

    async fn read_json<T: DeserializeOwned>(path: &Path, what: &str) -> Result<Option<T>> {
        if !path.exists() {
            return Ok(None);
        }

        let content = fs::read_to_string(path).await.map_err(|e| StateError::Corrupted {
            message: format!("Failed to read {what} file: {e}"),
        })?;
        let value = serde_json::from_str(&content).map_err(|e| StateError::Corrupted {
            message: format!("Failed to parse {what} file: {e}"),
        })?;
        Ok(Some(value))
    }

    async fn write_json<T: Serialize + Sync>(&self, path: &Path, value: &T, what: &str) -> Result<()> {
        self.ensure_dir().await?;

        let content = serde_json::to_string_pretty(value)
            .map_err(|e| StateError::serialization(format!("Failed to serialize {what}: {e}")))?;

        let temp_path = path.with_extension("tmp");
        let mut file = fs::File::create(&temp_path).await.map_err(|e| {
            StateError::storage(format!("Failed to create temp {what} file: {e}"))
        })?;
        file.write_all(content.as_bytes())
            .await
            .map_err(|e| StateError::storage(format!("Failed to write {what} file: {e}")))?;
        file.sync_all()
            .await
            .map_err(|e| StateError::storage(format!("Failed to sync {what} file: {e}")))?;

        fs::rename(&temp_path, path)
            .await
            .map_err(|e| StateError::storage(format!("Failed to rename {what} file: {e}")))?;
        Ok(())
    }

    async fn delete_lock_file(&self) -> Result<()> {
        if self.lock_path.exists() {
            fs::remove_file(&self.lock_path).await.map_err(|e| StateError::LockFailed {
                message: format!("Failed to delete lock file: {e}"),
            })?;
        }
        Ok(())
    }
}

#[async_trait]
impl StateStore for LocalStateStore {
    async fn load(&self) -> Result<Option<PlatformState>> {
        let Some(state) = Self::read_json::<PlatformState>(&self.state_path, "state").await? else {
            debug!("State file does not exist: {}", self.state_path.display());
            return Ok(None);
        };
        state.check_version()?;
        info!("Loaded state from: {}", self.state_path.display());
        Ok(Some(state))
    }

    async fn save(&self, state: &PlatformState) -> Result<()> {
        info!("Saving state to: {}", self.state_path.display());
        self.write_json(&self.state_path, state, "state").await?;
        debug!("State saved successfully");
        Ok(())
    }

    async fn delete(&self) -> Result<()> {
        if self.state_path.exists() {
            info!("Deleting state file: {}", self.state_path.display());
            fs::remove_file(&self.state_path)
                .await
                .map_err(|e| StateError::storage(format!("Failed to delete state file: {e}")))?;
        }
        self.delete_lock_file().await
    }

    async fn exists(&self) -> Result<bool> {
        Ok(self.state_path.exists())
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
        self.write_json(&self.lock_path, &lock_info, "lock")
            .await
            .map_err(|e| StateError::LockFailed { message: e.to_string() })?;

        info!(
            "Acquired state lock {} for {purpose} (expires in {LOCK_EXPIRY_SECS}s)",
            lock_info.lock_id
        );
        Ok(lock_info)
    }

    async fn release_lock(&self, lock_id: &str) -> Result<()> {
        if let Some(existing) = self.get_lock_info().await? {
            if existing.lock_id == lock_id {
                self.delete_lock_file().await?;
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
            self.delete_lock_file().await?;
        }
        Ok(existing)
    }

    async fn get_lock_info(&self) -> Result<Option<LockInfo>> {
        Self::read_json(&self.lock_path, "lock").await
    }

    fn backend_type(&self) -> &'static str {
        "local"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{Environment, EnvironmentRecord};
    use tempfile::TempDir;

    fn create_test_store() -> (LocalStateStore, TempDir) {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let store = LocalStateStore::with_base_dir(temp_dir.path().join(STATE_DIR));
        (store, temp_dir)
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let (store, _temp) = create_test_store();

        let mut state = PlatformState::new("eks-platform");
        state.set_environments(vec![EnvironmentRecord {
            environment: Environment::new("dev", "eu-west-1", "111", 0),
            ledger: crate::planner::AppliedLedger::new(),
        }]);
        store.save(&state).await.expect("Failed to save state");

        let loaded = store
            .load()
            .await
            .expect("Failed to load state")
            .expect("State should exist");

        assert_eq!(loaded.project, "eks-platform");
        assert_eq!(loaded.environments, state.environments);
        assert!(!store.state_path().with_extension("tmp").exists());
    }

    #[tokio::test]
    async fn test_load_nonexistent() {
        let (store, _temp) = create_test_store();
        assert!(store.load().await.expect("Load should not fail").is_none());
        assert!(!store.exists().await.unwrap());
    }

    #[tokio::test]
    async fn test_corrupted_state() {
        let (store, _temp) = create_test_store();
        store.ensure_dir().await.unwrap();
        fs::write(store.state_path(), "{ not json").await.unwrap();

        let err = store.load().await.unwrap_err();
        assert!(matches!(err, ConvergeError::State(StateError::Corrupted { .. })));
    }

    #[tokio::test]
    async fn test_lock_acquire_release() {
        let (store, _temp) = create_test_store();

        let lock = store.acquire_lock("ci", "promote").await.expect("Failed to acquire lock");
        assert!(store.is_locked().await.unwrap());
        assert_eq!(store.get_lock_info().await.unwrap().unwrap().purpose, "promote");

        store.release_lock("someone-else").await.unwrap();
        assert!(store.is_locked().await.unwrap());

        store.release_lock(&lock.lock_id).await.unwrap();
        assert!(!store.is_locked().await.unwrap());
    }

    #[tokio::test]
    async fn test_lock_conflict_and_force_unlock() {
        let (store, _temp) = create_test_store();
        store.acquire_lock("holder-1", "apply").await.unwrap();

        let err = store.acquire_lock("holder-2", "promote").await.unwrap_err();
        assert!(matches!(
            err,
            ConvergeError::State(StateError::LockedByOther { ref holder, ref purpose, .. })
                if holder == "holder-1" && purpose == "apply"
        ));

        let removed = store.force_unlock().await.unwrap();
        assert_eq!(removed.unwrap().holder, "holder-1");
        store.acquire_lock("holder-2", "promote").await.unwrap();
    }
}
