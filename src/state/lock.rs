//! Advisory state lock.
//!
//! Mutating commands take the lock before loading state and release it after
//! saving, so two operators never promote or apply over each other. A lock
//! left behind by a crashed process expires on its own.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lock expiry duration in seconds.
pub const LOCK_EXPIRY_SECS: i64 = 300;

/// Information about a state lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockInfo {
    /// Unique lock identifier.
    pub lock_id: String,
    /// Who holds the lock.
    pub holder: String,
    /// What the holder is doing, e.g. `promote`.
    #[serde(default)]
    pub purpose: String,
    /// When the lock was acquired.
    pub acquired_at: DateTime<Utc>,
    /// When the lock expires.
    pub expires_at: DateTime<Utc>,
}

impl LockInfo {
    /// Creates a lock that expires after the default duration.
    #[must_use]
    pub fn new(holder: &str, purpose: &str) -> Self {
        Self::with_ttl(holder, purpose, chrono::Duration::seconds(LOCK_EXPIRY_SECS))
    }

    /// Creates a lock with a custom time to live.
    #[must_use]
    pub fn with_ttl(holder: &str, purpose: &str, ttl: chrono::Duration) -> Self {
        let now = Utc::now();
        Self {
            lock_id: Uuid::new_v4().to_string(),
            holder: holder.to_string(),
            purpose: purpose.to_string(),
            acquired_at: now,
            expires_at: now + ttl,
        }
    }

    /// Checks if the lock has expired.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        Utc::now() > self.expires_at
    }

    /// Pushes the expiry back by the default duration.
    pub fn refresh(&mut self) {
        self.expires_at = Utc::now() + chrono::Duration::seconds(LOCK_EXPIRY_SECS);
    }

    /// Returns the remaining time until expiry in seconds.
    #[must_use]
    pub fn remaining_secs(&self) -> i64 {
        let remaining = self.expires_at - Utc::now();
        remaining.num_seconds().max(0)
    }
}

impl std::fmt::Display for LockInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} held by {} for {} since {} ({}s left)",
            self.lock_id,
            self.holder,
            if self.purpose.is_empty() { "unknown purpose" } else { &self.purpose },
            self.acquired_at.to_rfc3339(),
            self.remaining_secs()
        )
    }
}

/// Generates a unique holder identifier for the current process.
#[must_use]
pub fn generate_holder_id() -> String {
    let hostname = hostname::get().map_or_else(|_| String::from("unknown"), |h| h.to_string_lossy().to_string());

    let pid = std::process::id();
    let uuid = Uuid::new_v4().simple().to_string();

    format!("{hostname}-{pid}-{}", &uuid[..8])
}
