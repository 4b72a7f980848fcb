//! Persistent platform state.
//!
//! Environment records, applied-operation ledgers and pipeline runs are
//! stored between invocations in a local file or an S3 bucket, guarded by an
//! advisory lock.

mod local;
mod lock;
mod s3;
mod store;
mod types;

pub use local::{LocalStateStore, STATE_DIR};
pub use lock::{LOCK_EXPIRY_SECS, LockInfo, generate_holder_id};
pub use s3::S3StateStore;
pub use store::StateStore;
pub use types::{HistoryEntry, HistoryKind, PlatformState, STATE_VERSION};
