//! Key-value storage used by attribution and experiments.
//!
//! Callers go through the infallible `get`/`set`/`remove` wrappers: a backend
//! failure is logged once and degrades to "no value" instead of propagating.

use chrono::Duration;

use crate::error::StorageError;
use crate::logging::log_storage_failure;

mod cookie;
mod memory;
mod sqlite;

pub use cookie::{CookieJar, CookieOptions};
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

pub const USER_ID_KEY: &str = "sb_user_id";
pub const UTM_KEY: &str = "sb_utm";
pub const SESSION_ID_KEY: &str = "sb_session_id";
pub const EXPERIMENT_KEY_PREFIX: &str = "sb_exp_";

pub fn experiment_key(experiment_id: &str) -> String {
    format!("{}{}", EXPERIMENT_KEY_PREFIX, experiment_id)
}

pub trait KeyValueStore: Send + Sync {
    fn name(&self) -> &str;

    fn try_get(&self, key: &str) -> Result<Option<String>, StorageError>;

    /// `ttl == None` keeps the value for the lifetime of the store.
    fn try_set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StorageError>;

    fn try_remove(&self, key: &str) -> Result<(), StorageError>;

    fn get(&self, key: &str) -> Option<String> {
        match self.try_get(key) {
            Ok(v) => v,
            Err(err) => {
                log_storage_failure("get", key, &err);
                None
            }
        }
    }

    /// Returns whether the write landed.
    fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> bool {
        match self.try_set(key, value, ttl) {
            Ok(()) => true,
            Err(err) => {
                log_storage_failure("set", key, &err);
                false
            }
        }
    }

    fn remove(&self, key: &str) {
        if let Err(err) = self.try_remove(key) {
            log_storage_failure("remove", key, &err);
        }
    }
}

/// Backend that always fails, as storage does in a locked-down private window.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnavailableStore;

impl KeyValueStore for UnavailableStore {
    fn name(&self) -> &str {
        "unavailable"
    }

    fn try_get(&self, _key: &str) -> Result<Option<String>, StorageError> {
        Err(StorageError::Unavailable("storage disabled".to_string()))
    }

    fn try_set(&self, _key: &str, _value: &str, _ttl: Option<Duration>) -> Result<(), StorageError> {
        Err(StorageError::Unavailable("storage disabled".to_string()))
    }

    fn try_remove(&self, _key: &str) -> Result<(), StorageError> {
        Err(StorageError::Unavailable("storage disabled".to_string()))
    }
}
