//! Local persistence of small JSON records.
//!
//! Values are opaque strings keyed by name. Typed access goes through
//! [`StoreExt`], which (de)serializes with `serde_json`.

mod file;
mod memory;
mod records;

pub use file::JsonFileStore;
pub use memory::MemoryStore;
pub use records::{DoseStatus, HistoryEntry, Medicine};

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

/// Sequence of [`Medicine`] records.
pub const MEDICINES_KEY: &str = "medicines";
/// Sequence of [`HistoryEntry`] records, newest first.
pub const HISTORY_KEY: &str = "history";
/// Opaque user profile.
pub const USER_DATA_KEY: &str = "userData";
/// Session flag set after login.
pub const LOGGED_IN_KEY: &str = "isLoggedIn";
/// Numeric id of the logged-in user.
pub const UID_KEY: &str = "uid";

/// Errors that can occur in a store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("invalid key: {0:?}")]
    InvalidKey(String),
    #[error("storage i/o failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("record {key} is not valid json: {source}")]
    Json {
        key: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Keyed string storage.
pub trait Store: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;

    fn remove(&self, key: &str) -> Result<(), StoreError>;
}

/// Typed helpers over any [`Store`].
pub trait StoreExt: Store {
    /// Reads and deserializes a record.
    fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StoreError> {
        self.get(key)?
            .map(|raw| {
                serde_json::from_str(&raw).map_err(|source| StoreError::Json {
                    key: key.to_string(),
                    source,
                })
            })
            .transpose()
    }

    /// Serializes and writes a record.
    fn set_json<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<(), StoreError> {
        let raw = serde_json::to_string(value).map_err(|source| StoreError::Json {
            key: key.to_string(),
            source,
        })?;
        self.set(key, &raw)
    }

    /// All stored medicines; empty if none were saved yet.
    fn medicines(&self) -> Result<Vec<Medicine>, StoreError> {
        Ok(self.get_json(MEDICINES_KEY)?.unwrap_or_default())
    }

    /// Looks up one medicine by id.
    fn find_medicine(&self, id: &str) -> Result<Option<Medicine>, StoreError> {
        Ok(self.medicines()?.into_iter().find(|m| m.id == id))
    }

    /// Dose history, newest first.
    fn history(&self) -> Result<Vec<HistoryEntry>, StoreError> {
        Ok(self.get_json(HISTORY_KEY)?.unwrap_or_default())
    }

    /// Raw subject id as stored at login.
    fn subject_id(&self) -> Result<Option<String>, StoreError> {
        Ok(self
            .get(UID_KEY)?
            .map(|raw| raw.trim().trim_matches('"').to_string())
            .filter(|uid| !uid.is_empty()))
    }
}

impl<S: Store + ?Sized> StoreExt for S {}

pub(crate) fn validate_key(key: &str) -> Result<(), StoreError> {
    let valid = !key.is_empty()
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidKey(key.to_string()))
    }
}
