//! Key-value persistence for promptstack.
//!
//! Keys are slash-free path segments such as `["project", "prj_01h..."]`.
//! Values are JSON documents. Two backends are provided:
//!
//! - [`JsonStorage`]: one `.json` file per key under a base directory
//! - [`MemoryStorage`]: a process-local map, used in tests and `--dry-run`
//!
//! [`Storage`] is object-safe so it can be shared as `Arc<dyn Storage>`;
//! the typed helpers live on [`StorageExt`].

mod error;
mod json;
mod memory;

pub use error::{StorageError, StorageResult};
pub use json::{default_storage, JsonStorage};
pub use memory::MemoryStorage;

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;

/// Raw JSON key-value store.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn read_raw(&self, key: &[&str]) -> StorageResult<Option<Value>>;

    async fn write_raw(&self, key: &[&str], value: Value) -> StorageResult<()>;

    /// Remove a key. Removing a missing key is not an error.
    async fn remove(&self, key: &[&str]) -> StorageResult<()>;

    /// Immediate children of `prefix` that hold a value, as full keys.
    async fn list(&self, prefix: &[&str]) -> StorageResult<Vec<Vec<String>>>;

    /// Names of the segments directly under `prefix` that have keys
    /// nested beneath them, sorted.
    async fn list_groups(&self, prefix: &[&str]) -> StorageResult<Vec<String>>;

    async fn exists(&self, key: &[&str]) -> StorageResult<bool> {
        Ok(self.read_raw(key).await?.is_some())
    }
}

/// Typed access on top of any [`Storage`].
#[async_trait]
pub trait StorageExt: Storage {
    async fn read<T: DeserializeOwned + Send>(&self, key: &[&str]) -> StorageResult<Option<T>> {
        match self.read_raw(key).await? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    async fn write<T: Serialize + Send + Sync>(&self, key: &[&str], value: &T) -> StorageResult<()> {
        let value = serde_json::to_value(value)?;
        self.write_raw(key, value).await
    }

    /// Read-modify-write. Missing keys start from `T::default()`.
    async fn update<T, F>(&self, key: &[&str], editor: F) -> StorageResult<T>
    where
        T: DeserializeOwned + Serialize + Send + Sync + Default,
        F: FnOnce(&mut T) + Send,
    {
        let mut value: T = self.read(key).await?.unwrap_or_default();
        editor(&mut value);
        self.write(key, &value).await?;
        Ok(value)
    }

    /// Read every value directly under `prefix`, skipping keys removed
    /// between the listing and the read.
    async fn read_all<T: DeserializeOwned + Send>(&self, prefix: &[&str]) -> StorageResult<Vec<T>> {
        let mut out = Vec::new();
        for key in self.list(prefix).await? {
            let parts: Vec<&str> = key.iter().map(String::as_str).collect();
            if let Some(value) = self.read(&parts).await? {
                out.push(value);
            }
        }
        Ok(out)
    }
}

impl<S: Storage + ?Sized> StorageExt for S {}

/// Reject empty keys and segments that could escape the base directory.
pub(crate) fn validate_key(key: &[&str]) -> StorageResult<()> {
    if key.is_empty() {
        return Err(StorageError::invalid_key("key cannot be empty"));
    }
    for segment in key {
        if segment.is_empty()
            || segment.contains('/')
            || segment.contains('\\')
            || *segment == "."
            || *segment == ".."
        {
            return Err(StorageError::invalid_key(format!(
                "invalid key segment: {segment:?}"
            )));
        }
    }
    Ok(())
}
