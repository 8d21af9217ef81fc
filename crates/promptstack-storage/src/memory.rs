//! In-memory storage backend.

use crate::{validate_key, Storage, StorageError, StorageResult};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::RwLock;

/// Process-local storage. Nothing survives a restart.
#[derive(Default)]
pub struct MemoryStorage {
    // BTreeMap so listings come back in key order, matching ULID creation order.
    data: RwLock<BTreeMap<Vec<String>, Value>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.data.read().map(|d| d.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn owned(key: &[&str]) -> Vec<String> {
    key.iter().map(|s| s.to_string()).collect()
}

fn poisoned<T>(e: std::sync::PoisonError<T>) -> StorageError {
    StorageError::LockPoisoned(e.to_string())
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn read_raw(&self, key: &[&str]) -> StorageResult<Option<Value>> {
        validate_key(key)?;
        let data = self.data.read().map_err(poisoned)?;
        Ok(data.get(&owned(key)).cloned())
    }

    async fn write_raw(&self, key: &[&str], value: Value) -> StorageResult<()> {
        validate_key(key)?;
        let mut data = self.data.write().map_err(poisoned)?;
        data.insert(owned(key), value);
        Ok(())
    }

    async fn remove(&self, key: &[&str]) -> StorageResult<()> {
        validate_key(key)?;
        let mut data = self.data.write().map_err(poisoned)?;
        data.remove(&owned(key));
        Ok(())
    }

    async fn list(&self, prefix: &[&str]) -> StorageResult<Vec<Vec<String>>> {
        let data = self.data.read().map_err(poisoned)?;
        Ok(data
            .keys()
            .filter(|k| {
                k.len() == prefix.len() + 1 && k.iter().zip(prefix).all(|(a, b)| a == b)
            })
            .cloned()
            .collect())
    }

    async fn list_groups(&self, prefix: &[&str]) -> StorageResult<Vec<String>> {
        let data = self.data.read().map_err(poisoned)?;
        let groups: BTreeSet<String> = data
            .keys()
            .filter(|k| k.len() > prefix.len() + 1 && k.iter().zip(prefix).all(|(a, b)| a == b))
            .map(|k| k[prefix.len()].clone())
            .collect();
        Ok(groups.into_iter().collect())
    }
}
