//! File-backed storage.
//!
//! `["pool", "nextjs", "sbx_01h..."]` maps to `<base>/pool/nextjs/sbx_01h....json`.

use crate::{validate_key, Storage, StorageError, StorageResult};
use async_trait::async_trait;
use serde_json::Value;
use std::path::PathBuf;
use tokio::fs;
use tracing::debug;

/// One pretty-printed JSON file per key. Writes go through a temp file and
/// a rename so readers never observe a partial document.
#[derive(Debug, Clone)]
pub struct JsonStorage {
    base_path: PathBuf,
}

impl JsonStorage {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    pub fn base_path(&self) -> &std::path::Path {
        &self.base_path
    }

    fn key_to_path(&self, key: &[&str]) -> StorageResult<PathBuf> {
        validate_key(key)?;
        let mut path = self.base_path.clone();
        let (last, dirs) = key
            .split_last()
            .ok_or_else(|| StorageError::invalid_key("key cannot be empty"))?;
        for segment in dirs {
            path.push(segment);
        }
        path.push(format!("{last}.json"));
        Ok(path)
    }

    fn prefix_to_dir(&self, prefix: &[&str]) -> PathBuf {
        let mut path = self.base_path.clone();
        path.extend(prefix);
        path
    }
}

#[async_trait]
impl Storage for JsonStorage {
    async fn read_raw(&self, key: &[&str]) -> StorageResult<Option<Value>> {
        let path = self.key_to_path(key)?;
        debug!(path = %path.display(), "Reading from storage");

        match fs::read_to_string(&path).await {
            Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_raw(&self, key: &[&str], value: Value) -> StorageResult<()> {
        let path = self.key_to_path(key)?;
        debug!(path = %path.display(), "Writing to storage");

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let content = serde_json::to_string_pretty(&value)?;
        let temp_path = path.with_extension("json.tmp");
        fs::write(&temp_path, &content).await?;
        fs::rename(&temp_path, &path).await?;
        Ok(())
    }

    async fn remove(&self, key: &[&str]) -> StorageResult<()> {
        let path = self.key_to_path(key)?;
        debug!(path = %path.display(), "Removing from storage");

        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self, prefix: &[&str]) -> StorageResult<Vec<Vec<String>>> {
        let dir = self.prefix_to_dir(prefix);
        let mut results = Vec::new();

        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(results),
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    let mut key: Vec<String> = prefix.iter().map(|s| s.to_string()).collect();
                    key.push(stem.to_string());
                    results.push(key);
                }
            }
        }
        results.sort();
        Ok(results)
    }

    async fn list_groups(&self, prefix: &[&str]) -> StorageResult<Vec<String>> {
        let dir = self.prefix_to_dir(prefix);
        let mut groups = Vec::new();

        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(groups),
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                if let Some(name) = entry.file_name().to_str() {
                    groups.push(name.to_string());
                }
            }
        }
        groups.sort();
        Ok(groups)
    }

    async fn exists(&self, key: &[&str]) -> StorageResult<bool> {
        let path = self.key_to_path(key)?;
        Ok(fs::try_exists(&path).await?)
    }
}

/// Storage under `<data_local_dir>/promptstack/data`.
pub fn default_storage() -> Option<JsonStorage> {
    dirs::data_local_dir().map(|p| JsonStorage::new(p.join("promptstack").join("data")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::StorageExt;
    use serde::{Deserialize, Serialize};
    use tempfile::tempdir;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Pooled {
        sandbox_id: String,
        volume: String,
    }

    fn pooled(n: u32) -> Pooled {
        Pooled {
            sandbox_id: format!("sbx_{n}"),
            volume: format!("vol_{n}"),
        }
    }

    #[tokio::test]
    async fn test_write_and_read_back() {
        let dir = tempdir().unwrap();
        let storage = JsonStorage::new(dir.path());

        storage.write(&["pool", "nextjs", "sbx_1"], &pooled(1)).await.unwrap();
        assert!(dir.path().join("pool/nextjs/sbx_1.json").exists());

        let read: Option<Pooled> = storage.read(&["pool", "nextjs", "sbx_1"]).await.unwrap();
        assert_eq!(read, Some(pooled(1)));
    }

    #[tokio::test]
    async fn test_missing_key_reads_none() {
        let dir = tempdir().unwrap();
        let storage = JsonStorage::new(dir.path());
        let read: Option<Pooled> = storage.read(&["pool", "nextjs", "nope"]).await.unwrap();
        assert!(read.is_none());
        storage.remove(&["pool", "nextjs", "nope"]).await.unwrap();
    }

    #[tokio::test]
    async fn test_list_sorted_and_survives_reopen() {
        let dir = tempdir().unwrap();
        {
            let storage = JsonStorage::new(dir.path());
            for n in [3, 1, 2] {
                let id = format!("sbx_{n}");
                storage
                    .write(&["pool", "nextjs", id.as_str()], &pooled(n))
                    .await
                    .unwrap();
            }
        }
        let reopened = JsonStorage::new(dir.path());
        let keys = reopened.list(&["pool", "nextjs"]).await.unwrap();
        let names: Vec<&str> = keys.iter().map(|k| k[2].as_str()).collect();
        assert_eq!(names, vec!["sbx_1", "sbx_2", "sbx_3"]);

        let all: Vec<Pooled> = reopened.read_all(&["pool", "nextjs"]).await.unwrap();
        assert_eq!(all.len(), 3);
    }

    #[tokio::test]
    async fn test_list_groups_reports_subdirectories() {
        let dir = tempdir().unwrap();
        let storage = JsonStorage::new(dir.path());
        storage.write(&["pool", "retired", "sbx_1"], &pooled(1)).await.unwrap();
        storage.write(&["pool", "nextjs", "sbx_2"], &pooled(2)).await.unwrap();
        assert_eq!(
            storage.list_groups(&["pool"]).await.unwrap(),
            vec!["nextjs".to_string(), "retired".to_string()]
        );
        assert!(storage.list_groups(&["chat"]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_list_missing_dir_is_empty() {
        let dir = tempdir().unwrap();
        let storage = JsonStorage::new(dir.path());
        assert!(storage.list(&["chat"]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_ids_with_dots_keep_full_name() {
        let dir = tempdir().unwrap();
        let storage = JsonStorage::new(dir.path());
        storage.write(&["stack", "next.js"], &1).await.unwrap();
        assert!(dir.path().join("stack/next.js.json").exists());
    }

    #[tokio::test]
    async fn test_invalid_keys_rejected() {
        let dir = tempdir().unwrap();
        let storage = JsonStorage::new(dir.path());
        assert!(storage.write(&[], &1).await.is_err());
        assert!(storage.write(&["..", "etc"], &1).await.is_err());
        assert!(storage.write(&["a/b"], &1).await.is_err());
    }
}
