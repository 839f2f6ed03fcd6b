//! Directory-backed [`RemoteStore`].
//!
//! Keys map to files under a root directory. The local sandbox runtime mounts
//! the same directory, so blobs written here are visible to shell commands in
//! the sandbox and vice versa.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{ListOptions, ListPage, ObjectInfo, RemoteStore, StoredObject, validate_key};
use crate::error::StoreError;

const TEMP_PREFIX: &str = ".moltkeeper-";

pub struct FsStore {
    root: PathBuf,
    /// Content types recorded by `put` on this instance.
    content_types: RwLock<HashMap<String, String>>,
}

impl FsStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            content_types: RwLock::new(HashMap::new()),
        }
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, StoreError> {
        validate_key(key)?;
        Ok(self.root.join(key))
    }

    async fn content_type_for(&self, key: &str) -> Option<String> {
        if let Some(ct) = self.content_types.read().await.get(key) {
            return Some(ct.clone());
        }
        guess_content_type(key).map(str::to_string)
    }

    /// All keys under the root, sorted.
    async fn walk(&self) -> Result<Vec<(String, std::fs::Metadata)>, StoreError> {
        let mut found = Vec::new();
        let mut pending = vec![self.root.clone()];
        while let Some(dir) = pending.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            while let Some(entry) = entries.next_entry().await? {
                let meta = entry.metadata().await?;
                let path = entry.path();
                if meta.is_dir() {
                    pending.push(path);
                    continue;
                }
                if entry.file_name().to_string_lossy().starts_with(TEMP_PREFIX) {
                    continue;
                }
                if let Some(key) = key_for(&self.root, &path) {
                    found.push((key, meta));
                }
            }
        }
        found.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(found)
    }
}

#[async_trait]
impl RemoteStore for FsStore {
    async fn get(&self, key: &str) -> Result<Option<StoredObject>, StoreError> {
        let path = self.path_for(key)?;
        let body = match tokio::fs::read(&path).await {
            Ok(body) => body,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let uploaded = tokio::fs::metadata(&path)
            .await
            .ok()
            .and_then(|m| m.modified().ok())
            .map(DateTime::<Utc>::from);
        Ok(Some(StoredObject {
            key: key.to_string(),
            body: Bytes::from(body),
            content_type: self.content_type_for(key).await,
            uploaded,
        }))
    }

    async fn put(&self, key: &str, body: Bytes, content_type: &str) -> Result<(), StoreError> {
        let path = self.path_for(key)?;
        let parent = path.parent().unwrap_or(&self.root).to_path_buf();
        tokio::fs::create_dir_all(&parent).await?;

        // Write then rename, so readers never see a partial blob.
        let tmp = parent.join(format!("{TEMP_PREFIX}{}.tmp", Uuid::new_v4().simple()));
        tokio::fs::write(&tmp, &body).await?;
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }

        self.content_types
            .write()
            .await
            .insert(key.to_string(), content_type.to_string());
        tracing::debug!(key, content_type, size = body.len(), "Stored object");
        Ok(())
    }

    async fn delete(&self, keys: &[String]) -> Result<(), StoreError> {
        for key in keys {
            let path = self.path_for(key)?;
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
            self.content_types.write().await.remove(key);
        }
        Ok(())
    }

    async fn list(&self, options: ListOptions) -> Result<ListPage, StoreError> {
        let limit = options.effective_limit();
        let prefix = options.prefix.as_deref().unwrap_or("");
        let cursor = options.cursor.as_deref();

        let mut matching = self
            .walk()
            .await?
            .into_iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .filter(|(key, _)| cursor.is_none_or(|c| key.as_str() > c));

        let objects: Vec<ObjectInfo> = matching
            .by_ref()
            .take(limit)
            .map(|(key, meta)| ObjectInfo {
                key,
                size: meta.len(),
                uploaded: meta.modified().ok().map(DateTime::<Utc>::from),
            })
            .collect();
        let truncated = matching.next().is_some();
        let cursor = if truncated {
            objects.last().map(|o| o.key.clone())
        } else {
            None
        };

        Ok(ListPage {
            objects,
            truncated,
            cursor,
        })
    }
}

fn key_for(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let parts: Vec<String> = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    Some(parts.join("/"))
}

fn guess_content_type(key: &str) -> Option<&'static str> {
    mime_guess::from_path(key).first_raw()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn store() -> (tempfile::TempDir, FsStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = FsStore::new(dir.path());
        (dir, store)
    }

    #[tokio::test]
    async fn test_get_missing_is_none() {
        let (_dir, store) = store();
        assert!(store.get("nope.json").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_put_creates_nested_key() {
        let (dir, store) = store();
        store
            .put(
                "workspace-core/config/ai-env.json",
                Bytes::from_static(b"{}"),
                "application/json",
            )
            .await
            .unwrap();
        assert!(dir.path().join("workspace-core/config/ai-env.json").is_file());

        let obj = store
            .get("workspace-core/config/ai-env.json")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(obj.text(), "{}");
        assert_eq!(obj.content_type.as_deref(), Some("application/json"));
        assert!(obj.uploaded.is_some());
    }

    #[tokio::test]
    async fn test_put_rejects_escaping_key() {
        let (_dir, store) = store();
        let err = store
            .put("../escape", Bytes::from_static(b"x"), "text/plain")
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidKey { .. }));
    }

    #[tokio::test]
    async fn test_delete_ignores_missing() {
        let (_dir, store) = store();
        store
            .put("a.txt", Bytes::from_static(b"a"), "text/plain")
            .await
            .unwrap();
        store
            .delete(&["a.txt".to_string(), "b.txt".to_string()])
            .await
            .unwrap();
        assert!(store.get("a.txt").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_list_prefix_and_cursor() {
        let (_dir, store) = store();
        for key in ["skills/a.md", "skills/b.md", "skills/c.md", "clawdbot/clawdbot.json"] {
            store
                .put(key, Bytes::from_static(b"x"), "text/plain")
                .await
                .unwrap();
        }

        let page = store
            .list(ListOptions {
                prefix: Some("skills/".to_string()),
                cursor: None,
                limit: Some(2),
            })
            .await
            .unwrap();
        let keys: Vec<_> = page.objects.iter().map(|o| o.key.as_str()).collect();
        assert_eq!(keys, vec!["skills/a.md", "skills/b.md"]);
        assert!(page.truncated);
        assert_eq!(page.cursor.as_deref(), Some("skills/b.md"));

        let page = store
            .list(ListOptions {
                prefix: Some("skills/".to_string()),
                cursor: page.cursor,
                limit: Some(2),
            })
            .await
            .unwrap();
        let keys: Vec<_> = page.objects.iter().map(|o| o.key.as_str()).collect();
        assert_eq!(keys, vec!["skills/c.md"]);
        assert!(!page.truncated);
        assert!(page.cursor.is_none());
    }

    #[tokio::test]
    async fn test_list_missing_root_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsStore::new(dir.path().join("absent"));
        let page = store.list(ListOptions::default()).await.unwrap();
        assert!(page.objects.is_empty());
    }

    #[test]
    fn test_guess_content_type() {
        assert_eq!(guess_content_type("a/b.json"), Some("application/json"));
        assert_eq!(guess_content_type(".last-sync"), None);
    }
}
