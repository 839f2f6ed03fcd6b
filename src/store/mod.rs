//! Remote blob store boundary.
//!
//! The durable backup target is a flat key/blob namespace with per-key atomic
//! writes. Multi-key updates are independent writes with no transaction.

pub mod fs;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::StoreError;

pub use fs::FsStore;

/// Default page size for [`RemoteStore::list`].
pub const LIST_LIMIT_DEFAULT: usize = 200;

/// Upper bound on a single list page.
pub const LIST_LIMIT_MAX: usize = 1000;

/// A blob fetched from the store.
#[derive(Debug, Clone)]
pub struct StoredObject {
    pub key: String,
    pub body: Bytes,
    pub content_type: Option<String>,
    pub uploaded: Option<DateTime<Utc>>,
}

impl StoredObject {
    /// Body decoded as UTF-8, lossily.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Metadata of a listed object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ObjectInfo {
    pub key: String,
    pub size: u64,
    pub uploaded: Option<DateTime<Utc>>,
}

/// Parameters for [`RemoteStore::list`].
#[derive(Debug, Clone, Default)]
pub struct ListOptions {
    pub prefix: Option<String>,
    /// Opaque continuation token from a previous page.
    pub cursor: Option<String>,
    pub limit: Option<usize>,
}

impl ListOptions {
    /// Effective limit, clamped to `1..=LIST_LIMIT_MAX`.
    pub fn effective_limit(&self) -> usize {
        match self.limit {
            Some(0) | None => LIST_LIMIT_DEFAULT,
            Some(n) => n.min(LIST_LIMIT_MAX),
        }
    }
}

/// One page of list results.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ListPage {
    pub objects: Vec<ObjectInfo>,
    pub truncated: bool,
    pub cursor: Option<String>,
}

/// Durable key/blob storage.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Fetch `key`, or `None` when absent.
    async fn get(&self, key: &str) -> Result<Option<StoredObject>, StoreError>;

    /// Write `body` at `key`, replacing any previous blob.
    async fn put(&self, key: &str, body: Bytes, content_type: &str) -> Result<(), StoreError>;

    /// Delete every key in `keys`. Absent keys are ignored.
    async fn delete(&self, keys: &[String]) -> Result<(), StoreError>;

    /// List keys in lexicographic order.
    async fn list(&self, options: ListOptions) -> Result<ListPage, StoreError>;
}

/// Reject keys that could escape the store namespace.
pub fn validate_key(key: &str) -> Result<(), StoreError> {
    let invalid = key.is_empty()
        || key.starts_with('/')
        || key.contains('\\')
        || key.split('/').any(|seg| seg.is_empty() || seg == "." || seg == "..");
    if invalid {
        return Err(StoreError::InvalidKey {
            key: key.to_string(),
        });
    }
    Ok(())
}
