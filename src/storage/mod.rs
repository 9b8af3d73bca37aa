// Raw-file blob storage
//
// Uploaded files are kept verbatim so they can be downloaded again. The core
// never interprets blob contents; datasets only hold an opaque handle.

use std::collections::HashMap;
use std::fmt;
use std::io;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

pub mod local;

pub use local::LocalBlobStore;

/// Opaque reference to a stored blob.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BlobHandle(String);

impl BlobHandle {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BlobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(&self, filename: &str, data: Bytes) -> io::Result<BlobHandle>;

    async fn get(&self, handle: &BlobHandle) -> io::Result<Bytes>;

    /// Removing a blob that is already gone succeeds.
    async fn delete(&self, handle: &BlobHandle) -> io::Result<()>;
}

/// Keep only characters that are safe in a single path component.
pub fn sanitize_filename(filename: &str) -> String {
    let cleaned: String = filename
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') { c } else { '_' })
        .collect();
    let cleaned = cleaned.trim_start_matches('.');
    if cleaned.is_empty() {
        "upload.csv".to_string()
    } else {
        cleaned.to_string()
    }
}

/// In-process blob store, used by the in-memory dataset store and tests.
#[derive(Default)]
pub struct MemoryBlobStore {
    blobs: RwLock<HashMap<BlobHandle, Bytes>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.blobs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.blobs.read().await.is_empty()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(&self, filename: &str, data: Bytes) -> io::Result<BlobHandle> {
        let handle = BlobHandle::new(format!(
            "{}_{}",
            uuid::Uuid::new_v4().simple(),
            sanitize_filename(filename)
        ));
        self.blobs.write().await.insert(handle.clone(), data);
        Ok(handle)
    }

    async fn get(&self, handle: &BlobHandle) -> io::Result<Bytes> {
        self.blobs
            .read()
            .await
            .get(handle)
            .cloned()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("blob {handle} not found")))
    }

    async fn delete(&self, handle: &BlobHandle) -> io::Result<()> {
        self.blobs.write().await.remove(handle);
        Ok(())
    }
}
