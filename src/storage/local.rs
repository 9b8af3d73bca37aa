use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::fs;
use tracing::debug;

use super::{sanitize_filename, BlobHandle, BlobStore};

/// Blob store rooted in a local directory, one file per blob.
pub struct LocalBlobStore {
    root: PathBuf,
}

impl LocalBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, handle: &BlobHandle) -> io::Result<PathBuf> {
        let key = handle.as_str();
        if key.is_empty() || key.contains(['/', '\\']) || key.starts_with('.') {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid blob handle {key:?}"),
            ));
        }
        Ok(self.root.join(key))
    }
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    async fn put(&self, filename: &str, data: Bytes) -> io::Result<BlobHandle> {
        fs::create_dir_all(&self.root).await?;

        let handle = BlobHandle::new(format!(
            "{}_{}",
            uuid::Uuid::new_v4().simple(),
            sanitize_filename(filename)
        ));
        let path = self.path_for(&handle)?;
        fs::write(&path, &data).await?;
        debug!(path = %path.display(), bytes = data.len(), "Stored raw file");
        Ok(handle)
    }

    async fn get(&self, handle: &BlobHandle) -> io::Result<Bytes> {
        let path = self.path_for(handle)?;
        Ok(Bytes::from(fs::read(path).await?))
    }

    async fn delete(&self, handle: &BlobHandle) -> io::Result<()> {
        let path = self.path_for(handle)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}
