use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs::File;
use tokio_util::sync::CancellationToken;
use url::Url;

use super::{BlobError, BlobKey, BlobStore, BoxReader};

/// Stores blobs as files below a root directory.
///
/// Locators are `file://` URLs.
#[derive(Debug, Clone)]
pub struct FilesystemBlobStore {
    root: PathBuf,
}

impl FilesystemBlobStore {
    /// Opens the store, creating the root directory if needed.
    pub fn new(root: &Path) -> io::Result<Self> {
        std::fs::create_dir_all(root)?;
        let root = std::fs::canonicalize(root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_of(&self, key: &BlobKey) -> PathBuf {
        self.root.join(key.digest().as_str()).join(key.file_name())
    }

    fn resolve(&self, locator: &str) -> Result<PathBuf, BlobError> {
        let invalid = || BlobError::InvalidLocator(locator.to_owned());
        let url = Url::parse(locator).map_err(|_| invalid())?;
        if url.scheme() != "file" {
            return Err(invalid());
        }
        let path = url.to_file_path().map_err(|_| invalid())?;
        if !path.starts_with(&self.root) {
            return Err(invalid());
        }
        Ok(path)
    }
}

#[async_trait]
impl BlobStore for FilesystemBlobStore {
    async fn put(
        &self,
        key: &BlobKey,
        source: &Path,
        cancel: &CancellationToken,
    ) -> Result<String, BlobError> {
        let target = self.path_of(key);
        let Some(dir) = target.parent() else {
            return Err(BlobError::InvalidLocator(key.to_string()));
        };
        tokio::fs::create_dir_all(dir).await?;

        // The temp file lives next to the target so the final rename stays on one file system.
        let temp = tempfile::Builder::new()
            .prefix(".put-")
            .tempfile_in(dir)?;
        let mut writer = File::from_std(temp.reopen()?);
        let mut reader = File::open(source).await?;

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(BlobError::Cancelled),
            copied = tokio::io::copy(&mut reader, &mut writer) => { copied?; }
        }
        writer.sync_all().await?;
        drop(writer);

        temp.persist(&target).map_err(|err| err.error)?;
        tracing::debug!(key = %key, path = %target.display(), "stored blob");

        Url::from_file_path(&target)
            .map(String::from)
            .map_err(|_| BlobError::InvalidLocator(target.display().to_string()))
    }

    async fn get(&self, locator: &str) -> Result<BoxReader, BlobError> {
        let path = self.resolve(locator)?;
        match File::open(&path).await {
            Ok(file) => Ok(Box::pin(file)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Err(BlobError::NotFound),
            Err(err) => Err(err.into()),
        }
    }

    async fn exists(&self, key: &BlobKey) -> Result<bool, BlobError> {
        Ok(tokio::fs::try_exists(self.path_of(key)).await?)
    }

    async fn delete(&self, key: &BlobKey) -> Result<bool, BlobError> {
        let path = self.path_of(key);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(err) => return Err(err.into()),
        }
        if let Some(dir) = path.parent() {
            // only succeeds once the digest directory is empty
            tokio::fs::remove_dir(dir).await.ok();
        }
        Ok(true)
    }
}
