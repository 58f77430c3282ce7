//! Storage of compressed artifact payloads.
//!
//! Payloads are addressed by [`BlobKey`] when written and by an opaque locator string when read.
//! The locator is what ends up in [`Artifact::url`](crate::types::Artifact::url).

use std::fmt;
use std::io;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::AsyncRead;
use tokio_util::sync::CancellationToken;

use crate::config::StorageConfig;
use crate::digest::Sha1Digest;

mod filesystem;
mod s3;

pub use filesystem::FilesystemBlobStore;
pub use s3::S3BlobStore;

/// A readable blob.
pub type BoxReader = Pin<Box<dyn AsyncRead + Send>>;

/// The location of a payload within a blob store: `<digest>/<file name>`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct BlobKey {
    digest: Sha1Digest,
    file_name: String,
}

impl BlobKey {
    /// The key of the compressed payload of an artifact uploaded as `file_name`.
    pub fn compressed(digest: &Sha1Digest, file_name: &str) -> Self {
        Self {
            digest: digest.clone(),
            file_name: format!("{}.gz", file_name.to_lowercase()),
        }
    }

    pub fn digest(&self) -> &Sha1Digest {
        &self.digest
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    /// The key as a relative, forward-slash separated path.
    pub fn as_path(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for BlobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.digest, self.file_name)
    }
}

#[derive(Debug, Error)]
pub enum BlobError {
    #[error("blob not found")]
    NotFound,
    /// The locator does not belong to this store.
    #[error("invalid blob locator: {0}")]
    InvalidLocator(String),
    #[error("blob i/o failed")]
    Io(#[from] io::Error),
    #[error("blob backend failed: {0}")]
    Backend(String),
    #[error("blob transfer timed out")]
    Timeout,
    #[error("blob transfer cancelled")]
    Cancelled,
}

/// A store for immutable payloads.
#[async_trait]
pub trait BlobStore: Send + Sync + fmt::Debug {
    /// Uploads the file at `source` under `key` and returns its locator.
    ///
    /// The blob becomes visible atomically. A cancelled or failed put leaves nothing behind.
    async fn put(
        &self,
        key: &BlobKey,
        source: &Path,
        cancel: &CancellationToken,
    ) -> Result<String, BlobError>;

    /// Opens the blob behind a locator previously returned by [`put`](Self::put).
    async fn get(&self, locator: &str) -> Result<BoxReader, BlobError>;

    async fn exists(&self, key: &BlobKey) -> Result<bool, BlobError>;

    /// Deletes a blob, returning whether it existed.
    async fn delete(&self, key: &BlobKey) -> Result<bool, BlobError>;
}

/// Creates the blob store described by the configuration.
pub async fn from_config(config: &StorageConfig) -> Result<Arc<dyn BlobStore>, BlobError> {
    Ok(match config {
        StorageConfig::Filesystem(fs) => Arc::new(FilesystemBlobStore::new(&fs.path)?),
        StorageConfig::S3(s3) => Arc::new(S3BlobStore::new(s3).await),
    })
}
