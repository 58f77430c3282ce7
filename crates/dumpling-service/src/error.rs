use std::io;

use thiserror::Error;

use crate::blobs::BlobError;
use crate::digest::{InvalidDigest, Sha1Digest};
use crate::store::StoreError;

/// Errors surfaced by ingestion and the other service operations.
#[derive(Debug, Error)]
pub enum IngestError {
    /// The request was invalid. Nothing was persisted; the client can correct and retry.
    #[error(transparent)]
    ClientInput(#[from] ClientInputError),
    /// A backing store failed. The request must be retried as a whole.
    #[error(transparent)]
    Storage(#[from] StorageFault),
    /// The request was cancelled and everything it had staged was discarded.
    #[error("operation cancelled")]
    Cancelled,
}

#[derive(Debug, Error)]
pub enum ClientInputError {
    #[error(transparent)]
    BadDigest(#[from] InvalidDigest),
    #[error("The given hash did not match the SHA1 hash of the uploaded file")]
    HashMismatch {
        expected: Sha1Digest,
        actual: Sha1Digest,
    },
    /// The payload is not a valid gzip stream.
    #[error("invalid gzip payload: {0}")]
    InvalidPayload(String),
    #[error("unknown dump id {0:?}")]
    UnknownDump(String),
    /// A value exceeds the limits of the metadata schema.
    #[error("{field} exceeds {max} characters")]
    TooLong { field: &'static str, max: usize },
}

#[derive(Debug, Error)]
pub enum StorageFault {
    #[error("metadata store failure")]
    Metadata(#[source] StoreError),
    #[error("blob store failure")]
    Blob(#[source] BlobError),
    #[error("scratch file failure")]
    Scratch(#[source] io::Error),
}

impl From<StoreError> for IngestError {
    #[track_caller]
    fn from(err: StoreError) -> Self {
        let dynerr: &dyn std::error::Error = &err;
        tracing::error!(error = dynerr, "metadata store failure");
        Self::Storage(StorageFault::Metadata(err))
    }
}

impl From<BlobError> for IngestError {
    #[track_caller]
    fn from(err: BlobError) -> Self {
        match err {
            BlobError::Cancelled => Self::Cancelled,
            err => {
                let dynerr: &dyn std::error::Error = &err;
                tracing::error!(error = dynerr, "blob store failure");
                Self::Storage(StorageFault::Blob(err))
            }
        }
    }
}

impl From<io::Error> for IngestError {
    #[track_caller]
    fn from(err: io::Error) -> Self {
        let dynerr: &dyn std::error::Error = &err;
        tracing::error!(error = dynerr, "scratch file failure");
        Self::Storage(StorageFault::Scratch(err))
    }
}

impl From<InvalidDigest> for IngestError {
    fn from(err: InvalidDigest) -> Self {
        Self::ClientInput(ClientInputError::BadDigest(err))
    }
}

impl IngestError {
    /// Whether the request was rejected because of invalid client input.
    pub fn is_client_error(&self) -> bool {
        matches!(self, IngestError::ClientInput(_))
    }
}
