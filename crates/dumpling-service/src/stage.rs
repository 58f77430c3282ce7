//! Staging of uploaded payloads.
//!
//! An upload arrives as a gzip stream. It is first spooled to a scratch file as is, which is what
//! ends up in the blob store, and then decompressed into a second scratch file while computing the
//! SHA-1 digest of the decompressed content. Both files are deleted when the [`StagedUpload`] is
//! dropped, on every exit path.

use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use flate2::read::MultiGzDecoder;
use sha1::{Digest as _, Sha1};
use symbolic::common::ByteView;
use tempfile::NamedTempFile;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use crate::digest::Sha1Digest;
use crate::error::{ClientInputError, IngestError};

/// Writes uploads into uniquely named files below a scratch directory.
#[derive(Debug, Clone)]
pub struct Stager {
    scratch_dir: PathBuf,
    chunk_size: usize,
}

/// A verified upload, held in scratch storage.
#[derive(Debug)]
pub struct StagedUpload {
    compressed: NamedTempFile,
    decompressed: NamedTempFile,
    digest: Sha1Digest,
    size: u64,
    compressed_size: u64,
}

impl StagedUpload {
    pub fn digest(&self) -> &Sha1Digest {
        &self.digest
    }

    /// Size of the decompressed content.
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn compressed_size(&self) -> u64 {
        self.compressed_size
    }

    /// The upload as it was received.
    pub fn compressed_path(&self) -> &Path {
        self.compressed.path()
    }

    /// Memory maps the decompressed content.
    pub fn view(&self) -> io::Result<ByteView<'static>> {
        ByteView::map_file_ref(self.decompressed.as_file())
    }
}

impl Stager {
    /// Creates a stager, making sure the scratch directory exists.
    pub fn new(scratch_dir: impl Into<PathBuf>, chunk_size: usize) -> io::Result<Self> {
        let scratch_dir = scratch_dir.into();
        fs::create_dir_all(&scratch_dir)?;
        Ok(Self {
            scratch_dir,
            chunk_size: chunk_size.max(1),
        })
    }

    pub fn scratch_dir(&self) -> &Path {
        &self.scratch_dir
    }

    fn tempfile(&self, prefix: &str) -> io::Result<NamedTempFile> {
        tempfile::Builder::new()
            .prefix(prefix)
            .tempfile_in(&self.scratch_dir)
    }

    /// Spools `body` to scratch storage and verifies its digest against `expected`.
    ///
    /// Fails with [`ClientInputError::HashMismatch`] if the decompressed content does not hash to
    /// `expected`, and with [`IngestError::Cancelled`] if `cancel` fires while streaming. In both
    /// cases no scratch file survives the call.
    pub async fn stage<R>(
        &self,
        mut body: R,
        expected: &Sha1Digest,
        cancel: &CancellationToken,
    ) -> Result<StagedUpload, IngestError>
    where
        R: AsyncRead + Unpin + Send,
    {
        let compressed = self.tempfile("upload-")?;
        let mut writer = tokio::fs::File::from_std(compressed.reopen()?);

        let mut buf = vec![0; self.chunk_size];
        let mut compressed_size = 0u64;
        loop {
            let read = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(IngestError::Cancelled),
                read = body.read(&mut buf) => read?,
            };
            if read == 0 {
                break;
            }
            writer.write_all(&buf[..read]).await?;
            compressed_size += read as u64;
        }
        writer.flush().await?;
        writer.sync_all().await?;
        drop(writer);

        let decompressed = self.tempfile("staged-")?;
        let chunk_size = self.chunk_size;
        let cancel = cancel.clone();
        let (compressed, decompressed, digest, size) = tokio::task::spawn_blocking(move || {
            let (digest, size) = decompress_and_hash(&compressed, &decompressed, chunk_size, &cancel)?;
            Ok::<_, IngestError>((compressed, decompressed, digest, size))
        })
        .await
        .map_err(|err| io::Error::other(err.to_string()))??;

        if &digest != expected {
            tracing::debug!(%expected, actual = %digest, "rejecting upload with mismatching digest");
            return Err(ClientInputError::HashMismatch {
                expected: expected.clone(),
                actual: digest,
            }
            .into());
        }

        Ok(StagedUpload {
            compressed,
            decompressed,
            digest,
            size,
            compressed_size,
        })
    }
}

/// Decompresses `src` into `dst`, hashing the decompressed bytes on the way.
fn decompress_and_hash(
    src: &NamedTempFile,
    dst: &NamedTempFile,
    chunk_size: usize,
    cancel: &CancellationToken,
) -> Result<(Sha1Digest, u64), IngestError> {
    let mut reader = MultiGzDecoder::new(io::BufReader::new(src.reopen()?));
    let mut writer = io::BufWriter::new(dst.as_file());
    let mut hasher = Sha1::new();
    let mut buf = vec![0; chunk_size];
    let mut size = 0u64;

    loop {
        if cancel.is_cancelled() {
            return Err(IngestError::Cancelled);
        }
        let read = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(read) => read,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(ClientInputError::InvalidPayload(err.to_string()).into()),
        };
        hasher.update(&buf[..read]);
        writer.write_all(&buf[..read])?;
        size += read as u64;
    }
    writer.flush()?;

    Ok((Sha1Digest::from_hasher(hasher), size))
}
