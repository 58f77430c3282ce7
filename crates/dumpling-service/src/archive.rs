//! Zip archives of all files of a dump.

use std::collections::HashSet;
use std::fs::File;
use std::io::{self, BufReader};
use std::path::Path;

use flate2::read::MultiGzDecoder;
use tempfile::NamedTempFile;
use tokio_util::sync::CancellationToken;
use zip::ZipWriter;
use zip::write::SimpleFileOptions;

use crate::blobs::BlobStore;
use crate::error::IngestError;

/// One file of an archive.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ArchiveEntry {
    /// The path of the file within the archive.
    pub path: String,
    /// The locator of the compressed payload.
    pub locator: String,
    /// The decompressed size.
    pub size: u64,
}

/// Writes the decompressed payloads of all entries into a zip archive in `scratch_dir`.
///
/// Entries are written in order; a path that was already written is skipped.
pub async fn write_archive(
    blobs: &dyn BlobStore,
    entries: Vec<ArchiveEntry>,
    scratch_dir: &Path,
    cancel: &CancellationToken,
) -> Result<NamedTempFile, IngestError> {
    let archive = tempfile::Builder::new()
        .prefix("archive-")
        .suffix(".zip")
        .tempfile_in(scratch_dir)?;
    let mut writer = ZipWriter::new(archive.reopen()?);
    let mut seen = HashSet::new();

    for entry in entries {
        if !seen.insert(entry.path.clone()) {
            tracing::debug!(path = %entry.path, "skipping duplicate archive entry");
            continue;
        }

        let mut compressed = tokio::fs::File::from_std(tempfile::tempfile_in(scratch_dir)?);
        let mut reader = blobs.get(&entry.locator).await?;
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(IngestError::Cancelled),
            copied = tokio::io::copy(&mut reader, &mut compressed) => { copied?; }
        }
        let compressed = compressed.into_std().await;

        writer = tokio::task::spawn_blocking(move || append(writer, &entry, compressed))
            .await
            .map_err(|err| io::Error::other(err.to_string()))??;
    }

    tokio::task::spawn_blocking(move || writer.finish().map_err(io::Error::from))
        .await
        .map_err(|err| io::Error::other(err.to_string()))??;
    Ok(archive)
}

fn append(
    mut writer: ZipWriter<File>,
    entry: &ArchiveEntry,
    mut compressed: File,
) -> io::Result<ZipWriter<File>> {
    use std::io::Seek;

    compressed.rewind()?;
    let options = SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated)
        .large_file(entry.size >= u64::from(u32::MAX));
    writer.start_file(entry.path.as_str(), options)?;

    let mut reader = MultiGzDecoder::new(BufReader::new(compressed));
    io::copy(&mut reader, &mut writer)?;
    Ok(writer)
}
