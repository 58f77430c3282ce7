//! Prepares local files for upload.
//!
//! The service accepts gzip compressed bodies together with the SHA-1 of the decompressed
//! content. Plain files are compressed on the fly; files that are gzip compressed already are
//! sent as they are.

use std::fs::File;
use std::io::{self, BufReader, Read, Seek, Write};
use std::path::Path;

use anyhow::{Context, Result};
use flate2::Compression;
use flate2::read::MultiGzDecoder;
use flate2::write::GzEncoder;
use sha1::{Digest, Sha1};

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// A gzip compressed body ready to be uploaded.
#[derive(Debug)]
pub struct PreparedUpload {
    /// Lowercase hex SHA-1 of the decompressed content.
    pub digest: String,
    pub body: File,
}

fn is_gzip(file: &mut File) -> io::Result<bool> {
    let mut magic = [0; 2];
    let gzip = match file.read_exact(&mut magic) {
        Ok(()) => magic == GZIP_MAGIC,
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => false,
        Err(err) => return Err(err),
    };
    file.rewind()?;
    Ok(gzip)
}

/// Hashes everything read from `reader`, writing it to `sink` along the way.
fn hash_copy(mut reader: impl Read, mut sink: impl Write) -> io::Result<String> {
    let mut hasher = Sha1::new();
    let mut buf = vec![0; 64 * 1024];
    loop {
        let read = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(read) => read,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        };
        hasher.update(&buf[..read]);
        sink.write_all(&buf[..read])?;
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Hashes the file at `path` and compresses it into `scratch_dir` unless it is compressed already.
pub fn prepare(path: &Path, scratch_dir: &Path) -> Result<PreparedUpload> {
    let mut file =
        File::open(path).with_context(|| format!("failed to open {}", path.display()))?;

    if is_gzip(&mut file)? {
        tracing::debug!(path = %path.display(), "file is gzip compressed already");
        let digest = hash_copy(MultiGzDecoder::new(BufReader::new(&file)), io::sink())
            .context("failed to decompress file")?;
        file.rewind()?;
        return Ok(PreparedUpload { digest, body: file });
    }

    let compressed = tempfile::tempfile_in(scratch_dir).context("failed to create scratch file")?;
    let mut encoder = GzEncoder::new(compressed, Compression::default());
    let digest = hash_copy(BufReader::new(file), &mut encoder)?;
    let mut body = encoder.finish()?;
    body.rewind()?;

    Ok(PreparedUpload { digest, body })
}
