use std::io::{Cursor, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dumpling_service::blobs::{BlobError, BlobKey, BlobStore, BoxReader, FilesystemBlobStore};
use dumpling_service::service::DumplingService;
use dumpling_service::stage::Stager;
use dumpling_service::store::MemoryStore;
use flate2::read::MultiGzDecoder;
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;

pub use dumpling_test as test;

/// A filesystem blob store that counts the blobs written to it.
#[derive(Debug)]
pub struct CountingBlobStore {
    inner: FilesystemBlobStore,
    puts: AtomicUsize,
}

impl CountingBlobStore {
    pub fn puts(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BlobStore for CountingBlobStore {
    async fn put(
        &self,
        key: &BlobKey,
        source: &Path,
        cancel: &CancellationToken,
    ) -> Result<String, BlobError> {
        self.puts.fetch_add(1, Ordering::SeqCst);
        self.inner.put(key, source, cancel).await
    }

    async fn get(&self, locator: &str) -> Result<BoxReader, BlobError> {
        self.inner.get(locator).await
    }

    async fn exists(&self, key: &BlobKey) -> Result<bool, BlobError> {
        self.inner.exists(key).await
    }

    async fn delete(&self, key: &BlobKey) -> Result<bool, BlobError> {
        self.inner.delete(key).await
    }
}

/// A service under test, with its stores.
///
/// The temp directory is removed when this is dropped. Keep it alive until the test has finished.
pub struct TestService {
    pub service: DumplingService,
    pub blobs: Arc<CountingBlobStore>,
    pub scratch_dir: PathBuf,
    _dir: test::TempDir,
}

/// Setup tests and create a service backed by an in-memory metadata store and a blob store in a
/// temporary directory.
pub fn setup_service() -> TestService {
    test::setup();

    let dir = test::tempdir();
    let blobs = Arc::new(CountingBlobStore {
        inner: FilesystemBlobStore::new(&dir.path().join("blobs")).unwrap(),
        puts: AtomicUsize::new(0),
    });
    let scratch_dir = dir.path().join("scratch");
    let service = DumplingService::new(
        Arc::new(MemoryStore::new()),
        blobs.clone(),
        Stager::new(&scratch_dir, 4096).unwrap(),
        Duration::from_secs(30),
    );

    TestService {
        service,
        blobs,
        scratch_dir,
        _dir: dir,
    }
}

/// The declared digest and gzip compressed body of an upload of `data`.
pub fn upload(data: &[u8]) -> (String, Cursor<Vec<u8>>) {
    (test::sha1_hex(data), Cursor::new(test::gzip(data)))
}

/// Number of files left behind in the scratch directory.
pub fn scratch_files(dir: &Path) -> usize {
    match std::fs::read_dir(dir) {
        Ok(entries) => entries.count(),
        Err(_) => 0,
    }
}

/// Reads and decompresses a stored payload.
pub async fn read_blob(mut reader: BoxReader) -> Vec<u8> {
    let mut compressed = Vec::new();
    reader.read_to_end(&mut compressed).await.unwrap();
    let mut content = Vec::new();
    MultiGzDecoder::new(compressed.as_slice())
        .read_to_end(&mut content)
        .unwrap();
    content
}

pub fn cancel() -> CancellationToken {
    CancellationToken::new()
}
