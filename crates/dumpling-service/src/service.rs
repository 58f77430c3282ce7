//! The operations exposed to clients.
//!
//! [`DumplingService`] is transport agnostic: every operation takes plain values and a body
//! stream, and reports failures as [`IngestError`] so that callers can tell client errors from
//! server errors.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Duration as TimeDelta, Utc};
use serde::Serialize;
use tempfile::NamedTempFile;
use tokio::io::AsyncRead;
use tokio_util::sync::CancellationToken;

use crate::archive::{ArchiveEntry, write_archive};
use crate::blobs::{self, BlobKey, BlobStore, BoxReader};
use crate::config::Config;
use crate::digest::Sha1Digest;
use crate::error::{ClientInputError, IngestError};
use crate::formats::UploadKind;
use crate::ingest::{IngestRequest, Ingester, Inspection};
use crate::stage::Stager;
use crate::store::{
    DumpQuery, FailureFilter, GetOrInsert, MemoryStore, MetadataStore, RecordKey, Session, Write,
    fetch,
};
use crate::types::{
    Artifact, ArtifactIndex, Dump, DumpArtifact, DumpOs, FAILURE_HASH, Failure, MAX_DUMP_ID_LEN,
    MAX_USER_LEN, Property, UNTRIAGED,
};

/// The range [`DumplingService::dumps_by_failure`] covers by default.
const DEFAULT_FAILURE_WINDOW_DAYS: i64 = 10;

/// The response to a dump upload.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct DumpUploadResponse {
    pub dump_id: String,
    /// Local paths of the modules the client should upload next.
    pub ref_paths: Vec<String>,
}

/// A file of a dump, with the artifact it resolved to.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ManifestEntry {
    #[serde(flatten)]
    pub link: DumpArtifact,
    pub relative_path: String,
    pub artifact: Option<Artifact>,
}

/// A dump with everything attached to it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct DumpManifest {
    #[serde(flatten)]
    pub dump: Dump,
    pub properties: BTreeMap<String, String>,
    pub artifacts: Vec<ManifestEntry>,
}

/// Identifies an artifact for download.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ArtifactRef {
    Hash(Sha1Digest),
    Index(String),
}

/// Where to fetch an artifact from.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ArtifactDownload {
    pub locator: String,
    /// The file name the artifact was uploaded as, to be passed on to the client.
    pub file_name: String,
}

/// A zip archive of a dump.
#[derive(Debug)]
pub struct DumpArchive {
    pub file: NamedTempFile,
    /// The name to offer the archive under.
    pub file_name: String,
}

#[derive(Debug, Clone)]
pub struct DumplingService {
    ingester: Ingester,
}

fn check_len(field: &'static str, value: &str, max: usize) -> Result<(), ClientInputError> {
    if value.chars().count() > max {
        return Err(ClientInputError::TooLong { field, max });
    }
    Ok(())
}

impl DumplingService {
    pub fn new(
        store: Arc<dyn MetadataStore>,
        blobs: Arc<dyn BlobStore>,
        stager: Stager,
        operation_timeout: Duration,
    ) -> Self {
        Self {
            ingester: Ingester::new(store, blobs, stager, operation_timeout),
        }
    }

    /// Creates the service with an in-process metadata store and the configured blob store.
    pub async fn from_config(config: &Config) -> anyhow::Result<Self> {
        let blobs = blobs::from_config(&config.storage).await?;
        let stager = Stager::new(config.scratch_dir(), config.chunk_size)?;
        Ok(Self::new(
            Arc::new(MemoryStore::new()),
            blobs,
            stager,
            config.operation_timeout,
        ))
    }

    fn store(&self) -> &dyn MetadataStore {
        self.ingester.store()
    }

    async fn require_dump(&self, dump_id: &str) -> Result<Dump, IngestError> {
        fetch::<Dump>(self.store(), &RecordKey::Dump(dump_id.to_owned()))
            .await?
            .ok_or_else(|| ClientInputError::UnknownDump(dump_id.to_owned()).into())
    }

    /// Creates an empty dump with a generated id.
    pub async fn create_dump(&self, origin: &str, display_name: &str) -> Result<Dump, IngestError> {
        check_len("origin", origin, MAX_USER_LEN)?;
        let dump = Dump {
            dump_id: uuid::Uuid::new_v4().simple().to_string(),
            display_name: display_name.to_owned(),
            user: origin.to_owned(),
            os: DumpOs::Unknown,
            failure_hash: None,
            dump_time: Utc::now(),
        };
        let dump = Session::new(self.store()).get_or_insert(dump).await?;
        Ok(dump.into_inner())
    }

    /// Uploads a dump file, creating a dump named after its digest.
    ///
    /// If that dump exists already and its dump file is stored, nothing is uploaded. A dump whose
    /// earlier upload failed is completed by this call.
    #[tracing::instrument(skip_all, fields(digest = %digest, local_path = %local_path))]
    pub async fn upload_dump<R>(
        &self,
        digest: &str,
        local_path: &str,
        origin: &str,
        display_name: &str,
        body: R,
        cancel: &CancellationToken,
    ) -> Result<DumpUploadResponse, IngestError>
    where
        R: AsyncRead + Unpin + Send,
    {
        let digest: Sha1Digest = digest.parse()?;
        check_len("dump_id", digest.as_str(), MAX_DUMP_ID_LEN)?;
        check_len("origin", origin, MAX_USER_LEN)?;

        let candidate = Dump {
            dump_id: digest.to_string(),
            display_name: display_name.to_owned(),
            user: origin.to_owned(),
            os: DumpOs::Unknown,
            failure_hash: None,
            dump_time: Utc::now(),
        };
        let mut session = Session::new(self.store());
        let mut dump = match session.get_or_insert(candidate).await? {
            GetOrInsert::Found(dump) => {
                if self.has_dump_file(&dump.dump_id, &digest).await? {
                    tracing::debug!("dump exists already");
                    return Ok(DumpUploadResponse {
                        dump_id: dump.dump_id,
                        ref_paths: Vec::new(),
                    });
                }
                tracing::debug!("dump exists without its dump file, ingesting it");
                dump
            }
            GetOrInsert::Inserted(dump) => dump,
        };

        // a failed ingest keeps the dump, which concurrent uploads of it may have returned already
        let request = IngestRequest {
            digest,
            local_path: local_path.to_owned(),
            kind: UploadKind::Dump,
            dump_id: Some(dump.dump_id.clone()),
        };
        let ingested = self.ingester.ingest(&request, body, cancel).await?;

        let os = ingested.artifact.format.dump_os();
        if dump.os != os {
            dump.os = os;
            session.update(dump.clone());
            session.commit().await?;
        }

        let ref_paths = self
            .store()
            .dump_artifacts(&dump.dump_id)
            .await?
            .into_iter()
            .filter(|link| link.hash.is_none())
            .map(|link| link.local_path)
            .collect();

        Ok(DumpUploadResponse {
            dump_id: dump.dump_id,
            ref_paths,
        })
    }

    /// Whether the dump file of a dump has been stored and linked.
    async fn has_dump_file(&self, dump_id: &str, digest: &Sha1Digest) -> Result<bool, IngestError> {
        let links = self.store().dump_artifacts(dump_id).await?;
        Ok(links
            .iter()
            .any(|link| link.debug_critical && link.hash.as_ref() == Some(digest)))
    }

    /// Uploads a file, optionally as part of a dump. Returns the digest of the stored artifact.
    pub async fn upload_artifact<R>(
        &self,
        digest: &str,
        local_path: &str,
        dump_id: Option<&str>,
        body: R,
        cancel: &CancellationToken,
    ) -> Result<Sha1Digest, IngestError>
    where
        R: AsyncRead + Unpin + Send,
    {
        let request = IngestRequest {
            digest: digest.parse()?,
            local_path: local_path.to_owned(),
            kind: UploadKind::Artifact,
            dump_id: dump_id.map(str::to_owned),
        };
        let ingested = self.ingester.ingest(&request, body, cancel).await?;
        Ok(ingested.artifact.hash)
    }

    /// Classifies a file without storing it.
    pub async fn inspect<R>(
        &self,
        digest: &str,
        local_path: &str,
        kind: UploadKind,
        body: R,
        cancel: &CancellationToken,
    ) -> Result<Inspection, IngestError>
    where
        R: AsyncRead + Unpin + Send,
    {
        let request = IngestRequest {
            digest: digest.parse()?,
            local_path: local_path.to_owned(),
            kind,
            dump_id: None,
        };
        self.ingester.inspect(&request, body, cancel).await
    }

    pub async fn get_manifest(&self, dump_id: &str) -> Result<Option<DumpManifest>, IngestError> {
        let Some(dump) = fetch::<Dump>(self.store(), &RecordKey::Dump(dump_id.to_owned())).await?
        else {
            return Ok(None);
        };

        let properties = self
            .store()
            .properties(dump_id)
            .await?
            .into_iter()
            .map(|property| (property.name, property.value))
            .collect();

        let mut artifacts = Vec::new();
        for link in self.store().dump_artifacts(dump_id).await? {
            let artifact = match link.hash {
                Some(ref hash) => {
                    fetch::<Artifact>(self.store(), &RecordKey::Artifact(hash.clone())).await?
                }
                None => None,
            };
            artifacts.push(ManifestEntry {
                relative_path: link.relative_path(),
                link,
                artifact,
            });
        }

        Ok(Some(DumpManifest {
            dump,
            properties,
            artifacts,
        }))
    }

    pub async fn find_artifact(
        &self,
        reference: &ArtifactRef,
    ) -> Result<Option<Artifact>, IngestError> {
        let hash = match reference {
            ArtifactRef::Hash(hash) => hash.clone(),
            ArtifactRef::Index(index) => {
                let key = RecordKey::ArtifactIndex(index.clone());
                match fetch::<ArtifactIndex>(self.store(), &key).await? {
                    Some(alias) => alias.hash,
                    None => return Ok(None),
                }
            }
        };
        Ok(fetch(self.store(), &RecordKey::Artifact(hash)).await?)
    }

    /// Resolves where to download an artifact from.
    ///
    /// An artifact whose payload has not been stored completely is reported as missing.
    pub async fn download_artifact(
        &self,
        reference: &ArtifactRef,
    ) -> Result<Option<ArtifactDownload>, IngestError> {
        let Some(artifact) = self.find_artifact(reference).await? else {
            return Ok(None);
        };
        Ok(artifact.url.map(|locator| ArtifactDownload {
            locator,
            file_name: artifact.file_name,
        }))
    }

    /// Opens the compressed payload of an artifact.
    pub async fn open_artifact(
        &self,
        reference: &ArtifactRef,
    ) -> Result<Option<BoxReader>, IngestError> {
        let Some(download) = self.download_artifact(reference).await? else {
            return Ok(None);
        };
        Ok(Some(self.ingester.blobs().get(&download.locator).await?))
    }

    /// Merges properties into the property bag of a dump.
    ///
    /// A `FAILURE_HASH` property additionally assigns the dump to that failure.
    pub async fn update_dump_properties(
        &self,
        dump_id: &str,
        properties: &BTreeMap<String, String>,
    ) -> Result<Dump, IngestError> {
        let mut dump = self.require_dump(dump_id).await?;
        let mut session = Session::new(self.store());

        for (name, value) in properties {
            if name == FAILURE_HASH {
                session
                    .get_or_insert(Failure {
                        failure_hash: value.clone(),
                    })
                    .await?;
                if dump.failure_hash.as_ref() != Some(value) {
                    dump.failure_hash = Some(value.clone());
                    session.update(dump.clone());
                    session.commit().await?;
                }
            }

            let candidate = Property {
                dump_id: dump_id.to_owned(),
                name: name.clone(),
                value: value.clone(),
            };
            if let GetOrInsert::Found(mut existing) = session.get_or_insert(candidate).await? {
                if existing.value != *value {
                    existing.value = value.clone();
                    session.update(existing);
                    session.commit().await?;
                }
            }
        }

        Ok(dump)
    }

    /// Dumps created within `[start, end]` that carry all the given properties.
    ///
    /// A `FAILURE_HASH` entry filters by failure instead, with `UNTRIAGED` selecting dumps without
    /// a failure.
    pub async fn find_dumps(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        properties: &BTreeMap<String, String>,
    ) -> Result<Vec<Dump>, IngestError> {
        let mut properties = properties.clone();
        let failure = match properties.remove(FAILURE_HASH) {
            None => FailureFilter::Any,
            Some(hash) if hash == UNTRIAGED => FailureFilter::Untriaged,
            Some(hash) => FailureFilter::Hash(hash),
        };
        let query = DumpQuery {
            start,
            end,
            failure,
            properties,
        };
        Ok(self.store().query_dumps(&query).await?)
    }

    /// Dumps grouped by failure, unassigned ones under `UNTRIAGED`.
    ///
    /// Defaults to the last ten days.
    pub async fn dumps_by_failure(
        &self,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Result<BTreeMap<String, Vec<Dump>>, IngestError> {
        let end = end.unwrap_or_else(Utc::now);
        let start = start.unwrap_or(end - TimeDelta::days(DEFAULT_FAILURE_WINDOW_DAYS));

        let mut groups: BTreeMap<String, Vec<Dump>> = BTreeMap::new();
        for dump in self.find_dumps(start, end, &BTreeMap::new()).await? {
            let failure = dump.failure_hash.clone().unwrap_or_else(|| UNTRIAGED.to_owned());
            groups.entry(failure).or_default().push(dump);
        }
        Ok(groups)
    }

    /// Deletes an artifact, its index keys and its payload.
    ///
    /// Files of dumps that resolved to it become unresolved again.
    pub async fn delete_artifact(&self, digest: &str) -> Result<bool, IngestError> {
        let hash: Sha1Digest = digest.parse()?;
        let Some(artifact) =
            fetch::<Artifact>(self.store(), &RecordKey::Artifact(hash.clone())).await?
        else {
            return Ok(false);
        };

        self.store()
            .commit(vec![Write::Delete(RecordKey::Artifact(hash))])
            .await?;
        let key = BlobKey::compressed(&artifact.hash, &artifact.file_name);
        if !self.ingester.blobs().delete(&key).await? {
            tracing::warn!(key = %key, "deleted artifact had no payload");
        }
        tracing::info!(hash = %artifact.hash, "deleted artifact");
        Ok(true)
    }

    /// Packs every resolved file of a dump into a zip archive.
    pub async fn archive_dump(
        &self,
        dump_id: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<DumpArchive>, IngestError> {
        let Some(manifest) = self.get_manifest(dump_id).await? else {
            return Ok(None);
        };

        let entries = manifest
            .artifacts
            .into_iter()
            .filter_map(|entry| {
                let artifact = entry.artifact?;
                Some(ArchiveEntry {
                    path: entry.relative_path,
                    locator: artifact.url?,
                    size: artifact.size,
                })
            })
            .collect();

        let file = write_archive(
            self.ingester.blobs(),
            entries,
            self.ingester.stager().scratch_dir(),
            cancel,
        )
        .await?;

        Ok(Some(DumpArchive {
            file,
            file_name: format!("{}.zip", manifest.dump.display_name),
        }))
    }
}
