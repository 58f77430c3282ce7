//! The artifact deduplication pipeline.
//!
//! An upload goes through these steps:
//!
//! 1. If an artifact with the declared digest exists and its blob is stored, the upload is a pure
//!    dedup hit.
//! 2. Otherwise the payload is staged and its digest verified.
//! 3. The decompressed payload is classified and its index key derived.
//! 4. The artifact row and its index alias are inserted in one commit. Only the request that wins
//!    that insert writes the blob. The others wait until the blob is stored, and take over if the
//!    winner gives up.
//! 5. Dump artifacts waiting on any index of the artifact are linked to it.
//! 6. The artifact is linked to the dump of the request, if any.
//!
//! For dumps, the module placeholders derived from the dump are persisted afterwards and resolved
//! against artifacts that are already known.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::io::AsyncRead;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::blobs::{BlobError, BlobKey, BlobStore};
use crate::crosslink::expand_loaded_modules;
use crate::digest::Sha1Digest;
use crate::error::{ClientInputError, IngestError};
use crate::formats::{UploadKind, detect};
use crate::index;
use crate::stage::{StagedUpload, Stager};
use crate::store::{GetOrInsert, MetadataStore, Record, RecordKey, Session, StoreError};
use crate::types::{
    Artifact, ArtifactFormat, ArtifactIndex, Dump, DumpArtifact, DumpOs, MAX_INDEX_LEN,
};

/// Bounds of the backoff while waiting for a concurrent upload to store its blob.
const PUBLISH_POLL_START: Duration = Duration::from_millis(10);
const PUBLISH_POLL_MAX: Duration = Duration::from_millis(500);

/// One upload.
#[derive(Clone, Debug)]
pub struct IngestRequest {
    /// The declared digest of the decompressed payload.
    pub digest: Sha1Digest,
    /// The path of the file on the client machine.
    pub local_path: String,
    pub kind: UploadKind,
    /// The dump to link the upload to.
    pub dump_id: Option<String>,
}

/// The result of a successful upload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Ingested {
    pub artifact: Artifact,
    /// Whether this upload created the artifact.
    pub created: bool,
}

/// What an upload would be stored as, without storing it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Inspection {
    pub digest: Sha1Digest,
    pub format: ArtifactFormat,
    pub os: DumpOs,
    pub build_id: Option<String>,
    pub index: Option<String>,
    pub size: u64,
    /// The modules a dump references.
    pub modules: Vec<DumpArtifact>,
}

/// The outcome of classifying a staged payload.
#[derive(Debug)]
struct Classified {
    format: ArtifactFormat,
    build_id: Option<String>,
    index: Option<String>,
    placeholders: Vec<DumpArtifact>,
}

/// Runs uploads through staging, classification and deduplication.
#[derive(Debug, Clone)]
pub struct Ingester {
    store: Arc<dyn MetadataStore>,
    blobs: Arc<dyn BlobStore>,
    stager: Stager,
    operation_timeout: Duration,
}

impl Ingester {
    pub fn new(
        store: Arc<dyn MetadataStore>,
        blobs: Arc<dyn BlobStore>,
        stager: Stager,
        operation_timeout: Duration,
    ) -> Self {
        Self {
            store,
            blobs,
            stager,
            operation_timeout,
        }
    }

    pub fn store(&self) -> &dyn MetadataStore {
        self.store.as_ref()
    }

    pub fn blobs(&self) -> &dyn BlobStore {
        self.blobs.as_ref()
    }

    pub fn stager(&self) -> &Stager {
        &self.stager
    }

    /// Ingests one upload.
    ///
    /// Calling this again with the same digest is idempotent. The body is only read if the
    /// artifact is not known yet.
    #[tracing::instrument(skip_all, fields(digest = %request.digest, path = %request.local_path))]
    pub async fn ingest<R>(
        &self,
        request: &IngestRequest,
        body: R,
        cancel: &CancellationToken,
    ) -> Result<Ingested, IngestError>
    where
        R: AsyncRead + Unpin + Send,
    {
        let mut session = Session::new(self.store.as_ref());
        if let Some(ref dump_id) = request.dump_id {
            if session
                .find::<Dump>(&RecordKey::Dump(dump_id.clone()))
                .await?
                .is_none()
            {
                return Err(ClientInputError::UnknownDump(dump_id.clone()).into());
            }
        }

        let file_name = index::file_name(&request.local_path).to_lowercase();
        let existing = session
            .find::<Artifact>(&RecordKey::Artifact(request.digest.clone()))
            .await?;

        // a row without locator belongs to an upload that is still storing its blob
        let published = existing.and_then(|artifact| {
            let locator = artifact.url.clone()?;
            Some((artifact, locator))
        });

        let (artifact, created, placeholders) = match published {
            Some((artifact, locator)) => {
                tracing::debug!("artifact already exists");
                let placeholders = self
                    .reread_placeholders(request, &artifact, &locator, cancel)
                    .await?;
                (artifact, false, placeholders)
            }
            None => {
                let staged = self.stager.stage(body, &request.digest, cancel).await?;
                let (staged, classified) =
                    classify_blocking(staged, request.kind, file_name.clone(), request.dump_id.clone())
                        .await?;

                let candidate = Artifact {
                    hash: staged.digest().clone(),
                    uuid: classified.build_id,
                    format: classified.format,
                    file_name,
                    size: staged.size(),
                    compressed_size: staged.compressed_size(),
                    upload_time: Utc::now(),
                    url: None,
                };
                let dependents = bounded_index(classified.index)
                    .map(|index| {
                        Record::ArtifactIndex(ArtifactIndex {
                            index,
                            hash: candidate.hash.clone(),
                        })
                    })
                    .into_iter()
                    .collect();

                let (artifact, created) = self
                    .insert_or_await(&mut session, candidate, dependents, &staged, cancel)
                    .await?;
                (artifact, created, classified.placeholders)
            }
        };

        let aliases = self.store.indexes_of(&artifact.hash).await?;
        for alias in &aliases {
            let linked = self.store.backfill_index(&alias.index, &artifact.hash).await?;
            if linked > 0 {
                tracing::info!(index = %alias.index, linked, "linked waiting dump artifacts");
            }
        }

        if let Some(ref dump_id) = request.dump_id {
            let link = DumpArtifact {
                dump_id: dump_id.clone(),
                local_path: request.local_path.clone(),
                hash: Some(artifact.hash.clone()),
                index: aliases.first().map(|alias| alias.index.clone()),
                debug_critical: request.kind == UploadKind::Dump,
                executable_image: false,
            };
            link_to_dump(&mut session, link).await?;
            persist_placeholders(&mut session, placeholders).await?;
        }

        Ok(Ingested { artifact, created })
    }

    /// Stages and classifies an upload without touching any store.
    ///
    /// Module placeholders of dumps are reported for a dump with the digest as its id.
    pub async fn inspect<R>(
        &self,
        request: &IngestRequest,
        body: R,
        cancel: &CancellationToken,
    ) -> Result<Inspection, IngestError>
    where
        R: AsyncRead + Unpin + Send,
    {
        let staged = self.stager.stage(body, &request.digest, cancel).await?;
        let file_name = index::file_name(&request.local_path).to_lowercase();
        let dump_id = match request.kind {
            UploadKind::Dump => Some(request.digest.to_string()),
            UploadKind::Artifact => None,
        };
        let (staged, classified) =
            classify_blocking(staged, request.kind, file_name, dump_id).await?;

        Ok(Inspection {
            digest: staged.digest().clone(),
            format: classified.format,
            os: classified.format.dump_os(),
            build_id: classified.build_id,
            index: classified.index,
            size: staged.size(),
            modules: classified.placeholders,
        })
    }

    /// Inserts the artifact, or waits until the upload that inserted it first has stored its blob.
    ///
    /// If that upload fails and retracts its row, this request inserts and stores the artifact
    /// itself from its own staged payload.
    async fn insert_or_await(
        &self,
        session: &mut Session<'_>,
        candidate: Artifact,
        dependents: Vec<Record>,
        staged: &StagedUpload,
        cancel: &CancellationToken,
    ) -> Result<(Artifact, bool), IngestError> {
        let deadline = Instant::now() + self.operation_timeout;
        let mut delay = PUBLISH_POLL_START;

        loop {
            let inserted = session
                .get_or_insert_with(candidate.clone(), dependents.clone())
                .await;
            match inserted {
                Ok(GetOrInsert::Inserted(artifact)) => {
                    let artifact = self.publish(session, artifact, staged, cancel).await?;
                    return Ok((artifact, true));
                }
                Ok(GetOrInsert::Found(artifact)) if artifact.url.is_some() => {
                    tracing::debug!("concurrent upload created the artifact");
                    return Ok((artifact, false));
                }
                Ok(GetOrInsert::Found(_)) | Err(StoreError::Vanished(_)) => {}
                Err(err) => return Err(err.into()),
            }

            if Instant::now() >= deadline {
                tracing::warn!("concurrent upload did not store the artifact in time");
                return Err(BlobError::Timeout.into());
            }
            tracing::debug!(?delay, "waiting for concurrent upload to store the artifact");
            tokio::select! {
                biased;

                _ = cancel.cancelled() => return Err(IngestError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
            delay = (delay * 2).min(PUBLISH_POLL_MAX);
        }
    }

    /// Writes the blob of a freshly inserted artifact and records its locator.
    ///
    /// If either step fails, the blob and the artifact row are removed again, so that a later
    /// upload can start over.
    async fn publish(
        &self,
        session: &mut Session<'_>,
        mut artifact: Artifact,
        staged: &StagedUpload,
        cancel: &CancellationToken,
    ) -> Result<Artifact, IngestError> {
        let key = BlobKey::compressed(&artifact.hash, &artifact.file_name);
        let put = self.blobs.put(&key, staged.compressed_path(), cancel);
        let stored = match tokio::time::timeout(self.operation_timeout, put).await {
            Ok(Ok(locator)) => {
                artifact.url = Some(locator);
                session.update(artifact.clone());
                session.commit().await.map_err(IngestError::from)
            }
            Ok(Err(err)) => Err(err.into()),
            Err(_) => Err(BlobError::Timeout.into()),
        };

        match stored {
            Ok(()) => {
                tracing::info!(key = %key, format = %artifact.format, "stored new artifact");
                Ok(artifact)
            }
            Err(err) => {
                self.retract(session, &key, &artifact.hash).await;
                Err(err)
            }
        }
    }

    async fn retract(&self, session: &mut Session<'_>, key: &BlobKey, hash: &Sha1Digest) {
        if let Err(err) = self.blobs.delete(key).await {
            let dynerr: &dyn std::error::Error = &err;
            tracing::warn!(error = dynerr, key = %key, "failed to remove blob of failed upload");
        }
        session.discard();
        session.delete(RecordKey::Artifact(hash.clone()));
        if let Err(err) = session.commit().await {
            let dynerr: &dyn std::error::Error = &err;
            tracing::warn!(error = dynerr, %hash, "failed to remove artifact of failed upload");
        }
    }

    /// Enumerates the modules of a known dump artifact that is attached to a new dump.
    async fn reread_placeholders(
        &self,
        request: &IngestRequest,
        artifact: &Artifact,
        locator: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<DumpArtifact>, IngestError> {
        let Some(ref dump_id) = request.dump_id else {
            return Ok(Vec::new());
        };
        if request.kind != UploadKind::Dump {
            return Ok(Vec::new());
        }

        let key = RecordKey::DumpArtifact {
            dump_id: dump_id.clone(),
            local_path: request.local_path.clone(),
        };
        let link = Session::new(self.store.as_ref())
            .find::<DumpArtifact>(&key)
            .await?;
        if link.is_some_and(|link| link.hash.as_ref() == Some(&artifact.hash)) {
            return Ok(Vec::new());
        }

        let reader = self.blobs.get(locator).await?;
        let staged = self.stager.stage(reader, &artifact.hash, cancel).await?;
        let (_, classified) = classify_blocking(
            staged,
            UploadKind::Dump,
            artifact.file_name.clone(),
            Some(dump_id.clone()),
        )
        .await?;
        Ok(classified.placeholders)
    }
}

/// Runs format detection and module enumeration off the async runtime.
async fn classify_blocking(
    staged: StagedUpload,
    kind: UploadKind,
    file_name: String,
    dump_id: Option<String>,
) -> Result<(StagedUpload, Classified), IngestError> {
    let classified = tokio::task::spawn_blocking(move || {
        let classified = classify(&staged, kind, &file_name, dump_id.as_deref())?;
        Ok::<_, io::Error>((staged, classified))
    })
    .await
    .map_err(|err| io::Error::other(err.to_string()))??;
    Ok(classified)
}

fn classify(
    staged: &StagedUpload,
    kind: UploadKind,
    file_name: &str,
    dump_id: Option<&str>,
) -> io::Result<Classified> {
    let detection = detect(staged.view()?, kind);
    let index = detection.index(staged.digest(), file_name);
    let placeholders = match (&detection.dump, dump_id) {
        (Some(dump), Some(dump_id)) => expand_loaded_modules(dump, dump_id),
        _ => Vec::new(),
    };
    Ok(Classified {
        format: detection.format,
        build_id: detection.build_id,
        index,
        placeholders,
    })
}

fn bounded_index(index: Option<String>) -> Option<String> {
    index.filter(|index| {
        let fits = index.len() <= MAX_INDEX_LEN;
        if !fits {
            tracing::warn!(%index, "index key too long, not registering it");
        }
        fits
    })
}

/// Creates or updates the link of a dump to one of its files.
///
/// An existing link gets the hash set and keeps its index unless it had none.
async fn link_to_dump(session: &mut Session<'_>, link: DumpArtifact) -> Result<(), IngestError> {
    let hash = link.hash.clone();
    let index = link.index.clone();
    if let GetOrInsert::Found(mut existing) = session.get_or_insert(link).await? {
        if existing.hash == hash && (existing.index.is_some() || index.is_none()) {
            return Ok(());
        }
        existing.hash = hash;
        if existing.index.is_none() {
            existing.index = index;
        }
        session.update(existing);
        session.commit().await?;
    }
    Ok(())
}

/// Persists module placeholders and links those whose index is already known.
///
/// Placeholders that exist already are left untouched.
async fn persist_placeholders(
    session: &mut Session<'_>,
    placeholders: Vec<DumpArtifact>,
) -> Result<(), IngestError> {
    if placeholders.is_empty() {
        return Ok(());
    }
    tracing::debug!(count = placeholders.len(), "persisting module placeholders");

    let mut indexes = Vec::new();
    for mut placeholder in placeholders {
        placeholder.index = bounded_index(placeholder.index);
        if let Some(ref index) = placeholder.index {
            indexes.push(index.clone());
        }
        session.get_or_insert(placeholder).await?;
    }

    indexes.sort();
    indexes.dedup();
    for index in indexes {
        let Some(alias) = session
            .find::<ArtifactIndex>(&RecordKey::ArtifactIndex(index))
            .await?
        else {
            continue;
        };
        session.store().backfill_index(&alias.index, &alias.hash).await?;
    }
    Ok(())
}
