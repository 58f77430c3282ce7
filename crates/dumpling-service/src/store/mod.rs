//! The metadata store.
//!
//! Persistence is consumed through a narrow interface: point lookups by key, atomic batches of
//! writes, and a handful of secondary queries. Cross-request coordination relies entirely on the
//! uniqueness of keys, see [`Session::get_or_insert`].

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::digest::Sha1Digest;
use crate::types::{Artifact, ArtifactIndex, Dump, DumpArtifact, Failure, Property};

mod memory;
mod session;

pub use memory::MemoryStore;
pub use session::{GetOrInsert, Session};

/// The primary key of a record.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RecordKey {
    Dump(String),
    Failure(String),
    Property { dump_id: String, name: String },
    Artifact(Sha1Digest),
    ArtifactIndex(String),
    DumpArtifact { dump_id: String, local_path: String },
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordKey::Dump(id) => write!(f, "dump {id}"),
            RecordKey::Failure(hash) => write!(f, "failure {hash}"),
            RecordKey::Property { dump_id, name } => write!(f, "property {dump_id}/{name}"),
            RecordKey::Artifact(hash) => write!(f, "artifact {hash}"),
            RecordKey::ArtifactIndex(index) => write!(f, "index {index}"),
            RecordKey::DumpArtifact {
                dump_id,
                local_path,
            } => write!(f, "dump artifact {dump_id}:{local_path}"),
        }
    }
}

/// Any persisted record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Record {
    Dump(Dump),
    Failure(Failure),
    Property(Property),
    Artifact(Artifact),
    ArtifactIndex(ArtifactIndex),
    DumpArtifact(DumpArtifact),
}

impl Record {
    pub fn key(&self) -> RecordKey {
        match self {
            Record::Dump(dump) => dump.key(),
            Record::Failure(failure) => failure.key(),
            Record::Property(property) => property.key(),
            Record::Artifact(artifact) => artifact.key(),
            Record::ArtifactIndex(index) => index.key(),
            Record::DumpArtifact(link) => link.key(),
        }
    }
}

/// A typed view onto one kind of [`Record`].
pub trait Entity: Clone + Send + Sync + 'static {
    fn key(&self) -> RecordKey;
    fn into_record(self) -> Record;
    fn from_record(record: Record) -> Option<Self>;
}

macro_rules! entity {
    ($ty:ident, |$this:ident| $key:expr) => {
        impl Entity for $ty {
            fn key(&self) -> RecordKey {
                let $this = self;
                $key
            }

            fn into_record(self) -> Record {
                Record::$ty(self)
            }

            fn from_record(record: Record) -> Option<Self> {
                match record {
                    Record::$ty(inner) => Some(inner),
                    _ => None,
                }
            }
        }
    };
}

entity!(Dump, |dump| RecordKey::Dump(dump.dump_id.clone()));
entity!(Failure, |failure| RecordKey::Failure(
    failure.failure_hash.clone()
));
entity!(Property, |property| RecordKey::Property {
    dump_id: property.dump_id.clone(),
    name: property.name.clone(),
});
entity!(Artifact, |artifact| RecordKey::Artifact(artifact.hash.clone()));
entity!(ArtifactIndex, |index| RecordKey::ArtifactIndex(
    index.index.clone()
));
entity!(DumpArtifact, |link| RecordKey::DumpArtifact {
    dump_id: link.dump_id.clone(),
    local_path: link.local_path.clone(),
});

/// One write of an atomic batch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Write {
    /// Inserts a new record. Fails the batch if the key exists.
    Insert(Record),
    /// Replaces an existing record. Fails the batch if the key is missing.
    Update(Record),
    /// Deletes a record, cascading to the records it owns.
    Delete(RecordKey),
}

/// Which failure bucket a dump query is restricted to.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum FailureFilter {
    #[default]
    Any,
    /// Dumps without an assigned failure.
    Untriaged,
    Hash(String),
}

/// Filters for [`MetadataStore::query_dumps`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DumpQuery {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub failure: FailureFilter,
    /// Properties that must all be present with exactly these values.
    pub properties: BTreeMap<String, String>,
}

#[derive(Debug, Error)]
pub enum StoreError {
    /// An insert collided with an existing key.
    #[error("unique constraint violated for {0}")]
    UniqueViolation(RecordKey),
    /// `get_or_insert` was called on a session with uncommitted writes.
    #[error("session has pending changes")]
    PendingChanges,
    /// An update or delete referred to a key that does not exist.
    #[error("{0} does not exist")]
    Missing(RecordKey),
    /// A row that was reported as existing could not be read back.
    #[error("{0} vanished after a conflicting insert")]
    Vanished(RecordKey),
    /// The store could not be reached or failed internally.
    #[error("metadata store unavailable: {0}")]
    Unavailable(String),
}

/// Transactional persistence of dumps and artifacts.
#[async_trait]
pub trait MetadataStore: Send + Sync + fmt::Debug {
    /// Looks up a record by its primary key.
    async fn get(&self, key: &RecordKey) -> Result<Option<Record>, StoreError>;

    /// Applies all writes atomically, or none of them.
    async fn commit(&self, writes: Vec<Write>) -> Result<(), StoreError>;

    /// All files linked to a dump, ordered by local path.
    async fn dump_artifacts(&self, dump_id: &str) -> Result<Vec<DumpArtifact>, StoreError>;

    /// All properties of a dump, ordered by name.
    async fn properties(&self, dump_id: &str) -> Result<Vec<Property>, StoreError>;

    /// All index keys resolving to an artifact.
    async fn indexes_of(&self, hash: &Sha1Digest) -> Result<Vec<ArtifactIndex>, StoreError>;

    /// Sets `hash` on every dump artifact with the given index that has none yet.
    ///
    /// Returns the number of updated rows.
    async fn backfill_index(&self, index: &str, hash: &Sha1Digest) -> Result<usize, StoreError>;

    /// Dumps matching the query, ordered by dump time.
    async fn query_dumps(&self, query: &DumpQuery) -> Result<Vec<Dump>, StoreError>;
}

/// Looks up a record of a specific kind.
pub async fn fetch<E: Entity>(
    store: &dyn MetadataStore,
    key: &RecordKey,
) -> Result<Option<E>, StoreError> {
    Ok(store.get(key).await?.and_then(E::from_record))
}
