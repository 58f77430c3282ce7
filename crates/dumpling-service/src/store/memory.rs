use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;

use super::{DumpQuery, FailureFilter, MetadataStore, Record, RecordKey, StoreError, Write};
use crate::digest::Sha1Digest;
use crate::types::{ArtifactIndex, Dump, DumpArtifact, Property};

/// An in-process [`MetadataStore`].
///
/// Enforces the same key uniqueness and cascades as the relational schema:
/// deleting a dump deletes its files and properties, and deleting an artifact unlinks it from all
/// dumps and drops its index keys.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: Mutex<BTreeMap<RecordKey, Record>>,
}

/// Previous values of modified keys, for rolling back a failed batch.
type UndoLog = Vec<(RecordKey, Option<Record>)>;

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, BTreeMap<RecordKey, Record>>, StoreError> {
        self.records
            .lock()
            .map_err(|_| StoreError::Unavailable("memory store lock poisoned".into()))
    }
}

fn set(
    records: &mut BTreeMap<RecordKey, Record>,
    undo: &mut UndoLog,
    key: RecordKey,
    value: Option<Record>,
) {
    let previous = match value {
        Some(record) => records.insert(key.clone(), record),
        None => records.remove(&key),
    };
    undo.push((key, previous));
}

fn apply(
    records: &mut BTreeMap<RecordKey, Record>,
    undo: &mut UndoLog,
    write: Write,
) -> Result<(), StoreError> {
    match write {
        Write::Insert(record) => {
            let key = record.key();
            if records.contains_key(&key) {
                return Err(StoreError::UniqueViolation(key));
            }
            set(records, undo, key, Some(record));
        }
        Write::Update(record) => {
            let key = record.key();
            if !records.contains_key(&key) {
                return Err(StoreError::Missing(key));
            }
            set(records, undo, key, Some(record));
        }
        Write::Delete(key) => {
            let Some(record) = records.get(&key) else {
                return Err(StoreError::Missing(key));
            };
            let cascade = cascade_of(records, record);
            set(records, undo, key, None);
            for (key, value) in cascade {
                set(records, undo, key, value);
            }
        }
    }
    Ok(())
}

/// The writes implied by deleting `record`.
fn cascade_of(
    records: &BTreeMap<RecordKey, Record>,
    record: &Record,
) -> Vec<(RecordKey, Option<Record>)> {
    let mut cascade = Vec::new();
    match record {
        Record::Dump(dump) => {
            for (key, record) in records {
                match record {
                    Record::DumpArtifact(link) if link.dump_id == dump.dump_id => {
                        cascade.push((key.clone(), None));
                    }
                    Record::Property(property) if property.dump_id == dump.dump_id => {
                        cascade.push((key.clone(), None));
                    }
                    _ => {}
                }
            }
        }
        Record::Artifact(artifact) => {
            for (key, record) in records {
                match record {
                    Record::DumpArtifact(link) if link.hash.as_ref() == Some(&artifact.hash) => {
                        let mut link = link.clone();
                        link.hash = None;
                        cascade.push((key.clone(), Some(Record::DumpArtifact(link))));
                    }
                    Record::ArtifactIndex(index) if index.hash == artifact.hash => {
                        cascade.push((key.clone(), None));
                    }
                    _ => {}
                }
            }
        }
        _ => {}
    }
    cascade
}

#[async_trait]
impl MetadataStore for MemoryStore {
    async fn get(&self, key: &RecordKey) -> Result<Option<Record>, StoreError> {
        Ok(self.lock()?.get(key).cloned())
    }

    async fn commit(&self, writes: Vec<Write>) -> Result<(), StoreError> {
        let mut records = self.lock()?;
        let mut undo = UndoLog::new();
        for write in writes {
            if let Err(err) = apply(&mut records, &mut undo, write) {
                for (key, previous) in undo.into_iter().rev() {
                    match previous {
                        Some(record) => records.insert(key, record),
                        None => records.remove(&key),
                    };
                }
                return Err(err);
            }
        }
        Ok(())
    }

    async fn dump_artifacts(&self, dump_id: &str) -> Result<Vec<DumpArtifact>, StoreError> {
        let records = self.lock()?;
        let start = RecordKey::DumpArtifact {
            dump_id: dump_id.to_owned(),
            local_path: String::new(),
        };
        Ok(records
            .range(start..)
            .map_while(|(_, record)| match record {
                Record::DumpArtifact(link) if link.dump_id == dump_id => Some(link.clone()),
                _ => None,
            })
            .collect())
    }

    async fn properties(&self, dump_id: &str) -> Result<Vec<Property>, StoreError> {
        let records = self.lock()?;
        let start = RecordKey::Property {
            dump_id: dump_id.to_owned(),
            name: String::new(),
        };
        Ok(records
            .range(start..)
            .map_while(|(_, record)| match record {
                Record::Property(property) if property.dump_id == dump_id => {
                    Some(property.clone())
                }
                _ => None,
            })
            .collect())
    }

    async fn indexes_of(&self, hash: &Sha1Digest) -> Result<Vec<ArtifactIndex>, StoreError> {
        let records = self.lock()?;
        Ok(records
            .values()
            .filter_map(|record| match record {
                Record::ArtifactIndex(index) if &index.hash == hash => Some(index.clone()),
                _ => None,
            })
            .collect())
    }

    async fn backfill_index(&self, index: &str, hash: &Sha1Digest) -> Result<usize, StoreError> {
        let mut records = self.lock()?;
        let mut updated = 0;
        for record in records.values_mut() {
            if let Record::DumpArtifact(link) = record {
                if link.hash.is_none() && link.index.as_deref() == Some(index) {
                    link.hash = Some(hash.clone());
                    updated += 1;
                }
            }
        }
        Ok(updated)
    }

    async fn query_dumps(&self, query: &DumpQuery) -> Result<Vec<Dump>, StoreError> {
        let records = self.lock()?;
        let has_property = |dump_id: &str, name: &str, value: &str| {
            let key = RecordKey::Property {
                dump_id: dump_id.to_owned(),
                name: name.to_owned(),
            };
            matches!(records.get(&key), Some(Record::Property(p)) if p.value == value)
        };

        let mut dumps: Vec<Dump> = records
            .values()
            .filter_map(|record| match record {
                Record::Dump(dump) => Some(dump),
                _ => None,
            })
            .filter(|dump| dump.dump_time >= query.start && dump.dump_time <= query.end)
            .filter(|dump| match query.failure {
                FailureFilter::Any => true,
                FailureFilter::Untriaged => dump.failure_hash.is_none(),
                FailureFilter::Hash(ref hash) => dump.failure_hash.as_ref() == Some(hash),
            })
            .filter(|dump| {
                query
                    .properties
                    .iter()
                    .all(|(name, value)| has_property(&dump.dump_id, name, value))
            })
            .cloned()
            .collect();
        dumps.sort_by(|a, b| a.dump_time.cmp(&b.dump_time));
        Ok(dumps)
    }
}
