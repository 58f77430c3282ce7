use super::{Entity, MetadataStore, Record, RecordKey, StoreError, Write, fetch};

/// The outcome of [`Session::get_or_insert`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GetOrInsert<E> {
    /// The row already existed, possibly written by a concurrent caller.
    Found(E),
    /// This call inserted the row.
    Inserted(E),
}

impl<E> GetOrInsert<E> {
    pub fn was_inserted(&self) -> bool {
        matches!(self, GetOrInsert::Inserted(_))
    }

    pub fn get(&self) -> &E {
        match self {
            GetOrInsert::Found(e) | GetOrInsert::Inserted(e) => e,
        }
    }

    pub fn into_inner(self) -> E {
        match self {
            GetOrInsert::Found(e) | GetOrInsert::Inserted(e) => e,
        }
    }
}

/// A unit of work against a [`MetadataStore`].
///
/// Writes are collected and applied atomically by [`commit`](Self::commit).
#[derive(Debug)]
pub struct Session<'a> {
    store: &'a dyn MetadataStore,
    pending: Vec<Write>,
}

impl<'a> Session<'a> {
    pub fn new(store: &'a dyn MetadataStore) -> Self {
        Self {
            store,
            pending: Vec::new(),
        }
    }

    pub fn store(&self) -> &'a dyn MetadataStore {
        self.store
    }

    /// Reads committed state.
    pub async fn find<E: Entity>(&self, key: &RecordKey) -> Result<Option<E>, StoreError> {
        fetch(self.store, key).await
    }

    pub fn insert(&mut self, entity: impl Entity) {
        self.pending.push(Write::Insert(entity.into_record()));
    }

    pub fn update(&mut self, entity: impl Entity) {
        self.pending.push(Write::Update(entity.into_record()));
    }

    pub fn delete(&mut self, key: RecordKey) {
        self.pending.push(Write::Delete(key));
    }

    pub fn has_pending_changes(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Applies all pending writes. They are discarded on failure.
    pub async fn commit(&mut self) -> Result<(), StoreError> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let writes = std::mem::take(&mut self.pending);
        self.store.commit(writes).await
    }

    pub fn discard(&mut self) {
        self.pending.clear();
    }

    /// Returns the row stored under the key of `candidate`, inserting `candidate` if there is none.
    ///
    /// Exactly one of any number of concurrent callers inserts the row; all others observe it as
    /// [`Found`](GetOrInsert::Found). An existing row is never modified. The session must not
    /// have pending writes, as this commits on its own.
    pub async fn get_or_insert<E: Entity>(
        &mut self,
        candidate: E,
    ) -> Result<GetOrInsert<E>, StoreError> {
        self.get_or_insert_with(candidate, Vec::new()).await
    }

    /// Like [`get_or_insert`](Self::get_or_insert), inserting `dependents` in the same commit.
    ///
    /// A dependent whose key is already taken is dropped, and the insert is retried without it.
    pub async fn get_or_insert_with<E: Entity>(
        &mut self,
        candidate: E,
        mut dependents: Vec<Record>,
    ) -> Result<GetOrInsert<E>, StoreError> {
        if self.has_pending_changes() {
            return Err(StoreError::PendingChanges);
        }

        let key = candidate.key();
        if let Some(existing) = self.find::<E>(&key).await? {
            return Ok(GetOrInsert::Found(existing));
        }

        loop {
            let mut writes = Vec::with_capacity(1 + dependents.len());
            writes.push(Write::Insert(candidate.clone().into_record()));
            writes.extend(dependents.iter().cloned().map(Write::Insert));

            match self.store.commit(writes).await {
                Ok(()) => return Ok(GetOrInsert::Inserted(candidate)),
                Err(StoreError::UniqueViolation(violated)) if violated == key => {
                    tracing::debug!(%key, "concurrent insert won, reading it back");
                    return match self.find::<E>(&key).await? {
                        Some(winner) => Ok(GetOrInsert::Found(winner)),
                        None => Err(StoreError::Vanished(key)),
                    };
                }
                Err(StoreError::UniqueViolation(violated)) => {
                    let before = dependents.len();
                    dependents.retain(|dependent| dependent.key() != violated);
                    if dependents.len() == before {
                        return Err(StoreError::UniqueViolation(violated));
                    }
                    tracing::info!(key = %violated, "skipping row that is already claimed");
                }
                Err(err) => return Err(err),
            }
        }
    }
}
