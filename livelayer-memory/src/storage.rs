//! In-memory storage implementation for collections.
//!
//! This module provides a simple backend that keeps documents in a `HashMap` keyed by their
//! `_id`, guarded by an async-safe read-write lock. Insertion order is tracked separately so
//! read streams are deterministic.

use std::{collections::HashMap, sync::Arc};
use async_trait::async_trait;
use bson::{Bson, Document};
use futures::stream;
use mea::rwlock::RwLock;

use livelayer_core::{
    backend::{DocumentStream, StorageBackend, StorageBackendBuilder},
    error::DocumentStoreResult,
    index::IdKey,
    queue::TaskQueue,
};


#[derive(Debug, Default)]
struct DocumentMap {
    docs: HashMap<IdKey, Document>,
    order: Vec<IdKey>,
}

/// Thread-safe in-memory storage backend.
///
/// `InMemoryStorage` is cloneable and uses an `Arc`-wrapped internal state, so clones share
/// the same documents. Writes are funnelled through a single-permit [`TaskQueue`] and never
/// interleave.
///
/// # Example
///
/// ```ignore
/// use livelayer::memory::InMemoryStorage;
/// use livelayer::backend::StorageBackend;
/// use bson::{Bson, doc};
///
/// let storage = InMemoryStorage::new();
/// let id = Bson::String("alice".into());
///
/// storage.persist(&id, doc! { "_id": "alice" }).await?;
/// assert!(storage.get(&id).await?.is_some());
/// ```
#[derive(Default, Clone, Debug)]
pub struct InMemoryStorage {
    store: Arc<RwLock<DocumentMap>>,
    writes: TaskQueue,
}

impl InMemoryStorage {
    /// Creates a new, empty storage.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a builder for constructing an `InMemoryStorage`.
    ///
    /// # Example
    ///
    /// ```ignore
    /// use livelayer::memory::InMemoryStorage;
    ///
    /// let storage = InMemoryStorage::builder().build().await?;
    /// ```
    pub fn builder() -> InMemoryStorageBuilder {
        InMemoryStorageBuilder::default()
    }

    /// Number of stored documents.
    pub async fn len(&self) -> usize {
        self.store.read().await.order.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl StorageBackend for InMemoryStorage {
    async fn get(&self, id: &Bson) -> DocumentStoreResult<Option<Document>> {
        Ok(
            self.store
                .read()
                .await
                .docs
                .get(&IdKey::from(id))
                .cloned()
        )
    }

    async fn persist(&self, id: &Bson, doc: Document) -> DocumentStoreResult<()> {
        let key = IdKey::from(id);
        tracing::trace!(id = %key, "persisting document");

        self.writes
            .run(async {
                let mut store = self.store.write().await;

                if store.docs.insert(key.clone(), doc).is_none() {
                    store.order.push(key);
                }
            })
            .await;

        Ok(())
    }

    async fn delete(&self, id: &Bson) -> DocumentStoreResult<()> {
        let key = IdKey::from(id);
        tracing::trace!(id = %key, "deleting document");

        self.writes
            .run(async {
                let mut store = self.store.write().await;

                if store.docs.remove(&key).is_some() {
                    store.order.retain(|existing| *existing != key);
                }
            })
            .await;

        Ok(())
    }

    async fn create_read_stream(&self) -> DocumentStoreResult<DocumentStream> {
        let store = self.store.read().await;
        let docs = store
            .order
            .iter()
            .filter_map(|key| store.docs.get(key))
            .map(|doc| Ok(doc.clone()))
            .collect::<Vec<_>>();

        Ok(Box::pin(stream::iter(docs)))
    }
}


/// Builder for constructing [`InMemoryStorage`] instances.
///
/// # Example
///
/// ```ignore
/// use livelayer::memory::InMemoryStorage;
/// use livelayer::backend::StorageBackendBuilder;
///
/// let storage = InMemoryStorage::builder()
///     .documents(vec![doc! { "_id": "a" }])
///     .build()
///     .await?;
/// ```
#[derive(Default, Debug)]
pub struct InMemoryStorageBuilder {
    documents: Vec<Document>,
}

impl InMemoryStorageBuilder {
    /// Seeds the storage with documents. Documents without an `_id` are skipped.
    pub fn documents(mut self, documents: impl IntoIterator<Item = Document>) -> Self {
        self.documents.extend(documents);
        self
    }
}

#[async_trait]
impl StorageBackendBuilder for InMemoryStorageBuilder {
    type Backend = InMemoryStorage;

    async fn build(self) -> DocumentStoreResult<Self::Backend> {
        let storage = InMemoryStorage::new();

        for doc in self.documents {
            if let Some(id) = doc.get("_id").cloned() {
                storage.persist(&id, doc).await?;
            }
        }

        Ok(storage)
    }
}
