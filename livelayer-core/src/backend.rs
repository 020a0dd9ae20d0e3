//! Storage backend abstraction for collections.
//!
//! A collection keeps its documents in a key/value style backend addressed by `_id`. The
//! query engine never asks the backend to filter anything: it either fetches documents by id
//! or scans the whole collection through a read stream and matches in memory.
//!
//! # Overview
//!
//! The [`StorageBackend`] trait provides the async interface every backend implements.
//! Implementations must be thread-safe (`Send + Sync`) and must serialize their writes so a
//! reader never observes a partially written document.
//!
//! # Traits
//!
//! - [`StorageBackend`]: The core trait for storage backends
//! - [`StorageBackendBuilder`]: Factory trait for creating backend instances
//!
//! # Examples
//!
//! ```ignore
//! use livelayer::backend::StorageBackend;
//! use bson::{Bson, doc};
//!
//! let backend = MyBackendImpl::new();
//! let id = Bson::String("alice".into());
//!
//! backend.persist(&id, doc! { "_id": "alice", "age": 30 }).await?;
//! assert!(backend.get(&id).await?.is_some());
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use async_trait::async_trait;
use bson::{Bson, Document};
use futures::stream::BoxStream;
use std::{fmt::Debug, sync::Arc};

use crate::error::DocumentStoreResult;

/// A stream over every document of a collection. It ends once the collection is exhausted.
pub type DocumentStream = BoxStream<'static, DocumentStoreResult<Document>>;


/// Abstract interface for collection storage backends.
///
/// The trait is object safe; collections hold their backend as `Arc<dyn StorageBackend>`.
///
/// # Thread Safety
///
/// All implementations must be thread-safe and support concurrent access from multiple
/// async tasks. Writes must be serialized: `persist` and `delete` calls on the same backend
/// must not interleave in a way visible to readers.
///
/// # Error Handling
///
/// Operations return [`DocumentStoreResult<T>`](crate::error::DocumentStoreResult).
/// Backends report their own failures as
/// [`DocumentStoreError::Backend`](crate::error::DocumentStoreError::Backend).
#[async_trait]
pub trait StorageBackend: Send + Sync + Debug {
    /// Fetches a document by id.
    ///
    /// # Arguments
    ///
    /// * `id` - The `_id` of the document
    ///
    /// # Returns
    ///
    /// Returns `Ok(Some(doc))` when the document exists and `Ok(None)` otherwise.
    async fn get(&self, id: &Bson) -> DocumentStoreResult<Option<Document>>;

    /// Stores a document under `id`, replacing any previous version.
    ///
    /// # Arguments
    ///
    /// * `id` - The `_id` of the document
    /// * `doc` - The full document, including its `_id` field
    ///
    /// # Returns
    ///
    /// Returns `Ok(())` once the write is visible to subsequent reads.
    async fn persist(&self, id: &Bson, doc: Document) -> DocumentStoreResult<()>;

    /// Deletes a document. Deleting an unknown id is not an error.
    ///
    /// # Arguments
    ///
    /// * `id` - The `_id` of the document
    async fn delete(&self, id: &Bson) -> DocumentStoreResult<()>;

    /// Opens a stream over every stored document, in storage order.
    ///
    /// The stream reflects the collection as of the call; writes made while it is consumed
    /// may or may not be observed.
    async fn create_read_stream(&self) -> DocumentStoreResult<DocumentStream>;
}

#[async_trait]
impl<B> StorageBackend for &B
where
    B: StorageBackend,
{
    async fn get(&self, id: &Bson) -> DocumentStoreResult<Option<Document>> {
        (*self).get(id).await
    }

    async fn persist(&self, id: &Bson, doc: Document) -> DocumentStoreResult<()> {
        (*self).persist(id, doc).await
    }

    async fn delete(&self, id: &Bson) -> DocumentStoreResult<()> {
        (*self).delete(id).await
    }

    async fn create_read_stream(&self) -> DocumentStoreResult<DocumentStream> {
        (*self).create_read_stream().await
    }
}

#[async_trait]
impl<B> StorageBackend for Arc<B>
where
    B: StorageBackend + ?Sized,
{
    async fn get(&self, id: &Bson) -> DocumentStoreResult<Option<Document>> {
        self.as_ref().get(id).await
    }

    async fn persist(&self, id: &Bson, doc: Document) -> DocumentStoreResult<()> {
        self.as_ref().persist(id, doc).await
    }

    async fn delete(&self, id: &Bson) -> DocumentStoreResult<()> {
        self.as_ref().delete(id).await
    }

    async fn create_read_stream(&self) -> DocumentStoreResult<DocumentStream> {
        self.as_ref().create_read_stream().await
    }
}

/// Factory trait for constructing storage backends.
///
/// # Example
///
/// ```ignore
/// use livelayer::memory::InMemoryStorage;
///
/// let storage = InMemoryStorage::builder().build().await?;
/// ```
#[async_trait]
pub trait StorageBackendBuilder {
    type Backend: StorageBackend;

    async fn build(self) -> DocumentStoreResult<Self::Backend>;
}
