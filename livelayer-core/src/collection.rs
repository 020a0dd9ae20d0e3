//! Collections of documents.
//!
//! A [`Collection`] ties together a storage backend, the `_id` index, the mutation event bus
//! and the reactor that keeps observed cursors current. Every mutation is indexed and
//! persisted before its event is emitted, so observers only ever hear about committed
//! changes. Unless asked to stay quiet, a mutation is first announced on the
//! [`sync_events`](Collection::sync_events) bus, before anything is written.
//!
//! # Example
//!
//! ```ignore
//! use livelayer::{prelude::*, memory::InMemoryStorage};
//! use bson::doc;
//!
//! let users = Collection::builder("users")
//!     .storage(InMemoryStorage::new())
//!     .build()
//!     .await?;
//!
//! let id = users.insert(doc! { "name": "Alice", "age": 30 }).await?;
//! users.update(doc! { "_id": id.clone() }, doc! { "$inc": { "age": 1 } }).await?;
//!
//! let alice = users.find_one(id, None).await?;
//! ```

use std::{fmt, sync::Arc};
use bson::{Bson, Document};
use uuid::Uuid;

use crate::{
    backend::StorageBackend,
    config::CollectionConfig,
    cursor::Cursor,
    error::{DocumentStoreError, DocumentStoreResult},
    events::{EventBus, MutationEvent, SyncEvent},
    index::{IndexManager, IndexOptions, document_id},
    matcher::{Matcher, Selector, WhereRegistry},
    modifier::{ApplyOptions, Modifier},
    observable::Reactor,
    retriever::DocumentRetriever,
    sorter::SortSpec,
    value::is_truthy,
};

/// Produces `_id`s for inserted documents that lack one.
pub type IdGenerator = Arc<dyn Fn() -> Bson + Send + Sync>;


/// Options for [`Collection::insert_with`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InsertOptions {
    /// Skip the [`SyncEvent`] announcing the insert.
    pub quiet: bool,
}

impl InsertOptions {
    pub fn quiet() -> Self {
        Self { quiet: true }
    }
}

/// Options for [`Collection::update_with`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpdateOptions {
    /// Skip the [`SyncEvent`] announcing the update.
    pub quiet: bool,
}

impl UpdateOptions {
    pub fn quiet() -> Self {
        Self { quiet: true }
    }
}

/// Options for [`Collection::remove`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RemoveOptions {
    /// Allow removing more than one document.
    pub multi: bool,
    /// Skip the [`SyncEvent`] announcing the removal.
    pub quiet: bool,
}

impl RemoveOptions {
    pub fn multi() -> Self {
        Self { multi: true, quiet: false }
    }
}

/// Outcome of [`Collection::update`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpdateResult {
    /// Number of updated documents.
    pub modified: usize,
    /// The matched documents before the update.
    pub original: Vec<Document>,
    /// The matched documents after the update, in the same order.
    pub updated: Vec<Document>,
}

struct CollectionInner {
    name: String,
    storage: Arc<dyn StorageBackend>,
    index: IndexManager,
    events: EventBus,
    sync_events: EventBus<SyncEvent>,
    reactor: Reactor,
    config: CollectionConfig,
    registry: WhereRegistry,
    id_generator: IdGenerator,
}

/// A named set of documents.
///
/// Cloning a collection is cheap; clones share storage, index, events and reactor.
#[derive(Clone)]
pub struct Collection {
    inner: Arc<CollectionInner>,
}

impl Collection {
    pub fn builder(name: impl Into<String>) -> CollectionBuilder {
        CollectionBuilder::new(name)
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn config(&self) -> &CollectionConfig {
        &self.inner.config
    }

    /// The bus this collection emits mutation events on.
    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    /// The bus this collection announces mutations on before applying them.
    pub fn sync_events(&self) -> &EventBus<SyncEvent> {
        &self.inner.sync_events
    }

    /// The reactor holding this collection's observed cursors.
    pub fn reactor(&self) -> &Reactor {
        &self.inner.reactor
    }

    pub fn storage(&self) -> &Arc<dyn StorageBackend> {
        &self.inner.storage
    }

    /// Predicates that `$where` clauses of this collection's selectors resolve against.
    pub fn where_registry(&self) -> &WhereRegistry {
        &self.inner.registry
    }

    pub(crate) fn retriever(&self) -> DocumentRetriever {
        DocumentRetriever::new(self.inner.storage.clone(), self.inner.index.clone())
    }

    /// Inserts a document, generating an `_id` when it has none, and returns its `_id`.
    ///
    /// # Errors
    ///
    /// Returns [`DocumentStoreError::InvalidDocument`] when the `_id` is already taken or a
    /// unique index rejects the document, and propagates storage failures. A document that
    /// failed to persist is not indexed.
    pub async fn insert(&self, doc: Document) -> DocumentStoreResult<Bson> {
        self.insert_with(doc, InsertOptions::default()).await
    }

    /// Like [`insert`](Self::insert), with options.
    pub async fn insert_with(&self, doc: Document, options: InsertOptions) -> DocumentStoreResult<Bson> {
        let doc = self.with_id(doc);
        let id = document_id(&doc)?.clone();

        if !options.quiet {
            self.inner.sync_events.emit(&SyncEvent::Insert { doc: doc.clone() });
        }

        self.inner.index.index_document(&doc).await?;

        if let Err(err) = self.inner.storage.persist(&id, doc.clone()).await {
            self.inner.index.deindex_document(&doc).await?;
            return Err(err);
        }

        tracing::debug!(collection = self.name(), id = %id, "document inserted");
        self.inner.events.emit(&MutationEvent::Insert { doc });

        Ok(id)
    }

    /// Inserts documents one after another, stopping at the first failure.
    pub async fn insert_all<I>(&self, docs: I) -> DocumentStoreResult<Vec<Bson>>
    where
        I: IntoIterator<Item = Document>,
    {
        self.insert_all_with(docs, InsertOptions::default()).await
    }

    pub async fn insert_all_with<I>(&self, docs: I, options: InsertOptions) -> DocumentStoreResult<Vec<Bson>>
    where
        I: IntoIterator<Item = Document>,
    {
        let mut ids = Vec::new();

        for doc in docs {
            ids.push(self.insert_with(doc, options).await?);
        }

        Ok(ids)
    }

    fn with_id(&self, doc: Document) -> Document {
        if is_truthy(doc.get("_id")) {
            return doc;
        }

        let mut with_id = Document::new();
        with_id.insert("_id", (self.inner.id_generator)());

        for (key, value) in doc {
            if key != "_id" {
                with_id.insert(key, value);
            }
        }

        with_id
    }

    async fn modify_matching(&self, matcher: &Matcher, modifier: &Modifier) -> DocumentStoreResult<(Vec<Document>, Vec<Document>)> {
        let candidates = self.retriever().retrieve_for_query(matcher.selector()).await?;
        let mut original = Vec::new();
        let mut updated = Vec::new();

        for doc in candidates {
            let matched = matcher.document_matches(&doc)?;

            if !matched.result {
                continue;
            }

            let options = ApplyOptions {
                array_indices: matched.array_indices,
                is_insert: false,
            };

            updated.push(modifier.apply(&doc, &options)?);
            original.push(doc);
        }

        Ok((original, updated))
    }

    /// Applies `modifier` to every document matching `selector`.
    ///
    /// Every document is modified before anything is written, so a modifier failing on one
    /// document leaves the whole collection untouched. Writes then happen document by
    /// document. If one fails, the documents written before it keep their new contents and
    /// still get their update events, and the error is returned.
    ///
    /// # Errors
    ///
    /// Returns [`DocumentStoreError::Compile`] for malformed selectors or modifiers,
    /// [`DocumentStoreError::Modifier`] when the modifier cannot be applied to a matched
    /// document, [`DocumentStoreError::InvalidDocument`] when a unique index rejects an
    /// updated document, and propagates storage failures.
    pub async fn update(&self, selector: impl Into<Selector>, modifier: Document) -> DocumentStoreResult<UpdateResult> {
        self.update_with(selector, modifier, UpdateOptions::default()).await
    }

    /// Like [`update`](Self::update), with options.
    pub async fn update_with(
        &self,
        selector: impl Into<Selector>,
        modifier: Document,
        options: UpdateOptions,
    ) -> DocumentStoreResult<UpdateResult> {
        let selector = selector.into();

        if !options.quiet {
            self.inner.sync_events.emit(&SyncEvent::Update {
                selector: selector.clone(),
                modifier: modifier.clone(),
            });
        }

        let matcher = Matcher::with_registry(selector, &self.inner.registry)?;
        let modifier = Modifier::new(&modifier)?;

        let (original, updated) = self.modify_matching(&matcher, &modifier).await?;

        let mut written = 0;
        let mut failure = None;

        for (old, new) in original.iter().zip(&updated) {
            if let Err(err) = self.write_update(old, new).await {
                failure = Some(err);
                break;
            }

            written += 1;
        }

        tracing::debug!(collection = self.name(), modified = written, "documents updated");

        for (old, new) in original.iter().zip(&updated).take(written) {
            self.inner.events.emit(&MutationEvent::Update { new: new.clone(), old: old.clone() });
        }

        if let Some(err) = failure {
            tracing::warn!(
                collection = self.name(),
                written,
                matched = updated.len(),
                error = %err,
                "update stopped part way"
            );
            return Err(err);
        }

        Ok(UpdateResult {
            modified: updated.len(),
            original,
            updated,
        })
    }

    async fn write_update(&self, old: &Document, new: &Document) -> DocumentStoreResult<()> {
        let id = document_id(new)?;

        self.inner.index.reindex_document(old, new).await?;

        if let Err(err) = self.inner.storage.persist(id, new.clone()).await {
            self.inner.index.reindex_document(new, old).await?;
            return Err(err);
        }

        Ok(())
    }

    /// Removes the documents matching `selector` and returns them.
    ///
    /// Documents are deleted one by one. If a deletion fails, the documents deleted before
    /// it still get their remove events, and the error is returned.
    ///
    /// # Errors
    ///
    /// Returns [`DocumentStoreError::InvalidDocument`] when more than one document matches
    /// and `options.multi` is not set; nothing is removed in that case.
    pub async fn remove(&self, selector: impl Into<Selector>, options: RemoveOptions) -> DocumentStoreResult<Vec<Document>> {
        let selector = selector.into();

        if !options.quiet {
            self.inner.sync_events.emit(&SyncEvent::Remove {
                selector: selector.clone(),
                multi: options.multi,
            });
        }

        let docs: Vec<Document> = self.find(selector)?.exec_as().await?;

        if docs.len() > 1 && !options.multi {
            return Err(DocumentStoreError::InvalidDocument(
                "remove(..): multi removing is not enabled by options.multi".to_string()
            ));
        }

        let mut removed = 0;
        let mut failure = None;

        for doc in &docs {
            if let Err(err) = self.delete_document(doc).await {
                failure = Some(err);
                break;
            }

            removed += 1;
        }

        tracing::debug!(collection = self.name(), removed, "documents removed");

        for doc in docs.iter().take(removed) {
            self.inner.events.emit(&MutationEvent::Remove { old: doc.clone() });
        }

        if let Some(err) = failure {
            tracing::warn!(
                collection = self.name(),
                removed,
                matched = docs.len(),
                error = %err,
                "remove stopped part way"
            );
            return Err(err);
        }

        Ok(docs)
    }

    async fn delete_document(&self, doc: &Document) -> DocumentStoreResult<()> {
        self.inner.storage.delete(document_id(doc)?).await?;
        self.inner.index.deindex_document(doc).await
    }

    /// Adds a field index, building it from the stored documents. A `unique` index makes
    /// later inserts and updates fail with [`DocumentStoreError::InvalidDocument`] when they
    /// would duplicate a value.
    pub async fn ensure_index(&self, options: IndexOptions) -> DocumentStoreResult<()> {
        self.inner.index.ensure_index(options, self.inner.storage.as_ref()).await
    }

    /// Drops a field index. Returns `false` if there was none.
    pub async fn remove_index(&self, field_name: &str) -> bool {
        self.inner.index.remove_index(field_name).await
    }

    /// The indexed fields, `_id` first.
    pub async fn indexes(&self) -> Vec<String> {
        self.inner.index.indexes().await
    }

    /// Creates a cursor over the documents matching `selector`.
    ///
    /// # Errors
    ///
    /// Returns [`DocumentStoreError::Compile`] when the selector is malformed.
    pub fn find(&self, selector: impl Into<Selector>) -> DocumentStoreResult<Cursor> {
        Cursor::new(self.clone(), selector)
    }

    /// Returns the first document matching `selector` in `sort` order.
    pub async fn find_one(&self, selector: impl Into<Selector>, sort: Option<SortSpec>) -> DocumentStoreResult<Option<Document>> {
        let cursor = self.find(selector)?;

        if let Some(sort) = sort {
            cursor.sort(sort)?;
        }

        let docs: Vec<Document> = cursor.limit(1)?.exec_as().await?;

        Ok(docs.into_iter().next())
    }

    /// Counts the documents matching `selector`.
    pub async fn count(&self, selector: impl Into<Selector>) -> DocumentStoreResult<usize> {
        Ok(self.ids(selector).await?.len())
    }

    /// The `_id`s of the documents matching `selector`.
    pub async fn ids(&self, selector: impl Into<Selector>) -> DocumentStoreResult<Vec<Bson>> {
        self.find(selector)?.ids().await
    }

    /// Every indexed `_id`, in insertion order.
    pub async fn index_ids(&self) -> Vec<Bson> {
        self.inner.index.ids().await
    }
}

impl fmt::Debug for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collection")
            .field("name", &self.inner.name)
            .field("storage", &self.inner.storage)
            .field("config", &self.inner.config)
            .finish()
    }
}

/// Builder for [`Collection`].
pub struct CollectionBuilder {
    name: String,
    storage: Option<Arc<dyn StorageBackend>>,
    config: CollectionConfig,
    reactor: Option<Reactor>,
    id_generator: Option<IdGenerator>,
    registry: WhereRegistry,
}

impl CollectionBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            storage: None,
            config: CollectionConfig::default(),
            reactor: None,
            id_generator: None,
            registry: WhereRegistry::new(),
        }
    }

    /// Sets the storage backend. Required.
    pub fn storage<B>(mut self, storage: B) -> Self
    where
        B: StorageBackend + 'static,
    {
        self.storage = Some(Arc::new(storage));
        self
    }

    pub fn config(mut self, config: CollectionConfig) -> Self {
        self.config = config;
        self
    }

    /// Shares a reactor with other collections. Each collection gets its own otherwise.
    pub fn reactor(mut self, reactor: Reactor) -> Self {
        self.reactor = Some(reactor);
        self
    }

    /// Replaces the default generator of random UUID strings.
    pub fn id_generator<F>(mut self, generator: F) -> Self
    where
        F: Fn() -> Bson + Send + Sync + 'static,
    {
        self.id_generator = Some(Arc::new(generator));
        self
    }

    /// Registers a predicate `$where` clauses can name.
    pub fn where_fn<F>(mut self, name: impl Into<String>, predicate: F) -> Self
    where
        F: Fn(&Document) -> bool + Send + Sync + 'static,
    {
        self.registry.register(name, predicate);
        self
    }

    /// Builds the collection and indexes the documents already in storage.
    ///
    /// # Errors
    ///
    /// Returns [`DocumentStoreError::Backend`] when no storage was set, and
    /// [`DocumentStoreError::InvalidDocument`] when stored documents lack an `_id` or share one.
    pub async fn build(self) -> DocumentStoreResult<Collection> {
        let Some(storage) = self.storage else {
            return Err(DocumentStoreError::Backend(format!("collection {} has no storage backend", self.name)));
        };

        let index = IndexManager::new(self.config.write_concurrency);
        index.rebuild(storage.as_ref()).await?;

        tracing::debug!(collection = %self.name, documents = index.len().await, "collection ready");

        let id_generator: IdGenerator = match self.id_generator {
            Some(generator) => generator,
            None => Arc::new(|| Bson::String(Uuid::new_v4().simple().to_string())),
        };

        Ok(Collection {
            inner: Arc::new(CollectionInner {
                name: self.name,
                storage,
                index,
                events: EventBus::new(),
                sync_events: EventBus::new(),
                reactor: self.reactor.unwrap_or_default(),
                config: self.config,
                registry: self.registry,
                id_generator,
            }),
        })
    }
}

impl fmt::Debug for CollectionBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CollectionBuilder")
            .field("name", &self.name)
            .field("storage", &self.storage)
            .field("config", &self.config)
            .finish()
    }
}
