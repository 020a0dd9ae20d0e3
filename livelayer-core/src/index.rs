//! Collection indexes.
//!
//! Every collection keeps an index of the ids it holds, in insertion order. Id-shaped
//! selectors use it to fetch documents directly instead of scanning storage, and
//! [`Collection::count`](crate::collection::Collection::count) style operations can answer
//! from it without touching documents at all.
//!
//! Field indexes are added with [`IndexManager::ensure_index`]. They map the value of one
//! field to the ids holding it and reject writes that would break a `unique` constraint.

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    fmt,
    sync::Arc,
};
use bson::{Bson, Document};
use futures::TryStreamExt;
use mea::rwlock::RwLock;

use crate::{
    backend::StorageBackend,
    error::{DocumentStoreError, DocumentStoreResult},
    queue::TaskQueue,
};


/// A hashable, canonical form of a document id.
///
/// Numbers compare by value regardless of their BSON encoding, so `1`, `1i64` and `1.0`
/// are the same key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum IdKey {
    String(String),
    Int(i64),
    Double(u64),
    ObjectId([u8; 12]),
    Other(String),
}

impl From<&Bson> for IdKey {
    fn from(value: &Bson) -> Self {
        match value {
            Bson::String(s) => IdKey::String(s.clone()),
            Bson::Int32(v) => IdKey::Int(*v as i64),
            Bson::Int64(v) => IdKey::Int(*v),
            Bson::Double(v) if v.fract() == 0.0 && v.abs() < i64::MAX as f64 => IdKey::Int(*v as i64),
            Bson::Double(v) => IdKey::Double(v.to_bits()),
            Bson::ObjectId(oid) => IdKey::ObjectId(oid.bytes()),
            other => IdKey::Other(other.to_string()),
        }
    }
}

impl From<Bson> for IdKey {
    fn from(value: Bson) -> Self {
        IdKey::from(&value)
    }
}

impl fmt::Display for IdKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IdKey::String(s) => write!(f, "{:?}", s),
            IdKey::Int(v) => write!(f, "{}", v),
            IdKey::Double(bits) => write!(f, "{}", f64::from_bits(*bits)),
            IdKey::ObjectId(bytes) => write!(f, "ObjectId({})", bson::oid::ObjectId::from_bytes(*bytes).to_hex()),
            IdKey::Other(repr) => f.write_str(repr),
        }
    }
}

/// Returns the `_id` of a document, failing when it has none.
pub fn document_id(doc: &Document) -> DocumentStoreResult<&Bson> {
    match doc.get("_id") {
        Some(id) => Ok(id),
        None => Err(DocumentStoreError::InvalidDocument("document has no _id".to_string())),
    }
}

#[derive(Debug, Default)]
struct IdIndex {
    keys: HashSet<IdKey>,
    order: Vec<Bson>,
}

impl IdIndex {
    fn insert(&mut self, id: &Bson) -> DocumentStoreResult<()> {
        if !self.keys.insert(IdKey::from(id)) {
            return Err(DocumentStoreError::InvalidDocument(format!("duplicate _id: {}", id)));
        }

        self.order.push(id.clone());
        Ok(())
    }

    fn remove(&mut self, id: &Bson) {
        let key = IdKey::from(id);

        if self.keys.remove(&key) {
            self.order.retain(|existing| IdKey::from(existing) != key);
        }
    }
}

/// Options for [`IndexManager::ensure_index`].
///
/// # Example
///
/// ```ignore
/// use livelayer::index::IndexOptions;
///
/// users.ensure_index(IndexOptions::new("email").unique().sparse()).await?;
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexOptions {
    /// Dotted path of the indexed field.
    pub field_name: String,
    /// Reject documents whose field value is already held by another document.
    pub unique: bool,
    /// Leave documents without the field out of the index. Otherwise a missing field is
    /// indexed as `null`.
    pub sparse: bool,
    /// Rebuild the index from storage even if it already exists.
    pub force_rebuild: bool,
}

impl IndexOptions {
    pub fn new(field_name: impl Into<String>) -> Self {
        Self {
            field_name: field_name.into(),
            unique: false,
            sparse: false,
            force_rebuild: false,
        }
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn sparse(mut self) -> Self {
        self.sparse = true;
        self
    }

    pub fn force_rebuild(mut self) -> Self {
        self.force_rebuild = true;
        self
    }
}

fn field_value<'a>(doc: &'a Document, path: &str) -> Option<&'a Bson> {
    let mut parts = path.split('.');
    let mut current = doc.get(parts.next()?)?;

    for part in parts {
        current = match current {
            Bson::Document(inner) => inner.get(part)?,
            _ => return None,
        };
    }

    Some(current)
}

#[derive(Debug)]
struct FieldIndex {
    options: IndexOptions,
    entries: HashMap<IdKey, HashSet<IdKey>>,
}

impl FieldIndex {
    fn new(options: IndexOptions) -> Self {
        Self { options, entries: HashMap::new() }
    }

    fn key(&self, doc: &Document) -> Option<(IdKey, Bson)> {
        match field_value(doc, &self.options.field_name) {
            Some(value) => Some((IdKey::from(value), value.clone())),
            None if self.options.sparse => None,
            None => Some((IdKey::from(&Bson::Null), Bson::Null)),
        }
    }

    /// Fails when `doc` would take a unique value held by a document not in `owners`.
    fn check(&self, doc: &Document, owners: &[&IdKey]) -> DocumentStoreResult<()> {
        if !self.options.unique {
            return Ok(());
        }

        let Some((key, value)) = self.key(doc) else {
            return Ok(());
        };

        let taken = self
            .entries
            .get(&key)
            .is_some_and(|holders| holders.iter().any(|holder| !owners.contains(&holder)));

        if taken {
            return Err(DocumentStoreError::InvalidDocument(format!(
                "duplicate value for unique index {}: {}",
                self.options.field_name, value
            )));
        }

        Ok(())
    }

    fn insert(&mut self, doc: &Document, id: IdKey) {
        if let Some((key, _)) = self.key(doc) {
            self.entries.entry(key).or_default().insert(id);
        }
    }

    fn remove(&mut self, doc: &Document, id: &IdKey) {
        let Some((key, _)) = self.key(doc) else {
            return;
        };

        if let Some(holders) = self.entries.get_mut(&key) {
            holders.remove(id);

            if holders.is_empty() {
                self.entries.remove(&key);
            }
        }
    }

    fn build(options: IndexOptions, docs: &[Document]) -> DocumentStoreResult<Self> {
        let mut index = Self::new(options);

        for doc in docs {
            let id = IdKey::from(document_id(doc)?);
            index.check(doc, &[])?;
            index.insert(doc, id);
        }

        Ok(index)
    }
}

/// Manages the indexes of a collection: the unique `_id` index and any field indexes
/// ensured on top of it.
///
/// All writes go through a [`TaskQueue`], so index maintenance never runs more than the
/// configured number of updates at once. Clones share the same indexes.
#[derive(Clone, Debug)]
pub struct IndexManager {
    index: Arc<RwLock<IdIndex>>,
    fields: Arc<RwLock<BTreeMap<String, FieldIndex>>>,
    queue: TaskQueue,
}

impl Default for IndexManager {
    fn default() -> Self {
        Self::new(1)
    }
}

impl IndexManager {
    pub fn new(concurrency: usize) -> Self {
        Self {
            index: Arc::new(RwLock::new(IdIndex::default())),
            fields: Arc::new(RwLock::new(BTreeMap::new())),
            queue: TaskQueue::new(concurrency),
        }
    }

    /// Adds a document to every index. Nothing is indexed when any index rejects it.
    ///
    /// # Errors
    ///
    /// Returns [`DocumentStoreError::InvalidDocument`] when the document has no `_id`, its
    /// `_id` is already indexed, or it breaks a unique field index.
    pub async fn index_document(&self, doc: &Document) -> DocumentStoreResult<()> {
        let id = document_id(doc)?;
        let key = IdKey::from(id);

        self.queue
            .run(async {
                let mut index = self.index.write().await;
                let mut fields = self.fields.write().await;

                if index.keys.contains(&key) {
                    return Err(DocumentStoreError::InvalidDocument(format!("duplicate _id: {}", id)));
                }

                for field in fields.values() {
                    field.check(doc, &[])?;
                }

                index.insert(id)?;

                for field in fields.values_mut() {
                    field.insert(doc, key.clone());
                }

                Ok(())
            })
            .await
    }

    /// Replaces the indexed entries of `old` with `new`.
    pub async fn reindex_document(&self, old: &Document, new: &Document) -> DocumentStoreResult<()> {
        let old_id = document_id(old)?;
        let new_id = document_id(new)?;
        let old_key = IdKey::from(old_id);
        let new_key = IdKey::from(new_id);

        self.queue
            .run(async {
                let mut index = self.index.write().await;
                let mut fields = self.fields.write().await;

                let moved = old_key != new_key;

                if moved && index.keys.contains(&new_key) {
                    return Err(DocumentStoreError::InvalidDocument(format!("duplicate _id: {}", new_id)));
                }

                for field in fields.values() {
                    field.check(new, &[&old_key, &new_key])?;
                }

                if moved {
                    index.remove(old_id);
                    index.insert(new_id)?;
                }

                for field in fields.values_mut() {
                    field.remove(old, &old_key);
                    field.insert(new, new_key.clone());
                }

                Ok(())
            })
            .await
    }

    /// Removes a document from every index. Unknown documents are ignored.
    pub async fn deindex_document(&self, doc: &Document) -> DocumentStoreResult<()> {
        let id = document_id(doc)?;
        let key = IdKey::from(id);

        self.queue
            .run(async {
                self.index.write().await.remove(id);

                for field in self.fields.write().await.values_mut() {
                    field.remove(doc, &key);
                }
            })
            .await;

        Ok(())
    }

    pub async fn contains(&self, id: &Bson) -> bool {
        self.index.read().await.keys.contains(&IdKey::from(id))
    }

    /// All indexed ids, in insertion order.
    pub async fn ids(&self) -> Vec<Bson> {
        self.index.read().await.order.clone()
    }

    pub async fn len(&self) -> usize {
        self.index.read().await.order.len()
    }

    /// Creates a field index and builds it from every document in `storage`.
    ///
    /// An existing index is left alone unless `options.force_rebuild` is set. The `_id`
    /// index always exists and is never rebuilt here.
    ///
    /// # Errors
    ///
    /// Returns [`DocumentStoreError::InvalidDocument`] when stored documents already break
    /// the unique constraint; the index is not created in that case.
    pub async fn ensure_index(&self, options: IndexOptions, storage: &dyn StorageBackend) -> DocumentStoreResult<()> {
        if options.field_name.is_empty() {
            return Err(DocumentStoreError::InvalidDocument("an index needs a field name".to_string()));
        }

        if options.field_name == "_id" {
            return Ok(());
        }

        if !options.force_rebuild && self.fields.read().await.contains_key(&options.field_name) {
            return Ok(());
        }

        let docs: Vec<Document> = storage.create_read_stream().await?.try_collect().await?;

        self.queue
            .run(async {
                let field_name = options.field_name.clone();
                let built = FieldIndex::build(options, &docs)?;

                tracing::debug!(field = %field_name, values = built.entries.len(), "field index built");
                self.fields.write().await.insert(field_name, built);
                Ok(())
            })
            .await
    }

    /// Drops a field index. Returns `false` if there was none.
    pub async fn remove_index(&self, field_name: &str) -> bool {
        self.queue
            .run(async {
                self.fields.write().await.remove(field_name).is_some()
            })
            .await
    }

    /// The indexed fields, `_id` first.
    pub async fn indexes(&self) -> Vec<String> {
        let fields = self.fields.read().await;

        std::iter::once("_id".to_string())
            .chain(fields.keys().cloned())
            .collect()
    }

    /// Discards every index and rebuilds them from every document in `storage`.
    pub async fn rebuild(&self, storage: &dyn StorageBackend) -> DocumentStoreResult<()> {
        let docs: Vec<Document> = storage.create_read_stream().await?.try_collect().await?;

        self.queue
            .run(async {
                let mut rebuilt = IdIndex::default();

                for doc in &docs {
                    rebuilt.insert(document_id(doc)?)?;
                }

                let mut index = self.index.write().await;
                let mut fields = self.fields.write().await;
                let mut rebuilt_fields = BTreeMap::new();

                for (name, field) in fields.iter() {
                    rebuilt_fields.insert(name.clone(), FieldIndex::build(field.options.clone(), &docs)?);
                }

                *index = rebuilt;
                *fields = rebuilt_fields;
                Ok(())
            })
            .await
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    #[test]
    fn test_numeric_keys_ignore_encoding() {
        assert_eq!(IdKey::from(&Bson::Int32(1)), IdKey::from(&Bson::Int64(1)));
        assert_eq!(IdKey::from(&Bson::Int32(1)), IdKey::from(&Bson::Double(1.0)));
        assert_ne!(IdKey::from(&Bson::Double(1.5)), IdKey::from(&Bson::Int32(1)));
        assert_ne!(IdKey::from(&Bson::String("1".into())), IdKey::from(&Bson::Int32(1)));
    }

    #[tokio::test]
    async fn test_index_lifecycle() {
        let index = IndexManager::default();

        index.index_document(&doc! { "_id": "a" }).await.unwrap();
        index.index_document(&doc! { "_id": "b" }).await.unwrap();
        index.index_document(&doc! { "_id": "c" }).await.unwrap();
        assert!(index.index_document(&doc! { "_id": "a" }).await.is_err());
        assert!(index.index_document(&doc! { "name": "no id" }).await.is_err());

        index.deindex_document(&doc! { "_id": "b" }).await.unwrap();

        assert_eq!(index.ids().await, vec![Bson::String("a".into()), Bson::String("c".into())]);
        assert!(index.contains(&Bson::String("c".into())).await);
        assert!(!index.contains(&Bson::String("b".into())).await);
        assert_eq!(index.len().await, 2);
    }

    #[tokio::test]
    async fn test_unique_field_index() {
        let index = IndexManager::default();
        let storage = crate::testing::TestStorage::default();

        index.ensure_index(IndexOptions::new("email").unique(), &storage).await.unwrap();
        index.index_document(&doc! { "_id": 1, "email": "a@x" }).await.unwrap();

        let err = index.index_document(&doc! { "_id": 2, "email": "a@x" }).await.unwrap_err();
        assert!(matches!(err, DocumentStoreError::InvalidDocument(_)));
        assert!(!index.contains(&Bson::Int32(2)).await);

        // a missing field counts as null unless the index is sparse
        index.index_document(&doc! { "_id": 3 }).await.unwrap();
        assert!(index.index_document(&doc! { "_id": 4 }).await.is_err());

        index
            .reindex_document(&doc! { "_id": 1, "email": "a@x" }, &doc! { "_id": 1, "email": "b@x" })
            .await
            .unwrap();
        index.index_document(&doc! { "_id": 2, "email": "a@x" }).await.unwrap();

        index.deindex_document(&doc! { "_id": 2, "email": "a@x" }).await.unwrap();
        index.index_document(&doc! { "_id": 5, "email": "a@x" }).await.unwrap();

        assert_eq!(index.indexes().await, vec!["_id".to_string(), "email".to_string()]);
        assert!(index.remove_index("email").await);
        index.index_document(&doc! { "_id": 6, "email": "a@x" }).await.unwrap();
    }

    #[tokio::test]
    async fn test_ensure_index_rejects_existing_duplicates() {
        let index = IndexManager::default();
        let storage = crate::testing::TestStorage::default();

        storage.persist(&Bson::Int32(1), doc! { "_id": 1, "user": { "name": "ann" } }).await.unwrap();
        storage.persist(&Bson::Int32(2), doc! { "_id": 2, "user": { "name": "ann" } }).await.unwrap();
        storage.persist(&Bson::Int32(3), doc! { "_id": 3 }).await.unwrap();

        let err = index
            .ensure_index(IndexOptions::new("user.name").unique(), &storage)
            .await
            .unwrap_err();
        assert!(matches!(err, DocumentStoreError::InvalidDocument(_)));
        assert_eq!(index.indexes().await, vec!["_id".to_string()]);

        index.ensure_index(IndexOptions::new("user.name"), &storage).await.unwrap();
        assert_eq!(index.indexes().await, vec!["_id".to_string(), "user.name".to_string()]);
    }
}
