//! Storage and collection fixtures for unit tests.

use std::sync::{Arc, Mutex};
use async_trait::async_trait;
use bson::{Bson, Document};
use futures::stream;

use crate::{
    backend::{DocumentStream, StorageBackend},
    collection::Collection,
    error::{DocumentStoreError, DocumentStoreResult},
    index::IdKey,
};


/// An insertion-ordered storage backend behind a plain mutex.
#[derive(Debug, Clone, Default)]
pub(crate) struct TestStorage {
    docs: Arc<Mutex<Vec<(IdKey, Document)>>>,
    writes_left: Arc<Mutex<Option<usize>>>,
}

impl TestStorage {
    /// Lets `count` more writes succeed, then fails every write after them.
    pub(crate) fn fail_writes_after(&self, count: usize) {
        *self.writes_left.lock().unwrap() = Some(count);
    }

    fn take_write(&self) -> DocumentStoreResult<()> {
        match self.writes_left.lock().unwrap().as_mut() {
            Some(0) => Err(DocumentStoreError::Backend("storage unavailable".to_string())),
            Some(left) => {
                *left -= 1;
                Ok(())
            }
            None => Ok(()),
        }
    }
}

#[async_trait]
impl StorageBackend for TestStorage {
    async fn get(&self, id: &Bson) -> DocumentStoreResult<Option<Document>> {
        let key = IdKey::from(id);

        Ok(
            self.docs
                .lock()
                .unwrap()
                .iter()
                .find(|(existing, _)| *existing == key)
                .map(|(_, doc)| doc.clone())
        )
    }

    async fn persist(&self, id: &Bson, doc: Document) -> DocumentStoreResult<()> {
        self.take_write()?;

        let key = IdKey::from(id);
        let mut docs = self.docs.lock().unwrap();

        match docs.iter_mut().find(|(existing, _)| *existing == key) {
            Some((_, slot)) => *slot = doc,
            None => docs.push((key, doc)),
        }

        Ok(())
    }

    async fn delete(&self, id: &Bson) -> DocumentStoreResult<()> {
        self.take_write()?;

        let key = IdKey::from(id);
        self.docs.lock().unwrap().retain(|(existing, _)| *existing != key);

        Ok(())
    }

    async fn create_read_stream(&self) -> DocumentStoreResult<DocumentStream> {
        let docs: Vec<DocumentStoreResult<Document>> = self
            .docs
            .lock()
            .unwrap()
            .iter()
            .map(|(_, doc)| Ok(doc.clone()))
            .collect();

        Ok(Box::pin(stream::iter(docs)))
    }
}

/// An empty collection over [`TestStorage`].
pub(crate) async fn collection(name: &str) -> Collection {
    Collection::builder(name)
        .storage(TestStorage::default())
        .build()
        .await
        .unwrap()
}
