//! Candidate retrieval for cursors.
//!
//! Selectors that pin `_id` (a bare id, `{_id: id}` or `{_id: {$in: [...]}}`) are served
//! by fetching the listed ids from storage. Every other selector falls back to a full scan.
//! The result is a superset of the matching documents; the cursor still runs the matcher.

use std::sync::Arc;
use bson::{Bson, Document};
use futures::TryStreamExt;

use crate::{
    backend::StorageBackend,
    error::DocumentStoreResult,
    index::IndexManager,
    matcher::Selector,
};


/// Fetches candidate documents for a selector.
#[derive(Debug, Clone)]
pub struct DocumentRetriever {
    storage: Arc<dyn StorageBackend>,
    index: IndexManager,
}

impl DocumentRetriever {
    pub fn new(storage: Arc<dyn StorageBackend>, index: IndexManager) -> Self {
        Self { storage, index }
    }

    /// The ids a selector restricts retrieval to, or `None` when a scan is required.
    pub fn selector_ids(selector: &Selector) -> Option<Vec<Bson>> {
        if let Some(id) = selector.as_id() {
            return Some(vec![id.clone()]);
        }

        let Selector::Document(doc) = selector else {
            return None;
        };

        match doc.get("_id") {
            Some(Bson::Document(id_selector)) => match id_selector.get("$in") {
                Some(Bson::Array(ids)) if !ids.is_empty() => Some(ids.clone()),
                _ => None,
            },
            _ => None,
        }
    }

    /// Retrieves a superset of the documents matching `selector`.
    pub async fn retrieve_for_query(&self, selector: &Selector) -> DocumentStoreResult<Vec<Document>> {
        match Self::selector_ids(selector) {
            Some(ids) => {
                tracing::trace!(ids = ids.len(), "retrieving candidates by id");
                self.retrieve_ids(&ids).await
            }
            None => {
                tracing::trace!("retrieving candidates by full scan");
                self.retrieve_all().await
            }
        }
    }

    /// Every stored document, in storage order.
    pub async fn retrieve_all(&self) -> DocumentStoreResult<Vec<Document>> {
        self.storage.create_read_stream().await?.try_collect().await
    }

    /// The documents with the given ids, in the given order. Ids unknown to the index are
    /// skipped.
    pub async fn retrieve_ids(&self, ids: &[Bson]) -> DocumentStoreResult<Vec<Document>> {
        let mut docs = Vec::with_capacity(ids.len());

        for id in ids {
            if !self.index.contains(id).await {
                continue;
            }

            if let Some(doc) = self.storage.get(id).await? {
                docs.push(doc);
            }
        }

        Ok(docs)
    }
}
