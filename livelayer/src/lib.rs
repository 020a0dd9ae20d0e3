//! Main livelayer crate providing an embeddable, reactive document store.
//!
//! This crate is the primary entry point for users of livelayer. It re-exports the core
//! types from the sub-crates and provides convenient access to the bundled storage backends.
//!
//! # Features
//!
//! - **MongoDB-like queries** - Selectors, sort specifications and update modifiers over BSON documents
//! - **Cursor pipelines** - Post-process matched documents with filters, maps, reductions and async joins
//! - **Live results** - Observe a cursor and receive debounced updates whenever a relevant document changes
//! - **Pluggable storage** - Implement [`backend::StorageBackend`] to keep documents anywhere
//!
//! # Quick Start
//!
//! ```ignore
//! use livelayer::prelude::*;
//! use bson::doc;
//!
//! #[tokio::main]
//! async fn main() -> DocumentStoreResult<()> {
//!     let todos = livelayer::in_memory("todos").await?;
//!
//!     todos.insert(doc! { "title": "write docs", "done": false }).await?;
//!
//!     let open = todos.find(doc! { "done": false })?;
//!     open.sort(doc! { "title": 1 })?;
//!
//!     let stopper = open.observe(|update| {
//!         println!("open todos: {:?}", update.result());
//!     })?;
//!     stopper.ready().await?;
//!
//!     todos.update(doc! {}, doc! { "$set": { "done": true } }).await?;
//!     stopper.stop();
//!
//!     Ok(())
//! }
//! ```
//!
//! # Joins
//!
//! Join stages can observe other cursors and link them to the joining cursor, so a change
//! in the joined collection re-emits the parent's result without re-running its query.
//!
//! ```ignore
//! let authors = livelayer::in_memory("authors").await?;
//! let posts = livelayer::in_memory("posts").await?;
//!
//! let cursor = posts.find(doc! {})?;
//! cursor.join_each(move |post, ctx| {
//!     let authors = authors.clone();
//!
//!     async move {
//!         let author_id = post.as_document().and_then(|p| p.get("author")).cloned();
//!         let child = authors.find(author_id.unwrap_or(Bson::Null))?;
//!
//!         if ctx.is_observed() {
//!             let patch = ctx.clone();
//!             let stopper = child.observe(move |update| {
//!                 if let Some(author) = update.result().cloned() {
//!                     patch.patch_latest(|post| set_author(post, author));
//!                     patch.propagate();
//!                 }
//!             })?;
//!             ctx.adopt(&stopper);
//!         }
//!
//!         Ok(post)
//!     }
//! })?;
//! ```
//!
//! # Backends
//!
//! - [`memory`] - In-memory storage for embedding and testing

pub mod prelude;

pub use livelayer_core::{
    backend,
    collection,
    config,
    cursor,
    error,
    events,
    index,
    lookup,
    matcher,
    modifier,
    observable,
    queue,
    retriever,
    sorter,
    value,
};

// Re-export BSON types for convenience
pub use bson;

use livelayer_core::{collection::Collection, error::DocumentStoreResult};


/// In-memory storage backend implementations.
pub mod memory {
    pub use livelayer_memory::{InMemoryStorage, InMemoryStorageBuilder};
}

/// Creates an empty collection named `name`, backed by a fresh [`memory::InMemoryStorage`]
/// and the default configuration.
///
/// # Example
///
/// ```ignore
/// let users = livelayer::in_memory("users").await?;
/// users.insert(bson::doc! { "name": "Alice" }).await?;
/// ```
pub async fn in_memory(name: impl Into<String>) -> DocumentStoreResult<Collection> {
    Collection::builder(name)
        .storage(memory::InMemoryStorage::new())
        .build()
        .await
}
