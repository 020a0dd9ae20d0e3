//! Convenient re-exports of commonly used types from livelayer.
//!
//! Import this prelude module to quickly access the most frequently used types
//! and traits without needing to import from multiple sub-modules:
//!
//! ```ignore
//! use livelayer::prelude::*;
//! ```

pub use livelayer_core::{
    backend::{StorageBackend, StorageBackendBuilder, DocumentStream},
    collection::{Collection, CollectionBuilder, InsertOptions, RemoveOptions, UpdateOptions, UpdateResult},
    config::CollectionConfig,
    cursor::{Cursor, JoinContext},
    error::{DocumentStoreError, DocumentStoreResult},
    events::{MutationEvent, SyncEvent},
    index::IndexOptions,
    matcher::{Matcher, MatchResult, Selector},
    modifier::{ApplyOptions, Modifier},
    observable::{ObserveOptions, ObserveUpdate, ObserverId, Reactor, Stopper},
    sorter::{SortSpec, Sorter},
};
