//! In-memory storage backend for livelayer.
//!
//! This crate provides a thread-safe, in-memory implementation of the `StorageBackend` trait.
//! It uses async-aware read-write locks for concurrent access and is ideal for embedding,
//! testing and small datasets.
//!
//! # Quick Start
//!
//! ```ignore
//! use livelayer::{prelude::*, memory::InMemoryStorage};
//! use bson::doc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let users = Collection::builder("users")
//!         .storage(InMemoryStorage::builder().build().await?)
//!         .build()
//!         .await?;
//!
//!     users.insert(doc! { "name": "Alice" }).await?;
//!
//!     Ok(())
//! }
//! ```

#[allow(unused_extern_crates)]
extern crate self as livelayer_memory;

pub mod storage;

pub use storage::{InMemoryStorage, InMemoryStorageBuilder};
