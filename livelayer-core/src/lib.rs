//! An embeddable document store with a MongoDB-like query language and live query results.
//!
//! This crate is the core of the livelayer project and provides:
//!
//! - **Path lookup** ([`lookup`]) - Resolving dotted paths into branches through nested arrays
//! - **Selector matching** ([`matcher`]) - Compiling and evaluating query selectors
//! - **Sorting** ([`sorter`]) - Sort specifications with MongoDB array semantics
//! - **Update modifiers** ([`modifier`]) - `$set`, `$inc`, `$push` and friends
//! - **Storage abstraction** ([`backend`]) - Traits for implementing storage backends
//! - **Collections** ([`collection`]) - Inserting, updating, removing and finding documents
//! - **Cursors** ([`cursor`]) - Query execution with a pipeline of post-processing stages
//! - **Observation** ([`observable`]) - Debounced, self-updating cursor results
//! - **Error handling** ([`error`]) - Error and result types
//!
//! # Example
//!
//! ```ignore
//! use livelayer::{prelude::*, memory::InMemoryStorage};
//! use bson::doc;
//!
//! let people = Collection::builder("people")
//!     .storage(InMemoryStorage::new())
//!     .build()
//!     .await?;
//!
//! people.insert(doc! { "_id": "a", "n": 1 }).await?;
//!
//! let cursor = people.find(doc! { "n": { "$gte": 1 } })?;
//! cursor.sort(doc! { "n": 1 })?;
//!
//! let stopper = cursor.observe(|update| {
//!     println!("{:?}", update.result());
//! })?;
//! ```

#[allow(unused_extern_crates)]
extern crate self as livelayer_core;

pub mod backend;
pub mod collection;
pub mod config;
pub mod cursor;
pub mod error;
pub mod events;
pub mod index;
pub mod lookup;
pub mod matcher;
pub mod modifier;
pub mod observable;
pub mod queue;
pub mod retriever;
pub mod sorter;
pub mod value;

#[cfg(test)]
mod testing;
