//! Collection configuration.
//!
//! # Example
//!
//! ```ignore
//! use livelayer_core::config::CollectionConfig;
//!
//! let config = CollectionConfig::from_json_str(r#"{ "batch_size": 25 }"#)?;
//! assert_eq!(config.write_concurrency, 1);
//! ```

use std::time::Duration;
use serde::{Deserialize, Serialize};

use crate::error::DocumentStoreResult;


/// Tunables shared by a collection and the cursors it creates.
///
/// Missing fields take their defaults when deserializing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectionConfig {
    /// Initial debounce interval of observed cursors, in milliseconds.
    pub debounce_wait_ms: f64,
    /// Pending triggers that force an observed cursor to recompute immediately. `0` never forces.
    pub batch_size: usize,
    /// Concurrent index writes admitted by the collection's task queue.
    pub write_concurrency: usize,
}

impl Default for CollectionConfig {
    fn default() -> Self {
        Self {
            debounce_wait_ms: 1000.0 / 15.0,
            batch_size: 10,
            write_concurrency: 1,
        }
    }
}

impl CollectionConfig {
    /// Parses a configuration from JSON.
    ///
    /// # Errors
    ///
    /// Returns [`DocumentStoreError::Serialization`](crate::error::DocumentStoreError::Serialization)
    /// when the input is not valid JSON or a field has the wrong type.
    pub fn from_json_str(json: &str) -> DocumentStoreResult<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn debounce_wait(&self) -> Duration {
        Duration::from_secs_f64(self.debounce_wait_ms.max(0.0) / 1000.0)
    }
}
