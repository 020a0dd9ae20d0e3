#![allow(dead_code)]

use std::{sync::{Arc, Mutex}, time::Duration};
use livelayer::{bson::Bson, prelude::*};


pub type Seen = Arc<Mutex<Vec<ObserveUpdate>>>;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

/// A listener that records every update it receives.
pub fn recorder() -> (Seen, impl Fn(&ObserveUpdate) + Send + Sync + 'static) {
    let seen: Seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();

    (seen, move |update: &ObserveUpdate| sink.lock().unwrap().push(update.clone()))
}

/// The `_id`s of an array of documents.
pub fn ids(result: &Bson) -> Vec<Bson> {
    result
        .as_array()
        .unwrap()
        .iter()
        .map(|doc| doc.as_document().unwrap().get("_id").unwrap().clone())
        .collect()
}

/// Lets every pending debounce timer fire.
pub async fn settle() {
    tokio::time::sleep(Duration::from_secs(1)).await;
}
