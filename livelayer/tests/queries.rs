mod common;

use serde::Deserialize;
use livelayer::{
    bson::{Bson, doc},
    memory::InMemoryStorage,
    prelude::*,
};

use common::init_tracing;


#[derive(Debug, Deserialize, PartialEq)]
struct Player {
    #[serde(rename = "_id")]
    id: String,
    score: i32,
}

#[tokio::test]
async fn test_push_each_sort_slice() {
    init_tracing();

    let games = livelayer::in_memory("games").await.unwrap();
    games.insert(doc! { "_id": "g", "scores": [{ "s": 2 }] }).await.unwrap();

    let result = games
        .update(
            doc! { "_id": "g" },
            doc! { "$push": { "scores": { "$each": [{ "s": 3 }, { "s": 1 }], "$sort": { "s": 1 }, "$slice": -2 } } },
        )
        .await
        .unwrap();

    assert_eq!(result.modified, 1);
    assert_eq!(
        games.find_one("g", None).await.unwrap(),
        Some(doc! { "_id": "g", "scores": [{ "s": 2 }, { "s": 3 }] }),
    );
}

#[tokio::test]
async fn test_sorting_parallel_arrays_fails() {
    init_tracing();

    let items = livelayer::in_memory("items").await.unwrap();
    items.insert_all(vec![
        doc! { "_id": 1, "a": [1, 2], "b": [3, 4] },
        doc! { "_id": 2, "a": [1, 2], "b": [3] },
    ]).await.unwrap();

    let cursor = items.find(doc! {}).unwrap();
    cursor.sort(doc! { "a": 1, "b": 1 }).unwrap();

    assert!(matches!(cursor.exec().await, Err(DocumentStoreError::Evaluation(_))));
}

#[tokio::test]
async fn test_typed_results() {
    init_tracing();

    let players = livelayer::in_memory("players").await.unwrap();
    players.insert_all(vec![
        doc! { "_id": "ann", "score": 12 },
        doc! { "_id": "bob", "score": 30 },
        doc! { "_id": "cid", "score": 21 },
    ]).await.unwrap();

    let cursor = players.find(doc! { "score": { "$gt": 15 } }).unwrap();
    cursor.sort(doc! { "score": -1 }).unwrap();

    let top: Vec<Player> = cursor.exec_as().await.unwrap();

    assert_eq!(top, vec![
        Player { id: "bob".into(), score: 30 },
        Player { id: "cid".into(), score: 21 },
    ]);
    assert_eq!(players.count(doc! {}).await.unwrap(), 3);
}

#[tokio::test]
async fn test_remove_requires_multi_for_several_documents() {
    init_tracing();

    let tasks = livelayer::in_memory("tasks").await.unwrap();
    tasks.insert_all(vec![
        doc! { "_id": 1, "done": true },
        doc! { "_id": 2, "done": true },
        doc! { "_id": 3, "done": false },
    ]).await.unwrap();

    let err = tasks.remove(doc! { "done": true }, RemoveOptions::default()).await.unwrap_err();
    assert!(matches!(err, DocumentStoreError::InvalidDocument(_)));
    assert_eq!(tasks.count(doc! {}).await.unwrap(), 3);

    let removed = tasks.remove(doc! { "done": true }, RemoveOptions::multi()).await.unwrap();
    assert_eq!(removed.len(), 2);
    assert_eq!(tasks.index_ids().await, vec![Bson::Int32(3)]);
}

#[tokio::test]
async fn test_collection_over_seeded_storage() {
    init_tracing();

    let storage = InMemoryStorage::builder()
        .documents(vec![
            doc! { "_id": "x", "tags": ["red", "blue"] },
            doc! { "_id": "y", "tags": ["green"] },
        ])
        .build()
        .await
        .unwrap();

    let config = CollectionConfig::from_json_str(r#"{ "batch_size": 3 }"#).unwrap();

    let colors = Collection::builder("colors")
        .storage(storage.clone())
        .config(config)
        .where_fn("has_two_tags", |doc| {
            doc.get_array("tags").map(|tags| tags.len() == 2).unwrap_or(false)
        })
        .build()
        .await
        .unwrap();

    assert_eq!(colors.config().batch_size, 3);
    assert_eq!(colors.index_ids().await, vec![Bson::from("x"), Bson::from("y")]);
    assert_eq!(colors.ids(doc! { "tags": "green" }).await.unwrap(), vec![Bson::from("y")]);
    assert_eq!(colors.ids(doc! { "$where": "has_two_tags" }).await.unwrap(), vec![Bson::from("x")]);

    colors.insert(doc! { "_id": "z", "tags": [] }).await.unwrap();
    assert_eq!(storage.len().await, 3);
}
