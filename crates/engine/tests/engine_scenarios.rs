//! End-to-end engine scenarios: literal create/read/update/delete
//! behavior, concurrency outcomes, sanitization, and the realtime feed.

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use std::sync::Arc;

use common::{TestEngine, record};
use plinth_engine::{EngineConfig, FeedMessage, ListOptions, WriteBufferConfig};
use plinth_storage::Keyspace;
use plinth_types::{PlinthError, Record};
use serde_json::json;

#[tokio::test]
async fn test_create_shape_and_primary_row() {
    let t = TestEngine::new().with_posts_schema();
    let created = t
        .engine
        .create("posts", record(json!({"title": "a", "owner_id": "u1"})))
        .await
        .unwrap();

    let id = created.id().unwrap().to_string();
    assert_eq!(id.len(), 15);
    assert_eq!(created.version(), 1);
    assert_eq!(created.created(), created.updated());

    // The primary row under posts:{id} holds the record, owner_id included.
    let bytes = t.kv.get(Keyspace::Main, &format!("posts:{id}")).unwrap().unwrap();
    let row = Record::from_bytes(&bytes).unwrap();
    assert_eq!(row.get("owner_id"), Some(&json!("u1")));
    assert_eq!(row.get("title"), Some(&json!("a")));
    assert_eq!(row.version(), 1);
}

#[tokio::test]
async fn test_get_round_trip_and_not_found() {
    let t = TestEngine::new().with_posts_schema();
    let created =
        t.engine.create("posts", record(json!({"title": "a"}))).await.unwrap();
    let id = created.id().unwrap();

    let fetched = t.engine.get("posts", id).await.unwrap();
    assert_eq!(fetched, created);

    let err = t.engine.get("posts", "does-not-exist").await.unwrap_err();
    assert!(matches!(err, PlinthError::NotFound { .. }));
}

#[tokio::test]
async fn test_validation_rejected_before_any_write() {
    let t = TestEngine::new().with_posts_schema();
    let err = t.engine.create("posts", record(json!({"owner_id": "u1"}))).await.unwrap_err();
    assert!(matches!(err, PlinthError::Validation { .. }));
    assert_eq!(t.engine.stats().creates, 0);
}

#[tokio::test]
async fn test_indexed_list_ignores_scan_guard() {
    // Scan guard of 2 would truncate a primary scan; the owner_id index
    // must still see all three matching records.
    let t = TestEngine::with_configs(
        WriteBufferConfig::builder()
            .flush_interval(std::time::Duration::from_millis(2))
            .tick_interval(std::time::Duration::from_millis(1))
            .build(),
        EngineConfig::builder().max_scan_limit(2).build(),
    )
    .with_posts_schema();

    for (owner, n) in [("u1", 3), ("u2", 2)] {
        for i in 0..n {
            t.engine
                .create("posts", record(json!({"title": format!("{owner}-{i}"), "owner_id": owner})))
                .await
                .unwrap();
        }
    }

    let mut filter = serde_json::Map::new();
    filter.insert("owner_id".into(), json!("u1"));
    let page = t
        .engine
        .list("posts", ListOptions { filter, sort: None, page: 1, per_page: 30 })
        .await
        .unwrap();

    assert_eq!(page.total_items, 3);
    assert_eq!(page.items.len(), 3);
    assert!(page.items.iter().all(|r| r.get("owner_id") == Some(&json!("u1"))));
}

#[tokio::test]
async fn test_list_sort_and_pagination() {
    let t = TestEngine::new().with_posts_schema();
    for views in [5, 1, 9, 3, 7] {
        t.engine
            .create("posts", record(json!({"title": "t", "views": views})))
            .await
            .unwrap();
    }

    let page = t
        .engine
        .list(
            "posts",
            ListOptions {
                filter: serde_json::Map::new(),
                sort: Some("-views".into()),
                page: 1,
                per_page: 2,
            },
        )
        .await
        .unwrap();

    assert_eq!(page.total_items, 5);
    assert_eq!(page.total_pages, 3);
    let views: Vec<_> = page.items.iter().map(|r| r.get("views").cloned().unwrap()).collect();
    assert_eq!(views, vec![json!(9), json!(7)]);
}

#[tokio::test]
async fn test_list_filter_is_loose_across_types() {
    let t = TestEngine::new().with_posts_schema();
    t.engine.create("posts", record(json!({"title": "t", "views": 42}))).await.unwrap();

    let mut filter = serde_json::Map::new();
    filter.insert("views".into(), json!("42"));
    let page = t
        .engine
        .list("posts", ListOptions { filter, sort: None, page: 1, per_page: 10 })
        .await
        .unwrap();
    assert_eq!(page.total_items, 1);
}

#[tokio::test]
async fn test_concurrent_conflicting_updates_serialize() {
    let t = TestEngine::new().with_posts_schema();
    let created =
        t.engine.create("posts", record(json!({"title": "a"}))).await.unwrap();
    let id = created.id().unwrap().to_string();

    // Two writers, both expecting _version 1. One lands as version 2;
    // the other observes the conflict, retries against the re-read
    // record, and lands as version 3.
    let (a, b) = tokio::join!(
        t.engine.update("posts", &id, record(json!({"title": "from-a"})), Some(1)),
        t.engine.update("posts", &id, record(json!({"title": "from-b"})), Some(1)),
    );
    let mut versions = vec![a.unwrap().version(), b.unwrap().version()];
    versions.sort_unstable();
    assert_eq!(versions, vec![2, 3]);

    let final_record = t.engine.get("posts", &id).await.unwrap();
    assert_eq!(final_record.version(), 3);
    assert!(t.engine.stats().conflict_retries >= 1);
}

#[tokio::test]
async fn test_stale_expected_version_conflicts_without_retrying_forever() {
    let t = TestEngine::new().with_posts_schema();
    let created =
        t.engine.create("posts", record(json!({"title": "a"}))).await.unwrap();
    let id = created.id().unwrap().to_string();

    t.engine.update("posts", &id, record(json!({"title": "b"})), None).await.unwrap();

    // A serial caller with a stale expectation conflicts once; the
    // internal retry re-reads and applies the patch on top.
    let updated =
        t.engine.update("posts", &id, record(json!({"title": "c"})), Some(1)).await.unwrap();
    assert_eq!(updated.version(), 3);
}

#[tokio::test]
async fn test_concurrent_unique_creates_admit_exactly_one() {
    let t = TestEngine::new();
    let (a, b) = tokio::join!(
        t.engine.create("users", record(json!({"email": "x@y", "password": "h1"}))),
        t.engine.create("users", record(json!({"email": "x@y", "password": "h2"}))),
    );

    let outcomes = [a, b];
    let ok = outcomes.iter().filter(|r| r.is_ok()).count();
    assert_eq!(ok, 1, "exactly one create wins the unique email");
    let err = outcomes.into_iter().find_map(std::result::Result::err).unwrap();
    assert!(matches!(err, PlinthError::Uniqueness { ref field, .. } if field == "email"));
}

#[tokio::test]
async fn test_unique_value_reusable_after_delete() {
    let t = TestEngine::new().with_posts_schema();
    let first = t
        .engine
        .create("posts", record(json!({"title": "a", "slug": "hello"})))
        .await
        .unwrap();

    let err = t
        .engine
        .create("posts", record(json!({"title": "b", "slug": "hello"})))
        .await
        .unwrap_err();
    assert!(matches!(err, PlinthError::Uniqueness { .. }));

    t.engine.delete("posts", first.id().unwrap(), None).await.unwrap();
    t.engine
        .create("posts", record(json!({"title": "b", "slug": "hello"})))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_delete_removes_row_indexes_and_cache() {
    let t = TestEngine::new().with_posts_schema();
    let created = t
        .engine
        .create("posts", record(json!({"title": "a", "owner_id": "u1"})))
        .await
        .unwrap();
    let id = created.id().unwrap().to_string();
    let key = format!("posts:{id}");

    t.engine.get("posts", &id).await.unwrap();
    assert!(t.cache.get(&key).is_some());

    t.engine.delete("posts", &id, None).await.unwrap();

    assert!(t.kv.get(Keyspace::Main, &key).unwrap().is_none());
    assert!(t.cache.get(&key).is_none());
    let (start, end) = plinth_engine::keys::prefix_range(&format!("idx:posts:owner_id:u1:{id}"));
    assert!(t.kv.range(Keyspace::Indexes, &start, &end, None).unwrap().is_empty());

    let err = t.engine.get("posts", &id).await.unwrap_err();
    assert!(matches!(err, PlinthError::NotFound { .. }));
}

#[tokio::test]
async fn test_delete_honors_expected_version() {
    let t = TestEngine::new().with_posts_schema();
    let created =
        t.engine.create("posts", record(json!({"title": "a"}))).await.unwrap();
    let id = created.id().unwrap().to_string();

    // A mismatched precondition conflicts, the retry re-reads, and the
    // delete proceeds against the actual version.
    t.engine.delete("posts", &id, Some(9)).await.unwrap();
    assert!(t.kv.get(Keyspace::Main, &format!("posts:{id}")).unwrap().is_none());
}

#[tokio::test]
async fn test_private_fields_sanitized_but_preserved_on_update() {
    let t = TestEngine::new();
    let created = t
        .engine
        .create("users", record(json!({"email": "a@b", "password": "hash-1"})))
        .await
        .unwrap();
    assert!(created.get("password").is_none(), "create response is sanitized");
    let id = created.id().unwrap().to_string();

    // Patch that omits the private field entirely.
    let updated = t
        .engine
        .update("users", &id, record(json!({"email": "a@c"})), None)
        .await
        .unwrap();
    assert!(updated.get("password").is_none());

    // The stored row still carries the password: the diff base read is raw.
    let raw = t.engine.get_raw("users", &id).await.unwrap().unwrap();
    assert_eq!(raw.get("password"), Some(&json!("hash-1")));
    assert_eq!(raw.get("email"), Some(&json!("a@c")));
}

#[tokio::test]
async fn test_updated_strictly_advances_and_created_pinned() {
    let t = TestEngine::new().with_posts_schema();
    let created =
        t.engine.create("posts", record(json!({"title": "a"}))).await.unwrap();
    let id = created.id().unwrap().to_string();

    let mut last_updated = created.updated().unwrap().to_string();
    for i in 0..5 {
        let updated = t
            .engine
            .update("posts", &id, record(json!({"title": format!("t{i}")})), None)
            .await
            .unwrap();
        assert!(updated.updated().unwrap() > last_updated.as_str());
        assert_eq!(updated.created(), created.created(), "created never mutates");
        last_updated = updated.updated().unwrap().to_string();
    }
}

#[tokio::test]
async fn test_concurrent_cold_reads_converge() {
    let t = TestEngine::new().with_posts_schema();
    let created =
        t.engine.create("posts", record(json!({"title": "a"}))).await.unwrap();
    let id = created.id().unwrap().to_string();
    t.cache.delete(&format!("posts:{id}"));

    let mut tasks = Vec::new();
    for _ in 0..200 {
        let engine = Arc::clone(&t.engine);
        let id = id.clone();
        tasks.push(tokio::spawn(async move { engine.get("posts", &id).await }));
    }
    for task in tasks {
        assert_eq!(task.await.unwrap().unwrap().id(), Some(id.as_str()));
    }
}

#[tokio::test]
async fn test_subscriber_sees_exactly_the_committed_event() {
    let t = TestEngine::new().with_posts_schema();
    let (_id, mut rx) = t.broadcaster.subscribe();

    let created = t
        .engine
        .create("posts", record(json!({"title": "a", "owner_id": "u1"})))
        .await
        .unwrap();

    assert_eq!(rx.recv().await.unwrap(), FeedMessage::Connected);
    let FeedMessage::Event(payload) = rx.recv().await.unwrap() else {
        panic!("expected a change event after the connection marker");
    };
    let event: serde_json::Value = serde_json::from_str(&payload).unwrap();
    assert_eq!(event["collection"], "posts");
    assert_eq!(event["action"], "create");
    assert_eq!(event["data"]["id"], json!(created.id().unwrap()));
    assert_eq!(event["data"]["owner_id"], "u1");

    // The row is durable by the time the event is observable.
    let key = format!("posts:{}", created.id().unwrap());
    assert!(t.kv.get(Keyspace::Main, &key).unwrap().is_some());
}

#[tokio::test]
async fn test_cache_agrees_with_substrate_at_quiescence() {
    let t = TestEngine::new().with_posts_schema();
    let mut ids = Vec::new();
    for i in 0..20 {
        let r = t
            .engine
            .create("posts", record(json!({"title": format!("t{i}"), "views": i})))
            .await
            .unwrap();
        ids.push(r.id().unwrap().to_string());
    }
    for (i, id) in ids.iter().enumerate() {
        if i % 2 == 0 {
            t.engine
                .update("posts", id, record(json!({"views": 100 + i})), None)
                .await
                .unwrap();
        }
    }
    t.engine.delete("posts", &ids[1], None).await.unwrap();

    // Quiescent: every cached key agrees byte-for-byte with the substrate.
    let (start, end) = plinth_engine::keys::prefix_range("posts:");
    let rows = t.kv.range(Keyspace::Main, &start, &end, None).unwrap();
    for (key, bytes) in rows {
        if let Some(cached) = t.cache.get(&key) {
            assert_eq!(*cached, Record::from_bytes(&bytes).unwrap(), "{key}");
        }
    }
    assert!(t.cache.get(&format!("posts:{}", ids[1])).is_none());
}
