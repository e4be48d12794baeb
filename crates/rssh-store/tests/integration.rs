//! Integration tests for rssh-store
//!
//! Exercises the SQL slot store against a real SQLite in-memory database

use rssh_store::{connect, migrate, SlotStore, SqlSlotStore};
use sea_orm::ConnectionTrait;
use std::sync::Arc;
use std::time::Duration;

const TTL: Duration = Duration::from_secs(30);

/// Helper to create a test store
async fn setup_test_store() -> SqlSlotStore {
    SqlSlotStore::connect("sqlite::memory:")
        .await
        .expect("Failed to create in-memory slot store")
}

#[tokio::test]
async fn test_database_connection() {
    let db = connect("sqlite::memory:").await.expect("Failed to connect");

    let backend = db.get_database_backend();
    assert!(matches!(backend, sea_orm::DatabaseBackend::Sqlite));
}

#[tokio::test]
async fn test_migrations_run_successfully() {
    let db = connect("sqlite::memory:").await.expect("Failed to connect");

    assert!(migrate(&db).await.is_ok());
    // Running twice is a no-op
    assert!(migrate(&db).await.is_ok());
}

#[tokio::test]
async fn test_cas_reserves_absent_key() {
    let store = setup_test_store().await;

    assert!(store
        .compare_and_swap("slot/127.0.0.1/31240", None, "foo", TTL)
        .await
        .unwrap());
    assert!(!store
        .compare_and_swap("slot/127.0.0.1/31240", None, "bar", TTL)
        .await
        .unwrap());

    let owner = store.get("slot/127.0.0.1/31240").await.unwrap();
    assert_eq!(owner.as_deref(), Some("foo"));
}

#[tokio::test]
async fn test_cas_with_expected_owner() {
    let store = setup_test_store().await;
    store.compare_and_swap("k", None, "foo", TTL).await.unwrap();

    assert!(!store
        .compare_and_swap("k", Some("bar"), "baz", TTL)
        .await
        .unwrap());
    assert!(store
        .compare_and_swap("k", Some("foo"), "baz", TTL)
        .await
        .unwrap());
    assert_eq!(store.get("k").await.unwrap().as_deref(), Some("baz"));
}

#[tokio::test]
async fn test_compare_and_delete() {
    let store = setup_test_store().await;
    store.compare_and_swap("k", None, "foo", TTL).await.unwrap();

    assert!(!store.compare_and_delete("k", "bar").await.unwrap());
    assert!(store.compare_and_delete("k", "foo").await.unwrap());
    assert!(!store.compare_and_delete("k", "foo").await.unwrap());
    assert_eq!(store.get("k").await.unwrap(), None);
}

#[tokio::test]
async fn test_expired_lease_can_be_taken_over() {
    let store = setup_test_store().await;
    store
        .compare_and_swap("k", None, "foo", Duration::from_millis(50))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(150)).await;

    assert_eq!(store.get("k").await.unwrap(), None);
    assert!(!store.renew("k", "foo", TTL).await.unwrap());
    assert!(!store.compare_and_delete("k", "foo").await.unwrap());
    assert!(store.compare_and_swap("k", None, "bar", TTL).await.unwrap());
    assert_eq!(store.get("k").await.unwrap().as_deref(), Some("bar"));
}

#[tokio::test]
async fn test_renew_keeps_lease_alive() {
    let store = setup_test_store().await;
    store
        .compare_and_swap("k", None, "foo", Duration::from_millis(200))
        .await
        .unwrap();

    assert!(store.renew("k", "foo", TTL).await.unwrap());
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert_eq!(store.get("k").await.unwrap().as_deref(), Some("foo"));
}

#[tokio::test]
async fn test_purge_expired() {
    let store = setup_test_store().await;
    store
        .compare_and_swap("short", None, "a", Duration::from_millis(20))
        .await
        .unwrap();
    store.compare_and_swap("long", None, "b", TTL).await.unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(store.purge_expired().await.unwrap(), 1);
    assert_eq!(store.get("long").await.unwrap().as_deref(), Some("b"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_cas_single_winner() {
    let store = Arc::new(setup_test_store().await);

    let mut handles = Vec::new();
    for i in 0..16 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            store
                .compare_and_swap("slot/h/1", None, &format!("agent-{}", i), TTL)
                .await
                .unwrap()
        }));
    }

    let mut winners = 0;
    for handle in handles {
        if handle.await.unwrap() {
            winners += 1;
        }
    }
    assert_eq!(winners, 1);
}
