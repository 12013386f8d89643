//! Manager lifecycle tests against the in-memory document server.

#![cfg(feature = "memory")]

use std::{sync::Arc, time::Duration};

use chrono::Duration as TimeDelta;
use sessionvault_core::{
    Document, DocumentCollection, FieldValue, ManagerConfig, Session, SessionStore,
    document::fields, session::now,
};
use sessionvault_session::{
    ManagerError, SessionManager,
    storage::{MemoryCollection, MemoryServer},
};

fn config() -> ManagerConfig {
    ManagerConfig::new("local")
        .with_collection_name("web_sessions")
        .with_background_interval(Duration::ZERO)
}

async fn shared_manager(
    config: ManagerConfig,
    collection: &Arc<MemoryCollection>,
) -> Arc<SessionManager> {
    let manager = SessionManager::builder(config)
        .collection(collection.clone())
        .build()
        .await
        .unwrap();
    Arc::new(manager)
}

#[tokio::test]
async fn test_start_creates_collection_once() {
    let server = MemoryServer::new();
    let collection = server.collection("local", "web_sessions");

    let first = shared_manager(config(), &collection).await;
    first.start().await.unwrap();
    assert_eq!(server.collection_names("local"), vec!["web_sessions"]);

    // A second manager finds the collection already there.
    let second = shared_manager(config(), &collection).await;
    second.start().await.unwrap();
    assert_eq!(server.collection_names("local"), vec!["web_sessions"]);

    first.stop().await.unwrap();
    second.stop().await.unwrap();
}

#[tokio::test]
async fn test_save_load_and_expire() {
    let collection = MemoryServer::new().collection("local", "web_sessions");
    let manager = shared_manager(config(), &collection).await;
    manager.start().await.unwrap();
    let store = manager.store();

    let mut session = Session::new("abc", 1800);
    session.set_attribute("key", "value");
    store.save(&session).await.unwrap();
    assert_eq!(store.size().await.unwrap(), 1);

    let loaded = store.load("abc").await.unwrap();
    assert_eq!(loaded.attribute("key").and_then(|v| v.as_str()), Some("value"));

    session.set_last_accessed_time(now() - TimeDelta::hours(5));
    store.save(&session).await.unwrap();
    assert_eq!(store.expired_keys().await.unwrap(), vec!["abc"]);

    manager.process_expires().await.unwrap();
    assert_eq!(store.size().await.unwrap(), 0);

    manager.stop().await.unwrap();
}

#[tokio::test]
async fn test_managers_share_one_collection() {
    let collection = MemoryServer::new().collection("local", "web_sessions");
    let one = shared_manager(config(), &collection).await;
    let two = shared_manager(config(), &collection).await;
    one.start().await.unwrap();
    two.start().await.unwrap();

    let session = one.create_session().await;
    one.with_session(session.id(), |s| {
        s.set_attribute("cart", 3_i64);
        s.set_principal(Some("alice".to_string()));
    })
    .await
    .unwrap();

    // Force the session out to the store.
    one.process_persistence_checks().await.unwrap();

    let seen = two.find_session(session.id()).await.unwrap().unwrap();
    assert_eq!(seen.id(), session.id());
    assert_eq!(seen.principal_name(), "alice");
    assert_eq!(seen.attribute("cart").and_then(|v| v.as_i64()), Some(3));
    assert_eq!(seen.attributes().len(), 1);

    one.stop().await.unwrap();
    two.stop().await.unwrap();
}

#[tokio::test]
async fn test_remove_deletes_from_store() {
    let collection = MemoryServer::new().collection("local", "web_sessions");
    let manager = shared_manager(config().with_max_idle_swap(-1), &collection).await;
    manager.start().await.unwrap();

    let session = manager.create_session().await;
    manager.store().save(&session).await.unwrap();
    manager.remove(session.id()).await.unwrap();

    assert!(manager.find_session(session.id()).await.unwrap().is_none());
    assert_eq!(collection.count().await.unwrap(), 0);
    manager.stop().await.unwrap();
}

#[tokio::test]
async fn test_clear_store() {
    let collection = MemoryServer::new().collection("local", "web_sessions");
    let manager = shared_manager(config(), &collection).await;
    manager.start().await.unwrap();

    for _ in 0..3 {
        manager.create_session().await;
    }
    manager.process_persistence_checks().await.unwrap();
    assert_eq!(collection.count().await.unwrap(), 3);

    manager.clear_store().await.unwrap();
    assert_eq!(collection.count().await.unwrap(), 0);
    assert_eq!(manager.active_count().await, 0);
    manager.stop().await.unwrap();
}

#[tokio::test]
async fn test_sessions_survive_restart() {
    let collection = MemoryServer::new().collection("local", "web_sessions");
    let config = config().with_max_idle_swap(-1).with_max_idle_backup(-1);

    let first = shared_manager(config.clone(), &collection).await;
    first.start().await.unwrap();
    let session = first.create_session().await;
    first
        .with_session(session.id(), |s| s.set_attribute("theme", "dark"))
        .await
        .unwrap();
    first.stop().await.unwrap();
    assert_eq!(collection.count().await.unwrap(), 1);

    let second = shared_manager(config, &collection).await;
    second.start().await.unwrap();
    assert_eq!(second.list_session_ids().await, vec![session.id().to_string()]);
    let restored = second.find_session(session.id()).await.unwrap().unwrap();
    assert_eq!(restored.attribute("theme").and_then(|v| v.as_str()), Some("dark"));
    second.stop().await.unwrap();
}

#[tokio::test]
async fn test_start_skips_unreadable_documents() {
    let collection = MemoryServer::new().collection("local", "web_sessions");
    collection
        .put_raw(
            Document::new()
                .with(fields::ID, FieldValue::String("broken".into()))
                .with(fields::DATA, FieldValue::Binary(vec![0xde, 0xad])),
        )
        .unwrap();

    let manager = shared_manager(config().with_max_idle_swap(-1), &collection).await;
    manager.store().save(&Session::new("good", 1800)).await.unwrap();

    manager.start().await.unwrap();
    assert_eq!(manager.list_session_ids().await, vec!["good".to_string()]);
    manager.stop().await.unwrap();
}

#[tokio::test]
async fn test_shared_connection_left_open() {
    let collection = MemoryServer::new().collection("local", "web_sessions");
    let manager = shared_manager(config(), &collection).await;
    assert!(!manager.owns_connection());

    manager.start().await.unwrap();
    manager.stop().await.unwrap();

    assert!(!collection.is_closed());
    assert_eq!(manager.store().size().await.unwrap(), 0);
}

#[tokio::test]
async fn test_owned_connection_closed_on_stop() {
    let server = MemoryServer::new();
    let config = config()
        .with_hosts(["localhost"])
        .with_credentials("app", "secret");
    let manager = SessionManager::builder(config)
        .driver(server.clone())
        .build()
        .await
        .unwrap();
    assert!(manager.owns_connection());

    manager.stop().await.unwrap();
    assert!(manager.store().size().await.is_err());

    // Other handles to the same collection are unaffected.
    let other = server.collection("local", "web_sessions");
    assert_eq!(other.count().await.unwrap(), 0);
}

#[tokio::test]
async fn test_owned_connection_needs_credentials() {
    let result = SessionManager::builder(config().with_hosts(["localhost"]))
        .driver(MemoryServer::new())
        .build()
        .await;
    assert!(matches!(result, Err(ManagerError::Config(_))));
}

#[tokio::test]
async fn test_unreachable_store_fails_start() {
    let collection = MemoryServer::new().collection("local", "web_sessions");
    collection.set_unavailable(true);
    let manager = shared_manager(config(), &collection).await;

    assert!(matches!(manager.start().await, Err(ManagerError::Store(_))));

    collection.set_unavailable(false);
    manager.start().await.unwrap();
    manager.stop().await.unwrap();
}
