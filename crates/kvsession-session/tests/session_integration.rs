#![allow(clippy::unwrap_used, clippy::expect_used)]

use async_trait::async_trait;
use kvsession_core::{SessionConfig, SessionError, SessionId, SessionResult};
use kvsession_security::IdGenerator;
use kvsession_session::{
    CommitOutcome, CreateOutcome, DeleteOutcome, InMemoryKeyValueStore, KeyValueStore,
    SessionManager, SessionState, UpdateOutcome, Versioned,
};
use serde_json::json;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

const SECRET: &str = "integration-secret-0123456789abcdef";

fn config() -> SessionConfig {
    SessionConfig {
        secret_key: Some(SECRET.to_string()),
        ..SessionConfig::default()
    }
}

/// Helper: a manager over a fresh in-memory store.
fn manager(config: SessionConfig) -> (SessionManager, Arc<InMemoryKeyValueStore>) {
    let kv = Arc::new(InMemoryKeyValueStore::new());
    let manager = SessionManager::new(Arc::new(config), kv.clone()).unwrap();
    (manager, kv)
}

async fn create_session(manager: &SessionManager) -> SessionId {
    let mut handle = manager.resolve(None).await.unwrap();
    handle.set("user", json!("alice"));
    match manager.commit(&mut handle).await.unwrap() {
        CommitOutcome::Committed { id, .. } => id,
        other => panic!("expected commit, got {other:?}"),
    }
}

// ---------------------------------------------------------------------------
// Test doubles for the key-value capability
// ---------------------------------------------------------------------------

/// Fails every call, like an unreachable backend.
struct DownStore;

#[async_trait]
impl KeyValueStore for DownStore {
    async fn get(&self, _key: &str) -> SessionResult<Option<Versioned>> {
        Err(SessionError::StoreUnavailable("connection refused".into()))
    }
    async fn put_if_absent(&self, _key: &str, _value: Vec<u8>) -> SessionResult<CreateOutcome> {
        Err(SessionError::StoreUnavailable("connection refused".into()))
    }
    async fn put_if_version(
        &self,
        _key: &str,
        _expected: u64,
        _value: Vec<u8>,
    ) -> SessionResult<UpdateOutcome> {
        Err(SessionError::StoreUnavailable("connection refused".into()))
    }
    async fn delete(&self, _key: &str) -> SessionResult<bool> {
        Err(SessionError::StoreUnavailable("connection refused".into()))
    }
    async fn delete_if_version(&self, _key: &str, _expected: u64) -> SessionResult<DeleteOutcome> {
        Err(SessionError::StoreUnavailable("connection refused".into()))
    }
    async fn scan(&self, _prefix: &str) -> SessionResult<Vec<(String, Versioned)>> {
        Err(SessionError::StoreUnavailable("connection refused".into()))
    }
}

/// Delays reads longer than any test deadline.
struct SlowStore {
    inner: InMemoryKeyValueStore,
}

#[async_trait]
impl KeyValueStore for SlowStore {
    async fn get(&self, key: &str) -> SessionResult<Option<Versioned>> {
        tokio::time::sleep(Duration::from_secs(5)).await;
        self.inner.get(key).await
    }
    async fn put_if_absent(&self, key: &str, value: Vec<u8>) -> SessionResult<CreateOutcome> {
        self.inner.put_if_absent(key, value).await
    }
    async fn put_if_version(
        &self,
        key: &str,
        expected: u64,
        value: Vec<u8>,
    ) -> SessionResult<UpdateOutcome> {
        self.inner.put_if_version(key, expected, value).await
    }
    async fn delete(&self, key: &str) -> SessionResult<bool> {
        self.inner.delete(key).await
    }
    async fn delete_if_version(&self, key: &str, expected: u64) -> SessionResult<DeleteOutcome> {
        self.inner.delete_if_version(key, expected).await
    }
    async fn scan(&self, prefix: &str) -> SessionResult<Vec<(String, Versioned)>> {
        self.inner.scan(prefix).await
    }
}

/// Simulates a concurrent writer landing just before the first conditional write.
struct RacingStore {
    inner: InMemoryKeyValueStore,
    raced: AtomicBool,
}

#[async_trait]
impl KeyValueStore for RacingStore {
    async fn get(&self, key: &str) -> SessionResult<Option<Versioned>> {
        self.inner.get(key).await
    }
    async fn put_if_absent(&self, key: &str, value: Vec<u8>) -> SessionResult<CreateOutcome> {
        self.inner.put_if_absent(key, value).await
    }
    async fn put_if_version(
        &self,
        key: &str,
        expected: u64,
        value: Vec<u8>,
    ) -> SessionResult<UpdateOutcome> {
        if !self.raced.swap(true, Ordering::SeqCst) {
            let current = self.inner.get(key).await?.unwrap();
            self.inner
                .put_if_version(key, current.version, current.value)
                .await?;
        }
        self.inner.put_if_version(key, expected, value).await
    }
    async fn delete(&self, key: &str) -> SessionResult<bool> {
        self.inner.delete(key).await
    }
    async fn delete_if_version(&self, key: &str, expected: u64) -> SessionResult<DeleteOutcome> {
        self.inner.delete_if_version(key, expected).await
    }
    async fn scan(&self, prefix: &str) -> SessionResult<Vec<(String, Versioned)>> {
        self.inner.scan(prefix).await
    }
}

/// Hands out a fixed sequence of IDs.
struct ScriptedIds {
    ids: Vec<&'static str>,
    next: AtomicUsize,
}

impl IdGenerator for ScriptedIds {
    fn generate(&self) -> SessionResult<SessionId> {
        let index = self.next.fetch_add(1, Ordering::SeqCst);
        let raw = self.ids.get(index).copied().unwrap_or("exhausted");
        Ok(SessionId::parse(raw).unwrap())
    }
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_unknown_session_id_gets_new_session() {
    let (manager, _kv) = manager(config());

    let mut handle = manager.resolve(Some("abc123")).await.unwrap();
    assert_eq!(handle.state(), SessionState::New);
    assert_eq!(handle.presented_id().unwrap().as_str(), "abc123");

    handle.set("user", json!("alice"));
    let outcome = manager.commit(&mut handle).await.unwrap();
    let CommitOutcome::Committed { id, version, .. } = outcome else {
        panic!("expected commit");
    };
    assert_ne!(id.as_str(), "abc123");
    assert_eq!(version, 1);

    let reloaded = manager.resolve(Some(id.as_str())).await.unwrap();
    assert_eq!(reloaded.get("user"), Some(&json!("alice")));
}

#[tokio::test]
async fn test_unknown_session_rejected_when_strict() {
    let (manager, _kv) = manager(SessionConfig {
        strict_staleness: true,
        ..config()
    });
    assert!(matches!(
        manager.resolve(Some("abc123")).await,
        Err(SessionError::StaleSession)
    ));
}

#[tokio::test]
async fn test_valid_session_without_changes_is_discarded() {
    let (manager, _kv) = manager(config());
    let id = create_session(&manager).await;

    let mut handle = manager.resolve(Some(id.as_str())).await.unwrap();
    let _ = handle.get("user");
    assert_eq!(
        manager.commit(&mut handle).await.unwrap(),
        CommitOutcome::Discarded
    );
    assert_eq!(manager.store().get(&id).await.unwrap().version, 1);
}

#[tokio::test]
async fn test_exactly_one_concurrent_writer_wins() {
    let (manager, _kv) = manager(config());
    let id = create_session(&manager).await;
    let manager = Arc::new(manager);

    let mut first = manager.resolve(Some(id.as_str())).await.unwrap();
    let mut second = manager.resolve(Some(id.as_str())).await.unwrap();
    first.set("cart", json!(["book"]));
    second.set("cart", json!(["lamp"]));

    let write = |handle: kvsession_session::SessionHandle| {
        let manager = manager.clone();
        tokio::spawn(async move {
            let expected = handle.version().unwrap();
            let payload = manager.codec().encode(handle.data()).unwrap();
            let record = kvsession_session::SessionRecord::new(
                payload,
                handle.created_at(),
                chrono::Utc::now(),
                chrono::Utc::now() + chrono::Duration::hours(1),
            );
            manager
                .store()
                .compare_and_swap(handle.id(), expected, &record)
                .await
        })
    };

    let (a, b) = tokio::join!(write(first.clone()), write(second.clone()));
    let results = [a.unwrap(), b.unwrap()];
    let wins = results.iter().filter(|r| r.is_ok()).count();
    let conflicts = results
        .iter()
        .filter(|r| matches!(r, Err(SessionError::VersionConflict { .. })))
        .count();
    assert_eq!(wins, 1);
    assert_eq!(conflicts, 1);

    // Through the manager, the loser's write to the same key is refused rather
    // than laid over the winner's.
    let winner = manager.resolve(Some(id.as_str())).await.unwrap();
    assert!(matches!(
        manager.commit(&mut second).await,
        Err(SessionError::SessionWriteConflict { .. })
    ));
    let latest = manager.resolve(Some(id.as_str())).await.unwrap();
    assert_eq!(latest.get("cart"), winner.get("cart"));
    assert_eq!(latest.version(), Some(2));
}

#[tokio::test]
async fn test_concurrent_writers_to_different_keys_merge() {
    let (manager, _kv) = manager(config());
    let id = create_session(&manager).await;

    let mut cart = manager.resolve(Some(id.as_str())).await.unwrap();
    let mut theme = manager.resolve(Some(id.as_str())).await.unwrap();
    cart.set("cart", json!(["book"]));
    theme.set("theme", json!("dark"));

    manager.commit(&mut cart).await.unwrap();
    let outcome = manager.commit(&mut theme).await.unwrap();
    assert!(matches!(outcome, CommitOutcome::Committed { version: 3, .. }));

    let merged = manager.resolve(Some(id.as_str())).await.unwrap();
    assert_eq!(merged.get("user"), Some(&json!("alice")));
    assert_eq!(merged.get("cart"), Some(&json!(["book"])));
    assert_eq!(merged.get("theme"), Some(&json!("dark")));
}

#[tokio::test]
async fn test_concurrent_increments_conflict_or_rerun() {
    let (manager, _kv) = manager(config());
    let id = create_session(&manager).await;

    let mut first = manager.resolve(Some(id.as_str())).await.unwrap();
    let mut second = manager.resolve(Some(id.as_str())).await.unwrap();
    for handle in [&mut first, &mut second] {
        let visits = handle.get_as::<u64>("visits").unwrap_or(0);
        handle.set("visits", json!(visits + 1));
    }
    manager.commit(&mut first).await.unwrap();
    assert!(matches!(
        manager.commit(&mut second).await,
        Err(SessionError::SessionWriteConflict { .. })
    ));

    // Re-running the whole cycle counts the second visit.
    manager
        .transact(Some(id.as_str()), |session| {
            let visits = session.get_as::<u64>("visits").unwrap_or(0);
            session.set("visits", json!(visits + 1));
        })
        .await
        .unwrap();
    let stored = manager.resolve(Some(id.as_str())).await.unwrap();
    assert_eq!(stored.get_as::<u64>("visits"), Some(2));
}

/// Refuses the first plain delete, like a throttled backend.
struct FlakyDelete {
    inner: InMemoryKeyValueStore,
    failed: AtomicBool,
}

#[async_trait]
impl KeyValueStore for FlakyDelete {
    async fn get(&self, key: &str) -> SessionResult<Option<Versioned>> {
        self.inner.get(key).await
    }
    async fn put_if_absent(&self, key: &str, value: Vec<u8>) -> SessionResult<CreateOutcome> {
        self.inner.put_if_absent(key, value).await
    }
    async fn put_if_version(
        &self,
        key: &str,
        expected: u64,
        value: Vec<u8>,
    ) -> SessionResult<UpdateOutcome> {
        self.inner.put_if_version(key, expected, value).await
    }
    async fn delete(&self, key: &str) -> SessionResult<bool> {
        if !self.failed.swap(true, Ordering::SeqCst) {
            return Err(SessionError::StoreUnavailable("throttled".into()));
        }
        self.inner.delete(key).await
    }
    async fn delete_if_version(&self, key: &str, expected: u64) -> SessionResult<DeleteOutcome> {
        self.inner.delete_if_version(key, expected).await
    }
    async fn scan(&self, prefix: &str) -> SessionResult<Vec<(String, Versioned)>> {
        self.inner.scan(prefix).await
    }
}

#[tokio::test]
async fn test_rotation_retry_deletes_original_id() {
    let kv = Arc::new(FlakyDelete {
        inner: InMemoryKeyValueStore::new(),
        failed: AtomicBool::new(false),
    });
    let manager = SessionManager::new(Arc::new(config()), kv.clone()).unwrap();

    let mut login = manager.resolve(None).await.unwrap();
    login.set("user", json!("anonymous"));
    manager.commit(&mut login).await.unwrap();
    let original = login.id().clone();

    let mut handle = manager.resolve(Some(original.as_str())).await.unwrap();
    handle.set("user", json!("alice"));
    handle.rotate();
    assert!(matches!(
        manager.commit(&mut handle).await,
        Err(SessionError::StoreUnavailable(_))
    ));
    let rotated = handle.id().clone();
    assert_ne!(rotated, original);

    let outcome = manager.commit(&mut handle).await.unwrap();
    assert!(matches!(outcome, CommitOutcome::Committed { ref id, .. } if *id == rotated));

    assert!(matches!(
        manager.store().get(&original).await,
        Err(SessionError::NotFound)
    ));
    assert_eq!(kv.inner.len().await, 1);
    let reloaded = manager.resolve(Some(rotated.as_str())).await.unwrap();
    assert_eq!(reloaded.get("user"), Some(&json!("alice")));
}

#[tokio::test]
async fn test_store_outage_surfaces() {
    let manager =
        SessionManager::new(Arc::new(config()), Arc::new(DownStore)).unwrap();
    assert!(matches!(
        manager.resolve(Some("abc123")).await,
        Err(SessionError::StoreUnavailable(_))
    ));

    let mut handle = manager.resolve(None).await.unwrap();
    handle.set("user", json!("alice"));
    assert!(matches!(
        manager.commit(&mut handle).await,
        Err(SessionError::StoreUnavailable(_))
    ));
}

#[tokio::test]
async fn test_request_deadline_enforced() {
    let store = SlowStore {
        inner: InMemoryKeyValueStore::new(),
    };
    let manager = SessionManager::new(
        Arc::new(SessionConfig {
            request_timeout_ms: 50,
            ..config()
        }),
        Arc::new(store),
    )
    .unwrap();

    let started = std::time::Instant::now();
    let result = manager.resolve(Some("abc123")).await;
    assert!(matches!(result, Err(SessionError::StoreUnavailable(_))));
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[tokio::test]
async fn test_id_collision_draws_new_id() {
    let kv = Arc::new(InMemoryKeyValueStore::new());
    let manager = SessionManager::new(Arc::new(config()), kv.clone())
        .unwrap()
        .with_id_generator(Arc::new(ScriptedIds {
            ids: vec!["taken", "taken", "free"],
            next: AtomicUsize::new(0),
        }));

    let mut first = manager.resolve(None).await.unwrap();
    first.set("n", json!(1));
    manager.commit(&mut first).await.unwrap();
    assert_eq!(first.id().as_str(), "taken");

    let mut second = manager.resolve(None).await.unwrap();
    second.set("n", json!(2));
    let outcome = manager.commit(&mut second).await.unwrap();
    assert!(matches!(outcome, CommitOutcome::Committed { ref id, .. } if id.as_str() == "free"));
}

#[tokio::test]
async fn test_transact_reruns_cycle_after_conflict() {
    let kv = Arc::new(RacingStore {
        inner: InMemoryKeyValueStore::new(),
        raced: AtomicBool::new(true),
    });
    let manager = SessionManager::new(Arc::new(config()), kv.clone()).unwrap();
    let id = create_session(&manager).await;

    kv.raced.store(false, Ordering::SeqCst);
    let mut runs = 0;
    let (_, outcome) = manager
        .transact(Some(id.as_str()), |session| {
            runs += 1;
            let visits = session.get_as::<u64>("visits").unwrap_or(0);
            session.set("visits", json!(visits + 1));
        })
        .await
        .unwrap();

    assert_eq!(runs, 2);
    assert!(matches!(outcome, CommitOutcome::Committed { version: 3, .. }));
}

#[tokio::test]
async fn test_transact_gives_up_after_retry_bound() {
    /// Every conditional write loses to a concurrent writer.
    struct AlwaysRacing(InMemoryKeyValueStore);

    #[async_trait]
    impl KeyValueStore for AlwaysRacing {
        async fn get(&self, key: &str) -> SessionResult<Option<Versioned>> {
            self.0.get(key).await
        }
        async fn put_if_absent(&self, key: &str, value: Vec<u8>) -> SessionResult<CreateOutcome> {
            self.0.put_if_absent(key, value).await
        }
        async fn put_if_version(
            &self,
            key: &str,
            _expected: u64,
            _value: Vec<u8>,
        ) -> SessionResult<UpdateOutcome> {
            let current = self.0.get(key).await?.unwrap();
            self.0
                .put_if_version(key, current.version, current.value)
                .await?;
            Ok(UpdateOutcome::VersionConflict {
                current: current.version + 1,
            })
        }
        async fn delete(&self, key: &str) -> SessionResult<bool> {
            self.0.delete(key).await
        }
        async fn delete_if_version(
            &self,
            key: &str,
            expected: u64,
        ) -> SessionResult<DeleteOutcome> {
            self.0.delete_if_version(key, expected).await
        }
        async fn scan(&self, prefix: &str) -> SessionResult<Vec<(String, Versioned)>> {
            self.0.scan(prefix).await
        }
    }

    let manager = SessionManager::new(
        Arc::new(SessionConfig {
            retry_bound: 2,
            ..config()
        }),
        Arc::new(AlwaysRacing(InMemoryKeyValueStore::new())),
    )
    .unwrap();
    let id = create_session(&manager).await;

    let mut runs = 0;
    let result = manager
        .transact(Some(id.as_str()), |session| {
            runs += 1;
            session.set("n", json!(runs));
        })
        .await;
    assert!(matches!(
        result,
        Err(SessionError::SessionWriteConflict { attempts: 3 })
    ));
    assert_eq!(runs, 3);

    let mut handle = manager.resolve(Some(id.as_str())).await.unwrap();
    handle.set("n", json!(0));
    assert!(matches!(
        manager.commit(&mut handle).await,
        Err(SessionError::SessionWriteConflict { attempts: 3 })
    ));
    assert_eq!(handle.state(), SessionState::Conflicted);
}

#[tokio::test]
async fn test_destroyed_session_is_not_resurrected() {
    let (manager, _kv) = manager(config());
    let id = create_session(&manager).await;

    let mut writer = manager.resolve(Some(id.as_str())).await.unwrap();
    let mut logout = manager.resolve(Some(id.as_str())).await.unwrap();
    logout.destroy();
    manager.commit(&mut logout).await.unwrap();

    writer.set("user", json!("mallory"));
    assert!(matches!(
        manager.commit(&mut writer).await,
        Err(SessionError::NotFound) | Err(SessionError::SessionWriteConflict { .. })
    ));
    assert!(matches!(
        manager.store().get(&id).await,
        Err(SessionError::NotFound)
    ));
}

#[tokio::test]
async fn test_garbage_collector_uses_manager_policy() {
    let (manager, kv) = manager(SessionConfig {
        max_age_secs: 60,
        ..config()
    });
    create_session(&manager).await;
    let gc = manager.garbage_collector();

    let report = gc.collect(chrono::Utc::now()).await.unwrap();
    assert_eq!(report.deleted, 0);

    let later = chrono::Utc::now() + chrono::Duration::minutes(2);
    let report = gc.collect(later).await.unwrap();
    assert_eq!(report.deleted, 1);
    assert!(kv.is_empty().await);
}
