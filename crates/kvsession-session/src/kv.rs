use async_trait::async_trait;
use kvsession_core::SessionResult;
use std::collections::HashMap;
use tokio::sync::RwLock;

/// A stored value together with the version the store assigned to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Versioned {
    /// Raw bytes.
    pub value: Vec<u8>,
    /// Starts at 1 on creation and increases by one on every conditional write.
    pub version: u64,
}

/// Result of a create-if-absent write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateOutcome {
    /// The key was absent and now holds the value.
    Created {
        /// Version assigned to the new value.
        version: u64,
    },
    /// The key already held a value; nothing was written.
    AlreadyExists,
}

/// Result of a conditional update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// The expected version matched and the value was replaced.
    Written {
        /// Version assigned to the new value.
        version: u64,
    },
    /// The stored version differs from the expected one; nothing was written.
    VersionConflict {
        /// Version currently stored.
        current: u64,
    },
    /// The key holds no value.
    NotFound,
}

/// Result of a conditional delete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    /// The expected version matched and the value was removed.
    Deleted,
    /// The stored version differs from the expected one; nothing was removed.
    VersionConflict {
        /// Version currently stored.
        current: u64,
    },
    /// The key holds no value.
    NotFound,
}

/// The remote key-value capability sessions are persisted in.
///
/// Implementations wrap a network client that already handles retries and
/// timeouts; transport failures surface as
/// [`SessionError::StoreUnavailable`](kvsession_core::SessionError::StoreUnavailable).
/// Conditional writes must be atomic with respect to each other.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Fetch the value stored under `key`.
    async fn get(&self, key: &str) -> SessionResult<Option<Versioned>>;

    /// Store `value` under `key` only if the key is absent.
    async fn put_if_absent(&self, key: &str, value: Vec<u8>) -> SessionResult<CreateOutcome>;

    /// Replace the value under `key` only if its version equals `expected`.
    async fn put_if_version(
        &self,
        key: &str,
        expected: u64,
        value: Vec<u8>,
    ) -> SessionResult<UpdateOutcome>;

    /// Remove `key`. Returns whether a value was present.
    async fn delete(&self, key: &str) -> SessionResult<bool>;

    /// Remove `key` only if its version equals `expected`.
    async fn delete_if_version(&self, key: &str, expected: u64) -> SessionResult<DeleteOutcome>;

    /// List every entry whose key starts with `prefix`.
    async fn scan(&self, prefix: &str) -> SessionResult<Vec<(String, Versioned)>>;
}

/// In-process implementation of [`KeyValueStore`].
///
/// Suitable for tests and single-node deployments; all conditional writes are
/// serialized by one lock.
pub struct InMemoryKeyValueStore {
    entries: RwLock<HashMap<String, Versioned>>,
}

impl InMemoryKeyValueStore {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Number of stored entries.
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    /// Whether the store holds no entries.
    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

impl Default for InMemoryKeyValueStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KeyValueStore for InMemoryKeyValueStore {
    async fn get(&self, key: &str) -> SessionResult<Option<Versioned>> {
        let entries = self.entries.read().await;
        Ok(entries.get(key).cloned())
    }

    async fn put_if_absent(&self, key: &str, value: Vec<u8>) -> SessionResult<CreateOutcome> {
        let mut entries = self.entries.write().await;
        if entries.contains_key(key) {
            return Ok(CreateOutcome::AlreadyExists);
        }
        entries.insert(key.to_string(), Versioned { value, version: 1 });
        Ok(CreateOutcome::Created { version: 1 })
    }

    async fn put_if_version(
        &self,
        key: &str,
        expected: u64,
        value: Vec<u8>,
    ) -> SessionResult<UpdateOutcome> {
        let mut entries = self.entries.write().await;
        let Some(entry) = entries.get_mut(key) else {
            return Ok(UpdateOutcome::NotFound);
        };
        if entry.version != expected {
            return Ok(UpdateOutcome::VersionConflict {
                current: entry.version,
            });
        }
        entry.version += 1;
        entry.value = value;
        Ok(UpdateOutcome::Written {
            version: entry.version,
        })
    }

    async fn delete(&self, key: &str) -> SessionResult<bool> {
        let mut entries = self.entries.write().await;
        Ok(entries.remove(key).is_some())
    }

    async fn delete_if_version(&self, key: &str, expected: u64) -> SessionResult<DeleteOutcome> {
        let mut entries = self.entries.write().await;
        let Some(entry) = entries.get(key) else {
            return Ok(DeleteOutcome::NotFound);
        };
        if entry.version != expected {
            return Ok(DeleteOutcome::VersionConflict {
                current: entry.version,
            });
        }
        entries.remove(key);
        Ok(DeleteOutcome::Deleted)
    }

    async fn scan(&self, prefix: &str) -> SessionResult<Vec<(String, Versioned)>> {
        let entries = self.entries.read().await;
        let mut matched: Vec<(String, Versioned)> = entries
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        matched.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(matched)
    }
}
