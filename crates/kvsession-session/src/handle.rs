use chrono::{DateTime, Utc};
use kvsession_core::{SessionData, SessionId};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{trace, warn};

/// Position of a request's session in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No session ID known yet.
    Unresolved,
    /// A session ID was presented and is being looked up.
    Loading,
    /// Loaded, unexpired and trusted.
    Fresh,
    /// The presented session was too old; a replacement ID was issued.
    Stale,
    /// No usable session was presented; a new ID was issued.
    New,
    /// Changes were written.
    Committed,
    /// Nothing changed; nothing was written.
    Discarded,
    /// Concurrent writers exhausted the retry bound.
    Conflicted,
    /// The session was deleted.
    Destroyed,
}

impl SessionState {
    /// Whether the lifecycle may move from `self` to `next`.
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Unresolved, Loading | New)
                | (Loading, Fresh | Stale | New)
                | (Fresh | Stale | New, Committed | Discarded | Conflicted | Destroyed)
        )
    }

    /// Whether the lifecycle has ended.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Committed | Self::Discarded | Self::Conflicted | Self::Destroyed
        )
    }
}

/// One mutation applied through a handle, kept so it can be replayed onto a
/// newer copy of the record after a version conflict.
#[derive(Debug, Clone, PartialEq)]
pub enum Change {
    /// Insert or replace a key.
    Set(String, serde_json::Value),
    /// Remove a key.
    Remove(String),
    /// Remove every key.
    Clear,
}

impl Change {
    /// Key this change writes, or `None` for [`Change::Clear`].
    fn key(&self) -> Option<&str> {
        match self {
            Self::Set(key, _) | Self::Remove(key) => Some(key.as_str()),
            Self::Clear => None,
        }
    }

    pub(crate) fn apply(&self, data: &mut SessionData) {
        match self {
            Self::Set(key, value) => {
                data.insert(key.clone(), value.clone());
            }
            Self::Remove(key) => {
                data.remove(key);
            }
            Self::Clear => data.clear(),
        }
    }
}

/// Request-scoped working copy of a session.
///
/// Created by [`SessionManager::resolve`](crate::SessionManager::resolve) and
/// consumed by [`SessionManager::commit`](crate::SessionManager::commit).
/// Dropping a handle without committing writes nothing.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    pub(crate) id: SessionId,
    pub(crate) state: SessionState,
    pub(crate) data: SessionData,
    /// Data as last loaded from the store, before this handle's changes.
    pub(crate) base: SessionData,
    pub(crate) changes: Vec<Change>,
    pub(crate) dirty: bool,
    pub(crate) refresh: bool,
    pub(crate) version: Option<u64>,
    pub(crate) created_at: DateTime<Utc>,
    pub(crate) updated_at: Option<DateTime<Utc>>,
    pub(crate) presented: Option<SessionId>,
    pub(crate) destroy_requested: bool,
    pub(crate) rotate_requested: bool,
    pub(crate) retired: Option<SessionId>,
    pub(crate) deadline: Instant,
}

impl SessionHandle {
    pub(crate) fn new(id: SessionId, deadline: Instant) -> Self {
        Self {
            id,
            state: SessionState::Unresolved,
            data: SessionData::new(),
            base: SessionData::new(),
            changes: Vec::new(),
            dirty: false,
            refresh: false,
            version: None,
            created_at: Utc::now(),
            updated_at: None,
            presented: None,
            destroy_requested: false,
            rotate_requested: false,
            retired: None,
            deadline,
        }
    }

    pub(crate) fn transition(&mut self, next: SessionState) {
        if !self.state.can_transition_to(next) {
            warn!(session = %self.id.short(), from = ?self.state, to = ?next, "Unexpected session transition");
        }
        trace!(session = %self.id.short(), from = ?self.state, to = ?next, "session state");
        self.state = next;
    }

    /// Current session ID. Changes if the session is rotated or its ID collides.
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// The ID the client presented, when it was replaced by a new one.
    pub fn presented_id(&self) -> Option<&SessionId> {
        self.presented.as_ref()
    }

    /// Whether the session has never been written.
    pub fn is_new(&self) -> bool {
        self.version.is_none()
    }

    /// Store version this handle was loaded at.
    pub fn version(&self) -> Option<u64> {
        self.version
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Last write of the loaded record.
    pub fn updated_at(&self) -> Option<DateTime<Utc>> {
        self.updated_at
    }

    /// Whether the handle holds unwritten mutations.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn data(&self) -> &SessionData {
        &self.data
    }

    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.data.get(key)
    }

    /// Deserialize the value stored under `key`. `None` if absent or of another shape.
    pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.data
            .get(key)
            .and_then(|value| serde_json::from_value(value.clone()).ok())
    }

    /// Store `value` under `key`.
    pub fn set(&mut self, key: impl Into<String>, value: serde_json::Value) {
        let key = key.into();
        if self.data.get(&key) == Some(&value) {
            return;
        }
        self.record(Change::Set(key, value));
    }

    /// Serialize and store `value` under `key`.
    pub fn set_as<T: Serialize>(
        &mut self,
        key: impl Into<String>,
        value: &T,
    ) -> Result<(), serde_json::Error> {
        let value = serde_json::to_value(value)?;
        self.set(key, value);
        Ok(())
    }

    /// Remove `key`, returning its value.
    pub fn remove(&mut self, key: &str) -> Option<serde_json::Value> {
        let previous = self.data.get(key).cloned()?;
        self.record(Change::Remove(key.to_string()));
        Some(previous)
    }

    /// Remove every key.
    pub fn clear(&mut self) {
        if self.data.is_empty() {
            return;
        }
        self.record(Change::Clear);
    }

    /// Delete the session at commit time.
    pub fn destroy(&mut self) {
        self.destroy_requested = true;
    }

    /// Move the session to a new ID at commit time (e.g. after login).
    pub fn rotate(&mut self) {
        self.rotate_requested = true;
    }

    pub fn is_destroy_requested(&self) -> bool {
        self.destroy_requested
    }

    /// Whether committing this handle would issue a write.
    pub fn needs_write(&self) -> bool {
        self.dirty || self.refresh || self.rotate_requested || self.retired.is_some()
    }

    fn record(&mut self, change: Change) {
        change.apply(&mut self.data);
        self.changes.push(change);
        self.dirty = true;
    }

    /// Whether a concurrent write that produced `newer` touched anything this
    /// handle changed. A [`Change::Clear`] overlaps with any concurrent change.
    pub(crate) fn overlaps(&self, newer: &SessionData) -> bool {
        self.changes.iter().any(|change| match change.key() {
            Some(key) => self.base.get(key) != newer.get(key),
            None => &self.base != newer,
        })
    }

    /// Replace the working copy with `data` and reapply this handle's mutations.
    ///
    /// Only sound when [`overlaps`](Self::overlaps) is false for `data`.
    pub(crate) fn rebase(&mut self, data: SessionData) {
        let mut merged = data.clone();
        for change in &self.changes {
            change.apply(&mut merged);
        }
        self.base = data;
        self.data = merged;
    }
}
