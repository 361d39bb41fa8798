use crate::expiry::ExpiryPolicy;
use crate::gc::GarbageCollector;
use crate::handle::{SessionHandle, SessionState};
use crate::kv::KeyValueStore;
use crate::store::{RecordStore, SessionRecord};
use chrono::{DateTime, Utc};
use kvsession_core::{SessionConfig, SessionError, SessionId, SessionResult};
use kvsession_security::{Codec, IdGenerator, RandomIdGenerator};
use std::future::Future;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// What a commit did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitOutcome {
    /// The session was written; the cookie should carry `id`.
    Committed {
        /// Session ID the record lives under.
        id: SessionId,
        /// Expiry of the written record.
        expires_at: DateTime<Utc>,
        /// Store version of the written record.
        version: u64,
    },
    /// Nothing changed and nothing was written.
    Discarded,
    /// The session was deleted; the cookie should be cleared.
    Destroyed {
        /// The deleted session.
        id: SessionId,
    },
}

/// Owns the session lifecycle: ID issue, loading, staleness, and
/// optimistic-concurrency writes against the record store.
pub struct SessionManager {
    store: RecordStore,
    codec: Codec,
    ids: Arc<dyn IdGenerator>,
    policy: ExpiryPolicy,
    config: Arc<SessionConfig>,
}

impl SessionManager {
    /// Build a manager over `kv` with the CSPRNG ID generator.
    pub fn new(config: Arc<SessionConfig>, kv: Arc<dyn KeyValueStore>) -> SessionResult<Self> {
        config.validate()?;
        let codec = Codec::from_config(&config);
        if !codec.is_authenticated() {
            warn!("No secret_key configured: session payloads are stored unauthenticated");
        }
        Ok(Self {
            store: RecordStore::new(kv, config.namespace.clone()),
            codec,
            ids: Arc::new(RandomIdGenerator),
            policy: ExpiryPolicy::from_config(&config),
            config,
        })
    }

    /// Replace the ID generator.
    pub fn with_id_generator(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = ids;
        self
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// The record store sessions are persisted in.
    pub fn store(&self) -> &RecordStore {
        &self.store
    }

    pub fn codec(&self) -> &Codec {
        &self.codec
    }

    /// A collector sweeping this manager's namespace with its expiry rules.
    pub fn garbage_collector(&self) -> GarbageCollector {
        GarbageCollector::new(self.store.clone(), self.policy)
    }

    /// Resolve the session for a request from the raw cookie value, if any.
    ///
    /// Fails with [`SessionError::StaleSession`] under the strict policy when
    /// the presented session is unknown or stale, and with
    /// [`SessionError::StoreUnavailable`] when the store fails or the request
    /// deadline passes.
    pub async fn resolve(&self, cookie_value: Option<&str>) -> SessionResult<SessionHandle> {
        let deadline = Instant::now() + self.config.request_timeout();
        self.resolve_until(cookie_value, deadline).await
    }

    async fn resolve_until(
        &self,
        cookie_value: Option<&str>,
        deadline: Instant,
    ) -> SessionResult<SessionHandle> {
        let Some(raw) = cookie_value else {
            return self.issue(deadline, SessionState::New, None);
        };
        let Some(id) = SessionId::parse(raw) else {
            debug!("Malformed session cookie, issuing a new session");
            return self.issue(deadline, SessionState::New, None);
        };

        match bounded(deadline, self.store.get(&id)).await {
            Ok(record) => self.classify(id, record, deadline),
            Err(SessionError::NotFound) => {
                if self.config.strict_staleness {
                    info!(session = %id.short(), "Rejecting unknown session");
                    return Err(SessionError::StaleSession);
                }
                debug!(session = %id.short(), "Unknown session, issuing a new one");
                self.issue(deadline, SessionState::New, Some(id))
            }
            Err(e) if e.is_payload_error() => {
                warn!(session = %id.short(), error = %e, "Unreadable session record, issuing a new session");
                self.issue(deadline, SessionState::New, Some(id))
            }
            Err(e) => Err(e),
        }
    }

    fn classify(
        &self,
        id: SessionId,
        record: SessionRecord,
        deadline: Instant,
    ) -> SessionResult<SessionHandle> {
        let now = Utc::now();
        if let Some(reason) = self.policy.stale_reason(&record, now) {
            if self.config.strict_staleness {
                info!(session = %id.short(), reason = reason.as_str(), "Rejecting stale session");
                return Err(SessionError::StaleSession);
            }
            debug!(session = %id.short(), reason = reason.as_str(), "Stale session replaced");
            return self.issue(deadline, SessionState::Stale, Some(id));
        }

        let data = match self.codec.decode(&record.payload) {
            Ok(data) => data,
            Err(e) if e.is_payload_error() => {
                warn!(session = %id.short(), error = %e, "Untrusted session payload, issuing a new session");
                return self.issue(deadline, SessionState::New, Some(id));
            }
            Err(e) => return Err(e),
        };

        let mut handle = SessionHandle::new(id, deadline);
        handle.transition(SessionState::Loading);
        handle.base = data.clone();
        handle.data = data;
        handle.version = Some(record.version);
        handle.created_at = record.created_at;
        handle.updated_at = Some(record.updated_at);
        handle.refresh = self.policy.needs_refresh(record.updated_at, now);
        handle.transition(SessionState::Fresh);
        Ok(handle)
    }

    /// A handle for a session that has never been written.
    fn issue(
        &self,
        deadline: Instant,
        state: SessionState,
        presented: Option<SessionId>,
    ) -> SessionResult<SessionHandle> {
        let mut handle = SessionHandle::new(self.ids.generate()?, deadline);
        if presented.is_some() {
            handle.transition(SessionState::Loading);
        }
        handle.presented = presented;
        handle.transition(state);
        Ok(handle)
    }

    /// Write the handle back to the store.
    ///
    /// Unchanged handles are discarded without a write. New sessions are created
    /// with a create-if-absent write, loaded ones with compare-and-swap. A
    /// version conflict reloads the record and replays the handle's mutations
    /// onto it when the concurrent write touched none of the same keys, and
    /// fails with [`SessionError::SessionWriteConflict`] when it did. An ID
    /// collision draws a new ID. After `retry_bound` retries the
    /// handle is [`SessionState::Conflicted`] and
    /// [`SessionError::SessionWriteConflict`] is returned.
    pub async fn commit(&self, handle: &mut SessionHandle) -> SessionResult<CommitOutcome> {
        let max_attempts = self.config.max_attempts();
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.write_once(handle).await {
                Ok(outcome) => return Ok(outcome),
                Err(SessionError::AlreadyExists) if attempt < max_attempts => {
                    debug!(session = %handle.id.short(), attempt, "Session ID collision, drawing a new one");
                    handle.id = self.ids.generate()?;
                }
                Err(SessionError::VersionConflict { expected, current }) if attempt < max_attempts => {
                    debug!(
                        session = %handle.id.short(),
                        attempt,
                        expected,
                        current,
                        "Version conflict, reloading session"
                    );
                    self.reload(handle, attempt).await?;
                }
                Err(SessionError::AlreadyExists | SessionError::VersionConflict { .. }) => {
                    warn!(session = %handle.id.short(), attempts = attempt, "Session write conflict");
                    handle.transition(SessionState::Conflicted);
                    return Err(SessionError::SessionWriteConflict { attempts: attempt });
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Run a full load-mutate-write cycle, re-running `mutate` against a freshly
    /// loaded session whenever a concurrent writer wins, up to the retry bound.
    ///
    /// Returns the value produced by the successful run of `mutate`.
    pub async fn transact<T, F>(
        &self,
        cookie_value: Option<&str>,
        mut mutate: F,
    ) -> SessionResult<(T, CommitOutcome)>
    where
        F: FnMut(&mut SessionHandle) -> T,
    {
        let deadline = Instant::now() + self.config.request_timeout();
        let max_attempts = self.config.max_attempts();
        let mut cookie = cookie_value.map(str::to_string);
        for attempt in 1..=max_attempts {
            let mut handle = self.resolve_until(cookie.as_deref(), deadline).await?;
            let value = mutate(&mut handle);
            match self.write_once(&mut handle).await {
                Ok(outcome) => return Ok((value, outcome)),
                Err(SessionError::AlreadyExists | SessionError::VersionConflict { .. }) => {
                    debug!(session = %handle.id.short(), attempt, "Concurrent write, retrying session cycle");
                    // A loaded session is retried under its own ID; a new one draws a new ID.
                    cookie = handle.version.map(|_| handle.id.to_string()).or(cookie);
                }
                Err(e) => return Err(e),
            }
        }
        warn!(attempts = max_attempts, "Session write conflict");
        Err(SessionError::SessionWriteConflict {
            attempts: max_attempts,
        })
    }

    /// One write attempt with no retry.
    async fn write_once(&self, handle: &mut SessionHandle) -> SessionResult<CommitOutcome> {
        if handle.destroy_requested {
            return self.destroy(handle).await;
        }
        if !handle.needs_write() {
            handle.transition(SessionState::Discarded);
            return Ok(CommitOutcome::Discarded);
        }
        // A rotation whose old ID is still pending deletion has already moved.
        if handle.rotate_requested && handle.version.is_some() && handle.retired.is_none() {
            let new_id = self.ids.generate()?;
            let old_id = std::mem::replace(&mut handle.id, new_id);
            debug!(from = %old_id.short(), to = %handle.id.short(), "Rotating session ID");
            handle.retired = Some(old_id);
            handle.version = None;
        }

        let now = Utc::now();
        let expires_at = self.policy.expires_at(handle.created_at, now);
        let payload = self.codec.encode(&handle.data)?;
        let record = SessionRecord::new(payload, handle.created_at, now, expires_at);

        let version = match handle.version {
            None => bounded(handle.deadline, self.store.put_new(&handle.id, &record)).await?,
            Some(expected) => {
                bounded(
                    handle.deadline,
                    self.store.compare_and_swap(&handle.id, expected, &record),
                )
                .await?
            }
        };
        handle.version = Some(version);
        handle.updated_at = Some(now);
        handle.dirty = false;
        handle.refresh = false;
        handle.rotate_requested = false;
        handle.changes.clear();
        handle.base = handle.data.clone();

        if let Some(old_id) = handle.retired.take() {
            match bounded(handle.deadline, self.store.delete(&old_id)).await {
                Ok(()) | Err(SessionError::NotFound) => {}
                Err(e) => {
                    warn!(session = %old_id.short(), error = %e, "Failed to delete rotated-out session");
                    handle.retired = Some(old_id);
                    return Err(e);
                }
            }
        }

        handle.transition(SessionState::Committed);
        Ok(CommitOutcome::Committed {
            id: handle.id.clone(),
            expires_at,
            version,
        })
    }

    async fn destroy(&self, handle: &mut SessionHandle) -> SessionResult<CommitOutcome> {
        let mut targets: Vec<SessionId> = handle.retired.take().into_iter().collect();
        if handle.version.is_some() {
            targets.push(handle.id.clone());
        }
        for id in &targets {
            match bounded(handle.deadline, self.store.delete(id)).await {
                Ok(()) => info!(session = %id.short(), "Session destroyed"),
                Err(SessionError::NotFound) => {
                    debug!(session = %id.short(), "Session already gone");
                }
                Err(e) => return Err(e),
            }
        }
        handle.transition(SessionState::Destroyed);
        Ok(CommitOutcome::Destroyed {
            id: handle.id.clone(),
        })
    }

    /// Reload a conflicted handle and replay its mutations onto the newer data.
    ///
    /// Replaying is only safe when the concurrent writer left every key this
    /// handle changed as it was when loaded. Otherwise the handle's values
    /// were computed from data that no longer exists, and the conflict is
    /// surfaced instead.
    async fn reload(&self, handle: &mut SessionHandle, attempt: u32) -> SessionResult<()> {
        let record = match bounded(handle.deadline, self.store.get(&handle.id)).await {
            Ok(record) => record,
            Err(SessionError::NotFound) => {
                warn!(session = %handle.id.short(), "Session deleted by a concurrent request");
                handle.transition(SessionState::Conflicted);
                return Err(SessionError::SessionWriteConflict { attempts: attempt });
            }
            Err(e) => return Err(e),
        };
        let data = match self.codec.decode(&record.payload) {
            Ok(data) => data,
            Err(e) if e.is_payload_error() => {
                warn!(session = %handle.id.short(), error = %e, "Concurrent write left an unreadable payload");
                handle.transition(SessionState::Conflicted);
                return Err(SessionError::SessionWriteConflict { attempts: attempt });
            }
            Err(e) => return Err(e),
        };
        if handle.overlaps(&data) {
            info!(session = %handle.id.short(), "Concurrent write touched the same session keys");
            handle.transition(SessionState::Conflicted);
            return Err(SessionError::SessionWriteConflict { attempts: attempt });
        }
        handle.rebase(data);
        handle.version = Some(record.version);
        handle.created_at = record.created_at;
        handle.updated_at = Some(record.updated_at);
        // The concurrent write already extended the session.
        handle.refresh = false;
        Ok(())
    }
}

/// Run a store call within the request deadline.
async fn bounded<T, F>(deadline: Instant, call: F) -> SessionResult<T>
where
    F: Future<Output = SessionResult<T>>,
{
    tokio::time::timeout_at(deadline, call)
        .await
        .map_err(|_| SessionError::StoreUnavailable("request deadline exceeded".into()))?
}
