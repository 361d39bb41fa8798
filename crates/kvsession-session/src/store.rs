use crate::kv::{CreateOutcome, DeleteOutcome, KeyValueStore, UpdateOutcome, Versioned};
use chrono::{DateTime, Utc};
use kvsession_core::{SessionError, SessionId, SessionResult};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

/// A persisted session.
///
/// `payload` holds the codec-encoded session data; decoding it is the lifecycle
/// manager's job, so a record can be read, aged and collected without the
/// secret key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRecord {
    /// Encoded session data.
    pub payload: Vec<u8>,
    /// When the session was first written.
    pub created_at: DateTime<Utc>,
    /// When the session was last written.
    pub updated_at: DateTime<Utc>,
    /// When the session stops being valid.
    pub expires_at: DateTime<Utc>,
    /// Store-assigned version; `0` for a record that was never written.
    pub version: u64,
}

impl SessionRecord {
    /// Build an unsaved record.
    pub fn new(
        payload: Vec<u8>,
        created_at: DateTime<Utc>,
        updated_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Self {
        Self {
            payload,
            created_at,
            updated_at,
            expires_at,
            version: 0,
        }
    }
}

/// On-the-wire shape of a record. The version lives in the store, not here.
#[derive(Serialize, Deserialize)]
struct RecordEnvelope {
    payload: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

/// A record found while scanning the namespace.
#[derive(Debug)]
pub struct ScannedRecord {
    /// Session the record belongs to.
    pub id: SessionId,
    /// Store version at scan time, known even when the envelope is unreadable.
    pub version: u64,
    /// The record, or the error hit while reading its envelope.
    pub record: SessionResult<SessionRecord>,
}

/// Record-level view of a [`KeyValueStore`], keyed by session ID.
///
/// Every method is a single remote call; nothing here retries.
#[derive(Clone)]
pub struct RecordStore {
    kv: Arc<dyn KeyValueStore>,
    namespace: String,
}

impl RecordStore {
    pub fn new(kv: Arc<dyn KeyValueStore>, namespace: impl Into<String>) -> Self {
        Self {
            kv,
            namespace: namespace.into(),
        }
    }

    /// Keyspace prefix used for every record.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    fn prefix(&self) -> String {
        format!("{}:", self.namespace)
    }

    fn key(&self, id: &SessionId) -> String {
        format!("{}:{}", self.namespace, id)
    }

    /// Load a record. Fails with [`SessionError::NotFound`] if absent and
    /// [`SessionError::CorruptPayload`] if the stored envelope is unreadable.
    pub async fn get(&self, id: &SessionId) -> SessionResult<SessionRecord> {
        let stored = self
            .kv
            .get(&self.key(id))
            .await?
            .ok_or(SessionError::NotFound)?;
        decode_envelope(stored)
    }

    /// Create a record if no record exists for `id`. Returns the new version.
    pub async fn put_new(&self, id: &SessionId, record: &SessionRecord) -> SessionResult<u64> {
        let bytes = encode_envelope(record)?;
        match self.kv.put_if_absent(&self.key(id), bytes).await? {
            CreateOutcome::Created { version } => {
                debug!(session = %id.short(), version, "session record created");
                Ok(version)
            }
            CreateOutcome::AlreadyExists => Err(SessionError::AlreadyExists),
        }
    }

    /// Replace the record for `id` if its version is still `expected_version`.
    /// Returns the new version.
    pub async fn compare_and_swap(
        &self,
        id: &SessionId,
        expected_version: u64,
        record: &SessionRecord,
    ) -> SessionResult<u64> {
        let bytes = encode_envelope(record)?;
        match self
            .kv
            .put_if_version(&self.key(id), expected_version, bytes)
            .await?
        {
            UpdateOutcome::Written { version } => {
                debug!(session = %id.short(), version, "session record updated");
                Ok(version)
            }
            UpdateOutcome::VersionConflict { current } => Err(SessionError::VersionConflict {
                expected: expected_version,
                current,
            }),
            UpdateOutcome::NotFound => Err(SessionError::NotFound),
        }
    }

    /// Delete the record for `id`.
    pub async fn delete(&self, id: &SessionId) -> SessionResult<()> {
        if self.kv.delete(&self.key(id)).await? {
            debug!(session = %id.short(), "session record deleted");
            Ok(())
        } else {
            Err(SessionError::NotFound)
        }
    }

    /// Delete the record for `id` only if it is still at `expected_version`.
    pub async fn delete_if_version(&self, id: &SessionId, expected_version: u64) -> SessionResult<()> {
        match self
            .kv
            .delete_if_version(&self.key(id), expected_version)
            .await?
        {
            DeleteOutcome::Deleted => {
                debug!(session = %id.short(), version = expected_version, "session record deleted");
                Ok(())
            }
            DeleteOutcome::VersionConflict { current } => Err(SessionError::VersionConflict {
                expected: expected_version,
                current,
            }),
            DeleteOutcome::NotFound => Err(SessionError::NotFound),
        }
    }

    /// Every record in the namespace. Keys that do not hold a valid session ID
    /// are skipped.
    pub async fn scan(&self) -> SessionResult<Vec<ScannedRecord>> {
        let prefix = self.prefix();
        let entries = self.kv.scan(&prefix).await?;
        let mut records = Vec::with_capacity(entries.len());
        for (key, stored) in entries {
            let Some(id) = key.strip_prefix(&prefix).and_then(SessionId::parse) else {
                debug!(key = %key, "skipping foreign key in session namespace");
                continue;
            };
            records.push(ScannedRecord {
                id,
                version: stored.version,
                record: decode_envelope(stored),
            });
        }
        Ok(records)
    }
}

fn encode_envelope(record: &SessionRecord) -> SessionResult<Vec<u8>> {
    if record.expires_at < record.created_at {
        return Err(SessionError::InvalidRecord(
            "expires_at precedes created_at".into(),
        ));
    }
    let payload = String::from_utf8(record.payload.clone())
        .map_err(|_| SessionError::InvalidRecord("payload is not valid UTF-8".into()))?;
    let envelope = RecordEnvelope {
        payload,
        created_at: record.created_at,
        updated_at: record.updated_at,
        expires_at: record.expires_at,
    };
    Ok(serde_json::to_vec(&envelope)?)
}

fn decode_envelope(stored: Versioned) -> SessionResult<SessionRecord> {
    let envelope: RecordEnvelope = serde_json::from_slice(&stored.value)
        .map_err(|e| SessionError::CorruptPayload(format!("record envelope: {e}")))?;
    Ok(SessionRecord {
        payload: envelope.payload.into_bytes(),
        created_at: envelope.created_at,
        updated_at: envelope.updated_at,
        expires_at: envelope.expires_at,
        version: stored.version,
    })
}
