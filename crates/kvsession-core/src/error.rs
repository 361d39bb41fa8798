use thiserror::Error;

/// A convenience `Result` alias using [`SessionError`].
pub type SessionResult<T> = Result<T, SessionError>;

/// Top-level error type for session persistence.
///
/// Store and codec failures are returned to the lifecycle manager, which either
/// recovers from them (`NotFound`, `VersionConflict`, payload errors) or surfaces
/// them to the caller.
#[derive(Error, Debug)]
pub enum SessionError {
    /// No record exists for the requested session ID.
    #[error("session not found")]
    NotFound,

    /// A create-if-absent write found an existing record.
    #[error("session already exists")]
    AlreadyExists,

    /// A conditional write was issued against an outdated version.
    #[error("version conflict: expected {expected}, found {current}")]
    VersionConflict {
        /// Version the writer loaded.
        expected: u64,
        /// Version currently stored.
        current: u64,
    },

    /// The stored payload could not be decoded.
    #[error("corrupt session payload: {0}")]
    CorruptPayload(String),

    /// The stored payload failed its integrity check.
    #[error("session payload failed integrity check")]
    TamperedPayload,

    /// A record violates a storage invariant and was not written.
    #[error("invalid session record: {0}")]
    InvalidRecord(String),

    /// The session is too old to trust and the strict policy rejects it.
    #[error("stale session")]
    StaleSession,

    /// Concurrent writers kept winning until the retry bound was exhausted.
    #[error("session write conflict after {attempts} attempts")]
    SessionWriteConflict {
        /// Number of commit attempts made.
        attempts: u32,
    },

    /// The backing store failed or the request deadline elapsed.
    #[error("session store unavailable: {0}")]
    StoreUnavailable(String),

    /// The operating system random source failed.
    #[error("random source unavailable: {0}")]
    Entropy(String),

    /// Invalid configuration.
    #[error("config error: {0}")]
    Config(String),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl SessionError {
    /// Whether the error originates from an untrusted or unreadable payload.
    ///
    /// Such records are never trusted; the lifecycle manager handles them like a
    /// missing record.
    pub fn is_payload_error(&self) -> bool {
        matches!(self, Self::CorruptPayload(_) | Self::TamperedPayload)
    }

    /// Short machine-readable code, used in HTTP error bodies and log fields.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound => "not_found",
            Self::AlreadyExists => "already_exists",
            Self::VersionConflict { .. } => "version_conflict",
            Self::CorruptPayload(_) => "corrupt_payload",
            Self::TamperedPayload => "tampered_payload",
            Self::InvalidRecord(_) => "invalid_record",
            Self::StaleSession => "stale_session",
            Self::SessionWriteConflict { .. } => "session_write_conflict",
            Self::StoreUnavailable(_) => "store_unavailable",
            Self::Entropy(_) => "entropy",
            Self::Config(_) => "config",
            Self::Json(_) => "json",
        }
    }
}
