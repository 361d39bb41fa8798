use kvsession_core::{SessionError, SessionId, SessionResult};

/// Random bytes per session ID (256 bits of entropy, 64 hex characters).
pub const SESSION_ID_BYTES: usize = 32;

/// Source of new session IDs.
///
/// The lifecycle manager owns exactly one generator and calls it for every
/// new, replaced, colliding or rotated session.
pub trait IdGenerator: Send + Sync {
    /// Produce a fresh, unguessable session ID.
    fn generate(&self) -> SessionResult<SessionId>;
}

/// Generator backed by the operating system CSPRNG.
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomIdGenerator;

impl IdGenerator for RandomIdGenerator {
    fn generate(&self) -> SessionResult<SessionId> {
        generate_session_id()
    }
}

/// Random bytes in a generated secret key.
pub const SECRET_KEY_BYTES: usize = 64;

/// Generate a session ID from [`SESSION_ID_BYTES`] bytes of OS randomness.
pub fn generate_session_id() -> SessionResult<SessionId> {
    let encoded = random_hex(SESSION_ID_BYTES)?;
    SessionId::parse(&encoded)
        .ok_or_else(|| SessionError::Entropy("generated id failed validation".into()))
}

/// Generate a hex-encoded payload signing key.
pub fn generate_secret_key() -> SessionResult<String> {
    random_hex(SECRET_KEY_BYTES)
}

fn random_hex(len: usize) -> SessionResult<String> {
    let mut bytes = vec![0u8; len];
    getrandom::getrandom(&mut bytes).map_err(|e| SessionError::Entropy(e.to_string()))?;
    Ok(hex::encode(bytes))
}
