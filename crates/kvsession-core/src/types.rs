use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// The attribute mapping stored for a session.
///
/// Ordered so that encoding the same data always yields the same bytes.
pub type SessionData = BTreeMap<String, serde_json::Value>;

/// Longest accepted session ID, in characters.
pub const MAX_SESSION_ID_LEN: usize = 128;

/// Opaque session token carried in the session cookie.
///
/// Generated IDs are lowercase hex; inbound cookie values are accepted as
/// candidates when they are 1..=128 characters of `[A-Za-z0-9_-]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SessionId(String);

impl SessionId {
    /// Parse a candidate ID, returning `None` if it is malformed.
    pub fn parse(candidate: &str) -> Option<Self> {
        if candidate.is_empty() || candidate.len() > MAX_SESSION_ID_LEN {
            return None;
        }
        let valid = candidate
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_');
        valid.then(|| Self(candidate.to_string()))
    }

    /// The ID as it appears in cookies and store keys.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First eight characters, for log fields.
    pub fn short(&self) -> &str {
        let end = self.0.len().min(8);
        &self.0[..end]
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for SessionId {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value).ok_or_else(|| format!("invalid session id: {value:?}"))
    }
}

impl From<SessionId> for String {
    fn from(id: SessionId) -> Self {
        id.0
    }
}

impl AsRef<str> for SessionId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
