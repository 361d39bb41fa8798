use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use hmac::{Hmac, Mac};
use kvsession_core::{SessionConfig, SessionData, SessionError, SessionResult};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Separates the base64 body from the hex digest.
const DIGEST_SEPARATOR: &[u8] = b"--";

/// Hex length of an HMAC-SHA256 digest.
const DIGEST_HEX_LEN: usize = 64;

/// Encodes session data into storage bytes and back.
///
/// Format: `base64(json(data))`, followed by `--` and the lowercase hex
/// HMAC-SHA256 of the base64 part when a secret key is configured.
#[derive(Clone)]
pub struct Codec {
    key: Option<Vec<u8>>,
}

impl std::fmt::Debug for Codec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Codec")
            .field("authenticated", &self.is_authenticated())
            .finish()
    }
}

impl Codec {
    /// Create a codec. `None` produces unauthenticated payloads.
    pub fn new(secret_key: Option<&[u8]>) -> Self {
        Self {
            key: secret_key.map(<[u8]>::to_vec),
        }
    }

    /// Create a codec from the process configuration.
    pub fn from_config(config: &SessionConfig) -> Self {
        Self::new(config.secret_key.as_deref().map(str::as_bytes))
    }

    /// Whether payloads carry a digest.
    pub fn is_authenticated(&self) -> bool {
        self.key.is_some()
    }

    /// Encode session data.
    pub fn encode(&self, data: &SessionData) -> SessionResult<Vec<u8>> {
        let json = serde_json::to_vec(data)?;
        let mut out = BASE64.encode(json).into_bytes();
        if let Some(key) = &self.key {
            let digest = hex::encode(Self::sign(key, &out)?);
            out.extend_from_slice(DIGEST_SEPARATOR);
            out.extend_from_slice(digest.as_bytes());
        }
        Ok(out)
    }

    /// Size of the encoded payload, for storage estimates.
    pub fn encoded_len(&self, data: &SessionData) -> SessionResult<usize> {
        let json_len = serde_json::to_vec(data)?.len();
        let body = json_len.div_ceil(3) * 4;
        let digest = if self.key.is_some() {
            DIGEST_SEPARATOR.len() + DIGEST_HEX_LEN
        } else {
            0
        };
        Ok(body + digest)
    }

    /// Decode storage bytes.
    ///
    /// With a secret key, any payload whose digest is missing or wrong fails with
    /// [`SessionError::TamperedPayload`]. Payloads that authenticate but do not
    /// parse, or that carry a digest the codec cannot check, fail with
    /// [`SessionError::CorruptPayload`].
    pub fn decode(&self, bytes: &[u8]) -> SessionResult<SessionData> {
        let body = match &self.key {
            Some(key) => Self::verified_body(key, bytes)?,
            None => {
                if find_separator(bytes).is_some() {
                    return Err(SessionError::CorruptPayload(
                        "payload carries a digest but no secret key is configured".into(),
                    ));
                }
                bytes
            }
        };
        let json = BASE64
            .decode(body)
            .map_err(|e| SessionError::CorruptPayload(format!("base64: {e}")))?;
        serde_json::from_slice(&json)
            .map_err(|e| SessionError::CorruptPayload(format!("json: {e}")))
    }

    fn verified_body<'a>(key: &[u8], bytes: &'a [u8]) -> SessionResult<&'a [u8]> {
        let split = find_separator(bytes).ok_or(SessionError::TamperedPayload)?;
        let body = &bytes[..split];
        let digest_hex = &bytes[split + DIGEST_SEPARATOR.len()..];

        // Uppercase hex would decode to the same digest, so only the canonical form is accepted.
        let canonical = digest_hex.len() == DIGEST_HEX_LEN
            && digest_hex
                .iter()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(b));
        if !canonical {
            return Err(SessionError::TamperedPayload);
        }
        let digest = hex::decode(digest_hex).map_err(|_| SessionError::TamperedPayload)?;

        let mut mac = Self::mac(key)?;
        mac.update(body);
        mac.verify_slice(&digest)
            .map_err(|_| SessionError::TamperedPayload)?;
        Ok(body)
    }

    fn sign(key: &[u8], body: &[u8]) -> SessionResult<Vec<u8>> {
        let mut mac = Self::mac(key)?;
        mac.update(body);
        Ok(mac.finalize().into_bytes().to_vec())
    }

    fn mac(key: &[u8]) -> SessionResult<HmacSha256> {
        HmacSha256::new_from_slice(key)
            .map_err(|e| SessionError::Config(format!("invalid secret key: {e}")))
    }
}

/// Position of the last digest separator.
fn find_separator(bytes: &[u8]) -> Option<usize> {
    bytes
        .windows(DIGEST_SEPARATOR.len())
        .rposition(|window| window == DIGEST_SEPARATOR)
}
