//! Security primitives for kvsession.
//!
//! Provides the payload codec that turns session data into authenticated
//! storage bytes, and the session ID generator.
//!
//! # Main types
//!
//! - [`Codec`]: JSON + base64 payload encoding with an optional HMAC-SHA256 digest.
//! - [`IdGenerator`]: The seam through which the lifecycle manager obtains new IDs.
//! - [`RandomIdGenerator`]: CSPRNG-backed generator producing 256-bit IDs.

/// Session payload encoding and integrity checking.
pub mod codec;
/// Session ID generation.
pub mod id;

pub use codec::Codec;
pub use id::{
    generate_secret_key, generate_session_id, IdGenerator, RandomIdGenerator, SECRET_KEY_BYTES,
    SESSION_ID_BYTES,
};
