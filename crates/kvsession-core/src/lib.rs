//! Core types and error definitions for the kvsession workspace.
//!
//! This crate provides the foundational types shared across all kvsession crates,
//! including error handling, configuration, and the session identifier and data
//! representations.
//!
//! # Main types
//!
//! - [`SessionError`]: Unified error enum for all session subsystems.
//! - [`SessionResult`]: Convenience alias for `Result<T, SessionError>`.
//! - [`SessionConfig`]: Process-wide configuration, built once at startup.
//! - [`SessionId`]: Opaque session token carried in the session cookie.
//! - [`SessionData`]: The attribute mapping stored for a session.

/// Configuration surface consumed by every component.
pub mod config;
/// Error taxonomy.
pub mod error;
/// Session identifier and data types.
pub mod types;

pub use config::{CookieConfig, SameSitePolicy, SessionConfig};
pub use error::{SessionError, SessionResult};
pub use types::{SessionData, SessionId};
