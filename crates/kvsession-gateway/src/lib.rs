//! HTTP binding for kvsession.
//!
//! [`session_middleware`] ties each request to a session: it reads the session
//! cookie, resolves the session through a
//! [`SessionManager`](kvsession_session::SessionManager), hands handlers a
//! [`Session`], and commits it before the response leaves.

/// Session middleware, extractor and error rendering.
pub mod middleware;
/// Demo router over the middleware.
pub mod server;

pub use middleware::{session_middleware, status_for, Session, SessionErrorResponse};
pub use server::GatewayServer;
