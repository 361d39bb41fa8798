use axum::{
    extract::{FromRequestParts, Request, State},
    http::{header, request::Parts, HeaderMap, HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use cookie::{Cookie, CookieBuilder, SameSite};
use kvsession_core::{CookieConfig, SameSitePolicy, SessionData, SessionError, SessionId};
use kvsession_session::{CommitOutcome, SessionHandle, SessionManager, SessionState};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use time::OffsetDateTime;
use tracing::{debug, warn};

/// The current request's session.
///
/// Inserted into request extensions by [`session_middleware`] and available to
/// handlers as an extractor. Clones share the same underlying handle; changes
/// are written once the handler has produced its response.
#[derive(Clone)]
pub struct Session {
    handle: Arc<Mutex<SessionHandle>>,
}

impl Session {
    fn new(handle: SessionHandle) -> Self {
        Self {
            handle: Arc::new(Mutex::new(handle)),
        }
    }

    /// ID the session will be written under.
    pub fn id(&self) -> SessionId {
        self.handle.lock().id().clone()
    }

    pub fn state(&self) -> SessionState {
        self.handle.lock().state()
    }

    /// Whether the session has never been written.
    pub fn is_new(&self) -> bool {
        self.handle.lock().is_new()
    }

    /// Copy of the whole session map.
    pub fn data(&self) -> SessionData {
        self.handle.lock().data().clone()
    }

    pub fn get(&self, key: &str) -> Option<serde_json::Value> {
        self.handle.lock().get(key).cloned()
    }

    pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.handle.lock().get_as(key)
    }

    pub fn set(&self, key: impl Into<String>, value: serde_json::Value) {
        self.handle.lock().set(key, value);
    }

    pub fn set_as<T: Serialize>(
        &self,
        key: impl Into<String>,
        value: &T,
    ) -> Result<(), serde_json::Error> {
        self.handle.lock().set_as(key, value)
    }

    pub fn remove(&self, key: &str) -> Option<serde_json::Value> {
        self.handle.lock().remove(key)
    }

    pub fn clear(&self) {
        self.handle.lock().clear();
    }

    /// Delete the session and clear the cookie once the response is ready.
    pub fn destroy(&self) {
        self.handle.lock().destroy();
    }

    /// Move the session to a fresh ID once the response is ready.
    pub fn rotate(&self) {
        self.handle.lock().rotate();
    }

    fn snapshot(&self) -> SessionHandle {
        self.handle.lock().clone()
    }

    fn replace(&self, handle: SessionHandle) {
        *self.handle.lock() = handle;
    }
}

impl<S> FromRequestParts<S> for Session
where
    S: Send + Sync,
{
    type Rejection = (StatusCode, &'static str);

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts.extensions.get::<Session>().cloned().ok_or((
            StatusCode::INTERNAL_SERVER_ERROR,
            "session middleware is not installed",
        ))
    }
}

/// A session failure rendered as an HTTP response.
#[derive(Debug)]
pub struct SessionErrorResponse(pub SessionError);

/// HTTP status for a session failure.
pub fn status_for(error: &SessionError) -> StatusCode {
    match error {
        SessionError::StaleSession => StatusCode::UNAUTHORIZED,
        SessionError::SessionWriteConflict { .. } => StatusCode::CONFLICT,
        SessionError::StoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for SessionErrorResponse {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        if status.is_server_error() {
            warn!(error = %self.0, code = self.0.code(), "Session error");
        } else {
            debug!(error = %self.0, code = self.0.code(), "Session rejected");
        }
        let body = serde_json::json!({
            "error": self.0.code(),
            "message": self.0.to_string(),
        });
        (status, Json(body)).into_response()
    }
}

/// Session middleware: resolves the session named by the request cookie,
/// exposes it to handlers as [`Session`], and commits it after the handler.
///
/// A written session refreshes the cookie, a destroyed one clears it, and an
/// unchanged one leaves it alone. Any session error replaces the response.
pub async fn session_middleware(
    State(manager): State<Arc<SessionManager>>,
    mut request: Request,
    next: Next,
) -> Response {
    let cookie_config = &manager.config().cookie;
    let presented = presented_session_id(request.headers(), &cookie_config.name);

    let handle = match manager.resolve(presented.as_deref()).await {
        Ok(handle) => handle,
        Err(e) => return SessionErrorResponse(e).into_response(),
    };
    let session = Session::new(handle);
    request.extensions_mut().insert(session.clone());

    let mut response = next.run(request).await;

    let mut handle = session.snapshot();
    let outcome = manager.commit(&mut handle).await;
    session.replace(handle);

    match outcome {
        Ok(CommitOutcome::Committed { id, expires_at, .. }) => {
            append_cookie(&mut response, &session_cookie(cookie_config, &id, expires_at));
        }
        Ok(CommitOutcome::Destroyed { .. }) => {
            append_cookie(&mut response, &removal_cookie(cookie_config));
        }
        Ok(CommitOutcome::Discarded) => {}
        Err(e) => return SessionErrorResponse(e).into_response(),
    }
    response
}

/// Value of the first cookie called `name`, across every `Cookie` header.
fn presented_session_id(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(Cookie::split_parse)
        .filter_map(Result::ok)
        .find(|cookie| cookie.name() == name)
        .map(|cookie| cookie.value().to_string())
}

fn base_cookie(config: &CookieConfig, value: String) -> CookieBuilder<'static> {
    let same_site = match config.same_site {
        SameSitePolicy::Strict => SameSite::Strict,
        SameSitePolicy::Lax => SameSite::Lax,
        SameSitePolicy::None => SameSite::None,
    };
    let mut builder = Cookie::build((config.name.clone(), value))
        .http_only(true)
        .secure(config.secure)
        .same_site(same_site)
        .path(config.path.clone());
    if let Some(domain) = &config.domain {
        builder = builder.domain(domain.clone());
    }
    builder
}

/// Cookie carrying `id` until `expires_at`.
fn session_cookie(
    config: &CookieConfig,
    id: &SessionId,
    expires_at: DateTime<Utc>,
) -> Cookie<'static> {
    let max_age = (expires_at - Utc::now()).num_seconds().max(0);
    let mut builder = base_cookie(config, id.to_string()).max_age(time::Duration::seconds(max_age));
    if let Ok(expires) = OffsetDateTime::from_unix_timestamp(expires_at.timestamp()) {
        builder = builder.expires(expires);
    }
    builder.build()
}

fn removal_cookie(config: &CookieConfig) -> Cookie<'static> {
    let mut cookie = base_cookie(config, String::new()).build();
    cookie.make_removal();
    cookie
}

fn append_cookie(response: &mut Response, cookie: &Cookie<'_>) {
    match HeaderValue::from_str(&cookie.to_string()) {
        Ok(value) => {
            response.headers_mut().append(header::SET_COOKIE, value);
        }
        Err(e) => warn!(error = %e, "Session cookie is not a valid header value"),
    }
}
