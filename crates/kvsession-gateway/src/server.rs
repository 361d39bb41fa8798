use crate::middleware::{session_middleware, Session};
use axum::{
    extract::Path,
    http::StatusCode,
    middleware as axum_mw,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use kvsession_session::SessionManager;
use serde_json::json;
use std::sync::Arc;

/// The HTTP surface: a small session API behind the session middleware.
pub struct GatewayServer;

impl GatewayServer {
    /// Build the router. `/health` bypasses the session layer.
    pub fn build(manager: Arc<SessionManager>) -> Router {
        Self::session_routes()
            .layer(axum_mw::from_fn_with_state(manager, session_middleware))
            .route("/health", get(health_handler))
    }

    fn session_routes() -> Router {
        Router::new()
            .route("/session", get(show_session).delete(destroy_session))
            .route("/session/rotate", post(rotate_session))
            .route(
                "/session/{key}",
                get(get_value).put(set_value).delete(remove_value),
            )
            .route("/visits", post(count_visit))
    }
}

async fn health_handler() -> impl IntoResponse {
    json!({"status": "ok", "service": "kvsession"}).to_string()
}

async fn show_session(session: Session) -> impl IntoResponse {
    Json(json!({
        "id": session.id().to_string(),
        "new": session.is_new(),
        "data": session.data(),
    }))
}

async fn destroy_session(session: Session) -> StatusCode {
    session.destroy();
    StatusCode::NO_CONTENT
}

async fn rotate_session(session: Session) -> StatusCode {
    session.rotate();
    StatusCode::NO_CONTENT
}

async fn get_value(session: Session, Path(key): Path<String>) -> impl IntoResponse {
    match session.get(&key) {
        Some(value) => Json(value).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn set_value(
    session: Session,
    Path(key): Path<String>,
    Json(value): Json<serde_json::Value>,
) -> StatusCode {
    session.set(key, value);
    StatusCode::NO_CONTENT
}

async fn remove_value(session: Session, Path(key): Path<String>) -> StatusCode {
    match session.remove(&key) {
        Some(_) => StatusCode::NO_CONTENT,
        None => StatusCode::NOT_FOUND,
    }
}

async fn count_visit(session: Session) -> impl IntoResponse {
    let visits = session.get_as::<u64>("visits").unwrap_or(0) + 1;
    session.set("visits", json!(visits));
    Json(json!({"visits": visits}))
}
